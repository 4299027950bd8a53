//! Filter kinds and log queries
//!
//! Defines what a node-side filter watches and how a log is matched against a
//! query locally.

use crate::error::{PipeError, PipeResult};

use ethers::types::{Address, BlockNumber, Filter, Log, ValueOrArray, H256};
use serde::{Deserialize, Serialize};

/// Maximum number of indexed topic positions an EVM log can carry
pub const MAX_TOPIC_POSITIONS: usize = 4;

/// Query for a node-side log filter
///
/// Topics are matched positionally: every non-empty position must contain the
/// log's topic at that index, and an empty position matches anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogQuery {
    /// Restrict to a single block (overrides the block range)
    pub block_hash: Option<H256>,
    pub from_block: Option<BlockNumber>,
    pub to_block: Option<BlockNumber>,
    /// Emitting contracts; empty means any address
    pub addresses: Vec<Address>,
    pub topics: Vec<Vec<H256>>,
}

impl LogQuery {
    /// Create an empty query matching every log
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an emitting contract address
    pub fn address(mut self, address: Address) -> Self {
        self.addresses.push(address);
        self
    }

    /// Set the accepted topics for the next position
    pub fn topic(mut self, alternatives: Vec<H256>) -> Self {
        self.topics.push(alternatives);
        self
    }

    pub fn from_block(mut self, block: impl Into<BlockNumber>) -> Self {
        self.from_block = Some(block.into());
        self
    }

    pub fn to_block(mut self, block: impl Into<BlockNumber>) -> Self {
        self.to_block = Some(block.into());
        self
    }

    pub fn at_block_hash(mut self, hash: H256) -> Self {
        self.block_hash = Some(hash);
        self
    }

    /// Reject queries the node cannot represent
    pub fn validate(&self) -> PipeResult<()> {
        if self.topics.len() > MAX_TOPIC_POSITIONS {
            return Err(PipeError::InvalidQuery(format!(
                "{} topic positions given, at most {} allowed",
                self.topics.len(),
                MAX_TOPIC_POSITIONS
            )));
        }
        if self.block_hash.is_some() && (self.from_block.is_some() || self.to_block.is_some()) {
            return Err(PipeError::InvalidQuery(
                "block hash cannot be combined with a block range".to_string(),
            ));
        }
        Ok(())
    }

    /// Check whether a log satisfies this query
    pub fn matches(&self, log: &Log) -> bool {
        if let Some(hash) = self.block_hash {
            if log.block_hash != Some(hash) {
                return false;
            }
        }

        if let Some(number) = log.block_number {
            if let Some(BlockNumber::Number(from)) = self.from_block {
                if number < from {
                    return false;
                }
            }
            if let Some(BlockNumber::Number(to)) = self.to_block {
                if number > to {
                    return false;
                }
            }
        }

        if !self.addresses.is_empty() && !self.addresses.contains(&log.address) {
            return false;
        }

        if self.topics.len() > log.topics.len() {
            return false;
        }

        self.topics
            .iter()
            .zip(log.topics.iter())
            .all(|(alternatives, topic)| alternatives.is_empty() || alternatives.contains(topic))
    }

    /// Convert into the filter object sent to `eth_newFilter`
    pub fn to_filter(&self) -> PipeResult<Filter> {
        self.validate()?;

        let mut filter = Filter::new();
        if let Some(hash) = self.block_hash {
            filter = filter.at_block_hash(hash);
        } else {
            if let Some(from) = self.from_block {
                filter = filter.from_block(from);
            }
            if let Some(to) = self.to_block {
                filter = filter.to_block(to);
            }
        }

        if !self.addresses.is_empty() {
            filter = filter.address(ValueOrArray::Array(self.addresses.clone()));
        }

        for (position, alternatives) in self.topics.iter().enumerate() {
            // an empty position is a wildcard, which the node expresses as null
            filter.topics[position] = if alternatives.is_empty() {
                None
            } else {
                Some(ValueOrArray::Array(
                    alternatives.iter().copied().map(Some).collect(),
                ))
            };
        }

        Ok(filter)
    }
}

/// Kind of node-side filter, fixed when the filter is installed
#[derive(Debug, Clone, PartialEq)]
pub enum FilterKind {
    /// `eth_newPendingTransactionFilter`, changes are transaction hashes
    PendingTransactions,
    /// `eth_newFilter`, changes are log records
    Logs(LogQuery),
}

impl FilterKind {
    /// Label used in logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            FilterKind::PendingTransactions => "pending_tx",
            FilterKind::Logs(_) => "logs",
        }
    }
}
