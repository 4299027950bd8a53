//! txpipe - transaction submission and event streams for EVM nodes
//!
//! Two halves share one node client:
//! - submission: per-account nonce sequencing, gas pricing, signing, sending
//! - streams: node-side filters polled into typed streams, and pending
//!   transaction hashes fanned out into full transactions

pub mod chain;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod pipeline;
pub mod task;
pub mod tx;

pub use chain::{EthNodeClient, NodeClient, Subscription};
pub use config::Settings;
pub use error::{PipeError, PipeResult};
pub use events::{FilterKind, LogQuery};
pub use pipeline::Pipeline;
pub use task::TaskHandle;
pub use tx::{GasPriceSource, NonceManager, NonceSequencer, TransactionRequest, TransactionSubmitter};
