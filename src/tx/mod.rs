//! Transaction submission module with nonce sequencing and gas pricing

mod gas;
mod nonce;
mod sender;

pub use gas::{GasPriceSource, RefreshedGasPrice};
pub use nonce::{NonceLease, NonceManager, NoncePolicy, NonceSequencer};
pub use sender::{TransactionRequest, TransactionSubmitter};
