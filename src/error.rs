//! Error types for the Treasury Relayer

use ethers::types::Address;
use thiserror::Error;
use uuid::Uuid;

/// Main error type for the relayer
#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Chain connection error for chain {chain_id}: {message}")]
    ChainConnection { chain_id: u64, message: String },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Nonce too low for {address:?} (nonce {nonce})")]
    NonceTooLow { address: Address, nonce: u64 },

    #[error("Nonce too high for {address:?} (nonce {nonce})")]
    NonceTooHigh { address: Address, nonce: u64 },

    #[error("Nonce for {address:?} kept drifting after resyncing (started at {nonce}); account is being used elsewhere")]
    NonceRetryLimitExceeded { address: Address, nonce: u64 },

    #[error("Nonce {nonce} of {address:?} has already been included")]
    NonceAlreadyIncluded { address: Address, nonce: u64 },

    #[error("Mismatched gas fee formats in previous and current estimate")]
    FeeFormatMismatch,

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Transaction {id} is already being tracked")]
    DuplicateId { id: Uuid },

    #[error("Wallet {address:?} is not managed on this chain")]
    WalletNotManaged { address: Address },

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Chain {chain_id} not found")]
    ChainNotFound { chain_id: u64 },

    #[error("Block {block_number} not found on chain {chain_id}")]
    BlockNotFound { chain_id: u64, block_number: u64 },

    #[error("Transaction {hash} was dropped before it was mined")]
    ReceiptUnavailable { hash: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayerError {
    /// Local and external nonce state disagree; resyncing may fix it
    pub fn is_nonce_conflict(&self) -> bool {
        matches!(
            self,
            RelayerError::NonceTooLow { .. } | RelayerError::NonceTooHigh { .. }
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            RelayerError::NonceRetryLimitExceeded { .. }
                | RelayerError::FeeFormatMismatch
                | RelayerError::Wallet(_)
        )
    }
}

/// Result type for relayer operations
pub type RelayerResult<T> = Result<T, RelayerError>;
