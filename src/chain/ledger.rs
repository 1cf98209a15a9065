//! The narrow view of a chain that the transaction lifecycle needs

use crate::error::RelayerResult;

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};

/// Fee parameters attached to a transaction.
///
/// A chain uses one fee model at a time, so quotes for the same chain are
/// always the same variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeeQuote {
    Eip1559 {
        #[serde(rename = "maxFeePerGas")]
        max_fee_per_gas: U256,
        #[serde(rename = "maxPriorityFeePerGas")]
        max_priority_fee_per_gas: U256,
    },
    Legacy {
        #[serde(rename = "gasPrice")]
        gas_price: U256,
    },
}

impl FeeQuote {
    /// Highest price per gas this quote may pay
    pub fn max_price(&self) -> U256 {
        match self {
            FeeQuote::Legacy { gas_price } => *gas_price,
            FeeQuote::Eip1559 { max_fee_per_gas, .. } => *max_fee_per_gas,
        }
    }
}

/// Raw fee market data reported by the node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSignal {
    pub gas_price: U256,
    /// Present only on chains with a base fee market
    pub base_fee_per_gas: Option<U256>,
}

/// A transaction ready to be signed and broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRequest {
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub nonce: u64,
    pub fees: FeeQuote,
    pub data: Option<Bytes>,
}

/// The parts of a block the lifecycle engine looks at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSummary {
    pub number: u64,
    pub transactions: Vec<H256>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptStatus {
    Success,
    Failure,
}

/// Signer and node access for one chain.
///
/// `submit` must report nonce conflicts as `RelayerError::NonceTooLow` or
/// `RelayerError::NonceTooHigh` so callers can resync.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Sign and broadcast, returning the transaction hash
    async fn submit(&self, request: TxRequest) -> RelayerResult<H256>;

    /// Next nonce the chain expects from `address`
    async fn account_next_nonce(&self, address: Address) -> RelayerResult<u64>;

    async fn fee_signal(&self) -> RelayerResult<FeeSignal>;

    async fn block_number(&self) -> RelayerResult<u64>;

    async fn block(&self, number: u64) -> RelayerResult<Option<BlockSummary>>;

    /// Outcome of a mined transaction, `None` while it is not mined
    async fn receipt(&self, hash: H256) -> RelayerResult<Option<ReceiptStatus>>;

    /// Resolves once the transaction has been mined
    async fn wait_for_receipt(&self, hash: H256) -> RelayerResult<ReceiptStatus>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fee_quote_serializes_like_stored_requests() {
        let legacy = FeeQuote::Legacy {
            gas_price: U256::from(10),
        };
        let json = serde_json::to_value(legacy).unwrap();
        assert!(json.get("gasPrice").is_some());

        let eip1559 = FeeQuote::Eip1559 {
            max_fee_per_gas: U256::from(20),
            max_priority_fee_per_gas: U256::from(2),
        };
        let json = serde_json::to_string(&eip1559).unwrap();
        let back: FeeQuote = serde_json::from_str(&json).unwrap();
        assert_eq!(back, eip1559);
        assert_eq!(back.max_price(), U256::from(20));
    }
}
