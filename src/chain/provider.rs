//! Chain provider with multi-RPC support and automatic failover

use super::ledger::{BlockSummary, FeeQuote, FeeSignal, LedgerClient, ReceiptStatus, TxRequest};
use crate::config::ChainConfig;
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider, ProviderError};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Consecutive polls in which a transaction is neither mined nor known to
/// the node before its receipt is given up on
const RECEIPT_MISSES_BEFORE_GIVING_UP: u32 = 10;
/// Consecutive failed receipt polls tolerated before giving up
const RECEIPT_ERRORS_BEFORE_GIVING_UP: u32 = 5;

/// Multi-provider wrapper with automatic failover that signs for the
/// managed accounts
pub struct ChainProvider {
    /// Chain configuration
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    /// Signers bound to this chain's id
    wallets: HashMap<Address, LocalWallet>,
    receipt_poll_interval: Duration,
}

impl ChainProvider {
    /// Create a new chain provider and check that the RPCs serve the
    /// configured chain
    pub async fn new(
        config: ChainConfig,
        wallets: &[LocalWallet],
        receipt_poll_interval: Duration,
    ) -> RelayerResult<Self> {
        let mut http_providers = Vec::new();

        // Initialize HTTP providers
        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(RelayerError::ChainConnection {
                chain_id: config.chain_id,
                message: "No valid RPC providers".to_string(),
            });
        }

        let wallets = wallets
            .iter()
            .map(|wallet| {
                let wallet = wallet.clone().with_chain_id(config.chain_id);
                (wallet.address(), wallet)
            })
            .collect();

        let provider = Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
            wallets,
            receipt_poll_interval,
        };

        let reported = provider
            .read("get chain id", |p| async move { p.get_chainid().await })
            .await?;
        if reported != U256::from(provider.config.chain_id) {
            return Err(RelayerError::ChainConnection {
                chain_id: provider.config.chain_id,
                message: format!("RPC reports chain id {}", reported),
            });
        }

        info!(
            "Chain {} provider ready with {} RPCs and {} wallets",
            provider.config.chain_id,
            provider.http_providers.len(),
            provider.wallets.len()
        );
        Ok(provider)
    }

    /// Get the active HTTP provider
    fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.chain_id, next);
    }

    /// Run a read-only call, moving to the next provider on failure
    async fn read<T, F, Fut>(&self, what: &str, op: F) -> RelayerResult<T>
    where
        F: Fn(Provider<Http>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        for _ in 0..self.http_providers.len() {
            match op(self.http().clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!("Failed to {} on chain {}: {}", what, self.config.chain_id, e);
                    self.failover();
                }
            }
        }

        Err(RelayerError::ChainConnection {
            chain_id: self.config.chain_id,
            message: format!("All providers failed to {}", what),
        })
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        match self.block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.config.chain_id, e);
                false
            }
        }
    }
}

#[async_trait]
impl LedgerClient for ChainProvider {
    async fn submit(&self, request: TxRequest) -> RelayerResult<H256> {
        let wallet = self
            .wallets
            .get(&request.from)
            .ok_or(RelayerError::WalletNotManaged { address: request.from })?;

        let mut tx = build_transaction(&request, self.config.chain_id);

        let gas = self
            .http()
            .estimate_gas(&tx, None)
            .await
            .map_err(|e| match classify_submit_error(&request, &e.to_string()) {
                RelayerError::Transaction(message) => RelayerError::GasEstimation(message),
                nonce_error => nonce_error,
            })?;
        tx.set_gas(gas);

        let signature = wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| RelayerError::Wallet(format!("Failed to sign transaction: {}", e)))?;
        let raw = tx.rlp_signed(&signature);

        let pending = self
            .http()
            .send_raw_transaction(raw)
            .await
            .map_err(|e| classify_submit_error(&request, &e.to_string()))?;
        let hash = pending.tx_hash();

        debug!(
            "Chain {}: broadcast {:?} from {:?} nonce {} gas {}",
            self.config.chain_id, hash, request.from, request.nonce, gas
        );
        Ok(hash)
    }

    async fn account_next_nonce(&self, address: Address) -> RelayerResult<u64> {
        let count = self
            .read("get transaction count", |p| async move {
                p.get_transaction_count(address, Some(BlockNumber::Pending.into()))
                    .await
            })
            .await?;
        Ok(count.as_u64())
    }

    async fn fee_signal(&self) -> RelayerResult<FeeSignal> {
        let gas_price = self
            .read("get gas price", |p| async move { p.get_gas_price().await })
            .await
            .map_err(|e| RelayerError::GasEstimation(e.to_string()))?;
        let latest = self
            .read("get latest block", |p| async move {
                p.get_block(BlockNumber::Latest).await
            })
            .await
            .map_err(|e| RelayerError::GasEstimation(e.to_string()))?;

        Ok(FeeSignal {
            gas_price,
            base_fee_per_gas: latest.and_then(|block| block.base_fee_per_gas),
        })
    }

    async fn block_number(&self) -> RelayerResult<u64> {
        let number = self
            .read("get block number", |p| async move { p.get_block_number().await })
            .await?;
        Ok(number.as_u64())
    }

    async fn block(&self, number: u64) -> RelayerResult<Option<BlockSummary>> {
        let block = self
            .read("get block", |p| async move { p.get_block(number).await })
            .await?;

        Ok(block.map(|block| BlockSummary {
            number,
            transactions: block.transactions,
        }))
    }

    async fn receipt(&self, hash: H256) -> RelayerResult<Option<ReceiptStatus>> {
        let receipt = self
            .read("get transaction receipt", |p| async move {
                p.get_transaction_receipt(hash).await
            })
            .await?;

        // Receipts without a status predate byzantium and only exist for mined txs
        Ok(receipt.map(|receipt| {
            if receipt.status.map_or(true, |status| status == U64::from(1)) {
                ReceiptStatus::Success
            } else {
                ReceiptStatus::Failure
            }
        }))
    }

    async fn wait_for_receipt(&self, hash: H256) -> RelayerResult<ReceiptStatus> {
        let mut misses = 0;
        let mut errors = 0;

        loop {
            match self.poll_receipt(hash).await {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {
                    errors = 0;
                    misses = 0;
                }
                Err(RelayerError::ReceiptUnavailable { .. }) => {
                    errors = 0;
                    misses += 1;
                    if misses >= RECEIPT_MISSES_BEFORE_GIVING_UP {
                        return Err(RelayerError::ReceiptUnavailable {
                            hash: format!("{:?}", hash),
                        });
                    }
                }
                Err(e) => {
                    errors += 1;
                    warn!(
                        "Chain {}: receipt poll for {:?} failed ({}/{}): {}",
                        self.config.chain_id, hash, errors, RECEIPT_ERRORS_BEFORE_GIVING_UP, e
                    );
                    if errors >= RECEIPT_ERRORS_BEFORE_GIVING_UP {
                        return Err(e);
                    }
                }
            }

            tokio::time::sleep(self.receipt_poll_interval).await;
        }
    }
}

impl ChainProvider {
    /// One receipt poll: the status once mined, `None` while the node still
    /// knows the transaction, `ReceiptUnavailable` when it does not
    async fn poll_receipt(&self, hash: H256) -> RelayerResult<Option<ReceiptStatus>> {
        if let Some(status) = self.receipt(hash).await? {
            return Ok(Some(status));
        }

        let known = self
            .read("get transaction", |p| async move { p.get_transaction(hash).await })
            .await?
            .is_some();
        if known {
            Ok(None)
        } else {
            Err(RelayerError::ReceiptUnavailable {
                hash: format!("{:?}", hash),
            })
        }
    }
}

/// Unsigned transaction for `request` in the format its fees call for
pub fn build_transaction(request: &TxRequest, chain_id: u64) -> TypedTransaction {
    match request.fees {
        FeeQuote::Legacy { gas_price } => {
            let mut tx = TransactionRequest::new()
                .from(request.from)
                .to(request.to)
                .value(request.value)
                .nonce(request.nonce)
                .gas_price(gas_price)
                .chain_id(chain_id);
            if let Some(data) = &request.data {
                tx = tx.data(data.clone());
            }
            TypedTransaction::Legacy(tx)
        }
        FeeQuote::Eip1559 {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        } => {
            let mut tx = Eip1559TransactionRequest::new()
                .from(request.from)
                .to(request.to)
                .value(request.value)
                .nonce(request.nonce)
                .max_fee_per_gas(max_fee_per_gas)
                .max_priority_fee_per_gas(max_priority_fee_per_gas)
                .chain_id(chain_id);
            if let Some(data) = &request.data {
                tx = tx.data(data.clone());
            }
            TypedTransaction::Eip1559(tx)
        }
    }
}

/// Map a node's rejection message onto the nonce errors the accounts act on
pub fn classify_submit_error(request: &TxRequest, message: &str) -> RelayerError {
    let lower = message.to_lowercase();
    if lower.contains("nonce too low") {
        RelayerError::NonceTooLow {
            address: request.from,
            nonce: request.nonce,
        }
    } else if lower.contains("nonce too high") {
        RelayerError::NonceTooHigh {
            address: request.from,
            nonce: request.nonce,
        }
    } else {
        RelayerError::Transaction(message.to_string())
    }
}

/// Parse comma separated hex private keys
pub fn parse_private_keys(raw: &str) -> RelayerResult<Vec<LocalWallet>> {
    raw.split(',')
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(|key| {
            key.parse::<LocalWallet>()
                .map_err(|e| RelayerError::Wallet(format!("Invalid private key: {}", e)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::legacy;

    fn request(fees: FeeQuote) -> TxRequest {
        TxRequest {
            from: Address::repeat_byte(1),
            to: Address::repeat_byte(2),
            value: U256::from(7),
            nonce: 4,
            fees,
            data: Some(Bytes::from(vec![0xde, 0xad])),
        }
    }

    #[test]
    fn test_classifies_nonce_errors() {
        let req = request(legacy(1));

        assert!(matches!(
            classify_submit_error(&req, "(code: -32000, message: Nonce too low, data: None)"),
            RelayerError::NonceTooLow { nonce: 4, .. }
        ));
        assert!(matches!(
            classify_submit_error(&req, "nonce too high"),
            RelayerError::NonceTooHigh { .. }
        ));
        assert!(matches!(
            classify_submit_error(&req, "replacement transaction underpriced"),
            RelayerError::Transaction(_)
        ));
    }

    #[test]
    fn test_legacy_fees_build_legacy_transaction() {
        let tx = build_transaction(&request(legacy(99)), 5);

        match tx {
            TypedTransaction::Legacy(ref inner) => {
                assert_eq!(inner.gas_price, Some(U256::from(99)));
                assert_eq!(inner.chain_id, Some(U64::from(5)));
            }
            other => panic!("unexpected transaction type: {:?}", other),
        }
        assert_eq!(tx.nonce(), Some(&U256::from(4)));
        assert_eq!(tx.value(), Some(&U256::from(7)));
        assert_eq!(tx.data(), Some(&Bytes::from(vec![0xde, 0xad])));
    }

    #[test]
    fn test_eip1559_fees_build_typed_transaction() {
        let fees = FeeQuote::Eip1559 {
            max_fee_per_gas: U256::from(30),
            max_priority_fee_per_gas: U256::from(2),
        };
        let mut req = request(fees);
        req.data = None;

        match build_transaction(&req, 1) {
            TypedTransaction::Eip1559(inner) => {
                assert_eq!(inner.max_fee_per_gas, Some(U256::from(30)));
                assert_eq!(inner.max_priority_fee_per_gas, Some(U256::from(2)));
                assert_eq!(inner.data, None);
            }
            other => panic!("unexpected transaction type: {:?}", other),
        }
    }

    #[test]
    fn test_parses_key_list() {
        let wallets = parse_private_keys(
            " 0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80 ,,",
        )
        .unwrap();

        assert_eq!(wallets.len(), 1);
        assert_eq!(
            wallets[0].address(),
            "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266".parse::<Address>().unwrap()
        );
        assert!(matches!(
            parse_private_keys("not-a-key"),
            Err(RelayerError::Wallet(_))
        ));
    }
}
