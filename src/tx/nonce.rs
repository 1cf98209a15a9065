//! Nonce management for reliable transaction submission
//!
//! Handles:
//! - Local nonce tracking so concurrent sends never share a nonce
//! - Resyncing with the chain when someone else moved the account's nonce
//! - Replacement of stuck transactions at an explicit nonce

use super::queue::SequentialQueue;
use crate::chain::{FeeQuote, LedgerClient, TxRequest};
use crate::error::{RelayerError, RelayerResult};

use ethers::types::{Address, Bytes, H256, U256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// How many times `send` resyncs with the chain before giving up
const MAX_NONCE_RESYNCS: u32 = 2;

/// Result of a successful new submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub hash: H256,
    pub nonce: u64,
}

/// Nonce cache of one account. Only touched from inside the account's queue.
struct AccountNonce {
    address: Address,
    ledger: Arc<dyn LedgerClient>,
    /// Next nonce to use, `None` until synced with the chain
    next: Mutex<Option<u64>>,
}

impl AccountNonce {
    async fn fetch(&self) -> RelayerResult<u64> {
        let nonce = self.ledger.account_next_nonce(self.address).await?;
        debug!("Synced nonce for {:?}: {}", self.address, nonce);
        Ok(nonce)
    }

    async fn send(
        &self,
        to: Address,
        value: U256,
        fees: FeeQuote,
        data: Option<Bytes>,
    ) -> RelayerResult<Submission> {
        let mut next = self.next.lock().await;
        let mut nonce = match *next {
            Some(nonce) => nonce,
            None => {
                let nonce = self.fetch().await?;
                *next = Some(nonce);
                nonce
            }
        };
        let starting_nonce = nonce;

        let mut resyncs = 0;
        while resyncs < MAX_NONCE_RESYNCS {
            let request = TxRequest {
                from: self.address,
                to,
                value,
                nonce,
                fees,
                data: data.clone(),
            };

            match self.ledger.submit(request).await {
                Ok(hash) => {
                    *next = Some(nonce + 1);
                    info!("Sent {:?} from {:?} with nonce {}", hash, self.address, nonce);
                    return Ok(Submission { hash, nonce });
                }
                Err(e) if e.is_nonce_conflict() => {
                    warn!(
                        "Nonce {} rejected for {:?} ({}), resyncing",
                        nonce, self.address, e
                    );
                    nonce = self.fetch().await?;
                    *next = Some(nonce);
                    resyncs += 1;
                }
                Err(e) => return Err(e),
            }
        }

        Err(RelayerError::NonceRetryLimitExceeded {
            address: self.address,
            nonce: starting_nonce,
        })
    }

    async fn replace(&self, request: TxRequest) -> RelayerResult<H256> {
        let nonce = request.nonce;
        match self.ledger.submit(request).await {
            Ok(hash) => {
                info!("Replaced nonce {} of {:?} with {:?}", nonce, self.address, hash);
                Ok(hash)
            }
            Err(RelayerError::NonceTooLow { .. }) => Err(RelayerError::NonceAlreadyIncluded {
                address: self.address,
                nonce,
            }),
            Err(e) => Err(e),
        }
    }
}

/// A signing account whose submissions are serialized through its own queue
pub struct NonceManagedAccount {
    address: Address,
    nonce: Arc<AccountNonce>,
    queue: SequentialQueue,
}

impl NonceManagedAccount {
    /// `delay` throttles consecutive submissions from this account
    pub fn new(address: Address, ledger: Arc<dyn LedgerClient>, delay: Option<Duration>) -> Self {
        Self {
            address,
            nonce: Arc::new(AccountNonce {
                address,
                ledger,
                next: Mutex::new(None),
            }),
            queue: SequentialQueue::new(format!("{:?}", address), delay),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Send a new transaction with the next free nonce
    pub async fn send(
        &self,
        to: Address,
        value: U256,
        fees: FeeQuote,
        data: Option<Bytes>,
    ) -> RelayerResult<Submission> {
        let nonce = self.nonce.clone();
        self.queue
            .push(move || async move { nonce.send(to, value, fees, data).await })
            .await
    }

    /// Broadcast a replacement for the transaction previously sent at `nonce`.
    ///
    /// Fails with `NonceAlreadyIncluded` when the chain has already moved past
    /// that nonce.
    pub async fn replace(
        &self,
        to: Address,
        value: U256,
        nonce: u64,
        fees: FeeQuote,
        data: Option<Bytes>,
    ) -> RelayerResult<H256> {
        let request = TxRequest {
            from: self.address,
            to,
            value,
            nonce,
            fees,
            data,
        };
        let account = self.nonce.clone();
        self.queue
            .push(move || async move { account.replace(request).await })
            .await
    }

    /// Locally cached next nonce, `None` before the first sync
    #[cfg(test)]
    pub async fn cached_nonce(&self) -> Option<u64> {
        let nonce = self.nonce.clone();
        // Read through the queue so the value is never observed mid-send
        self.queue
            .push(move || async move { Ok(*nonce.next.lock().await) })
            .await
            .unwrap_or(None)
    }
}
