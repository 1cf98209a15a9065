//! Transaction manager: submission, block reconciliation, retry and cancellation

use super::pending::{Escalation, PendingSet, PendingTransaction};
use crate::chain::{BlockSummary, FeeQuote, LedgerClient, ReceiptStatus};
use crate::error::{RelayerError, RelayerResult};
use crate::events::{EventHub, LifecycleEvent, TransactionWatch};
use crate::tx::{AccountRegistry, FeeOracle, SequentialQueue, Submission};

use ethers::types::{Address, Bytes, H256, U256};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// Escalation policy for transactions that are not getting mined
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Resubmit with higher fees every this many blocks
    pub blocks_before_retry: u64,
    /// Give up and vacate the nonce after this many blocks
    pub blocks_before_cancel: u64,
    /// Recipient of cancellation transactions, the sender itself if unset
    pub cancel_recipient: Option<Address>,
}

/// Keeps transactions of all managed accounts on one chain moving until they
/// are included or cancelled
pub struct TransactionManager {
    chain_id: u64,
    ledger: Arc<dyn LedgerClient>,
    oracle: FeeOracle,
    accounts: AccountRegistry,
    pending: RwLock<PendingSet>,
    events: Arc<EventHub>,
    /// Block passes run through here so they never overlap
    block_queue: SequentialQueue,
    last_block: Mutex<Option<u64>>,
    settings: ManagerSettings,
}

impl TransactionManager {
    pub fn new(
        chain_id: u64,
        ledger: Arc<dyn LedgerClient>,
        accounts: AccountRegistry,
        settings: ManagerSettings,
    ) -> Self {
        if settings.blocks_before_cancel < settings.blocks_before_retry {
            warn!(
                "Chain {}: cancel threshold {} is below retry threshold {}, transactions will never be retried",
                chain_id, settings.blocks_before_cancel, settings.blocks_before_retry
            );
        }

        info!("Chain {}: managing {} accounts", chain_id, accounts.len());
        let events = EventHub::new(EVENT_CHANNEL_CAPACITY);

        Self {
            chain_id,
            oracle: FeeOracle::new(ledger.clone()),
            ledger,
            accounts,
            pending: RwLock::new(PendingSet::new()),
            events,
            block_queue: SequentialQueue::new(format!("blocks-{}", chain_id), None),
            last_block: Mutex::new(None),
            settings,
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// All events emitted by this manager. Receivers that fall more than
    /// the channel capacity behind lose events; use `watch` to follow a
    /// transaction reliably.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Events of one transaction. Create the watch before calling `send` to
    /// observe `Submitted`.
    pub fn watch(&self, id: Uuid) -> TransactionWatch {
        self.events.watch(id)
    }

    /// Submit a new transaction from `from` and track it under `id`
    pub async fn send(
        &self,
        id: Uuid,
        to: Address,
        from: Address,
        value: U256,
        data: Option<Bytes>,
    ) -> RelayerResult<Submission> {
        if !self.pending.write().await.reserve(id) {
            return Err(RelayerError::DuplicateId { id });
        }

        let result = self.submit_new(to, from, value, data.clone()).await;

        let mut pending = self.pending.write().await;
        let (submission, fees) = match result {
            Ok(submitted) => submitted,
            Err(e) => {
                pending.release(&id);
                if e.should_alert() {
                    error!("Chain {}: failed to send {}: {}", self.chain_id, id, e);
                } else {
                    warn!("Chain {}: failed to send {}: {}", self.chain_id, id, e);
                }
                return Err(e);
            }
        };

        pending.insert(PendingTransaction {
            id,
            from,
            to,
            value,
            data,
            nonce: submission.nonce,
            fees,
            hash: submission.hash,
            blocks_waiting: 0,
        });
        crate::metrics::record_pending(self.chain_id, pending.len());

        info!(
            "Chain {}: submitted {} as {:?} (nonce {})",
            self.chain_id, id, submission.hash, submission.nonce
        );
        // Emitted under the lock so no block pass can report it first
        self.emit(LifecycleEvent::Submitted {
            id,
            nonce: submission.nonce,
            hash: submission.hash,
            fees,
            from,
        });

        Ok(submission)
    }

    async fn submit_new(
        &self,
        to: Address,
        from: Address,
        value: U256,
        data: Option<Bytes>,
    ) -> RelayerResult<(Submission, FeeQuote)> {
        let account = self.accounts.get(&from)?;
        let fees = self.oracle.current().await?;
        let submission = account.send(to, value, fees, data).await?;
        Ok((submission, fees))
    }

    /// Queue a pass for block `number`. Passes run one at a time in the
    /// order they were queued; numbers at or below the last processed
    /// block are skipped.
    pub async fn on_new_block(self: &Arc<Self>, number: u64) {
        let manager = self.clone();
        let queued = self
            .block_queue
            .push(move || async move {
                manager.handle_block_number(number).await;
                Ok(())
            })
            .await;

        if let Err(e) = queued {
            self.block_failed(number, &e);
        }
    }

    async fn handle_block_number(&self, number: u64) {
        let mut last_block = self.last_block.lock().await;
        if matches!(*last_block, Some(last) if number <= last) {
            debug!("Chain {}: block {} already processed", self.chain_id, number);
            return;
        }

        let block = match self.ledger.block(number).await {
            Ok(Some(block)) => block,
            Ok(None) => {
                let e = RelayerError::BlockNotFound {
                    chain_id: self.chain_id,
                    block_number: number,
                };
                self.block_failed(number, &e);
                return;
            }
            Err(e) => {
                self.block_failed(number, &e);
                return;
            }
        };

        self.process_block(&block).await;
        *last_block = Some(number);
        crate::metrics::record_blocks_processed(self.chain_id, number);
    }

    fn block_failed(&self, number: u64, e: &RelayerError) {
        error!("Chain {}: failed to process block {}: {}", self.chain_id, number, e);
        self.emit(LifecycleEvent::ProcessingBlockFailed {
            block_number: number,
            error: e.to_string(),
        });
    }

    /// Reconcile one block: settle included transactions, then age the rest
    /// and escalate the ones that waited long enough
    pub async fn process_block(&self, block: &BlockSummary) {
        let escalations = {
            let mut pending = self.pending.write().await;

            for hash in &block.transactions {
                if let Some(record) = pending.remove_by_hash(hash) {
                    info!(
                        "Chain {}: {} included in block {} as {:?}",
                        self.chain_id, record.id, block.number, record.hash
                    );
                    self.emit_included(record);
                }
            }

            let escalations = pending.age(
                self.settings.blocks_before_retry,
                self.settings.blocks_before_cancel,
            );
            crate::metrics::record_pending(self.chain_id, pending.len());
            escalations
        };

        if escalations.is_empty() {
            return;
        }

        debug!(
            "Chain {}: escalating {} transactions at block {}",
            self.chain_id,
            escalations.len(),
            block.number
        );

        // One estimate shared by every escalation of this pass
        let estimate = self.oracle.current().await.map_err(|e| e.to_string());

        let work = escalations.into_iter().map(|escalation| {
            let estimate = &estimate;
            async move {
                match escalation {
                    Escalation::Retry(record) => self.retry(record, estimate).await,
                    Escalation::Cancel(record) => self.cancel(record, estimate).await,
                }
            }
        });
        futures::future::join_all(work).await;
    }

    /// Same transaction at the same nonce with bumped fees
    async fn retry(&self, record: PendingTransaction, estimate: &Result<FeeQuote, String>) {
        let id = record.id;
        let resubmitted = self
            .resubmit(&record, record.to, record.value, record.data.clone(), estimate)
            .await;

        match resubmitted {
            Ok((hash, fees)) => {
                let mut pending = self.pending.write().await;
                let updated = PendingTransaction {
                    hash,
                    fees,
                    blocks_waiting: 0,
                    ..record
                };
                if pending.replace(updated).is_none() {
                    warn!("Chain {}: {} stopped being tracked during its retry", self.chain_id, id);
                    return;
                }

                info!("Chain {}: retried {} as {:?}", self.chain_id, id, hash);
                self.emit(LifecycleEvent::Retry {
                    id,
                    hash,
                    fees,
                    from: record.from,
                });
            }
            Err(RelayerError::NonceAlreadyIncluded { nonce, .. }) => {
                info!(
                    "Chain {}: nonce {} of {} already used on chain, treating as included",
                    self.chain_id, nonce, id
                );
                self.settle_included(&id).await;
            }
            Err(e) => {
                warn!("Chain {}: retry of {} failed: {}", self.chain_id, id, e);
                self.emit(LifecycleEvent::RetryFailed {
                    id,
                    error: e.to_string(),
                });
            }
        }
    }

    /// Zero value transfer at the same nonce, vacating it
    async fn cancel(&self, record: PendingTransaction, estimate: &Result<FeeQuote, String>) {
        let id = record.id;
        let recipient = self.settings.cancel_recipient.unwrap_or(record.from);
        let resubmitted = self
            .resubmit(&record, recipient, U256::zero(), None, estimate)
            .await;

        let (hash, fees) = match resubmitted {
            Ok(sent) => sent,
            Err(RelayerError::NonceAlreadyIncluded { nonce, .. }) => {
                info!(
                    "Chain {}: nonce {} of {} already used on chain, nothing to cancel",
                    self.chain_id, nonce, id
                );
                self.settle_included(&id).await;
                return;
            }
            Err(e) => {
                warn!("Chain {}: cancellation of {} failed: {}", self.chain_id, id, e);
                self.emit(LifecycleEvent::CancelFailed {
                    id,
                    error: e.to_string(),
                    still_pending: true,
                });
                return;
            }
        };

        {
            let mut pending = self.pending.write().await;
            pending.remove(&id);
            crate::metrics::record_pending(self.chain_id, pending.len());
        }
        warn!(
            "Chain {}: cancelling {} (nonce {}) with {:?}",
            self.chain_id, id, record.nonce, hash
        );

        // Waiting here would hold up every following block pass
        let ledger = self.ledger.clone();
        let events = self.events.clone();
        let chain_id = self.chain_id;
        tokio::spawn(async move {
            let error = match ledger.wait_for_receipt(hash).await {
                Ok(ReceiptStatus::Success) => {
                    info!("Chain {}: cancellation of {} confirmed", chain_id, id);
                    publish(&events, chain_id, LifecycleEvent::Cancel { id, hash, fees });
                    return;
                }
                Ok(ReceiptStatus::Failure) => format!("cancellation {:?} reverted", hash),
                Err(e) => e.to_string(),
            };

            let event = match original_outcome(ledger.as_ref(), record).await {
                Ok(record) => {
                    info!(
                        "Chain {}: {} was mined as {:?} before its cancellation",
                        chain_id, id, record.hash
                    );
                    included_event(record)
                }
                Err(outcome) => {
                    error!(
                        "Chain {}: cancellation of {} not confirmed: {} ({})",
                        chain_id, id, error, outcome
                    );
                    LifecycleEvent::CancelFailed {
                        id,
                        error,
                        still_pending: false,
                    }
                }
            };
            publish(&events, chain_id, event);
        });
    }

    /// Broadcast a replacement for `record` with fees bumped from its
    /// current ones
    async fn resubmit(
        &self,
        record: &PendingTransaction,
        to: Address,
        value: U256,
        data: Option<Bytes>,
        estimate: &Result<FeeQuote, String>,
    ) -> RelayerResult<(H256, FeeQuote)> {
        let current = estimate
            .as_ref()
            .map_err(|e| RelayerError::GasEstimation(e.clone()))?;
        let fees = self.oracle.retry_quote(&record.fees, current)?;
        let account = self.accounts.get(&record.from)?;
        let hash = account.replace(to, value, record.nonce, fees, data).await?;
        Ok((hash, fees))
    }

    async fn settle_included(&self, id: &Uuid) {
        let mut pending = self.pending.write().await;
        if let Some(record) = pending.remove(id) {
            crate::metrics::record_pending(self.chain_id, pending.len());
            self.emit_included(record);
        }
    }

    fn emit_included(&self, record: PendingTransaction) {
        self.emit(included_event(record));
    }

    fn emit(&self, event: LifecycleEvent) {
        publish(&self.events, self.chain_id, event);
    }

    /// Snapshot of a tracked transaction
    pub async fn pending_transaction(&self, id: &Uuid) -> Option<PendingTransaction> {
        self.pending.read().await.get(id).cloned()
    }

    /// Id currently broadcast under `hash`
    pub async fn id_for_hash(&self, hash: &H256) -> Option<Uuid> {
        self.pending.read().await.id_for_hash(hash)
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }
}

fn publish(events: &EventHub, chain_id: u64, event: LifecycleEvent) {
    crate::metrics::record_event(chain_id, &event);
    events.publish(event);
}

fn included_event(record: PendingTransaction) -> LifecycleEvent {
    LifecycleEvent::Included {
        id: record.id,
        hash: record.hash,
        fees: record.fees,
        nonce: record.nonce,
        from: record.from,
    }
}

/// Whether the transaction a failed cancellation was meant to replace got
/// mined after all. `Err` describes why that is not known.
async fn original_outcome(
    ledger: &dyn LedgerClient,
    record: PendingTransaction,
) -> Result<PendingTransaction, String> {
    match ledger.receipt(record.hash).await {
        Ok(Some(_)) => Ok(record),
        Ok(None) => Err(format!("{:?} not mined either", record.hash)),
        Err(e) => Err(format!("receipt of {:?} unavailable: {}", record.hash, e)),
    }
}
