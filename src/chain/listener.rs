//! New block detection by HTTP polling

use super::ledger::LedgerClient;
use crate::lifecycle::TransactionManager;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Feeds every new block number of one chain to its transaction manager
pub struct BlockWatcher {
    ledger: Arc<dyn LedgerClient>,
    manager: Arc<TransactionManager>,
    poll_interval: Duration,
    shutdown: Arc<AtomicBool>,
}

impl BlockWatcher {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        manager: Arc<TransactionManager>,
        poll_interval: Duration,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            ledger,
            manager,
            poll_interval,
            shutdown,
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.manager.chain_id()
    }

    /// Poll until shutdown. Starts from the head at the time of the call;
    /// every later block is handed over exactly once and in order.
    pub async fn run(&self) {
        let mut last_seen = loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }
            match self.ledger.block_number().await {
                Ok(head) => break head,
                Err(e) => {
                    warn!("Chain {}: failed to get block number: {}", self.chain_id(), e);
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        };
        info!("Chain {}: watching blocks from {}", self.chain_id(), last_seen);

        while !self.shutdown.load(Ordering::Relaxed) {
            tokio::time::sleep(self.poll_interval).await;
            last_seen = self.poll_once(last_seen).await;
        }

        info!("Chain {}: block watcher stopped", self.chain_id());
    }

    /// Hand over every block after `last_seen` up to the current head.
    /// Returns the new last seen block.
    pub async fn poll_once(&self, last_seen: u64) -> u64 {
        let head = match self.ledger.block_number().await {
            Ok(head) => head,
            Err(e) => {
                warn!("Chain {}: failed to get block number: {}", self.chain_id(), e);
                return last_seen;
            }
        };

        if head <= last_seen {
            return last_seen;
        }

        debug!(
            "Chain {}: new blocks {} to {}",
            self.chain_id(),
            last_seen + 1,
            head
        );
        for number in last_seen + 1..=head {
            self.manager.on_new_block(number).await;
        }

        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::FakeLedger;
    use crate::lifecycle::ManagerSettings;
    use crate::tx::AccountRegistry;
    use ethers::types::{Address, U256};
    use uuid::Uuid;

    fn watcher(ledger: Arc<FakeLedger>, wallet: Address) -> BlockWatcher {
        let manager = Arc::new(TransactionManager::new(
            1,
            ledger.clone(),
            AccountRegistry::new([wallet], ledger.clone(), None),
            ManagerSettings {
                blocks_before_retry: 3,
                blocks_before_cancel: 10,
                cancel_recipient: None,
            },
        ));
        BlockWatcher::new(
            ledger,
            manager,
            Duration::from_millis(5),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[tokio::test]
    async fn test_poll_hands_over_every_new_block() {
        let ledger = Arc::new(FakeLedger::new());
        let wallet = Address::repeat_byte(1);
        let watcher = watcher(ledger.clone(), wallet);
        let mut events = watcher.manager.subscribe();

        let id = Uuid::new_v4();
        let submission = watcher
            .manager
            .send(id, Address::repeat_byte(2), wallet, U256::one(), None)
            .await
            .unwrap();
        ledger.drop_transaction(submission.hash);

        ledger.mine();
        ledger.mine();
        ledger.mine();
        assert_eq!(watcher.poll_once(0).await, 3);

        // Three blocks seen at once still count as three
        let mut names = Vec::new();
        while let Ok(event) = events.try_recv() {
            names.push(event.name());
        }
        assert_eq!(names, vec!["submitted", "retry"]);
    }

    #[tokio::test]
    async fn test_poll_without_new_blocks_keeps_position() {
        let ledger = Arc::new(FakeLedger::new());
        let watcher = watcher(ledger.clone(), Address::repeat_byte(1));

        ledger.mine();
        assert_eq!(watcher.poll_once(1).await, 1);
        assert_eq!(watcher.poll_once(5).await, 5);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let ledger = Arc::new(FakeLedger::new());
        let watcher = watcher(ledger, Address::repeat_byte(1));
        watcher.shutdown.store(true, Ordering::Relaxed);

        tokio::time::timeout(Duration::from_secs(1), watcher.run())
            .await
            .unwrap();
    }
}
