//! Chain module - handles multi-chain connections and block watching
//!
//! This module provides:
//! - The `LedgerClient` view of a chain used by the transaction lifecycle
//! - Multi-RPC provider management with automatic failover
//! - Per-chain block watchers driving the transaction managers

pub mod ledger;
pub mod listener;
pub mod provider;
#[cfg(test)]
pub mod testing;

#[cfg(test)]
pub use ledger::MockLedgerClient;
pub use ledger::{BlockSummary, FeeQuote, FeeSignal, LedgerClient, ReceiptStatus, TxRequest};
pub use listener::BlockWatcher;
pub use provider::ChainProvider;

use crate::config::Settings;
use crate::error::RelayerResult;
use crate::lifecycle::{ManagerSettings, TransactionManager};
use crate::tx::AccountRegistry;

use dashmap::DashMap;
use ethers::signers::{LocalWallet, Signer};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

/// Manages connections to all configured chains
pub struct ChainManager {
    /// Chain providers indexed by chain ID
    providers: DashMap<u64, Arc<ChainProvider>>,
    /// Transaction managers indexed by chain ID
    managers: DashMap<u64, Arc<TransactionManager>>,
    /// Block watchers indexed by chain ID
    watchers: DashMap<u64, Arc<BlockWatcher>>,
    /// Shutdown signal
    shutdown: Arc<AtomicBool>,
}

impl ChainManager {
    /// Connect to every enabled chain and manage `wallets` on each of them
    pub async fn new(settings: &Settings, wallets: &[LocalWallet]) -> RelayerResult<Self> {
        let providers = DashMap::new();
        let managers = DashMap::new();
        let watchers = DashMap::new();
        let shutdown = Arc::new(AtomicBool::new(false));

        let addresses: Vec<_> = wallets.iter().map(|w| w.address()).collect();
        let relayer = &settings.relayer;

        for (name, chain_config) in settings.enabled_chains() {
            info!("Initializing chain {} (ID: {})", name, chain_config.chain_id);

            let provider = Arc::new(
                ChainProvider::new(chain_config.clone(), wallets, relayer.poll_interval()).await?,
            );
            let ledger: Arc<dyn LedgerClient> = provider.clone();

            let accounts =
                AccountRegistry::new(addresses.iter().copied(), ledger.clone(), relayer.queue_delay());
            let manager = Arc::new(TransactionManager::new(
                chain_config.chain_id,
                ledger.clone(),
                accounts,
                ManagerSettings {
                    blocks_before_retry: relayer.blocks_before_retry,
                    blocks_before_cancel: relayer.blocks_before_cancel,
                    cancel_recipient: relayer.cancel_recipient,
                },
            ));

            let watcher = BlockWatcher::new(
                ledger,
                manager.clone(),
                relayer.poll_interval(),
                shutdown.clone(),
            );

            providers.insert(chain_config.chain_id, provider);
            managers.insert(chain_config.chain_id, manager);
            watchers.insert(chain_config.chain_id, Arc::new(watcher));

            info!("Chain {} initialized successfully", chain_config.name);
        }

        Ok(Self {
            providers,
            managers,
            watchers,
            shutdown,
        })
    }

    /// Run all block watchers until `stop` is called
    pub async fn start_watchers(&self) -> RelayerResult<()> {
        let mut handles = Vec::new();

        for entry in self.watchers.iter() {
            let watcher = entry.value().clone();
            handles.push(tokio::spawn(async move { watcher.run().await }));
        }

        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!("Block watcher task failed: {}", e);
            }
        }
        Ok(())
    }

    /// All transaction managers by chain ID
    pub fn managers(&self) -> HashMap<u64, Arc<TransactionManager>> {
        self.managers
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    /// Health check for all chains
    pub async fn health_check(&self) -> Vec<(u64, bool)> {
        let providers: Vec<_> = self
            .providers
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        let mut results = Vec::new();

        for (chain_id, provider) in providers {
            let healthy = provider.health_check().await;
            results.push((chain_id, healthy));

            crate::metrics::record_chain_health(chain_id, healthy);
        }

        results
    }

    /// Stop all block watchers
    pub async fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        info!("Chain manager stopped");
    }
}
