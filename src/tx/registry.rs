//! Managed accounts of one chain

use super::nonce::NonceManagedAccount;
use crate::chain::LedgerClient;
use crate::error::{RelayerError, RelayerResult};

use ethers::types::Address;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Every account the manager may send from, fixed at startup
pub struct AccountRegistry {
    accounts: HashMap<Address, Arc<NonceManagedAccount>>,
}

impl AccountRegistry {
    /// One nonce-managed account per address, all sharing `ledger`
    pub fn new(
        addresses: impl IntoIterator<Item = Address>,
        ledger: Arc<dyn LedgerClient>,
        queue_delay: Option<Duration>,
    ) -> Self {
        let accounts = addresses
            .into_iter()
            .map(|address| {
                let account = NonceManagedAccount::new(address, ledger.clone(), queue_delay);
                (address, Arc::new(account))
            })
            .collect();

        Self { accounts }
    }

    pub fn get(&self, address: &Address) -> RelayerResult<Arc<NonceManagedAccount>> {
        self.accounts
            .get(address)
            .cloned()
            .ok_or(RelayerError::WalletNotManaged { address: *address })
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }
}
