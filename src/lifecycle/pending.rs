//! In-flight transactions and their hash index

use crate::chain::FeeQuote;

use ethers::types::{Address, Bytes, H256, U256};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// A transaction broadcast by the manager and not yet included or cancelled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTransaction {
    pub id: Uuid,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub data: Option<Bytes>,
    pub nonce: u64,
    pub fees: FeeQuote,
    pub hash: H256,
    /// Blocks seen since the last (re)submission
    pub blocks_waiting: u64,
}

/// What a block pass decided for a transaction after aging it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Escalation {
    Retry(PendingTransaction),
    Cancel(PendingTransaction),
}

/// Pending transactions keyed by id, plus the current hash of each.
///
/// Every id has exactly one hash in the index and every indexed hash points
/// at a live record.
#[derive(Debug, Default)]
pub struct PendingSet {
    records: HashMap<Uuid, PendingTransaction>,
    by_hash: HashMap<H256, Uuid>,
    /// Ids whose first submission is in progress
    reserved: HashSet<Uuid>,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id` for a submission. False if it is tracked or already claimed.
    pub fn reserve(&mut self, id: Uuid) -> bool {
        if self.records.contains_key(&id) {
            return false;
        }
        self.reserved.insert(id)
    }

    /// Give up a claim after a failed submission
    pub fn release(&mut self, id: &Uuid) {
        self.reserved.remove(id);
    }

    /// Start tracking a submitted transaction
    pub fn insert(&mut self, record: PendingTransaction) {
        self.reserved.remove(&record.id);
        if let Some(previous) = self.records.remove(&record.id) {
            self.by_hash.remove(&previous.hash);
        }
        self.by_hash.insert(record.hash, record.id);
        self.records.insert(record.id, record);
    }

    /// Swap in a new version of a tracked record, moving its hash index entry.
    /// Returns the old record, or `None` (and changes nothing) if `record.id`
    /// is not tracked.
    pub fn replace(&mut self, record: PendingTransaction) -> Option<PendingTransaction> {
        let previous = self.records.remove(&record.id)?;
        self.by_hash.remove(&previous.hash);
        self.by_hash.insert(record.hash, record.id);
        self.records.insert(record.id, record);
        Some(previous)
    }

    /// Stop tracking `id`
    pub fn remove(&mut self, id: &Uuid) -> Option<PendingTransaction> {
        let record = self.records.remove(id)?;
        self.by_hash.remove(&record.hash);
        Some(record)
    }

    /// Stop tracking whatever transaction currently has `hash`
    pub fn remove_by_hash(&mut self, hash: &H256) -> Option<PendingTransaction> {
        let id = self.by_hash.get(hash).copied()?;
        self.remove(&id)
    }

    pub fn get(&self, id: &Uuid) -> Option<&PendingTransaction> {
        self.records.get(id)
    }

    pub fn id_for_hash(&self, hash: &H256) -> Option<Uuid> {
        self.by_hash.get(hash).copied()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Count one more block for every record and decide what to do about
    /// each. Cancellation wins over retry when both thresholds are reached.
    pub fn age(&mut self, blocks_before_retry: u64, blocks_before_cancel: u64) -> Vec<Escalation> {
        let mut escalations = Vec::new();

        for record in self.records.values_mut() {
            record.blocks_waiting += 1;
            let waited = record.blocks_waiting;

            if waited >= blocks_before_cancel {
                escalations.push(Escalation::Cancel(record.clone()));
            } else if blocks_before_retry > 0
                && waited >= blocks_before_retry
                && waited % blocks_before_retry == 0
            {
                escalations.push(Escalation::Retry(record.clone()));
            }
        }

        escalations
    }
}
