//! In-memory ledger with mempool semantics for unit tests

use super::ledger::{BlockSummary, FeeQuote, FeeSignal, LedgerClient, ReceiptStatus, TxRequest};
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// Ledger that only mines when told to.
///
/// Accepts a transaction if its nonce is the sender's next expected one or
/// replaces a pending one at a higher price. Mining includes, per sender,
/// the contiguous run of pending nonces priced at or above the minimum.
pub struct FakeLedger {
    state: Mutex<FakeState>,
}

struct FakeState {
    next_nonce: HashMap<Address, u64>,
    mempool: BTreeMap<(Address, u64), (H256, TxRequest)>,
    mined: HashSet<H256>,
    submitted: Vec<(H256, TxRequest)>,
    blocks: Vec<BlockSummary>,
    fee_signal: FeeSignal,
    min_gas_price: U256,
    submit_failures: VecDeque<RelayerError>,
    hash_counter: u64,
    fee_signal_calls: usize,
}

impl FakeLedger {
    pub fn new() -> Self {
        Self::with_fee_signal(FeeSignal {
            gas_price: U256::from(1_000),
            base_fee_per_gas: None,
        })
    }

    pub fn with_fee_signal(fee_signal: FeeSignal) -> Self {
        Self {
            state: Mutex::new(FakeState {
                next_nonce: HashMap::new(),
                mempool: BTreeMap::new(),
                mined: HashSet::new(),
                submitted: Vec::new(),
                blocks: Vec::new(),
                fee_signal,
                min_gas_price: U256::zero(),
                submit_failures: VecDeque::new(),
                hash_counter: 0,
                fee_signal_calls: 0,
            }),
        }
    }

    /// Produce the next block
    pub fn mine(&self) -> BlockSummary {
        let mut state = self.state.lock().unwrap();
        let min_price = state.min_gas_price;
        let mut transactions = Vec::new();

        let mut senders: Vec<Address> = state.mempool.keys().map(|(from, _)| *from).collect();
        senders.dedup();
        for from in senders {
            loop {
                let next = state.next_nonce.get(&from).copied().unwrap_or(0);
                let Some((hash, request)) = state.mempool.get(&(from, next)).cloned() else {
                    break;
                };
                if request.fees.max_price() < min_price {
                    break;
                }
                state.mempool.remove(&(from, next));
                state.mined.insert(hash);
                state.next_nonce.insert(from, next + 1);
                transactions.push(hash);
            }
        }

        let block = BlockSummary {
            number: state.blocks.len() as u64 + 1,
            transactions,
        };
        state.blocks.push(block.clone());
        block
    }

    /// Mine a transaction that was already replaced in this pool, as a
    /// block producer that never saw the replacement would. Whatever sits at
    /// its nonce is evicted.
    pub fn mine_replaced(&self, hash: H256) -> BlockSummary {
        let mut state = self.state.lock().unwrap();
        let (_, request) = state
            .submitted
            .iter()
            .find(|(submitted, _)| *submitted == hash)
            .cloned()
            .expect("transaction was never submitted");

        state.mempool.remove(&(request.from, request.nonce));
        state.mined.insert(hash);
        state.next_nonce.insert(request.from, request.nonce + 1);

        let block = BlockSummary {
            number: state.blocks.len() as u64 + 1,
            transactions: vec![hash],
        };
        state.blocks.push(block.clone());
        block
    }

    /// Forget a transaction, as a node evicting it from its pool would
    pub fn drop_transaction(&self, hash: H256) {
        let mut state = self.state.lock().unwrap();
        state.mempool.retain(|_, (pending, _)| *pending != hash);
    }

    /// Move an account's nonce as if someone else had been sending from it
    pub fn set_nonce(&self, address: Address, nonce: u64) {
        let mut state = self.state.lock().unwrap();
        state.next_nonce.insert(address, nonce);
        state
            .mempool
            .retain(|(from, pending_nonce), _| *from != address || *pending_nonce >= nonce);
    }

    /// Transactions priced below this stay in the pool
    pub fn set_min_gas_price(&self, price: U256) {
        self.state.lock().unwrap().min_gas_price = price;
    }

    pub fn set_fee_signal(&self, fee_signal: FeeSignal) {
        self.state.lock().unwrap().fee_signal = fee_signal;
    }

    /// Make the next `submit` fail with `error`
    pub fn fail_next_submit(&self, error: RelayerError) {
        self.state.lock().unwrap().submit_failures.push_back(error);
    }

    pub fn pending_for(&self, address: Address) -> Vec<(H256, TxRequest)> {
        let state = self.state.lock().unwrap();
        state
            .mempool
            .iter()
            .filter(|((from, _), _)| *from == address)
            .map(|(_, entry)| entry.clone())
            .collect()
    }

    pub fn submitted(&self) -> Vec<(H256, TxRequest)> {
        self.state.lock().unwrap().submitted.clone()
    }

    pub fn fee_signal_calls(&self) -> usize {
        self.state.lock().unwrap().fee_signal_calls
    }
}

#[async_trait]
impl LedgerClient for FakeLedger {
    async fn submit(&self, request: TxRequest) -> RelayerResult<H256> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.submit_failures.pop_front() {
            return Err(error);
        }

        let from = request.from;
        let next = state.next_nonce.get(&from).copied().unwrap_or(0);
        if request.nonce < next {
            return Err(RelayerError::NonceTooLow {
                address: from,
                nonce: request.nonce,
            });
        }

        let queued = state
            .mempool
            .keys()
            .filter(|(sender, nonce)| *sender == from && *nonce >= next)
            .count() as u64;
        if request.nonce > next + queued {
            return Err(RelayerError::NonceTooHigh {
                address: from,
                nonce: request.nonce,
            });
        }

        if let Some((_, existing)) = state.mempool.get(&(from, request.nonce)) {
            if request.fees.max_price() <= existing.fees.max_price() {
                return Err(RelayerError::Transaction(
                    "replacement transaction underpriced".to_string(),
                ));
            }
        }

        state.hash_counter += 1;
        let hash = H256::from_low_u64_be(state.hash_counter);
        state
            .mempool
            .insert((from, request.nonce), (hash, request.clone()));
        state.submitted.push((hash, request));
        Ok(hash)
    }

    async fn account_next_nonce(&self, address: Address) -> RelayerResult<u64> {
        let state = self.state.lock().unwrap();
        Ok(state.next_nonce.get(&address).copied().unwrap_or(0))
    }

    async fn fee_signal(&self) -> RelayerResult<FeeSignal> {
        let mut state = self.state.lock().unwrap();
        state.fee_signal_calls += 1;
        Ok(state.fee_signal)
    }

    async fn block_number(&self) -> RelayerResult<u64> {
        Ok(self.state.lock().unwrap().blocks.len() as u64)
    }

    async fn block(&self, number: u64) -> RelayerResult<Option<BlockSummary>> {
        let state = self.state.lock().unwrap();
        Ok(number
            .checked_sub(1)
            .and_then(|index| state.blocks.get(index as usize))
            .cloned())
    }

    async fn receipt(&self, hash: H256) -> RelayerResult<Option<ReceiptStatus>> {
        let state = self.state.lock().unwrap();
        Ok(state.mined.contains(&hash).then_some(ReceiptStatus::Success))
    }

    async fn wait_for_receipt(&self, hash: H256) -> RelayerResult<ReceiptStatus> {
        loop {
            {
                let state = self.state.lock().unwrap();
                if state.mined.contains(&hash) {
                    return Ok(ReceiptStatus::Success);
                }
                if !state.mempool.values().any(|(pending, _)| *pending == hash) {
                    return Err(RelayerError::ReceiptUnavailable {
                        hash: format!("{:?}", hash),
                    });
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// Legacy quote at `price`
pub fn legacy(price: u64) -> FeeQuote {
    FeeQuote::Legacy {
        gas_price: U256::from(price),
    }
}
