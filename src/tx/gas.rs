//! Fee estimation and replacement fee bumping

use crate::chain::{FeeQuote, FeeSignal, LedgerClient};
use crate::error::{RelayerError, RelayerResult};

use ethers::types::U256;
use std::sync::Arc;
use tracing::debug;

/// Fee oracle for one chain.
///
/// Holds no mutable state; every quote is derived from fresh node data.
#[derive(Clone)]
pub struct FeeOracle {
    ledger: Arc<dyn LedgerClient>,
    /// Safety margin applied to fresh estimates, as numerator / denominator
    slack: (u64, u64),
    /// Minimum increase for replacements, in percent
    bump_percent: u64,
}

impl FeeOracle {
    pub fn new(ledger: Arc<dyn LedgerClient>) -> Self {
        Self {
            ledger,
            slack: (6, 5),
            bump_percent: 10,
        }
    }

    /// Current fees with a safety margin on top
    pub async fn current(&self) -> RelayerResult<FeeQuote> {
        let signal = self.ledger.fee_signal().await?;
        let quote = self.quote_from_signal(&signal)?;
        debug!("Current fee quote: {:?}", quote);
        Ok(quote)
    }

    /// Turn raw node data into a quote. The chain reporting a base fee
    /// decides between the two fee models.
    pub fn quote_from_signal(&self, signal: &FeeSignal) -> RelayerResult<FeeQuote> {
        Ok(match signal.base_fee_per_gas {
            None => FeeQuote::Legacy {
                gas_price: self.with_slack(signal.gas_price)?,
            },
            Some(base_fee) => {
                let max_fee_per_gas = signal.gas_price;
                let max_priority_fee_per_gas = max_fee_per_gas.saturating_sub(base_fee);
                FeeQuote::Eip1559 {
                    max_fee_per_gas: self.with_slack(max_fee_per_gas)?,
                    max_priority_fee_per_gas: self.with_slack(max_priority_fee_per_gas)?,
                }
            }
        })
    }

    /// Fees for a replacement of a transaction sent with `previous`.
    ///
    /// Every field is at least the bumped previous value, and never below the
    /// current estimate.
    pub fn retry_quote(&self, previous: &FeeQuote, current: &FeeQuote) -> RelayerResult<FeeQuote> {
        match (previous, current) {
            (FeeQuote::Legacy { gas_price: prev }, FeeQuote::Legacy { gas_price: now }) => {
                Ok(FeeQuote::Legacy {
                    gas_price: self.bumped(*prev)?.max(*now),
                })
            }
            (
                FeeQuote::Eip1559 {
                    max_fee_per_gas: prev_max,
                    max_priority_fee_per_gas: prev_priority,
                },
                FeeQuote::Eip1559 {
                    max_fee_per_gas: now_max,
                    max_priority_fee_per_gas: now_priority,
                },
            ) => Ok(FeeQuote::Eip1559 {
                max_fee_per_gas: self.bumped(*prev_max)?.max(*now_max),
                max_priority_fee_per_gas: self.bumped(*prev_priority)?.max(*now_priority),
            }),
            _ => Err(RelayerError::FeeFormatMismatch),
        }
    }

    fn with_slack(&self, value: U256) -> RelayerResult<U256> {
        value
            .checked_mul(U256::from(self.slack.0))
            .map(|scaled| scaled / self.slack.1)
            .ok_or_else(|| overflow(value))
    }

    /// `value` plus the bump percentage, plus one for rounding
    fn bumped(&self, value: U256) -> RelayerResult<U256> {
        value
            .checked_mul(U256::from(self.bump_percent))
            .and_then(|scaled| value.checked_add(scaled / 100))
            .and_then(|bumped| bumped.checked_add(U256::one()))
            .ok_or_else(|| overflow(value))
    }
}

fn overflow(value: U256) -> RelayerError {
    RelayerError::GasEstimation(format!("fee {} out of range", value))
}
