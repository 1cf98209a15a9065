//! Transaction lifecycle - tracks every submitted transaction until it is
//! included or cancelled
//!
//! Each block pass:
//! - Settles transactions whose current hash appears in the block
//! - Ages the rest and resubmits stuck ones with bumped fees
//! - Replaces transactions that waited too long with a zero value transfer

pub mod engine;
pub mod pending;

pub use engine::{ManagerSettings, TransactionManager};
pub use pending::{Escalation, PendingSet, PendingTransaction};
