//! Transaction submission: fee estimation, per-account queues and nonce management

mod gas;
mod nonce;
mod queue;
mod registry;

pub use gas::FeeOracle;
pub use nonce::Submission;
pub use queue::SequentialQueue;
pub use registry::AccountRegistry;
