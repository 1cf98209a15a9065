//! Request state with PostgreSQL persistence
//!
//! Handles:
//! - Storage of transfer requests and their current hash and fees
//! - Recording lifecycle events against the stored request
//! - Routing new requests to the transaction manager of their chain

mod mediator;
mod repository;

pub use mediator::{RequestMediator, TransferRequest};
#[cfg(test)]
pub use repository::MockRequestRepository;
pub use repository::{
    NewRequest, PgRequestRepository, RequestRepository, RequestStatus, RequestUpdate,
    StoredRequest,
};
