//! Routes transfer requests to their chain and keeps the stored request in
//! step with its lifecycle

use super::repository::{NewRequest, RequestRepository, RequestStatus, RequestUpdate, StoredRequest};
use crate::error::{RelayerError, RelayerResult};
use crate::events::{LifecycleEvent, TransactionWatch};
use crate::lifecycle::TransactionManager;

use ethers::types::{Address, Bytes, U256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// A transfer asked for by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub chain_id: u64,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub data: Option<Bytes>,
}

pub struct RequestMediator {
    managers: HashMap<u64, Arc<TransactionManager>>,
    repository: Arc<dyn RequestRepository>,
}

impl RequestMediator {
    pub fn new(
        managers: HashMap<u64, Arc<TransactionManager>>,
        repository: Arc<dyn RequestRepository>,
    ) -> Self {
        Self {
            managers,
            repository,
        }
    }

    /// Send `request` under a fresh id and record its progress in the
    /// background
    pub async fn submit(&self, request: TransferRequest) -> RelayerResult<Uuid> {
        let manager = self
            .managers
            .get(&request.chain_id)
            .cloned()
            .ok_or(RelayerError::ChainNotFound {
                chain_id: request.chain_id,
            })?;

        let id = Uuid::new_v4();
        // Subscribed before sending so `Submitted` is not missed
        let watch = manager.watch(id);

        manager
            .send(id, request.to, request.from, request.value, request.data.clone())
            .await?;

        tokio::spawn(record_lifecycle(watch, request, self.repository.clone()));
        Ok(id)
    }

    pub async fn find(&self, id: Uuid) -> RelayerResult<Option<StoredRequest>> {
        self.repository.find(id).await
    }
}

async fn record_lifecycle(
    mut watch: TransactionWatch,
    request: TransferRequest,
    repository: Arc<dyn RequestRepository>,
) {
    while let Some(event) = watch.next().await {
        let id = watch.id();
        let result = match &event {
            LifecycleEvent::Submitted {
                nonce, hash, fees, ..
            } => {
                repository
                    .create(NewRequest {
                        id,
                        chain_id: request.chain_id,
                        from: request.from,
                        to: request.to,
                        value: request.value,
                        data: request.data.clone(),
                        nonce: *nonce,
                        hash: *hash,
                        fees: *fees,
                    })
                    .await
            }
            LifecycleEvent::Retry { hash, fees, .. } => {
                repository
                    .update(
                        id,
                        RequestUpdate {
                            status: None,
                            hash: Some(*hash),
                            fees: Some(*fees),
                        },
                    )
                    .await
            }
            LifecycleEvent::Included { hash, fees, .. } => {
                repository
                    .update(
                        id,
                        RequestUpdate {
                            status: Some(RequestStatus::Complete),
                            hash: Some(*hash),
                            fees: Some(*fees),
                        },
                    )
                    .await
            }
            LifecycleEvent::Cancel { .. } => {
                repository
                    .update(
                        id,
                        RequestUpdate {
                            status: Some(RequestStatus::Failed),
                            ..Default::default()
                        },
                    )
                    .await
            }
            LifecycleEvent::CancelFailed {
                error,
                still_pending: false,
                ..
            } => {
                // Neither the cancellation nor the transfer is known to be mined
                warn!(
                    "Outcome of request {} unknown after cancellation failed: {}",
                    id, error
                );
                Ok(())
            }
            _ => Ok(()),
        };

        match result {
            Ok(()) => debug!("Recorded {} for request {}", event.name(), id),
            Err(e) => error!("Failed to record {} for request {}: {}", event.name(), id, e),
        }
    }
}
