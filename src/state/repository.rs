//! Request persistence with a PostgreSQL backend

use crate::chain::FeeQuote;
use crate::config::DatabaseConfig;
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, H256, U256};
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Complete,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Complete => "complete",
            RequestStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> RelayerResult<Self> {
        match value {
            "pending" => Ok(RequestStatus::Pending),
            "complete" => Ok(RequestStatus::Complete),
            "failed" => Ok(RequestStatus::Failed),
            other => Err(RelayerError::Internal(format!("Unknown request status: {}", other))),
        }
    }
}

/// A transfer request as first submitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRequest {
    pub id: Uuid,
    pub chain_id: u64,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub data: Option<Bytes>,
    pub nonce: u64,
    pub hash: H256,
    pub fees: FeeQuote,
}

/// Fields to change on a stored request; `None` leaves a field as is
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestUpdate {
    pub status: Option<RequestStatus>,
    pub hash: Option<H256>,
    pub fees: Option<FeeQuote>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRequest {
    pub id: Uuid,
    pub chain_id: u64,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub data: Option<Bytes>,
    pub nonce: u64,
    pub hash: H256,
    pub fees: FeeQuote,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RequestRepository: Send + Sync {
    /// Store a new request with status `pending`
    async fn create(&self, request: NewRequest) -> RelayerResult<()>;

    async fn update(&self, id: Uuid, update: RequestUpdate) -> RelayerResult<()>;

    async fn find(&self, id: Uuid) -> RelayerResult<Option<StoredRequest>>;
}

/// Repository for PostgreSQL persistence
pub struct PgRequestRepository {
    pool: PgPool,
}

impl PgRequestRepository {
    /// Create a new repository
    pub async fn new(config: &DatabaseConfig) -> RelayerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> RelayerResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS requests (
                id UUID PRIMARY KEY,
                chain_id BIGINT NOT NULL,
                from_address VARCHAR(42) NOT NULL,
                to_address VARCHAR(42) NOT NULL,
                value TEXT NOT NULL,
                data BYTEA,
                nonce BIGINT NOT NULL,
                tx_hash VARCHAR(66) NOT NULL,
                fees JSONB NOT NULL,
                status VARCHAR(20) NOT NULL DEFAULT 'pending',
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_requests_status
            ON requests (status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> RelayerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl RequestRepository for PgRequestRepository {
    async fn create(&self, request: NewRequest) -> RelayerResult<()> {
        let fees = serde_json::to_value(request.fees)
            .map_err(|e| RelayerError::Internal(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO requests
                (id, chain_id, from_address, to_address, value, data, nonce, tx_hash, fees, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending')
            "#,
        )
        .bind(request.id)
        .bind(request.chain_id as i64)
        .bind(format!("{:?}", request.from))
        .bind(format!("{:?}", request.to))
        .bind(request.value.to_string())
        .bind(request.data.map(|d| d.to_vec()))
        .bind(request.nonce as i64)
        .bind(format!("{:?}", request.hash))
        .bind(fees)
        .execute(&self.pool)
        .await?;

        debug!("Stored request {}", request.id);
        Ok(())
    }

    async fn update(&self, id: Uuid, update: RequestUpdate) -> RelayerResult<()> {
        let fees = update
            .fees
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| RelayerError::Internal(e.to_string()))?;

        sqlx::query(
            r#"
            UPDATE requests
            SET status = COALESCE($2, status),
                tx_hash = COALESCE($3, tx_hash),
                fees = COALESCE($4, fees),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.hash.map(|h| format!("{:?}", h)))
        .bind(fees)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find(&self, id: Uuid) -> RelayerResult<Option<StoredRequest>> {
        let row = sqlx::query(
            r#"
            SELECT id, chain_id, from_address, to_address, value, data, nonce, tx_hash, fees,
                   status, created_at, updated_at
            FROM requests
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| stored_request(&row)).transpose()
    }
}

fn stored_request(row: &PgRow) -> RelayerResult<StoredRequest> {
    let corrupt = |field: &str, e: String| {
        RelayerError::Internal(format!("Corrupt request column {}: {}", field, e))
    };

    let from: String = row.try_get("from_address")?;
    let to: String = row.try_get("to_address")?;
    let value: String = row.try_get("value")?;
    let hash: String = row.try_get("tx_hash")?;
    let data: Option<Vec<u8>> = row.try_get("data")?;
    let fees: serde_json::Value = row.try_get("fees")?;
    let status: String = row.try_get("status")?;

    Ok(StoredRequest {
        id: row.try_get("id")?,
        chain_id: row.try_get::<i64, _>("chain_id")? as u64,
        from: from.parse().map_err(|e| corrupt("from_address", format!("{}", e)))?,
        to: to.parse().map_err(|e| corrupt("to_address", format!("{}", e)))?,
        value: U256::from_dec_str(&value).map_err(|e| corrupt("value", e.to_string()))?,
        data: data.map(Bytes::from),
        nonce: row.try_get::<i64, _>("nonce")? as u64,
        hash: hash.parse().map_err(|e| corrupt("tx_hash", format!("{}", e)))?,
        fees: serde_json::from_value(fees).map_err(|e| corrupt("fees", e.to_string()))?,
        status: RequestStatus::parse(&status)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_names_round_trip() {
        for status in [
            RequestStatus::Pending,
            RequestStatus::Complete,
            RequestStatus::Failed,
        ] {
            assert_eq!(RequestStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(RequestStatus::parse("finalized").is_err());
    }
}
