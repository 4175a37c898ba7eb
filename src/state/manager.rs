//! PostgreSQL state manager

use crate::config::DatabaseConfig;
use crate::deploy::{DeploymentRecord, RecordStore, RouterEntry};
use crate::error::StoreError;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::Address;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info};

const STATUS_PENDING: &str = "pending";
const STATUS_DEPLOYED: &str = "deployed";

/// State manager for PostgreSQL persistence
pub struct StateManager {
    pool: PgPool,
}

impl StateManager {
    /// Create a new state manager
    pub async fn new(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS deployment_records (
                chain VARCHAR(64) PRIMARY KEY,
                chain_id BIGINT NOT NULL,
                address VARCHAR(42) NOT NULL,
                status VARCHAR(10) NOT NULL,
                deployed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                enrolled BIGINT[] NOT NULL DEFAULT '{}',
                owner VARCHAR(42)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Tables created before connection progress was tracked
        sqlx::query(
            r#"
            ALTER TABLE deployment_records
                ADD COLUMN IF NOT EXISTS enrolled BIGINT[] NOT NULL DEFAULT '{}',
                ADD COLUMN IF NOT EXISTS owner VARCHAR(42)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for StateManager {
    async fn load(&self) -> Result<DeploymentRecord, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT chain, chain_id, address, status, deployed_at, enrolled, owner
            FROM deployment_records
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let rows = rows
            .into_iter()
            .map(|row| RecordRow {
                chain: row.get("chain"),
                chain_id: row.get("chain_id"),
                address: row.get("address"),
                status: row.get("status"),
                deployed_at: row.get("deployed_at"),
                enrolled: row.get("enrolled"),
                owner: row.get("owner"),
            })
            .collect();

        record_from_rows(rows)
    }

    /// Replace the stored record with `record` in one transaction
    async fn save(&self, record: &DeploymentRecord) -> Result<(), StoreError> {
        let rows = rows_from_record(record)?;
        let chains: Vec<String> = rows.iter().map(|r| r.chain.clone()).collect();

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM deployment_records WHERE chain <> ALL($1)")
            .bind(&chains)
            .execute(&mut *tx)
            .await?;

        for row in &rows {
            sqlx::query(
                r#"
                INSERT INTO deployment_records
                    (chain, chain_id, address, status, deployed_at, enrolled, owner)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (chain)
                DO UPDATE SET chain_id = $2, address = $3, status = $4, deployed_at = $5,
                    enrolled = $6, owner = $7
                "#,
            )
            .bind(&row.chain)
            .bind(row.chain_id)
            .bind(&row.address)
            .bind(&row.status)
            .bind(row.deployed_at)
            .bind(&row.enrolled)
            .bind(&row.owner)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!("Saved deployment record ({} rows)", rows.len());
        Ok(())
    }
}

/// One `deployment_records` row
#[derive(Debug, Clone, PartialEq)]
struct RecordRow {
    chain: String,
    chain_id: i64,
    address: String,
    status: String,
    deployed_at: DateTime<Utc>,
    enrolled: Vec<i64>,
    owner: Option<String>,
}

fn rows_from_record(record: &DeploymentRecord) -> Result<Vec<RecordRow>, StoreError> {
    let deployed = record.routers.iter().map(|e| (e, STATUS_DEPLOYED));
    let pending = record.pending.iter().map(|e| (e, STATUS_PENDING));

    deployed
        .chain(pending)
        .map(|((chain, entry), status)| {
            let to_i64 = |id: u64| {
                i64::try_from(id).map_err(|_| StoreError::Corrupt {
                    chain: chain.clone(),
                    message: format!("chain id {} out of range", id),
                })
            };
            Ok(RecordRow {
                chain: chain.clone(),
                chain_id: to_i64(entry.chain_id)?,
                address: format!("{:?}", entry.address),
                status: status.to_string(),
                deployed_at: entry.deployed_at,
                enrolled: entry
                    .enrolled
                    .iter()
                    .map(|d| to_i64(*d))
                    .collect::<Result<_, _>>()?,
                owner: entry.owner.map(|o| format!("{:?}", o)),
            })
        })
        .collect()
}

fn record_from_rows(rows: Vec<RecordRow>) -> Result<DeploymentRecord, StoreError> {
    let mut record = DeploymentRecord::default();

    for row in rows {
        let corrupt = |message: String| StoreError::Corrupt {
            chain: row.chain.clone(),
            message,
        };
        let address: Address = row
            .address
            .parse()
            .map_err(|e| corrupt(format!("bad address {}: {}", row.address, e)))?;
        let to_u64 = |id: i64| {
            u64::try_from(id).map_err(|_| corrupt(format!("negative chain id {}", id)))
        };
        let owner = row
            .owner
            .as_deref()
            .map(|o| {
                o.parse::<Address>()
                    .map_err(|e| corrupt(format!("bad owner {}: {}", o, e)))
            })
            .transpose()?;
        let entry = RouterEntry {
            chain_id: to_u64(row.chain_id)?,
            address,
            deployed_at: row.deployed_at,
            enrolled: row
                .enrolled
                .iter()
                .map(|d| to_u64(*d))
                .collect::<Result<_, _>>()?,
            owner,
        };

        match row.status.as_str() {
            STATUS_DEPLOYED => record.routers.insert(row.chain.clone(), entry),
            STATUS_PENDING => record.pending.insert(row.chain.clone(), entry),
            other => return Err(corrupt(format!("unknown status {}", other))),
        };
    }

    Ok(record)
}
