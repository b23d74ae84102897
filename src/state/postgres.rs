//! PostgreSQL intent store

use super::{IntentStore, StoreStats};
use crate::config::DatabaseConfig;
use crate::error::{DispersalError, DispersalResult};
use crate::intent::{ChainDistribution, Intent, IntentStatus};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::U256;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::{debug, info};

pub struct PostgresIntentStore {
    pool: PgPool,
}

impl PostgresIntentStore {
    pub async fn new(config: &DatabaseConfig) -> DispersalResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Create tables if missing
    pub async fn run_migrations(&self) -> DispersalResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS intents (
                id VARCHAR(66) PRIMARY KEY,
                user_address VARCHAR(42) NOT NULL,
                source_chain_id BIGINT NOT NULL,
                source_token VARCHAR(42) NOT NULL,
                source_amount TEXT NOT NULL,
                deposit_tx_hash VARCHAR(66) NOT NULL,
                usd_value NUMERIC(38, 8) NOT NULL,
                status VARCHAR(32) NOT NULL,
                distributions JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                completed_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_intents_status
            ON intents (status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_intents_user
            ON intents (user_address, created_at DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }
}

/// `source_amount` is stored as decimal text; NUMERIC would cap it below 2^256
fn parse_stored_amount(raw: &str) -> DispersalResult<U256> {
    U256::from_dec_str(raw)
        .map_err(|e| DispersalError::Internal(format!("Stored amount {} unreadable: {}", raw, e)))
}

fn intent_from_row(row: &PgRow) -> DispersalResult<Intent> {
    let source_amount: String = row.try_get("source_amount")?;
    let status: String = row.try_get("status")?;
    let Json(distributions): Json<Vec<ChainDistribution>> = row.try_get("distributions")?;

    Ok(Intent {
        id: row.try_get("id")?,
        user_address: row.try_get("user_address")?,
        source_chain_id: row.try_get::<i64, _>("source_chain_id")? as u64,
        source_token: row.try_get("source_token")?,
        source_amount: parse_stored_amount(&source_amount)?,
        deposit_tx_hash: row.try_get("deposit_tx_hash")?,
        usd_value: row.try_get::<Decimal, _>("usd_value")?,
        status: IntentStatus::parse(&status)?,
        distributions,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        completed_at: row.try_get::<Option<DateTime<Utc>>, _>("completed_at")?,
    })
}

#[async_trait]
impl IntentStore for PostgresIntentStore {
    async fn create(&self, intent: &Intent) -> DispersalResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO intents (
                id, user_address, source_chain_id, source_token, source_amount,
                deposit_tx_hash, usd_value, status, distributions,
                created_at, updated_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&intent.id)
        .bind(&intent.user_address)
        .bind(intent.source_chain_id as i64)
        .bind(&intent.source_token)
        .bind(intent.source_amount.to_string())
        .bind(&intent.deposit_tx_hash)
        .bind(intent.usd_value)
        .bind(intent.status.as_str())
        .bind(Json(&intent.distributions))
        .bind(intent.created_at)
        .bind(intent.updated_at)
        .bind(intent.completed_at)
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() == 1;
        debug!(intent_id = %intent.id, inserted, "Stored intent");
        Ok(inserted)
    }

    async fn get(&self, intent_id: &str) -> DispersalResult<Option<Intent>> {
        let row = sqlx::query("SELECT * FROM intents WHERE id = $1")
            .bind(intent_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(intent_from_row).transpose()
    }

    async fn update(&self, intent: &Intent) -> DispersalResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE intents
            SET status = $2, distributions = $3, updated_at = $4, completed_at = $5
            WHERE id = $1
            "#,
        )
        .bind(&intent.id)
        .bind(intent.status.as_str())
        .bind(Json(&intent.distributions))
        .bind(intent.updated_at)
        .bind(intent.completed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DispersalError::IntentNotFound {
                intent_id: intent.id.clone(),
            });
        }
        Ok(())
    }

    async fn health_check(&self) -> DispersalResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn stats(&self) -> DispersalResult<StoreStats> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM intents GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = StoreStats::default();
        for row in rows {
            let status: String = row.get("status");
            let count = row.get::<i64, _>("count") as u64;
            stats.total += count;
            stats.by_status.insert(status, count);
        }
        Ok(stats)
    }
}
