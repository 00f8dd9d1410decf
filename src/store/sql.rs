//! PostgreSQL transaction store

use super::{PostCommitHook, TransactionStore};
use crate::chain::GasPrice;
use crate::config::DatabaseConfig;
use crate::error::{EngineError, EngineResult};
use crate::types::{
    PublicTransaction, PubTxStatus, ReceiptRecord, SortBy, StatusUpdate, TxErrorKind, TxFilter,
    TxId,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, H256, U256};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{QueryBuilder, Row};
use std::sync::RwLock;
use tracing::{debug, info};

/// Transaction store backed by PostgreSQL
pub struct SqlTxStore {
    pool: PgPool,
    post_commit: RwLock<Vec<PostCommitHook>>,
}

fn addr_to_db(addr: &Address) -> String {
    format!("{:#x}", addr)
}

fn hash_to_db(hash: &H256) -> String {
    format!("{:#x}", hash)
}

fn parse_addr(s: &str) -> EngineResult<Address> {
    s.parse()
        .map_err(|e| EngineError::Internal(format!("Bad address in database {}: {}", s, e)))
}

fn parse_hash(s: &str) -> EngineResult<H256> {
    s.parse()
        .map_err(|e| EngineError::Internal(format!("Bad hash in database {}: {}", s, e)))
}

fn parse_u256(s: &str) -> EngineResult<U256> {
    U256::from_dec_str(s)
        .map_err(|e| EngineError::Internal(format!("Bad numeric in database {}: {}", s, e)))
}

impl SqlTxStore {
    pub async fn new(config: &DatabaseConfig) -> EngineResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await
            .map_err(EngineError::Database)?;

        Ok(Self {
            pool,
            post_commit: RwLock::new(Vec::new()),
        })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> EngineResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS public_transactions (
                id UUID PRIMARY KEY,
                signing_address VARCHAR(42) NOT NULL,
                to_address VARCHAR(42),
                nonce BIGINT,
                status VARCHAR(20) NOT NULL,
                data BYTEA NOT NULL,
                value VARCHAR(78) NOT NULL,
                gas_limit VARCHAR(78) NOT NULL,
                gas_price JSONB,
                has_value BOOLEAN NOT NULL DEFAULT FALSE,
                sequence BIGSERIAL,
                attempt_count INT NOT NULL DEFAULT 0,
                last_hash VARCHAR(66),
                last_error VARCHAR(30),
                last_action TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_pubtx_signer_nonce
            ON public_transactions (signing_address, nonce)
            WHERE nonce IS NOT NULL
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_pubtx_status_signer_sequence
            ON public_transactions (status, signing_address, sequence)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_pubtx_hash
            ON public_transactions (last_hash)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transaction_receipts (
                id BIGSERIAL PRIMARY KEY,
                tx_id UUID NOT NULL,
                signing_address VARCHAR(42) NOT NULL,
                nonce BIGINT NOT NULL,
                tx_hash VARCHAR(66) NOT NULL,
                success BOOLEAN NOT NULL,
                block_number BIGINT NOT NULL,
                block_hash VARCHAR(66) NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_receipts_hash
            ON transaction_receipts (tx_hash)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS fueling_transactions (
                tx_id UUID PRIMARY KEY,
                source_address VARCHAR(42) NOT NULL,
                destination_address VARCHAR(42) NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_fueling_destination
            ON fueling_transactions (destination_address)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS completed_nonces (
                signing_address VARCHAR(42) PRIMARY KEY,
                nonce BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> EngineResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(EngineError::Database)?;
        Ok(())
    }

    fn fire_post_commit(&self) {
        let hooks = self.post_commit.read().unwrap();
        for hook in hooks.iter() {
            hook();
        }
    }

    fn row_to_tx(row: &PgRow) -> EngineResult<PublicTransaction> {
        let gas_price: Option<serde_json::Value> = row.get("gas_price");
        let gas_price = match gas_price {
            Some(v) => Some(
                serde_json::from_value::<GasPrice>(v)
                    .map_err(|e| EngineError::Internal(format!("Bad gas price json: {}", e)))?,
            ),
            None => None,
        };

        let to_address: Option<String> = row.get("to_address");
        let last_hash: Option<String> = row.get("last_hash");
        let last_error: Option<String> = row.get("last_error");
        let status_str: String = row.get("status");
        let data: Vec<u8> = row.get("data");
        let value: String = row.get("value");
        let gas_limit: String = row.get("gas_limit");

        Ok(PublicTransaction {
            id: row.get("id"),
            from: parse_addr(&row.get::<String, _>("signing_address"))?,
            to: to_address.as_deref().map(parse_addr).transpose()?,
            nonce: row.get::<Option<i64>, _>("nonce").map(|n| n as u64),
            status: PubTxStatus::from_str(&status_str)
                .ok_or_else(|| EngineError::Internal(format!("Bad status {}", status_str)))?,
            data: Bytes::from(data),
            value: parse_u256(&value)?,
            gas_limit: parse_u256(&gas_limit)?,
            gas_price,
            has_value: row.get("has_value"),
            sequence: row.get::<i64, _>("sequence") as u64,
            attempt_count: row.get::<i32, _>("attempt_count") as u32,
            last_hash: last_hash.as_deref().map(parse_hash).transpose()?,
            last_error: last_error.as_deref().and_then(TxErrorKind::from_str),
            last_action: row.get::<DateTime<Utc>, _>("last_action"),
            created_at: row.get::<DateTime<Utc>, _>("created_at"),
        })
    }
}

#[async_trait]
impl TransactionStore for SqlTxStore {
    async fn insert_transaction(&self, tx: &PublicTransaction) -> EngineResult<u64> {
        let gas_price_json = tx
            .gas_price
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| EngineError::Internal(e.to_string()))?;

        let mut db_tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO public_transactions
                (id, signing_address, to_address, nonce, status, data, value,
                 gas_limit, gas_price, has_value, attempt_count, last_hash,
                 last_error, last_action, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, NOW(), NOW())
            RETURNING sequence
            "#,
        )
        .bind(tx.id)
        .bind(addr_to_db(&tx.from))
        .bind(tx.to.as_ref().map(addr_to_db))
        .bind(tx.nonce.map(|n| n as i64))
        .bind(tx.status.as_str())
        .bind(tx.data.to_vec())
        .bind(tx.value.to_string())
        .bind(tx.gas_limit.to_string())
        .bind(gas_price_json)
        .bind(tx.has_value)
        .bind(tx.attempt_count as i32)
        .bind(tx.last_hash.as_ref().map(hash_to_db))
        .bind(tx.last_error.map(|e| e.as_str()))
        .fetch_one(&mut *db_tx)
        .await?;

        // Value transfers are fueling transactions; keep the audit row in
        // the same transaction as the queue entry
        if tx.has_value {
            if let Some(to) = &tx.to {
                sqlx::query(
                    r#"
                    INSERT INTO fueling_transactions (tx_id, source_address, destination_address)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (tx_id) DO NOTHING
                    "#,
                )
                .bind(tx.id)
                .bind(addr_to_db(&tx.from))
                .bind(addr_to_db(to))
                .execute(&mut *db_tx)
                .await?;
            }
        }

        db_tx.commit().await?;

        let sequence = row.get::<i64, _>("sequence") as u64;
        debug!("Inserted transaction {} with sequence {}", tx.id, sequence);

        self.fire_post_commit();
        Ok(sequence)
    }

    async fn get_transaction(&self, id: &TxId) -> EngineResult<Option<PublicTransaction>> {
        let row = sqlx::query("SELECT * FROM public_transactions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_tx).transpose()
    }

    async fn list_transactions(&self, filter: &TxFilter) -> EngineResult<Vec<PublicTransaction>> {
        let mut qb: QueryBuilder<sqlx::Postgres> =
            QueryBuilder::new("SELECT * FROM public_transactions WHERE 1=1");

        if !filter.in_status.is_empty() {
            qb.push(" AND status IN (");
            let mut sep = qb.separated(", ");
            for status in &filter.in_status {
                sep.push_bind(status.as_str());
            }
            qb.push(")");
        }

        if let Some(from) = &filter.from {
            qb.push(" AND signing_address = ");
            qb.push_bind(addr_to_db(from));
        }

        if let Some(to) = &filter.to {
            qb.push(" AND to_address = ");
            qb.push_bind(addr_to_db(to));
        }

        if !filter.not_from.is_empty() {
            qb.push(" AND signing_address NOT IN (");
            let mut sep = qb.separated(", ");
            for addr in &filter.not_from {
                sep.push_bind(addr_to_db(addr));
            }
            qb.push(")");
        }

        if let Some(has_value) = filter.has_value {
            qb.push(" AND has_value = ");
            qb.push_bind(has_value);
        }

        match filter.sort {
            SortBy::SequenceAsc => qb.push(" ORDER BY sequence ASC"),
            SortBy::NonceDesc => qb.push(" ORDER BY nonce DESC NULLS LAST"),
        };

        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ");
            qb.push_bind(limit as i64);
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_tx).collect()
    }

    async fn assign_nonce(&self, id: &TxId, nonce: u64) -> EngineResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE public_transactions
            SET nonce = $1, last_action = NOW()
            WHERE id = $2 AND nonce IS NULL
            "#,
        )
        .bind(nonce as i64)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let existing = self.get_transaction(id).await?;
            return match existing {
                Some(tx) => Err(EngineError::Nonce {
                    signer: tx.from,
                    message: format!(
                        "nonce already assigned for transaction {} ({:?})",
                        id, tx.nonce
                    ),
                }),
                None => Err(EngineError::TransactionNotFound(*id)),
            };
        }

        self.fire_post_commit();
        Ok(())
    }

    async fn update_status(
        &self,
        id: &TxId,
        status: PubTxStatus,
        update: StatusUpdate,
    ) -> EngineResult<()> {
        // Succeeded is refused while a lower nonce for the same signer is
        // still non-terminal
        let guard = if status == PubTxStatus::Succeeded {
            r#"
            AND NOT EXISTS (
                SELECT 1 FROM public_transactions lower
                WHERE lower.signing_address = public_transactions.signing_address
                  AND lower.nonce IS NOT NULL
                  AND lower.nonce < public_transactions.nonce
                  AND lower.status NOT IN ('succeeded', 'failed')
            )
            "#
        } else {
            ""
        };

        let sql = format!(
            r#"
            UPDATE public_transactions
            SET status = $1,
                last_error = COALESCE($2, last_error),
                attempt_count = COALESCE($3, attempt_count),
                last_hash = COALESCE($4, last_hash),
                last_action = NOW()
            WHERE id = $5 {}
            "#,
            guard
        );

        let result = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(update.error.map(|e| e.as_str()))
            .bind(update.attempt_count.map(|a| a as i32))
            .bind(update.last_hash.as_ref().map(hash_to_db))
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            let existing = self.get_transaction(id).await?;
            return match existing {
                Some(tx) => Err(EngineError::InvalidStatusTransition {
                    from: tx.status.to_string(),
                    to: status.to_string(),
                }),
                None => Err(EngineError::TransactionNotFound(*id)),
            };
        }

        self.fire_post_commit();
        Ok(())
    }

    async fn record_broadcast(
        &self,
        id: &TxId,
        hash: H256,
        gas_price: &GasPrice,
        attempt_count: u32,
    ) -> EngineResult<()> {
        let gas_price_json =
            serde_json::to_value(gas_price).map_err(|e| EngineError::Internal(e.to_string()))?;

        sqlx::query(
            r#"
            UPDATE public_transactions
            SET status = 'submitted', last_hash = $1, gas_price = $2,
                attempt_count = $3, last_action = NOW()
            WHERE id = $4
            "#,
        )
        .bind(hash_to_db(&hash))
        .bind(gas_price_json)
        .bind(attempt_count as i32)
        .bind(id)
        .execute(&self.pool)
        .await?;

        self.fire_post_commit();
        Ok(())
    }

    async fn record_receipt(&self, receipt: &ReceiptRecord) -> EngineResult<()> {
        let status = if receipt.success {
            PubTxStatus::Succeeded
        } else {
            PubTxStatus::Failed
        };

        let mut db_tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO transaction_receipts
                (tx_id, signing_address, nonce, tx_hash, success, block_number, block_hash)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(receipt.tx_id)
        .bind(addr_to_db(&receipt.signer))
        .bind(receipt.nonce as i64)
        .bind(hash_to_db(&receipt.hash))
        .bind(receipt.success)
        .bind(receipt.block_number as i64)
        .bind(hash_to_db(&receipt.block_hash))
        .execute(&mut *db_tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE public_transactions
            SET status = $1, last_hash = $2, last_action = NOW()
            WHERE id = $3
            "#,
        )
        .bind(status.as_str())
        .bind(hash_to_db(&receipt.hash))
        .bind(receipt.tx_id)
        .execute(&mut *db_tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO completed_nonces (signing_address, nonce, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (signing_address)
            DO UPDATE SET nonce = GREATEST(completed_nonces.nonce, $2), updated_at = NOW()
            "#,
        )
        .bind(addr_to_db(&receipt.signer))
        .bind(receipt.nonce as i64)
        .execute(&mut *db_tx)
        .await?;

        db_tx.commit().await?;

        self.fire_post_commit();
        Ok(())
    }

    async fn reopen_transaction(&self, id: &TxId) -> EngineResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE public_transactions
            SET status = 'submitted', last_action = NOW()
            WHERE id = $1 AND status = 'succeeded'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let existing = self.get_transaction(id).await?;
            return match existing {
                Some(tx) => Err(EngineError::InvalidStatusTransition {
                    from: tx.status.to_string(),
                    to: PubTxStatus::Submitted.to_string(),
                }),
                None => Err(EngineError::TransactionNotFound(*id)),
            };
        }

        self.fire_post_commit();
        Ok(())
    }

    async fn delete_unassigned(&self, id: &TxId) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM public_transactions
            WHERE id = $1 AND status = 'pending' AND nonce IS NULL
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        let deleted = result.rows_affected() > 0;
        if deleted {
            self.fire_post_commit();
        }
        Ok(deleted)
    }

    async fn get_latest_receipt(&self, id: &TxId) -> EngineResult<Option<ReceiptRecord>> {
        let row = sqlx::query(
            r#"
            SELECT tx_id, signing_address, nonce, tx_hash, success, block_number, block_hash
            FROM transaction_receipts
            WHERE tx_id = $1
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok(ReceiptRecord {
                tx_id: r.get("tx_id"),
                signer: parse_addr(&r.get::<String, _>("signing_address"))?,
                nonce: r.get::<i64, _>("nonce") as u64,
                hash: parse_hash(&r.get::<String, _>("tx_hash"))?,
                success: r.get("success"),
                block_number: r.get::<i64, _>("block_number") as u64,
                block_hash: parse_hash(&r.get::<String, _>("block_hash"))?,
            })
        })
        .transpose()
    }

    async fn highest_completed_nonce(&self, signer: Address) -> EngineResult<Option<u64>> {
        let row = sqlx::query(
            r#"
            SELECT GREATEST(
                (SELECT nonce FROM completed_nonces WHERE signing_address = $1),
                (SELECT MAX(nonce) FROM public_transactions
                 WHERE signing_address = $1 AND status IN ('succeeded', 'failed'))
            ) AS nonce
            "#,
        )
        .bind(addr_to_db(&signer))
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get::<Option<i64>, _>("nonce").map(|n| n as u64))
    }

    fn add_post_commit_hook(&self, hook: PostCommitHook) {
        self.post_commit.write().unwrap().push(hook);
    }
}
