use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction as SqlTx};
use tracing::info;

use crate::error::LedgerError;
use crate::types::{
    InferenceJob, JobStatus, Model, Transaction, TransactionKind, TransactionStatus, User,
};

/// A unit of work: a scoped database transaction. Every mutation made through
/// it commits together, or the whole unit aborts.
pub struct UnitOfWork<'a> {
    tx: SqlTx<'a, Postgres>,
}

/// Durable wallet balances, transaction journal and inference-job records.
#[derive(Clone)]
pub struct LedgerStore {
    pool: PgPool,
}

impl LedgerStore {
    pub async fn connect(database_url: &str) -> Result<Self, LedgerError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id              BIGSERIAL PRIMARY KEY,
                display_name    TEXT NOT NULL,
                role            TEXT NOT NULL DEFAULT 'user',
                balance         NUMERIC(10,2) NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS models (
                id              BIGSERIAL PRIMARY KEY,
                code_name       TEXT NOT NULL,
                version         TEXT NOT NULL,
                is_active       BOOLEAN NOT NULL DEFAULT false,
                cost            NUMERIC(10,2) NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS inference_jobs (
                id              BIGSERIAL PRIMARY KEY,
                user_id         BIGINT NOT NULL REFERENCES users(id),
                model_id        BIGINT NOT NULL REFERENCES models(id),
                input_data      JSON NOT NULL,
                prediction      JSON,
                errors          JSON,
                status          TEXT NOT NULL DEFAULT 'pending',
                cost            NUMERIC(10,2) NOT NULL,
                created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
                completed_at    TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transactions (
                id              BIGSERIAL PRIMARY KEY,
                user_id         BIGINT NOT NULL REFERENCES users(id),
                amount          NUMERIC(10,2) NOT NULL,
                kind            TEXT NOT NULL,
                status          TEXT NOT NULL DEFAULT 'pending',
                description     TEXT NOT NULL,
                job_id          BIGINT REFERENCES inference_jobs(id),
                created_at      TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_user ON inference_jobs(user_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status ON inference_jobs(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_txn_user ON transactions(user_id)")
            .execute(&self.pool)
            .await?;

        self.seed_default_model().await?;

        Ok(())
    }

    /// Ensures at least one active model exists so a freshly created database
    /// can dispatch a job without a separate seeding step. No-ops once any
    /// model row is present.
    async fn seed_default_model(&self) -> Result<(), LedgerError> {
        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM models")
            .fetch_one(&self.pool)
            .await?;
        if count > 0 {
            return Ok(());
        }
        sqlx::query(
            "INSERT INTO models (code_name, version, is_active, cost) VALUES ($1, $2, true, $3)",
        )
        .bind("default-classifier")
        .bind("1.0.0")
        .bind(Decimal::new(1000, 2))
        .execute(&self.pool)
        .await?;
        info!("seeded default active model");
        Ok(())
    }

    pub async fn begin(&self) -> Result<UnitOfWork<'_>, LedgerError> {
        Ok(UnitOfWork {
            tx: self.pool.begin().await?,
        })
    }

    /// Raw pool access for ops tooling and test fixtures. Core request paths
    /// go through `begin()`/`UnitOfWork` instead, never the pool directly.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn get_active_model(&self) -> Result<Model, LedgerError> {
        sqlx::query_as::<_, Model>(
            "SELECT id, code_name, version, is_active, cost FROM models WHERE is_active = true LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| LedgerError::NotFound("no active model".into()))
    }

    pub async fn get_user(&self, user_id: i64) -> Result<User, LedgerError> {
        sqlx::query_as::<_, User>("SELECT id, display_name, role, balance FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("user {user_id}")))
    }

    pub async fn list_users(&self) -> Result<Vec<User>, LedgerError> {
        Ok(
            sqlx::query_as::<_, User>("SELECT id, display_name, role, balance FROM users ORDER BY id")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn get_job(&self, job_id: i64, owner: Option<i64>) -> Result<InferenceJob, LedgerError> {
        let job = sqlx::query_as::<_, InferenceJob>(
            r#"
            SELECT id, user_id, model_id, input_data, prediction, errors, status, cost,
                   created_at, completed_at
            FROM inference_jobs WHERE id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| LedgerError::NotFound(format!("job {job_id}")))?;

        if let Some(owner) = owner {
            if job.user_id != owner {
                return Err(LedgerError::NotFound(format!("job {job_id}")));
            }
        }
        Ok(job)
    }

    pub async fn list_jobs_for_user(&self, user_id: i64) -> Result<Vec<InferenceJob>, LedgerError> {
        Ok(sqlx::query_as::<_, InferenceJob>(
            r#"
            SELECT id, user_id, model_id, input_data, prediction, errors, status, cost,
                   created_at, completed_at
            FROM inference_jobs WHERE user_id = $1 ORDER BY id DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn list_all_jobs(&self) -> Result<Vec<InferenceJob>, LedgerError> {
        Ok(sqlx::query_as::<_, InferenceJob>(
            r#"
            SELECT id, user_id, model_id, input_data, prediction, errors, status, cost,
                   created_at, completed_at
            FROM inference_jobs ORDER BY id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn get_transaction(&self, tx_id: i64) -> Result<Transaction, LedgerError> {
        sqlx::query_as::<_, Transaction>(
            r#"
            SELECT id, user_id, amount, kind, status, description, job_id, created_at
            FROM transactions WHERE id = $1
            "#,
        )
        .bind(tx_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| LedgerError::NotFound(format!("transaction {tx_id}")))
    }

    pub async fn list_journal_for_user(&self, user_id: i64) -> Result<Vec<Transaction>, LedgerError> {
        Ok(sqlx::query_as::<_, Transaction>(
            r#"
            SELECT id, user_id, amount, kind, status, description, job_id, created_at
            FROM transactions WHERE user_id = $1 ORDER BY id DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// `pending` jobs older than `older_than_minutes`, for the operator-facing
    /// stale-dispatch view (see post-commit publish failure in design notes).
    pub async fn list_stale_pending_jobs(&self, older_than_minutes: i64) -> Result<Vec<InferenceJob>, LedgerError> {
        Ok(sqlx::query_as::<_, InferenceJob>(
            r#"
            SELECT id, user_id, model_id, input_data, prediction, errors, status, cost,
                   created_at, completed_at
            FROM inference_jobs
            WHERE status = 'pending' AND created_at < now() - make_interval(mins => $1)
            ORDER BY created_at ASC
            "#,
        )
        .bind(older_than_minutes as i32)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn list_all_transactions(&self) -> Result<Vec<Transaction>, LedgerError> {
        Ok(sqlx::query_as::<_, Transaction>(
            r#"
            SELECT id, user_id, amount, kind, status, description, job_id, created_at
            FROM transactions ORDER BY id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?)
    }
}

impl<'a> UnitOfWork<'a> {
    /// Applies `balance := balance - amount` only if `balance >= amount`.
    /// A single guarded `UPDATE`; the affected-row count is the compare-and-set result.
    pub async fn conditional_debit(&mut self, user_id: i64, amount: Decimal) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            "UPDATE users SET balance = balance - $1 WHERE id = $2 AND balance >= $1",
        )
        .bind(amount)
        .bind(user_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn unconditional_credit(&mut self, user_id: i64, amount: Decimal) -> Result<(), LedgerError> {
        let result = sqlx::query("UPDATE users SET balance = balance + $1 WHERE id = $2")
            .bind(amount)
            .bind(user_id)
            .execute(&mut *self.tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(format!("user {user_id}")));
        }
        Ok(())
    }

    pub async fn append_journal(
        &mut self,
        user_id: i64,
        amount: Decimal,
        kind: TransactionKind,
        status: TransactionStatus,
        description: impl Into<String>,
        job_id: Option<i64>,
    ) -> Result<Transaction, LedgerError> {
        let row = sqlx::query_as::<_, Transaction>(
            r#"
            INSERT INTO transactions (user_id, amount, kind, status, description, job_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, user_id, amount, kind, status, description, job_id, created_at
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .bind(kind)
        .bind(status)
        .bind(description.into())
        .bind(job_id)
        .bind(Utc::now())
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row)
    }

    pub async fn insert_job(
        &mut self,
        user_id: i64,
        model_id: i64,
        input_data: serde_json::Value,
        cost: Decimal,
    ) -> Result<InferenceJob, LedgerError> {
        let row = sqlx::query_as::<_, InferenceJob>(
            r#"
            INSERT INTO inference_jobs (user_id, model_id, input_data, status, cost, created_at)
            VALUES ($1, $2, $3, 'pending', $4, $5)
            RETURNING id, user_id, model_id, input_data, prediction, errors, status, cost,
                      created_at, completed_at
            "#,
        )
        .bind(user_id)
        .bind(model_id)
        .bind(input_data)
        .bind(cost)
        .bind(Utc::now())
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row)
    }

    /// Fetches a job within the unit, locking its row against concurrent settlement.
    pub async fn get_job_for_update(&mut self, job_id: i64) -> Result<InferenceJob, LedgerError> {
        sqlx::query_as::<_, InferenceJob>(
            r#"
            SELECT id, user_id, model_id, input_data, prediction, errors, status, cost,
                   created_at, completed_at
            FROM inference_jobs WHERE id = $1 FOR UPDATE
            "#,
        )
        .bind(job_id)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| LedgerError::NotFound(format!("job {job_id}")))
    }

    pub async fn update_job_terminal(
        &mut self,
        job_id: i64,
        status: JobStatus,
        prediction: Option<serde_json::Value>,
        errors: Option<serde_json::Value>,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            UPDATE inference_jobs
            SET status = $1, prediction = $2, errors = $3, completed_at = $4
            WHERE id = $5
            "#,
        )
        .bind(status)
        .bind(prediction)
        .bind(errors)
        .bind(Utc::now())
        .bind(job_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    pub async fn get_transaction_for_update(&mut self, tx_id: i64) -> Result<Transaction, LedgerError> {
        sqlx::query_as::<_, Transaction>(
            r#"
            SELECT id, user_id, amount, kind, status, description, job_id, created_at
            FROM transactions WHERE id = $1 FOR UPDATE
            "#,
        )
        .bind(tx_id)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| LedgerError::NotFound(format!("transaction {tx_id}")))
    }

    pub async fn set_transaction_status(
        &mut self,
        tx_id: i64,
        status: TransactionStatus,
    ) -> Result<(), LedgerError> {
        sqlx::query("UPDATE transactions SET status = $1 WHERE id = $2")
            .bind(status)
            .bind(tx_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    pub async fn commit(self) -> Result<(), LedgerError> {
        self.tx.commit().await?;
        info!("unit of work committed");
        Ok(())
    }

    pub async fn abort(self) -> Result<(), LedgerError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
