//! Postgres-backed [`Store`] implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use uuid::Uuid;

use crate::network::Network;
use crate::store::{
    InsertOutcome, Store, StoreError, UpsertSubscription, WorkflowRun, WorkflowRunStatus,
};
use crate::types::{
    ConfirmationStatus, NewTransaction, Subscription, SubscriptionKey, Transaction,
};

const SUBSCRIPTION_COLUMNS: &str = "address, network, asset_kind, token_mint, \
     associated_account, poll_interval_seconds, status, last_poll_time, created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "signature, wallet_address, network, slot, from_address, \
     amount, token_mint, memo, block_time, confirmation_status, created_at";

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect and bring the schema up to date.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    address: String,
    network: String,
    asset_kind: String,
    token_mint: String,
    associated_account: Option<String>,
    poll_interval_seconds: i64,
    status: String,
    last_poll_time: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = StoreError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        let network = row
            .network
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("network {}", row.network)))?;
        let asset_kind = row
            .asset_kind
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("asset_kind {}", row.asset_kind)))?;
        let status = row
            .status
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("status {}", row.status)))?;
        Ok(Subscription {
            key: SubscriptionKey {
                address: row.address,
                network,
                asset_kind,
                token_mint: row.token_mint,
            },
            poll_interval: std::time::Duration::from_secs(row.poll_interval_seconds.max(0) as u64),
            associated_account: row.associated_account,
            status,
            last_poll_time: row.last_poll_time,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TransactionRow {
    signature: String,
    wallet_address: String,
    network: String,
    slot: i64,
    from_address: Option<String>,
    amount: i64,
    token_mint: Option<String>,
    memo: Option<String>,
    block_time: DateTime<Utc>,
    confirmation_status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = StoreError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        let network: Network = row
            .network
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("network {}", row.network)))?;
        let confirmation_status: ConfirmationStatus = row
            .confirmation_status
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("status {}", row.confirmation_status)))?;
        Ok(Transaction {
            signature: row.signature,
            slot: row.slot.max(0) as u64,
            wallet_address: row.wallet_address,
            network,
            from_address: row.from_address,
            amount: row.amount.max(0) as u64,
            token_mint: row.token_mint,
            memo: row.memo,
            block_time: row.block_time,
            created_at: row.created_at,
            confirmation_status,
        })
    }
}

#[derive(sqlx::FromRow)]
struct WorkflowRunRow {
    id: Uuid,
    kind: String,
    input: serde_json::Value,
    status: String,
    result: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<WorkflowRunRow> for WorkflowRun {
    type Error = StoreError;

    fn try_from(row: WorkflowRunRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("workflow status {}", row.status)))?;
        Ok(WorkflowRun {
            id: row.id,
            kind: row.kind,
            input: row.input,
            status,
            result: row.result,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn upsert_subscription(
        &self,
        upsert: UpsertSubscription,
    ) -> Result<Subscription, StoreError> {
        let interval = i64::try_from(upsert.poll_interval.as_secs()).unwrap_or(i64::MAX);
        let sql = format!(
            "INSERT INTO subscriptions \
               (address, network, asset_kind, token_mint, associated_account, \
                poll_interval_seconds, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (address, network, asset_kind, token_mint) DO UPDATE SET \
               poll_interval_seconds = EXCLUDED.poll_interval_seconds, \
               associated_account = EXCLUDED.associated_account, \
               status = EXCLUDED.status, \
               updated_at = now() \
             RETURNING {SUBSCRIPTION_COLUMNS}"
        );
        let row: SubscriptionRow = sqlx::query_as(&sql)
            .bind(&upsert.key.address)
            .bind(upsert.key.network.as_str())
            .bind(upsert.key.asset_kind.as_str())
            .bind(&upsert.key.token_mint)
            .bind(&upsert.associated_account)
            .bind(interval)
            .bind(upsert.status.as_str())
            .fetch_one(&self.pool)
            .await?;
        row.try_into()
    }

    async fn get_subscription(
        &self,
        key: &SubscriptionKey,
    ) -> Result<Option<Subscription>, StoreError> {
        let sql = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE address = $1 AND network = $2 AND asset_kind = $3 AND token_mint = $4"
        );
        let row: Option<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(&key.address)
            .bind(key.network.as_str())
            .bind(key.asset_kind.as_str())
            .bind(&key.token_mint)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn subscription_exists(&self, key: &SubscriptionKey) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM subscriptions \
             WHERE address = $1 AND network = $2 AND asset_kind = $3 AND token_mint = $4)",
        )
        .bind(&key.address)
        .bind(key.network.as_str())
        .bind(key.asset_kind.as_str())
        .bind(&key.token_mint)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, StoreError> {
        let sql = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions ORDER BY created_at"
        );
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn delete_subscription(&self, key: &SubscriptionKey) -> Result<(), StoreError> {
        sqlx::query(
            "DELETE FROM subscriptions \
             WHERE address = $1 AND network = $2 AND asset_kind = $3 AND token_mint = $4",
        )
        .bind(&key.address)
        .bind(key.network.as_str())
        .bind(key.asset_kind.as_str())
        .bind(&key.token_mint)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_subscription_last_poll_time(
        &self,
        key: &SubscriptionKey,
        at: DateTime<Utc>,
    ) -> Result<Subscription, StoreError> {
        let sql = format!(
            "UPDATE subscriptions SET last_poll_time = $5, updated_at = now() \
             WHERE address = $1 AND network = $2 AND asset_kind = $3 AND token_mint = $4 \
             RETURNING {SUBSCRIPTION_COLUMNS}"
        );
        let row: Option<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(&key.address)
            .bind(key.network.as_str())
            .bind(key.asset_kind.as_str())
            .bind(&key.token_mint)
            .bind(at)
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or(StoreError::NotFound("subscription"))?.try_into()
    }

    async fn insert_transaction(&self, txn: NewTransaction) -> Result<InsertOutcome, StoreError> {
        let amount =
            i64::try_from(txn.amount).map_err(|_| StoreError::AmountOutOfRange(txn.amount))?;
        let slot = i64::try_from(txn.slot).unwrap_or(i64::MAX);
        let sql = format!(
            "INSERT INTO transactions \
               (signature, wallet_address, network, slot, from_address, amount, \
                token_mint, memo, block_time, confirmation_status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, COALESCE($9, now()), $10) \
             RETURNING {TRANSACTION_COLUMNS}"
        );
        let inserted: Result<TransactionRow, sqlx::Error> = sqlx::query_as(&sql)
            .bind(&txn.signature)
            .bind(&txn.wallet_address)
            .bind(txn.network.as_str())
            .bind(slot)
            .bind(&txn.from_address)
            .bind(amount)
            .bind(&txn.token_mint)
            .bind(&txn.memo)
            .bind(txn.block_time)
            .bind(txn.confirmation_status.as_str())
            .fetch_one(&self.pool)
            .await;

        match inserted {
            Ok(row) => Ok(InsertOutcome {
                inserted: true,
                transaction: row.try_into()?,
            }),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                // Expected duplicate: surface the persisted row unchanged.
                let sql = format!(
                    "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE signature = $1"
                );
                let row: TransactionRow = sqlx::query_as(&sql)
                    .bind(&txn.signature)
                    .fetch_one(&self.pool)
                    .await?;
                Ok(InsertOutcome {
                    inserted: false,
                    transaction: row.try_into()?,
                })
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn list_signatures_by_wallet(
        &self,
        address: &str,
        network: Network,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let signatures: Vec<String> = sqlx::query_scalar(
            "SELECT signature FROM transactions \
             WHERE wallet_address = $1 AND network = $2 \
               AND ($3::timestamptz IS NULL OR block_time >= $3) \
             ORDER BY block_time DESC, created_at DESC \
             LIMIT $4",
        )
        .bind(address)
        .bind(network.as_str())
        .bind(since)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(signatures)
    }

    async fn list_transactions_by_time_range(
        &self,
        network: Network,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, StoreError> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions \
             WHERE network = $1 AND block_time >= $2 AND block_time <= $3 \
             ORDER BY block_time ASC, created_at ASC"
        );
        let rows: Vec<TransactionRow> = sqlx::query_as(&sql)
            .bind(network.as_str())
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn create_workflow_run(&self, run: &WorkflowRun) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO workflow_runs (id, kind, input, status, result, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(run.id)
        .bind(&run.kind)
        .bind(&run.input)
        .bind(run.status.as_str())
        .bind(&run.result)
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_workflow_run(
        &self,
        id: Uuid,
        status: WorkflowRunStatus,
        result: Option<serde_json::Value>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE workflow_runs SET status = $2, result = $3, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(result)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch_workflow_run(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE workflow_runs SET updated_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_workflow_run(&self, id: Uuid) -> Result<Option<WorkflowRun>, StoreError> {
        let row: Option<WorkflowRunRow> = sqlx::query_as(
            "SELECT id, kind, input, status, result, created_at, updated_at \
             FROM workflow_runs WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list_workflow_runs_by_status(
        &self,
        status: WorkflowRunStatus,
    ) -> Result<Vec<WorkflowRun>, StoreError> {
        let rows: Vec<WorkflowRunRow> = sqlx::query_as(
            "SELECT id, kind, input, status, result, created_at, updated_at \
             FROM workflow_runs WHERE status = $1 ORDER BY created_at",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }
}
