//! Durable storage with idempotent writes.
//!
//! The unique index on `transactions.signature` is the cornerstone of the
//! at-most-once persistence guarantee: retried inserts surface as
//! `inserted = false` instead of duplicate rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::network::Network;
use crate::types::{NewTransaction, Subscription, SubscriptionKey, SubscriptionStatus, Transaction};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("amount {0} does not fit the storage column")]
    AmountOutOfRange(u64),
    #[error("stored row is inconsistent: {0}")]
    Corrupt(String),
    #[error("{0} not found")]
    NotFound(&'static str),
}

/// Input for [`Store::upsert_subscription`].
#[derive(Debug, Clone)]
pub struct UpsertSubscription {
    pub key: SubscriptionKey,
    pub poll_interval: Duration,
    pub associated_account: Option<String>,
    pub status: SubscriptionStatus,
}

impl UpsertSubscription {
    pub fn active(
        key: SubscriptionKey,
        poll_interval: Duration,
        associated_account: Option<String>,
    ) -> Self {
        Self {
            key,
            poll_interval,
            associated_account,
            status: SubscriptionStatus::Active,
        }
    }
}

/// Result of [`Store::insert_transaction`]. A duplicate signature yields the
/// already-persisted row with `inserted = false`.
#[derive(Debug, Clone)]
pub struct InsertOutcome {
    pub inserted: bool,
    pub transaction: Transaction,
}

/// Status of a durable workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowRunStatus {
    Running,
    Completed,
    Failed,
}

impl WorkflowRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowRunStatus::Running => "running",
            WorkflowRunStatus::Completed => "completed",
            WorkflowRunStatus::Failed => "failed",
        }
    }
}

impl FromStr for WorkflowRunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(WorkflowRunStatus::Running),
            "completed" => Ok(WorkflowRunStatus::Completed),
            "failed" => Ok(WorkflowRunStatus::Failed),
            other => Err(format!("unknown workflow run status: {other}")),
        }
    }
}

/// A persisted long-running workflow run. Pending runs are resumed on boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub kind: String,
    pub input: serde_json::Value,
    pub status: WorkflowRunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn new(kind: impl Into<String>, input: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            kind: kind.into(),
            input,
            status: WorkflowRunStatus::Running,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The durable storage interface.
///
/// Backed by Postgres in production ([`PostgresStore`]) and by an in-memory
/// map in tests ([`MemoryStore`]).
#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert_subscription(
        &self,
        upsert: UpsertSubscription,
    ) -> Result<Subscription, StoreError>;

    async fn get_subscription(
        &self,
        key: &SubscriptionKey,
    ) -> Result<Option<Subscription>, StoreError>;

    async fn subscription_exists(&self, key: &SubscriptionKey) -> Result<bool, StoreError>;

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, StoreError>;

    /// Idempotent; deleting an absent subscription is a no-op success.
    async fn delete_subscription(&self, key: &SubscriptionKey) -> Result<(), StoreError>;

    async fn update_subscription_last_poll_time(
        &self,
        key: &SubscriptionKey,
        at: DateTime<Utc>,
    ) -> Result<Subscription, StoreError>;

    async fn insert_transaction(&self, txn: NewTransaction) -> Result<InsertOutcome, StoreError>;

    /// The most recently observed signatures for a wallet, newest first.
    async fn list_signatures_by_wallet(
        &self,
        address: &str,
        network: Network,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<String>, StoreError>;

    /// Transactions in `[start, end]` ordered ascending by block time.
    async fn list_transactions_by_time_range(
        &self,
        network: Network,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, StoreError>;

    async fn create_workflow_run(&self, run: &WorkflowRun) -> Result<(), StoreError>;

    async fn update_workflow_run(
        &self,
        id: Uuid,
        status: WorkflowRunStatus,
        result: Option<serde_json::Value>,
    ) -> Result<(), StoreError>;

    /// Heartbeat: bump `updated_at` on a running workflow.
    async fn touch_workflow_run(&self, id: Uuid) -> Result<(), StoreError>;

    async fn get_workflow_run(&self, id: Uuid) -> Result<Option<WorkflowRun>, StoreError>;

    async fn list_workflow_runs_by_status(
        &self,
        status: WorkflowRunStatus,
    ) -> Result<Vec<WorkflowRun>, StoreError>;
}
