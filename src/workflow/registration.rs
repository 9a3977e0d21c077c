//! The payment-gated registration workflow: wait for a qualifying payment
//! on the service account, then commit the subscription.
//!
//! Runs are persisted in `workflow_runs` so an interrupted wait survives a
//! process restart; [`RegistrationWorkflow::resume_pending`] re-spawns
//! anything left running. The register step reuses the admin path, which
//! already compensates a schedule failure by deleting the subscription row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::admin::{AdminService, RegistrationRequest};
use crate::awaiter::{AwaitError, TransactionAwaiter};
use crate::network::Network;
use crate::store::{Store, StoreError, WorkflowRun, WorkflowRunStatus};
use crate::types::{Transaction, duration_string};

pub const WORKFLOW_KIND: &str = "payment_gated_registration";

/// How often the waiting activity records a heartbeat.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// How far back the payment scan looks.
pub const PAYMENT_LOOKBACK: Duration = Duration::from_secs(24 * 60 * 60);

pub const DEFAULT_PAYMENT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const MAX_PAYMENT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// What a registration must be paid with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentSpec {
    pub service_address: String,
    pub service_network: Network,
    pub required_amount: u64,
    /// Matched against the transaction memo, case-sensitive and exact.
    pub required_memo: String,
    #[serde(with = "duration_string")]
    pub timeout: Duration,
}

/// Durable input of one registration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationInput {
    pub subscription: RegistrationRequest,
    pub payment: PaymentSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationOutcome {
    pub status: RegistrationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_amount: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registered_at: Option<DateTime<Utc>>,
}

impl RegistrationOutcome {
    fn completed(payment: &Transaction) -> Self {
        Self {
            status: RegistrationStatus::Completed,
            error: None,
            payment_signature: Some(payment.signature.clone()),
            payment_amount: Some(payment.amount),
            registered_at: Some(Utc::now()),
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            status: RegistrationStatus::Failed,
            error: Some(error.into()),
            payment_signature: None,
            payment_amount: None,
            registered_at: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("could not encode workflow input: {0}")]
    Codec(#[from] serde_json::Error),
}

pub struct RegistrationWorkflow {
    store: Arc<dyn Store>,
    admin: Arc<AdminService>,
    awaiter: Arc<TransactionAwaiter>,
}

impl RegistrationWorkflow {
    pub fn new(
        store: Arc<dyn Store>,
        admin: Arc<AdminService>,
        awaiter: Arc<TransactionAwaiter>,
    ) -> Self {
        Self {
            store,
            admin,
            awaiter,
        }
    }

    /// Persist a new run and spawn its execution. Returns the run id
    /// immediately; the caller polls the run for its outcome.
    pub async fn start(
        self: Arc<Self>,
        input: RegistrationInput,
    ) -> Result<Uuid, RegistrationError> {
        let run = WorkflowRun::new(WORKFLOW_KIND, serde_json::to_value(&input)?);
        self.store.create_workflow_run(&run).await?;
        let id = run.id;
        tokio::spawn(async move {
            self.execute(id, input).await;
        });
        tracing::info!(run = %id, "registration workflow started");
        Ok(id)
    }

    /// Re-spawn runs a previous process left running.
    pub async fn resume_pending(self: Arc<Self>) -> Result<usize, StoreError> {
        let runs = self
            .store
            .list_workflow_runs_by_status(WorkflowRunStatus::Running)
            .await?;
        let mut resumed = 0;
        for run in runs.into_iter().filter(|r| r.kind == WORKFLOW_KIND) {
            match serde_json::from_value::<RegistrationInput>(run.input.clone()) {
                Ok(input) => {
                    let workflow = Arc::clone(&self);
                    let id = run.id;
                    tokio::spawn(async move {
                        workflow.execute(id, input).await;
                    });
                    resumed += 1;
                }
                Err(error) => {
                    tracing::error!(run = %run.id, error = %error, "unreadable workflow input");
                    let outcome = RegistrationOutcome::failed(format!("unreadable input: {error}"));
                    let _ = self
                        .store
                        .update_workflow_run(
                            run.id,
                            WorkflowRunStatus::Failed,
                            serde_json::to_value(&outcome).ok(),
                        )
                        .await;
                }
            }
        }
        if resumed > 0 {
            tracing::info!(resumed, "resumed pending registration workflows");
        }
        Ok(resumed)
    }

    /// Execute one run to completion and record its outcome.
    pub async fn execute(&self, id: Uuid, input: RegistrationInput) -> RegistrationOutcome {
        let outcome = self.run(id, &input).await;
        let status = match outcome.status {
            RegistrationStatus::Completed => WorkflowRunStatus::Completed,
            RegistrationStatus::Failed => WorkflowRunStatus::Failed,
        };
        if let Err(error) = self
            .store
            .update_workflow_run(id, status, serde_json::to_value(&outcome).ok())
            .await
        {
            tracing::error!(run = %id, error = %error, "failed to record workflow outcome");
        }
        outcome
    }

    async fn run(&self, id: Uuid, input: &RegistrationInput) -> RegistrationOutcome {
        let payment = match self.await_payment(id, &input.payment).await {
            Ok(payment) => payment,
            Err(AwaitError::Timeout) => {
                tracing::info!(run = %id, "registration payment window expired");
                return RegistrationOutcome::failed("timeout");
            }
            Err(error) => return RegistrationOutcome::failed(error.to_string()),
        };
        tracing::info!(
            run = %id,
            signature = %payment.signature,
            amount = payment.amount,
            "registration payment observed"
        );

        match self.admin.register(&input.subscription).await {
            Ok(_) => RegistrationOutcome::completed(&payment),
            Err(error) => RegistrationOutcome::failed(error.to_string()),
        }
    }

    /// The long-running wait, heartbeating so a supervisor can tell a live
    /// wait from a dead worker.
    async fn await_payment(
        &self,
        id: Uuid,
        spec: &PaymentSpec,
    ) -> Result<Transaction, AwaitError> {
        let required_amount = spec.required_amount;
        let required_memo = spec.required_memo.clone();
        let wait = self.awaiter.wait_for_match(
            spec.service_network,
            &spec.service_address,
            PAYMENT_LOOKBACK,
            spec.timeout,
            move |txn| {
                txn.amount >= required_amount && txn.memo.as_deref() == Some(required_memo.as_str())
            },
        );
        tokio::pin!(wait);
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        loop {
            tokio::select! {
                result = &mut wait => return result,
                _ = heartbeat.tick() => {
                    tracing::debug!(run = %id, "awaiting payment");
                    if let Err(error) = self.store.touch_workflow_run(id).await {
                        tracing::warn!(run = %id, error = %error, "heartbeat update failed");
                    }
                }
            }
        }
    }
}
