//! HTTP endpoints of the watch service.
//!
//! Subscription CRUD plus the payment-gated registration flow. When a
//! registration fee is configured, a new subscription request is answered
//! with `402 Payment Required` and an invoice; the subscription is committed
//! by the registration workflow once the payment lands.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

use crate::admin::{AdminError, AdminService, RegistrationRequest};
use crate::config::{RegistrationFees, StreamSettings};
use crate::events::{EventLog, EventLogError};
use crate::network::{AssetKind, Network};
use crate::sse;
use crate::store::{Store, StoreError, WorkflowRunStatus};
use crate::types::{Subscription, SubscriptionKey, duration_string};
use crate::workflow::registration::{
    MAX_PAYMENT_TIMEOUT, PaymentSpec, RegistrationError, RegistrationInput, RegistrationWorkflow,
};

/// Shared state for all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub events: Arc<dyn EventLog>,
    pub admin: Arc<AdminService>,
    pub registration: Arc<RegistrationWorkflow>,
    pub fees: Option<RegistrationFees>,
    pub stream: StreamSettings,
    /// Payment-gated registrations awaiting their payment, by key.
    pub pending: Arc<DashMap<SubscriptionKey, Uuid>>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(get_root))
        .route("/health", get(get_health))
        .route("/api/v1/subscriptions", post(create_subscription))
        .route("/api/v1/subscriptions", get(list_subscriptions))
        .route(
            "/api/v1/subscriptions/{address}",
            get(get_subscriptions_for_address),
        )
        .route("/api/v1/subscriptions/{address}", delete(delete_subscription))
        .route("/api/v1/workflows/{id}", get(get_workflow_run))
        .route("/api/v1/stream/transactions", get(sse::stream_all))
        .route(
            "/api/v1/stream/transactions/{address}",
            get(sse::stream_address),
        )
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict {
        message: String,
        workflow_id: Option<Uuid>,
    },
    Internal(String),
}

impl ApiError {
    pub fn bad_request(message: impl ToString) -> Self {
        ApiError::BadRequest(message.to_string())
    }

    pub fn not_found(message: impl ToString) -> Self {
        ApiError::NotFound(message.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(what) => ApiError::NotFound(what.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<EventLogError> for ApiError {
    fn from(error: EventLogError) -> Self {
        ApiError::Internal(error.to_string())
    }
}

impl From<RegistrationError> for ApiError {
    fn from(error: RegistrationError) -> Self {
        ApiError::Internal(error.to_string())
    }
}

impl From<AdminError> for ApiError {
    fn from(error: AdminError) -> Self {
        match error {
            AdminError::InvalidKey(e) => ApiError::BadRequest(e.to_string()),
            AdminError::IntervalTooShort(_) | AdminError::UnparseableKeyPart(_) => {
                ApiError::BadRequest(error.to_string())
            }
            AdminError::Store(e) => ApiError::from(e),
            AdminError::Schedule { .. } => ApiError::Internal(error.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, json!({ "error": message }))
            }
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, json!({ "error": message })),
            ApiError::Conflict {
                message,
                workflow_id,
            } => (
                StatusCode::CONFLICT,
                json!({ "error": message, "workflow_id": workflow_id }),
            ),
            ApiError::Internal(message) => {
                tracing::error!(error = %message, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "internal error" }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

/// `GET /`: greeting.
#[instrument(skip_all)]
pub async fn get_root() -> impl IntoResponse {
    let pkg_name = env!("CARGO_PKG_NAME");
    (StatusCode::OK, format!("Hello from {pkg_name}!"))
}

/// `GET /health`: liveness probe.
#[instrument(skip_all)]
pub async fn get_health(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let subscriptions = state.store.list_subscriptions().await?;
    Ok(Json(json!({
        "status": "ok",
        "subscriptions": subscriptions.len(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct AssetSpec {
    #[serde(rename = "type")]
    pub kind: AssetKind,
    #[serde(default)]
    pub token_mint: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateSubscriptionBody {
    pub address: String,
    pub network: Network,
    pub asset: AssetSpec,
    #[serde(with = "duration_string")]
    pub poll_interval: Duration,
    /// Optional override; derived from address + mint when omitted.
    #[serde(default)]
    pub associated_account: Option<String>,
}

/// `POST /api/v1/subscriptions`.
///
/// Without a configured fee the subscription is registered directly (201).
/// With one, a new key gets an invoice and a workflow id back (402) and the
/// subscription appears once the payment is observed; re-registering an
/// existing key updates it in place without a second fee.
#[instrument(skip_all, fields(address = %body.address, network = %body.network))]
pub async fn create_subscription(
    State(state): State<AppState>,
    Json(body): Json<CreateSubscriptionBody>,
) -> Result<Response, ApiError> {
    let key = SubscriptionKey {
        address: body.address,
        network: body.network,
        asset_kind: body.asset.kind,
        token_mint: body.asset.token_mint.unwrap_or_default(),
    };
    key.validate().map_err(ApiError::bad_request)?;
    let request = RegistrationRequest {
        key: key.clone(),
        poll_interval: body.poll_interval,
        associated_account: body.associated_account,
    };

    let gate = state
        .fees
        .as_ref()
        .and_then(|fees| fees.service_address(key.network).map(|a| (fees, a.to_string())));
    if let Some((fees, service_address)) = gate {
        if !state.store.subscription_exists(&key).await? {
            return payment_gated_registration(&state, fees, service_address, request).await;
        }
    }

    let subscription = state.admin.register(&request).await?;
    Ok((StatusCode::CREATED, Json(subscription)).into_response())
}

async fn payment_gated_registration(
    state: &AppState,
    fees: &RegistrationFees,
    service_address: String,
    request: RegistrationRequest,
) -> Result<Response, ApiError> {
    let key = request.key.clone();
    if let Some(entry) = state.pending.get(&key) {
        let workflow_id = *entry.value();
        drop(entry);
        match state.store.get_workflow_run(workflow_id).await? {
            Some(run) if run.status == WorkflowRunStatus::Running => {
                return Err(ApiError::Conflict {
                    message: "a registration for this key is already awaiting payment".to_string(),
                    workflow_id: Some(workflow_id),
                });
            }
            // The earlier attempt finished (or vanished); start fresh.
            _ => {
                state.pending.remove(&key);
            }
        }
    }

    let memo = format!("{}inv-{}", fees.memo_prefix, Uuid::now_v7().simple());
    let timeout = fees.timeout.min(MAX_PAYMENT_TIMEOUT);
    let input = RegistrationInput {
        subscription: request,
        payment: PaymentSpec {
            service_address: service_address.clone(),
            service_network: key.network,
            required_amount: fees.amount,
            required_memo: memo.clone(),
            timeout,
        },
    };
    let workflow_id = state.registration.clone().start(input).await?;
    state.pending.insert(key.clone(), workflow_id);

    tracing::info!(key = %key, workflow = %workflow_id, "issued registration invoice");
    Ok((
        StatusCode::PAYMENT_REQUIRED,
        Json(json!({
            "workflow_id": workflow_id,
            "invoice": {
                "amount": fees.amount,
                "memo": memo,
                "service_address": service_address,
                "network": key.network,
                "timeout": humantime::format_duration(timeout).to_string(),
            }
        })),
    )
        .into_response())
}

/// `GET /api/v1/subscriptions`.
#[instrument(skip_all)]
pub async fn list_subscriptions(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let subscriptions = state.store.list_subscriptions().await?;
    Ok(Json(subscriptions))
}

/// `GET /api/v1/subscriptions/{address}`: every subscription for one
/// address, across networks and asset kinds.
#[instrument(skip_all, fields(address = %address))]
pub async fn get_subscriptions_for_address(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<Vec<Subscription>>, ApiError> {
    let subscriptions: Vec<_> = state
        .store
        .list_subscriptions()
        .await?
        .into_iter()
        .filter(|s| s.key.address == address)
        .collect();
    if subscriptions.is_empty() {
        return Err(ApiError::not_found(format!(
            "no subscriptions for {address}"
        )));
    }
    Ok(Json(subscriptions))
}

#[derive(Debug, Deserialize)]
pub struct DeleteParams {
    pub network: Option<Network>,
    pub asset_type: Option<AssetKind>,
    pub token_mint: Option<String>,
}

/// `DELETE /api/v1/subscriptions/{address}`.
#[instrument(skip_all, fields(address = %address))]
pub async fn delete_subscription(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Query(params): Query<DeleteParams>,
) -> Result<StatusCode, ApiError> {
    let key = SubscriptionKey {
        address,
        network: params.network.unwrap_or(Network::Mainnet),
        asset_kind: params.asset_type.unwrap_or(AssetKind::Native),
        token_mint: params.token_mint.unwrap_or_default(),
    };
    state.admin.unregister(&key).await?;
    state.pending.remove(&key);
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/v1/workflows/{id}`: inspect a registration run.
#[instrument(skip_all, fields(id = %id))]
pub async fn get_workflow_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state
        .store
        .get_workflow_run(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("workflow {id}")))?;
    Ok(Json(run))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awaiter::TransactionAwaiter;
    use crate::events::MemoryEventLog;
    use crate::scheduler::{PollRunner, Scheduler, Schedules};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tokio_util::sync::CancellationToken;

    struct NoopRunner;

    #[async_trait]
    impl PollRunner for NoopRunner {
        async fn run_poll(&self, _key: &SubscriptionKey) {}
    }

    fn state(fees: Option<RegistrationFees>) -> (AppState, Arc<Scheduler>) {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let events = Arc::new(MemoryEventLog::default());
        let scheduler = Arc::new(Scheduler::new(
            Arc::new(NoopRunner),
            CancellationToken::new(),
        ));
        let admin = Arc::new(AdminService::new(store.clone(), scheduler.clone()));
        let awaiter = Arc::new(TransactionAwaiter::new(store.clone(), events.clone()));
        let registration = Arc::new(RegistrationWorkflow::new(
            store.clone(),
            admin.clone(),
            awaiter,
        ));
        let state = AppState {
            store,
            events,
            admin,
            registration,
            fees,
            stream: StreamSettings::default(),
            pending: Arc::new(DashMap::new()),
        };
        (state, scheduler)
    }

    fn fees() -> RegistrationFees {
        RegistrationFees {
            amount: 1_000_000,
            memo_prefix: "forohtoo-reg:".to_string(),
            timeout: Duration::from_secs(300),
            service_addresses: HashMap::from([(Network::Mainnet, "SVC".to_string())]),
        }
    }

    fn native_body(address: &str) -> CreateSubscriptionBody {
        CreateSubscriptionBody {
            address: address.to_string(),
            network: Network::Mainnet,
            asset: AssetSpec {
                kind: AssetKind::Native,
                token_mint: None,
            },
            poll_interval: Duration::from_secs(30),
            associated_account: None,
        }
    }

    #[tokio::test]
    async fn ungated_registration_returns_201() {
        let (state, scheduler) = state(None);
        let response = create_subscription(State(state.clone()), Json(native_body("A1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let key = SubscriptionKey::native("A1", Network::Mainnet);
        assert!(state.store.subscription_exists(&key).await.unwrap());
        assert!(scheduler.describe(&key).is_some());
    }

    #[tokio::test]
    async fn gated_registration_returns_402_then_409_while_pending() {
        let (state, _scheduler) = state(Some(fees()));
        let response = create_subscription(State(state.clone()), Json(native_body("A1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);

        let key = SubscriptionKey::native("A1", Network::Mainnet);
        assert!(!state.store.subscription_exists(&key).await.unwrap());
        assert!(state.pending.contains_key(&key));

        let second = create_subscription(State(state.clone()), Json(native_body("A1")))
            .await
            .unwrap_err();
        let response = second.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn gated_networks_without_service_address_register_directly() {
        let (state, _scheduler) = state(Some(fees()));
        let mut body = native_body("A1");
        body.network = Network::Devnet;
        let response = create_subscription(State(state.clone()), Json(body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn existing_subscriptions_update_without_a_second_fee() {
        let (state, _scheduler) = state(Some(fees()));
        let key = SubscriptionKey::native("A1", Network::Mainnet);
        state
            .admin
            .register(&RegistrationRequest {
                key: key.clone(),
                poll_interval: Duration::from_secs(30),
                associated_account: None,
            })
            .await
            .unwrap();

        let mut body = native_body("A1");
        body.poll_interval = Duration::from_secs(60);
        let response = create_subscription(State(state.clone()), Json(body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let subscription = state.store.get_subscription(&key).await.unwrap().unwrap();
        assert_eq!(subscription.poll_interval, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn delete_returns_204_and_clears_both_sides() {
        let (state, scheduler) = state(None);
        create_subscription(State(state.clone()), Json(native_body("A1")))
            .await
            .unwrap();

        let status = delete_subscription(
            State(state.clone()),
            Path("A1".to_string()),
            Query(DeleteParams {
                network: Some(Network::Mainnet),
                asset_type: Some(AssetKind::Native),
                token_mint: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);

        let key = SubscriptionKey::native("A1", Network::Mainnet);
        assert!(!state.store.subscription_exists(&key).await.unwrap());
        assert!(scheduler.describe(&key).is_none());
    }

    #[tokio::test]
    async fn unknown_address_lookup_is_404() {
        let (state, _scheduler) = state(None);
        let error = get_subscriptions_for_address(State(state), Path("ghost".to_string()))
            .await
            .unwrap_err();
        assert_eq!(error.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_key_is_rejected_with_400() {
        let (state, _scheduler) = state(None);
        let mut body = native_body("A1");
        body.asset.token_mint = Some("M".to_string());
        let error = create_subscription(State(state), Json(body)).await.unwrap_err();
        assert_eq!(error.into_response().status(), StatusCode::BAD_REQUEST);
    }
}
