//! RPC facade over a pool of Solana endpoints.
//!
//! The facade exposes exactly two operations, [`SolanaRpc::list_signatures`]
//! and [`SolanaRpc::get_transaction`], picks an endpoint uniformly at random
//! per call, and classifies failures so the poll engine can choose a backoff.
//! It never retries on its own.
//!
//! Wire decoding happens here: transaction payloads are decoded out of their
//! base64 envelope and compiled instructions are resolved against the static
//! account keys, so everything downstream is independent of the RPC wire
//! format.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use solana_client::client_error::{ClientError, ClientErrorKind};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_client::GetConfirmedSignaturesForAddress2Config;
use solana_client::rpc_config::RpcTransactionConfig;
use solana_client::rpc_request::RpcError as RpcResponseError;
use solana_commitment_config::CommitmentConfig;
use solana_pubkey::Pubkey;
use solana_signature::Signature;
use solana_transaction_status_client_types::UiTransactionEncoding;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::network::Network;

/// Default per-call RPC timeout.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(60);

/// Default and maximum page sizes for signature listing.
pub const DEFAULT_SIGNATURE_LIMIT: usize = 100;
pub const MAX_SIGNATURE_LIMIT: usize = 1000;

/// A signature listing entry, as reported by `getSignaturesForAddress`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigInfo {
    pub signature: String,
    pub slot: u64,
    /// The ledger error object, rendered to text. `None` means success.
    pub err: Option<String>,
    pub memo: Option<String>,
    pub block_time: Option<DateTime<Utc>>,
}

impl SigInfo {
    pub fn is_failed(&self) -> bool {
        self.err.is_some()
    }
}

/// One resolved instruction of a fetched transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawInstruction {
    pub program_id: Pubkey,
    pub accounts: Vec<Pubkey>,
    pub data: Vec<u8>,
}

/// A fetched transaction with its instruction stream resolved.
#[derive(Debug, Clone, Default)]
pub struct TxnDetail {
    pub slot: u64,
    pub block_time: Option<DateTime<Utc>>,
    pub err: Option<String>,
    pub instructions: Vec<RawInstruction>,
}

/// Options for [`SolanaRpc::list_signatures`].
#[derive(Debug, Clone, Default)]
pub struct ListSignaturesOptions {
    /// Page size; defaults to [`DEFAULT_SIGNATURE_LIMIT`], clamped to
    /// [`MAX_SIGNATURE_LIMIT`].
    pub limit: Option<usize>,
    /// Only return entries newer than this signature.
    pub until_signature: Option<String>,
}

impl ListSignaturesOptions {
    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_SIGNATURE_LIMIT)
            .min(MAX_SIGNATURE_LIMIT)
    }
}

/// Options for [`SolanaRpc::get_transaction`].
#[derive(Debug, Clone)]
pub struct GetTransactionOptions {
    /// Maximum transaction version the caller can decode. `None` requests
    /// the legacy wire format with the version selector omitted.
    pub max_supported_version: Option<u8>,
}

impl Default for GetTransactionOptions {
    fn default() -> Self {
        Self {
            max_supported_version: Some(0),
        }
    }
}

impl GetTransactionOptions {
    /// The retry variant used after a [`RpcErrorKind::ParseTransient`]
    /// failure: the version selector is omitted entirely.
    pub fn legacy() -> Self {
        Self {
            max_supported_version: None,
        }
    }
}

/// Failure classification for facade calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcErrorKind {
    /// 429-equivalent response; back off exponentially.
    RateLimited,
    /// The response decoder complained about a version field; retry once in
    /// legacy mode.
    ParseTransient,
    /// Connectivity problem or deadline; retry with backoff.
    NetworkOrTimeout,
    /// Everything else; not retried.
    Fatal,
}

impl Display for RpcErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RpcErrorKind::RateLimited => "rate_limited",
            RpcErrorKind::ParseTransient => "parse_transient",
            RpcErrorKind::NetworkOrTimeout => "network_or_timeout",
            RpcErrorKind::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("no RPC endpoints configured for {0}")]
    EmptyPool(Network),
    #[error("invalid {what}: {value}")]
    InvalidInput { what: &'static str, value: String },
    #[error("rpc call via {endpoint} failed ({kind}): {message}")]
    Call {
        kind: RpcErrorKind,
        endpoint: String,
        message: String,
    },
    #[error("could not decode transaction payload from {endpoint}")]
    Decode { endpoint: String },
}

impl RpcError {
    pub fn kind(&self) -> RpcErrorKind {
        match self {
            RpcError::EmptyPool(_) | RpcError::InvalidInput { .. } => RpcErrorKind::Fatal,
            RpcError::Call { kind, .. } => *kind,
            RpcError::Decode { .. } => RpcErrorKind::ParseTransient,
        }
    }
}

/// The two ledger read operations the rest of the service depends on.
#[async_trait]
pub trait SolanaRpc: Send + Sync {
    async fn list_signatures(
        &self,
        network: Network,
        address: &str,
        options: ListSignaturesOptions,
    ) -> Result<Vec<SigInfo>, RpcError>;

    async fn get_transaction(
        &self,
        network: Network,
        signature: &str,
        options: GetTransactionOptions,
    ) -> Result<TxnDetail, RpcError>;
}

/// Derive a stable short label for an endpoint URL, for metrics.
///
/// Well-known providers map to their names; anything else falls back to the
/// host.
pub fn endpoint_label(url: &Url) -> String {
    let host = url.host_str().unwrap_or("unknown");
    match host {
        "api.mainnet-beta.solana.com" => "solana-mainnet".to_string(),
        "api.devnet.solana.com" => "solana-devnet".to_string(),
        _ if host.contains("helius") => "helius".to_string(),
        _ if host.contains("quicknode") => "quicknode".to_string(),
        _ if host.contains("alchemy") => "alchemy".to_string(),
        _ if host.contains("ankr") => "ankr".to_string(),
        _ if host.contains("rpcpool") || host.contains("triton") => "triton".to_string(),
        _ => host.to_string(),
    }
}

struct Endpoint {
    label: String,
    client: Arc<RpcClient>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint").field("label", &self.label).finish()
    }
}

impl Endpoint {
    fn new(url: &Url, timeout: Duration) -> Self {
        Self {
            label: endpoint_label(url),
            client: Arc::new(RpcClient::new_with_timeout(url.to_string(), timeout)),
        }
    }
}

/// An endpoint pool implementing [`SolanaRpc`] over real upstream nodes.
///
/// The pool is read-only after construction; random selection requires no
/// coordination between callers.
pub struct RpcPool {
    mainnet: Vec<Endpoint>,
    devnet: Vec<Endpoint>,
}

impl RpcPool {
    pub fn new(mainnet: &[Url], devnet: &[Url], timeout: Duration) -> Self {
        Self {
            mainnet: mainnet.iter().map(|u| Endpoint::new(u, timeout)).collect(),
            devnet: devnet.iter().map(|u| Endpoint::new(u, timeout)).collect(),
        }
    }

    fn pick(&self, network: Network) -> Result<&Endpoint, RpcError> {
        let pool = match network {
            Network::Mainnet => &self.mainnet,
            Network::Devnet => &self.devnet,
        };
        if pool.is_empty() {
            return Err(RpcError::EmptyPool(network));
        }
        let index = rand::rng().random_range(0..pool.len());
        Ok(&pool[index])
    }
}

/// Classify an upstream client error into a retry class.
fn classify(error: &ClientError) -> RpcErrorKind {
    match &*error.kind {
        ClientErrorKind::Reqwest(e) => {
            if e.status().map(|s| s.as_u16()) == Some(429) {
                RpcErrorKind::RateLimited
            } else {
                RpcErrorKind::NetworkOrTimeout
            }
        }
        ClientErrorKind::Io(_) => RpcErrorKind::NetworkOrTimeout,
        ClientErrorKind::RpcError(RpcResponseError::RpcResponseError { code, message, .. }) => {
            // -32015: transaction version not supported by the requesting client
            if *code == -32015 || message.contains("not supported by the requesting client") {
                RpcErrorKind::ParseTransient
            } else if *code == 429 || message.contains("Too many requests") {
                RpcErrorKind::RateLimited
            } else {
                RpcErrorKind::Fatal
            }
        }
        ClientErrorKind::SerdeJson(_) => RpcErrorKind::ParseTransient,
        _ => {
            let message = error.to_string();
            if message.contains("429") || message.contains("Too many requests") {
                RpcErrorKind::RateLimited
            } else {
                RpcErrorKind::Fatal
            }
        }
    }
}

fn call_error(endpoint: &str, error: ClientError) -> RpcError {
    RpcError::Call {
        kind: classify(&error),
        endpoint: endpoint.to_string(),
        message: error.to_string(),
    }
}

fn parse_pubkey(address: &str) -> Result<Pubkey, RpcError> {
    Pubkey::from_str(address).map_err(|_| RpcError::InvalidInput {
        what: "address",
        value: address.to_string(),
    })
}

fn parse_signature(signature: &str) -> Result<Signature, RpcError> {
    Signature::from_str(signature).map_err(|_| RpcError::InvalidInput {
        what: "signature",
        value: signature.to_string(),
    })
}

fn block_time_from_unix(seconds: Option<i64>) -> Option<DateTime<Utc>> {
    seconds.and_then(|s| DateTime::from_timestamp(s, 0))
}

#[async_trait]
impl SolanaRpc for RpcPool {
    async fn list_signatures(
        &self,
        network: Network,
        address: &str,
        options: ListSignaturesOptions,
    ) -> Result<Vec<SigInfo>, RpcError> {
        let endpoint = self.pick(network)?;
        let pubkey = parse_pubkey(address)?;
        let until = options
            .until_signature
            .as_deref()
            .map(parse_signature)
            .transpose()?;
        let config = GetConfirmedSignaturesForAddress2Config {
            before: None,
            until,
            limit: Some(options.effective_limit()),
            commitment: Some(CommitmentConfig::confirmed()),
        };
        let result = endpoint
            .client
            .get_signatures_for_address_with_config(&pubkey, config)
            .await;
        match result {
            Ok(entries) => {
                tracing::debug!(
                    monotonic_counter.rpc_list_signatures_total = 1,
                    endpoint = %endpoint.label,
                    network = %network,
                    signatures = entries.len(),
                    "listed signatures"
                );
                Ok(entries
                    .into_iter()
                    .map(|entry| SigInfo {
                        signature: entry.signature,
                        slot: entry.slot,
                        err: entry.err.map(|e| format!("{e:?}")),
                        memo: entry.memo,
                        block_time: block_time_from_unix(entry.block_time),
                    })
                    .collect())
            }
            Err(error) => {
                let error = call_error(&endpoint.label, error);
                tracing::debug!(
                    monotonic_counter.rpc_list_signatures_errors_total = 1,
                    endpoint = %endpoint.label,
                    network = %network,
                    kind = %error.kind(),
                    "list signatures failed"
                );
                Err(error)
            }
        }
    }

    async fn get_transaction(
        &self,
        network: Network,
        signature: &str,
        options: GetTransactionOptions,
    ) -> Result<TxnDetail, RpcError> {
        let endpoint = self.pick(network)?;
        let signature = parse_signature(signature)?;
        let config = RpcTransactionConfig {
            encoding: Some(UiTransactionEncoding::Base64),
            commitment: Some(CommitmentConfig::confirmed()),
            max_supported_transaction_version: options.max_supported_version,
        };
        let confirmed = endpoint
            .client
            .get_transaction_with_config(&signature, config)
            .await
            .map_err(|error| {
                let error = call_error(&endpoint.label, error);
                tracing::debug!(
                    monotonic_counter.rpc_get_transaction_errors_total = 1,
                    endpoint = %endpoint.label,
                    network = %network,
                    kind = %error.kind(),
                    "get transaction failed"
                );
                error
            })?;

        let err = confirmed
            .transaction
            .meta
            .as_ref()
            .and_then(|meta| meta.err.as_ref())
            .map(|e| format!("{e:?}"));
        let decoded = confirmed
            .transaction
            .transaction
            .decode()
            .ok_or_else(|| RpcError::Decode {
                endpoint: endpoint.label.clone(),
            })?;
        let keys = decoded.message.static_account_keys();
        let instructions = decoded
            .message
            .instructions()
            .iter()
            .filter_map(|instruction| {
                // Programs resolved through address table lookups are not
                // among the recognized set, so unresolvable ids are dropped.
                let program_id = *keys.get(instruction.program_id_index as usize)?;
                Some(RawInstruction {
                    program_id,
                    accounts: instruction
                        .accounts
                        .iter()
                        .filter_map(|&index| keys.get(index as usize).copied())
                        .collect(),
                    data: instruction.data.clone(),
                })
            })
            .collect();

        tracing::debug!(
            monotonic_counter.rpc_get_transaction_total = 1,
            endpoint = %endpoint.label,
            network = %network,
            "fetched transaction"
        );
        Ok(TxnDetail {
            slot: confirmed.slot,
            block_time: block_time_from_unix(confirmed.block_time),
            err,
            instructions,
        })
    }
}
