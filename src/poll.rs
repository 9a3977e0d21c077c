//! The poll engine: list signatures, filter against the already-seen set,
//! fetch details with rate-limit-aware backoff, and parse.
//!
//! The engine owns the per-signature retry discipline; the facade below it
//! never retries, and the workflow above it only retries whole activities.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::network::Network;
use crate::parser::{ParsedTransaction, parse_transaction};
use crate::rpc::{
    GetTransactionOptions, ListSignaturesOptions, RpcError, RpcErrorKind, SolanaRpc, TxnDetail,
};

/// Tuning knobs for the poll engine.
#[derive(Debug, Clone)]
pub struct PollTuning {
    /// Pause between per-signature detail fetches, to respect upstream
    /// limits. 600 ms keeps one subscription under ~2 RPS.
    pub detail_fetch_delay: Duration,
    /// Attempts per signature before it is skipped until the next cycle.
    pub max_detail_attempts: u32,
}

impl Default for PollTuning {
    fn default() -> Self {
        Self {
            detail_fetch_delay: Duration::from_millis(600),
            max_detail_attempts: 3,
        }
    }
}

/// Polls one account for transactions not yet seen.
pub struct PollEngine {
    rpc: Arc<dyn SolanaRpc>,
    tuning: PollTuning,
}

impl PollEngine {
    pub fn new(rpc: Arc<dyn SolanaRpc>, tuning: PollTuning) -> Self {
        Self { rpc, tuning }
    }

    /// Return the parsed transactions for signatures of `poll_address` that
    /// are not in `prior_sigs`, newest first (the listing order).
    ///
    /// Signatures whose detail fetch or parse fails are skipped and will
    /// reappear on the next cycle. Only the signature listing itself can
    /// fail the whole poll.
    pub async fn poll(
        &self,
        network: Network,
        poll_address: &str,
        prior_sigs: &[String],
        limit: usize,
    ) -> Result<Vec<ParsedTransaction>, RpcError> {
        let options = ListSignaturesOptions {
            limit: Some(limit),
            // The listing is capped at the most recently persisted signature
            // so a quiet account costs a single call.
            until_signature: prior_sigs.first().cloned(),
        };
        let entries = self
            .rpc
            .list_signatures(network, poll_address, options)
            .await?;

        let prior: HashSet<&str> = prior_sigs.iter().map(String::as_str).collect();
        let mut parsed = Vec::new();

        for sig in &entries {
            if prior.contains(sig.signature.as_str()) {
                tracing::debug!(
                    monotonic_counter.poll_signatures_deduplicated = 1,
                    signature = %sig.signature,
                    "signature already persisted"
                );
                continue;
            }

            tokio::time::sleep(self.tuning.detail_fetch_delay).await;

            let Some(detail) = self.fetch_detail(network, &sig.signature).await else {
                tracing::warn!(
                    monotonic_counter.poll_skipped_detail_fetch_failed = 1,
                    signature = %sig.signature,
                    address = poll_address,
                    "skipping signature: detail fetch failed"
                );
                continue;
            };

            match parse_transaction(network, sig, &detail) {
                Ok(txn) => parsed.push(txn),
                Err(error) => {
                    tracing::warn!(
                        monotonic_counter.poll_skipped_parse_failed = 1,
                        signature = %sig.signature,
                        error = %error,
                        "skipping signature: parse failed"
                    );
                }
            }
        }

        Ok(parsed)
    }

    /// Fetch one transaction detail with the class-specific backoff ladder.
    ///
    /// Returns `None` once attempts are exhausted or a fatal error is seen.
    async fn fetch_detail(&self, network: Network, signature: &str) -> Option<TxnDetail> {
        let max_attempts = self.tuning.max_detail_attempts.max(1);
        for attempt in 0..max_attempts {
            let last = attempt + 1 == max_attempts;
            let result = self
                .rpc
                .get_transaction(network, signature, GetTransactionOptions::default())
                .await;
            let error = match result {
                Ok(detail) => return Some(detail),
                Err(error) => error,
            };
            match error.kind() {
                RpcErrorKind::RateLimited => {
                    tracing::debug!(
                        monotonic_counter.poll_rate_limit_hits = 1,
                        signature,
                        attempt,
                        "rate limited fetching transaction detail"
                    );
                    if last {
                        return None;
                    }
                    tokio::time::sleep(Duration::from_secs(2u64 << attempt)).await;
                }
                RpcErrorKind::ParseTransient => {
                    // One immediate retry with the version selector omitted.
                    match self
                        .rpc
                        .get_transaction(network, signature, GetTransactionOptions::legacy())
                        .await
                    {
                        Ok(detail) => return Some(detail),
                        Err(legacy_error) => {
                            tracing::debug!(
                                signature,
                                attempt,
                                error = %legacy_error,
                                "legacy-mode retry failed"
                            );
                            if last {
                                return None;
                            }
                            tokio::time::sleep(Duration::from_secs(1u64 << attempt)).await;
                        }
                    }
                }
                RpcErrorKind::NetworkOrTimeout => {
                    if last {
                        return None;
                    }
                    tokio::time::sleep(Duration::from_secs(1u64 << attempt)).await;
                }
                RpcErrorKind::Fatal => {
                    tracing::warn!(signature, error = %error, "fatal error fetching detail");
                    return None;
                }
            }
        }
        None
    }
}
