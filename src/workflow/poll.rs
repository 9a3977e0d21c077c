//! The recurring poll workflow: load known signatures, poll, persist and
//! publish.
//!
//! Every external effect is an activity with the standard retry policy.
//! Persistence is idempotent by signature, so activity retries cannot
//! double-write; publishing after the insert is best-effort and duplicate
//! events are possible, which is why consumers deduplicate by signature.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use crate::events::EventLog;
use crate::parser::ParsedTransaction;
use crate::poll::PollEngine;
use crate::scheduler::PollRunner;
use crate::store::Store;
use crate::types::{NewTransaction, SubscriptionKey, TransactionEvent};
use crate::workflow::{ActivityError, DEFAULT_ACTIVITY_TIMEOUT, RetryPolicy, run_activity};

/// How many recent signatures feed the dedup filter.
pub const KNOWN_SIGNATURES_LIMIT: usize = 1000;

/// Page size per poll cycle; kept small to bound fan-out under strict
/// upstream rate limits.
pub const DEFAULT_POLL_LIMIT: usize = 20;

/// Result of one poll cycle.
#[derive(Debug, Clone, Default)]
pub struct PollOutcome {
    pub transaction_count: usize,
    pub newest_signature: Option<String>,
    pub oldest_signature: Option<String>,
}

pub struct PollWorkflow {
    store: Arc<dyn Store>,
    events: Arc<dyn EventLog>,
    engine: PollEngine,
    policy: RetryPolicy,
    activity_timeout: Duration,
    poll_limit: usize,
}

impl PollWorkflow {
    pub fn new(store: Arc<dyn Store>, events: Arc<dyn EventLog>, engine: PollEngine) -> Self {
        Self {
            store,
            events,
            engine,
            policy: RetryPolicy::default(),
            activity_timeout: DEFAULT_ACTIVITY_TIMEOUT,
            poll_limit: DEFAULT_POLL_LIMIT,
        }
    }

    pub fn with_poll_limit(mut self, poll_limit: usize) -> Self {
        self.poll_limit = poll_limit;
        self
    }

    /// Run one poll cycle for `key`.
    ///
    /// A missing subscription makes the cycle a no-op: the schedule may
    /// outlive its subscription briefly during unregistration.
    pub async fn run(&self, key: &SubscriptionKey) -> Result<PollOutcome, ActivityError> {
        let subscription = run_activity(
            "load_subscription",
            &self.policy,
            self.activity_timeout,
            || self.store.get_subscription(key),
        )
        .await?;
        let Some(subscription) = subscription else {
            tracing::debug!(key = %key, "no subscription for key; skipping poll");
            return Ok(PollOutcome::default());
        };

        let prior_sigs = run_activity(
            "load_known_sigs",
            &self.policy,
            self.activity_timeout,
            || {
                self.store.list_signatures_by_wallet(
                    &key.address,
                    key.network,
                    None,
                    KNOWN_SIGNATURES_LIMIT,
                )
            },
        )
        .await?;

        let poll_address = subscription.poll_address().to_string();
        let parsed = run_activity("poll", &self.policy, self.activity_timeout, || {
            self.engine
                .poll(key.network, &poll_address, &prior_sigs, self.poll_limit)
        })
        .await?;

        if !parsed.is_empty() {
            let (written, skipped) = run_activity(
                "persist_and_publish",
                &self.policy,
                self.activity_timeout,
                || self.persist_and_publish(key, &parsed),
            )
            .await?;
            tracing::info!(
                key = %key,
                written,
                skipped,
                "poll cycle persisted transactions"
            );
        }

        // Best-effort stamp; a failure here never fails the cycle.
        if let Err(error) = self
            .store
            .update_subscription_last_poll_time(key, Utc::now())
            .await
        {
            tracing::warn!(key = %key, error = %error, "failed to update last poll time");
        }

        Ok(PollOutcome {
            transaction_count: parsed.len(),
            newest_signature: parsed.first().map(|t| t.signature.clone()),
            oldest_signature: parsed.last().map(|t| t.signature.clone()),
        })
    }

    /// Insert each parsed transaction, then publish the newly inserted ones.
    async fn persist_and_publish(
        &self,
        key: &SubscriptionKey,
        parsed: &[ParsedTransaction],
    ) -> Result<(usize, usize), crate::store::StoreError> {
        let mut written = 0;
        let mut skipped = 0;
        for txn in parsed {
            let outcome = self
                .store
                .insert_transaction(NewTransaction {
                    signature: txn.signature.clone(),
                    slot: txn.slot,
                    wallet_address: key.address.clone(),
                    network: txn.network,
                    from_address: txn.from_address.clone(),
                    amount: txn.amount,
                    token_mint: txn.token_mint.clone(),
                    memo: txn.memo.clone(),
                    block_time: txn.block_time,
                    confirmation_status: txn.confirmation_status,
                })
                .await?;
            if !outcome.inserted {
                tracing::debug!(
                    monotonic_counter.transactions_duplicate_skipped = 1,
                    signature = %txn.signature,
                    "transaction already persisted"
                );
                skipped += 1;
                continue;
            }
            written += 1;
            let event = TransactionEvent::new(&outcome.transaction, Utc::now());
            if let Err(error) = self.events.publish(&event).await {
                tracing::warn!(
                    monotonic_counter.events_publish_failures = 1,
                    signature = %txn.signature,
                    error = %error,
                    "failed to publish transaction event"
                );
            }
        }
        Ok((written, skipped))
    }
}

#[async_trait]
impl PollRunner for PollWorkflow {
    async fn run_poll(&self, key: &SubscriptionKey) {
        match self.run(key).await {
            Ok(outcome) if outcome.transaction_count > 0 => {
                tracing::info!(
                    key = %key,
                    count = outcome.transaction_count,
                    newest = outcome.newest_signature.as_deref().unwrap_or(""),
                    "poll found new transactions"
                );
            }
            Ok(_) => {
                tracing::debug!(key = %key, "poll found nothing new");
            }
            Err(error) => {
                tracing::warn!(
                    monotonic_counter.poll_workflow_failures = 1,
                    key = %key,
                    error = %error,
                    "poll workflow failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{MemoryEventLog, SubjectFilter};
    use crate::network::Network;
    use crate::poll::PollTuning;
    use crate::store::{MemoryStore, UpsertSubscription};
    use crate::testing::{MockRpc, checked_detail, confirmed_sig, failed_sig, native_detail, test_pubkey};
    use crate::types::ConfirmationStatus;
    use futures_util::StreamExt;

    struct Fixture {
        store: Arc<MemoryStore>,
        events: Arc<MemoryEventLog>,
        rpc: Arc<MockRpc>,
        workflow: PollWorkflow,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(MemoryEventLog::default());
        let rpc = Arc::new(MockRpc::default());
        let engine = PollEngine::new(rpc.clone(), PollTuning::default());
        let workflow = PollWorkflow::new(store.clone(), events.clone(), engine);
        Fixture {
            store,
            events,
            rpc,
            workflow,
        }
    }

    async fn register_native(fixture: &Fixture, address: &str) -> SubscriptionKey {
        let key = SubscriptionKey::native(address, Network::Mainnet);
        fixture
            .store
            .upsert_subscription(UpsertSubscription::active(
                key.clone(),
                Duration::from_secs(30),
                None,
            ))
            .await
            .unwrap();
        key
    }

    #[tokio::test(start_paused = true)]
    async fn native_transfer_is_ingested_and_published() {
        let fixture = fixture();
        let key = register_native(&fixture, "A1").await;
        let sender = test_pubkey(1);
        fixture
            .rpc
            .push_sig_batch(Ok(vec![confirmed_sig("S1", 100)]));
        fixture
            .rpc
            .push_detail("S1", Ok(native_detail(1_000_000_000, sender)));

        let mut live = fixture
            .events
            .subscribe(SubjectFilter::Address("A1".into()))
            .await
            .unwrap();

        let outcome = fixture.workflow.run(&key).await.unwrap();
        assert_eq!(outcome.transaction_count, 1);
        assert_eq!(outcome.newest_signature.as_deref(), Some("S1"));

        let sigs = fixture
            .store
            .list_signatures_by_wallet("A1", Network::Mainnet, None, 10)
            .await
            .unwrap();
        assert_eq!(sigs, vec!["S1"]);

        let event = live.next().await.unwrap().unwrap();
        assert_eq!(event.signature, "S1");
        assert_eq!(event.amount, 1_000_000_000);
        assert_eq!(event.from_address, Some(sender.to_string()));
        assert_eq!(event.token_mint, None);
        assert_eq!(event.confirmation_status, ConfirmationStatus::Confirmed);

        let sub = fixture.store.get_subscription(&key).await.unwrap().unwrap();
        assert!(sub.last_poll_time.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn second_cycle_deduplicates_known_signatures() {
        let fixture = fixture();
        let key = register_native(&fixture, "A1").await;
        fixture
            .rpc
            .push_sig_batch(Ok(vec![confirmed_sig("S1", 100)]));
        fixture
            .rpc
            .push_detail("S1", Ok(native_detail(5, test_pubkey(2))));
        fixture.workflow.run(&key).await.unwrap();

        // Upstream returns the same signature again.
        fixture
            .rpc
            .push_sig_batch(Ok(vec![confirmed_sig("S1", 100)]));
        let outcome = fixture.workflow.run(&key).await.unwrap();

        assert_eq!(outcome.transaction_count, 0);
        let detail_fetches: Vec<String> = fixture
            .rpc
            .detail_calls()
            .into_iter()
            .map(|(s, _)| s)
            .collect();
        assert_eq!(detail_fetches, vec!["S1"], "S1 fetched exactly once");
    }

    #[tokio::test(start_paused = true)]
    async fn fungible_subscription_polls_the_associated_account() {
        let fixture = fixture();
        let mint = test_pubkey(3);
        let authority = test_pubkey(4);
        let key = SubscriptionKey::fungible_token("A1", Network::Mainnet, mint.to_string());
        fixture
            .store
            .upsert_subscription(UpsertSubscription::active(
                key.clone(),
                Duration::from_secs(30),
                Some("T1".to_string()),
            ))
            .await
            .unwrap();

        fixture
            .rpc
            .push_sig_batch(Ok(vec![confirmed_sig("S2", 101)]));
        fixture
            .rpc
            .push_detail("S2", Ok(checked_detail(1_000_000, mint, authority)));

        let outcome = fixture.workflow.run(&key).await.unwrap();
        assert_eq!(outcome.transaction_count, 1);

        let polled = fixture.rpc.list_calls();
        assert_eq!(polled[0].1, "T1", "token subscriptions poll the token account");

        let txns = fixture
            .store
            .list_transactions_by_time_range(
                Network::Mainnet,
                chrono::DateTime::from_timestamp(0, 0).unwrap(),
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(txns.len(), 1);
        assert_eq!(txns[0].wallet_address, "A1");
        assert_eq!(txns[0].token_mint, Some(mint.to_string()));
        assert_eq!(txns[0].amount, 1_000_000);
        assert_eq!(txns[0].from_address, Some(authority.to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_transactions_are_recorded_without_parsing() {
        let fixture = fixture();
        let key = register_native(&fixture, "A1").await;
        fixture.rpc.push_sig_batch(Ok(vec![failed_sig("S3", 102)]));

        let outcome = fixture.workflow.run(&key).await.unwrap();
        assert_eq!(outcome.transaction_count, 1);

        let txns = fixture
            .store
            .list_transactions_by_time_range(
                Network::Mainnet,
                chrono::DateTime::from_timestamp(0, 0).unwrap(),
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(txns[0].confirmation_status, ConfirmationStatus::Failed);
        assert_eq!(txns[0].amount, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_subscription_is_a_noop() {
        let fixture = fixture();
        let key = SubscriptionKey::native("ghost", Network::Mainnet);
        let outcome = fixture.workflow.run(&key).await.unwrap();
        assert_eq!(outcome.transaction_count, 0);
        assert!(fixture.rpc.list_calls().is_empty());
    }
}
