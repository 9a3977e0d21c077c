//! Block until a transaction on an address satisfies a predicate, drawing
//! from both the historical window and the live stream.
//!
//! The live subscription is established before the historical scan so no
//! event can fall between the two. Matches are claimed per process so two
//! concurrent callers never resolve on the same transaction; claims are kept
//! for the process lifetime.

use chrono::Utc;
use dashmap::DashMap;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;

use crate::events::{EventLog, EventLogError, SubjectFilter};
use crate::network::Network;
use crate::store::{Store, StoreError};
use crate::types::Transaction;

#[derive(Debug, thiserror::Error)]
pub enum AwaitError {
    #[error("timed out waiting for a matching transaction")]
    Timeout,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Events(#[from] EventLogError),
}

pub struct TransactionAwaiter {
    store: Arc<dyn Store>,
    events: Arc<dyn EventLog>,
    claimed: DashMap<String, ()>,
}

impl TransactionAwaiter {
    pub fn new(store: Arc<dyn Store>, events: Arc<dyn EventLog>) -> Self {
        Self {
            store,
            events,
            claimed: DashMap::new(),
        }
    }

    /// Wait until a transaction attributed to `address` on `network`
    /// satisfies `predicate`, scanning `lookback` of history first.
    pub async fn wait_for_match<P>(
        &self,
        network: Network,
        address: &str,
        lookback: Duration,
        timeout: Duration,
        predicate: P,
    ) -> Result<Transaction, AwaitError>
    where
        P: Fn(&Transaction) -> bool + Send + Sync,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut live = self
            .events
            .subscribe(SubjectFilter::Address(address.to_string()))
            .await?;

        let end = Utc::now();
        let start = end
            - chrono::Duration::from_std(lookback).unwrap_or_else(|_| chrono::Duration::hours(24));
        let history = self
            .store
            .list_transactions_by_time_range(network, start, end)
            .await?;
        for txn in history {
            if txn.wallet_address == address && predicate(&txn) && self.claim(&txn.signature) {
                tracing::debug!(signature = %txn.signature, "matched historical transaction");
                return Ok(txn);
            }
        }

        loop {
            match tokio::time::timeout_at(deadline, live.next()).await {
                Err(_) => return Err(AwaitError::Timeout),
                Ok(None) => {
                    return Err(EventLogError::Stream("live stream closed".to_string()).into());
                }
                Ok(Some(Err(error))) => {
                    tracing::warn!(error = %error, "await subscription hiccup");
                }
                Ok(Some(Ok(event))) => {
                    if event.network != network {
                        continue;
                    }
                    let txn = event.into_transaction();
                    if predicate(&txn) && self.claim(&txn.signature) {
                        tracing::debug!(signature = %txn.signature, "matched live transaction");
                        return Ok(txn);
                    }
                }
            }
        }
    }

    fn claim(&self, signature: &str) -> bool {
        self.claimed.insert(signature.to_string(), ()).is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEventLog;
    use crate::store::MemoryStore;
    use crate::types::{ConfirmationStatus, NewTransaction, TransactionEvent};

    fn awaiter() -> (Arc<MemoryStore>, Arc<MemoryEventLog>, TransactionAwaiter) {
        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(MemoryEventLog::default());
        let awaiter = TransactionAwaiter::new(store.clone(), events.clone());
        (store, events, awaiter)
    }

    fn payment(signature: &str, address: &str, amount: u64, memo: &str, age: Duration) -> NewTransaction {
        NewTransaction {
            signature: signature.to_string(),
            slot: 100,
            wallet_address: address.to_string(),
            network: Network::Mainnet,
            from_address: None,
            amount,
            token_mint: None,
            memo: Some(memo.to_string()),
            block_time: Some(Utc::now() - chrono::Duration::from_std(age).unwrap()),
            confirmation_status: ConfirmationStatus::Confirmed,
        }
    }

    fn matches_invoice(amount: u64, memo: &str) -> impl Fn(&Transaction) -> bool {
        let memo = memo.to_string();
        move |txn| txn.amount >= amount && txn.memo.as_deref() == Some(memo.as_str())
    }

    #[tokio::test(start_paused = true)]
    async fn historical_match_resolves_immediately() {
        let (store, _events, awaiter) = awaiter();
        store
            .insert_transaction(payment(
                "P1",
                "SVC",
                1_000_000,
                "forohtoo-reg:inv-123",
                Duration::from_secs(12 * 3600),
            ))
            .await
            .unwrap();

        let found = awaiter
            .wait_for_match(
                Network::Mainnet,
                "SVC",
                Duration::from_secs(24 * 3600),
                Duration::from_secs(300),
                matches_invoice(1_000_000, "forohtoo-reg:inv-123"),
            )
            .await
            .unwrap();
        assert_eq!(found.signature, "P1");
    }

    #[tokio::test(start_paused = true)]
    async fn live_match_resolves_after_publish() {
        let (store, events, awaiter) = awaiter();
        store
            .insert_transaction(payment(
                "P0",
                "SVC",
                999,
                "wrong-memo",
                Duration::from_secs(3600),
            ))
            .await
            .unwrap();

        let events_for_publish = events.clone();
        let publisher = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            let txn = Transaction {
                signature: "P2".to_string(),
                slot: 101,
                wallet_address: "SVC".to_string(),
                network: Network::Mainnet,
                from_address: None,
                amount: 2_000_000,
                token_mint: None,
                memo: Some("forohtoo-reg:inv-9".to_string()),
                block_time: Utc::now(),
                created_at: Utc::now(),
                confirmation_status: ConfirmationStatus::Confirmed,
            };
            let event = TransactionEvent::new(&txn, Utc::now());
            events_for_publish.publish(&event).await.unwrap();
        });

        let found = awaiter
            .wait_for_match(
                Network::Mainnet,
                "SVC",
                Duration::from_secs(24 * 3600),
                Duration::from_secs(300),
                matches_invoice(1_000_000, "forohtoo-reg:inv-9"),
            )
            .await
            .unwrap();
        assert_eq!(found.signature, "P2");
        publisher.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn no_match_times_out() {
        let (_store, _events, awaiter) = awaiter();
        let err = awaiter
            .wait_for_match(
                Network::Mainnet,
                "SVC",
                Duration::from_secs(24 * 3600),
                Duration::from_secs(300),
                |_| true,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AwaitError::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn a_claimed_match_is_not_returned_twice() {
        let (store, _events, awaiter) = awaiter();
        store
            .insert_transaction(payment(
                "P1",
                "SVC",
                1_000_000,
                "forohtoo-reg:inv-123",
                Duration::from_secs(3600),
            ))
            .await
            .unwrap();

        let first = awaiter
            .wait_for_match(
                Network::Mainnet,
                "SVC",
                Duration::from_secs(24 * 3600),
                Duration::from_secs(5),
                |_| true,
            )
            .await
            .unwrap();
        assert_eq!(first.signature, "P1");

        let second = awaiter
            .wait_for_match(
                Network::Mainnet,
                "SVC",
                Duration::from_secs(24 * 3600),
                Duration::from_secs(5),
                |_| true,
            )
            .await;
        assert!(matches!(second.unwrap_err(), AwaitError::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn lookback_window_excludes_old_payments() {
        let (store, _events, awaiter) = awaiter();
        store
            .insert_transaction(payment(
                "P1",
                "SVC",
                1_000_000,
                "forohtoo-reg:inv-123",
                Duration::from_secs(48 * 3600),
            ))
            .await
            .unwrap();

        let result = awaiter
            .wait_for_match(
                Network::Mainnet,
                "SVC",
                Duration::from_secs(24 * 3600),
                Duration::from_secs(5),
                |_| true,
            )
            .await;
        assert!(matches!(result.unwrap_err(), AwaitError::Timeout));
    }
}
