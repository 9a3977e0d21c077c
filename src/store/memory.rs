//! In-memory [`Store`] used by unit tests and local experimentation.
//!
//! Mirrors the Postgres semantics, including duplicate-signature handling.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::network::Network;
use crate::store::{
    InsertOutcome, Store, StoreError, UpsertSubscription, WorkflowRun, WorkflowRunStatus,
};
use crate::types::{NewTransaction, Subscription, SubscriptionKey, Transaction};

#[derive(Default)]
pub struct MemoryStore {
    subscriptions: Mutex<HashMap<SubscriptionKey, Subscription>>,
    transactions: Mutex<HashMap<String, Transaction>>,
    workflow_runs: Mutex<HashMap<Uuid, WorkflowRun>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_subscription(
        &self,
        upsert: UpsertSubscription,
    ) -> Result<Subscription, StoreError> {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        let now = Utc::now();
        let subscription = subscriptions
            .entry(upsert.key.clone())
            .and_modify(|existing| {
                existing.poll_interval = upsert.poll_interval;
                existing.associated_account = upsert.associated_account.clone();
                existing.status = upsert.status;
                existing.updated_at = now;
            })
            .or_insert_with(|| Subscription {
                key: upsert.key.clone(),
                poll_interval: upsert.poll_interval,
                associated_account: upsert.associated_account.clone(),
                status: upsert.status,
                last_poll_time: None,
                created_at: now,
                updated_at: now,
            });
        Ok(subscription.clone())
    }

    async fn get_subscription(
        &self,
        key: &SubscriptionKey,
    ) -> Result<Option<Subscription>, StoreError> {
        Ok(self.subscriptions.lock().unwrap().get(key).cloned())
    }

    async fn subscription_exists(&self, key: &SubscriptionKey) -> Result<bool, StoreError> {
        Ok(self.subscriptions.lock().unwrap().contains_key(key))
    }

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>, StoreError> {
        let mut all: Vec<Subscription> =
            self.subscriptions.lock().unwrap().values().cloned().collect();
        all.sort_by_key(|s| s.created_at);
        Ok(all)
    }

    async fn delete_subscription(&self, key: &SubscriptionKey) -> Result<(), StoreError> {
        self.subscriptions.lock().unwrap().remove(key);
        Ok(())
    }

    async fn update_subscription_last_poll_time(
        &self,
        key: &SubscriptionKey,
        at: DateTime<Utc>,
    ) -> Result<Subscription, StoreError> {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        let subscription = subscriptions
            .get_mut(key)
            .ok_or(StoreError::NotFound("subscription"))?;
        subscription.last_poll_time = Some(at);
        subscription.updated_at = Utc::now();
        Ok(subscription.clone())
    }

    async fn insert_transaction(&self, txn: NewTransaction) -> Result<InsertOutcome, StoreError> {
        let mut transactions = self.transactions.lock().unwrap();
        if let Some(existing) = transactions.get(&txn.signature) {
            return Ok(InsertOutcome {
                inserted: false,
                transaction: existing.clone(),
            });
        }
        let now = Utc::now();
        let transaction = Transaction {
            signature: txn.signature.clone(),
            slot: txn.slot,
            wallet_address: txn.wallet_address,
            network: txn.network,
            from_address: txn.from_address,
            amount: txn.amount,
            token_mint: txn.token_mint,
            memo: txn.memo,
            block_time: txn.block_time.unwrap_or(now),
            created_at: now,
            confirmation_status: txn.confirmation_status,
        };
        transactions.insert(txn.signature, transaction.clone());
        Ok(InsertOutcome {
            inserted: true,
            transaction,
        })
    }

    async fn list_signatures_by_wallet(
        &self,
        address: &str,
        network: Network,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let transactions = self.transactions.lock().unwrap();
        let mut matching: Vec<&Transaction> = transactions
            .values()
            .filter(|t| t.wallet_address == address && t.network == network)
            .filter(|t| since.is_none_or(|s| t.block_time >= s))
            .collect();
        matching.sort_by(|a, b| {
            b.block_time
                .cmp(&a.block_time)
                .then(b.created_at.cmp(&a.created_at))
        });
        Ok(matching
            .into_iter()
            .take(limit)
            .map(|t| t.signature.clone())
            .collect())
    }

    async fn list_transactions_by_time_range(
        &self,
        network: Network,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, StoreError> {
        let transactions = self.transactions.lock().unwrap();
        let mut matching: Vec<Transaction> = transactions
            .values()
            .filter(|t| t.network == network && t.block_time >= start && t.block_time <= end)
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            a.block_time
                .cmp(&b.block_time)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(matching)
    }

    async fn create_workflow_run(&self, run: &WorkflowRun) -> Result<(), StoreError> {
        self.workflow_runs
            .lock()
            .unwrap()
            .insert(run.id, run.clone());
        Ok(())
    }

    async fn update_workflow_run(
        &self,
        id: Uuid,
        status: WorkflowRunStatus,
        result: Option<serde_json::Value>,
    ) -> Result<(), StoreError> {
        let mut runs = self.workflow_runs.lock().unwrap();
        let run = runs.get_mut(&id).ok_or(StoreError::NotFound("workflow run"))?;
        run.status = status;
        run.result = result;
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn touch_workflow_run(&self, id: Uuid) -> Result<(), StoreError> {
        let mut runs = self.workflow_runs.lock().unwrap();
        let run = runs.get_mut(&id).ok_or(StoreError::NotFound("workflow run"))?;
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn get_workflow_run(&self, id: Uuid) -> Result<Option<WorkflowRun>, StoreError> {
        Ok(self.workflow_runs.lock().unwrap().get(&id).cloned())
    }

    async fn list_workflow_runs_by_status(
        &self,
        status: WorkflowRunStatus,
    ) -> Result<Vec<WorkflowRun>, StoreError> {
        let runs = self.workflow_runs.lock().unwrap();
        let mut matching: Vec<WorkflowRun> = runs
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.created_at);
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConfirmationStatus, SubscriptionStatus};
    use std::time::Duration;

    fn new_txn(signature: &str, wallet: &str, block_time_offset: i64) -> NewTransaction {
        NewTransaction {
            signature: signature.to_string(),
            slot: 100,
            wallet_address: wallet.to_string(),
            network: Network::Mainnet,
            from_address: None,
            amount: 1,
            token_mint: None,
            memo: None,
            block_time: DateTime::from_timestamp(1_700_000_000 + block_time_offset, 0),
            confirmation_status: ConfirmationStatus::Confirmed,
        }
    }

    #[tokio::test]
    async fn insert_transaction_is_at_most_once() {
        let store = MemoryStore::new();
        let first = store.insert_transaction(new_txn("S1", "A1", 0)).await.unwrap();
        assert!(first.inserted);

        let second = store.insert_transaction(new_txn("S1", "A1", 0)).await.unwrap();
        assert!(!second.inserted);
        assert_eq!(second.transaction.signature, "S1");

        let sigs = store
            .list_signatures_by_wallet("A1", Network::Mainnet, None, 10)
            .await
            .unwrap();
        assert_eq!(sigs, vec!["S1"]);
    }

    #[tokio::test]
    async fn signatures_are_listed_newest_first_with_limit() {
        let store = MemoryStore::new();
        for (i, sig) in ["S1", "S2", "S3"].iter().enumerate() {
            store
                .insert_transaction(new_txn(sig, "A1", i as i64))
                .await
                .unwrap();
        }
        let sigs = store
            .list_signatures_by_wallet("A1", Network::Mainnet, None, 2)
            .await
            .unwrap();
        assert_eq!(sigs, vec!["S3", "S2"]);
    }

    #[tokio::test]
    async fn time_range_listing_is_ascending_and_bounded() {
        let store = MemoryStore::new();
        for (i, sig) in ["S1", "S2", "S3"].iter().enumerate() {
            store
                .insert_transaction(new_txn(sig, "A1", i as i64 * 100))
                .await
                .unwrap();
        }
        let start = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let end = DateTime::from_timestamp(1_700_000_150, 0).unwrap();
        let txns = store
            .list_transactions_by_time_range(Network::Mainnet, start, end)
            .await
            .unwrap();
        let sigs: Vec<&str> = txns.iter().map(|t| t.signature.as_str()).collect();
        assert_eq!(sigs, vec!["S1", "S2"]);
    }

    #[tokio::test]
    async fn upsert_updates_interval_in_place() {
        let store = MemoryStore::new();
        let key = SubscriptionKey::native("A1", Network::Mainnet);
        store
            .upsert_subscription(UpsertSubscription::active(
                key.clone(),
                Duration::from_secs(30),
                None,
            ))
            .await
            .unwrap();
        let updated = store
            .upsert_subscription(UpsertSubscription::active(
                key.clone(),
                Duration::from_secs(60),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(updated.poll_interval, Duration::from_secs(60));
        assert_eq!(updated.status, SubscriptionStatus::Active);
        assert_eq!(store.list_subscriptions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_subscription_is_idempotent() {
        let store = MemoryStore::new();
        let key = SubscriptionKey::native("A1", Network::Mainnet);
        store.delete_subscription(&key).await.unwrap();
        store
            .upsert_subscription(UpsertSubscription::active(
                key.clone(),
                Duration::from_secs(30),
                None,
            ))
            .await
            .unwrap();
        store.delete_subscription(&key).await.unwrap();
        store.delete_subscription(&key).await.unwrap();
        assert!(!store.subscription_exists(&key).await.unwrap());
    }
}
