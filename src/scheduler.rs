//! Interval-triggered poll scheduling, keyed by the subscription key.
//!
//! Entries are derived state: the store is authoritative, and
//! [`Scheduler::reconcile`] rebuilds the entry set from it at startup. Each
//! entry owns one task that fires the poll workflow on its interval; paused
//! entries keep ticking but do not fire.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::store::Store;
use crate::types::{SubscriptionKey, SubscriptionStatus};

/// Minimum allowed poll interval.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Executes one poll cycle when a schedule fires.
#[async_trait]
pub trait PollRunner: Send + Sync {
    async fn run_poll(&self, key: &SubscriptionKey);
}

/// Schedule CRUD, as exposed to the admin layer and workflows.
pub trait Schedules: Send + Sync {
    /// Create or update the entry for `key`; never duplicates.
    fn upsert(&self, key: &SubscriptionKey, interval: Duration) -> Result<(), SchedulerError>;

    /// Idempotent; returns whether an entry existed.
    fn delete(&self, key: &SubscriptionKey) -> Result<bool, SchedulerError>;

    fn pause(&self, key: &SubscriptionKey, note: &str) -> Result<(), SchedulerError>;

    fn resume(&self, key: &SubscriptionKey, note: &str) -> Result<(), SchedulerError>;

    fn describe(&self, key: &SubscriptionKey) -> Option<ScheduleStatus>;

    fn list(&self) -> Vec<ScheduleStatus>;
}

/// Point-in-time view of one schedule entry.
#[derive(Debug, Clone)]
pub struct ScheduleStatus {
    pub id: String,
    pub key: SubscriptionKey,
    pub interval: Duration,
    pub paused: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("schedule for {0} not found")]
    NotFound(String),
    #[error("poll interval {0:?} is below the 1s minimum")]
    IntervalTooShort(Duration),
    #[error("scheduler is shut down")]
    ShutDown,
}

struct Entry {
    interval: Duration,
    paused: Arc<AtomicBool>,
    cancel: CancellationToken,
}

pub struct Scheduler {
    entries: DashMap<SubscriptionKey, Entry>,
    runner: Arc<dyn PollRunner>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(runner: Arc<dyn PollRunner>, shutdown: CancellationToken) -> Self {
        Self {
            entries: DashMap::new(),
            runner,
            shutdown,
        }
    }

    /// Rebuild the entry set from the store. Paused subscriptions get a
    /// paused entry; errored ones are skipped until re-registered.
    pub async fn reconcile(&self, store: &dyn Store) -> Result<usize, SchedulerError> {
        let subscriptions = match store.list_subscriptions().await {
            Ok(subscriptions) => subscriptions,
            Err(error) => {
                tracing::error!(error = %error, "failed to list subscriptions for reconcile");
                return Ok(0);
            }
        };
        let mut restored = 0;
        for subscription in subscriptions {
            match subscription.status {
                SubscriptionStatus::Active => {
                    self.upsert(&subscription.key, subscription.poll_interval)?;
                    restored += 1;
                }
                SubscriptionStatus::Paused => {
                    self.upsert(&subscription.key, subscription.poll_interval)?;
                    self.pause(&subscription.key, "restored paused")?;
                    restored += 1;
                }
                SubscriptionStatus::Error => {
                    tracing::warn!(key = %subscription.key, "skipping errored subscription");
                }
            }
        }
        tracing::info!(restored, "reconciled schedules from store");
        Ok(restored)
    }

    fn spawn_entry(
        &self,
        key: &SubscriptionKey,
        interval: Duration,
        paused: Arc<AtomicBool>,
    ) -> CancellationToken {
        let cancel = self.shutdown.child_token();
        let task_cancel = cancel.clone();
        let runner = Arc::clone(&self.runner);
        let key = key.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The zeroth tick completes immediately; the first poll happens
            // one interval after registration.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if paused.load(Ordering::Relaxed) {
                            continue;
                        }
                        runner.run_poll(&key).await;
                    }
                }
            }
        });
        cancel
    }
}

impl Schedules for Scheduler {
    fn upsert(&self, key: &SubscriptionKey, interval: Duration) -> Result<(), SchedulerError> {
        if interval < MIN_POLL_INTERVAL {
            return Err(SchedulerError::IntervalTooShort(interval));
        }
        if self.shutdown.is_cancelled() {
            return Err(SchedulerError::ShutDown);
        }
        if let Some(existing) = self.entries.get(key) {
            if existing.interval == interval {
                return Ok(());
            }
        }
        // Interval change: replace the entry, keeping its paused flag.
        let paused = self
            .entries
            .remove(key)
            .map(|(_, entry)| {
                entry.cancel.cancel();
                entry.paused
            })
            .unwrap_or_else(|| Arc::new(AtomicBool::new(false)));
        let cancel = self.spawn_entry(key, interval, Arc::clone(&paused));
        self.entries.insert(
            key.clone(),
            Entry {
                interval,
                paused,
                cancel,
            },
        );
        tracing::info!(schedule = %key.schedule_id(), ?interval, "schedule upserted");
        Ok(())
    }

    fn delete(&self, key: &SubscriptionKey) -> Result<bool, SchedulerError> {
        match self.entries.remove(key) {
            Some((_, entry)) => {
                entry.cancel.cancel();
                tracing::info!(schedule = %key.schedule_id(), "schedule deleted");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn pause(&self, key: &SubscriptionKey, note: &str) -> Result<(), SchedulerError> {
        let entry = self
            .entries
            .get(key)
            .ok_or_else(|| SchedulerError::NotFound(key.schedule_id()))?;
        entry.paused.store(true, Ordering::Relaxed);
        tracing::info!(schedule = %key.schedule_id(), note, "schedule paused");
        Ok(())
    }

    fn resume(&self, key: &SubscriptionKey, note: &str) -> Result<(), SchedulerError> {
        let entry = self
            .entries
            .get(key)
            .ok_or_else(|| SchedulerError::NotFound(key.schedule_id()))?;
        entry.paused.store(false, Ordering::Relaxed);
        tracing::info!(schedule = %key.schedule_id(), note, "schedule resumed");
        Ok(())
    }

    fn describe(&self, key: &SubscriptionKey) -> Option<ScheduleStatus> {
        self.entries.get(key).map(|entry| ScheduleStatus {
            id: key.schedule_id(),
            key: key.clone(),
            interval: entry.interval,
            paused: entry.paused.load(Ordering::Relaxed),
        })
    }

    fn list(&self) -> Vec<ScheduleStatus> {
        self.entries
            .iter()
            .map(|item| ScheduleStatus {
                id: item.key().schedule_id(),
                key: item.key().clone(),
                interval: item.value().interval,
                paused: item.value().paused.load(Ordering::Relaxed),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Network;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct RecordingRunner {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl PollRunner for RecordingRunner {
        async fn run_poll(&self, _key: &SubscriptionKey) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn key() -> SubscriptionKey {
        SubscriptionKey::native("A1", Network::Mainnet)
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_fires_on_its_interval() {
        let runner = Arc::new(RecordingRunner::default());
        let scheduler = Scheduler::new(runner.clone(), CancellationToken::new());
        scheduler.upsert(&key(), Duration::from_secs(30)).unwrap();

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(runner.runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn upsert_is_idempotent_and_never_duplicates() {
        let runner = Arc::new(RecordingRunner::default());
        let scheduler = Scheduler::new(runner.clone(), CancellationToken::new());
        scheduler.upsert(&key(), Duration::from_secs(30)).unwrap();
        scheduler.upsert(&key(), Duration::from_secs(30)).unwrap();
        scheduler.upsert(&key(), Duration::from_secs(30)).unwrap();
        assert_eq!(scheduler.list().len(), 1);

        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(runner.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn upsert_updates_the_interval() {
        let runner = Arc::new(RecordingRunner::default());
        let scheduler = Scheduler::new(runner.clone(), CancellationToken::new());
        scheduler.upsert(&key(), Duration::from_secs(1000)).unwrap();
        scheduler.upsert(&key(), Duration::from_secs(10)).unwrap();

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(runner.runs.load(Ordering::SeqCst), 3);
        assert_eq!(
            scheduler.describe(&key()).unwrap().interval,
            Duration::from_secs(10)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn paused_schedules_do_not_fire() {
        let runner = Arc::new(RecordingRunner::default());
        let scheduler = Scheduler::new(runner.clone(), CancellationToken::new());
        scheduler.upsert(&key(), Duration::from_secs(10)).unwrap();
        scheduler.pause(&key(), "operator request").unwrap();

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(runner.runs.load(Ordering::SeqCst), 0);

        scheduler.resume(&key(), "operator request").unwrap();
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(runner.runs.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_is_idempotent_and_stops_firing() {
        let runner = Arc::new(RecordingRunner::default());
        let scheduler = Scheduler::new(runner.clone(), CancellationToken::new());
        scheduler.upsert(&key(), Duration::from_secs(10)).unwrap();
        assert!(scheduler.delete(&key()).unwrap());
        assert!(!scheduler.delete(&key()).unwrap());

        tokio::time::sleep(Duration::from_secs(50)).await;
        assert_eq!(runner.runs.load(Ordering::SeqCst), 0);
        assert!(scheduler.describe(&key()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_rebuilds_entries_from_the_store() {
        use crate::store::{MemoryStore, Store, UpsertSubscription};
        use crate::types::SubscriptionStatus;

        let store = MemoryStore::new();
        store
            .upsert_subscription(UpsertSubscription::active(
                SubscriptionKey::native("A1", Network::Mainnet),
                Duration::from_secs(30),
                None,
            ))
            .await
            .unwrap();
        store
            .upsert_subscription(UpsertSubscription {
                key: SubscriptionKey::native("A2", Network::Devnet),
                poll_interval: Duration::from_secs(60),
                associated_account: None,
                status: SubscriptionStatus::Paused,
            })
            .await
            .unwrap();

        let runner = Arc::new(RecordingRunner::default());
        let scheduler = Scheduler::new(runner, CancellationToken::new());
        let restored = scheduler.reconcile(&store).await.unwrap();
        assert_eq!(restored, 2);

        let active = scheduler
            .describe(&SubscriptionKey::native("A1", Network::Mainnet))
            .unwrap();
        assert!(!active.paused);
        let paused = scheduler
            .describe(&SubscriptionKey::native("A2", Network::Devnet))
            .unwrap();
        assert!(paused.paused);
    }

    #[test]
    fn sub_second_intervals_are_rejected() {
        let runner = Arc::new(RecordingRunner::default());
        let scheduler = Scheduler::new(runner, CancellationToken::new());
        let err = scheduler
            .upsert(&key(), Duration::from_millis(200))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::IntervalTooShort(_)));
    }
}
