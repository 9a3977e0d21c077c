//! Subscription registration and removal, coordinating the store and the
//! scheduler.
//!
//! The register path writes the store first and the schedule second; a
//! schedule failure rolls the store back so the two sides never disagree.
//! The delete path inverts the order: the schedule is deleted first, and a
//! schedule failure aborts with the subscription intact. An orphan schedule
//! cannot arise, and a firing schedule whose subscription is gone is a
//! no-op anyway.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use solana_pubkey::Pubkey;

use crate::network::{AssetKind, associated_token_account};
use crate::scheduler::{MIN_POLL_INTERVAL, Schedules, SchedulerError};
use crate::store::{Store, StoreError, UpsertSubscription};
use crate::types::{InvalidKeyError, Subscription, SubscriptionKey, duration_string};

/// A request to monitor an address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub key: SubscriptionKey,
    #[serde(with = "duration_string")]
    pub poll_interval: Duration,
    /// For fungible tokens: the token account to poll. Derived from
    /// `address` and `token_mint` when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub associated_account: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error(transparent)]
    InvalidKey(#[from] InvalidKeyError),
    #[error("poll interval {0:?} is below the 1s minimum")]
    IntervalTooShort(Duration),
    #[error("cannot derive associated token account: {0} is not a valid key")]
    UnparseableKeyPart(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("schedule update failed (subscription rolled back: {rolled_back}): {source}")]
    Schedule {
        rolled_back: bool,
        #[source]
        source: SchedulerError,
    },
}

pub struct AdminService {
    store: Arc<dyn Store>,
    scheduler: Arc<dyn Schedules>,
}

impl AdminService {
    pub fn new(store: Arc<dyn Store>, scheduler: Arc<dyn Schedules>) -> Self {
        Self { store, scheduler }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Upsert the subscription and its schedule entry.
    ///
    /// Re-registration updates the poll interval in place. If the schedule
    /// upsert fails the subscription row is deleted again, so a successful
    /// register always leaves both sides populated and a failed one leaves
    /// neither.
    pub async fn register(
        &self,
        request: &RegistrationRequest,
    ) -> Result<Subscription, AdminError> {
        request.key.validate()?;
        if request.poll_interval < MIN_POLL_INTERVAL {
            return Err(AdminError::IntervalTooShort(request.poll_interval));
        }
        let associated_account = self.resolve_associated_account(request)?;

        let subscription = self
            .store
            .upsert_subscription(UpsertSubscription::active(
                request.key.clone(),
                request.poll_interval,
                associated_account,
            ))
            .await?;

        if let Err(source) = self
            .scheduler
            .upsert(&request.key, request.poll_interval)
        {
            let rolled_back = match self.store.delete_subscription(&request.key).await {
                Ok(()) => true,
                Err(rollback_error) => {
                    tracing::error!(
                        key = %request.key,
                        error = %rollback_error,
                        "failed to roll back subscription after schedule failure"
                    );
                    false
                }
            };
            return Err(AdminError::Schedule {
                rolled_back,
                source,
            });
        }

        tracing::info!(key = %request.key, "subscription registered");
        Ok(subscription)
    }

    /// Remove the schedule entry, then the subscription row.
    pub async fn unregister(&self, key: &SubscriptionKey) -> Result<(), AdminError> {
        self.scheduler
            .delete(key)
            .map_err(|source| AdminError::Schedule {
                rolled_back: false,
                source,
            })?;
        self.store.delete_subscription(key).await?;
        tracing::info!(key = %key, "subscription unregistered");
        Ok(())
    }

    fn resolve_associated_account(
        &self,
        request: &RegistrationRequest,
    ) -> Result<Option<String>, AdminError> {
        match request.key.asset_kind {
            AssetKind::Native => Ok(None),
            AssetKind::FungibleToken => {
                if let Some(account) = &request.associated_account {
                    return Ok(Some(account.clone()));
                }
                let wallet = Pubkey::from_str(&request.key.address)
                    .map_err(|_| AdminError::UnparseableKeyPart(request.key.address.clone()))?;
                let mint = Pubkey::from_str(&request.key.token_mint)
                    .map_err(|_| AdminError::UnparseableKeyPart(request.key.token_mint.clone()))?;
                Ok(Some(associated_token_account(&wallet, &mint).to_string()))
            }
        }
    }
}
