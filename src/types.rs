//! Core domain types shared across the service.
//!
//! A subscription is identified by the composite key
//! `(address, network, asset_kind, token_mint)`; observed transactions are
//! identified globally by their ledger signature.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

use crate::network::{AssetKind, Network};

/// Serde helpers rendering a [`Duration`] as a human string (`"30s"`, `"5m"`).
pub mod duration_string {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// The composite key identifying a subscription.
///
/// `token_mint` is the empty string iff `asset_kind` is native.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub address: String,
    pub network: Network,
    pub asset_kind: AssetKind,
    #[serde(default)]
    pub token_mint: String,
}

impl SubscriptionKey {
    pub fn native(address: impl Into<String>, network: Network) -> Self {
        Self {
            address: address.into(),
            network,
            asset_kind: AssetKind::Native,
            token_mint: String::new(),
        }
    }

    pub fn fungible_token(
        address: impl Into<String>,
        network: Network,
        token_mint: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            network,
            asset_kind: AssetKind::FungibleToken,
            token_mint: token_mint.into(),
        }
    }

    /// Check the mint/asset-kind coupling invariant.
    pub fn validate(&self) -> Result<(), InvalidKeyError> {
        if self.address.is_empty() {
            return Err(InvalidKeyError::EmptyAddress);
        }
        match self.asset_kind {
            AssetKind::Native if !self.token_mint.is_empty() => {
                Err(InvalidKeyError::MintOnNative)
            }
            AssetKind::FungibleToken if self.token_mint.is_empty() => {
                Err(InvalidKeyError::MissingMint)
            }
            _ => Ok(()),
        }
    }

    /// Deterministic, injective schedule identifier for this key.
    pub fn schedule_id(&self) -> String {
        format!(
            "poll:{}:{}:{}:{}",
            self.network, self.asset_kind, self.address, self.token_mint
        )
    }
}

impl Display for SubscriptionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.address, self.network, self.asset_kind
        )?;
        if !self.token_mint.is_empty() {
            write!(f, "/{}", self.token_mint)?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidKeyError {
    #[error("address must not be empty")]
    EmptyAddress,
    #[error("token_mint must be empty for native subscriptions")]
    MintOnNative,
    #[error("token_mint is required for fungible_token subscriptions")]
    MissingMint,
}

/// Lifecycle state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Paused,
    Error,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::Error => "error",
        }
    }
}

impl FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "paused" => Ok(SubscriptionStatus::Paused),
            "error" => Ok(SubscriptionStatus::Error),
            other => Err(format!("unknown subscription status: {other}")),
        }
    }
}

/// A monitored account registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    #[serde(flatten)]
    pub key: SubscriptionKey,
    #[serde(with = "duration_string")]
    pub poll_interval: Duration,
    /// For fungible-token subscriptions, the token account actually polled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub associated_account: Option<String>,
    pub status: SubscriptionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_poll_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// The account polled for this subscription: the wallet itself for
    /// native, the associated token account for fungible tokens.
    pub fn poll_address(&self) -> &str {
        match self.key.asset_kind {
            AssetKind::Native => &self.key.address,
            AssetKind::FungibleToken => self
                .associated_account
                .as_deref()
                .unwrap_or(&self.key.address),
        }
    }
}

/// Finality of an observed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationStatus {
    Confirmed,
    Failed,
}

impl ConfirmationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfirmationStatus::Confirmed => "confirmed",
            ConfirmationStatus::Failed => "failed",
        }
    }
}

impl FromStr for ConfirmationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "confirmed" => Ok(ConfirmationStatus::Confirmed),
            "failed" => Ok(ConfirmationStatus::Failed),
            other => Err(format!("unknown confirmation status: {other}")),
        }
    }
}

/// A persisted ledger transaction attributed to a monitored wallet.
///
/// Rows are created once on first observation and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub signature: String,
    pub slot: u64,
    pub wallet_address: String,
    pub network: Network,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_address: Option<String>,
    pub amount: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_mint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
    pub block_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub confirmation_status: ConfirmationStatus,
}

/// Input for persisting a newly observed transaction.
///
/// `block_time` falls back to ingest time when the ledger did not report one.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub signature: String,
    pub slot: u64,
    pub wallet_address: String,
    pub network: Network,
    pub from_address: Option<String>,
    pub amount: u64,
    pub token_mint: Option<String>,
    pub memo: Option<String>,
    pub block_time: Option<DateTime<Utc>>,
    pub confirmation_status: ConfirmationStatus,
}

/// The event-log payload published for each newly persisted transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub signature: String,
    pub slot: u64,
    pub wallet_address: String,
    pub network: Network,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_address: Option<String>,
    pub amount: u64,
    #[serde(rename = "token_type", skip_serializing_if = "Option::is_none")]
    pub token_mint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
    pub block_time: DateTime<Utc>,
    pub confirmation_status: ConfirmationStatus,
    pub published_at: DateTime<Utc>,
}

impl TransactionEvent {
    pub fn new(txn: &Transaction, published_at: DateTime<Utc>) -> Self {
        Self {
            signature: txn.signature.clone(),
            slot: txn.slot,
            wallet_address: txn.wallet_address.clone(),
            network: txn.network,
            from_address: txn.from_address.clone(),
            amount: txn.amount,
            token_mint: txn.token_mint.clone(),
            memo: txn.memo.clone(),
            block_time: txn.block_time,
            confirmation_status: txn.confirmation_status,
            published_at,
        }
    }

    /// Reconstruct a [`Transaction`] view of this event. The ingest time is
    /// not carried on the wire, so `published_at` stands in for it.
    pub fn into_transaction(self) -> Transaction {
        Transaction {
            signature: self.signature,
            slot: self.slot,
            wallet_address: self.wallet_address,
            network: self.network,
            from_address: self.from_address,
            amount: self.amount,
            token_mint: self.token_mint,
            memo: self.memo,
            block_time: self.block_time,
            created_at: self.published_at,
            confirmation_status: self.confirmation_status,
        }
    }
}
