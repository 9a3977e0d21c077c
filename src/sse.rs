//! The SSE gateway: replay a historical window, then forward the live
//! stream.
//!
//! The live subscription is attached before the historical read begins so
//! nothing falls in the gap; the price is that an event can appear in both
//! phases, and clients deduplicate by signature. Each connection is one
//! task feeding a bounded channel; a client that cannot keep up with live
//! delivery is dropped rather than buffered without bound.

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use chrono::Utc;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::instrument;

use crate::events::{EventLog, EventStream, SubjectFilter};
use crate::handlers::{ApiError, AppState};
use crate::store::Store;
use crate::types::TransactionEvent;

/// Interval for keepalive comments.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Deadline for the historical read; on expiry the stream skips to live.
const HISTORICAL_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Historical records per flush marker.
const REPLAY_CHUNK: usize = 200;

/// Per-connection outgoing buffer.
const OUTGOING_BUFFER: usize = 256;

#[derive(Debug, Deserialize, Default)]
pub struct StreamParams {
    /// Human duration, e.g. `45m` or `12h`. Defaults to the configured
    /// default window, capped at the configured maximum.
    pub lookback: Option<String>,
}

/// `GET /api/v1/stream/transactions`: every monitored address.
#[instrument(skip_all)]
pub async fn stream_all(
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    stream_transactions(state, None, params).await
}

/// `GET /api/v1/stream/transactions/{address}`: one address.
#[instrument(skip_all, fields(address = %address))]
pub async fn stream_address(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Query(params): Query<StreamParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    stream_transactions(state, Some(address), params).await
}

async fn stream_transactions(
    state: AppState,
    address: Option<String>,
    params: StreamParams,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let lookback = resolve_lookback(
        params.lookback.as_deref(),
        state.stream.default_lookback,
        state.stream.max_lookback,
    )?;

    let filter = match &address {
        Some(address) => SubjectFilter::Address(address.clone()),
        None => SubjectFilter::All,
    };
    // Live first, replay second: no event can fall between the two.
    let live = state.events.subscribe(filter).await?;

    let (tx, rx) = mpsc::channel::<StreamItem>(OUTGOING_BUFFER);
    let store = Arc::clone(&state.store);
    tokio::spawn(feed(store, live, address, lookback, tx));

    let stream = ReceiverStream::new(rx)
        .filter_map(|item| async move { item.into_event().ok().map(Ok::<_, Infallible>) });
    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEPALIVE_INTERVAL)
            .text("keepalive"),
    ))
}

fn resolve_lookback(
    requested: Option<&str>,
    default: Duration,
    max: Duration,
) -> Result<Duration, ApiError> {
    let lookback = match requested {
        Some(raw) => humantime::parse_duration(raw)
            .map_err(|_| ApiError::bad_request(format!("invalid lookback: {raw}")))?,
        None => default,
    };
    Ok(lookback.min(max))
}

/// What the connection task sends; converted to wire events at the edge.
#[derive(Debug)]
enum StreamItem {
    Connected {
        address: Option<String>,
        lookback: Duration,
    },
    Transaction(TransactionEvent),
    Flush,
}

impl StreamItem {
    fn into_event(self) -> Result<Event, axum::Error> {
        match self {
            StreamItem::Connected { address, lookback } => {
                Event::default().event("connected").json_data(json!({
                    "address": address,
                    "lookback": humantime::format_duration(lookback).to_string(),
                }))
            }
            StreamItem::Transaction(event) => {
                Event::default().event("transaction").json_data(&event)
            }
            StreamItem::Flush => Ok(Event::default().comment("flush")),
        }
    }
}

/// Drive one connection: connected marker, historical replay ascending by
/// block time, then live forwarding until the client goes away.
async fn feed(
    store: Arc<dyn Store>,
    mut live: EventStream,
    address: Option<String>,
    lookback: Duration,
    tx: mpsc::Sender<StreamItem>,
) {
    if tx
        .send(StreamItem::Connected {
            address: address.clone(),
            lookback,
        })
        .await
        .is_err()
    {
        return;
    }

    let replay = tokio::time::timeout(
        HISTORICAL_FETCH_TIMEOUT,
        historical_window(&*store, address.as_deref(), lookback),
    )
    .await;
    match replay {
        Ok(Ok(transactions)) => {
            let mut sent = 0usize;
            for txn in transactions {
                let event = TransactionEvent::new(&txn, txn.created_at);
                if tx.send(StreamItem::Transaction(event)).await.is_err() {
                    return;
                }
                sent += 1;
                if sent % REPLAY_CHUNK == 0 && tx.send(StreamItem::Flush).await.is_err() {
                    return;
                }
            }
            tracing::debug!(sent, "historical replay complete");
        }
        Ok(Err(error)) => {
            tracing::warn!(error = %error, "historical replay failed; continuing live");
        }
        Err(_) => {
            tracing::warn!("historical replay timed out; continuing live");
        }
    }

    while let Some(item) = live.next().await {
        let event = match item {
            Ok(event) => event,
            Err(error) => {
                tracing::warn!(error = %error, "live stream hiccup");
                continue;
            }
        };
        match tx.try_send(StreamItem::Transaction(event)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("client too slow; closing stream");
                return;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return,
        }
    }
}

/// All transactions in the window across networks, ascending by block time,
/// optionally narrowed to one wallet.
async fn historical_window(
    store: &dyn Store,
    address: Option<&str>,
    lookback: Duration,
) -> Result<Vec<crate::types::Transaction>, crate::store::StoreError> {
    let end = Utc::now();
    let start =
        end - chrono::Duration::from_std(lookback).unwrap_or_else(|_| chrono::Duration::hours(24));
    let mut all = Vec::new();
    for network in crate::network::Network::variants() {
        let mut transactions = store
            .list_transactions_by_time_range(*network, start, end)
            .await?;
        if let Some(address) = address {
            transactions.retain(|t| t.wallet_address == address);
        }
        all.extend(transactions);
    }
    all.sort_by(|a, b| a.block_time.cmp(&b.block_time));
    Ok(all)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventLog, MemoryEventLog};
    use crate::network::Network;
    use crate::store::MemoryStore;
    use crate::types::{ConfirmationStatus, NewTransaction, Transaction};
    use std::collections::HashSet;

    fn txn(signature: &str, address: &str, age: Duration) -> NewTransaction {
        NewTransaction {
            signature: signature.to_string(),
            slot: 1,
            wallet_address: address.to_string(),
            network: Network::Mainnet,
            from_address: None,
            amount: 10,
            token_mint: None,
            memo: None,
            block_time: Some(Utc::now() - chrono::Duration::from_std(age).unwrap()),
            confirmation_status: ConfirmationStatus::Confirmed,
        }
    }

    fn live_event(signature: &str, address: &str) -> TransactionEvent {
        let now = Utc::now();
        TransactionEvent::new(
            &Transaction {
                signature: signature.to_string(),
                slot: 2,
                wallet_address: address.to_string(),
                network: Network::Mainnet,
                from_address: None,
                amount: 10,
                token_mint: None,
                memo: None,
                block_time: now,
                created_at: now,
                confirmation_status: ConfirmationStatus::Confirmed,
            },
            now,
        )
    }

    async fn collect_signatures(
        rx: &mut mpsc::Receiver<StreamItem>,
        count: usize,
    ) -> Vec<String> {
        let mut signatures = Vec::new();
        while signatures.len() < count {
            match rx.recv().await.expect("stream ended early") {
                StreamItem::Transaction(event) => signatures.push(event.signature),
                StreamItem::Connected { .. } | StreamItem::Flush => {}
            }
        }
        signatures
    }

    #[tokio::test(start_paused = true)]
    async fn replays_history_ascending_then_forwards_live() {
        let store = Arc::new(MemoryStore::new());
        let events = MemoryEventLog::default();
        // Inserted out of order; replay must come back ascending.
        store.insert_transaction(txn("H2", "A1", Duration::from_secs(600))).await.unwrap();
        store.insert_transaction(txn("H1", "A1", Duration::from_secs(1200))).await.unwrap();
        store.insert_transaction(txn("H3", "A1", Duration::from_secs(60))).await.unwrap();

        let live = events
            .subscribe(SubjectFilter::Address("A1".into()))
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        tokio::spawn(feed(
            store.clone(),
            live,
            Some("A1".into()),
            Duration::from_secs(24 * 3600),
            tx,
        ));

        // The connected marker arrives first.
        match rx.recv().await.unwrap() {
            StreamItem::Connected { address, .. } => assert_eq!(address.as_deref(), Some("A1")),
            other => panic!("expected connected, got {other:?}"),
        }

        let history = collect_signatures(&mut rx, 3).await;
        assert_eq!(history, vec!["H1", "H2", "H3"]);

        events.publish(&live_event("L1", "A1")).await.unwrap();
        let live_sigs = collect_signatures(&mut rx, 1).await;
        assert_eq!(live_sigs, vec!["L1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn address_filter_excludes_other_wallets() {
        let store = Arc::new(MemoryStore::new());
        let events = MemoryEventLog::default();
        store.insert_transaction(txn("H1", "A1", Duration::from_secs(60))).await.unwrap();
        store.insert_transaction(txn("H2", "A2", Duration::from_secs(60))).await.unwrap();

        let live = events
            .subscribe(SubjectFilter::Address("A1".into()))
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        tokio::spawn(feed(
            store.clone(),
            live,
            Some("A1".into()),
            Duration::from_secs(24 * 3600),
            tx,
        ));

        let history = collect_signatures(&mut rx, 1).await;
        assert_eq!(history, vec!["H1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn dedup_by_signature_yields_a_total_order() {
        let store = Arc::new(MemoryStore::new());
        let events = MemoryEventLog::default();
        store.insert_transaction(txn("S1", "A1", Duration::from_secs(60))).await.unwrap();

        let live = events.subscribe(SubjectFilter::All).await.unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        tokio::spawn(feed(
            store.clone(),
            live,
            None,
            Duration::from_secs(24 * 3600),
            tx,
        ));

        // The same signature arrives again live (publish after insert is
        // at-least-once); the consumer-side dedup keeps one copy.
        events.publish(&live_event("S1", "A1")).await.unwrap();
        events.publish(&live_event("S2", "A1")).await.unwrap();

        let raw = collect_signatures(&mut rx, 3).await;
        let mut seen = HashSet::new();
        let deduped: Vec<String> = raw.into_iter().filter(|s| seen.insert(s.clone())).collect();
        assert_eq!(deduped, vec!["S1", "S2"]);
    }

    #[test]
    fn lookback_is_capped_at_the_maximum() {
        let resolved = resolve_lookback(
            Some("96h"),
            Duration::from_secs(24 * 3600),
            Duration::from_secs(48 * 3600),
        )
        .unwrap();
        assert_eq!(resolved, Duration::from_secs(48 * 3600));

        let default = resolve_lookback(
            None,
            Duration::from_secs(24 * 3600),
            Duration::from_secs(48 * 3600),
        )
        .unwrap();
        assert_eq!(default, Duration::from_secs(24 * 3600));

        assert!(resolve_lookback(
            Some("not-a-duration"),
            Duration::from_secs(1),
            Duration::from_secs(1)
        )
        .is_err());
    }
}
