//! JetStream-backed [`EventLog`].
//!
//! One stream over `txn.>` with time-bounded retention; subscriptions are
//! ephemeral pull consumers with a `New` deliver policy, so a subscriber
//! sees events published after it attaches.

use async_nats::jetstream;
use async_nats::jetstream::consumer::DeliverPolicy;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::time::Duration;

use crate::events::{EventLog, EventLogError, EventStream, SUBJECT_PREFIX, SubjectFilter, subject_for_address};
use crate::types::TransactionEvent;

/// Default retention for the transaction stream.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

pub struct JetStreamEventLog {
    jetstream: jetstream::Context,
    stream_name: String,
}

impl JetStreamEventLog {
    /// Connect to NATS and ensure the transaction stream exists.
    pub async fn connect(
        url: &str,
        stream_name: &str,
        retention: Duration,
    ) -> Result<Self, EventLogError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| EventLogError::Connect(e.to_string()))?;
        let jetstream = jetstream::new(client);
        jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: stream_name.to_string(),
                subjects: vec![format!("{SUBJECT_PREFIX}.>")],
                max_age: retention,
                ..Default::default()
            })
            .await
            .map_err(|e| EventLogError::Connect(e.to_string()))?;
        tracing::info!(url, stream = stream_name, "connected to event log");
        Ok(Self {
            jetstream,
            stream_name: stream_name.to_string(),
        })
    }
}

#[async_trait]
impl EventLog for JetStreamEventLog {
    async fn publish(&self, event: &TransactionEvent) -> Result<(), EventLogError> {
        let subject = subject_for_address(&event.wallet_address);
        let payload = serde_json::to_vec(event)?;
        let ack = self
            .jetstream
            .publish(subject, payload.into())
            .await
            .map_err(|e| EventLogError::Publish(e.to_string()))?;
        ack.await
            .map_err(|e| EventLogError::Publish(e.to_string()))?;
        tracing::debug!(
            monotonic_counter.events_published_total = 1,
            signature = %event.signature,
            address = %event.wallet_address,
            "published transaction event"
        );
        Ok(())
    }

    async fn subscribe(&self, filter: SubjectFilter) -> Result<EventStream, EventLogError> {
        let stream = self
            .jetstream
            .get_stream(&self.stream_name)
            .await
            .map_err(|e| EventLogError::Subscribe(e.to_string()))?;
        let consumer = stream
            .create_consumer(jetstream::consumer::pull::Config {
                deliver_policy: DeliverPolicy::New,
                filter_subject: filter.filter_subject(),
                ..Default::default()
            })
            .await
            .map_err(|e| EventLogError::Subscribe(e.to_string()))?;
        let messages = consumer
            .messages()
            .await
            .map_err(|e| EventLogError::Subscribe(e.to_string()))?;

        let events = messages
            .then(|message| async move {
                let message = message.map_err(|e| EventLogError::Stream(e.to_string()))?;
                if let Err(error) = message.ack().await {
                    tracing::warn!(error = %error, "failed to ack event log message");
                }
                let event: TransactionEvent = serde_json::from_slice(&message.payload)?;
                Ok(event)
            })
            .boxed();
        Ok(events)
    }
}
