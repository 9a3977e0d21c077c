//! Broadcast-channel [`EventLog`] used by unit tests.

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::events::{EventLog, EventLogError, EventStream, SubjectFilter};
use crate::types::TransactionEvent;

pub struct MemoryEventLog {
    sender: broadcast::Sender<TransactionEvent>,
}

impl MemoryEventLog {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }
}

impl Default for MemoryEventLog {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn publish(&self, event: &TransactionEvent) -> Result<(), EventLogError> {
        // No receivers attached is not an error; live delivery is best-effort.
        let _ = self.sender.send(event.clone());
        Ok(())
    }

    async fn subscribe(&self, filter: SubjectFilter) -> Result<EventStream, EventLogError> {
        let receiver = self.sender.subscribe();
        let events = BroadcastStream::new(receiver)
            .filter_map(move |item| {
                let mapped = match item {
                    Ok(event) if filter.matches(&event.wallet_address) => Some(Ok(event)),
                    Ok(_) => None,
                    Err(BroadcastStreamRecvError::Lagged(missed)) => {
                        Some(Err(EventLogError::Stream(format!("lagged by {missed}"))))
                    }
                };
                async move { mapped }
            })
            .boxed();
        Ok(events)
    }
}
