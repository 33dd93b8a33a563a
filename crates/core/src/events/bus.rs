use tokio::sync::broadcast;

use super::types::DocumentEvent;
use crate::config::DocumentServiceConfig;

/// Fan-out of committed document events to in-process listeners.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DocumentEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Deliver `event` to the current listeners and return how many received it.
    /// Having no listener is not an error.
    pub fn emit(&self, event: DocumentEvent) -> usize {
        let name = event.name();
        match self.sender.send(event) {
            Ok(delivered) => delivered,
            Err(_) => {
                tracing::trace!(event = name, "no event listeners");
                0
            }
        }
    }

    /// Events emitted after this call. A listener that falls more than the channel
    /// capacity behind sees `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<DocumentEvent> {
        self.sender.subscribe()
    }

    pub fn listeners(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DocumentServiceConfig::default().event_bus_capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::EntryEvent;
    use serde_json::json;
    use tokio::sync::broadcast::error::RecvError;

    fn created(document_id: &str) -> DocumentEvent {
        DocumentEvent::Create(EntryEvent::new("api::article.article", document_id, None, json!({})))
    }

    #[tokio::test]
    async fn every_listener_receives_each_event() {
        let bus = EventBus::new(16);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        assert_eq!(bus.listeners(), 2);

        assert_eq!(bus.emit(created("Article1")), 2);
        assert_eq!(first.recv().await.unwrap().entry().document_id, "Article1");
        assert_eq!(second.recv().await.unwrap().entry().document_id, "Article1");
    }

    #[test]
    fn emit_without_listeners_delivers_nothing() {
        assert_eq!(EventBus::default().emit(created("Article1")), 0);
    }

    #[tokio::test]
    async fn slow_listeners_lag() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for n in 0..3 {
            bus.emit(created(&format!("Article{n}")));
        }
        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(1))));
        assert_eq!(rx.recv().await.unwrap().entry().document_id, "Article1");
    }
}
