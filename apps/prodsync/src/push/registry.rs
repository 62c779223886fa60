use parking_lot::RwLock;
use prodsync_proto::{PushDecodeError, PushMessage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// What a topic handler receives.
#[derive(Debug, Clone, PartialEq)]
pub enum PushDelivery {
    Message { topic: String, message: PushMessage },
    /// The body could not be turned into a known message; the receiver should
    /// refetch whatever state the topic covers.
    Resync { topic: String, reason: String },
}

impl PushDelivery {
    pub fn topic(&self) -> &str {
        match self {
            PushDelivery::Message { topic, .. } | PushDelivery::Resync { topic, .. } => topic,
        }
    }
}

/// Handlers run on the connection's reader task and must not block.
pub type PushHandler = Arc<dyn Fn(PushDelivery) + Send + Sync>;

struct TopicEntry {
    subscription_id: String,
    handlers: Vec<(u64, PushHandler)>,
}

/// Topic → handlers table shared by the channel handle and its connection
/// task. One STOMP subscription per topic, however many local handlers.
#[derive(Default)]
pub(crate) struct TopicRegistry {
    topics: RwLock<HashMap<String, TopicEntry>>,
    next_handler: AtomicU64,
    next_subscription: AtomicU64,
}

impl TopicRegistry {
    /// Returns the handler id and, when this is the topic's first handler,
    /// the subscription id that must be announced to the broker.
    pub(crate) fn add(&self, topic: &str, handler: PushHandler) -> (u64, Option<String>) {
        let handler_id = self.next_handler.fetch_add(1, Ordering::Relaxed);
        let mut topics = self.topics.write();
        if let Some(entry) = topics.get_mut(topic) {
            entry.handlers.push((handler_id, handler));
            return (handler_id, None);
        }
        let subscription_id = format!(
            "sub-{}",
            self.next_subscription.fetch_add(1, Ordering::Relaxed)
        );
        topics.insert(
            topic.to_string(),
            TopicEntry {
                subscription_id: subscription_id.clone(),
                handlers: vec![(handler_id, handler)],
            },
        );
        (handler_id, Some(subscription_id))
    }

    /// Returns the subscription id to retract once the topic has no handlers.
    pub(crate) fn remove(&self, topic: &str, handler_id: u64) -> Option<String> {
        let mut topics = self.topics.write();
        let entry = topics.get_mut(topic)?;
        entry.handlers.retain(|(id, _)| *id != handler_id);
        if entry.handlers.is_empty() {
            topics.remove(topic).map(|entry| entry.subscription_id)
        } else {
            None
        }
    }

    /// Every topic that currently has at least one handler.
    pub(crate) fn active(&self) -> Vec<(String, String)> {
        self.topics
            .read()
            .iter()
            .map(|(topic, entry)| (topic.clone(), entry.subscription_id.clone()))
            .collect()
    }

    pub(crate) fn topic_for_subscription(&self, subscription_id: &str) -> Option<String> {
        self.topics
            .read()
            .iter()
            .find(|(_, entry)| entry.subscription_id == subscription_id)
            .map(|(topic, _)| topic.clone())
    }

    pub(crate) fn handler_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|entry| entry.handlers.len())
            .unwrap_or(0)
    }

    /// Decodes one message body and hands it to every handler of `topic`.
    /// Returns the number of handlers invoked.
    pub(crate) fn dispatch(&self, topic: &str, body: &str) -> usize {
        let handlers: Vec<PushHandler> = match self.topics.read().get(topic) {
            Some(entry) => entry
                .handlers
                .iter()
                .map(|(_, handler)| Arc::clone(handler))
                .collect(),
            None => {
                debug!(target: "prodsync::push", topic, "message for topic without handlers");
                return 0;
            }
        };

        let delivery = match PushMessage::decode(body) {
            Ok(message) => PushDelivery::Message {
                topic: topic.to_string(),
                message,
            },
            Err(err) => {
                match &err {
                    PushDecodeError::UnknownType(kind) => {
                        warn!(target: "prodsync::push", topic, kind = %kind, "unknown push message type; requesting resync")
                    }
                    PushDecodeError::Malformed(cause) => {
                        warn!(target: "prodsync::push", topic, error = %cause, "malformed push message; requesting resync")
                    }
                }
                PushDelivery::Resync {
                    topic: topic.to_string(),
                    reason: err.to_string(),
                }
            }
        };

        for handler in &handlers {
            handler(delivery.clone());
        }
        handlers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recorder() -> (PushHandler, Arc<Mutex<Vec<PushDelivery>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: PushHandler = Arc::new(move |delivery| sink.lock().push(delivery));
        (handler, seen)
    }

    #[test]
    fn one_subscription_per_topic() {
        let registry = TopicRegistry::default();
        let (a, _) = recorder();
        let (b, _) = recorder();
        let (first, sub) = registry.add("/topic/production/PR-1", a);
        assert_eq!(sub.as_deref(), Some("sub-0"));
        let (second, sub) = registry.add("/topic/production/PR-1", b);
        assert_eq!(sub, None);
        assert_eq!(registry.handler_count("/topic/production/PR-1"), 2);

        assert_eq!(registry.remove("/topic/production/PR-1", first), None);
        assert_eq!(
            registry.remove("/topic/production/PR-1", second).as_deref(),
            Some("sub-0")
        );
        assert!(registry.active().is_empty());
    }

    #[test]
    fn known_message_reaches_every_handler() {
        let registry = TopicRegistry::default();
        let (a, seen_a) = recorder();
        let (b, seen_b) = recorder();
        registry.add("/topic/production/PR-1", a);
        registry.add("/topic/production/PR-1", b);

        let body = r#"{"type":"FIELD_UPDATED","payload":{"fieldId":101,"value":"9.9"}}"#;
        assert_eq!(registry.dispatch("/topic/production/PR-1", body), 2);
        assert!(matches!(
            seen_a.lock().as_slice(),
            [PushDelivery::Message { message: PushMessage::FieldUpdated(_), .. }]
        ));
        assert_eq!(seen_b.lock().len(), 1);
    }

    #[test]
    fn unknown_type_becomes_resync() {
        let registry = TopicRegistry::default();
        let (handler, seen) = recorder();
        registry.add("/topic/production/PR-1", handler);
        registry.dispatch(
            "/topic/production/PR-1",
            r#"{"type":"FIELD_RENAMED","payload":{}}"#,
        );
        registry.dispatch("/topic/production/PR-1", "not json");
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        match &seen[0] {
            PushDelivery::Resync { topic, reason } => {
                assert_eq!(topic, "/topic/production/PR-1");
                assert!(reason.contains("FIELD_RENAMED"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(seen[1], PushDelivery::Resync { .. }));
    }

    #[test]
    fn subscription_ids_resolve_to_topics() {
        let registry = TopicRegistry::default();
        let (handler, _) = recorder();
        registry.add("/topic/production/created", handler);
        assert_eq!(
            registry.topic_for_subscription("sub-0").as_deref(),
            Some("/topic/production/created")
        );
        assert_eq!(registry.dispatch("/topic/other", "{}"), 0);
    }
}
