use crate::push::{PushChannel, PushDelivery, Subscription};
use parking_lot::RwLock;
use prodsync_proto::{
    ProductionMetadata, PushMessage, TOPIC_PRODUCTIONS_STATE_CHANGED, TOPIC_PRODUCTION_CREATED,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Default)]
struct BoardState {
    entries: RwLock<BTreeMap<String, ProductionMetadata>>,
}

/// Live list of productions kept current from the list-level topics.
pub struct ProductionBoard {
    state: Arc<BoardState>,
    revision: Arc<watch::Sender<u64>>,
    subscriptions: Vec<Subscription>,
}

impl ProductionBoard {
    pub fn open(push: &PushChannel, initial: impl IntoIterator<Item = ProductionMetadata>) -> Self {
        let state = Arc::new(BoardState::default());
        state.entries.write().extend(
            initial
                .into_iter()
                .map(|production| (production.code.clone(), production)),
        );
        let revision = Arc::new(watch::channel(0u64).0);

        let subscriptions = [TOPIC_PRODUCTION_CREATED, TOPIC_PRODUCTIONS_STATE_CHANGED]
            .into_iter()
            .map(|topic| {
                let state = Arc::clone(&state);
                let revision = Arc::clone(&revision);
                push.subscribe(topic, move |delivery| {
                    if state.apply(delivery) {
                        revision.send_modify(|value| *value += 1);
                    }
                })
            })
            .collect();

        Self {
            state,
            revision,
            subscriptions,
        }
    }

    pub fn get(&self, code: &str) -> Option<ProductionMetadata> {
        self.state.entries.read().get(code).cloned()
    }

    pub fn list(&self) -> Vec<ProductionMetadata> {
        self.state.entries.read().values().cloned().collect()
    }

    /// Bumped on every applied change.
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn close(self) {
        for subscription in self.subscriptions {
            subscription.unsubscribe();
        }
    }
}

impl BoardState {
    fn apply(&self, delivery: PushDelivery) -> bool {
        let message = match delivery {
            PushDelivery::Message { message, .. } => message,
            PushDelivery::Resync { topic, reason } => {
                warn!(target: "prodsync::sync", topic = %topic, reason = %reason, "unreadable list notification");
                return false;
            }
        };
        match message {
            PushMessage::ProductionCreated(created) => {
                let production = created.production;
                debug!(target: "prodsync::sync", code = %production.code, "production created");
                self.entries
                    .write()
                    .insert(production.code.clone(), production);
                true
            }
            PushMessage::StateChanged(change) => {
                let Some(code) = change.code else {
                    return false;
                };
                let mut entries = self.entries.write();
                match entries.get_mut(&code) {
                    Some(entry) => {
                        entry.status = change.status;
                        if change.ended_at.is_some() {
                            entry.ended_at = change.ended_at;
                        }
                        true
                    }
                    None => {
                        debug!(target: "prodsync::sync", code = %code, "state change for unlisted production");
                        false
                    }
                }
            }
            _ => false,
        }
    }
}
