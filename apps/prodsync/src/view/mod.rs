//! Wiring of one open production: snapshot, push topic, and field controllers.

mod board;

pub use board::ProductionBoard;

use crate::field::{AnswerWriter, FieldController, SaveStrategy, ValueKind};
use crate::push::{PushChannel, PushDelivery, Subscription};
use crate::sync::{ProductionSync, SnapshotSource, SyncError};
use crate::transport::ApiError;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use prodsync_proto::{
    production_topic, AnswerKey, ClosingState, ProductionSnapshot, PushMessage, StateChange,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Closes a production as finished or cancelled.
#[async_trait]
pub trait StateWriter: Send + Sync {
    async fn close_production(&self, code: &str, state: ClosingState) -> Result<(), ApiError>;
}

/// Everything a view needs from the server.
pub trait ProductionBackend: SnapshotSource + AnswerWriter + StateWriter {}

impl<T: SnapshotSource + AnswerWriter + StateWriter> ProductionBackend for T {}

type Controllers = Arc<Mutex<HashMap<AnswerKey, FieldController>>>;

pub struct ProductionView {
    code: String,
    sync: Arc<ProductionSync>,
    writer: Arc<dyn AnswerWriter>,
    states: Arc<dyn StateWriter>,
    controllers: Controllers,
    subscription: Option<Subscription>,
    tasks: Vec<JoinHandle<()>>,
}

impl ProductionView {
    /// Subscribes to the production topic, loads the snapshot, then starts
    /// applying deliveries. Messages that arrive during the load are queued
    /// and applied afterwards in order.
    pub async fn open<B>(code: impl Into<String>, backend: Arc<B>, push: &PushChannel) -> Result<Self, SyncError>
    where
        B: ProductionBackend + 'static,
    {
        let code = code.into();
        let source: Arc<dyn SnapshotSource> = backend.clone();
        let writer: Arc<dyn AnswerWriter> = backend.clone();
        let states: Arc<dyn StateWriter> = backend;
        let sync = Arc::new(ProductionSync::new(code.clone(), source));

        let (deliveries, mut queued) = mpsc::unbounded_channel::<PushDelivery>();
        let subscription = push.subscribe(production_topic(&code), move |delivery| {
            let _ = deliveries.send(delivery);
        });

        sync.load().await?;

        let controllers: Controllers = Arc::default();
        let mut changes = sync.subscribe_changes();

        let pump = {
            let sync = Arc::clone(&sync);
            tokio::spawn(async move {
                while let Some(delivery) = queued.recv().await {
                    if let Err(err) = sync.handle(delivery).await {
                        warn!(target: "prodsync::sync", code = %sync.code(), error = %err, "push delivery not applied");
                    }
                }
            })
        };

        let fan_out = {
            let sync = Arc::clone(&sync);
            let controllers = Arc::clone(&controllers);
            tokio::spawn(async move {
                loop {
                    match changes.recv().await {
                        Ok(change) => {
                            let controller = controllers.lock().get(&change.key).cloned();
                            if let Some(controller) = controller {
                                controller.observe_canonical(change.value);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(target: "prodsync::sync", skipped, "change feed lagged; reconciling mounted fields");
                            let mounted: Vec<FieldController> =
                                controllers.lock().values().cloned().collect();
                            for controller in mounted {
                                controller.observe_canonical(sync.value(&controller.key()));
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        };

        info!(target: "prodsync::sync", code = %code, "production view opened");
        Ok(Self {
            code,
            sync,
            writer,
            states,
            controllers,
            subscription: Some(subscription),
            tasks: vec![pump, fan_out],
        })
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn sync(&self) -> &Arc<ProductionSync> {
        &self.sync
    }

    pub fn snapshot(&self) -> Option<Arc<ProductionSnapshot>> {
        self.sync.snapshot()
    }

    /// Input kind declared by the form structure for `key`.
    pub fn value_kind(&self, key: &AnswerKey) -> ValueKind {
        let Some(snapshot) = self.sync.snapshot() else {
            return ValueKind::Text;
        };
        let type_name = match key {
            AnswerKey::Field(id) => snapshot
                .structure
                .fields
                .iter()
                .find(|field| field.id == *id)
                .and_then(|field| field.field_type.clone()),
            AnswerKey::Cell(cell) => snapshot
                .structure
                .table(cell.table_id)
                .and_then(|table| table.columns.iter().find(|col| col.id == cell.col_id))
                .and_then(|col| col.column_type.clone())
                .or_else(|| {
                    snapshot
                        .cell_answers
                        .get(cell)
                        .and_then(|answer| answer.column_type.clone())
                }),
        };
        ValueKind::from_type_name(type_name.as_deref())
    }

    /// Returns the controller for `key`, creating one seeded with the
    /// canonical value on first use.
    pub fn mount(&self, key: AnswerKey, kind: ValueKind, strategy: SaveStrategy) -> FieldController {
        let mut controllers = self.controllers.lock();
        if let Some(existing) = controllers.get(&key) {
            return existing.clone();
        }
        let controller = FieldController::new(
            self.code.clone(),
            key,
            kind,
            strategy,
            Arc::clone(&self.writer),
            Arc::clone(&self.sync),
        );
        controllers.insert(key, controller.clone());
        debug!(target: "prodsync::field", key = %key, ?kind, "field mounted");
        controller
    }

    pub fn unmount(&self, key: &AnswerKey) {
        if let Some(controller) = self.controllers.lock().remove(key) {
            controller.unmount();
        }
    }

    pub fn mounted(&self) -> usize {
        self.controllers.lock().len()
    }

    /// Closes the production and reflects the new status locally without
    /// waiting for the push echo.
    pub async fn change_state(&self, state: ClosingState) -> Result<(), ApiError> {
        self.states.close_production(&self.code, state).await?;
        let applied = self.sync.apply(PushMessage::StateChanged(StateChange {
            code: Some(self.code.clone()),
            status: state.into(),
            ended_at: Some(Utc::now()),
            timestamp: None,
        }));
        if let Err(err) = applied {
            warn!(target: "prodsync::sync", code = %self.code, error = %err, "state change not reflected locally");
        }
        info!(target: "prodsync::sync", code = %self.code, ?state, "production closed");
        Ok(())
    }

    /// Unsubscribes and unmounts every field.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(subscription) = self.subscription.take() else {
            return;
        };
        subscription.unsubscribe();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        for (_, controller) in self.controllers.lock().drain() {
            controller.unmount();
        }
        debug!(target: "prodsync::sync", code = %self.code, "production view closed");
    }
}

impl Drop for ProductionView {
    fn drop(&mut self) {
        self.shutdown();
    }
}
