//! Per-field edit buffer and save state machine.
//!
//! A controller sits between one input and the canonical snapshot:
//! `Clean → Editing → Saving → {Clean | Error}`. While the buffer is dirty or
//! focused, canonical updates are remembered but never written over what the
//! operator is typing.

mod validate;

pub use validate::{normalize, ValidationError, ValueKind};

use crate::sync::{CommittedAnswer, ProductionSync};
use crate::transport::ApiError;
use async_trait::async_trait;
use parking_lot::Mutex;
use prodsync_proto::AnswerKey;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Persists one answer and returns the committed record.
#[async_trait]
pub trait AnswerWriter: Send + Sync {
    async fn write_answer(
        &self,
        code: &str,
        key: AnswerKey,
        value: Option<String>,
    ) -> Result<CommittedAnswer, ApiError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveStrategy {
    /// Flush after the input has been idle for the given delay, and on blur.
    Debounced(Duration),
    /// Flush only on an explicit `save`.
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldPhase {
    Clean,
    Editing,
    Saving,
    Error,
}

#[derive(Debug, Clone, Error)]
pub enum FieldFailure {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Api(#[from] ApiError),
}

#[derive(Debug, Clone)]
pub struct FieldEditState {
    pub buffered_value: String,
    pub canonical: Option<String>,
    pub dirty: bool,
    pub focused: bool,
    pub saving: bool,
    pub last_error: Option<FieldFailure>,
}

impl FieldEditState {
    fn seeded(canonical: Option<String>) -> Self {
        Self {
            buffered_value: canonical.clone().unwrap_or_default(),
            canonical,
            dirty: false,
            focused: false,
            saving: false,
            last_error: None,
        }
    }

    pub fn phase(&self) -> FieldPhase {
        if self.saving {
            FieldPhase::Saving
        } else if self.last_error.is_some() {
            FieldPhase::Error
        } else if self.dirty {
            FieldPhase::Editing
        } else {
            FieldPhase::Clean
        }
    }

    fn diverges(&self) -> bool {
        self.buffered_value != self.canonical.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub enum FlushOutcome {
    Saved(Option<String>),
    /// Nothing to send: the buffer matches canonical.
    Unchanged,
    /// A flush for this field is already in flight.
    AlreadySaving,
    Failed(FieldFailure),
}

struct FieldInner {
    view: FieldEditState,
    // Bumped on every edit; tells a finishing flush whether it sent the
    // current text.
    revision: u64,
    mounted: bool,
}

#[derive(Default)]
struct Timers {
    generation: u64,
    // Still waiting out its delay; any newer schedule or explicit save
    // replaces it.
    sleeping: Option<(u64, JoinHandle<()>)>,
    // Woke up and owns the flush it is running. Only unmount aborts it.
    flushing: Option<JoinHandle<()>>,
}

struct FieldShared {
    code: String,
    key: AnswerKey,
    kind: ValueKind,
    strategy: SaveStrategy,
    writer: Arc<dyn AnswerWriter>,
    sync: Arc<ProductionSync>,
    inner: Mutex<FieldInner>,
    published: watch::Sender<FieldEditState>,
    timers: Mutex<Timers>,
}

#[derive(Clone)]
pub struct FieldController {
    shared: Arc<FieldShared>,
}

impl FieldController {
    pub fn new(
        code: impl Into<String>,
        key: AnswerKey,
        kind: ValueKind,
        strategy: SaveStrategy,
        writer: Arc<dyn AnswerWriter>,
        sync: Arc<ProductionSync>,
    ) -> Self {
        let view = FieldEditState::seeded(sync.value(&key));
        let (published, _) = watch::channel(view.clone());
        Self {
            shared: Arc::new(FieldShared {
                code: code.into(),
                key,
                kind,
                strategy,
                writer,
                sync,
                inner: Mutex::new(FieldInner {
                    view,
                    revision: 0,
                    mounted: true,
                }),
                published,
                timers: Mutex::new(Timers::default()),
            }),
        }
    }

    pub fn key(&self) -> AnswerKey {
        self.shared.key
    }

    pub fn kind(&self) -> ValueKind {
        self.shared.kind
    }

    pub fn state(&self) -> FieldEditState {
        self.shared.inner.lock().view.clone()
    }

    pub fn phase(&self) -> FieldPhase {
        self.shared.inner.lock().view.phase()
    }

    pub fn canonical(&self) -> Option<String> {
        self.shared.inner.lock().view.canonical.clone()
    }

    pub fn watch(&self) -> watch::Receiver<FieldEditState> {
        self.shared.published.subscribe()
    }

    pub fn focus(&self) {
        self.shared.update(|inner| inner.view.focused = true);
    }

    /// Leaving the input adopts any canonical value that arrived while it was
    /// focused but untouched. Debounced fields flush right away.
    pub fn blur(&self) {
        let flush_now = self.shared.update(|inner| {
            inner.view.focused = false;
            if !inner.view.dirty && !inner.view.saving {
                inner.view.buffered_value = inner.view.canonical.clone().unwrap_or_default();
            }
            inner.view.dirty && !inner.view.saving
        });
        if flush_now && matches!(self.shared.strategy, SaveStrategy::Debounced(_)) {
            self.shared.schedule(Duration::ZERO);
        }
    }

    pub fn edit(&self, text: impl Into<String>) {
        let text = text.into();
        let saving = self.shared.update(|inner| {
            inner.revision += 1;
            inner.view.buffered_value = text;
            inner.view.dirty = inner.view.diverges();
            inner.view.last_error = None;
            inner.view.saving
        });
        // A running flush reschedules itself once it sees the newer revision.
        if let SaveStrategy::Debounced(delay) = self.shared.strategy {
            if !saving {
                self.shared.schedule(delay);
            }
        }
    }

    /// Flushes the buffer now, cancelling any pending debounce. A debounced
    /// flush that is already running is left alone and this returns
    /// `AlreadySaving`.
    pub async fn save(&self) -> FlushOutcome {
        self.shared.cancel_pending();
        FieldShared::flush(&self.shared).await
    }

    /// Re-sends the preserved buffer after a failure.
    pub async fn retry(&self) -> FlushOutcome {
        self.save().await
    }

    /// Drops local edits and returns to the canonical value.
    pub fn discard(&self) {
        self.shared.cancel_pending();
        self.shared.update(|inner| {
            inner.revision += 1;
            inner.view.buffered_value = inner.view.canonical.clone().unwrap_or_default();
            inner.view.dirty = false;
            inner.view.last_error = None;
        });
    }

    /// Records a new canonical value; adopted only when nobody is editing.
    pub fn observe_canonical(&self, value: Option<String>) {
        self.shared.update(|inner| {
            if !inner.mounted {
                return;
            }
            inner.view.canonical = value;
            if inner.view.saving {
                return;
            }
            if !inner.view.dirty && !inner.view.focused {
                inner.view.buffered_value = inner.view.canonical.clone().unwrap_or_default();
            } else if inner.view.dirty && !inner.view.diverges() {
                inner.view.dirty = false;
                inner.view.last_error = None;
            }
        });
    }

    /// Stops the debounce timer, including a debounced flush it is running.
    pub fn unmount(&self) {
        let mut timers = self.shared.timers.lock();
        if let Some((_, sleeping)) = timers.sleeping.take() {
            sleeping.abort();
        }
        if let Some(flushing) = timers.flushing.take() {
            flushing.abort();
        }
        drop(timers);
        self.shared.update(|inner| inner.mounted = false);
        debug!(target: "prodsync::field", key = %self.shared.key, "field unmounted");
    }
}

impl FieldShared {
    fn update<R>(&self, change: impl FnOnce(&mut FieldInner) -> R) -> R {
        let mut inner = self.inner.lock();
        let result = change(&mut inner);
        self.published.send_replace(inner.view.clone());
        result
    }

    fn cancel_pending(&self) {
        if let Some((_, sleeping)) = self.timers.lock().sleeping.take() {
            sleeping.abort();
        }
    }

    fn schedule(self: &Arc<Self>, delay: Duration) {
        let mut timers = self.timers.lock();
        timers.generation += 1;
        let generation = timers.generation;
        let shared = Arc::clone(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if shared.claim_timer(generation) {
                FieldShared::flush(&shared).await;
            }
        });
        if let Some((_, previous)) = timers.sleeping.replace((generation, task)) {
            previous.abort();
        }
    }

    /// Moves a woken timer from `sleeping` to `flushing`. Fails if the timer
    /// was replaced or cancelled while it slept.
    fn claim_timer(&self, generation: u64) -> bool {
        let mut timers = self.timers.lock();
        match timers.sleeping.take() {
            Some((current, task)) if current == generation => {
                timers.flushing = Some(task);
                true
            }
            other => {
                timers.sleeping = other;
                false
            }
        }
    }

    async fn flush(self: &Arc<Self>) -> FlushOutcome {
        let (value, revision) = {
            let mut inner = self.inner.lock();
            if !inner.mounted {
                return FlushOutcome::Unchanged;
            }
            if inner.view.saving {
                return FlushOutcome::AlreadySaving;
            }
            if !inner.view.dirty {
                return FlushOutcome::Unchanged;
            }
            let today = chrono::Local::now().date_naive();
            match normalize(self.kind, &inner.view.buffered_value, today) {
                Ok(value) => {
                    inner.view.saving = true;
                    inner.view.last_error = None;
                    self.published.send_replace(inner.view.clone());
                    (value, inner.revision)
                }
                Err(err) => {
                    debug!(target: "prodsync::field", key = %self.key, error = %err, "input rejected");
                    let failure = FieldFailure::Validation(err);
                    inner.view.last_error = Some(failure.clone());
                    self.published.send_replace(inner.view.clone());
                    return FlushOutcome::Failed(failure);
                }
            }
        };

        let mut guard = SavingGuard {
            shared: self,
            armed: true,
        };
        let result = self
            .writer
            .write_answer(&self.code, self.key, value)
            .await;
        guard.armed = false;

        match result {
            Ok(committed) => {
                let committed_value = committed.value().map(str::to_string);
                if let Err(err) = self.sync.commit(committed) {
                    warn!(target: "prodsync::field", key = %self.key, error = %err, "saved answer not merged into snapshot");
                }
                let follow_up = self.update(|inner| {
                    inner.view.saving = false;
                    inner.view.canonical = committed_value.clone();
                    if inner.revision == revision {
                        inner.view.buffered_value = committed_value.clone().unwrap_or_default();
                        inner.view.dirty = false;
                    } else {
                        inner.view.dirty = inner.view.diverges();
                    }
                    inner.view.dirty && inner.mounted
                });
                debug!(target: "prodsync::field", key = %self.key, "answer saved");
                if let (true, SaveStrategy::Debounced(delay)) = (follow_up, self.strategy) {
                    self.schedule(delay);
                }
                FlushOutcome::Saved(committed_value)
            }
            Err(err) => {
                warn!(target: "prodsync::field", key = %self.key, error = %err, "answer save failed");
                let failure = FieldFailure::Api(err);
                self.update(|inner| {
                    inner.view.saving = false;
                    inner.view.last_error = Some(failure.clone());
                });
                FlushOutcome::Failed(failure)
            }
        }
    }
}

/// Clears the saving flag if a flush is cancelled mid-request.
struct SavingGuard<'a> {
    shared: &'a FieldShared,
    armed: bool,
}

impl Drop for SavingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.update(|inner| inner.view.saving = false);
        }
    }
}
