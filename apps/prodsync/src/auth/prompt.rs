use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionDecision {
    Extend,
    LogOut,
}

/// Asks the operator whether an expiring session should be extended.
///
/// Implementations may wait indefinitely; the coordinator never times out
/// the decision.
#[async_trait]
pub trait SessionPrompt: Send + Sync {
    async fn decide(&self) -> SessionDecision;
}

/// Headless prompt that always extends.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoExtend;

#[async_trait]
impl SessionPrompt for AutoExtend {
    async fn decide(&self) -> SessionDecision {
        SessionDecision::Extend
    }
}

/// One-shot gate resolved by a UI action.
///
/// `decide` parks until [`DecisionGate::extend`] or [`DecisionGate::log_out`]
/// is called. Observers watch [`DecisionGate::pending`] to know when to show
/// the "session expiring" dialog.
#[derive(Debug)]
pub struct DecisionGate {
    slot: Mutex<Option<oneshot::Sender<SessionDecision>>>,
    pending: watch::Sender<bool>,
}

impl Default for DecisionGate {
    fn default() -> Self {
        Self::new()
    }
}

impl DecisionGate {
    pub fn new() -> Self {
        let (pending, _) = watch::channel(false);
        Self {
            slot: Mutex::new(None),
            pending,
        }
    }

    pub fn pending(&self) -> watch::Receiver<bool> {
        self.pending.subscribe()
    }

    pub fn is_pending(&self) -> bool {
        self.slot.lock().is_some()
    }

    pub fn extend(&self) -> bool {
        self.resolve(SessionDecision::Extend)
    }

    pub fn log_out(&self) -> bool {
        self.resolve(SessionDecision::LogOut)
    }

    /// Returns false when no decision was being waited on.
    pub fn resolve(&self, decision: SessionDecision) -> bool {
        let sender = self.slot.lock().take();
        self.pending.send_replace(false);
        match sender {
            Some(sender) => sender.send(decision).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl SessionPrompt for DecisionGate {
    async fn decide(&self) -> SessionDecision {
        let (tx, rx) = oneshot::channel();
        *self.slot.lock() = Some(tx);
        self.pending.send_replace(true);
        // A dropped sender means the gate itself went away.
        rx.await.unwrap_or(SessionDecision::LogOut)
    }
}
