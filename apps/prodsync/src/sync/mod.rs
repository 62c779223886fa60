//! Canonical snapshot of one production and the rules that mutate it.
//!
//! `ProductionSync` is the only writer. Readers hold `Arc<ProductionSnapshot>`
//! views and learn about per-answer changes from a broadcast of
//! [`CanonicalChange`]s.

use crate::push::PushDelivery;
use crate::transport::ApiError;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use prodsync_proto::{
    AnswerKey, AnswerRecord, CellAnswerRecord, PushMessage, ProductionSnapshot, SnapshotDocument,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

const CHANGE_CAPACITY: usize = 256;

/// Source of full snapshots.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_snapshot(&self, code: &str) -> Result<SnapshotDocument, ApiError>;
}

/// Answer as acknowledged by the server after a save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommittedAnswer {
    Field(AnswerRecord),
    Cell(CellAnswerRecord),
}

impl CommittedAnswer {
    pub fn key(&self) -> AnswerKey {
        match self {
            CommittedAnswer::Field(record) => AnswerKey::Field(record.field_id),
            CommittedAnswer::Cell(record) => AnswerKey::Cell(record.key()),
        }
    }

    pub fn value(&self) -> Option<&str> {
        match self {
            CommittedAnswer::Field(record) => record.value.as_deref(),
            CommittedAnswer::Cell(record) => record.value.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Fetch,
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalChange {
    pub key: AnswerKey,
    pub value: Option<String>,
    pub origin: ChangeOrigin,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("snapshot has not been loaded yet")]
    NotLoaded,
    #[error("snapshot fetch failed: {0}")]
    Fetch(#[from] ApiError),
}

pub struct ProductionSync {
    code: String,
    source: Arc<dyn SnapshotSource>,
    snapshot: watch::Sender<Option<Arc<ProductionSnapshot>>>,
    changes: broadcast::Sender<CanonicalChange>,
    // Serializes writers so a fetch cannot interleave with a merge.
    write: Mutex<()>,
    resyncs: AtomicU64,
}

impl ProductionSync {
    pub fn new(code: impl Into<String>, source: Arc<dyn SnapshotSource>) -> Self {
        let (snapshot, _) = watch::channel(None);
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            code: code.into(),
            source,
            snapshot,
            changes,
            write: Mutex::new(()),
            resyncs: AtomicU64::new(0),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn snapshot(&self) -> Option<Arc<ProductionSnapshot>> {
        self.snapshot.borrow().clone()
    }

    pub fn value(&self, key: &AnswerKey) -> Option<String> {
        self.snapshot
            .borrow()
            .as_ref()
            .and_then(|snapshot| snapshot.value(key).map(str::to_string))
    }

    pub fn watch(&self) -> watch::Receiver<Option<Arc<ProductionSnapshot>>> {
        self.snapshot.subscribe()
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<CanonicalChange> {
        self.changes.subscribe()
    }

    /// Number of full refetches triggered by push deliveries.
    pub fn resync_count(&self) -> u64 {
        self.resyncs.load(Ordering::Relaxed)
    }

    /// Fetches the full snapshot and replaces the canonical state.
    pub async fn load(&self) -> Result<Arc<ProductionSnapshot>, SyncError> {
        let document = self.source.fetch_snapshot(&self.code).await?;
        let fresh = ProductionSnapshot::from_document(document);
        if fresh.metadata.code != self.code {
            warn!(
                target: "prodsync::sync",
                code = %self.code,
                returned = %fresh.metadata.code,
                "snapshot carries a different production code"
            );
        }

        let _guard = self.write.lock();
        let previous = self.snapshot.borrow().clone();
        let fresh = Arc::new(fresh);
        self.snapshot.send_replace(Some(Arc::clone(&fresh)));

        let mut changed = 0usize;
        let keys = fresh
            .keys()
            .chain(previous.iter().flat_map(|snapshot| snapshot.keys().collect::<Vec<_>>()))
            .collect::<std::collections::BTreeSet<_>>();
        for key in keys {
            let before = previous.as_ref().and_then(|snapshot| snapshot.value(&key));
            let after = fresh.value(&key);
            if previous.is_none() || before != after {
                changed += 1;
                self.emit(key, after.map(str::to_string), ChangeOrigin::Fetch);
            }
        }
        info!(
            target: "prodsync::sync",
            code = %self.code,
            answered = fresh.progress.answered_elements,
            total = fresh.progress.total_elements,
            changed,
            "snapshot loaded"
        );
        Ok(fresh)
    }

    /// Refetches after a delivery could not be applied incrementally.
    pub async fn resync(&self) -> Result<Arc<ProductionSnapshot>, SyncError> {
        self.resyncs.fetch_add(1, Ordering::Relaxed);
        info!(target: "prodsync::sync", code = %self.code, "resynchronizing production");
        self.load().await
    }

    /// Records a locally saved answer.
    pub fn commit(&self, answer: CommittedAnswer) -> Result<(), SyncError> {
        let key = answer.key();
        let value = answer.value().map(str::to_string);
        let now = Some(Utc::now());
        let announce = CanonicalChange {
            key,
            value,
            origin: ChangeOrigin::Local,
        };
        self.mutate(Some(announce), |snapshot| match answer {
            CommittedAnswer::Field(mut record) => {
                record.updated_at = now;
                snapshot.field_answers.insert(record.field_id, record);
            }
            CommittedAnswer::Cell(mut record) => {
                record.updated_at = now;
                let existing = snapshot.cell_answers.get(&record.key());
                if let Some(existing) = existing {
                    record.column_type = record.column_type.or_else(|| existing.column_type.clone());
                    record.row_label = record.row_label.or_else(|| existing.row_label.clone());
                    record.col_label = record.col_label.or_else(|| existing.col_label.clone());
                }
                snapshot.cell_answers.insert(record.key(), record);
            }
        })?;
        debug!(target: "prodsync::sync", key = %key, "local answer committed");
        Ok(())
    }

    pub fn commit_field(&self, record: AnswerRecord) -> Result<(), SyncError> {
        self.commit(CommittedAnswer::Field(record))
    }

    pub fn commit_cell(&self, record: CellAnswerRecord) -> Result<(), SyncError> {
        self.commit(CommittedAnswer::Cell(record))
    }

    /// Merges one push message. Answers are last-message-wins per key.
    pub fn apply(&self, message: PushMessage) -> Result<(), SyncError> {
        match message {
            PushMessage::FieldUpdated(update) => {
                let announce = CanonicalChange {
                    key: AnswerKey::Field(update.field_id),
                    value: update.value.clone(),
                    origin: ChangeOrigin::Remote,
                };
                self.mutate(Some(announce), |snapshot| {
                    let answer_id = update.answer_id.or_else(|| {
                        snapshot
                            .field_answers
                            .get(&update.field_id)
                            .and_then(|existing| existing.answer_id)
                    });
                    snapshot.field_answers.insert(
                        update.field_id,
                        AnswerRecord {
                            answer_id,
                            field_id: update.field_id,
                            value: update.value,
                            updated_at: update.timestamp,
                        },
                    );
                })?;
            }
            PushMessage::TableCellUpdated(update) => {
                let cell = update.key();
                let announce = CanonicalChange {
                    key: AnswerKey::Cell(cell),
                    value: update.value.clone(),
                    origin: ChangeOrigin::Remote,
                };
                self.mutate(Some(announce), |snapshot| {
                    let mut record = snapshot
                        .cell_answers
                        .remove(&cell)
                        .unwrap_or_else(|| CellAnswerRecord::empty(cell));
                    record.value = update.value;
                    record.updated_at = update.timestamp;
                    if update.column_type.is_some() {
                        record.column_type = update.column_type;
                    }
                    if update.row_label.is_some() {
                        record.row_label = update.row_label;
                    }
                    if update.col_label.is_some() {
                        record.col_label = update.col_label;
                    }
                    snapshot.cell_answers.insert(cell, record);
                })?;
            }
            PushMessage::StateChanged(change) => {
                if let Some(code) = change.code.as_deref() {
                    if code != self.code {
                        debug!(target: "prodsync::sync", code, "state change for another production");
                        return Ok(());
                    }
                }
                self.mutate(None, |snapshot| {
                    snapshot.metadata.status = change.status;
                    if change.ended_at.is_some() || !change.status.is_closed() {
                        snapshot.metadata.ended_at = change.ended_at;
                    }
                })?;
                info!(target: "prodsync::sync", code = %self.code, status = ?change.status, "production state changed");
            }
            PushMessage::MetadataUpdated(update) => {
                self.mutate(None, |snapshot| {
                    snapshot.metadata.batch_label = update.batch_label;
                    snapshot.metadata.assignee = update.assignee;
                    snapshot.metadata.notes = update.notes;
                })?;
            }
            PushMessage::ProductionCreated(created) => {
                debug!(
                    target: "prodsync::sync",
                    code = %created.production.code,
                    "ignoring creation notice on a record topic"
                );
            }
        }
        Ok(())
    }

    /// Routes a push delivery: messages merge, resync requests refetch.
    pub async fn handle(&self, delivery: PushDelivery) -> Result<(), SyncError> {
        match delivery {
            PushDelivery::Message { message, .. } => self.apply(message),
            PushDelivery::Resync { topic, reason } => {
                warn!(target: "prodsync::sync", topic = %topic, reason = %reason, "push delivery requires resync");
                self.resync().await.map(|_| ())
            }
        }
    }

    /// Applies `change` and broadcasts `announce` under one write lock, so
    /// broadcast order always matches snapshot order.
    fn mutate<F>(&self, announce: Option<CanonicalChange>, change: F) -> Result<(), SyncError>
    where
        F: FnOnce(&mut ProductionSnapshot),
    {
        let _guard = self.write.lock();
        let current = self.snapshot.borrow().clone().ok_or(SyncError::NotLoaded)?;
        let mut next = (*current).clone();
        change(&mut next);
        next.recompute_progress();
        self.snapshot.send_replace(Some(Arc::new(next)));
        if let Some(CanonicalChange { key, value, origin }) = announce {
            self.emit(key, value, origin);
        }
        Ok(())
    }

    fn emit(&self, key: AnswerKey, value: Option<String>, origin: ChangeOrigin) {
        // No receivers is fine: nothing is mounted yet.
        let _ = self.changes.send(CanonicalChange { key, value, origin });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prodsync_proto::{CellKey, CellUpdate, FieldUpdate, MetadataUpdate, ProductionStatus, StateChange};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct FakeSource {
        fetches: AtomicUsize,
        value: Mutex<&'static str>,
    }

    #[async_trait]
    impl SnapshotSource for FakeSource {
        async fn fetch_snapshot(&self, code: &str) -> Result<SnapshotDocument, ApiError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let value = *self.value.lock();
            let document = json!({
                "production": { "code": code, "status": "IN_PROGRESS", "batchLabel": "B-1" },
                "fields": [{ "id": 101 }, { "id": 211 }],
                "tables": [{ "id": 7, "rows": [{ "id": 1 }], "columns": [{ "id": 1 }, { "id": 2 }] }],
                "fieldAnswers": [{ "fieldId": 101, "value": value }],
                "cellAnswers": [{ "tableId": 7, "rowId": 1, "colId": 1, "value": "ok", "rowLabel": "Shift A" }]
            });
            Ok(serde_json::from_value(document).unwrap())
        }
    }

    fn sync() -> (ProductionSync, Arc<FakeSource>) {
        let source = Arc::new(FakeSource {
            fetches: AtomicUsize::new(0),
            value: Mutex::new("4.5"),
        });
        (ProductionSync::new("PR-1", source.clone()), source)
    }

    fn field_update(field_id: u64, value: &str) -> PushMessage {
        PushMessage::FieldUpdated(FieldUpdate {
            field_id,
            answer_id: None,
            value: Some(value.into()),
            author_email: Some("other@plant.test".into()),
            timestamp: None,
        })
    }

    #[tokio::test]
    async fn merge_before_load_is_rejected() {
        let (sync, _) = sync();
        assert!(matches!(
            sync.apply(field_update(101, "1")),
            Err(SyncError::NotLoaded)
        ));
    }

    #[tokio::test]
    async fn load_emits_every_key_then_only_differences() {
        let (sync, source) = sync();
        let mut changes = sync.subscribe_changes();
        let snapshot = sync.load().await.unwrap();
        assert_eq!(snapshot.progress.total_elements, 4);
        assert_eq!(snapshot.progress.answered_elements, 2);
        assert_eq!(changes.try_recv().unwrap().origin, ChangeOrigin::Fetch);
        assert_eq!(changes.try_recv().unwrap().origin, ChangeOrigin::Fetch);
        assert!(changes.try_recv().is_err());

        *source.value.lock() = "5.0";
        sync.load().await.unwrap();
        let change = changes.try_recv().unwrap();
        assert_eq!(change.key, AnswerKey::Field(101));
        assert_eq!(change.value.as_deref(), Some("5.0"));
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn remote_field_update_overwrites_and_recomputes() {
        let (sync, _) = sync();
        sync.load().await.unwrap();
        let mut changes = sync.subscribe_changes();
        sync.apply(field_update(211, "99")).unwrap();
        assert_eq!(sync.value(&AnswerKey::Field(211)).as_deref(), Some("99"));
        assert_eq!(sync.snapshot().unwrap().progress.answered_elements, 3);
        let change = changes.try_recv().unwrap();
        assert_eq!(change.origin, ChangeOrigin::Remote);

        // Last message wins for the same key.
        sync.apply(field_update(211, "98")).unwrap();
        assert_eq!(sync.value(&AnswerKey::Field(211)).as_deref(), Some("98"));
    }

    #[tokio::test]
    async fn cell_update_keeps_known_labels() {
        let (sync, _) = sync();
        sync.load().await.unwrap();
        sync.apply(PushMessage::TableCellUpdated(CellUpdate {
            table_id: 7,
            row_id: 1,
            col_id: 1,
            value: Some("nok".into()),
            column_type: None,
            row_label: None,
            col_label: None,
            author_email: None,
            timestamp: None,
        }))
        .unwrap();
        let snapshot = sync.snapshot().unwrap();
        let record = &snapshot.cell_answers[&CellKey::new(7, 1, 1)];
        assert_eq!(record.value.as_deref(), Some("nok"));
        assert_eq!(record.row_label.as_deref(), Some("Shift A"));
    }

    #[tokio::test]
    async fn state_and_metadata_updates() {
        let (sync, _) = sync();
        sync.load().await.unwrap();
        sync.apply(PushMessage::StateChanged(StateChange {
            code: Some("PR-9".into()),
            status: ProductionStatus::Cancelled,
            ended_at: None,
            timestamp: None,
        }))
        .unwrap();
        assert_eq!(sync.snapshot().unwrap().metadata.status, ProductionStatus::InProgress);

        sync.apply(PushMessage::StateChanged(StateChange {
            code: Some("PR-1".into()),
            status: ProductionStatus::Finished,
            ended_at: Some(Utc::now()),
            timestamp: None,
        }))
        .unwrap();
        sync.apply(PushMessage::MetadataUpdated(MetadataUpdate {
            batch_label: None,
            assignee: Some("kim".into()),
            notes: None,
            timestamp: None,
        }))
        .unwrap();
        let metadata = sync.snapshot().unwrap().metadata.clone();
        assert_eq!(metadata.status, ProductionStatus::Finished);
        assert!(metadata.ended_at.is_some());
        assert_eq!(metadata.batch_label, None);
        assert_eq!(metadata.assignee.as_deref(), Some("kim"));
    }

    #[tokio::test]
    async fn local_commit_stamps_and_emits() {
        let (sync, _) = sync();
        sync.load().await.unwrap();
        let mut changes = sync.subscribe_changes();
        sync.commit_field(AnswerRecord {
            answer_id: Some(5),
            field_id: 211,
            value: Some("12".into()),
            updated_at: None,
        })
        .unwrap();
        let snapshot = sync.snapshot().unwrap();
        assert!(snapshot.field_answers[&211].updated_at.is_some());
        let change = changes.try_recv().unwrap();
        assert_eq!(change.origin, ChangeOrigin::Local);
        assert_eq!(change.value.as_deref(), Some("12"));
    }

    #[tokio::test]
    async fn racing_writers_broadcast_in_snapshot_order() {
        const ROUNDS: usize = 100;
        let (sync, _) = sync();
        sync.load().await.unwrap();
        let mut changes = sync.subscribe_changes();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for n in 0..ROUNDS {
                    sync.commit_field(AnswerRecord {
                        answer_id: Some(5),
                        field_id: 211,
                        value: Some(format!("local-{n}")),
                        updated_at: None,
                    })
                    .unwrap();
                }
            });
            scope.spawn(|| {
                for n in 0..ROUNDS {
                    sync.apply(field_update(211, &format!("remote-{n}"))).unwrap();
                }
            });
        });

        let mut last = None;
        let mut seen = 0;
        while let Ok(change) = changes.try_recv() {
            assert_eq!(change.key, AnswerKey::Field(211));
            last = Some(change.value);
            seen += 1;
        }
        assert_eq!(seen, ROUNDS * 2);
        assert_eq!(last, Some(sync.value(&AnswerKey::Field(211))));
    }

    #[tokio::test]
    async fn resync_delivery_fetches_exactly_once() {
        let (sync, source) = sync();
        sync.load().await.unwrap();
        sync.handle(PushDelivery::Resync {
            topic: "/topic/production/PR-1".into(),
            reason: "unknown push message type 'FIELD_RENAMED'".into(),
        })
        .await
        .unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(sync.resync_count(), 1);
    }
}
