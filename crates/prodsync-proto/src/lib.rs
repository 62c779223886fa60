//! Shared wire definitions for the production-tracking API.
//! Kept in a dedicated crate so mock servers and tooling can speak the same
//! JSON shapes as the client core without pulling in the runtime.

pub mod progress;
pub mod push;
pub mod record;
pub mod snapshot;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use progress::ProgressSummary;
pub use push::{
    CellUpdate, FieldUpdate, MetadataUpdate, ProductionCreated, PushDecodeError, PushMessage,
    StateChange,
};
pub use record::{
    is_answered, AnswerRecord, CellAnswerRecord, ClosingState, ProductionMetadata,
    ProductionStatus,
};
pub use snapshot::{
    ColumnDefinition, FieldDefinition, ProductionSnapshot, ProductionStructure, RowDefinition,
    SnapshotDocument, TableDefinition,
};

pub type FieldId = u64;
pub type TableId = u64;
pub type RowId = u64;
pub type ColumnId = u64;

/// Address of a single table cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellKey {
    pub table_id: TableId,
    pub row_id: RowId,
    pub col_id: ColumnId,
}

impl CellKey {
    pub fn new(table_id: TableId, row_id: RowId, col_id: ColumnId) -> Self {
        Self {
            table_id,
            row_id,
            col_id,
        }
    }
}

/// Any independently saved unit of a production form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AnswerKey {
    Field(FieldId),
    Cell(CellKey),
}

impl fmt::Display for AnswerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnswerKey::Field(id) => write!(f, "field:{id}"),
            AnswerKey::Cell(cell) => write!(
                f,
                "cell:{}/{}/{}",
                cell.table_id, cell.row_id, cell.col_id
            ),
        }
    }
}

impl From<CellKey> for AnswerKey {
    fn from(value: CellKey) -> Self {
        AnswerKey::Cell(value)
    }
}

/// Per-record push topic.
pub fn production_topic(code: &str) -> String {
    format!("/topic/production/{code}")
}

pub const TOPIC_PRODUCTION_CREATED: &str = "/topic/production/created";
pub const TOPIC_PRODUCTIONS_STATE_CHANGED: &str = "/topic/productions/state-changed";
