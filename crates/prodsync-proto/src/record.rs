use crate::{CellKey, ColumnId, FieldId, RowId, TableId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Committed answer for a simple field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerRecord {
    #[serde(default)]
    pub answer_id: Option<u64>,
    pub field_id: FieldId,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Committed answer for one table cell, with the labels the server denormalizes
/// into every record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellAnswerRecord {
    pub table_id: TableId,
    pub row_id: RowId,
    pub col_id: ColumnId,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub column_type: Option<String>,
    #[serde(default)]
    pub row_label: Option<String>,
    #[serde(default)]
    pub col_label: Option<String>,
}

impl CellAnswerRecord {
    pub fn key(&self) -> CellKey {
        CellKey::new(self.table_id, self.row_id, self.col_id)
    }

    pub fn empty(key: CellKey) -> Self {
        Self {
            table_id: key.table_id,
            row_id: key.row_id,
            col_id: key.col_id,
            value: None,
            updated_at: None,
            column_type: None,
            row_label: None,
            col_label: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProductionStatus {
    InProgress,
    Finished,
    Cancelled,
}

impl ProductionStatus {
    pub fn is_closed(self) -> bool {
        !matches!(self, ProductionStatus::InProgress)
    }
}

/// Target of `PUT /productions/{code}/change-state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClosingState {
    Finished,
    Cancelled,
}

impl From<ClosingState> for ProductionStatus {
    fn from(value: ClosingState) -> Self {
        match value {
            ClosingState::Finished => ProductionStatus::Finished,
            ClosingState::Cancelled => ProductionStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductionMetadata {
    pub code: String,
    #[serde(default)]
    pub template_name: Option<String>,
    pub status: ProductionStatus,
    #[serde(default)]
    pub batch_label: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

/// An element counts toward progress when it holds non-blank text.
pub fn is_answered(value: Option<&str>) -> bool {
    value.map(|v| !v.trim().is_empty()).unwrap_or(false)
}
