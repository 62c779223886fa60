//! Push envelopes delivered on the production topics.
//!
//! The server wraps every notification as `{ "type": TAG, "payload": {..} }`.
//! Decoding is strict about the tag: anything outside the known set is
//! reported as [`PushDecodeError::UnknownType`] so the caller can fall back
//! to a full refetch instead of silently dropping the update.

use crate::record::{ProductionMetadata, ProductionStatus};
use crate::{AnswerKey, CellKey, ColumnId, FieldId, RowId, TableId};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const TYPE_FIELD_UPDATED: &str = "FIELD_UPDATED";
pub const TYPE_TABLE_CELL_UPDATED: &str = "TABLE_CELL_UPDATED";
pub const TYPE_STATE_CHANGED: &str = "STATE_CHANGED";
pub const TYPE_METADATA_UPDATED: &str = "PRODUCTION_METADATA_UPDATED";
pub const TYPE_PRODUCTION_CREATED: &str = "PRODUCTION_CREATED";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldUpdate {
    pub field_id: FieldId,
    #[serde(default)]
    pub answer_id: Option<u64>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub author_email: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellUpdate {
    pub table_id: TableId,
    pub row_id: RowId,
    pub col_id: ColumnId,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub column_type: Option<String>,
    #[serde(default)]
    pub row_label: Option<String>,
    #[serde(default)]
    pub col_label: Option<String>,
    #[serde(default)]
    pub author_email: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl CellUpdate {
    pub fn key(&self) -> CellKey {
        CellKey::new(self.table_id, self.row_id, self.col_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    #[serde(default)]
    pub code: Option<String>,
    pub status: ProductionStatus,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Mutable metadata. The server always sends the full set, so absent values
/// mean "cleared".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataUpdate {
    #[serde(default)]
    pub batch_label: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductionCreated {
    #[serde(flatten)]
    pub production: ProductionMetadata,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushMessage {
    FieldUpdated(FieldUpdate),
    TableCellUpdated(CellUpdate),
    StateChanged(StateChange),
    MetadataUpdated(MetadataUpdate),
    ProductionCreated(ProductionCreated),
}

#[derive(Debug, Error)]
pub enum PushDecodeError {
    #[error("unknown push message type '{0}'")]
    UnknownType(String),
    #[error("malformed push message: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

fn payload<T: DeserializeOwned>(value: Value) -> Result<T, PushDecodeError> {
    Ok(serde_json::from_value(value)?)
}

impl PushMessage {
    pub fn decode(body: &str) -> Result<Self, PushDecodeError> {
        let RawEnvelope { kind, payload: raw } = serde_json::from_str(body)?;
        let message = match kind.as_str() {
            TYPE_FIELD_UPDATED => PushMessage::FieldUpdated(payload(raw)?),
            TYPE_TABLE_CELL_UPDATED => PushMessage::TableCellUpdated(payload(raw)?),
            TYPE_STATE_CHANGED => PushMessage::StateChanged(payload(raw)?),
            TYPE_METADATA_UPDATED => PushMessage::MetadataUpdated(payload(raw)?),
            TYPE_PRODUCTION_CREATED => PushMessage::ProductionCreated(payload(raw)?),
            _ => return Err(PushDecodeError::UnknownType(kind)),
        };
        Ok(message)
    }

    pub fn encode(&self) -> Value {
        let payload = match self {
            PushMessage::FieldUpdated(inner) => serde_json::to_value(inner),
            PushMessage::TableCellUpdated(inner) => serde_json::to_value(inner),
            PushMessage::StateChanged(inner) => serde_json::to_value(inner),
            PushMessage::MetadataUpdated(inner) => serde_json::to_value(inner),
            PushMessage::ProductionCreated(inner) => serde_json::to_value(inner),
        }
        .unwrap_or(Value::Null);
        serde_json::json!({ "type": self.kind(), "payload": payload })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PushMessage::FieldUpdated(_) => TYPE_FIELD_UPDATED,
            PushMessage::TableCellUpdated(_) => TYPE_TABLE_CELL_UPDATED,
            PushMessage::StateChanged(_) => TYPE_STATE_CHANGED,
            PushMessage::MetadataUpdated(_) => TYPE_METADATA_UPDATED,
            PushMessage::ProductionCreated(_) => TYPE_PRODUCTION_CREATED,
        }
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            PushMessage::FieldUpdated(inner) => inner.timestamp,
            PushMessage::TableCellUpdated(inner) => inner.timestamp,
            PushMessage::StateChanged(inner) => inner.timestamp,
            PushMessage::MetadataUpdated(inner) => inner.timestamp,
            PushMessage::ProductionCreated(inner) => inner.timestamp,
        }
    }

    /// Answer key touched by the message, if it targets a single answer.
    pub fn answer_key(&self) -> Option<AnswerKey> {
        match self {
            PushMessage::FieldUpdated(inner) => Some(AnswerKey::Field(inner.field_id)),
            PushMessage::TableCellUpdated(inner) => Some(AnswerKey::Cell(inner.key())),
            _ => None,
        }
    }
}
