use crate::progress::ProgressSummary;
use crate::record::{AnswerRecord, CellAnswerRecord, ProductionMetadata};
use crate::{AnswerKey, CellKey, ColumnId, FieldId, RowId, TableId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDefinition {
    pub id: FieldId,
    #[serde(default)]
    pub label: String,
    #[serde(rename = "type", default)]
    pub field_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowDefinition {
    pub id: RowId,
    #[serde(default)]
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDefinition {
    pub id: ColumnId,
    #[serde(default)]
    pub label: String,
    #[serde(rename = "type", default)]
    pub column_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDefinition {
    pub id: TableId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub rows: Vec<RowDefinition>,
    #[serde(default)]
    pub columns: Vec<ColumnDefinition>,
}

/// Shape of the form: which fields and cells exist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductionStructure {
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
    #[serde(default)]
    pub tables: Vec<TableDefinition>,
}

impl ProductionStructure {
    pub fn cell_count(&self) -> u32 {
        self.tables
            .iter()
            .map(|table| (table.rows.len() * table.columns.len()) as u32)
            .sum()
    }

    pub fn contains_field(&self, id: FieldId) -> bool {
        self.fields.iter().any(|field| field.id == id)
    }

    pub fn contains_cell(&self, key: &CellKey) -> bool {
        self.tables.iter().any(|table| {
            table.id == key.table_id
                && table.rows.iter().any(|row| row.id == key.row_id)
                && table.columns.iter().any(|col| col.id == key.col_id)
        })
    }

    pub fn table(&self, id: TableId) -> Option<&TableDefinition> {
        self.tables.iter().find(|table| table.id == id)
    }
}

/// Body of `GET /productions/{code}/latest-answers`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDocument {
    pub production: ProductionMetadata,
    #[serde(flatten)]
    pub structure: ProductionStructure,
    #[serde(default)]
    pub field_answers: Vec<AnswerRecord>,
    #[serde(default)]
    pub cell_answers: Vec<CellAnswerRecord>,
    #[serde(default)]
    pub progress: Option<ProgressSummary>,
    #[serde(default)]
    pub query_timestamp: Option<DateTime<Utc>>,
}

/// Canonical client-side view of one production.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductionSnapshot {
    pub metadata: ProductionMetadata,
    pub structure: ProductionStructure,
    pub field_answers: BTreeMap<FieldId, AnswerRecord>,
    pub cell_answers: BTreeMap<CellKey, CellAnswerRecord>,
    pub progress: ProgressSummary,
    pub query_timestamp: Option<DateTime<Utc>>,
}

impl ProductionSnapshot {
    /// Builds the snapshot and recomputes progress locally; the server's
    /// summary is only used for logging discrepancies upstream.
    pub fn from_document(document: SnapshotDocument) -> Self {
        let field_answers = document
            .field_answers
            .into_iter()
            .map(|answer| (answer.field_id, answer))
            .collect();
        let cell_answers = document
            .cell_answers
            .into_iter()
            .map(|answer| (answer.key(), answer))
            .collect();
        let mut snapshot = Self {
            metadata: document.production,
            structure: document.structure,
            field_answers,
            cell_answers,
            progress: ProgressSummary::default(),
            query_timestamp: document.query_timestamp,
        };
        snapshot.recompute_progress();
        snapshot
    }

    pub fn recompute_progress(&mut self) {
        self.progress =
            ProgressSummary::compute(&self.structure, &self.field_answers, &self.cell_answers);
    }

    pub fn value(&self, key: &AnswerKey) -> Option<&str> {
        match key {
            AnswerKey::Field(id) => self
                .field_answers
                .get(id)
                .and_then(|answer| answer.value.as_deref()),
            AnswerKey::Cell(cell) => self
                .cell_answers
                .get(cell)
                .and_then(|answer| answer.value.as_deref()),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = AnswerKey> + '_ {
        self.field_answers
            .keys()
            .map(|id| AnswerKey::Field(*id))
            .chain(self.cell_answers.keys().map(|cell| AnswerKey::Cell(*cell)))
    }
}
