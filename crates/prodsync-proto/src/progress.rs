use crate::record::{is_answered, AnswerRecord, CellAnswerRecord};
use crate::snapshot::ProductionStructure;
use crate::{CellKey, FieldId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSummary {
    pub total_fields: u32,
    pub answered_fields: u32,
    pub total_cells: u32,
    pub answered_cells: u32,
    pub total_elements: u32,
    pub answered_elements: u32,
    pub percent_complete: f64,
}

impl ProgressSummary {
    /// Derives progress from the form structure and the current answers.
    ///
    /// Totals come from the structure; an answer only counts when its key is
    /// part of the structure and its value is non-blank.
    pub fn compute(
        structure: &ProductionStructure,
        field_answers: &BTreeMap<FieldId, AnswerRecord>,
        cell_answers: &BTreeMap<CellKey, CellAnswerRecord>,
    ) -> Self {
        let total_fields = structure.fields.len() as u32;
        let answered_fields = structure
            .fields
            .iter()
            .filter(|field| {
                field_answers
                    .get(&field.id)
                    .map(|answer| is_answered(answer.value.as_deref()))
                    .unwrap_or(false)
            })
            .count() as u32;

        let total_cells = structure.cell_count();
        let answered_cells = cell_answers
            .iter()
            .filter(|(key, record)| {
                structure.contains_cell(key) && is_answered(record.value.as_deref())
            })
            .count() as u32;

        Self::from_counts(total_fields, answered_fields, total_cells, answered_cells)
    }

    pub fn from_counts(
        total_fields: u32,
        answered_fields: u32,
        total_cells: u32,
        answered_cells: u32,
    ) -> Self {
        let total_elements = total_fields + total_cells;
        let answered_elements = answered_fields + answered_cells;
        let percent_complete = if total_elements > 0 {
            100.0 * f64::from(answered_elements) / f64::from(total_elements)
        } else {
            0.0
        };
        Self {
            total_fields,
            answered_fields,
            total_cells,
            answered_cells,
            total_elements,
            answered_elements,
            percent_complete,
        }
    }
}
