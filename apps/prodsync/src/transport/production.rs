use crate::field::AnswerWriter;
use crate::sync::{CommittedAnswer, SnapshotSource};
use crate::transport::client::ApiClient;
use crate::transport::error::ApiError;
use crate::view::StateWriter;
use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use prodsync_proto::{
    AnswerKey, AnswerRecord, CellAnswerRecord, CellKey, ClosingState, FieldId,
    ProductionMetadata, SnapshotDocument,
};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnswerBody<'a> {
    value: Option<&'a str>,
    author_email: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChangeStateBody<'a> {
    value: ClosingState,
    author_email: Option<&'a str>,
}

/// Typed wrappers for the `/productions/{code}` endpoints.
#[derive(Clone)]
pub struct ProductionApi {
    client: ApiClient,
}

impl ProductionApi {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    fn base(code: &str) -> String {
        format!("/productions/{}", utf8_percent_encode(code, SEGMENT))
    }

    fn author(&self) -> Option<String> {
        self.client.session().user_email()
    }

    pub async fn detail(&self, code: &str) -> Result<ProductionMetadata, ApiError> {
        self.client.get_json(&Self::base(code)).await
    }

    pub async fn latest_answers(&self, code: &str) -> Result<SnapshotDocument, ApiError> {
        let path = format!("{}/latest-answers", Self::base(code));
        self.client.get_json(&path).await
    }

    pub async fn put_field(
        &self,
        code: &str,
        field_id: FieldId,
        value: Option<&str>,
    ) -> Result<AnswerRecord, ApiError> {
        let path = format!("{}/fields/{field_id}", Self::base(code));
        let author = self.author();
        debug!(target: "prodsync::transport", code, field_id, "saving field answer");
        self.client
            .put_json(
                &path,
                &AnswerBody {
                    value,
                    author_email: author.as_deref(),
                },
            )
            .await
    }

    pub async fn put_cell(
        &self,
        code: &str,
        cell: CellKey,
        value: Option<&str>,
    ) -> Result<CellAnswerRecord, ApiError> {
        let path = format!(
            "{}/tables/{}/{}/{}",
            Self::base(code),
            cell.table_id,
            cell.row_id,
            cell.col_id
        );
        let author = self.author();
        debug!(
            target: "prodsync::transport",
            code,
            table_id = cell.table_id,
            row_id = cell.row_id,
            col_id = cell.col_id,
            "saving cell answer"
        );
        self.client
            .put_json(
                &path,
                &AnswerBody {
                    value,
                    author_email: author.as_deref(),
                },
            )
            .await
    }

    pub async fn change_state(&self, code: &str, state: ClosingState) -> Result<Value, ApiError> {
        let path = format!("{}/change-state", Self::base(code));
        let author = self.author();
        self.client
            .put_json(
                &path,
                &ChangeStateBody {
                    value: state,
                    author_email: author.as_deref(),
                },
            )
            .await
    }
}

#[async_trait]
impl SnapshotSource for ProductionApi {
    async fn fetch_snapshot(&self, code: &str) -> Result<SnapshotDocument, ApiError> {
        self.latest_answers(code).await
    }
}

#[async_trait]
impl AnswerWriter for ProductionApi {
    async fn write_answer(
        &self,
        code: &str,
        key: AnswerKey,
        value: Option<String>,
    ) -> Result<CommittedAnswer, ApiError> {
        match key {
            AnswerKey::Field(field_id) => self
                .put_field(code, field_id, value.as_deref())
                .await
                .map(CommittedAnswer::Field),
            AnswerKey::Cell(cell) => self
                .put_cell(code, cell, value.as_deref())
                .await
                .map(CommittedAnswer::Cell),
        }
    }
}

#[async_trait]
impl StateWriter for ProductionApi {
    async fn close_production(&self, code: &str, state: ClosingState) -> Result<(), ApiError> {
        self.change_state(code, state).await.map(|_| ())
    }
}
