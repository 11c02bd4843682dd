use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use time::PrimitiveDateTime;

use crate::db::types::{PrintUploadStatus, TestVisibility};
use crate::schemas::print::Detection;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct User {
    pub(crate) id: String,
    pub(crate) email: String,
    pub(crate) full_name: String,
    pub(crate) is_admin: bool,
    pub(crate) is_active: bool,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct TestConfig {
    /// Question ids in paper order; position `n - 1` is bubble-sheet row `n`.
    #[serde(default)]
    pub(crate) questions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct Test {
    pub(crate) id: String,
    pub(crate) owner_id: Option<String>,
    pub(crate) title: String,
    pub(crate) visibility: TestVisibility,
    pub(crate) config: Json<TestConfig>,
    pub(crate) duration_sec: i32,
    pub(crate) created_at: PrimitiveDateTime,
}

impl Test {
    pub(crate) fn question_ids(&self) -> &[i64] {
        &self.config.0.questions
    }

    pub(crate) fn question_count(&self) -> usize {
        self.config.0.questions.len()
    }

    pub(crate) fn accepts_submission_from(&self, user: &User) -> bool {
        self.owner_id.as_deref() == Some(user.id.as_str())
            || self.visibility.allows_shared_submission()
    }
}

/// The slice of a question row that grading needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub(crate) struct AnswerKeyRow {
    pub(crate) id: i64,
    pub(crate) subject: String,
    pub(crate) correct_index: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct PrintPackage {
    pub(crate) id: String,
    pub(crate) test_id: String,
    pub(crate) version: i32,
    pub(crate) layout_hash: String,
    pub(crate) qr_payload: Json<serde_json::Value>,
    pub(crate) created_by: Option<String>,
    pub(crate) created_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct PrintUpload {
    pub(crate) id: String,
    pub(crate) test_id: String,
    pub(crate) user_id: String,
    pub(crate) attempt_id: Option<String>,
    pub(crate) status: PrintUploadStatus,
    pub(crate) upload_urls: Json<Vec<String>>,
    pub(crate) detected: Option<Json<Detection>>,
    pub(crate) error: Option<String>,
    pub(crate) generation: i64,
    pub(crate) created_at: PrimitiveDateTime,
    pub(crate) updated_at: PrimitiveDateTime,
}

impl PrintUpload {
    pub(crate) fn page_paths(&self) -> &[String] {
        &self.upload_urls.0
    }

    pub(crate) fn detection(&self) -> Option<&Detection> {
        self.detected.as_ref().map(|value| &value.0)
    }
}

#[cfg(test)]
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct Attempt {
    pub(crate) id: String,
    pub(crate) test_id: String,
    pub(crate) user_id: String,
    pub(crate) score: Option<f64>,
    pub(crate) summary: Option<Json<serde_json::Value>>,
    pub(crate) started_at: PrimitiveDateTime,
    pub(crate) submitted_at: Option<PrimitiveDateTime>,
}

#[cfg(test)]
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct ItemAttempted {
    pub(crate) attempt_id: String,
    pub(crate) question_id: i64,
    pub(crate) selected_index: i32,
    pub(crate) correct: bool,
    pub(crate) time_ms: i32,
}
