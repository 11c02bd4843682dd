use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::core::time::format_primitive;
use crate::db::models::{PrintPackage, PrintUpload};
use crate::db::types::PrintUploadStatus;

pub(crate) const MAX_OPTION_INDEX: u8 = 3;

/// One bubble read off the sheet. `q` is the 1-based row, `sel` 0=A..3=D.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct DetectedAnswer {
    pub(crate) q: u32,
    pub(crate) sel: u8,
    pub(crate) conf: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct Detection {
    #[serde(default)]
    pub(crate) answers: Vec<DetectedAnswer>,
    #[serde(default)]
    pub(crate) warnings: Vec<String>,
    #[serde(default)]
    pub(crate) pages: u32,
}

impl Detection {
    /// Checks the value bounds every stored or freshly detected payload must satisfy.
    pub(crate) fn check_bounds(&self) -> Result<(), String> {
        let mut seen = HashSet::with_capacity(self.answers.len());
        for (index, answer) in self.answers.iter().enumerate() {
            if answer.q == 0 {
                return Err(format!("answers[{index}].q must be >= 1"));
            }
            if answer.sel > MAX_OPTION_INDEX {
                return Err(format!(
                    "answers[{index}].sel must be within 0..={MAX_OPTION_INDEX}, got {}",
                    answer.sel
                ));
            }
            if !answer.conf.is_finite() || !(0.0..=1.0).contains(&answer.conf) {
                return Err(format!(
                    "answers[{index}].conf must be within [0, 1], got {}",
                    answer.conf
                ));
            }
            if !seen.insert(answer.q) {
                return Err(format!("answers[{index}].q duplicates question {}", answer.q));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct IntakeResponse {
    pub(crate) upload_id: String,
    pub(crate) status: PrintUploadStatus,
    pub(crate) files_uploaded: usize,
    pub(crate) message: String,
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct ProcessRequest {
    #[validate(length(min = 1, max = 64, message = "upload_id must not be empty"))]
    pub(crate) upload_id: String,
    #[serde(default)]
    pub(crate) force_reprocess: bool,
    #[serde(default)]
    pub(crate) rerun_detection: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct ProcessResponse {
    pub(crate) upload_id: String,
    pub(crate) status: PrintUploadStatus,
    pub(crate) generation: i64,
}

#[derive(Debug, Serialize)]
pub(crate) struct PrintUploadResponse {
    pub(crate) id: String,
    pub(crate) test_id: String,
    pub(crate) user_id: String,
    pub(crate) status: PrintUploadStatus,
    pub(crate) detected: Option<Detection>,
    pub(crate) error: Option<String>,
    pub(crate) attempt_id: Option<String>,
    pub(crate) pages: usize,
    pub(crate) created_at: String,
    pub(crate) updated_at: String,
}

impl From<&PrintUpload> for PrintUploadResponse {
    fn from(upload: &PrintUpload) -> Self {
        Self {
            id: upload.id.clone(),
            test_id: upload.test_id.clone(),
            user_id: upload.user_id.clone(),
            status: upload.status,
            detected: upload.detection().cloned(),
            error: upload.error.clone(),
            attempt_id: upload.attempt_id.clone(),
            pages: upload.page_paths().len(),
            created_at: format_primitive(upload.created_at),
            updated_at: format_primitive(upload.updated_at),
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct ReviewListQuery {
    pub(crate) status: Option<PrintUploadStatus>,
    #[serde(default)]
    #[validate(range(min = 0, message = "skip must be non-negative"))]
    pub(crate) skip: i64,
    #[serde(default = "crate::api::pagination::default_limit")]
    #[validate(range(min = 1, max = 1000, message = "limit must be between 1 and 1000"))]
    pub(crate) limit: i64,
}

#[derive(Debug, Serialize)]
pub(crate) struct ReviewListItem {
    pub(crate) id: String,
    pub(crate) test_id: String,
    pub(crate) user_id: String,
    pub(crate) status: PrintUploadStatus,
    pub(crate) error: Option<String>,
    pub(crate) attempt_id: Option<String>,
    pub(crate) pages: usize,
    pub(crate) low_confidence_answers: usize,
    pub(crate) created_at: String,
    pub(crate) updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct ReviewGridRow {
    pub(crate) q: u32,
    pub(crate) sel: Option<u8>,
    pub(crate) conf: Option<f64>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ReviewDetailResponse {
    pub(crate) upload: PrintUploadResponse,
    pub(crate) question_count: usize,
    pub(crate) grid: Vec<ReviewGridRow>,
    pub(crate) anomalies: Vec<DetectedAnswer>,
    pub(crate) warnings: Vec<String>,
    pub(crate) page_urls: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub(crate) struct CorrectedAnswer {
    #[validate(range(min = 1, message = "q must be >= 1"))]
    pub(crate) q: u32,
    #[validate(range(max = 3, message = "sel must be within 0..=3"))]
    pub(crate) sel: u8,
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct CorrectionRequest {
    #[validate(nested)]
    pub(crate) answers: Vec<CorrectedAnswer>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ReprocessRequest {
    #[serde(default)]
    pub(crate) rerun_detection: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct QrPayload {
    pub(crate) test_id: String,
    pub(crate) version: i32,
    pub(crate) layout_hash: String,
    pub(crate) total_questions: usize,
    pub(crate) question_ids: Vec<i64>,
}

#[derive(Debug, Serialize)]
pub(crate) struct PrintPackageResponse {
    pub(crate) id: String,
    pub(crate) test_id: String,
    pub(crate) version: i32,
    pub(crate) layout_hash: String,
    pub(crate) qr_payload: serde_json::Value,
    pub(crate) created_at: String,
}

impl From<PrintPackage> for PrintPackageResponse {
    fn from(package: PrintPackage) -> Self {
        Self {
            id: package.id,
            test_id: package.test_id,
            version: package.version,
            layout_hash: package.layout_hash,
            qr_payload: package.qr_payload.0,
            created_at: format_primitive(package.created_at),
        }
    }
}
