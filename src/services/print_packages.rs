use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::types::Json;
use thiserror::Error;
use uuid::Uuid;

use crate::core::time::primitive_now_utc;
use crate::db::models::{PrintPackage, Test};
use crate::repositories::store::PrintStore;
use crate::schemas::print::QrPayload;

const LAYOUT_HASH_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum QrPayloadError {
    #[error("QR payload is not a JSON object")]
    NotAnObject,
    #[error("QR payload is missing test_id")]
    MissingTestId,
    #[error("QR payload version must be an integer")]
    InvalidVersion,
    #[error("QR payload field {0} has the wrong type")]
    InvalidField(&'static str),
}

/// First 16 hex chars of SHA-256 over the comma-joined question ids.
pub(crate) fn layout_hash(question_ids: &[i64]) -> String {
    let joined = question_ids.iter().map(i64::to_string).collect::<Vec<_>>().join(",");
    let mut encoded = hex::encode(Sha256::digest(joined.as_bytes()));
    encoded.truncate(LAYOUT_HASH_LEN);
    encoded
}

pub(crate) fn build_qr_payload(test: &Test, version: i32) -> QrPayload {
    let question_ids = test.question_ids().to_vec();
    QrPayload {
        test_id: test.id.clone(),
        version,
        layout_hash: layout_hash(&question_ids),
        total_questions: question_ids.len(),
        question_ids,
    }
}

/// Decodes the text scanned from a sheet's QR code.
pub(crate) fn parse_qr_payload(text: &str) -> Result<QrPayload, QrPayloadError> {
    let value: Value = serde_json::from_str(text).map_err(|_| QrPayloadError::NotAnObject)?;
    let object = value.as_object().ok_or(QrPayloadError::NotAnObject)?;

    let test_id = object
        .get("test_id")
        .and_then(Value::as_str)
        .filter(|id| !id.trim().is_empty())
        .ok_or(QrPayloadError::MissingTestId)?
        .to_string();

    let version = object
        .get("version")
        .and_then(Value::as_i64)
        .and_then(|version| i32::try_from(version).ok())
        .ok_or(QrPayloadError::InvalidVersion)?;

    let layout_hash = match object.get("layout_hash") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(hash)) => hash.clone(),
        Some(_) => return Err(QrPayloadError::InvalidField("layout_hash")),
    };

    let question_ids = match object.get("question_ids") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| item.as_i64().ok_or(QrPayloadError::InvalidField("question_ids")))
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => return Err(QrPayloadError::InvalidField("question_ids")),
    };

    let total_questions = match object.get("total_questions") {
        None | Some(Value::Null) => question_ids.len(),
        Some(value) => value
            .as_u64()
            .and_then(|total| usize::try_from(total).ok())
            .ok_or(QrPayloadError::InvalidField("total_questions"))?,
    };

    Ok(QrPayload { test_id, version, layout_hash, total_questions, question_ids })
}

/// Returns the package matching the test's current question order, issuing a new version
/// when the order changed since the last one.
pub(crate) async fn ensure_current_package(
    store: &dyn PrintStore,
    test: &Test,
    requested_by: &str,
) -> anyhow::Result<PrintPackage> {
    let current_hash = layout_hash(test.question_ids());
    let latest = store.latest_package(&test.id).await?;

    if let Some(latest) = &latest {
        if latest.layout_hash == current_hash {
            return Ok(latest.clone());
        }
    }

    let version = latest.as_ref().map(|package| package.version + 1).unwrap_or(1);
    let payload = build_qr_payload(test, version);
    let package = PrintPackage {
        id: Uuid::new_v4().to_string(),
        test_id: test.id.clone(),
        version,
        layout_hash: payload.layout_hash.clone(),
        qr_payload: Json(serde_json::to_value(&payload)?),
        created_by: Some(requested_by.to_string()),
        created_at: primitive_now_utc(),
    };

    match store.insert_package(package).await {
        Ok(package) => {
            tracing::info!(test_id = %test.id, version, "Issued print package");
            Ok(package)
        }
        Err(err) => {
            // A concurrent request may have issued the same version first.
            match store.latest_package(&test.id).await? {
                Some(latest) if latest.layout_hash == current_hash => Ok(latest),
                _ => Err(err),
            }
        }
    }
}
