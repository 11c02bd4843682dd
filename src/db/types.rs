use serde::{Deserialize, Serialize};
use sqlx::Type;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "printuploadstatus", rename_all = "snake_case")]
pub(crate) enum PrintUploadStatus {
    Received,
    Processing,
    Graded,
    NeedsReview,
    Error,
}

impl PrintUploadStatus {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Processing => "processing",
            Self::Graded => "graded",
            Self::NeedsReview => "needs_review",
            Self::Error => "error",
        }
    }

    /// States a pipeline run is currently responsible for.
    pub(crate) fn is_in_flight(self) -> bool {
        matches!(self, Self::Received | Self::Processing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "testvisibility", rename_all = "lowercase")]
pub(crate) enum TestVisibility {
    Private,
    Shared,
    School,
}

impl TestVisibility {
    pub(crate) fn allows_shared_submission(self) -> bool {
        matches!(self, Self::Shared | Self::School)
    }
}
