//! Remote OCR submission client trait

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Status reported by the remote OCR service for a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Queued,
    Processing,
    Complete,
    Failed,
}

impl SubmissionStatus {
    /// The service took the request (queued, processing or complete)
    pub fn is_accepted(&self) -> bool {
        !matches!(self, SubmissionStatus::Failed)
    }

    /// No further status changes will happen
    pub fn is_final(&self) -> bool {
        matches!(self, SubmissionStatus::Complete | SubmissionStatus::Failed)
    }
}

/// Minimal success/error capability shared by OCR responses
pub trait OcrResponse: Send + Sync {
    /// Whether the remote call succeeded
    fn is_success(&self) -> bool;

    /// Error reported by the service, if any
    fn error_message(&self) -> Option<&str>;
}

/// Response to a submission or status request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionResponse {
    /// Identifier for follow-up status requests
    pub tracking_id: String,
    pub status: SubmissionStatus,
    /// Recognition payload once `Complete`
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl SubmissionResponse {
    pub fn new(tracking_id: impl Into<String>, status: SubmissionStatus) -> Self {
        Self {
            tracking_id: tracking_id.into(),
            status,
            result: None,
            error: None,
        }
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

impl OcrResponse for SubmissionResponse {
    fn is_success(&self) -> bool {
        self.status.is_accepted() && self.error.is_none()
    }

    fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

/// Trait for the remote OCR service
///
/// Implementations report network problems as `Error::Transport` and
/// service-side rejections as `Error::Service` so failures classify correctly.
#[async_trait]
pub trait OcrSubmissionClient: Send + Sync {
    /// Response type returned by this client
    type Response: OcrResponse + Clone + 'static;

    /// Submit a document for recognition
    async fn submit(
        &self,
        data: &[u8],
        document_type: &str,
        cancel: &CancellationToken,
    ) -> Result<Self::Response>;

    /// Fetch the current state of an earlier submission
    async fn fetch_status(
        &self,
        tracking_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Self::Response>;

    /// Get client name for logging
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_success() {
        assert!(SubmissionResponse::new("t1", SubmissionStatus::Queued).is_success());
        assert!(SubmissionResponse::new("t1", SubmissionStatus::Complete).is_success());
        assert!(!SubmissionResponse::new("t1", SubmissionStatus::Failed).is_success());

        let rejected = SubmissionResponse::new("t1", SubmissionStatus::Processing).with_error("quota");
        assert!(!rejected.is_success());
        assert_eq!(rejected.error_message(), Some("quota"));
    }

    #[test]
    fn test_status_serde() {
        let json = serde_json::to_string(&SubmissionStatus::Complete).unwrap();
        assert_eq!(json, "\"complete\"");

        let parsed: SubmissionResponse =
            serde_json::from_str(r#"{"tracking_id":"abc","status":"processing"}"#).unwrap();
        assert_eq!(parsed.status, SubmissionStatus::Processing);
        assert!(parsed.result.is_none());
    }
}
