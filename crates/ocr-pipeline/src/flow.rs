//! Submission flow: remote OCR calls wrapped in retry and polling

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::processing::DocumentRequest;
use crate::providers::{OcrResponse, OcrSubmissionClient, SubmissionResponse};
use crate::resilience::{PollingConfiguration, PollingService, RetryPolicy};

/// Submits documents to a remote OCR service
///
/// Unsuccessful responses are turned into `Error::Service` so the retry
/// policy classifies them like any other remote failure.
pub struct OcrFlow<C: OcrSubmissionClient> {
    client: Arc<C>,
    policy: RetryPolicy,
    polling: PollingService,
}

impl<C: OcrSubmissionClient> OcrFlow<C> {
    pub fn new(client: Arc<C>, policy: RetryPolicy) -> Self {
        Self {
            client,
            policy,
            polling: PollingService::new(),
        }
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn check_response(response: C::Response) -> Result<C::Response> {
        if response.is_success() {
            return Ok(response);
        }
        let message = response
            .error_message()
            .unwrap_or("OCR service rejected the request")
            .to_string();
        Err(Error::service(message))
    }

    /// Submit once through the retry policy
    pub async fn submit(&self, request: &DocumentRequest, cancel: &CancellationToken) -> Result<C::Response> {
        request.validate()?;
        let client = self.client.as_ref();
        let data = request.data.as_slice();
        let document_type = request.document_type().unwrap_or_default();

        tracing::debug!(
            "Submitting {} bytes to '{}' as '{}'",
            data.len(),
            client.name(),
            document_type
        );

        self.policy
            .execute_with_callback(
                move || async move {
                    let response = client.submit(data, document_type, cancel).await?;
                    Self::check_response(response)
                },
                |attempt, err, delay| {
                    tracing::info!(
                        "Submission attempt {} failed ({}), retrying in {}ms",
                        attempt,
                        err,
                        delay.as_millis()
                    );
                },
                cancel,
            )
            .await
    }
}

impl<C> OcrFlow<C>
where
    C: OcrSubmissionClient<Response = SubmissionResponse>,
{
    /// Submit, then poll until the service reports a final status
    pub async fn submit_and_wait(
        &self,
        request: &DocumentRequest,
        polling: &PollingConfiguration,
        cancel: &CancellationToken,
    ) -> Result<SubmissionResponse> {
        let accepted = self.submit(request, cancel).await?;
        if accepted.status.is_final() {
            return Self::check_response(accepted);
        }

        let client = self.client.as_ref();
        let tracking_id = accepted.tracking_id.as_str();
        tracing::debug!("Waiting for submission {}", tracking_id);

        let finished = self
            .polling
            .poll_with_progress(
                move || async move { client.fetch_status(tracking_id, cancel).await },
                |response: &SubmissionResponse| response.status.is_final(),
                |response: &SubmissionResponse| {
                    tracing::trace!("Submission {} is {:?}", response.tracking_id, response.status);
                },
                polling,
                cancel,
            )
            .await?;

        Self::check_response(finished)
    }
}
