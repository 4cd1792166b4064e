//! Retry predicates for the upload transport

use std::fmt::Debug;

use super::TransportResponse;

/// Status the service uses for "callback failed", which must not be retried
const STATUS_CALLBACK_FAILED: u16 = 579;
/// Checksum rejected, retrying resends the block
const STATUS_CHECKSUM_REJECTED: u16 = 406;
/// Service-side busy signal outside the 5xx range
const STATUS_SERVICE_BUSY: u16 = 996;

/// What a single request attempt produced
#[derive(Debug)]
pub enum AttemptOutcome<'a> {
    Response(&'a TransportResponse),
    Failed(&'a reqwest::Error),
}

/// Decides whether an attempt is worth repeating
pub trait RetryPolicy: Send + Sync + Debug {
    fn should_retry(&self, outcome: &AttemptOutcome<'_>) -> bool;
}

/// The service's standard retry rules
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRetryPolicy {
    expects_return_url: bool,
}

impl DefaultRetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uploads whose policy sets a return URL answer with redirects and
    /// plain bodies, so a missing request id is not a sign of a broken proxy
    pub fn with_return_url(mut self, expects_return_url: bool) -> Self {
        self.expects_return_url = expects_return_url;
        self
    }

    fn should_retry_response(&self, response: &TransportResponse) -> bool {
        let status = response.status;

        if (500..600).contains(&status) && status != STATUS_CALLBACK_FAILED {
            return true;
        }
        if status == STATUS_CHECKSUM_REJECTED || status == STATUS_SERVICE_BUSY {
            return true;
        }
        if status == 200 && response.error_message().is_some() {
            return true;
        }
        // A 2xx-4xx without a request id and without a structured body most
        // likely came from something other than the storage service
        (200..500).contains(&status)
            && response.request_id().is_none()
            && !response.body_is_object()
            && !self.expects_return_url
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn should_retry(&self, outcome: &AttemptOutcome<'_>) -> bool {
        match outcome {
            AttemptOutcome::Response(response) => self.should_retry_response(response),
            AttemptOutcome::Failed(error) => {
                error.is_timeout() || error.is_connect() || error.is_request() || error.is_body()
            }
        }
    }
}

/// Never retries; the first outcome is final
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetryPolicy;

impl RetryPolicy for NoRetryPolicy {
    fn should_retry(&self, _outcome: &AttemptOutcome<'_>) -> bool {
        false
    }
}
