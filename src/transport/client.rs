//! Retrying HTTP client over a primary endpoint and its backups

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::HeaderMap;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method};
use tracing::{debug, info, warn};

use super::retry::{AttemptOutcome, DefaultRetryPolicy, RetryPolicy};
use super::{FormValue, RequestBody, TransportResponse};
use crate::config::Config;
use crate::error::{TransportError, UploadError};
use crate::http_logger::{self, HttpRequestLog, HttpResponseLog, LoggedBody};

/// User-Agent header value
const USER_AGENT: &str = concat!("qiniu-uploader-rs/", env!("CARGO_PKG_VERSION"));

/// Issues requests with per-endpoint retries, falling back to backup URLs
#[derive(Debug, Clone)]
pub struct RetryableTransport {
    client: Client,
    policy: Arc<dyn RetryPolicy>,
    tries_per_url: usize,
    retry_delay: Duration,
}

impl RetryableTransport {
    pub fn new(config: &Config) -> Result<Self, UploadError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| {
                UploadError::InvalidConfiguration(format!("failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            policy: Arc::new(DefaultRetryPolicy::new()),
            tries_per_url: config.tries_per_url.max(1),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        })
    }

    /// Same client and endpoints, different retry rules
    pub fn with_retry_policy(&self, policy: Arc<dyn RetryPolicy>) -> Self {
        Self {
            policy,
            ..self.clone()
        }
    }

    pub fn retry_policy(&self) -> &dyn RetryPolicy {
        self.policy.as_ref()
    }

    /// Send a request, retrying on `url` and then on each backup in order.
    ///
    /// Returns the first response the policy accepts. When every attempt is
    /// judged retryable, the last response (or last network error) is returned.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        backup_urls: &[String],
        headers: HeaderMap,
        body: RequestBody,
    ) -> Result<TransportResponse, TransportError> {
        let targets: Vec<&str> = std::iter::once(url)
            .chain(backup_urls.iter().map(String::as_str))
            .collect();

        let mut last_response: Option<TransportResponse> = None;
        let mut last_error: Option<TransportError> = None;
        let mut attempt_no = 0;

        for (host_idx, target) in targets.iter().enumerate() {
            if host_idx > 0 {
                info!("Switching to backup endpoint {}", target);
            }

            for attempt in 0..self.tries_per_url {
                attempt_no += 1;
                let started = Instant::now();
                let result = self.send_once(&method, target, &headers, &body).await;
                let elapsed_ms = started.elapsed().as_millis() as u64;

                match result {
                    Ok(response) => {
                        log_attempt(
                            &method,
                            target,
                            attempt_no,
                            &headers,
                            &body,
                            Some(&response),
                            elapsed_ms,
                            None,
                        );

                        if !self.policy.should_retry(&AttemptOutcome::Response(&response)) {
                            return Ok(response);
                        }
                        warn!(
                            "Retryable response {} from {} (attempt {}/{})",
                            response.status,
                            target,
                            attempt + 1,
                            self.tries_per_url
                        );
                        last_response = Some(response);
                        last_error = None;
                    }
                    Err(e) => {
                        let error_msg = e.to_string();
                        log_attempt(
                            &method,
                            target,
                            attempt_no,
                            &headers,
                            &body,
                            None,
                            elapsed_ms,
                            Some(&error_msg),
                        );

                        let retry = self.policy.should_retry(&AttemptOutcome::Failed(&e));
                        let error = TransportError::Request {
                            url: target.to_string(),
                            source: e,
                        };
                        if !retry {
                            return Err(error);
                        }
                        warn!(
                            "Request to {} failed (attempt {}/{}): {}",
                            target,
                            attempt + 1,
                            self.tries_per_url,
                            error_msg
                        );
                        last_error = Some(error);
                        last_response = None;
                    }
                }

                if attempt + 1 < self.tries_per_url {
                    let wait_time = backoff_delay(self.retry_delay, attempt);
                    debug!("Retrying {} in {}ms", target, wait_time.as_millis());
                    tokio::time::sleep(wait_time).await;
                }
            }
        }

        match (last_response, last_error) {
            (Some(response), _) => Ok(response),
            (None, Some(error)) => Err(error),
            (None, None) => Err(TransportError::NoEndpoint),
        }
    }

    async fn send_once(
        &self,
        method: &Method,
        url: &str,
        headers: &HeaderMap,
        body: &RequestBody,
    ) -> Result<TransportResponse, reqwest::Error> {
        let mut builder = self
            .client
            .request(method.clone(), url)
            .headers(headers.clone());

        builder = match body {
            RequestBody::Empty => builder,
            RequestBody::Bytes(bytes) => builder.body(bytes.clone()),
            RequestBody::Form(fields) => builder.multipart(build_form(fields)?),
        };

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let response_headers = response.headers().clone();
        let body = response.bytes().await?;

        Ok(TransportResponse {
            url: url.to_string(),
            status,
            headers: response_headers,
            body,
        })
    }
}

/// Exponential backoff before retry `attempt + 1`, saturating at `Duration::MAX`
fn backoff_delay(base: Duration, attempt: usize) -> Duration {
    base.saturating_mul(1u32 << attempt.min(16))
}

fn build_form(fields: &[super::FormField]) -> Result<Form, reqwest::Error> {
    let mut form = Form::new();
    for field in fields {
        form = match &field.value {
            FormValue::Text(text) => form.text(field.name.clone(), text.clone()),
            FormValue::File {
                data,
                file_name,
                mime_type,
            } => {
                let part = Part::bytes(data.to_vec())
                    .file_name(file_name.clone())
                    .mime_str(mime_type)?;
                form.part(field.name.clone(), part)
            }
        };
    }
    Ok(form)
}

#[allow(clippy::too_many_arguments)]
fn log_attempt(
    method: &Method,
    url: &str,
    attempt: usize,
    headers: &HeaderMap,
    body: &RequestBody,
    response: Option<&TransportResponse>,
    duration_ms: u64,
    error: Option<&str>,
) {
    if !http_logger::is_enabled() {
        return;
    }

    let logged_body = match body {
        RequestBody::Empty => None,
        RequestBody::Bytes(bytes) => Some(match std::str::from_utf8(bytes) {
            Ok(text) => LoggedBody::Text(text),
            Err(_) => LoggedBody::Binary(bytes.len()),
        }),
        RequestBody::Form(fields) => Some(LoggedBody::Form(
            fields
                .iter()
                .map(|field| match &field.value {
                    FormValue::Text(text) if field.name == "token" => {
                        format!("{}: {}", field.name, http_logger::mask_token(text))
                    }
                    FormValue::Text(text) => format!("{}: {}", field.name, text),
                    FormValue::File {
                        data, file_name, ..
                    } => format!("{}: <{} ({} bytes)>", field.name, file_name, data.len()),
                })
                .collect(),
        )),
    };

    let request_log = HttpRequestLog {
        method: method.as_str(),
        url,
        attempt,
        headers: http_logger::header_pairs(headers),
        body: logged_body,
    };
    let response_log = response.map(|r| HttpResponseLog {
        status: r.status,
        headers: http_logger::header_pairs(&r.headers),
        body: &r.body,
    });

    http_logger::log_request(&request_log, response_log.as_ref(), duration_ms, error);
}
