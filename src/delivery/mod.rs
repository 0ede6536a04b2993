// =====================================================
// DELIVERY CLIENT
// Serializes transformed rows and pushes them to the destination API
// =====================================================

pub mod transport;

use chrono::Utc;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use crate::config::ApiSettings;
use crate::db_types::{CellValue, RowSet};
use crate::models::{DeliveryErrorKind, DeliveryOutcome, HttpMethod, OutputFormat, ScheduledTask};
use crate::security::{redact_sensitive_json, redact_sensitive_text};
use transport::{HttpRequest, HttpResponse, HttpTransport, TransportError};

const MAX_BODY_IN_MESSAGE: usize = 500;
const MAX_BACKOFF_EXPONENT: u32 = 16;

static EMBEDDED_TIMESTAMP_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}(?::\d{2}(?:[.,]\d+)?)?(?:\s?(?:Z|[+-]\d{2}:?\d{2}))?",
    )
    .unwrap()
});

static EXTRA_WHITESPACE_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s{2,}").unwrap());

// --- Target & Policy ---

/// Where a single firing sends its payload. Resolved once per firing.
#[derive(Clone)]
pub struct DeliveryTarget {
    pub url: String,
    pub method: HttpMethod,
    pub headers: BTreeMap<String, String>,
    pub api_key: Option<String>,
}

impl DeliveryTarget {
    /// Task settings win over the global API defaults; headers are merged.
    pub fn for_task(task: &ScheduledTask, api: &ApiSettings) -> Result<Self, String> {
        let destination = task.destination_url.trim();
        let url = if destination.starts_with("http://") || destination.starts_with("https://") {
            destination.to_string()
        } else {
            let base = api
                .base_url
                .as_deref()
                .map(str::trim)
                .filter(|base| !base.is_empty())
                .ok_or_else(|| {
                    format!(
                        "Task '{}' destination '{}' is relative but no API base URL is configured",
                        task.id, destination
                    )
                })?;
            format!(
                "{}/{}",
                base.trim_end_matches('/'),
                destination.trim_start_matches('/')
            )
        };

        let mut headers = api.headers.clone();
        for (name, value) in &task.headers {
            headers.retain(|existing, _| !existing.eq_ignore_ascii_case(name));
            headers.insert(name.clone(), value.clone());
        }

        let api_key = task
            .api_key
            .clone()
            .or_else(|| api.api_key.clone())
            .filter(|key| !key.trim().is_empty());

        Ok(Self {
            url,
            method: task.method.unwrap_or(api.default_method),
            headers,
            api_key,
        })
    }
}

impl std::fmt::Debug for DeliveryTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryTarget")
            .field("url", &redact_sensitive_text(&self.url))
            .field("method", &self.method)
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub request_timeout: Duration,
    pub strip_embedded_timestamps: bool,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self::from_settings(&ApiSettings::default())
    }
}

impl DeliveryPolicy {
    pub fn from_settings(api: &ApiSettings) -> Self {
        Self {
            max_retries: api.max_retries,
            backoff_base: Duration::from_millis(api.backoff_base_ms),
            request_timeout: Duration::from_secs(api.request_timeout_secs),
            strip_embedded_timestamps: api.strip_embedded_timestamps,
        }
    }

    pub fn with_max_retries(mut self, max_retries: Option<u32>) -> Self {
        if let Some(max_retries) = max_retries {
            self.max_retries = max_retries;
        }
        self
    }

    /// Wait before the attempt following failed attempt `attempt` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(MAX_BACKOFF_EXPONENT));
        self.backoff_base.saturating_mul(factor)
    }
}

// --- Errors ---

#[derive(Debug, Clone, thiserror::Error)]
pub enum DeliveryError {
    #[error("Destination answered HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Transient transport failure: {0}")]
    Transient(String),
    #[error("Transport failure: {0}")]
    Fatal(String),
    #[error("Payload serialization failed: {0}")]
    Serialization(String),
    #[error("Gave up after {attempts} attempt(s): {last}")]
    Exhausted {
        attempts: u32,
        last: Box<DeliveryError>,
    },
}

impl DeliveryError {
    pub fn kind(&self) -> DeliveryErrorKind {
        match self {
            Self::Status { .. } | Self::Transient(_) => DeliveryErrorKind::Transient,
            Self::Fatal(_) | Self::Exhausted { .. } => DeliveryErrorKind::Fatal,
            Self::Serialization(_) => DeliveryErrorKind::Serialization,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Status { .. } | Self::Transient(_))
    }
}

impl From<TransportError> for DeliveryError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Transient(message) => Self::Transient(message),
            TransportError::Fatal(message) => Self::Fatal(message),
        }
    }
}

// --- Payload ---

/// Builds the request body: a JSON array of row objects, or a CSV envelope
/// for delimited output.
pub fn build_payload(
    rows: &RowSet,
    format: &OutputFormat,
    strip_embedded_timestamps: bool,
) -> Result<String, DeliveryError> {
    let stripped;
    let rows = if strip_embedded_timestamps {
        stripped = strip_timestamps(rows);
        &stripped
    } else {
        rows
    };

    let body = match format {
        OutputFormat::Rows => rows.to_json_array(),
        OutputFormat::Delimited => {
            let csv = rows.to_csv().map_err(DeliveryError::Serialization)?;
            json!({
                "format": "csv",
                "records": rows.len(),
                "data": csv,
            })
        }
    };
    serde_json::to_string(&body).map_err(|e| DeliveryError::Serialization(e.to_string()))
}

/// Removes timestamp-shaped substrings from text cells. Typed timestamp
/// cells are left untouched.
pub fn strip_timestamps(rows: &RowSet) -> RowSet {
    let mut output = rows.clone();
    for row in &mut output.rows {
        for value in row.values_mut() {
            if let CellValue::Text(text) = value {
                if EMBEDDED_TIMESTAMP_REGEX.is_match(text) {
                    let removed = EMBEDDED_TIMESTAMP_REGEX.replace_all(text, "");
                    let collapsed = EXTRA_WHITESPACE_REGEX.replace_all(&removed, " ");
                    *text = collapsed.trim().to_string();
                }
            }
        }
    }
    output
}

fn describe_response_body(body: &str) -> String {
    let text = match serde_json::from_str::<Value>(body) {
        Ok(value) => redact_sensitive_json(&value).to_string(),
        Err(_) => redact_sensitive_text(body.trim()),
    };
    if text.chars().count() > MAX_BODY_IN_MESSAGE {
        let truncated: String = text.chars().take(MAX_BODY_IN_MESSAGE).collect();
        format!("{}...", truncated)
    } else {
        text
    }
}

// --- Client ---

pub struct DeliveryClient {
    transport: Arc<dyn HttpTransport>,
}

impl DeliveryClient {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }

    /// Sends `rows` to `target`, retrying transient failures per `policy`.
    /// Always produces an outcome; failures are recorded, never raised.
    pub async fn deliver(
        &self,
        task_id: &str,
        rows: &RowSet,
        format: &OutputFormat,
        target: &DeliveryTarget,
        policy: &DeliveryPolicy,
    ) -> DeliveryOutcome {
        let started = Instant::now();
        let mut outcome = DeliveryOutcome {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            timestamp: Utc::now(),
            record_count: rows.len(),
            success: false,
            status_code: None,
            error_kind: None,
            error_message: None,
            retry_count: 0,
            attempts: 0,
            duration_ms: 0,
        };

        let body = match build_payload(rows, format, policy.strip_embedded_timestamps) {
            Ok(body) => body,
            Err(e) => {
                log::error!("Task '{}': {}", task_id, e);
                outcome.error_kind = Some(e.kind());
                outcome.error_message = Some(redact_sensitive_text(&e.to_string()));
                outcome.duration_ms = started.elapsed().as_millis() as i64;
                return outcome;
            }
        };

        let request = HttpRequest {
            method: target.method,
            url: target.url.clone(),
            headers: request_headers(target),
            body,
            timeout: policy.request_timeout,
        };
        let max_attempts = policy.max_retries.saturating_add(1);
        let safe_url = redact_sensitive_text(&target.url);

        let mut attempt: u32 = 0;
        let last_error = loop {
            attempt += 1;
            outcome.attempts = attempt;
            log::debug!(
                "Task '{}': {} {} attempt {}/{} with {} record(s)",
                task_id,
                target.method.as_str(),
                safe_url,
                attempt,
                max_attempts,
                rows.len()
            );

            let error = match self.transport.send(&request).await {
                Ok(response) => {
                    outcome.status_code = Some(response.status);
                    if response.is_success() {
                        log::info!(
                            "Task '{}': delivered {} record(s) to {} on attempt {} (HTTP {})",
                            task_id,
                            rows.len(),
                            safe_url,
                            attempt,
                            response.status
                        );
                        log::debug!(
                            "Task '{}': response body {}",
                            task_id,
                            describe_response_body(&response.body)
                        );
                        outcome.success = true;
                        break None;
                    }
                    status_error(&response)
                }
                Err(e) => DeliveryError::from(e),
            };

            if !error.is_retryable() || attempt >= max_attempts {
                log::error!(
                    "Task '{}': delivery to {} failed on attempt {}/{}: {}",
                    task_id,
                    safe_url,
                    attempt,
                    max_attempts,
                    error
                );
                if error.is_retryable() {
                    break Some(DeliveryError::Exhausted {
                        attempts: attempt,
                        last: Box::new(error),
                    });
                }
                break Some(error);
            }

            let delay = policy.backoff_delay(attempt);
            log::warn!(
                "Task '{}': attempt {}/{} failed ({}), retrying in {:?}",
                task_id,
                attempt,
                max_attempts,
                error,
                delay
            );
            tokio::time::sleep(delay).await;
        };

        if let Some(error) = last_error {
            outcome.error_kind = Some(error.kind());
            outcome.error_message = Some(redact_sensitive_text(&error.to_string()));
        }
        outcome.retry_count = outcome.attempts.saturating_sub(1);
        outcome.duration_ms = started.elapsed().as_millis() as i64;
        outcome
    }
}

fn status_error(response: &HttpResponse) -> DeliveryError {
    DeliveryError::Status {
        status: response.status,
        body: describe_response_body(&response.body),
    }
}

fn request_headers(target: &DeliveryTarget) -> Vec<(String, String)> {
    let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];
    for (name, value) in &target.headers {
        if name.eq_ignore_ascii_case("content-type") {
            headers[0].1 = value.clone();
            continue;
        }
        if target.api_key.is_some() && name.eq_ignore_ascii_case("authorization") {
            continue;
        }
        headers.push((name.clone(), value.clone()));
    }
    if let Some(key) = &target.api_key {
        headers.push(("Authorization".to_string(), format!("Bearer {}", key)));
    }
    headers
}
