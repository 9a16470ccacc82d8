use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use serde_json::{json, Value};

use crate::config::ApiVersion;
use crate::error::{Error, Result};
use crate::logging;
use crate::metrics::Metrics;

/// Upper bound on simultaneous requests; further calls queue on the limiter.
const MAX_INFLIGHT: usize = 10;
/// Total attempts for retryable faults (429, 503, timeouts).
const MAX_ATTEMPTS: usize = 3;

#[derive(Debug)]
struct Limiter {
    max: usize,
    in_flight: Mutex<usize>,
    cv: Condvar,
}

#[derive(Debug)]
struct Permit<'a> {
    limiter: &'a Limiter,
}

impl Limiter {
    fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            in_flight: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    fn acquire(&self) -> Permit<'_> {
        let mut current = lock_or_recover(&self.in_flight, "http limiter in_flight");
        while *current >= self.max {
            current = wait_or_recover(&self.cv, current, "http limiter wait");
        }
        *current += 1;
        Permit { limiter: self }
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let mut current = lock_or_recover(&self.limiter.in_flight, "http limiter in_flight");
        *current = current.saturating_sub(1);
        self.limiter.cv.notify_one();
    }
}

#[derive(Debug, Clone, Copy)]
enum Method {
    Get,
    Post,
    Put,
    Delete,
}

#[derive(Debug, Clone)]
/// Blocking JSON client for the Jira REST API with bounded concurrency,
/// bounded retries, and per-request timeouts.
pub struct HttpClient {
    base_url: String,
    api_root: String,
    token: String,
    http: Client,
    default_timeout: Duration,
    bulk_timeout: Duration,
    limiter: Arc<Limiter>,
    metrics: Arc<Metrics>,
}

impl HttpClient {
    /// Creates a client rooted at `<base_url>/rest/api/<version>`.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] when the URL cannot be normalized or
    /// the underlying HTTP client fails to build.
    pub fn new(
        base_url: &str,
        token: &str,
        api_version: ApiVersion,
        default_timeout: Duration,
        bulk_timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let http = Client::builder()
            .build()
            .map_err(|err| Error::configuration(format!("failed to build HTTP client: {err}")))?;
        let normalized = normalize_base_url(base_url)?;
        if !normalized.starts_with("https://") {
            logging::warn(format!(
                "base URL {} is not HTTPS; the bearer token will be sent in cleartext",
                normalized
            ));
        }

        let api_root = format!("{}/rest/api/{}", normalized, api_version.path_segment());
        Ok(Self {
            base_url: normalized,
            api_root,
            token: token.to_string(),
            http,
            default_timeout,
            bulk_timeout,
            limiter: Arc::new(Limiter::new(MAX_INFLIGHT)),
            metrics,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Timeout used for bulk create POSTs.
    pub fn bulk_timeout(&self) -> Duration {
        self.bulk_timeout
    }

    /// GET `<api_root><path>`.
    ///
    /// # Errors
    /// Returns the mapped [`Error`] for transport faults and non-2xx statuses.
    pub fn get(&self, path: &str) -> Result<Value> {
        self.request(Method::Get, path, &[], None, self.default_timeout)
    }

    /// GET with URL-encoded query parameters.
    ///
    /// # Errors
    /// Returns the mapped [`Error`] for transport faults and non-2xx statuses.
    pub fn get_with_query(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        self.request(Method::Get, path, query, None, self.default_timeout)
    }

    /// POST a JSON body.
    ///
    /// # Errors
    /// Returns the mapped [`Error`] for transport faults and non-2xx statuses.
    pub fn post(&self, path: &str, body: &Value) -> Result<Value> {
        self.request(Method::Post, path, &[], Some(body), self.default_timeout)
    }

    /// POST with a caller-chosen timeout (bulk creates use the longer one).
    ///
    /// # Errors
    /// Returns the mapped [`Error`] for transport faults and non-2xx statuses.
    pub fn post_with_timeout(&self, path: &str, body: &Value, timeout: Duration) -> Result<Value> {
        self.request(Method::Post, path, &[], Some(body), timeout)
    }

    /// PUT a JSON body.
    ///
    /// # Errors
    /// Returns the mapped [`Error`] for transport faults and non-2xx statuses.
    pub fn put(&self, path: &str, body: &Value) -> Result<Value> {
        self.request(Method::Put, path, &[], Some(body), self.default_timeout)
    }

    /// DELETE `<api_root><path>`.
    ///
    /// # Errors
    /// Returns the mapped [`Error`] for transport faults and non-2xx statuses.
    pub fn delete(&self, path: &str) -> Result<Value> {
        self.request(Method::Delete, path, &[], None, self.default_timeout)
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let _permit = self.limiter.acquire();
        let url = format!("{}{}", self.api_root, path);

        for attempt in 0..MAX_ATTEMPTS {
            self.metrics.inc_api_request();
            let mut builder = match method {
                Method::Get => self.http.get(&url),
                Method::Post => self.http.post(&url),
                Method::Put => self.http.put(&url),
                Method::Delete => self.http.delete(&url),
            }
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(timeout);
            if !query.is_empty() {
                builder = builder.query(query);
            }
            if let Some(body) = body {
                builder = builder.json(body);
            }

            let response = match builder.send() {
                Ok(resp) => resp,
                Err(err) if err.is_timeout() && attempt + 1 < MAX_ATTEMPTS => {
                    let wait = backoff_delay(attempt);
                    logging::debug(format!(
                        "request to {} timed out on attempt {}; retrying in {:?}",
                        path,
                        attempt + 1,
                        wait
                    ));
                    self.metrics.inc_retry();
                    thread::sleep(wait);
                    continue;
                }
                Err(err) if err.is_timeout() => {
                    return Err(Error::network(format!(
                        "request to {} timed out after {} attempts",
                        path,
                        attempt + 1
                    )));
                }
                Err(err) => {
                    return Err(Error::network(format!("request to {} failed: {}", path, err)));
                }
            };

            let status = response.status();
            if is_retryable_status(status) && attempt + 1 < MAX_ATTEMPTS {
                let wait = retry_after_or_backoff(&response, attempt);
                logging::debug(format!(
                    "retryable status {} from {} on attempt {}; waiting {:?}",
                    status,
                    path,
                    attempt + 1,
                    wait
                ));
                self.metrics.inc_retry();
                thread::sleep(wait);
                continue;
            }

            return finish_response(path, response);
        }

        Err(Error::network(format!(
            "retry loop for {} exhausted unexpectedly",
            path
        )))
    }
}

fn finish_response(path: &str, response: Response) -> Result<Value> {
    let status = response.status();
    if status == StatusCode::NO_CONTENT {
        return Ok(json!({}));
    }

    let body_text = response
        .text()
        .map_err(|err| Error::network(format!("failed to read response from {path}: {err}")))?;
    let body_json: Option<Value> = serde_json::from_str(&body_text).ok();

    if status.is_success() {
        if body_text.trim().is_empty() {
            return Ok(json!({}));
        }
        return body_json.ok_or_else(|| {
            logging::warn(format!(
                "failed decoding response from {}: {}",
                path,
                truncate(&body_text, 500)
            ));
            Error::network(format!("failed to decode response from {path}"))
        });
    }

    Err(map_status_error(path, status, body_json, &body_text))
}

fn map_status_error(path: &str, status: StatusCode, body: Option<Value>, raw: &str) -> Error {
    let summary = body
        .as_ref()
        .and_then(upstream_messages)
        .unwrap_or_else(|| truncate(raw, 300));

    match status.as_u16() {
        401 | 403 => Error::Authentication {
            message: format!(
                "Jira rejected the credentials for {} (HTTP {}); check the configured token",
                path, status
            ),
            upstream: body,
        },
        404 => Error::NotFound {
            message: format!("{} returned 404: {}", path, summary),
            upstream: body,
        },
        400 => {
            let field_errors = body
                .as_ref()
                .and_then(|v| v.get("errors"))
                .and_then(Value::as_object)
                .map(|map| {
                    map.iter()
                        .map(|(k, v)| {
                            (
                                k.clone(),
                                v.as_str().map(ToString::to_string).unwrap_or_else(|| v.to_string()),
                            )
                        })
                        .collect()
                })
                .unwrap_or_default();
            Error::Validation {
                message: format!("Jira rejected the request to {}: {}", path, summary),
                field_errors,
                upstream: body,
            }
        }
        429 => Error::RateLimit {
            message: format!("{} was rate limited after {} attempts", path, MAX_ATTEMPTS),
            upstream: body,
        },
        _ => Error::JiraServer {
            status: status.as_u16(),
            message: format!("{} failed: {}", path, summary),
            upstream: body,
        },
    }
}

/// Joins Jira's `errorMessages` array, falling back to the `errors` object.
fn upstream_messages(body: &Value) -> Option<String> {
    if let Some(messages) = body.get("errorMessages").and_then(Value::as_array) {
        let joined = messages
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("; ");
        if !joined.is_empty() {
            return Some(joined);
        }
    }
    body.get("errors")
        .and_then(Value::as_object)
        .filter(|map| !map.is_empty())
        .map(|map| {
            map.iter()
                .map(|(k, v)| match v.as_str() {
                    Some(text) => format!("{}: {}", k, text),
                    None => format!("{}: {}", k, v),
                })
                .collect::<Vec<_>>()
                .join("; ")
        })
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE
}

fn backoff_delay(attempt: usize) -> Duration {
    Duration::from_secs(1_u64 << attempt.min(4))
}

fn retry_after_or_backoff(response: &Response, attempt: usize) -> Duration {
    if let Some(header) = response.headers().get("Retry-After") {
        if let Ok(value) = header.to_str() {
            if let Ok(seconds) = value.parse::<u64>() {
                return Duration::from_secs(seconds.min(30));
            }
        }
    }
    backoff_delay(attempt)
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() > limit {
        format!("{}...", &text[..limit])
    } else {
        text.to_string()
    }
}

fn normalize_base_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::configuration("jira.base_url must not be empty"));
    }

    let candidate = if trimmed.starts_with("https://") || trimmed.starts_with("http://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };

    let parsed = reqwest::Url::parse(&candidate)
        .map_err(|_| Error::configuration(format!("invalid jira.base_url '{raw}'")))?;
    Ok(parsed.as_str().trim_end_matches('/').to_string())
}

fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, name: &'static str) -> std::sync::MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            logging::warn(format!("recovering poisoned mutex: {}", name));
            poisoned.into_inner()
        }
    }
}

fn wait_or_recover<'a, T>(
    cv: &Condvar,
    guard: std::sync::MutexGuard<'a, T>,
    name: &'static str,
) -> std::sync::MutexGuard<'a, T> {
    match cv.wait(guard) {
        Ok(next) => next,
        Err(poisoned) => {
            logging::warn(format!(
                "recovering poisoned mutex after condvar wait: {}",
                name
            ));
            poisoned.into_inner()
        }
    }
}
