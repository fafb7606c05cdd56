//! HTTP request executor.
//!
//! Builds a request from the step's `url`/`method`/`headers`/`body` params
//! and reports the response. Non-2xx statuses are step failures so `onFailure`
//! policies apply to bad responses, not just transport errors. JSON response
//! bodies are parsed into structure so later steps can path into them with
//! `${binding.field}` references.

use runbook_core::workflow::executor::{BoxedStepFuture, StepExecutor, StepRequest};
use runbook_types::workflow::{StepResult, fault_kind};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::time::Duration;

use super::INVALID_PARAMS;

/// Fault kind for transport-level failures (DNS, connect, read).
pub const HTTP_ERROR: &str = "http_error";

/// Fault kind for non-2xx responses.
pub const HTTP_STATUS: &str = "http_status";

/// Executes `http` steps with a shared reqwest client.
pub struct HttpExecutor {
    client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .user_agent("runbook-workflow/0.1")
                .build()
                .expect("failed to build HTTP client"),
        }
    }
}

impl Default for HttpExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl StepExecutor for HttpExecutor {
    fn execute<'a>(&'a self, request: StepRequest<'a>) -> BoxedStepFuture<'a> {
        Box::pin(async move {
            let started = std::time::Instant::now();

            let Some(url) = request.params.get("url").and_then(Value::as_str) else {
                return StepResult::failure(
                    INVALID_PARAMS,
                    "http step requires a 'url' string param",
                    0,
                );
            };
            let method_str = request
                .params
                .get("method")
                .and_then(Value::as_str)
                .unwrap_or("GET");
            let Ok(method) = method_str.parse::<reqwest::Method>() else {
                return StepResult::failure(
                    INVALID_PARAMS,
                    format!("invalid HTTP method: {method_str}"),
                    0,
                );
            };

            let mut http_request = self.client.request(method, url);
            if let Some(timeout) = request.timeout {
                http_request = http_request.timeout(timeout);
            }
            if let Some(headers) = request.params.get("headers").and_then(Value::as_object) {
                for (key, value) in headers {
                    if let Some(value) = value.as_str() {
                        http_request = http_request.header(key.as_str(), value);
                    }
                }
            }
            if let Some(body) = request.params.get("json") {
                http_request = http_request.json(body);
            } else if let Some(body) = request.params.get("body").and_then(Value::as_str) {
                http_request = http_request.body(body.to_string());
            }

            tracing::debug!(step_id = request.step_id, url, "running http step");

            let response = tokio::select! {
                result = http_request.send() => match result {
                    Ok(response) => response,
                    Err(e) => {
                        return StepResult::failure(
                            HTTP_ERROR,
                            format!("HTTP request to '{url}' failed: {e}"),
                            started.elapsed().as_millis() as u64,
                        );
                    }
                },
                _ = request.cancel.cancelled() => {
                    return StepResult::failure(
                        fault_kind::CANCELLED,
                        "http request cancelled",
                        started.elapsed().as_millis() as u64,
                    );
                }
            };

            let status = response.status();
            let response_headers: HashMap<String, String> = response
                .headers()
                .iter()
                .map(|(k, v)| {
                    (
                        k.as_str().to_string(),
                        v.to_str().unwrap_or("<binary>").to_string(),
                    )
                })
                .collect();
            let is_json = response_headers
                .get("content-type")
                .is_some_and(|ct| ct.contains("application/json"));

            let text = match response.text().await {
                Ok(text) => text,
                Err(e) => {
                    return StepResult::failure(
                        HTTP_ERROR,
                        format!("failed to read HTTP response body: {e}"),
                        started.elapsed().as_millis() as u64,
                    );
                }
            };
            let body: Value = if is_json {
                serde_json::from_str(&text).unwrap_or(Value::String(text))
            } else {
                Value::String(text)
            };

            let duration_ms = started.elapsed().as_millis() as u64;
            if status.is_success() {
                StepResult::success(
                    json!({
                        "status": status.as_u16(),
                        "headers": response_headers,
                        "body": body,
                    }),
                    duration_ms,
                )
            } else {
                StepResult::failure(
                    HTTP_STATUS,
                    format!("HTTP {} from '{url}'", status.as_u16()),
                    duration_ms,
                )
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use runbook_types::workflow::StepKind;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn request<'a>(params: &'a Value) -> StepRequest<'a> {
        StepRequest {
            run_id: Uuid::now_v7(),
            step_id: "call",
            kind: StepKind::Http,
            params,
            timeout: Some(Duration::from_millis(500)),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_missing_url_is_invalid() {
        let params = json!({ "method": "GET" });
        let result = HttpExecutor::new().execute(request(&params)).await;
        assert_eq!(result.error.unwrap().kind, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_invalid_method_is_invalid() {
        let params = json!({ "url": "http://localhost/", "method": "NOT A METHOD" });
        let result = HttpExecutor::new().execute(request(&params)).await;
        assert_eq!(result.error.unwrap().kind, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transport_failure() {
        // Port 1 on loopback refuses connections.
        let params = json!({ "url": "http://127.0.0.1:1/health" });
        let result = HttpExecutor::new().execute(request(&params)).await;
        assert!(!result.is_success());
        assert_eq!(result.error.unwrap().kind, HTTP_ERROR);
    }

    #[tokio::test]
    async fn test_cancelled_request_reports_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let params = json!({ "url": "http://127.0.0.1:1/health" });
        let result = HttpExecutor::new()
            .execute(StepRequest {
                run_id: Uuid::now_v7(),
                step_id: "call",
                kind: StepKind::Http,
                params: &params,
                timeout: None,
                cancel,
            })
            .await;
        assert_eq!(result.error.unwrap().kind, fault_kind::CANCELLED);
    }
}
