//! Message executor.
//!
//! Default notification sink: emits the (template-resolved) message text as a
//! structured log event. Applications with real delivery channels register
//! their own `message` executor in its place.

use runbook_core::workflow::executor::{BoxedStepFuture, StepExecutor, StepRequest};
use runbook_types::workflow::StepResult;
use serde_json::{Value, json};

use super::INVALID_PARAMS;

/// Executes `message` steps by logging them.
pub struct MessageExecutor;

impl StepExecutor for MessageExecutor {
    fn execute<'a>(&'a self, request: StepRequest<'a>) -> BoxedStepFuture<'a> {
        Box::pin(async move {
            let Some(text) = request.params.get("text").and_then(Value::as_str) else {
                return StepResult::failure(
                    INVALID_PARAMS,
                    "message step requires a 'text' string param",
                    0,
                );
            };
            let channel = request
                .params
                .get("channel")
                .and_then(Value::as_str)
                .unwrap_or("default");

            tracing::info!(
                step_id = request.step_id,
                channel,
                message = text,
                "workflow message"
            );

            StepResult::success(
                json!({
                    "delivered": true,
                    "channel": channel,
                    "text": text,
                }),
                0,
            )
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
            step_id: "announce",
            kind: StepKind::Message,
            params,
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_message_delivers() {
        let params = json!({ "text": "build finished", "channel": "releases" });
        let result = MessageExecutor.execute(request(&params)).await;
        assert!(result.is_success());
        let output = result.output.unwrap();
        assert_eq!(output["delivered"], json!(true));
        assert_eq!(output["channel"], json!("releases"));
        assert_eq!(output["text"], json!("build finished"));
    }

    #[tokio::test]
    async fn test_missing_text_is_invalid() {
        let params = json!({});
        let result = MessageExecutor.execute(request(&params)).await;
        assert_eq!(result.error.unwrap().kind, INVALID_PARAMS);
    }
}
