//! Oracle backed by any OpenAI-compatible `/chat/completions` endpoint
//! (OpenAI itself, or a local Ollama server).

use std::time::Duration;

use async_trait::async_trait;
use parley_core::config::LlmConfig;
use parley_core::{ToolOperation, Turn, TurnRole};
use reqwest::Client;
use secrecy::ExposeSecret;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::conversation::truncation_suffix;
use crate::llm::{
    ComposeRequest, ComposedToolResult, Decision, DecisionRequest, Oracle, OracleError,
    ProposedCall,
};

const ERROR_DETAIL_LIMIT: usize = 200;

pub struct OpenAiCompatibleOracle {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
    max_retries: u32,
}

impl OpenAiCompatibleOracle {
    pub fn from_config(config: &LlmConfig) -> Result<Self, OracleError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|error| OracleError::Transport(error.to_string()))?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.endpoint()),
            api_key: config.api_key.as_ref().map(|key| key.expose_secret().to_string()),
            model: config.model.clone(),
            temperature: config.temperature,
            max_retries: config.max_retries,
        })
    }

    async fn post(&self, body: &Value) -> Result<Value, OracleError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.post_once(body).await {
                Ok(value) => return Ok(value),
                Err(error) if attempt <= self.max_retries && is_retryable(&error) => {
                    warn!(
                        event_name = "oracle.request.retry",
                        attempt,
                        error = %error,
                        "retrying oracle request"
                    );
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn post_once(&self, body: &Value) -> Result<Value, OracleError> {
        let mut request = self.client.post(&self.endpoint).json(body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response =
            request.send().await.map_err(|error| OracleError::Transport(error.to_string()))?;
        let status = response.status();
        let body =
            response.text().await.map_err(|error| OracleError::Transport(error.to_string()))?;
        interpret_response(status.as_u16(), &body)
    }

    fn base_body(&self, messages: Vec<Value>) -> Value {
        json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
            "temperature": self.temperature,
        })
    }
}

#[async_trait]
impl Oracle for OpenAiCompatibleOracle {
    async fn decide(&self, request: DecisionRequest<'_>) -> Result<Decision, OracleError> {
        let mut messages = vec![json!({"role": "system", "content": request.system_context})];
        messages.extend(history_messages(request.history));
        messages.push(json!({"role": "user", "content": request.message}));

        let mut body = self.base_body(messages);
        let tools = wire_tools(request.operations);
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
            body["tool_choice"] = json!("auto");
        }

        debug!(
            event_name = "oracle.decide.request",
            operation_count = request.operations.len(),
            history_len = request.history.len(),
            "asking oracle for a decision"
        );
        let value = self.post(&body).await?;
        parse_decision(&value)
    }

    async fn compose(&self, request: ComposeRequest<'_>) -> Result<String, OracleError> {
        let mut messages = vec![json!({"role": "system", "content": request.system_context})];
        messages.extend(history_messages(request.history));
        messages.push(json!({"role": "user", "content": request.message}));
        messages.push(json!({"role": "system", "content": outcome_brief(request.tool_result)}));

        let value = self.post(&self.base_body(messages)).await?;
        extract_text(&value)
            .ok_or_else(|| OracleError::Malformed("completion carried no text".to_string()))
    }
}

/// Status first: proxies and local servers often answer 5xx with HTML or nothing.
fn interpret_response(status: u16, body: &str) -> Result<Value, OracleError> {
    let parsed = serde_json::from_str::<Value>(body).ok();

    if !(200..300).contains(&status) {
        let detail = parsed.as_ref().and_then(extract_error).unwrap_or_else(|| {
            let excerpt = body.trim().chars().take(ERROR_DETAIL_LIMIT).collect::<String>();
            if excerpt.is_empty() {
                format!("request failed with status {status}")
            } else {
                excerpt
            }
        });
        return Err(OracleError::Rejected { status, detail });
    }

    let value = parsed.ok_or_else(|| OracleError::Malformed("response body is not JSON".into()))?;
    if let Some(detail) = extract_error(&value) {
        return Err(OracleError::Rejected { status, detail });
    }
    Ok(value)
}

fn is_retryable(error: &OracleError) -> bool {
    match error {
        OracleError::Transport(_) => true,
        OracleError::Rejected { status, .. } => *status == 429 || *status >= 500,
        OracleError::Malformed(_) => false,
    }
}

fn history_messages(history: &[Turn]) -> impl Iterator<Item = Value> + '_ {
    history.iter().filter(|turn| turn.is_dialogue()).map(|turn| {
        let role = match turn.role {
            TurnRole::User => "user",
            _ => "assistant",
        };
        json!({"role": role, "content": turn.content.as_text()})
    })
}

fn wire_tools(operations: &[ToolOperation]) -> Vec<Value> {
    operations
        .iter()
        .map(|operation| {
            json!({
                "type": "function",
                "function": {
                    "name": operation.name,
                    "description": operation.description,
                    "parameters": operation.argument_schema,
                }
            })
        })
        .collect()
}

/// Tool outcome as seen by the compose call: bounded content only.
fn outcome_brief(tool_result: Option<ComposedToolResult<'_>>) -> String {
    match tool_result {
        None => "No tool was used. Answer the user directly.".to_string(),
        Some(ComposedToolResult { call, bounded }) => {
            let mut brief = format!(
                "Result of `{}` on {}:\n{}",
                call.operation,
                call.backend,
                bounded.render()
            );
            if let Some(suffix) = truncation_suffix(bounded) {
                brief.push_str(&format!(
                    "\nThe result was truncated. Tell the user, e.g. \"{suffix}\""
                ));
            }
            brief
        }
    }
}

pub(crate) fn parse_decision(value: &Value) -> Result<Decision, OracleError> {
    let message = value
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .ok_or_else(|| OracleError::Malformed("response has no choices".to_string()))?;

    let calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| calls.iter().filter_map(parse_tool_call).collect::<Vec<_>>())
        .unwrap_or_default();
    if !calls.is_empty() {
        return Ok(Decision::ToolCalls(calls));
    }

    extract_text(value)
        .map(Decision::Direct)
        .ok_or_else(|| {
            OracleError::Malformed("completion carried neither text nor tool calls".into())
        })
}

fn parse_tool_call(call: &Value) -> Option<ProposedCall> {
    let function = call.get("function")?;
    let operation = function.get("name")?.as_str()?.to_string();
    // Arguments arrive as a JSON-encoded string; anything unparseable is kept
    // as a string so the registry reports it as malformed.
    let arguments = match function.get("arguments") {
        Some(Value::String(raw)) if raw.trim().is_empty() => json!({}),
        Some(Value::String(raw)) => {
            serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
        }
        Some(other) => other.clone(),
        None => json!({}),
    };
    Some(ProposedCall { operation, arguments })
}

fn extract_text(value: &Value) -> Option<String> {
    value
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

fn extract_error(value: &Value) -> Option<String> {
    value
        .get("error")
        .and_then(|error| error.get("message").or(Some(error)))
        .and_then(Value::as_str)
        .map(str::to_string)
}
