//! Anthropic Messages API client.
//!
//! Translates the OpenAI-shaped [`ChatRequest`] into Messages API content
//! blocks: the system prompt is a top-level field, assistant tool calls become
//! `tool_use` blocks and tool results are folded into `tool_result` blocks on
//! a user turn.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use super::catalog::Provider;
use super::error::{classify_http_status, is_transient_message, LlmError, LlmErrorKind};
use super::{
    ChatMessage, ChatRequest, ChatResponse, FunctionCall, LlmClient, Role, ToolCall, Usage,
};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
/// The Messages API requires max_tokens on every request.
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicClient {
    client: Client,
    api_key: String,
    endpoint: String,
}

impl AnthropicClient {
    pub fn new(api_key: String, timeout: Duration) -> Result<Self, LlmError> {
        Self::with_base_url(api_key, None, timeout)
    }

    pub fn with_base_url(
        api_key: String,
        base_url: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::network_error(format!("Failed to build HTTP client: {}", e)))?;
        let endpoint = match base_url {
            Some(base) => format!("{}/v1/messages", base.trim_end_matches('/')),
            None => ANTHROPIC_API_URL.to_string(),
        };
        Ok(Self {
            client,
            api_key,
            endpoint,
        })
    }

    fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
        headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    fn create_error(status: reqwest::StatusCode, body: &str, retry_after: Option<Duration>) -> LlmError {
        let status_code = status.as_u16();
        match classify_http_status(status_code) {
            LlmErrorKind::RateLimited => LlmError::rate_limited(body.to_string(), retry_after),
            LlmErrorKind::ClientError if is_transient_message(body) => {
                LlmError::server_error(status_code, body.to_string())
            }
            LlmErrorKind::ClientError => LlmError::client_error(status_code, body.to_string()),
            _ => LlmError::server_error(status_code, body.to_string()),
        }
    }

    fn build_request(model_id: &str, request: &ChatRequest) -> AnthropicRequest {
        AnthropicRequest {
            model: model_id.to_string(),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system: request.system_prompt.clone(),
            messages: convert_messages(&request.messages),
            tools: request.tools.as_ref().map(|tools| {
                tools
                    .iter()
                    .map(|t| AnthropicTool {
                        name: t.function.name.clone(),
                        description: t.function.description.clone(),
                        input_schema: t.function.parameters.clone(),
                    })
                    .collect()
            }),
            temperature: request.temperature,
        }
    }

    fn parse_response(parsed: AnthropicResponse, model_id: &str) -> ChatResponse {
        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in parsed.content {
            match block {
                ResponseBlock::Text { text: t } => text.push_str(&t),
                ResponseBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                    id,
                    call_type: "function".to_string(),
                    function: FunctionCall {
                        name,
                        arguments: input.to_string(),
                    },
                }),
                ResponseBlock::Other => {}
            }
        }

        ChatResponse {
            content: (!text.is_empty()).then_some(text),
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            finish_reason: parsed.stop_reason,
            usage: parsed
                .usage
                .map(|u| Usage::new(u.input_tokens, u.output_tokens)),
            model: parsed.model.or_else(|| Some(model_id.to_string())),
        }
    }
}

/// Map chat messages onto Messages API turns.
///
/// System messages inside the list are skipped (the system prompt travels in
/// its own field). Consecutive tool results are merged into one user turn.
fn convert_messages(messages: &[ChatMessage]) -> Vec<AnthropicMessage> {
    let mut out: Vec<AnthropicMessage> = Vec::new();
    for msg in messages {
        match msg.role {
            Role::System => continue,
            Role::User => out.push(AnthropicMessage {
                role: "user",
                content: vec![json!({"type": "text", "text": msg.content.clone().unwrap_or_default()})],
            }),
            Role::Assistant => {
                let mut blocks = Vec::new();
                if let Some(text) = msg.content.as_deref().filter(|t| !t.is_empty()) {
                    blocks.push(json!({"type": "text", "text": text}));
                }
                for call in msg.tool_calls.iter().flatten() {
                    let input: Value = serde_json::from_str(&call.function.arguments)
                        .unwrap_or_else(|_| json!({}));
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.function.name,
                        "input": input,
                    }));
                }
                out.push(AnthropicMessage {
                    role: "assistant",
                    content: blocks,
                });
            }
            Role::Tool => {
                let block = json!({
                    "type": "tool_result",
                    "tool_use_id": msg.tool_call_id.clone().unwrap_or_default(),
                    "content": msg.content.clone().unwrap_or_default(),
                });
                match out.last_mut() {
                    Some(last) if last.role == "user" && last.is_tool_results() => {
                        last.content.push(block)
                    }
                    _ => out.push(AnthropicMessage {
                        role: "user",
                        content: vec![block],
                    }),
                }
            }
        }
    }
    out
}

#[async_trait]
impl LlmClient for AnthropicClient {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    async fn chat_completion(
        &self,
        model_id: &str,
        request: &ChatRequest,
    ) -> Result<ChatResponse, LlmError> {
        let body = Self::build_request(model_id, request);
        tracing::debug!("Sending request to Anthropic: model={}", model_id);

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::network_error(format!("Request timeout: {}", e))
                } else if e.is_connect() {
                    LlmError::network_error(format!("Connection failed: {}", e))
                } else {
                    LlmError::network_error(format!("Request failed: {}", e))
                }
            })?;

        let status = response.status();
        let retry_after = Self::parse_retry_after(response.headers());
        let text = response
            .text()
            .await
            .map_err(|e| LlmError::network_error(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(Self::create_error(status, &text, retry_after));
        }

        let parsed: AnthropicResponse = serde_json::from_str(&text).map_err(|e| {
            LlmError::parse_error(format!(
                "Failed to parse response: {}, body: {}",
                e,
                crate::util::truncate_chars(&text, 500)
            ))
        })?;

        Ok(Self::parse_response(parsed, model_id))
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: Vec<Value>,
}

impl AnthropicMessage {
    fn is_tool_results(&self) -> bool {
        self.content
            .iter()
            .all(|b| b.get("type").and_then(Value::as_str) == Some("tool_result"))
    }
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ResponseBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{FunctionDefinition, ToolDefinition};

    #[test]
    fn test_request_shape() {
        let tools = vec![ToolDefinition {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: "read_file".to_string(),
                description: "Read a file".to_string(),
                parameters: json!({"type": "object"}),
            },
        }];
        let request = ChatRequest::new(vec![ChatMessage::user("hello")])
            .with_system("sys")
            .with_tools(tools);
        let json = serde_json::to_value(AnthropicClient::build_request("claude-x", &request)).unwrap();

        assert_eq!(json["system"], "sys");
        assert_eq!(json["max_tokens"], DEFAULT_MAX_TOKENS);
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["tools"][0]["name"], "read_file");
        assert_eq!(json["tools"][0]["input_schema"]["type"], "object");
    }

    #[test]
    fn test_tool_turns_are_converted() {
        let call = ToolCall {
            id: "tu_1".to_string(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: "search_file".to_string(),
                arguments: r#"{"query":"revenue"}"#.to_string(),
            },
        };
        let call2 = ToolCall {
            id: "tu_2".to_string(),
            ..call.clone()
        };
        let messages = vec![
            ChatMessage::user("analyze"),
            ChatMessage::assistant_tool_calls(None, vec![call, call2]),
            ChatMessage::tool_result("tu_1", "found"),
            ChatMessage::tool_result("tu_2", "nothing"),
        ];
        let converted = convert_messages(&messages);

        assert_eq!(converted.len(), 3);
        assert_eq!(converted[1].role, "assistant");
        assert_eq!(converted[1].content[0]["type"], "tool_use");
        assert_eq!(converted[1].content[0]["input"]["query"], "revenue");
        assert_eq!(converted[2].role, "user");
        assert_eq!(converted[2].content.len(), 2);
        assert_eq!(converted[2].content[1]["tool_use_id"], "tu_2");
    }

    #[test]
    fn test_response_blocks() {
        let body = r#"{
            "model": "claude-sonnet-4-20250514",
            "content": [
                {"type": "text", "text": "Let me look."},
                {"type": "tool_use", "id": "tu_9", "name": "read_file", "input": {"file_name": "q3.csv"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 50, "output_tokens": 20}
        }"#;
        let parsed: AnthropicResponse = serde_json::from_str(body).unwrap();
        let response = AnthropicClient::parse_response(parsed, "claude-sonnet-4-20250514");

        assert_eq!(response.content.as_deref(), Some("Let me look."));
        assert!(response.has_tool_calls());
        let call = &response.tool_calls.as_ref().unwrap()[0];
        assert_eq!(call.id, "tu_9");
        let args: Value = serde_json::from_str(&call.function.arguments).unwrap();
        assert_eq!(args["file_name"], "q3.csv");
        assert_eq!(response.usage, Some(Usage::new(50, 20)));
    }

    #[test]
    fn test_overloaded_is_transient() {
        let err = AnthropicClient::create_error(
            reqwest::StatusCode::from_u16(529).unwrap(),
            r#"{"type":"error","error":{"type":"overloaded_error"}}"#,
            None,
        );
        assert!(err.is_transient());
    }

    #[test]
    fn test_bad_request_with_numbers_stays_permanent() {
        let err = AnthropicClient::create_error(
            reqwest::StatusCode::BAD_REQUEST,
            r#"{"type":"error","error":{"type":"invalid_request_error","message":"max_tokens: 1500 > 1024"}}"#,
            None,
        );
        assert_eq!(err.kind, LlmErrorKind::ClientError);
        assert!(!err.is_transient());
    }
}
