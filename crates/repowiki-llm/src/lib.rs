use anyhow::{anyhow, Result};
use repowiki_core::{
    ChatMessage, ChatRequest, LlmConfig, LlmResponse, LlmToolCall, TokenUsage,
};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::thread;
use std::time::Duration;

/// One synchronous chat round-trip over a transcript with optional tool
/// schemas. Providers own their timeout; the loop never retries on top.
pub trait LlmClient {
    fn complete_chat(&self, req: &ChatRequest) -> Result<LlmResponse>;
}

/// Adapter for OpenAI-compatible chat-completions endpoints (OpenAI itself,
/// Ollama, and most self-hosted gateways speak this shape).
#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    cfg: LlmConfig,
    client: Client,
}

impl OpenAiCompatClient {
    pub fn new(cfg: LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()?;
        Ok(Self { cfg, client })
    }

    fn api_key(&self) -> Result<String> {
        if let Some(key) = &self.cfg.api_key {
            return Ok(key.clone());
        }
        std::env::var(&self.cfg.api_key_env)
            .map_err(|_| anyhow!("{} not set", self.cfg.api_key_env))
    }

    fn complete_inner(&self, req: &ChatRequest, api_key: &str) -> Result<LlmResponse> {
        let payload = build_chat_payload(req);
        let mut last_err: Option<anyhow::Error> = None;

        for attempt in 0..=self.cfg.max_retries {
            let response = self
                .client
                .post(&self.cfg.endpoint)
                .bearer_auth(api_key)
                .json(&payload)
                .send();

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text()?;
                    if status.is_success() {
                        return parse_chat_payload(&body);
                    }

                    let retriable =
                        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
                    last_err = Some(anyhow!("chat API error {}: {}", status, body));
                    if retriable && attempt < self.cfg.max_retries {
                        let backoff = self
                            .cfg
                            .retry_base_ms
                            .saturating_mul(2_u64.pow(attempt as u32));
                        thread::sleep(Duration::from_millis(backoff));
                        continue;
                    }
                    break;
                }
                Err(e) => {
                    last_err = Some(anyhow!("chat request failed: {e}"));
                    if attempt < self.cfg.max_retries {
                        let backoff = self
                            .cfg
                            .retry_base_ms
                            .saturating_mul(2_u64.pow(attempt as u32));
                        thread::sleep(Duration::from_millis(backoff));
                        continue;
                    }
                    break;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("chat request failed without detailed error")))
    }
}

impl LlmClient for OpenAiCompatClient {
    fn complete_chat(&self, req: &ChatRequest) -> Result<LlmResponse> {
        let key = self.api_key()?;
        self.complete_inner(req, &key)
    }
}

fn build_chat_payload(req: &ChatRequest) -> Value {
    let messages: Vec<Value> = req.messages.iter().map(message_to_wire).collect();

    let mut payload = json!({
        "model": req.model,
        "messages": messages,
        "max_tokens": req.max_tokens,
    });
    if !req.tools.is_empty() {
        payload["tools"] = serde_json::to_value(&req.tools).unwrap_or(Value::Null);
        payload["tool_choice"] = serde_json::to_value(&req.tool_choice).unwrap_or(Value::Null);
    }
    if let Some(temperature) = req.temperature {
        payload["temperature"] = json!(temperature);
    }
    payload
}

fn message_to_wire(message: &ChatMessage) -> Value {
    match message {
        ChatMessage::System { content } => json!({"role": "system", "content": content}),
        ChatMessage::User { content } => json!({"role": "user", "content": content}),
        ChatMessage::Assistant {
            content,
            tool_calls,
        } => {
            let mut wire = json!({
                "role": "assistant",
                "content": content.clone().map(Value::String).unwrap_or(Value::Null),
            });
            if !tool_calls.is_empty() {
                wire["tool_calls"] = Value::Array(
                    tool_calls
                        .iter()
                        .map(|call| {
                            json!({
                                "id": call.id,
                                "type": "function",
                                "function": {
                                    "name": call.name,
                                    "arguments": call.arguments,
                                }
                            })
                        })
                        .collect(),
                );
            }
            wire
        }
        ChatMessage::Tool {
            tool_call_id,
            content,
        } => json!({
            "role": "tool",
            "tool_call_id": tool_call_id,
            "content": content,
        }),
    }
}

fn parse_chat_payload(body: &str) -> Result<LlmResponse> {
    let value: Value = serde_json::from_str(body)?;
    let message = value
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .and_then(|v| v.get("message"))
        .ok_or_else(|| anyhow!("unexpected chat payload: missing choices[0].message"))?;

    let text = message
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let tool_calls = message
        .get("tool_calls")
        .and_then(|v| v.as_array())
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    let function = call.get("function")?;
                    Some(LlmToolCall {
                        id: call.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                        name: function
                            .get("name")
                            .and_then(|v| v.as_str())?
                            .to_string(),
                        arguments: function
                            .get("arguments")
                            .and_then(|v| v.as_str())
                            .unwrap_or("{}")
                            .to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let finish_reason = value
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .and_then(|v| v.get("finish_reason"))
        .and_then(|v| v.as_str())
        .unwrap_or("stop")
        .to_string();

    let usage = value.get("usage").map(|u| TokenUsage {
        prompt_tokens: u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        completion_tokens: u
            .get("completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
    });

    Ok(LlmResponse {
        text,
        finish_reason,
        tool_calls,
        usage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use repowiki_core::{FunctionDefinition, ToolChoice, ToolDefinition};

    fn sample_request() -> ChatRequest {
        ChatRequest {
            model: "gpt-4o-mini".to_string(),
            messages: vec![
                ChatMessage::System {
                    content: "sys".to_string(),
                },
                ChatMessage::User {
                    content: "question".to_string(),
                },
                ChatMessage::Assistant {
                    content: None,
                    tool_calls: vec![LlmToolCall {
                        id: "call_1".to_string(),
                        name: "search_chunks".to_string(),
                        arguments: r#"{"query":"x"}"#.to_string(),
                    }],
                },
                ChatMessage::Tool {
                    tool_call_id: "call_1".to_string(),
                    content: "No results for 'x'.".to_string(),
                },
            ],
            tools: vec![ToolDefinition {
                tool_type: "function".to_string(),
                function: FunctionDefinition {
                    name: "search_chunks".to_string(),
                    description: "Search".to_string(),
                    parameters: serde_json::json!({"type": "object", "properties": {}}),
                },
            }],
            tool_choice: ToolChoice::auto(),
            max_tokens: 512,
            temperature: Some(0.2),
        }
    }

    #[test]
    fn payload_maps_roles_and_tool_correlation() {
        let payload = build_chat_payload(&sample_request());
        let messages = payload["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(messages[2]["content"], Value::Null);
        assert_eq!(messages[2]["tool_calls"][0]["id"], "call_1");
        assert_eq!(
            messages[2]["tool_calls"][0]["function"]["name"],
            "search_chunks"
        );
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "call_1");
        assert_eq!(payload["tool_choice"], "auto");
        assert_eq!(payload["tools"][0]["function"]["name"], "search_chunks");
    }

    #[test]
    fn payload_omits_tools_when_empty() {
        let mut req = sample_request();
        req.tools.clear();
        let payload = build_chat_payload(&req);
        assert!(payload.get("tools").is_none());
        assert!(payload.get("tool_choice").is_none());
    }

    #[test]
    fn parses_text_response() {
        let body = r#"{"choices":[{"message":{"content":"hello"},"finish_reason":"stop"}],"usage":{"prompt_tokens":12,"completion_tokens":3}}"#;
        let got = parse_chat_payload(body).expect("parse");
        assert_eq!(got.text, "hello");
        assert_eq!(got.finish_reason, "stop");
        assert!(got.tool_calls.is_empty());
        assert_eq!(got.usage.unwrap().prompt_tokens, 12);
    }

    #[test]
    fn parses_tool_call_response() {
        let body = r#"{"choices":[{"message":{"content":null,"tool_calls":[{"id":"call_9","type":"function","function":{"name":"get_excerpt","arguments":"{\"path\":\"a.ts\"}"}}]},"finish_reason":"tool_calls"}]}"#;
        let got = parse_chat_payload(body).expect("parse");
        assert!(got.text.is_empty());
        assert_eq!(got.finish_reason, "tool_calls");
        assert_eq!(got.tool_calls.len(), 1);
        assert_eq!(got.tool_calls[0].id, "call_9");
        assert_eq!(got.tool_calls[0].name, "get_excerpt");
        assert!(got.tool_calls[0].arguments.contains("a.ts"));
    }

    #[test]
    fn missing_choices_is_an_error() {
        let err = parse_chat_payload(r#"{"error":"rate limited"}"#).unwrap_err();
        assert!(err.to_string().contains("choices"));
    }
}
