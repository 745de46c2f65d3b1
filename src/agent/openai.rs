//! OpenAI-compatible Chat Completions adapter (family B).
//!
//! One adapter covers every provider speaking the `/v1/chat/completions`
//! SSE dialect: OpenAI itself plus OpenRouter, Moonshot (Kimi), and
//! DeepSeek via their base URLs. Text arrives as
//! `choices[0].delta.content`; a requested tool call arrives as
//! `choices[0].delta.tool_calls[0]` fragments whose `function.arguments`
//! string is concatenated until `finish_reason == "tool_calls"` or the
//! stream ends.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::agent::*;

/// OpenAI-compatible Chat Completions adapter.
#[derive(Debug, Clone)]
pub struct OpenAiCompatAdapter {
    client: reqwest::Client,
    base_url: String,
    name: &'static str,
    display_name: &'static str,
}

impl OpenAiCompatAdapter {
    pub fn openai(client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: "https://api.openai.com".to_string(),
            name: "openai",
            display_name: "OpenAI",
        }
    }

    pub fn openrouter(client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: "https://openrouter.ai/api".to_string(),
            name: "openrouter",
            display_name: "OpenRouter",
        }
    }

    /// Kimi uses OpenAI-compatible API format.
    pub fn kimi(client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: "https://api.moonshot.cn".to_string(),
            name: "kimi",
            display_name: "Kimi",
        }
    }

    pub fn deepseek(client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: "https://api.deepseek.com".to_string(),
            name: "deepseek",
            display_name: "DeepSeek",
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatAdapter {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn stream(
        &self,
        request: ChatRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, AgentError> {
        if request.api_key.trim().is_empty() {
            return Err(AgentError::InvalidApiKey(
                "API key must not be empty".to_string(),
            ));
        }

        let messages: Vec<Value> = request
            .turns
            .iter()
            .map(|t| json!({ "role": t.role.as_str(), "content": t.content }))
            .collect();

        let body = build_body(&request.model, &messages, request.search_key.is_some());
        let response = post_stream(
            &self.client,
            &self.base_url,
            self.display_name,
            &request.api_key,
            body,
        )
        .await?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let adapter = self.clone();
        tokio::spawn(run_exchange(adapter, request, messages, response, tx));

        Ok(rx)
    }
}

/// Build the JSON body for the Chat Completions API.
fn build_body(model: &str, messages: &[Value], with_search_tool: bool) -> Value {
    let mut body = json!({
        "model": model,
        "messages": messages,
        "stream": true,
    });
    if with_search_tool {
        body["tools"] = json!([{
            "type": "function",
            "function": {
                "name": WEB_SEARCH_TOOL,
                "description": WEB_SEARCH_DESCRIPTION,
                "parameters": web_search_parameters(),
            },
        }]);
    }
    body
}

async fn post_stream(
    client: &reqwest::Client,
    base_url: &str,
    display_name: &str,
    api_key: &str,
    body: Value,
) -> Result<reqwest::Response, AgentError> {
    let url = format!("{base_url}/v1/chat/completions");
    let response = client
        .post(&url)
        .header("authorization", format!("Bearer {api_key}"))
        .header("content-type", "application/json")
        .header("accept", "text/event-stream")
        .json(&body)
        .send()
        .await
        .map_err(|e| AgentError::Provider(format!("{display_name} request failed: {e}")))?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable>".to_string());
        return Err(AgentError::Provider(format!(
            "{display_name} API error ({status}): {body}"
        )));
    }

    Ok(response)
}

/// Drive the full exchange: round 1, the optional search continuation
/// round, then exactly one terminal event.
async fn run_exchange(
    adapter: OpenAiCompatAdapter,
    request: ChatRequest,
    messages: Vec<Value>,
    response: reqwest::Response,
    tx: mpsc::Sender<StreamEvent>,
) {
    let mut full_text = String::new();
    let mut capture: Option<ToolCallCapture> = None;

    match drain_stream(response, &tx, &mut full_text, &mut capture).await {
        Ok(StreamOutcome::Aborted) => return,
        Ok(StreamOutcome::Done) => {}
        Err(message) => {
            let _ = tx.send(StreamEvent::Error { message }).await;
            return;
        }
    }

    let tool_call = capture.filter(|c| c.name == WEB_SEARCH_TOOL);
    if let (Some(call), Some(search_key)) = (tool_call, request.search_key.as_deref()) {
        match resolve_web_search(&adapter.client, &call, search_key).await {
            Ok((query, results_text)) => {
                let round_one_text = full_text.clone();
                let notice = search_notice(&query);
                full_text.push_str(&notice);
                if tx.send(StreamEvent::Delta { text: notice }).await.is_err() {
                    return;
                }

                let follow_up =
                    continuation_messages(&messages, &round_one_text, &call, &results_text);
                let body = build_body(&request.model, &follow_up, false);
                match post_stream(
                    &adapter.client,
                    &adapter.base_url,
                    adapter.display_name,
                    &request.api_key,
                    body,
                )
                .await
                {
                    Ok(response) => {
                        let mut ignored = None;
                        match drain_stream(response, &tx, &mut full_text, &mut ignored).await {
                            Ok(StreamOutcome::Aborted) => return,
                            Ok(StreamOutcome::Done) => {}
                            Err(message) => {
                                let _ = tx.send(StreamEvent::Error { message }).await;
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx
                            .send(StreamEvent::Error {
                                message: e.to_string(),
                            })
                            .await;
                        return;
                    }
                }
            }
            Err(reason) => {
                let notice = search_failure_notice(&reason);
                full_text.push_str(&notice);
                if tx.send(StreamEvent::Delta { text: notice }).await.is_err() {
                    return;
                }
            }
        }
    }

    let _ = tx.send(StreamEvent::Final { text: full_text }).await;
}

/// Extend the conversation with the assistant's tool-call turn and the
/// tool-result turn, in the Chat Completions native format.
fn continuation_messages(
    messages: &[Value],
    partial_text: &str,
    call: &ToolCallCapture,
    results_text: &str,
) -> Vec<Value> {
    let mut assistant = json!({
        "role": "assistant",
        "tool_calls": [{
            "id": call.id,
            "type": "function",
            "function": {
                "name": call.name,
                "arguments": call.args_json,
            },
        }],
    });
    if !partial_text.is_empty() {
        assistant["content"] = json!(partial_text);
    }

    let mut out = messages.to_vec();
    out.push(assistant);
    out.push(json!({
        "role": "tool",
        "tool_call_id": call.id,
        "content": results_text,
    }));
    out
}

/// Read the SSE stream, forwarding text deltas and accumulating any
/// tool-call capture until `[DONE]` or the stream ends.
async fn drain_stream(
    response: reqwest::Response,
    tx: &mpsc::Sender<StreamEvent>,
    full_text: &mut String,
    capture: &mut Option<ToolCallCapture>,
) -> Result<StreamOutcome, String> {
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| format!("stream read error: {e}"))?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(newline_pos) = buffer.find('\n') {
            let line = buffer[..newline_pos].trim_end_matches('\r').to_string();
            buffer.drain(..=newline_pos);

            if let Some(data) = line.strip_prefix("data: ") {
                let data = data.trim();
                if data == "[DONE]" {
                    continue;
                }
                match parse_sse_data(data, capture) {
                    Some(Frame::Text(text)) => {
                        full_text.push_str(&text);
                        if tx.send(StreamEvent::Delta { text }).await.is_err() {
                            return Ok(StreamOutcome::Aborted);
                        }
                    }
                    Some(Frame::ApiError(message)) => return Err(message),
                    None => {}
                }
            }
        }
    }

    Ok(StreamOutcome::Done)
}

/// Parse a single SSE data payload. Unparseable lines are skipped rather
/// than aborting the stream.
fn parse_sse_data(data: &str, capture: &mut Option<ToolCallCapture>) -> Option<Frame> {
    let parsed: Value = serde_json::from_str(data).ok()?;

    if let Some(error) = parsed.get("error") {
        let message = error
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown API error")
            .to_string();
        return Some(Frame::ApiError(message));
    }

    let choice = parsed.get("choices")?.as_array()?.first()?;
    let delta = choice.get("delta")?;

    if let Some(content) = delta.get("content").and_then(|v| v.as_str()) {
        if !content.is_empty() {
            return Some(Frame::Text(content.to_string()));
        }
    }

    if let Some(tc) = delta
        .get("tool_calls")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
    {
        let function = tc.get("function");
        let args_chunk = function
            .and_then(|f| f.get("arguments"))
            .and_then(|v| v.as_str())
            .unwrap_or("");

        if let Some(id) = tc.get("id").and_then(|v| v.as_str()) {
            if capture.is_none() {
                *capture = Some(ToolCallCapture {
                    id: id.to_string(),
                    name: function
                        .and_then(|f| f.get("name"))
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    args_json: args_chunk.to_string(),
                });
            }
        } else if let Some(entry) = capture.as_mut() {
            entry.args_json.push_str(args_chunk);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_body_basic() {
        let messages = vec![json!({ "role": "user", "content": "Hello" })];
        let body = build_body("gpt-4o", &messages, false);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["stream"], true);
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn test_build_body_offers_search_tool() {
        let body = build_body("gpt-4o", &[], true);
        let tools = body["tools"].as_array().unwrap();
        assert_eq!(tools[0]["type"], "function");
        assert_eq!(tools[0]["function"]["name"], WEB_SEARCH_TOOL);
    }

    #[test]
    fn test_parse_content_delta() {
        let mut capture = None;
        let frame = parse_sse_data(
            r#"{"id":"chatcmpl-1","choices":[{"index":0,"delta":{"content":"Hello"},"finish_reason":null}]}"#,
            &mut capture,
        );
        assert_eq!(frame, Some(Frame::Text("Hello".to_string())));
    }

    #[test]
    fn test_parse_tool_call_fragments() {
        let mut capture = None;

        parse_sse_data(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"web_search","arguments":""}}]}}]}"#,
            &mut capture,
        );
        parse_sse_data(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"query\":"}}]}}]}"#,
            &mut capture,
        );
        parse_sse_data(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"btc price\"}"}}]}}]}"#,
            &mut capture,
        );
        parse_sse_data(
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            &mut capture,
        );

        let call = capture.unwrap();
        assert_eq!(call.id, "call_1");
        assert_eq!(call.name, "web_search");
        assert_eq!(call.args_json, r#"{"query":"btc price"}"#);
    }

    #[test]
    fn test_parse_error_payload() {
        let mut capture = None;
        let frame = parse_sse_data(
            r#"{"error":{"message":"Rate limit reached","type":"rate_limit_error"}}"#,
            &mut capture,
        );
        assert_eq!(frame, Some(Frame::ApiError("Rate limit reached".to_string())));
    }

    #[test]
    fn test_malformed_data_is_skipped() {
        let mut capture = None;
        assert_eq!(parse_sse_data("{oops", &mut capture), None);
        assert_eq!(parse_sse_data(r#"{"choices":[]}"#, &mut capture), None);
    }

    #[test]
    fn test_continuation_messages_shape() {
        let messages = vec![json!({ "role": "user", "content": "what's the BTC price?" })];
        let call = ToolCallCapture {
            id: "call_1".to_string(),
            name: WEB_SEARCH_TOOL.to_string(),
            args_json: r#"{"query":"btc price"}"#.to_string(),
        };
        let out = continuation_messages(&messages, "Checking.", &call, "1. $100k");

        assert_eq!(out.len(), 3);
        let assistant = &out[1];
        assert_eq!(assistant["role"], "assistant");
        assert_eq!(assistant["content"], "Checking.");
        assert_eq!(assistant["tool_calls"][0]["id"], "call_1");
        assert_eq!(
            assistant["tool_calls"][0]["function"]["arguments"],
            r#"{"query":"btc price"}"#
        );

        let tool_turn = &out[2];
        assert_eq!(tool_turn["role"], "tool");
        assert_eq!(tool_turn["tool_call_id"], "call_1");
        assert_eq!(tool_turn["content"], "1. $100k");
    }

    #[test]
    fn test_continuation_without_partial_text_omits_content() {
        let call = ToolCallCapture {
            id: "call_1".to_string(),
            name: WEB_SEARCH_TOOL.to_string(),
            args_json: "{}".to_string(),
        };
        let out = continuation_messages(&[], "", &call, "results");
        assert!(out[0].get("content").is_none());
    }

    #[test]
    fn test_constructor_base_urls() {
        let client = build_http_client().unwrap();
        assert_eq!(OpenAiCompatAdapter::openai(client.clone()).name(), "openai");
        assert_eq!(
            OpenAiCompatAdapter::openrouter(client.clone()).base_url,
            "https://openrouter.ai/api"
        );
        assert_eq!(
            OpenAiCompatAdapter::kimi(client.clone()).base_url,
            "https://api.moonshot.cn"
        );
        assert_eq!(
            OpenAiCompatAdapter::deepseek(client).base_url,
            "https://api.deepseek.com"
        );
    }
}
