//! Anthropic Messages API adapter (family A).
//!
//! Streams completions from the `/v1/messages` endpoint using
//! Server-Sent Events. Text arrives as `content_block_delta` frames; a
//! requested tool call arrives as a `content_block_start` of type
//! `tool_use` followed by `input_json_delta` fragments that are
//! accumulated until the stream ends.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::agent::*;

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic Messages API adapter.
#[derive(Debug, Clone)]
pub struct AnthropicAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl AnthropicAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: ANTHROPIC_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &'static str {
        "anthropic"
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
        let response = post_stream(&self.client, &self.base_url, &request.api_key, body).await?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let client = self.client.clone();
        let base_url = self.base_url.clone();
        tokio::spawn(run_exchange(client, base_url, request, messages, response, tx));

        Ok(rx)
    }
}

/// Build the JSON body for the Messages API.
fn build_body(model: &str, messages: &[Value], with_search_tool: bool) -> Value {
    let mut body = json!({
        "model": model,
        "max_tokens": DEFAULT_MAX_TOKENS,
        "messages": messages,
        "stream": true,
    });
    if with_search_tool {
        body["tools"] = json!([{
            "name": WEB_SEARCH_TOOL,
            "description": WEB_SEARCH_DESCRIPTION,
            "input_schema": web_search_parameters(),
        }]);
    }
    body
}

/// POST a streaming request; non-success statuses become errors carrying
/// the provider's status and body.
async fn post_stream(
    client: &reqwest::Client,
    base_url: &str,
    api_key: &str,
    body: Value,
) -> Result<reqwest::Response, AgentError> {
    let url = format!("{base_url}/v1/messages");
    let response = client
        .post(&url)
        .header("x-api-key", api_key)
        .header("anthropic-version", ANTHROPIC_VERSION)
        .header("content-type", "application/json")
        .header("accept", "text/event-stream")
        .json(&body)
        .send()
        .await
        .map_err(|e| AgentError::Provider(format!("Anthropic request failed: {e}")))?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable>".to_string());
        return Err(AgentError::Provider(format!(
            "Anthropic API error ({status}): {body}"
        )));
    }

    Ok(response)
}

/// Drive the full exchange: round 1, the optional search continuation
/// round, then exactly one terminal event.
async fn run_exchange(
    client: reqwest::Client,
    base_url: String,
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
        match resolve_web_search(&client, &call, search_key).await {
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
                match post_stream(&client, &base_url, &request.api_key, body).await {
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
/// tool-result turn, in the Messages API's native block format.
fn continuation_messages(
    messages: &[Value],
    partial_text: &str,
    call: &ToolCallCapture,
    results_text: &str,
) -> Vec<Value> {
    let input: Value = serde_json::from_str(&call.args_json).unwrap_or_else(|_| json!({}));

    let mut content = Vec::new();
    if !partial_text.is_empty() {
        content.push(json!({ "type": "text", "text": partial_text }));
    }
    content.push(json!({
        "type": "tool_use",
        "id": call.id,
        "name": call.name,
        "input": input,
    }));

    let mut out = messages.to_vec();
    out.push(json!({ "role": "assistant", "content": content }));
    out.push(json!({
        "role": "user",
        "content": [{
            "type": "tool_result",
            "tool_use_id": call.id,
            "content": results_text,
        }],
    }));
    out
}

/// Read the SSE stream, forwarding text deltas and accumulating any
/// tool-call capture until the stream ends.
async fn drain_stream(
    response: reqwest::Response,
    tx: &mpsc::Sender<StreamEvent>,
    full_text: &mut String,
    capture: &mut Option<ToolCallCapture>,
) -> Result<StreamOutcome, String> {
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    let mut event_type = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| format!("stream read error: {e}"))?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(newline_pos) = buffer.find('\n') {
            let line = buffer[..newline_pos].trim_end_matches('\r').to_string();
            buffer.drain(..=newline_pos);

            if let Some(evt) = line.strip_prefix("event: ") {
                event_type = evt.to_string();
            } else if let Some(data) = line.strip_prefix("data: ") {
                let data = data.trim();
                if data == "[DONE]" {
                    continue;
                }
                match parse_sse_event(&event_type, data, capture) {
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

/// Parse a single SSE event. Unparseable data lines are skipped rather
/// than aborting the stream.
fn parse_sse_event(
    event_type: &str,
    data: &str,
    capture: &mut Option<ToolCallCapture>,
) -> Option<Frame> {
    let parsed: Value = serde_json::from_str(data).ok()?;

    match event_type {
        "content_block_start" => {
            let block = &parsed["content_block"];
            if block["type"].as_str() == Some("tool_use") && capture.is_none() {
                *capture = Some(ToolCallCapture {
                    id: block["id"].as_str().unwrap_or("").to_string(),
                    name: block["name"].as_str().unwrap_or("").to_string(),
                    args_json: String::new(),
                });
            }
            None
        }

        "content_block_delta" => {
            let delta = &parsed["delta"];
            match delta["type"].as_str() {
                Some("text_delta") => {
                    let text = delta["text"].as_str().unwrap_or("");
                    if text.is_empty() {
                        None
                    } else {
                        Some(Frame::Text(text.to_string()))
                    }
                }
                Some("input_json_delta") => {
                    if let Some(entry) = capture.as_mut() {
                        if let Some(partial) = delta["partial_json"].as_str() {
                            entry.args_json.push_str(partial);
                        }
                    }
                    None
                }
                _ => None,
            }
        }

        "error" => {
            let message = parsed["error"]["message"]
                .as_str()
                .or_else(|| parsed["message"].as_str())
                .unwrap_or("unknown API error")
                .to_string();
            Some(Frame::ApiError(message))
        }

        _ => None,
    }
}
