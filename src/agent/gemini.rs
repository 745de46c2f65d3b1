//! Google Gemini adapter.
//!
//! Streams completions from the `v1beta/models/{model}:streamGenerateContent`
//! endpoint. Simpler contract than the SSE tool-call families: one
//! streaming call, text parts only, no tool sub-protocol.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::agent::*;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Google Gemini adapter.
#[derive(Debug, Clone)]
pub struct GeminiAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl GeminiAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: GEMINI_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn name(&self) -> &'static str {
        "gemini"
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

        let body = build_body(&request.turns);
        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent",
            self.base_url, request.model
        );

        let response = self
            .client
            .post(&url)
            .query(&[("alt", "sse"), ("key", request.api_key.as_str())])
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Provider(format!("Gemini request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable>".to_string());
            return Err(AgentError::Provider(format!(
                "Gemini API error ({status}): {body}"
            )));
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut full_text = String::new();
            match drain_stream(response, &tx, &mut full_text).await {
                Ok(StreamOutcome::Aborted) => {}
                Ok(StreamOutcome::Done) => {
                    let _ = tx.send(StreamEvent::Final { text: full_text }).await;
                }
                Err(message) => {
                    let _ = tx.send(StreamEvent::Error { message }).await;
                }
            }
        });

        Ok(rx)
    }
}

/// Build the JSON body in Gemini contents/parts format. The assistant
/// role is called "model" on this API.
fn build_body(turns: &[ChatTurn]) -> Value {
    let contents: Vec<Value> = turns
        .iter()
        .map(|t| {
            let role = match t.role {
                ChatRole::User => "user",
                ChatRole::Assistant => "model",
            };
            json!({ "role": role, "parts": [{ "text": t.content }] })
        })
        .collect();

    json!({ "contents": contents })
}

async fn drain_stream(
    response: reqwest::Response,
    tx: &mpsc::Sender<StreamEvent>,
    full_text: &mut String,
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
                if let Some(text) = parse_sse_data(data.trim()) {
                    full_text.push_str(&text);
                    if tx.send(StreamEvent::Delta { text }).await.is_err() {
                        return Ok(StreamOutcome::Aborted);
                    }
                }
            }
        }
    }

    Ok(StreamOutcome::Done)
}

/// Extract the text parts of one streamed chunk. Unparseable lines are
/// skipped rather than aborting the stream.
fn parse_sse_data(data: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(data).ok()?;
    let parts = parsed
        .get("candidates")?
        .as_array()?
        .first()?
        .get("content")?
        .get("parts")?
        .as_array()?;

    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|v| v.as_str()))
        .collect();

    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_body_maps_assistant_to_model_role() {
        let turns = vec![
            ChatTurn {
                role: ChatRole::User,
                content: "Hello".to_string(),
            },
            ChatTurn {
                role: ChatRole::Assistant,
                content: "Hi!".to_string(),
            },
        ];
        let body = build_body(&turns);
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["contents"][1]["parts"][0]["text"], "Hi!");
    }

    #[test]
    fn test_parse_text_chunk() {
        let text = parse_sse_data(
            r#"{"candidates":[{"content":{"parts":[{"text":"Hello "},{"text":"world"}],"role":"model"}}]}"#,
        );
        assert_eq!(text, Some("Hello world".to_string()));
    }

    #[test]
    fn test_parse_skips_chunks_without_text() {
        assert_eq!(parse_sse_data(r#"{"candidates":[{"finishReason":"STOP"}]}"#), None);
        assert_eq!(parse_sse_data("{not json"), None);
    }
}
