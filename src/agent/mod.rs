//! Provider stream adapters.
//!
//! Each upstream LLM provider family gets one adapter implementing the
//! uniform [`ProviderAdapter`] contract: send a message history, get back
//! a channel of [`StreamEvent`]s carrying zero or more `Delta`s followed
//! by exactly one terminal `Final` (the full concatenated text) or
//! `Error`.
//! Adapters run their exchange in a spawned task so many sessions can
//! stream concurrently without shared mutable state.
//!
//! Adapters also drive the one-round `web_search` tool sub-protocol:
//! when a streamed response requests the tool and a search credential is
//! configured, the adapter runs the search and issues a single follow-up
//! request carrying the tool result in the provider's native format.

pub mod anthropic;
pub mod gemini;
pub mod openai;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::search;

/// Maximum output tokens requested from providers that require a cap.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Ceiling for one upstream request, headers through last body byte.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// TCP connect ceiling for upstream requests.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Channel capacity for streamed events.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Name of the single tool offered to providers.
pub const WEB_SEARCH_TOOL: &str = "web_search";

/// How many search results are folded into the tool result.
pub(crate) const SEARCH_RESULT_COUNT: usize = 5;

pub(crate) const WEB_SEARCH_DESCRIPTION: &str =
    "Search the web for current information. Use this for questions about recent events, news, or facts that may have changed since your training data.";

/// JSON Schema for the web_search tool input, shared across providers.
pub(crate) fn web_search_parameters() -> Value {
    json!({
        "type": "object",
        "properties": {
            "query": {
                "type": "string",
                "description": "The search query"
            }
        },
        "required": ["query"]
    })
}

/// Errors that can occur while talking to an upstream provider.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("{0}")]
    Provider(String),

    #[error("invalid API key: {0}")]
    InvalidApiKey(String),

    #[error("unsupported provider: {0}")]
    UnsupportedProvider(String),
}

/// Role of a turn in the upstream conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One turn of the conversation as sent upstream (role + content only;
/// ids and timestamps are a session concern and are stripped).
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

/// A request to stream one completion.
#[derive(Clone)]
pub struct ChatRequest {
    pub model: String,
    pub api_key: String,
    pub turns: Vec<ChatTurn>,
    /// Search credential. `None` means the web_search tool is not offered.
    pub search_key: Option<String>,
}

impl std::fmt::Debug for ChatRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatRequest")
            .field("model", &self.model)
            .field("api_key", &"<redacted>")
            .field("turns", &self.turns.len())
            .field("search_key", &self.search_key.as_ref().map(|_| "<set>"))
            .finish()
    }
}

/// A streaming event from an adapter.
///
/// Ordering guarantee: `Delta` zero or more times, then exactly one
/// `Final` (whose text equals the concatenation of all deltas) or one
/// `Error`. Nothing follows a terminal event.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Delta { text: String },
    Final { text: String },
    Error { message: String },
}

/// Capability implemented once per upstream provider family.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider name as used in session configs ("anthropic", "openai", ...).
    fn name(&self) -> &'static str;

    /// Start streaming a completion. Returns the event channel once the
    /// upstream request is accepted; pre-flight failures (bad key,
    /// non-success HTTP status) are returned as errors instead.
    async fn stream(&self, request: ChatRequest)
        -> Result<mpsc::Receiver<StreamEvent>, AgentError>;
}

/// Registry mapping provider names to adapter instances.
///
/// Replaces per-request string switching: dispatch is one map lookup and
/// new providers are one `register` call.
#[derive(Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<&'static str, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    /// Empty registry. Used by tests that inject mock adapters.
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Registry with every supported upstream provider, sharing one HTTP
    /// client.
    pub fn with_defaults() -> Result<Self, AgentError> {
        let client = build_http_client()?;
        let mut registry = Self::new();
        registry.register(Arc::new(anthropic::AnthropicAdapter::new(client.clone())));
        registry.register(Arc::new(openai::OpenAiCompatAdapter::openai(client.clone())));
        registry.register(Arc::new(openai::OpenAiCompatAdapter::openrouter(
            client.clone(),
        )));
        registry.register(Arc::new(openai::OpenAiCompatAdapter::kimi(client.clone())));
        registry.register(Arc::new(openai::OpenAiCompatAdapter::deepseek(
            client.clone(),
        )));
        registry.register(Arc::new(gemini::GeminiAdapter::new(client)));
        Ok(registry)
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.name(), adapter);
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(provider).cloned()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the shared upstream HTTP client with the adapter timeouts.
pub fn build_http_client() -> Result<reqwest::Client, AgentError> {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| AgentError::Provider(format!("failed to build HTTP client: {e}")))
}

/// A tool call captured from a streamed response, arguments still as the
/// provider's accumulated JSON text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ToolCallCapture {
    pub id: String,
    pub name: String,
    pub args_json: String,
}

/// Outcome of draining one SSE stream.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum StreamOutcome {
    /// Stream fully drained.
    Done,
    /// Receiver dropped mid-stream (client gone); abandon the exchange.
    Aborted,
}

/// A frame parsed out of one SSE data line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Frame {
    /// Incremental text to forward.
    Text(String),
    /// In-band API error; terminates the stream.
    ApiError(String),
}

/// Run the captured web_search call: parse the arguments, query the
/// search provider, format the results for the tool-result turn.
///
/// Returns the query and formatted results on success, or a short
/// human-readable failure reason. The caller folds failures into the
/// streamed text rather than failing the whole response.
pub(crate) async fn resolve_web_search(
    client: &reqwest::Client,
    capture: &ToolCallCapture,
    search_key: &str,
) -> Result<(String, String), String> {
    let args: Value =
        serde_json::from_str(&capture.args_json).map_err(|_| "invalid search arguments".to_string())?;
    let query = args
        .get("query")
        .and_then(|v| v.as_str())
        .filter(|q| !q.trim().is_empty())
        .ok_or_else(|| "invalid search arguments".to_string())?
        .to_string();

    let results = search::web_search(client, &query, search_key, SEARCH_RESULT_COUNT)
        .await
        .map_err(|e| e.to_string())?;

    Ok((query, search::format_results(&results)))
}

/// Synthetic delta shown to the user while the search round runs.
pub(crate) fn search_notice(query: &str) -> String {
    format!("\n\n🔍 Searching the web for \"{query}\"…\n\n")
}

/// Inline marker appended when the tool sub-protocol fails. The response
/// still terminates with a `Final` carrying whatever was accumulated.
pub(crate) fn search_failure_notice(reason: &str) -> String {
    format!("\n\n[web search failed: {reason}]\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NamedAdapter(&'static str);

    #[async_trait]
    impl ProviderAdapter for NamedAdapter {
        fn name(&self) -> &'static str {
            self.0
        }

        async fn stream(
            &self,
            _request: ChatRequest,
        ) -> Result<mpsc::Receiver<StreamEvent>, AgentError> {
            let (tx, rx) = mpsc::channel(1);
            tx.send(StreamEvent::Final {
                text: String::new(),
            })
            .await
            .ok();
            Ok(rx)
        }
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(NamedAdapter("mock")));
        assert!(registry.get("mock").is_some());
        assert!(registry.get("unknown").is_none());
    }

    #[test]
    fn test_default_registry_covers_all_providers() {
        let registry = AdapterRegistry::with_defaults().unwrap();
        for provider in ["anthropic", "openai", "openrouter", "kimi", "deepseek", "gemini"] {
            assert!(registry.get(provider).is_some(), "missing {provider}");
        }
    }

    #[test]
    fn test_chat_request_debug_redacts_key() {
        let request = ChatRequest {
            model: "gpt-4o".to_string(),
            api_key: "sk-secret".to_string(),
            turns: vec![],
            search_key: Some("brave-secret".to_string()),
        };
        let rendered = format!("{request:?}");
        assert!(!rendered.contains("sk-secret"));
        assert!(!rendered.contains("brave-secret"));
    }

    #[tokio::test]
    async fn test_resolve_web_search_rejects_bad_arguments() {
        let client = build_http_client().unwrap();
        let capture = ToolCallCapture {
            id: "t1".to_string(),
            name: WEB_SEARCH_TOOL.to_string(),
            args_json: "{not json".to_string(),
        };
        let err = resolve_web_search(&client, &capture, "key").await.unwrap_err();
        assert!(err.contains("invalid search arguments"));
    }

    #[tokio::test]
    async fn test_resolve_web_search_rejects_missing_query() {
        let client = build_http_client().unwrap();
        let capture = ToolCallCapture {
            id: "t1".to_string(),
            name: WEB_SEARCH_TOOL.to_string(),
            args_json: r#"{"q":"wrong field"}"#.to_string(),
        };
        let err = resolve_web_search(&client, &capture, "key").await.unwrap_err();
        assert!(err.contains("invalid search arguments"));
    }
}
