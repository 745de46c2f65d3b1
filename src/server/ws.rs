//! WebSocket session protocol server.
//!
//! One connection = one session. A client configures its session
//! (`config`, BYOK or managed), relays chat messages (`send`), and can
//! replay its history (`history`). The server answers with `connected`,
//! `delta`, `final`, `history`, and `error` events. Actions on a
//! connection are processed in the order received; sessions across
//! connections are independent.
//!
//! Connection state machine: Unconfigured → Ready (on successful
//! `config`, idempotent) → Destroyed (on close or idle sweep). `send`
//! and `history` act on the session as it exists at dispatch time.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::{AdapterRegistry, AgentError, ChatRequest, ChatRole, ChatTurn, StreamEvent};
use crate::config::ProxyConfig;
use crate::router::{resolve_model, ModelRole, COMPLEX_MODEL, DAILY_MODEL};
use crate::sessions::{ChatMessage, KeyMode, MessageRole, Session, SessionConfig, SessionStore};
use crate::subscription::{estimate_tokens, spawn_usage_report, BudgetGateway};

/// Close code sent when the connection's origin is not allow-listed.
pub const CLOSE_ORIGIN_REJECTED: u16 = 4003;

/// Shared state for the protocol server.
pub struct WsServerState {
    pub config: ProxyConfig,
    sessions: Arc<SessionStore>,
    adapters: AdapterRegistry,
    gateway: Option<Arc<dyn BudgetGateway>>,
}

impl WsServerState {
    pub fn new(config: ProxyConfig) -> Result<Self, AgentError> {
        Ok(Self {
            config,
            sessions: Arc::new(SessionStore::new()),
            adapters: AdapterRegistry::with_defaults()?,
            gateway: None,
        })
    }

    /// Attach the budget gateway. Without one, managed mode is refused
    /// at `config` time; BYOK is unaffected.
    pub fn with_gateway(mut self, gateway: Arc<dyn BudgetGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Replace the adapter registry (tests inject scripted adapters).
    pub fn with_adapters(mut self, adapters: AdapterRegistry) -> Self {
        self.adapters = adapters;
        self
    }

    pub fn with_session_store(mut self, store: Arc<SessionStore>) -> Self {
        self.sessions = store;
        self
    }

    pub fn session_store(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn gateway(&self) -> Option<&Arc<dyn BudgetGateway>> {
        self.gateway.as_ref()
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<WsServerState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let origin = headers
        .get("origin")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    ws.on_upgrade(move |socket| handle_socket(socket, state, origin))
}

async fn handle_socket(socket: WebSocket, state: Arc<WsServerState>, origin: String) {
    let (mut sender, mut receiver) = socket.split();

    if !state.config.origin_allowed(&origin) {
        info!(target: "ws", %origin, "rejected connection");
        let _ = sender
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_ORIGIN_REJECTED,
                reason: "Origin not allowed".into(),
            })))
            .await;
        return;
    }

    // Outbound events funnel through one writer task so the dispatch
    // path (and spawned stream forwarding) never touches the sink.
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    let session_id = Uuid::new_v4().to_string();
    info!(target: "ws", session_id = %session_id, "client connected");

    while let Some(next) = receiver.next().await {
        let msg = match next {
            Ok(msg) => msg,
            Err(_) => break,
        };
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            Message::Binary(_) => {
                send_event(&tx, &error_event("Binary frames are not supported"));
                continue;
            }
            // Ping/pong handled by the transport.
            _ => continue,
        };

        match serde_json::from_str::<Value>(&text) {
            Ok(payload) => dispatch_action(&payload, &session_id, &state, &tx).await,
            Err(_) => send_event(&tx, &error_event("Invalid JSON payload")),
        }
    }

    // Destroy immediately; any in-flight stream output for this session
    // is discarded (the writer is gone and appends become no-ops).
    info!(target: "ws", session_id = %session_id, "client disconnected");
    state.session_store().remove(&session_id);
    drop(tx);
    let _ = send_task.await;
}

async fn dispatch_action(
    payload: &Value,
    session_id: &str,
    state: &Arc<WsServerState>,
    tx: &mpsc::UnboundedSender<Message>,
) {
    match payload.get("action").and_then(|v| v.as_str()) {
        Some("config") => handle_config(payload, session_id, state, tx).await,
        Some("send") => handle_send(payload, session_id, state, tx).await,
        Some("history") => {
            let messages = state.session_store().history(session_id);
            state.session_store().touch(session_id);
            send_event(tx, &json!({ "type": "history", "messages": messages }));
        }
        Some(other) => send_event(tx, &error_event(&format!("Unknown action: {other}"))),
        None => send_event(tx, &error_event("Missing action field")),
    }
}

// --- config ----------------------------------------------------------------

async fn handle_config(
    payload: &Value,
    session_id: &str,
    state: &Arc<WsServerState>,
    tx: &mpsc::UnboundedSender<Message>,
) {
    let key_mode = payload.get("keyMode").and_then(|v| v.as_str()).unwrap_or("byok");
    if key_mode == "managed" {
        handle_config_managed(payload, session_id, state, tx).await;
    } else {
        handle_config_byok(payload, session_id, state, tx);
    }
}

fn handle_config_byok(
    payload: &Value,
    session_id: &str,
    state: &Arc<WsServerState>,
    tx: &mpsc::UnboundedSender<Message>,
) {
    let api_key = non_empty_str(payload, "apiKey");
    let model = non_empty_str(payload, "model");
    let provider = non_empty_str(payload, "provider");

    let (Some(api_key), Some(model), Some(provider)) = (api_key, model, provider) else {
        send_event(
            tx,
            &error_event("Missing config fields (apiKey, model, provider)"),
        );
        return;
    };

    state.session_store().configure(
        session_id,
        SessionConfig {
            model: model.clone(),
            provider: provider.clone(),
            api_key,
            key_mode: KeyMode::Byok,
            fid: None,
            plan: None,
        },
    );

    info!(
        target: "ws",
        session_id = %session_id,
        %provider,
        %model,
        "session configured (byok)"
    );
    send_event(tx, &json!({ "type": "connected", "sessionId": session_id }));
}

async fn handle_config_managed(
    payload: &Value,
    session_id: &str,
    state: &Arc<WsServerState>,
    tx: &mpsc::UnboundedSender<Message>,
) {
    let Some(fid) = payload.get("fid").and_then(|v| v.as_u64()) else {
        send_event(tx, &error_event("Missing fid"));
        return;
    };

    let Some(gateway) = state.gateway() else {
        send_event(tx, &error_event("Subscription service not configured"));
        return;
    };

    let status = gateway.check_subscription(fid).await;
    if !status.valid {
        let reason = status
            .error
            .unwrap_or_else(|| "Subscription invalid".to_string());
        send_event(tx, &error_event(&reason));
        return;
    }

    let Some((model, provider, api_key)) = default_managed_target(&state.config) else {
        send_event(tx, &error_event("AI service temporarily unavailable"));
        return;
    };

    state.session_store().configure(
        session_id,
        SessionConfig {
            model,
            provider,
            api_key,
            key_mode: KeyMode::Managed,
            fid: Some(fid),
            plan: Some(status.plan),
        },
    );

    info!(
        target: "ws",
        session_id = %session_id,
        fid,
        plan = %status.plan,
        "session configured (managed)"
    );
    send_event(
        tx,
        &json!({
            "type": "connected",
            "sessionId": session_id,
            "plan": status.plan,
            "budgetRemaining": status.budget_remaining,
            "costUsd": status.cost_usd,
        }),
    );
}

/// Default routing target for a freshly-configured managed session:
/// the primary model when the metered credential exists, otherwise the
/// daily model. `None` when no managed credential is configured at all.
fn default_managed_target(config: &ProxyConfig) -> Option<(String, String, String)> {
    for target in [&COMPLEX_MODEL, &DAILY_MODEL] {
        if let Some(key) = config.managed_key(target.provider) {
            return Some((
                target.model.to_string(),
                target.provider.to_string(),
                key.to_string(),
            ));
        }
    }
    None
}

// --- send ------------------------------------------------------------------

/// The provider/model/key a `send` actually goes to, plus the role label
/// the UI shows in managed mode.
struct Route {
    model: String,
    provider: String,
    api_key: String,
    role: Option<ModelRole>,
}

async fn handle_send(
    payload: &Value,
    session_id: &str,
    state: &Arc<WsServerState>,
    tx: &mpsc::UnboundedSender<Message>,
) {
    let Some(session) = state.session_store().get(session_id) else {
        send_event(
            tx,
            &error_event("Session not configured. Send config first."),
        );
        return;
    };

    let message = payload
        .get("message")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .unwrap_or("");
    if message.is_empty() {
        send_event(tx, &error_event("Empty message"));
        return;
    }

    state
        .session_store()
        .append_message(session_id, ChatMessage::user(Uuid::new_v4().to_string(), message));

    let route = match resolve_route(&session, message, state).await {
        Ok(route) => route,
        Err(reason) => {
            send_event(tx, &error_event(&reason));
            return;
        }
    };

    let turns: Vec<ChatTurn> = state
        .session_store()
        .history(session_id)
        .into_iter()
        .map(|m| ChatTurn {
            role: match m.role {
                MessageRole::User => ChatRole::User,
                MessageRole::Assistant => ChatRole::Assistant,
            },
            content: m.content,
        })
        .collect();
    let input_chars: usize = turns.iter().map(|t| t.content.chars().count()).sum();

    let Some(adapter) = state.adapters.get(&route.provider) else {
        let err = AgentError::UnsupportedProvider(route.provider.clone());
        send_event(tx, &error_event(&err.to_string()));
        return;
    };

    let request = ChatRequest {
        model: route.model.clone(),
        api_key: route.api_key.clone(),
        turns,
        search_key: state.config.search_key.clone(),
    };

    let run_id = Uuid::new_v4().to_string();
    let mut events = match adapter.stream(request).await {
        Ok(events) => events,
        Err(e) => {
            send_event(tx, &error_event(&e.to_string()));
            return;
        }
    };

    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::Delta { text } => {
                send_event(tx, &delta_event(&run_id, &text, route.role));
            }
            StreamEvent::Final { text } => {
                state
                    .session_store()
                    .append_message(session_id, ChatMessage::assistant(run_id.clone(), &text));
                send_event(tx, &final_event(&run_id, &text, &route.model, route.role));

                if session.key_mode == KeyMode::Managed {
                    if let (Some(gateway), Some(fid)) = (state.gateway(), session.fid) {
                        spawn_usage_report(
                            gateway.clone(),
                            fid,
                            estimate_tokens(input_chars),
                            estimate_tokens(text.chars().count()),
                            route.model.clone(),
                        );
                    }
                }
                break;
            }
            StreamEvent::Error { message } => {
                send_event(tx, &error_event(&message));
                break;
            }
        }
    }
}

/// Pick the upstream target for one `send`.
///
/// BYOK sessions go straight to their stored target. Managed sessions
/// re-validate the subscription (budget may have run out since
/// `config`), classify and route the prompt, then look up the managed
/// credential, falling back to the session's stored default when the
/// routed provider has no credential rather than failing the request.
async fn resolve_route(
    session: &Session,
    message: &str,
    state: &Arc<WsServerState>,
) -> Result<Route, String> {
    match session.key_mode {
        KeyMode::Byok => Ok(Route {
            model: session.model.clone(),
            provider: session.provider.clone(),
            api_key: session.api_key.clone(),
            role: None,
        }),
        KeyMode::Managed => {
            let Some(gateway) = state.gateway() else {
                return Err("Subscription service not configured".to_string());
            };
            let Some(fid) = session.fid else {
                return Err("Session missing subscriber identity".to_string());
            };

            let status = gateway.check_subscription(fid).await;
            if !status.valid {
                return Err(status
                    .error
                    .unwrap_or_else(|| "Subscription invalid".to_string()));
            }

            let resolved = resolve_model(
                message,
                status.plan,
                status.cost_usd,
                status.extra_budget,
                state.config.managed_key(COMPLEX_MODEL.provider).is_some(),
            );
            if resolved.budget_exceeded {
                info!(
                    target: "router",
                    fid,
                    plan = %status.plan,
                    cost_usd = status.cost_usd,
                    "complex request downgraded to daily model"
                );
            }

            match state.config.managed_key(resolved.provider) {
                Some(key) => Ok(Route {
                    model: resolved.model.to_string(),
                    provider: resolved.provider.to_string(),
                    api_key: key.to_string(),
                    role: Some(resolved.role),
                }),
                None => {
                    warn!(
                        target: "router",
                        provider = resolved.provider,
                        "managed credential missing; using session default"
                    );
                    Ok(Route {
                        model: session.model.clone(),
                        provider: session.provider.clone(),
                        api_key: session.api_key.clone(),
                        role: Some(resolved.role),
                    })
                }
            }
        }
    }
}

// --- events ----------------------------------------------------------------

fn error_event(message: &str) -> Value {
    json!({ "type": "error", "message": message })
}

fn delta_event(run_id: &str, text: &str, role: Option<ModelRole>) -> Value {
    let mut event = json!({ "type": "delta", "runId": run_id, "text": text });
    if let Some(role) = role {
        event["modelRole"] = json!(role.as_str());
    }
    event
}

fn final_event(run_id: &str, message: &str, model: &str, role: Option<ModelRole>) -> Value {
    let mut event = json!({
        "type": "final",
        "runId": run_id,
        "message": message,
        "model": model,
    });
    if let Some(role) = role {
        event["modelRole"] = json!(role.as_str());
    }
    event
}

fn send_event(tx: &mpsc::UnboundedSender<Message>, payload: &Value) {
    if let Ok(text) = serde_json::to_string(payload) {
        let _ = tx.send(Message::Text(text));
    }
}

fn non_empty_str(payload: &Value, field: &str) -> Option<String> {
    payload
        .get(field)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
