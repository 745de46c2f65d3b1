//! Process configuration
//!
//! The proxy is configured entirely through environment variables: bind
//! port, the WebSocket origin allow-list, server-held provider credentials
//! for managed mode, the web-search credential, the subscription store
//! endpoint, and session lifecycle tuning.
//!
//! Credentials resolved here are server secrets. They are handed to the
//! provider adapters and never echoed to clients or written to logs.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

/// Default WebSocket/HTTP bind port.
pub const DEFAULT_PORT: u16 = 3002;

/// Origins accepted when `ALLOWED_ORIGINS` is unset.
const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:3000,http://localhost:3001";

/// Sessions idle longer than this are evicted by the sweep.
pub const DEFAULT_SESSION_IDLE: Duration = Duration::from_secs(30 * 60);

/// Cadence of the idle-session sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Resolved process configuration.
#[derive(Clone)]
pub struct ProxyConfig {
    /// Port the HTTP/WebSocket server binds to.
    pub port: u16,
    /// Origins allowed to open WebSocket connections. An empty `Origin`
    /// header bypasses the check (same-process and non-browser clients).
    pub allowed_origins: Vec<String>,
    /// Server-held provider credentials for managed mode, keyed by
    /// provider name ("anthropic", "openrouter").
    pub managed_keys: HashMap<String, String>,
    /// Web-search credential. `None` disables the search tool entirely.
    pub search_key: Option<String>,
    /// Subscription store endpoint (PostgREST base URL).
    pub subscription_url: Option<String>,
    /// Subscription store service key.
    pub subscription_key: Option<String>,
    /// Idle threshold after which a session is evicted.
    pub session_idle: Duration,
    /// Interval between idle sweeps.
    pub sweep_interval: Duration,
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("port", &self.port)
            .field("allowed_origins", &self.allowed_origins)
            .field(
                "managed_keys",
                &self.managed_keys.keys().collect::<Vec<_>>(),
            )
            .field("search_key", &self.search_key.as_ref().map(|_| "<set>"))
            .field("subscription_url", &self.subscription_url)
            .field(
                "subscription_key",
                &self.subscription_key.as_ref().map(|_| "<set>"),
            )
            .field("session_idle", &self.session_idle)
            .field("sweep_interval", &self.sweep_interval)
            .finish()
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            allowed_origins: split_origins(DEFAULT_ALLOWED_ORIGINS),
            managed_keys: HashMap::new(),
            search_key: None,
            subscription_url: None,
            subscription_key: None,
            session_idle: DEFAULT_SESSION_IDLE,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl ProxyConfig {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Self {
        let port = env::var("PINCER_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let allowed_origins = split_origins(
            &env::var("ALLOWED_ORIGINS").unwrap_or_else(|_| DEFAULT_ALLOWED_ORIGINS.to_string()),
        );

        let mut managed_keys = HashMap::new();
        if let Some(key) = non_empty_env("MANAGED_ANTHROPIC_KEY") {
            managed_keys.insert("anthropic".to_string(), key);
        }
        if let Some(key) = non_empty_env("MANAGED_OPENROUTER_KEY") {
            managed_keys.insert("openrouter".to_string(), key);
        }

        let subscription_url =
            non_empty_env("PROXY_SUPABASE_URL").or_else(|| non_empty_env("SUPABASE_URL"));
        let subscription_key =
            non_empty_env("PROXY_SUPABASE_KEY").or_else(|| non_empty_env("SUPABASE_SERVICE_KEY"));

        let session_idle = duration_env("PINCER_SESSION_IDLE_SECS", DEFAULT_SESSION_IDLE);
        let sweep_interval = duration_env("PINCER_SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL);

        Self {
            port,
            allowed_origins,
            managed_keys,
            search_key: non_empty_env("BRAVE_API_KEY"),
            subscription_url,
            subscription_key,
            session_idle,
            sweep_interval,
        }
    }

    /// Look up the server-held credential for a managed provider.
    ///
    /// Never derived from user input: the only sources are the
    /// `MANAGED_*_KEY` environment variables read at startup.
    pub fn managed_key(&self, provider: &str) -> Option<&str> {
        self.managed_keys.get(provider).map(String::as_str)
    }

    /// `true` if at least one managed provider credential is configured.
    pub fn has_managed_keys(&self) -> bool {
        !self.managed_keys.is_empty()
    }

    /// Check a WebSocket `Origin` header against the allow-list.
    ///
    /// An empty origin is trusted (same-process tooling and non-browser
    /// clients do not send one).
    pub fn origin_allowed(&self, origin: &str) -> bool {
        if origin.is_empty() {
            return true;
        }
        self.allowed_origins.iter().any(|o| o == origin)
    }

    /// Insert a managed credential (builder-style).
    pub fn with_managed_key(mut self, provider: &str, key: &str) -> Self {
        self.managed_keys
            .insert(provider.to_string(), key.to_string());
        self
    }
}

fn split_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn duration_env(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_origins() {
        let config = ProxyConfig::default();
        assert!(config.origin_allowed("http://localhost:3000"));
        assert!(config.origin_allowed("http://localhost:3001"));
        assert!(!config.origin_allowed("http://evil.example"));
    }

    #[test]
    fn test_empty_origin_is_trusted() {
        let config = ProxyConfig::default();
        assert!(config.origin_allowed(""));
    }

    #[test]
    fn test_split_origins_trims_and_drops_empty() {
        let origins = split_origins(" http://a.example ,, http://b.example");
        assert_eq!(origins, vec!["http://a.example", "http://b.example"]);
    }

    #[test]
    fn test_managed_key_lookup() {
        let config = ProxyConfig::default().with_managed_key("anthropic", "sk-ant-test");
        assert_eq!(config.managed_key("anthropic"), Some("sk-ant-test"));
        assert_eq!(config.managed_key("openrouter"), None);
        assert!(config.has_managed_keys());
    }

    #[test]
    fn test_no_managed_keys_by_default() {
        let config = ProxyConfig::default();
        assert!(!config.has_managed_keys());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = ProxyConfig {
            search_key: Some("brave-secret".to_string()),
            subscription_key: Some("service-secret".to_string()),
            ..ProxyConfig::default()
        }
        .with_managed_key("anthropic", "sk-ant-secret");

        let rendered = format!("{config:?}");
        assert!(!rendered.contains("sk-ant-secret"));
        assert!(!rendered.contains("brave-secret"));
        assert!(!rendered.contains("service-secret"));
    }
}
