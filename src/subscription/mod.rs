//! Budget and usage gateway.
//!
//! Interface to the external subscription database: pre-flight checks
//! that a managed-mode user's subscription is active and within budget,
//! and post-completion usage accrual. Pre-flight failures block the
//! request (fail closed); tracking failures are logged and swallowed
//! (fail open, since telemetry must never break a delivered response).

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::ProxyConfig;
use crate::router::{
    calculate_request_cost, remaining_budget, total_budget, SubscriptionPlan,
};

/// Billing tokens are approximated as ceil(chars / 4) in both directions.
/// The price table is calibrated against this approximation; do not swap
/// in a real tokenizer.
pub fn estimate_tokens(char_len: usize) -> u64 {
    ((char_len + 3) / 4) as u64
}

/// Current billing period key, e.g. `2026-08`.
pub fn current_period() -> String {
    chrono::Utc::now().format("%Y-%m").to_string()
}

/// One billing period's accumulated usage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageRecord {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub request_count: u64,
    pub cost_usd: f64,
    pub extra_budget: f64,
}

impl UsageRecord {
    fn from_row(row: &Value) -> Self {
        Self {
            input_tokens: int_field(row, "input_tokens"),
            output_tokens: int_field(row, "output_tokens"),
            request_count: int_field(row, "request_count"),
            cost_usd: num_field(row, "cost_usd"),
            extra_budget: num_field(row, "extra_budget"),
        }
    }

    /// Fold one request into the record. Accumulates, never overwrites.
    pub fn accumulate(&self, input_tokens: u64, output_tokens: u64, request_cost: f64) -> Self {
        Self {
            input_tokens: self.input_tokens + input_tokens,
            output_tokens: self.output_tokens + output_tokens,
            request_count: self.request_count + 1,
            cost_usd: self.cost_usd + request_cost,
            extra_budget: self.extra_budget,
        }
    }
}

/// Subscription state for one managed-mode user.
///
/// `valid == false` means "do not allow a managed-mode request"; `error`
/// carries the human-readable reason.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionStatus {
    pub valid: bool,
    pub plan: SubscriptionPlan,
    pub error: Option<String>,
    pub cost_usd: f64,
    pub extra_budget: f64,
    pub budget_remaining: f64,
    pub total_budget: f64,
    pub usage: UsageRecord,
}

impl SubscriptionStatus {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            plan: SubscriptionPlan::Free,
            error: Some(reason.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("subscription store request failed: {0}")]
    Request(String),

    #[error("subscription store returned {status}: {body}")]
    Api { status: u16, body: String },
}

/// Capability over the external subscription store.
#[async_trait]
pub trait BudgetGateway: Send + Sync {
    /// Verify a user's subscription is active and compute budget state.
    /// Any internal failure yields `valid == false` (fail closed).
    async fn check_subscription(&self, fid: u64) -> SubscriptionStatus;

    /// Accrue one completed request into the current billing period.
    async fn track_usage(
        &self,
        fid: u64,
        input_tokens: u64,
        output_tokens: u64,
        model: &str,
    ) -> Result<(), GatewayError>;

    /// Add a purchased top-up to the current billing period.
    async fn add_extra_budget(&self, fid: u64, amount_usd: f64) -> Result<(), GatewayError>;
}

/// Report usage without blocking the response. Failures are logged and
/// never retried within the request.
pub fn spawn_usage_report(
    gateway: Arc<dyn BudgetGateway>,
    fid: u64,
    input_tokens: u64,
    output_tokens: u64,
    model: String,
) {
    tokio::spawn(async move {
        if let Err(e) = gateway
            .track_usage(fid, input_tokens, output_tokens, &model)
            .await
        {
            warn!(
                target: "subscription",
                fid,
                model = %model,
                error = %e,
                "usage tracking failed"
            );
        }
    });
}

/// PostgREST-backed gateway (Supabase `users` and `usage` tables).
pub struct SupabaseGateway {
    client: reqwest::Client,
    base_url: String,
    service_key: String,
}

impl SupabaseGateway {
    pub fn new(base_url: String, service_key: String) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| GatewayError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
        })
    }

    /// Build from process configuration; `None` when the store endpoint
    /// is not configured (managed mode disabled, BYOK unaffected).
    pub fn from_config(config: &ProxyConfig) -> Result<Option<Self>, GatewayError> {
        match (&config.subscription_url, &config.subscription_key) {
            (Some(url), Some(key)) => Ok(Some(Self::new(url.clone(), key.clone())?)),
            _ => Ok(None),
        }
    }

    async fn fetch_rows(&self, path_and_query: &str) -> Result<Vec<Value>, GatewayError> {
        let url = format!("{}{path_and_query}", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("apikey", &self.service_key)
            .header("authorization", format!("Bearer {}", self.service_key))
            .send()
            .await
            .map_err(|e| GatewayError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable>".to_string());
            return Err(GatewayError::Api { status, body });
        }

        response
            .json()
            .await
            .map_err(|e| GatewayError::Request(format!("invalid JSON: {e}")))
    }

    async fn write(
        &self,
        method: reqwest::Method,
        path_and_query: &str,
        body: Value,
    ) -> Result<(), GatewayError> {
        let url = format!("{}{path_and_query}", self.base_url);
        let response = self
            .client
            .request(method, &url)
            .header("apikey", &self.service_key)
            .header("authorization", format!("Bearer {}", self.service_key))
            .header("content-type", "application/json")
            .header("prefer", "return=minimal")
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable>".to_string());
            return Err(GatewayError::Api { status, body });
        }

        Ok(())
    }

    async fn fetch_usage_row(
        &self,
        fid: u64,
        period: &str,
    ) -> Result<Option<Value>, GatewayError> {
        let rows = self
            .fetch_rows(&format!(
                "/rest/v1/usage?fid=eq.{fid}&period=eq.{period}&select=*"
            ))
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn fetch_status(&self, fid: u64) -> Result<SubscriptionStatus, GatewayError> {
        let users = self
            .fetch_rows(&format!("/rest/v1/users?fid=eq.{fid}&select=*"))
            .await?;
        let Some(user) = users.first() else {
            return Ok(SubscriptionStatus::invalid("User not found"));
        };

        let plan = SubscriptionPlan::parse(
            user.get("plan").and_then(|v| v.as_str()).unwrap_or("free"),
        );
        if plan == SubscriptionPlan::Free {
            return Ok(SubscriptionStatus::invalid(
                "Free plan — use your own API key",
            ));
        }

        if subscription_expired(user) {
            return Ok(SubscriptionStatus::invalid("Subscription expired"));
        }

        let usage = self
            .fetch_usage_row(fid, &current_period())
            .await?
            .as_ref()
            .map(UsageRecord::from_row)
            .unwrap_or_default();

        let cost_usd = usage.cost_usd;
        let extra_budget = usage.extra_budget;

        Ok(SubscriptionStatus {
            valid: true,
            plan,
            error: None,
            cost_usd,
            extra_budget,
            budget_remaining: remaining_budget(plan, cost_usd, extra_budget),
            total_budget: total_budget(plan, extra_budget),
            usage,
        })
    }
}

#[async_trait]
impl BudgetGateway for SupabaseGateway {
    async fn check_subscription(&self, fid: u64) -> SubscriptionStatus {
        match self.fetch_status(fid).await {
            Ok(status) => status,
            Err(e) => {
                warn!(target: "subscription", fid, error = %e, "subscription check failed");
                SubscriptionStatus::invalid("Subscription check failed")
            }
        }
    }

    async fn track_usage(
        &self,
        fid: u64,
        input_tokens: u64,
        output_tokens: u64,
        model: &str,
    ) -> Result<(), GatewayError> {
        let period = current_period();
        let request_cost = calculate_request_cost(model, input_tokens, output_tokens);

        match self.fetch_usage_row(fid, &period).await? {
            Some(row) => {
                let id = int_field(&row, "id");
                let updated = UsageRecord::from_row(&row).accumulate(
                    input_tokens,
                    output_tokens,
                    request_cost,
                );
                self.write(
                    reqwest::Method::PATCH,
                    &format!("/rest/v1/usage?id=eq.{id}"),
                    json!({
                        "input_tokens": updated.input_tokens,
                        "output_tokens": updated.output_tokens,
                        "request_count": updated.request_count,
                        "cost_usd": updated.cost_usd,
                    }),
                )
                .await
            }
            None => {
                self.write(
                    reqwest::Method::POST,
                    "/rest/v1/usage",
                    json!({
                        "fid": fid,
                        "period": period,
                        "input_tokens": input_tokens,
                        "output_tokens": output_tokens,
                        "request_count": 1,
                        "cost_usd": request_cost,
                    }),
                )
                .await
            }
        }
    }

    async fn add_extra_budget(&self, fid: u64, amount_usd: f64) -> Result<(), GatewayError> {
        let period = current_period();

        match self.fetch_usage_row(fid, &period).await? {
            Some(row) => {
                let id = int_field(&row, "id");
                let extra = num_field(&row, "extra_budget") + amount_usd;
                self.write(
                    reqwest::Method::PATCH,
                    &format!("/rest/v1/usage?id=eq.{id}"),
                    json!({ "extra_budget": extra }),
                )
                .await
            }
            None => {
                self.write(
                    reqwest::Method::POST,
                    "/rest/v1/usage",
                    json!({
                        "fid": fid,
                        "period": period,
                        "input_tokens": 0,
                        "output_tokens": 0,
                        "request_count": 0,
                        "cost_usd": 0.0,
                        "extra_budget": amount_usd,
                    }),
                )
                .await
            }
        }
    }
}

/// `true` if the user row carries a parseable expiry in the past. An
/// absent or unparseable expiry means the plan does not expire.
fn subscription_expired(user: &Value) -> bool {
    let Some(expires_at) = user.get("plan_expires_at").and_then(|v| v.as_str()) else {
        return false;
    };
    match chrono::DateTime::parse_from_rfc3339(expires_at) {
        Ok(expiry) => expiry < chrono::Utc::now(),
        Err(_) => false,
    }
}

/// Integer column that may arrive as a JSON number or be absent.
fn int_field(row: &Value, field: &str) -> u64 {
    row.get(field).and_then(|v| v.as_u64()).unwrap_or(0)
}

/// Numeric column that may arrive as a JSON number or a string
/// (PostgREST renders `numeric` columns as strings).
fn num_field(row: &Value, field: &str) -> f64 {
    match row.get(field) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(0), 0);
        assert_eq!(estimate_tokens(1), 1);
        assert_eq!(estimate_tokens(4), 1);
        assert_eq!(estimate_tokens(5), 2);
        assert_eq!(estimate_tokens(8000), 2000);
    }

    #[test]
    fn test_current_period_format() {
        let period = current_period();
        assert_eq!(period.len(), 7);
        assert_eq!(&period[4..5], "-");
    }

    #[test]
    fn test_usage_accumulates_not_overwrites() {
        let base = UsageRecord::default();
        let once = base.accumulate(100, 200, 0.5);
        let twice = once.accumulate(100, 200, 0.5);

        assert_eq!(twice.input_tokens, 200);
        assert_eq!(twice.output_tokens, 400);
        assert_eq!(twice.request_count, 2);
        assert!((twice.cost_usd - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_accumulate_preserves_extra_budget() {
        let base = UsageRecord {
            extra_budget: 7.5,
            ..UsageRecord::default()
        };
        assert_eq!(base.accumulate(1, 1, 0.0).extra_budget, 7.5);
    }

    #[test]
    fn test_usage_record_from_row_with_string_numeric() {
        let row = json!({
            "input_tokens": 10,
            "output_tokens": 20,
            "request_count": 3,
            "cost_usd": "1.25",
            "extra_budget": 2.0,
        });
        let record = UsageRecord::from_row(&row);
        assert_eq!(record.input_tokens, 10);
        assert!((record.cost_usd - 1.25).abs() < 1e-9);
        assert!((record.extra_budget - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_usage_record_from_empty_row() {
        assert_eq!(UsageRecord::from_row(&json!({})), UsageRecord::default());
    }

    #[test]
    fn test_subscription_expired() {
        assert!(subscription_expired(&json!({
            "plan_expires_at": "2001-01-01T00:00:00Z"
        })));
        assert!(!subscription_expired(&json!({
            "plan_expires_at": "2999-01-01T00:00:00Z"
        })));
        assert!(!subscription_expired(&json!({})));
        assert!(!subscription_expired(&json!({
            "plan_expires_at": "not a date"
        })));
    }

    #[test]
    fn test_invalid_status_shape() {
        let status = SubscriptionStatus::invalid("Subscription expired");
        assert!(!status.valid);
        assert_eq!(status.plan, SubscriptionPlan::Free);
        assert_eq!(status.error.as_deref(), Some("Subscription expired"));
        assert_eq!(status.budget_remaining, 0.0);
    }
}
