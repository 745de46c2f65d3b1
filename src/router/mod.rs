//! Task classification and model routing.
//!
//! Pure logic, no I/O. Classifies each prompt into a cost tier from
//! textual heuristics, then resolves tier + subscription plan + current
//! spend into a concrete provider/model target. Only metered models
//! accrue cost; a complex request is never failed outright for budget
//! reasons, it degrades to the daily reasoning model instead.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Subscription tier of a managed-mode user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionPlan {
    #[default]
    Free,
    Starter,
    Pro,
    Business,
}

impl SubscriptionPlan {
    /// Parse a plan name as stored in the subscription database.
    /// Unknown values fall back to `Free` (no managed access).
    pub fn parse(value: &str) -> Self {
        match value {
            "starter" => Self::Starter,
            "pro" => Self::Pro,
            "business" => Self::Business,
            _ => Self::Free,
        }
    }

    /// Monthly metered-cost cap in USD, before top-ups.
    pub fn cost_limit_usd(&self) -> f64 {
        match self {
            Self::Free => 0.0,
            Self::Starter => 5.0,
            Self::Pro => 15.0,
            Self::Business => 35.0,
        }
    }
}

impl std::fmt::Display for SubscriptionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::Starter => write!(f, "starter"),
            Self::Pro => write!(f, "pro"),
            Self::Business => write!(f, "business"),
        }
    }
}

/// Complexity tier assigned to a prompt by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskTier {
    Complex,
    Daily,
    Simple,
}

/// Why a model was picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelRole {
    Primary,
    Daily,
    Simple,
    Heartbeat,
    Subagent,
    Image,
}

impl ModelRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Daily => "daily",
            Self::Simple => "simple",
            Self::Heartbeat => "heartbeat",
            Self::Subagent => "subagent",
            Self::Image => "image",
        }
    }
}

/// A concrete provider/model pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelTarget {
    pub model: &'static str,
    pub provider: &'static str,
}

/// Router output for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    pub model: &'static str,
    pub provider: &'static str,
    pub role: ModelRole,
    pub tier: TaskTier,
    /// Set when a complex-tier request was downgraded because the
    /// subscriber's metered budget was exhausted (or the metered
    /// credential is missing).
    pub budget_exceeded: bool,
}

// --- Agent model stack -----------------------------------------------------

/// Complex tasks: Claude Opus via the direct Anthropic key (metered).
pub const COMPLEX_MODEL: ModelTarget = ModelTarget {
    model: "claude-opus-4-20250514",
    provider: "anthropic",
};

/// Daily work: DeepSeek R1 via OpenRouter (unmetered).
pub const DAILY_MODEL: ModelTarget = ModelTarget {
    model: "deepseek/deepseek-reasoner",
    provider: "openrouter",
};

/// Simple lookups and acknowledgements: Gemini Flash-Lite via OpenRouter.
pub const SIMPLE_MODEL: ModelTarget = ModelTarget {
    model: "google/gemini-2.5-flash-lite",
    provider: "openrouter",
};

/// Vision tasks: Gemini 3 Flash via OpenRouter.
pub const IMAGE_MODEL: ModelTarget = ModelTarget {
    model: "google/gemini-3-flash",
    provider: "openrouter",
};

/// Vision fallback when the primary image model is unavailable.
pub const IMAGE_FALLBACK_MODEL: ModelTarget = ModelTarget {
    model: "openai/gpt-5.2",
    provider: "openrouter",
};

/// Heartbeat target (same stack as simple, fired on a timer by clients).
pub fn heartbeat_model() -> (ModelTarget, ModelRole) {
    (SIMPLE_MODEL, ModelRole::Heartbeat)
}

/// Subagent target (same stack as daily).
pub fn subagent_model() -> (ModelTarget, ModelRole) {
    (DAILY_MODEL, ModelRole::Subagent)
}

/// Image/vision target.
pub fn image_model() -> (ModelTarget, ModelRole) {
    (IMAGE_MODEL, ModelRole::Image)
}

// --- Task classification ---------------------------------------------------

/// Patterns that mark a prompt as high-stakes or large-scope work.
static COMPLEX_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\b(smart ?contract|solidity|audit|security review)\b",
        r"(?i)\b(architect(ure)?|system ?design|scalab(le|ility))\b",
        r"(?i)\b(production|deploy|mainnet|migration)\b",
        r"(?i)\b(write (a |an )?(full|complete|entire|comprehensive))\b",
        r"(?i)\b(critical|mission.?critical)\b",
        r"(?i)\b(debug|refactor|optimize)\b.*\b(entire|whole|complete|full)\b",
        r"(?i)\b(multi-?step|complex) (analysis|reasoning|review)\b",
        r"(?i)\b(vulnerability|exploit|attack vector)\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("complex pattern must compile"))
    .collect()
});

/// Patterns that mark a prompt as trivial (greetings, acks, lookups).
static SIMPLE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)^(hi|hey|hello|yo|sup|thanks|thank you|ok|okay|bye|cool|nice|good|great)\b",
        r"(?i)^(what('s| is) (up|good)|how are you)",
        r"(?i)^(yes|no|yeah|nah|sure|alright)\b",
        r"^.{0,25}$",
        r"(?i)\b(status|ping|check|test)\b",
        r"(?i)^(show|list|get|what is)\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("simple pattern must compile"))
    .collect()
});

/// An embedded code block this long pushes a prompt to the complex tier.
static LONG_CODE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```.{500,}").expect("code block pattern must compile"));

/// Classify a prompt into a task tier.
///
/// Simple patterns are checked first and short-circuit: a short greeting
/// is never classified complex even if it happens to contain a complex
/// keyword.
pub fn classify_task(prompt: &str) -> TaskTier {
    let trimmed = prompt.trim();

    for pattern in SIMPLE_PATTERNS.iter() {
        if pattern.is_match(trimmed) {
            return TaskTier::Simple;
        }
    }

    for pattern in COMPLEX_PATTERNS.iter() {
        if pattern.is_match(trimmed) {
            return TaskTier::Complex;
        }
    }

    if LONG_CODE_BLOCK.is_match(trimmed) {
        return TaskTier::Complex;
    }

    TaskTier::Daily
}

// --- Cost tracking ---------------------------------------------------------

/// Per-model pricing, USD per million tokens. Unmetered models never
/// count against a subscriber's budget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelCost {
    pub input: f64,
    pub output: f64,
    pub metered: bool,
}

/// Static price table. Only the direct-Anthropic models are metered;
/// everything routed through OpenRouter is free for all tiers.
pub fn model_cost(model: &str) -> Option<ModelCost> {
    match model {
        "claude-opus-4-20250514" => Some(ModelCost {
            input: 15.0,
            output: 75.0,
            metered: true,
        }),
        "claude-sonnet-4-5-20250929" => Some(ModelCost {
            input: 3.0,
            output: 15.0,
            metered: true,
        }),
        "deepseek/deepseek-reasoner"
        | "google/gemini-2.5-flash-lite"
        | "google/gemini-3-flash"
        | "openai/gpt-5.2" => Some(ModelCost {
            input: 0.0,
            output: 0.0,
            metered: false,
        }),
        _ => None,
    }
}

/// `true` if usage of this model counts against the monthly budget.
pub fn is_metered(model: &str) -> bool {
    model_cost(model).map(|c| c.metered).unwrap_or(false)
}

/// Metered cost of one request in USD. Unmetered and unknown models are
/// always free regardless of volume.
pub fn calculate_request_cost(model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    let Some(cost) = model_cost(model) else {
        return 0.0;
    };
    if !cost.metered {
        return 0.0;
    }
    (input_tokens as f64 / 1_000_000.0) * cost.input
        + (output_tokens as f64 / 1_000_000.0) * cost.output
}

/// Whether the subscriber still has metered budget: plan base cap plus
/// top-ups. Free-plan users never have budget.
pub fn has_remaining_budget(plan: SubscriptionPlan, current_cost_usd: f64, extra_budget: f64) -> bool {
    if plan == SubscriptionPlan::Free {
        return false;
    }
    current_cost_usd < plan.cost_limit_usd() + extra_budget
}

/// Remaining metered budget in USD, floored at zero.
pub fn remaining_budget(plan: SubscriptionPlan, current_cost_usd: f64, extra_budget: f64) -> f64 {
    if plan == SubscriptionPlan::Free {
        return 0.0;
    }
    (plan.cost_limit_usd() + extra_budget - current_cost_usd).max(0.0)
}

/// Total metered budget: plan base cap plus top-ups.
pub fn total_budget(plan: SubscriptionPlan, extra_budget: f64) -> f64 {
    plan.cost_limit_usd() + extra_budget
}

// --- Model resolution ------------------------------------------------------

/// Resolve which model to use for a prompt.
///
/// Complex-tier prompts get the primary metered model only when the plan
/// has budget left AND the metered credential is configured
/// (`has_complex_key`); otherwise they degrade to the daily reasoning
/// model with `budget_exceeded` set. Daily and simple tiers route to
/// their unmetered targets unconditionally.
pub fn resolve_model(
    prompt: &str,
    plan: SubscriptionPlan,
    current_cost_usd: f64,
    extra_budget: f64,
    has_complex_key: bool,
) -> ResolvedModel {
    let tier = classify_task(prompt);

    match tier {
        TaskTier::Complex => {
            if has_remaining_budget(plan, current_cost_usd, extra_budget) && has_complex_key {
                ResolvedModel {
                    model: COMPLEX_MODEL.model,
                    provider: COMPLEX_MODEL.provider,
                    role: ModelRole::Primary,
                    tier,
                    budget_exceeded: false,
                }
            } else {
                ResolvedModel {
                    model: DAILY_MODEL.model,
                    provider: DAILY_MODEL.provider,
                    role: ModelRole::Daily,
                    tier,
                    budget_exceeded: true,
                }
            }
        }
        TaskTier::Daily => ResolvedModel {
            model: DAILY_MODEL.model,
            provider: DAILY_MODEL.provider,
            role: ModelRole::Daily,
            tier,
            budget_exceeded: false,
        },
        TaskTier::Simple => ResolvedModel {
            model: SIMPLE_MODEL.model,
            provider: SIMPLE_MODEL.provider,
            role: ModelRole::Simple,
            tier,
            budget_exceeded: false,
        },
    }
}
