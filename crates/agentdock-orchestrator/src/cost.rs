use std::collections::HashMap;

use serde::Serialize;

use agentdock_types::Usage;

pub const DEFAULT_BROWSER_HOURLY_RATE: f64 = 0.20;

/// Per-token USD prices for one `provider/model` key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceTier {
    pub input_per_token: f64,
    pub output_per_token: f64,
    pub cached_per_token: f64,
}

impl PriceTier {
    /// Builds a tier from per-million-token list prices.
    pub fn per_million(input: f64, output: f64, cached: f64) -> Self {
        Self {
            input_per_token: input / 1_000_000.0,
            output_per_token: output / 1_000_000.0,
            cached_per_token: cached / 1_000_000.0,
        }
    }

    pub fn cost(&self, usage: &Usage) -> f64 {
        usage.prompt_tokens as f64 * self.input_per_token
            + usage.completion_tokens as f64 * self.output_per_token
            + usage.cached_prompt_tokens as f64 * self.cached_per_token
    }
}

/// Read-only price table with a default tier for unknown keys.
#[derive(Debug, Clone)]
pub struct PriceTable {
    tiers: HashMap<String, PriceTier>,
    default: PriceTier,
}

impl PriceTable {
    pub fn new(default: PriceTier) -> Self {
        Self {
            tiers: HashMap::new(),
            default,
        }
    }

    pub fn builtin() -> Self {
        Self::new(PriceTier::per_million(0.50, 3.00, 0.10))
            .with_tier("browser-use/bu-1.0", PriceTier::per_million(0.50, 3.00, 0.10))
            .with_tier(
                "google/gemini-2.5-flash",
                PriceTier::per_million(0.30, 2.50, 0.03),
            )
            .with_tier(
                "google/gemini-2.5-pro",
                PriceTier::per_million(1.25, 10.00, 0.3125),
            )
            .with_tier("openai/gpt-4.1", PriceTier::per_million(2.00, 8.00, 0.50))
            .with_tier(
                "anthropic/claude-4.5-haiku",
                PriceTier::per_million(1.00, 5.00, 0.10),
            )
    }

    pub fn with_tier(mut self, key: impl Into<String>, tier: PriceTier) -> Self {
        self.tiers.insert(key.into(), tier);
        self
    }

    /// Exact key match only.
    pub fn tier_for(&self, key: &str) -> &PriceTier {
        self.tiers.get(key).unwrap_or(&self.default)
    }
}

impl Default for PriceTable {
    fn default() -> Self {
        Self::builtin()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostBreakdown {
    pub llm_cost: f64,
    pub browser_cost: f64,
    pub total_cost: f64,
}

pub struct CostAccountant {
    prices: PriceTable,
    browser_hourly_rate: f64,
}

impl CostAccountant {
    pub fn new(prices: PriceTable, browser_hourly_rate: f64) -> Self {
        Self {
            prices,
            browser_hourly_rate,
        }
    }

    /// Provider-reported cost when it is usable, else recomputed from token
    /// counts.
    pub fn llm_cost(&self, model_key: &str, usage: &Usage) -> f64 {
        usage
            .trusted_total_cost()
            .unwrap_or_else(|| self.prices.tier_for(model_key).cost(usage))
    }

    pub fn browser_cost(&self, session_secs: f64) -> f64 {
        let secs = if session_secs.is_finite() {
            session_secs.max(0.0)
        } else {
            0.0
        };
        secs / 3600.0 * self.browser_hourly_rate
    }

    pub fn account(&self, model_key: &str, usage: &Usage, session_secs: f64) -> CostBreakdown {
        let llm_cost = self.llm_cost(model_key, usage);
        let browser_cost = self.browser_cost(session_secs);
        CostBreakdown {
            llm_cost,
            browser_cost,
            total_cost: llm_cost + browser_cost,
        }
    }
}

impl Default for CostAccountant {
    fn default() -> Self {
        Self::new(PriceTable::builtin(), DEFAULT_BROWSER_HOURLY_RATE)
    }
}
