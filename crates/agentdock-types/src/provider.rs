use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const BASELINE_PROVIDER: &str = "browser-use";
pub const BASELINE_MODEL: &str = "bu-1.0";
pub const OPENROUTER_PREFIX: &str = "openrouter/";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
    /// Key under which the final answer is stored in the result payload.
    pub answer_field: String,
}

/// A `provider/model` pair resolved from the caller's free-form string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProviderModel {
    pub provider: String,
    pub model: String,
}

impl ProviderModel {
    pub fn baseline() -> Self {
        Self {
            provider: BASELINE_PROVIDER.to_string(),
            model: BASELINE_MODEL.to_string(),
        }
    }

    /// Splits on the first `/`. Empty or unqualified input falls back to the
    /// baseline pair; the `openrouter/` namespace keeps the remainder verbatim
    /// so `openrouter/vendor/model` resolves to model `vendor/model`.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Self::baseline();
        }
        if let Some(rest) = trimmed.strip_prefix(OPENROUTER_PREFIX) {
            if !rest.is_empty() {
                return Self {
                    provider: "openrouter".to_string(),
                    model: rest.to_string(),
                };
            }
        }
        match trimmed.split_once('/') {
            Some((provider, model)) if !provider.is_empty() && !model.is_empty() => Self {
                provider: provider.to_string(),
                model: model.to_string(),
            },
            _ => Self::baseline(),
        }
    }

    /// Exact key used for price lookups.
    pub fn key(&self) -> String {
        format!("{}/{}", self.provider, self.model)
    }
}

impl fmt::Display for ProviderModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

/// Token and credit counters reported by a provider run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub cached_prompt_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credits: Option<f64>,
}

impl Usage {
    /// Upstream cost figure, when it can be used verbatim.
    pub fn trusted_total_cost(&self) -> Option<f64> {
        self.total_cost.filter(|cost| cost.is_finite() && *cost > 0.0)
    }
}

/// Provider-side browser session handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserSession {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cdp_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live_url: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub attached: bool,
}

impl BrowserSession {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            cdp_url: None,
            live_url: None,
            started_at: Utc::now(),
            attached: false,
        }
    }

    pub fn live_url(&self) -> &str {
        self.live_url.as_deref().unwrap_or("")
    }

    pub fn elapsed_secs(&self, now: DateTime<Utc>) -> f64 {
        (now - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}

/// Session coordinates pre-created by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCoordinates {
    #[serde(alias = "id", alias = "sessionId")]
    pub browser_session_id: String,
    #[serde(default)]
    pub cdp_url: Option<String>,
    #[serde(default, alias = "url")]
    pub live_url: Option<String>,
}

impl From<SessionCoordinates> for BrowserSession {
    fn from(coords: SessionCoordinates) -> Self {
        Self {
            id: coords.browser_session_id,
            cdp_url: coords.cdp_url.filter(|v| !v.trim().is_empty()),
            live_url: coords.live_url.filter(|v| !v.trim().is_empty()),
            started_at: Utc::now(),
            attached: true,
        }
    }
}

/// Post-hoc session metadata that may only be available some time after the
/// session was created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugInfo {
    #[serde(default)]
    pub debug_url: Option<String>,
    #[serde(default)]
    pub recording_ws: Option<String>,
    #[serde(default)]
    pub cdp_url: Option<String>,
}

/// Session recording captured before the browser is released.
#[derive(Clone, PartialEq, Eq)]
pub struct Recording {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl Recording {
    pub fn file_name(&self, task_id: &str) -> String {
        let ext = match self.content_type.as_str() {
            "video/webm" => "webm",
            "image/webp" => "webp",
            _ => "mp4",
        };
        format!("recording-{task_id}.{ext}")
    }
}

impl fmt::Debug for Recording {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recording")
            .field("content_type", &self.content_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Per-call credential overrides, one per supported LLM provider.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCredentials {
    #[serde(default)]
    pub openai: Option<String>,
    #[serde(default)]
    pub google: Option<String>,
    #[serde(default)]
    pub anthropic: Option<String>,
    #[serde(default)]
    pub browser_use: Option<String>,
    #[serde(default)]
    pub openrouter: Option<String>,
}

impl ProviderCredentials {
    pub fn for_provider(&self, provider_id: &str) -> Option<&str> {
        let value = match provider_id.to_ascii_lowercase().as_str() {
            "openai" => self.openai.as_deref(),
            "google" => self.google.as_deref(),
            "anthropic" => self.anthropic.as_deref(),
            "browser-use" | "browser_use" => self.browser_use.as_deref(),
            "openrouter" => self.openrouter.as_deref(),
            _ => None,
        };
        value.map(str::trim).filter(|v| !v.is_empty())
    }

    pub fn configured(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        for (id, value) in [
            ("openai", &self.openai),
            ("google", &self.google),
            ("anthropic", &self.anthropic),
            ("browser-use", &self.browser_use),
            ("openrouter", &self.openrouter),
        ] {
            if value.as_deref().is_some_and(|v| !v.trim().is_empty()) {
                out.push(id);
            }
        }
        out
    }
}

impl fmt::Debug for ProviderCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderCredentials")
            .field("configured", &self.configured())
            .finish()
    }
}
