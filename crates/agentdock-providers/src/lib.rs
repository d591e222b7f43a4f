use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use agentdock_types::{
    BrowserSession, DebugInfo, FieldMap, ProviderCredentials, ProviderInfo, ProviderModel,
    RawValue, Recording, ResponseFields, SessionCoordinates, Usage, BASELINE_PROVIDER,
};

mod browser_use;
mod notte;
mod scripted;

pub use browser_use::BrowserUseProvider;
pub use notte::{notte_viewer_url, NotteProvider};
pub use scripted::{RecordedRun, ScriptedProvider, ScriptedRun};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub url: Option<String>,
    /// Interval between run-status checks while an instruction executes.
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

/// Input for one instruction run.
#[derive(Clone)]
pub struct RunRequest {
    pub task_id: String,
    pub instruction: String,
    pub model: ProviderModel,
    pub secrets: HashMap<String, String>,
    pub file_path: Option<PathBuf>,
    pub credentials: ProviderCredentials,
}

impl fmt::Debug for RunRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut secret_keys = self.secrets.keys().collect::<Vec<_>>();
        secret_keys.sort();
        f.debug_struct("RunRequest")
            .field("task_id", &self.task_id)
            .field("instruction_len", &self.instruction.len())
            .field("model", &self.model)
            .field("secret_keys", &secret_keys)
            .field("file_path", &self.file_path)
            .field("credentials", &self.credentials)
            .finish()
    }
}

impl RunRequest {
    /// Key and endpoint for the model driving the run. The hosted baseline
    /// is billed to the adapter account and needs no route.
    pub fn llm_route(&self) -> Option<LlmRoute> {
        if self.model.provider == BASELINE_PROVIDER {
            return None;
        }
        let api_key = self.credentials.for_provider(&self.model.provider)?;
        let base_url =
            (self.model.provider == "openrouter").then(|| OPENROUTER_BASE_URL.to_string());
        Some(LlmRoute {
            api_key: api_key.to_string(),
            base_url,
        })
    }
}

pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

#[derive(Clone, PartialEq, Eq)]
pub struct LlmRoute {
    pub api_key: String,
    /// Set for OpenAI-compatible gateways.
    pub base_url: Option<String>,
}

impl fmt::Debug for LlmRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmRoute")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

/// One step of the agent's action history.
#[derive(Debug, Clone)]
pub struct ActionRecord {
    pub name: String,
    pub is_done: Option<bool>,
    pub success: Option<bool>,
    pub attachments: RawValue,
    pub error: Option<String>,
    pub extracted_content: Option<String>,
    pub metadata: RawValue,
}

impl ActionRecord {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_done: None,
            success: None,
            attachments: RawValue::Null,
            error: None,
            extracted_content: None,
            metadata: RawValue::Null,
        }
    }
}

impl ResponseFields for ActionRecord {
    fn type_name(&self) -> &str {
        "ActionResult"
    }

    fn fields(&self) -> anyhow::Result<FieldMap> {
        Ok(vec![
            ("isDone".to_string(), self.is_done.into()),
            ("success".to_string(), self.success.into()),
            ("attachments".to_string(), self.attachments.clone()),
            ("error".to_string(), self.error.clone().into()),
            ("name".to_string(), self.name.clone().into()),
            (
                "extractedContent".to_string(),
                self.extracted_content.clone().into(),
            ),
            ("metadata".to_string(), self.metadata.clone()),
        ])
    }
}

/// Provider run response before normalization.
#[derive(Debug, Clone, Default)]
pub struct RunResponse {
    pub run_id: Option<String>,
    pub status: Option<String>,
    pub answer: Option<String>,
    pub success: Option<bool>,
    pub task: Option<String>,
    pub url: Option<String>,
    pub duration_secs: Option<f64>,
    pub usage: Usage,
    pub actions: Vec<ActionRecord>,
    pub steps: Vec<RawValue>,
    pub metadata: Option<RawValue>,
}

impl RunResponse {
    pub fn has_answer(&self) -> bool {
        self.answer.as_deref().is_some_and(|a| !a.trim().is_empty())
    }

    pub fn has_terminal_status(&self) -> bool {
        self.status.as_deref().is_some_and(is_terminal_run_status)
    }

    /// No further status polling can change this response.
    pub fn is_settled(&self) -> bool {
        self.has_terminal_status() || (self.status.is_none() && self.has_answer())
    }
}

pub fn is_terminal_run_status(status: &str) -> bool {
    matches!(
        status.trim().to_ascii_lowercase().as_str(),
        "finished"
            | "stopped"
            | "closed"
            | "completed"
            | "done"
            | "success"
            | "succeeded"
            | "failed"
            | "error"
            | "cancelled"
    )
}

/// Terminal statuses that mean the run did not finish its instruction.
pub fn is_failed_run_status(status: &str) -> bool {
    matches!(
        status.trim().to_ascii_lowercase().as_str(),
        "failed" | "error" | "cancelled"
    )
}

#[async_trait]
pub trait AutomationProvider: Send + Sync {
    fn info(&self) -> ProviderInfo;

    async fn create_session(
        &self,
        credentials: &ProviderCredentials,
    ) -> anyhow::Result<BrowserSession>;

    /// Reuses a session the caller already created.
    async fn attach_session(&self, coords: SessionCoordinates) -> anyhow::Result<BrowserSession> {
        Ok(BrowserSession::from(coords))
    }

    async fn run_instruction(
        &self,
        session: &BrowserSession,
        request: RunRequest,
    ) -> anyhow::Result<RunResponse>;

    /// Fetches the current state of a previously started run.
    async fn poll_run(
        &self,
        run_id: &str,
        credentials: &ProviderCredentials,
    ) -> anyhow::Result<Option<RunResponse>> {
        let _ = (run_id, credentials);
        Ok(None)
    }

    async fn fetch_debug_info(&self, session: &BrowserSession) -> anyhow::Result<DebugInfo> {
        anyhow::bail!(
            "provider `{}` does not expose debug info for session {}",
            self.info().id,
            session.id
        )
    }

    /// Human-viewable URL derived from debug info.
    fn viewer_url(&self, session: &BrowserSession, debug: &DebugInfo) -> Option<String> {
        let _ = session;
        debug.debug_url.clone().filter(|u| !u.trim().is_empty())
    }

    /// Session replay, for adapters that keep one. Must be called before
    /// the session is stopped.
    async fn fetch_recording(
        &self,
        session: &BrowserSession,
        credentials: &ProviderCredentials,
    ) -> anyhow::Result<Option<Recording>> {
        let _ = (session, credentials);
        Ok(None)
    }

    async fn stop_session(
        &self,
        session: &BrowserSession,
        credentials: &ProviderCredentials,
    ) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Arc<Vec<Arc<dyn AutomationProvider>>>,
}

impl ProviderRegistry {
    pub fn new(config: ProvidersConfig) -> Self {
        Self::with_providers(build_providers(&config))
    }

    pub fn with_providers(providers: Vec<Arc<dyn AutomationProvider>>) -> Self {
        Self {
            providers: Arc::new(providers),
        }
    }

    pub fn list(&self) -> Vec<ProviderInfo> {
        self.providers.iter().map(|p| p.info()).collect()
    }

    pub fn get(&self, provider_id: &str) -> anyhow::Result<Arc<dyn AutomationProvider>> {
        if let Some(provider) = self.providers.iter().find(|p| p.info().id == provider_id) {
            return Ok(provider.clone());
        }
        let available = self.providers.iter().map(|p| p.info().id).collect::<Vec<_>>();
        anyhow::bail!(
            "provider `{}` is not configured. configured providers: {}",
            provider_id,
            available.join(", ")
        );
    }
}

fn build_providers(config: &ProvidersConfig) -> Vec<Arc<dyn AutomationProvider>> {
    let mut providers: Vec<Arc<dyn AutomationProvider>> = Vec::new();

    if let Some(entry) = provider_entry(config, "browser-use") {
        providers.push(Arc::new(BrowserUseProvider::new(
            entry.url.as_deref(),
            entry.api_key,
            entry.poll_interval_ms,
        )));
    }
    if let Some(entry) = provider_entry(config, "notte") {
        providers.push(Arc::new(NotteProvider::new(
            entry.url.as_deref(),
            entry.api_key,
            entry.poll_interval_ms,
        )));
    }
    providers.push(Arc::new(ScriptedProvider::local()));

    providers
}

/// Explicit config entry, or an implicit one when only the env key is set.
fn provider_entry(config: &ProvidersConfig, id: &str) -> Option<ProviderConfig> {
    let env_key = env_api_key_for_provider(id);
    match config.providers.get(id) {
        Some(entry) => {
            let mut entry = entry.clone();
            entry.api_key = entry
                .api_key
                .filter(|key| !is_placeholder_api_key(key))
                .or(env_key);
            Some(entry)
        }
        None => env_key.map(|key| ProviderConfig {
            api_key: Some(key),
            ..Default::default()
        }),
    }
}

pub fn is_placeholder_api_key(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("x")
        || trimmed.eq_ignore_ascii_case("placeholder")
}

fn env_api_key_for_provider(id: &str) -> Option<String> {
    std::env::var(provider_api_key_env(id)?)
        .ok()
        .filter(|v| !is_placeholder_api_key(v))
}

pub fn provider_api_key_env(id: &str) -> Option<&'static str> {
    match id {
        "browser-use" => Some("BROWSER_USE_API_KEY"),
        "notte" => Some("NOTTE_API_KEY"),
        _ => None,
    }
}

fn normalize_base(input: &str) -> String {
    input.trim().trim_end_matches('/').to_string()
}

fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let mut end = max_len;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &input[..end])
}

fn extract_error_message(value: &Value) -> Option<String> {
    let candidates = [
        value.get("error").and_then(|v| v.get("message")),
        value.get("error"),
        value.get("detail"),
        value.get("message"),
    ];
    candidates
        .into_iter()
        .flatten()
        .find_map(|v| v.as_str().map(str::to_string))
}

/// Sends a request and decodes a JSON body, turning non-2xx statuses into
/// errors that carry the provider's own message.
async fn send_json(provider_id: &str, request: reqwest::RequestBuilder) -> anyhow::Result<Value> {
    let response = request.send().await?;
    let status = response.status();
    let body = response.text().await?;
    let value = if body.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str::<Value>(&body).unwrap_or(Value::String(body.clone()))
    };
    if !status.is_success() {
        let detail = extract_error_message(&value)
            .unwrap_or_else(|| truncate_for_error(body.trim(), 300));
        anyhow::bail!("{provider_id} request failed with status {status}: {detail}");
    }
    Ok(value)
}

/// Epoch seconds from a number or an ISO-8601 string. Strings without an
/// offset are read as UTC.
fn parse_timestamp(value: &Value) -> Option<f64> {
    if let Some(n) = value.as_f64() {
        return Some(n);
    }
    let raw = value.as_str()?.trim();
    let parsed = match DateTime::parse_from_rfc3339(raw) {
        Ok(dt) => dt.with_timezone(&Utc),
        Err(_) => NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()?
            .and_utc(),
    };
    Some(parsed.timestamp_millis() as f64 / 1000.0)
}

fn duration_between(start: Option<f64>, end: Option<f64>) -> Option<f64> {
    Some((end? - start?).max(0.0))
}

const RUN_WAIT_MAX_CHECKS: usize = 1200;

/// Repeatedly fetches a run until it settles. Gives up after a fixed number
/// of checks and returns the last response seen.
async fn wait_until_settled<F, Fut>(interval: Duration, mut fetch: F) -> anyhow::Result<RunResponse>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<RunResponse>>,
{
    let mut latest = fetch().await?;
    let mut checks = 1;
    while !latest.is_settled() && checks < RUN_WAIT_MAX_CHECKS {
        tokio::time::sleep(interval).await;
        latest = fetch().await?;
        checks += 1;
    }
    Ok(latest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(ids: &[&str]) -> ProvidersConfig {
        let mut providers = HashMap::new();
        for id in ids {
            providers.insert(
                (*id).to_string(),
                ProviderConfig {
                    api_key: Some(format!("{id}-key")),
                    url: Some(format!("http://127.0.0.1:9/{id}")),
                    poll_interval_ms: None,
                },
            );
        }
        ProvidersConfig { providers }
    }

    #[test]
    fn configured_adapters_are_selectable() {
        let registry = ProviderRegistry::new(cfg(&["notte", "browser-use"]));
        let notte = registry.get("notte").expect("notte");
        assert_eq!(notte.info().id, "notte");
        let bu = registry.get("browser-use").expect("browser-use");
        assert_eq!(bu.info().answer_field, "finalResult");
    }

    #[test]
    fn local_adapter_is_always_present() {
        let registry = ProviderRegistry::new(ProvidersConfig::default());
        let ids = registry
            .list()
            .into_iter()
            .map(|p| p.id)
            .collect::<Vec<_>>();
        assert!(ids.contains(&"local".to_string()));
    }

    #[test]
    fn unknown_adapter_errors_with_available_list() {
        let registry = ProviderRegistry::new(cfg(&["notte"]));
        let err = registry.get("skyvern").err().expect("expected error");
        let message = err.to_string();
        assert!(message.contains("provider `skyvern` is not configured"));
        assert!(message.contains("notte"));
    }

    #[test]
    fn placeholder_keys_are_ignored() {
        assert!(is_placeholder_api_key(""));
        assert!(is_placeholder_api_key("  X "));
        assert!(is_placeholder_api_key("placeholder"));
        assert!(!is_placeholder_api_key("bu_live_123"));
    }

    #[test]
    fn settled_when_status_terminal_or_bare_answer() {
        let mut response = RunResponse::default();
        assert!(!response.is_settled());
        response.answer = Some("42".to_string());
        assert!(response.is_settled());
        response.status = Some("active".to_string());
        assert!(!response.is_settled());
        response.status = Some("closed".to_string());
        assert!(response.is_settled());
    }

    #[test]
    fn failed_statuses_are_a_subset_of_terminal_ones() {
        for status in ["failed", "Error", " cancelled "] {
            assert!(is_failed_run_status(status));
            assert!(is_terminal_run_status(status));
        }
        assert!(!is_failed_run_status("finished"));
        assert!(!is_failed_run_status("active"));
    }

    #[test]
    fn run_request_debug_hides_secret_values() {
        let request = RunRequest {
            task_id: "t".to_string(),
            instruction: "log in".to_string(),
            model: ProviderModel::baseline(),
            secrets: HashMap::from([("password".to_string(), "hunter2".to_string())]),
            file_path: None,
            credentials: ProviderCredentials::default(),
        };
        let rendered = format!("{request:?}");
        assert!(rendered.contains("password"));
        assert!(!rendered.contains("hunter2"));
    }

    fn run_for(model: &str, credentials: ProviderCredentials) -> RunRequest {
        RunRequest {
            task_id: "t".to_string(),
            instruction: "search".to_string(),
            model: ProviderModel::parse(model),
            secrets: HashMap::new(),
            file_path: None,
            credentials,
        }
    }

    #[test]
    fn llm_route_uses_the_model_providers_key() {
        let credentials = ProviderCredentials {
            openai: Some("sk-user".to_string()),
            openrouter: Some("or-user".to_string()),
            browser_use: Some("bu-user".to_string()),
            ..Default::default()
        };
        let openai = run_for("openai/gpt-4.1", credentials.clone())
            .llm_route()
            .expect("openai route");
        assert_eq!(openai.api_key, "sk-user");
        assert_eq!(openai.base_url, None);

        let routed = run_for("openrouter/moonshotai/kimi-k2", credentials.clone())
            .llm_route()
            .expect("openrouter route");
        assert_eq!(routed.api_key, "or-user");
        assert_eq!(routed.base_url.as_deref(), Some(OPENROUTER_BASE_URL));
        assert!(!format!("{routed:?}").contains("or-user"));

        assert!(run_for("", credentials.clone()).llm_route().is_none());
        assert!(run_for("google/gemini-2.5-flash", credentials).llm_route().is_none());
    }

    #[test]
    fn error_message_prefers_nested_error() {
        let value = serde_json::json!({"error": {"message": "quota exceeded"}, "message": "x"});
        assert_eq!(
            extract_error_message(&value).as_deref(),
            Some("quota exceeded")
        );
        assert_eq!(truncate_for_error("abcdef", 3), "abc...");
    }

    #[test]
    fn timestamps_accept_numbers_and_iso_strings() {
        use serde_json::json;
        assert_eq!(parse_timestamp(&json!(12.5)), Some(12.5));
        assert_eq!(parse_timestamp(&json!("1970-01-01T00:01:00Z")), Some(60.0));
        assert_eq!(parse_timestamp(&json!("1970-01-01T00:00:30")), Some(30.0));
        assert_eq!(parse_timestamp(&json!("yesterday")), None);
        assert_eq!(duration_between(Some(10.0), Some(4.0)), Some(0.0));
        assert_eq!(duration_between(None, Some(4.0)), None);
    }
}
