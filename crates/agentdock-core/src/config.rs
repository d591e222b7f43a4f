use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

use agentdock_providers::{ProviderConfig, ProvidersConfig};
use agentdock_types::ProviderCredentials;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StoreConfig {
    /// Base URL of the record store deployment. Unset means in-memory.
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_instruction_length: usize,
    pub max_concurrent_tasks: usize,
    /// `0` disables the per-task deadline.
    pub task_deadline_secs: u64,
    pub status_poll_attempts: u32,
    pub status_poll_interval_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_instruction_length: 5000,
            max_concurrent_tasks: 16,
            task_deadline_secs: 1800,
            status_poll_attempts: 10,
            status_poll_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugPollConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for DebugPollConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay_ms: 1000,
            max_delay_ms: 5000,
            multiplier: 1.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub dir: Option<PathBuf>,
    pub ttl_secs: u64,
    pub max_bytes: usize,
    pub sweep_interval_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            dir: None,
            ttl_secs: 3600,
            max_bytes: 10 * 1024 * 1024,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    pub browser_hourly_rate: f64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            browser_hourly_rate: 0.20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub providers: HashMap<String, ProviderConfig>,
    /// Server-side fallbacks for the per-call LLM credential overrides.
    pub credentials: ProviderCredentials,
    pub limits: LimitsConfig,
    pub debug_poll: DebugPollConfig,
    pub uploads: UploadConfig,
    pub billing: BillingConfig,
}

impl AppConfig {
    pub fn providers_config(&self) -> ProvidersConfig {
        ProvidersConfig {
            providers: self.providers.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    file: Value,
    env: Value,
    runtime: Value,
    cli: Value,
}

/// Effective configuration: built-in defaults, then the JSON file, then the
/// environment, then runtime patches, then CLI overrides.
#[derive(Clone)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: Option<&Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let file = match path {
            Some(p) => read_json_file(p).await?,
            None => empty_object(),
        };
        Ok(Self::from_layers(
            path.map(Path::to_path_buf),
            file,
            env_layer(),
            cli_overrides.unwrap_or_else(empty_object),
        ))
    }

    fn from_layers(path: Option<PathBuf>, file: Value, env: Value, cli: Value) -> Self {
        Self {
            path,
            layers: Arc::new(RwLock::new(ConfigLayers {
                file,
                env,
                runtime: empty_object(),
                cli,
            })),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn get(&self) -> AppConfig {
        let merged = self.get_effective_value().await;
        match serde_json::from_value(merged) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(error = %err, "invalid configuration, using defaults");
                AppConfig::default()
            }
        }
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged =
            serde_json::to_value(AppConfig::default()).unwrap_or_else(|_| empty_object());
        deep_merge(&mut merged, &layers.file);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.runtime);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    /// Layer view with every credential replaced by a marker.
    pub async fn get_layers_value(&self) -> Value {
        let layers = self.layers.read().await;
        let mut out = json!({
            "file": layers.file,
            "env": layers.env,
            "runtime": layers.runtime,
            "cli": layers.cli
        });
        redact_secrets(&mut out);
        out
    }

    pub async fn patch_runtime(&self, patch: Value) -> Value {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.runtime, &patch);
        }
        self.get_effective_value().await
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    let value = serde_json::from_str::<Value>(&raw)
        .map_err(|err| anyhow::anyhow!("invalid config file {}: {err}", path.display()))?;
    Ok(value)
}

fn redact_secrets(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                let secret = matches!(key.as_str(), "api_key" | "apiKey")
                    || CREDENTIAL_FIELDS.contains(&key.as_str());
                if secret && child.is_string() {
                    *child = Value::String("[redacted]".to_string());
                } else {
                    redact_secrets(child);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(redact_secrets),
        _ => {}
    }
}

const CREDENTIAL_FIELDS: [&str; 5] = ["openai", "google", "anthropic", "browserUse", "openrouter"];

fn env_layer() -> Value {
    env_layer_from(|name| std::env::var(name).ok())
}

fn env_layer_from(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
    let mut root = empty_object();

    if let Some(url) = get("CONVEX_URL") {
        deep_merge(&mut root, &json!({ "store": { "url": url } }));
    }
    for (provider, env_name) in [
        ("browser-use", "BROWSER_USE_API_KEY"),
        ("notte", "NOTTE_API_KEY"),
    ] {
        if let Some(key) = get(env_name) {
            deep_merge(
                &mut root,
                &json!({ "providers": { provider: { "api_key": key } } }),
            );
        }
    }
    for (field, env_name) in [
        ("openai", "OPENAI_API_KEY"),
        ("google", "GOOGLE_API_KEY"),
        ("anthropic", "ANTHROPIC_API_KEY"),
        ("browserUse", "BROWSER_USE_API_KEY"),
        ("openrouter", "OPENROUTER_API_KEY"),
    ] {
        if let Some(key) = get(env_name) {
            deep_merge(&mut root, &json!({ "credentials": { field: key } }));
        }
    }
    if let Some(max) = get("MAX_INSTRUCTION_LENGTH").and_then(|v| v.trim().parse::<usize>().ok()) {
        deep_merge(
            &mut root,
            &json!({ "limits": { "max_instruction_length": max } }),
        );
    }
    if let Some(secs) =
        get("AGENTDOCK_TASK_DEADLINE_SECS").and_then(|v| v.trim().parse::<u64>().ok())
    {
        deep_merge(&mut root, &json!({ "limits": { "task_deadline_secs": secs } }));
    }
    if let Some(dir) = get("AGENTDOCK_UPLOAD_DIR") {
        deep_merge(&mut root, &json!({ "uploads": { "dir": dir } }));
    }

    root
}

/// Recursively merges `overlay` into `base`. Objects merge key by key, any
/// other value replaces, and nulls never overwrite.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (_, Value::Null) => {}
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None if !value.is_null() => {
                        base_map.insert(key.clone(), value.clone());
                    }
                    None => {}
                }
            }
        }
        (slot, value) => *slot = value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(file: Value, env: Value, cli: Value) -> ConfigStore {
        ConfigStore::from_layers(None, file, env, cli)
    }

    #[tokio::test]
    async fn defaults_apply_without_layers() {
        let config = store(empty_object(), empty_object(), empty_object()).get().await;
        assert_eq!(config.limits.max_instruction_length, 5000);
        assert_eq!(config.limits.max_concurrent_tasks, 16);
        assert_eq!(config.debug_poll.max_attempts, 10);
        assert_eq!(config.uploads.ttl_secs, 3600);
        assert!((config.billing.browser_hourly_rate - 0.20).abs() < f64::EPSILON);
        assert!(config.store.url.is_none());
    }

    #[tokio::test]
    async fn later_layers_win() {
        let config = store(
            json!({"limits": {"max_instruction_length": 100, "task_deadline_secs": 60}}),
            json!({"limits": {"max_instruction_length": 200}}),
            json!({"limits": {"task_deadline_secs": 0}}),
        )
        .get()
        .await;
        assert_eq!(config.limits.max_instruction_length, 200);
        assert_eq!(config.limits.task_deadline_secs, 0);
        assert_eq!(config.limits.status_poll_attempts, 10);
    }

    #[tokio::test]
    async fn runtime_patch_is_merged_below_cli() {
        let store = store(
            empty_object(),
            empty_object(),
            json!({"limits": {"max_concurrent_tasks": 2}}),
        );
        store
            .patch_runtime(json!({
                "limits": {"max_concurrent_tasks": 8, "status_poll_attempts": 3}
            }))
            .await;
        let config = store.get().await;
        assert_eq!(config.limits.max_concurrent_tasks, 2);
        assert_eq!(config.limits.status_poll_attempts, 3);
    }

    #[test]
    fn env_layer_reads_known_variables() {
        let vars = HashMap::from([
            ("CONVEX_URL", "https://happy-otter.convex.cloud"),
            ("NOTTE_API_KEY", "notte-key"),
            ("OPENAI_API_KEY", "sk-openai"),
            ("BROWSER_USE_API_KEY", "bu-key"),
            ("MAX_INSTRUCTION_LENGTH", "1200"),
            ("AGENTDOCK_TASK_DEADLINE_SECS", "not-a-number"),
            ("AGENTDOCK_UPLOAD_DIR", "/tmp/uploads"),
        ]);
        let layer = env_layer_from(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(layer["store"]["url"], "https://happy-otter.convex.cloud");
        assert_eq!(layer["providers"]["notte"]["api_key"], "notte-key");
        assert_eq!(layer["providers"]["browser-use"]["api_key"], "bu-key");
        assert_eq!(layer["credentials"]["openai"], "sk-openai");
        assert_eq!(layer["credentials"]["browserUse"], "bu-key");
        assert_eq!(layer["limits"]["max_instruction_length"], 1200);
        assert!(layer["limits"].get("task_deadline_secs").is_none());
        assert_eq!(layer["uploads"]["dir"], "/tmp/uploads");
    }

    #[test]
    fn deep_merge_skips_nulls_and_merges_objects() {
        let mut base = json!({"a": {"b": 1, "c": 2}, "d": "keep"});
        deep_merge(&mut base, &json!({"a": {"b": 10, "e": null}, "d": null, "f": [1]}));
        assert_eq!(base, json!({"a": {"b": 10, "c": 2}, "d": "keep", "f": [1]}));
    }

    #[tokio::test]
    async fn layer_view_redacts_credentials() {
        let store = store(
            json!({"providers": {"notte": {"api_key": "secret-1"}}}),
            json!({"credentials": {"openai": "secret-2"}}),
            empty_object(),
        );
        let rendered = store.get_layers_value().await.to_string();
        assert!(!rendered.contains("secret-1"));
        assert!(!rendered.contains("secret-2"));
        assert!(rendered.contains("[redacted]"));
    }

    #[tokio::test]
    async fn reads_config_file_when_present() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("agentdock.json");
        fs::write(&path, r#"{"store": {"url": "http://127.0.0.1:3210"}}"#)
            .await
            .expect("write");
        let store = ConfigStore::new(Some(&path), None).await.expect("store");
        assert_eq!(
            store.get().await.store.url.as_deref(),
            Some("http://127.0.0.1:3210")
        );
        assert_eq!(store.path(), Some(path.as_path()));
    }
}
