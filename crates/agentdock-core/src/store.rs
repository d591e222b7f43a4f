use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use agentdock_types::{Recording, TaskStatus};

pub const CREATE_AGENT: &str = "mutations:createAgentFromBackend";
pub const UPDATE_STATUS: &str = "mutations:updateAgentStatusFromBackend";
pub const UPDATE_RESULT: &str = "mutations:updateAgentResultFromBackend";
pub const UPDATE_BROWSER_URL: &str = "mutations:updateAgentBrowserUrlFromBackend";
pub const HEALTH_QUERY: &str = "queries:getUserSessions";
pub const UPLOAD_RECORDING_ROUTE: &str = "/upload-recording";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("store rejected `{path}`: {message}")]
    Rejected { path: String, message: String },
    #[error("unexpected store response for `{path}`: {detail}")]
    Protocol { path: String, detail: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Record created when a task is admitted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTaskRecord {
    pub session_id: String,
    /// Adapter name, e.g. `notte`.
    pub name: String,
    pub model: String,
    pub browser_session_id: String,
    pub browser_url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreHealth {
    pub backend: String,
    pub target: String,
    pub sessions_count: usize,
}

/// External task/record store. Every call is a single remote write or read;
/// callers decide whether a failure matters.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create_task(&self, record: &NewTaskRecord) -> StoreResult<String>;

    async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> StoreResult<()>;

    /// Writes the result payload and marks the task completed in one call.
    async fn write_result(&self, task_id: &str, result: &Value) -> StoreResult<()>;

    async fn update_browser_url(&self, task_id: &str, url: &str) -> StoreResult<()>;

    /// Stores a session replay against the task and returns its public URL.
    async fn upload_recording(&self, task_id: &str, recording: &Recording) -> StoreResult<String>;

    async fn health(&self) -> StoreResult<StoreHealth>;
}

/// Convex deployment reached over its HTTP function API.
pub struct ConvexStore {
    base_url: String,
    client: Client,
}

impl ConvexStore {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn call(&self, kind: &str, path: &str, args: Value) -> StoreResult<Value> {
        let url = format!("{}/api/{}", self.base_url, kind);
        let response = self
            .client
            .post(url)
            .json(&json!({ "path": path, "args": args, "format": "json" }))
            .send()
            .await?;
        let http_status = response.status();
        let body: Value = response.json().await.map_err(|err| StoreError::Protocol {
            path: path.to_string(),
            detail: format!("status {http_status}: {err}"),
        })?;
        decode_function_response(path, body)
    }
}

/// HTTP actions are served from the `.convex.site` twin of the deployment.
fn http_action_url(base_url: &str, route: &str) -> StoreResult<String> {
    if base_url.contains(".convex.cloud") {
        return Ok(format!("{}{route}", base_url.replace(".convex.cloud", ".convex.site")));
    }
    if base_url.contains(".convex.site") {
        return Ok(format!("{base_url}{route}"));
    }
    Err(StoreError::Unavailable(format!(
        "no http action endpoint for store url {base_url}"
    )))
}

fn decode_function_response(path: &str, body: Value) -> StoreResult<Value> {
    match body.get("status").and_then(Value::as_str) {
        Some("success") => Ok(body.get("value").cloned().unwrap_or(Value::Null)),
        Some("error") => Err(StoreError::Rejected {
            path: path.to_string(),
            message: body
                .get("errorMessage")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        }),
        other => Err(StoreError::Protocol {
            path: path.to_string(),
            detail: format!("missing or unknown status {other:?}"),
        }),
    }
}

#[async_trait]
impl TaskStore for ConvexStore {
    async fn create_task(&self, record: &NewTaskRecord) -> StoreResult<String> {
        let value = self
            .call(
                "mutation",
                CREATE_AGENT,
                json!({
                    "sessionId": record.session_id,
                    "name": record.name,
                    "model": record.model,
                    "browser": {
                        "sessionId": record.browser_session_id,
                        "url": record.browser_url,
                    },
                }),
            )
            .await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| StoreError::Protocol {
                path: CREATE_AGENT.to_string(),
                detail: format!("expected an id string, got {value}"),
            })
    }

    async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> StoreResult<()> {
        let mut args = json!({ "agentId": task_id, "status": status.as_str() });
        if let Some(error) = error {
            args["error"] = json!(error);
        }
        self.call("mutation", UPDATE_STATUS, args).await?;
        Ok(())
    }

    async fn write_result(&self, task_id: &str, result: &Value) -> StoreResult<()> {
        self.call(
            "mutation",
            UPDATE_RESULT,
            json!({
                "agentId": task_id,
                "result": result,
                "status": TaskStatus::Completed.as_str(),
            }),
        )
        .await?;
        Ok(())
    }

    async fn update_browser_url(&self, task_id: &str, url: &str) -> StoreResult<()> {
        self.call(
            "mutation",
            UPDATE_BROWSER_URL,
            json!({ "agentId": task_id, "url": url }),
        )
        .await?;
        Ok(())
    }

    async fn upload_recording(&self, task_id: &str, recording: &Recording) -> StoreResult<String> {
        let url = http_action_url(&self.base_url, UPLOAD_RECORDING_ROUTE)?;
        let part = reqwest::multipart::Part::bytes(recording.bytes.clone())
            .file_name(recording.file_name(task_id))
            .mime_str(&recording.content_type)?;
        let form = reqwest::multipart::Form::new()
            .text("agentId", task_id.to_string())
            .part("file", part);
        let response = self.client.post(url).multipart(form).send().await?;
        let http_status = response.status();
        if !http_status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(StoreError::Rejected {
                path: UPLOAD_RECORDING_ROUTE.to_string(),
                message: format!("status {http_status}: {}", message.trim()),
            });
        }
        let body: Value = response.json().await.map_err(|err| StoreError::Protocol {
            path: UPLOAD_RECORDING_ROUTE.to_string(),
            detail: err.to_string(),
        })?;
        body.get("recordingUrl")
            .and_then(Value::as_str)
            .filter(|u| !u.trim().is_empty())
            .map(str::to_string)
            .ok_or_else(|| StoreError::Protocol {
                path: UPLOAD_RECORDING_ROUTE.to_string(),
                detail: format!("expected a recordingUrl, got {body}"),
            })
    }

    async fn health(&self) -> StoreResult<StoreHealth> {
        let value = self.call("query", HEALTH_QUERY, json!({})).await?;
        Ok(StoreHealth {
            backend: "convex".to_string(),
            target: self.base_url.clone(),
            sessions_count: value.as_array().map(Vec::len).unwrap_or(0),
        })
    }
}

/// One call observed by [`MemoryStore`].
#[derive(Debug, Clone, PartialEq)]
pub enum StoreWrite {
    Created {
        task_id: String,
        session_id: String,
        name: String,
        model: String,
    },
    Status {
        task_id: String,
        status: TaskStatus,
        error: Option<String>,
    },
    Result {
        task_id: String,
        result: Value,
    },
    BrowserUrl {
        task_id: String,
        url: String,
    },
    Recording {
        task_id: String,
        file_name: String,
        size: usize,
        url: String,
    },
}

impl StoreWrite {
    pub fn task_id(&self) -> &str {
        match self {
            StoreWrite::Created { task_id, .. }
            | StoreWrite::Status { task_id, .. }
            | StoreWrite::Result { task_id, .. }
            | StoreWrite::BrowserUrl { task_id, .. }
            | StoreWrite::Recording { task_id, .. } => task_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            StoreWrite::Result { .. } => true,
            StoreWrite::Status { status, .. } => status.is_terminal(),
            _ => false,
        }
    }
}

/// Process-local store used when no remote store is configured, and as the
/// test double. Individual operations can be made to fail.
#[derive(Default)]
pub struct MemoryStore {
    writes: Mutex<Vec<StoreWrite>>,
    results: Mutex<HashMap<String, Value>>,
    fail_create: AtomicBool,
    fail_running: AtomicBool,
    fail_browser_url: AtomicBool,
    fail_terminal: AtomicBool,
    fail_recording: AtomicBool,
    create_calls: AtomicUsize,
    terminal_attempts: Mutex<HashMap<String, usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Only the `running` status write fails; terminal writes still land.
    pub fn fail_running(&self, fail: bool) {
        self.fail_running.store(fail, Ordering::SeqCst);
    }

    pub fn fail_browser_url(&self, fail: bool) {
        self.fail_browser_url.store(fail, Ordering::SeqCst);
    }

    /// Result writes and terminal status writes fail.
    pub fn fail_terminal(&self, fail: bool) {
        self.fail_terminal.store(fail, Ordering::SeqCst);
    }

    pub fn fail_recording(&self, fail: bool) {
        self.fail_recording.store(fail, Ordering::SeqCst);
    }

    /// Terminal writes tried for a task, including failed ones.
    pub fn terminal_attempts(&self, task_id: &str) -> usize {
        self.terminal_attempts
            .lock()
            .ok()
            .and_then(|a| a.get(task_id).copied())
            .unwrap_or(0)
    }

    pub fn writes(&self) -> Vec<StoreWrite> {
        self.writes.lock().map(|w| w.clone()).unwrap_or_default()
    }

    pub fn writes_for(&self, task_id: &str) -> Vec<StoreWrite> {
        self.writes()
            .into_iter()
            .filter(|w| w.task_id() == task_id)
            .collect()
    }

    pub fn terminal_writes(&self, task_id: &str) -> usize {
        self.writes_for(task_id)
            .iter()
            .filter(|w| w.is_terminal())
            .count()
    }

    pub fn result(&self, task_id: &str) -> Option<Value> {
        self.results
            .lock()
            .ok()
            .and_then(|r| r.get(task_id).cloned())
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    fn attempt_terminal(&self, task_id: &str) -> StoreResult<()> {
        if let Ok(mut attempts) = self.terminal_attempts.lock() {
            *attempts.entry(task_id.to_string()).or_default() += 1;
        }
        if self.fail_terminal.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("terminal writes disabled".to_string()));
        }
        Ok(())
    }

    fn record(&self, write: StoreWrite) {
        if let Ok(mut writes) = self.writes.lock() {
            writes.push(write);
        }
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn create_task(&self, record: &NewTaskRecord) -> StoreResult<String> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("create_task disabled".to_string()));
        }
        let task_id = format!("agent_{}", Uuid::new_v4().simple());
        self.record(StoreWrite::Created {
            task_id: task_id.clone(),
            session_id: record.session_id.clone(),
            name: record.name.clone(),
            model: record.model.clone(),
        });
        Ok(task_id)
    }

    async fn update_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> StoreResult<()> {
        if status == TaskStatus::Running && self.fail_running.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("running update disabled".to_string()));
        }
        if status.is_terminal() {
            self.attempt_terminal(task_id)?;
        }
        self.record(StoreWrite::Status {
            task_id: task_id.to_string(),
            status,
            error: error.map(str::to_string),
        });
        Ok(())
    }

    async fn write_result(&self, task_id: &str, result: &Value) -> StoreResult<()> {
        self.attempt_terminal(task_id)?;
        if let Ok(mut results) = self.results.lock() {
            results.insert(task_id.to_string(), result.clone());
        }
        self.record(StoreWrite::Result {
            task_id: task_id.to_string(),
            result: result.clone(),
        });
        Ok(())
    }

    async fn update_browser_url(&self, task_id: &str, url: &str) -> StoreResult<()> {
        if self.fail_browser_url.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("browser url update disabled".to_string()));
        }
        self.record(StoreWrite::BrowserUrl {
            task_id: task_id.to_string(),
            url: url.to_string(),
        });
        Ok(())
    }

    async fn upload_recording(&self, task_id: &str, recording: &Recording) -> StoreResult<String> {
        if self.fail_recording.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("recording upload disabled".to_string()));
        }
        let file_name = recording.file_name(task_id);
        let url = format!("memory://recordings/{file_name}");
        self.record(StoreWrite::Recording {
            task_id: task_id.to_string(),
            file_name,
            size: recording.bytes.len(),
            url: url.clone(),
        });
        Ok(url)
    }

    async fn health(&self) -> StoreResult<StoreHealth> {
        let sessions = self
            .writes()
            .iter()
            .filter_map(|w| match w {
                StoreWrite::Created { session_id, .. } => Some(session_id.clone()),
                _ => None,
            })
            .collect::<std::collections::HashSet<_>>();
        Ok(StoreHealth {
            backend: "memory".to_string(),
            target: "in-process".to_string(),
            sessions_count: sessions.len(),
        })
    }
}
