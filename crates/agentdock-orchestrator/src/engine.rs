use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::Level;

use agentdock_core::{AppConfig, EventBus, FileRegistry, NewTaskRecord, TaskStore};
use agentdock_observability::{
    emit_event, secret_key_summary, ObservabilityEvent, ProcessKind,
};
use agentdock_providers::{
    is_failed_run_status, AutomationProvider, ProviderRegistry, RunRequest, RunResponse,
};
use agentdock_types::{
    BrowserSession, EngineEvent, FailureKind, ProviderCredentials, ProviderInfo, ProviderModel,
    RawValue, SessionCoordinates, TaskFailure, TaskStatus,
};

use crate::{
    extract_completion, poll_with_backoff, strip_selectors, to_json_safe, validate_instruction,
    AdmissionError, BackoffPolicy, CostAccountant, CostBreakdown, TaskSupervisor,
    DEFAULT_MAX_INSTRUCTION_LENGTH,
};

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_instruction_length: usize,
    /// `None` lets a run take as long as the provider does.
    pub task_deadline: Option<Duration>,
    pub status_poll_attempts: u32,
    pub status_poll_interval: Duration,
    pub debug_poll: BackoffPolicy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_instruction_length: DEFAULT_MAX_INSTRUCTION_LENGTH,
            task_deadline: Some(Duration::from_secs(1800)),
            status_poll_attempts: 10,
            status_poll_interval: Duration::from_secs(1),
            debug_poll: BackoffPolicy::default(),
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let limits = &config.limits;
        Self {
            max_instruction_length: limits.max_instruction_length,
            task_deadline: (limits.task_deadline_secs > 0)
                .then(|| Duration::from_secs(limits.task_deadline_secs)),
            status_poll_attempts: limits.status_poll_attempts,
            status_poll_interval: Duration::from_millis(limits.status_poll_interval_ms),
            debug_poll: BackoffPolicy::from(&config.debug_poll),
        }
    }
}

/// One submission as seen by the orchestrator. `instruction` is `None` when
/// the caller sent something that is not a string.
#[derive(Clone, Default)]
pub struct SubmitRequest {
    /// Adapter id, e.g. `browser-use`.
    pub provider: String,
    pub session_id: String,
    pub instruction: Option<String>,
    pub provider_model: Option<String>,
    pub browser_session: Option<SessionCoordinates>,
    pub credentials: ProviderCredentials,
    pub secrets: HashMap<String, String>,
    pub file_id: Option<String>,
    /// Existing task record to reuse instead of creating one.
    pub agent_id: Option<String>,
}

/// Returned to the caller as soon as work has been handed off.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Admission {
    pub session_id: String,
    pub agent_id: String,
    pub browser_session_id: String,
    pub live_url: String,
}

/// Last status written for a task. Only forward moves are accepted, so the
/// terminal update belongs to whichever path gets there first.
#[derive(Debug)]
pub struct StatusLatch(Mutex<TaskStatus>);

impl Default for StatusLatch {
    fn default() -> Self {
        Self(Mutex::new(TaskStatus::Queued))
    }
}

impl StatusLatch {
    pub fn advance(&self, next: TaskStatus) -> bool {
        let Ok(mut current) = self.0.lock() else {
            return false;
        };
        if !current.can_transition_to(next) {
            return false;
        }
        *current = next;
        true
    }
}

const RECORDING_FETCH_LIMIT: Duration = Duration::from_secs(120);

struct TaskJob {
    task_id: String,
    session_id: String,
    instruction: String,
    model: ProviderModel,
    provider: Arc<dyn AutomationProvider>,
    info: ProviderInfo,
    session: BrowserSession,
    secrets: HashMap<String, String>,
    file_path: Option<PathBuf>,
    credentials: ProviderCredentials,
    latch: Arc<StatusLatch>,
}

#[derive(Clone)]
pub struct TaskOrchestrator {
    providers: ProviderRegistry,
    store: Arc<dyn TaskStore>,
    files: FileRegistry,
    events: EventBus,
    supervisor: TaskSupervisor,
    costs: Arc<CostAccountant>,
    settings: Arc<OrchestratorSettings>,
    server_credentials: ProviderCredentials,
}

impl TaskOrchestrator {
    pub fn new(
        providers: ProviderRegistry,
        store: Arc<dyn TaskStore>,
        files: FileRegistry,
        events: EventBus,
        supervisor: TaskSupervisor,
        costs: CostAccountant,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            providers,
            store,
            files,
            events,
            supervisor,
            costs: Arc::new(costs),
            settings: Arc::new(settings),
            server_credentials: ProviderCredentials::default(),
        }
    }

    /// Credentials used when a submission does not carry its own.
    pub fn with_server_credentials(mut self, credentials: ProviderCredentials) -> Self {
        self.server_credentials = credentials;
        self
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn files(&self) -> &FileRegistry {
        &self.files
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn supervisor(&self) -> &TaskSupervisor {
        &self.supervisor
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Validates, acquires a browser session, creates (or reuses) the task
    /// record and hands execution to the supervisor. Never waits on the
    /// provider run itself.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Admission, AdmissionError> {
        let instruction = validate_instruction(
            request.instruction.as_deref(),
            self.settings.max_instruction_length,
        )?
        .to_string();

        let file_path = match request.file_id.as_deref().filter(|id| !id.trim().is_empty()) {
            Some(file_id) => match self.files.resolve(file_id).await {
                Some(file) => Some(file.server_path),
                None => return Err(AdmissionError::UnknownFile(file_id.to_string())),
            },
            None => None,
        };

        let provider = self
            .providers
            .get(&request.provider)
            .map_err(|err| AdmissionError::UnknownProvider(err.to_string()))?;
        let info = provider.info();
        let model = ProviderModel::parse(request.provider_model.as_deref().unwrap_or(""));
        let credentials = merge_credentials(&request.credentials, &self.server_credentials);

        let session = match request.browser_session.clone() {
            Some(coords) => provider.attach_session(coords).await,
            None => provider.create_session(&credentials).await,
        }
        .map_err(|err| AdmissionError::Session {
            provider: info.name.clone(),
            message: format!("{err:#}"),
        })?;

        let reused = request
            .agent_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        let task_id = match reused {
            Some(task_id) => task_id,
            None => {
                let record = NewTaskRecord {
                    session_id: request.session_id.clone(),
                    name: info.id.clone(),
                    model: model.key(),
                    browser_session_id: session.id.clone(),
                    browser_url: session.live_url().to_string(),
                };
                match self.store.create_task(&record).await {
                    Ok(task_id) => task_id,
                    Err(source) => {
                        release_session(provider.as_ref(), &session, &credentials, None).await;
                        return Err(AdmissionError::Store {
                            provider: info.name.clone(),
                            source,
                        });
                    }
                }
            }
        };

        let admission = Admission {
            session_id: request.session_id.clone(),
            agent_id: task_id.clone(),
            browser_session_id: session.id.clone(),
            live_url: session.live_url().to_string(),
        };

        let model_key = model.key();
        let secret_keys = secret_key_summary(request.secrets.keys());
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent::new("task.admitted", "orchestrator")
                .task(&task_id)
                .session(&request.session_id)
                .browser_session(&session.id)
                .provider(&info.id, &model_key)
                .status(TaskStatus::Queued.as_str())
                .detail(&secret_keys),
        );
        self.events.publish(EngineEvent::new(
            "task.admitted",
            json!({
                "agentId": task_id,
                "sessionId": request.session_id,
                "provider": info.id,
                "model": model_key,
                "browserSessionId": session.id,
                "liveUrl": session.live_url(),
            }),
        ));

        let latch = Arc::new(StatusLatch::default());
        let job = TaskJob {
            task_id: task_id.clone(),
            session_id: request.session_id,
            instruction,
            model,
            provider,
            info,
            session,
            secrets: request.secrets,
            file_path,
            credentials,
            latch: latch.clone(),
        };

        let worker = self.clone();
        let recovery = self.clone();
        let recovered_id = task_id.clone();
        self.supervisor.spawn(
            &task_id,
            async move { worker.execute(job).await },
            move |detail| async move {
                recovery
                    .finish_failed(&recovered_id, &latch, TaskFailure::panicked(detail))
                    .await;
            },
        );

        Ok(admission)
    }

    async fn execute(&self, job: TaskJob) {
        if job.latch.advance(TaskStatus::Running) {
            if let Err(err) = self
                .store
                .update_status(&job.task_id, TaskStatus::Running, None)
                .await
            {
                tracing::warn!(task_id = %job.task_id, "could not mark task running: {err}");
            }
            self.events.publish(EngineEvent::new(
                "task.running",
                json!({ "agentId": job.task_id, "sessionId": job.session_id }),
            ));
        }

        if job.session.live_url.is_none() {
            self.publish_viewer_url(&job).await;
        }

        let outcome = match self.settings.task_deadline {
            Some(limit) => tokio::time::timeout(limit, self.run_provider(&job))
                .await
                .unwrap_or_else(|_| Err(TaskFailure::timeout(limit.as_secs()))),
            None => self.run_provider(&job).await,
        };

        let browser_secs = job.session.elapsed_secs(Utc::now());
        self.capture_recording(&job).await;
        release_session(
            job.provider.as_ref(),
            &job.session,
            &job.credentials,
            Some(&job.task_id),
        )
        .await;

        match outcome {
            Ok(response) => self.finish_completed(&job, response, browser_secs).await,
            Err(failure) => self.finish_failed(&job.task_id, &job.latch, failure).await,
        }
    }

    /// Waits for post-hoc session metadata and stores the viewer URL derived
    /// from it.
    async fn publish_viewer_url(&self, job: &TaskJob) {
        let provider = &job.provider;
        let session = &job.session;
        let Some(debug) = poll_with_backoff(&self.settings.debug_poll, "debug_info", || {
            provider.fetch_debug_info(session)
        })
        .await
        else {
            tracing::warn!(task_id = %job.task_id, "no debug info; viewer url unavailable");
            return;
        };
        let Some(url) = provider
            .viewer_url(session, &debug)
            .filter(|url| !url.trim().is_empty())
        else {
            tracing::warn!(task_id = %job.task_id, "debug info carried no viewer url");
            return;
        };
        match self.store.update_browser_url(&job.task_id, &url).await {
            Ok(()) => {
                self.events.publish(EngineEvent::new(
                    "task.browser_url",
                    json!({ "agentId": job.task_id, "url": url }),
                ));
            }
            Err(err) => {
                tracing::warn!(task_id = %job.task_id, "could not store viewer url: {err}");
            }
        }
    }

    /// Uploads the session replay, if the adapter keeps one. Runs while the
    /// session is still open and never affects the task outcome.
    async fn capture_recording(&self, job: &TaskJob) {
        let fetched = tokio::time::timeout(
            RECORDING_FETCH_LIMIT,
            job.provider.fetch_recording(&job.session, &job.credentials),
        )
        .await;
        let recording = match fetched {
            Ok(Ok(Some(recording))) => recording,
            Ok(Ok(None)) => return,
            Ok(Err(err)) => {
                tracing::warn!(
                    task_id = %job.task_id,
                    "could not fetch session recording: {err:#}"
                );
                return;
            }
            Err(_) => {
                tracing::warn!(task_id = %job.task_id, "session recording fetch timed out");
                return;
            }
        };
        match self.store.upload_recording(&job.task_id, &recording).await {
            Ok(url) => {
                emit_event(
                    Level::INFO,
                    ProcessKind::Engine,
                    ObservabilityEvent::new("task.recording", "orchestrator")
                        .task(&job.task_id)
                        .browser_session(&job.session.id)
                        .status("stored")
                        .detail(&url),
                );
                self.events.publish(EngineEvent::new(
                    "task.recording",
                    json!({
                        "agentId": job.task_id,
                        "sessionId": job.session_id,
                        "url": url,
                    }),
                ));
            }
            Err(err) => {
                tracing::warn!(task_id = %job.task_id, "could not store session recording: {err}");
            }
        }
    }

    async fn run_provider(&self, job: &TaskJob) -> Result<RunResponse, TaskFailure> {
        let request = RunRequest {
            task_id: job.task_id.clone(),
            instruction: job.instruction.clone(),
            model: job.model.clone(),
            secrets: job.secrets.clone(),
            file_path: job.file_path.clone(),
            credentials: job.credentials.clone(),
        };
        tracing::info!(
            task_id = %job.task_id,
            provider = %job.info.id,
            model = %job.model,
            secrets = %secret_key_summary(job.secrets.keys()),
            "running instruction"
        );
        let response = job
            .provider
            .run_instruction(&job.session, request)
            .await
            .map_err(|err| TaskFailure::execution(format!("{err:#}")))?;
        Ok(self.follow_up(job, response).await)
    }

    /// Bounded status polling for runs that came back before settling. The
    /// latest response is accepted once polling ends either way.
    async fn follow_up(&self, job: &TaskJob, response: RunResponse) -> RunResponse {
        if response.is_settled() {
            return response;
        }
        let Some(run_id) = response.run_id.clone() else {
            return response;
        };
        let attempts = self.settings.status_poll_attempts;
        let mut latest = response;
        for attempt in 1..=attempts {
            match job.provider.poll_run(&run_id, &job.credentials).await {
                Ok(Some(polled)) => {
                    latest = polled;
                    if latest.is_settled() {
                        tracing::debug!(task_id = %job.task_id, attempt, "run settled");
                        return latest;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::debug!(task_id = %job.task_id, attempt, "status poll failed: {err}");
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.settings.status_poll_interval).await;
            }
        }
        tracing::warn!(
            task_id = %job.task_id,
            attempts,
            "run did not settle; accepting latest response"
        );
        latest
    }

    async fn finish_completed(&self, job: &TaskJob, response: RunResponse, browser_secs: f64) {
        let steps = response
            .steps
            .iter()
            .map(|step| strip_selectors(to_json_safe(step)))
            .collect::<Vec<_>>();

        let mut answer = response.answer.clone().filter(|a| !a.is_empty());
        let mut success = response.success;
        if answer.is_none() {
            if let Some(completion) = extract_completion(&steps) {
                answer = Some(completion.answer);
                success = completion.success.or(success);
            }
        }

        if !job.latch.advance(TaskStatus::Completed) {
            tracing::debug!(task_id = %job.task_id, "terminal update already written");
            return;
        }

        let model_key = job.model.key();
        let provider_status = response.status.as_deref();
        let Some(answer) = answer else {
            let note = provider_status
                .filter(|status| is_failed_run_status(status))
                .map(|status| format!("provider reported `{status}` without an answer"));
            tracing::warn!(
                task_id = %job.task_id,
                provider_status = provider_status.unwrap_or(""),
                "empty answer; writing status only"
            );
            if let Err(err) = self
                .store
                .update_status(&job.task_id, TaskStatus::Completed, note.as_deref())
                .await
            {
                tracing::error!(task_id = %job.task_id, "could not mark task completed: {err}");
            }
            self.announce_completed(job, &model_key, false, provider_status);
            return;
        };

        let costs = self
            .costs
            .account(&model_key, &response.usage, browser_secs);
        let payload = assemble_payload(
            &job.info,
            &response,
            PayloadParts {
                answer: &answer,
                success: success.unwrap_or(false),
                steps,
                costs,
            },
        );
        let result_written = match self.store.write_result(&job.task_id, &payload).await {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(task_id = %job.task_id, "could not store task result: {err}");
                false
            }
        };
        self.announce_completed(job, &model_key, result_written, provider_status);
    }

    fn announce_completed(
        &self,
        job: &TaskJob,
        model_key: &str,
        result_written: bool,
        provider_status: Option<&str>,
    ) {
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent::new("task.completed", "orchestrator")
                .task(&job.task_id)
                .session(&job.session_id)
                .browser_session(&job.session.id)
                .provider(&job.info.id, model_key)
                .status(TaskStatus::Completed.as_str()),
        );
        self.events.publish(EngineEvent::new(
            "task.completed",
            json!({
                "agentId": job.task_id,
                "sessionId": job.session_id,
                "resultWritten": result_written,
                "providerStatus": provider_status,
            }),
        ));
    }

    async fn finish_failed(&self, task_id: &str, latch: &StatusLatch, failure: TaskFailure) {
        if !latch.advance(TaskStatus::Failed) {
            tracing::debug!(task_id = %task_id, "terminal update already written");
            return;
        }
        if let Err(err) = self
            .store
            .update_status(task_id, TaskStatus::Failed, Some(&failure.message))
            .await
        {
            tracing::error!(task_id = %task_id, "could not mark task failed: {err}");
        }
        let level = match failure.kind {
            FailureKind::Execution => Level::WARN,
            FailureKind::Timeout | FailureKind::Panicked => Level::ERROR,
        };
        emit_event(
            level,
            ProcessKind::Engine,
            ObservabilityEvent::new("task.failed", "orchestrator")
                .task(task_id)
                .status(TaskStatus::Failed.as_str())
                .error_code(failure.kind.error_code())
                .detail(&failure.message),
        );
        self.events.publish(EngineEvent::new(
            "task.failed",
            json!({
                "agentId": task_id,
                "error": failure.message,
                "errorKind": failure.kind.as_str(),
            }),
        ));
    }
}

async fn release_session(
    provider: &dyn AutomationProvider,
    session: &BrowserSession,
    credentials: &ProviderCredentials,
    task_id: Option<&str>,
) {
    match provider.stop_session(session, credentials).await {
        Ok(()) => tracing::debug!(browser_session_id = %session.id, "browser session released"),
        Err(err) => tracing::warn!(
            browser_session_id = %session.id,
            task_id = task_id.unwrap_or(""),
            "failed to release browser session: {err:#}"
        ),
    }
}

fn merge_credentials(primary: &ProviderCredentials, fallback: &ProviderCredentials) -> ProviderCredentials {
    let pick = |a: &Option<String>, b: &Option<String>| {
        a.clone()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| b.clone())
    };
    ProviderCredentials {
        openai: pick(&primary.openai, &fallback.openai),
        google: pick(&primary.google, &fallback.google),
        anthropic: pick(&primary.anthropic, &fallback.anthropic),
        browser_use: pick(&primary.browser_use, &fallback.browser_use),
        openrouter: pick(&primary.openrouter, &fallback.openrouter),
    }
}

struct PayloadParts<'a> {
    answer: &'a str,
    success: bool,
    steps: Vec<Value>,
    costs: CostBreakdown,
}

/// Builds the terminal result document. The answer key is the adapter's.
fn assemble_payload(info: &ProviderInfo, response: &RunResponse, parts: PayloadParts<'_>) -> Value {
    let usage = &response.usage;
    let mut usage_json = json!({
        "totalTokens": usage.total_tokens,
        "in": usage.prompt_tokens,
        "out": usage.completion_tokens,
        "cached": usage.cached_prompt_tokens,
        "totalCost": parts.costs.total_cost,
        "llmCost": parts.costs.llm_cost,
        "browserCost": parts.costs.browser_cost,
    });
    if let Some(credits) = usage.credits {
        usage_json["credits"] = json!(credits);
    }
    if !parts.steps.is_empty() {
        usage_json["steps"] = json!(parts.steps.len());
    }

    let actions = response
        .actions
        .iter()
        .map(|action| {
            json!({
                "name": action.name,
                "result": to_json_safe(&RawValue::object(action.clone())),
            })
        })
        .collect::<Vec<_>>();

    let duration = response
        .duration_secs
        .filter(|d| d.is_finite())
        .map(|d| d.max(0.0))
        .unwrap_or(0.0);

    let mut payload = Map::new();
    payload.insert("agent".to_string(), json!(info.id));
    payload.insert("success".to_string(), json!(parts.success));
    payload.insert(info.answer_field.clone(), json!(parts.answer));
    payload.insert("duration".to_string(), json!(duration));
    payload.insert("usage".to_string(), usage_json);
    payload.insert("actions".to_string(), Value::Array(actions));
    if let Some(status) = &response.status {
        payload.insert("status".to_string(), json!(status));
    }
    if let Some(task) = &response.task {
        payload.insert("task".to_string(), json!(task));
    }
    if let Some(url) = &response.url {
        payload.insert("url".to_string(), json!(url));
    }
    if !parts.steps.is_empty() {
        payload.insert("steps".to_string(), Value::Array(parts.steps));
    }
    if let Some(metadata) = &response.metadata {
        payload.insert("metadata".to_string(), to_json_safe(metadata));
    }
    strip_selectors(Value::Object(payload))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use agentdock_core::{MemoryStore, StoreWrite};
    use agentdock_providers::{ScriptedProvider, ScriptedRun};
    use agentdock_types::Usage;
    use tokio::sync::broadcast;

    use super::*;
    use crate::{PriceTable, DEFAULT_BROWSER_HOURLY_RATE};

    struct Harness {
        orchestrator: TaskOrchestrator,
        provider: Arc<ScriptedProvider>,
        store: Arc<MemoryStore>,
        events: broadcast::Receiver<EngineEvent>,
        _uploads: tempfile::TempDir,
    }

    fn harness_with(provider: ScriptedProvider, settings: OrchestratorSettings) -> Harness {
        let provider = Arc::new(provider);
        let store = Arc::new(MemoryStore::new());
        let uploads = tempfile::tempdir().expect("tempdir");
        let events = EventBus::new();
        let receiver = events.subscribe();
        let orchestrator = TaskOrchestrator::new(
            ProviderRegistry::with_providers(vec![provider.clone() as Arc<dyn AutomationProvider>]),
            store.clone(),
            FileRegistry::new(uploads.path(), Duration::from_secs(3600), 1024 * 1024),
            events,
            TaskSupervisor::new(4),
            CostAccountant::new(PriceTable::builtin(), DEFAULT_BROWSER_HOURLY_RATE),
            settings,
        );
        Harness {
            orchestrator,
            provider,
            store,
            events: receiver,
            _uploads: uploads,
        }
    }

    fn fast_settings() -> OrchestratorSettings {
        OrchestratorSettings {
            status_poll_interval: Duration::from_millis(5),
            debug_poll: BackoffPolicy {
                max_attempts: 10,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                multiplier: 1.5,
            },
            ..OrchestratorSettings::default()
        }
    }

    fn harness(provider: ScriptedProvider) -> Harness {
        harness_with(provider, fast_settings())
    }

    fn submission(instruction: &str) -> SubmitRequest {
        SubmitRequest {
            provider: "local".to_string(),
            session_id: "session-1".to_string(),
            instruction: Some(instruction.to_string()),
            ..Default::default()
        }
    }

    async fn wait_terminal(events: &mut broadcast::Receiver<EngineEvent>, task_id: &str) -> EngineEvent {
        tokio::time::timeout(Duration::from_secs(3600), async {
            loop {
                let event = events.recv().await.expect("event stream open");
                let terminal = matches!(event.event_type.as_str(), "task.completed" | "task.failed");
                if terminal && event.task_id() == Some(task_id) {
                    return event;
                }
            }
        })
        .await
        .expect("task reached a terminal state")
    }

    #[tokio::test]
    async fn empty_provider_model_runs_on_baseline() {
        let mut h = harness(ScriptedProvider::local());
        let admission = h
            .orchestrator
            .submit(submission("find the weather"))
            .await
            .expect("admitted");
        assert_eq!(admission.session_id, "session-1");
        assert_eq!(admission.live_url, "http://127.0.0.1/live");
        assert!(admission.browser_session_id.starts_with("local-session-"));

        let event = wait_terminal(&mut h.events, &admission.agent_id).await;
        assert_eq!(event.event_type, "task.completed");

        let runs = h.provider.recorded_runs();
        assert_eq!(runs[0].model, ProviderModel::baseline());
        let writes = h.store.writes_for(&admission.agent_id);
        assert!(matches!(
            &writes[0],
            StoreWrite::Created { model, name, .. } if model == "browser-use/bu-1.0" && name == "local"
        ));
        assert!(matches!(
            &writes[1],
            StoreWrite::Status { status: TaskStatus::Running, .. }
        ));
        let result = h.store.result(&admission.agent_id).expect("result written");
        assert_eq!(result["answer"], "Echo: find the weather");
        assert_eq!(result["agent"], "local");
        assert_eq!(result["actions"][0]["result"]["isDone"], true);
        for key in ["totalTokens", "in", "out", "cached", "totalCost", "llmCost", "browserCost"] {
            assert!(result["usage"].get(key).is_some(), "usage.{key} missing");
        }
        assert_eq!(h.store.terminal_writes(&admission.agent_id), 1);
        assert_eq!(h.provider.sessions_stopped(), 1);
    }

    #[tokio::test]
    async fn invalid_instruction_creates_nothing() {
        let h = harness(ScriptedProvider::local());
        for bad in [None, Some(String::new()), Some("   ".to_string()), Some("x".repeat(5001))] {
            let err = h
                .orchestrator
                .submit(SubmitRequest {
                    instruction: bad,
                    ..submission("")
                })
                .await
                .expect_err("rejected");
            assert_eq!(err.status_code(), 400);
        }
        assert_eq!(h.store.create_calls(), 0);
        assert_eq!(h.provider.sessions_created(), 0);
    }

    #[tokio::test]
    async fn unknown_adapter_is_a_client_error() {
        let h = harness(ScriptedProvider::local());
        let err = h
            .orchestrator
            .submit(SubmitRequest {
                provider: "skyvern".to_string(),
                ..submission("go")
            })
            .await
            .expect_err("rejected");
        assert!(matches!(err, AdmissionError::UnknownProvider(_)));
        assert_eq!(h.store.create_calls(), 0);
    }

    #[tokio::test]
    async fn unknown_file_is_rejected_before_any_record() {
        let h = harness(ScriptedProvider::local());
        let err = h
            .orchestrator
            .submit(SubmitRequest {
                file_id: Some("nope".to_string()),
                ..submission("read the file")
            })
            .await
            .expect_err("rejected");
        assert_eq!(err.status_code(), 400);
        assert_eq!(h.store.create_calls(), 0);
        assert_eq!(h.provider.sessions_created(), 0);
    }

    #[tokio::test]
    async fn uploaded_file_path_reaches_the_adapter() {
        let mut h = harness(ScriptedProvider::local());
        let file = h
            .orchestrator
            .files()
            .persist("list.csv", b"a,b\n1,2\n")
            .await
            .expect("upload");
        let admission = h
            .orchestrator
            .submit(SubmitRequest {
                file_id: Some(file.file_id.clone()),
                ..submission("summarize the file")
            })
            .await
            .expect("admitted");
        wait_terminal(&mut h.events, &admission.agent_id).await;
        assert_eq!(
            h.provider.recorded_runs()[0].file_path.as_deref(),
            Some(file.server_path.as_path())
        );
    }

    #[tokio::test]
    async fn session_failure_aborts_admission() {
        let h = harness(ScriptedProvider::local());
        h.provider.fail_sessions(true);
        let err = h
            .orchestrator
            .submit(submission("go"))
            .await
            .expect_err("rejected");
        assert_eq!(err.status_code(), 500);
        assert!(err.to_string().starts_with("Failed to start Scripted (local) agent:"));
        assert_eq!(h.store.create_calls(), 0);
    }

    #[tokio::test]
    async fn store_failure_releases_the_new_session() {
        let h = harness(ScriptedProvider::local());
        h.store.fail_create(true);
        let err = h
            .orchestrator
            .submit(submission("go"))
            .await
            .expect_err("rejected");
        assert!(matches!(err, AdmissionError::Store { .. }));
        assert_eq!(h.provider.sessions_created(), 1);
        assert_eq!(h.provider.sessions_stopped(), 1);
    }

    #[tokio::test]
    async fn empty_answer_completes_with_status_only() {
        let mut h = harness(ScriptedProvider::local().with_runs([ScriptedRun::Empty]));
        let admission = h.orchestrator.submit(submission("go")).await.expect("admitted");
        let event = wait_terminal(&mut h.events, &admission.agent_id).await;
        assert_eq!(event.properties["resultWritten"], false);
        assert!(h.store.result(&admission.agent_id).is_none());
        let writes = h.store.writes_for(&admission.agent_id);
        assert!(matches!(
            writes.last(),
            Some(StoreWrite::Status { status: TaskStatus::Completed, error: None, .. })
        ));
        assert_eq!(h.store.terminal_writes(&admission.agent_id), 1);
    }

    #[tokio::test]
    async fn running_write_failure_is_tolerated() {
        let mut h = harness(ScriptedProvider::local());
        h.store.fail_running(true);
        let admission = h.orchestrator.submit(submission("go")).await.expect("admitted");
        wait_terminal(&mut h.events, &admission.agent_id).await;
        assert!(h.store.result(&admission.agent_id).is_some());
    }

    #[tokio::test]
    async fn provider_error_fails_task_once() {
        let mut h = harness(
            ScriptedProvider::local().with_runs([ScriptedRun::Fail("captcha wall".to_string())]),
        );
        let admission = h.orchestrator.submit(submission("go")).await.expect("admitted");
        let event = wait_terminal(&mut h.events, &admission.agent_id).await;
        assert_eq!(event.event_type, "task.failed");
        assert_eq!(event.properties["errorKind"], "execution");
        let writes = h.store.writes_for(&admission.agent_id);
        assert!(writes.iter().any(|w| matches!(
            w,
            StoreWrite::Status { status: TaskStatus::Failed, error: Some(e), .. } if e == "captcha wall"
        )));
        assert_eq!(h.store.terminal_writes(&admission.agent_id), 1);
        assert_eq!(h.provider.sessions_stopped(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_run_times_out() {
        let settings = OrchestratorSettings {
            task_deadline: Some(Duration::from_secs(30)),
            ..fast_settings()
        };
        let mut h = harness_with(
            ScriptedProvider::local().with_runs([ScriptedRun::Hang]),
            settings,
        );
        let admission = h.orchestrator.submit(submission("go")).await.expect("admitted");
        let event = wait_terminal(&mut h.events, &admission.agent_id).await;
        assert_eq!(event.properties["errorKind"], "timeout");
        assert_eq!(h.store.terminal_writes(&admission.agent_id), 1);
    }

    #[tokio::test]
    async fn worker_panic_fails_task() {
        let mut h = harness(
            ScriptedProvider::local().with_runs([ScriptedRun::Panic("sdk bug".to_string())]),
        );
        let admission = h.orchestrator.submit(submission("go")).await.expect("admitted");
        let event = wait_terminal(&mut h.events, &admission.agent_id).await;
        assert_eq!(event.properties["errorKind"], "panicked");
        let writes = h.store.writes_for(&admission.agent_id);
        assert!(writes.iter().any(|w| matches!(
            w,
            StoreWrite::Status { status: TaskStatus::Failed, error: Some(e), .. } if e.contains("sdk bug")
        )));
        assert_eq!(h.store.terminal_writes(&admission.agent_id), 1);
    }

    #[tokio::test]
    async fn unsettled_run_is_polled_until_it_settles() {
        let mut h = harness(ScriptedProvider::local().with_runs([ScriptedRun::Pending {
            ready_after: 3,
            answer: "booked".to_string(),
        }]));
        let admission = h.orchestrator.submit(submission("go")).await.expect("admitted");
        wait_terminal(&mut h.events, &admission.agent_id).await;
        assert_eq!(h.provider.poll_calls(), 3);
        let result = h.store.result(&admission.agent_id).expect("result");
        assert_eq!(result["answer"], "booked");
    }

    #[tokio::test]
    async fn never_settling_run_is_accepted_after_bounded_polls() {
        let mut h = harness(ScriptedProvider::local().with_runs([ScriptedRun::Pending {
            ready_after: 100,
            answer: "late".to_string(),
        }]));
        let admission = h.orchestrator.submit(submission("go")).await.expect("admitted");
        let event = wait_terminal(&mut h.events, &admission.agent_id).await;
        assert_eq!(h.provider.poll_calls(), 10);
        assert_eq!(event.event_type, "task.completed");
        assert!(h.store.result(&admission.agent_id).is_none());
    }

    #[tokio::test]
    async fn missing_live_url_is_filled_from_debug_info() {
        let mut h = harness(ScriptedProvider::local().without_live_url(2));
        let admission = h.orchestrator.submit(submission("go")).await.expect("admitted");
        assert_eq!(admission.live_url, "");
        wait_terminal(&mut h.events, &admission.agent_id).await;
        assert_eq!(h.provider.debug_calls(), 3);
        let writes = h.store.writes_for(&admission.agent_id);
        let expected = format!("http://127.0.0.1/debug/{}", admission.browser_session_id);
        assert!(writes.iter().any(|w| matches!(
            w,
            StoreWrite::BrowserUrl { url, .. } if *url == expected
        )));
    }

    #[tokio::test]
    async fn completion_step_supplies_missing_answer() {
        let steps = vec![json!({
            "type": "agent_completion",
            "value": {"action": {"type": "completion", "answer": "done", "success": true,
                                  "selector": "#submit"}}
        })];
        let mut h = harness(ScriptedProvider::local().with_runs([ScriptedRun::Steps(steps)]));
        let admission = h.orchestrator.submit(submission("go")).await.expect("admitted");
        wait_terminal(&mut h.events, &admission.agent_id).await;
        let result = h.store.result(&admission.agent_id).expect("result");
        assert_eq!(result["answer"], "done");
        assert_eq!(result["success"], true);
        assert!(result["steps"][0]["value"]["action"].get("selector").is_none());
        assert_eq!(result["usage"]["steps"], 1);
    }

    #[tokio::test]
    async fn openrouter_model_and_answer_field_flow_through() {
        let mut h = harness(
            ScriptedProvider::local()
                .with_answer_field("finalResult")
                .with_runs([ScriptedRun::Answer {
                    answer: "3 results".to_string(),
                    usage: Usage {
                        prompt_tokens: 1000,
                        completion_tokens: 100,
                        ..Default::default()
                    },
                }]),
        );
        let admission = h
            .orchestrator
            .submit(SubmitRequest {
                provider_model: Some("openrouter/moonshotai/kimi-k2".to_string()),
                secrets: HashMap::from([("password".to_string(), "hunter2".to_string())]),
                ..submission("search")
            })
            .await
            .expect("admitted");
        wait_terminal(&mut h.events, &admission.agent_id).await;

        let run = &h.provider.recorded_runs()[0];
        assert_eq!(run.model.provider, "openrouter");
        assert_eq!(run.model.model, "moonshotai/kimi-k2");
        assert_eq!(run.secret_keys, vec!["password".to_string()]);

        let result = h.store.result(&admission.agent_id).expect("result");
        assert_eq!(result["finalResult"], "3 results");
        assert!(result.get("answer").is_none());
        let llm = result["usage"]["llmCost"].as_f64().expect("llm cost");
        assert!((llm - 0.0008).abs() < 1e-12);
    }

    #[tokio::test]
    async fn existing_record_and_session_are_reused() {
        let mut h = harness(ScriptedProvider::local());
        let admission = h
            .orchestrator
            .submit(SubmitRequest {
                agent_id: Some("agent_existing".to_string()),
                browser_session: Some(SessionCoordinates {
                    browser_session_id: "caller-session".to_string(),
                    cdp_url: Some("ws://cdp".to_string()),
                    live_url: Some("https://live".to_string()),
                }),
                ..submission("go")
            })
            .await
            .expect("admitted");
        assert_eq!(admission.agent_id, "agent_existing");
        assert_eq!(admission.browser_session_id, "caller-session");
        assert_eq!(admission.live_url, "https://live");
        wait_terminal(&mut h.events, "agent_existing").await;
        assert_eq!(h.store.create_calls(), 0);
        assert_eq!(h.provider.sessions_created(), 0);
        assert!(h.store.result("agent_existing").is_some());
    }

    #[test]
    fn latch_only_moves_forward() {
        let latch = StatusLatch::default();
        assert!(latch.advance(TaskStatus::Running));
        assert!(!latch.advance(TaskStatus::Running));
        assert!(latch.advance(TaskStatus::Completed));
        assert!(!latch.advance(TaskStatus::Failed));

        let failed_early = StatusLatch::default();
        assert!(failed_early.advance(TaskStatus::Failed));
        assert!(!failed_early.advance(TaskStatus::Running));
    }

    #[tokio::test]
    async fn release_failure_does_not_change_outcome() {
        let mut h = harness(ScriptedProvider::local());
        h.provider.fail_stops(true);
        let admission = h.orchestrator.submit(submission("go")).await.expect("admitted");
        let event = wait_terminal(&mut h.events, &admission.agent_id).await;
        assert_eq!(event.event_type, "task.completed");
        assert_eq!(event.properties["resultWritten"], true);
        assert_eq!(h.store.terminal_writes(&admission.agent_id), 1);
        assert_eq!(h.provider.sessions_stopped(), 0);
    }

    #[tokio::test]
    async fn terminal_write_failure_is_logged_not_retried() {
        let mut h = harness(ScriptedProvider::local());
        h.store.fail_terminal(true);
        let admission = h.orchestrator.submit(submission("go")).await.expect("admitted");
        let event = wait_terminal(&mut h.events, &admission.agent_id).await;
        assert_eq!(event.event_type, "task.completed");
        assert_eq!(event.properties["resultWritten"], false);
        assert_eq!(h.store.terminal_attempts(&admission.agent_id), 1);
        assert_eq!(h.store.terminal_writes(&admission.agent_id), 0);
        assert_eq!(h.provider.sessions_stopped(), 1);
    }

    #[tokio::test]
    async fn failed_status_write_failure_is_not_retried() {
        let mut h = harness(
            ScriptedProvider::local().with_runs([ScriptedRun::Fail("blocked".to_string())]),
        );
        h.store.fail_terminal(true);
        let admission = h.orchestrator.submit(submission("go")).await.expect("admitted");
        let event = wait_terminal(&mut h.events, &admission.agent_id).await;
        assert_eq!(event.event_type, "task.failed");
        assert_eq!(h.store.terminal_attempts(&admission.agent_id), 1);
    }

    #[tokio::test]
    async fn browser_url_write_failure_is_tolerated() {
        let mut h = harness(ScriptedProvider::local().without_live_url(0));
        h.store.fail_browser_url(true);
        let mut viewer_events = h.orchestrator.events().subscribe();
        let admission = h.orchestrator.submit(submission("go")).await.expect("admitted");
        let event = wait_terminal(&mut h.events, &admission.agent_id).await;
        assert_eq!(event.event_type, "task.completed");
        assert!(h.store.result(&admission.agent_id).is_some());
        assert_eq!(h.provider.debug_calls(), 1);
        assert!(!h
            .store
            .writes_for(&admission.agent_id)
            .iter()
            .any(|w| matches!(w, StoreWrite::BrowserUrl { .. })));
        while let Ok(seen) = viewer_events.try_recv() {
            assert_ne!(seen.event_type, "task.browser_url");
        }
    }

    #[tokio::test]
    async fn failed_provider_status_without_answer_is_kept() {
        let mut h = harness(
            ScriptedProvider::local().with_runs([ScriptedRun::Unanswered("failed".to_string())]),
        );
        let admission = h.orchestrator.submit(submission("go")).await.expect("admitted");
        let event = wait_terminal(&mut h.events, &admission.agent_id).await;
        assert_eq!(event.event_type, "task.completed");
        assert_eq!(event.properties["resultWritten"], false);
        assert_eq!(event.properties["providerStatus"], "failed");
        let writes = h.store.writes_for(&admission.agent_id);
        assert!(matches!(
            writes.last(),
            Some(StoreWrite::Status { status: TaskStatus::Completed, error: Some(note), .. })
                if note.contains("failed")
        ));
        assert_eq!(h.store.terminal_writes(&admission.agent_id), 1);
    }

    #[tokio::test]
    async fn caller_credentials_reach_every_adapter_call() {
        let mut h = harness(ScriptedProvider::local().with_runs([ScriptedRun::Pending {
            ready_after: 1,
            answer: "booked".to_string(),
        }]));
        let orchestrator = h.orchestrator.clone().with_server_credentials(ProviderCredentials {
            browser_use: Some("bu-server".to_string()),
            openrouter: Some("or-server".to_string()),
            ..Default::default()
        });
        let admission = orchestrator
            .submit(SubmitRequest {
                provider_model: Some("openrouter/moonshotai/kimi-k2".to_string()),
                credentials: ProviderCredentials {
                    browser_use: Some("bu-user".to_string()),
                    ..Default::default()
                },
                ..submission("book a table")
            })
            .await
            .expect("admitted");
        wait_terminal(&mut h.events, &admission.agent_id).await;

        let user_key = Some("bu-user".to_string());
        assert_eq!(
            h.provider.account_keys(),
            vec![
                ("create", user_key.clone()),
                ("poll", user_key.clone()),
                ("stop", user_key),
            ]
        );
        let route = h.provider.recorded_runs()[0]
            .llm_route
            .clone()
            .expect("llm route");
        assert_eq!(route.api_key, "or-server");
        assert_eq!(route.base_url.as_deref(), Some("https://openrouter.ai/api/v1"));
    }

    #[tokio::test]
    async fn recording_is_stored_before_the_session_is_released() {
        let mut h = harness(ScriptedProvider::local().with_recording("video/mp4", b"frames"));
        let mut recording_events = h.orchestrator.events().subscribe();
        let admission = h.orchestrator.submit(submission("go")).await.expect("admitted");
        wait_terminal(&mut h.events, &admission.agent_id).await;

        let writes = h.store.writes_for(&admission.agent_id);
        let recording_at = writes
            .iter()
            .position(|w| matches!(w, StoreWrite::Recording { size: 6, .. }))
            .expect("recording stored");
        let result_at = writes
            .iter()
            .position(|w| matches!(w, StoreWrite::Result { .. }))
            .expect("result stored");
        assert!(recording_at < result_at);
        assert_eq!(h.provider.sessions_stopped(), 1);

        let event = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = recording_events.recv().await.expect("event stream open");
                if event.event_type == "task.recording" {
                    return event;
                }
            }
        })
        .await
        .expect("recording event");
        let expected = format!("memory://recordings/recording-{}.mp4", admission.agent_id);
        assert_eq!(event.properties["url"], expected);
    }

    #[tokio::test]
    async fn recording_upload_failure_is_tolerated() {
        let mut h = harness(ScriptedProvider::local().with_recording("video/mp4", b"frames"));
        h.store.fail_recording(true);
        let admission = h.orchestrator.submit(submission("go")).await.expect("admitted");
        let event = wait_terminal(&mut h.events, &admission.agent_id).await;
        assert_eq!(event.event_type, "task.completed");
        assert!(h.store.result(&admission.agent_id).is_some());
        assert_eq!(h.provider.sessions_stopped(), 1);
    }

    #[test]
    fn request_credentials_override_server_ones() {
        let request = ProviderCredentials {
            openai: Some("sk-user".to_string()),
            google: Some("  ".to_string()),
            ..Default::default()
        };
        let server = ProviderCredentials {
            openai: Some("sk-server".to_string()),
            google: Some("g-server".to_string()),
            ..Default::default()
        };
        let merged = merge_credentials(&request, &server);
        assert_eq!(merged.openai.as_deref(), Some("sk-user"));
        assert_eq!(merged.google.as_deref(), Some("g-server"));
        assert!(merged.anthropic.is_none());
    }

    #[test]
    fn settings_follow_config() {
        let mut config = AppConfig::default();
        config.limits.task_deadline_secs = 0;
        config.limits.status_poll_attempts = 3;
        let settings = OrchestratorSettings::from_config(&config);
        assert!(settings.task_deadline.is_none());
        assert_eq!(settings.status_poll_attempts, 3);
        assert_eq!(settings.debug_poll, BackoffPolicy::default());
    }
}
