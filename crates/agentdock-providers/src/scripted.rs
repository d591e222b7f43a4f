use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use agentdock_types::{
    BrowserSession, DebugInfo, ProviderCredentials, ProviderInfo, ProviderModel, RawValue,
    Recording, Usage,
};

use crate::{ActionRecord, AutomationProvider, LlmRoute, RunRequest, RunResponse};

/// Behaviour of one scripted instruction run.
#[derive(Debug, Clone)]
pub enum ScriptedRun {
    /// Echoes the instruction back as the answer.
    Echo,
    Answer {
        answer: String,
        usage: Usage,
    },
    /// Answer only reachable through the completion step in `steps`.
    Steps(Vec<Value>),
    /// Finished run with nothing to report.
    Empty,
    /// Settles with the given provider status and no answer.
    Unanswered(String),
    /// The run reports `active` with no answer until polled `ready_after`
    /// times.
    Pending {
        ready_after: usize,
        answer: String,
    },
    Fail(String),
    /// Never returns.
    Hang,
    Panic(String),
}

/// What the orchestrator handed to the adapter.
#[derive(Debug, Clone)]
pub struct RecordedRun {
    pub session_id: String,
    pub instruction: String,
    pub model: ProviderModel,
    pub secret_keys: Vec<String>,
    pub file_path: Option<PathBuf>,
    pub llm_route: Option<LlmRoute>,
}

/// In-process adapter that replays a queue of [`ScriptedRun`]s. With an
/// empty queue it echoes the instruction, which is what the `local`
/// adapter serves.
pub struct ScriptedProvider {
    id: String,
    answer_field: String,
    runs: Mutex<VecDeque<ScriptedRun>>,
    pending: Mutex<Option<(usize, String)>>,
    live_url: Option<String>,
    debug_failures: AtomicUsize,
    fail_sessions: AtomicBool,
    fail_stops: AtomicBool,
    recording: Option<Recording>,
    stopped: Mutex<HashSet<String>>,
    account_keys: Mutex<Vec<(&'static str, Option<String>)>>,
    recorded: Mutex<Vec<RecordedRun>>,
    sessions_created: AtomicUsize,
    sessions_stopped: AtomicUsize,
    debug_calls: AtomicUsize,
    poll_calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            answer_field: "answer".to_string(),
            runs: Mutex::new(VecDeque::new()),
            pending: Mutex::new(None),
            live_url: Some("http://127.0.0.1/live".to_string()),
            debug_failures: AtomicUsize::new(0),
            fail_sessions: AtomicBool::new(false),
            fail_stops: AtomicBool::new(false),
            recording: None,
            stopped: Mutex::new(HashSet::new()),
            account_keys: Mutex::new(Vec::new()),
            recorded: Mutex::new(Vec::new()),
            sessions_created: AtomicUsize::new(0),
            sessions_stopped: AtomicUsize::new(0),
            debug_calls: AtomicUsize::new(0),
            poll_calls: AtomicUsize::new(0),
        }
    }

    pub fn local() -> Self {
        Self::new("local")
    }

    pub fn with_answer_field(mut self, field: impl Into<String>) -> Self {
        self.answer_field = field.into();
        self
    }

    pub fn with_runs(self, runs: impl IntoIterator<Item = ScriptedRun>) -> Self {
        if let Ok(mut queue) = self.runs.lock() {
            queue.extend(runs);
        }
        self
    }

    /// Sessions start without a live URL, so the viewer has to come from
    /// debug info. The first `failures` debug-info calls fail.
    pub fn without_live_url(mut self, failures: usize) -> Self {
        self.live_url = None;
        self.debug_failures = AtomicUsize::new(failures);
        self
    }

    /// Sessions keep a replay until they are stopped.
    pub fn with_recording(mut self, content_type: &str, bytes: &[u8]) -> Self {
        self.recording = Some(Recording {
            content_type: content_type.to_string(),
            bytes: bytes.to_vec(),
        });
        self
    }

    pub fn fail_sessions(&self, fail: bool) {
        self.fail_sessions.store(fail, Ordering::SeqCst);
    }

    pub fn fail_stops(&self, fail: bool) {
        self.fail_stops.store(fail, Ordering::SeqCst);
    }

    pub fn recorded_runs(&self) -> Vec<RecordedRun> {
        self.recorded.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Browser-use account key seen by each session call, in call order.
    pub fn account_keys(&self) -> Vec<(&'static str, Option<String>)> {
        self.account_keys
            .lock()
            .map(|k| k.clone())
            .unwrap_or_default()
    }

    pub fn sessions_created(&self) -> usize {
        self.sessions_created.load(Ordering::SeqCst)
    }

    pub fn sessions_stopped(&self) -> usize {
        self.sessions_stopped.load(Ordering::SeqCst)
    }

    pub fn debug_calls(&self) -> usize {
        self.debug_calls.load(Ordering::SeqCst)
    }

    pub fn poll_calls(&self) -> usize {
        self.poll_calls.load(Ordering::SeqCst)
    }

    fn note_account_key(&self, call: &'static str, credentials: &ProviderCredentials) {
        if let Ok(mut keys) = self.account_keys.lock() {
            keys.push((
                call,
                credentials.for_provider("browser-use").map(str::to_string),
            ));
        }
    }

    fn next_run(&self) -> ScriptedRun {
        self.runs
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or(ScriptedRun::Echo)
    }

    fn finished(&self, answer: Option<String>, usage: Usage) -> RunResponse {
        RunResponse {
            run_id: None,
            status: Some("finished".to_string()),
            success: Some(answer.is_some()),
            answer,
            duration_secs: Some(0.0),
            usage,
            actions: vec![ActionRecord {
                is_done: Some(true),
                success: Some(true),
                ..ActionRecord::named("done")
            }],
            metadata: Some(RawValue::map([("adapter", RawValue::text(self.id.clone()))])),
            ..Default::default()
        }
    }
}

#[async_trait]
impl AutomationProvider for ScriptedProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id.clone(),
            name: format!("Scripted ({})", self.id),
            answer_field: self.answer_field.clone(),
        }
    }

    async fn create_session(
        &self,
        credentials: &ProviderCredentials,
    ) -> anyhow::Result<BrowserSession> {
        self.note_account_key("create", credentials);
        if self.fail_sessions.load(Ordering::SeqCst) {
            anyhow::bail!("scripted session creation failed");
        }
        let n = self.sessions_created.fetch_add(1, Ordering::SeqCst) + 1;
        let mut session = BrowserSession::new(format!("{}-session-{n}", self.id));
        session.live_url = self.live_url.clone();
        session.cdp_url = Some(format!("ws://127.0.0.1/{}-session-{n}", self.id));
        Ok(session)
    }

    async fn run_instruction(
        &self,
        session: &BrowserSession,
        request: RunRequest,
    ) -> anyhow::Result<RunResponse> {
        let mut secret_keys = request.secrets.keys().cloned().collect::<Vec<_>>();
        secret_keys.sort();
        if let Ok(mut recorded) = self.recorded.lock() {
            recorded.push(RecordedRun {
                session_id: session.id.clone(),
                instruction: request.instruction.clone(),
                model: request.model.clone(),
                secret_keys,
                file_path: request.file_path.clone(),
                llm_route: request.llm_route(),
            });
        }

        match self.next_run() {
            ScriptedRun::Echo => Ok(self.finished(
                Some(format!("Echo: {}", request.instruction)),
                Usage::default(),
            )),
            ScriptedRun::Answer { answer, usage } => Ok(self.finished(Some(answer), usage)),
            ScriptedRun::Steps(steps) => {
                let mut response = self.finished(None, Usage::default());
                response.success = None;
                response.steps = steps.into_iter().map(RawValue::Json).collect();
                Ok(response)
            }
            ScriptedRun::Empty => Ok(self.finished(None, Usage::default())),
            ScriptedRun::Unanswered(status) => {
                let mut response = self.finished(None, Usage::default());
                response.status = Some(status);
                response.success = Some(false);
                Ok(response)
            }
            ScriptedRun::Pending {
                ready_after,
                answer,
            } => {
                let run_id = format!("{}-run", session.id);
                if let Ok(mut pending) = self.pending.lock() {
                    *pending = Some((ready_after, answer));
                }
                Ok(RunResponse {
                    run_id: Some(run_id),
                    status: Some("active".to_string()),
                    ..Default::default()
                })
            }
            ScriptedRun::Fail(message) => Err(anyhow::anyhow!(message)),
            ScriptedRun::Hang => std::future::pending().await,
            ScriptedRun::Panic(message) => panic!("{message}"),
        }
    }

    async fn poll_run(
        &self,
        run_id: &str,
        credentials: &ProviderCredentials,
    ) -> anyhow::Result<Option<RunResponse>> {
        self.note_account_key("poll", credentials);
        let calls = self.poll_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let Some((ready_after, answer)) = self.pending.lock().ok().and_then(|p| p.clone()) else {
            return Ok(None);
        };
        if calls < ready_after {
            return Ok(Some(RunResponse {
                run_id: Some(run_id.to_string()),
                status: Some("active".to_string()),
                ..Default::default()
            }));
        }
        let mut response = self.finished(Some(answer), Usage::default());
        response.run_id = Some(run_id.to_string());
        Ok(Some(response))
    }

    async fn fetch_debug_info(&self, session: &BrowserSession) -> anyhow::Result<DebugInfo> {
        self.debug_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.debug_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.debug_failures.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("debug info for {} is not ready", session.id);
        }
        Ok(DebugInfo {
            debug_url: Some(format!("http://127.0.0.1/debug/{}", session.id)),
            ..Default::default()
        })
    }

    async fn fetch_recording(
        &self,
        session: &BrowserSession,
        _credentials: &ProviderCredentials,
    ) -> anyhow::Result<Option<Recording>> {
        let stopped = self
            .stopped
            .lock()
            .map(|s| s.contains(&session.id))
            .unwrap_or(false);
        if stopped {
            anyhow::bail!("session {} is already stopped", session.id);
        }
        Ok(self.recording.clone())
    }

    async fn stop_session(
        &self,
        session: &BrowserSession,
        credentials: &ProviderCredentials,
    ) -> anyhow::Result<()> {
        self.note_account_key("stop", credentials);
        if self.fail_stops.load(Ordering::SeqCst) {
            anyhow::bail!("scripted stop failed for {}", session.id);
        }
        if let Ok(mut stopped) = self.stopped.lock() {
            stopped.insert(session.id.clone());
        }
        self.sessions_stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn request(instruction: &str) -> RunRequest {
        RunRequest {
            task_id: "task-1".to_string(),
            instruction: instruction.to_string(),
            model: ProviderModel::baseline(),
            secrets: HashMap::from([("otp".to_string(), "123456".to_string())]),
            file_path: None,
            credentials: ProviderCredentials::default(),
        }
    }

    #[tokio::test]
    async fn empty_queue_echoes_instruction() {
        let provider = ScriptedProvider::local();
        let session = provider
            .create_session(&ProviderCredentials::default())
            .await
            .expect("session");
        let response = provider
            .run_instruction(&session, request("open example.com"))
            .await
            .expect("run");
        assert_eq!(response.answer.as_deref(), Some("Echo: open example.com"));
        let recorded = provider.recorded_runs();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].secret_keys, vec!["otp".to_string()]);
    }

    #[tokio::test]
    async fn pending_run_settles_after_polls() {
        let provider = ScriptedProvider::local().with_runs([ScriptedRun::Pending {
            ready_after: 3,
            answer: "ok".to_string(),
        }]);
        let session = provider
            .create_session(&ProviderCredentials::default())
            .await
            .expect("session");
        let first = provider
            .run_instruction(&session, request("x"))
            .await
            .expect("run");
        assert!(!first.is_settled());
        let run_id = first.run_id.expect("run id");

        let mut last = None;
        for _ in 0..3 {
            last = provider
                .poll_run(&run_id, &ProviderCredentials::default())
                .await
                .expect("poll");
        }
        let last = last.expect("response");
        assert!(last.is_settled());
        assert_eq!(last.answer.as_deref(), Some("ok"));
        assert_eq!(provider.poll_calls(), 3);
    }

    #[tokio::test]
    async fn debug_info_fails_configured_times() {
        let provider = ScriptedProvider::local().without_live_url(2);
        let session = provider
            .create_session(&ProviderCredentials::default())
            .await
            .expect("session");
        assert!(session.live_url.is_none());
        assert!(provider.fetch_debug_info(&session).await.is_err());
        assert!(provider.fetch_debug_info(&session).await.is_err());
        let info = provider.fetch_debug_info(&session).await.expect("debug");
        assert!(provider.viewer_url(&session, &info).is_some());
        assert_eq!(provider.debug_calls(), 3);
    }

    #[tokio::test]
    async fn recording_is_gone_once_the_session_stops() {
        let provider = ScriptedProvider::local().with_recording("video/mp4", b"frames");
        let credentials = ProviderCredentials {
            browser_use: Some("bu-user".to_string()),
            ..Default::default()
        };
        let session = provider.create_session(&credentials).await.expect("session");
        let recording = provider
            .fetch_recording(&session, &credentials)
            .await
            .expect("recording")
            .expect("present");
        assert_eq!(recording.bytes, b"frames".to_vec());
        provider.stop_session(&session, &credentials).await.expect("stop");
        assert!(provider.fetch_recording(&session, &credentials).await.is_err());
        assert_eq!(
            provider.account_keys(),
            vec![
                ("create", Some("bu-user".to_string())),
                ("stop", Some("bu-user".to_string())),
            ]
        );
    }
}
