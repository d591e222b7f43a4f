use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use agentdock_types::{
    BrowserSession, DebugInfo, ProviderCredentials, ProviderInfo, RawValue, Recording, Usage,
};

use crate::{
    duration_between, normalize_base, parse_timestamp, send_json, wait_until_settled,
    AutomationProvider, RunRequest, RunResponse,
};

const DEFAULT_BASE_URL: &str = "https://api.notte.cc";
const VIEWER_BASE: &str = "https://api.notte.cc/sessions/viewer/index.html";
const USD_PER_CREDIT: f64 = 0.01;
const DEFAULT_REPLAY_TYPE: &str = "video/mp4";

pub struct NotteProvider {
    base_url: String,
    api_key: Option<String>,
    poll_interval: Duration,
    client: Client,
}

impl NotteProvider {
    pub fn new(url: Option<&str>, api_key: Option<String>, poll_interval_ms: Option<u64>) -> Self {
        Self {
            base_url: normalize_base(url.unwrap_or(DEFAULT_BASE_URL)),
            api_key,
            poll_interval: Duration::from_millis(poll_interval_ms.unwrap_or(2000)),
            client: Client::new(),
        }
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    async fn agent_status(&self, agent_id: &str) -> anyhow::Result<RunResponse> {
        let url = format!("{}/agents/{}", self.base_url, agent_id);
        let value = send_json("notte", self.authed(self.client.get(url))).await?;
        Ok(parse_agent_response(&value))
    }
}

#[async_trait]
impl AutomationProvider for NotteProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "notte".to_string(),
            name: "Notte".to_string(),
            answer_field: "answer".to_string(),
        }
    }

    // Notte sessions are billed to the server account.
    async fn create_session(
        &self,
        _credentials: &ProviderCredentials,
    ) -> anyhow::Result<BrowserSession> {
        let url = format!("{}/sessions/start", self.base_url);
        let value = send_json(
            "notte",
            self.authed(self.client.post(url).json(&json!({ "open_viewer": false }))),
        )
        .await?;
        let Some(id) = value
            .get("session_id")
            .or_else(|| value.get("id"))
            .and_then(Value::as_str)
        else {
            anyhow::bail!("notte session response did not include a session id");
        };
        let mut session = BrowserSession::new(id);
        session.cdp_url = value
            .get("cdp_url")
            .and_then(Value::as_str)
            .map(str::to_string);
        // The viewer is only known once debug info is ready.
        Ok(session)
    }

    async fn run_instruction(
        &self,
        session: &BrowserSession,
        request: RunRequest,
    ) -> anyhow::Result<RunResponse> {
        if !request.secrets.is_empty() || request.file_path.is_some() {
            tracing::debug!(
                task_id = %request.task_id,
                secret_count = request.secrets.len(),
                has_file = request.file_path.is_some(),
                "notte agents do not accept secrets or files; ignoring"
            );
        }
        let url = format!("{}/agents/start", self.base_url);
        let started = send_json(
            "notte",
            self.authed(self.client.post(url).json(&agent_start_body(session, &request))),
        )
        .await?;
        let Some(agent_id) = started
            .get("agent_id")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            anyhow::bail!("notte agent start response did not include an agent id");
        };

        let mut response =
            wait_until_settled(self.poll_interval, || self.agent_status(&agent_id)).await?;
        response.run_id.get_or_insert(agent_id);
        response.task.get_or_insert(request.instruction);
        Ok(response)
    }

    async fn poll_run(
        &self,
        run_id: &str,
        _credentials: &ProviderCredentials,
    ) -> anyhow::Result<Option<RunResponse>> {
        self.agent_status(run_id).await.map(Some)
    }

    async fn fetch_debug_info(&self, session: &BrowserSession) -> anyhow::Result<DebugInfo> {
        let url = format!("{}/sessions/{}/debug", self.base_url, session.id);
        let value = send_json("notte", self.authed(self.client.get(url))).await?;
        let ws = value.get("ws");
        let text = |v: Option<&Value>| {
            v.and_then(Value::as_str)
                .filter(|s| !s.trim().is_empty())
                .map(str::to_string)
        };
        Ok(DebugInfo {
            debug_url: text(value.get("debug_url")),
            recording_ws: text(ws.and_then(|w| w.get("recording"))),
            cdp_url: text(ws.and_then(|w| w.get("cdp"))),
        })
    }

    fn viewer_url(&self, session: &BrowserSession, debug: &DebugInfo) -> Option<String> {
        notte_viewer_url(debug, session.cdp_url.as_deref())
    }

    async fn fetch_recording(
        &self,
        session: &BrowserSession,
        _credentials: &ProviderCredentials,
    ) -> anyhow::Result<Option<Recording>> {
        let url = format!("{}/sessions/{}/replay", self.base_url, session.id);
        let response = self.authed(self.client.get(url)).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            anyhow::bail!("notte replay request failed with status {status}");
        }
        let content_type = replay_content_type(
            response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
        );
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(Recording {
            content_type,
            bytes: bytes.to_vec(),
        }))
    }

    async fn stop_session(
        &self,
        session: &BrowserSession,
        _credentials: &ProviderCredentials,
    ) -> anyhow::Result<()> {
        let url = format!("{}/sessions/{}/stop", self.base_url, session.id);
        send_json("notte", self.authed(self.client.delete(url))).await?;
        Ok(())
    }
}

fn agent_start_body(session: &BrowserSession, request: &RunRequest) -> Value {
    let mut body = json!({
        "task": request.instruction,
        "session_id": session.id,
        "reasoning_model": request.model.key(),
    });
    if let Some(route) = request.llm_route() {
        body["llm_api_key"] = json!(route.api_key);
        if let Some(base_url) = route.base_url {
            body["llm_base_url"] = json!(base_url);
        }
    }
    body
}

/// Replays without a usable media type are treated as mp4.
fn replay_content_type(header: Option<&str>) -> String {
    header
        .and_then(|raw| raw.split(';').next())
        .map(str::trim)
        .filter(|t| t.starts_with("video/") || t.starts_with("image/"))
        .unwrap_or(DEFAULT_REPLAY_TYPE)
        .to_string()
}

/// Picks the debug URL, then the recording websocket, then a recording
/// endpoint derived from the CDP URL.
pub fn notte_viewer_url(debug: &DebugInfo, session_cdp_url: Option<&str>) -> Option<String> {
    if let Some(url) = debug.debug_url.as_deref().filter(|u| !u.trim().is_empty()) {
        return Some(url.to_string());
    }
    if let Some(recording) = debug.recording_ws.as_deref().filter(|u| !u.trim().is_empty()) {
        return Some(format!("{VIEWER_BASE}?ws={recording}"));
    }
    let cdp = debug
        .cdp_url
        .as_deref()
        .or(session_cdp_url)
        .filter(|u| !u.trim().is_empty())?;
    let recording = match cdp.split_once('?') {
        Some((base, query)) => format!("{base}/recording?{query}"),
        None => format!("{cdp}/recording"),
    };
    Some(format!("{VIEWER_BASE}?ws={recording}"))
}

fn parse_agent_response(value: &Value) -> RunResponse {
    let str_field = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    let steps = value
        .get("steps")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let credits = value
        .get("credit_usage")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);

    let created_at = value.get("created_at").and_then(parse_timestamp);
    let closed_at = value.get("closed_at").and_then(parse_timestamp);
    let duration_secs = duration_between(created_at, closed_at);

    let raw = |key: &str| RawValue::from(value.get(key).cloned().unwrap_or(Value::Null));
    let metadata = RawValue::map([
        ("agentId", raw("agent_id")),
        ("sessionId", raw("session_id")),
        ("createdAt", RawValue::from(created_at)),
        ("closedAt", RawValue::from(closed_at)),
        ("replayStartOffset", raw("replay_start_offset")),
        ("replayStopOffset", raw("replay_stop_offset")),
        ("saved", raw("saved")),
    ]);

    RunResponse {
        run_id: str_field("agent_id"),
        status: str_field("status"),
        answer: str_field("answer").filter(|a| !a.is_empty()),
        success: value.get("success").and_then(Value::as_bool),
        task: str_field("task"),
        url: str_field("url"),
        duration_secs,
        usage: Usage {
            total_cost: Some(credits * USD_PER_CREDIT),
            credits: Some(credits),
            ..Default::default()
        },
        actions: Vec::new(),
        steps: steps.into_iter().map(RawValue::Json).collect(),
        metadata: Some(metadata),
    }
}
