use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Map, Value};

use agentdock_types::{
    BrowserSession, ProviderCredentials, ProviderInfo, ProviderModel, RawValue, Usage,
};

use crate::{
    duration_between, normalize_base, parse_timestamp, send_json, wait_until_settled,
    ActionRecord, AutomationProvider, RunRequest, RunResponse,
};

const DEFAULT_BASE_URL: &str = "https://api.browser-use.com/api/v2";
const API_KEY_HEADER: &str = "X-Browser-Use-API-Key";

pub struct BrowserUseProvider {
    base_url: String,
    api_key: Option<String>,
    poll_interval: Duration,
    client: Client,
}

impl BrowserUseProvider {
    pub fn new(url: Option<&str>, api_key: Option<String>, poll_interval_ms: Option<u64>) -> Self {
        Self {
            base_url: normalize_base(url.unwrap_or(DEFAULT_BASE_URL)),
            api_key,
            poll_interval: Duration::from_millis(poll_interval_ms.unwrap_or(2000)),
            client: Client::new(),
        }
    }

    fn authed(
        &self,
        req: reqwest::RequestBuilder,
        key_override: Option<&str>,
    ) -> reqwest::RequestBuilder {
        match key_override.or(self.api_key.as_deref()) {
            Some(key) => req.header(API_KEY_HEADER, key),
            None => req,
        }
    }

    /// Per-call account key first, then the configured one.
    fn account_key(credentials: &ProviderCredentials) -> Option<&str> {
        credentials.for_provider("browser-use")
    }

    fn create_session_request(&self, credentials: &ProviderCredentials) -> reqwest::RequestBuilder {
        let url = format!("{}/sessions", self.base_url);
        self.authed(self.client.post(url).json(&json!({})), Self::account_key(credentials))
    }

    fn stop_session_request(
        &self,
        session: &BrowserSession,
        credentials: &ProviderCredentials,
    ) -> reqwest::RequestBuilder {
        let url = format!("{}/sessions/{}", self.base_url, session.id);
        self.authed(
            self.client.patch(url).json(&json!({ "action": "stop" })),
            Self::account_key(credentials),
        )
    }

    async fn task_view(&self, task_id: &str, key: Option<&str>) -> anyhow::Result<RunResponse> {
        let url = format!("{}/tasks/{}", self.base_url, task_id);
        let value = send_json("browser-use", self.authed(self.client.get(url), key)).await?;
        Ok(parse_task_view(&value))
    }

    /// Uploads a local file into the session's workspace and returns the
    /// name the agent can refer to.
    async fn upload_file(
        &self,
        session_id: &str,
        path: &Path,
        key: Option<&str>,
    ) -> anyhow::Result<String> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload.bin")
            .to_string();
        let content_type = upload_content_type(&file_name);
        let url = format!("{}/files/sessions/{}/presigned-url", self.base_url, session_id);
        let presigned = send_json(
            "browser-use",
            self.authed(
                self.client.post(url).json(&json!({
                    "fileName": file_name,
                    "contentType": &content_type,
                    "sizeBytes": bytes.len(),
                })),
                key,
            ),
        )
        .await?;
        let Some(target) = presigned.get("url").and_then(Value::as_str) else {
            anyhow::bail!("browser-use presigned upload response did not include a url");
        };

        let fields = presigned
            .get("fields")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let request = if fields.is_empty() {
            self.client
                .put(target)
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .body(bytes)
        } else {
            let mut form = reqwest::multipart::Form::new();
            for (name, value) in fields {
                let value = value
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| value.to_string());
                form = form.text(name, value);
            }
            let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name.clone());
            self.client.post(target).multipart(form.part("file", part))
        };
        let response = request.send().await?;
        if !response.status().is_success() {
            anyhow::bail!("browser-use file upload failed with status {}", response.status());
        }

        Ok(presigned
            .get("fileName")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(file_name))
    }
}

#[async_trait]
impl AutomationProvider for BrowserUseProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "browser-use".to_string(),
            name: "Browser Use".to_string(),
            answer_field: "finalResult".to_string(),
        }
    }

    async fn create_session(
        &self,
        credentials: &ProviderCredentials,
    ) -> anyhow::Result<BrowserSession> {
        let value = send_json("browser-use", self.create_session_request(credentials)).await?;
        let Some(id) = value.get("id").and_then(Value::as_str) else {
            anyhow::bail!("browser-use session response did not include an id");
        };
        let mut session = BrowserSession::new(id);
        session.live_url = value
            .get("liveUrl")
            .and_then(Value::as_str)
            .filter(|u| !u.trim().is_empty())
            .map(str::to_string);
        session.cdp_url = value
            .get("cdpUrl")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(session)
    }

    async fn run_instruction(
        &self,
        session: &BrowserSession,
        request: RunRequest,
    ) -> anyhow::Result<RunResponse> {
        let key = Self::account_key(&request.credentials);
        let included = match request.file_path.as_deref() {
            Some(path) => Some(self.upload_file(&session.id, path, key).await?),
            None => None,
        };
        let body = task_body(session, &request, included);

        let url = format!("{}/tasks", self.base_url);
        let created = send_json(
            "browser-use",
            self.authed(self.client.post(url).json(&body), key),
        )
        .await?;
        let Some(task_id) = created
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            anyhow::bail!("browser-use task response did not include an id");
        };

        let mut response =
            wait_until_settled(self.poll_interval, || self.task_view(&task_id, key)).await?;
        response.run_id.get_or_insert(task_id);
        Ok(response)
    }

    async fn poll_run(
        &self,
        run_id: &str,
        credentials: &ProviderCredentials,
    ) -> anyhow::Result<Option<RunResponse>> {
        self.task_view(run_id, Self::account_key(credentials))
            .await
            .map(Some)
    }

    async fn stop_session(
        &self,
        session: &BrowserSession,
        credentials: &ProviderCredentials,
    ) -> anyhow::Result<()> {
        send_json("browser-use", self.stop_session_request(session, credentials)).await?;
        Ok(())
    }
}

fn upload_content_type(file_name: &str) -> String {
    mime_guess::from_path(file_name)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// Body for `POST /tasks`. A bring-your-own model carries its key and, for
/// gateways, its endpoint.
fn task_body(session: &BrowserSession, request: &RunRequest, included: Option<String>) -> Value {
    let mut body = Map::new();
    body.insert("task".to_string(), json!(request.instruction));
    body.insert("llm".to_string(), json!(cloud_llm_name(&request.model)));
    body.insert("sessionId".to_string(), json!(session.id));
    if let Some(route) = request.llm_route() {
        body.insert("llmApiKey".to_string(), json!(route.api_key));
        if let Some(base_url) = route.base_url {
            body.insert("llmBaseUrl".to_string(), json!(base_url));
        }
    }
    if !request.secrets.is_empty() {
        body.insert("sensitiveData".to_string(), json!(request.secrets));
    }
    if let Some(name) = included {
        body.insert("includedFileNames".to_string(), json!([name]));
    }
    Value::Object(body)
}

/// The hosted baseline model has its own name on the cloud API.
fn cloud_llm_name(model: &ProviderModel) -> String {
    if model.provider == agentdock_types::BASELINE_PROVIDER {
        return "browser-use-llm".to_string();
    }
    model.model.clone()
}

fn parse_task_view(value: &Value) -> RunResponse {
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

    let actions = steps
        .iter()
        .flat_map(|step| {
            step.get("actions")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
        })
        .map(|raw| parse_action(&raw))
        .collect::<Vec<_>>();
    let last_url = steps
        .iter()
        .rev()
        .find_map(|step| step.get("url").and_then(Value::as_str))
        .map(str::to_string);

    let total_cost = value.get("cost").and_then(|c| match c {
        Value::String(s) => s.trim().parse::<f64>().ok(),
        other => other.as_f64(),
    });

    let duration_secs = duration_between(
        value.get("startedAt").and_then(parse_timestamp),
        value.get("finishedAt").and_then(parse_timestamp),
    );

    let metadata = RawValue::map([
        ("taskId", RawValue::from(str_field("id"))),
        ("sessionId", RawValue::from(str_field("sessionId"))),
        ("llm", RawValue::from(str_field("llm"))),
        ("browserUseVersion", RawValue::from(str_field("browserUseVersion"))),
        (
            "outputFiles",
            RawValue::from(value.get("outputFiles").cloned().unwrap_or(Value::Null)),
        ),
    ]);

    RunResponse {
        run_id: str_field("id"),
        status: str_field("status"),
        answer: str_field("output").filter(|a| !a.is_empty()),
        success: value.get("isSuccess").and_then(Value::as_bool),
        task: str_field("task"),
        url: last_url,
        duration_secs,
        usage: Usage {
            total_cost,
            ..Default::default()
        },
        actions,
        steps: Vec::new(),
        metadata: Some(metadata),
    }
}

/// Actions arrive as JSON-encoded `{"<action name>": {params}}` strings.
fn parse_action(raw: &Value) -> ActionRecord {
    let decoded = match raw {
        Value::String(s) => serde_json::from_str::<Value>(s).unwrap_or_else(|_| raw.clone()),
        other => other.clone(),
    };
    let Some((name, params)) = decoded.as_object().and_then(|obj| obj.iter().next()) else {
        let mut record = ActionRecord::named(raw.as_str().unwrap_or("unknown"));
        record.metadata = RawValue::Json(decoded.clone());
        return record;
    };

    let mut record = ActionRecord::named(name.as_str());
    record.is_done = Some(name == "done");
    if name == "done" {
        record.success = params.get("success").and_then(Value::as_bool);
        record.extracted_content = params
            .get("text")
            .and_then(Value::as_str)
            .map(str::to_string);
        record.attachments = params
            .get("files_to_display")
            .cloned()
            .unwrap_or(Value::Null)
            .into();
    }
    record.metadata = RawValue::Json(params.clone());
    record
}
