use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use agentdock_core::{
    AppConfig, ConfigStore, ConvexStore, EventBus, FileRegistry, MemoryStore, TaskStore,
    DEFAULT_ENGINE_HOST, DEFAULT_ENGINE_PORT,
};
use agentdock_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent, ProcessKind,
};
use agentdock_orchestrator::{
    CostAccountant, OrchestratorSettings, PriceTable, SubmitRequest, TaskOrchestrator,
    TaskSupervisor,
};
use agentdock_providers::ProviderRegistry;
use agentdock_server::{serve, AppState};

#[derive(Parser, Debug)]
#[command(name = "agentdock-engine")]
#[command(about = "Background task engine for browser-automation agents")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Serve {
        #[arg(long, alias = "hostname", default_value = DEFAULT_ENGINE_HOST)]
        host: String,
        #[arg(long, env = "PORT", default_value_t = DEFAULT_ENGINE_PORT)]
        port: u16,
        #[arg(long, env = "AGENTDOCK_CONFIG")]
        config: Option<String>,
        #[arg(long, env = "AGENTDOCK_LOGS_DIR")]
        logs_dir: Option<String>,
        #[arg(long, env = "CONVEX_URL")]
        store_url: Option<String>,
    },
    /// Submits one instruction and waits for its terminal update.
    Run {
        instruction: String,
        #[arg(long, default_value = "local")]
        provider: String,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        file: Option<String>,
        #[arg(long)]
        config: Option<String>,
        #[arg(long, default_value_t = 1800)]
        wait_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            host,
            port,
            config,
            logs_dir,
            store_url,
        } => {
            let logs_dir = logs_dir
                .map(PathBuf::from)
                .unwrap_or_else(|| canonical_logs_dir_from_root(Path::new(".agentdock")));
            let (_log_guard, log_info) = init_process_logging(ProcessKind::Engine, &logs_dir, 14)?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent::new("logging.initialized", "engine.main")
                    .status("ok")
                    .detail("engine jsonl logging initialized"),
            );
            info!("engine logging initialized: {:?}", log_info);

            let addr: SocketAddr = format!("{host}:{port}")
                .parse()
                .context("invalid host or port")?;
            let overrides = build_cli_overrides(store_url);
            let config_store = ConfigStore::new(config.as_deref().map(Path::new), overrides).await?;
            let config = config_store.get().await;
            let runtime = build_runtime(&config).await?;
            info!(
                "starting agentdock-engine on http://{addr} (store: {})",
                runtime.store_label()
            );
            let state = AppState::new(runtime.orchestrator, config.store.url.clone())
                .with_upload_sweep_interval(Duration::from_secs(
                    config.uploads.sweep_interval_secs,
                ));
            serve(addr, state).await?;
        }
        Command::Run {
            instruction,
            provider,
            model,
            file,
            config,
            wait_secs,
        } => {
            let config_store = ConfigStore::new(config.as_deref().map(Path::new), None).await?;
            let mut config = config_store.get().await;
            // One-shot runs keep their record in memory so the result can be printed.
            config.store.url = None;
            let runtime = build_runtime(&config).await?;
            let orchestrator = runtime.orchestrator.clone();

            let file_id = match file {
                Some(path) => Some(upload_local_file(orchestrator.files(), &path).await?),
                None => None,
            };
            let mut events = orchestrator.events().subscribe();
            let admission = orchestrator
                .submit(SubmitRequest {
                    provider,
                    session_id: format!("cli_{}", Uuid::new_v4().simple()),
                    instruction: Some(instruction),
                    provider_model: model,
                    file_id,
                    ..Default::default()
                })
                .await?;
            eprintln!(
                "task {} admitted (browser session {})",
                admission.agent_id, admission.browser_session_id
            );

            let terminal = tokio::time::timeout(Duration::from_secs(wait_secs), async {
                loop {
                    let event = events.recv().await?;
                    let done = matches!(event.event_type.as_str(), "task.completed" | "task.failed");
                    if done && event.task_id() == Some(admission.agent_id.as_str()) {
                        return anyhow::Ok(event);
                    }
                }
            })
            .await
            .context("timed out waiting for the task to finish")??;

            let result = runtime
                .memory
                .as_ref()
                .and_then(|store| store.result(&admission.agent_id));
            let output = json!({
                "agentId": admission.agent_id,
                "event": terminal.event_type,
                "properties": terminal.properties,
                "result": result,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

struct Runtime {
    orchestrator: TaskOrchestrator,
    memory: Option<Arc<MemoryStore>>,
}

impl Runtime {
    fn store_label(&self) -> &'static str {
        if self.memory.is_some() {
            "memory"
        } else {
            "convex"
        }
    }
}

fn build_cli_overrides(store_url: Option<String>) -> Option<Value> {
    store_url
        .filter(|url| !url.trim().is_empty())
        .map(|url| json!({ "store": { "url": url } }))
}

async fn build_runtime(config: &AppConfig) -> anyhow::Result<Runtime> {
    let (store, memory): (Arc<dyn TaskStore>, Option<Arc<MemoryStore>>) = match &config.store.url
    {
        Some(url) => (Arc::new(ConvexStore::new(url)?), None),
        None => {
            tracing::warn!("no store url configured, task records are kept in memory");
            let memory = Arc::new(MemoryStore::new());
            (memory.clone(), Some(memory))
        }
    };

    let upload_dir = config
        .uploads
        .dir
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("agentdock-uploads"));
    tokio::fs::create_dir_all(&upload_dir)
        .await
        .with_context(|| format!("failed to create upload dir {}", upload_dir.display()))?;
    let files = FileRegistry::new(
        upload_dir,
        Duration::from_secs(config.uploads.ttl_secs),
        config.uploads.max_bytes,
    );

    let providers = ProviderRegistry::new(config.providers_config());
    let configured = providers
        .list()
        .into_iter()
        .map(|info| info.id)
        .collect::<Vec<_>>();
    info!("configured providers: {}", configured.join(", "));

    let orchestrator = TaskOrchestrator::new(
        providers,
        store,
        files,
        EventBus::new(),
        TaskSupervisor::new(config.limits.max_concurrent_tasks),
        CostAccountant::new(PriceTable::builtin(), config.billing.browser_hourly_rate),
        OrchestratorSettings::from_config(config),
    )
    .with_server_credentials(config.credentials.clone());

    Ok(Runtime {
        orchestrator,
        memory,
    })
}

async fn upload_local_file(files: &FileRegistry, path: &str) -> anyhow::Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {path}"))?;
    let name = Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let uploaded = files.persist(name, &bytes).await?;
    Ok(uploaded.file_id)
}
