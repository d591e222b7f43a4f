use std::ops::Deref;
use std::time::Duration;

use agentdock_orchestrator::TaskOrchestrator;

mod http;

pub use http::{app_router, serve};

pub const SERVICE_NAME: &str = "agent-server";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: TaskOrchestrator,
    /// Record store location reported by the store health route.
    pub store_url: Option<String>,
    pub upload_sweep_interval: Duration,
}

impl AppState {
    pub fn new(orchestrator: TaskOrchestrator, store_url: Option<String>) -> Self {
        Self {
            orchestrator,
            store_url,
            upload_sweep_interval: Duration::from_secs(60),
        }
    }

    pub fn with_upload_sweep_interval(mut self, interval: Duration) -> Self {
        self.upload_sweep_interval = interval;
        self
    }
}

impl Deref for AppState {
    type Target = TaskOrchestrator;

    fn deref(&self) -> &Self::Target {
        &self.orchestrator
    }
}

pub(crate) async fn run_upload_sweeper(state: AppState) {
    let mut ticker = tokio::time::interval(state.upload_sweep_interval.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let removed = state.files().sweep(chrono::Utc::now()).await;
        if removed > 0 {
            tracing::info!(removed, "expired uploads removed");
        }
    }
}
