use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::activity::ActivityLog;
use crate::aggregator::AggregatorHandle;
use crate::api::handlers;
use crate::definitions::AgentRegistry;
use crate::ledger::CostLedger;
use crate::liveness::LivenessMonitor;
use crate::spawner::TaskSpawner;
use crate::storage::Store;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<AgentRegistry>,
    pub ledger: Arc<CostLedger>,
    pub store: Arc<dyn Store>,
    pub liveness: LivenessMonitor,
    pub spawner: TaskSpawner,
    pub activity: ActivityLog,
    pub aggregator: AggregatorHandle,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/heartbeat", post(handlers::heartbeat))
        .route("/agents", get(handlers::list_agents))
        .route("/agents/:id", get(handlers::get_agent))
        .route("/tasks", post(handlers::create_task).get(handlers::list_tasks))
        .route("/tasks/:id", get(handlers::get_task))
        .route("/tasks/:id/start", post(handlers::start_task))
        .route("/tasks/:id/progress", post(handlers::report_progress))
        .route("/tasks/:id/complete", post(handlers::complete_task))
        .route("/tasks/:id/fail", post(handlers::fail_task))
        .route("/costs", get(handlers::get_costs))
        .route("/budgets", get(handlers::get_budgets))
        .route(
            "/activities",
            get(handlers::list_activities).post(handlers::record_activity),
        )
        .route("/activities/stream", get(handlers::stream_activities))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(
    state: AppState,
    address: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(address).await?;

    log::info!("drover API listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
