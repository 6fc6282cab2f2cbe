use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::convert::Infallible;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

use crate::aggregator::CostRollup;
use crate::api::error::ApiError;
use crate::api::server::AppState;
use crate::definitions::AgentDefinition;
use crate::ledger::BudgetStatus;
use crate::storage::{StoreChange, TaskFilter};
use crate::types::{
    ActivityCategory, ActivityEvent, ActorType, AgentLivenessRecord, EventId, LivenessStatus,
    SpawnRequest, Task, TaskId, TaskStatus, SYSTEM_ACTOR,
};

const DEFAULT_ACTIVITY_LIMIT: usize = 50;
const MAX_ACTIVITY_LIMIT: usize = 1000;

pub async fn health_check() -> Json<Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Json(request): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, ApiError> {
    let agent_id = request
        .agent_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::bad_request("agentId is required"))?;

    // Unrecognised hints still count as a heartbeat.
    let hint = request.status.as_deref().and_then(|raw| {
        let parsed = LivenessStatus::parse(raw);
        if parsed.is_none() {
            log::debug!("Ignoring unknown status hint '{}' from {}", raw, agent_id);
        }
        parsed
    });

    let timestamp = state.liveness.heartbeat(agent_id, hint).await?;
    Ok(Json(HeartbeatResponse {
        success: true,
        timestamp,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentView {
    #[serde(flatten)]
    pub definition: AgentDefinition,
    pub liveness: AgentLivenessRecord,
    pub budget: Option<BudgetStatus>,
}

fn agent_view(
    definition: &AgentDefinition,
    liveness: AgentLivenessRecord,
    budgets: &[BudgetStatus],
) -> AgentView {
    AgentView {
        definition: definition.clone(),
        liveness,
        budget: budgets.iter().find(|b| b.agent_id == definition.id).cloned(),
    }
}

pub async fn list_agents(State(state): State<AppState>) -> Result<Json<Vec<AgentView>>, ApiError> {
    let budgets = state.ledger.snapshot();
    let views = state
        .liveness
        .snapshot()
        .await?
        .into_iter()
        .filter_map(|record| {
            let definition = state.registry.get(&record.agent_id).ok()?;
            Some(agent_view(definition, record, &budgets))
        })
        .collect();
    Ok(Json(views))
}

pub async fn get_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<Json<AgentView>, ApiError> {
    let definition = state.registry.get(&agent_id)?;
    let record = state.liveness.record(&agent_id).await?;
    let budgets = state.ledger.snapshot();
    Ok(Json(agent_view(definition, record, &budgets)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    pub agent_id: String,
    #[serde(flatten)]
    pub request: SpawnRequest,
}

pub async fn create_task(
    State(state): State<AppState>,
    Json(body): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    let task = state.spawner.create(&body.agent_id, body.request).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskQuery {
    pub agent_id: Option<String>,
    pub status: Option<String>,
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<TaskQuery>,
) -> Result<Json<Vec<Task>>, ApiError> {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => Some(
            TaskStatus::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("unknown status: {}", raw)))?,
        ),
    };
    let filter = TaskFilter {
        agent_id: query.agent_id,
        status,
    };
    Ok(Json(state.spawner.list(&filter).await?))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<TaskId>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.spawner.get(task_id).await?))
}

pub async fn start_task(
    State(state): State<AppState>,
    Path(task_id): Path<TaskId>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.spawner.start(task_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct ProgressRequest {
    pub progress: u8,
}

pub async fn report_progress(
    State(state): State<AppState>,
    Path(task_id): Path<TaskId>,
    Json(body): Json<ProgressRequest>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(
        state.spawner.report_progress(task_id, body.progress).await?,
    ))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest {
    #[serde(default)]
    pub actual_cost: Option<Decimal>,
}

pub async fn complete_task(
    State(state): State<AppState>,
    Path(task_id): Path<TaskId>,
    Json(body): Json<CompleteRequest>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.spawner.complete(task_id, body.actual_cost).await?))
}

#[derive(Debug, Deserialize)]
pub struct FailRequest {
    pub reason: String,
}

pub async fn fail_task(
    State(state): State<AppState>,
    Path(task_id): Path<TaskId>,
    Json(body): Json<FailRequest>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.spawner.fail(task_id, body.reason).await?))
}

pub async fn get_costs(State(state): State<AppState>) -> Json<CostRollup> {
    Json(state.aggregator.current())
}

pub async fn get_budgets(State(state): State<AppState>) -> Json<Vec<BudgetStatus>> {
    Json(state.ledger.snapshot())
}

#[derive(Debug, Default, Deserialize)]
pub struct ActivityQuery {
    pub limit: Option<usize>,
    pub actor: Option<String>,
}

pub async fn list_activities(
    State(state): State<AppState>,
    Query(query): Query<ActivityQuery>,
) -> Result<Json<Vec<ActivityEvent>>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_ACTIVITY_LIMIT)
        .clamp(1, MAX_ACTIVITY_LIMIT);
    let events = match query.actor {
        Some(actor) => state.activity.by_actor(&actor, limit).await?,
        None => state.activity.recent(limit).await?,
    };
    Ok(Json(events))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewActivity {
    pub actor: String,
    pub category: ActivityCategory,
    pub action: String,
    pub description: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub cost: Option<Decimal>,
}

#[derive(Debug, Serialize)]
pub struct RecordedActivity {
    pub id: EventId,
}

pub async fn record_activity(
    State(state): State<AppState>,
    Json(body): Json<NewActivity>,
) -> Result<(StatusCode, Json<RecordedActivity>), ApiError> {
    let actor_type = if body.actor == SYSTEM_ACTOR {
        ActorType::System
    } else {
        state.registry.get(&body.actor)?.actor_type()
    };
    if body.cost.is_some_and(|c| c.is_sign_negative()) {
        return Err(ApiError::bad_request("cost must not be negative"));
    }

    let mut event = ActivityEvent::new(
        body.actor,
        actor_type,
        body.category,
        body.action,
        body.description,
    );
    if let Some(ts) = body.timestamp {
        event = event.at(ts);
    }
    event.metadata = body.metadata;
    event.cost = body.cost;

    let id = state
        .activity
        .record(event)
        .await
        .ok_or_else(|| ApiError::internal("activity could not be recorded"))?;
    Ok((StatusCode::CREATED, Json(RecordedActivity { id })))
}

/// Live feed of newly recorded activities.
pub async fn stream_activities(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.store.subscribe()).filter_map(|change| {
        match change {
            Ok(StoreChange::Activity(event)) => Event::default()
                .event("activity")
                .json_data(&event)
                .ok()
                .map(Ok),
            // Lagged receivers skip ahead; other changes are not streamed.
            _ => None,
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
