//! HTTP control API of a master
//!
//! Served next to `/rpc` and `/health`:
//! - `POST /definitions` registers a workflow definition
//! - `POST /workflows` starts an instance
//! - `GET /workflows/:id` returns the instance rows
//! - `GET /workflows/:id/wait` blocks until the instance is final
//! - `POST /workflows/:id/{pause,resume,stop}`
//! - `POST /workflows/:id/tasks/:task_id/kill`

use crate::engine::{EngineError, MasterRuntime};
use crate::model::{DefinitionError, TaskInstance, WorkflowDefinition, WorkflowInstance, WorkflowState};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use slog::{error, info, Logger};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
struct ApiState {
    runtime: Arc<MasterRuntime>,
    logger: Logger,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartWorkflowRequest {
    pub definition: String,
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartWorkflowResponse {
    pub success: bool,
    pub workflow_instance_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterDefinitionResponse {
    pub success: bool,
    pub code: String,
    pub version: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStatusResponse {
    pub success: bool,
    pub workflow: Option<WorkflowInstance>,
    #[serde(default)]
    pub tasks: Vec<TaskInstance>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitResponse {
    pub success: bool,
    pub state: Option<WorkflowState>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WaitQuery {
    #[serde(default = "default_timeout")]
    timeout_seconds: u64,
}

fn default_timeout() -> u64 {
    60
}

fn status_for(error: &EngineError) -> StatusCode {
    match error {
        EngineError::WorkflowNotFound(_)
        | EngineError::TaskNotFound(_)
        | EngineError::Definition(DefinitionError::NotFound { .. }) => StatusCode::NOT_FOUND,
        EngineError::Definition(_) => StatusCode::BAD_REQUEST,
        EngineError::InvalidTransition { .. } | EngineError::DefinitionConflict { .. } | EngineError::NotOwner { .. } => {
            StatusCode::CONFLICT
        }
        EngineError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
        EngineError::ShutDown => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Control routes bound to a master runtime
pub fn control_routes(runtime: Arc<MasterRuntime>, logger: Logger) -> Router {
    Router::new()
        .route("/definitions", post(handle_register_definition))
        .route("/workflows", post(handle_start_workflow))
        .route("/workflows/:id", get(handle_workflow_status))
        .route("/workflows/:id/wait", get(handle_workflow_wait))
        .route("/workflows/:id/pause", post(handle_pause))
        .route("/workflows/:id/resume", post(handle_resume))
        .route("/workflows/:id/stop", post(handle_stop))
        .route("/workflows/:id/tasks/:task_id/kill", post(handle_kill_task))
        .with_state(ApiState { runtime, logger })
}

async fn handle_register_definition(
    State(api): State<ApiState>,
    Json(definition): Json<WorkflowDefinition>,
) -> Response {
    let code = definition.code.clone();
    let version = definition.version;
    match api.runtime.register_definition(definition).await {
        Ok(_) => Json(RegisterDefinitionResponse {
            success: true,
            code,
            version,
            error: None,
        })
        .into_response(),
        Err(e) => {
            error!(api.logger, "Definition rejected"; "code" => &code, "version" => version, "error" => %e);
            let response = RegisterDefinitionResponse {
                success: false,
                code,
                version,
                error: Some(e.to_string()),
            };
            (status_for(&e), Json(response)).into_response()
        }
    }
}

async fn handle_start_workflow(State(api): State<ApiState>, Json(req): Json<StartWorkflowRequest>) -> Response {
    info!(api.logger, "Workflow start request";
        "definition" => &req.definition,
        "version" => req.version.map(|v| v as i64).unwrap_or(-1)
    );
    match api
        .runtime
        .start_workflow(&req.definition, req.version, req.variables)
        .await
    {
        Ok(id) => Json(StartWorkflowResponse {
            success: true,
            workflow_instance_id: Some(id),
            error: None,
        })
        .into_response(),
        Err(e) => {
            error!(api.logger, "Failed to start workflow"; "definition" => &req.definition, "error" => %e);
            let response = StartWorkflowResponse {
                success: false,
                workflow_instance_id: None,
                error: Some(e.to_string()),
            };
            (status_for(&e), Json(response)).into_response()
        }
    }
}

async fn handle_workflow_status(State(api): State<ApiState>, Path(id): Path<String>) -> Response {
    match api.runtime.workflow_status(&id).await {
        Ok(snapshot) => Json(WorkflowStatusResponse {
            success: true,
            workflow: Some(snapshot.workflow),
            tasks: snapshot.tasks,
            error: None,
        })
        .into_response(),
        Err(e) => {
            let response = WorkflowStatusResponse {
                success: false,
                workflow: None,
                tasks: Vec::new(),
                error: Some(e.to_string()),
            };
            (status_for(&e), Json(response)).into_response()
        }
    }
}

async fn handle_workflow_wait(
    State(api): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<WaitQuery>,
) -> Response {
    let timeout = Duration::from_secs(query.timeout_seconds);
    match api.runtime.wait_for_terminal(&id, timeout).await {
        Ok(state) => Json(WaitResponse {
            success: true,
            state: Some(state),
            error: None,
        })
        .into_response(),
        Err(e) => {
            let response = WaitResponse {
                success: false,
                state: None,
                error: Some(e.to_string()),
            };
            (status_for(&e), Json(response)).into_response()
        }
    }
}

fn control_response(api: &ApiState, action: &str, id: &str, result: Result<(), EngineError>) -> Response {
    match result {
        Ok(()) => {
            info!(api.logger, "Control request applied"; "action" => action, "workflow_instance_id" => id);
            Json(ControlResponse {
                success: true,
                error: None,
            })
            .into_response()
        }
        Err(e) => {
            let response = ControlResponse {
                success: false,
                error: Some(e.to_string()),
            };
            (status_for(&e), Json(response)).into_response()
        }
    }
}

async fn handle_pause(State(api): State<ApiState>, Path(id): Path<String>) -> Response {
    let result = api.runtime.pause(&id).await;
    control_response(&api, "pause", &id, result)
}

async fn handle_resume(State(api): State<ApiState>, Path(id): Path<String>) -> Response {
    let result = api.runtime.resume(&id).await;
    control_response(&api, "resume", &id, result)
}

async fn handle_stop(State(api): State<ApiState>, Path(id): Path<String>) -> Response {
    let result = api.runtime.stop(&id).await;
    control_response(&api, "stop", &id, result)
}

async fn handle_kill_task(State(api): State<ApiState>, Path((id, task_id)): Path<(String, String)>) -> Response {
    let result = api.runtime.kill_task(&id, &task_id).await;
    control_response(&api, "kill_task", &id, result)
}
