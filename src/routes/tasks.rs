use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;
use warp::http::StatusCode;
use warp::hyper::body::Bytes;
use warp::{Filter, Rejection, Reply};

use super::{ApiError, ApiState, reject, with_state};
use crate::error::PipelineError;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunRequest {
  pub force_refresh: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunAccepted {
  pub task_id: Uuid,
  pub status: String,
  pub sse_url: String,
}

pub fn run_route(state: ApiState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("forms" / Uuid / "analytics")
    .and(warp::post())
    .and(warp::body::bytes())
    .and(with_state(state))
    .and_then(handle_run_request)
}

pub fn task_route(state: ApiState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("tasks" / Uuid).and(warp::get()).and(with_state(state)).and_then(handle_get_task)
}

pub fn analytics_route(state: ApiState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("forms" / Uuid / "analytics").and(warp::get()).and(with_state(state)).and_then(handle_get_analytics)
}

async fn handle_run_request(form_id: Uuid, body: Bytes, state: ApiState) -> Result<impl Reply, Rejection> {
  let request: RunRequest = if body.is_empty() {
    RunRequest::default()
  } else {
    serde_json::from_slice(&body).map_err(|e| reject(ApiError::BadRequest(format!("Invalid request body: {e}"))))?
  };

  let task_id = state.orchestrator.request_run(form_id, request.force_refresh).await.map_err(|e| {
    if !matches!(e, PipelineError::Busy { .. } | PipelineError::NotFound { .. }) {
      error!(%form_id, "Run request failed: {}", e);
    }
    reject(e)
  })?;

  info!(%form_id, %task_id, "Analytics run accepted");
  let accepted = RunAccepted {
    task_id,
    status: "pending".to_string(),
    sse_url: format!("/tasks/{}/events", task_id),
  };
  Ok(warp::reply::with_status(warp::reply::json(&accepted), StatusCode::ACCEPTED))
}

async fn handle_get_task(task_id: Uuid, state: ApiState) -> Result<impl Reply, Rejection> {
  let task = state
    .orchestrator
    .context()
    .tasks
    .get(task_id)
    .await
    .map_err(reject)?
    .ok_or_else(|| reject(PipelineError::not_found("task", task_id)))?;
  Ok(warp::reply::json(&task))
}

async fn handle_get_analytics(form_id: Uuid, state: ApiState) -> Result<impl Reply, Rejection> {
  let ctx = state.orchestrator.context();
  let form = ctx.load_form(form_id).await.map_err(reject)?;
  let total = ctx.claims.count_responses(form_id).await.map_err(|e| reject(PipelineError::from(e)))?;
  let analyzed = ctx.claims.processed_responses(form_id).await.map_err(|e| reject(PipelineError::from(e)))?.len();
  let active = ctx.tasks.find_active_for(form_id).await.map_err(reject)?;

  Ok(warp::reply::json(&json!({
    "formId": form_id,
    "analytics": form.analytics,
    "lastUpdated": form.analytics_updated_at,
    "responsesAnalyzed": analyzed,
    "totalResponses": total,
    "activeTaskId": active.map(|t| t.task_id),
  })))
}
