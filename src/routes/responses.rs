use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;
use warp::{Filter, Rejection, Reply};

use super::{ApiError, ApiState, reject, with_state};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReprocessQuery {
  pub only_failed: bool,
}

pub fn reprocess_all_route(state: ApiState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("forms" / Uuid / "responses" / "reprocess-all")
    .and(warp::post())
    .and(warp::query::<ReprocessQuery>())
    .and(with_state(state))
    .and_then(handle_reprocess_all)
}

pub fn reprocess_one_route(state: ApiState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("forms" / Uuid / "responses" / Uuid / "reprocess")
    .and(warp::post())
    .and(with_state(state))
    .and_then(handle_reprocess_one)
}

async fn handle_reprocess_all(form_id: Uuid, query: ReprocessQuery, state: ApiState) -> Result<impl Reply, Rejection> {
  let modified = state.orchestrator.reprocess_all(form_id, query.only_failed).await.map_err(reject)?;
  info!(%form_id, modified, "Reprocess requested");
  Ok(warp::reply::json(&json!({ "modifiedCount": modified })))
}

async fn handle_reprocess_one(form_id: Uuid, response_id: Uuid, state: ApiState) -> Result<impl Reply, Rejection> {
  let reset = state.orchestrator.reprocess_response(form_id, response_id).await.map_err(reject)?;
  if !reset {
    return Err(reject(ApiError::BadRequest("Response has no text content to analyze".to_string())));
  }
  Ok(warp::reply::json(&json!({ "responseId": response_id, "reprocessed": true })))
}
