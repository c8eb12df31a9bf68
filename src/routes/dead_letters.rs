use serde::Deserialize;
use uuid::Uuid;
use warp::{Filter, Rejection, Reply};

use super::{ApiState, reject, with_state};
use crate::error::PipelineError;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeadLetterQuery {
  pub task_id: Option<Uuid>,
  pub limit: Option<usize>,
}

pub fn dead_letters_route(state: ApiState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("dead-letters")
    .and(warp::get())
    .and(warp::query::<DeadLetterQuery>())
    .and(with_state(state))
    .and_then(handle_list)
}

async fn handle_list(query: DeadLetterQuery, state: ApiState) -> Result<impl Reply, Rejection> {
  let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
  let records = state
    .orchestrator
    .context()
    .dead_letters
    .list(query.task_id, limit)
    .await
    .map_err(|e| reject(PipelineError::from(e)))?;
  Ok(warp::reply::json(&records))
}
