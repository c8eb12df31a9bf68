use std::convert::Infallible;
use std::sync::Arc;

use serde_json::json;
use tracing::error;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::error::PipelineError;
use crate::orchestrator::Orchestrator;
use crate::progress::ProgressBus;

pub mod dead_letters;
pub mod responses;
pub mod sse;
pub mod tasks;

/// Shared by every handler.
#[derive(Clone)]
pub struct ApiState {
  pub orchestrator: Arc<Orchestrator>,
  pub bus: ProgressBus,
}

#[derive(Debug)]
pub enum ApiError {
  Pipeline(PipelineError),
  BadRequest(String),
}

impl warp::reject::Reject for ApiError {}

impl From<PipelineError> for ApiError {
  fn from(err: PipelineError) -> Self {
    ApiError::Pipeline(err)
  }
}

pub(crate) fn reject(err: impl Into<ApiError>) -> Rejection {
  warp::reject::custom(err.into())
}

fn with_state(state: ApiState) -> impl Filter<Extract = (ApiState,), Error = Infallible> + Clone {
  warp::any().map(move || state.clone())
}

pub fn routes(state: ApiState) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
  tasks::run_route(state.clone())
    .or(tasks::analytics_route(state.clone()))
    .or(tasks::task_route(state.clone()))
    .or(sse::stream_route(state.clone()))
    .or(sse::events_route(state.clone()))
    .or(responses::reprocess_all_route(state.clone()))
    .or(responses::reprocess_one_route(state.clone()))
    .or(dead_letters::dead_letters_route(state))
    .recover(handle_rejection)
}

pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
  let (status, message) = if let Some(api_error) = err.find::<ApiError>() {
    match api_error {
      ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message.clone()),
      ApiError::Pipeline(e) => {
        let status = match e {
          PipelineError::Busy { .. } | PipelineError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
          PipelineError::NotFound { .. } => StatusCode::NOT_FOUND,
          _ => {
            error!("Request failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
          }
        };
        (status, e.public_message())
      }
    }
  } else if err.is_not_found() {
    (StatusCode::NOT_FOUND, "Not found".to_string())
  } else if err.find::<warp::reject::InvalidQuery>().is_some() {
    (StatusCode::BAD_REQUEST, "Invalid query string".to_string())
  } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
    (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string())
  } else {
    error!("Unhandled rejection: {:?}", err);
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
  };
  Ok(warp::reply::with_status(warp::reply::json(&json!({ "error": message })), status))
}
