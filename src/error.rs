use thiserror::Error;
use uuid::Uuid;

use crate::models::{Stage, TaskState};

#[derive(Debug, Error)]
pub enum PipelineError {
  #[error("form {resource_id} already has an active analytics run")]
  Busy { resource_id: Uuid },

  #[error("{kind} {id} not found")]
  NotFound { kind: &'static str, id: String },

  #[error("task {task_id} cannot move from {from} to {to}")]
  InvalidStateTransition { task_id: Uuid, from: TaskState, to: TaskState },

  #[error("lease on {resource_key} is no longer held by task {task_id}")]
  LeaseLost { resource_key: String, task_id: Uuid },

  #[error("text analysis failed: {0}")]
  Analysis(String),

  #[error("malformed analysis output: {0}")]
  Parse(#[from] serde_json::Error),

  #[error("run did not finish within {0:?}")]
  DeadlineExceeded(std::time::Duration),

  #[error("no responses could be analyzed, {failed} batch(es) exhausted their retries")]
  NoProgress { failed: usize },

  #[error("{stage} job {job_id} failed: {reason}")]
  StageFailed { stage: Stage, job_id: Uuid, reason: String },

  #[error(transparent)]
  Storage(#[from] anyhow::Error),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
  pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
    PipelineError::NotFound { kind, id: id.to_string() }
  }

  /// Transient failures go back through the stage's backoff schedule.
  pub fn is_retryable(&self) -> bool {
    matches!(self, PipelineError::Analysis(_) | PipelineError::Parse(_) | PipelineError::Storage(_))
  }

  /// Message safe to hand to end users and progress subscribers.
  pub fn public_message(&self) -> String {
    match self {
      PipelineError::Storage(_) => "Analytics run failed due to an internal storage error".to_string(),
      PipelineError::Analysis(_) | PipelineError::Parse(_) => {
        "Analytics run failed because the text analysis service was unavailable".to_string()
      }
      PipelineError::StageFailed { stage, .. } => format!("Analytics run failed during {stage}"),
      PipelineError::LeaseLost { .. } => "Analytics run lost its lock on the form".to_string(),
      PipelineError::DeadlineExceeded(_) => "Analytics run took too long and was stopped".to_string(),
      other => other.to_string(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn storage_details_stay_internal() {
    let err = PipelineError::from(anyhow::anyhow!("connection refused to 10.0.0.4:5432"));
    assert!(err.is_retryable());
    assert!(!err.public_message().contains("10.0.0.4"));
  }

  #[test]
  fn lifecycle_errors_are_fatal() {
    let err = PipelineError::not_found("form", Uuid::nil());
    assert!(!err.is_retryable());
    assert!(err.public_message().contains("not found"));
  }

  #[test]
  fn lost_lease_hides_key_and_task() {
    let task_id = Uuid::new_v4();
    let err = PipelineError::LeaseLost { resource_key: "form-analytics:abc".to_string(), task_id };
    assert!(!err.is_retryable());
    let message = err.public_message();
    assert!(!message.contains("form-analytics"));
    assert!(!message.contains(&task_id.to_string()));
  }
}
