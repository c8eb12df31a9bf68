use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};
use crate::models::{Task, TaskState};
use crate::stores::{TaskStore, TaskUpdate, expiry_after};

/// Lifecycle bookkeeping for analytics runs.
#[derive(Clone)]
pub struct TaskRegistry {
  store: Arc<dyn TaskStore>,
  retention: Duration,
}

impl TaskRegistry {
  pub fn new(store: Arc<dyn TaskStore>, retention: Duration) -> Self {
    Self { store, retention }
  }

  pub async fn create(&self, task_id: Uuid, resource_id: Uuid, owner_id: &str) -> PipelineResult<Task> {
    let task = Task::new(task_id, resource_id, owner_id);
    self.store.insert_task(&task).await?;
    info!(%task_id, %resource_id, "Analytics task created");
    Ok(task)
  }

  /// Returns the task unless it is unknown or past its retention window.
  pub async fn get(&self, task_id: Uuid) -> PipelineResult<Option<Task>> {
    let now = Utc::now();
    Ok(self.store.get_task(task_id).await?.filter(|t| t.expires_at.is_none_or(|at| at > now)))
  }

  pub async fn find_active_for(&self, resource_id: Uuid) -> PipelineResult<Option<Task>> {
    Ok(self.store.find_active_for(resource_id).await?)
  }

  pub async fn recent(&self, limit: usize) -> PipelineResult<Vec<Task>> {
    Ok(self.store.recent_tasks(limit).await?)
  }

  /// Unfinished tasks created before `before`.
  pub async fn stale_active(&self, before: DateTime<Utc>) -> PipelineResult<Vec<Task>> {
    Ok(self.store.stale_active(before).await?)
  }

  /// Moves the task to `next`, refusing illegal or lost-race transitions.
  pub async fn transition(
    &self,
    task_id: Uuid,
    next: TaskState,
    message: Option<String>,
    owner_id: Option<&str>,
  ) -> PipelineResult<()> {
    let current = self.store.get_task(task_id).await?.ok_or_else(|| PipelineError::not_found("task", task_id))?;
    if !current.state.can_transition_to(next) {
      return Err(PipelineError::InvalidStateTransition { task_id, from: current.state, to: next });
    }

    let now = Utc::now();
    let mut update = TaskUpdate { message, owner_id: owner_id.map(str::to_string), ..TaskUpdate::default() };
    match next {
      TaskState::Running => update.started_at = Some(now),
      TaskState::Completed => {
        update.progress = Some(100);
        update.completed_at = Some(now);
        update.expires_at = Some(expiry_after(now, self.retention));
      }
      TaskState::Failed | TaskState::Canceled => {
        update.completed_at = Some(now);
        update.expires_at = Some(expiry_after(now, self.retention));
      }
      TaskState::New | TaskState::Pending => {}
    }

    if !self.store.update_if_state(task_id, current.state, next, &update).await? {
      let from = self.store.get_task(task_id).await?.map(|t| t.state).unwrap_or(current.state);
      return Err(PipelineError::InvalidStateTransition { task_id, from, to: next });
    }
    debug!(%task_id, from = %current.state, to = %next, "Task transitioned");
    Ok(())
  }

  /// Raises the stored progress and returns the effective value.
  pub async fn record_progress(&self, task_id: Uuid, progress: u8, message: Option<&str>) -> PipelineResult<u8> {
    Ok(self.store.raise_progress(task_id, progress, message).await?.unwrap_or(progress))
  }

  pub async fn purge_expired(&self) -> PipelineResult<u64> {
    Ok(self.store.purge_expired(Utc::now()).await?)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::stores::MemoryStore;

  fn registry() -> TaskRegistry {
    TaskRegistry::new(Arc::new(MemoryStore::new()), Duration::from_secs(60))
  }

  #[tokio::test]
  async fn happy_path_sets_timestamps() {
    let registry = registry();
    let task_id = Uuid::new_v4();
    registry.create(task_id, Uuid::new_v4(), "api").await.unwrap();
    registry.transition(task_id, TaskState::Pending, None, None).await.unwrap();
    registry.transition(task_id, TaskState::Running, None, Some("worker-1")).await.unwrap();
    assert_eq!(registry.record_progress(task_id, 40, Some("halfway")).await.unwrap(), 40);
    assert_eq!(registry.record_progress(task_id, 10, None).await.unwrap(), 40);
    registry.transition(task_id, TaskState::Completed, Some("done".into()), None).await.unwrap();

    let task = registry.get(task_id).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.progress, 100);
    assert_eq!(task.owner_id, "worker-1");
    assert!(task.started_at.is_some());
    assert!(task.expires_at.is_some());
  }

  #[tokio::test]
  async fn terminal_tasks_reject_further_moves() {
    let registry = registry();
    let task_id = Uuid::new_v4();
    registry.create(task_id, Uuid::new_v4(), "api").await.unwrap();
    registry.transition(task_id, TaskState::Canceled, Some("busy".into()), None).await.unwrap();
    let err = registry.transition(task_id, TaskState::Pending, None, None).await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidStateTransition { from: TaskState::Canceled, .. }));
  }

  #[tokio::test]
  async fn progress_of_idle_tasks_is_untouched() {
    let registry = registry();
    let task_id = Uuid::new_v4();
    registry.create(task_id, Uuid::new_v4(), "api").await.unwrap();
    assert_eq!(registry.record_progress(task_id, 50, None).await.unwrap(), 0);
  }

  #[tokio::test]
  async fn expired_tasks_read_as_missing() {
    let registry = TaskRegistry::new(Arc::new(MemoryStore::new()), Duration::ZERO);
    let task_id = Uuid::new_v4();
    registry.create(task_id, Uuid::new_v4(), "api").await.unwrap();
    registry.transition(task_id, TaskState::Canceled, None, None).await.unwrap();
    assert!(registry.get(task_id).await.unwrap().is_none());
    assert_eq!(registry.purge_expired().await.unwrap(), 1);
  }
}
