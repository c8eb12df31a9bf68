//! Persistence seams of the pipeline. Every trait has an in-memory
//! implementation for tests and single-process runs and a Postgres one.

mod memory;
mod postgres;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::analysis::ItemAnalysis;
use crate::models::{DeadLetterRecord, Form, InsightKind, Job, JobOutcome, Lease, Response, Task, TaskState};

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
  now + chrono::Duration::milliseconds(ttl.as_millis().min(i64::MAX as u128) as i64)
}

/// Mutual exclusion of analytics runs per form.
#[async_trait]
pub trait LeaseLock: Send + Sync {
  /// Grants the lease if none exists, the holder's lease expired, or the
  /// caller's task already holds it.
  async fn acquire(&self, key: &str, task_id: Uuid, owner_id: &str, ttl: Duration) -> Result<Option<Lease>>;

  /// Pushes the expiry forward. `None` means the caller no longer holds it.
  async fn extend(&self, key: &str, task_id: Uuid, owner_id: &str, ttl: Duration) -> Result<Option<Lease>>;

  /// No-op unless both task and owner match.
  async fn release(&self, key: &str, task_id: Uuid, owner_id: &str) -> Result<()>;

  async fn current(&self, key: &str) -> Result<Option<Lease>>;

  async fn list_live(&self) -> Result<Vec<Lease>>;
}

/// Fields written together with a state change.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
  pub message: Option<String>,
  pub owner_id: Option<String>,
  pub progress: Option<u8>,
  pub started_at: Option<DateTime<Utc>>,
  pub completed_at: Option<DateTime<Utc>>,
  pub expires_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
  async fn insert_task(&self, task: &Task) -> Result<()>;

  async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>>;

  /// Compare-and-swap on the stored state. Returns false when the task was
  /// not in `expected`.
  async fn update_if_state(&self, task_id: Uuid, expected: TaskState, next: TaskState, update: &TaskUpdate)
  -> Result<bool>;

  /// Raises progress of a running task, never lowers it. Returns the stored
  /// progress afterwards.
  async fn raise_progress(&self, task_id: Uuid, progress: u8, message: Option<&str>) -> Result<Option<u8>>;

  async fn find_active_for(&self, resource_id: Uuid) -> Result<Option<Task>>;

  async fn recent_tasks(&self, limit: usize) -> Result<Vec<Task>>;

  /// Non-terminal tasks created before `before`, oldest first.
  async fn stale_active(&self, before: DateTime<Utc>) -> Result<Vec<Task>>;

  async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Claim bookkeeping over a form's responses.
#[async_trait]
pub trait ClaimStore: Send + Sync {
  async fn insert_response(&self, response: &Response) -> Result<()>;

  async fn get_response(&self, response_id: Uuid) -> Result<Option<Response>>;

  async fn count_responses(&self, resource_id: Uuid) -> Result<u64>;

  /// Unprocessed, unclaimed responses in submission order.
  async fn eligible(&self, resource_id: Uuid) -> Result<Vec<Response>>;

  /// Atomically tags eligible responses (optionally limited to `only`) with
  /// the task. Responses the task already holds and has not finished are
  /// returned again.
  async fn claim(&self, resource_id: Uuid, task_id: Uuid, only: Option<&[Uuid]>) -> Result<Vec<Response>>;

  /// Stores the analysis and finishes the response, if the task still holds it.
  async fn save_analysis(&self, task_id: Uuid, response_id: Uuid, analysis: &ItemAnalysis) -> Result<bool>;

  /// Finishes unclaimed responses with no free-text content.
  async fn mark_empty_processed(&self, resource_id: Uuid) -> Result<u64>;

  /// Finishes everything still tagged with the task. Idempotent.
  async fn release_claims(&self, task_id: Uuid, resource_id: Uuid) -> Result<u64>;

  /// Returns the task's unfinished responses to the claimable pool.
  async fn reset_claims(&self, task_id: Uuid, resource_id: Uuid) -> Result<u64>;

  /// Clears claims on the form held by any task other than `keep`.
  async fn reset_foreign_claims(&self, resource_id: Uuid, keep: Uuid) -> Result<u64>;

  /// `(resource, task)` pairs holding unfinished claims older than `before`.
  async fn stale_claims(&self, before: DateTime<Utc>) -> Result<Vec<(Uuid, Uuid)>>;

  /// Makes text responses claimable again. With `only_unprocessed`, finished
  /// responses keep their analysis.
  async fn reprocess(&self, resource_id: Uuid, only_unprocessed: bool) -> Result<u64>;

  async fn reprocess_one(&self, resource_id: Uuid, response_id: Uuid) -> Result<bool>;

  async fn processed_responses(&self, resource_id: Uuid) -> Result<Vec<Response>>;

  async fn set_canonical_topics(&self, response_id: Uuid, topics: &[String]) -> Result<()>;
}

#[async_trait]
pub trait FormStore: Send + Sync {
  async fn insert_form(&self, form: &Form) -> Result<()>;

  async fn get_form(&self, form_id: Uuid) -> Result<Option<Form>>;

  /// Replaces the stored analytics document.
  async fn save_aggregate(&self, form_id: Uuid, aggregate: &Value) -> Result<()>;

  /// Writes one field of `insights` without touching the others.
  async fn save_insight(&self, form_id: Uuid, kind: InsightKind, value: &Value) -> Result<()>;

  async fn finalize_analytics(&self, form_id: Uuid, at: DateTime<Utc>) -> Result<()>;
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
  async fn record(&self, record: &DeadLetterRecord) -> Result<()>;

  async fn list(&self, task_id: Option<Uuid>, limit: usize) -> Result<Vec<DeadLetterRecord>>;
}

/// Attempt counts and final outcomes of stage jobs, awaited by the orchestrator.
#[async_trait]
pub trait JobLedger: Send + Sync {
  async fn register(&self, job: &Job) -> Result<()>;

  /// Counts one more attempt, returning the total so far.
  async fn record_attempt(&self, job: &Job) -> Result<u32>;

  async fn finish(&self, job_id: Uuid, outcome: &JobOutcome) -> Result<()>;

  async fn outcome(&self, job_id: Uuid) -> Result<Option<JobOutcome>>;

  /// Resolves once the job has a final outcome.
  async fn wait(&self, job_id: Uuid) -> Result<JobOutcome>;
}
