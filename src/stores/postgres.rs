use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::{ClaimStore, DeadLetterSink, FormStore, JobLedger, LeaseLock, TaskStore, TaskUpdate, expiry_after};
use crate::analysis::ItemAnalysis;
use crate::models::{
  Answer, DeadLetterRecord, Form, InsightKind, Job, JobOutcome, Lease, Question, Response, Task, TaskState,
};

const LEDGER_POLL_INTERVAL: Duration = Duration::from_millis(500);

const RESPONSE_COLUMNS: &str = "id, form_id, submitted_at, answers, processed, claim_owner, claim_started_at, \
                                analysis, canonical_topics, last_analyzed";

const TASK_COLUMNS: &str =
  "id, resource_id, state, progress, message, owner_id, created_at, started_at, completed_at, expires_at";

/// Postgres backing for every store trait, sharing one pool.
#[derive(Clone)]
pub struct PgStore {
  pool: PgPool,
}

impl PgStore {
  pub fn new(pool: PgPool) -> Self {
    Self { pool }
  }
}

#[derive(FromRow)]
struct LeaseRow {
  resource_key: String,
  task_id: Uuid,
  owner_id: String,
  expires_at: DateTime<Utc>,
}

impl From<LeaseRow> for Lease {
  fn from(row: LeaseRow) -> Self {
    Lease { resource_key: row.resource_key, task_id: row.task_id, owner_id: row.owner_id, expires_at: row.expires_at }
  }
}

#[derive(FromRow)]
struct TaskRow {
  id: Uuid,
  resource_id: Uuid,
  state: String,
  progress: i16,
  message: String,
  owner_id: String,
  created_at: DateTime<Utc>,
  started_at: Option<DateTime<Utc>>,
  completed_at: Option<DateTime<Utc>>,
  expires_at: Option<DateTime<Utc>>,
}

impl TryFrom<TaskRow> for Task {
  type Error = anyhow::Error;

  fn try_from(row: TaskRow) -> Result<Self> {
    Ok(Task {
      task_id: row.id,
      resource_id: row.resource_id,
      state: row.state.parse()?,
      progress: row.progress.clamp(0, 100) as u8,
      message: row.message,
      owner_id: row.owner_id,
      created_at: row.created_at,
      started_at: row.started_at,
      completed_at: row.completed_at,
      expires_at: row.expires_at,
    })
  }
}

#[derive(FromRow)]
struct ResponseRow {
  id: Uuid,
  form_id: Uuid,
  submitted_at: DateTime<Utc>,
  answers: Json<Vec<Answer>>,
  processed: bool,
  claim_owner: Option<Uuid>,
  claim_started_at: Option<DateTime<Utc>>,
  analysis: Option<Json<ItemAnalysis>>,
  canonical_topics: Vec<String>,
  last_analyzed: Option<DateTime<Utc>>,
}

impl From<ResponseRow> for Response {
  fn from(row: ResponseRow) -> Self {
    Response {
      id: row.id,
      form_id: row.form_id,
      submitted_at: row.submitted_at,
      answers: row.answers.0,
      processed: row.processed,
      claim_owner: row.claim_owner,
      claim_started_at: row.claim_started_at,
      analysis: row.analysis.map(|a| a.0),
      canonical_topics: row.canonical_topics,
      last_analyzed: row.last_analyzed,
    }
  }
}

#[derive(FromRow)]
struct FormRow {
  id: Uuid,
  title: String,
  questions: Json<Vec<Question>>,
  analytics: Option<Value>,
  analytics_updated_at: Option<DateTime<Utc>>,
}

impl From<FormRow> for Form {
  fn from(row: FormRow) -> Self {
    Form {
      id: row.id,
      title: row.title,
      questions: row.questions.0,
      analytics: row.analytics,
      analytics_updated_at: row.analytics_updated_at,
    }
  }
}

#[derive(FromRow)]
struct DeadLetterRow {
  original_stage: String,
  job_id: Uuid,
  task_id: Uuid,
  resource_id: Uuid,
  payload: Value,
  failure_reason: String,
  attempts_made: i32,
  max_attempts: i32,
  failed_at: DateTime<Utc>,
}

impl TryFrom<DeadLetterRow> for DeadLetterRecord {
  type Error = anyhow::Error;

  fn try_from(row: DeadLetterRow) -> Result<Self> {
    Ok(DeadLetterRecord {
      original_stage: row.original_stage.parse()?,
      job_id: row.job_id,
      task_id: row.task_id,
      resource_id: row.resource_id,
      payload: row.payload,
      failure_reason: row.failure_reason,
      attempts_made: row.attempts_made.max(0) as u32,
      max_attempts: row.max_attempts.max(0) as u32,
      failed_at: row.failed_at,
    })
  }
}

#[async_trait]
impl LeaseLock for PgStore {
  async fn acquire(&self, key: &str, task_id: Uuid, owner_id: &str, ttl: Duration) -> Result<Option<Lease>> {
    let now = Utc::now();
    let row = sqlx::query_as::<_, LeaseRow>(
      "INSERT INTO leases (resource_key, task_id, owner_id, expires_at)
       VALUES ($1, $2, $3, $4)
       ON CONFLICT (resource_key) DO UPDATE
         SET task_id = EXCLUDED.task_id, owner_id = EXCLUDED.owner_id, expires_at = EXCLUDED.expires_at
         WHERE leases.expires_at <= $5 OR leases.task_id = EXCLUDED.task_id
       RETURNING resource_key, task_id, owner_id, expires_at",
    )
    .bind(key)
    .bind(task_id)
    .bind(owner_id)
    .bind(expiry_after(now, ttl))
    .bind(now)
    .fetch_optional(&self.pool)
    .await
    .with_context(|| format!("Failed to acquire lease {key}"))?;
    Ok(row.map(Lease::from))
  }

  async fn extend(&self, key: &str, task_id: Uuid, owner_id: &str, ttl: Duration) -> Result<Option<Lease>> {
    let row = sqlx::query_as::<_, LeaseRow>(
      "UPDATE leases SET expires_at = $4
       WHERE resource_key = $1 AND task_id = $2 AND owner_id = $3
       RETURNING resource_key, task_id, owner_id, expires_at",
    )
    .bind(key)
    .bind(task_id)
    .bind(owner_id)
    .bind(expiry_after(Utc::now(), ttl))
    .fetch_optional(&self.pool)
    .await
    .with_context(|| format!("Failed to extend lease {key}"))?;
    Ok(row.map(Lease::from))
  }

  async fn release(&self, key: &str, task_id: Uuid, owner_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM leases WHERE resource_key = $1 AND task_id = $2 AND owner_id = $3")
      .bind(key)
      .bind(task_id)
      .bind(owner_id)
      .execute(&self.pool)
      .await
      .with_context(|| format!("Failed to release lease {key}"))?;
    Ok(())
  }

  async fn current(&self, key: &str) -> Result<Option<Lease>> {
    let row = sqlx::query_as::<_, LeaseRow>(
      "SELECT resource_key, task_id, owner_id, expires_at FROM leases WHERE resource_key = $1 AND expires_at > $2",
    )
    .bind(key)
    .bind(Utc::now())
    .fetch_optional(&self.pool)
    .await
    .context("Failed to read lease")?;
    Ok(row.map(Lease::from))
  }

  async fn list_live(&self) -> Result<Vec<Lease>> {
    let rows = sqlx::query_as::<_, LeaseRow>(
      "SELECT resource_key, task_id, owner_id, expires_at FROM leases WHERE expires_at > $1 ORDER BY expires_at",
    )
    .bind(Utc::now())
    .fetch_all(&self.pool)
    .await
    .context("Failed to list leases")?;
    Ok(rows.into_iter().map(Lease::from).collect())
  }
}

#[async_trait]
impl TaskStore for PgStore {
  async fn insert_task(&self, task: &Task) -> Result<()> {
    sqlx::query(
      "INSERT INTO analytics_tasks (id, resource_id, state, progress, message, owner_id, created_at)
       VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(task.task_id)
    .bind(task.resource_id)
    .bind(task.state.as_str())
    .bind(task.progress as i16)
    .bind(&task.message)
    .bind(&task.owner_id)
    .bind(task.created_at)
    .execute(&self.pool)
    .await
    .context("Failed to insert analytics task")?;
    Ok(())
  }

  async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>> {
    let row = sqlx::query_as::<_, TaskRow>(&format!("SELECT {TASK_COLUMNS} FROM analytics_tasks WHERE id = $1"))
      .bind(task_id)
      .fetch_optional(&self.pool)
      .await
      .context("Failed to fetch analytics task")?;
    row.map(Task::try_from).transpose()
  }

  async fn update_if_state(&self, task_id: Uuid, expected: TaskState, next: TaskState, update: &TaskUpdate)
  -> Result<bool> {
    let result = sqlx::query(
      "UPDATE analytics_tasks SET
         state = $3,
         message = COALESCE($4, message),
         owner_id = COALESCE($5, owner_id),
         progress = GREATEST(progress, COALESCE($6, progress)),
         started_at = COALESCE($7, started_at),
         completed_at = COALESCE($8, completed_at),
         expires_at = COALESCE($9, expires_at)
       WHERE id = $1 AND state = $2",
    )
    .bind(task_id)
    .bind(expected.as_str())
    .bind(next.as_str())
    .bind(update.message.as_deref())
    .bind(update.owner_id.as_deref())
    .bind(update.progress.map(i16::from))
    .bind(update.started_at)
    .bind(update.completed_at)
    .bind(update.expires_at)
    .execute(&self.pool)
    .await
    .with_context(|| format!("Failed to move task {task_id} to {next}"))?;
    Ok(result.rows_affected() == 1)
  }

  async fn raise_progress(&self, task_id: Uuid, progress: u8, message: Option<&str>) -> Result<Option<u8>> {
    let raised: Option<i16> = sqlx::query_scalar(
      "UPDATE analytics_tasks SET progress = GREATEST(progress, $2), message = COALESCE($3, message)
       WHERE id = $1 AND state = 'running'
       RETURNING progress",
    )
    .bind(task_id)
    .bind(i16::from(progress.min(100)))
    .bind(message)
    .fetch_optional(&self.pool)
    .await
    .context("Failed to update task progress")?;

    let stored = match raised {
      Some(progress) => Some(progress),
      None => sqlx::query_scalar("SELECT progress FROM analytics_tasks WHERE id = $1")
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to read task progress")?,
    };
    Ok(stored.map(|p: i16| p.clamp(0, 100) as u8))
  }

  async fn find_active_for(&self, resource_id: Uuid) -> Result<Option<Task>> {
    let row = sqlx::query_as::<_, TaskRow>(&format!(
      "SELECT {TASK_COLUMNS} FROM analytics_tasks
       WHERE resource_id = $1 AND state IN ('new', 'pending', 'running')
       ORDER BY created_at DESC LIMIT 1"
    ))
    .bind(resource_id)
    .fetch_optional(&self.pool)
    .await
    .context("Failed to look up active task")?;
    row.map(Task::try_from).transpose()
  }

  async fn recent_tasks(&self, limit: usize) -> Result<Vec<Task>> {
    let rows = sqlx::query_as::<_, TaskRow>(&format!(
      "SELECT {TASK_COLUMNS} FROM analytics_tasks ORDER BY created_at DESC LIMIT $1"
    ))
    .bind(limit as i64)
    .fetch_all(&self.pool)
    .await
    .context("Failed to list analytics tasks")?;
    rows.into_iter().map(Task::try_from).collect()
  }

  async fn stale_active(&self, before: DateTime<Utc>) -> Result<Vec<Task>> {
    let rows = sqlx::query_as::<_, TaskRow>(&format!(
      "SELECT {TASK_COLUMNS} FROM analytics_tasks
       WHERE state IN ('new', 'pending', 'running') AND created_at < $1
       ORDER BY created_at"
    ))
    .bind(before)
    .fetch_all(&self.pool)
    .await
    .context("Failed to list stale analytics tasks")?;
    rows.into_iter().map(Task::try_from).collect()
  }

  async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query("DELETE FROM analytics_tasks WHERE expires_at IS NOT NULL AND expires_at <= $1")
      .bind(now)
      .execute(&self.pool)
      .await
      .context("Failed to purge expired tasks")?;
    Ok(result.rows_affected())
  }
}

#[async_trait]
impl ClaimStore for PgStore {
  async fn insert_response(&self, response: &Response) -> Result<()> {
    sqlx::query(
      "INSERT INTO responses (id, form_id, submitted_at, answers, has_text, processed, analysis, canonical_topics)
       VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(response.id)
    .bind(response.form_id)
    .bind(response.submitted_at)
    .bind(Json(&response.answers))
    .bind(response.has_text_content())
    .bind(response.processed)
    .bind(response.analysis.as_ref().map(Json))
    .bind(&response.canonical_topics)
    .execute(&self.pool)
    .await
    .context("Failed to insert response")?;
    Ok(())
  }

  async fn get_response(&self, response_id: Uuid) -> Result<Option<Response>> {
    let row = sqlx::query_as::<_, ResponseRow>(&format!("SELECT {RESPONSE_COLUMNS} FROM responses WHERE id = $1"))
      .bind(response_id)
      .fetch_optional(&self.pool)
      .await
      .context("Failed to fetch response")?;
    Ok(row.map(Response::from))
  }

  async fn count_responses(&self, resource_id: Uuid) -> Result<u64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM responses WHERE form_id = $1")
      .bind(resource_id)
      .fetch_one(&self.pool)
      .await
      .context("Failed to count responses")?;
    Ok(count.max(0) as u64)
  }

  async fn eligible(&self, resource_id: Uuid) -> Result<Vec<Response>> {
    let rows = sqlx::query_as::<_, ResponseRow>(&format!(
      "SELECT {RESPONSE_COLUMNS} FROM responses
       WHERE form_id = $1 AND processed = FALSE AND claim_owner IS NULL
       ORDER BY submitted_at, id"
    ))
    .bind(resource_id)
    .fetch_all(&self.pool)
    .await
    .context("Failed to list eligible responses")?;
    Ok(rows.into_iter().map(Response::from).collect())
  }

  async fn claim(&self, resource_id: Uuid, task_id: Uuid, only: Option<&[Uuid]>) -> Result<Vec<Response>> {
    let rows = sqlx::query_as::<_, ResponseRow>(&format!(
      "UPDATE responses SET claim_owner = $2, claim_started_at = $3
       WHERE id IN (
         SELECT id FROM responses
         WHERE form_id = $1 AND processed = FALSE
           AND (claim_owner IS NULL OR claim_owner = $2)
           AND ($4::uuid[] IS NULL OR id = ANY($4))
         FOR UPDATE SKIP LOCKED
       )
       AND processed = FALSE AND (claim_owner IS NULL OR claim_owner = $2)
       RETURNING {RESPONSE_COLUMNS}"
    ))
    .bind(resource_id)
    .bind(task_id)
    .bind(Utc::now())
    .bind(only.map(<[Uuid]>::to_vec))
    .fetch_all(&self.pool)
    .await
    .context("Failed to claim responses")?;
    let mut claimed: Vec<Response> = rows.into_iter().map(Response::from).collect();
    claimed.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then(a.id.cmp(&b.id)));
    Ok(claimed)
  }

  async fn save_analysis(&self, task_id: Uuid, response_id: Uuid, analysis: &ItemAnalysis) -> Result<bool> {
    let result = sqlx::query(
      "UPDATE responses SET analysis = $3, processed = TRUE, claim_owner = NULL, claim_started_at = NULL,
         last_analyzed = $4
       WHERE id = $1 AND claim_owner = $2",
    )
    .bind(response_id)
    .bind(task_id)
    .bind(Json(analysis))
    .bind(Utc::now())
    .execute(&self.pool)
    .await
    .context("Failed to store response analysis")?;
    Ok(result.rows_affected() == 1)
  }

  async fn mark_empty_processed(&self, resource_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
      "UPDATE responses SET processed = TRUE, analysis = NULL, canonical_topics = '{}', last_analyzed = $2
       WHERE form_id = $1 AND has_text = FALSE AND processed = FALSE AND claim_owner IS NULL",
    )
    .bind(resource_id)
    .bind(Utc::now())
    .execute(&self.pool)
    .await
    .context("Failed to mark empty responses")?;
    Ok(result.rows_affected())
  }

  async fn release_claims(&self, task_id: Uuid, resource_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
      "UPDATE responses SET processed = TRUE, claim_owner = NULL, claim_started_at = NULL
       WHERE form_id = $1 AND claim_owner = $2",
    )
    .bind(resource_id)
    .bind(task_id)
    .execute(&self.pool)
    .await
    .context("Failed to release claims")?;
    Ok(result.rows_affected())
  }

  async fn reset_claims(&self, task_id: Uuid, resource_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
      "UPDATE responses SET claim_owner = NULL, claim_started_at = NULL
       WHERE form_id = $1 AND claim_owner = $2 AND processed = FALSE",
    )
    .bind(resource_id)
    .bind(task_id)
    .execute(&self.pool)
    .await
    .context("Failed to reset claims")?;
    Ok(result.rows_affected())
  }

  async fn reset_foreign_claims(&self, resource_id: Uuid, keep: Uuid) -> Result<u64> {
    let result = sqlx::query(
      "UPDATE responses SET claim_owner = NULL, claim_started_at = NULL
       WHERE form_id = $1 AND claim_owner IS NOT NULL AND claim_owner <> $2",
    )
    .bind(resource_id)
    .bind(keep)
    .execute(&self.pool)
    .await
    .context("Failed to reset stale claims")?;
    Ok(result.rows_affected())
  }

  async fn stale_claims(&self, before: DateTime<Utc>) -> Result<Vec<(Uuid, Uuid)>> {
    sqlx::query_as::<_, (Uuid, Uuid)>(
      "SELECT DISTINCT form_id, claim_owner FROM responses
       WHERE claim_owner IS NOT NULL AND processed = FALSE AND claim_started_at < $1
       ORDER BY form_id, claim_owner",
    )
    .bind(before)
    .fetch_all(&self.pool)
    .await
    .context("Failed to scan stale claims")
  }

  async fn reprocess(&self, resource_id: Uuid, only_unprocessed: bool) -> Result<u64> {
    let result = sqlx::query(
      "UPDATE responses SET processed = FALSE, analysis = NULL, canonical_topics = '{}',
         claim_owner = NULL, claim_started_at = NULL
       WHERE form_id = $1 AND has_text = TRUE AND ($2 = FALSE OR processed = FALSE)",
    )
    .bind(resource_id)
    .bind(only_unprocessed)
    .execute(&self.pool)
    .await
    .context("Failed to mark responses for reprocessing")?;
    Ok(result.rows_affected())
  }

  async fn reprocess_one(&self, resource_id: Uuid, response_id: Uuid) -> Result<bool> {
    let result = sqlx::query(
      "UPDATE responses SET processed = FALSE, analysis = NULL, canonical_topics = '{}',
         claim_owner = NULL, claim_started_at = NULL
       WHERE id = $1 AND form_id = $2 AND has_text = TRUE",
    )
    .bind(response_id)
    .bind(resource_id)
    .execute(&self.pool)
    .await
    .context("Failed to mark response for reprocessing")?;
    Ok(result.rows_affected() == 1)
  }

  async fn processed_responses(&self, resource_id: Uuid) -> Result<Vec<Response>> {
    let rows = sqlx::query_as::<_, ResponseRow>(&format!(
      "SELECT {RESPONSE_COLUMNS} FROM responses WHERE form_id = $1 AND processed = TRUE ORDER BY submitted_at, id"
    ))
    .bind(resource_id)
    .fetch_all(&self.pool)
    .await
    .context("Failed to list processed responses")?;
    Ok(rows.into_iter().map(Response::from).collect())
  }

  async fn set_canonical_topics(&self, response_id: Uuid, topics: &[String]) -> Result<()> {
    sqlx::query("UPDATE responses SET canonical_topics = $2 WHERE id = $1")
      .bind(response_id)
      .bind(topics)
      .execute(&self.pool)
      .await
      .context("Failed to store canonical topics")?;
    Ok(())
  }
}

#[async_trait]
impl FormStore for PgStore {
  async fn insert_form(&self, form: &Form) -> Result<()> {
    sqlx::query("INSERT INTO forms (id, title, questions, analytics) VALUES ($1, $2, $3, $4)")
      .bind(form.id)
      .bind(&form.title)
      .bind(Json(&form.questions))
      .bind(&form.analytics)
      .execute(&self.pool)
      .await
      .context("Failed to insert form")?;
    Ok(())
  }

  async fn get_form(&self, form_id: Uuid) -> Result<Option<Form>> {
    let row = sqlx::query_as::<_, FormRow>(
      "SELECT id, title, questions, analytics, analytics_updated_at FROM forms WHERE id = $1",
    )
    .bind(form_id)
    .fetch_optional(&self.pool)
    .await
    .context("Failed to fetch form")?;
    Ok(row.map(Form::from))
  }

  async fn save_aggregate(&self, form_id: Uuid, aggregate: &Value) -> Result<()> {
    sqlx::query("UPDATE forms SET analytics = $2 WHERE id = $1")
      .bind(form_id)
      .bind(aggregate)
      .execute(&self.pool)
      .await
      .context("Failed to store aggregate")?;
    Ok(())
  }

  async fn save_insight(&self, form_id: Uuid, kind: InsightKind, value: &Value) -> Result<()> {
    sqlx::query(
      "UPDATE forms
       SET analytics = jsonb_set(analytics, ARRAY['insights', $2::text], $3, true)
       WHERE id = $1 AND analytics ? 'insights'",
    )
    .bind(form_id)
    .bind(kind.field_name())
    .bind(value)
    .execute(&self.pool)
    .await
    .with_context(|| format!("Failed to store {} insight", kind.field_name()))?;
    Ok(())
  }

  async fn finalize_analytics(&self, form_id: Uuid, at: DateTime<Utc>) -> Result<()> {
    sqlx::query(
      "UPDATE forms SET analytics = jsonb_set(analytics, '{lastUpdated}', $2, true), analytics_updated_at = $3
       WHERE id = $1 AND analytics IS NOT NULL",
    )
    .bind(form_id)
    .bind(Json(at))
    .bind(at)
    .execute(&self.pool)
    .await
    .context("Failed to finalize analytics")?;
    Ok(())
  }
}

#[async_trait]
impl DeadLetterSink for PgStore {
  async fn record(&self, record: &DeadLetterRecord) -> Result<()> {
    sqlx::query(
      "INSERT INTO dead_letters
         (original_stage, job_id, task_id, resource_id, payload, failure_reason, attempts_made, max_attempts, failed_at)
       VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(record.original_stage.as_str())
    .bind(record.job_id)
    .bind(record.task_id)
    .bind(record.resource_id)
    .bind(&record.payload)
    .bind(&record.failure_reason)
    .bind(record.attempts_made as i32)
    .bind(record.max_attempts as i32)
    .bind(record.failed_at)
    .execute(&self.pool)
    .await
    .context("Failed to record dead letter")?;
    Ok(())
  }

  async fn list(&self, task_id: Option<Uuid>, limit: usize) -> Result<Vec<DeadLetterRecord>> {
    let rows = sqlx::query_as::<_, DeadLetterRow>(
      "SELECT original_stage, job_id, task_id, resource_id, payload, failure_reason, attempts_made, max_attempts,
         failed_at
       FROM dead_letters
       WHERE ($1::uuid IS NULL OR task_id = $1)
       ORDER BY failed_at DESC
       LIMIT $2",
    )
    .bind(task_id)
    .bind(limit as i64)
    .fetch_all(&self.pool)
    .await
    .context("Failed to list dead letters")?;
    rows.into_iter().map(DeadLetterRecord::try_from).collect()
  }
}

#[async_trait]
impl JobLedger for PgStore {
  async fn register(&self, job: &Job) -> Result<()> {
    sqlx::query(
      "INSERT INTO stage_jobs (id, stage, task_id, resource_id, payload)
       VALUES ($1, $2, $3, $4, $5)
       ON CONFLICT (id) DO NOTHING",
    )
    .bind(job.id)
    .bind(job.stage.as_str())
    .bind(job.task_id)
    .bind(job.resource_id)
    .bind(Json(&job.payload))
    .execute(&self.pool)
    .await
    .context("Failed to register stage job")?;
    Ok(())
  }

  async fn record_attempt(&self, job: &Job) -> Result<u32> {
    let attempts: i32 = sqlx::query_scalar(
      "INSERT INTO stage_jobs (id, stage, task_id, resource_id, payload, status, attempts)
       VALUES ($1, $2, $3, $4, $5, 'running', 1)
       ON CONFLICT (id) DO UPDATE
         SET attempts = stage_jobs.attempts + 1, status = 'running', updated_at = NOW()
       RETURNING attempts",
    )
    .bind(job.id)
    .bind(job.stage.as_str())
    .bind(job.task_id)
    .bind(job.resource_id)
    .bind(Json(&job.payload))
    .fetch_one(&self.pool)
    .await
    .context("Failed to count job attempt")?;
    Ok(attempts.max(0) as u32)
  }

  async fn finish(&self, job_id: Uuid, outcome: &JobOutcome) -> Result<()> {
    sqlx::query("UPDATE stage_jobs SET status = $2, reason = $3, updated_at = NOW() WHERE id = $1")
      .bind(job_id)
      .bind(outcome.status())
      .bind(outcome.reason())
      .execute(&self.pool)
      .await
      .context("Failed to record job outcome")?;
    Ok(())
  }

  async fn outcome(&self, job_id: Uuid) -> Result<Option<JobOutcome>> {
    let row: Option<(String, Option<String>)> =
      sqlx::query_as("SELECT status, reason FROM stage_jobs WHERE id = $1")
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to read job outcome")?;
    Ok(row.and_then(|(status, reason)| JobOutcome::from_parts(&status, reason)))
  }

  async fn wait(&self, job_id: Uuid) -> Result<JobOutcome> {
    let mut ticker = tokio::time::interval(LEDGER_POLL_INTERVAL);
    loop {
      ticker.tick().await;
      if let Some(outcome) = self.outcome(job_id).await? {
        return Ok(outcome);
      }
    }
  }
}
