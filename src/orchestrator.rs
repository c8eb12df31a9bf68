//! Drives one analytics run end to end: lease, claims, stage sequencing and
//! the single place where a run is finalized, successfully or not.

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::batch::{plan_chunks, plan_waves};
use crate::error::{PipelineError, PipelineResult};
use crate::lease::{LeaseHeartbeat, resource_key};
use crate::models::{
  DEFAULT_PRIORITY, EventKind, FORCE_REFRESH_PRIORITY, InsightKind, Job, JobOutcome, JobPayload, Stage, TaskState,
};
use crate::progress::{ProgressReporter, band};
use crate::stages::{PipelineContext, StageHandler, unexpected_payload};

pub struct Orchestrator {
  ctx: PipelineContext,
}

impl Orchestrator {
  pub fn new(ctx: PipelineContext) -> Self {
    Self { ctx }
  }

  pub fn context(&self) -> &PipelineContext {
    &self.ctx
  }

  /// Starts a run for the form unless one is already active.
  pub async fn request_run(&self, resource_id: Uuid, force_refresh: bool) -> PipelineResult<Uuid> {
    self.request_run_with_id(Uuid::new_v4(), resource_id, force_refresh).await
  }

  /// Same as `request_run` with a caller-chosen task id, so a subscriber can
  /// attach before the first event.
  pub async fn request_run_with_id(&self, task_id: Uuid, resource_id: Uuid, force_refresh: bool) -> PipelineResult<Uuid> {
    let ctx = &self.ctx;
    ctx.load_form(resource_id).await?;
    ctx.tasks.create(task_id, resource_id, &ctx.instance_id).await?;

    let key = resource_key(resource_id);
    if ctx.leases.acquire(&key, task_id, &ctx.instance_id, ctx.settings.lease_ttl).await?.is_none() {
      let busy = PipelineError::Busy { resource_id };
      ctx.tasks.transition(task_id, TaskState::Canceled, Some(busy.to_string()), None).await?;
      info!(%task_id, %resource_id, "Run refused, form is busy");
      return Err(busy);
    }
    ctx.tasks.transition(task_id, TaskState::Pending, Some("Waiting for a worker".to_string()), None).await?;

    let reporter = ctx.reporter(task_id);
    reporter.emit(reporter.event(EventKind::Start, 0, "Analytics run started")).await;

    let priority = if force_refresh { FORCE_REFRESH_PRIORITY } else { DEFAULT_PRIORITY };
    let job = Job::new(Stage::Orchestrate, task_id, resource_id, JobPayload::Orchestrate { force_refresh })
      .with_priority(priority);
    if let Err(err) = self.enqueue(&job).await {
      error!(%task_id, %resource_id, "Failed to enqueue run: {}", err);
      if let Err(e) = ctx.leases.release(&key, task_id, &ctx.instance_id).await {
        warn!(%task_id, "Failed to release lease: {:#}", e);
      }
      if let Err(e) = ctx.tasks.transition(task_id, TaskState::Failed, Some(err.public_message()), None).await {
        warn!(%task_id, "Failed to mark task failed: {}", e);
      }
      reporter.emit(reporter.event(EventKind::Error, 0, err.public_message())).await;
      return Err(err);
    }
    info!(%task_id, %resource_id, force_refresh, "Analytics run queued");
    Ok(task_id)
  }

  /// Makes the form's text responses claimable again. Refused while a run
  /// holds the form.
  pub async fn reprocess_all(&self, resource_id: Uuid, only_unprocessed: bool) -> PipelineResult<u64> {
    self.ctx.load_form(resource_id).await?;
    self.ensure_idle(resource_id).await?;
    let modified = self.ctx.claims.reprocess(resource_id, only_unprocessed).await?;
    info!(%resource_id, modified, only_unprocessed, "Responses reset for reprocessing");
    Ok(modified)
  }

  /// Returns false when the response has no free text to analyze.
  pub async fn reprocess_response(&self, resource_id: Uuid, response_id: Uuid) -> PipelineResult<bool> {
    self.ctx.load_form(resource_id).await?;
    self.ensure_idle(resource_id).await?;
    let response = self
      .ctx
      .claims
      .get_response(response_id)
      .await?
      .filter(|r| r.form_id == resource_id)
      .ok_or_else(|| PipelineError::not_found("response", response_id))?;
    if !response.has_text_content() {
      return Ok(false);
    }
    Ok(self.ctx.claims.reprocess_one(resource_id, response_id).await?)
  }

  async fn ensure_idle(&self, resource_id: Uuid) -> PipelineResult<()> {
    let live = self.ctx.leases.current(&resource_key(resource_id)).await?;
    if live.is_some_and(|lease| lease.is_live(Utc::now())) {
      return Err(PipelineError::Busy { resource_id });
    }
    Ok(())
  }

  async fn enqueue(&self, job: &Job) -> PipelineResult<()> {
    self.ctx.ledger.register(job).await?;
    self.ctx.queue.publish(job).await?;
    Ok(())
  }

  /// Publishes a stage job and waits for its final outcome.
  async fn dispatch(&self, job: &Job) -> PipelineResult<JobOutcome> {
    self.enqueue(job).await?;
    Ok(self.ctx.ledger.wait(job.id).await?)
  }

  async fn drive(&self, job: &Job, force_refresh: bool) -> PipelineResult<()> {
    let ctx = &self.ctx;
    let (task_id, resource_id) = (job.task_id, job.resource_id);
    let key = resource_key(resource_id);
    let reporter = ctx.reporter(task_id);

    if ctx.leases.acquire(&key, task_id, &ctx.instance_id, ctx.settings.lease_ttl).await?.is_none() {
      let busy = PipelineError::Busy { resource_id };
      self.fail(task_id, resource_id, &key, &busy, &reporter).await;
      return Err(busy);
    }
    if let Err(e) = ctx
      .tasks
      .transition(task_id, TaskState::Running, Some("Analytics run in progress".to_string()), Some(&ctx.instance_id))
      .await
    {
      warn!(%task_id, "Run cannot start: {}", e);
      // A redelivered run whose worker died mid-flight: nobody else will finish it.
      if matches!(ctx.tasks.get(task_id).await, Ok(Some(ref task)) if task.state == TaskState::Running) {
        self.fail(task_id, resource_id, &key, &e, &reporter).await;
        return Err(e);
      }
      if let Err(e) = ctx.leases.release(&key, task_id, &ctx.instance_id).await {
        warn!(%task_id, "Failed to release lease: {:#}", e);
      }
      return Err(e);
    }

    let heartbeat =
      LeaseHeartbeat::spawn(ctx.leases.clone(), key.clone(), task_id, ctx.instance_id.clone(), ctx.settings.lease_ttl);
    let deadline = ctx.settings.run_deadline;
    let result = match tokio::time::timeout(deadline, self.run_stages(job, force_refresh, &heartbeat, &reporter)).await {
      Ok(result) => result,
      Err(_) => Err(PipelineError::DeadlineExceeded(deadline)),
    };
    drop(heartbeat);

    let stats = match result {
      Ok(stats) => stats,
      Err(err) => {
        self.fail(task_id, resource_id, &key, &err, &reporter).await;
        return Err(err);
      }
    };

    ctx.tasks.transition(task_id, TaskState::Completed, Some("Analytics complete".to_string()), None).await?;
    if let Err(e) = ctx.leases.release(&key, task_id, &ctx.instance_id).await {
      warn!(%task_id, "Failed to release lease: {:#}", e);
    }
    reporter.emit(reporter.event(EventKind::Complete, 100, "Analytics complete").with_stats(stats)).await;
    info!(%task_id, %resource_id, "Analytics run completed");
    Ok(())
  }

  async fn run_stages(
    &self,
    job: &Job,
    force_refresh: bool,
    heartbeat: &LeaseHeartbeat,
    reporter: &ProgressReporter,
  ) -> PipelineResult<serde_json::Value> {
    let ctx = &self.ctx;
    let (task_id, resource_id) = (job.task_id, job.resource_id);
    let form = ctx.load_form(resource_id).await?;

    let foreign = ctx.claims.reset_foreign_claims(resource_id, task_id).await?;
    if foreign > 0 {
      warn!(%task_id, %resource_id, foreign, "Cleared claims left by earlier runs");
    }
    if force_refresh {
      let reset = ctx.claims.reprocess(resource_id, false).await?;
      info!(%task_id, reset, "Forced refresh, all text responses will be reanalyzed");
    }
    ctx.claims.mark_empty_processed(resource_id).await?;

    let items = ctx.claims.eligible(resource_id).await?;
    reporter.progress(2, format!("Found {} responses to analyze in \"{}\"", items.len(), form.title)).await;
    if !items.is_empty() {
      let ids = items.iter().map(|r| r.id).collect();
      reporter.emit(reporter.event(EventKind::ResponsesClaimed, 3, "Responses queued for analysis").with_ids(ids)).await;
    }

    let waves = plan_waves(plan_chunks(&items), ctx.settings.wave_concurrency);
    let total_waves = waves.len();
    let mut failed_waves = 0;
    for (wave_index, chunks) in waves.into_iter().enumerate() {
      heartbeat.ensure_held()?;
      let wave = Job::new(
        Stage::ResponseAnalysis,
        task_id,
        resource_id,
        JobPayload::AnalyzeWave { wave_index, total_waves, chunks },
      )
      .with_priority(job.priority);
      match self.dispatch(&wave).await? {
        JobOutcome::Succeeded => {}
        JobOutcome::DeadLettered(reason) => {
          warn!(%task_id, wave = wave_index, "Batch exhausted its retries: {}", reason);
          failed_waves += 1;
          ctx.claims.reset_claims(task_id, resource_id).await?;
        }
        JobOutcome::Failed(reason) => {
          return Err(PipelineError::StageFailed { stage: wave.stage, job_id: wave.id, reason });
        }
      }
      reporter
        .progress(band(5, 45, wave_index + 1, total_waves), format!("Analyzed batch {}/{}", wave_index + 1, total_waves))
        .await;
    }
    if total_waves > 0 && failed_waves == total_waves {
      return Err(PipelineError::NoProgress { failed: failed_waves });
    }
    ctx.claims.release_claims(task_id, resource_id).await?;

    heartbeat.ensure_held()?;
    reporter.progress(45, "Clustering topics").await;
    let clustering = Job::new(Stage::TopicClustering, task_id, resource_id, JobPayload::ClusterTopics);
    match self.dispatch(&clustering).await? {
      JobOutcome::Succeeded => {}
      JobOutcome::DeadLettered(reason) => warn!(%task_id, "Topic clustering gave up, keeping raw topics: {}", reason),
      JobOutcome::Failed(reason) => {
        return Err(PipelineError::StageFailed { stage: clustering.stage, job_id: clustering.id, reason });
      }
    }
    reporter.progress(55, "Topics clustered").await;

    heartbeat.ensure_held()?;
    let aggregation = Job::new(Stage::Aggregation, task_id, resource_id, JobPayload::Aggregate);
    match self.dispatch(&aggregation).await? {
      JobOutcome::Succeeded => {}
      JobOutcome::DeadLettered(reason) | JobOutcome::Failed(reason) => {
        return Err(PipelineError::StageFailed { stage: aggregation.stage, job_id: aggregation.id, reason });
      }
    }
    reporter.progress(75, "Statistics aggregated").await;

    heartbeat.ensure_held()?;
    let insight_jobs: Vec<Job> = InsightKind::ALL
      .into_iter()
      .map(|insight| Job::new(Stage::InsightGeneration, task_id, resource_id, JobPayload::GenerateInsight { insight }))
      .collect();
    let mut pending: FuturesUnordered<_> =
      insight_jobs.iter().map(|job| async move { (job, self.dispatch(job).await) }).collect();
    let mut generated = 0;
    while let Some((insight_job, outcome)) = pending.next().await {
      match outcome? {
        JobOutcome::Succeeded => {}
        JobOutcome::DeadLettered(reason) | JobOutcome::Failed(reason) => {
          return Err(PipelineError::StageFailed { stage: insight_job.stage, job_id: insight_job.id, reason });
        }
      }
      generated += 1;
      reporter
        .progress(band(75, 95, generated, insight_jobs.len()), format!("Generated insight {}/{}", generated, insight_jobs.len()))
        .await;
    }

    heartbeat.ensure_held()?;
    ctx.forms.finalize_analytics(resource_id, Utc::now()).await?;
    let analyzed = ctx.claims.processed_responses(resource_id).await?.len();
    let total = ctx.claims.count_responses(resource_id).await?;
    Ok(json!({
      "totalResponses": total,
      "totalResponsesAnalyzed": analyzed,
      "newlyAnalyzed": items.len(),
      "batches": total_waves,
      "failedBatches": failed_waves,
    }))
  }

  /// Cleanup for a failed run: claims back to the pool, lease released, task
  /// failed and subscribers told.
  async fn fail(&self, task_id: Uuid, resource_id: Uuid, key: &str, err: &PipelineError, reporter: &ProgressReporter) {
    let ctx = &self.ctx;
    error!(%task_id, %resource_id, "Analytics run failed: {}", err);
    if let Err(e) = ctx.claims.reset_claims(task_id, resource_id).await {
      warn!(%task_id, "Failed to reset claims: {:#}", e);
    }
    if let Err(e) = ctx.leases.release(key, task_id, &ctx.instance_id).await {
      warn!(%task_id, "Failed to release lease: {:#}", e);
    }
    let message = err.public_message();
    if let Err(e) = ctx.tasks.transition(task_id, TaskState::Failed, Some(message.clone()), None).await {
      warn!(%task_id, "Failed to mark task failed: {}", e);
    }
    let progress = match ctx.tasks.get(task_id).await {
      Ok(Some(task)) => task.progress,
      _ => 0,
    };
    reporter.emit(reporter.event(EventKind::Error, progress, message)).await;
  }
}

#[async_trait]
impl StageHandler for Orchestrator {
  async fn handle(&self, job: &Job) -> PipelineResult<()> {
    let JobPayload::Orchestrate { force_refresh } = &job.payload else {
      return Err(unexpected_payload(job));
    };
    self.drive(job, *force_refresh).await
  }
}
