use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::PipelineError;
use crate::models::{DeadLetterRecord, Job, JobOutcome};
use crate::queue::{Delivery, JobQueue};
use crate::stages::StageBinding;
use crate::stores::{DeadLetterSink, JobLedger};
use crate::worker_scheduler::Scheduler;

/// Consumes one stage queue: buffers deliveries by priority and runs up to
/// `concurrency` of them at once.
pub struct StageWorker {
  binding: StageBinding,
  queue: Arc<dyn JobQueue>,
  ledger: Arc<dyn JobLedger>,
  dead_letters: Arc<dyn DeadLetterSink>,
}

impl StageWorker {
  pub fn new(
    binding: StageBinding,
    queue: Arc<dyn JobQueue>,
    ledger: Arc<dyn JobLedger>,
    dead_letters: Arc<dyn DeadLetterSink>,
  ) -> Self {
    Self { binding, queue, ledger, dead_letters }
  }

  pub fn spawn(self) -> JoinHandle<Result<()>> {
    tokio::spawn(self.run())
  }

  async fn run(self) -> Result<()> {
    let stage = self.binding.stage;
    let mut deliveries = self.queue.subscribe(stage).await?;
    let scheduler = Arc::new(Scheduler::new());
    let semaphore = Arc::new(Semaphore::new(self.binding.concurrency));
    info!(%stage, concurrency = self.binding.concurrency, "Stage consumer started");

    let scheduler_consumer = scheduler.clone();
    tokio::spawn(async move {
      while let Some(delivery) = deliveries.next().await {
        scheduler_consumer.add(delivery).await;
      }
      warn!(%stage, "Delivery stream ended");
    });

    let worker = Arc::new(self);
    loop {
      let scheduled = scheduler.next().await;
      let permit = semaphore.clone().acquire_owned().await?;
      let worker = worker.clone();
      tokio::spawn(async move {
        worker.process(scheduled.delivery).await;
        drop(permit);
      });
    }
  }

  async fn process(&self, delivery: Delivery) {
    let outcome = run_job(&self.binding, &delivery.job, self.ledger.as_ref(), self.dead_letters.as_ref()).await;
    if let Err(e) = self.ledger.finish(delivery.job.id, &outcome).await {
      error!(job_id = %delivery.job.id, "Failed to record job outcome: {:#}", e);
    }
    delivery.ack().await;
  }
}

/// Runs a job through its stage's retry budget and returns the final outcome.
/// Transient failures back off exponentially; exhausting the budget writes one
/// dead-letter record. Fatal failures end the job at once.
pub async fn run_job(
  binding: &StageBinding,
  job: &Job,
  ledger: &dyn JobLedger,
  dead_letters: &dyn DeadLetterSink,
) -> JobOutcome {
  let policy = binding.policy;
  let mut local_attempts = 0;
  loop {
    local_attempts += 1;
    let attempt = match ledger.record_attempt(job).await {
      Ok(attempts) => attempts.max(local_attempts),
      Err(e) => {
        warn!(job_id = %job.id, "Failed to count attempt: {:#}", e);
        local_attempts
      }
    };

    let result = match policy.timeout {
      Some(limit) => match tokio::time::timeout(limit, binding.handler.handle(job)).await {
        Ok(result) => result,
        Err(_) => Err(PipelineError::Analysis(format!("attempt timed out after {limit:?}"))),
      },
      None => binding.handler.handle(job).await,
    };

    let err = match result {
      Ok(()) => {
        info!(stage = %job.stage, job_id = %job.id, task_id = %job.task_id, attempt, "Job succeeded");
        return JobOutcome::Succeeded;
      }
      Err(err) => err,
    };

    if !err.is_retryable() {
      error!(stage = %job.stage, job_id = %job.id, task_id = %job.task_id, "Job failed: {}", err);
      return JobOutcome::Failed(err.to_string());
    }

    if attempt >= policy.max_attempts {
      error!(
        stage = %job.stage, job_id = %job.id, task_id = %job.task_id, attempt,
        "Retry budget exhausted, dead-lettering: {}", err
      );
      let record = DeadLetterRecord {
        original_stage: job.stage,
        job_id: job.id,
        task_id: job.task_id,
        resource_id: job.resource_id,
        payload: serde_json::to_value(&job.payload).unwrap_or_default(),
        failure_reason: err.to_string(),
        attempts_made: attempt,
        max_attempts: policy.max_attempts,
        failed_at: Utc::now(),
      };
      if let Err(e) = dead_letters.record(&record).await {
        error!(job_id = %job.id, "Failed to write dead letter: {:#}", e);
      }
      return JobOutcome::DeadLettered(err.to_string());
    }

    let delay = policy.delay_after(attempt);
    warn!(
      stage = %job.stage, job_id = %job.id, attempt, max_attempts = policy.max_attempts,
      "Attempt failed, retrying in {:?}: {}", delay, err
    );
    tokio::time::sleep(delay).await;
  }
}

pub fn spawn_stage_workers(
  bindings: Vec<StageBinding>,
  queue: Arc<dyn JobQueue>,
  ledger: Arc<dyn JobLedger>,
  dead_letters: Arc<dyn DeadLetterSink>,
) -> Vec<JoinHandle<Result<()>>> {
  bindings
    .into_iter()
    .map(|binding| StageWorker::new(binding, queue.clone(), ledger.clone(), dead_letters.clone()).spawn())
    .collect()
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::time::Duration;

  use async_trait::async_trait;
  use uuid::Uuid;

  use super::*;
  use crate::error::PipelineResult;
  use crate::models::{JobPayload, Stage};
  use crate::queue::RetryPolicy;
  use crate::stages::StageHandler;
  use crate::stores::MemoryStore;

  struct Flaky {
    calls: AtomicU32,
    succeed_on: u32,
    fatal: bool,
  }

  #[async_trait]
  impl StageHandler for Flaky {
    async fn handle(&self, _job: &Job) -> PipelineResult<()> {
      let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
      if self.fatal {
        return Err(PipelineError::not_found("form", "missing"));
      }
      if call >= self.succeed_on { Ok(()) } else { Err(PipelineError::Analysis("service down".into())) }
    }
  }

  fn binding(handler: Arc<Flaky>) -> StageBinding {
    StageBinding {
      stage: Stage::Aggregation,
      handler,
      policy: RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
        timeout: Some(Duration::from_secs(1)),
      },
      concurrency: 1,
    }
  }

  fn job() -> Job {
    Job::new(Stage::Aggregation, Uuid::new_v4(), Uuid::new_v4(), JobPayload::Aggregate)
  }

  #[tokio::test]
  async fn transient_failures_are_retried() {
    let store = MemoryStore::new();
    let handler = Arc::new(Flaky { calls: AtomicU32::new(0), succeed_on: 3, fatal: false });
    let outcome = run_job(&binding(handler.clone()), &job(), &store, &store).await;
    assert_eq!(outcome, JobOutcome::Succeeded);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    assert!(store.list(None, 10).await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn exhausted_budget_writes_one_dead_letter() {
    let store = MemoryStore::new();
    let handler = Arc::new(Flaky { calls: AtomicU32::new(0), succeed_on: u32::MAX, fatal: false });
    let job = job();
    let outcome = run_job(&binding(handler.clone()), &job, &store, &store).await;
    assert!(matches!(outcome, JobOutcome::DeadLettered(_)));
    let letters = store.list(Some(job.task_id), 10).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].attempts_made, 3);
    assert_eq!(letters[0].original_stage, Stage::Aggregation);
  }

  #[tokio::test]
  async fn fatal_errors_skip_the_retry_budget() {
    let store = MemoryStore::new();
    let handler = Arc::new(Flaky { calls: AtomicU32::new(0), succeed_on: 1, fatal: true });
    let outcome = run_job(&binding(handler.clone()), &job(), &store, &store).await;
    assert!(matches!(outcome, JobOutcome::Failed(_)));
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    assert!(store.list(None, 10).await.unwrap().is_empty());
  }
}
