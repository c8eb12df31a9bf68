use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::PipelineResult;
use crate::lease::{resource_key, sweep_stale_claims};
use crate::models::{EventKind, Task, TaskState};
use crate::stages::PipelineContext;

const ABANDONED_MESSAGE: &str = "Analytics run was abandoned by its worker";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HousekeepingReport {
  pub claims_reset: u64,
  pub tasks_abandoned: u64,
  pub tasks_purged: u64,
}

fn ago(now: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
  now - chrono::Duration::milliseconds(span.as_millis().min(i64::MAX as u128) as i64)
}

/// A running task is abandoned once it outlived its lease TTL without a live
/// lease; a queued one once it waited longer than a whole run may take.
fn is_abandoned(task: &Task, now: DateTime<Utc>, ctx: &PipelineContext) -> bool {
  match task.state {
    TaskState::Running => task.started_at.unwrap_or(task.created_at) < ago(now, ctx.settings.lease_ttl),
    TaskState::New | TaskState::Pending => task.created_at < ago(now, ctx.settings.run_deadline),
    _ => false,
  }
}

async fn finalize_abandoned(ctx: &PipelineContext) -> PipelineResult<u64> {
  let now = Utc::now();
  let mut abandoned = 0;
  for task in ctx.tasks.stale_active(ago(now, ctx.settings.lease_ttl)).await? {
    if !is_abandoned(&task, now, ctx) {
      continue;
    }
    let holder = ctx.leases.current(&resource_key(task.resource_id)).await?;
    if holder.is_some_and(|lease| lease.task_id == task.task_id) {
      continue;
    }
    let next = if task.state == TaskState::New { TaskState::Canceled } else { TaskState::Failed };
    if let Err(e) = ctx.tasks.transition(task.task_id, next, Some(ABANDONED_MESSAGE.to_string()), None).await {
      debug!(task_id = %task.task_id, "Abandoned task moved on before cleanup: {}", e);
      continue;
    }
    if let Err(e) = ctx.claims.reset_claims(task.task_id, task.resource_id).await {
      warn!(task_id = %task.task_id, "Failed to reset claims: {:#}", e);
    }
    warn!(task_id = %task.task_id, resource_id = %task.resource_id, from = %task.state, "Finalized abandoned run");
    let reporter = ctx.reporter(task.task_id);
    reporter.emit(reporter.event(EventKind::Error, task.progress, ABANDONED_MESSAGE)).await;
    abandoned += 1;
  }
  Ok(abandoned)
}

/// One pass: stale claims back to the pool, abandoned runs finalized, expired
/// tasks deleted.
pub async fn run_once(ctx: &PipelineContext) -> PipelineResult<HousekeepingReport> {
  let claims_reset = sweep_stale_claims(ctx.claims.as_ref(), ctx.leases.as_ref(), ctx.settings.claim_ttl).await?;
  let tasks_abandoned = finalize_abandoned(ctx).await?;
  let tasks_purged = ctx.tasks.purge_expired().await?;
  let report = HousekeepingReport { claims_reset, tasks_abandoned, tasks_purged };
  if report == HousekeepingReport::default() {
    debug!("Housekeeping pass, nothing to do");
  } else {
    info!(claims_reset, tasks_abandoned, tasks_purged, "Housekeeping pass");
  }
  Ok(report)
}

pub fn spawn_housekeeping(ctx: PipelineContext) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(ctx.settings.claim_sweep_interval);
    loop {
      ticker.tick().await;
      if let Err(e) = run_once(&ctx).await {
        error!("Housekeeping failed: {}", e);
      }
    }
  })
}
