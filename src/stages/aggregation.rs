use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use super::{PipelineContext, StageHandler, unexpected_payload};
use crate::aggregate;
use crate::error::PipelineResult;
use crate::models::{Job, JobPayload};

pub struct AggregationStage {
  ctx: PipelineContext,
}

impl AggregationStage {
  pub fn new(ctx: PipelineContext) -> Self {
    Self { ctx }
  }
}

#[async_trait]
impl StageHandler for AggregationStage {
  async fn handle(&self, job: &Job) -> PipelineResult<()> {
    if !matches!(job.payload, JobPayload::Aggregate) {
      return Err(unexpected_payload(job));
    }
    let ctx = &self.ctx;
    let reporter = ctx.reporter(job.task_id);
    let form = ctx.load_form(job.resource_id).await?;

    reporter.progress(58, "Loading analyzed responses").await;
    let responses = ctx.claims.processed_responses(job.resource_id).await?;

    reporter.progress(65, format!("Computing statistics over {} responses", responses.len())).await;
    let mut result = aggregate::compute(&form, &responses);
    result.last_updated = Some(Utc::now());
    let document = serde_json::to_value(&result)?;
    ctx.forms.save_aggregate(job.resource_id, &document).await?;

    reporter.progress(70, "Statistics saved").await;
    info!(
      task_id = %job.task_id, resource_id = %job.resource_id,
      responses = result.total_responses_analyzed, topics = result.topic_distribution.len(),
      "Aggregate stored"
    );
    Ok(())
  }
}
