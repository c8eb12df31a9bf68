use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use super::{PipelineContext, StageHandler, unexpected_payload};
use crate::aggregate::Aggregate;
use crate::error::PipelineResult;
use crate::insights;
use crate::models::{Form, InsightKind, Job, JobPayload};

/// Fills one field of the stored insights, from the collaborator when it
/// answers usefully and from the rule-based fallback otherwise.
pub struct InsightGenerationStage {
  ctx: PipelineContext,
}

impl InsightGenerationStage {
  pub fn new(ctx: PipelineContext) -> Self {
    Self { ctx }
  }
}

fn generated(kind: InsightKind, raw: Value) -> Option<Value> {
  match kind {
    InsightKind::Summary => insights::parse_summary(raw).map(Value::String),
    InsightKind::Findings => insights::parse_findings(raw)
      .ok()
      .filter(|findings| !findings.is_empty())
      .and_then(|findings| serde_json::to_value(findings).ok()),
    InsightKind::Recommendations => insights::parse_recommendations(raw)
      .ok()
      .filter(|recommendations| !recommendations.is_empty())
      .and_then(|recommendations| serde_json::to_value(recommendations).ok()),
  }
}

fn fallback(kind: InsightKind, form: &Form, aggregate: &Aggregate) -> PipelineResult<Value> {
  Ok(match kind {
    InsightKind::Summary => Value::String(insights::fallback_summary(&form.title, aggregate)),
    InsightKind::Findings => serde_json::to_value(insights::fallback_findings(aggregate))?,
    InsightKind::Recommendations => serde_json::to_value(insights::fallback_recommendations(aggregate))?,
  })
}

#[async_trait]
impl StageHandler for InsightGenerationStage {
  async fn handle(&self, job: &Job) -> PipelineResult<()> {
    let JobPayload::GenerateInsight { insight } = &job.payload else {
      return Err(unexpected_payload(job));
    };
    let kind = *insight;
    let ctx = &self.ctx;
    let form = ctx.load_form(job.resource_id).await?;
    let aggregate: Aggregate = form
      .analytics
      .clone()
      .and_then(|document| serde_json::from_value(document).ok())
      .unwrap_or_default();

    let context = insights::generation_context(&form, &aggregate);
    let value = match ctx.analysis.generate_insight(kind, &context).await {
      Ok(raw) => generated(kind, raw),
      Err(e) => {
        warn!(task_id = %job.task_id, ?kind, "Insight generation failed, using fallback: {:#}", e);
        None
      }
    };
    let value = match value {
      Some(value) => value,
      None => {
        info!(task_id = %job.task_id, ?kind, "Using rule-based insight");
        fallback(kind, &form, &aggregate)?
      }
    };

    ctx.forms.save_insight(job.resource_id, kind, &value).await?;
    info!(task_id = %job.task_id, field = kind.field_name(), "Insight stored");
    Ok(())
  }
}
