use std::collections::HashMap;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{PipelineContext, StageHandler, unexpected_payload};
use crate::analysis::{
  AnalysisInput, AnalysisKind, QuoteResult, SentimentResult, TopicResult, merge_chunk, parse_results,
};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{EventKind, Form, Job, JobPayload, Response, TaskState};
use crate::progress::band;

/// Analyzes one wave of chunks: claims the wave's responses, runs the three
/// analyses per chunk and stores the merged result on each response.
pub struct ResponseAnalysisStage {
  ctx: PipelineContext,
}

impl ResponseAnalysisStage {
  pub fn new(ctx: PipelineContext) -> Self {
    Self { ctx }
  }

  async fn analyze_chunk(&self, form: &Form, task_id: Uuid, items: Vec<&Response>) -> PipelineResult<Vec<Uuid>> {
    if items.is_empty() {
      return Ok(Vec::new());
    }
    let ids: Vec<Uuid> = items.iter().map(|r| r.id).collect();
    let inputs: Vec<AnalysisInput> = items.iter().map(|r| AnalysisInput::from_response(r, form)).collect();

    let analysis = &self.ctx.analysis;
    let (topics, sentiment, quotes) = tokio::join!(
      analysis.analyze(AnalysisKind::Topics, &inputs),
      analysis.analyze(AnalysisKind::Sentiment, &inputs),
      analysis.analyze(AnalysisKind::Quotes, &inputs),
    );
    if let (Err(e), Err(_), Err(_)) = (&topics, &sentiment, &quotes) {
      return Err(PipelineError::Analysis(format!("{e:#}")));
    }

    let topics = parsed::<TopicResult>(AnalysisKind::Topics, topics)?;
    let sentiment = parsed::<SentimentResult>(AnalysisKind::Sentiment, sentiment)?;
    let quotes = parsed::<QuoteResult>(AnalysisKind::Quotes, quotes)?;

    let mut saved = Vec::new();
    for (response_id, item) in merge_chunk(&ids, topics, sentiment, quotes) {
      if self.ctx.claims.save_analysis(task_id, response_id, &item).await? {
        saved.push(response_id);
      } else {
        debug!(%task_id, %response_id, "Response no longer claimed, result dropped");
      }
    }
    Ok(saved)
  }
}

/// One failed analysis kind degrades the chunk instead of failing it.
fn parsed<T: serde::de::DeserializeOwned>(
  kind: AnalysisKind,
  result: anyhow::Result<Value>,
) -> PipelineResult<Option<Vec<T>>> {
  match result {
    Ok(value) => Ok(Some(parse_results(value)?)),
    Err(e) => {
      warn!(?kind, "Analysis call failed, continuing without it: {:#}", e);
      Ok(None)
    }
  }
}

#[async_trait]
impl StageHandler for ResponseAnalysisStage {
  async fn handle(&self, job: &Job) -> PipelineResult<()> {
    let JobPayload::AnalyzeWave { wave_index, total_waves, chunks } = &job.payload else {
      return Err(unexpected_payload(job));
    };
    let ctx = &self.ctx;
    if !ctx.tasks.get(job.task_id).await?.is_some_and(|t| t.state == TaskState::Running) {
      debug!(task_id = %job.task_id, wave = wave_index, "Run is no longer active, skipping wave");
      return Ok(());
    }
    let form = ctx.load_form(job.resource_id).await?;
    let wave_ids: Vec<Uuid> = chunks.iter().flatten().copied().collect();
    let claimed = ctx.claims.claim(job.resource_id, job.task_id, Some(&wave_ids)).await?;
    if claimed.is_empty() {
      debug!(task_id = %job.task_id, wave = wave_index, "Nothing left to claim in wave");
      return Ok(());
    }

    let reporter = ctx.reporter(job.task_id);
    let claimed_ids: Vec<Uuid> = claimed.iter().map(|r| r.id).collect();
    reporter
      .emit(
        reporter
          .event(
            EventKind::ResponsesProcessing,
            band(5, 45, *wave_index, *total_waves),
            format!("Analyzing batch {}/{} ({} responses)", wave_index + 1, total_waves, claimed_ids.len()),
          )
          .with_ids(claimed_ids),
      )
      .await;

    let by_id: HashMap<Uuid, Response> = claimed.into_iter().map(|r| (r.id, r)).collect();
    let results = join_all(chunks.iter().map(|chunk| {
      let items: Vec<&Response> = chunk.iter().filter_map(|id| by_id.get(id)).collect();
      self.analyze_chunk(&form, job.task_id, items)
    }))
    .await;

    let mut processed = Vec::new();
    let mut first_error = None;
    for result in results {
      match result {
        Ok(ids) => processed.extend(ids),
        Err(e) => {
          warn!(task_id = %job.task_id, wave = wave_index, "Chunk analysis failed: {}", e);
          first_error.get_or_insert(e);
        }
      }
    }

    if !processed.is_empty() {
      reporter
        .emit(
          reporter
            .event(
              EventKind::ResponsesProcessed,
              band(5, 45, wave_index + 1, *total_waves),
              format!("Analyzed {} responses in batch {}/{}", processed.len(), wave_index + 1, total_waves),
            )
            .with_ids(processed.clone()),
        )
        .await;
    }

    if let Some(err) = first_error {
      return Err(err);
    }
    ctx.claims.release_claims(job.task_id, job.resource_id).await?;
    info!(task_id = %job.task_id, wave = wave_index, processed = processed.len(), "Wave analyzed");
    Ok(())
  }
}
