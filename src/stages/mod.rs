//! Stage handlers. Each consumes jobs from one queue; the orchestrator
//! sequences them through the job ledger.

mod aggregation;
mod insight_generation;
mod response_analysis;
mod topic_clustering;

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::analysis::TextAnalysisClient;
use crate::config::{PipelineSettings, StageSettings};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{Form, Job, Stage};
use crate::orchestrator::Orchestrator;
use crate::progress::{ProgressReporter, ProgressSink};
use crate::queue::{JobQueue, RetryPolicy};
use crate::stores::{ClaimStore, DeadLetterSink, FormStore, JobLedger, LeaseLock, TaskStore};
use crate::task_registry::TaskRegistry;

pub use aggregation::AggregationStage;
pub use insight_generation::InsightGenerationStage;
pub use response_analysis::ResponseAnalysisStage;
pub use topic_clustering::{TopicClusteringStage, canonicalize, parse_mapping};

#[async_trait]
pub trait StageHandler: Send + Sync {
  async fn handle(&self, job: &Job) -> PipelineResult<()>;
}

/// Everything a stage needs, shared by the API and the workers.
#[derive(Clone)]
pub struct PipelineContext {
  pub instance_id: String,
  pub settings: PipelineSettings,
  pub tasks: TaskRegistry,
  pub leases: Arc<dyn LeaseLock>,
  pub claims: Arc<dyn ClaimStore>,
  pub forms: Arc<dyn FormStore>,
  pub dead_letters: Arc<dyn DeadLetterSink>,
  pub ledger: Arc<dyn JobLedger>,
  pub queue: Arc<dyn JobQueue>,
  pub progress: Arc<dyn ProgressSink>,
  pub analysis: Arc<dyn TextAnalysisClient>,
}

impl PipelineContext {
  /// Context whose stores all live in one backend.
  pub fn with_store<S>(
    instance_id: String,
    settings: PipelineSettings,
    store: Arc<S>,
    queue: Arc<dyn JobQueue>,
    progress: Arc<dyn ProgressSink>,
    analysis: Arc<dyn TextAnalysisClient>,
  ) -> Self
  where
    S: LeaseLock + TaskStore + ClaimStore + FormStore + DeadLetterSink + JobLedger + 'static,
  {
    PipelineContext {
      instance_id,
      tasks: TaskRegistry::new(store.clone(), settings.task_retention),
      settings,
      leases: store.clone(),
      claims: store.clone(),
      forms: store.clone(),
      dead_letters: store.clone(),
      ledger: store,
      queue,
      progress,
      analysis,
    }
  }

  pub fn reporter(&self, task_id: Uuid) -> ProgressReporter {
    ProgressReporter::new(self.tasks.clone(), self.progress.clone(), task_id)
  }

  pub async fn load_form(&self, form_id: Uuid) -> PipelineResult<Form> {
    self.forms.get_form(form_id).await?.ok_or_else(|| PipelineError::not_found("form", form_id))
  }
}

/// A handler bound to its queue with its retry budget and concurrency.
#[derive(Clone)]
pub struct StageBinding {
  pub stage: Stage,
  pub handler: Arc<dyn StageHandler>,
  pub policy: RetryPolicy,
  pub concurrency: usize,
}

impl StageBinding {
  pub fn new(stage: Stage, handler: Arc<dyn StageHandler>, settings: StageSettings) -> Self {
    Self { stage, handler, policy: settings.policy, concurrency: settings.concurrency.max(1) }
  }
}

/// Handlers for every stage with the given per-stage settings.
pub fn bindings(ctx: &PipelineContext, settings: impl Fn(Stage) -> StageSettings) -> Vec<StageBinding> {
  Stage::ALL
    .into_iter()
    .map(|stage| {
      let handler: Arc<dyn StageHandler> = match stage {
        Stage::Orchestrate => Arc::new(Orchestrator::new(ctx.clone())),
        Stage::ResponseAnalysis => Arc::new(ResponseAnalysisStage::new(ctx.clone())),
        Stage::TopicClustering => Arc::new(TopicClusteringStage::new(ctx.clone())),
        Stage::Aggregation => Arc::new(AggregationStage::new(ctx.clone())),
        Stage::InsightGeneration => Arc::new(InsightGenerationStage::new(ctx.clone())),
      };
      StageBinding::new(stage, handler, settings(stage))
    })
    .collect()
}

pub(crate) fn unexpected_payload(job: &Job) -> PipelineError {
  PipelineError::StageFailed { stage: job.stage, job_id: job.id, reason: "unexpected payload".to_string() }
}
