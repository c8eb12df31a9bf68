use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::analysis::ItemAnalysis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
  New,
  Pending,
  Running,
  Completed,
  Failed,
  Canceled,
}

impl TaskState {
  pub fn as_str(&self) -> &'static str {
    match self {
      TaskState::New => "new",
      TaskState::Pending => "pending",
      TaskState::Running => "running",
      TaskState::Completed => "completed",
      TaskState::Failed => "failed",
      TaskState::Canceled => "canceled",
    }
  }

  pub fn is_terminal(&self) -> bool {
    matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Canceled)
  }

  /// Legal forward moves of the task lifecycle. Terminal states never move again.
  pub fn can_transition_to(&self, next: TaskState) -> bool {
    use TaskState::*;
    matches!(
      (self, next),
      (New, Pending)
        | (New, Canceled)
        | (Pending, Running)
        | (Pending, Failed)
        | (Pending, Canceled)
        | (Running, Completed)
        | (Running, Failed)
        | (Running, Canceled)
    )
  }
}

impl fmt::Display for TaskState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for TaskState {
  type Err = anyhow::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Ok(match s {
      "new" => TaskState::New,
      "pending" => TaskState::Pending,
      "running" => TaskState::Running,
      "completed" => TaskState::Completed,
      "failed" => TaskState::Failed,
      "canceled" => TaskState::Canceled,
      other => anyhow::bail!("unknown task state '{other}'"),
    })
  }
}

/// One analytics run over one form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
  pub task_id: Uuid,
  pub resource_id: Uuid,
  pub state: TaskState,
  pub progress: u8,
  pub message: String,
  pub owner_id: String,
  pub created_at: DateTime<Utc>,
  pub started_at: Option<DateTime<Utc>>,
  pub completed_at: Option<DateTime<Utc>>,
  pub expires_at: Option<DateTime<Utc>>,
}

impl Task {
  pub fn new(task_id: Uuid, resource_id: Uuid, owner_id: &str) -> Self {
    Task {
      task_id,
      resource_id,
      state: TaskState::New,
      progress: 0,
      message: "Analytics run created".to_string(),
      owner_id: owner_id.to_string(),
      created_at: Utc::now(),
      started_at: None,
      completed_at: None,
      expires_at: None,
    }
  }
}

/// Exclusive, time-bounded right of one task to work on one form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
  pub resource_key: String,
  pub task_id: Uuid,
  pub owner_id: String,
  pub expires_at: DateTime<Utc>,
}

impl Lease {
  pub fn is_live(&self, now: DateTime<Utc>) -> bool {
    self.expires_at > now
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
  pub id: String,
  pub title: String,
  #[serde(rename = "type")]
  pub kind: String,
  #[serde(default)]
  pub options: Vec<String>,
}

impl Question {
  /// Questions with a fixed answer set, used for answer/topic correlation.
  pub fn is_closed(&self) -> bool {
    matches!(self.kind.as_str(), "radio" | "dropdown" | "checkbox" | "multiple_choice" | "select")
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Form {
  pub id: Uuid,
  pub title: String,
  pub questions: Vec<Question>,
  pub analytics: Option<serde_json::Value>,
  pub analytics_updated_at: Option<DateTime<Utc>>,
}

impl Form {
  pub fn question(&self, id: &str) -> Option<&Question> {
    self.questions.iter().find(|q| q.id == id)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Answer {
  pub question_id: String,
  pub value: serde_json::Value,
}

impl Answer {
  pub fn text(&self) -> Option<&str> {
    self.value.as_str().map(str::trim).filter(|s| !s.is_empty())
  }

  /// Closed answers may be a single choice or several.
  pub fn choices(&self) -> Vec<String> {
    match &self.value {
      serde_json::Value::String(s) if !s.trim().is_empty() => vec![s.trim().to_string()],
      serde_json::Value::Array(items) => items
        .iter()
        .filter_map(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect(),
      serde_json::Value::Number(n) => vec![n.to_string()],
      serde_json::Value::Bool(b) => vec![b.to_string()],
      _ => Vec::new(),
    }
  }
}

/// A submitted response: the unit that is claimed and analyzed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
  pub id: Uuid,
  pub form_id: Uuid,
  pub submitted_at: DateTime<Utc>,
  pub answers: Vec<Answer>,
  pub processed: bool,
  pub claim_owner: Option<Uuid>,
  pub claim_started_at: Option<DateTime<Utc>>,
  pub analysis: Option<ItemAnalysis>,
  #[serde(default)]
  pub canonical_topics: Vec<String>,
  pub last_analyzed: Option<DateTime<Utc>>,
}

impl Response {
  pub fn new(form_id: Uuid, answers: Vec<Answer>) -> Self {
    Response {
      id: Uuid::new_v4(),
      form_id,
      submitted_at: Utc::now(),
      answers,
      processed: false,
      claim_owner: None,
      claim_started_at: None,
      analysis: None,
      canonical_topics: Vec::new(),
      last_analyzed: None,
    }
  }

  pub fn has_text_content(&self) -> bool {
    self.answers.iter().any(|a| a.text().is_some())
  }

  /// Total characters of free text, the weight used for batch sizing.
  pub fn text_weight(&self) -> usize {
    self.answers.iter().filter_map(Answer::text).map(|t| t.chars().count()).sum()
  }

  pub fn is_claimable(&self) -> bool {
    !self.processed && self.claim_owner.is_none()
  }

  pub fn raw_topics(&self) -> Vec<String> {
    self
      .analysis
      .as_ref()
      .map(|a| a.topics.iter().map(|t| t.topic.clone()).collect())
      .unwrap_or_default()
  }

  /// Canonical topics once clustering ran, raw topics before that.
  pub fn topics(&self) -> Vec<String> {
    let topics = if self.canonical_topics.is_empty() { self.raw_topics() } else { self.canonical_topics.clone() };
    let mut seen = std::collections::HashSet::new();
    topics.into_iter().filter(|t| seen.insert(t.clone())).collect()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
  Orchestrate,
  ResponseAnalysis,
  TopicClustering,
  Aggregation,
  InsightGeneration,
}

impl Stage {
  pub const ALL: [Stage; 5] = [
    Stage::Orchestrate,
    Stage::ResponseAnalysis,
    Stage::TopicClustering,
    Stage::Aggregation,
    Stage::InsightGeneration,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Stage::Orchestrate => "orchestrate",
      Stage::ResponseAnalysis => "response_analysis",
      Stage::TopicClustering => "topic_clustering",
      Stage::Aggregation => "aggregation",
      Stage::InsightGeneration => "insight_generation",
    }
  }

  pub fn queue_name(&self) -> &'static str {
    match self {
      Stage::Orchestrate => "analytics-orchestration",
      Stage::ResponseAnalysis => "response-processing",
      Stage::TopicClustering => "topic-clustering",
      Stage::Aggregation => "aggregation",
      Stage::InsightGeneration => "ai-generation",
    }
  }
}

impl fmt::Display for Stage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Stage {
  type Err = anyhow::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Stage::ALL
      .into_iter()
      .find(|stage| stage.as_str() == s)
      .ok_or_else(|| anyhow::anyhow!("unknown stage '{s}'"))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightKind {
  Summary,
  Findings,
  Recommendations,
}

impl InsightKind {
  pub const ALL: [InsightKind; 3] = [InsightKind::Summary, InsightKind::Findings, InsightKind::Recommendations];

  /// Field of the aggregate's `insights` object this kind fills.
  pub fn field_name(&self) -> &'static str {
    match self {
      InsightKind::Summary => "summary",
      InsightKind::Findings => "keyFindings",
      InsightKind::Recommendations => "recommendations",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
  Orchestrate { force_refresh: bool },
  AnalyzeWave { wave_index: usize, total_waves: usize, chunks: Vec<Vec<Uuid>> },
  ClusterTopics,
  Aggregate,
  GenerateInsight { insight: InsightKind },
}

pub const DEFAULT_PRIORITY: u8 = 10;
pub const FORCE_REFRESH_PRIORITY: u8 = 1;

/// Unit of work on a stage queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
  pub id: Uuid,
  pub stage: Stage,
  pub task_id: Uuid,
  pub resource_id: Uuid,
  pub priority: u8,
  pub payload: JobPayload,
}

impl Job {
  pub fn new(stage: Stage, task_id: Uuid, resource_id: Uuid, payload: JobPayload) -> Self {
    Job { id: Uuid::new_v4(), stage, task_id, resource_id, priority: DEFAULT_PRIORITY, payload }
  }

  pub fn with_priority(mut self, priority: u8) -> Self {
    self.priority = priority;
    self
  }
}

/// Final result of a job as recorded in the job ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum JobOutcome {
  Succeeded,
  DeadLettered(String),
  Failed(String),
}

impl JobOutcome {
  pub fn status(&self) -> &'static str {
    match self {
      JobOutcome::Succeeded => "succeeded",
      JobOutcome::DeadLettered(_) => "dead_lettered",
      JobOutcome::Failed(_) => "failed",
    }
  }

  pub fn reason(&self) -> Option<&str> {
    match self {
      JobOutcome::Succeeded => None,
      JobOutcome::DeadLettered(r) | JobOutcome::Failed(r) => Some(r),
    }
  }

  pub fn from_parts(status: &str, reason: Option<String>) -> Option<Self> {
    let reason = reason.unwrap_or_default();
    match status {
      "succeeded" => Some(JobOutcome::Succeeded),
      "dead_lettered" => Some(JobOutcome::DeadLettered(reason)),
      "failed" => Some(JobOutcome::Failed(reason)),
      _ => None,
    }
  }
}

/// Durable record of a job that exhausted its retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
  pub original_stage: Stage,
  pub job_id: Uuid,
  pub task_id: Uuid,
  pub resource_id: Uuid,
  pub payload: serde_json::Value,
  pub failure_reason: String,
  pub attempts_made: u32,
  pub max_attempts: u32,
  pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
  Start,
  Progress,
  ResponsesClaimed,
  ResponsesProcessing,
  ResponsesProcessed,
  Reprocessed,
  Complete,
  Error,
}

impl EventKind {
  pub fn is_terminal(&self) -> bool {
    matches!(self, EventKind::Complete | EventKind::Error)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
  pub task_id: Uuid,
  #[serde(rename = "type")]
  pub kind: EventKind,
  pub message: String,
  pub progress: u8,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub stats: Option<serde_json::Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub processed_response_ids: Option<Vec<Uuid>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub modified_count: Option<u64>,
}

impl ProgressEvent {
  pub fn new(task_id: Uuid, kind: EventKind, progress: u8, message: impl Into<String>) -> Self {
    ProgressEvent {
      task_id,
      kind,
      message: message.into(),
      progress: progress.min(100),
      stats: None,
      processed_response_ids: None,
      modified_count: None,
    }
  }

  pub fn with_ids(mut self, ids: Vec<Uuid>) -> Self {
    self.processed_response_ids = Some(ids);
    self
  }

  pub fn with_stats(mut self, stats: serde_json::Value) -> Self {
    self.stats = Some(stats);
    self
  }

  pub fn with_modified_count(mut self, count: u64) -> Self {
    self.modified_count = Some(count);
    self
  }
}
