#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{Value, json};
use surveyflow::analysis::{AnalysisInput, AnalysisKind, TextAnalysisClient};
use surveyflow::config::{PipelineSettings, StageSettings};
use surveyflow::models::{Answer, EventKind, Form, InsightKind, ProgressEvent, Question, Response, Stage};
use surveyflow::orchestrator::Orchestrator;
use surveyflow::progress::ProgressBus;
use surveyflow::queue::{MemoryQueue, RetryPolicy};
use surveyflow::stages::{PipelineContext, bindings};
use surveyflow::stores::{ClaimStore, FormStore, MemoryStore};
use surveyflow::worker_processing::spawn_stage_workers;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub const POISON: &str = "poison";

/// Deterministic stand-in for the text-analysis service.
#[derive(Default)]
pub struct ScriptedAnalysisClient {
  pub analyze_calls: AtomicU32,
  pub insight_calls: AtomicU32,
  pub fail_insights: AtomicBool,
  /// Added to every chunk analysis, in milliseconds.
  pub delay_ms: AtomicU64,
}

fn first_text(input: &AnalysisInput) -> String {
  input.answers.first().map(|a| a.text.to_lowercase()).unwrap_or_default()
}

fn topic_for(text: &str) -> &'static str {
  if text.contains("price") {
    "Pricing"
  } else if text.contains("support") {
    "Support"
  } else {
    "General"
  }
}

fn sentiment_for(text: &str) -> Value {
  if text.contains("love") || text.contains("great") {
    json!({"label": "positive", "score": 0.8, "emotionalTone": "happy"})
  } else if text.contains("hate") || text.contains("slow") {
    json!({"label": "negative", "score": -0.6, "emotionalTone": "frustrated"})
  } else {
    json!({"label": "neutral", "score": 0.0, "emotionalTone": "calm"})
  }
}

#[async_trait]
impl TextAnalysisClient for ScriptedAnalysisClient {
  async fn analyze(&self, kind: AnalysisKind, chunk: &[AnalysisInput]) -> Result<Value> {
    self.analyze_calls.fetch_add(1, Ordering::SeqCst);
    let delay = self.delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
      tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    if chunk.iter().any(|input| first_text(input).contains(POISON)) {
      bail!("analysis service rejected the chunk");
    }
    let results: Vec<Value> = chunk
      .iter()
      .map(|input| {
        let text = first_text(input);
        match kind {
          AnalysisKind::Topics => json!({
            "responseId": input.response_id,
            "topics": [{"topic": topic_for(&text), "isPrimary": true, "confidence": 0.9}]
          }),
          AnalysisKind::Sentiment => json!({
            "responseId": input.response_id,
            "overallSentiment": sentiment_for(&text)
          }),
          AnalysisKind::Quotes => {
            let quotes: Vec<Value> = input
              .answers
              .iter()
              .take(1)
              .map(|a| {
                json!({
                  "text": a.text,
                  "questionId": a.question_id,
                  "themes": [topic_for(&text)],
                  "representativeness": 0.8
                })
              })
              .collect();
            json!({
              "responseId": input.response_id,
              "quotes": quotes,
              "responseQuality": {"depth": 0.8, "completeness": 0.7, "clarity": 0.9}
            })
          }
        }
      })
      .collect();
    Ok(json!({ "results": results }))
  }

  async fn canonical_topics(&self, topics: &[String]) -> Result<Value> {
    let mapping: serde_json::Map<String, Value> = topics
      .iter()
      .map(|topic| {
        let canonical = if topic == "Pricing" { "Cost".to_string() } else { topic.clone() };
        (topic.clone(), Value::String(canonical))
      })
      .collect();
    Ok(json!({ "mapping": mapping }))
  }

  async fn generate_insight(&self, kind: InsightKind, _context: &Value) -> Result<Value> {
    self.insight_calls.fetch_add(1, Ordering::SeqCst);
    if self.fail_insights.load(Ordering::SeqCst) {
      bail!("insight model unavailable");
    }
    Ok(match kind {
      InsightKind::Summary => json!({"summary": "Scripted summary"}),
      // empty lists make the stage fall back to its own rules
      InsightKind::Findings => json!({"keyFindings": []}),
      InsightKind::Recommendations => json!({"recommendations": []}),
    })
  }
}

pub fn fast_settings(stage: Stage) -> StageSettings {
  let policy = RetryPolicy {
    max_attempts: 3,
    base_delay: Duration::from_millis(5),
    max_delay: Duration::from_millis(20),
    timeout: Some(Duration::from_secs(10)),
  };
  match stage {
    Stage::Orchestrate => StageSettings { policy: RetryPolicy { max_attempts: 1, timeout: None, ..policy }, concurrency: 2 },
    _ => StageSettings { policy, concurrency: 2 },
  }
}

pub struct Harness {
  pub store: Arc<MemoryStore>,
  pub queue: Arc<MemoryQueue>,
  pub bus: ProgressBus,
  pub analysis: Arc<ScriptedAnalysisClient>,
  pub ctx: PipelineContext,
  pub orchestrator: Arc<Orchestrator>,
}

impl Harness {
  pub fn new() -> Self {
    Self::with_settings(|_| {})
  }

  pub fn with_settings(tweak: impl FnOnce(&mut PipelineSettings)) -> Self {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let bus = ProgressBus::default();
    let analysis = Arc::new(ScriptedAnalysisClient::default());
    let mut settings = PipelineSettings {
      lease_ttl: Duration::from_secs(5),
      wave_concurrency: 1,
      ..PipelineSettings::default()
    };
    tweak(&mut settings);
    let ctx = PipelineContext::with_store(
      "test-node".to_string(),
      settings,
      store.clone(),
      queue.clone(),
      Arc::new(bus.clone()),
      analysis.clone(),
    );
    let orchestrator = Arc::new(Orchestrator::new(ctx.clone()));
    Harness { store, queue, bus, analysis, ctx, orchestrator }
  }

  pub fn start_workers(&self) -> Vec<JoinHandle<Result<()>>> {
    spawn_stage_workers(bindings(&self.ctx, fast_settings), self.queue.clone(), self.store.clone(), self.store.clone())
  }

  /// A form with one free-text question and one response per text, submitted
  /// one second apart in the given order.
  pub async fn seed_form(&self, texts: &[&str]) -> (Form, Vec<Response>) {
    let form = Form {
      id: Uuid::new_v4(),
      title: "Customer feedback".to_string(),
      questions: vec![
        Question { id: "q1".into(), title: "What could we improve?".into(), kind: "textarea".into(), options: vec![] },
        Question {
          id: "q2".into(),
          title: "Plan".into(),
          kind: "radio".into(),
          options: vec!["Basic".into(), "Pro".into()],
        },
      ],
      analytics: None,
      analytics_updated_at: None,
    };
    self.store.insert_form(&form).await.unwrap();

    let start = Utc::now() - ChronoDuration::hours(1);
    let mut responses = Vec::new();
    for (i, text) in texts.iter().enumerate() {
      let plan = if i % 2 == 0 { "Basic" } else { "Pro" };
      let mut response = Response::new(
        form.id,
        vec![
          Answer { question_id: "q1".into(), value: json!(text) },
          Answer { question_id: "q2".into(), value: json!(plan) },
        ],
      );
      response.submitted_at = start + ChronoDuration::seconds(i as i64);
      self.store.insert_response(&response).await.unwrap();
      responses.push(response);
    }
    (form, responses)
  }

  /// Subscribes, starts the run and collects its events up to the terminal one.
  pub async fn run_to_end(&self, form_id: Uuid, force_refresh: bool) -> (Uuid, Vec<ProgressEvent>) {
    let task_id = Uuid::new_v4();
    let rx = self.bus.subscribe(task_id).await;
    self.orchestrator.request_run_with_id(task_id, form_id, force_refresh).await.unwrap();
    (task_id, collect_events(rx).await)
  }
}

pub async fn collect_events(mut rx: broadcast::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
  let mut events = Vec::new();
  loop {
    match tokio::time::timeout(Duration::from_secs(10), rx.recv()).await {
      Ok(Ok(event)) => {
        let terminal = event.kind.is_terminal();
        events.push(event);
        if terminal {
          return events;
        }
      }
      Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
      Ok(Err(broadcast::error::RecvError::Closed)) => return events,
      Err(_) => panic!("run did not finish in time, got {events:?}"),
    }
  }
}

pub fn last_kind(events: &[ProgressEvent]) -> Option<EventKind> {
  events.last().map(|e| e.kind)
}
