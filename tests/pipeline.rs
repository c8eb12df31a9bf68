mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{Harness, POISON, last_kind};
use serde_json::json;
use surveyflow::error::PipelineError;
use surveyflow::housekeeping::run_once;
use surveyflow::lease::resource_key;
use surveyflow::models::{Answer, EventKind, Job, JobPayload, Response, Stage, TaskState};
use surveyflow::stages::StageHandler;
use surveyflow::stores::{ClaimStore, DeadLetterSink, LeaseLock};
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

const FEEDBACK: [&str; 10] = [
  "The price is too high for small teams",
  "I love the support team, they answer fast",
  "Support is slow on weekends",
  "Great product overall",
  "The price went up again",
  "Setup was fine",
  "I hate waiting for support replies",
  "Great onboarding and fair price",
  "Nothing to add",
  "Support solved my issue in minutes, love it",
];

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_run_analyzes_every_response() {
  let harness = Harness::new();
  let _workers = harness.start_workers();
  let (form, _) = harness.seed_form(&FEEDBACK).await;

  let (task_id, events) = harness.run_to_end(form.id, false).await;

  assert_eq!(events.first().map(|e| e.kind), Some(EventKind::Start));
  assert_eq!(last_kind(&events), Some(EventKind::Complete));
  let complete = events.last().unwrap();
  assert_eq!(complete.progress, 100);
  let stats = complete.stats.as_ref().unwrap();
  assert_eq!(stats["totalResponses"], 10);
  assert_eq!(stats["totalResponsesAnalyzed"], 10);
  assert_eq!(stats["failedBatches"], 0);
  assert!(events.windows(2).all(|w| w[0].progress <= w[1].progress), "progress went backwards: {events:?}");
  assert!(events.iter().any(|e| e.kind == EventKind::ResponsesClaimed));
  assert!(events.iter().any(|e| e.kind == EventKind::ResponsesProcessed));

  let task = assert_ok!(harness.ctx.tasks.get(task_id).await).unwrap();
  assert_eq!(task.state, TaskState::Completed);
  assert_eq!(task.progress, 100);
  assert!(assert_ok!(harness.ctx.leases.current(&resource_key(form.id)).await).is_none());

  let stored = assert_ok!(harness.ctx.load_form(form.id).await);
  let analytics = stored.analytics.unwrap();
  assert_eq!(analytics["totalResponsesAnalyzed"], 10);
  assert_eq!(analytics["insights"]["summary"], "Scripted summary");
  assert!(analytics["insights"]["keyFindings"].as_array().is_some_and(|f| !f.is_empty()));
  assert!(analytics["topTopics"].as_array().unwrap().contains(&json!("Cost")));
  assert!(!analytics["topTopics"].as_array().unwrap().contains(&json!("Pricing")));
  assert!(analytics["lastUpdated"].is_string());
  assert!(stored.analytics_updated_at.is_some());

  let processed = assert_ok!(harness.ctx.claims.processed_responses(form.id).await);
  assert_eq!(processed.len(), 10);
  assert!(processed.iter().all(|r| r.claim_owner.is_none()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn second_run_on_a_busy_form_is_refused() {
  let harness = Harness::new();
  let (form, _) = harness.seed_form(&FEEDBACK[..3]).await;

  let first = assert_ok!(harness.orchestrator.request_run(form.id, false).await);
  let second = Uuid::new_v4();
  let err = assert_err!(harness.orchestrator.request_run_with_id(second, form.id, false).await);
  assert!(matches!(err, PipelineError::Busy { resource_id } if resource_id == form.id));

  let refused = assert_ok!(harness.ctx.tasks.get(second).await).unwrap();
  assert_eq!(refused.state, TaskState::Canceled);
  let holder = assert_ok!(harness.ctx.leases.current(&resource_key(form.id)).await).unwrap();
  assert_eq!(holder.task_id, first);
  let queued = assert_ok!(harness.ctx.tasks.get(first).await).unwrap();
  assert_eq!(queued.state, TaskState::Pending);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exhausted_batch_is_dead_lettered_and_the_run_continues() {
  let harness = Harness::new();
  let _workers = harness.start_workers();
  let texts = ["price is fine", "love it", "support is slow", "great", "ok", "this one is poison"];
  let (form, responses) = harness.seed_form(&texts).await;
  let poisoned = responses.last().unwrap().id;

  let (task_id, events) = harness.run_to_end(form.id, false).await;

  assert_eq!(last_kind(&events), Some(EventKind::Complete));
  let stats = events.last().unwrap().stats.clone().unwrap();
  assert_eq!(stats["batches"], 2);
  assert_eq!(stats["failedBatches"], 1);
  assert_eq!(stats["totalResponsesAnalyzed"], 5);

  let dead = assert_ok!(harness.store.list(Some(task_id), 10).await);
  assert_eq!(dead.len(), 1);
  assert_eq!(dead[0].original_stage, Stage::ResponseAnalysis);
  assert_eq!(dead[0].attempts_made, 3);
  assert_eq!(dead[0].max_attempts, 3);

  let response = assert_ok!(harness.store.get_response(poisoned).await).unwrap();
  assert!(response.is_claimable(), "poisoned response should be back in the pool: {response:?}");
  let eligible = assert_ok!(harness.store.eligible(form.id).await);
  assert_eq!(eligible.iter().map(|r| r.id).collect::<Vec<_>>(), vec![poisoned]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn run_fails_when_no_batch_succeeds() {
  let harness = Harness::new();
  let _workers = harness.start_workers();
  let texts = [POISON, "more poison", "poison again"];
  let (form, _) = harness.seed_form(&texts).await;

  let (task_id, events) = harness.run_to_end(form.id, false).await;

  assert_eq!(last_kind(&events), Some(EventKind::Error));
  let task = assert_ok!(harness.ctx.tasks.get(task_id).await).unwrap();
  assert_eq!(task.state, TaskState::Failed);
  assert!(assert_ok!(harness.ctx.leases.current(&resource_key(form.id)).await).is_none());
  let eligible = assert_ok!(harness.store.eligible(form.id).await);
  assert_eq!(eligible.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn run_past_its_deadline_fails_and_frees_the_form() {
  let harness = Harness::with_settings(|s| s.run_deadline = Duration::from_millis(300));
  harness.analysis.delay_ms.store(1500, Ordering::SeqCst);
  let _workers = harness.start_workers();
  let (form, _) = harness.seed_form(&FEEDBACK[..3]).await;

  let (task_id, events) = harness.run_to_end(form.id, false).await;

  assert_eq!(last_kind(&events), Some(EventKind::Error));
  assert!(events.last().unwrap().message.contains("took too long"));
  let task = assert_ok!(harness.ctx.tasks.get(task_id).await).unwrap();
  assert_eq!(task.state, TaskState::Failed);
  assert!(task.expires_at.is_some());
  assert!(assert_ok!(harness.ctx.leases.current(&resource_key(form.id)).await).is_none());

  // the straggling wave finishes after the run was failed and must not keep its claims
  tokio::time::sleep(Duration::from_millis(2500)).await;
  let eligible = assert_ok!(harness.store.eligible(form.id).await);
  assert_eq!(eligible.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_insight_generation_falls_back_to_rules() {
  let harness = Harness::new();
  harness.analysis.fail_insights.store(true, Ordering::SeqCst);
  let _workers = harness.start_workers();
  let (form, _) = harness.seed_form(&FEEDBACK[..4]).await;

  let (_, events) = harness.run_to_end(form.id, false).await;

  assert_eq!(last_kind(&events), Some(EventKind::Complete));
  assert_eq!(harness.analysis.insight_calls.load(Ordering::SeqCst), 3);
  let analytics = assert_ok!(harness.ctx.load_form(form.id).await).analytics.unwrap();
  let summary = analytics["insights"]["summary"].as_str().unwrap();
  assert!(summary.starts_with("Analysis of 4 responses"), "{summary}");
  assert!(analytics["insights"]["recommendations"].is_array());
  assert!(analytics["insights"]["keyFindings"].as_array().is_some_and(|f| !f.is_empty()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forced_refresh_reanalyzes_processed_responses() {
  let harness = Harness::new();
  let _workers = harness.start_workers();
  let (form, _) = harness.seed_form(&FEEDBACK[..3]).await;

  let (_, first) = harness.run_to_end(form.id, false).await;
  assert_eq!(last_kind(&first), Some(EventKind::Complete));
  let calls_after_first = harness.analysis.analyze_calls.load(Ordering::SeqCst);

  let (_, again) = harness.run_to_end(form.id, false).await;
  assert_eq!(last_kind(&again), Some(EventKind::Complete));
  assert_eq!(again.last().unwrap().stats.as_ref().unwrap()["newlyAnalyzed"], 0);
  assert_eq!(harness.analysis.analyze_calls.load(Ordering::SeqCst), calls_after_first);

  let (_, forced) = harness.run_to_end(form.id, true).await;
  assert_eq!(last_kind(&forced), Some(EventKind::Complete));
  assert_eq!(forced.last().unwrap().stats.as_ref().unwrap()["newlyAnalyzed"], 3);
  assert!(harness.analysis.analyze_calls.load(Ordering::SeqCst) > calls_after_first);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reprocessing_respects_the_lease() {
  let harness = Harness::new();
  let _workers = harness.start_workers();
  let (form, responses) = harness.seed_form(&FEEDBACK[..3]).await;
  let (_, events) = harness.run_to_end(form.id, false).await;
  assert_eq!(last_kind(&events), Some(EventKind::Complete));

  let blank = Response::new(form.id, vec![Answer { question_id: "q1".into(), value: json!("   ") }]);
  assert_ok!(harness.store.insert_response(&blank).await);

  assert_eq!(assert_ok!(harness.orchestrator.reprocess_all(form.id, true).await), 0);
  assert_eq!(assert_ok!(harness.orchestrator.reprocess_all(form.id, false).await), 3);
  assert!(!assert_ok!(harness.orchestrator.reprocess_response(form.id, blank.id).await));
  let err = assert_err!(harness.orchestrator.reprocess_response(form.id, Uuid::new_v4()).await);
  assert!(matches!(err, PipelineError::NotFound { .. }));

  let holder = Uuid::new_v4();
  let key = resource_key(form.id);
  assert_ok!(harness.ctx.leases.acquire(&key, holder, "other-node", Duration::from_secs(5)).await).unwrap();
  let err = assert_err!(harness.orchestrator.reprocess_response(form.id, responses[0].id).await);
  assert!(matches!(err, PipelineError::Busy { .. }));
  assert_ok!(harness.ctx.leases.release(&key, holder, "other-node").await);
  assert!(assert_ok!(harness.orchestrator.reprocess_response(form.id, responses[0].id).await));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn housekeeping_finalizes_runs_left_behind_by_dead_workers() {
  let harness = Harness::with_settings(|s| s.lease_ttl = Duration::from_millis(50));
  let (form, _) = harness.seed_form(&FEEDBACK[..3]).await;
  let (busy_form, _) = harness.seed_form(&FEEDBACK[3..5]).await;
  let tasks = &harness.ctx.tasks;

  let orphan = Uuid::new_v4();
  assert_ok!(tasks.create(orphan, form.id, "api").await);
  assert_ok!(tasks.transition(orphan, TaskState::Pending, None, None).await);
  assert_ok!(tasks.transition(orphan, TaskState::Running, None, Some("gone-node")).await);
  assert_eq!(assert_ok!(harness.store.claim(form.id, orphan, None).await).len(), 3);

  let alive = Uuid::new_v4();
  assert_ok!(tasks.create(alive, busy_form.id, "api").await);
  assert_ok!(tasks.transition(alive, TaskState::Pending, None, None).await);
  assert_ok!(tasks.transition(alive, TaskState::Running, None, Some("other-node")).await);
  let lease = harness.store.acquire(&resource_key(busy_form.id), alive, "other-node", Duration::from_secs(30)).await;
  assert!(assert_ok!(lease).is_some());

  let queued = Uuid::new_v4();
  assert_ok!(tasks.create(queued, form.id, "api").await);
  assert_ok!(tasks.transition(queued, TaskState::Pending, None, None).await);

  tokio::time::sleep(Duration::from_millis(150)).await;
  let mut rx = harness.bus.subscribe(orphan).await;
  let report = assert_ok!(run_once(&harness.ctx).await);
  assert_eq!(report.tasks_abandoned, 1);

  let task = assert_ok!(tasks.get(orphan).await).unwrap();
  assert_eq!(task.state, TaskState::Failed);
  assert_eq!(task.message, "Analytics run was abandoned by its worker");
  assert!(task.expires_at.is_some());
  let event = assert_ok!(tokio::time::timeout(Duration::from_secs(1), rx.recv()).await).unwrap();
  assert_eq!(event.kind, EventKind::Error);
  assert_eq!(assert_ok!(harness.store.eligible(form.id).await).len(), 3);

  assert_eq!(assert_ok!(tasks.get(alive).await).unwrap().state, TaskState::Running);
  assert_eq!(assert_ok!(tasks.get(queued).await).unwrap().state, TaskState::Pending);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn redelivered_orchestration_of_a_running_task_fails_it() {
  let harness = Harness::new();
  let (form, _) = harness.seed_form(&FEEDBACK[..2]).await;
  let tasks = &harness.ctx.tasks;
  let task_id = Uuid::new_v4();
  assert_ok!(tasks.create(task_id, form.id, "api").await);
  assert_ok!(tasks.transition(task_id, TaskState::Pending, None, None).await);
  assert_ok!(tasks.transition(task_id, TaskState::Running, None, Some("gone-node")).await);

  let mut rx = harness.bus.subscribe(task_id).await;
  let job = Job::new(Stage::Orchestrate, task_id, form.id, JobPayload::Orchestrate { force_refresh: false });
  let err = assert_err!(harness.orchestrator.handle(&job).await);
  assert!(matches!(err, PipelineError::InvalidStateTransition { from: TaskState::Running, .. }));

  assert_eq!(assert_ok!(tasks.get(task_id).await).unwrap().state, TaskState::Failed);
  assert!(assert_ok!(harness.ctx.leases.current(&resource_key(form.id)).await).is_none());
  let event = assert_ok!(tokio::time::timeout(Duration::from_secs(1), rx.recv()).await).unwrap();
  assert_eq!(event.kind, EventKind::Error);
}
