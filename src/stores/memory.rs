use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{Mutex, watch};
use uuid::Uuid;

use super::{ClaimStore, DeadLetterSink, FormStore, JobLedger, LeaseLock, TaskStore, TaskUpdate, expiry_after};
use crate::analysis::ItemAnalysis;
use crate::models::{DeadLetterRecord, Form, InsightKind, Job, JobOutcome, Lease, Response, Task, TaskState};

#[derive(Debug, Default)]
struct LedgerEntry {
  attempts: u32,
  outcome: Option<JobOutcome>,
}

/// Process-local backing for every store trait.
pub struct MemoryStore {
  tasks: Mutex<HashMap<Uuid, Task>>,
  leases: Mutex<HashMap<String, Lease>>,
  forms: Mutex<HashMap<Uuid, Form>>,
  responses: Mutex<HashMap<Uuid, Response>>,
  dead_letters: Mutex<Vec<DeadLetterRecord>>,
  jobs: Mutex<HashMap<Uuid, LedgerEntry>>,
  finished: watch::Sender<u64>,
}

impl Default for MemoryStore {
  fn default() -> Self {
    MemoryStore {
      tasks: Mutex::default(),
      leases: Mutex::default(),
      forms: Mutex::default(),
      responses: Mutex::default(),
      dead_letters: Mutex::default(),
      jobs: Mutex::default(),
      finished: watch::Sender::new(0),
    }
  }
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

fn sorted(mut responses: Vec<Response>) -> Vec<Response> {
  responses.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then(a.id.cmp(&b.id)));
  responses
}

fn clear_claim(response: &mut Response) {
  response.claim_owner = None;
  response.claim_started_at = None;
}

#[async_trait]
impl LeaseLock for MemoryStore {
  async fn acquire(&self, key: &str, task_id: Uuid, owner_id: &str, ttl: Duration) -> Result<Option<Lease>> {
    let now = Utc::now();
    let mut leases = self.leases.lock().await;
    if let Some(held) = leases.get(key) {
      if held.is_live(now) && held.task_id != task_id {
        return Ok(None);
      }
    }
    let lease = Lease {
      resource_key: key.to_string(),
      task_id,
      owner_id: owner_id.to_string(),
      expires_at: expiry_after(now, ttl),
    };
    leases.insert(key.to_string(), lease.clone());
    Ok(Some(lease))
  }

  async fn extend(&self, key: &str, task_id: Uuid, owner_id: &str, ttl: Duration) -> Result<Option<Lease>> {
    let mut leases = self.leases.lock().await;
    Ok(match leases.get_mut(key) {
      Some(lease) if lease.task_id == task_id && lease.owner_id == owner_id => {
        lease.expires_at = expiry_after(Utc::now(), ttl);
        Some(lease.clone())
      }
      _ => None,
    })
  }

  async fn release(&self, key: &str, task_id: Uuid, owner_id: &str) -> Result<()> {
    let mut leases = self.leases.lock().await;
    if leases.get(key).is_some_and(|l| l.task_id == task_id && l.owner_id == owner_id) {
      leases.remove(key);
    }
    Ok(())
  }

  async fn current(&self, key: &str) -> Result<Option<Lease>> {
    let now = Utc::now();
    Ok(self.leases.lock().await.get(key).filter(|l| l.is_live(now)).cloned())
  }

  async fn list_live(&self) -> Result<Vec<Lease>> {
    let now = Utc::now();
    let mut live: Vec<Lease> = self.leases.lock().await.values().filter(|l| l.is_live(now)).cloned().collect();
    live.sort_by_key(|l| l.expires_at);
    Ok(live)
  }
}

#[async_trait]
impl TaskStore for MemoryStore {
  async fn insert_task(&self, task: &Task) -> Result<()> {
    let mut tasks = self.tasks.lock().await;
    if tasks.contains_key(&task.task_id) {
      return Err(anyhow!("task {} already exists", task.task_id));
    }
    tasks.insert(task.task_id, task.clone());
    Ok(())
  }

  async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>> {
    Ok(self.tasks.lock().await.get(&task_id).cloned())
  }

  async fn update_if_state(&self, task_id: Uuid, expected: TaskState, next: TaskState, update: &TaskUpdate)
  -> Result<bool> {
    let mut tasks = self.tasks.lock().await;
    let Some(task) = tasks.get_mut(&task_id).filter(|t| t.state == expected) else {
      return Ok(false);
    };
    task.state = next;
    if let Some(message) = &update.message {
      task.message = message.clone();
    }
    if let Some(owner) = &update.owner_id {
      task.owner_id = owner.clone();
    }
    if let Some(progress) = update.progress {
      task.progress = task.progress.max(progress);
    }
    task.started_at = update.started_at.or(task.started_at);
    task.completed_at = update.completed_at.or(task.completed_at);
    task.expires_at = update.expires_at.or(task.expires_at);
    Ok(true)
  }

  async fn raise_progress(&self, task_id: Uuid, progress: u8, message: Option<&str>) -> Result<Option<u8>> {
    let mut tasks = self.tasks.lock().await;
    let Some(task) = tasks.get_mut(&task_id) else {
      return Ok(None);
    };
    if task.state == TaskState::Running {
      task.progress = task.progress.max(progress.min(100));
      if let Some(message) = message {
        task.message = message.to_string();
      }
    }
    Ok(Some(task.progress))
  }

  async fn find_active_for(&self, resource_id: Uuid) -> Result<Option<Task>> {
    Ok(
      self
        .tasks
        .lock()
        .await
        .values()
        .filter(|t| t.resource_id == resource_id && !t.state.is_terminal())
        .max_by_key(|t| t.created_at)
        .cloned(),
    )
  }

  async fn recent_tasks(&self, limit: usize) -> Result<Vec<Task>> {
    let mut tasks: Vec<Task> = self.tasks.lock().await.values().cloned().collect();
    tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    tasks.truncate(limit);
    Ok(tasks)
  }

  async fn stale_active(&self, before: DateTime<Utc>) -> Result<Vec<Task>> {
    let mut stale: Vec<Task> = self
      .tasks
      .lock()
      .await
      .values()
      .filter(|t| !t.state.is_terminal() && t.created_at < before)
      .cloned()
      .collect();
    stale.sort_by_key(|t| t.created_at);
    Ok(stale)
  }

  async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
    let mut tasks = self.tasks.lock().await;
    let before = tasks.len();
    tasks.retain(|_, t| t.expires_at.is_none_or(|at| at > now));
    Ok((before - tasks.len()) as u64)
  }
}

#[async_trait]
impl ClaimStore for MemoryStore {
  async fn insert_response(&self, response: &Response) -> Result<()> {
    self.responses.lock().await.insert(response.id, response.clone());
    Ok(())
  }

  async fn get_response(&self, response_id: Uuid) -> Result<Option<Response>> {
    Ok(self.responses.lock().await.get(&response_id).cloned())
  }

  async fn count_responses(&self, resource_id: Uuid) -> Result<u64> {
    Ok(self.responses.lock().await.values().filter(|r| r.form_id == resource_id).count() as u64)
  }

  async fn eligible(&self, resource_id: Uuid) -> Result<Vec<Response>> {
    let responses = self.responses.lock().await;
    Ok(sorted(responses.values().filter(|r| r.form_id == resource_id && r.is_claimable()).cloned().collect()))
  }

  async fn claim(&self, resource_id: Uuid, task_id: Uuid, only: Option<&[Uuid]>) -> Result<Vec<Response>> {
    let now = Utc::now();
    let mut responses = self.responses.lock().await;
    let claimed = responses
      .values_mut()
      .filter(|r| r.form_id == resource_id && !r.processed)
      .filter(|r| r.claim_owner.is_none_or(|owner| owner == task_id))
      .filter(|r| only.is_none_or(|ids| ids.contains(&r.id)))
      .map(|r| {
        r.claim_owner = Some(task_id);
        r.claim_started_at = Some(now);
        r.clone()
      })
      .collect();
    Ok(sorted(claimed))
  }

  async fn save_analysis(&self, task_id: Uuid, response_id: Uuid, analysis: &ItemAnalysis) -> Result<bool> {
    let mut responses = self.responses.lock().await;
    let Some(response) = responses.get_mut(&response_id).filter(|r| r.claim_owner == Some(task_id)) else {
      return Ok(false);
    };
    response.analysis = Some(analysis.clone());
    response.processed = true;
    response.last_analyzed = Some(Utc::now());
    clear_claim(response);
    Ok(true)
  }

  async fn mark_empty_processed(&self, resource_id: Uuid) -> Result<u64> {
    let now = Utc::now();
    let mut count = 0;
    for response in self.responses.lock().await.values_mut() {
      if response.form_id == resource_id && response.is_claimable() && !response.has_text_content() {
        response.processed = true;
        response.analysis = None;
        response.canonical_topics.clear();
        response.last_analyzed = Some(now);
        count += 1;
      }
    }
    Ok(count)
  }

  async fn release_claims(&self, task_id: Uuid, resource_id: Uuid) -> Result<u64> {
    let mut count = 0;
    for response in self.responses.lock().await.values_mut() {
      if response.form_id == resource_id && response.claim_owner == Some(task_id) {
        response.processed = true;
        clear_claim(response);
        count += 1;
      }
    }
    Ok(count)
  }

  async fn reset_claims(&self, task_id: Uuid, resource_id: Uuid) -> Result<u64> {
    let mut count = 0;
    for response in self.responses.lock().await.values_mut() {
      if response.form_id == resource_id && response.claim_owner == Some(task_id) && !response.processed {
        clear_claim(response);
        count += 1;
      }
    }
    Ok(count)
  }

  async fn reset_foreign_claims(&self, resource_id: Uuid, keep: Uuid) -> Result<u64> {
    let mut count = 0;
    for response in self.responses.lock().await.values_mut() {
      if response.form_id == resource_id && response.claim_owner.is_some_and(|owner| owner != keep) {
        clear_claim(response);
        count += 1;
      }
    }
    Ok(count)
  }

  async fn stale_claims(&self, before: DateTime<Utc>) -> Result<Vec<(Uuid, Uuid)>> {
    let responses = self.responses.lock().await;
    let mut pairs: Vec<(Uuid, Uuid)> = responses
      .values()
      .filter(|r| !r.processed && r.claim_started_at.is_some_and(|at| at < before))
      .filter_map(|r| r.claim_owner.map(|owner| (r.form_id, owner)))
      .collect();
    pairs.sort();
    pairs.dedup();
    Ok(pairs)
  }

  async fn reprocess(&self, resource_id: Uuid, only_unprocessed: bool) -> Result<u64> {
    let mut count = 0;
    for response in self.responses.lock().await.values_mut() {
      if response.form_id != resource_id || !response.has_text_content() {
        continue;
      }
      if only_unprocessed && response.processed {
        continue;
      }
      response.processed = false;
      response.analysis = None;
      response.canonical_topics.clear();
      clear_claim(response);
      count += 1;
    }
    Ok(count)
  }

  async fn reprocess_one(&self, resource_id: Uuid, response_id: Uuid) -> Result<bool> {
    let mut responses = self.responses.lock().await;
    let Some(response) = responses
      .get_mut(&response_id)
      .filter(|r| r.form_id == resource_id && r.has_text_content())
    else {
      return Ok(false);
    };
    response.processed = false;
    response.analysis = None;
    response.canonical_topics.clear();
    clear_claim(response);
    Ok(true)
  }

  async fn processed_responses(&self, resource_id: Uuid) -> Result<Vec<Response>> {
    let responses = self.responses.lock().await;
    Ok(sorted(responses.values().filter(|r| r.form_id == resource_id && r.processed).cloned().collect()))
  }

  async fn set_canonical_topics(&self, response_id: Uuid, topics: &[String]) -> Result<()> {
    if let Some(response) = self.responses.lock().await.get_mut(&response_id) {
      response.canonical_topics = topics.to_vec();
    }
    Ok(())
  }
}

#[async_trait]
impl FormStore for MemoryStore {
  async fn insert_form(&self, form: &Form) -> Result<()> {
    self.forms.lock().await.insert(form.id, form.clone());
    Ok(())
  }

  async fn get_form(&self, form_id: Uuid) -> Result<Option<Form>> {
    Ok(self.forms.lock().await.get(&form_id).cloned())
  }

  async fn save_aggregate(&self, form_id: Uuid, aggregate: &Value) -> Result<()> {
    let mut forms = self.forms.lock().await;
    let form = forms.get_mut(&form_id).ok_or_else(|| anyhow!("form {form_id} not found"))?;
    form.analytics = Some(aggregate.clone());
    Ok(())
  }

  async fn save_insight(&self, form_id: Uuid, kind: InsightKind, value: &Value) -> Result<()> {
    let mut forms = self.forms.lock().await;
    let form = forms.get_mut(&form_id).ok_or_else(|| anyhow!("form {form_id} not found"))?;
    let analytics = form.analytics.get_or_insert_with(|| Value::Object(Default::default()));
    if let Some(insights) = analytics.get_mut("insights").and_then(Value::as_object_mut) {
      insights.insert(kind.field_name().to_string(), value.clone());
    }
    Ok(())
  }

  async fn finalize_analytics(&self, form_id: Uuid, at: DateTime<Utc>) -> Result<()> {
    let mut forms = self.forms.lock().await;
    let form = forms.get_mut(&form_id).ok_or_else(|| anyhow!("form {form_id} not found"))?;
    if let Some(analytics) = form.analytics.as_mut().and_then(Value::as_object_mut) {
      analytics.insert("lastUpdated".to_string(), serde_json::to_value(at)?);
      form.analytics_updated_at = Some(at);
    }
    Ok(())
  }
}

#[async_trait]
impl DeadLetterSink for MemoryStore {
  async fn record(&self, record: &DeadLetterRecord) -> Result<()> {
    self.dead_letters.lock().await.push(record.clone());
    Ok(())
  }

  async fn list(&self, task_id: Option<Uuid>, limit: usize) -> Result<Vec<DeadLetterRecord>> {
    let records = self.dead_letters.lock().await;
    Ok(
      records
        .iter()
        .rev()
        .filter(|r| task_id.is_none_or(|id| r.task_id == id))
        .take(limit)
        .cloned()
        .collect(),
    )
  }
}

#[async_trait]
impl JobLedger for MemoryStore {
  async fn register(&self, job: &Job) -> Result<()> {
    self.jobs.lock().await.entry(job.id).or_default();
    Ok(())
  }

  async fn record_attempt(&self, job: &Job) -> Result<u32> {
    let mut jobs = self.jobs.lock().await;
    let entry = jobs.entry(job.id).or_default();
    entry.attempts += 1;
    Ok(entry.attempts)
  }

  async fn finish(&self, job_id: Uuid, outcome: &JobOutcome) -> Result<()> {
    self.jobs.lock().await.entry(job_id).or_default().outcome = Some(outcome.clone());
    self.finished.send_modify(|count| *count += 1);
    Ok(())
  }

  async fn outcome(&self, job_id: Uuid) -> Result<Option<JobOutcome>> {
    Ok(self.jobs.lock().await.get(&job_id).and_then(|e| e.outcome.clone()))
  }

  async fn wait(&self, job_id: Uuid) -> Result<JobOutcome> {
    let mut finished = self.finished.subscribe();
    loop {
      if let Some(outcome) = self.outcome(job_id).await? {
        return Ok(outcome);
      }
      finished.changed().await?;
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use super::*;
  use crate::models::{Answer, JobPayload, Stage};
  use serde_json::json;

  fn text_response(form_id: Uuid, text: &str) -> Response {
    Response::new(form_id, vec![Answer { question_id: "q1".into(), value: json!(text) }])
  }

  #[tokio::test]
  async fn only_one_concurrent_acquirer_wins() {
    let store = Arc::new(MemoryStore::new());
    let attempts = (0..16).map(|_| {
      let store = store.clone();
      tokio::spawn(async move { store.acquire("form-1", Uuid::new_v4(), "api", Duration::from_secs(30)).await })
    });
    let mut granted = 0;
    for attempt in attempts {
      if attempt.await.unwrap().unwrap().is_some() {
        granted += 1;
      }
    }
    assert_eq!(granted, 1);
  }

  #[tokio::test]
  async fn expired_lease_can_be_taken_over() {
    let store = MemoryStore::new();
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    assert!(store.acquire("form-1", first, "api", Duration::from_millis(20)).await.unwrap().is_some());
    assert!(store.acquire("form-1", second, "api", Duration::from_secs(30)).await.unwrap().is_none());
    tokio::time::sleep(Duration::from_millis(40)).await;
    let lease = store.acquire("form-1", second, "api", Duration::from_secs(30)).await.unwrap().unwrap();
    assert_eq!(lease.task_id, second);
    assert!(store.extend("form-1", first, "api", Duration::from_secs(30)).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn holder_can_reacquire_under_a_new_owner() {
    let store = MemoryStore::new();
    let task = Uuid::new_v4();
    store.acquire("form-1", task, "api", Duration::from_secs(30)).await.unwrap();
    let lease = store.acquire("form-1", task, "worker-a", Duration::from_secs(30)).await.unwrap().unwrap();
    assert_eq!(lease.owner_id, "worker-a");
  }

  #[tokio::test]
  async fn release_by_non_owner_is_a_no_op() {
    let store = MemoryStore::new();
    let task = Uuid::new_v4();
    store.acquire("form-1", task, "api", Duration::from_secs(30)).await.unwrap();
    store.release("form-1", task, "someone-else").await.unwrap();
    store.release("form-1", Uuid::new_v4(), "api").await.unwrap();
    assert_eq!(store.current("form-1").await.unwrap().map(|l| l.task_id), Some(task));
    store.release("form-1", task, "api").await.unwrap();
    assert!(store.current("form-1").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn extend_by_non_owner_leaves_the_lease_alone() {
    let store = MemoryStore::new();
    let task = Uuid::new_v4();
    let held = store.acquire("form-1", task, "api", Duration::from_secs(30)).await.unwrap().unwrap();
    assert!(store.extend("form-1", task, "someone-else", Duration::from_secs(300)).await.unwrap().is_none());

    let current = store.current("form-1").await.unwrap().unwrap();
    assert_eq!(current.owner_id, "api");
    assert_eq!(current.expires_at, held.expires_at);
  }

  #[tokio::test]
  async fn stale_active_skips_finished_and_fresh_tasks() {
    let store = MemoryStore::new();
    let mut old = Task::new(Uuid::new_v4(), Uuid::new_v4(), "api");
    old.created_at = Utc::now() - chrono::Duration::minutes(10);
    let mut done = old.clone();
    done.task_id = Uuid::new_v4();
    done.state = TaskState::Failed;
    let fresh = Task::new(Uuid::new_v4(), Uuid::new_v4(), "api");
    for task in [&old, &done, &fresh] {
      store.insert_task(task).await.unwrap();
    }

    let stale = store.stale_active(Utc::now() - chrono::Duration::minutes(1)).await.unwrap();
    assert_eq!(stale.iter().map(|t| t.task_id).collect::<Vec<_>>(), vec![old.task_id]);
  }

  #[tokio::test]
  async fn concurrent_claims_are_disjoint() {
    let store = Arc::new(MemoryStore::new());
    let form_id = Uuid::new_v4();
    for i in 0..50 {
      store.insert_response(&text_response(form_id, &format!("answer {i}"))).await.unwrap();
    }
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    let (left, right) = tokio::join!(store.claim(form_id, a, None), store.claim(form_id, b, None));
    let (left, right) = (left.unwrap(), right.unwrap());
    assert_eq!(left.len() + right.len(), 50);
    assert!(left.iter().all(|r| !right.iter().any(|o| o.id == r.id)));
  }

  #[tokio::test]
  async fn release_is_idempotent_and_reset_returns_items() {
    let store = MemoryStore::new();
    let form_id = Uuid::new_v4();
    for i in 0..4 {
      store.insert_response(&text_response(form_id, &format!("answer {i}"))).await.unwrap();
    }
    let task = Uuid::new_v4();
    let claimed = store.claim(form_id, task, None).await.unwrap();
    let ids: Vec<Uuid> = claimed.iter().map(|r| r.id).collect();
    assert!(store.eligible(form_id).await.unwrap().is_empty());

    assert_eq!(store.reset_claims(task, form_id).await.unwrap(), 4);
    assert_eq!(store.eligible(form_id).await.unwrap().len(), 4);

    store.claim(form_id, task, Some(&ids[..2])).await.unwrap();
    assert_eq!(store.release_claims(task, form_id).await.unwrap(), 2);
    assert_eq!(store.release_claims(task, form_id).await.unwrap(), 0);
    assert_eq!(store.processed_responses(form_id).await.unwrap().len(), 2);
  }

  #[tokio::test]
  async fn reprocess_only_touches_text_responses() {
    let store = MemoryStore::new();
    let form_id = Uuid::new_v4();
    let empty = Response::new(form_id, vec![Answer { question_id: "q2".into(), value: json!("   ") }]);
    store.insert_response(&empty).await.unwrap();
    store.insert_response(&text_response(form_id, "slow checkout")).await.unwrap();
    assert_eq!(store.mark_empty_processed(form_id).await.unwrap(), 1);

    let task = Uuid::new_v4();
    store.claim(form_id, task, None).await.unwrap();
    store.release_claims(task, form_id).await.unwrap();

    assert_eq!(store.reprocess(form_id, true).await.unwrap(), 0);
    assert_eq!(store.reprocess(form_id, false).await.unwrap(), 1);
    let eligible = store.eligible(form_id).await.unwrap();
    assert_eq!(eligible.len(), 1);
    assert!(eligible[0].has_text_content());
    assert!(!store.reprocess_one(form_id, empty.id).await.unwrap());
  }

  #[tokio::test]
  async fn ledger_wait_sees_a_later_finish() {
    let store = Arc::new(MemoryStore::new());
    let job = Job::new(Stage::Aggregation, Uuid::new_v4(), Uuid::new_v4(), JobPayload::Aggregate);
    store.register(&job).await.unwrap();
    let job_id = job.id;
    let waiter = {
      let store = store.clone();
      tokio::spawn(async move { store.wait(job_id).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    store.finish(job_id, &JobOutcome::DeadLettered("boom".into())).await.unwrap();
    assert_eq!(waiter.await.unwrap().unwrap(), JobOutcome::DeadLettered("boom".into()));
  }
}
