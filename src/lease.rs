use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};
use crate::stores::{ClaimStore, LeaseLock};

const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

pub fn resource_key(resource_id: Uuid) -> String {
  format!("form-analytics:{resource_id}")
}

/// Keeps a lease alive while a run is in flight. Extends every ttl/3 and
/// flags the loss as soon as an extension is refused.
pub struct LeaseHeartbeat {
  key: String,
  task_id: Uuid,
  lost: watch::Receiver<bool>,
  handle: JoinHandle<()>,
}

impl LeaseHeartbeat {
  pub fn spawn(leases: Arc<dyn LeaseLock>, key: String, task_id: Uuid, owner_id: String, ttl: Duration) -> Self {
    let (lost_tx, lost) = watch::channel(false);
    let period = (ttl / 3).max(MIN_HEARTBEAT);
    let beat_key = key.clone();
    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(period);
      ticker.tick().await;
      loop {
        ticker.tick().await;
        match leases.extend(&beat_key, task_id, &owner_id, ttl).await {
          Ok(Some(lease)) => debug!(key = %beat_key, %task_id, expires_at = %lease.expires_at, "Lease extended"),
          Ok(None) => {
            warn!(key = %beat_key, %task_id, "Lease lost, stopping heartbeat");
            let _ = lost_tx.send(true);
            break;
          }
          Err(e) => warn!(key = %beat_key, %task_id, "Lease extension failed: {:#}", e),
        }
      }
    });
    Self { key, task_id, lost, handle }
  }

  pub fn ensure_held(&self) -> PipelineResult<()> {
    if *self.lost.borrow() {
      return Err(PipelineError::LeaseLost { resource_key: self.key.clone(), task_id: self.task_id });
    }
    Ok(())
  }
}

impl Drop for LeaseHeartbeat {
  fn drop(&mut self) {
    self.handle.abort();
  }
}

/// Returns claims to the pool when their task no longer holds the form's lease.
pub async fn sweep_stale_claims(
  claims: &dyn ClaimStore,
  leases: &dyn LeaseLock,
  claim_ttl: Duration,
) -> PipelineResult<u64> {
  let cutoff = Utc::now() - chrono::Duration::milliseconds(claim_ttl.as_millis().min(i64::MAX as u128) as i64);
  let mut reset = 0;
  for (resource_id, task_id) in claims.stale_claims(cutoff).await? {
    let holder = leases.current(&resource_key(resource_id)).await?;
    if holder.is_some_and(|lease| lease.task_id == task_id) {
      continue;
    }
    let count = claims.reset_claims(task_id, resource_id).await?;
    if count > 0 {
      info!(%resource_id, %task_id, count, "Reset stale claims");
    }
    reset += count;
  }
  Ok(reset)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::{Answer, Response};
  use crate::stores::MemoryStore;
  use serde_json::json;

  #[tokio::test]
  async fn heartbeat_notices_a_stolen_lease() {
    let store = Arc::new(MemoryStore::new());
    let key = resource_key(Uuid::new_v4());
    let task = Uuid::new_v4();
    store.acquire(&key, task, "worker", Duration::from_millis(60)).await.unwrap();
    let heartbeat = LeaseHeartbeat::spawn(store.clone(), key.clone(), task, "worker".into(), Duration::from_millis(60));
    tokio::time::sleep(Duration::from_millis(70)).await;
    assert!(heartbeat.ensure_held().is_ok());

    store.release(&key, task, "worker").await.unwrap();
    store.acquire(&key, Uuid::new_v4(), "other", Duration::from_secs(30)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(matches!(heartbeat.ensure_held(), Err(PipelineError::LeaseLost { .. })));
  }

  #[tokio::test]
  async fn sweep_spares_claims_of_the_lease_holder() {
    let store = MemoryStore::new();
    let form_id = Uuid::new_v4();
    for i in 0..3 {
      let response = Response::new(form_id, vec![Answer { question_id: "q".into(), value: json!(format!("text {i}")) }]);
      store.insert_response(&response).await.unwrap();
    }
    let live = Uuid::new_v4();
    store.acquire(&resource_key(form_id), live, "worker", Duration::from_secs(30)).await.unwrap();
    store.claim(form_id, live, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(sweep_stale_claims(&store, &store, Duration::ZERO).await.unwrap(), 0);

    store.release(&resource_key(form_id), live, "worker").await.unwrap();
    assert_eq!(sweep_stale_claims(&store, &store, Duration::ZERO).await.unwrap(), 3);
    assert_eq!(store.eligible(form_id).await.unwrap().len(), 3);
  }
}
