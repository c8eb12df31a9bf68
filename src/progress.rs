use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{EventKind, ProgressEvent};
use crate::task_registry::TaskRegistry;

const DEFAULT_CAPACITY: usize = 256;

/// Where stage code sends progress events.
#[async_trait]
pub trait ProgressSink: Send + Sync {
  async fn publish(&self, event: ProgressEvent);
}

/// Per-run broadcast channels feeding live subscribers. A run's channel is
/// dropped after its terminal event, which ends every subscription.
#[derive(Clone)]
pub struct ProgressBus {
  channels: Arc<Mutex<HashMap<Uuid, broadcast::Sender<ProgressEvent>>>>,
  capacity: usize,
}

impl Default for ProgressBus {
  fn default() -> Self {
    Self::new(DEFAULT_CAPACITY)
  }
}

impl ProgressBus {
  pub fn new(capacity: usize) -> Self {
    Self { channels: Arc::default(), capacity: capacity.max(1) }
  }

  pub async fn subscribe(&self, task_id: Uuid) -> broadcast::Receiver<ProgressEvent> {
    let mut channels = self.channels.lock().await;
    channels.entry(task_id).or_insert_with(|| broadcast::channel(self.capacity).0).subscribe()
  }

  /// Drops a run's channel once nothing more will be sent on it.
  pub async fn close(&self, task_id: Uuid) {
    self.channels.lock().await.remove(&task_id);
  }

  pub async fn active_runs(&self) -> usize {
    self.channels.lock().await.len()
  }

  async fn dispatch(&self, event: ProgressEvent) {
    let mut channels = self.channels.lock().await;
    let task_id = event.task_id;
    let terminal = event.kind.is_terminal();
    let mut abandoned = false;
    if let Some(sender) = channels.get(&task_id) {
      let receivers = sender.send(event).unwrap_or(0);
      debug!(%task_id, receivers, "Progress event dispatched");
      abandoned = sender.receiver_count() == 0;
    }
    if terminal || abandoned {
      channels.remove(&task_id);
    }
  }
}

#[async_trait]
impl ProgressSink for ProgressBus {
  async fn publish(&self, event: ProgressEvent) {
    self.dispatch(event).await;
  }
}

/// Emits events for one run while keeping the stored task progress monotonic.
#[derive(Clone)]
pub struct ProgressReporter {
  tasks: TaskRegistry,
  sink: Arc<dyn ProgressSink>,
  task_id: Uuid,
}

impl ProgressReporter {
  pub fn new(tasks: TaskRegistry, sink: Arc<dyn ProgressSink>, task_id: Uuid) -> Self {
    Self { tasks, sink, task_id }
  }

  pub async fn progress(&self, progress: u8, message: impl Into<String>) {
    self.emit(ProgressEvent::new(self.task_id, EventKind::Progress, progress, message)).await;
  }

  pub async fn emit(&self, mut event: ProgressEvent) {
    let update_task = !matches!(event.kind, EventKind::Start | EventKind::Error | EventKind::Complete);
    if update_task {
      match self.tasks.record_progress(self.task_id, event.progress, Some(&event.message)).await {
        Ok(stored) => event.progress = stored,
        Err(e) => warn!(task_id = %self.task_id, "Failed to record progress: {}", e),
      }
    }
    self.sink.publish(event).await;
  }

  pub fn event(&self, kind: EventKind, progress: u8, message: impl Into<String>) -> ProgressEvent {
    ProgressEvent::new(self.task_id, kind, progress, message)
  }
}

/// Fraction of a progress band, used to spread stage progress over its range.
pub fn band(start: u8, end: u8, done: usize, total: usize) -> u8 {
  if total == 0 {
    return end;
  }
  let span = end.saturating_sub(start) as usize;
  start + (span * done.min(total) / total) as u8
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::TaskState;
  use crate::stores::MemoryStore;
  use std::time::Duration;

  #[tokio::test]
  async fn terminal_event_closes_subscriptions() {
    let bus = ProgressBus::default();
    let task_id = Uuid::new_v4();
    let mut rx = bus.subscribe(task_id).await;
    bus.publish(ProgressEvent::new(task_id, EventKind::Progress, 10, "working")).await;
    bus.publish(ProgressEvent::new(task_id, EventKind::Complete, 100, "done")).await;

    assert_eq!(rx.recv().await.unwrap().progress, 10);
    assert_eq!(rx.recv().await.unwrap().kind, EventKind::Complete);
    assert!(rx.recv().await.is_err());
    assert_eq!(bus.active_runs().await, 0);
  }

  #[tokio::test]
  async fn channel_without_listeners_is_dropped() {
    let bus = ProgressBus::default();
    let task_id = Uuid::new_v4();
    drop(bus.subscribe(task_id).await);
    assert_eq!(bus.active_runs().await, 1);

    bus.publish(ProgressEvent::new(task_id, EventKind::Progress, 10, "working")).await;
    assert_eq!(bus.active_runs().await, 0);

    let mut rx = bus.subscribe(task_id).await;
    bus.publish(ProgressEvent::new(task_id, EventKind::Progress, 20, "still working")).await;
    assert_eq!(rx.recv().await.unwrap().progress, 20);
    assert_eq!(bus.active_runs().await, 1);
  }

  #[tokio::test]
  async fn reporter_never_lowers_progress() {
    let store = Arc::new(MemoryStore::new());
    let tasks = TaskRegistry::new(store, Duration::from_secs(60));
    let task_id = Uuid::new_v4();
    tasks.create(task_id, Uuid::new_v4(), "api").await.unwrap();
    tasks.transition(task_id, TaskState::Pending, None, None).await.unwrap();
    tasks.transition(task_id, TaskState::Running, None, None).await.unwrap();

    let bus = ProgressBus::default();
    let mut rx = bus.subscribe(task_id).await;
    let reporter = ProgressReporter::new(tasks, Arc::new(bus.clone()), task_id);
    reporter.progress(45, "analysis done").await;
    reporter.progress(30, "late straggler").await;

    assert_eq!(rx.recv().await.unwrap().progress, 45);
    assert_eq!(rx.recv().await.unwrap().progress, 45);
  }

  #[test]
  fn bands_split_evenly() {
    assert_eq!(band(5, 45, 0, 4), 5);
    assert_eq!(band(5, 45, 2, 4), 25);
    assert_eq!(band(5, 45, 4, 4), 45);
    assert_eq!(band(5, 45, 0, 0), 45);
  }
}
