use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use tokio::sync::{Mutex, Notify};

use crate::queue::Delivery;

/// A buffered delivery. Lower `priority` values run first; equal priorities
/// keep arrival order.
pub struct ScheduledJob {
  pub priority: u8,
  sequence: u64,
  pub delivery: Delivery,
}

impl Eq for ScheduledJob {}

impl PartialEq for ScheduledJob {
  fn eq(&self, other: &Self) -> bool {
    self.priority == other.priority && self.sequence == other.sequence
  }
}

impl PartialOrd for ScheduledJob {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for ScheduledJob {
  fn cmp(&self, other: &Self) -> Ordering {
    other.priority.cmp(&self.priority).then_with(|| other.sequence.cmp(&self.sequence))
  }
}

#[derive(Default)]
pub struct Scheduler {
  queue: Mutex<BinaryHeap<ScheduledJob>>,
  arrivals: AtomicU64,
  ready: Notify,
}

impl Scheduler {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn add(&self, delivery: Delivery) {
    let job = ScheduledJob {
      priority: delivery.job.priority,
      sequence: self.arrivals.fetch_add(1, AtomicOrdering::SeqCst),
      delivery,
    };
    self.queue.lock().await.push(job);
    self.ready.notify_one();
  }

  pub async fn try_next(&self) -> Option<ScheduledJob> {
    self.queue.lock().await.pop()
  }

  /// Waits for the most urgent buffered delivery.
  pub async fn next(&self) -> ScheduledJob {
    loop {
      if let Some(job) = self.try_next().await {
        return job;
      }
      self.ready.notified().await;
    }
  }

  pub async fn len(&self) -> usize {
    self.queue.lock().await.len()
  }
}
