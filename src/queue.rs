use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use lapin::options::BasicAckOptions;
use tokio::sync::{Mutex, mpsc};
use tokio_retry::strategy::ExponentialBackoff;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::warn;

use crate::models::{Job, Stage};

/// Attempts, backoff and per-attempt timeout of one stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
  /// `None` for handlers that bound their own run time and must finish
  /// their cleanup.
  pub timeout: Option<Duration>,
}

impl RetryPolicy {
  /// Delay before the attempt following `attempt` (1-based): base, 2x base, 4x base...
  pub fn delay_after(&self, attempt: u32) -> Duration {
    let factor = (self.base_delay.as_millis() / 2).max(1) as u64;
    ExponentialBackoff::from_millis(2)
      .factor(factor)
      .max_delay(self.max_delay)
      .nth(attempt.saturating_sub(1) as usize)
      .unwrap_or(self.max_delay)
  }
}

enum Acker {
  Memory,
  Rabbit(Box<lapin::message::Delivery>),
}

/// A job handed to a consumer, acknowledged once its outcome is recorded.
pub struct Delivery {
  pub job: Job,
  acker: Acker,
}

impl Delivery {
  pub fn memory(job: Job) -> Self {
    Delivery { job, acker: Acker::Memory }
  }

  pub fn rabbit(job: Job, delivery: lapin::message::Delivery) -> Self {
    Delivery { job, acker: Acker::Rabbit(Box::new(delivery)) }
  }

  pub async fn ack(self) {
    if let Acker::Rabbit(delivery) = self.acker {
      if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
        warn!(job_id = %self.job.id, "Failed to ack delivery: {:?}", e);
      }
    }
  }
}

pub type DeliveryStream = BoxStream<'static, Delivery>;

#[async_trait]
pub trait JobQueue: Send + Sync {
  async fn publish(&self, job: &Job) -> Result<()>;

  /// Starts consuming a stage queue.
  async fn subscribe(&self, stage: Stage) -> Result<DeliveryStream>;

  async fn depth(&self, stage: Stage) -> Result<u32>;
}

struct MemoryLane {
  sender: mpsc::UnboundedSender<Job>,
  receiver: Mutex<Option<mpsc::UnboundedReceiver<Job>>>,
  depth: Arc<AtomicU32>,
}

/// In-process queue with one consumer per stage.
pub struct MemoryQueue {
  lanes: HashMap<Stage, MemoryLane>,
}

impl Default for MemoryQueue {
  fn default() -> Self {
    let lanes = Stage::ALL
      .into_iter()
      .map(|stage| {
        let (sender, receiver) = mpsc::unbounded_channel();
        (stage, MemoryLane { sender, receiver: Mutex::new(Some(receiver)), depth: Arc::default() })
      })
      .collect();
    MemoryQueue { lanes }
  }
}

impl MemoryQueue {
  pub fn new() -> Self {
    Self::default()
  }

  fn lane(&self, stage: Stage) -> Result<&MemoryLane> {
    self.lanes.get(&stage).ok_or_else(|| anyhow!("no queue for stage {stage}"))
  }
}

#[async_trait]
impl JobQueue for MemoryQueue {
  async fn publish(&self, job: &Job) -> Result<()> {
    let lane = self.lane(job.stage)?;
    lane.sender.send(job.clone()).map_err(|_| anyhow!("{} queue is closed", job.stage))?;
    lane.depth.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }

  async fn subscribe(&self, stage: Stage) -> Result<DeliveryStream> {
    let lane = self.lane(stage)?;
    let receiver = lane.receiver.lock().await.take().ok_or_else(|| anyhow!("{stage} queue already has a consumer"))?;
    let depth = lane.depth.clone();
    Ok(
      UnboundedReceiverStream::new(receiver)
        .map(move |job| {
          depth.fetch_sub(1, Ordering::SeqCst);
          Delivery::memory(job)
        })
        .boxed(),
    )
  }

  async fn depth(&self, stage: Stage) -> Result<u32> {
    Ok(self.lane(stage)?.depth.load(Ordering::SeqCst))
  }
}
