use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
  BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
  QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::task::JoinHandle;
use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{error, info, warn};

use crate::models::{Job, ProgressEvent, Stage};
use crate::progress::{ProgressBus, ProgressSink};
use crate::queue::{Delivery, DeliveryStream, JobQueue};

static MAX_RETRIES: usize = 5;
static DELAY: u64 = 100;

pub const PROGRESS_EXCHANGE: &str = "analytics.progress";

pub async fn create_rabbit_channel(rabbitmq_url: &str) -> Result<Channel> {
  let conn = Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || {
    Connection::connect(rabbitmq_url, ConnectionProperties::default())
  })
  .await
  .context("Failed to connect to RabbitMQ")?;
  let channel = conn.create_channel().await?;
  info!("RabbitMQ channel created");
  Ok(channel)
}

pub async fn publish_message(channel: &Channel, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
  Retry::spawn(ExponentialBackoff::from_millis(DELAY).take(MAX_RETRIES), || async {
    channel
      .basic_publish(
        exchange,
        routing_key,
        BasicPublishOptions::default(),
        payload,
        BasicProperties::default().with_delivery_mode(2),
      )
      .await
  })
  .await?;
  Ok(())
}

/// One durable RabbitMQ queue per stage.
#[derive(Clone)]
pub struct RabbitJobQueue {
  channel: Channel,
  consumer_tag: String,
}

impl RabbitJobQueue {
  pub async fn declare(channel: Channel, consumer_tag: &str) -> Result<Self> {
    for stage in Stage::ALL {
      channel
        .queue_declare(
          stage.queue_name(),
          QueueDeclareOptions { durable: true, ..QueueDeclareOptions::default() },
          FieldTable::default(),
        )
        .await
        .with_context(|| format!("Queue declaration failed for {}", stage.queue_name()))?;
    }
    Ok(Self { channel, consumer_tag: consumer_tag.to_string() })
  }
}

#[async_trait]
impl JobQueue for RabbitJobQueue {
  async fn publish(&self, job: &Job) -> Result<()> {
    let payload = serde_json::to_vec(job)?;
    publish_message(&self.channel, "", job.stage.queue_name(), &payload).await
  }

  async fn subscribe(&self, stage: Stage) -> Result<DeliveryStream> {
    let consumer = self
      .channel
      .basic_consume(
        stage.queue_name(),
        &format!("{}-{}", self.consumer_tag, stage),
        BasicConsumeOptions::default(),
        FieldTable::default(),
      )
      .await
      .with_context(|| format!("Failed to start consumer on {}", stage.queue_name()))?;

    Ok(
      consumer
        .filter_map(|delivery| async move {
          match delivery {
            Ok(delivery) => match serde_json::from_slice::<Job>(&delivery.data) {
              Ok(job) => Some(Delivery::rabbit(job, delivery)),
              Err(e) => {
                error!("Failed to parse job: {:?}", e);
                let _ = delivery.ack(BasicAckOptions::default()).await;
                None
              }
            },
            Err(e) => {
              error!("Consumer error: {:?}", e);
              None
            }
          }
        })
        .boxed(),
    )
  }

  async fn depth(&self, stage: Stage) -> Result<u32> {
    let queue = self
      .channel
      .queue_declare(
        stage.queue_name(),
        QueueDeclareOptions { passive: true, ..QueueDeclareOptions::default() },
        FieldTable::default(),
      )
      .await?;
    Ok(queue.message_count())
  }
}

pub async fn declare_progress_exchange(channel: &Channel) -> Result<()> {
  channel
    .exchange_declare(PROGRESS_EXCHANGE, ExchangeKind::Fanout, ExchangeDeclareOptions::default(), FieldTable::default())
    .await
    .context("Failed to declare progress exchange")?;
  Ok(())
}

/// Fans progress events out to every API instance.
pub struct RabbitProgressSink {
  channel: Channel,
}

impl RabbitProgressSink {
  pub async fn new(channel: Channel) -> Result<Self> {
    declare_progress_exchange(&channel).await?;
    Ok(Self { channel })
  }
}

#[async_trait]
impl ProgressSink for RabbitProgressSink {
  async fn publish(&self, event: ProgressEvent) {
    let payload = match serde_json::to_vec(&event) {
      Ok(payload) => payload,
      Err(e) => {
        warn!(task_id = %event.task_id, "Failed to encode progress event: {:?}", e);
        return;
      }
    };
    if let Err(e) = publish_message(&self.channel, PROGRESS_EXCHANGE, "", &payload).await {
      warn!(task_id = %event.task_id, "Failed to publish progress event: {:?}", e);
    }
  }
}

/// Feeds events from the progress exchange into the local bus.
pub async fn spawn_progress_relay(channel: Channel, bus: ProgressBus) -> Result<JoinHandle<()>> {
  declare_progress_exchange(&channel).await?;
  let queue = channel
    .queue_declare(
      "",
      QueueDeclareOptions { exclusive: true, auto_delete: true, ..QueueDeclareOptions::default() },
      FieldTable::default(),
    )
    .await
    .context("Failed to declare progress relay queue")?;
  let queue_name = queue.name().as_str().to_string();
  channel
    .queue_bind(&queue_name, PROGRESS_EXCHANGE, "", QueueBindOptions::default(), FieldTable::default())
    .await
    .context("Failed to bind progress relay queue")?;
  let mut consumer = channel
    .basic_consume(&queue_name, "progress-relay", BasicConsumeOptions::default(), FieldTable::default())
    .await
    .context("Failed to start progress relay")?;

  info!(queue = %queue_name, "Progress relay started");
  Ok(tokio::spawn(async move {
    while let Some(delivery) = consumer.next().await {
      match delivery {
        Ok(delivery) => {
          match serde_json::from_slice::<ProgressEvent>(&delivery.data) {
            Ok(event) => bus.publish(event).await,
            Err(e) => warn!("Dropping malformed progress event: {:?}", e),
          }
          let _ = delivery.ack(BasicAckOptions::default()).await;
        }
        Err(e) => error!("Progress relay error: {:?}", e),
      }
    }
    warn!("Progress relay stopped");
  }))
}
