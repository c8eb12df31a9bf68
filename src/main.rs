use std::sync::Arc;

use anyhow::Result;
use surveyflow::analysis::HttpAnalysisClient;
use surveyflow::config::Config;
use surveyflow::database::setup_database;
use surveyflow::messaging::{RabbitJobQueue, RabbitProgressSink, create_rabbit_channel, spawn_progress_relay};
use surveyflow::orchestrator::Orchestrator;
use surveyflow::progress::ProgressBus;
use surveyflow::routes::{ApiState, routes};
use surveyflow::stages::PipelineContext;
use surveyflow::stores::PgStore;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();
  let config = Config::from_env()?;
  let db_pool = setup_database(&config.database_url).await?;
  let rabbit_channel = create_rabbit_channel(&config.rabbitmq_url).await?;

  let queue = RabbitJobQueue::declare(rabbit_channel.clone(), &config.instance_id).await?;
  let progress = RabbitProgressSink::new(rabbit_channel.clone()).await?;
  let bus = ProgressBus::default();
  let _relay = spawn_progress_relay(rabbit_channel, bus.clone()).await?;

  let ctx = PipelineContext::with_store(
    config.instance_id.clone(),
    config.pipeline.clone(),
    Arc::new(PgStore::new(db_pool)),
    Arc::new(queue),
    Arc::new(progress),
    Arc::new(HttpAnalysisClient::new(&config.analysis_url, config.analysis_timeout)?),
  );
  let state = ApiState { orchestrator: Arc::new(Orchestrator::new(ctx)), bus };

  info!(port = config.server_port, instance = %config.instance_id, "Analytics API listening");
  warp::serve(routes(state)).run(([0, 0, 0, 0], config.server_port)).await;
  Ok(())
}
