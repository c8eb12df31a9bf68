use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use futures::future::select_all;
use surveyflow::analysis::HttpAnalysisClient;
use surveyflow::config::{Config, StageSettings};
use surveyflow::database::setup_database;
use surveyflow::housekeeping::spawn_housekeeping;
use surveyflow::messaging::{RabbitJobQueue, RabbitProgressSink, create_rabbit_channel};
use surveyflow::queue::JobQueue;
use surveyflow::stages::{PipelineContext, bindings};
use surveyflow::stores::PgStore;
use surveyflow::worker_processing::spawn_stage_workers;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();
  let config = Config::from_env()?;
  let db_pool = setup_database(&config.database_url).await?;
  let rabbit_channel = create_rabbit_channel(&config.rabbitmq_url).await?;

  let store = Arc::new(PgStore::new(db_pool));
  let queue: Arc<dyn JobQueue> = Arc::new(RabbitJobQueue::declare(rabbit_channel.clone(), &config.instance_id).await?);
  let progress = RabbitProgressSink::new(rabbit_channel).await?;
  let ctx = PipelineContext::with_store(
    config.instance_id.clone(),
    config.pipeline.clone(),
    store.clone(),
    queue.clone(),
    Arc::new(progress),
    Arc::new(HttpAnalysisClient::new(&config.analysis_url, config.analysis_timeout)?),
  );

  let workers = spawn_stage_workers(bindings(&ctx, StageSettings::for_stage), queue, store.clone(), store);
  let _housekeeping = spawn_housekeeping(ctx);
  info!(worker_id = %config.instance_id, stages = workers.len(), "Pipeline worker started");

  let (finished, index, _) = select_all(workers).await;
  match finished {
    Ok(Ok(())) => Err(anyhow!("stage consumer {index} stopped")),
    Ok(Err(e)) => {
      error!("Stage consumer {} failed: {:#}", index, e);
      Err(e)
    }
    Err(e) => Err(e).context("stage consumer panicked"),
  }
}
