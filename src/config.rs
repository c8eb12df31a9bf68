use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::models::Stage;
use crate::queue::RetryPolicy;

#[derive(Debug, Clone)]
pub struct Config {
  pub database_url: String,
  pub rabbitmq_url: String,
  pub server_port: u16,
  pub instance_id: String,
  pub analysis_url: String,
  pub analysis_timeout: Duration,
  pub pipeline: PipelineSettings,
}

/// Timing and sizing knobs shared by the API and the workers.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
  pub lease_ttl: Duration,
  pub task_retention: Duration,
  pub claim_ttl: Duration,
  pub claim_sweep_interval: Duration,
  pub wave_concurrency: usize,
  /// Upper bound on one run, from lease to the last insight.
  pub run_deadline: Duration,
}

impl Default for PipelineSettings {
  fn default() -> Self {
    PipelineSettings {
      lease_ttl: Duration::from_secs(60),
      task_retention: Duration::from_secs(3600),
      claim_ttl: Duration::from_secs(600),
      claim_sweep_interval: Duration::from_secs(30),
      wave_concurrency: 4,
      run_deadline: Duration::from_secs(3600),
    }
  }
}

/// Retry budget and consumer concurrency of one stage queue.
#[derive(Debug, Clone)]
pub struct StageSettings {
  pub policy: RetryPolicy,
  pub concurrency: usize,
}

impl StageSettings {
  pub fn for_stage(stage: Stage) -> Self {
    let analysis = RetryPolicy {
      max_attempts: 5,
      base_delay: Duration::from_secs(5),
      max_delay: Duration::from_secs(80),
      timeout: Some(Duration::from_secs(600)),
    };
    match stage {
      Stage::Orchestrate => StageSettings {
        policy: RetryPolicy { max_attempts: 1, timeout: None, ..analysis },
        concurrency: 2,
      },
      Stage::ResponseAnalysis => StageSettings { policy: analysis, concurrency: 5 },
      Stage::TopicClustering => StageSettings { policy: analysis, concurrency: 2 },
      Stage::Aggregation => StageSettings { policy: analysis, concurrency: 2 },
      Stage::InsightGeneration => StageSettings { policy: analysis, concurrency: 3 },
    }
  }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
  T: FromStr,
  T::Err: std::error::Error + Send + Sync + 'static,
{
  match env::var(key) {
    Ok(raw) => raw.parse().with_context(|| format!("Invalid value for {key}: '{raw}'")),
    Err(_) => Ok(default),
  }
}

impl Config {
  pub fn from_env() -> Result<Self> {
    let defaults = PipelineSettings::default();
    Ok(Self {
      database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
      rabbitmq_url: env::var("RABBITMQ_URL").context("RABBITMQ_URL must be set")?,
      server_port: env_or("SERVER_PORT", 8080)?,
      instance_id: env::var("WORKER_ID").unwrap_or_else(|_| format!("worker-{}", Uuid::new_v4())),
      analysis_url: env::var("ANALYSIS_URL").unwrap_or_else(|_| "http://localhost:8500".into()),
      analysis_timeout: Duration::from_secs(env_or("ANALYSIS_TIMEOUT_SECS", 60)?),
      pipeline: PipelineSettings {
        lease_ttl: Duration::from_secs(env_or("LEASE_TTL_SECS", defaults.lease_ttl.as_secs())?),
        task_retention: Duration::from_secs(env_or("TASK_RETENTION_SECS", defaults.task_retention.as_secs())?),
        claim_ttl: Duration::from_secs(env_or("CLAIM_TTL_SECS", defaults.claim_ttl.as_secs())?),
        claim_sweep_interval: Duration::from_secs(env_or(
          "CLAIM_SWEEP_INTERVAL_SECS",
          defaults.claim_sweep_interval.as_secs(),
        )?),
        wave_concurrency: env_or("WAVE_CONCURRENCY", defaults.wave_concurrency)?.max(1),
        run_deadline: Duration::from_secs(env_or("RUN_DEADLINE_SECS", defaults.run_deadline.as_secs())?),
      },
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn orchestration_is_never_retried() {
    assert_eq!(StageSettings::for_stage(Stage::Orchestrate).policy.max_attempts, 1);
    assert_eq!(StageSettings::for_stage(Stage::Orchestrate).policy.timeout, None);
    assert_eq!(StageSettings::for_stage(Stage::ResponseAnalysis).policy.max_attempts, 5);
    assert_eq!(StageSettings::for_stage(Stage::ResponseAnalysis).concurrency, 5);
  }

  #[test]
  fn unset_variables_fall_back() {
    assert_eq!(env_or("SURVEYFLOW_TEST_UNSET_VARIABLE", 42u64).unwrap(), 42);
  }
}
