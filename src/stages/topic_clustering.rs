use std::collections::{BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use super::{PipelineContext, StageHandler, unexpected_payload};
use crate::analysis::collapse_whitespace;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{Job, JobPayload};

fn normalize(topic: &str) -> String {
  collapse_whitespace(&topic.to_lowercase())
}

/// Reads `{"mapping": {raw: canonical}}` (or the bare object) into a lookup
/// keyed by normalized raw topic.
pub fn parse_mapping(value: Value) -> PipelineResult<HashMap<String, String>> {
  let inner = match value {
    Value::Object(mut map) if map.contains_key("mapping") => map.remove("mapping").unwrap_or_default(),
    other => other,
  };
  let raw: HashMap<String, String> = serde_json::from_value(inner)?;
  Ok(
    raw
      .into_iter()
      .map(|(from, to)| (normalize(&from), collapse_whitespace(&to)))
      .filter(|(from, to)| !from.is_empty() && !to.is_empty())
      .collect(),
  )
}

/// Maps raw topics through the lookup, keeping unknown ones, without duplicates.
pub fn canonicalize(raw: &[String], mapping: &HashMap<String, String>) -> Vec<String> {
  let mut seen = HashSet::new();
  raw
    .iter()
    .filter_map(|topic| {
      let canonical = mapping.get(&normalize(topic)).cloned().unwrap_or_else(|| collapse_whitespace(topic));
      (!canonical.is_empty()).then_some(canonical)
    })
    .filter(|topic| seen.insert(topic.clone()))
    .collect()
}

/// Merges near-duplicate topics across the form's analyzed responses.
pub struct TopicClusteringStage {
  ctx: PipelineContext,
}

impl TopicClusteringStage {
  pub fn new(ctx: PipelineContext) -> Self {
    Self { ctx }
  }
}

#[async_trait]
impl StageHandler for TopicClusteringStage {
  async fn handle(&self, job: &Job) -> PipelineResult<()> {
    if !matches!(job.payload, JobPayload::ClusterTopics) {
      return Err(unexpected_payload(job));
    }
    let ctx = &self.ctx;
    let responses = ctx.claims.processed_responses(job.resource_id).await?;
    let raw: BTreeSet<String> =
      responses.iter().flat_map(|r| r.raw_topics()).map(|t| collapse_whitespace(&t)).filter(|t| !t.is_empty()).collect();
    if raw.is_empty() {
      info!(task_id = %job.task_id, "No topics to cluster");
      return Ok(());
    }

    let raw: Vec<String> = raw.into_iter().collect();
    let value = ctx
      .analysis
      .canonical_topics(&raw)
      .await
      .map_err(|e| PipelineError::Analysis(format!("{e:#}")))?;
    let mapping = parse_mapping(value).unwrap_or_else(|e| {
      warn!(task_id = %job.task_id, "Unusable topic mapping, keeping raw topics: {}", e);
      HashMap::new()
    });

    for response in &responses {
      let topics = canonicalize(&response.raw_topics(), &mapping);
      ctx.claims.set_canonical_topics(response.id, &topics).await?;
    }
    let clusters: BTreeSet<&String> = mapping.values().collect();
    info!(task_id = %job.task_id, raw = raw.len(), clusters = clusters.len(), "Topics clustered");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn mapping_keys_are_normalized() {
    let mapping = parse_mapping(json!({"mapping": {"  Price  Too High ": "Pricing", "cost": "Pricing"}})).unwrap();
    assert_eq!(mapping.get("price too high").map(String::as_str), Some("Pricing"));
    let topics = canonicalize(&["PRICE too   high".into(), "Cost".into(), "Support".into()], &mapping);
    assert_eq!(topics, vec!["Pricing".to_string(), "Support".to_string()]);
  }

  #[test]
  fn unusable_mapping_is_an_error() {
    assert!(parse_mapping(json!({"mapping": ["nope"]})).is_err());
    assert!(canonicalize(&["Speed".into()], &HashMap::new()) == vec!["Speed".to_string()]);
  }
}
