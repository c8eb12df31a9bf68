use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::{Value, json};
use tracing::debug;

use super::{AnalysisInput, AnalysisKind, TextAnalysisClient};
use crate::models::InsightKind;

/// JSON-over-HTTP client for the text-analysis service.
#[derive(Debug, Clone)]
pub struct HttpAnalysisClient {
  client: Client,
  base_url: Url,
}

impl HttpAnalysisClient {
  pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
    let client = Client::builder().timeout(timeout).build().context("failed to build analysis client")?;
    let mut base_url = Url::parse(endpoint).context("invalid analysis service URL")?;
    if !base_url.path().ends_with('/') {
      let path = format!("{}/", base_url.path());
      base_url.set_path(&path);
    }
    Ok(Self { client, base_url })
  }

  async fn post(&self, path: &str, body: Value) -> Result<Value> {
    let url = self.base_url.join(path).with_context(|| format!("failed to build analysis URL for {path}"))?;
    debug!(%url, "Calling analysis service");
    self
      .client
      .post(url)
      .json(&body)
      .send()
      .await
      .with_context(|| format!("analysis request to {path} failed"))?
      .error_for_status()
      .with_context(|| format!("analysis endpoint {path} returned error status"))?
      .json::<Value>()
      .await
      .with_context(|| format!("analysis endpoint {path} returned invalid JSON"))
  }
}

#[async_trait]
impl TextAnalysisClient for HttpAnalysisClient {
  async fn analyze(&self, kind: AnalysisKind, chunk: &[AnalysisInput]) -> Result<Value> {
    self.post("analyze", json!({ "kind": kind, "responses": chunk })).await
  }

  async fn canonical_topics(&self, topics: &[String]) -> Result<Value> {
    self.post("topics/canonicalize", json!({ "topics": topics })).await
  }

  async fn generate_insight(&self, kind: InsightKind, context: &Value) -> Result<Value> {
    self.post("insights", json!({ "kind": kind, "context": context })).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn base_url_keeps_its_path() {
    let client = HttpAnalysisClient::new("http://analysis.local/v1", Duration::from_secs(1)).unwrap();
    assert_eq!(client.base_url.join("analyze").unwrap().as_str(), "http://analysis.local/v1/analyze");
  }
}
