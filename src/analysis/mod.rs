//! Text-analysis collaborator: request shapes, typed results and the merge of
//! the three per-chunk analyses into one record per response.

mod http;

use std::collections::HashMap;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{Form, InsightKind, Response};

pub use http::HttpAnalysisClient;

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("static whitespace pattern"));

pub fn collapse_whitespace(text: &str) -> String {
  WHITESPACE.replace_all(text.trim(), " ").into_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisKind {
  Topics,
  Sentiment,
  Quotes,
}

impl AnalysisKind {
  pub const ALL: [AnalysisKind; 3] = [AnalysisKind::Topics, AnalysisKind::Sentiment, AnalysisKind::Quotes];
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerText {
  pub question_id: String,
  pub question: String,
  pub text: String,
}

/// One response as sent to the collaborator: free-text answers only.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisInput {
  pub response_id: Uuid,
  pub answers: Vec<AnswerText>,
}

impl AnalysisInput {
  pub fn from_response(response: &Response, form: &Form) -> Self {
    let answers = response
      .answers
      .iter()
      .filter_map(|answer| {
        let text = answer.text()?;
        let question = form
          .question(&answer.question_id)
          .map(|q| q.title.clone())
          .unwrap_or_else(|| answer.question_id.clone());
        Some(AnswerText { question_id: answer.question_id.clone(), question, text: collapse_whitespace(text) })
      })
      .collect();
    AnalysisInput { response_id: response.id, answers }
  }
}

#[async_trait]
pub trait TextAnalysisClient: Send + Sync {
  async fn analyze(&self, kind: AnalysisKind, chunk: &[AnalysisInput]) -> anyhow::Result<Value>;

  /// Returns `{"mapping": {raw: canonical}}` for the given raw topics.
  async fn canonical_topics(&self, topics: &[String]) -> anyhow::Result<Value>;

  async fn generate_insight(&self, kind: InsightKind, context: &Value) -> anyhow::Result<Value>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicTag {
  pub topic: String,
  #[serde(default)]
  pub is_primary: bool,
  #[serde(default)]
  pub confidence: Option<f64>,
  #[serde(default)]
  pub source_questions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicResult {
  pub response_id: Uuid,
  #[serde(default)]
  pub topics: Vec<TopicTag>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverallSentiment {
  #[serde(alias = "sentiment")]
  pub label: String,
  #[serde(default)]
  pub score: f64,
  #[serde(default)]
  pub emotional_tone: Option<String>,
  #[serde(default)]
  pub confidence: Option<f64>,
}

impl OverallSentiment {
  /// Buckets free-form labels into positive / negative / neutral.
  pub fn polarity(&self) -> &'static str {
    match self.label.trim().to_lowercase().as_str() {
      "positive" | "very positive" => "positive",
      "negative" | "very negative" => "negative",
      _ => "neutral",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentimentResult {
  pub response_id: Uuid,
  #[serde(default)]
  pub overall_sentiment: Option<OverallSentiment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawQuote {
  #[serde(alias = "quote")]
  pub text: String,
  #[serde(default)]
  pub question_id: Option<String>,
  #[serde(default)]
  pub themes: Vec<String>,
  #[serde(default)]
  pub representativeness: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawQuality {
  #[serde(default)]
  pub depth: Option<f64>,
  #[serde(default)]
  pub completeness: Option<f64>,
  #[serde(default)]
  pub clarity: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteResult {
  pub response_id: Uuid,
  #[serde(default)]
  pub quotes: Vec<RawQuote>,
  #[serde(default)]
  pub response_quality: Option<RawQuality>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyQuote {
  pub quote: String,
  pub question_id: Option<String>,
  pub related_topics: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Representativeness {
  Typical,
  Mixed,
  Deviant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Depth {
  Superficial,
  Moderate,
  Deep,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseQuality {
  pub depth: Depth,
  pub completeness: f64,
  pub coherence: f64,
}

impl Default for ResponseQuality {
  fn default() -> Self {
    ResponseQuality { depth: Depth::Moderate, completeness: 0.5, coherence: 0.5 }
  }
}

/// Merged per-response analysis persisted on the response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemAnalysis {
  #[serde(default)]
  pub topics: Vec<TopicTag>,
  #[serde(default)]
  pub sentiment: Option<OverallSentiment>,
  #[serde(default)]
  pub quotes: Vec<KeyQuote>,
  pub representativeness: Representativeness,
  #[serde(default)]
  pub quality: ResponseQuality,
}

/// Accepts either a bare array or an object wrapping it under `results`.
pub fn parse_results<T: DeserializeOwned>(value: Value) -> Result<Vec<T>, serde_json::Error> {
  let array = match value {
    Value::Object(mut map) => map.remove("results").unwrap_or(Value::Array(Vec::new())),
    other => other,
  };
  serde_json::from_value(array)
}

fn classify_representativeness(quotes: &[RawQuote]) -> Representativeness {
  if quotes.is_empty() {
    return Representativeness::Typical;
  }
  let avg = quotes.iter().map(|q| q.representativeness.unwrap_or(0.0)).sum::<f64>() / quotes.len() as f64;
  if avg < 0.4 {
    Representativeness::Deviant
  } else if avg < 0.7 {
    Representativeness::Mixed
  } else {
    Representativeness::Typical
  }
}

fn classify_quality(quality: Option<&RawQuality>) -> ResponseQuality {
  let Some(quality) = quality else {
    return ResponseQuality::default();
  };
  let depth = match quality.depth {
    Some(d) if d < 0.4 => Depth::Superficial,
    Some(d) if d >= 0.7 => Depth::Deep,
    _ => Depth::Moderate,
  };
  ResponseQuality {
    depth,
    completeness: quality.completeness.unwrap_or(0.5),
    coherence: quality.clarity.unwrap_or(0.5),
  }
}

/// Joins the three result sets on response id. Results for ids outside the
/// chunk are dropped; responses without any result are left out.
pub fn merge_chunk(
  ids: &[Uuid],
  topics: Option<Vec<TopicResult>>,
  sentiments: Option<Vec<SentimentResult>>,
  quotes: Option<Vec<QuoteResult>>,
) -> Vec<(Uuid, ItemAnalysis)> {
  let mut topics: HashMap<Uuid, TopicResult> =
    topics.unwrap_or_default().into_iter().map(|r| (r.response_id, r)).collect();
  let mut sentiments: HashMap<Uuid, SentimentResult> =
    sentiments.unwrap_or_default().into_iter().map(|r| (r.response_id, r)).collect();
  let mut quotes: HashMap<Uuid, QuoteResult> =
    quotes.unwrap_or_default().into_iter().map(|r| (r.response_id, r)).collect();

  ids
    .iter()
    .filter_map(|id| {
      let topic = topics.remove(id);
      let sentiment = sentiments.remove(id);
      let quote = quotes.remove(id);
      if topic.is_none() && sentiment.is_none() && quote.is_none() {
        return None;
      }
      let raw_quotes = quote.as_ref().map(|q| q.quotes.clone()).unwrap_or_default();
      let analysis = ItemAnalysis {
        topics: topic
          .map(|t| t.topics.into_iter().filter(|tag| !tag.topic.trim().is_empty()).collect())
          .unwrap_or_default(),
        sentiment: sentiment.and_then(|s| s.overall_sentiment),
        representativeness: classify_representativeness(&raw_quotes),
        quality: classify_quality(quote.as_ref().and_then(|q| q.response_quality.as_ref())),
        quotes: raw_quotes
          .into_iter()
          .filter(|q| !q.text.trim().is_empty())
          .map(|q| KeyQuote { quote: q.text, question_id: q.question_id, related_topics: q.themes })
          .collect(),
      };
      Some((*id, analysis))
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn merges_partial_results_by_response_id() {
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let stranger = Uuid::new_v4();
    let topics = parse_results::<TopicResult>(json!({
      "results": [
        {"responseId": a, "topics": [{"topic": "Pricing", "isPrimary": true}]},
        {"responseId": stranger, "topics": [{"topic": "Noise"}]}
      ]
    }))
    .unwrap();
    let sentiments = parse_results::<SentimentResult>(json!([
      {"responseId": b, "overallSentiment": {"label": "negative", "score": -0.6, "emotionalTone": "frustrated"}}
    ]))
    .unwrap();

    let merged = merge_chunk(&[a, b], Some(topics), Some(sentiments), None);
    assert_eq!(merged.len(), 2);
    assert_eq!(merged[0].0, a);
    assert_eq!(merged[0].1.topics[0].topic, "Pricing");
    assert!(merged[0].1.sentiment.is_none());
    assert_eq!(merged[1].1.sentiment.as_ref().unwrap().polarity(), "negative");
    assert_eq!(merged[1].1.quality, ResponseQuality::default());
  }

  #[test]
  fn quote_scores_become_labels() {
    let id = Uuid::new_v4();
    let quotes = parse_results::<QuoteResult>(json!([{
      "responseId": id,
      "quotes": [{"text": "It crashes daily", "representativeness": 0.3}],
      "responseQuality": {"depth": 0.8, "completeness": 0.9}
    }]))
    .unwrap();
    let merged = merge_chunk(&[id], None, None, Some(quotes));
    let analysis = &merged[0].1;
    assert_eq!(analysis.representativeness, Representativeness::Deviant);
    assert_eq!(analysis.quality.depth, Depth::Deep);
    assert_eq!(analysis.quality.completeness, 0.9);
    assert_eq!(analysis.quality.coherence, 0.5);
  }

  #[test]
  fn malformed_payload_is_a_parse_error() {
    assert!(parse_results::<TopicResult>(json!({"results": "nope"})).is_err());
  }

  #[test]
  fn whitespace_is_collapsed() {
    assert_eq!(collapse_whitespace("  too \n\t many   spaces "), "too many spaces");
  }
}
