//! Narrative insights: collaborator context, response parsing and the
//! rule-based fallbacks used when generation is unavailable.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::aggregate::Aggregate;
use crate::models::Form;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
  High,
  Medium,
  Low,
}

impl Confidence {
  fn from_share(percentage: f64) -> Self {
    if percentage >= 50.0 {
      Confidence::High
    } else if percentage >= 30.0 {
      Confidence::Medium
    } else {
      Confidence::Low
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Evidence {
  pub supporting_quotes: Vec<String>,
  pub pattern: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub significance: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyFinding {
  pub finding: String,
  #[serde(default)]
  pub evidence: Evidence,
  pub confidence: Confidence,
  #[serde(default)]
  pub based_on_responses: u32,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub importance: Option<Confidence>,
}

/// Ordered urgent, important, maintain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
  Urgent,
  Important,
  Maintain,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
  pub recommendation: String,
  pub priority: Priority,
  #[serde(default)]
  pub based_on: String,
  #[serde(default)]
  pub suggested_action: String,
  #[serde(default)]
  pub expected_impact: String,
  pub confidence: Confidence,
}

fn coverage(supporting: u32, total: u32) -> Confidence {
  if total == 0 {
    return Confidence::Low;
  }
  Confidence::from_share(supporting as f64 / total as f64 * 100.0)
}

pub fn fallback_findings(aggregate: &Aggregate) -> Vec<KeyFinding> {
  let total = aggregate.total_responses_analyzed;
  let sentiment = &aggregate.sentiment;
  let mut findings = Vec::new();

  if let Some(top) = aggregate.top_topics.first() {
    if let Some(frequency) = aggregate.topic_distribution.get(top) {
      findings.push(KeyFinding {
        finding: format!("Most discussed topic: \"{}\" (mentioned in {}% of responses)", top, frequency.percentage),
        evidence: Evidence {
          supporting_quotes: aggregate
            .representative_quotes
            .iter()
            .filter(|q| q.topics.contains(top))
            .take(3)
            .map(|q| q.text.clone())
            .collect(),
          pattern: format!("Mentioned {} times across {} responses", frequency.count, total),
          significance: None,
        },
        confidence: coverage(frequency.count, total),
        based_on_responses: frequency.count,
        importance: Some(Confidence::High),
      });
    }
  }

  let dominant = if sentiment.positive > sentiment.negative {
    "positive"
  } else if sentiment.negative > sentiment.positive {
    "negative"
  } else {
    "neutral"
  };
  let dominance = sentiment.positive.max(sentiment.negative).max(sentiment.neutral);
  findings.push(KeyFinding {
    finding: format!(
      "Overall sentiment is {} ({}% positive, {}% neutral, {}% negative)",
      dominant, sentiment.positive, sentiment.neutral, sentiment.negative
    ),
    evidence: Evidence {
      supporting_quotes: aggregate.representative_quotes.iter().take(3).map(|q| q.text.clone()).collect(),
      pattern: format!("Sentiment distribution across {} responses", total),
      significance: Some((sentiment.positive as f64 - sentiment.negative as f64).abs() / 100.0),
    },
    confidence: Confidence::from_share(dominance as f64),
    based_on_responses: total,
    importance: Some(if sentiment.negative > 30 { Confidence::High } else { Confidence::Medium }),
  });

  if let Some(first) = aggregate.emotional_tones.first() {
    let tones: Vec<String> =
      aggregate.emotional_tones.iter().take(3).map(|t| format!("{} ({}%)", t.tone, t.percentage)).collect();
    findings.push(KeyFinding {
      finding: format!("Dominant emotional tones: {}", tones.join(", ")),
      evidence: Evidence {
        supporting_quotes: Vec::new(),
        pattern: format!("Emotional tone distribution across {} responses", total),
        significance: None,
      },
      confidence: Confidence::from_share(first.percentage as f64),
      based_on_responses: total,
      importance: None,
    });
  }

  let quality = aggregate.data_quality.overall_score;
  findings.push(KeyFinding {
    finding: format!("Average response quality: {:.0}%", quality * 100.0),
    evidence: Evidence {
      supporting_quotes: Vec::new(),
      pattern: "Quality metrics: completeness, depth, and clarity averaged across responses".to_string(),
      significance: None,
    },
    confidence: if quality >= 0.7 {
      Confidence::High
    } else if quality >= 0.5 {
      Confidence::Medium
    } else {
      Confidence::Low
    },
    based_on_responses: total,
    importance: Some(if quality < 0.6 { Confidence::High } else { Confidence::Medium }),
  });

  findings
}

pub fn fallback_recommendations(aggregate: &Aggregate) -> Vec<Recommendation> {
  let sentiment = &aggregate.sentiment;
  let quality = aggregate.data_quality.overall_score;
  let mut recommendations = Vec::new();

  if sentiment.negative > 30 {
    recommendations.push(Recommendation {
      recommendation: "Address issues causing negative sentiment".to_string(),
      priority: Priority::Urgent,
      based_on: format!("{}% of responses show negative sentiment", sentiment.negative),
      suggested_action: "Review negative responses and identify common pain points or concerns".to_string(),
      expected_impact: "Improved user satisfaction and response quality".to_string(),
      confidence: Confidence::High,
    });
  }

  let topics = aggregate.top_topics.len();
  if topics >= 8 {
    let target = match topics {
      t if t >= 15 => "3-5",
      t if t >= 10 => "4-6",
      _ => "5-7",
    };
    recommendations.push(Recommendation {
      recommendation: "Consider consolidating or categorizing topics".to_string(),
      priority: Priority::Important,
      based_on: format!("{} distinct topics identified, which may indicate scattered focus", topics),
      suggested_action: format!("Group related topics into {} main themes for clearer insights", target),
      expected_impact: "More focused analysis and actionable insights".to_string(),
      confidence: Confidence::Medium,
    });
  }

  if quality < 0.6 {
    recommendations.push(Recommendation {
      recommendation: "Improve question clarity or provide more guidance to respondents".to_string(),
      priority: Priority::Important,
      based_on: format!(
        "Response quality score is {:.0}%, indicating potential confusion or unclear questions",
        quality * 100.0
      ),
      suggested_action: "Review and refine questions to elicit more detailed and relevant responses".to_string(),
      expected_impact: "Higher quality responses and more actionable insights".to_string(),
      confidence: Confidence::High,
    });
  }

  if sentiment.positive > 70 {
    recommendations.push(Recommendation {
      recommendation: "Maintain current practices".to_string(),
      priority: Priority::Maintain,
      based_on: format!("{}% positive sentiment indicates strong engagement", sentiment.positive),
      suggested_action: "Document successful strategies for future reference".to_string(),
      expected_impact: "Sustained high-quality responses and user satisfaction".to_string(),
      confidence: Confidence::High,
    });
  }

  prioritize(recommendations)
}

pub fn prioritize(mut recommendations: Vec<Recommendation>) -> Vec<Recommendation> {
  recommendations.sort_by_key(|r| r.priority);
  recommendations
}

pub fn fallback_summary(form_title: &str, aggregate: &Aggregate) -> String {
  let themes: Vec<&str> = aggregate.top_topics.iter().take(3).map(String::as_str).collect();
  let quote = aggregate
    .representative_quotes
    .first()
    .map(|q| format!(" One respondent noted: \"{}...\"", q.text.chars().take(80).collect::<String>()))
    .unwrap_or_default();
  let label = if aggregate.sentiment.positive > 50 {
    "positive"
  } else if aggregate.sentiment.negative > 50 {
    "negative"
  } else {
    "neutral"
  };
  format!(
    "Analysis of {} responses to \"{}\". Top themes: {}.{} Overall sentiment is {}.",
    aggregate.total_responses_analyzed,
    form_title,
    themes.join(", "),
    quote,
    label
  )
}

/// What the collaborator sees when asked for an insight.
pub fn generation_context(form: &Form, aggregate: &Aggregate) -> Value {
  let closed: Vec<Value> = aggregate
    .closed_question_topics
    .iter()
    .take(2)
    .filter_map(|question| {
      let answer = question.correlations.first()?;
      let topic = answer.topic_distribution.first()?;
      Some(json!({
        "question": question.question_title,
        "answer": answer.answer_value,
        "count": answer.response_count,
        "topTopic": topic.topic,
        "topicPercentage": topic.percentage,
      }))
    })
    .collect();

  json!({
    "formTitle": form.title,
    "responseCount": aggregate.total_responses_analyzed,
    "topTopics": aggregate.top_topics,
    "sentiment": aggregate.sentiment,
    "emotionalTones": aggregate.emotional_tones,
    "topicSentiment": aggregate.topic_sentiment.iter().take(5).collect::<Vec<_>>(),
    "quotes": aggregate.representative_quotes.iter().take(5).map(|q| &q.text).collect::<Vec<_>>(),
    "closedQuestionInsights": closed,
    "dataQuality": aggregate.data_quality,
  })
}

fn unwrap_field(value: Value, fields: &[&str]) -> Value {
  match value {
    Value::Object(mut map) => {
      for field in fields {
        if let Some(inner) = map.remove(*field) {
          return inner;
        }
      }
      Value::Object(map)
    }
    other => other,
  }
}

/// Accepts a bare string or `{"summary": "..."}`; blank text counts as missing.
pub fn parse_summary(value: Value) -> Option<String> {
  match unwrap_field(value, &["summary"]) {
    Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
    _ => None,
  }
}

pub fn parse_findings(value: Value) -> Result<Vec<KeyFinding>, serde_json::Error> {
  serde_json::from_value(unwrap_field(value, &["keyFindings", "findings"]))
}

pub fn parse_recommendations(value: Value) -> Result<Vec<Recommendation>, serde_json::Error> {
  serde_json::from_value(unwrap_field(value, &["recommendations"])).map(prioritize)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::aggregate::{DataQuality, SentimentDistribution, TopicFrequency, ToneShare};

  fn aggregate(positive: u32, negative: u32, topics: usize, quality: f64) -> Aggregate {
    let mut aggregate = Aggregate {
      total_responses_analyzed: 20,
      sentiment: SentimentDistribution {
        positive,
        negative,
        neutral: 100 - positive - negative,
        average_score: 0.0,
      },
      data_quality: DataQuality { overall_score: quality, ..DataQuality::default() },
      ..Aggregate::default()
    };
    for i in 0..topics {
      let topic = format!("topic-{i:02}");
      aggregate.topic_distribution.insert(
        topic.clone(),
        TopicFrequency { count: 12 - i.min(11) as u32, percentage: 60, ..TopicFrequency::default() },
      );
      aggregate.top_topics.push(topic);
    }
    aggregate
  }

  #[test]
  fn recommendations_are_ordered_by_priority() {
    let recommendations = fallback_recommendations(&aggregate(10, 40, 9, 0.4));
    let priorities: Vec<Priority> = recommendations.iter().map(|r| r.priority).collect();
    assert_eq!(priorities, vec![Priority::Urgent, Priority::Important, Priority::Important]);
    assert!(recommendations[1].suggested_action.contains("5-7"));
  }

  #[test]
  fn positive_runs_get_a_maintain_recommendation() {
    let recommendations = fallback_recommendations(&aggregate(80, 5, 2, 0.9));
    assert_eq!(recommendations.len(), 1);
    assert_eq!(recommendations[0].priority, Priority::Maintain);
  }

  #[test]
  fn findings_cover_topic_sentiment_tone_and_quality() {
    let mut aggregate = aggregate(55, 10, 3, 0.75);
    aggregate.emotional_tones = vec![ToneShare { tone: "hopeful".into(), percentage: 35 }];
    let findings = fallback_findings(&aggregate);
    assert_eq!(findings.len(), 4);
    assert!(findings[0].finding.contains("topic-00"));
    assert_eq!(findings[0].confidence, Confidence::High);
    assert!(findings[1].finding.starts_with("Overall sentiment is positive"));
    assert_eq!(findings[2].confidence, Confidence::Medium);
    assert_eq!(findings[3].finding, "Average response quality: 75%");
  }

  #[test]
  fn summary_names_form_and_themes() {
    let summary = fallback_summary("Onboarding survey", &aggregate(20, 60, 4, 0.5));
    assert_eq!(
      summary,
      "Analysis of 20 responses to \"Onboarding survey\". Top themes: topic-00, topic-01, topic-02. Overall sentiment is negative."
    );
  }

  #[test]
  fn generated_payloads_parse_in_either_shape() {
    assert_eq!(parse_summary(json!({"summary": "  Solid results. "})), Some("Solid results.".to_string()));
    assert_eq!(parse_summary(json!("")), None);
    let findings = parse_findings(json!({"keyFindings": [{"finding": "x", "confidence": "low"}]})).unwrap();
    assert_eq!(findings[0].based_on_responses, 0);
    let recommendations = parse_recommendations(json!([
      {"recommendation": "b", "priority": "maintain", "confidence": "low"},
      {"recommendation": "a", "priority": "urgent", "confidence": "high"}
    ]))
    .unwrap();
    assert_eq!(recommendations[0].recommendation, "a");
    assert!(parse_recommendations(json!({"recommendations": "none"})).is_err());
  }
}
