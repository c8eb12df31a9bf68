//! Deterministic form-level statistics over analyzed responses.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::analysis::Depth;
use crate::insights::{KeyFinding, Recommendation};
use crate::models::{Form, Response};

const TOP_TOPICS: usize = 15;
const TOP_TONES: usize = 5;
const TOP_COOCCURRENCES: usize = 20;
const TOP_TOPIC_SENTIMENTS: usize = 15;
const TOP_ANSWER_TOPICS: usize = 10;
const MAX_EMERGING_THEMES: usize = 5;
const MAX_QUOTES: usize = 10;
const MAX_HIGH_QUALITY_QUOTES: usize = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentimentBreakdown {
  pub positive: u32,
  pub neutral: u32,
  pub negative: u32,
}

impl SentimentBreakdown {
  fn count(&mut self, polarity: &str) {
    match polarity {
      "positive" => self.positive += 1,
      "negative" => self.negative += 1,
      _ => self.neutral += 1,
    }
  }

  fn total(&self) -> u32 {
    self.positive + self.neutral + self.negative
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicFrequency {
  pub count: u32,
  pub percentage: u32,
  pub associated_questions: Vec<String>,
  pub sentiment_breakdown: SentimentBreakdown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentimentDistribution {
  pub positive: u32,
  pub neutral: u32,
  pub negative: u32,
  pub average_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToneShare {
  pub tone: String,
  pub percentage: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cooccurrence {
  pub topic1: String,
  pub topic2: String,
  pub frequency: u32,
  pub relationship: String,
  pub unique_responses: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicSentiment {
  pub topic: String,
  pub sentiment: SentimentBreakdown,
  pub average_score: f64,
  pub dominant_sentiment: String,
  pub response_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicShare {
  pub topic: String,
  pub percentage: u32,
  pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerTopics {
  pub answer_value: String,
  pub topic_distribution: Vec<TopicShare>,
  pub response_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosedQuestionTopics {
  pub question_id: String,
  pub question_title: String,
  pub question_type: String,
  pub correlations: Vec<AnswerTopics>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataQuality {
  pub total_responses: u32,
  pub valid_responses: u32,
  pub average_response_length: u32,
  pub completion_rate: f64,
  pub text_quality: String,
  pub overall_score: f64,
}

impl Default for DataQuality {
  fn default() -> Self {
    DataQuality {
      total_responses: 0,
      valid_responses: 0,
      average_response_length: 0,
      completion_rate: 0.0,
      text_quality: "low".to_string(),
      overall_score: 0.5,
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingStrategy {
  pub description: String,
  pub rationale: String,
  pub criteria: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergingTheme {
  pub theme: String,
  pub frequency: u32,
  pub trend: String,
  pub sentiment: SentimentBreakdown,
  pub representative_quotes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticAxis {
  pub left: String,
  pub right: String,
  pub position: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Climate {
  pub positivity_score: u32,
  pub sentiment_breakdown: SentimentBreakdown,
  pub dominant_tendency: String,
  pub semantic_axis: Option<SemanticAxis>,
}

impl Default for Climate {
  fn default() -> Self {
    Climate {
      positivity_score: 0,
      sentiment_breakdown: SentimentBreakdown::default(),
      dominant_tendency: "neutral".to_string(),
      semantic_axis: None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteSample {
  pub text: String,
  pub response_id: Uuid,
  pub submitted_at: DateTime<Utc>,
  pub topics: Vec<String>,
  pub sentiment: String,
  pub emotional_tone: String,
  pub depth: Depth,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Insights {
  pub summary: String,
  pub key_findings: Vec<KeyFinding>,
  pub recommendations: Vec<Recommendation>,
}

/// The analytics document stored on a form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Aggregate {
  pub total_responses_analyzed: u32,
  pub last_updated: Option<DateTime<Utc>>,
  pub topic_distribution: BTreeMap<String, TopicFrequency>,
  pub top_topics: Vec<String>,
  pub canonical_topics: Vec<String>,
  pub sentiment: SentimentDistribution,
  pub emotional_tones: Vec<ToneShare>,
  pub cooccurrence: Vec<Cooccurrence>,
  pub topic_sentiment: Vec<TopicSentiment>,
  pub closed_question_topics: Vec<ClosedQuestionTopics>,
  pub data_quality: DataQuality,
  pub sampling: SamplingStrategy,
  pub emerging_themes: Vec<EmergingTheme>,
  pub climate: Climate,
  pub representative_quotes: Vec<QuoteSample>,
  pub high_quality_quotes: Vec<QuoteSample>,
  pub insights: Insights,
}

fn percent(part: u32, total: u32) -> u32 {
  if total == 0 { 0 } else { (part as f64 / total as f64 * 100.0).round() as u32 }
}

fn round2(value: f64) -> f64 {
  (value * 100.0).round() / 100.0
}

fn polarity(response: &Response) -> Option<&'static str> {
  response.analysis.as_ref()?.sentiment.as_ref().map(|s| s.polarity())
}

fn dominant_label(breakdown: &SentimentBreakdown) -> String {
  let total = breakdown.total().max(1) as f64;
  let positive = breakdown.positive as f64 / total * 100.0;
  let negative = breakdown.negative as f64 / total * 100.0;
  let label = if positive > 60.0 {
    "positive"
  } else if negative > 60.0 {
    "negative"
  } else if positive > 40.0 && negative < 20.0 {
    "mostly positive"
  } else if negative > 40.0 && positive < 20.0 {
    "mostly negative"
  } else {
    "mixed"
  };
  label.to_string()
}

/// Per-topic counts over unique topics per response; percentages are of all
/// responses.
pub fn topic_frequencies(responses: &[Response]) -> BTreeMap<String, TopicFrequency> {
  let mut frequency: BTreeMap<String, TopicFrequency> = BTreeMap::new();
  for response in responses {
    let polarity = polarity(response);
    let questions: Vec<String> = response
      .analysis
      .as_ref()
      .map(|a| a.topics.iter().flat_map(|t| t.source_questions.iter().cloned()).collect())
      .unwrap_or_default();
    for topic in response.topics() {
      let entry = frequency.entry(topic).or_default();
      entry.count += 1;
      if let Some(polarity) = polarity {
        entry.sentiment_breakdown.count(polarity);
      }
      for question in &questions {
        if !entry.associated_questions.contains(question) {
          entry.associated_questions.push(question.clone());
        }
      }
    }
  }
  let total = responses.len() as u32;
  for entry in frequency.values_mut() {
    entry.percentage = percent(entry.count, total);
  }
  frequency
}

/// Most frequent topics, ties broken alphabetically.
pub fn top_topics(frequencies: &BTreeMap<String, TopicFrequency>, limit: usize) -> Vec<String> {
  let mut ranked: Vec<(&String, u32)> = frequencies.iter().map(|(topic, f)| (topic, f.count)).collect();
  ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
  ranked.into_iter().take(limit).map(|(topic, _)| topic.clone()).collect()
}

pub fn sentiment_distribution(responses: &[Response]) -> SentimentDistribution {
  let mut counts = SentimentBreakdown::default();
  let mut scores = Vec::new();
  for response in responses {
    if let Some(sentiment) = response.analysis.as_ref().and_then(|a| a.sentiment.as_ref()) {
      counts.count(sentiment.polarity());
      scores.push(sentiment.score);
    }
  }
  let total = responses.len() as u32;
  SentimentDistribution {
    positive: percent(counts.positive, total),
    neutral: percent(counts.neutral, total),
    negative: percent(counts.negative, total),
    average_score: if scores.is_empty() { 0.0 } else { scores.iter().sum::<f64>() / scores.len() as f64 },
  }
}

pub fn emotional_tones(responses: &[Response]) -> Vec<ToneShare> {
  let tones: Vec<String> = responses
    .iter()
    .filter_map(|r| r.analysis.as_ref()?.sentiment.as_ref()?.emotional_tone.clone())
    .filter(|tone| !tone.trim().is_empty())
    .collect();
  let mut counts: HashMap<&str, u32> = HashMap::new();
  for tone in &tones {
    *counts.entry(tone.as_str()).or_default() += 1;
  }
  let mut ranked: Vec<(&str, u32)> = counts.into_iter().collect();
  ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
  ranked
    .into_iter()
    .take(TOP_TONES)
    .map(|(tone, count)| ToneShare { tone: tone.to_string(), percentage: percent(count, tones.len() as u32) })
    .collect()
}

/// Topic pairs mentioned together in the same response.
pub fn cooccurrence(responses: &[Response]) -> Vec<Cooccurrence> {
  let mut pairs: BTreeMap<(String, String), (u32, HashSet<Uuid>)> = BTreeMap::new();
  for response in responses {
    let topics = response.topics();
    for (i, first) in topics.iter().enumerate() {
      for second in &topics[i + 1..] {
        let key = if first <= second { (first.clone(), second.clone()) } else { (second.clone(), first.clone()) };
        let entry = pairs.entry(key).or_default();
        entry.0 += 1;
        entry.1.insert(response.id);
      }
    }
  }
  let mut result: Vec<Cooccurrence> = pairs
    .into_iter()
    .map(|((topic1, topic2), (frequency, responses))| {
      let relationship = match frequency {
        f if f >= 5 => "strong",
        f if f >= 3 => "moderate",
        _ => "weak",
      };
      Cooccurrence {
        topic1,
        topic2,
        frequency,
        relationship: relationship.to_string(),
        unique_responses: responses.len() as u32,
      }
    })
    .collect();
  result.sort_by(|a, b| b.frequency.cmp(&a.frequency));
  result.truncate(TOP_COOCCURRENCES);
  result
}

pub fn topic_sentiment(responses: &[Response]) -> Vec<TopicSentiment> {
  let mut by_topic: BTreeMap<String, (SentimentBreakdown, Vec<f64>)> = BTreeMap::new();
  for response in responses {
    let Some(sentiment) = response.analysis.as_ref().and_then(|a| a.sentiment.as_ref()) else {
      continue;
    };
    for topic in response.topics() {
      let entry = by_topic.entry(topic).or_default();
      entry.0.count(sentiment.polarity());
      entry.1.push(sentiment.score);
    }
  }
  let mut result: Vec<TopicSentiment> = by_topic
    .into_iter()
    .map(|(topic, (counts, scores))| {
      let total = counts.total();
      let average = if scores.is_empty() { 0.0 } else { scores.iter().sum::<f64>() / scores.len() as f64 };
      TopicSentiment {
        topic,
        sentiment: SentimentBreakdown {
          positive: percent(counts.positive, total),
          neutral: percent(counts.neutral, total),
          negative: percent(counts.negative, total),
        },
        average_score: round2(average),
        dominant_sentiment: dominant_label(&counts),
        response_count: total,
      }
    })
    .collect();
  result.sort_by(|a, b| b.response_count.cmp(&a.response_count));
  result.truncate(TOP_TOPIC_SENTIMENTS);
  result
}

/// Topic mix per closed-question answer. Answers given by fewer than two
/// responses are left out.
pub fn closed_question_topics(form: &Form, responses: &[Response]) -> Vec<ClosedQuestionTopics> {
  form
    .questions
    .iter()
    .filter(|q| q.is_closed())
    .filter_map(|question| {
      let mut groups: BTreeMap<String, Vec<&Response>> = BTreeMap::new();
      for response in responses {
        let Some(answer) = response.answers.iter().find(|a| a.question_id == question.id) else {
          continue;
        };
        for choice in answer.choices() {
          groups.entry(choice).or_default().push(response);
        }
      }

      let mut correlations: Vec<AnswerTopics> = groups
        .into_iter()
        .filter(|(_, group)| group.len() >= 2)
        .map(|(answer_value, group)| {
          let mut counts: BTreeMap<String, u32> = BTreeMap::new();
          for response in &group {
            for topic in response.topics() {
              *counts.entry(topic).or_default() += 1;
            }
          }
          let mentions: u32 = counts.values().sum();
          let mut shares: Vec<TopicShare> = counts
            .into_iter()
            .map(|(topic, count)| TopicShare { topic, percentage: percent(count, mentions), count })
            .collect();
          shares.sort_by(|a, b| b.count.cmp(&a.count));
          shares.truncate(TOP_ANSWER_TOPICS);
          AnswerTopics { answer_value, topic_distribution: shares, response_count: group.len() as u32 }
        })
        .collect();
      correlations.sort_by(|a, b| b.response_count.cmp(&a.response_count));

      (!correlations.is_empty()).then(|| ClosedQuestionTopics {
        question_id: question.id.clone(),
        question_title: question.title.clone(),
        question_type: question.kind.clone(),
        correlations,
      })
    })
    .collect()
}

pub fn data_quality(responses: &[Response]) -> DataQuality {
  let mut completeness = Vec::new();
  let mut total_length = 0usize;
  let mut valid = 0u32;
  for response in responses {
    if let Some(analysis) = &response.analysis {
      completeness.push(analysis.quality.completeness);
    }
    for text in response.answers.iter().filter_map(|a| a.text()) {
      total_length += text.chars().count();
      valid += 1;
    }
  }

  let average_length = if valid > 0 { total_length as f64 / valid as f64 } else { 0.0 };
  let answers_per_response = responses.first().map(|r| r.answers.len()).unwrap_or(1).max(1);
  let completion_rate =
    if responses.is_empty() { 0.0 } else { valid as f64 / (responses.len() * answers_per_response) as f64 };
  let overall = if completeness.is_empty() {
    0.5
  } else {
    completeness.iter().sum::<f64>() / completeness.len() as f64
  };
  let text_quality = if average_length > 200.0 {
    "high"
  } else if average_length < 50.0 {
    "low"
  } else {
    "medium"
  };

  DataQuality {
    total_responses: responses.len() as u32,
    valid_responses: valid,
    average_response_length: average_length.round() as u32,
    completion_rate: round2(completion_rate),
    text_quality: text_quality.to_string(),
    overall_score: round2(overall),
  }
}

pub fn sampling_strategy(response_count: usize) -> SamplingStrategy {
  let (description, rationale, criteria): (&str, &str, &[&str]) = if response_count <= 50 {
    ("Complete sample", "Small dataset allows complete analysis of all responses", &["all"])
  } else if response_count <= 200 {
    (
      "Maximum variation sampling",
      "Medium dataset, select diverse responses representing different perspectives",
      &["maximum_variation", "typical_cases", "extreme_cases"],
    )
  } else {
    (
      "Theoretical sampling with maximum variation",
      "Large dataset, ensure diverse perspectives and saturation of themes",
      &[
        "maximum_variation",
        "deviant_cases",
        "typical_cases",
        "extreme_cases",
        "information_rich",
        "temporal_coverage",
      ],
    )
  };
  SamplingStrategy {
    description: description.to_string(),
    rationale: rationale.to_string(),
    criteria: criteria.iter().map(|c| c.to_string()).collect(),
  }
}

fn topic_quotes(responses: &[Response], topic: &str) -> Vec<String> {
  let mut quotes = Vec::new();
  for response in responses.iter().filter(|r| r.topics().iter().any(|t| t == topic)) {
    let Some(analysis) = &response.analysis else {
      continue;
    };
    for quote in &analysis.quotes {
      let length = quote.quote.chars().count();
      if length > 20 && length < 200 {
        quotes.push(quote.quote.clone());
      }
      if quotes.len() >= 3 {
        return quotes;
      }
    }
  }
  quotes
}

/// Topics growing in the later half of submissions, plus rare ones. Needs at
/// least ten responses in submission order.
pub fn emerging_themes(responses: &[Response], frequencies: &BTreeMap<String, TopicFrequency>) -> Vec<EmergingTheme> {
  if responses.len() < 10 {
    return Vec::new();
  }
  let (older, recent) = responses.split_at(responses.len() / 2);
  let older_counts = topic_frequencies(older);
  let recent_counts = topic_frequencies(recent);

  let mut themes = Vec::new();
  for (topic, frequency) in frequencies {
    let old = older_counts.get(topic).map_or(0, |f| f.count);
    let new = recent_counts.get(topic).map_or(0, |f| f.count);
    if new as f64 > old as f64 * 1.5 && new >= 3 {
      let mut quotes = topic_quotes(recent, topic);
      quotes.truncate(2);
      themes.push(EmergingTheme {
        theme: topic.clone(),
        frequency: frequency.count,
        trend: "growing".to_string(),
        sentiment: frequency.sentiment_breakdown,
        representative_quotes: quotes,
      });
    }
    if (2..5).contains(&frequency.percentage) {
      let mut quotes = topic_quotes(responses, topic);
      if !quotes.is_empty() {
        quotes.truncate(2);
        themes.push(EmergingTheme {
          theme: topic.clone(),
          frequency: frequency.count,
          trend: "rare".to_string(),
          sentiment: frequency.sentiment_breakdown,
          representative_quotes: quotes,
        });
      }
    }
  }
  themes.sort_by(|a, b| b.frequency.cmp(&a.frequency));
  themes.truncate(MAX_EMERGING_THEMES);
  themes
}

pub fn climate(top_topics: &[String], sentiment: &SentimentDistribution, tones: &[ToneShare]) -> Climate {
  let positivity = (sentiment.positive as f64 + sentiment.neutral as f64 * 0.5).round() as u32;
  let tendency = (sentiment.positive as f64 - sentiment.negative as f64) / 100.0;
  let dominant = if tendency > 0.2 {
    "positive"
  } else if tendency < -0.2 {
    "negative"
  } else {
    "neutral"
  };
  let position = (tendency + 1.0) / 2.0;
  let semantic_axis = if tones.len() >= 2 {
    Some(SemanticAxis { left: tones[0].tone.clone(), right: tones[1].tone.clone(), position })
  } else if top_topics.len() >= 2 {
    Some(SemanticAxis { left: top_topics[0].clone(), right: top_topics[1].clone(), position })
  } else {
    None
  };
  Climate {
    positivity_score: positivity,
    sentiment_breakdown: SentimentBreakdown {
      positive: sentiment.positive,
      neutral: sentiment.neutral,
      negative: sentiment.negative,
    },
    dominant_tendency: dominant.to_string(),
    semantic_axis,
  }
}

pub fn collect_quotes(responses: &[Response]) -> Vec<QuoteSample> {
  responses
    .iter()
    .filter_map(|response| response.analysis.as_ref().map(|analysis| (response, analysis)))
    .flat_map(|(response, analysis)| {
      let sentiment = analysis.sentiment.as_ref();
      analysis.quotes.iter().map(move |quote| QuoteSample {
        text: quote.quote.clone(),
        response_id: response.id,
        submitted_at: response.submitted_at,
        topics: quote.related_topics.clone(),
        sentiment: sentiment.map_or("neutral", |s| s.polarity()).to_string(),
        emotional_tone: sentiment.and_then(|s| s.emotional_tone.clone()).unwrap_or_else(|| "neutral".to_string()),
        depth: analysis.quality.depth,
      })
    })
    .collect()
}

/// Builds the aggregate over processed responses in submission order.
/// Insights are left empty for the generation stage.
pub fn compute(form: &Form, responses: &[Response]) -> Aggregate {
  if responses.is_empty() {
    return Aggregate { sampling: sampling_strategy(0), ..Aggregate::default() };
  }

  let frequencies = topic_frequencies(responses);
  let top = top_topics(&frequencies, TOP_TOPICS);
  let sentiment = sentiment_distribution(responses);
  let tones = emotional_tones(responses);
  let mut canonical: Vec<String> = responses.iter().flat_map(|r| r.canonical_topics.iter().cloned()).collect();
  canonical.sort();
  canonical.dedup();

  let mut representative = collect_quotes(responses);
  representative.truncate(MAX_QUOTES);
  let high_quality: Vec<QuoteSample> = representative
    .iter()
    .filter(|q| q.depth == Depth::Deep)
    .take(MAX_HIGH_QUALITY_QUOTES)
    .cloned()
    .collect();

  Aggregate {
    total_responses_analyzed: responses.len() as u32,
    last_updated: None,
    emerging_themes: emerging_themes(responses, &frequencies),
    climate: climate(&top, &sentiment, &tones),
    topic_distribution: frequencies,
    top_topics: top,
    canonical_topics: canonical,
    sentiment,
    emotional_tones: tones,
    cooccurrence: cooccurrence(responses),
    topic_sentiment: topic_sentiment(responses),
    closed_question_topics: closed_question_topics(form, responses),
    data_quality: data_quality(responses),
    sampling: sampling_strategy(responses.len()),
    representative_quotes: representative,
    high_quality_quotes: high_quality,
    insights: Insights::default(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::analysis::{ItemAnalysis, KeyQuote, OverallSentiment, Representativeness, ResponseQuality, TopicTag};
  use crate::models::{Answer, Question};
  use chrono::Duration;
  use serde_json::json;

  fn analyzed(topics: &[&str], label: &str, tone: &str) -> Response {
    let mut response = Response::new(Uuid::new_v4(), vec![Answer { question_id: "q1".into(), value: json!("text") }]);
    response.processed = true;
    response.analysis = Some(ItemAnalysis {
      topics: topics
        .iter()
        .map(|t| TopicTag { topic: t.to_string(), is_primary: false, confidence: None, source_questions: vec![] })
        .collect(),
      sentiment: Some(OverallSentiment {
        label: label.into(),
        score: if label == "positive" { 0.8 } else { -0.4 },
        emotional_tone: Some(tone.into()),
        confidence: None,
      }),
      quotes: vec![KeyQuote {
        quote: format!("A sufficiently long quote about {}", topics.join(" and ")),
        question_id: Some("q1".into()),
        related_topics: topics.iter().map(|t| t.to_string()).collect(),
      }],
      representativeness: Representativeness::Typical,
      quality: ResponseQuality::default(),
    });
    response
  }

  #[test]
  fn percentages_round_per_topic() {
    let responses = vec![analyzed(&["A"], "positive", "happy"), analyzed(&["B"], "neutral", "calm"), analyzed(&["C"], "negative", "angry")];
    let frequencies = topic_frequencies(&responses);
    assert!(frequencies.values().all(|f| f.count == 1 && f.percentage == 33));
    let sentiment = sentiment_distribution(&responses);
    assert_eq!((sentiment.positive, sentiment.neutral, sentiment.negative), (33, 33, 33));
  }

  #[test]
  fn duplicate_topics_count_once_per_response() {
    let mut response = analyzed(&["Pricing", "Pricing"], "positive", "happy");
    response.canonical_topics = vec!["Pricing".into(), "Pricing".into()];
    let frequencies = topic_frequencies(&[response]);
    assert_eq!(frequencies["Pricing"].count, 1);
    assert_eq!(frequencies["Pricing"].percentage, 100);
  }

  #[test]
  fn cooccurrence_uses_sorted_pairs() {
    let responses = vec![
      analyzed(&["Support", "Pricing"], "negative", "annoyed"),
      analyzed(&["Pricing", "Support"], "negative", "annoyed"),
      analyzed(&["Pricing", "Support", "Speed"], "positive", "happy"),
    ];
    let pairs = cooccurrence(&responses);
    assert_eq!(pairs[0].topic1, "Pricing");
    assert_eq!(pairs[0].topic2, "Support");
    assert_eq!(pairs[0].frequency, 3);
    assert_eq!(pairs[0].relationship, "moderate");
    assert_eq!(pairs[0].unique_responses, 3);
  }

  #[test]
  fn topic_sentiment_labels_dominance() {
    let responses = vec![
      analyzed(&["Billing"], "negative", "angry"),
      analyzed(&["Billing"], "negative", "angry"),
      analyzed(&["Billing"], "negative", "angry"),
      analyzed(&["Billing"], "positive", "happy"),
    ];
    let correlations = topic_sentiment(&responses);
    assert_eq!(correlations[0].dominant_sentiment, "negative");
    assert_eq!(correlations[0].sentiment.negative, 75);
    assert_eq!(correlations[0].response_count, 4);
  }

  #[test]
  fn closed_answers_need_two_responses() {
    let mut form = Form { id: Uuid::new_v4(), title: "Survey".into(), questions: vec![], analytics: None, analytics_updated_at: None };
    form.questions.push(Question { id: "plan".into(), title: "Plan".into(), kind: "radio".into(), options: vec![] });
    let mut responses = vec![
      analyzed(&["Pricing"], "negative", "annoyed"),
      analyzed(&["Pricing", "Support"], "negative", "annoyed"),
      analyzed(&["Speed"], "positive", "happy"),
    ];
    for (response, plan) in responses.iter_mut().zip(["pro", "pro", "free"]) {
      response.answers.push(Answer { question_id: "plan".into(), value: json!(plan) });
    }
    let closed = closed_question_topics(&form, &responses);
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].correlations.len(), 1);
    let pro = &closed[0].correlations[0];
    assert_eq!(pro.answer_value, "pro");
    assert_eq!(pro.topic_distribution[0].topic, "Pricing");
    assert_eq!(pro.topic_distribution[0].percentage, 67);
  }

  #[test]
  fn growing_topics_are_flagged() {
    let start = Utc::now() - Duration::hours(10);
    let mut responses: Vec<Response> = (0..6).map(|_| analyzed(&["Pricing"], "neutral", "calm")).collect();
    responses.extend((0..6).map(|_| analyzed(&["Onboarding"], "negative", "confused")));
    for (i, response) in responses.iter_mut().enumerate() {
      response.submitted_at = start + Duration::minutes(i as i64);
    }
    let frequencies = topic_frequencies(&responses);
    let themes = emerging_themes(&responses, &frequencies);
    assert_eq!(themes.len(), 1);
    assert_eq!(themes[0].theme, "Onboarding");
    assert_eq!(themes[0].trend, "growing");
    assert_eq!(themes[0].representative_quotes.len(), 2);
  }

  #[test]
  fn climate_from_distribution() {
    let sentiment = SentimentDistribution { positive: 60, neutral: 20, negative: 20, average_score: 0.3 };
    let tones = vec![
      ToneShare { tone: "hopeful".into(), percentage: 50 },
      ToneShare { tone: "frustrated".into(), percentage: 30 },
    ];
    let climate = climate(&[], &sentiment, &tones);
    assert_eq!(climate.positivity_score, 70);
    assert_eq!(climate.dominant_tendency, "positive");
    let axis = climate.semantic_axis.unwrap();
    assert_eq!(axis.left, "hopeful");
    assert!((axis.position - 0.7).abs() < 1e-9);
  }

  #[test]
  fn empty_input_gives_a_defined_aggregate() {
    let form = Form { id: Uuid::new_v4(), title: "Survey".into(), questions: vec![], analytics: None, analytics_updated_at: None };
    let aggregate = compute(&form, &[]);
    assert_eq!(aggregate.total_responses_analyzed, 0);
    assert!(aggregate.topic_distribution.is_empty());
    assert_eq!(aggregate.sampling.criteria, vec!["all".to_string()]);
    let json = serde_json::to_value(&aggregate).unwrap();
    assert!(json["insights"].is_object());
  }

  #[test]
  fn compute_is_deterministic() {
    let form = Form { id: Uuid::new_v4(), title: "Survey".into(), questions: vec![], analytics: None, analytics_updated_at: None };
    let responses = vec![
      analyzed(&["Pricing", "Support"], "negative", "annoyed"),
      analyzed(&["Speed"], "positive", "happy"),
    ];
    assert_eq!(compute(&form, &responses), compute(&form, &responses));
    assert_eq!(compute(&form, &responses).total_responses_analyzed, 2);
  }
}
