//! Turning a raw model reply into a `ParsedTurn`.
//!
//! Two paths, tried in order:
//!   1. Structured: the reply is the JSON object the lesson prompt asks for. It is
//!      deserialized and validated (non-empty `text`, score within 0..=5).
//!   2. Marker-based: a lenient scraper for replies that use inline markers
//!      (`[statement]`, `[question]`, `[EVALUATION]`, `[OPTIONS]`, `[GOAL_COMPLETED]`,
//!      `original:::translation`). It never fails; missing pieces come back empty.
//!
//! `parse_response` is total: every input string yields a turn.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::domain::{ParsedTurn, TurnType};

const GOAL_MARKER: &str = "[GOAL_COMPLETED]";
const EVALUATION_MARKER: &str = "[EVALUATION]";
const STATEMENT_MARKER: &str = "[statement]";
const QUESTION_MARKER: &str = "[question]";
const OPTIONS_MARKER: &str = "[OPTIONS]";
const TRANSLATION_SEPARATOR: &str = ":::";

const MAX_SCORE: u8 = 5;

static SCORE_LABEL: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"(?i)SCORE:\s*([0-9]+)").expect("score label regex"));
static OPTION_SPLIT: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"\n[0-9]+\.\s").expect("option split regex"));

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
  #[error("reply is not JSON")]
  NotJson,
  #[error("reply does not match the turn schema: {0}")]
  Json(#[from] serde_json::Error),
  #[error("turn text is empty")]
  EmptyText,
  #[error("evaluation score {0} is outside 0..=5")]
  ScoreOutOfRange(u8),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelTurn {
  #[serde(rename = "type")]
  kind: TurnType,
  text: String,
  #[serde(default)]
  translation: Option<String>,
  #[serde(default)]
  evaluation: Option<ModelEvaluation>,
  #[serde(default)]
  goal_completed: Option<bool>,
  #[serde(default)]
  options: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct ModelEvaluation {
  #[serde(default)]
  score: u8,
  #[serde(default)]
  feedback: Option<String>,
}

/// Parse a model reply: structured JSON when it validates, markers otherwise.
pub fn parse_response(raw: &str) -> ParsedTurn {
  match parse_structured(raw) {
    Ok(turn) => turn,
    Err(SchemaError::NotJson) => parse_marked(raw),
    Err(e) => {
      debug!(target: "lesson", error = %e, "Structured reply rejected; falling back to marker parser");
      parse_marked(raw)
    }
  }
}

/// Strict path: the reply must be one JSON turn object (optionally inside a code fence).
pub fn parse_structured(raw: &str) -> Result<ParsedTurn, SchemaError> {
  let body = strip_code_fence(raw.trim());
  if !body.starts_with('{') {
    return Err(SchemaError::NotJson);
  }
  let m: ModelTurn = serde_json::from_str(body)?;

  let text = m.text.trim();
  if text.is_empty() {
    return Err(SchemaError::EmptyText);
  }

  // A zero score is the skeleton's placeholder and means "not evaluated".
  let (score, evaluation) = match m.evaluation {
    Some(ev) if ev.score > MAX_SCORE => return Err(SchemaError::ScoreOutOfRange(ev.score)),
    Some(ev) => (ev.score, ev.feedback.unwrap_or_default().trim().to_string()),
    None => (0, String::new()),
  };

  Ok(ParsedTurn {
    kind: m.kind,
    original: text.to_string(),
    translation: m.translation.unwrap_or_default().trim().to_string(),
    options: m
      .options
      .unwrap_or_default()
      .into_iter()
      .map(|o| o.trim().to_string())
      .filter(|o| !o.is_empty())
      .collect(),
    score,
    has_evaluation: !evaluation.is_empty(),
    evaluation,
    is_goal_completed: m.goal_completed.unwrap_or(false),
  })
}

fn strip_code_fence(s: &str) -> &str {
  let Some(rest) = s.strip_prefix("```") else { return s };
  // drop the info string ("json") on the opening fence line
  let rest = match rest.find('\n') {
    Some(nl) => &rest[nl + 1..],
    None => rest,
  };
  rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

/// Lenient marker scraper. Markers are matched literally and case-sensitively.
pub fn parse_marked(raw: &str) -> ParsedTurn {
  let mut turn = ParsedTurn::default();
  let mut text = raw.to_string();

  if text.contains(GOAL_MARKER) {
    turn.is_goal_completed = true;
    text = text.replace(GOAL_MARKER, "");
  }

  if let Some(start) = text.find(EVALUATION_MARKER) {
    let block_start = start + EVALUATION_MARKER.len();
    let end = next_marker(&text, block_start, &[QUESTION_MARKER, STATEMENT_MARKER, OPTIONS_MARKER])
      .unwrap_or(text.len());
    let block = text[block_start..end].trim();

    match SCORE_LABEL.captures(block) {
      Some(caps) => {
        turn.score = caps[1].parse::<u8>().ok().filter(|s| (1..=MAX_SCORE).contains(s)).unwrap_or(0);
        turn.evaluation = SCORE_LABEL.replace(block, "").trim().to_string();
      }
      None => turn.evaluation = block.to_string(),
    }

    text.replace_range(start..end, "");
    text = text.trim().to_string();
  }

  // First type marker wins; a second one closes the content block.
  let type_marker = [(TurnType::Statement, STATEMENT_MARKER), (TurnType::Question, QUESTION_MARKER)]
    .into_iter()
    .filter_map(|(kind, marker)| text.find(marker).map(|pos| (pos, kind, marker)))
    .min_by_key(|(pos, _, _)| *pos);

  match type_marker {
    Some((pos, kind, marker)) => {
      turn.kind = kind;
      let body_start = pos + marker.len();
      let body_end = next_marker(&text, body_start, &[OPTIONS_MARKER, STATEMENT_MARKER, QUESTION_MARKER])
        .unwrap_or(text.len());
      let body = &text[body_start..body_end];
      if body.trim().is_empty() {
        turn.original = text.trim().to_string();
      } else {
        let mut parts = body.split(TRANSLATION_SEPARATOR);
        turn.original = parts.next().unwrap_or_default().trim().to_string();
        turn.translation = parts.next().unwrap_or_default().trim().to_string();
      }
    }
    None => turn.original = text.trim().to_string(),
  }

  if let Some(pos) = text.find(OPTIONS_MARKER) {
    let tail = &text[pos + OPTIONS_MARKER.len()..];
    turn.options = OPTION_SPLIT
      .split(tail)
      .map(str::trim)
      .filter(|o| !o.is_empty())
      .map(String::from)
      .collect();
  }

  turn.has_evaluation = !turn.evaluation.is_empty();
  turn
}

/// Byte offset of the earliest of `markers` at or after `from`.
fn next_marker(text: &str, from: usize, markers: &[&str]) -> Option<usize> {
  let rest = &text[from..];
  markers.iter().filter_map(|m| rest.find(m)).min().map(|i| from + i)
}
