//! Domain models used by the backend: lessons, difficulty tiers, conversation messages
//! and the structured turn extracted from a model reply.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How hard a lesson is. The tier is also handed to the model inside the prompt.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
  /// Two or three words per message.
  #[serde(alias = "superbeginnersokeepitto2or3words")]
  VeryEasy,
  Beginner,
  Intermediate,
  Advanced,
}

impl Difficulty {
  /// Wording used when the tier is embedded in the system prompt.
  pub fn prompt_label(self) -> &'static str {
    match self {
      Difficulty::VeryEasy => "super beginner (keep every message to 2 or 3 words)",
      Difficulty::Beginner => "beginner",
      Difficulty::Intermediate => "intermediate",
      Difficulty::Advanced => "advanced",
    }
  }
}

/// A fixed scenario definition driving one tutoring session.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Lesson {
  pub id: String,
  pub title: String,
  #[serde(default)] pub description: String,
  pub difficulty: Difficulty,
  pub language: String,
  #[serde(default)] pub estimated_minutes: u32,
  pub scenario: String,
  pub goal: String,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  System,
  User,
  Assistant,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TurnType {
  #[default]
  Statement,
  Question,
}

/// Structured fields extracted from one model reply.
///
/// `score` is 0 when the reply carried no evaluation, otherwise 1..=5.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParsedTurn {
  #[serde(rename = "type")]
  pub kind: TurnType,
  pub original: String,
  pub translation: String,
  pub options: Vec<String>,
  pub score: u8,
  pub evaluation: String,
  pub has_evaluation: bool,
  pub is_goal_completed: bool,
}

impl ParsedTurn {
  /// Drop the evaluation and force a statement. Applied to the opening turn.
  pub fn into_opening(mut self) -> Self {
    self.kind = TurnType::Statement;
    self.score = 0;
    self.evaluation.clear();
    self.has_evaluation = false;
    self
  }
}

/// One entry in a session's ordered, append-only history.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
  pub id: Uuid,
  pub role: Role,
  pub content: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub turn: Option<ParsedTurn>,
}

impl ConversationMessage {
  pub fn user(content: impl Into<String>) -> Self {
    Self { id: Uuid::new_v4(), role: Role::User, content: content.into(), turn: None }
  }

  pub fn assistant(content: impl Into<String>, turn: ParsedTurn) -> Self {
    Self { id: Uuid::new_v4(), role: Role::Assistant, content: content.into(), turn: Some(turn) }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn legacy_very_easy_token_is_accepted() {
    let d: Difficulty = serde_json::from_str("\"superbeginnersokeepitto2or3words\"").unwrap();
    assert_eq!(d, Difficulty::VeryEasy);
    assert_eq!(serde_json::to_string(&d).unwrap(), "\"very_easy\"");
  }

  #[test]
  fn parsed_turn_serializes_with_wire_names() {
    let turn = ParsedTurn { kind: TurnType::Question, score: 4, ..Default::default() };
    let v = serde_json::to_value(&turn).unwrap();
    assert_eq!(v["type"], "question");
    assert_eq!(v["hasEvaluation"], false);
    assert_eq!(v["isGoalCompleted"], false);
  }

  #[test]
  fn opening_turn_drops_evaluation() {
    let turn = ParsedTurn {
      kind: TurnType::Question,
      score: 2,
      evaluation: "Not quite".into(),
      has_evaluation: true,
      ..Default::default()
    }
    .into_opening();
    assert_eq!(turn.kind, TurnType::Statement);
    assert_eq!(turn.score, 0);
    assert!(!turn.has_evaluation);
  }
}
