//! Lesson session loop.
//!
//! One session per learner conversation. The system prompt is built once; every model
//! call sends it followed by the full history. Progression (advance vs. repeat) is the
//! model's decision: the session only surfaces the score and feedback it reports.
//!
//! States: awaiting_model_turn -> awaiting_user_reply -> ... -> completed.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::domain::{ConversationMessage, Lesson, ParsedTurn, Role};
use crate::gateway::{ChatMessage, GatewayError, ModelGateway, RequestOptions};
use crate::parser::parse_response;
use crate::prompt::create_lesson_prompt_with;
use crate::store::CompletionStore;
use crate::util::trunc_for_log;

/// Score at or above which the tutor is expected to move the scenario forward.
pub const ADVANCE_THRESHOLD: u8 = 3;

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
  AwaitingModelTurn,
  AwaitingUserReply,
  Completed,
}

/// What the tutor is expected to do next, given the score it just reported.
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Progression {
  Advance,
  Repeat,
  None,
}

pub fn expected_progression(turn: &ParsedTurn) -> Progression {
  match turn.score {
    0 => Progression::None,
    s if s >= ADVANCE_THRESHOLD => Progression::Advance,
    _ => Progression::Repeat,
  }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
  #[error("session is {current:?}, expected {expected:?}")]
  InvalidState { current: SessionState, expected: SessionState },
  #[error("reply text is empty")]
  EmptyReply,
  #[error(transparent)]
  Gateway(#[from] GatewayError),
}

pub struct LessonSession {
  id: Uuid,
  lesson: Lesson,
  persona: String,
  system_prompt: String,
  history: Vec<ConversationMessage>,
  state: SessionState,
  options: RequestOptions,
  completed_at: Option<String>,
  last_active: Instant,
}

impl LessonSession {
  pub fn new(lesson: Lesson, persona: impl Into<String>, template: &str) -> Self {
    let persona = persona.into();
    let system_prompt = create_lesson_prompt_with(template, &lesson, &persona);
    Self {
      id: Uuid::new_v4(),
      lesson,
      persona,
      system_prompt,
      history: Vec::new(),
      state: SessionState::AwaitingModelTurn,
      options: RequestOptions::new(),
      completed_at: None,
      last_active: Instant::now(),
    }
  }

  /// Provider options sent with every chat request of this session.
  pub fn with_options(mut self, options: RequestOptions) -> Self {
    self.options = options;
    self
  }

  pub fn id(&self) -> Uuid { self.id }
  pub fn lesson(&self) -> &Lesson { &self.lesson }
  pub fn persona(&self) -> &str { &self.persona }
  pub fn state(&self) -> SessionState { self.state }
  pub fn history(&self) -> &[ConversationMessage] { &self.history }
  pub fn system_prompt(&self) -> &str { &self.system_prompt }
  pub fn completed_at(&self) -> Option<&str> { self.completed_at.as_deref() }
  /// Time since the last learner reply or model turn.
  pub fn idle_for(&self) -> Duration { self.last_active.elapsed() }

  fn model_messages(&self) -> Vec<ChatMessage> {
    std::iter::once(ChatMessage::new(Role::System, self.system_prompt.clone()))
      .chain(self.history.iter().map(|m| ChatMessage::new(m.role, m.content.clone())))
      .collect()
  }

  fn expect_state(&self, expected: SessionState) -> Result<(), SessionError> {
    if self.state == expected {
      Ok(())
    } else {
      Err(SessionError::InvalidState { current: self.state, expected })
    }
  }

  /// Ask the model for the opening turn.
  #[instrument(level = "info", skip(self, gateway, store), fields(session = %self.id, lesson = %self.lesson.id))]
  pub async fn start(
    &mut self,
    gateway: &dyn ModelGateway,
    store: &CompletionStore,
  ) -> Result<ParsedTurn, SessionError> {
    self.expect_state(SessionState::AwaitingModelTurn)?;
    let reply = gateway.generate_chat_response(&self.model_messages(), &self.options).await?;
    self.receive_model_turn(&reply.message.content, store)
  }

  /// Parse and record a model reply, then move to the next state.
  pub fn receive_model_turn(&mut self, raw: &str, store: &CompletionStore) -> Result<ParsedTurn, SessionError> {
    self.expect_state(SessionState::AwaitingModelTurn)?;
    self.last_active = Instant::now();

    let is_opening = !self.history.iter().any(|m| m.role == Role::Assistant);
    let mut turn = parse_response(raw);
    if is_opening {
      turn = turn.into_opening();
    } else if turn.score == 0 && !turn.has_evaluation {
      warn!(target: "lesson", session = %self.id, raw = %trunc_for_log(raw, 160), "Model turn carries no evaluation");
    }

    self.history.push(ConversationMessage::assistant(raw, turn.clone()));

    if turn.is_goal_completed {
      self.state = SessionState::Completed;
      self.completed_at = store.save_completed_lesson(&self.lesson.id);
      info!(target: "lesson", session = %self.id, lesson = %self.lesson.id, completed_at = ?self.completed_at, "Lesson goal completed");
    } else {
      self.state = SessionState::AwaitingUserReply;
    }
    Ok(turn)
  }

  /// Send the learner's reply and receive the tutor's next turn.
  ///
  /// On gateway failure the reply is dropped from history and the session goes back to
  /// waiting for the learner, so the same reply can be sent again.
  #[instrument(level = "info", skip(self, text, gateway, store), fields(session = %self.id, text_len = text.len()))]
  pub async fn submit_reply(
    &mut self,
    text: &str,
    gateway: &dyn ModelGateway,
    store: &CompletionStore,
  ) -> Result<ParsedTurn, SessionError> {
    self.expect_state(SessionState::AwaitingUserReply)?;
    let text = text.trim();
    if text.is_empty() {
      return Err(SessionError::EmptyReply);
    }

    self.history.push(ConversationMessage::user(text));
    self.state = SessionState::AwaitingModelTurn;
    self.last_active = Instant::now();

    match gateway.generate_chat_response(&self.model_messages(), &self.options).await {
      Ok(reply) => {
        let turn = self.receive_model_turn(&reply.message.content, store)?;
        info!(target: "lesson", session = %self.id, score = turn.score, progression = ?expected_progression(&turn), "Turn evaluated");
        Ok(turn)
      }
      Err(e) => {
        self.history.pop();
        self.state = SessionState::AwaitingUserReply;
        Err(e.into())
      }
    }
  }
}
