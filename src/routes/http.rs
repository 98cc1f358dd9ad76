//! HTTP endpoint handlers. These are thin wrappers that forward to the catalog,
//! the completion store, the gateway and the session loop.
//! Each handler is instrumented and logs parameters and basic result info.

use std::sync::Arc;

use axum::{
  extract::{Path, State},
  http::{header, StatusCode},
  response::{IntoResponse, Response},
  Json,
};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::gateway::{ChatMessage, GatewayError};
use crate::protocol::*;
use crate::session::{SessionError, SessionState};
use crate::state::AppState;

/// Error response: status plus `{error, details}` body.
#[derive(Debug)]
pub struct ApiError {
  status: StatusCode,
  body: ErrorOut,
}

impl ApiError {
  pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
    Self { status, body: ErrorOut { error: error.into(), details: None } }
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    (self.status, Json(self.body)).into_response()
  }
}

impl From<GatewayError> for ApiError {
  fn from(e: GatewayError) -> Self {
    let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let error = match &e {
      GatewayError::Http { message, .. } if !message.is_empty() => message.clone(),
      other => other.to_string(),
    };
    Self { status, body: ErrorOut { error, details: e.details() } }
  }
}

impl From<SessionError> for ApiError {
  fn from(e: SessionError) -> Self {
    match e {
      SessionError::InvalidState { .. } => ApiError::new(StatusCode::CONFLICT, e.to_string()),
      SessionError::EmptyReply => ApiError::new(StatusCode::BAD_REQUEST, e.to_string()),
      SessionError::Gateway(g) => g.into(),
    }
  }
}

#[instrument(level = "info", skip(state))]
pub async fn http_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
  Json(HealthOut { ok: true, gateway: state.gateway.name(), persistent: state.store.is_durable() })
}

#[instrument(level = "info", skip(state))]
pub async fn http_list_lessons(State(state): State<Arc<AppState>>) -> impl IntoResponse {
  let completed = state.store.get_completed_lessons();
  let out: Vec<LessonOut> = state
    .catalog
    .lessons()
    .iter()
    .map(|l| {
      let completed_at = completed.get(&l.id).filter(|ts| !ts.is_empty()).cloned();
      LessonOut { lesson: l.clone(), completed: completed_at.is_some(), completed_at }
    })
    .collect();
  Json(out)
}

#[instrument(level = "info", skip(state), fields(%id))]
pub async fn http_get_lesson(
  State(state): State<Arc<AppState>>,
  Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
  let lesson = state
    .catalog
    .get_lesson_by_id(&id)
    .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "Lesson not found"))?;
  Ok(Json(lesson.clone()))
}

/// Chat proxy: `{messages, options}` -> `{message, usage}`.
#[instrument(level = "info", skip(state, body))]
pub async fn http_post_chat(
  State(state): State<Arc<AppState>>,
  Json(body): Json<ChatIn>,
) -> Result<impl IntoResponse, ApiError> {
  let invalid = || ApiError::new(StatusCode::BAD_REQUEST, "Invalid messages provided");
  let messages = match body.messages {
    Some(v @ serde_json::Value::Array(_)) => {
      serde_json::from_value::<Vec<ChatMessage>>(v).map_err(|_| invalid())?
    }
    _ => return Err(invalid()),
  };
  let options = body.options.unwrap_or_default();

  let reply = state.gateway.generate_chat_response(&messages, &options).await?;
  info!(target: "gateway", messages = messages.len(), reply_len = reply.message.content.len(), "Chat proxied");
  Ok(Json(reply))
}

/// Speech proxy: `{text, options}` -> audio/mpeg bytes.
#[instrument(level = "info", skip(state, body))]
pub async fn http_post_speech(
  State(state): State<Arc<AppState>>,
  Json(body): Json<SpeechIn>,
) -> Result<Response, ApiError> {
  let text = match body.text {
    Some(serde_json::Value::String(t)) if !t.is_empty() => t,
    _ => return Err(ApiError::new(StatusCode::BAD_REQUEST, "Text is required")),
  };
  let options = body.options.unwrap_or_default();

  let audio = state.gateway.generate_speech(&text, &options).await?;
  Ok((
    [
      (header::CONTENT_TYPE, "audio/mpeg".to_string()),
      (header::CONTENT_LENGTH, audio.len().to_string()),
    ],
    audio,
  )
    .into_response())
}

#[instrument(level = "info", skip(state, body), fields(lesson_id = %body.lesson_id))]
pub async fn http_post_session(
  State(state): State<Arc<AppState>>,
  Json(body): Json<StartSessionIn>,
) -> Result<impl IntoResponse, ApiError> {
  let mut session = state
    .new_session(&body.lesson_id, body.persona)
    .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "Lesson not found"))?
    .with_options(body.options);

  let turn = session.start(state.gateway.as_ref(), &state.store).await?;
  let out = SessionOut::from_turn(&session, turn);
  state.insert_session(session).await;
  info!(target: "lesson", session = %out.session_id, lesson = %out.lesson_id, persona = %out.persona, "HTTP session started");
  Ok((StatusCode::CREATED, Json(out)))
}

#[instrument(level = "info", skip(state, body), fields(%id, text_len = body.text.len()))]
pub async fn http_post_reply(
  State(state): State<Arc<AppState>>,
  Path(id): Path<Uuid>,
  Json(body): Json<ReplyIn>,
) -> Result<impl IntoResponse, ApiError> {
  let shared = state
    .get_session(&id)
    .await
    .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "Session not found"))?;
  let mut session = shared.lock().await;

  let turn = session.submit_reply(&body.text, state.gateway.as_ref(), &state.store).await?;
  let out = SessionOut::from_turn(&session, turn);
  drop(session);

  // a completed session accepts no more replies
  if out.state == SessionState::Completed {
    state.remove_session(&id).await;
    info!(target: "lesson", session = %id, lesson = %out.lesson_id, "Completed session closed");
  }
  Ok(Json(out))
}

#[instrument(level = "info", skip(state), fields(%id))]
pub async fn http_delete_session(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> StatusCode {
  if state.remove_session(&id).await {
    StatusCode::NO_CONTENT
  } else {
    warn!(target: "lesson", %id, "Delete for unknown session");
    StatusCode::NOT_FOUND
  }
}

#[instrument(level = "debug", skip(state), fields(%id))]
pub async fn http_get_audio(
  State(state): State<Arc<AppState>>,
  Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
  let clip = state
    .clips
    .get(&id)
    .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "Audio clip not found"))?;
  Ok(([(header::CONTENT_TYPE, clip.mime)], clip.bytes.clone()).into_response())
}
