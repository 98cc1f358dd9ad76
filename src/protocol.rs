//! Public protocol structs for WebSocket and HTTP endpoints (serde ready).
//! Keep this small and stable to evolve backend and frontend independently.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::domain::{Lesson, ParsedTurn};
use crate::session::{expected_progression, LessonSession, Progression, SessionState};

/// Messages the client can send over WebSocket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientWsMessage {
    Ping,
    StartLesson {
        #[serde(rename = "lessonId")]
        lesson_id: String,
        #[serde(default)]
        persona: Option<String>,
        #[serde(default)]
        options: Map<String, Value>,
    },
    Reply {
        text: String,
    },
    Speak {
        text: String,
        #[serde(default)]
        options: Map<String, Value>,
    },
    /// The client finished playing a delivered clip.
    Played {
        #[serde(rename = "clipId")]
        clip_id: Uuid,
    },
}

/// Messages the server sends back over WebSocket.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerWsMessage {
    Pong,
    Session {
        #[serde(rename = "sessionId")]
        session_id: Uuid,
        lesson: Lesson,
        persona: String,
    },
    Turn {
        turn: ParsedTurn,
        state: SessionState,
        progression: Progression,
    },
    Completed {
        #[serde(rename = "lessonId")]
        lesson_id: String,
        #[serde(rename = "completedAt")]
        completed_at: Option<String>,
    },
    Audio {
        #[serde(rename = "clipId")]
        clip_id: Uuid,
        url: String,
        mime: String,
        #[serde(rename = "audioBase64")]
        audio_base64: String,
    },
    Error {
        message: String,
    },
}

impl ServerWsMessage {
    pub fn turn(turn: ParsedTurn, state: SessionState) -> Self {
        let progression = expected_progression(&turn);
        ServerWsMessage::Turn { turn, state, progression }
    }
}

//
// HTTP request/response DTOs
//

#[derive(Serialize)]
pub struct HealthOut {
    pub ok: bool,
    pub gateway: &'static str,
    /// Whether completed lessons survive a restart.
    pub persistent: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorOut {
    pub error: String,
    pub details: Option<Value>,
}

/// Lesson plus its completion status, for list rendering.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LessonOut {
    #[serde(flatten)]
    pub lesson: Lesson,
    pub completed: bool,
    pub completed_at: Option<String>,
}

/// Loosely typed: shape errors are reported as a 400 by the handler.
#[derive(Deserialize)]
pub struct ChatIn {
    #[serde(default)]
    pub messages: Option<Value>,
    #[serde(default)]
    pub options: Option<Map<String, Value>>,
}

#[derive(Deserialize)]
pub struct SpeechIn {
    #[serde(default)]
    pub text: Option<Value>,
    #[serde(default)]
    pub options: Option<Map<String, Value>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionIn {
    pub lesson_id: String,
    #[serde(default)]
    pub persona: Option<String>,
    /// Provider options applied to every chat request of the session.
    #[serde(default)]
    pub options: Map<String, Value>,
}

#[derive(Deserialize)]
pub struct ReplyIn {
    pub text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOut {
    pub session_id: Uuid,
    pub lesson_id: String,
    pub persona: String,
    pub state: SessionState,
    pub turn: ParsedTurn,
    pub progression: Progression,
    pub completed_at: Option<String>,
}

impl SessionOut {
    pub fn from_turn(session: &LessonSession, turn: ParsedTurn) -> Self {
        Self {
            session_id: session.id(),
            lesson_id: session.lesson().id.clone(),
            persona: session.persona().to_string(),
            state: session.state(),
            progression: expected_progression(&turn),
            turn,
            completed_at: session.completed_at().map(str::to_string),
        }
    }
}
