//! WebSocket upgrade + message loop. One lesson session per socket.
//!
//! Client messages are parsed as JSON and dispatched; turn results go straight back on
//! the socket. Speech runs in background tasks that push audio through a channel, so a
//! slow TTS call never blocks the conversation.
//!
//! A delivered clip stays fetchable at its `url` until the client sends `played`, the
//! clip TTL runs out, or the socket closes (which aborts pending playback).

use std::{
  collections::HashMap,
  sync::{Arc, Mutex, MutexGuard},
  time::Duration,
};
use async_trait::async_trait;
use axum::{
  extract::{
    ws::{Message, WebSocket},
    State, WebSocketUpgrade,
  },
  response::IntoResponse,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use tokio::{
  sync::{mpsc, oneshot},
  task::JoinSet,
};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::audio::{play_audio, AudioClip, AudioError, AudioPlayer};
use crate::domain::ParsedTurn;
use crate::gateway::RequestOptions;
use crate::protocol::{ClientWsMessage, ServerWsMessage};
use crate::session::{LessonSession, SessionState};
use crate::state::AppState;

/// How long a delivered clip waits for the client's `played` before it is released.
pub const CLIP_TTL: Duration = Duration::from_secs(120);

#[instrument(level = "info", skip(state))]
pub async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
  info!(target: "habla_backend", "WebSocket upgrade requested");
  ws.on_upgrade(move |socket| handle_ws(socket, state))
}

/// Clips delivered on one socket that the client has not reported as played.
#[derive(Clone)]
struct PendingPlayback {
  waiting: Arc<Mutex<HashMap<Uuid, oneshot::Sender<()>>>>,
  ttl: Duration,
}

impl PendingPlayback {
  fn new(ttl: Duration) -> Self {
    Self { waiting: Arc::default(), ttl }
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, oneshot::Sender<()>>> {
    self.waiting.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  fn register(&self, clip_id: Uuid) -> oneshot::Receiver<()> {
    let (done_tx, done_rx) = oneshot::channel();
    self.lock().insert(clip_id, done_tx);
    done_rx
  }

  /// Mark a clip as played. False when the clip is unknown or already released.
  fn finish(&self, clip_id: &Uuid) -> bool {
    match self.lock().remove(clip_id) {
      Some(done_tx) => {
        let _ = done_tx.send(());
        true
      }
      None => false,
    }
  }

  fn forget(&self, clip_id: &Uuid) {
    self.lock().remove(clip_id);
  }
}

/// Delivers a clip to the client as base64 over the socket's outgoing channel, then
/// holds it until the client reports it played or the TTL expires.
struct ChannelPlayer {
  tx: mpsc::UnboundedSender<ServerWsMessage>,
  pending: PendingPlayback,
}

#[async_trait]
impl AudioPlayer for ChannelPlayer {
  async fn play(&self, clip: &AudioClip) -> Result<(), AudioError> {
    let played = self.pending.register(clip.id);
    let msg = ServerWsMessage::Audio {
      clip_id: clip.id,
      url: clip.url(),
      mime: clip.mime.to_string(),
      audio_base64: STANDARD.encode(&clip.bytes),
    };
    if self.tx.send(msg).is_err() {
      self.pending.forget(&clip.id);
      return Err(AudioError::Delivery("socket closed".into()));
    }

    match tokio::time::timeout(self.pending.ttl, played).await {
      Ok(_) => debug!(target: "habla_backend", clip_id = %clip.id, "Client finished playback"),
      Err(_) => {
        self.pending.forget(&clip.id);
        debug!(target: "habla_backend", clip_id = %clip.id, "Clip TTL expired before playback was reported");
      }
    }
    Ok(())
  }
}

/// Everything one socket owns.
struct SocketState {
  session: Option<LessonSession>,
  playback: JoinSet<()>,
  pending: PendingPlayback,
  tx: mpsc::UnboundedSender<ServerWsMessage>,
}

impl SocketState {
  fn new(tx: mpsc::UnboundedSender<ServerWsMessage>, clip_ttl: Duration) -> Self {
    Self { session: None, playback: JoinSet::new(), pending: PendingPlayback::new(clip_ttl), tx }
  }

  fn player(&self) -> ChannelPlayer {
    ChannelPlayer { tx: self.tx.clone(), pending: self.pending.clone() }
  }
}

async fn send(socket: &mut WebSocket, msg: &ServerWsMessage) -> bool {
  let out = serde_json::to_string(msg).unwrap_or_else(|e| {
    serde_json::json!({ "type": "error", "message": format!("Serialization error: {}", e) }).to_string()
  });
  match socket.send(Message::Text(out)).await {
    Ok(()) => true,
    Err(e) => {
      error!(target: "habla_backend", error = %e, "WS send error");
      false
    }
  }
}

#[instrument(level = "info", skip(socket, state))]
async fn handle_ws(mut socket: WebSocket, state: Arc<AppState>) {
  info!(target: "habla_backend", "WebSocket connected");
  let (tx, mut rx) = mpsc::unbounded_channel::<ServerWsMessage>();
  let mut conn = SocketState::new(tx, CLIP_TTL);

  loop {
    tokio::select! {
      incoming = socket.recv() => {
        let msg = match incoming {
          Some(Ok(msg)) => msg,
          _ => break,
        };
        match msg {
          Message::Text(txt) => {
            let replies = match serde_json::from_str::<ClientWsMessage>(&txt) {
              Ok(incoming) => {
                debug!(target: "habla_backend", "WS received: {:?}", &incoming);
                handle_client_ws(incoming, &state, &mut conn).await
              }
              Err(e) => vec![ServerWsMessage::Error { message: format!("Invalid JSON: {}", e) }],
            };
            let mut open = true;
            for reply in &replies {
              if !send(&mut socket, reply).await {
                open = false;
                break;
              }
            }
            if !open {
              break;
            }
          }
          Message::Ping(payload) => { let _ = socket.send(Message::Pong(payload)).await; }
          Message::Close(_) => break,
          _ => {}
        }
      }
      Some(out) = rx.recv() => {
        if !send(&mut socket, &out).await {
          break;
        }
      }
      Some(done) = conn.playback.join_next(), if !conn.playback.is_empty() => {
        if let Err(e) = done {
          if !e.is_cancelled() {
            warn!(target: "habla_backend", error = %e, "Playback task failed");
          }
        }
      }
    }
  }

  // dropping the aborted tasks releases their clip leases
  conn.playback.abort_all();
  while conn.playback.join_next().await.is_some() {}
  if let Some(s) = &conn.session {
    info!(target: "lesson", session = %s.id(), state = ?s.state(), turns = s.history().len(), "Lesson socket closed");
  }
  info!(target: "habla_backend", live_clips = state.clips.live(), "WebSocket disconnected");
}

#[instrument(level = "info", skip(state, conn))]
async fn handle_client_ws(msg: ClientWsMessage, state: &Arc<AppState>, conn: &mut SocketState) -> Vec<ServerWsMessage> {
  match msg {
    ClientWsMessage::Ping => vec![ServerWsMessage::Pong],

    ClientWsMessage::StartLesson { lesson_id, persona, options } => {
      let Some(fresh) = state.new_session(&lesson_id, persona) else {
        return vec![ServerWsMessage::Error { message: format!("Lesson not found: {}", lesson_id) }];
      };
      let mut fresh = fresh.with_options(options);
      let mut out = vec![ServerWsMessage::Session {
        session_id: fresh.id(),
        lesson: fresh.lesson().clone(),
        persona: fresh.persona().to_string(),
      }];
      match fresh.start(state.gateway.as_ref(), &state.store).await {
        Ok(turn) => {
          info!(target: "lesson", session = %fresh.id(), lesson = %lesson_id, persona = %fresh.persona(), "WS lesson started");
          out.extend(turn_messages(&fresh, turn));
          conn.session = Some(fresh);
        }
        Err(e) => {
          error!(target: "lesson", lesson = %lesson_id, error = %e, "Opening turn failed");
          out.push(ServerWsMessage::Error { message: e.to_string() });
        }
      }
      out
    }

    ClientWsMessage::Reply { text } => {
      let Some(active) = conn.session.as_mut() else {
        return vec![ServerWsMessage::Error { message: "No lesson in progress".into() }];
      };
      match active.submit_reply(&text, state.gateway.as_ref(), &state.store).await {
        Ok(turn) => turn_messages(active, turn),
        Err(e) => vec![ServerWsMessage::Error { message: e.to_string() }],
      }
    }

    ClientWsMessage::Speak { text, options } => {
      if text.trim().is_empty() {
        return vec![ServerWsMessage::Error { message: "Text is required".into() }];
      }
      let player = conn.player();
      conn.playback.spawn(speak(state.clone(), text, options, player));
      Vec::new()
    }

    ClientWsMessage::Played { clip_id } => {
      if !conn.pending.finish(&clip_id) {
        debug!(target: "habla_backend", %clip_id, "Played report for a clip no longer held");
      }
      Vec::new()
    }
  }
}

/// The turn itself, plus a completion notice when the goal was reached.
fn turn_messages(session: &LessonSession, turn: ParsedTurn) -> Vec<ServerWsMessage> {
  let mut out = vec![ServerWsMessage::turn(turn, session.state())];
  if session.state() == SessionState::Completed {
    out.push(ServerWsMessage::Completed {
      lesson_id: session.lesson().id.clone(),
      completed_at: session.completed_at().map(str::to_string),
    });
  }
  out
}

async fn speak(state: Arc<AppState>, text: String, options: RequestOptions, player: ChannelPlayer) {
  let audio = match state.gateway.generate_speech(&text, &options).await {
    Ok(audio) => audio,
    Err(e) => {
      let _ = player.tx.send(ServerWsMessage::Error { message: e.to_string() });
      return;
    }
  };
  if let Err(e) = play_audio(&state.clips, audio, &player).await {
    let _ = player.tx.send(ServerWsMessage::Error { message: e.to_string() });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::TutorConfig;
  use crate::gateway::{MockGateway, MOCK_AUDIO};
  use crate::routes::build_router;
  use crate::store::{CompletionStore, MemoryKeyValueStore};
  use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
  };
  use tower::ServiceExt;

  fn state() -> Arc<AppState> {
    Arc::new(AppState::new(
      TutorConfig::default(),
      CompletionStore::new(Arc::new(MemoryKeyValueStore::default())),
      Arc::new(MockGateway::new(Duration::ZERO)),
    ))
  }

  async fn next_audio(rx: &mut mpsc::UnboundedReceiver<ServerWsMessage>) -> (Uuid, String) {
    match rx.recv().await {
      Some(ServerWsMessage::Audio { clip_id, url, mime, audio_base64 }) => {
        assert_eq!(mime, "audio/mpeg");
        assert_eq!(STANDARD.decode(audio_base64).unwrap(), MOCK_AUDIO);
        assert_eq!(url, format!("/api/v1/audio/{}", clip_id));
        (clip_id, url)
      }
      other => panic!("expected audio, got {:?}", other),
    }
  }

  async fn fetch(state: &Arc<AppState>, url: &str) -> (StatusCode, Vec<u8>) {
    let res = build_router(state.clone())
      .oneshot(Request::get(url).body(Body::empty()).unwrap())
      .await
      .unwrap();
    let status = res.status();
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
  }

  #[tokio::test]
  async fn start_then_reply_over_socket_dispatch() {
    let state = state();
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut conn = SocketState::new(tx, CLIP_TTL);

    let reply = handle_client_ws(ClientWsMessage::Reply { text: "Hola".into() }, &state, &mut conn).await;
    assert!(matches!(&reply[..], [ServerWsMessage::Error { .. }]));

    let start = ClientWsMessage::StartLesson { lesson_id: "hotel-checkin".into(), persona: None, options: Default::default() };
    let out = handle_client_ws(start, &state, &mut conn).await;
    assert!(matches!(&out[0], ServerWsMessage::Session { .. }));
    assert!(matches!(&out[1], ServerWsMessage::Turn { state: SessionState::AwaitingUserReply, .. }));
    assert!(conn.session.is_some());

    let out = handle_client_ws(ClientWsMessage::Reply { text: "Hola".into() }, &state, &mut conn).await;
    match &out[..] {
      [ServerWsMessage::Turn { turn, .. }] => assert_eq!(turn.score, 3),
      other => panic!("unexpected reply: {:?}", other),
    }
  }

  #[tokio::test]
  async fn unknown_lesson_is_reported() {
    let state = state();
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut conn = SocketState::new(tx, CLIP_TTL);
    let start = ClientWsMessage::StartLesson { lesson_id: "nonexistent".into(), persona: None, options: Default::default() };
    let out = handle_client_ws(start, &state, &mut conn).await;
    assert!(matches!(&out[..], [ServerWsMessage::Error { .. }]));
    assert!(conn.session.is_none());
  }

  #[tokio::test]
  async fn advertised_clip_url_serves_audio_until_played() {
    let state = state();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut conn = SocketState::new(tx, CLIP_TTL);

    let out = handle_client_ws(ClientWsMessage::Speak { text: "Hola".into(), options: Default::default() }, &state, &mut conn).await;
    assert!(out.is_empty());
    let (clip_id, url) = next_audio(&mut rx).await;

    let (status, bytes) = fetch(&state, &url).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes, MOCK_AUDIO);

    let out = handle_client_ws(ClientWsMessage::Played { clip_id }, &state, &mut conn).await;
    assert!(out.is_empty());
    conn.playback.join_next().await.unwrap().unwrap();
    assert_eq!(state.clips.live(), 0);

    let (status, _) = fetch(&state, &url).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
  }

  #[tokio::test(start_paused = true)]
  async fn unplayed_clip_is_released_after_ttl() {
    let state = state();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = SocketState::new(tx, Duration::from_secs(30));
    let task = tokio::spawn(speak(state.clone(), "Hola".into(), RequestOptions::new(), conn.player()));

    let (clip_id, _) = next_audio(&mut rx).await;
    assert!(state.clips.get(&clip_id).is_some());

    tokio::time::sleep(Duration::from_secs(31)).await;
    task.await.unwrap();
    assert_eq!(state.clips.live(), 0);
    assert!(!conn.pending.finish(&clip_id));
  }

  #[tokio::test]
  async fn closing_socket_releases_held_clips() {
    let state = state();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut conn = SocketState::new(tx, CLIP_TTL);
    handle_client_ws(ClientWsMessage::Speak { text: "Hola".into(), options: Default::default() }, &state, &mut conn).await;
    next_audio(&mut rx).await;
    assert_eq!(state.clips.live(), 1);

    conn.playback.abort_all();
    while conn.playback.join_next().await.is_some() {}
    assert_eq!(state.clips.live(), 0);
  }

  #[tokio::test]
  async fn speak_to_closed_socket_still_releases_clip() {
    let state = state();
    let (tx, rx) = mpsc::unbounded_channel();
    let conn = SocketState::new(tx, CLIP_TTL);
    drop(rx);
    speak(state.clone(), "Hola".into(), RequestOptions::new(), conn.player()).await;
    assert_eq!(state.clips.live(), 0);
    assert!(conn.pending.lock().is_empty());
  }

  #[tokio::test]
  async fn blank_speak_text_is_rejected() {
    let state = state();
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut conn = SocketState::new(tx, CLIP_TTL);
    let out = handle_client_ws(ClientWsMessage::Speak { text: "  ".into(), options: Default::default() }, &state, &mut conn).await;
    assert!(matches!(&out[..], [ServerWsMessage::Error { .. }]));
    assert!(conn.playback.is_empty());
  }
}
