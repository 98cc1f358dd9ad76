//! Router assembly: HTTP endpoints, WebSocket upgrade, static files, CORS, and HTTP tracing.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    services::{ServeDir, ServeFile},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

use crate::state::AppState;

pub mod http;
pub mod ws;

/// Build the application router with:
/// - WebSocket lesson sessions at `/ws`
/// - provider proxies under `/api/openai/...`
/// - lessons, sessions and audio clips under `/api/v1/...`
/// - Static SPA from `./static` with index fallback
/// - CORS (allow any origin/method/headers); tighten for production
/// - HTTP trace layer (per-request spans w/ method, path, status, latency)
pub fn build_router(state: Arc<AppState>) -> Router {
    // Static files with SPA fallback
    let static_service = ServeDir::new("./static")
        .append_index_html_on_directories(true)
        .not_found_service(ServeFile::new("./static/index.html"));

    Router::new()
        // WebSocket
        .route("/ws", get(ws::ws_upgrade))
        // Provider proxies
        .route("/api/openai/chat", post(http::http_post_chat))
        .route("/api/openai/speech", post(http::http_post_speech))
        // Lessons + sessions
        .route("/api/v1/health", get(http::http_health))
        .route("/api/v1/lessons", get(http::http_list_lessons))
        .route("/api/v1/lessons/:id", get(http::http_get_lesson))
        .route("/api/v1/sessions", post(http::http_post_session))
        .route("/api/v1/sessions/:id", axum::routing::delete(http::http_delete_session))
        .route("/api/v1/sessions/:id/reply", post(http::http_post_reply))
        .route("/api/v1/audio/:id", get(http::http_get_audio))
        // State + CORS + HTTP tracing
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        // Frontend fallback
        .fallback_service(static_service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TutorConfig;
    use crate::domain::Role;
    use crate::gateway::{ChatMessage, ChatReply, GatewayError, MockGateway, ModelGateway, RequestOptions, MOCK_AUDIO};
    use crate::store::{CompletionStore, MemoryKeyValueStore};
    use axum::{
        body::{to_bytes, Body},
        http::{header, Method, Request, StatusCode},
    };
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    /// Opens the lesson, then reports the goal reached on the first reply.
    struct CompletingGateway;

    #[async_trait::async_trait]
    impl ModelGateway for CompletingGateway {
        fn name(&self) -> &'static str {
            "completing"
        }

        async fn generate_chat_response(
            &self,
            messages: &[ChatMessage],
            _options: &RequestOptions,
        ) -> Result<ChatReply, GatewayError> {
            let content = if messages.iter().any(|m| m.role == Role::User) {
                r#"{"evaluation":{"score":5,"feedback":"Perfect."},"type":"statement","text":"¡Buen viaje!","translation":"Have a good trip!","goalCompleted":true}"#
            } else {
                r#"{"type":"statement","text":"¡Hola!","translation":"Hello!"}"#
            };
            Ok(ChatReply { message: ChatMessage::new(Role::Assistant, content), usage: None })
        }

        async fn generate_speech(&self, _text: &str, _options: &RequestOptions) -> Result<Vec<u8>, GatewayError> {
            Ok(MOCK_AUDIO.to_vec())
        }
    }

    fn app() -> (Arc<AppState>, Router) {
        let state = Arc::new(AppState::new(
            TutorConfig::default(),
            CompletionStore::new(Arc::new(MemoryKeyValueStore::default())),
            Arc::new(MockGateway::new(Duration::ZERO)),
        ));
        (state.clone(), build_router(state))
    }

    fn json_request(method: Method, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(res: axum::response::Response) -> Value {
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn lesson_lookup_and_not_found() {
        let (_, app) = app();
        let res = app.clone().oneshot(Request::get("/api/v1/lessons/train-station").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let lesson = body_json(res).await;
        assert_eq!(lesson["id"], "train-station");
        assert_eq!(lesson["estimatedMinutes"], 8);

        let res = app.oneshot(Request::get("/api/v1/lessons/nonexistent").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(res).await["error"], "Lesson not found");
    }

    #[tokio::test]
    async fn lesson_list_reports_completion() {
        let (state, app) = app();
        state.store.save_completed_lesson("doctor-visit");

        let res = app.oneshot(Request::get("/api/v1/lessons").body(Body::empty()).unwrap()).await.unwrap();
        let list = body_json(res).await;
        let list = list.as_array().unwrap();
        assert_eq!(list.len(), 6);
        let doctor = list.iter().find(|l| l["id"] == "doctor-visit").unwrap();
        assert_eq!(doctor["completed"], true);
        assert!(doctor["completedAt"].is_string());
        let cafe = list.iter().find(|l| l["id"] == "cafe-ordering").unwrap();
        assert_eq!(cafe["completed"], false);
        assert_eq!(cafe["difficulty"], "very_easy");
    }

    #[tokio::test]
    async fn chat_proxy_validates_and_forwards() {
        let (_, app) = app();
        let res = app
            .clone()
            .oneshot(json_request(Method::POST, "/api/openai/chat", json!({ "messages": "nope" })))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let err = body_json(res).await;
        assert_eq!(err["error"], "Invalid messages provided");
        assert!(err.as_object().unwrap().contains_key("details"));
        assert!(err["details"].is_null());

        let res = app
            .oneshot(json_request(
                Method::POST,
                "/api/openai/chat",
                json!({ "messages": [{ "role": "system", "content": "prompt" }], "options": { "temperature": 0.2 } }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let reply = body_json(res).await;
        assert_eq!(reply["message"]["role"], "assistant");
        assert!(reply["message"]["content"].as_str().unwrap().contains("\"type\":\"statement\""));
    }

    #[tokio::test]
    async fn speech_proxy_returns_audio() {
        let (_, app) = app();
        let res = app
            .clone()
            .oneshot(json_request(Method::POST, "/api/openai/speech", json!({ "text": "" })))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(res).await["error"], "Text is required");

        let res = app
            .oneshot(json_request(Method::POST, "/api/openai/speech", json!({ "text": "Hola" })))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[header::CONTENT_TYPE], "audio/mpeg");
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], MOCK_AUDIO);
    }

    #[tokio::test]
    async fn session_flow_over_http() {
        let (state, app) = app();
        let res = app
            .clone()
            .oneshot(json_request(Method::POST, "/api/v1/sessions", json!({ "lessonId": "cafe-ordering", "persona": "Sam" })))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        let started = body_json(res).await;
        assert_eq!(started["state"], "awaiting_user_reply");
        assert_eq!(started["persona"], "Sam");
        assert_eq!(started["turn"]["type"], "statement");
        assert_eq!(started["turn"]["hasEvaluation"], false);
        let id = started["sessionId"].as_str().unwrap().to_string();

        let res = app
            .clone()
            .oneshot(json_request(Method::POST, &format!("/api/v1/sessions/{id}/reply"), json!({ "text": "Hello!" })))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let next = body_json(res).await;
        assert_eq!(next["turn"]["score"], 3);
        assert_eq!(next["progression"], "advance");

        let res = app
            .clone()
            .oneshot(json_request(Method::POST, &format!("/api/v1/sessions/{id}/reply"), json!({ "text": "  " })))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = app
            .clone()
            .oneshot(Request::delete(format!("/api/v1/sessions/{id}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        assert!(state.sessions.read().await.is_empty());

        let res = app
            .oneshot(json_request(Method::POST, &format!("/api/v1/sessions/{id}/reply"), json!({ "text": "Hola" })))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn completed_session_is_closed_after_final_turn() {
        let state = Arc::new(AppState::new(
            TutorConfig::default(),
            CompletionStore::new(Arc::new(MemoryKeyValueStore::default())),
            Arc::new(CompletingGateway),
        ));
        let app = build_router(state.clone());

        let res = app
            .clone()
            .oneshot(json_request(Method::POST, "/api/v1/sessions", json!({ "lessonId": "train-station" })))
            .await
            .unwrap();
        let id = body_json(res).await["sessionId"].as_str().unwrap().to_string();
        assert_eq!(state.sessions.read().await.len(), 1);

        let res = app
            .clone()
            .oneshot(json_request(Method::POST, &format!("/api/v1/sessions/{id}/reply"), json!({ "text": "Dos billetes, por favor" })))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let last = body_json(res).await;
        assert_eq!(last["state"], "completed");
        assert!(last["completedAt"].is_string());
        assert!(state.sessions.read().await.is_empty());
        assert!(state.store.is_lesson_completed("train-station"));

        let res = app
            .oneshot(json_request(Method::POST, &format!("/api/v1/sessions/{id}/reply"), json!({ "text": "Gracias" })))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn abandoned_sessions_are_swept() {
        let state = Arc::new(
            AppState::new(
                TutorConfig::default(),
                CompletionStore::unavailable(),
                Arc::new(MockGateway::new(Duration::ZERO)),
            )
            .with_session_idle(Duration::ZERO),
        );
        let app = build_router(state.clone());
        for _ in 0..5 {
            let res = app
                .clone()
                .oneshot(json_request(Method::POST, "/api/v1/sessions", json!({ "lessonId": "cafe-ordering" })))
                .await
                .unwrap();
            assert_eq!(res.status(), StatusCode::CREATED);
        }
        assert_eq!(state.sessions.read().await.len(), 5);
        assert_eq!(state.sweep_idle_sessions().await, 5);
        assert!(state.sessions.read().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_lesson_session_is_not_found() {
        let (_, app) = app();
        let res = app
            .oneshot(json_request(Method::POST, "/api/v1/sessions", json!({ "lessonId": "nonexistent" })))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn live_audio_clip_is_served() {
        let (state, app) = app();
        let lease = state.clips.lease(b"mp3 bytes".to_vec(), crate::audio::MPEG_MIME);
        let url = lease.clip().url();

        let res = app.clone().oneshot(Request::get(url.as_str()).body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[header::CONTENT_TYPE], "audio/mpeg");

        drop(lease);
        let res = app.oneshot(Request::get(url.as_str()).body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}
