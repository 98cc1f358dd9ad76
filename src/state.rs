//! Application state: lesson catalog, completion store, model gateway, live sessions.
//!
//! This module owns:
//!   - the lesson catalog (built-ins merged with TOML lessons)
//!   - the completion store (file-backed unless DATA_DIR is empty)
//!   - the gateway, chosen once here (OpenAI or mock)
//!   - HTTP sessions by id, and the audio clip registry

use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::audio::ClipRegistry;
use crate::config::{load_tutor_config, GatewayMode, Prompts, Settings, TutorConfig};
use crate::gateway::{MockGateway, ModelGateway, OpenAiGateway};
use crate::lessons::{random_persona_name, LessonCatalog};
use crate::session::LessonSession;
use crate::store::{CompletionStore, FileKeyValueStore};

pub type SharedSession = Arc<Mutex<LessonSession>>;

/// Idle time after which an HTTP session is evicted, unless configured otherwise.
pub const DEFAULT_SESSION_IDLE: Duration = Duration::from_secs(30 * 60);

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<LessonCatalog>,
    pub store: CompletionStore,
    pub gateway: Arc<dyn ModelGateway>,
    pub prompts: Prompts,
    pub personas: Vec<String>,
    pub sessions: Arc<RwLock<HashMap<Uuid, SharedSession>>>,
    pub session_idle: Duration,
    pub clips: ClipRegistry,
}

impl AppState {
    /// Build state from settings: load TOML config, merge lessons, open the store, pick the gateway.
    #[instrument(level = "info", skip_all)]
    pub fn from_settings(settings: &Settings) -> Self {
        let cfg = load_tutor_config(settings.tutor_config_path.as_ref()).unwrap_or_default();

        let store = match &settings.data_dir {
            Some(dir) => {
                info!(target: "habla_backend", data_dir = %dir.display(), "Completion store on disk");
                CompletionStore::new(Arc::new(FileKeyValueStore::new(dir.clone())))
            }
            None => {
                warn!(target: "habla_backend", "DATA_DIR empty; completed lessons will not be persisted");
                CompletionStore::unavailable()
            }
        };

        Self::new(cfg, store, build_gateway(settings)).with_session_idle(settings.session_idle)
    }

    pub fn new(cfg: TutorConfig, store: CompletionStore, gateway: Arc<dyn ModelGateway>) -> Self {
        let catalog = LessonCatalog::with_overrides(cfg.lessons);
        info!(target: "lesson", lessons = catalog.lessons().len(), gateway = gateway.name(), "Startup lesson inventory");

        Self {
            catalog: Arc::new(catalog),
            store,
            gateway,
            prompts: cfg.prompts,
            personas: cfg.personas,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            session_idle: DEFAULT_SESSION_IDLE,
            clips: ClipRegistry::default(),
        }
    }

    pub fn with_session_idle(mut self, idle: Duration) -> Self {
        self.session_idle = idle;
        self
    }

    /// A fresh session for `lesson_id`, or None for an unknown lesson.
    pub fn new_session(&self, lesson_id: &str, persona: Option<String>) -> Option<LessonSession> {
        let lesson = self.catalog.get_lesson_by_id(lesson_id)?.clone();
        let persona = persona
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| random_persona_name(&self.personas));
        Some(LessonSession::new(lesson, persona, &self.prompts.lesson_system_template))
    }

    #[instrument(level = "debug", skip(self, session), fields(id = %session.id()))]
    pub async fn insert_session(&self, session: LessonSession) -> SharedSession {
        let id = session.id();
        let shared = Arc::new(Mutex::new(session));
        self.sessions.write().await.insert(id, shared.clone());
        shared
    }

    pub async fn get_session(&self, id: &Uuid) -> Option<SharedSession> {
        self.sessions.read().await.get(id).cloned()
    }

    #[instrument(level = "debug", skip(self), fields(%id))]
    pub async fn remove_session(&self, id: &Uuid) -> bool {
        self.sessions.write().await.remove(id).is_some()
    }

    /// Drop sessions idle for at least `session_idle`. A session whose lock is held is
    /// mid-turn and always kept. Returns how many were evicted.
    pub async fn sweep_idle_sessions(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, shared| match shared.try_lock() {
            Ok(session) => session.idle_for() < self.session_idle,
            Err(_) => true,
        });
        let evicted = before - sessions.len();
        if evicted > 0 {
            info!(target: "lesson", evicted, remaining = sessions.len(), "Evicted idle sessions");
        }
        evicted
    }

    /// Sweep idle sessions every `every` until the task is aborted.
    pub fn spawn_session_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let state = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let evicted = state.sweep_idle_sessions().await;
                debug!(target: "lesson", evicted, "Session sweep");
            }
        })
    }
}

/// Pick the gateway once. Mock mode when requested, without an API key, or if the client fails to build.
pub fn build_gateway(settings: &Settings) -> Arc<dyn ModelGateway> {
    let mock = || -> Arc<dyn ModelGateway> { Arc::new(MockGateway::new(settings.mock_delay)) };

    match settings.gateway_mode() {
        GatewayMode::Mock => {
            if settings.use_mock_api {
                info!(target: "habla_backend", delay_ms = settings.mock_delay.as_millis() as u64, "Mock API enabled (USE_MOCK_API=true)");
            } else {
                warn!(target: "habla_backend", "OPENAI_API_KEY not set; using mock gateway");
            }
            mock()
        }
        GatewayMode::OpenAi => match OpenAiGateway::from_settings(settings) {
            Some(Ok(oa)) => {
                info!(target: "habla_backend", base_url = %oa.base_url, chat_model = %oa.chat_model, "OpenAI enabled.");
                Arc::new(oa)
            }
            Some(Err(e)) => {
                error!(target: "habla_backend", error = %e, "Failed to build OpenAI client; using mock gateway");
                mock()
            }
            None => mock(),
        },
    }
}
