//! Runtime configuration.
//!
//! Two layers:
//!   - `Settings`: process environment (ports, provider credentials, mock toggle, data dir).
//!   - `TutorConfig`: optional TOML file (prompt template, persona names, extra lessons).

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use serde::Deserialize;
use tracing::{error, info};

use crate::domain::Lesson;
use crate::prompt::DEFAULT_LESSON_TEMPLATE;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("Invalid value for environment variable {0}: {1}")]
  InvalidValue(String, String),
}

/// Which gateway implementation serves chat and speech requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GatewayMode {
  OpenAi,
  Mock,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Settings {
  pub port: u16,
  pub openai_api_key: Option<String>,
  pub openai_base_url: String,
  pub chat_model: String,
  pub request_timeout: Duration,
  pub use_mock_api: bool,
  pub mock_delay: Duration,
  /// HTTP sessions untouched for this long are evicted.
  pub session_idle: Duration,
  /// `None` disables completion persistence (store answers empty/false).
  pub data_dir: Option<PathBuf>,
  pub tutor_config_path: Option<PathBuf>,
}

impl Settings {
  /// Loads configuration from environment variables.
  pub fn from_env() -> Result<Self, ConfigError> {
    let port = parse_var("PORT", 3000u16)?;
    let openai_api_key = std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.trim().is_empty());
    let openai_base_url =
      std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into());
    let chat_model = std::env::var("OPENAI_CHAT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into());
    let request_timeout = Duration::from_secs(parse_var("OPENAI_TIMEOUT_SECS", 30u64)?);
    let use_mock_api = std::env::var("USE_MOCK_API").map(|v| v == "true").unwrap_or(false);
    let mock_delay = Duration::from_millis(parse_var("MOCK_DELAY_MS", 1000u64)?);
    let session_idle = Duration::from_secs(parse_var("SESSION_IDLE_SECS", 1800u64)?);

    let data_dir = match std::env::var("DATA_DIR") {
      Ok(v) if v.trim().is_empty() => None,
      Ok(v) => Some(PathBuf::from(v)),
      Err(_) => Some(PathBuf::from("./data")),
    };
    let tutor_config_path = std::env::var("TUTOR_CONFIG_PATH").ok().map(PathBuf::from);

    Ok(Self {
      port,
      openai_api_key,
      openai_base_url,
      chat_model,
      request_timeout,
      use_mock_api,
      mock_delay,
      session_idle,
      data_dir,
      tutor_config_path,
    })
  }

  pub fn bind_address(&self) -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], self.port))
  }

  /// Mock mode is used when requested, or when no API key is available.
  pub fn gateway_mode(&self) -> GatewayMode {
    if self.use_mock_api || self.openai_api_key.is_none() {
      GatewayMode::Mock
    } else {
      GatewayMode::OpenAi
    }
  }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
  T::Err: std::fmt::Display,
{
  match std::env::var(name) {
    Ok(raw) => raw
      .trim()
      .parse::<T>()
      .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("'{}': {}", raw, e))),
    Err(_) => Ok(default),
  }
}

/// Optional TOML overlay. Every section may be omitted.
#[derive(Clone, Debug, Deserialize, Default)]
pub struct TutorConfig {
  #[serde(default)]
  pub prompts: Prompts,
  #[serde(default)]
  pub personas: Vec<String>,
  #[serde(default)]
  pub lessons: Vec<Lesson>,
}

/// Prompt templates. Placeholders: `{persona}`, `{language}`, `{difficulty}`, `{scenario}`, `{goal}`.
#[derive(Clone, Debug, Deserialize)]
pub struct Prompts {
  pub lesson_system_template: String,
}

impl Default for Prompts {
  fn default() -> Self {
    Self { lesson_system_template: DEFAULT_LESSON_TEMPLATE.into() }
  }
}

/// Attempt to load `TutorConfig` from the given path. On any parsing/IO error, returns None.
pub fn load_tutor_config(path: Option<&PathBuf>) -> Option<TutorConfig> {
  let path = path?;
  match std::fs::read_to_string(path) {
    Ok(s) => match toml::from_str::<TutorConfig>(&s) {
      Ok(cfg) => {
        info!(target: "habla_backend", path = %path.display(), lessons = cfg.lessons.len(), "Loaded tutor config (TOML)");
        Some(cfg)
      }
      Err(e) => {
        error!(target: "habla_backend", path = %path.display(), error = %e, "Failed to parse TOML config");
        None
      }
    },
    Err(e) => {
      error!(target: "habla_backend", path = %path.display(), error = %e, "Failed to read TOML config file");
      None
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::Difficulty;
  use serial_test::serial;
  use std::env;
  use std::io::Write;

  fn clear_env_vars() {
    for var in [
      "PORT",
      "OPENAI_API_KEY",
      "OPENAI_BASE_URL",
      "OPENAI_CHAT_MODEL",
      "OPENAI_TIMEOUT_SECS",
      "USE_MOCK_API",
      "MOCK_DELAY_MS",
      "SESSION_IDLE_SECS",
      "DATA_DIR",
      "TUTOR_CONFIG_PATH",
    ] {
      env::remove_var(var);
    }
  }

  #[test]
  #[serial]
  fn defaults_without_env() {
    clear_env_vars();
    let s = Settings::from_env().expect("defaults load");
    assert_eq!(s.port, 3000);
    assert_eq!(s.openai_base_url, "https://api.openai.com/v1");
    assert_eq!(s.chat_model, "gpt-4o-mini");
    assert_eq!(s.mock_delay, Duration::from_millis(1000));
    assert_eq!(s.session_idle, Duration::from_secs(1800));
    assert_eq!(s.data_dir, Some(PathBuf::from("./data")));
    assert_eq!(s.gateway_mode(), GatewayMode::Mock);
  }

  #[test]
  #[serial]
  fn api_key_selects_openai_unless_mock_requested() {
    clear_env_vars();
    env::set_var("OPENAI_API_KEY", "sk-test");
    assert_eq!(Settings::from_env().unwrap().gateway_mode(), GatewayMode::OpenAi);

    env::set_var("USE_MOCK_API", "true");
    assert_eq!(Settings::from_env().unwrap().gateway_mode(), GatewayMode::Mock);
    clear_env_vars();
  }

  #[test]
  #[serial]
  fn empty_data_dir_disables_persistence() {
    clear_env_vars();
    env::set_var("DATA_DIR", "");
    assert_eq!(Settings::from_env().unwrap().data_dir, None);
    clear_env_vars();
  }

  #[test]
  #[serial]
  fn invalid_port_is_reported() {
    clear_env_vars();
    env::set_var("PORT", "not-a-port");
    match Settings::from_env().unwrap_err() {
      ConfigError::InvalidValue(var, _) => assert_eq!(var, "PORT"),
    }
    clear_env_vars();
  }

  #[test]
  fn tutor_config_parses_lessons_and_personas() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
      file,
      r#"
personas = ["Lucía", "Mateo"]

[prompts]
lesson_system_template = "You are {{persona}} speaking {{language}}."

[[lessons]]
id = "market"
title = "At the Market"
difficulty = "superbeginnersokeepitto2or3words"
language = "Spanish"
estimatedMinutes = 4
scenario = "You are at an open-air market."
goal = "Buy two kilos of oranges."
"#
    )
    .unwrap();

    let cfg = load_tutor_config(Some(&file.path().to_path_buf())).expect("config loads");
    assert_eq!(cfg.personas, vec!["Lucía", "Mateo"]);
    assert_eq!(cfg.prompts.lesson_system_template, "You are {persona} speaking {language}.");
    assert_eq!(cfg.lessons.len(), 1);
    assert_eq!(cfg.lessons[0].difficulty, Difficulty::VeryEasy);
    assert_eq!(cfg.lessons[0].estimated_minutes, 4);
  }

  #[test]
  fn unreadable_or_broken_config_yields_none() {
    assert!(load_tutor_config(None).is_none());
    assert!(load_tutor_config(Some(&PathBuf::from("/nonexistent/tutor.toml"))).is_none());

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "lessons = 12").unwrap();
    assert!(load_tutor_config(Some(&file.path().to_path_buf())).is_none());
  }
}
