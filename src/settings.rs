use crate::attachment::DEFAULT_MAX_IMAGE_BYTES;
use crate::db::{Database, StoreError};
use crate::llm::openai::{OpenAiConfig, DEFAULT_BASE_URL, DEFAULT_MODEL};
use crate::session::state::{SessionConfig, DEFAULT_GREETING, DEFAULT_SYSTEM_PROMPT};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const SETTING_KEYS: &[&str] = &[
    "completion_api_key",
    "completion_base_url",
    "completion_model",
    "referer_origin",
    "system_prompt",
    "greeting",
    "max_image_bytes",
];

/// Fallback for `completion_api_key` when the settings table has none.
pub const API_KEY_ENV: &str = "OPENROUTER_API_KEY";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub referer_origin: Option<String>,
    pub system_prompt: String,
    pub greeting: String,
    pub max_image_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            referer_origin: None,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            greeting: DEFAULT_GREETING.to_string(),
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
        }
    }
}

impl Settings {
    pub fn load(db: &Database) -> Result<Self, StoreError> {
        let env_key = std::env::var(API_KEY_ENV).ok();
        Self::load_with_env(db, env_key)
    }

    fn load_with_env(db: &Database, env_key: Option<String>) -> Result<Self, StoreError> {
        let mut settings = Settings::default();

        settings.api_key = db
            .get_setting("completion_api_key")?
            .or(env_key)
            .filter(|key| !key.is_empty());
        if let Some(base_url) = db.get_setting("completion_base_url")? {
            settings.base_url = base_url;
        }
        if let Some(model) = db.get_setting("completion_model")? {
            settings.model = model;
        }
        settings.referer_origin = db.get_setting("referer_origin")?;
        if let Some(prompt) = db.get_setting("system_prompt")? {
            settings.system_prompt = prompt;
        }
        if let Some(greeting) = db.get_setting("greeting")? {
            settings.greeting = greeting;
        }
        if let Some(raw) = db.get_setting("max_image_bytes")? {
            match raw.parse() {
                Ok(limit) => settings.max_image_bytes = limit,
                Err(_) => warn!(value = %raw, "ignoring invalid max_image_bytes setting"),
            }
        }

        Ok(settings)
    }

    pub fn completion_config(&self) -> OpenAiConfig {
        OpenAiConfig {
            api_key: self.api_key.clone().unwrap_or_default(),
            base_url: self.base_url.clone(),
            model: self.model.clone(),
            referer: self.referer_origin.clone(),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            system_prompt: self.system_prompt.clone(),
            greeting: self.greeting.clone(),
            max_image_bytes: self.max_image_bytes,
            ..SessionConfig::default()
        }
    }
}

pub fn is_secret(key: &str) -> bool {
    key.ends_with("_api_key")
}

/// Keeps the first and last four characters of long secrets.
pub fn mask_secret(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 8 {
        return value.to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}
