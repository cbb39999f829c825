pub mod attachment;
pub mod commands;
pub mod content;
pub mod db;
pub mod llm;
pub mod session;
pub mod settings;

use db::{ChatStore, Database, StoreError};
use llm::openai::OpenAiClient;
use llm::CompletionClient;
use session::{spawn_session, SessionContext, SessionHandle};
use settings::Settings;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Process-wide wiring: the database, loaded settings and completion client.
pub struct App {
    db: Arc<Database>,
    settings: Settings,
    completion: Arc<dyn CompletionClient>,
    /// Set when the client came from `with_completion`; reloads keep it.
    injected: bool,
}

impl App {
    pub fn open(app_dir: &Path) -> Result<Self, AppError> {
        let db = Database::new(app_dir)?;
        let settings = Settings::load(&db)?;
        if settings.api_key.is_none() {
            warn!("no completion API key configured, requests will be unauthenticated");
        }
        let completion = Arc::new(OpenAiClient::new(settings.completion_config()));
        info!(dir = %app_dir.display(), model = %settings.model, "app opened");
        Ok(Self {
            db: Arc::new(db),
            settings,
            completion,
            injected: false,
        })
    }

    /// Wires an already-open database to a custom completion client.
    pub fn with_completion(
        db: Database,
        completion: Arc<dyn CompletionClient>,
    ) -> Result<Self, AppError> {
        let settings = Settings::load(&db)?;
        Ok(Self {
            db: Arc::new(db),
            settings,
            completion,
            injected: true,
        })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn store(&self) -> Arc<dyn ChatStore> {
        self.db.clone()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Re-reads settings and rebuilds the completion client unless one was
    /// injected. Running sessions keep the client they were opened with.
    pub fn reload_settings(&mut self) -> Result<(), AppError> {
        self.settings = Settings::load(&self.db)?;
        if !self.injected {
            self.completion = Arc::new(OpenAiClient::new(self.settings.completion_config()));
        }
        Ok(())
    }

    /// Starts a session on an unsaved draft.
    pub fn spawn_session(&self, ctx: Arc<SessionContext>) -> SessionHandle {
        spawn_session(
            ctx,
            self.settings.session_config(),
            self.store(),
            self.completion.clone(),
        )
    }
}
