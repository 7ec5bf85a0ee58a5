//! Wiring between configuration, storage and model providers.
//!
//! [`Services`] is the long-lived bundle shared by the HTTP server and the
//! CLI. Each request calls [`Services::session`] once, which snapshots the
//! current [`GlobalSettings`] and builds the chat model and embedder that
//! the rest of the request uses. A settings change therefore only affects
//! requests that start after it.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, EmbeddingConfig, LlmConfig};
use crate::embedding::{create_embedder, Embedder};
use crate::llm::openai::OpenAiChatModel;
use crate::llm::{ChatModel, DisabledChatModel, LlmError};
use crate::objects::{FsObjectStore, ObjectStore};
use crate::settings::{GlobalSettings, SettingsHandle};
use crate::store::sqlite::SqliteStore;
use crate::store::Store;

/// Builds model clients from a settings snapshot.
pub trait Providers: Send + Sync {
    fn chat_model(&self, settings: &GlobalSettings) -> Result<Arc<dyn ChatModel>, LlmError>;
    fn embedder(&self, settings: &GlobalSettings) -> Result<Arc<dyn Embedder>>;
}

/// Real HTTP-backed providers. Transport knobs (timeouts, retries, batch
/// size) come from config; model identity and credentials from settings.
pub struct HttpProviders {
    llm: LlmConfig,
    embedding: EmbeddingConfig,
}

impl HttpProviders {
    pub fn new(config: &Config) -> Self {
        Self {
            llm: config.llm.clone(),
            embedding: config.embedding.clone(),
        }
    }
}

impl Providers for HttpProviders {
    fn chat_model(&self, settings: &GlobalSettings) -> Result<Arc<dyn ChatModel>, LlmError> {
        match settings.llm.provider.as_str() {
            "disabled" => Ok(Arc::new(DisabledChatModel)),
            _ => {
                let model = OpenAiChatModel::new(
                    settings.llm.model.clone(),
                    settings.llm.base_url.as_deref(),
                    settings.llm.api_key.clone(),
                    Duration::from_secs(self.llm.timeout_secs),
                    self.llm.max_retries,
                )?;
                Ok(Arc::new(model))
            }
        }
    }

    fn embedder(&self, settings: &GlobalSettings) -> Result<Arc<dyn Embedder>> {
        Ok(Arc::from(create_embedder(&settings.embedding, &self.embedding)?))
    }
}

/// Hands out the same pre-built clients regardless of settings. Used by
/// tests and offline tooling.
pub struct FixedProviders {
    pub chat: Arc<dyn ChatModel>,
    pub embedder: Arc<dyn Embedder>,
}

impl FixedProviders {
    pub fn new(chat: Arc<dyn ChatModel>, embedder: Arc<dyn Embedder>) -> Self {
        Self { chat, embedder }
    }
}

impl Providers for FixedProviders {
    fn chat_model(&self, _settings: &GlobalSettings) -> Result<Arc<dyn ChatModel>, LlmError> {
        Ok(self.chat.clone())
    }

    fn embedder(&self, _settings: &GlobalSettings) -> Result<Arc<dyn Embedder>> {
        Ok(self.embedder.clone())
    }
}

#[derive(Clone)]
pub struct Services {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub objects: Arc<dyn ObjectStore>,
    pub providers: Arc<dyn Providers>,
    pub settings: Arc<SettingsHandle>,
}

impl Services {
    /// Settings are seeded from `config`.
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        objects: Arc<dyn ObjectStore>,
        providers: Arc<dyn Providers>,
    ) -> Self {
        let settings = Arc::new(SettingsHandle::new(GlobalSettings::from_config(&config)));
        Self {
            config: Arc::new(config),
            store,
            objects,
            providers,
            settings,
        }
    }

    /// Production wiring: SQLite store, filesystem uploads, HTTP providers.
    pub async fn open(config: Config) -> Result<Self> {
        let store = SqliteStore::open(&config)
            .await
            .with_context(|| format!("Failed to open database {}", config.db.path.display()))?;
        let objects = FsObjectStore::new(config.storage.root.clone());
        let providers = HttpProviders::new(&config);
        Ok(Self::new(
            config,
            Arc::new(store),
            Arc::new(objects),
            Arc::new(providers),
        ))
    }

    /// Snapshot settings and build the clients for one request.
    pub fn session(&self) -> Result<Session> {
        let settings = self.settings.snapshot();
        let chat = self
            .providers
            .chat_model(&settings)
            .context("Failed to create chat model")?;
        let embedder = self
            .providers
            .embedder(&settings)
            .context("Failed to create embedder")?;
        Ok(Session {
            config: self.config.clone(),
            store: self.store.clone(),
            objects: self.objects.clone(),
            settings,
            chat,
            embedder,
        })
    }
}

/// Everything one request needs, fixed for its whole lifetime.
#[derive(Clone)]
pub struct Session {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub objects: Arc<dyn ObjectStore>,
    pub settings: Arc<GlobalSettings>,
    pub chat: Arc<dyn ChatModel>,
    pub embedder: Arc<dyn Embedder>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::mock::HashEmbedder;
    use crate::llm::mock::ScriptedChatModel;
    use crate::objects::MemoryObjectStore;
    use crate::settings::SettingsUpdate;
    use crate::store::memory::InMemoryStore;

    fn test_config() -> Config {
        toml::from_str("[db]\npath = \"unused.sqlite\"\n").unwrap()
    }

    #[tokio::test]
    async fn test_session_snapshot_is_stable_across_updates() {
        let services = Services::new(
            test_config(),
            Arc::new(InMemoryStore::new()),
            Arc::new(MemoryObjectStore::new()),
            Arc::new(FixedProviders::new(
                Arc::new(ScriptedChatModel::always("ok")),
                Arc::new(HashEmbedder::new(32)),
            )),
        );
        let before = services.session().unwrap();

        let update = SettingsUpdate {
            system_prompt: Some("Be terse.".to_string()),
            ..Default::default()
        };
        services
            .settings
            .update(true, &update, services.store.as_ref())
            .await
            .unwrap();

        assert_eq!(before.settings.system_prompt, None);
        let after = services.session().unwrap();
        assert_eq!(after.settings.system_prompt.as_deref(), Some("Be terse."));
    }

    #[test]
    fn test_http_providers_disabled_llm() {
        let mut config = test_config();
        config.llm.provider = "disabled".to_string();
        let providers = HttpProviders::new(&config);
        let settings = GlobalSettings::from_config(&config);
        let model = providers.chat_model(&settings).unwrap();
        assert_eq!(model.model_name(), "disabled");
        let embedder = providers.embedder(&settings).unwrap();
        assert_eq!(embedder.model_name(), "disabled");
    }
}
