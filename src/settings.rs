//! Admin-editable model settings.
//!
//! [`GlobalSettings`] holds the chat and embedding provider choices plus
//! their credentials. It is seeded from the `[llm]` and `[embedding]`
//! config sections and can be changed at runtime by an admin through
//! [`SettingsHandle::update`]. Readers take a [`SettingsHandle::snapshot`]
//! once per request, so a concurrent update never changes settings halfway
//! through a chat turn or an ingestion run.
//!
//! Embedding provider, model, dimensions and base URL are locked as soon
//! as any chunk exists: vectors produced by a different model would be
//! silently incomparable with the stored ones.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, RwLock};

use crate::config::Config;
use crate::error::SettingsError;
use crate::store::Store;

#[derive(Debug, Clone, PartialEq)]
pub struct LlmSettings {
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingSettings {
    pub provider: String,
    pub model: Option<String>,
    pub dims: Option<usize>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
}

impl EmbeddingSettings {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    /// Fields that determine the vector space of stored chunks.
    fn identity(&self) -> (&str, Option<&str>, Option<usize>, Option<&str>) {
        (
            &self.provider,
            self.model.as_deref(),
            self.dims,
            self.base_url.as_deref(),
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalSettings {
    pub llm: LlmSettings,
    pub embedding: EmbeddingSettings,
    /// Overrides the built-in assistant system prompt when set.
    pub system_prompt: Option<String>,
}

impl GlobalSettings {
    /// Seed settings from config. API keys are read from the environment
    /// variables named by `api_key_env`.
    pub fn from_config(config: &Config) -> Self {
        Self {
            llm: LlmSettings {
                provider: config.llm.provider.clone(),
                model: config.llm.model.clone(),
                base_url: config.llm.base_url.clone(),
                api_key: std::env::var(&config.llm.api_key_env).ok(),
            },
            embedding: EmbeddingSettings {
                provider: config.embedding.provider.clone(),
                model: config.embedding.model.clone(),
                dims: config.embedding.dims,
                base_url: config.embedding.base_url.clone(),
                api_key: std::env::var(&config.embedding.api_key_env).ok(),
            },
            system_prompt: config.llm.system_prompt.clone(),
        }
    }

    /// JSON view with credentials replaced by presence flags.
    pub fn redacted(&self) -> Value {
        json!({
            "llm_provider": self.llm.provider,
            "llm_model": self.llm.model,
            "llm_base_url": self.llm.base_url,
            "llm_api_key_set": self.llm.api_key.is_some(),
            "embedding_provider": self.embedding.provider,
            "embedding_model": self.embedding.model,
            "embedding_dims": self.embedding.dims,
            "embedding_base_url": self.embedding.base_url,
            "embedding_api_key_set": self.embedding.api_key.is_some(),
            "system_prompt": self.system_prompt,
        })
    }

    fn validate(&self) -> Result<(), SettingsError> {
        match self.llm.provider.as_str() {
            "openai" | "disabled" => {}
            other => {
                return Err(SettingsError::Invalid(format!(
                    "unknown llm provider '{}'",
                    other
                )))
            }
        }
        if self.llm.model.trim().is_empty() {
            return Err(SettingsError::Invalid("llm model must not be empty".into()));
        }
        match self.embedding.provider.as_str() {
            "disabled" | "openai" | "ollama" => {}
            other => {
                return Err(SettingsError::Invalid(format!(
                    "unknown embedding provider '{}'",
                    other
                )))
            }
        }
        if self.embedding.is_enabled() {
            if self.embedding.model.is_none() {
                return Err(SettingsError::Invalid(
                    "embedding model is required".into(),
                ));
            }
            if matches!(self.embedding.dims, None | Some(0)) {
                return Err(SettingsError::Invalid(
                    "embedding dims must be > 0".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Partial update. Absent fields keep their current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsUpdate {
    pub llm_provider: Option<String>,
    pub llm_model: Option<String>,
    pub llm_base_url: Option<String>,
    pub llm_api_key: Option<String>,
    pub embedding_provider: Option<String>,
    pub embedding_model: Option<String>,
    pub embedding_dims: Option<usize>,
    pub embedding_base_url: Option<String>,
    pub embedding_api_key: Option<String>,
    pub system_prompt: Option<String>,
}

impl SettingsUpdate {
    fn apply(&self, current: &GlobalSettings) -> GlobalSettings {
        let mut next = current.clone();
        if let Some(v) = &self.llm_provider {
            next.llm.provider = v.clone();
        }
        if let Some(v) = &self.llm_model {
            next.llm.model = v.clone();
        }
        if let Some(v) = &self.llm_base_url {
            next.llm.base_url = Some(v.clone());
        }
        if let Some(v) = &self.llm_api_key {
            next.llm.api_key = Some(v.clone());
        }
        if let Some(v) = &self.embedding_provider {
            next.embedding.provider = v.clone();
        }
        if let Some(v) = &self.embedding_model {
            next.embedding.model = Some(v.clone());
        }
        if let Some(v) = self.embedding_dims {
            next.embedding.dims = Some(v);
        }
        if let Some(v) = &self.embedding_base_url {
            next.embedding.base_url = Some(v.clone());
        }
        if let Some(v) = &self.embedding_api_key {
            next.embedding.api_key = Some(v.clone());
        }
        if let Some(v) = &self.system_prompt {
            next.system_prompt = Some(v.clone());
        }
        next
    }
}

/// Process-wide, read-mostly settings cell.
pub struct SettingsHandle {
    inner: RwLock<Arc<GlobalSettings>>,
}

impl SettingsHandle {
    pub fn new(settings: GlobalSettings) -> Self {
        Self {
            inner: RwLock::new(Arc::new(settings)),
        }
    }

    /// The settings in force right now. Cheap; clones an `Arc`.
    pub fn snapshot(&self) -> Arc<GlobalSettings> {
        self.inner.read().unwrap().clone()
    }

    /// Apply an admin update. Changing any embedding identity field is
    /// rejected while the store holds chunks.
    pub async fn update(
        &self,
        is_admin: bool,
        update: &SettingsUpdate,
        store: &dyn Store,
    ) -> Result<Arc<GlobalSettings>, SettingsError> {
        if !is_admin {
            return Err(SettingsError::Forbidden);
        }

        let current = self.snapshot();
        let next = update.apply(&current);
        next.validate()?;

        if next.embedding.identity() != current.embedding.identity() {
            let chunk_count = store.count_chunks().await?;
            if chunk_count > 0 {
                return Err(SettingsError::EmbeddingLocked { chunk_count });
            }
        }

        let next = Arc::new(next);
        let mut guard = self.inner.write().unwrap();
        // Another update may have landed since `current` was read.
        if **guard != *current {
            return Err(SettingsError::Invalid(
                "settings changed concurrently, retry".into(),
            ));
        }
        *guard = next.clone();
        tracing::info!(
            llm_model = %next.llm.model,
            embedding_provider = %next.embedding.provider,
            "settings updated"
        );
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{now_ts, Chunk, Document, DocumentStatus, MetadataStatus};
    use crate::store::memory::InMemoryStore;

    fn base() -> GlobalSettings {
        GlobalSettings {
            llm: LlmSettings {
                provider: "openai".into(),
                model: "gpt-4o".into(),
                base_url: None,
                api_key: Some("sk-test".into()),
            },
            embedding: EmbeddingSettings {
                provider: "openai".into(),
                model: Some("text-embedding-3-small".into()),
                dims: Some(4),
                base_url: None,
                api_key: None,
            },
            system_prompt: None,
        }
    }

    async fn store_with_one_chunk() -> InMemoryStore {
        let store = InMemoryStore::new();
        let now = now_ts();
        let doc = Document {
            id: "d1".into(),
            owner_id: "u1".into(),
            filename: "a.txt".into(),
            content_type: "text/plain".into(),
            file_size: 1,
            storage_path: "u1/d1/a.txt".into(),
            content_hash: "h".into(),
            status: DocumentStatus::Completed,
            error_message: None,
            chunk_count: 1,
            extracted_metadata: None,
            metadata_status: MetadataStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        store.insert_document(&doc, None).await.unwrap();
        store
            .replace_chunks(
                "d1",
                &[Chunk {
                    id: "c1".into(),
                    document_id: "d1".into(),
                    owner_id: "u1".into(),
                    chunk_index: 0,
                    content: "x".into(),
                    embedding: vec![0.0; 4],
                    metadata: json!({}),
                }],
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_non_admin_forbidden() {
        let handle = SettingsHandle::new(base());
        let store = InMemoryStore::new();
        let err = handle
            .update(false, &SettingsUpdate::default(), &store)
            .await
            .unwrap_err();
        assert!(matches!(err, SettingsError::Forbidden));
    }

    #[tokio::test]
    async fn test_embedding_locked_once_chunks_exist() {
        let handle = SettingsHandle::new(base());
        let store = store_with_one_chunk().await;
        let update = SettingsUpdate {
            embedding_model: Some("text-embedding-3-large".into()),
            ..Default::default()
        };
        let err = handle.update(true, &update, &store).await.unwrap_err();
        assert!(matches!(err, SettingsError::EmbeddingLocked { chunk_count: 1 }));
        assert_eq!(
            handle.snapshot().embedding.model.as_deref(),
            Some("text-embedding-3-small")
        );
    }

    #[tokio::test]
    async fn test_llm_change_allowed_with_chunks() {
        let handle = SettingsHandle::new(base());
        let store = store_with_one_chunk().await;
        let update = SettingsUpdate {
            llm_model: Some("gpt-4o-mini".into()),
            embedding_api_key: Some("sk-new".into()),
            ..Default::default()
        };
        let next = handle.update(true, &update, &store).await.unwrap();
        assert_eq!(next.llm.model, "gpt-4o-mini");
        assert_eq!(handle.snapshot().llm.model, "gpt-4o-mini");
    }

    #[tokio::test]
    async fn test_snapshot_is_stable_across_update() {
        let handle = SettingsHandle::new(base());
        let before = handle.snapshot();
        let update = SettingsUpdate {
            llm_model: Some("other".into()),
            ..Default::default()
        };
        handle
            .update(true, &update, &InMemoryStore::new())
            .await
            .unwrap();
        assert_eq!(before.llm.model, "gpt-4o");
    }

    #[tokio::test]
    async fn test_invalid_provider_rejected() {
        let handle = SettingsHandle::new(base());
        let update = SettingsUpdate {
            embedding_provider: Some("magic".into()),
            ..Default::default()
        };
        let err = handle
            .update(true, &update, &InMemoryStore::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SettingsError::Invalid(_)));
    }

    #[test]
    fn test_redacted_hides_keys() {
        let v = base().redacted();
        assert_eq!(v["llm_api_key_set"], true);
        assert!(!v.to_string().contains("sk-test"));
    }
}
