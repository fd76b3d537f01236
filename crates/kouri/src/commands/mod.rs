//! Command implementations for kouri CLI.
//!
//! Every command opens the memory service, runs one operation to completion
//! and shuts the service down again.

pub mod admin;
pub mod context;
pub mod maintenance;
pub mod record;

use std::sync::Arc;

use anyhow::{Context, Result};
use kouri_memory::{
    EmbeddingProvider, ExtractiveSummarizer, KeywordEmbedding, MemoryService, OpenAiCompatible,
    SummarizationProvider,
};

use crate::config::Config;

type Providers = (Arc<dyn SummarizationProvider>, Arc<dyn EmbeddingProvider>);

/// Remote providers when an API key is configured, offline ones otherwise
fn providers(config: &Config) -> Result<Providers> {
    if !config.has_remote_provider() {
        tracing::debug!("No provider api_key configured, using offline summarizer and keyword embedding");
        return Ok((
            Arc::new(ExtractiveSummarizer::new()),
            Arc::new(KeywordEmbedding::default()),
        ));
    }

    let remote = Arc::new(
        OpenAiCompatible::new(config.provider.clone()).context("Invalid [provider] configuration")?,
    );
    tracing::debug!(
        base_url = %config.provider.base_url,
        chat_model = %config.provider.chat_model,
        embedding_model = %config.provider.embedding_model,
        "Using remote provider"
    );
    let summarizer: Arc<dyn SummarizationProvider> = remote.clone();
    let embedder: Arc<dyn EmbeddingProvider> = remote;
    Ok((summarizer, embedder))
}

/// Open the memory service for one command
pub async fn open_service(config: &Config) -> Result<MemoryService> {
    let (summarizer, embedder) = providers(config)?;
    MemoryService::open(config.memory.clone(), summarizer, embedder)
        .await
        .with_context(|| {
            format!(
                "Failed to open memory database {}",
                config.memory.database_path.display()
            )
        })
}

/// Cut display text to `max` characters
pub(crate) fn preview(text: &str, max: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn offline_config(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.memory.database_path = dir.join("memory.db");
        config.provider.api_key = String::new();
        config
    }

    #[test]
    fn test_preview_is_char_safe() {
        assert_eq!(preview("hello", 10), "hello");
        assert_eq!(preview("你好世界", 2), "你好...");
    }

    #[tokio::test]
    async fn test_open_offline_service() {
        let temp = tempdir().unwrap();
        let config = offline_config(temp.path());
        let service = open_service(&config).await.unwrap();

        service
            .record_turn("mono:u1", kouri_memory::Role::User, "hello", None)
            .await
            .unwrap();
        assert_eq!(service.stats(None).await.unwrap().turns, 1);
        service.shutdown().await;
    }

    #[test]
    fn test_remote_requires_valid_provider() {
        let temp = tempdir().unwrap();
        let mut config = offline_config(temp.path());
        config.provider.api_key = "sk-test".into();
        let (summarizer, embedder) = providers(&config).unwrap();
        assert_eq!(summarizer.name(), config.provider.chat_model);
        assert_eq!(embedder.model_name(), config.provider.embedding_model);
    }
}
