//! Configuration management for kouri.
//!
//! Configuration is loaded from multiple sources with precedence:
//! 1. Environment variables (KOURI_API_KEY, KOURI_DATABASE_PATH)
//! 2. Config file (~/.kouri/config.toml, or KOURI_CONFIG / --config)
//! 3. Default values

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use kouri_memory::{MemoryConfig, OpenAiConfig};
use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Memory engine settings
    pub memory: MemoryConfig,

    /// OpenAI-compatible endpoint; offline providers are used when `api_key` is empty
    pub provider: OpenAiConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            memory: MemoryConfig::new(default_data_dir().join("memory.db")),
            provider: OpenAiConfig::default(),
        }
    }
}

/// Base directory for kouri data
fn default_data_dir() -> PathBuf {
    if let Some(home) = dirs::home_dir() {
        home.join(".kouri")
    } else if let Some(proj_dirs) = ProjectDirs::from("chat", "kourichat", "kouri") {
        proj_dirs.data_dir().to_path_buf()
    } else {
        PathBuf::from(".kouri")
    }
}

impl Config {
    /// Load configuration from file and environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(Path::to_path_buf).unwrap_or_else(Self::config_path);

        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file {}", config_path.display()))?;
            Self::from_toml(&content)
                .with_context(|| format!("Failed to parse config file {}", config_path.display()))?
        } else {
            Config::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.resolve_paths(&default_data_dir());
        config
            .memory
            .validate()
            .context("Invalid [memory] configuration")?;
        Ok(config)
    }

    /// Parse a config file body
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Get the config file path.
    pub fn config_path() -> PathBuf {
        default_data_dir().join("config.toml")
    }

    /// Apply environment overrides through `lookup`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(api_key) = lookup("KOURI_API_KEY").filter(|v| !v.trim().is_empty()) {
            self.provider.api_key = api_key;
        }
        if let Some(path) = lookup("KOURI_DATABASE_PATH").filter(|v| !v.trim().is_empty()) {
            self.memory.database_path = PathBuf::from(path);
        }
    }

    /// Relative database paths live under the data directory
    pub fn resolve_paths(&mut self, data_dir: &Path) {
        if self.memory.database_path.is_relative() {
            self.memory.database_path = data_dir.join(&self.memory.database_path);
        }
    }

    /// Whether the remote capability is configured
    pub fn has_remote_provider(&self) -> bool {
        !self.provider.api_key.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert!(config.memory.database_path.ends_with("memory.db"));
        assert_eq!(config.memory.retriever.recency_floor, 6);
        assert_eq!(config.memory.assembler.max_context_tokens, 3000);
        assert!(!config.has_remote_provider());
    }

    #[test]
    fn test_partial_file() {
        let config = Config::from_toml(
            r#"
            [memory.summarizer]
            max_active_turns = 60

            [provider]
            base_url = "https://api.deepseek.com/v1"
            chat_model = "deepseek-chat"
            "#,
        )
        .unwrap();

        assert_eq!(config.memory.summarizer.max_active_turns, 60);
        assert_eq!(config.memory.summarizer.keep_recent_turns, 10);
        assert_eq!(config.provider.chat_model, "deepseek-chat");
        assert_eq!(config.provider.embedding_model, "text-embedding-3-small");
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = Config::from_toml("[provider]\napi_key = \"from-file\"").unwrap();
        let env: HashMap<&str, &str> = [
            ("KOURI_API_KEY", "from-env"),
            ("KOURI_DATABASE_PATH", "/var/lib/kouri/memory.db"),
        ]
        .into_iter()
        .collect();

        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.provider.api_key, "from-env");
        assert_eq!(
            config.memory.database_path,
            PathBuf::from("/var/lib/kouri/memory.db")
        );
        assert!(config.has_remote_provider());
    }

    #[test]
    fn test_empty_env_is_ignored() {
        let mut config = Config::from_toml("[provider]\napi_key = \"from-file\"").unwrap();
        config.apply_env(|_| Some(String::new()));
        assert_eq!(config.provider.api_key, "from-file");
    }

    #[test]
    fn test_relative_database_path_resolves_to_data_dir() {
        let temp = tempdir().expect("Failed to create temp dir");
        let mut config = Config::from_toml("[memory]\ndatabase_path = \"chats.db\"").unwrap();
        config.resolve_paths(temp.path());
        assert_eq!(config.memory.database_path, temp.path().join("chats.db"));
    }

    #[test]
    fn test_load_explicit_file() {
        let temp = tempdir().expect("Failed to create temp dir");
        let path = temp.path().join("config.toml");
        let db = temp.path().join("memory.db");
        std::fs::write(
            &path,
            format!(
                "[memory]\ndatabase_path = {:?}\n\n[memory.retriever]\ntop_k = 3\n",
                db.display().to_string()
            ),
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.memory.retriever.top_k, 3);
        if std::env::var("KOURI_DATABASE_PATH").is_err() {
            assert_eq!(config.memory.database_path, db);
        }
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let temp = tempdir().expect("Failed to create temp dir");
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "[memory.retriever]\ntoken_budget = 0\n").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }
}
