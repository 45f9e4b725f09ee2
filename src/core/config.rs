use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::core::error::{StoryError, StoryResult};
use crate::services::assembler::PdfConfig;
use crate::services::flipbook::FlipbookConfig;
use crate::services::illustration::ImageConfig;
use crate::services::llm::LlmConfig;

pub const CONFIG_FILE: &str = "config.yml";

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub image: ImageConfig,

    #[serde(default)]
    pub flipbook: FlipbookConfig,

    #[serde(default)]
    pub pdf: PdfConfig,

    #[serde(default)]
    pub server: ServerConfig,

    /// Base URL of a running `storyflip serve`. When set, the CLI goes
    /// through its HTTP endpoints instead of calling the providers itself.
    #[serde(default)]
    pub remote: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Largest accepted request body. Uploads carry the whole PDF in base64.
    #[serde(default = "default_body_limit_mb")]
    pub body_limit_mb: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            body_limit_mb: default_body_limit_mb(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:3000".to_string()
}
fn default_body_limit_mb() -> usize {
    64
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Like `load_from`, but a missing file yields the defaults so that a
    /// server can run from environment variables alone.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_from(path)
        } else {
            log::info!("{} not found, using defaults and environment", path.display());
            Ok(Self::default())
        }
    }
}

/// Picks a credential from the config file, falling back to the first set
/// environment variable. Absence is an operator error, not a client one.
pub fn resolve_secret(configured: Option<&str>, env_vars: &[&str], what: &str) -> StoryResult<String> {
    if let Some(value) = configured.map(str::trim).filter(|v| !v.is_empty()) {
        return Ok(value.to_string());
    }
    env_vars
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
        .ok_or_else(|| StoryError::Configuration(format!("Missing {}.", what)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config_uses_defaults() -> Result<()> {
        let yaml = r#"
llm:
  provider: gemini
  gemini:
    api_key: abc
"#;
        let config: Config = serde_yaml_ng::from_str(yaml)?;
        assert_eq!(config.llm.provider, "gemini");
        assert_eq!(config.image.provider, "imagen");
        assert_eq!(config.pdf.page_width, 842.0);
        assert_eq!(config.pdf.page_height, 595.0);
        assert_eq!(config.flipbook.background_color, "#F1F5F9");
        assert!(config.flipbook.logo_remove);
        assert_eq!(config.server.bind, "127.0.0.1:3000");
        assert!(config.remote.is_none());
        Ok(())
    }

    #[test]
    fn test_load_from_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.yml");
        fs::write(&path, "remote: http://localhost:3000\npdf:\n  scale: 2.0\n")?;

        let config = Config::load_from(&path)?;
        assert_eq!(config.remote.as_deref(), Some("http://localhost:3000"));
        assert_eq!(config.pdf.scale, 2.0);

        assert!(Config::load_from(&dir.path().join("missing.yml")).is_err());
        assert!(Config::load_or_default(&dir.path().join("missing.yml")).is_ok());
        Ok(())
    }

    #[test]
    fn test_resolve_secret_prefers_config() {
        let key = resolve_secret(Some("from-file"), &["STORYFLIP_TEST_UNSET_VAR"], "test key");
        assert_eq!(key.unwrap(), "from-file");
    }

    #[test]
    fn test_resolve_secret_missing_is_configuration_failure() {
        let err = resolve_secret(Some("  "), &["STORYFLIP_TEST_UNSET_VAR"], "test key").unwrap_err();
        assert_eq!(err, StoryError::Configuration("Missing test key.".into()));
    }
}
