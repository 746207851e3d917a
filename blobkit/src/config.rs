use serde::Deserialize;
use std::path::Path;

use blobkit_backends::BackendConfig;
use blobkit_common::RetryPolicy;

const KEY_ID_ENV: &str = "B2_APPLICATION_KEY_ID";
const KEY_ENV: &str = "B2_APPLICATION_KEY";

/// ```toml
/// [backend]
/// type = "b2"
/// bucket = "my-bucket"
/// prefix = "repo/"
///
/// [retry]
/// max_attempts = 8
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct CliConfig {
    pub backend: BackendConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl CliConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        Self::parse(&content, |name| std::env::var(name).ok())
            .map_err(|e| anyhow::anyhow!("Invalid config {}: {}", path.display(), e))
    }

    /// Parse TOML, fill missing B2 credentials from `env`, and validate.
    pub fn parse<F>(content: &str, env: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config: CliConfig = toml::from_str(content)?;
        if let BackendConfig::B2(options) = &mut config.backend {
            if options.key_id.is_empty() {
                options.key_id = env(KEY_ID_ENV).unwrap_or_default();
            }
            if options.key.is_empty() {
                options.key = env(KEY_ENV).unwrap_or_default();
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if let BackendConfig::B2(options) = &self.backend {
            if options.key_id.is_empty() || options.key.is_empty() {
                anyhow::bail!(
                    "b2 credentials missing: set key_id and key, or {} and {}",
                    KEY_ID_ENV,
                    KEY_ENV
                );
            }
        }
        self.backend.validate()?;
        self.retry.validate()?;
        Ok(())
    }
}
