//! Blob storage backend adapters.
//!
//! - **B2**: Backblaze B2 native API
//! - **Filesystem**: a local directory
//!
//! Backends are opened from a [`BackendConfig`] (usually read from a config
//! file) or from the [`ConnectionInfo`] another backend reported, and are
//! normally wrapped in a [`RetryingBackend`].

pub mod b2;
pub mod directory;
pub mod retrying;

use serde::{Deserialize, Serialize};
use tracing::debug;

use blobkit_common::{Backend, ConnectionInfo, Error, OpContext, Operation, Result, RetryPolicy};

pub use b2::{B2Backend, B2Options};
pub use directory::{DirectoryBackend, DirectoryOptions};
pub use retrying::RetryingBackend;

/// Backend selection plus its options.
///
/// ```toml
/// type = "b2"
/// bucket = "my-bucket"
/// key_id = "0012345..."
/// key = "K00..."
/// prefix = "repo/"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    B2(B2Options),
    Filesystem(DirectoryOptions),
}

impl BackendConfig {
    pub fn backend_type(&self) -> &'static str {
        match self {
            BackendConfig::B2(_) => b2::BACKEND_TYPE,
            BackendConfig::Filesystem(_) => directory::BACKEND_TYPE,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            BackendConfig::B2(options) => options.validate(),
            BackendConfig::Filesystem(options) => {
                if options.path.as_os_str().is_empty() {
                    return Err(Error::InvalidConfiguration("filesystem path must not be empty".into()));
                }
                Ok(())
            }
        }
    }

    pub fn to_connection_info(&self) -> ConnectionInfo {
        match self {
            BackendConfig::B2(options) => options.connection_info(),
            BackendConfig::Filesystem(options) => options.connection_info(),
        }
    }

    pub fn from_connection_info(info: &ConnectionInfo) -> Result<Self> {
        let invalid = |e: serde_json::Error| {
            Error::InvalidConfiguration(format!("invalid {} connection info: {}", info.backend_type, e))
        };
        let config = match info.backend_type.as_str() {
            b2::BACKEND_TYPE => BackendConfig::B2(serde_json::from_value(info.config.clone()).map_err(invalid)?),
            directory::BACKEND_TYPE => {
                BackendConfig::Filesystem(serde_json::from_value(info.config.clone()).map_err(invalid)?)
            }
            other => return Err(Error::InvalidConfiguration(format!("Unknown backend type: {}", other))),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn prefix(&self) -> &str {
        match self {
            BackendConfig::B2(options) => &options.prefix,
            BackendConfig::Filesystem(options) => &options.prefix,
        }
    }

    /// Same target, narrowed to `prefix() + sub`.
    pub fn with_sub_prefix(&self, sub: &str) -> Self {
        let mut config = self.clone();
        match &mut config {
            BackendConfig::B2(options) => options.prefix.push_str(sub),
            BackendConfig::Filesystem(options) => options.prefix.push_str(sub),
        }
        config
    }
}

/// Connect to the configured backend. Credentials and bucket/path are
/// checked here, before any blob operation.
pub async fn open_backend(ctx: &OpContext, config: &BackendConfig) -> Result<Box<dyn Backend>> {
    config.validate()?;
    debug!(backend = config.backend_type(), "Opening backend");
    match config {
        BackendConfig::B2(options) => Ok(Box::new(B2Backend::connect(ctx, options.clone()).await?)),
        BackendConfig::Filesystem(options) => {
            Ok(Box::new(DirectoryBackend::connect(ctx, options.clone()).await?))
        }
    }
}

/// Rebuild a backend from the connection info of another one.
pub async fn open_from_connection_info(ctx: &OpContext, info: &ConnectionInfo) -> Result<Box<dyn Backend>> {
    let config = BackendConfig::from_connection_info(info)?;
    open_backend(ctx, &config).await
}

/// Connect with transient connect failures retried, and wrap the result so
/// every later operation is retried the same way.
pub async fn open_with_retry(
    ctx: &OpContext,
    config: &BackendConfig,
    policy: RetryPolicy,
) -> Result<RetryingBackend<Box<dyn Backend>>> {
    policy.validate()?;
    let backend = policy
        .run(ctx, Operation::new("connect"), |_| open_backend(ctx, config))
        .await?;
    Ok(RetryingBackend::new(backend, policy))
}
