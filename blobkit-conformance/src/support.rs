//! Test plumbing shared by conformance runs: bounded polling, live
//! credentials, skip policy, unique prefixes and scenario retries.

use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use blobkit_common::OpContext;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub const BUCKET_ENV: &str = "BLOBKIT_B2_TEST_BUCKET";
pub const KEY_ID_ENV: &str = "BLOBKIT_B2_TEST_KEY_ID";
pub const KEY_ENV: &str = "BLOBKIT_B2_TEST_KEY";

/// How long to wait for a write to become visible to listings and reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Consistency {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for Consistency {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_millis(500),
        }
    }
}

impl Consistency {
    /// For strongly consistent stores: check once, never wait.
    pub fn immediate() -> Self {
        Self {
            attempts: 1,
            delay: Duration::ZERO,
        }
    }
}

/// Poll `check` until it succeeds or the attempts run out; the last
/// failure is returned with `what` as context.
pub async fn eventually<T, F, Fut>(
    ctx: &OpContext,
    consistency: Consistency,
    what: &str,
    mut check: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let attempts = consistency.attempts.max(1);
    let mut attempt = 1;
    loop {
        match check().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => {
                return Err(e.context(format!("{} not satisfied after {} attempts", what, attempts)));
            }
            Err(e) => {
                tracing::debug!(what, attempt, error = %e, "Condition not met yet");
                ctx.sleep(consistency.delay).await?;
                attempt += 1;
            }
        }
    }
}

/// Credentials for a real B2 bucket.
#[derive(Clone, PartialEq, Eq)]
pub struct LiveCredentials {
    pub bucket: String,
    pub key_id: String,
    pub key: String,
}

impl std::fmt::Debug for LiveCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveCredentials")
            .field("bucket", &self.bucket)
            .field("key_id", &self.key_id)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl LiveCredentials {
    /// Build from any name lookup; `None` unless all three values are
    /// present and non-empty.
    pub fn from_lookup<F>(lookup: F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());
        Some(Self {
            bucket: get(BUCKET_ENV)?,
            key_id: get(KEY_ID_ENV)?,
            key: get(KEY_ENV)?,
        })
    }

    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }
}

/// Skip policy for optional test inputs: passes `value` through and logs
/// the skip when it is absent. Callers return early on `None`.
pub fn require<T>(value: Option<T>, what: &str) -> Option<T> {
    if value.is_none() {
        warn!("Skipping: {} not provided", what);
        eprintln!("skipping: {} not provided", what);
    }
    value
}

/// `test-<unix-seconds>-<16 hex digits>-`, unique per call.
pub fn unique_prefix() -> String {
    format!(
        "test-{}-{:016x}-",
        chrono::Utc::now().timestamp(),
        rand::random::<u64>()
    )
}

/// Run a whole scenario up to `attempts` times, for services that fail
/// intermittently. The attempt number (from 1) is passed to `scenario`.
pub async fn retry_scenario<T, F, Fut>(attempts: u32, mut scenario: F) -> anyhow::Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match scenario(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => {
                return Err(e).with_context(|| format!("scenario failed after {} attempts", attempts));
            }
            Err(e) => {
                warn!(attempt, error = %format!("{:#}", e), "Scenario failed, retrying");
                attempt += 1;
            }
        }
    }
}

/// Install a test-writer subscriber once; later calls are no-ops.
pub fn init_test_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init()
        .is_ok()
    {
        info!("Test logging initialized");
    }
}
