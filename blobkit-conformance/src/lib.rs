//! Conformance suite for [`blobkit_common::Backend`] implementations.
//!
//! A typical live run:
//!
//! ```ignore
//! let Some(creds) = require(LiveCredentials::from_env(), "B2 test credentials") else {
//!     return Ok(());
//! };
//! retry_scenario(3, |_| async {
//!     let backend = open_somehow(&creds, &unique_prefix()).await?;
//!     clear(&ctx, &backend).await?;
//!     verify_storage(&ctx, &backend, &HarnessConfig::default()).await?;
//!     backend.close(&ctx).await?;
//!     Ok(())
//! })
//! .await
//! ```

mod support;
mod verify;

pub use support::{
    eventually, init_test_logging, require, retry_scenario, unique_prefix, Consistency, LiveCredentials,
    BUCKET_ENV, KEY_ENV, KEY_ID_ENV,
};
pub use verify::{assert_connection_info_round_trips, clear, verify_not_found, verify_storage, HarnessConfig};
