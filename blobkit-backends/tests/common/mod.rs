//! Shared fixtures for the backend integration tests.
#![allow(dead_code)]

pub mod fake_b2;
pub mod faults;

use blobkit_backends::{DirectoryBackend, DirectoryOptions};
use blobkit_common::OpContext;
use tempfile::TempDir;

/// A directory backend rooted in a fresh temp dir. Keep the `TempDir`
/// alive for as long as the backend is used.
pub async fn temp_directory_backend(prefix: &str) -> (TempDir, DirectoryBackend) {
    let dir = tempfile::tempdir().unwrap();
    let backend = DirectoryBackend::connect(
        &OpContext::background(),
        DirectoryOptions {
            path: dir.path().to_path_buf(),
            prefix: prefix.to_string(),
        },
    )
    .await
    .unwrap();
    (dir, backend)
}
