//! Subcommand implementations.

use std::path::Path;

use anyhow::Context;
use bytes::Bytes;
use futures::TryStreamExt;
use tokio::io::AsyncWriteExt;
use tracing::info;

use blobkit_backends::open_from_connection_info;
use blobkit_common::{Backend, BlobId, OpContext};
use blobkit_conformance::{
    assert_connection_info_round_trips, clear, verify_not_found, verify_storage, HarnessConfig,
};

pub async fn ls(ctx: &OpContext, backend: &dyn Backend, prefix: &str, long: bool) -> anyhow::Result<()> {
    let mut stream = backend.list_blobs(ctx, prefix);
    let mut count = 0u64;
    let mut total = 0u64;
    while let Some(meta) = stream.try_next().await? {
        if long {
            println!("{:>12}  {}  {}", meta.length, meta.timestamp.to_rfc3339(), meta.id);
        } else {
            println!("{}", meta.id);
        }
        count += 1;
        total += meta.length;
    }
    info!(count, bytes = total, "Listing complete");
    Ok(())
}

pub async fn get(
    ctx: &OpContext,
    backend: &dyn Backend,
    id: &str,
    offset: u64,
    length: Option<u64>,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let data = backend.get_blob(ctx, &BlobId::from(id), offset, length).await?;
    match output {
        Some(path) => tokio::fs::write(path, &data)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?,
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&data).await?;
            stdout.flush().await?;
        }
    }
    Ok(())
}

pub async fn put(ctx: &OpContext, backend: &dyn Backend, id: &str, file: &Path) -> anyhow::Result<()> {
    let data = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let len = data.len();
    backend.put_blob(ctx, &BlobId::from(id), Bytes::from(data)).await?;
    info!(id, bytes = len, "Uploaded");
    Ok(())
}

pub async fn rm(ctx: &OpContext, backend: &dyn Backend, id: &str) -> anyhow::Result<()> {
    backend.delete_blob(ctx, &BlobId::from(id)).await?;
    info!(id, "Deleted");
    Ok(())
}

pub fn info(backend: &dyn Backend, show_token: bool) {
    let connection = backend.connection_info();
    println!("type: {}", connection.backend_type);
    println!("target: {}", backend.display_name());
    if show_token {
        println!("token: {}", connection.to_token());
    }
}

/// Run the conformance suite, then remove everything it wrote. `backend`
/// should be scoped to a scratch prefix.
pub async fn verify(ctx: &OpContext, backend: &dyn Backend) -> anyhow::Result<()> {
    let config = HarnessConfig::default();
    let outcome = async {
        clear(ctx, backend).await?;
        verify_storage(ctx, backend, &config).await?;
        verify_not_found(ctx, backend).await?;
        assert_connection_info_round_trips(ctx, backend, config.consistency, |info| async move {
            open_from_connection_info(ctx, &info).await
        })
        .await
    }
    .await;

    let leftover = clear(ctx, backend).await?;
    outcome?;
    info!(leftover, "Verification passed");
    println!("OK: {}", backend.display_name());
    Ok(())
}
