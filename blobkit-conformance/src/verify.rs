//! Behavioral checks every backend must pass.

use std::collections::BTreeSet;
use std::future::Future;

use anyhow::{bail, ensure, Context};
use bytes::Bytes;
use rand::RngCore;
use tracing::{debug, info};

use blobkit_common::{
    delete_all, list_all, Backend, BlobId, ConnectionInfo, ErrorKind, OpContext, Result,
};

use crate::support::{eventually, Consistency};

/// Tuning for [`verify_storage`].
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub consistency: Consistency,
    /// Size of the largest blob written
    pub large_blob_size: usize,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            consistency: Consistency::default(),
            large_blob_size: 256 * 1024,
        }
    }
}

/// Length of the blob used for ranged-read checks.
const RANGE_BLOB_LEN: usize = 15;

pub(crate) fn random_bytes(len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    Bytes::from(data)
}

/// Fail unless `result` is an error of `kind`.
pub(crate) fn expect_kind<T>(result: Result<T>, kind: ErrorKind, what: &str) -> anyhow::Result<()> {
    match result {
        Ok(_) => bail!("{}: expected {} error, got success", what, kind),
        Err(e) if e.kind() == kind => Ok(()),
        Err(e) => bail!("{}: expected {} error, got {}: {}", what, kind, e.kind(), e),
    }
}

async fn listed_ids(backend: &dyn Backend, ctx: &OpContext, prefix: &str) -> anyhow::Result<BTreeSet<BlobId>> {
    let items = list_all(backend, ctx, prefix)
        .await
        .with_context(|| format!("listing prefix {:?}", prefix))?;
    Ok(items.into_iter().map(|m| m.id).collect())
}

/// Wait until listing `prefix` yields exactly `expected`.
async fn expect_listing(
    backend: &dyn Backend,
    ctx: &OpContext,
    consistency: Consistency,
    prefix: &str,
    expected: &BTreeSet<BlobId>,
) -> anyhow::Result<()> {
    eventually(ctx, consistency, &format!("listing {:?}", prefix), move || async move {
        let got = listed_ids(backend, ctx, prefix).await?;
        ensure!(&got == expected, "listed {:?}, expected {:?}", got, expected);
        Ok(())
    })
    .await
}

/// Wait until `id` reads back as `data`.
async fn expect_content(
    backend: &dyn Backend,
    ctx: &OpContext,
    consistency: Consistency,
    id: &BlobId,
    data: &Bytes,
) -> anyhow::Result<()> {
    eventually(ctx, consistency, &format!("reading {}", id), move || async move {
        let got = backend.get_blob(ctx, id, 0, None).await?;
        ensure!(&got == data, "{}: read {} bytes, expected {}", id, got.len(), data.len());
        Ok(())
    })
    .await
}

/// Run the full storage suite. The backend must start out empty; it is
/// left empty on success.
pub async fn verify_storage(ctx: &OpContext, backend: &dyn Backend, config: &HarnessConfig) -> anyhow::Result<()> {
    info!(backend = %backend.display_name(), "Verifying storage");
    let consistency = config.consistency;

    let blobs: Vec<(BlobId, Bytes)> = vec![
        (BlobId::from("blob-empty"), Bytes::new()),
        (BlobId::from("blob-one"), random_bytes(1)),
        (BlobId::from("blob-range"), random_bytes(RANGE_BLOB_LEN)),
        (BlobId::from("blob-large"), random_bytes(config.large_blob_size)),
        (BlobId::from("dir/nested/blob"), random_bytes(100)),
    ];

    for (id, _) in &blobs {
        expect_kind(backend.get_blob(ctx, id, 0, None).await, ErrorKind::NotFound, "get before put")?;
    }

    // Writes, each twice: same id and content is idempotent.
    for (id, data) in &blobs {
        backend.put_blob(ctx, id, data.clone()).await.with_context(|| format!("put {}", id))?;
        backend.put_blob(ctx, id, data.clone()).await.with_context(|| format!("re-put {}", id))?;
    }

    for (id, data) in &blobs {
        expect_content(backend, ctx, consistency, id, data).await?;
        let exact = backend
            .get_blob(ctx, id, 0, Some(data.len() as u64))
            .await
            .with_context(|| format!("get {} with explicit length", id))?;
        ensure!(&exact == data, "{}: explicit-length read differs", id);

        let meta = backend.get_metadata(ctx, id).await.with_context(|| format!("metadata {}", id))?;
        ensure!(&meta.id == id, "metadata id {} for {}", meta.id, id);
        ensure!(
            meta.length == data.len() as u64,
            "{}: metadata length {}, expected {}",
            id,
            meta.length,
            data.len()
        );
    }

    let range_blob = &blobs[2];
    verify_ranges(ctx, backend, &range_blob.0, &range_blob.1).await?;

    let all: BTreeSet<BlobId> = blobs.iter().map(|(id, _)| id.clone()).collect();
    expect_listing(backend, ctx, consistency, "", &all).await?;
    let flat: BTreeSet<BlobId> = all.iter().filter(|id| id.starts_with("blob-")).cloned().collect();
    expect_listing(backend, ctx, consistency, "blob-", &flat).await?;
    let nested: BTreeSet<BlobId> = [BlobId::from("dir/nested/blob")].into_iter().collect();
    expect_listing(backend, ctx, consistency, "dir/", &nested).await?;
    expect_listing(backend, ctx, consistency, "no-such-prefix", &BTreeSet::new()).await?;

    let listed = list_all(backend, ctx, "").await?;
    for meta in &listed {
        if let Some((_, data)) = blobs.iter().find(|(id, _)| id == &meta.id) {
            ensure!(
                meta.length == data.len() as u64,
                "{}: listed length {}, expected {}",
                meta.id,
                meta.length,
                data.len()
            );
        }
    }

    // Overwrite replaces the content.
    let (one_id, _) = &blobs[1];
    let replacement = random_bytes(33);
    backend.put_blob(ctx, one_id, replacement.clone()).await.context("overwrite")?;
    expect_content(backend, ctx, consistency, one_id, &replacement).await?;

    // Our own deletes must be visible at once; only listings may lag.
    for (id, _) in &blobs {
        backend.delete_blob(ctx, id).await.with_context(|| format!("delete {}", id))?;
        backend.delete_blob(ctx, id).await.with_context(|| format!("second delete {}", id))?;
        expect_deleted(ctx, backend, id).await?;
    }
    expect_listing(backend, ctx, consistency, "", &BTreeSet::new()).await?;

    info!(backend = %backend.display_name(), "Storage verified");
    Ok(())
}

async fn expect_deleted(ctx: &OpContext, backend: &dyn Backend, id: &BlobId) -> anyhow::Result<()> {
    let what = format!("get {} after delete", id);
    expect_kind(backend.get_blob(ctx, id, 0, None).await, ErrorKind::NotFound, &what)?;
    let what = format!("metadata {} after delete", id);
    expect_kind(backend.get_metadata(ctx, id).await, ErrorKind::NotFound, &what)
}

/// Range convention checks against a blob holding `data`.
async fn verify_ranges(ctx: &OpContext, backend: &dyn Backend, id: &BlobId, data: &Bytes) -> anyhow::Result<()> {
    let size = data.len() as u64;
    let ok_cases: [(u64, Option<u64>); 7] = [
        (0, Some(1)),
        (3, Some(4)),
        (size - 1, Some(1)),
        (5, None),
        (0, Some(0)),
        (size, Some(0)),
        (size, None),
    ];
    for (offset, length) in ok_cases {
        let got = backend
            .get_blob(ctx, id, offset, length)
            .await
            .with_context(|| format!("get {} offset {} length {:?}", id, offset, length))?;
        let start = offset as usize;
        let end = length.map_or(data.len(), |l| start + l as usize);
        ensure!(
            got == data.slice(start..end),
            "{}: offset {} length {:?} returned wrong bytes",
            id,
            offset,
            length
        );
        debug!(id = %id, offset, ?length, "Range ok");
    }

    let bad_cases: [(u64, Option<u64>); 4] = [
        (size + 1, None),
        (size + 1, Some(0)),
        (size - 5, Some(6)),
        (1, Some(u64::MAX)),
    ];
    for (offset, length) in bad_cases {
        expect_kind(
            backend.get_blob(ctx, id, offset, length).await,
            ErrorKind::InvalidRange,
            &format!("offset {} length {:?}", offset, length),
        )?;
    }
    Ok(())
}

/// Reads and metadata of an unknown id fail with `NotFound`; deleting it
/// succeeds.
pub async fn verify_not_found(ctx: &OpContext, backend: &dyn Backend) -> anyhow::Result<()> {
    let id = BlobId::new(format!("invalid-blob-{:016x}", rand::random::<u64>()));
    expect_kind(backend.get_blob(ctx, &id, 0, Some(30)).await, ErrorKind::NotFound, "get unknown")?;
    expect_kind(backend.get_blob(ctx, &id, 0, None).await, ErrorKind::NotFound, "get unknown")?;
    expect_kind(backend.get_blob(ctx, &id, 0, Some(0)).await, ErrorKind::NotFound, "empty get unknown")?;
    expect_kind(backend.get_metadata(ctx, &id).await, ErrorKind::NotFound, "metadata unknown")?;
    backend.delete_blob(ctx, &id).await.context("delete unknown")?;
    Ok(())
}

/// Rebuild a backend from `backend`'s connection info (through its token
/// form) and check it sees what the first one wrote.
pub async fn assert_connection_info_round_trips<F, Fut>(
    ctx: &OpContext,
    backend: &dyn Backend,
    consistency: Consistency,
    open: F,
) -> anyhow::Result<()>
where
    F: FnOnce(ConnectionInfo) -> Fut,
    Fut: Future<Output = Result<Box<dyn Backend>>>,
{
    let info = backend.connection_info();
    let decoded = ConnectionInfo::from_token(&info.to_token()).context("decoding connection token")?;
    ensure!(decoded == info, "connection info changed through its token");

    let id = BlobId::from("connection-info-check");
    let data = random_bytes(64);
    backend.put_blob(ctx, &id, data.clone()).await.context("put check blob")?;

    let reopened = open(decoded).await.context("opening backend from connection info")?;
    let outcome = async {
        ensure!(
            reopened.connection_info() == info,
            "reopened backend reports different connection info"
        );
        expect_content(reopened.as_ref(), ctx, consistency, &id, &data).await
    }
    .await;

    reopened.close(ctx).await.context("closing reopened backend")?;
    backend.delete_blob(ctx, &id).await.context("delete check blob")?;
    outcome
}

/// Delete everything under the backend's prefix. Returns the number of
/// blobs visited.
pub async fn clear(ctx: &OpContext, backend: &dyn Backend) -> anyhow::Result<usize> {
    let count = delete_all(backend, ctx, "")
        .await
        .with_context(|| format!("clearing {}", backend.display_name()))?;
    debug!(backend = %backend.display_name(), count, "Cleared");
    Ok(count)
}
