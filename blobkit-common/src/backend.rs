//! The backend trait every storage adapter implements.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};

use crate::blob::{BlobId, BlobMetadata};
use crate::connection::ConnectionInfo;
use crate::context::OpContext;
use crate::error::Result;

/// Lazily fetched listing results. Pages are requested as the stream is
/// polled; dropping the stream stops the listing.
pub type BlobStream<'a> = BoxStream<'a, Result<BlobMetadata>>;

/// Trait implemented by all blob storage backends.
///
/// Every id is relative to the backend prefix: the prefix is prepended on
/// the way in and stripped from listing results on the way out, so callers
/// never see provider key names.
///
/// Backends are safe for concurrent use across distinct ids. A put racing a
/// get or list of the same id is only guaranteed to become visible
/// eventually.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Read `length` bytes starting at `offset`.
    ///
    /// `None` reads to the end of the blob and `Some(0)` is an explicit
    /// empty read. The range must fit inside the blob: `offset == size`
    /// with `None` returns an empty buffer, anything reaching past the end
    /// fails with `InvalidRange`. A missing blob fails with `NotFound`,
    /// including for zero-length reads.
    async fn get_blob(
        &self,
        ctx: &OpContext,
        id: &BlobId,
        offset: u64,
        length: Option<u64>,
    ) -> Result<Bytes>;

    /// Size and timestamp of a single blob.
    async fn get_metadata(&self, ctx: &OpContext, id: &BlobId) -> Result<BlobMetadata>;

    /// Store `data` under `id`, replacing any previous content.
    async fn put_blob(&self, ctx: &OpContext, id: &BlobId, data: Bytes) -> Result<()>;

    /// Remove the blob. Deleting a blob that does not exist succeeds.
    async fn delete_blob(&self, ctx: &OpContext, id: &BlobId) -> Result<()>;

    /// Stream metadata for every blob whose id starts with `prefix`.
    ///
    /// No ordering is promised beyond completeness.
    fn list_blobs<'a>(&'a self, ctx: &'a OpContext, prefix: &'a str) -> BlobStream<'a>;

    /// Everything needed to open an equivalent backend again.
    fn connection_info(&self) -> ConnectionInfo;

    /// Short human-readable description of the storage target.
    fn display_name(&self) -> String;

    /// Release the session. Every later call, including another `close`,
    /// fails with `Closed`.
    async fn close(&self, ctx: &OpContext) -> Result<()>;
}

macro_rules! forward_backend {
    ($wrapper:ident) => {
        #[async_trait]
        impl<T: Backend + ?Sized> Backend for $wrapper<T> {
            async fn get_blob(
                &self,
                ctx: &OpContext,
                id: &BlobId,
                offset: u64,
                length: Option<u64>,
            ) -> Result<Bytes> {
                (**self).get_blob(ctx, id, offset, length).await
            }

            async fn get_metadata(&self, ctx: &OpContext, id: &BlobId) -> Result<BlobMetadata> {
                (**self).get_metadata(ctx, id).await
            }

            async fn put_blob(&self, ctx: &OpContext, id: &BlobId, data: Bytes) -> Result<()> {
                (**self).put_blob(ctx, id, data).await
            }

            async fn delete_blob(&self, ctx: &OpContext, id: &BlobId) -> Result<()> {
                (**self).delete_blob(ctx, id).await
            }

            fn list_blobs<'a>(&'a self, ctx: &'a OpContext, prefix: &'a str) -> BlobStream<'a> {
                (**self).list_blobs(ctx, prefix)
            }

            fn connection_info(&self) -> ConnectionInfo {
                (**self).connection_info()
            }

            fn display_name(&self) -> String {
                (**self).display_name()
            }

            async fn close(&self, ctx: &OpContext) -> Result<()> {
                (**self).close(ctx).await
            }
        }
    };
}

forward_backend!(Box);
forward_backend!(Arc);

/// Invoke `f` for each listed blob, stopping at the first error `f` or the
/// listing returns.
pub async fn for_each_blob<B, F, Fut>(
    backend: &B,
    ctx: &OpContext,
    prefix: &str,
    mut f: F,
) -> Result<()>
where
    B: Backend + ?Sized,
    F: FnMut(BlobMetadata) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut stream = backend.list_blobs(ctx, prefix);
    while let Some(item) = stream.next().await {
        f(item?).await?;
    }
    Ok(())
}

/// Collect the whole listing into memory.
pub async fn list_all<B>(backend: &B, ctx: &OpContext, prefix: &str) -> Result<Vec<BlobMetadata>>
where
    B: Backend + ?Sized,
{
    backend.list_blobs(ctx, prefix).try_collect().await
}

/// Delete every blob under `prefix`; returns how many were visited.
pub async fn delete_all<B>(backend: &B, ctx: &OpContext, prefix: &str) -> Result<usize>
where
    B: Backend + ?Sized,
{
    let mut deleted = 0;
    for_each_blob(backend, ctx, prefix, |meta| {
        deleted += 1;
        async move { backend.delete_blob(ctx, &meta.id).await }
    })
    .await?;
    Ok(deleted)
}
