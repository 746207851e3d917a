//! Backend wrappers that misbehave on purpose.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};

use blobkit_common::{
    Backend, BlobId, BlobMetadata, BlobStream, ConnectionInfo, Error, OpContext, Result,
};

/// Fails the next N operations with a transient error. A failing listing
/// yields its first item before erroring, so restarts are observable.
pub struct FlakyBackend<B> {
    pub inner: B,
    pending_failures: AtomicU32,
    calls: AtomicU32,
}

impl<B: Backend> FlakyBackend<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            pending_failures: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        }
    }

    pub fn fail_next(&self, count: u32) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn trip(&self) -> Result<()> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let tripped = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if tripped {
            Err(Error::transient(format!("injected failure {}", n)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl<B: Backend> Backend for FlakyBackend<B> {
    async fn get_blob(&self, ctx: &OpContext, id: &BlobId, offset: u64, length: Option<u64>) -> Result<Bytes> {
        self.trip()?;
        self.inner.get_blob(ctx, id, offset, length).await
    }

    async fn get_metadata(&self, ctx: &OpContext, id: &BlobId) -> Result<BlobMetadata> {
        self.trip()?;
        self.inner.get_metadata(ctx, id).await
    }

    async fn put_blob(&self, ctx: &OpContext, id: &BlobId, data: Bytes) -> Result<()> {
        self.trip()?;
        self.inner.put_blob(ctx, id, data).await
    }

    async fn delete_blob(&self, ctx: &OpContext, id: &BlobId) -> Result<()> {
        self.trip()?;
        self.inner.delete_blob(ctx, id).await
    }

    fn list_blobs<'a>(&'a self, ctx: &'a OpContext, prefix: &'a str) -> BlobStream<'a> {
        let inner = self.inner.list_blobs(ctx, prefix);
        match self.trip() {
            Ok(()) => inner,
            Err(e) => inner.take(1).chain(stream::once(async move { Err(e) })).boxed(),
        }
    }

    fn connection_info(&self) -> ConnectionInfo {
        self.inner.connection_info()
    }

    fn display_name(&self) -> String {
        format!("flaky({})", self.inner.display_name())
    }

    async fn close(&self, ctx: &OpContext) -> Result<()> {
        self.inner.close(ctx).await
    }
}

/// Eventually consistent view: a freshly written blob stays invisible to
/// the next `lag` reads and listings that would have seen it.
pub struct LaggyBackend<B> {
    inner: B,
    lag: u32,
    hidden: Mutex<HashMap<BlobId, u32>>,
}

impl<B: Backend> LaggyBackend<B> {
    pub fn new(inner: B, lag: u32) -> Self {
        Self {
            inner,
            lag,
            hidden: Mutex::new(HashMap::new()),
        }
    }

    /// True while `id` should still look absent; each call uses up one
    /// observation.
    fn still_hidden(&self, id: &BlobId) -> bool {
        let mut hidden = self.hidden.lock().unwrap();
        match hidden.get_mut(id) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            Some(_) => {
                hidden.remove(id);
                false
            }
            None => false,
        }
    }
}

#[async_trait]
impl<B: Backend> Backend for LaggyBackend<B> {
    async fn get_blob(&self, ctx: &OpContext, id: &BlobId, offset: u64, length: Option<u64>) -> Result<Bytes> {
        if self.still_hidden(id) {
            return Err(Error::NotFound(id.clone()));
        }
        self.inner.get_blob(ctx, id, offset, length).await
    }

    async fn get_metadata(&self, ctx: &OpContext, id: &BlobId) -> Result<BlobMetadata> {
        if self.still_hidden(id) {
            return Err(Error::NotFound(id.clone()));
        }
        self.inner.get_metadata(ctx, id).await
    }

    async fn put_blob(&self, ctx: &OpContext, id: &BlobId, data: Bytes) -> Result<()> {
        self.inner.put_blob(ctx, id, data).await?;
        self.hidden.lock().unwrap().insert(id.clone(), self.lag);
        Ok(())
    }

    async fn delete_blob(&self, ctx: &OpContext, id: &BlobId) -> Result<()> {
        self.hidden.lock().unwrap().remove(id);
        self.inner.delete_blob(ctx, id).await
    }

    fn list_blobs<'a>(&'a self, ctx: &'a OpContext, prefix: &'a str) -> BlobStream<'a> {
        self.inner
            .list_blobs(ctx, prefix)
            .filter(move |item| {
                let visible = match item {
                    Ok(meta) => !self.still_hidden(&meta.id),
                    Err(_) => true,
                };
                async move { visible }
            })
            .boxed()
    }

    fn connection_info(&self) -> ConnectionInfo {
        self.inner.connection_info()
    }

    fn display_name(&self) -> String {
        format!("laggy({})", self.inner.display_name())
    }

    async fn close(&self, ctx: &OpContext) -> Result<()> {
        self.inner.close(ctx).await
    }
}

/// Keeps serving a deleted blob's last content for the next `reads` gets.
pub struct StaleReadBackend<B> {
    inner: B,
    reads: u32,
    ghosts: Mutex<HashMap<BlobId, (Bytes, u32)>>,
}

impl<B: Backend> StaleReadBackend<B> {
    pub fn new(inner: B, reads: u32) -> Self {
        Self {
            inner,
            reads,
            ghosts: Mutex::new(HashMap::new()),
        }
    }

    fn ghost(&self, id: &BlobId) -> Option<Bytes> {
        let mut ghosts = self.ghosts.lock().unwrap();
        let (data, left) = ghosts.get_mut(id)?;
        if *left == 0 {
            ghosts.remove(id);
            return None;
        }
        *left -= 1;
        Some(data.clone())
    }
}

#[async_trait]
impl<B: Backend> Backend for StaleReadBackend<B> {
    async fn get_blob(&self, ctx: &OpContext, id: &BlobId, offset: u64, length: Option<u64>) -> Result<Bytes> {
        if let Some(data) = self.ghost(id) {
            return Ok(data);
        }
        self.inner.get_blob(ctx, id, offset, length).await
    }

    async fn get_metadata(&self, ctx: &OpContext, id: &BlobId) -> Result<BlobMetadata> {
        self.inner.get_metadata(ctx, id).await
    }

    async fn put_blob(&self, ctx: &OpContext, id: &BlobId, data: Bytes) -> Result<()> {
        self.ghosts.lock().unwrap().remove(id);
        self.inner.put_blob(ctx, id, data).await
    }

    async fn delete_blob(&self, ctx: &OpContext, id: &BlobId) -> Result<()> {
        if let Ok(data) = self.inner.get_blob(ctx, id, 0, None).await {
            self.ghosts.lock().unwrap().insert(id.clone(), (data, self.reads));
        }
        self.inner.delete_blob(ctx, id).await
    }

    fn list_blobs<'a>(&'a self, ctx: &'a OpContext, prefix: &'a str) -> BlobStream<'a> {
        self.inner.list_blobs(ctx, prefix)
    }

    fn connection_info(&self) -> ConnectionInfo {
        self.inner.connection_info()
    }

    fn display_name(&self) -> String {
        format!("stale({})", self.inner.display_name())
    }

    async fn close(&self, ctx: &OpContext) -> Result<()> {
        self.inner.close(ctx).await
    }
}
