//! Backend decorator that routes every operation through a [`RetryPolicy`].

use std::collections::HashSet;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use rand::Rng;
use tracing::warn;

use blobkit_common::{
    Backend, BlobId, BlobMetadata, BlobStream, ConnectionInfo, Decision, OpContext, Operation,
    Result, RetryPolicy,
};

/// Retries transient failures of the wrapped backend.
///
/// Listings that fail part-way are restarted from the beginning; ids that
/// were already yielded are suppressed so callers see each blob once.
pub struct RetryingBackend<B> {
    inner: B,
    policy: RetryPolicy,
}

impl<B: Backend> RetryingBackend<B> {
    pub fn new(inner: B, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn into_inner(self) -> B {
        self.inner
    }
}

struct ListState<'a> {
    inner: BlobStream<'a>,
    seen: HashSet<BlobId>,
    /// Consecutive failed attempts since the last yielded item
    attempt: u32,
}

#[async_trait]
impl<B: Backend> Backend for RetryingBackend<B> {
    async fn get_blob(
        &self,
        ctx: &OpContext,
        id: &BlobId,
        offset: u64,
        length: Option<u64>,
    ) -> Result<Bytes> {
        self.policy
            .run(ctx, Operation::on("get_blob", id), |_| {
                self.inner.get_blob(ctx, id, offset, length)
            })
            .await
    }

    async fn get_metadata(&self, ctx: &OpContext, id: &BlobId) -> Result<BlobMetadata> {
        self.policy
            .run(ctx, Operation::on("get_metadata", id), |_| {
                self.inner.get_metadata(ctx, id)
            })
            .await
    }

    async fn put_blob(&self, ctx: &OpContext, id: &BlobId, data: Bytes) -> Result<()> {
        self.policy
            .run(ctx, Operation::on("put_blob", id), |_| {
                // Bytes clones share the buffer.
                self.inner.put_blob(ctx, id, data.clone())
            })
            .await
    }

    async fn delete_blob(&self, ctx: &OpContext, id: &BlobId) -> Result<()> {
        self.policy
            .run(ctx, Operation::on("delete_blob", id), |_| {
                self.inner.delete_blob(ctx, id)
            })
            .await
    }

    fn list_blobs<'a>(&'a self, ctx: &'a OpContext, prefix: &'a str) -> BlobStream<'a> {
        let state = ListState {
            inner: self.inner.list_blobs(ctx, prefix),
            seen: HashSet::new(),
            attempt: 1,
        };

        stream::unfold(Some(state), move |state| async move {
            let mut state = state?;
            loop {
                match state.inner.next().await {
                    None => return None,
                    Some(Ok(meta)) => {
                        if state.seen.insert(meta.id.clone()) {
                            state.attempt = 1;
                            return Some((Ok(meta), Some(state)));
                        }
                    }
                    Some(Err(err)) => {
                        let sample = rand::thread_rng().gen::<f64>();
                        match self.policy.decide(state.attempt, &err, sample) {
                            Decision::Fail => return Some((Err(err), None)),
                            Decision::Retry(delay) => {
                                warn!(
                                    prefix = %prefix,
                                    attempt = state.attempt,
                                    delay_ms = delay.as_millis() as u64,
                                    error = %err,
                                    "Listing failed, restarting"
                                );
                                if let Err(e) = ctx.sleep(delay).await {
                                    return Some((Err(e), None));
                                }
                                state.attempt += 1;
                                state.inner = self.inner.list_blobs(ctx, prefix);
                            }
                        }
                    }
                }
            }
        })
        .boxed()
    }

    fn connection_info(&self) -> ConnectionInfo {
        self.inner.connection_info()
    }

    fn display_name(&self) -> String {
        self.inner.display_name()
    }

    /// Closing is never retried: a second close must report `Closed`.
    async fn close(&self, ctx: &OpContext) -> Result<()> {
        self.inner.close(ctx).await
    }
}
