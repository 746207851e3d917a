//! Backblaze B2 backend adapter.
//!
//! Talks to the B2 native API (v2) over reqwest. Connecting authorizes the
//! account and resolves the bucket id up front, so bad credentials and
//! unknown buckets fail in [`B2Backend::connect`] instead of on first use.

pub(crate) mod api;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use reqwest::header::{AUTHORIZATION, CONTENT_RANGE, CONTENT_TYPE, RANGE};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tokio::sync::RwLock;
use tracing::{debug, info};

use blobkit_common::blob::{prefixed_key, strip_key_prefix};
use blobkit_common::{
    resolve_range, Backend, BlobId, BlobMetadata, BlobStream, ConnectionInfo, Error, OpContext,
    Result,
};

use self::api::{ApiFailure, FileInfo};

pub const BACKEND_TYPE: &str = "b2";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const LIST_PAGE_SIZE: u32 = 1000;
const VERSION_PAGE_SIZE: u32 = 100;

/// Connection options for a B2 bucket.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct B2Options {
    pub bucket: String,
    /// May be left out of config files and supplied from the environment
    #[serde(default)]
    pub key_id: String,
    #[serde(default)]
    pub key: String,
    /// Prepended to every blob id
    #[serde(default)]
    pub prefix: String,
    /// Override for the authorization endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
}

impl std::fmt::Debug for B2Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("B2Options")
            .field("bucket", &self.bucket)
            .field("key_id", &self.key_id)
            .field("key", &"<redacted>")
            .field("prefix", &self.prefix)
            .field("api_url", &self.api_url)
            .finish()
    }
}

impl B2Options {
    pub fn validate(&self) -> Result<()> {
        if self.bucket.is_empty() {
            return Err(Error::InvalidConfiguration("b2 bucket must not be empty".into()));
        }
        if self.key_id.is_empty() || self.key.is_empty() {
            return Err(Error::InvalidConfiguration("b2 key_id and key must not be empty".into()));
        }
        Ok(())
    }

    fn api_url(&self) -> &str {
        self.api_url
            .as_deref()
            .unwrap_or(api::DEFAULT_API_URL)
            .trim_end_matches('/')
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        let mut config = serde_json::json!({
            "bucket": self.bucket,
            "key_id": self.key_id,
            "key": self.key,
            "prefix": self.prefix,
        });
        if let Some(url) = &self.api_url {
            config["api_url"] = serde_json::Value::String(url.clone());
        }
        ConnectionInfo::new(BACKEND_TYPE, config)
    }
}

/// An authorized account plus the resolved bucket.
struct Session {
    account_id: String,
    token: String,
    api_url: String,
    download_url: String,
    bucket_id: String,
    expired: AtomicBool,
}

pub struct B2Backend {
    options: B2Options,
    client: Client,
    /// `None` once closed
    session: RwLock<Option<Arc<Session>>>,
    closed: AtomicBool,
}

impl B2Backend {
    pub async fn connect(ctx: &OpContext, options: B2Options) -> Result<Self> {
        options.validate()?;
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::InvalidConfiguration(format!("Failed to build HTTP client: {}", e)))?;

        let session = authorize(&client, &options, ctx).await?;
        info!(
            bucket = %options.bucket,
            prefix = %options.prefix,
            account = %session.account_id,
            "Connected to B2 bucket"
        );

        Ok(Self {
            options,
            client,
            session: RwLock::new(Some(Arc::new(session))),
            closed: AtomicBool::new(false),
        })
    }

    pub fn options(&self) -> &B2Options {
        &self.options
    }

    /// Current session, re-authorizing first if the token expired.
    async fn session(&self, ctx: &OpContext) -> Result<Arc<Session>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        {
            let guard = self.session.read().await;
            match guard.as_ref() {
                None => return Err(Error::Closed),
                Some(s) if !s.expired.load(Ordering::Acquire) => return Ok(s.clone()),
                Some(_) => {}
            }
        }

        let mut guard = self.session.write().await;
        match guard.as_ref() {
            None => return Err(Error::Closed),
            Some(s) if !s.expired.load(Ordering::Acquire) => return Ok(s.clone()),
            Some(_) => {}
        }
        debug!(bucket = %self.options.bucket, "Re-authorizing expired B2 session");
        let fresh = Arc::new(authorize(&self.client, &self.options, ctx).await?);
        *guard = Some(fresh.clone());
        Ok(fresh)
    }

    async fn fail(&self, session: &Session, resp: reqwest::Response, id: Option<&BlobId>) -> Error {
        let failure = ApiFailure::read(resp).await;
        if failure.is_expired_token() {
            session.expired.store(true, Ordering::Release);
        }
        failure.into_error(id)
    }

    /// POST a JSON request to `/b2api/v2/{op}`.
    async fn call<Req, Resp>(
        &self,
        ctx: &OpContext,
        session: &Session,
        op: &str,
        body: &Req,
        id: Option<&BlobId>,
    ) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned + Send,
    {
        let url = format!("{}/b2api/v2/{}", session.api_url.trim_end_matches('/'), op);
        ctx.run(async {
            let resp = self
                .client
                .post(&url)
                .header(AUTHORIZATION, &session.token)
                .json(body)
                .send()
                .await
                .map_err(|e| api::transport_error(e, op))?;
            if !resp.status().is_success() {
                return Err(self.fail(session, resp, id).await);
            }
            resp.json::<Resp>().await.map_err(|e| api::transport_error(e, op))
        })
        .await
    }

    fn download_url(&self, session: &Session, key: &str) -> String {
        format!(
            "{}/file/{}/{}",
            session.download_url.trim_end_matches('/'),
            urlencoding::encode(&self.options.bucket),
            api::encode_file_name(key)
        )
    }

    fn to_metadata(&self, file: FileInfo) -> Option<BlobMetadata> {
        let id = strip_key_prefix(&self.options.prefix, &file.file_name)?;
        Some(BlobMetadata {
            id,
            length: file.content_length,
            timestamp: DateTime::<Utc>::from_timestamp_millis(file.upload_timestamp).unwrap_or_default(),
        })
    }

    async fn list_page(
        &self,
        ctx: &OpContext,
        full_prefix: &str,
        start: Option<&str>,
    ) -> Result<api::ListFileNamesResponse> {
        let session = self.session(ctx).await?;
        let request = api::ListFileNamesRequest {
            bucket_id: &session.bucket_id,
            prefix: full_prefix,
            start_file_name: start.filter(|s| !s.is_empty()),
            max_file_count: LIST_PAGE_SIZE,
        };
        self.call(ctx, &session, "b2_list_file_names", &request, None).await
    }

    async fn upload(&self, ctx: &OpContext, key: &str, data: Bytes) -> Result<()> {
        let session = self.session(ctx).await?;
        let target: api::GetUploadUrlResponse = self
            .call(
                ctx,
                &session,
                "b2_get_upload_url",
                &api::GetUploadUrlRequest {
                    bucket_id: &session.bucket_id,
                },
                None,
            )
            .await?;

        let sha1 = hex::encode(Sha1::digest(&data));
        ctx.run(async {
            let resp = self
                .client
                .post(&target.upload_url)
                .header(AUTHORIZATION, &target.authorization_token)
                .header("X-Bz-File-Name", api::encode_file_name(key))
                .header(CONTENT_TYPE, "b2/x-auto")
                .header("X-Bz-Content-Sha1", sha1)
                .body(data)
                .send()
                .await
                .map_err(|e| api::transport_error(e, "upload"))?;
            if !resp.status().is_success() {
                // Upload tokens are scoped to the upload URL; never invalidate
                // the account session because of them.
                return Err(ApiFailure::read(resp).await.into_error(None));
            }
            Ok(())
        })
        .await
    }

    /// Fetch a range with a single GET. `Ok(None)` means the server answered
    /// 416 and the range has to be checked against the blob size.
    async fn download(
        &self,
        ctx: &OpContext,
        id: &BlobId,
        offset: u64,
        length: Option<u64>,
    ) -> Result<Option<(StatusCode, Option<u64>, Bytes)>> {
        let session = self.session(ctx).await?;
        let key = prefixed_key(&self.options.prefix, id);
        let url = self.download_url(&session, &key);
        let range = match length {
            None if offset == 0 => None,
            None => Some(format!("bytes={}-", offset)),
            Some(len) => Some(format!("bytes={}-{}", offset, offset + len - 1)),
        };

        ctx.run(async {
            let mut req = self.client.get(&url).header(AUTHORIZATION, &session.token);
            if let Some(range) = &range {
                req = req.header(RANGE, range);
            }
            let resp = req.send().await.map_err(|e| api::transport_error(e, "download"))?;
            let status = resp.status();
            if status == StatusCode::RANGE_NOT_SATISFIABLE {
                return Ok(None);
            }
            if !status.is_success() {
                return Err(self.fail(&session, resp, Some(id)).await);
            }
            let total = resp
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(api::content_range_total);
            let body = resp.bytes().await.map_err(|e| api::transport_error(e, "download"))?;
            Ok(Some((status, total, body)))
        })
        .await
    }
}

/// Authorize the account and resolve the configured bucket.
async fn authorize(client: &Client, options: &B2Options, ctx: &OpContext) -> Result<Session> {
    let url = format!("{}/b2api/v2/b2_authorize_account", options.api_url());
    let auth: api::AuthorizeAccountResponse = ctx
        .run(async {
            let resp = client
                .get(&url)
                .basic_auth(&options.key_id, Some(&options.key))
                .send()
                .await
                .map_err(|e| api::transport_error(e, "authorize"))?;
            if !resp.status().is_success() {
                return Err(ApiFailure::read(resp).await.into_error(None));
            }
            resp.json().await.map_err(|e| api::transport_error(e, "authorize"))
        })
        .await?;

    // Keys restricted to a single bucket only see that bucket.
    if let Some(allowed) = &auth.allowed {
        if let Some(name) = &allowed.bucket_name {
            if name != &options.bucket {
                return Err(Error::InvalidConfiguration(format!(
                    "bucket '{}' not found or not accessible with this key",
                    options.bucket
                )));
            }
            if let Some(bucket_id) = &allowed.bucket_id {
                return Ok(new_session(auth.account_id.clone(), bucket_id.clone(), &auth));
            }
        }
    }

    let list_url = format!("{}/b2api/v2/b2_list_buckets", auth.api_url.trim_end_matches('/'));
    let buckets: api::ListBucketsResponse = ctx
        .run(async {
            let resp = client
                .post(&list_url)
                .header(AUTHORIZATION, &auth.authorization_token)
                .json(&api::ListBucketsRequest {
                    account_id: &auth.account_id,
                    bucket_name: &options.bucket,
                })
                .send()
                .await
                .map_err(|e| api::transport_error(e, "list_buckets"))?;
            if !resp.status().is_success() {
                return Err(ApiFailure::read(resp).await.into_error(None));
            }
            resp.json().await.map_err(|e| api::transport_error(e, "list_buckets"))
        })
        .await?;

    let bucket = buckets
        .buckets
        .into_iter()
        .find(|b| b.bucket_name == options.bucket)
        .ok_or_else(|| Error::InvalidConfiguration(format!("bucket '{}' not found", options.bucket)))?;

    Ok(new_session(auth.account_id.clone(), bucket.bucket_id, &auth))
}

fn new_session(account_id: String, bucket_id: String, auth: &api::AuthorizeAccountResponse) -> Session {
    Session {
        account_id,
        token: auth.authorization_token.clone(),
        api_url: auth.api_url.clone(),
        download_url: auth.download_url.clone(),
        bucket_id,
        expired: AtomicBool::new(false),
    }
}

#[async_trait]
impl Backend for B2Backend {
    async fn get_blob(
        &self,
        ctx: &OpContext,
        id: &BlobId,
        offset: u64,
        length: Option<u64>,
    ) -> Result<Bytes> {
        id.validate()?;

        // Zero-length and overflowing reads never need a body; they only
        // need the size to check the range.
        let needs_size_only = match length {
            Some(0) => true,
            Some(len) => offset.checked_add(len).is_none(),
            None => false,
        };
        if needs_size_only {
            let meta = self.get_metadata(ctx, id).await?;
            resolve_range(id, offset, length, meta.length)?;
            return Ok(Bytes::new());
        }

        let Some((status, total, body)) = self.download(ctx, id, offset, length).await? else {
            let meta = self.get_metadata(ctx, id).await?;
            let range = resolve_range(id, offset, length, meta.length)?;
            if range.is_empty() {
                return Ok(Bytes::new());
            }
            return Err(Error::transient(format!(
                "range not satisfiable for {} although it fits, blob changed while reading",
                id
            )));
        };

        if status == StatusCode::PARTIAL_CONTENT {
            let size = total.unwrap_or(offset + body.len() as u64);
            resolve_range(id, offset, length, size)?;
            debug!(id = %id, offset, bytes = body.len(), "B2 ranged download complete");
            return Ok(body);
        }

        // Full body: the server ignored or did not need the range header.
        let range = resolve_range(id, offset, length, body.len() as u64)?;
        debug!(id = %id, bytes = range.end - range.start, "B2 download complete");
        Ok(body.slice(range.start as usize..range.end as usize))
    }

    async fn get_metadata(&self, ctx: &OpContext, id: &BlobId) -> Result<BlobMetadata> {
        id.validate()?;
        let key = prefixed_key(&self.options.prefix, id);
        let page = self.list_page(ctx, &key, Some(&key)).await?;
        page.files
            .into_iter()
            .find(|f| f.file_name == key && f.is_upload())
            .and_then(|f| self.to_metadata(f))
            .ok_or_else(|| Error::NotFound(id.clone()))
    }

    async fn put_blob(&self, ctx: &OpContext, id: &BlobId, data: Bytes) -> Result<()> {
        id.validate()?;
        let key = prefixed_key(&self.options.prefix, id);
        let len = data.len();
        self.upload(ctx, &key, data).await?;
        debug!(id = %id, bytes = len, "B2 upload complete");
        Ok(())
    }

    async fn delete_blob(&self, ctx: &OpContext, id: &BlobId) -> Result<()> {
        id.validate()?;
        let key = prefixed_key(&self.options.prefix, id);
        let mut start_name = Some(key.clone());
        let mut start_id: Option<String> = None;
        let mut removed = 0;

        loop {
            let session = self.session(ctx).await?;
            let page: api::ListFileVersionsResponse = self
                .call(
                    ctx,
                    &session,
                    "b2_list_file_versions",
                    &api::ListFileVersionsRequest {
                        bucket_id: &session.bucket_id,
                        prefix: &key,
                        start_file_name: start_name.as_deref(),
                        start_file_id: start_id.as_deref(),
                        max_file_count: VERSION_PAGE_SIZE,
                    },
                    None,
                )
                .await?;

            for file in page.files.iter().filter(|f| f.file_name == key) {
                let request = api::DeleteFileVersionRequest {
                    file_name: &file.file_name,
                    file_id: &file.file_id,
                };
                match self
                    .call::<_, serde_json::Value>(ctx, &session, "b2_delete_file_version", &request, Some(id))
                    .await
                {
                    Ok(_) => removed += 1,
                    // Already gone, possibly deleted concurrently.
                    Err(Error::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }

            // Later pages only matter while they still hold versions of this name.
            match page.next_file_name {
                Some(next) if next == key => {
                    start_name = Some(next);
                    start_id = page.next_file_id;
                }
                _ => break,
            }
        }

        debug!(id = %id, versions = removed, "B2 delete complete");
        Ok(())
    }

    fn list_blobs<'a>(&'a self, ctx: &'a OpContext, prefix: &'a str) -> BlobStream<'a> {
        let full_prefix = format!("{}{}", self.options.prefix, prefix);
        // State: where the next page starts, `None` once the listing is done.
        let first = Some(full_prefix.clone());
        stream::try_unfold(first, move |start| {
            let full_prefix = full_prefix.clone();
            async move {
                let Some(start) = start else {
                    return Ok::<_, Error>(None);
                };
                let page = self.list_page(ctx, &full_prefix, Some(&start)).await?;
                let items: Vec<BlobMetadata> = page
                    .files
                    .into_iter()
                    .filter(|f| f.is_upload())
                    .filter_map(|f| self.to_metadata(f))
                    .collect();
                Ok(Some((items, page.next_file_name)))
            }
        })
        .map_ok(|items| stream::iter(items.into_iter().map(Ok::<_, Error>)))
        .try_flatten()
        .boxed()
    }

    fn connection_info(&self) -> ConnectionInfo {
        self.options.connection_info()
    }

    fn display_name(&self) -> String {
        format!("b2://{}/{}", self.options.bucket, self.options.prefix)
    }

    async fn close(&self, _ctx: &OpContext) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Closed);
        }
        self.session.write().await.take();
        info!(bucket = %self.options.bucket, "B2 backend closed");
        Ok(())
    }
}
