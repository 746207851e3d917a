//! In-process stand-in for the B2 native API, enough of it for the backend
//! client: authorization, bucket lookup, upload, name and version listing,
//! version delete and ranged download.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use sha1::{Digest, Sha1};

use blobkit_backends::B2Options;

pub const KEY_ID: &str = "fake-key-id";
pub const KEY: &str = "fake-application-key";
pub const BUCKET: &str = "fake-bucket";
const BUCKET_ID: &str = "bucket-0001";
const ACCOUNT_ID: &str = "account-0001";
const UPLOAD_TOKEN: &str = "upload-token";

struct Version {
    file_id: String,
    data: Bytes,
    uploaded_ms: i64,
}

#[derive(Default)]
struct Inner {
    /// name -> versions, newest last
    files: BTreeMap<String, Vec<Version>>,
    tokens: Vec<String>,
    injected: VecDeque<(StatusCode, &'static str)>,
    authorizations: u64,
    bucket_lookups: u64,
    /// Issue keys restricted to `BUCKET`
    restricted: bool,
}

struct FakeState {
    base_url: String,
    /// Upper bound on `maxFileCount` so paging is always exercised
    page_limit: usize,
    next_id: AtomicU64,
    inner: Mutex<Inner>,
}

pub struct FakeB2 {
    pub url: String,
    state: Arc<FakeState>,
}

impl FakeB2 {
    pub async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let state = Arc::new(FakeState {
            base_url: url.clone(),
            page_limit: 2,
            next_id: AtomicU64::new(1),
            inner: Mutex::new(Inner::default()),
        });

        let app = Router::new()
            .route("/b2api/v2/b2_authorize_account", get(authorize_account))
            .route("/b2api/v2/b2_list_buckets", post(list_buckets))
            .route("/b2api/v2/b2_get_upload_url", post(get_upload_url))
            .route("/b2api/v2/b2_list_file_names", post(list_file_names))
            .route("/b2api/v2/b2_list_file_versions", post(list_file_versions))
            .route("/b2api/v2/b2_delete_file_version", post(delete_file_version))
            .route("/upload/{bucket_id}", post(upload))
            .route("/file/{bucket}/{*name}", get(download))
            .with_state(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { url, state }
    }

    pub fn options(&self, prefix: &str) -> B2Options {
        B2Options {
            bucket: BUCKET.into(),
            key_id: KEY_ID.into(),
            key: KEY.into(),
            prefix: prefix.into(),
            api_url: Some(self.url.clone()),
        }
    }

    /// Fail the next `count` requests (any endpoint) with `status`.
    pub fn fail_next(&self, count: usize, status: StatusCode) {
        let code = match status.as_u16() {
            429 => "too_many_requests",
            500 => "internal_error",
            _ => "service_unavailable",
        };
        let mut inner = self.state.inner.lock().unwrap();
        for _ in 0..count {
            inner.injected.push_back((status, code));
        }
    }

    /// Invalidate every issued account token.
    pub fn expire_tokens(&self) {
        self.state.inner.lock().unwrap().tokens.clear();
    }

    pub fn authorizations(&self) -> u64 {
        self.state.inner.lock().unwrap().authorizations
    }

    /// From now on, authorize as an application key limited to `BUCKET`.
    pub fn restrict_key(&self) {
        self.state.inner.lock().unwrap().restricted = true;
    }

    pub fn bucket_lookups(&self) -> u64 {
        self.state.inner.lock().unwrap().bucket_lookups
    }

    /// Stored versions of `name`, the full storage key.
    pub fn version_count(&self, name: &str) -> usize {
        self.state
            .inner
            .lock()
            .unwrap()
            .files
            .get(name)
            .map_or(0, |v| v.len())
    }
}

fn error(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(json!({ "status": status.as_u16(), "code": code, "message": message })),
    )
        .into_response()
}

impl FakeState {
    fn take_injected(&self) -> Option<Response> {
        let (status, code) = self.inner.lock().unwrap().injected.pop_front()?;
        Some(error(status, code, "injected failure"))
    }

    /// Injected failures first, then token validity.
    fn check(&self, headers: &HeaderMap) -> Result<(), Response> {
        if let Some(resp) = self.take_injected() {
            return Err(resp);
        }
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let inner = self.inner.lock().unwrap();
        if inner.tokens.iter().any(|t| t == token) {
            Ok(())
        } else if token.starts_with("account-token-") {
            Err(error(StatusCode::UNAUTHORIZED, "expired_auth_token", "token expired"))
        } else {
            Err(error(StatusCode::UNAUTHORIZED, "bad_auth_token", "invalid token"))
        }
    }

    fn new_file_id(&self) -> String {
        format!("4_z{:08}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

fn file_json(name: &str, version: &Version) -> serde_json::Value {
    json!({
        "fileId": version.file_id,
        "fileName": name,
        "contentLength": version.data.len(),
        "uploadTimestamp": version.uploaded_ms,
        "action": "upload",
    })
}

async fn authorize_account(State(state): State<Arc<FakeState>>, headers: HeaderMap) -> Response {
    if let Some(resp) = state.take_injected() {
        return resp;
    }
    let expected = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", KEY_ID, KEY));
    let supplied = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .unwrap_or_default();
    if supplied != expected {
        return error(StatusCode::UNAUTHORIZED, "unauthorized", "bad key id or key");
    }

    let mut inner = state.inner.lock().unwrap();
    inner.authorizations += 1;
    let token = format!("account-token-{}", inner.authorizations);
    inner.tokens.push(token.clone());
    let allowed = if inner.restricted {
        json!({ "bucketId": BUCKET_ID, "bucketName": BUCKET, "capabilities": ["readFiles", "writeFiles"] })
    } else {
        json!({ "bucketId": null, "bucketName": null, "capabilities": ["listBuckets"] })
    };
    Json(json!({
        "accountId": ACCOUNT_ID,
        "authorizationToken": token,
        "apiUrl": state.base_url,
        "downloadUrl": state.base_url,
        "allowed": allowed,
    }))
    .into_response()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListBuckets {
    account_id: String,
    bucket_name: Option<String>,
}

async fn list_buckets(
    State(state): State<Arc<FakeState>>,
    headers: HeaderMap,
    Json(req): Json<ListBuckets>,
) -> Response {
    if let Err(resp) = state.check(&headers) {
        return resp;
    }
    state.inner.lock().unwrap().bucket_lookups += 1;
    if req.account_id != ACCOUNT_ID {
        return error(StatusCode::UNAUTHORIZED, "unauthorized", "wrong account");
    }
    let buckets = match req.bucket_name.as_deref() {
        Some(BUCKET) | None => vec![json!({ "bucketId": BUCKET_ID, "bucketName": BUCKET })],
        Some(_) => vec![],
    };
    Json(json!({ "buckets": buckets })).into_response()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BucketRequest {
    bucket_id: String,
}

async fn get_upload_url(
    State(state): State<Arc<FakeState>>,
    headers: HeaderMap,
    Json(req): Json<BucketRequest>,
) -> Response {
    if let Err(resp) = state.check(&headers) {
        return resp;
    }
    if req.bucket_id != BUCKET_ID {
        return error(StatusCode::BAD_REQUEST, "bad_bucket_id", "unknown bucket");
    }
    Json(json!({
        "bucketId": BUCKET_ID,
        "uploadUrl": format!("{}/upload/{}", state.base_url, BUCKET_ID),
        "authorizationToken": UPLOAD_TOKEN,
    }))
    .into_response()
}

async fn upload(
    State(state): State<Arc<FakeState>>,
    Path(bucket_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(resp) = state.take_injected() {
        return resp;
    }
    let header_str = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or_default();
    if header_str("authorization") != UPLOAD_TOKEN || bucket_id != BUCKET_ID {
        return error(StatusCode::UNAUTHORIZED, "bad_auth_token", "invalid upload token");
    }
    let name = match urlencoding::decode(header_str("x-bz-file-name")) {
        Ok(name) if !name.is_empty() => name.into_owned(),
        _ => return error(StatusCode::BAD_REQUEST, "bad_request", "missing file name"),
    };
    if header_str("x-bz-content-sha1") != hex::encode(Sha1::digest(&body)) {
        return error(StatusCode::BAD_REQUEST, "bad_request", "sha1 mismatch");
    }

    let version = Version {
        file_id: state.new_file_id(),
        data: body,
        uploaded_ms: chrono::Utc::now().timestamp_millis(),
    };
    let resp = file_json(&name, &version);
    state.inner.lock().unwrap().files.entry(name).or_default().push(version);
    Json(resp).into_response()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListRequest {
    bucket_id: String,
    #[serde(default)]
    prefix: String,
    start_file_name: Option<String>,
    start_file_id: Option<String>,
    max_file_count: Option<usize>,
}

impl FakeState {
    fn page_size(&self, req: &ListRequest) -> usize {
        req.max_file_count.unwrap_or(100).clamp(1, self.page_limit)
    }
}

async fn list_file_names(
    State(state): State<Arc<FakeState>>,
    headers: HeaderMap,
    Json(req): Json<ListRequest>,
) -> Response {
    if let Err(resp) = state.check(&headers) {
        return resp;
    }
    if req.bucket_id != BUCKET_ID {
        return error(StatusCode::BAD_REQUEST, "bad_bucket_id", "unknown bucket");
    }
    let limit = state.page_size(&req);
    let start = req.start_file_name.clone().unwrap_or_default();
    let inner = state.inner.lock().unwrap();
    let mut names = inner
        .files
        .range(start..)
        .filter(|(name, versions)| name.starts_with(&req.prefix) && !versions.is_empty());

    let files: Vec<_> = names
        .by_ref()
        .take(limit)
        .filter_map(|(name, versions)| versions.last().map(|v| file_json(name, v)))
        .collect();
    let next = names.next().map(|(name, _)| name.clone());
    Json(json!({ "files": files, "nextFileName": next })).into_response()
}

async fn list_file_versions(
    State(state): State<Arc<FakeState>>,
    headers: HeaderMap,
    Json(req): Json<ListRequest>,
) -> Response {
    if let Err(resp) = state.check(&headers) {
        return resp;
    }
    if req.bucket_id != BUCKET_ID {
        return error(StatusCode::BAD_REQUEST, "bad_bucket_id", "unknown bucket");
    }
    let limit = state.page_size(&req);
    let start = req.start_file_name.clone().unwrap_or_default();
    let inner = state.inner.lock().unwrap();

    // Newest version first within a name, like the real service.
    let mut all = inner
        .files
        .range(start.clone()..)
        .filter(|(name, _)| name.starts_with(&req.prefix))
        .flat_map(|(name, versions)| versions.iter().rev().map(move |v| (name, v)))
        .skip_while(|(name, v)| match &req.start_file_id {
            Some(id) => **name == start && &v.file_id != id,
            None => false,
        });

    let files: Vec<_> = all.by_ref().take(limit).map(|(name, v)| file_json(name, v)).collect();
    let (next_name, next_id) = match all.next() {
        Some((name, v)) => (Some(name.clone()), Some(v.file_id.clone())),
        None => (None, None),
    };
    Json(json!({ "files": files, "nextFileName": next_name, "nextFileId": next_id })).into_response()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteVersion {
    file_name: String,
    file_id: String,
}

async fn delete_file_version(
    State(state): State<Arc<FakeState>>,
    headers: HeaderMap,
    Json(req): Json<DeleteVersion>,
) -> Response {
    if let Err(resp) = state.check(&headers) {
        return resp;
    }
    let mut inner = state.inner.lock().unwrap();
    let Some(versions) = inner.files.get_mut(&req.file_name) else {
        return error(StatusCode::BAD_REQUEST, "file_not_present", "no such file");
    };
    let before = versions.len();
    versions.retain(|v| v.file_id != req.file_id);
    if versions.len() == before {
        return error(StatusCode::BAD_REQUEST, "file_not_present", "no such version");
    }
    if versions.is_empty() {
        inner.files.remove(&req.file_name);
    }
    Json(json!({ "fileId": req.file_id, "fileName": req.file_name })).into_response()
}

/// `bytes=a-b` or `bytes=a-`.
fn parse_range(value: &str) -> Option<(u64, Option<u64>)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    let start = start.parse().ok()?;
    let end = if end.is_empty() { None } else { Some(end.parse().ok()?) };
    Some((start, end))
}

async fn download(
    State(state): State<Arc<FakeState>>,
    Path((bucket, name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = state.check(&headers) {
        return resp;
    }
    if bucket != BUCKET {
        return error(StatusCode::NOT_FOUND, "not_found", "bucket not found");
    }
    let data = {
        let inner = state.inner.lock().unwrap();
        match inner.files.get(&name).and_then(|v| v.last()) {
            Some(v) => v.data.clone(),
            None => return error(StatusCode::NOT_FOUND, "not_found", "file not found"),
        }
    };
    let size = data.len() as u64;

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(parse_range);
    match range {
        None => (StatusCode::OK, data).into_response(),
        Some(None) => error(StatusCode::BAD_REQUEST, "bad_request", "malformed range"),
        Some(Some((start, end))) => {
            if start >= size {
                return (
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    [(header::CONTENT_RANGE, format!("bytes */{}", size))],
                    Json(json!({ "status": 416, "code": "range_not_satisfiable", "message": "bad range" })),
                )
                    .into_response();
            }
            let last = end.map_or(size - 1, |e| e.min(size - 1));
            (
                StatusCode::PARTIAL_CONTENT,
                [(header::CONTENT_RANGE, format!("bytes {}-{}/{}", start, last, size))],
                data.slice(start as usize..=last as usize),
            )
                .into_response()
        }
    }
}
