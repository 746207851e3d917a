//! B2 native API wire types and error mapping.

use std::time::Duration;

use blobkit_common::{BlobId, Error};
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};

pub const DEFAULT_API_URL: &str = "https://api.backblazeb2.com";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeAccountResponse {
    pub account_id: String,
    pub authorization_token: String,
    pub api_url: String,
    pub download_url: String,
    #[serde(default)]
    pub allowed: Option<Allowed>,
}

/// Restrictions attached to the application key.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Allowed {
    pub bucket_id: Option<String>,
    pub bucket_name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListBucketsRequest<'a> {
    pub account_id: &'a str,
    pub bucket_name: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct ListBucketsResponse {
    pub buckets: Vec<Bucket>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    pub bucket_id: String,
    pub bucket_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetUploadUrlRequest<'a> {
    pub bucket_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetUploadUrlResponse {
    pub upload_url: String,
    pub authorization_token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFileNamesRequest<'a> {
    pub bucket_id: &'a str,
    pub prefix: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_file_name: Option<&'a str>,
    pub max_file_count: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFileNamesResponse {
    pub files: Vec<FileInfo>,
    pub next_file_name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFileVersionsRequest<'a> {
    pub bucket_id: &'a str,
    pub prefix: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_file_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_file_id: Option<&'a str>,
    pub max_file_count: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFileVersionsResponse {
    pub files: Vec<FileInfo>,
    pub next_file_name: Option<String>,
    pub next_file_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteFileVersionRequest<'a> {
    pub file_name: &'a str,
    pub file_id: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub file_id: String,
    pub file_name: String,
    #[serde(default)]
    pub content_length: u64,
    #[serde(default)]
    pub upload_timestamp: i64,
    /// "upload", "hide", "start" or "folder"
    pub action: String,
}

impl FileInfo {
    pub fn is_upload(&self) -> bool {
        self.action == "upload"
    }
}

/// Error document returned with every non-2xx response. Its `status`
/// repeats the HTTP status and is not kept.
#[derive(Debug, Default, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// A failed API response, read off the wire.
#[derive(Debug)]
pub struct ApiFailure {
    pub status: StatusCode,
    pub body: ErrorBody,
    pub retry_after: Option<Duration>,
}

impl ApiFailure {
    pub async fn read(resp: Response) -> Self {
        let status = resp.status();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let text = resp.text().await.unwrap_or_default();
        let body = serde_json::from_str(&text).unwrap_or_else(|_| ErrorBody {
            code: String::new(),
            message: text,
        });
        Self {
            status,
            body,
            retry_after,
        }
    }

    pub fn is_expired_token(&self) -> bool {
        self.status == StatusCode::UNAUTHORIZED && self.body.code == "expired_auth_token"
    }

    /// Map the failure onto the error taxonomy. `id` is the blob the
    /// request was about, if any; a 404 without one means the bucket or
    /// endpoint is wrong rather than a missing blob.
    pub fn into_error(self, id: Option<&BlobId>) -> Error {
        let detail = if self.body.code.is_empty() {
            format!("HTTP {} - {}", self.status, self.body.message)
        } else {
            format!("HTTP {} {} - {}", self.status, self.body.code, self.body.message)
        };

        match (self.status.as_u16(), self.body.code.as_str()) {
            (_, "file_not_present") | (_, "file_not_found") | (404, _) => match id {
                Some(id) => Error::NotFound(id.clone()),
                None => Error::InvalidConfiguration(detail),
            },
            (400, "bad_bucket_id") => Error::InvalidConfiguration(detail),
            (400, _) => Error::InvalidRequest(detail),
            (401, "expired_auth_token") => Error::Transient {
                message: detail,
                retry_after: None,
            },
            (401, _) | (403, "access_denied") | (403, "unauthorized") => Error::Authentication(detail),
            (403, _) => Error::InvalidRequest(detail),
            (408, _) | (429, _) | (500..=599, _) => Error::Transient {
                message: detail,
                retry_after: self.retry_after,
            },
            (416, _) => Error::InvalidRequest(detail),
            _ => Error::Unknown(detail),
        }
    }
}

/// Classify a transport-level failure (no HTTP response, or a body that
/// could not be read).
pub fn transport_error(err: reqwest::Error, op: &str) -> Error {
    let message = format!("B2 {} failed: {}", op, err);
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        Error::transient(message)
    } else {
        Error::Unknown(message)
    }
}

/// Percent-encode a file name for URLs and the `X-Bz-File-Name` header.
/// Slashes are kept so hierarchical names stay readable on the wire.
pub fn encode_file_name(name: &str) -> String {
    name.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Total object size from a `Content-Range: bytes a-b/size` header.
pub fn content_range_total(header: &str) -> Option<u64> {
    header.rsplit_once('/')?.1.trim().parse().ok()
}
