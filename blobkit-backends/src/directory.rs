//! Local directory backend adapter.
//!
//! Stores blobs as files under a base directory; `/` in blob ids becomes a
//! directory separator. Uses atomic write (temp file → fsync → rename) so a
//! reader never observes a partially written blob.
//!
//! An id cannot be both a blob and the parent of another blob: with `c`
//! stored, `put c/d` fails with `InvalidRequest`, and vice versa. Deleting
//! a nested blob removes the directories it leaves empty.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

use blobkit_common::blob::{prefixed_key, strip_key_prefix};
use blobkit_common::{
    resolve_range, Backend, BlobId, BlobMetadata, BlobStream, ConnectionInfo, Error, OpContext,
    Result,
};

pub const BACKEND_TYPE: &str = "filesystem";

/// Suffix of in-flight uploads; such files are never listed.
const TMP_SUFFIX: &str = ".blobkit-tmp";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryOptions {
    pub path: PathBuf,
    #[serde(default)]
    pub prefix: String,
}

impl DirectoryOptions {
    pub fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo::new(
            BACKEND_TYPE,
            serde_json::json!({
                "path": self.path.to_string_lossy(),
                "prefix": self.prefix,
            }),
        )
    }
}

pub struct DirectoryBackend {
    options: DirectoryOptions,
    closed: AtomicBool,
}

impl DirectoryBackend {
    /// Open a backend rooted at an existing directory.
    pub async fn connect(ctx: &OpContext, options: DirectoryOptions) -> Result<Self> {
        ctx.check()?;
        let meta = match tokio::fs::metadata(&options.path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::InvalidConfiguration(format!(
                    "directory {} does not exist",
                    options.path.display()
                )));
            }
            Err(e) => return Err(Error::from_io(e, "Failed to stat base directory")),
        };
        if !meta.is_dir() {
            return Err(Error::InvalidConfiguration(format!(
                "{} is not a directory",
                options.path.display()
            )));
        }
        info!(path = %options.path.display(), prefix = %options.prefix, "Opened directory backend");
        Ok(Self {
            options,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Map a blob id onto a path under the base directory.
    fn full_path(&self, id: &BlobId) -> Result<PathBuf> {
        id.validate()?;
        let key = prefixed_key(&self.options.prefix, id);
        if key.starts_with('/') || key.ends_with(TMP_SUFFIX) {
            return Err(Error::InvalidRequest(format!("blob id not storable on a filesystem: {}", id)));
        }
        let mut path = self.options.path.clone();
        for segment in key.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(Error::InvalidRequest(format!(
                    "blob id not storable on a filesystem: {}",
                    id
                )));
            }
            path.push(segment);
        }
        Ok(path)
    }

    async fn read_range(&self, path: &Path, id: &BlobId, offset: u64, length: Option<u64>) -> Result<Bytes> {
        let mut file = match tokio::fs::File::open(path).await {
            Ok(f) => f,
            Err(e) if is_missing(&e) => return Err(Error::NotFound(id.clone())),
            Err(e) => return Err(Error::from_io(e, "Failed to open blob")),
        };
        let meta = file
            .metadata()
            .await
            .map_err(|e| Error::from_io(e, "Failed to stat blob"))?;
        if !meta.is_file() {
            return Err(Error::NotFound(id.clone()));
        }

        let range = resolve_range(id, offset, length, meta.len())?;
        let mut buf = vec![0u8; (range.end - range.start) as usize];
        if !buf.is_empty() {
            file.seek(std::io::SeekFrom::Start(range.start))
                .await
                .map_err(|e| Error::from_io(e, "Failed to seek blob"))?;
            file.read_exact(&mut buf)
                .await
                .map_err(|e| Error::from_io(e, "Failed to read blob"))?;
        }
        Ok(Bytes::from(buf))
    }

    /// Fail with `InvalidRequest` when `dest` or one of its parents below
    /// the base is occupied by the wrong kind of entry.
    async fn check_collision(&self, id: &BlobId, dest: &Path) -> Result<()> {
        let base = &self.options.path;
        let mut dir = dest.parent();
        while let Some(current) = dir.filter(|d| d.starts_with(base) && *d != base.as_path()) {
            match tokio::fs::metadata(current).await {
                Ok(meta) if !meta.is_dir() => {
                    return Err(Error::InvalidRequest(format!(
                        "blob id {} is nested under an existing blob",
                        id
                    )));
                }
                Ok(_) => break,
                Err(e) if is_missing(&e) => dir = current.parent(),
                Err(e) => return Err(Error::from_io(e, "Failed to stat parent directory")),
            }
        }
        match tokio::fs::metadata(dest).await {
            Ok(meta) if meta.is_dir() => Err(Error::InvalidRequest(format!(
                "blob id {} is a parent of existing blobs",
                id
            ))),
            Ok(_) => Ok(()),
            Err(e) if is_missing(&e) => Ok(()),
            Err(e) => Err(Error::from_io(e, "Failed to stat blob")),
        }
    }

    async fn write_atomic(&self, id: &BlobId, dest: &Path, data: &[u8]) -> Result<()> {
        self.check_collision(id, dest).await?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::from_io(e, "Failed to create parent directory"))?;
        }

        // Unique temp name so concurrent writers of one id never share a file.
        let file_name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp_path = dest.with_file_name(format!(
            "{}.{}{}",
            file_name,
            uuid::Uuid::new_v4().simple(),
            TMP_SUFFIX
        ));

        let result = async {
            let mut file = match tokio::fs::File::create(&tmp_path).await {
                Ok(file) => file,
                // A concurrent delete may have pruned the parent we just made.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    if let Some(parent) = dest.parent() {
                        tokio::fs::create_dir_all(parent)
                            .await
                            .map_err(|e| Error::from_io(e, "Failed to create parent directory"))?;
                    }
                    tokio::fs::File::create(&tmp_path)
                        .await
                        .map_err(|e| Error::from_io(e, "Failed to create temp file"))?
                }
                Err(e) => return Err(Error::from_io(e, "Failed to create temp file")),
            };
            file.write_all(data)
                .await
                .map_err(|e| Error::from_io(e, "Failed to write temp file"))?;
            file.sync_all()
                .await
                .map_err(|e| Error::from_io(e, "fsync failed"))?;
            drop(file);
            tokio::fs::rename(&tmp_path, dest)
                .await
                .map_err(|e| Error::from_io(e, "Atomic rename failed"))
        }
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp_path).await;
        }
        result
    }

    /// Remove directories emptied by deleting `path`, stopping at the base
    /// or the first directory that still has entries.
    async fn prune_empty_parents(&self, path: &Path) {
        let base = &self.options.path;
        let mut dir = path.parent();
        while let Some(current) = dir.filter(|d| d.starts_with(base) && *d != base.as_path()) {
            if tokio::fs::remove_dir(current).await.is_err() {
                break;
            }
            dir = current.parent();
        }
    }

    /// Walk the part of the tree that can hold keys starting with `full_prefix`.
    async fn scan(&self, full_prefix: &str) -> Result<Vec<BlobMetadata>> {
        let base = &self.options.path;
        let search_dir = match full_prefix.rfind('/') {
            Some(idx) => {
                let dir = &full_prefix[..idx];
                if dir.starts_with('/') || dir.split('/').any(|s| s == "..") {
                    return Err(Error::InvalidRequest(format!(
                        "listing prefix escapes the base directory: {}",
                        full_prefix
                    )));
                }
                base.join(dir)
            }
            None => base.clone(),
        };

        let mut blobs = Vec::new();
        let mut stack = vec![search_dir];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if is_missing(&e) => continue,
                Err(e) => return Err(Error::from_io(e, "Failed to read directory")),
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Error::from_io(e, "Failed to read directory entry"))?
            {
                let path = entry.path();
                // Entries can vanish while we walk (concurrent deletes).
                let meta = match entry.metadata().await {
                    Ok(meta) => meta,
                    Err(e) if is_missing(&e) => continue,
                    Err(e) => return Err(Error::from_io(e, "Failed to stat directory entry")),
                };

                if meta.is_dir() {
                    stack.push(path);
                    continue;
                }
                if !meta.is_file() {
                    continue;
                }

                let Some(key) = relative_key(base, &path) else {
                    debug!(path = %path.display(), "Skipping file with a non UTF-8 name");
                    continue;
                };
                if key.ends_with(TMP_SUFFIX) || !key.starts_with(full_prefix) {
                    continue;
                }
                if let Some(id) = strip_key_prefix(&self.options.prefix, &key) {
                    blobs.push(BlobMetadata {
                        id,
                        length: meta.len(),
                        timestamp: modified_time(&meta),
                    });
                }
            }
        }

        blobs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(blobs)
    }
}

fn is_missing(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory
    )
}

/// Key of `path` relative to `base`, always `/`-separated.
fn relative_key(base: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(base).ok()?;
    let parts: Vec<&str> = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<_>>()?;
    Some(parts.join("/"))
}

fn modified_time(meta: &std::fs::Metadata) -> DateTime<Utc> {
    meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl Backend for DirectoryBackend {
    async fn get_blob(
        &self,
        ctx: &OpContext,
        id: &BlobId,
        offset: u64,
        length: Option<u64>,
    ) -> Result<Bytes> {
        self.ensure_open()?;
        let path = self.full_path(id)?;
        ctx.run(self.read_range(&path, id, offset, length)).await
    }

    async fn get_metadata(&self, ctx: &OpContext, id: &BlobId) -> Result<BlobMetadata> {
        self.ensure_open()?;
        let path = self.full_path(id)?;
        let meta = ctx
            .run(async {
                match tokio::fs::metadata(&path).await {
                    Ok(meta) if meta.is_file() => Ok(meta),
                    Ok(_) => Err(Error::NotFound(id.clone())),
                    Err(e) if is_missing(&e) => Err(Error::NotFound(id.clone())),
                    Err(e) => Err(Error::from_io(e, "Failed to stat blob")),
                }
            })
            .await?;
        Ok(BlobMetadata {
            id: id.clone(),
            length: meta.len(),
            timestamp: modified_time(&meta),
        })
    }

    async fn put_blob(&self, ctx: &OpContext, id: &BlobId, data: Bytes) -> Result<()> {
        self.ensure_open()?;
        let dest = self.full_path(id)?;
        ctx.run(self.write_atomic(id, &dest, &data)).await?;
        debug!(id = %id, bytes = data.len(), "Directory upload complete");
        Ok(())
    }

    async fn delete_blob(&self, ctx: &OpContext, id: &BlobId) -> Result<()> {
        self.ensure_open()?;
        let path = self.full_path(id)?;
        ctx.run(async {
            // A directory is only ever the parent of other blobs.
            if tokio::fs::metadata(&path).await.map(|m| m.is_dir()).unwrap_or(false) {
                return Ok(());
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    self.prune_empty_parents(&path).await;
                    Ok(())
                }
                Err(e) if is_missing(&e) => Ok(()),
                Err(e) => Err(Error::from_io(e, "Failed to delete blob")),
            }
        })
        .await?;
        debug!(id = %id, "Directory delete complete");
        Ok(())
    }

    fn list_blobs<'a>(&'a self, ctx: &'a OpContext, prefix: &'a str) -> BlobStream<'a> {
        let full_prefix = format!("{}{}", self.options.prefix, prefix);
        stream::once(async move {
            self.ensure_open()?;
            ctx.run(self.scan(&full_prefix)).await
        })
        .map_ok(|blobs| stream::iter(blobs.into_iter().map(Ok::<_, Error>)))
        .try_flatten()
        .boxed()
    }

    fn connection_info(&self) -> ConnectionInfo {
        self.options.connection_info()
    }

    fn display_name(&self) -> String {
        format!("{}/{}", self.options.path.display(), self.options.prefix)
    }

    async fn close(&self, _ctx: &OpContext) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Closed);
        }
        Ok(())
    }
}
