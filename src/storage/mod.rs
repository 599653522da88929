pub mod filesystem;
pub mod multipart;

use std::path::{Path, PathBuf};
use std::pin::Pin;

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// Reserved directory under the base path holding in-flight multipart
/// uploads. Must never collide with a bucket name.
pub const MULTIPART_DIR: &str = ".multipart";

/// Prefix shared by every temp file written next to its final destination.
/// Listings and the bucket-empty check skip these names.
pub(crate) const TMP_PREFIX: &str = ".stowage-";

pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub etag: String,
}

pub struct PutResult {
    pub size: u64,
    pub etag: String,
}

pub struct BucketInfo {
    pub name: String,
    pub created: DateTime<Utc>,
}

pub struct ObjectList {
    pub objects: Vec<ObjectInfo>,
    pub common_prefixes: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bucket not found: {0}")]
    BucketNotFound(String),
    #[error("bucket already exists: {0}")]
    BucketExists(String),
    #[error("bucket not empty: {0}")]
    BucketNotEmpty(String),
    #[error("object not found: {0}")]
    ObjectNotFound(String),
    #[error("invalid bucket name: {0}")]
    InvalidBucketName(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("multipart upload not found: {0}")]
    UploadNotFound(String),
    #[error("invalid part {number}: {reason}")]
    InvalidPart { number: u32, reason: String },
}

/// Map `(bucket, key)` onto the filesystem: forward slashes in the key
/// become path separators.
pub(crate) fn object_path(base: &Path, bucket: &str, key: &str) -> PathBuf {
    let mut path = base.join(bucket);
    for segment in key.split('/').filter(|s| !s.is_empty()) {
        path.push(segment);
    }
    path
}

/// Stream `body` into a freshly created file, hashing as it goes. Returns
/// the byte count and the hex MD5 of everything written. The caller owns
/// cleanup of the file on error.
pub(crate) async fn stream_to_new_file(
    path: &Path,
    body: &mut ByteStream,
    buf_len: usize,
) -> std::io::Result<(u64, String)> {
    let mut file = fs::File::create(path).await?;
    let mut hasher = Md5::new();
    let mut size: u64 = 0;
    let mut buf = vec![0u8; buf_len];

    loop {
        let n = body.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n]).await?;
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    file.flush().await?;

    Ok((size, hex::encode(hasher.finalize())))
}
