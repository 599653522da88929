use std::collections::HashSet;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;

use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::BufReader;
use uuid::Uuid;

use super::{
    object_path, stream_to_new_file, ByteStream, BucketInfo, ObjectInfo, ObjectList, PutResult,
    StorageError, MULTIPART_DIR, TMP_PREFIX,
};

const STREAM_BUF_LEN: usize = 32 * 1024;

pub struct FilesystemStore {
    base: PathBuf,
}

fn validate_bucket_name(bucket: &str) -> Result<(), StorageError> {
    if bucket.is_empty() {
        return Err(StorageError::InvalidBucketName(
            "bucket name must not be empty".into(),
        ));
    }
    if bucket == MULTIPART_DIR {
        return Err(StorageError::InvalidBucketName(format!(
            "bucket name {} is reserved",
            MULTIPART_DIR
        )));
    }
    if bucket.contains('/') || bucket.contains('\\') || bucket.contains("..") || bucket == "." {
        return Err(StorageError::InvalidBucketName(format!(
            "bucket name is not a valid path segment: {}",
            bucket
        )));
    }
    Ok(())
}

/// Validate that an object key does not escape the bucket directory.
fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey("key must not be empty".into()));
    }
    if key.len() > 1024 {
        return Err(StorageError::InvalidKey(
            "key must not exceed 1024 bytes".into(),
        ));
    }
    for component in Path::new(key).components() {
        match component {
            Component::ParentDir => {
                return Err(StorageError::InvalidKey(
                    "key must not contain '..' path components".into(),
                ));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::InvalidKey(
                    "key must not be an absolute path".into(),
                ));
            }
            _ => {}
        }
    }
    Ok(())
}

fn stat_info(key: &str, meta: &std::fs::Metadata) -> ObjectInfo {
    let modified: DateTime<Utc> = meta
        .modified()
        .map(Into::into)
        .unwrap_or_else(|_| Utc::now());
    ObjectInfo {
        key: key.to_string(),
        size: meta.len(),
        // Stat-derived opaque fingerprint; single-PUT responses report the
        // content MD5 instead (see put_object).
        etag: format!("\"{:x}\"", modified.timestamp()),
        last_modified: modified,
    }
}

impl FilesystemStore {
    pub async fn new(data_dir: &str) -> std::io::Result<Self> {
        let base = PathBuf::from(data_dir);
        fs::create_dir_all(&base).await?;
        Ok(Self { base })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    fn bucket_path(&self, bucket: &str) -> PathBuf {
        self.base.join(bucket)
    }

    // --- Bucket operations ---

    pub async fn create_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        validate_bucket_name(bucket)?;
        match fs::create_dir(self.bucket_path(bucket)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(StorageError::BucketExists(bucket.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        validate_bucket_name(bucket)?;
        let bucket_dir = self.bucket_path(bucket);
        let mut entries = match fs::read_dir(&bucket_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::BucketNotFound(bucket.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        if entries.next_entry().await?.is_some() {
            return Err(StorageError::BucketNotEmpty(bucket.to_string()));
        }
        fs::remove_dir(&bucket_dir).await?;
        Ok(())
    }

    pub async fn head_bucket(&self, bucket: &str) -> Result<bool, StorageError> {
        validate_bucket_name(bucket)?;
        match fs::metadata(self.bucket_path(bucket)).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list_buckets(&self) -> Result<Vec<BucketInfo>, StorageError> {
        let mut buckets = Vec::new();
        let mut entries = fs::read_dir(&self.base).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name == MULTIPART_DIR {
                continue;
            }
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                let created = meta
                    .modified()
                    .map(Into::into)
                    .unwrap_or_else(|_| Utc::now());
                buckets.push(BucketInfo { name, created });
            }
        }
        buckets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(buckets)
    }

    // --- Object operations ---

    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        mut body: ByteStream,
        declared_len: u64,
    ) -> Result<PutResult, StorageError> {
        validate_bucket_name(bucket)?;
        validate_key(key)?;
        if !self.head_bucket(bucket).await? {
            return Err(StorageError::BucketNotFound(bucket.to_string()));
        }
        tracing::debug!(bucket, key, declared_len, "put object");

        let obj_path = object_path(&self.base, bucket, key);
        let parent = obj_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.bucket_path(bucket));
        fs::create_dir_all(&parent).await?;

        // Write into a sibling temp file, then rename: readers only ever see
        // the previous object or the complete new one.
        let tmp_path = parent.join(format!("{}tmp-{}", TMP_PREFIX, Uuid::new_v4()));
        let (size, md5_hex) = match stream_to_new_file(&tmp_path, &mut body, STREAM_BUF_LEN).await {
            Ok(written) => written,
            Err(e) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(e.into());
            }
        };
        if let Err(e) = fs::rename(&tmp_path, &obj_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        Ok(PutResult {
            size,
            etag: format!("\"{}\"", md5_hex),
        })
    }

    pub async fn get_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<(ByteStream, ObjectInfo), StorageError> {
        let info = self.head_object(bucket, key).await?;
        let obj_path = object_path(&self.base, bucket, key);
        let file = fs::File::open(&obj_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::ObjectNotFound(key.to_string())
            } else {
                StorageError::Io(e)
            }
        })?;
        Ok((Box::pin(BufReader::new(file)), info))
    }

    pub async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectInfo, StorageError> {
        validate_bucket_name(bucket)?;
        validate_key(key)?;
        let obj_path = object_path(&self.base, bucket, key);
        let meta = fs::metadata(&obj_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::ObjectNotFound(key.to_string())
            } else {
                StorageError::Io(e)
            }
        })?;
        if meta.is_dir() {
            return Err(StorageError::ObjectNotFound(key.to_string()));
        }
        Ok(stat_info(key, &meta))
    }

    pub async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        validate_bucket_name(bucket)?;
        validate_key(key)?;
        let obj_path = object_path(&self.base, bucket, key);
        match fs::remove_file(&obj_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        // Prune parent directories left empty, stopping at the bucket dir.
        let bucket_dir = self.bucket_path(bucket);
        let mut dir = obj_path.parent().map(Path::to_path_buf);
        while let Some(d) = dir {
            if d == bucket_dir {
                break;
            }
            if fs::remove_dir(&d).await.is_err() {
                break;
            }
            dir = d.parent().map(Path::to_path_buf);
        }
        Ok(())
    }

    /// Depth-first listing with S3 list-objects semantics: `prefix` filters
    /// keys (subtrees that cannot match are pruned), `delimiter` collapses
    /// matching keys into deduplicated common prefixes, and `max_keys` caps
    /// the number of returned objects (0 means unlimited).
    pub async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: &str,
        max_keys: usize,
    ) -> Result<ObjectList, StorageError> {
        validate_bucket_name(bucket)?;
        let bucket_dir = self.bucket_path(bucket);
        if !fs::try_exists(&bucket_dir).await? {
            return Err(StorageError::BucketNotFound(bucket.to_string()));
        }

        let mut list = ObjectList {
            objects: Vec::new(),
            common_prefixes: Vec::new(),
        };
        let mut seen = HashSet::new();
        self.walk_objects(
            &bucket_dir,
            &bucket_dir,
            prefix,
            delimiter,
            max_keys,
            &mut list,
            &mut seen,
        )
        .await?;
        Ok(list)
    }

    #[allow(clippy::too_many_arguments)]
    fn walk_objects<'a>(
        &'a self,
        base: &'a Path,
        dir: &'a Path,
        prefix: &'a str,
        delimiter: &'a str,
        max_keys: usize,
        out: &'a mut ObjectList,
        seen: &'a mut HashSet<String>,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StorageError>> + Send + 'a>> {
        Box::pin(async move {
            let mut entries = match fs::read_dir(dir).await {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
                Err(e) => return Err(e.into()),
            };

            // Lexical order keeps listings stable across platforms.
            let mut children: Vec<(String, PathBuf, bool)> = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with(TMP_PREFIX) {
                    continue;
                }
                let is_dir = entry.file_type().await?.is_dir();
                children.push((name, entry.path(), is_dir));
            }
            children.sort_by(|a, b| a.0.cmp(&b.0));

            for (_, path, is_dir) in children {
                let Ok(rel) = path.strip_prefix(base) else {
                    continue;
                };
                let key = rel
                    .iter()
                    .map(|c| c.to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");

                if !prefix.is_empty() && !key.starts_with(prefix) {
                    // The subtree can still hold matches when the prefix
                    // descends through this directory; everything else is
                    // pruned.
                    if is_dir && prefix.starts_with(&format!("{}/", key)) {
                        if !self
                            .walk_objects(base, &path, prefix, delimiter, max_keys, out, seen)
                            .await?
                        {
                            return Ok(false);
                        }
                    }
                    continue;
                }

                if !delimiter.is_empty() {
                    let rem = &key[prefix.len()..];
                    if let Some(idx) = rem.find(delimiter) {
                        let common = format!("{}{}", prefix, &rem[..idx + delimiter.len()]);
                        if seen.insert(common.clone()) {
                            out.common_prefixes.push(common);
                        }
                        continue;
                    }
                }

                if is_dir {
                    if !self
                        .walk_objects(base, &path, prefix, delimiter, max_keys, out, seen)
                        .await?
                    {
                        return Ok(false);
                    }
                } else {
                    let meta = fs::metadata(&path).await?;
                    out.objects.push(stat_info(&key, &meta));
                    if max_keys > 0 && out.objects.len() >= max_keys {
                        return Ok(false);
                    }
                }
            }
            Ok(true)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use md5::{Digest, Md5};
    use tempfile::TempDir;

    async fn store() -> (FilesystemStore, TempDir) {
        let tmp = TempDir::new().unwrap();
        let store = FilesystemStore::new(tmp.path().to_str().unwrap())
            .await
            .unwrap();
        (store, tmp)
    }

    fn body(data: &[u8]) -> ByteStream {
        Box::pin(std::io::Cursor::new(data.to_vec()))
    }

    async fn read_all(mut stream: ByteStream) -> Vec<u8> {
        use tokio::io::AsyncReadExt;
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn put_then_get_returns_identical_bytes() {
        let (store, _tmp) = store().await;
        store.create_bucket("b").await.unwrap();

        let data = b"hello stowage";
        let result = store
            .put_object("b", "greeting.txt", body(data), data.len() as u64)
            .await
            .unwrap();
        assert_eq!(result.size, data.len() as u64);
        assert_eq!(
            result.etag,
            format!("\"{}\"", hex::encode(Md5::digest(data)))
        );

        let (stream, info) = store.get_object("b", "greeting.txt").await.unwrap();
        assert_eq!(info.size, data.len() as u64);
        assert_eq!(read_all(stream).await, data);
    }

    #[tokio::test]
    async fn put_overwrites_existing_object() {
        let (store, _tmp) = store().await;
        store.create_bucket("b").await.unwrap();
        store.put_object("b", "k", body(b"old"), 3).await.unwrap();
        store.put_object("b", "k", body(b"newer"), 5).await.unwrap();

        let (stream, info) = store.get_object("b", "k").await.unwrap();
        assert_eq!(info.size, 5);
        assert_eq!(read_all(stream).await, b"newer");
    }

    #[tokio::test]
    async fn put_into_missing_bucket_fails() {
        let (store, _tmp) = store().await;
        let err = store.put_object("nope", "k", body(b"x"), 1).await;
        assert!(matches!(err, Err(StorageError::BucketNotFound(_))));
    }

    #[tokio::test]
    async fn delete_prunes_empty_parent_directories() {
        let (store, tmp) = store().await;
        store.create_bucket("b").await.unwrap();
        store
            .put_object("b", "a/deep/nested.txt", body(b"x"), 1)
            .await
            .unwrap();
        assert!(tmp.path().join("b/a/deep").is_dir());

        store.delete_object("b", "a/deep/nested.txt").await.unwrap();
        assert!(!tmp.path().join("b/a").exists());
        assert!(tmp.path().join("b").is_dir());

        // Bucket is empty again, so deletion succeeds.
        store.delete_bucket("b").await.unwrap();
    }

    #[tokio::test]
    async fn delete_stops_pruning_at_populated_directory() {
        let (store, tmp) = store().await;
        store.create_bucket("b").await.unwrap();
        store.put_object("b", "a/one.txt", body(b"1"), 1).await.unwrap();
        store.put_object("b", "a/two.txt", body(b"2"), 1).await.unwrap();

        store.delete_object("b", "a/one.txt").await.unwrap();
        assert!(tmp.path().join("b/a/two.txt").is_file());
    }

    #[tokio::test]
    async fn bucket_lifecycle_errors() {
        let (store, _tmp) = store().await;
        store.create_bucket("b").await.unwrap();
        assert!(matches!(
            store.create_bucket("b").await,
            Err(StorageError::BucketExists(_))
        ));
        assert!(matches!(
            store.delete_bucket("missing").await,
            Err(StorageError::BucketNotFound(_))
        ));

        store.put_object("b", "k", body(b"x"), 1).await.unwrap();
        assert!(matches!(
            store.delete_bucket("b").await,
            Err(StorageError::BucketNotEmpty(_))
        ));
    }

    #[tokio::test]
    async fn reserved_bucket_name_is_rejected() {
        let (store, _tmp) = store().await;
        assert!(matches!(
            store.create_bucket(".multipart").await,
            Err(StorageError::InvalidBucketName(_))
        ));
        assert!(matches!(
            store.head_bucket(".multipart").await,
            Err(StorageError::InvalidBucketName(_))
        ));
    }

    #[tokio::test]
    async fn key_traversal_is_rejected() {
        let (store, _tmp) = store().await;
        store.create_bucket("b").await.unwrap();
        assert!(matches!(
            store.put_object("b", "../escape", body(b"x"), 1).await,
            Err(StorageError::InvalidKey(_))
        ));
        assert!(matches!(
            store.get_object("b", "/absolute").await,
            Err(StorageError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn list_filters_by_prefix_and_prunes_subtrees() {
        let (store, _tmp) = store().await;
        store.create_bucket("b").await.unwrap();
        for key in ["photos/2024/a.jpg", "photos/2025/b.jpg", "docs/readme.md"] {
            store.put_object("b", key, body(b"x"), 1).await.unwrap();
        }

        let list = store.list_objects("b", "photos/2024/", "", 0).await.unwrap();
        let keys: Vec<_> = list.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["photos/2024/a.jpg"]);
        assert!(list.common_prefixes.is_empty());
    }

    #[tokio::test]
    async fn list_collapses_common_prefixes() {
        let (store, _tmp) = store().await;
        store.create_bucket("b").await.unwrap();
        for key in [
            "photos/2024/a.jpg",
            "photos/2024/b.jpg",
            "photos/2025/c.jpg",
            "readme.txt",
        ] {
            store.put_object("b", key, body(b"x"), 1).await.unwrap();
        }

        let list = store.list_objects("b", "", "/", 0).await.unwrap();
        let keys: Vec<_> = list.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["readme.txt"]);
        assert_eq!(list.common_prefixes, vec!["photos/"]);

        let list = store.list_objects("b", "photos/", "/", 0).await.unwrap();
        assert!(list.objects.is_empty());
        assert_eq!(list.common_prefixes, vec!["photos/2024/", "photos/2025/"]);
    }

    #[tokio::test]
    async fn list_caps_results_at_max_keys() {
        let (store, _tmp) = store().await;
        store.create_bucket("b").await.unwrap();
        for i in 0..5 {
            store
                .put_object("b", &format!("k-{}", i), body(b"x"), 1)
                .await
                .unwrap();
        }

        let list = store.list_objects("b", "", "", 3).await.unwrap();
        assert_eq!(list.objects.len(), 3);

        let list = store.list_objects("b", "", "", 0).await.unwrap();
        assert_eq!(list.objects.len(), 5);
    }

    #[tokio::test]
    async fn list_on_missing_bucket_fails() {
        let (store, _tmp) = store().await;
        assert!(matches!(
            store.list_objects("ghost", "", "", 0).await,
            Err(StorageError::BucketNotFound(_))
        ));
    }
}
