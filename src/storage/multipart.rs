use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use super::{
    object_path, stream_to_new_file, ByteStream, StorageError, MULTIPART_DIR, TMP_PREFIX,
};

pub const MIN_PART_NUMBER: u32 = 1;
pub const MAX_PART_NUMBER: u32 = 10_000;

const PART_BUF_LEN: usize = 32 * 1024;
// Assembly copies whole multi-gigabyte objects sequentially; the larger
// buffer cuts per-syscall overhead on the final pass.
const ASSEMBLY_BUF_LEN: usize = 1024 * 1024;
const JANITOR_INTERVAL: Duration = Duration::from_secs(60 * 60);
const STALE_AFTER_HOURS: i64 = 24;
const METADATA_FILE: &str = "metadata.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartRecord {
    pub part_number: u32,
    pub size: u64,
    pub etag: String,
    pub path: PathBuf,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct UploadInfo {
    pub upload_id: String,
    pub bucket: String,
    pub key: String,
    pub initiated: DateTime<Utc>,
}

#[derive(Debug)]
pub struct CompletedObject {
    pub etag: String,
    pub size: u64,
}

#[derive(Debug)]
struct UploadRecord {
    upload_id: String,
    bucket: String,
    key: String,
    initiated: DateTime<Utc>,
    state: RwLock<UploadState>,
}

#[derive(Debug)]
struct UploadState {
    last_activity: DateTime<Utc>,
    parts: BTreeMap<u32, PartRecord>,
}

impl UploadRecord {
    fn info(&self) -> UploadInfo {
        UploadInfo {
            upload_id: self.upload_id.clone(),
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            initiated: self.initiated,
        }
    }
}

/// Informational snapshot written next to the parts after every mutation.
/// The in-memory registry stays authoritative while the process runs.
#[derive(Serialize)]
struct UploadMetadata {
    upload_id: String,
    bucket: String,
    key: String,
    initiated: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    parts: BTreeMap<u32, PartRecord>,
}

struct Janitor {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Multipart upload engine: an in-memory registry of in-progress uploads,
/// per-part staging under `<base>/.multipart/<upload-id>/`, and a background
/// janitor evicting uploads idle for more than 24 hours.
///
/// Lock order is registry before per-record state, and neither lock is held
/// across filesystem I/O.
pub struct MultipartManager {
    base: PathBuf,
    uploads: RwLock<HashMap<String, Arc<UploadRecord>>>,
    janitor: Mutex<Option<Janitor>>,
}

impl MultipartManager {
    /// Build the engine over `base`. Leftover staging directories from a
    /// previous process are removed before the first request can arrive,
    /// then the janitor task is spawned.
    pub async fn new(base: impl Into<PathBuf>) -> Arc<Self> {
        let manager = Arc::new(Self {
            base: base.into(),
            uploads: RwLock::new(HashMap::new()),
            janitor: Mutex::new(None),
        });

        manager.remove_orphaned_uploads().await;

        let (stop, mut stopped) = oneshot::channel();
        let worker = Arc::clone(&manager);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(JANITOR_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; swallow it so sweeps run on
            // the hourly cadence.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => worker.sweep_stale_uploads().await,
                    _ = &mut stopped => break,
                }
            }
        });
        *manager.janitor.lock().await = Some(Janitor { stop, handle });

        manager
    }

    /// Signal the janitor and wait for it to exit. Tests rely on this for
    /// deterministic teardown of temp directories.
    pub async fn shutdown(&self) {
        if let Some(janitor) = self.janitor.lock().await.take() {
            let _ = janitor.stop.send(());
            let _ = janitor.handle.await;
        }
    }

    fn staging_dir(&self, upload_id: &str) -> PathBuf {
        self.base.join(MULTIPART_DIR).join(upload_id)
    }

    fn part_path(&self, upload_id: &str, part_number: u32) -> PathBuf {
        self.staging_dir(upload_id).join(format!("part-{}", part_number))
    }

    async fn lookup(&self, upload_id: &str) -> Result<Arc<UploadRecord>, StorageError> {
        self.uploads
            .read()
            .await
            .get(upload_id)
            .cloned()
            .ok_or_else(|| StorageError::UploadNotFound(upload_id.to_string()))
    }

    async fn persist_metadata(&self, record: &UploadRecord) -> Result<(), StorageError> {
        let snapshot = {
            let state = record.state.read().await;
            UploadMetadata {
                upload_id: record.upload_id.clone(),
                bucket: record.bucket.clone(),
                key: record.key.clone(),
                initiated: record.initiated,
                last_activity: state.last_activity,
                parts: state.parts.clone(),
            }
        };
        let json = serde_json::to_vec_pretty(&snapshot)?;
        fs::write(self.staging_dir(&record.upload_id).join(METADATA_FILE), json).await?;
        Ok(())
    }

    pub async fn initiate(&self, bucket: &str, key: &str) -> Result<String, StorageError> {
        let upload_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let record = Arc::new(UploadRecord {
            upload_id: upload_id.clone(),
            bucket: bucket.to_string(),
            key: key.to_string(),
            initiated: now,
            state: RwLock::new(UploadState {
                last_activity: now,
                parts: BTreeMap::new(),
            }),
        });

        fs::create_dir_all(self.staging_dir(&upload_id)).await?;
        self.uploads
            .write()
            .await
            .insert(upload_id.clone(), Arc::clone(&record));
        self.persist_metadata(&record).await?;

        tracing::debug!(bucket, key, %upload_id, "initiated multipart upload");
        Ok(upload_id)
    }

    /// Stream one part into staging and record it. Re-uploading a part
    /// number replaces both the bytes and the recorded ETag.
    pub async fn upload_part(
        &self,
        upload_id: &str,
        part_number: u32,
        mut body: ByteStream,
    ) -> Result<String, StorageError> {
        let record = self.lookup(upload_id).await?;

        // The directory exists for any registered upload; recreate it anyway
        // in case something external removed it mid-flight.
        fs::create_dir_all(self.staging_dir(upload_id)).await?;

        let part_path = self.part_path(upload_id, part_number);
        let (size, md5_hex) = match stream_to_new_file(&part_path, &mut body, PART_BUF_LEN).await {
            Ok(written) => written,
            Err(e) => {
                let _ = fs::remove_file(&part_path).await;
                return Err(e.into());
            }
        };
        let etag = format!("\"{}\"", md5_hex);

        {
            let mut state = record.state.write().await;
            state.parts.insert(
                part_number,
                PartRecord {
                    part_number,
                    size,
                    etag: etag.clone(),
                    path: part_path,
                    last_modified: Utc::now(),
                },
            );
            state.last_activity = Utc::now();
        }
        self.persist_metadata(&record).await?;

        Ok(etag)
    }

    /// Assemble the uploaded parts into the final object.
    ///
    /// The manifest is validated in full before any file I/O starts, then
    /// sorted so the object layout is always ascending part-number order.
    /// The assembled bytes land in a temp file next to the destination and
    /// are published with a single rename.
    pub async fn complete(
        &self,
        upload_id: &str,
        manifest: &[(u32, String)],
    ) -> Result<CompletedObject, StorageError> {
        let record = self.lookup(upload_id).await?;

        let mut selected = Vec::with_capacity(manifest.len());
        {
            let state = record.state.read().await;
            for (part_number, claimed_etag) in manifest {
                let part = state.parts.get(part_number).ok_or_else(|| {
                    StorageError::InvalidPart {
                        number: *part_number,
                        reason: "part was never uploaded".into(),
                    }
                })?;
                if part.etag != *claimed_etag {
                    return Err(StorageError::InvalidPart {
                        number: *part_number,
                        reason: format!("etag mismatch: expected {}", part.etag),
                    });
                }
                selected.push(part.clone());
            }
        }
        selected.sort_by_key(|p| p.part_number);

        let obj_path = object_path(&self.base, &record.bucket, &record.key);
        let parent = obj_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.base.clone());
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!("{}multipart-{}", TMP_PREFIX, Uuid::new_v4()));

        let (etag_hex, size) = match assemble_parts(&tmp_path, &selected).await {
            Ok(assembled) => assembled,
            Err(e) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(e);
            }
        };

        // Commit point: complete and abort race for the registry entry, and
        // whichever loses observes NoSuchUpload.
        if self.uploads.write().await.remove(upload_id).is_none() {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::UploadNotFound(upload_id.to_string()));
        }

        if let Err(e) = fs::rename(&tmp_path, &obj_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        if let Err(e) = fs::remove_dir_all(self.staging_dir(upload_id)).await {
            tracing::warn!(upload_id, "failed to remove staging directory: {}", e);
        }

        let etag = format!("\"{}-{}\"", etag_hex, selected.len());
        tracing::debug!(upload_id, size, %etag, "completed multipart upload");
        Ok(CompletedObject { etag, size })
    }

    pub async fn abort(&self, upload_id: &str) -> Result<(), StorageError> {
        if self.uploads.write().await.remove(upload_id).is_none() {
            return Err(StorageError::UploadNotFound(upload_id.to_string()));
        }
        fs::remove_dir_all(self.staging_dir(upload_id)).await?;
        tracing::debug!(upload_id, "aborted multipart upload");
        Ok(())
    }

    pub async fn list_parts(
        &self,
        upload_id: &str,
    ) -> Result<(UploadInfo, Vec<PartRecord>), StorageError> {
        let record = self.lookup(upload_id).await?;
        let state = record.state.read().await;
        Ok((record.info(), state.parts.values().cloned().collect()))
    }

    pub async fn list_uploads(&self, bucket: &str) -> Vec<UploadInfo> {
        self.uploads
            .read()
            .await
            .values()
            .filter(|record| record.bucket == bucket)
            .map(|record| record.info())
            .collect()
    }

    /// Evict every upload idle for longer than the staleness threshold.
    /// Registry entries are removed under the write lock; the staging
    /// directories are deleted only after it is released.
    pub async fn sweep_stale_uploads(&self) {
        let cutoff = Utc::now() - chrono::Duration::hours(STALE_AFTER_HOURS);

        let stale: Vec<String> = {
            let mut uploads = self.uploads.write().await;
            let mut ids = Vec::new();
            for (upload_id, record) in uploads.iter() {
                if record.state.read().await.last_activity < cutoff {
                    ids.push(upload_id.clone());
                }
            }
            for upload_id in &ids {
                uploads.remove(upload_id);
            }
            ids
        };

        for upload_id in stale {
            tracing::info!(%upload_id, "evicting stale multipart upload");
            if let Err(e) = fs::remove_dir_all(self.staging_dir(&upload_id)).await {
                tracing::warn!(%upload_id, "failed to remove stale staging directory: {}", e);
            }
        }
    }

    /// Startup sweep: the registry is empty, so every staged upload on disk
    /// belongs to a previous process and is useless. Best-effort.
    async fn remove_orphaned_uploads(&self) {
        let root = self.base.join(MULTIPART_DIR);
        let mut entries = match fs::read_dir(&root).await {
            Ok(entries) => entries,
            Err(_) => return,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if !is_dir {
                continue;
            }
            match fs::remove_dir_all(entry.path()).await {
                Ok(()) => tracing::info!(
                    "removed orphaned multipart upload {}",
                    entry.file_name().to_string_lossy()
                ),
                Err(e) => tracing::warn!(
                    "failed to remove orphaned upload {}: {}",
                    entry.path().display(),
                    e
                ),
            }
        }
    }
}

/// Concatenate the parts into `tmp_path` while folding each part's raw MD5
/// into the rolling hash. Returns the hex multipart digest and total size.
async fn assemble_parts(
    tmp_path: &Path,
    parts: &[PartRecord],
) -> Result<(String, u64), StorageError> {
    let mut out = fs::File::create(tmp_path).await?;
    let mut hasher = Md5::new();
    let mut total: u64 = 0;
    let mut buf = vec![0u8; ASSEMBLY_BUF_LEN];

    for part in parts {
        let raw_md5 = hex::decode(part.etag.trim_matches('"')).map_err(|_| {
            StorageError::InvalidPart {
                number: part.part_number,
                reason: "stored etag is not valid hex".into(),
            }
        })?;
        hasher.update(&raw_md5);

        let mut part_file = fs::File::open(&part.path).await?;
        loop {
            let n = part_file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n]).await?;
            total += n as u64;
        }
    }
    out.flush().await?;

    Ok((hex::encode(hasher.finalize()), total))
}
