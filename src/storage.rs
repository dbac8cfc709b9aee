//! Object storage: the bucket seam plus the pipeline's key templates.
//!
//! Stage drivers talk to storage through [`ObjectStore`], so tests and the
//! CLI can swap the concurrent in-memory store or a directory-rooted store
//! for the real bucket. Locators are bucket-rooted URIs; resolving one back
//! to a key only works against the store that produced it.
//!
//! Key templates are fixed contracts shared with the ML platform side:
//! `training/images/{dataRowId}[_{w}_{h}].jpg` for image assets,
//! `etl/{runId}/{stamp}.jsonl` for training files,
//! `inference_file/bounding-box/{stamp}.jsonl` for instance files, and
//! `inference/{modelType}/{stamp}/` as the batch-prediction destination.

use std::path::PathBuf;

use dashmap::DashMap;
use time::OffsetDateTime;
use time::macros::format_description;

use crate::error::{StorageError, StorageResult};

/// Blob storage addressed by `/`-separated keys.
pub trait ObjectStore: Send + Sync {
    /// Bucket (namespace) this store writes into.
    fn bucket(&self) -> &str;

    /// Write a blob, returning its locator URI.
    fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> StorageResult<String>;

    /// Read a blob back.
    fn get(&self, key: &str) -> StorageResult<Vec<u8>>;

    fn exists(&self, key: &str) -> bool;

    /// Locator URI for a key in this store.
    fn locator(&self, key: &str) -> String {
        format!("gs://{}/{}", self.bucket(), key)
    }

    /// Inverse of [`locator`](Self::locator).
    fn resolve(&self, uri: &str) -> StorageResult<String> {
        let prefix = format!("gs://{}/", self.bucket());
        uri.strip_prefix(&prefix)
            .map(str::to_string)
            .ok_or_else(|| StorageError::ForeignLocator {
                uri: uri.to_string(),
                bucket: self.bucket().to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

struct StoredObject {
    content_type: String,
    bytes: Vec<u8>,
}

/// Concurrent in-memory store. The default for tests and dry runs; shared
/// freely across the transform pool's workers.
pub struct MemoryStore {
    bucket: String,
    objects: DashMap<String, StoredObject>,
}

impl MemoryStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Keys currently present, in no particular order.
    pub fn keys(&self) -> Vec<String> {
        self.objects.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects.get(key).map(|obj| obj.content_type.clone())
    }
}

impl ObjectStore for MemoryStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> StorageResult<String> {
        self.objects.insert(
            key.to_string(),
            StoredObject {
                content_type: content_type.to_string(),
                bytes: bytes.to_vec(),
            },
        );
        Ok(self.locator(key))
    }

    fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        self.objects
            .get(key)
            .map(|obj| obj.bytes.clone())
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })
    }

    fn exists(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }
}

/// Directory-rooted store: each key becomes a file under the root.
pub struct FsStore {
    bucket: String,
    root: PathBuf,
}

impl FsStore {
    pub fn new(bucket: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            bucket: bucket.into(),
            root: root.into(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl ObjectStore for FsStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn put(&self, key: &str, bytes: &[u8], _content_type: &str) -> StorageResult<String> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StorageError::Io {
                key: key.to_string(),
                source,
            })?;
        }
        std::fs::write(&path, bytes).map_err(|source| StorageError::Io {
            key: key.to_string(),
            source,
        })?;
        Ok(self.locator(key))
    }

    fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        match std::fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(bytes),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound {
                    key: key.to_string(),
                })
            }
            Err(source) => Err(StorageError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    fn exists(&self, key: &str) -> bool {
        self.path_for(key).is_file()
    }
}

// ---------------------------------------------------------------------------
// Key templates
// ---------------------------------------------------------------------------

/// Key for an uploaded image asset. `dims` carries the image's original
/// (pre-downsample) dimensions when downstream needs to recover them from
/// the key alone.
pub fn image_key(data_row_id: &str, dims: Option<(u32, u32)>) -> String {
    match dims {
        Some((w, h)) => format!("training/images/{data_row_id}_{w}_{h}.jpg"),
        None => format!("training/images/{data_row_id}.jpg"),
    }
}

/// Key for a model run's ETL output file.
pub fn etl_key(model_run_id: &str, stamp: &str) -> String {
    format!("etl/{model_run_id}/{stamp}.jsonl")
}

/// Key for a batch-prediction instance file.
pub fn instance_key(stamp: &str) -> String {
    format!("inference_file/bounding-box/{stamp}.jsonl")
}

/// Destination prefix a batch-prediction job writes its shards under.
pub fn inference_prefix(model_type: &str, stamp: &str) -> String {
    format!("inference/{model_type}/{stamp}/")
}

/// Compact UTC timestamp used in artifact keys.
pub fn timestamp_slug() -> String {
    let format = format_description!("[year][month][day]_[hour][minute][second]");
    OffsetDateTime::now_utc()
        .format(format)
        .expect("timestamp format is static")
}

/// Data-row identity recovered from an image key or locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedImageKey {
    pub data_row_id: String,
    pub dims: Option<(u32, u32)>,
}

/// Recover `{dataRowId}[_{w}_{h}]` from an image locator's basename.
///
/// Fallback path only; the upload manifest is authoritative. A data-row id
/// that itself ends in two `_`-separated integers is indistinguishable from
/// a dims suffix here, which is exactly why the manifest exists.
pub fn parse_image_locator(uri: &str) -> ParsedImageKey {
    let basename = uri.rsplit('/').next().unwrap_or(uri);
    let stem = basename.strip_suffix(".jpg").unwrap_or(basename);
    match split_dims(stem) {
        Some((id, w, h)) => ParsedImageKey {
            data_row_id: id.to_string(),
            dims: Some((w, h)),
        },
        None => ParsedImageKey {
            data_row_id: stem.to_string(),
            dims: None,
        },
    }
}

fn split_dims(stem: &str) -> Option<(&str, u32, u32)> {
    let (rest, h) = stem.rsplit_once('_')?;
    let h: u32 = h.parse().ok()?;
    let (id, w) = rest.rsplit_once('_')?;
    let w: u32 = w.parse().ok()?;
    if id.is_empty() {
        return None;
    }
    Some((id, w, h))
}
