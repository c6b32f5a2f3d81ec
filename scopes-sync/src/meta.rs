//! Per-scope sync bookkeeping and promotion sidecars.
//!
//! `<output>/<scope>/.sync-meta.yaml` is a lock-managed document (see
//! [`scopes_core::Versioned`]); sidecars next to promoted artifacts are plain
//! YAML written atomically by the promoting scope while it holds its own
//! sync-meta lock.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use scopes_core::write_atomic;

use crate::error::SyncError;

/// Suffix of the promotion sidecar written next to each shared artifact.
pub const SIDECAR_SUFFIX: &str = ".meta";

const SYNC_META_SCHEMA: u32 = 1;

fn schema_version() -> u32 {
    SYNC_META_SCHEMA
}

/// Last promotion of one relative path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotedFile {
    pub promoted_at: DateTime<Utc>,
    pub hash: String,
    pub version: u64,
}

/// Last pull of one `{source_scope}/{relative_path}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PulledFile {
    pub pulled_at: DateTime<Utc>,
    pub version: u64,
    pub hash: String,
}

/// Body of `.sync-meta.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMeta {
    #[serde(default = "schema_version")]
    pub version: u32,
    #[serde(default)]
    pub last_sync_up: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_sync_down: Option<DateTime<Utc>>,
    /// Keyed by path relative to the scope directory, `/`-separated.
    #[serde(default)]
    pub promoted_files: BTreeMap<String, PromotedFile>,
    /// Keyed by `{source_scope}/{relative_path}`.
    #[serde(default)]
    pub pulled_files: BTreeMap<String, PulledFile>,
}

impl Default for SyncMeta {
    fn default() -> Self {
        Self {
            version: SYNC_META_SCHEMA,
            last_sync_up: None,
            last_sync_down: None,
            promoted_files: BTreeMap::new(),
            pulled_files: BTreeMap::new(),
        }
    }
}

/// Sidecar stored at `<artifact>.meta` in the shared layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionRecord {
    pub source_scope: String,
    pub promoted_at: DateTime<Utc>,
    pub original_path: String,
    pub original_hash: String,
    pub version: u64,
}

/// `<artifact>.meta`
pub fn sidecar_path(artifact: &Path) -> PathBuf {
    let mut os: OsString = artifact.as_os_str().to_owned();
    os.push(SIDECAR_SUFFIX);
    PathBuf::from(os)
}

pub fn is_sidecar(path: &Path) -> bool {
    path.to_string_lossy().ends_with(SIDECAR_SUFFIX)
}

/// Read the sidecar for `artifact`. Missing or malformed sidecars read as
/// `None`; a shared file without metadata is still pullable.
pub fn read_record(artifact: &Path) -> Option<PromotionRecord> {
    let path = sidecar_path(artifact);
    let contents = std::fs::read_to_string(&path).ok()?;
    match serde_yaml::from_str(&contents) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "ignoring malformed promotion sidecar");
            None
        }
    }
}

pub fn write_record(artifact: &Path, record: &PromotionRecord) -> Result<(), SyncError> {
    let yaml = serde_yaml::to_string(record)?;
    write_atomic(&sidecar_path(artifact), yaml.as_bytes())?;
    Ok(())
}

/// `/`-joined form of a relative path, used as a map key on every platform.
pub fn rel_key(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn sync_meta_uses_camel_case_keys() {
        let mut meta = SyncMeta::default();
        meta.promoted_files.insert(
            "architecture/overview.md".into(),
            PromotedFile {
                promoted_at: Utc::now(),
                hash: "abc".into(),
                version: 2,
            },
        );
        let yaml = serde_yaml::to_string(&meta).unwrap();
        assert!(yaml.contains("promotedFiles"));
        assert!(yaml.contains("lastSyncUp"));
        assert!(yaml.contains("promotedAt"));
    }

    #[test]
    fn empty_document_fills_defaults() {
        let meta: SyncMeta = serde_yaml::from_str("{}").unwrap();
        assert_eq!(meta, SyncMeta::default());
    }

    #[test]
    fn sidecar_roundtrip_and_malformed() {
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("a.md");
        assert_eq!(sidecar_path(&artifact), dir.path().join("a.md.meta"));
        assert!(read_record(&artifact).is_none());

        let record = PromotionRecord {
            source_scope: "auth".into(),
            promoted_at: Utc::now(),
            original_path: "a.md".into(),
            original_hash: "h".into(),
            version: 3,
        };
        write_record(&artifact, &record).unwrap();
        assert_eq!(read_record(&artifact), Some(record));

        std::fs::write(sidecar_path(&artifact), "version: [").unwrap();
        assert!(read_record(&artifact).is_none());
    }

    #[test]
    fn rel_key_is_slash_joined() {
        let rel = Path::new("architecture").join("api").join("v1.md");
        assert_eq!(rel_key(&rel), "architecture/api/v1.md");
        assert!(is_sidecar(Path::new("x/a.md.meta")));
        assert!(!is_sidecar(Path::new("x/metadata.md")));
    }
}
