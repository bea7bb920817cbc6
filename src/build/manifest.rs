use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{Error, Result};

pub const MANIFEST_FILE_NAME: &str = "nextboot-manifest.json";
const MANIFEST_VERSION: u32 = 1;

/// Record of a completed build, stored inside the build directory so that
/// removing the directory also discards the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildManifest {
    pub version: u32,
    pub completed_at: DateTime<Utc>,
    pub fingerprint: String,
    pub files: usize,
    pub command: String,
}

impl BuildManifest {
    pub fn new(fingerprint: String, files: usize, command: String) -> Self {
        Self {
            version: MANIFEST_VERSION,
            completed_at: Utc::now(),
            fingerprint,
            files,
            command,
        }
    }

    pub fn path(build_dir: &Path) -> PathBuf {
        build_dir.join(MANIFEST_FILE_NAME)
    }

    /// Returns `None` when the manifest is absent, unreadable, or from an
    /// incompatible format version.
    pub fn read(build_dir: &Path) -> Option<Self> {
        let path = Self::path(build_dir);
        let contents = fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<Self>(&contents) {
            Ok(manifest) if manifest.version == MANIFEST_VERSION => Some(manifest),
            Ok(manifest) => {
                tracing::warn!(version = manifest.version, "ignoring build manifest with unknown version");
                None
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable build manifest");
                None
            }
        }
    }

    pub fn write(&self, build_dir: &Path) -> Result<()> {
        let path = Self::path(build_dir);
        let to_err = |source: std::io::Error| Error::ManifestWrite {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(build_dir).map_err(to_err)?;
        let contents = serde_json::to_string_pretty(self).map_err(|e| to_err(e.into()))?;

        let mut tmp = NamedTempFile::new_in(build_dir).map_err(to_err)?;
        tmp.write_all(contents.as_bytes()).map_err(to_err)?;
        tmp.persist(&path).map_err(|e| to_err(e.error))?;
        Ok(())
    }
}
