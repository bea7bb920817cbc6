use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::{Error, Result};

pub struct Fingerprint {
    pub digest: String,
    pub files: usize,
}

/// Inputs that decide whether an existing build can be reused.
pub struct FingerprintInputs<'a> {
    pub root: &'a Path,
    pub exclude: &'a [String],
    /// Relative path of the variable file, which never affects the build output.
    pub env_file: &'a Path,
    pub build_env_prefixes: &'a [String],
    pub env: &'a BTreeMap<String, String>,
}

pub fn compute(inputs: &FingerprintInputs<'_>) -> Result<Fingerprint> {
    let mut hasher = Sha256::new();
    let mut files = 0;

    // Linked sources count with their target's contents; a link cycle is an error.
    let walker = WalkDir::new(inputs.root)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 {
                return true;
            }
            let name = entry.file_name().to_string_lossy();
            !inputs.exclude.iter().any(|ex| ex.as_str() == name)
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if is_dangling_link(&err) => {
                tracing::debug!(path = ?err.path(), "skipping dangling link");
                continue;
            }
            Err(err) => {
                let path = err
                    .path()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| inputs.root.to_path_buf());
                return Err(Error::Fingerprint {
                    path,
                    source: io::Error::from(err),
                });
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = match entry.path().strip_prefix(inputs.root) {
            Ok(relative) => relative,
            Err(_) => continue,
        };
        if relative == inputs.env_file {
            continue;
        }

        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        hasher.update(b"file:");
        hasher.update(name.as_bytes());
        hasher.update([0u8]);

        let mut file = File::open(entry.path()).map_err(|source| Error::Fingerprint {
            path: entry.path().to_path_buf(),
            source,
        })?;
        io::copy(&mut file, &mut hasher).map_err(|source| Error::Fingerprint {
            path: entry.path().to_path_buf(),
            source,
        })?;
        hasher.update([0u8]);
        files += 1;
    }

    // NEXT_PUBLIC_ values are inlined into the client bundle at build time.
    for (key, value) in inputs.env {
        if inputs
            .build_env_prefixes
            .iter()
            .any(|prefix| key.starts_with(prefix.as_str()))
        {
            hasher.update(b"env:");
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update([0u8]);
        }
    }

    Ok(Fingerprint {
        digest: hex::encode(hasher.finalize()),
        files,
    })
}

fn is_dangling_link(err: &walkdir::Error) -> bool {
    err.loop_ancestor().is_none()
        && err.io_error().map(io::Error::kind) == Some(io::ErrorKind::NotFound)
        && err
            .path()
            .and_then(|p| p.symlink_metadata().ok())
            .is_some_and(|m| m.file_type().is_symlink())
}
