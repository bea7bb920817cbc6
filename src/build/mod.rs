use std::collections::BTreeMap;
use std::fmt;

use crate::config::{MarkerMode, Settings};
use crate::error::Result;

mod fingerprint;
mod manifest;

pub use fingerprint::{compute as compute_fingerprint, Fingerprint, FingerprintInputs};
pub use manifest::BuildManifest;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildStatus {
    Missing,
    Present,
    Unrecorded,
    Stale { recorded: String, current: String },
    Current,
}

impl BuildStatus {
    pub fn needs_build(&self) -> bool {
        matches!(
            self,
            BuildStatus::Missing | BuildStatus::Unrecorded | BuildStatus::Stale { .. }
        )
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildStatus::Missing => write!(f, "missing (no build directory)"),
            BuildStatus::Present => write!(f, "present (build directory exists)"),
            BuildStatus::Unrecorded => write!(f, "unrecorded (build directory has no manifest)"),
            BuildStatus::Stale { recorded, current } => write!(
                f,
                "stale (recorded {}, current {})",
                short(recorded),
                short(current)
            ),
            BuildStatus::Current => write!(f, "current"),
        }
    }
}

fn short(digest: &str) -> &str {
    digest.get(..12).unwrap_or(digest)
}

fn fingerprint_for(settings: &Settings, env: &BTreeMap<String, String>) -> Result<Fingerprint> {
    // The build directory holds the manifest itself, so it is never hashed.
    let mut exclude = settings.fingerprint_exclude.clone();
    if let Some(name) = settings.build_dir.file_name() {
        exclude.push(name.to_string_lossy().into_owned());
    }
    compute_fingerprint(&FingerprintInputs {
        root: &settings.app_root,
        exclude: &exclude,
        env_file: &settings.env_file,
        build_env_prefixes: &settings.build_env_prefixes,
        env,
    })
}

/// Decide whether the build directory can be reused. `env` is the effective
/// environment the build would run with.
pub fn check_status(settings: &Settings, env: &BTreeMap<String, String>) -> Result<BuildStatus> {
    let build_dir = settings.build_dir_path();
    if !build_dir.is_dir() {
        return Ok(BuildStatus::Missing);
    }

    if settings.marker == MarkerMode::Presence {
        return Ok(BuildStatus::Present);
    }

    let Some(manifest) = BuildManifest::read(&build_dir) else {
        return Ok(BuildStatus::Unrecorded);
    };

    let current = fingerprint_for(settings, env)?;
    if current.digest == manifest.fingerprint {
        Ok(BuildStatus::Current)
    } else {
        Ok(BuildStatus::Stale {
            recorded: manifest.fingerprint,
            current: current.digest,
        })
    }
}

/// Record a successful build. Called after the build command exits so that
/// files the build itself touches are part of the recorded state.
pub fn record_build(settings: &Settings, env: &BTreeMap<String, String>) -> Result<BuildManifest> {
    let fingerprint = fingerprint_for(settings, env)?;
    let manifest = BuildManifest::new(
        fingerprint.digest,
        fingerprint.files,
        settings.build_command.join(" "),
    );
    manifest.write(&settings.build_dir_path())?;
    tracing::debug!(
        fingerprint = %manifest.fingerprint,
        files = manifest.files,
        "recorded build manifest"
    );
    Ok(manifest)
}
