use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

pub const CONFIG_FILE_NAME: &str = "nextboot.toml";
pub const DEFAULT_APP_ROOT: &str = "/app";

/// How the build-check phase decides whether a build already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerMode {
    /// Compare the recorded build manifest against a fresh source fingerprint.
    Manifest,
    /// Treat an existing build directory as sufficiently built.
    Presence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BuildFailurePolicy {
    Halt,
    Continue,
}

/// Contents of `nextboot.toml`. Every field has a default, so an absent or
/// empty file yields the stock Next.js layout.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    #[serde(skip)]
    pub app_root: PathBuf,
    pub env_file: PathBuf,
    pub build_dir: PathBuf,
    pub build_command: Vec<String>,
    pub start_command: Vec<String>,
    pub port: u16,
    pub marker: MarkerMode,
    pub on_build_failure: BuildFailurePolicy,
    pub diagnostic_patterns: Vec<String>,
    pub mask_values: bool,
    pub build_env_prefixes: Vec<String>,
    pub fingerprint_exclude: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_root: PathBuf::from(DEFAULT_APP_ROOT),
            env_file: PathBuf::from(".env"),
            build_dir: PathBuf::from(".next"),
            build_command: vec!["npm".into(), "run".into(), "build".into()],
            start_command: vec!["npm".into(), "run".into(), "start".into()],
            port: 3000,
            marker: MarkerMode::Presence,
            on_build_failure: BuildFailurePolicy::Continue,
            diagnostic_patterns: vec!["NEXT_PUBLIC".into(), "DB_".into()],
            mask_values: false,
            build_env_prefixes: vec!["NEXT_PUBLIC_".into()],
            fingerprint_exclude: vec![".next".into(), "node_modules".into(), ".git".into()],
        }
    }
}

impl Settings {
    /// Load settings for `app_root`. An explicit `config_path` must exist;
    /// otherwise `<app_root>/nextboot.toml` is used when present.
    pub fn load(app_root: &Path, config_path: Option<&Path>) -> Result<Self> {
        let path = match config_path {
            Some(path) => Some(path.to_path_buf()),
            None => {
                let candidate = app_root.join(CONFIG_FILE_NAME);
                candidate.is_file().then_some(candidate)
            }
        };

        let mut settings = match path {
            Some(path) => {
                let content = std::fs::read_to_string(&path).map_err(|source| Error::ConfigRead {
                    path: path.clone(),
                    source,
                })?;
                tracing::debug!(path = %path.display(), "loaded config file");
                Self::from_toml(&content).map_err(|source| Error::ConfigParse { path, source })?
            }
            None => Self::default(),
        };
        settings.app_root = app_root.to_path_buf();
        Ok(settings)
    }

    pub fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn env_file_path(&self) -> PathBuf {
        self.app_root.join(&self.env_file)
    }

    pub fn build_dir_path(&self) -> PathBuf {
        self.app_root.join(&self.build_dir)
    }
}

/// Template written by `nextboot init`.
pub const TEMPLATE: &str = r#"# nextboot configuration. Paths are relative to the app root.

env_file = ".env"
build_dir = ".next"
build_command = ["npm", "run", "build"]
start_command = ["npm", "run", "start"]
port = 3000

# "presence" only checks that build_dir exists;
# "manifest" also rebuilds when sources or NEXT_PUBLIC_ values change.
marker = "presence"

# "continue" launches even when the build fails; "halt" exits with the build's code.
on_build_failure = "continue"

# Variables whose names contain one of these (case-insensitive) are listed at startup.
diagnostic_patterns = ["NEXT_PUBLIC", "DB_"]
mask_values = false

# Variables inlined into the client bundle at build time.
build_env_prefixes = ["NEXT_PUBLIC_"]
fingerprint_exclude = [".next", "node_modules", ".git"]
"#;
