//! The startup sequence: load the variable file, build if needed, launch.
//!
//! Each phase runs once, in order, and blocks until it finishes. Nothing is
//! written into this process's environment; the loaded variables travel as a
//! [`RuntimeEnv`] into every spawned command.

use std::collections::BTreeMap;
use std::io::Write;

use crate::build::{self, BuildStatus};
use crate::config::{BuildFailurePolicy, Settings};
use crate::env_file::{Diagnostics, RuntimeEnv};
use crate::error::{Error, Result};
use crate::process::{BuildOutcome, CommandSpec, Launcher, EXEC_FAILED_CODE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildPhase {
    Skipped(BuildStatus),
    Built,
    Failed(BuildOutcome),
}

pub struct Reconciler<'a, L: Launcher> {
    settings: &'a Settings,
    launcher: L,
    inherited: BTreeMap<String, String>,
}

impl<'a, L: Launcher> Reconciler<'a, L> {
    pub fn new(settings: &'a Settings, launcher: L, inherited: BTreeMap<String, String>) -> Self {
        Self {
            settings,
            launcher,
            inherited,
        }
    }

    /// Load phase. Writes the diagnostic listing to `out` when a variable
    /// file was found. Never fails: an unusable file leaves the overlay empty.
    pub fn load<W: Write>(&self, out: &mut W) -> RuntimeEnv {
        let env = match RuntimeEnv::load(&self.settings.env_file_path()) {
            Ok(Some(env)) => env,
            Ok(None) => return RuntimeEnv::default(),
            Err(err) => {
                tracing::warn!("{}", err);
                return RuntimeEnv::default();
            }
        };

        let effective = env.effective(&self.inherited);
        let diagnostics = Diagnostics::new(
            &effective,
            &self.settings.diagnostic_patterns,
            self.settings.mask_values,
        );
        if let Err(err) = diagnostics.write_to(out) {
            tracing::warn!(error = %err, "failed to write variable listing");
        }
        env
    }

    pub fn status(&self, env: &RuntimeEnv) -> Result<BuildStatus> {
        build::check_status(self.settings, &env.effective(&self.inherited))
    }

    /// Run the build command unconditionally and record a manifest on success.
    pub fn build(&mut self, env: &RuntimeEnv) -> Result<BuildOutcome> {
        let spec = CommandSpec::from_argv("build", &self.settings.build_command)?;
        let child = self.child_env(env);

        tracing::info!(command = %spec.display(), "building application");
        let outcome = self
            .launcher
            .build(&spec, &self.settings.app_root, &child)?;

        if outcome.success {
            tracing::info!("build finished");
            // The manifest is bookkeeping only; without it the build reads as unrecorded.
            if let Err(err) = build::record_build(self.settings, &env.effective(&self.inherited)) {
                tracing::warn!("{}", err);
            }
        }
        Ok(outcome)
    }

    /// Build-check phase.
    pub fn build_phase(&mut self, env: &RuntimeEnv) -> Result<BuildPhase> {
        let status = self.status(env).unwrap_or_else(|err| {
            tracing::warn!("{}", err);
            BuildStatus::Unrecorded
        });
        if !status.needs_build() {
            tracing::info!(%status, "reusing existing build");
            return Ok(BuildPhase::Skipped(status));
        }

        tracing::info!(%status, "build required");
        let outcome = self.build(env)?;
        if outcome.success {
            Ok(BuildPhase::Built)
        } else {
            Ok(BuildPhase::Failed(outcome))
        }
    }

    /// Launch phase. Returns the exit code for this process when the
    /// launcher hands control back.
    pub fn launch(&mut self, env: &RuntimeEnv, start_command: Option<&[String]>) -> Result<i32> {
        let argv = start_command.unwrap_or(&self.settings.start_command);
        let spec = CommandSpec::from_argv("start", argv)?;
        let child = self.child_env(env);

        tracing::info!(command = %spec.display(), "starting server");
        match self.launcher.launch(&spec, &self.settings.app_root, &child) {
            Ok(code) => Ok(code),
            Err(Error::Spawn { program, source }) => {
                tracing::error!(program = %program, error = %source, "failed to start server");
                Ok(EXEC_FAILED_CODE)
            }
            Err(err) => Err(err),
        }
    }

    /// The full sequence. `start_command` replaces the configured one.
    pub fn run<W: Write>(mut self, out: &mut W, start_command: Option<&[String]>) -> Result<i32> {
        let env = self.load(out);

        if let BuildPhase::Failed(outcome) = self.build_phase(&env)? {
            let command = self.settings.build_command.join(" ");
            match self.settings.on_build_failure {
                BuildFailurePolicy::Halt => {
                    let err = Error::BuildFailed {
                        command,
                        status: outcome.describe(),
                    };
                    tracing::error!("{}", err);
                    return Ok(outcome.code.filter(|code| *code != 0).unwrap_or(1));
                }
                BuildFailurePolicy::Continue => {
                    tracing::warn!(
                        command = %command,
                        status = %outcome.describe(),
                        "build failed, launching anyway"
                    );
                }
            }
        }

        self.launch(&env, start_command)
    }

    /// Variables added to every child: the file's entries plus `PORT` when
    /// nothing else sets it.
    fn child_env(&self, env: &RuntimeEnv) -> BTreeMap<String, String> {
        let mut child: BTreeMap<String, String> =
            env.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        if env.get("PORT").is_none() && !self.inherited.contains_key("PORT") {
            child.insert("PORT".to_string(), self.settings.port.to_string());
        }
        child
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MarkerMode;
    use pretty_assertions::assert_eq;
    use std::fs;
    use std::path::{Path, PathBuf};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Build(String),
        Launch(String),
    }

    /// Records every invocation; a successful build creates the build dir.
    struct FakeLauncher {
        calls: Vec<Call>,
        envs: Vec<BTreeMap<String, String>>,
        build_code: i32,
        build_dir: PathBuf,
        launch_error: bool,
    }

    impl FakeLauncher {
        fn new(build_dir: PathBuf) -> Self {
            Self {
                calls: Vec::new(),
                envs: Vec::new(),
                build_code: 0,
                build_dir,
                launch_error: false,
            }
        }
    }

    impl Launcher for &mut FakeLauncher {
        fn build(&mut self, spec: &CommandSpec, _dir: &Path, env: &BTreeMap<String, String>) -> Result<BuildOutcome> {
            self.calls.push(Call::Build(spec.display()));
            self.envs.push(env.clone());
            if self.build_code == 0 {
                let _ = fs::create_dir_all(&self.build_dir);
            }
            Ok(BuildOutcome {
                success: self.build_code == 0,
                code: Some(self.build_code),
            })
        }

        fn launch(&mut self, spec: &CommandSpec, _dir: &Path, env: &BTreeMap<String, String>) -> Result<i32> {
            self.calls.push(Call::Launch(spec.display()));
            self.envs.push(env.clone());
            if self.launch_error {
                return Err(Error::Spawn {
                    program: spec.program.clone(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                });
            }
            Ok(0)
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        settings: Settings,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            fs::write(dir.path().join("package.json"), "{}").unwrap();
            let mut settings = Settings::default();
            settings.app_root = dir.path().to_path_buf();
            Self { dir, settings }
        }

        fn write_env(&self, content: &str) {
            fs::write(self.dir.path().join(".env"), content).unwrap();
        }

        fn launcher(&self) -> FakeLauncher {
            FakeLauncher::new(self.settings.build_dir_path())
        }

        fn run(&self, launcher: &mut FakeLauncher) -> (i32, String) {
            let mut out = Vec::new();
            let code = Reconciler::new(&self.settings, launcher, BTreeMap::new())
                .run(&mut out, None)
                .unwrap();
            (code, String::from_utf8(out).unwrap())
        }
    }

    const BUILD: &str = "npm run build";
    const START: &str = "npm run start";

    #[test]
    fn scenario_variables_reach_children_and_listing() {
        let fixture = Fixture::new();
        fixture.write_env("DB_HOST=localhost\nNEXT_PUBLIC_API=https://x\n");
        let mut launcher = fixture.launcher();

        let (code, out) = fixture.run(&mut launcher);

        assert_eq!(code, 0);
        assert!(out.contains("DB_HOST=localhost\n"));
        assert!(out.contains("NEXT_PUBLIC_API=https://x\n"));
        for env in &launcher.envs {
            assert_eq!(env.get("DB_HOST").map(String::as_str), Some("localhost"));
            assert_eq!(env.get("NEXT_PUBLIC_API").map(String::as_str), Some("https://x"));
        }
    }

    #[test]
    fn no_variable_file_adds_nothing() {
        let fixture = Fixture::new();
        let mut launcher = fixture.launcher();
        let reconciler = Reconciler::new(&fixture.settings, &mut launcher, BTreeMap::new());
        let mut out = Vec::new();
        let env = reconciler.load(&mut out);
        assert!(env.is_empty());
        assert!(out.is_empty());
        drop(reconciler);
        assert!(launcher.calls.is_empty());
    }

    #[test]
    fn missing_build_triggers_single_build_before_launch() {
        let fixture = Fixture::new();
        let mut launcher = fixture.launcher();
        fixture.run(&mut launcher);
        assert_eq!(
            launcher.calls,
            vec![Call::Build(BUILD.into()), Call::Launch(START.into())]
        );
    }

    #[test]
    fn current_build_is_not_rebuilt() {
        let mut fixture = Fixture::new();
        fixture.settings.marker = MarkerMode::Manifest;
        let mut first = fixture.launcher();
        fixture.run(&mut first);

        let mut second = fixture.launcher();
        fixture.run(&mut second);
        assert_eq!(second.calls, vec![Call::Launch(START.into())]);
    }

    #[test]
    fn existing_dir_skips_build_by_default() {
        let fixture = Fixture::new();
        fs::create_dir(fixture.dir.path().join(".next")).unwrap();
        let mut launcher = fixture.launcher();
        fixture.run(&mut launcher);
        assert_eq!(launcher.calls, vec![Call::Launch(START.into())]);
    }

    #[test]
    fn changed_public_variable_triggers_rebuild() {
        let mut fixture = Fixture::new();
        fixture.settings.marker = MarkerMode::Manifest;
        fixture.write_env("NEXT_PUBLIC_API=https://x\n");
        fixture.run(&mut fixture.launcher());

        fixture.write_env("NEXT_PUBLIC_API=https://y\n");
        let mut launcher = fixture.launcher();
        fixture.run(&mut launcher);
        assert_eq!(
            launcher.calls,
            vec![Call::Build(BUILD.into()), Call::Launch(START.into())]
        );
    }

    #[test]
    fn failed_build_halts_when_configured() {
        let mut fixture = Fixture::new();
        fixture.settings.on_build_failure = BuildFailurePolicy::Halt;
        let mut launcher = fixture.launcher();
        launcher.build_code = 2;
        let (code, _) = fixture.run(&mut launcher);
        assert_eq!(code, 2);
        assert_eq!(launcher.calls, vec![Call::Build(BUILD.into())]);
        assert!(!fixture.settings.build_dir_path().exists());
    }

    #[test]
    fn failed_build_still_launches_by_default() {
        let fixture = Fixture::new();
        fixture.write_env("DB_HOST=localhost\n");
        let mut launcher = fixture.launcher();
        launcher.build_code = 1;
        let (code, _) = fixture.run(&mut launcher);
        assert_eq!(code, 0);
        assert_eq!(
            launcher.calls,
            vec![Call::Build(BUILD.into()), Call::Launch(START.into())]
        );
        assert_eq!(
            launcher.envs[1].get("DB_HOST").map(String::as_str),
            Some("localhost")
        );
    }

    #[test]
    fn unreadable_variable_file_still_launches() {
        let fixture = Fixture::new();
        fs::write(fixture.dir.path().join(".env"), b"GOOD=1\nBAD=\xff\xfe\n").unwrap();
        let mut launcher = fixture.launcher();
        let (code, out) = fixture.run(&mut launcher);
        assert_eq!(code, 0);
        assert!(out.is_empty());
        assert_eq!(launcher.calls.last(), Some(&Call::Launch(START.into())));
        let env = launcher.envs.last().unwrap();
        assert_eq!(env.get("GOOD").map(String::as_str), Some("1"));
        assert!(!env.contains_key("BAD"));
    }

    #[test]
    fn unwritable_manifest_still_launches() {
        let mut fixture = Fixture::new();
        fixture.settings.marker = MarkerMode::Manifest;
        // A plain file where the build directory should be: the build
        // "succeeds" but the manifest cannot be written under it.
        fs::write(fixture.settings.build_dir_path(), "not a dir").unwrap();
        let mut launcher = fixture.launcher();
        let (code, _) = fixture.run(&mut launcher);
        assert_eq!(code, 0);
        assert_eq!(
            launcher.calls,
            vec![Call::Build(BUILD.into()), Call::Launch(START.into())]
        );
    }

    #[cfg(unix)]
    #[test]
    fn fingerprint_error_is_treated_as_unrecorded() {
        let mut fixture = Fixture::new();
        fixture.settings.marker = MarkerMode::Manifest;
        build::record_build(&fixture.settings, &BTreeMap::new()).unwrap();
        std::os::unix::fs::symlink(fixture.dir.path(), fixture.dir.path().join("loop")).unwrap();
        let mut launcher = fixture.launcher();
        let (code, _) = fixture.run(&mut launcher);
        assert_eq!(code, 0);
        assert_eq!(
            launcher.calls,
            vec![Call::Build(BUILD.into()), Call::Launch(START.into())]
        );
    }

    #[test]
    fn port_defaults_unless_set() {
        let fixture = Fixture::new();
        let mut launcher = fixture.launcher();
        fixture.run(&mut launcher);
        assert_eq!(launcher.envs[1].get("PORT").map(String::as_str), Some("3000"));

        fixture.write_env("PORT=8080\n");
        let mut launcher = fixture.launcher();
        fixture.run(&mut launcher);
        assert_eq!(launcher.envs.last().unwrap().get("PORT").map(String::as_str), Some("8080"));

        let mut launcher = fixture.launcher();
        fs::remove_file(fixture.dir.path().join(".env")).unwrap();
        let inherited = BTreeMap::from([("PORT".to_string(), "9000".to_string())]);
        Reconciler::new(&fixture.settings, &mut launcher, inherited)
            .run(&mut Vec::new(), None)
            .unwrap();
        assert!(!launcher.envs.last().unwrap().contains_key("PORT"));
    }

    #[test]
    fn start_command_override_is_used() {
        let fixture = Fixture::new();
        let mut launcher = fixture.launcher();
        let argv = vec!["node".to_string(), "server.js".to_string()];
        Reconciler::new(&fixture.settings, &mut launcher, BTreeMap::new())
            .run(&mut Vec::new(), Some(&argv))
            .unwrap();
        assert_eq!(launcher.calls.last(), Some(&Call::Launch("node server.js".into())));
    }

    #[test]
    fn exec_failure_maps_to_127() {
        let fixture = Fixture::new();
        let mut launcher = fixture.launcher();
        launcher.launch_error = true;
        let (code, _) = fixture.run(&mut launcher);
        assert_eq!(code, EXEC_FAILED_CODE);
    }
}
