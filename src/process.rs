use std::collections::BTreeMap;
use std::path::Path;
use std::process::{Command, ExitStatus};

use crate::error::{Error, Result};

/// Exit code used when the start command cannot be executed at all.
pub const EXEC_FAILED_CODE: i32 = 127;

/// An argv vector taken from the settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn from_argv(kind: &'static str, argv: &[String]) -> Result<Self> {
        let (program, args) = argv.split_first().ok_or(Error::EmptyCommand(kind))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn command(&self, dir: &Path, env: &BTreeMap<String, String>) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).current_dir(dir).envs(env);
        command
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildOutcome {
    pub success: bool,
    pub code: Option<i32>,
}

impl BuildOutcome {
    pub fn describe(&self) -> String {
        match self.code {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

impl From<ExitStatus> for BuildOutcome {
    fn from(status: ExitStatus) -> Self {
        Self {
            success: status.success(),
            code: status.code(),
        }
    }
}

/// Process boundary of the reconciler. `env` holds only the variables to
/// add on top of the inherited environment.
pub trait Launcher {
    /// Run the build command to completion.
    fn build(&mut self, spec: &CommandSpec, dir: &Path, env: &BTreeMap<String, String>) -> Result<BuildOutcome>;

    /// Hand control to the server. Returns the exit code this process should
    /// exit with; on Unix a successful launch never returns.
    fn launch(&mut self, spec: &CommandSpec, dir: &Path, env: &BTreeMap<String, String>) -> Result<i32>;
}

pub struct SystemLauncher;

impl Launcher for SystemLauncher {
    fn build(&mut self, spec: &CommandSpec, dir: &Path, env: &BTreeMap<String, String>) -> Result<BuildOutcome> {
        let status = spec
            .command(dir, env)
            .status()
            .map_err(|source| Error::Spawn {
                program: spec.program.clone(),
                source,
            })?;
        Ok(status.into())
    }

    #[cfg(unix)]
    fn launch(&mut self, spec: &CommandSpec, dir: &Path, env: &BTreeMap<String, String>) -> Result<i32> {
        use std::os::unix::process::CommandExt;

        // exec only returns on failure.
        let source = spec.command(dir, env).exec();
        Err(Error::Spawn {
            program: spec.program.clone(),
            source,
        })
    }

    #[cfg(not(unix))]
    fn launch(&mut self, spec: &CommandSpec, dir: &Path, env: &BTreeMap<String, String>) -> Result<i32> {
        let status = spec
            .command(dir, env)
            .status()
            .map_err(|source| Error::Spawn {
                program: spec.program.clone(),
                source,
            })?;
        Ok(status.code().unwrap_or(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_argv() {
        let spec = CommandSpec::from_argv("start", &["npm".into(), "run".into(), "start".into()]).unwrap();
        assert_eq!(spec.program, "npm");
        assert_eq!(spec.args, vec!["run", "start"]);
        assert_eq!(spec.display(), "npm run start");
    }

    #[test]
    fn empty_argv_is_rejected() {
        let err = CommandSpec::from_argv("build", &[]).unwrap_err();
        assert_eq!(err.to_string(), "build command is empty");
    }

    #[cfg(unix)]
    #[test]
    fn build_passes_overlay_and_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let spec = CommandSpec::from_argv(
            "build",
            &["sh".into(), "-c".into(), "test \"$MARK\" = yes && exit 3".into()],
        )
        .unwrap();
        let env = BTreeMap::from([("MARK".to_string(), "yes".to_string())]);
        let outcome = SystemLauncher.build(&spec, dir.path(), &env).unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.code, Some(3));
        assert_eq!(outcome.describe(), "exit code 3");
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let spec = CommandSpec::from_argv("build", &["nextboot-definitely-missing".into()]).unwrap();
        let err = SystemLauncher.build(&spec, dir.path(), &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
    }
}
