//! External command execution for build steps.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;

use tracing::debug;

use crate::ProvisionError;

/// A fully rendered command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            current_dir: None,
        }
    }

    /// Build from an argv-style list (`["apt-get", "update"]`). Returns
    /// `None` for an empty list.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone(), args.to_vec()))
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " {arg:?}")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Runs build commands. Any non-zero exit is an error.
pub trait CommandRunner {
    fn run(&self, cmd: &CommandSpec) -> impl Future<Output = Result<(), ProvisionError>> + Send;
}

/// Executes commands on the host, streaming their output to ours so the
/// raw tool output ends up in the build log.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    async fn run(&self, cmd: &CommandSpec) -> Result<(), ProvisionError> {
        let mut command = tokio::process::Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        if let Some(dir) = &cmd.current_dir {
            command.current_dir(dir);
        }

        debug!("Running: {}", cmd);

        let status = command.status().await.map_err(|source| ProvisionError::Spawn {
            program: cmd.program.clone(),
            source,
        })?;

        if status.success() {
            Ok(())
        } else {
            Err(ProvisionError::CommandFailed {
                command: cmd.to_string(),
                code: status.code().unwrap_or(-1),
            })
        }
    }
}
