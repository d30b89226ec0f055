//! What to run: a shell command line or a direct argv

use std::borrow::Cow;
use std::path::Path;

use tokio::process::Command;

use super::ExecError;

/// A command to execute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// Command line interpreted by `sh -c`
    Shell(String),
    /// Program and arguments executed directly, without a shell
    Argv(Vec<String>),
}

impl Invocation {
    pub fn shell(command: impl Into<String>) -> Self {
        Invocation::Shell(command.into())
    }

    pub fn argv<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Invocation::Argv(args.into_iter().map(Into::into).collect())
    }

    /// Human-readable command text; argv entries are shell-quoted
    pub fn display(&self) -> String {
        match self {
            Invocation::Shell(command) => command.clone(),
            Invocation::Argv(args) => args
                .iter()
                .map(|arg| shell_escape::escape(Cow::Borrowed(arg.as_str())).into_owned())
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    /// Name of the program that will be spawned, for error messages
    pub fn program_name(&self) -> String {
        match self {
            Invocation::Shell(command) => command
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_string(),
            Invocation::Argv(args) => args.first().cloned().unwrap_or_default(),
        }
    }

    pub(crate) fn to_command(&self) -> Result<Command, ExecError> {
        match self {
            Invocation::Shell(command) => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(command);
                Ok(cmd)
            }
            Invocation::Argv(args) => {
                let (program, rest) = args
                    .split_first()
                    .ok_or_else(|| ExecError::ProcessNotFound("(empty argv)".to_string()))?;
                let mut cmd = Command::new(program);
                cmd.args(rest);
                Ok(cmd)
            }
        }
    }
}

/// File name of a program path (`/usr/bin/git` -> `git`)
pub(crate) fn base_name(program: &str) -> &str {
    if program.contains('/') {
        Path::new(program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(program)
    } else {
        program
    }
}
