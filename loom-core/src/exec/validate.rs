//! Command validation and working-directory confinement
//!
//! Validation runs before anything is spawned. A rejected command never
//! reaches the process runner.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::invocation::{base_name, Invocation};
use super::ExecError;

/// How strictly commands are validated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellMode {
    /// Only allow-listed programs, no shell metacharacters
    Safe,
    /// Any program that is not deny-listed, no shell metacharacters
    #[default]
    Restricted,
    /// Any program that is not deny-listed
    Permissive,
}

impl std::str::FromStr for ShellMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "safe" => Ok(ShellMode::Safe),
            "restricted" => Ok(ShellMode::Restricted),
            "permissive" => Ok(ShellMode::Permissive),
            other => Err(format!(
                "unknown shell mode '{}', expected safe, restricted or permissive",
                other
            )),
        }
    }
}

/// Programs allowed in [`ShellMode::Safe`]
pub const DEFAULT_ALLOWED_COMMANDS: &[&str] = &[
    "ls", "cat", "echo", "pwd", "whoami", "date", "which", "head", "tail", "grep", "find", "sort",
    "uniq", "wc", "cut", "awk", "sed", "tr", "git", "python", "python3", "node", "npm", "yarn",
    "pip", "pip3", "just", "make", "cmake", "cargo", "go", "java", "javac", "mvn", "docker",
    "kubectl", "helm", "terraform", "ansible", "sleep", "true", "false",
];

/// Programs rejected in every mode
pub const DEFAULT_BLOCKED_COMMANDS: &[&str] = &[
    "rm", "rmdir", "mv", "cp", "dd", "shred", "kill", "killall", "pkill", "shutdown", "reboot",
    "halt", "poweroff", "su", "sudo", "passwd", "chown", "chmod", "chgrp", "mount", "umount",
    "fdisk", "mkfs", "format", "del", "deltree", "rd", "erase",
];

/// Subshell, pipe, redirect, chaining and backgrounding operators. A line
/// break separates commands in `sh -c` the same way `;` does.
const METACHARACTERS: &[&str] = &[
    "$(", "`", "&&", "||", ";", "|", ">", "<", "&", "\n", "\r",
];

/// Words that hand control to another interpreter
const BLOCKED_WORDS: &[&str] = &["eval", "exec"];

/// Allow/deny lists plus the mode that decides which checks apply
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    mode: ShellMode,
    allowed: HashSet<String>,
    blocked: HashSet<String>,
}

impl CommandPolicy {
    /// Build a policy from the default lists extended with extra entries
    pub fn new(mode: ShellMode, extra_allowed: &[String], extra_blocked: &[String]) -> Self {
        let allowed = DEFAULT_ALLOWED_COMMANDS
            .iter()
            .map(|s| s.to_string())
            .chain(extra_allowed.iter().cloned())
            .collect();
        let blocked = DEFAULT_BLOCKED_COMMANDS
            .iter()
            .map(|s| s.to_string())
            .chain(extra_blocked.iter().cloned())
            .collect();

        Self {
            mode,
            allowed,
            blocked,
        }
    }

    pub fn mode(&self) -> ShellMode {
        self.mode
    }

    /// Reject the invocation if it violates the policy
    pub fn check(&self, invocation: &Invocation) -> Result<(), ExecError> {
        match invocation {
            Invocation::Shell(command) => {
                let tokens = split_command(command)?;
                let first = tokens
                    .first()
                    .ok_or_else(|| ExecError::SecurityRejected("Empty command".to_string()))?;
                self.check_program(base_name(first))?;

                if self.mode != ShellMode::Permissive {
                    if let Some(pattern) = METACHARACTERS.iter().find(|p| command.contains(*p)) {
                        return Err(ExecError::SecurityRejected(format!(
                            "Command contains dangerous pattern: {}",
                            pattern.escape_debug()
                        )));
                    }
                    if let Some(word) = tokens
                        .iter()
                        .find(|t| BLOCKED_WORDS.contains(&base_name(t)))
                    {
                        return Err(ExecError::SecurityRejected(format!(
                            "Command contains dangerous pattern: {}",
                            word
                        )));
                    }
                }
                Ok(())
            }
            Invocation::Argv(args) => {
                let first = args
                    .first()
                    .ok_or_else(|| ExecError::SecurityRejected("Empty command".to_string()))?;
                self.check_program(base_name(first))
            }
        }
    }

    fn check_program(&self, program: &str) -> Result<(), ExecError> {
        if self.blocked.contains(program) {
            return Err(ExecError::SecurityRejected(format!(
                "Command '{}' is not allowed",
                program
            )));
        }
        if self.mode == ShellMode::Safe && !self.allowed.contains(program) {
            return Err(ExecError::SecurityRejected(format!(
                "Command '{}' not in safe commands list",
                program
            )));
        }
        Ok(())
    }
}

/// Split a command line into words the way a POSIX shell would quote them
///
/// Handles single quotes, double quotes (with `\"`, `\\`, `\$` and `` \` ``
/// escapes) and bare backslash escapes. Unterminated quotes are rejected.
pub fn split_command(command: &str) -> Result<Vec<String>, ExecError> {
    let invalid = |reason: &str| {
        ExecError::SecurityRejected(format!("Invalid command syntax: {}", reason))
    };

    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => return Err(invalid("no closing quotation")),
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(ch @ ('"' | '\\' | '$' | '`')) => current.push(ch),
                            Some(ch) => {
                                current.push('\\');
                                current.push(ch);
                            }
                            None => return Err(invalid("no closing quotation")),
                        },
                        Some(ch) => current.push(ch),
                        None => return Err(invalid("no closing quotation")),
                    }
                }
            }
            '\\' => {
                in_token = true;
                match chars.next() {
                    Some(ch) => current.push(ch),
                    None => return Err(invalid("no escaped character")),
                }
            }
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }

    if in_token {
        tokens.push(current);
    }

    Ok(tokens)
}

/// Set of directories commands may run in; empty means unrestricted
#[derive(Debug, Clone, Default)]
pub struct PathConfinement {
    roots: Vec<PathBuf>,
}

impl PathConfinement {
    pub fn new<I, P>(roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        Self {
            roots: roots.into_iter().map(|p| resolve_path(p.as_ref())).collect(),
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        self.roots.is_empty()
    }

    /// Resolve `cwd` and make sure it lies under one of the roots
    pub fn check(&self, cwd: &Path) -> Result<PathBuf, ExecError> {
        let resolved = resolve_path(cwd);
        if self.is_unrestricted() || self.roots.iter().any(|root| resolved.starts_with(root)) {
            Ok(resolved)
        } else {
            Err(ExecError::PermissionDenied(cwd.to_path_buf()))
        }
    }
}

/// Canonicalize when the path exists, otherwise normalize it lexically
pub(crate) fn resolve_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }

    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|dir| dir.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn policy(mode: ShellMode) -> CommandPolicy {
        CommandPolicy::new(mode, &[], &[])
    }

    #[test]
    fn test_split_command_quotes() {
        let tokens = split_command(r#"git commit -m "fix: the \"thing\"" 'a b' c\ d"#).unwrap();
        assert_eq!(
            tokens,
            vec!["git", "commit", "-m", "fix: the \"thing\"", "a b", "c d"]
        );
    }

    #[test]
    fn test_split_command_empty_quotes_are_tokens() {
        assert_eq!(split_command("echo ''").unwrap(), vec!["echo", ""]);
        assert!(split_command("   ").unwrap().is_empty());
    }

    #[test]
    fn test_split_command_unterminated() {
        assert!(matches!(
            split_command("echo 'oops"),
            Err(ExecError::SecurityRejected(_))
        ));
    }

    #[test]
    fn test_deny_list_applies_in_every_mode() {
        for mode in [ShellMode::Safe, ShellMode::Restricted, ShellMode::Permissive] {
            let err = policy(mode)
                .check(&Invocation::shell("rm -rf /tmp/something"))
                .unwrap_err();
            assert!(err.to_string().contains("'rm' is not allowed"));
        }
    }

    #[test]
    fn test_deny_list_uses_base_name() {
        let err = policy(ShellMode::Permissive)
            .check(&Invocation::shell("/bin/rm -rf x"))
            .unwrap_err();
        assert!(matches!(err, ExecError::SecurityRejected(_)));
    }

    #[test]
    fn test_safe_mode_requires_allow_list() {
        assert!(policy(ShellMode::Safe)
            .check(&Invocation::shell("frobnicate --all"))
            .is_err());
        assert!(policy(ShellMode::Restricted)
            .check(&Invocation::shell("frobnicate --all"))
            .is_ok());

        let extended = CommandPolicy::new(ShellMode::Safe, &["frobnicate".to_string()], &[]);
        assert!(extended.check(&Invocation::shell("frobnicate --all")).is_ok());
    }

    #[test]
    fn test_metacharacters_rejected_unless_permissive() {
        for command in [
            "echo hi | cat",
            "echo hi > out.txt",
            "echo $(whoami)",
            "git status && git pull",
            "ls; ls",
            "echo `date`",
        ] {
            assert!(
                policy(ShellMode::Restricted)
                    .check(&Invocation::shell(command))
                    .is_err(),
                "{} should be rejected",
                command
            );
            assert!(policy(ShellMode::Permissive)
                .check(&Invocation::shell(command))
                .is_ok());
        }
    }

    #[test]
    fn test_line_breaks_and_background_rejected() {
        for command in [
            "echo hi\nrm -rf /tmp/loom-test",
            "echo hi\r\nls",
            "sleep 1 & rm -rf /tmp/loom-test",
            "git status&",
        ] {
            for mode in [ShellMode::Safe, ShellMode::Restricted] {
                let result = policy(mode).check(&Invocation::shell(command));
                assert!(
                    matches!(result, Err(ExecError::SecurityRejected(_))),
                    "{:?} should be rejected in {:?} mode",
                    command,
                    mode
                );
            }
        }

        match policy(ShellMode::Restricted).check(&Invocation::shell("echo a\nls")) {
            Err(ExecError::SecurityRejected(msg)) => assert!(msg.ends_with("\\n"), "{}", msg),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_eval_word_rejected() {
        assert!(policy(ShellMode::Restricted)
            .check(&Invocation::shell("eval echo hi"))
            .is_err());
        // substring inside another word is fine
        assert!(policy(ShellMode::Restricted)
            .check(&Invocation::shell("echo filesystem"))
            .is_ok());
    }

    #[test]
    fn test_argv_skips_metacharacter_check() {
        let inv = Invocation::argv(["git", "stash", "push", "-m", "loom-stash-a; b | c"]);
        assert!(policy(ShellMode::Safe).check(&inv).is_ok());
    }

    #[test]
    fn test_extra_blocked_command() {
        let p = CommandPolicy::new(ShellMode::Permissive, &[], &["curl".to_string()]);
        assert!(p.check(&Invocation::argv(["curl", "example.com"])).is_err());
    }

    #[test]
    fn test_confinement() {
        let allowed = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        let inner = allowed.path().join("repo");
        std::fs::create_dir(&inner).unwrap();

        let confinement = PathConfinement::new([allowed.path()]);
        assert!(confinement.check(&inner).is_ok());
        assert!(matches!(
            confinement.check(other.path()),
            Err(ExecError::PermissionDenied(_))
        ));
        // `..` cannot escape the root
        assert!(confinement.check(&inner.join("../..")).is_err());
    }

    #[test]
    fn test_unrestricted_confinement() {
        let confinement = PathConfinement::default();
        assert!(confinement.is_unrestricted());
        assert!(confinement.check(Path::new("/")).is_ok());
    }

    #[test]
    fn test_shell_mode_from_str() {
        assert_eq!("SAFE".parse::<ShellMode>().unwrap(), ShellMode::Safe);
        assert!("loose".parse::<ShellMode>().is_err());
    }
}
