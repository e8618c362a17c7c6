//! Shell resolution shared by the session runtime (C6) and smux.
//!
//! Grounded in the teacher's `local::shell` scan/label table, narrowed to
//! what spec.md §4.3 actually specifies: a configured absolute path, and a
//! login-mode flag for the two shells that recognise one.

use std::path::PathBuf;

use crate::error::{Result, ServerError};

/// The shell a session runtime spawns, resolved once at server
/// construction (Open Question, spec.md §9: validated up-front, not
/// lazily per-session).
#[derive(Debug, Clone)]
pub struct Shell {
    pub path: PathBuf,
}

impl Shell {
    /// Validate that `path` exists and is executable. Called at
    /// `ServerConfig::build()` time so a missing shell is a startup
    /// failure, never a per-session surprise.
    pub fn resolve(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.is_absolute() {
            return Err(ServerError::Config(format!(
                "shell path must be absolute: {}",
                path.display()
            )));
        }
        if !path.exists() {
            return Err(ServerError::Config(format!(
                "configured shell does not exist: {}",
                path.display()
            )));
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let meta = std::fs::metadata(&path)?;
            if meta.permissions().mode() & 0o111 == 0 {
                return Err(ServerError::Config(format!(
                    "configured shell is not executable: {}",
                    path.display()
                )));
            }
        }
        Ok(Self { path })
    }

    fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("")
    }

    /// Login-shell argv for an interactive `shell` request: `-l` for bash
    /// and fish, nothing otherwise (spec.md §4.3's `shell` row).
    pub fn login_args(&self) -> Vec<String> {
        match self.file_name() {
            "bash" | "fish" => vec!["-l".to_string()],
            _ => vec![],
        }
    }

    /// `argv` for an `exec` request: `<shell> -c <command>`.
    pub fn exec_args(&self, command: &str) -> Vec<String> {
        vec!["-c".to_string(), command.to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bash_gets_login_flag() {
        let shell = Shell {
            path: PathBuf::from("/bin/bash"),
        };
        assert_eq!(shell.login_args(), vec!["-l".to_string()]);
    }

    #[test]
    fn dash_gets_no_login_flag() {
        let shell = Shell {
            path: PathBuf::from("/bin/dash"),
        };
        assert!(shell.login_args().is_empty());
    }

    #[test]
    fn resolve_rejects_relative_path() {
        assert!(Shell::resolve("bin/bash").is_err());
    }

    #[test]
    fn resolve_rejects_missing_path() {
        assert!(Shell::resolve("/no/such/shell-binary").is_err());
    }
}
