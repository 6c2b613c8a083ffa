use std::collections::HashMap;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BuildError>;

/// Failure kinds a single package task can raise (spec §7).
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("dependency {0} is not in the build plan and is not a core package")]
    DependencyMissing(String),

    #[error("dependency {0} failed to build")]
    DependencyFailed(String),

    #[error("required tool {0} was not found among any providing package")]
    ToolMissing(String),

    #[error("`{0}` exited with {1}")]
    ProcessFailed(String, i32),

    #[error("stage {0} timed out after {1:?}")]
    Timeout(String, std::time::Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BuildError {
    /// Truncate to 500 chars of display, per the ledger/errors-map policy (spec §7a).
    pub fn truncated_display(&self) -> String {
        let s = self.to_string();
        if s.len() <= 500 {
            s
        } else {
            let mut cut = 500;
            while !s.is_char_boundary(cut) {
                cut -= 1;
            }
            format!("{}...", &s[..cut])
        }
    }
}

/// Aggregate error the driver raises when any package task fails (spec §4.8, §7).
#[derive(Debug)]
pub struct BuildException {
    pub errors: HashMap<String, String>,
    pub warnings: Vec<String>,
}

impl std::fmt::Display for BuildException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "build failed for {} package(s):", self.errors.len())?;
        for (name, err) in &self.errors {
            writeln!(f, "  {name}: {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for BuildException {}
