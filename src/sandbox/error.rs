use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failures of the workspace manager
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("workspace path is empty")]
    EmptyPath,

    #[error("refusing to touch {path}: outside temp folder {root}")]
    OutsideTempRoot { path: PathBuf, root: PathBuf },

    #[error("invalid dependency `{name}` = `{version}`")]
    InvalidDependency { name: String, version: String },

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl WorkspaceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this is a containment refusal
    pub fn is_containment_violation(&self) -> bool {
        matches!(self, Self::OutsideTempRoot { .. } | Self::EmptyPath)
    }
}

/// Executor-level failures. A non-zero exit code is not one of these.
#[derive(Debug, Error)]
pub enum ExecutionFailure {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The process started but waiting on it failed
    #[error("failed to wait on `{command}`: {source}")]
    Wait {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process exceeded time limit of {}ms", limit.as_millis())]
    TimeoutExceeded { limit: Duration },
}
