mod error;
mod executor;
mod sanitize;
mod workspace;

// Re-export the public surface
pub use error::{ExecutionFailure, WorkspaceError};
pub use executor::{
    DEFAULT_GRACE_PERIOD, DEFAULT_TIMEOUT, ExecutionRequest, ExecutionResult, Executor, Latch,
};
pub use sanitize::{FALLBACK_NAME, MAX_SEGMENT_LEN, sanitize};
pub use workspace::{
    Dependency, MANIFEST_FILE, PACKAGE_NAME, SOURCE_DIR, SOURCE_FILE, Workspace, WorkspaceManager,
    WorkspaceRegistry, WorkspaceSpec, render_manifest,
};
