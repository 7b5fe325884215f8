use std::collections::HashSet;
use std::fmt::Write as _;
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::error::WorkspaceError;
use super::sanitize::sanitize;

/// Name of the manifest written at the workspace root
pub const MANIFEST_FILE: &str = "Cargo.toml";
/// Source subdirectory, relative to the workspace root
pub const SOURCE_DIR: &str = "src";
/// Source file name inside [`SOURCE_DIR`]
pub const SOURCE_FILE: &str = "lib.rs";
/// Package name used in every generated manifest
pub const PACKAGE_NAME: &str = "sandbox_project";

const SUFFIX_BYTES: usize = 8;
const CREATE_ATTEMPTS: usize = 4;

/// A `name = "version"` pair added to the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    pub version: String,
}

impl Dependency {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    fn validate(&self) -> Result<(), WorkspaceError> {
        let name_ok = !self.name.is_empty()
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        let version_ok = !self.version.is_empty()
            && !self
                .version
                .chars()
                .any(|c| c == '"' || c == '\\' || c.is_control());

        if name_ok && version_ok {
            Ok(())
        } else {
            Err(WorkspaceError::InvalidDependency {
                name: self.name.clone(),
                version: self.version.clone(),
            })
        }
    }
}

/// What a new workspace should contain
#[derive(Debug, Clone, Default)]
pub struct WorkspaceSpec {
    pub base_name: Option<String>,
    pub source: String,
    pub dependencies: Vec<Dependency>,
}

/// Set of workspace paths that have been created and not yet cleaned up
#[derive(Debug, Default)]
pub struct WorkspaceRegistry {
    live: Mutex<HashSet<PathBuf>>,
}

impl WorkspaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, path: PathBuf) -> bool {
        self.live.lock().insert(path)
    }

    fn remove(&self, path: &Path) -> bool {
        self.live.lock().remove(path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.live.lock().contains(path)
    }

    pub fn len(&self) -> usize {
        self.live.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.lock().is_empty()
    }

    /// Copy of the live paths, so the lock is not held during filesystem work
    pub fn snapshot(&self) -> Vec<PathBuf> {
        self.live.lock().iter().cloned().collect()
    }

    fn clear(&self) {
        self.live.lock().clear();
    }
}

#[derive(Debug)]
struct ManagerInner {
    temp_root: PathBuf,
    registry: WorkspaceRegistry,
}

/// Creates, populates and removes per-request project directories
///
/// Every directory the manager creates or deletes lives strictly below
/// `temp_root`. Clones share the same root and registry.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    inner: Arc<ManagerInner>,
}

impl WorkspaceManager {
    /// Creates the manager, creating and canonicalizing `temp_root` if needed
    pub fn new(temp_root: impl AsRef<Path>) -> Result<Self, WorkspaceError> {
        let temp_root = temp_root.as_ref();
        fs::create_dir_all(temp_root).map_err(|e| WorkspaceError::io(temp_root, e))?;
        let temp_root = temp_root
            .canonicalize()
            .map_err(|e| WorkspaceError::io(temp_root, e))?;

        log::debug!("Workspace root at {}", temp_root.display());

        Ok(Self {
            inner: Arc::new(ManagerInner {
                temp_root,
                registry: WorkspaceRegistry::new(),
            }),
        })
    }

    /// Uses `buildbox` under the OS temp directory as the root
    pub fn with_os_temp_dir() -> Result<Self, WorkspaceError> {
        Self::new(std::env::temp_dir().join("buildbox"))
    }

    pub fn temp_root(&self) -> &Path {
        &self.inner.temp_root
    }

    pub fn registry(&self) -> &WorkspaceRegistry {
        &self.inner.registry
    }

    /// Creates a uniquely named workspace holding a manifest and the source
    pub fn create_workspace(&self, spec: &WorkspaceSpec) -> Result<Workspace, WorkspaceError> {
        for dep in &spec.dependencies {
            dep.validate()?;
        }

        let base = sanitize(spec.base_name.as_deref());
        let root_path = self.create_unique_dir(&base)?;

        let (manifest_path, source_file_path) = populate_or_rollback(&root_path, spec)?;

        self.inner.registry.insert(root_path.clone());
        log::info!("Workspace {} created", root_path.display());

        Ok(Workspace {
            root_path,
            source_file_path,
            manifest_path,
            manager: self.clone(),
            released: false,
        })
    }

    fn create_unique_dir(&self, base: &str) -> Result<PathBuf, WorkspaceError> {
        let mut last_err = None;

        for _ in 0..CREATE_ATTEMPTS {
            let path = self.inner.temp_root.join(unique_dir_name(base));
            if self.inner.registry.contains(&path) {
                continue;
            }
            // `create_dir` fails on an existing directory, which is what
            // guarantees that a live path is never handed out twice
            match fs::create_dir(&path) {
                Ok(()) => return Ok(path),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    log::debug!("Workspace name collision on {}", path.display());
                    last_err = Some(WorkspaceError::io(&path, e));
                }
                Err(e) => return Err(WorkspaceError::io(&path, e)),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            WorkspaceError::io(
                &self.inner.temp_root,
                std::io::Error::new(ErrorKind::AlreadyExists, "no free workspace name"),
            )
        }))
    }

    /// Removes a workspace directory
    ///
    /// Refuses any path that is not strictly below the temp root without
    /// touching the filesystem. A missing directory counts as success.
    pub fn cleanup(&self, path: impl AsRef<Path>) -> Result<(), WorkspaceError> {
        let path = path.as_ref();
        self.check_containment(path)?;

        let result = match fs::remove_dir_all(path) {
            Ok(()) => {
                log::info!("Workspace {} removed", path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::debug!("Workspace {} already gone", path.display());
                Ok(())
            }
            Err(e) => Err(WorkspaceError::io(path, e)),
        };

        self.inner.registry.remove(path);
        result
    }

    /// Best-effort removal of every live workspace, for shutdown
    pub fn cleanup_all(&self) {
        let paths = self.inner.registry.snapshot();
        if !paths.is_empty() {
            log::info!("Sweeping {} live workspace(s)", paths.len());
        }

        for path in paths {
            if let Err(e) = self.cleanup(&path) {
                log::error!("Failed to clean up workspace {}: {e}", path.display());
            }
        }

        self.inner.registry.clear();
    }

    fn check_containment(&self, path: &Path) -> Result<(), WorkspaceError> {
        if path.as_os_str().is_empty() {
            return Err(WorkspaceError::EmptyPath);
        }

        let root = &self.inner.temp_root;
        let escapes = path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::CurDir));

        if escapes || path == root.as_path() || !path.starts_with(root) {
            return Err(WorkspaceError::OutsideTempRoot {
                path: path.to_path_buf(),
                root: root.clone(),
            });
        }

        // a symlinked component could still lead out of the root
        let resolved = resolve_existing_prefix(path).map_err(|e| WorkspaceError::io(path, e))?;
        if resolved == *root || !resolved.starts_with(root) {
            log::warn!(
                "{} resolves to {}, outside {}",
                path.display(),
                resolved.display(),
                root.display()
            );
            return Err(WorkspaceError::OutsideTempRoot {
                path: path.to_path_buf(),
                root: root.clone(),
            });
        }

        Ok(())
    }
}

/// A live workspace directory
///
/// Released exactly once, either through [`Workspace::release`] or, if the
/// owner never got that far, when dropped.
#[derive(Debug)]
pub struct Workspace {
    root_path: PathBuf,
    source_file_path: PathBuf,
    manifest_path: PathBuf,
    manager: WorkspaceManager,
    released: bool,
}

impl Workspace {
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn source_file_path(&self) -> &Path {
        &self.source_file_path
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    /// Deletes the workspace directory and unregisters it
    pub fn release(mut self) -> Result<(), WorkspaceError> {
        self.released = true;
        self.manager.cleanup(&self.root_path)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.manager.cleanup(&self.root_path) {
            log::error!(
                "Failed to release workspace {} on drop: {e}",
                self.root_path.display()
            );
        }
    }
}

/// `{base}-{unix millis}-{random hex}`
fn unique_dir_name(base: &str) -> String {
    let bytes: [u8; SUFFIX_BYTES] = rand::thread_rng().r#gen();
    format!(
        "{base}-{}-{}",
        Utc::now().timestamp_millis(),
        hex::encode(bytes)
    )
}

/// Canonicalizes the deepest existing ancestor of `path` and re-appends the
/// components below it that do not exist (yet)
fn resolve_existing_prefix(path: &Path) -> std::io::Result<PathBuf> {
    let mut missing = Vec::new();
    let mut current = path;
    loop {
        match fs::canonicalize(current) {
            Ok(resolved) => {
                return Ok(missing
                    .iter()
                    .rev()
                    .fold(resolved, |acc: PathBuf, name| acc.join(name)));
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let (Some(parent), Some(name)) = (current.parent(), current.file_name()) else {
                    return Err(e);
                };
                missing.push(name);
                current = parent;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Populates a freshly created directory, removing it again on failure
fn populate_or_rollback(
    root: &Path,
    spec: &WorkspaceSpec,
) -> Result<(PathBuf, PathBuf), WorkspaceError> {
    populate(root, spec).inspect_err(|_| {
        if let Err(cleanup_err) = fs::remove_dir_all(root) {
            log::warn!(
                "Failed to remove partial workspace {}: {cleanup_err}",
                root.display()
            );
        }
    })
}

fn populate(root: &Path, spec: &WorkspaceSpec) -> Result<(PathBuf, PathBuf), WorkspaceError> {
    let source_dir = root.join(SOURCE_DIR);
    fs::create_dir(&source_dir).map_err(|e| WorkspaceError::io(&source_dir, e))?;

    let manifest_path = root.join(MANIFEST_FILE);
    fs::write(&manifest_path, render_manifest(&spec.dependencies))
        .map_err(|e| WorkspaceError::io(&manifest_path, e))?;

    let source_file_path = source_dir.join(SOURCE_FILE);
    fs::write(&source_file_path, &spec.source)
        .map_err(|e| WorkspaceError::io(&source_file_path, e))?;

    Ok((manifest_path, source_file_path))
}

/// Renders the fixed manifest template
pub fn render_manifest(dependencies: &[Dependency]) -> String {
    let mut manifest = format!(
        r#"[package]
name = "{PACKAGE_NAME}"
version = "0.1.0"
edition = "2021"

[lib]
crate-type = ["cdylib", "rlib"]
path = "{SOURCE_DIR}/{SOURCE_FILE}"

[dependencies]
"#
    );

    for dep in dependencies {
        // infallible for String
        let _ = writeln!(manifest, "{} = \"{}\"", dep.name, dep.version);
    }

    manifest
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn manager() -> (tempfile::TempDir, WorkspaceManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path().join("root")).unwrap();
        (dir, manager)
    }

    fn spec(name: &str) -> WorkspaceSpec {
        WorkspaceSpec {
            base_name: Some(name.to_string()),
            source: "pub fn add(a: i32, b: i32) -> i32 { a + b }\n".to_string(),
            dependencies: vec![],
        }
    }

    #[test]
    fn test_create_populates_layout() {
        let (_dir, manager) = manager();
        let ws = manager.create_workspace(&spec("adder")).unwrap();

        assert!(ws.root_path().starts_with(manager.temp_root()));
        assert!(ws.root_path().is_absolute());
        assert_eq!(ws.manifest_path(), ws.root_path().join("Cargo.toml"));
        assert_eq!(ws.source_file_path(), ws.root_path().join("src/lib.rs"));
        assert_eq!(
            fs::read_to_string(ws.source_file_path()).unwrap(),
            "pub fn add(a: i32, b: i32) -> i32 { a + b }\n"
        );
        assert!(manager.registry().contains(ws.root_path()));

        let dir_name = ws.root_path().file_name().unwrap().to_string_lossy();
        assert!(dir_name.starts_with("adder-"));
        let suffix = dir_name.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), SUFFIX_BYTES * 2);

        ws.release().unwrap();
    }

    #[test]
    fn test_identical_names_get_distinct_paths() {
        let (_dir, manager) = manager();
        let a = manager.create_workspace(&spec("same")).unwrap();
        let b = manager.create_workspace(&spec("same")).unwrap();

        assert_ne!(a.root_path(), b.root_path());
        assert!(a.root_path().starts_with(manager.temp_root()));
        assert!(b.root_path().starts_with(manager.temp_root()));
        assert_eq!(manager.registry().len(), 2);
    }

    #[test]
    fn test_hostile_base_name_stays_inside_root() {
        let (_dir, manager) = manager();
        let ws = manager.create_workspace(&spec("../../../tmp/evil")).unwrap();

        assert_eq!(ws.root_path().parent().unwrap(), manager.temp_root());
        ws.release().unwrap();
    }

    #[test]
    fn test_manifest_renders_dependencies() {
        let manifest = render_manifest(&[
            Dependency::new("serde", "1.0"),
            Dependency::new("wasm-bindgen", "0.2.92"),
        ]);

        assert!(manifest.starts_with("[package]\nname = \"sandbox_project\"\n"));
        assert!(manifest.contains("crate-type = [\"cdylib\", \"rlib\"]\n"));
        assert!(manifest.ends_with("[dependencies]\nserde = \"1.0\"\nwasm-bindgen = \"0.2.92\"\n"));
    }

    #[test]
    fn test_invalid_dependency_is_rejected_before_io() {
        let (_dir, manager) = manager();
        let mut spec = spec("deps");
        spec.dependencies = vec![Dependency::new("evil", "1\"\n[build]\nrustc = \"sh")];

        let err = manager.create_workspace(&spec).unwrap_err();
        assert!(matches!(err, WorkspaceError::InvalidDependency { .. }));
        assert_eq!(fs::read_dir(manager.temp_root()).unwrap().count(), 0);
        assert!(manager.registry().is_empty());

        let bad_name = Dependency::new("a b", "1.0");
        assert!(bad_name.validate().is_err());
    }

    #[test]
    fn test_cleanup_refuses_paths_outside_root() {
        let (dir, manager) = manager();
        let outside = dir.path().join("keep-me");
        fs::create_dir(&outside).unwrap();

        for path in [
            PathBuf::from("/etc/passwd"),
            outside.clone(),
            manager.temp_root().to_path_buf(),
            manager.temp_root().join("..").join("keep-me"),
            PathBuf::from("relative/path"),
        ] {
            let err = manager.cleanup(&path).unwrap_err();
            assert!(
                matches!(err, WorkspaceError::OutsideTempRoot { .. }),
                "{path:?} gave {err:?}"
            );
            assert!(err.is_containment_violation());
        }

        assert!(outside.exists());
        assert!(manager.temp_root().exists());
        assert!(matches!(
            manager.cleanup("").unwrap_err(),
            WorkspaceError::EmptyPath
        ));
    }

    #[test]
    fn test_cleanup_prefix_sibling_is_outside() {
        let (dir, manager) = manager();
        // shares a string prefix with the root, but is a sibling
        let sibling = dir.path().join("root-sibling");
        fs::create_dir(&sibling).unwrap();
        let sibling = sibling.canonicalize().unwrap();

        assert!(manager.cleanup(&sibling).is_err());
        assert!(sibling.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_cleanup_refuses_symlink_escape() {
        let (dir, manager) = manager();
        let outside = dir.path().join("outside");
        let victim = outside.join("victim");
        fs::create_dir_all(&victim).unwrap();
        let link = manager.temp_root().join("link");
        std::os::unix::fs::symlink(&outside, &link).unwrap();

        let err = manager.cleanup(link.join("victim")).unwrap_err();
        assert!(err.is_containment_violation(), "{err}");
        assert!(victim.exists());

        // not yet existing paths below the link are refused as well
        let err = manager.cleanup(link.join("later")).unwrap_err();
        assert!(err.is_containment_violation(), "{err}");

        // the link itself resolves outside too
        assert!(manager.cleanup(&link).unwrap_err().is_containment_violation());
        assert!(outside.exists());
    }

    #[test]
    fn test_failed_population_leaves_nothing_behind() {
        let (_dir, manager) = manager();
        let partial = manager.temp_root().join("partial");
        fs::create_dir(&partial).unwrap();
        // a file where the source directory belongs makes population fail
        fs::write(partial.join(SOURCE_DIR), "").unwrap();

        let err = populate_or_rollback(&partial, &spec("partial")).unwrap_err();
        assert!(matches!(err, WorkspaceError::Io { .. }), "{err}");
        assert!(!partial.exists());
        assert_eq!(fs::read_dir(manager.temp_root()).unwrap().count(), 0);
        assert!(manager.registry().is_empty());
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let (_dir, manager) = manager();
        let missing = manager.temp_root().join("never-created");
        manager.cleanup(&missing).unwrap();
        manager.cleanup(&missing).unwrap();

        let ws = manager.create_workspace(&spec("twice")).unwrap();
        let path = ws.root_path().to_path_buf();
        manager.cleanup(&path).unwrap();
        assert!(!path.exists());
        assert!(!manager.registry().contains(&path));
        manager.cleanup(&path).unwrap();

        // already gone, release is a no-op
        ws.release().unwrap();
    }

    #[test]
    fn test_drop_releases_workspace() {
        let (_dir, manager) = manager();
        let path = {
            let ws = manager.create_workspace(&spec("dropped")).unwrap();
            ws.root_path().to_path_buf()
        };

        assert!(!path.exists());
        assert!(manager.registry().is_empty());
    }

    #[test]
    fn test_cleanup_all_sweeps_registry() {
        let (_dir, manager) = manager();
        let workspaces: Vec<_> = (0..3)
            .map(|i| manager.create_workspace(&spec(&format!("sweep{i}"))).unwrap())
            .collect();
        let paths: Vec<_> = workspaces
            .iter()
            .map(|w| w.root_path().to_path_buf())
            .collect();

        manager.cleanup_all();

        assert!(manager.registry().is_empty());
        for path in &paths {
            assert!(!path.exists());
        }
        drop(workspaces);
        assert!(manager.registry().is_empty());
    }

    #[test]
    fn test_registry_under_concurrent_requests() {
        let (_dir, manager) = manager();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let manager = manager.clone();
                std::thread::spawn(move || {
                    let ws = manager.create_workspace(&spec(&format!("t{i}"))).unwrap();
                    assert!(manager.registry().contains(ws.root_path()));
                    ws.release().unwrap();
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert!(manager.registry().is_empty());
    }
}
