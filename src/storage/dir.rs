//! Transaction-log directory handling.
//!
//! A [`LogDirectory`] is the resolved on-disk home of a shard's transaction
//! logs. It owns path resolution (including the rule that a relative dir
//! spec must not escape the shard instance directory), prefix scans of
//! existing log files, and best-effort file deletion. There is no lock
//! file; the handle itself asserts exclusive in-process ownership of the
//! resolved directory and releases it on drop.

use std::path::{Component, Path, PathBuf};

use parking_lot::Mutex;

use crate::error::{NaginataError, Result};

/// Directory name appended to the resolved data dir.
pub const TLOG_DIR_NAME: &str = "tlog";

static OWNED_DIRS: Mutex<Vec<PathBuf>> = Mutex::new(Vec::new());

/// Handle on the directory holding a shard's transaction logs.
///
/// Exactly one live handle may exist per resolved directory within a
/// process; a second [`LogDirectory::open`] fails with a storage error.
#[derive(Debug)]
pub struct LogDirectory {
    path: PathBuf,
}

impl LogDirectory {
    /// Resolve the tlog directory for a shard.
    ///
    /// `dir_spec` is the optional configured data dir. Absolute specs are
    /// used as-is; relative specs resolve against `instance_dir` and must
    /// not escape it. When no spec is given the instance dir itself is the
    /// base. The tlog directory is `<base>/tlog`.
    pub fn resolve(instance_dir: &Path, dir_spec: Option<&str>) -> Result<PathBuf> {
        let base = match dir_spec {
            None => instance_dir.to_path_buf(),
            Some(spec) => {
                let spec_path = Path::new(spec);
                if spec_path.is_absolute() {
                    normalize(spec_path)
                } else {
                    let joined = normalize(&instance_dir.join(spec_path));
                    if !joined.starts_with(normalize(instance_dir)) {
                        return Err(NaginataError::config(format!(
                            "illegal relative log dir spec: {spec}"
                        )));
                    }
                    joined
                }
            }
        };

        let tlog_dir = base.join(TLOG_DIR_NAME);
        if tlog_dir == normalize(instance_dir) {
            return Err(NaginataError::config(format!(
                "tlog path {} conflicts with instance path {}",
                tlog_dir.display(),
                instance_dir.display()
            )));
        }
        Ok(tlog_dir)
    }

    /// Create (if needed) and take ownership of the directory at `path`.
    pub fn open(path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&path)
            .map_err(|e| NaginataError::storage(format!("could not set up tlog dir: {e}")))?;

        let canonical = path
            .canonicalize()
            .map_err(|e| NaginataError::storage(format!("could not resolve tlog dir: {e}")))?;

        let mut owned = OWNED_DIRS.lock();
        if owned.contains(&canonical) {
            return Err(NaginataError::storage(format!(
                "tlog dir already in use: {}",
                canonical.display()
            )));
        }
        owned.push(canonical.clone());

        Ok(LogDirectory { path: canonical })
    }

    /// The resolved directory path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Full path for a file name inside the directory.
    pub fn file_path(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// List file names starting with `prefix`, sorted ascending.
    ///
    /// Log ids are zero-padded in the file names, so lexicographic order is
    /// creation order.
    pub fn list_files(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.path)
            .map_err(|e| NaginataError::storage(format!("failed to read tlog dir: {e}")))?
        {
            let entry =
                entry.map_err(|e| NaginataError::storage(format!("failed to read tlog dir: {e}")))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if name.starts_with(prefix) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Whether any file with the given prefix exists.
    ///
    /// Scan failures degrade to `false`; the caller only loses an
    /// optimization.
    pub fn any_file_with_prefix(&self, prefix: &str) -> bool {
        match self.list_files(prefix) {
            Ok(names) => !names.is_empty(),
            Err(e) => {
                log::debug!(
                    "could not read {} searching for {prefix} files: {e}",
                    self.path.display()
                );
                false
            }
        }
    }

    /// Delete every file with the given prefix, best-effort.
    pub fn delete_files_with_prefix(&self, prefix: &str) {
        match self.list_files(prefix) {
            Ok(names) => {
                for name in names {
                    delete_file(&self.file_path(&name));
                }
            }
            Err(e) => {
                log::warn!(
                    "could not clean up {prefix} files in {}: {e}",
                    self.path.display()
                );
            }
        }
    }

    /// Delete every regular file in the directory. Only call before init.
    pub fn clear(&self) {
        match self.list_files("") {
            Ok(names) => {
                for name in names {
                    delete_file(&self.file_path(&name));
                }
            }
            Err(e) => log::error!("could not clear old tlogs in {}: {e}", self.path.display()),
        }
    }
}

impl Drop for LogDirectory {
    fn drop(&mut self) {
        let mut owned = OWNED_DIRS.lock();
        owned.retain(|p| p != &self.path);
    }
}

/// Best-effort file removal with error logging.
pub fn delete_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::error!("error deleting file {}: {e}", path.display());
        }
    }
}

/// Lexically normalize a path (resolve `.` and `..` without touching the
/// filesystem).
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::ParentDir.as_os_str());
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
