//! Module-import bridge.
//!
//! Code that needs real module semantics is written to a uniquely named
//! `.mjs` file, imported through the runtime's module loader and removed
//! again. Every file the bridge creates is tracked until it is released, so
//! finalization can sweep files whose release never ran.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use deno_core::ModuleSpecifier;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{Result, SandboxError};

const FILE_PREFIX: &str = ".sandbox-module-";

/// A materialized module file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempModule {
    pub path: PathBuf,
    pub specifier: ModuleSpecifier,
}

/// Writes, tracks and removes bridged module files for one request.
#[derive(Debug, Clone)]
pub struct ModuleBridge {
    dir: PathBuf,
    outstanding: Arc<Mutex<HashSet<PathBuf>>>,
    load_failures: Arc<Mutex<Vec<String>>>,
}

impl ModuleBridge {
    /// Create a bridge writing into `dir`. Touches nothing on disk.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            outstanding: Arc::default(),
            load_failures: Arc::default(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `code` to a fresh module file and return its location.
    pub fn materialize(&self, code: &str) -> Result<TempModule> {
        let dir = std::path::absolute(&self.dir).map_err(|e| {
            SandboxError::bridge(format!(
                "cannot resolve bridge directory {}: {}",
                self.dir.display(),
                e
            ))
        })?;
        let path = dir.join(format!("{}{}.mjs", FILE_PREFIX, Uuid::new_v4().simple()));

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                SandboxError::bridge(format!("cannot create {}: {}", path.display(), e))
            })?;
        self.outstanding.lock().insert(path.clone());

        if let Err(e) = file.write_all(code.as_bytes()).and_then(|()| file.flush()) {
            drop(file);
            self.release(&path);
            return Err(SandboxError::bridge(format!(
                "cannot write {}: {}",
                path.display(),
                e
            )));
        }

        match ModuleSpecifier::from_file_path(&path) {
            Ok(specifier) => {
                tracing::debug!(path = %path.display(), "materialized bridged module");
                Ok(TempModule { path, specifier })
            }
            Err(()) => {
                self.release(&path);
                Err(SandboxError::bridge(format!(
                    "cannot form a module specifier for {}",
                    path.display()
                )))
            }
        }
    }

    /// Remove a file this bridge created. Paths it did not create are
    /// ignored; returns whether a tracked file was released.
    pub fn release(&self, path: &Path) -> bool {
        if !self.outstanding.lock().remove(path) {
            return false;
        }
        remove_module_file(path)
    }

    /// Remove every file not yet released. Returns how many were removed.
    pub fn release_all(&self) -> usize {
        let paths: Vec<PathBuf> = self.outstanding.lock().drain().collect();
        paths.iter().filter(|path| remove_module_file(path)).count()
    }

    /// Record that the module loader could not resolve or read a module.
    pub fn note_load_failure(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(%message, "module load failed");
        self.load_failures.lock().push(message);
    }

    /// Drain the loader failures recorded since the last call.
    pub fn take_load_failures(&self) -> Vec<String> {
        std::mem::take(&mut *self.load_failures.lock())
    }

    /// Number of files awaiting release.
    pub fn outstanding(&self) -> usize {
        self.outstanding.lock().len()
    }
}

fn remove_module_file(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove bridged module");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module_files(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(FILE_PREFIX))
            .count()
    }

    #[test]
    fn test_new_touches_nothing() {
        let bridge = ModuleBridge::new("/definitely/not/a/real/dir");
        assert_eq!(bridge.outstanding(), 0);
    }

    #[test]
    fn test_materialize_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = ModuleBridge::new(dir.path());

        let module = bridge.materialize("export default 1;").unwrap();
        assert!(module.path.exists());
        assert_eq!(module.specifier.scheme(), "file");
        assert!(module.path.to_string_lossy().ends_with(".mjs"));
        assert_eq!(std::fs::read_to_string(&module.path).unwrap(), "export default 1;");
        assert_eq!(bridge.outstanding(), 1);

        assert!(bridge.release(&module.path));
        assert!(!module.path.exists());
        assert_eq!(bridge.outstanding(), 0);
        assert!(!bridge.release(&module.path));
    }

    #[test]
    fn test_names_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = ModuleBridge::new(dir.path());
        let a = bridge.materialize("export default 1;").unwrap();
        let b = bridge.materialize("export default 1;").unwrap();
        assert_ne!(a.path, b.path);
        assert_eq!(bridge.release_all(), 2);
        assert_eq!(module_files(dir.path()), 0);
    }

    #[test]
    fn test_untracked_paths_are_not_removed() {
        let dir = tempfile::tempdir().unwrap();
        let keep = dir.path().join("keep.mjs");
        std::fs::write(&keep, "export default 0;").unwrap();

        let bridge = ModuleBridge::new(dir.path());
        assert!(!bridge.release(&keep));
        assert!(keep.exists());
    }

    #[test]
    fn test_missing_directory_is_bridge_error() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = ModuleBridge::new(dir.path().join("missing"));
        let err = bridge.materialize("export default 1;").unwrap_err();
        assert!(matches!(err, SandboxError::Bridge(_)));
        assert_eq!(bridge.outstanding(), 0);
    }

    #[test]
    fn test_load_failures_are_drained() {
        let bridge = ModuleBridge::new(".");
        let shared = bridge.clone();
        shared.note_load_failure("module not found: ./a.mjs");
        shared.note_load_failure("module not found: ./b.mjs");

        assert_eq!(bridge.take_load_failures().len(), 2);
        assert!(bridge.take_load_failures().is_empty());
    }
}
