//! Module resolution for bridged imports.
//!
//! Relative paths and file URLs go straight to [`FsModuleLoader`]. Bare
//! package specifiers (`lodash`, `@scope/pkg/sub`) are looked up in the
//! `node_modules` directories above the importing module, then above the
//! request's working directory, using the package's `exports`, `module` or
//! `main` entry. Only ES module packages evaluate; CommonJS entry points
//! load but fail at runtime.
//!
//! Every resolve or load failure is also recorded on the [`ModuleBridge`] so
//! the harness can tell a failed import apart from a module that threw.

use std::path::{Path, PathBuf};

use deno_core::error::AnyError;
use deno_core::{
    resolve_import, FsModuleLoader, ModuleLoadResponse, ModuleLoader, ModuleSpecifier,
    RequestedModuleType, ResolutionKind,
};
use serde_json::Value;

use crate::sandbox::bridge::ModuleBridge;

/// Export conditions honored, in preference order.
const CONDITIONS: [&str; 4] = ["import", "module", "default", "node"];

pub struct BridgeLoader {
    root: PathBuf,
    bridge: ModuleBridge,
    fs: FsModuleLoader,
}

impl BridgeLoader {
    /// `root` is where bare specifiers are looked up when the importer is not
    /// a file on disk.
    pub fn new(root: impl Into<PathBuf>, bridge: ModuleBridge) -> Self {
        let root = root.into();
        let root = std::path::absolute(&root).unwrap_or(root);
        Self {
            root,
            bridge,
            fs: FsModuleLoader,
        }
    }

    fn fail(&self, message: String) -> AnyError {
        self.bridge.note_load_failure(message.clone());
        anyhow::anyhow!(message)
    }

    fn resolve_bare(&self, specifier: &str, referrer: &str) -> Option<PathBuf> {
        let importer_dir = ModuleSpecifier::parse(referrer)
            .ok()
            .filter(|url| url.scheme() == "file")
            .and_then(|url| url.to_file_path().ok())
            .and_then(|path| path.parent().map(Path::to_path_buf));

        importer_dir
            .and_then(|dir| resolve_package(specifier, &dir))
            .or_else(|| resolve_package(specifier, &self.root))
    }
}

impl ModuleLoader for BridgeLoader {
    fn resolve(
        &self,
        specifier: &str,
        referrer: &str,
        _kind: ResolutionKind,
    ) -> Result<ModuleSpecifier, AnyError> {
        if !is_bare(specifier) {
            return resolve_import(specifier, referrer).map_err(|e| {
                self.fail(format!("cannot resolve \"{}\" from {}: {}", specifier, referrer, e))
            });
        }

        let path = self.resolve_bare(specifier, referrer).ok_or_else(|| {
            self.fail(format!(
                "cannot find package \"{}\" in node_modules above {}",
                specifier,
                self.root.display()
            ))
        })?;
        tracing::debug!(specifier, path = %path.display(), "resolved bare specifier");
        ModuleSpecifier::from_file_path(&path).map_err(|()| {
            self.fail(format!("cannot form a module specifier for {}", path.display()))
        })
    }

    fn load(
        &self,
        module_specifier: &ModuleSpecifier,
        maybe_referrer: Option<&ModuleSpecifier>,
        is_dyn_import: bool,
        requested_module_type: RequestedModuleType,
    ) -> ModuleLoadResponse {
        let readable = module_specifier.scheme() == "file"
            && module_specifier
                .to_file_path()
                .map(|path| path.is_file())
                .unwrap_or(false);
        if !readable {
            let error = self.fail(format!("module not found: {}", module_specifier));
            return ModuleLoadResponse::Sync(Err(error));
        }
        self.fs
            .load(module_specifier, maybe_referrer, is_dyn_import, requested_module_type)
    }
}

/// Whether `specifier` names a package rather than a path or URL.
fn is_bare(specifier: &str) -> bool {
    let is_path = specifier.starts_with("./")
        || specifier.starts_with("../")
        || specifier.starts_with('/');
    !is_path && ModuleSpecifier::parse(specifier).is_err()
}

/// Split `@scope/name/sub/path` into (`@scope/name`, `sub/path`).
fn split_package(specifier: &str) -> Option<(&str, &str)> {
    let name_end = if specifier.starts_with('@') {
        let scope_end = specifier.find('/')?;
        specifier[scope_end + 1..]
            .find('/')
            .map(|i| scope_end + 1 + i)
    } else {
        specifier.find('/')
    };
    let (name, subpath) = match name_end {
        Some(i) => (&specifier[..i], &specifier[i + 1..]),
        None => (specifier, ""),
    };
    (!name.is_empty() && name != "@").then_some((name, subpath))
}

/// Find the entry file for a bare specifier, searching `node_modules` in
/// `start` and each of its ancestors.
fn resolve_package(specifier: &str, start: &Path) -> Option<PathBuf> {
    let (name, subpath) = split_package(specifier)?;
    let package_dir = start
        .ancestors()
        .map(|dir| dir.join("node_modules").join(name))
        .find(|dir| dir.is_dir())?;
    package_entry(&package_dir, subpath)
}

fn package_entry(package_dir: &Path, subpath: &str) -> Option<PathBuf> {
    let manifest: Value = std::fs::read_to_string(package_dir.join("package.json"))
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or(Value::Null);

    let key = if subpath.is_empty() {
        ".".to_string()
    } else {
        format!("./{}", subpath)
    };
    if let Some(target) = manifest
        .get("exports")
        .and_then(|exports| export_target(exports, &key))
    {
        return existing_file(&package_dir.join(target));
    }
    if !subpath.is_empty() {
        return existing_file(&package_dir.join(subpath));
    }

    ["module", "main"]
        .iter()
        .filter_map(|field| manifest.get(*field).and_then(Value::as_str))
        .find_map(|entry| existing_file(&package_dir.join(entry)))
        .or_else(|| existing_file(&package_dir.join("index")))
}

fn export_target<'a>(exports: &'a Value, key: &str) -> Option<&'a str> {
    match exports {
        Value::Object(map) if map.keys().any(|k| k.starts_with('.')) => {
            map.get(key).and_then(conditional_target)
        }
        _ if key == "." => conditional_target(exports),
        _ => None,
    }
}

fn conditional_target(value: &Value) -> Option<&str> {
    match value {
        Value::String(target) => Some(target),
        Value::Array(items) => items.iter().find_map(conditional_target),
        Value::Object(map) => CONDITIONS
            .iter()
            .filter_map(|condition| map.get(*condition))
            .find_map(conditional_target),
        _ => None,
    }
}

/// `path` itself, or with a module extension, or its index file.
fn existing_file(path: &Path) -> Option<PathBuf> {
    let mut candidates = vec![path.to_path_buf()];
    for ext in ["mjs", "js"] {
        let mut with_ext = path.as_os_str().to_owned();
        with_ext.push(".");
        with_ext.push(ext);
        candidates.push(PathBuf::from(with_ext));
    }
    candidates.push(path.join("index.mjs"));
    candidates.push(path.join("index.js"));
    candidates.into_iter().find(|candidate| candidate.is_file())
}
