//! Module registry - discovers modules on disk and serves lookups.
//!
//! A module is a directory holding a manifest and an entry point. The table is
//! behind a reader/writer lock: lookups run concurrently, mutations (scan,
//! install, uninstall, update) are serialized.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::bridge::protocol::{ManifestError, ModuleManifest};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const ENTRY_POINT_FILE: &str = "__main__.py";

/// Optional detached signature shipped next to the manifest. Carried, not verified.
pub const SIGNATURE_FILE: &str = "manifest.sig";

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("module '{0}' not found")]
    ModuleNotFound(String),
    #[error("manifest not found: {}", .0.display())]
    ManifestMissing(PathBuf),
    #[error("entry point not found: {}", .0.display())]
    EntryPointMissing(PathBuf),
    #[error("invalid manifest for '{module}': {reason}")]
    ManifestInvalid { module: String, reason: String },
    #[error("module '{0}' already exists")]
    AlreadyExists(String),
    #[error("invalid module name '{0}'")]
    InvalidName(String),
    #[error("module source {} contains the modules directory", .0.display())]
    SourceContainsModules(PathBuf),
    #[error("module registry lock poisoned")]
    RegistryLocked,
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl RegistryError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ModuleNotFound(_) => "MODULE_NOT_FOUND",
            Self::ManifestMissing(_) => "MANIFEST_MISSING",
            Self::EntryPointMissing(_) => "ENTRY_POINT_MISSING",
            Self::ManifestInvalid { .. } => "MANIFEST_INVALID",
            Self::AlreadyExists(_) => "ALREADY_EXISTS",
            Self::InvalidName(_) => "INVALID_NAME",
            Self::SourceContainsModules(_) => "INVALID_SOURCE",
            Self::RegistryLocked => "REGISTRY_LOCKED",
            Self::Io { .. } => "IO_ERROR",
        }
    }

    fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    fn invalid(module: &str, reason: impl ToString) -> Self {
        Self::ManifestInvalid {
            module: module.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// A loaded, validated module.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleInfo {
    pub name: String,
    pub manifest: ModuleManifest,
    pub path: PathBuf,
    pub entry_point: PathBuf,
    pub loaded_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl ModuleInfo {
    pub fn has_command(&self, command: &str) -> bool {
        self.manifest.has_command(command)
    }
}

/// Outcome of a directory scan.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub failed: Vec<LoadFailure>,
}

#[derive(Debug)]
pub struct LoadFailure {
    pub name: String,
    pub error: RegistryError,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub modules_dir: PathBuf,
    pub manifest_file: String,
    pub entry_point_file: String,
}

impl RegistryConfig {
    pub fn new(modules_dir: impl Into<PathBuf>) -> Self {
        Self {
            modules_dir: modules_dir.into(),
            manifest_file: MANIFEST_FILE.to_string(),
            entry_point_file: ENTRY_POINT_FILE.to_string(),
        }
    }

    pub fn with_manifest_file(mut self, name: impl Into<String>) -> Self {
        self.manifest_file = name.into();
        self
    }

    pub fn with_entry_point_file(mut self, name: impl Into<String>) -> Self {
        self.entry_point_file = name.into();
        self
    }
}

pub struct ModuleRegistry {
    config: RegistryConfig,
    modules: RwLock<HashMap<String, ModuleInfo>>,
}

impl ModuleRegistry {
    pub fn new(modules_dir: impl Into<PathBuf>) -> Self {
        Self::with_config(RegistryConfig::new(modules_dir))
    }

    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            config,
            modules: RwLock::new(HashMap::new()),
        }
    }

    pub fn modules_dir(&self) -> &Path {
        &self.config.modules_dir
    }

    /// Scan the modules directory, creating it if needed.
    ///
    /// The table is replaced with what the scan finds. A module that fails to
    /// load is logged and reported, and does not affect the others.
    pub fn load_all(&self) -> Result<LoadReport, RegistryError> {
        let dir = &self.config.modules_dir;
        fs::create_dir_all(dir).map_err(|e| {
            RegistryError::io(format!("failed to create {}", dir.display()), e)
        })?;
        let entries = fs::read_dir(dir)
            .map_err(|e| RegistryError::io(format!("failed to read {}", dir.display()), e))?;

        let mut table = self.write()?;
        let mut found = HashMap::new();
        let mut report = LoadReport::default();

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to read modules directory entry");
                    continue;
                }
            };
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            match self.inspect(&name, &path) {
                Ok(info) => {
                    tracing::debug!(module = %name, version = %info.manifest.version, "Loaded module");
                    report.loaded.push(name.clone());
                    found.insert(name, info);
                }
                Err(error) => {
                    tracing::warn!(module = %name, code = error.code(), error = %error, "Failed to load module");
                    report.failed.push(LoadFailure { name, error });
                }
            }
        }

        report.loaded.sort();
        *table = found;
        tracing::info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            modules_dir = %dir.display(),
            "Module scan complete"
        );
        Ok(report)
    }

    /// Load (or reload) a single module directory under `name`.
    pub fn load_one(&self, name: &str, path: &Path) -> Result<ModuleInfo, RegistryError> {
        let info = self.inspect(name, path)?;
        self.write()?.insert(name.to_string(), info.clone());
        Ok(info)
    }

    pub fn resolve(&self, name: &str) -> Result<ModuleInfo, RegistryError> {
        self.read()?
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::ModuleNotFound(name.to_string()))
    }

    pub fn has_command(&self, name: &str, command: &str) -> bool {
        self.read()
            .map(|table| table.get(name).is_some_and(|info| info.has_command(command)))
            .unwrap_or(false)
    }

    pub fn commands(&self, name: &str) -> Result<Vec<String>, RegistryError> {
        let table = self.read()?;
        let info = table
            .get(name)
            .ok_or_else(|| RegistryError::ModuleNotFound(name.to_string()))?;
        Ok(info.manifest.commands.iter().cloned().collect())
    }

    /// All loaded modules, sorted by name.
    pub fn list(&self) -> Result<Vec<ModuleInfo>, RegistryError> {
        let mut modules: Vec<_> = self.read()?.values().cloned().collect();
        modules.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(modules)
    }

    pub fn len(&self) -> usize {
        self.read().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `source` into the modules directory as `name` and load it.
    /// A partially copied or invalid module is removed again.
    pub fn install(&self, name: &str, source: &Path) -> Result<ModuleInfo, RegistryError> {
        let mut table = self.write()?;
        self.install_locked(&mut table, name, source)
    }

    pub fn uninstall(&self, name: &str) -> Result<(), RegistryError> {
        let mut table = self.write()?;
        self.uninstall_locked(&mut table, name)
    }

    /// Replace an installed module with the contents of `source`.
    pub fn update(&self, name: &str, source: &Path) -> Result<ModuleInfo, RegistryError> {
        let mut table = self.write()?;
        self.check_source(source)?;
        self.uninstall_locked(&mut table, name)?;
        self.install_locked(&mut table, name, source)
    }

    fn install_locked(
        &self,
        table: &mut HashMap<String, ModuleInfo>,
        name: &str,
        source: &Path,
    ) -> Result<ModuleInfo, RegistryError> {
        validate_name(name)?;
        let dest = self.config.modules_dir.join(name);
        if table.contains_key(name) || dest.exists() {
            return Err(RegistryError::AlreadyExists(name.to_string()));
        }
        self.check_source(source)?;

        let installed = copy_dir(source, &dest)
            .map_err(|e| {
                RegistryError::io(
                    format!("failed to copy {} to {}", source.display(), dest.display()),
                    e,
                )
            })
            .and_then(|()| self.inspect(name, &dest));

        match installed {
            Ok(info) => {
                tracing::info!(module = %name, version = %info.manifest.version, "Installed module");
                table.insert(name.to_string(), info.clone());
                Ok(info)
            }
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&dest) {
                    tracing::warn!(module = %name, error = %cleanup, "Failed to roll back install");
                }
                Err(e)
            }
        }
    }

    fn uninstall_locked(
        &self,
        table: &mut HashMap<String, ModuleInfo>,
        name: &str,
    ) -> Result<(), RegistryError> {
        let info = table
            .remove(name)
            .ok_or_else(|| RegistryError::ModuleNotFound(name.to_string()))?;
        fs::remove_dir_all(&info.path).map_err(|e| {
            RegistryError::io(format!("failed to remove {}", info.path.display()), e)
        })?;
        tracing::info!(module = %name, "Uninstalled module");
        Ok(())
    }

    /// Validate a module directory without touching the table.
    fn inspect(&self, name: &str, path: &Path) -> Result<ModuleInfo, RegistryError> {
        let manifest_path = path.join(&self.config.manifest_file);
        if !manifest_path.is_file() {
            return Err(RegistryError::ManifestMissing(manifest_path));
        }
        let entry_point = path.join(&self.config.entry_point_file);
        if !entry_point.is_file() {
            return Err(RegistryError::EntryPointMissing(entry_point));
        }

        let raw = fs::read(&manifest_path).map_err(|e| {
            RegistryError::io(format!("failed to read {}", manifest_path.display()), e)
        })?;
        let manifest: ModuleManifest =
            serde_json::from_slice(&raw).map_err(|e| RegistryError::invalid(name, e))?;
        manifest
            .validate()
            .map_err(|e: ManifestError| RegistryError::invalid(name, e))?;

        for (index, dep) in manifest.dependencies.iter().enumerate() {
            if dep.trim().is_empty() {
                tracing::warn!(module = %name, index, "Manifest lists an empty dependency");
            }
        }
        if manifest.name != name {
            tracing::debug!(module = %name, manifest_name = %manifest.name, "Module directory and manifest name differ");
        }

        let entry_len = fs::metadata(&entry_point)
            .map_err(|e| RegistryError::io(format!("failed to stat {}", entry_point.display()), e))?
            .len();
        if entry_len == 0 {
            return Err(RegistryError::invalid(name, "entry point is empty"));
        }

        let signature = fs::read_to_string(path.join(SIGNATURE_FILE))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        Ok(ModuleInfo {
            name: name.to_string(),
            manifest,
            path: path.to_path_buf(),
            entry_point,
            loaded_at: Utc::now(),
            signature,
        })
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, ModuleInfo>>, RegistryError> {
        self.modules.read().map_err(|_| RegistryError::RegistryLocked)
    }

    /// A source must be a directory that does not contain the modules directory,
    /// or the copy would recurse into itself.
    fn check_source(&self, source: &Path) -> Result<(), RegistryError> {
        if !source.is_dir() {
            return Err(RegistryError::io(
                format!("invalid module source {}", source.display()),
                io::Error::new(io::ErrorKind::NotFound, "not a directory"),
            ));
        }
        let source_dir = fs::canonicalize(source)
            .map_err(|e| RegistryError::io(format!("failed to resolve {}", source.display()), e))?;
        let modules_dir = fs::canonicalize(&self.config.modules_dir)
            .unwrap_or_else(|_| self.config.modules_dir.clone());
        if modules_dir.starts_with(&source_dir) {
            return Err(RegistryError::SourceContainsModules(source.to_path_buf()));
        }
        Ok(())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, ModuleInfo>>, RegistryError> {
        self.modules.write().map_err(|_| RegistryError::RegistryLocked)
    }
}

fn validate_name(name: &str) -> Result<(), RegistryError> {
    let ok = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.chars().any(char::is_control);
    if ok {
        Ok(())
    } else {
        Err(RegistryError::InvalidName(name.to_string()))
    }
}

fn copy_dir(source: &Path, dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
