//! Runtime configuration.
//!
//! Defaults, overridable from `CONVERSO_*` environment variables and then by
//! builder methods (the CLI applies its flags last).

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::launcher::discover_interpreter;
use crate::worker::WorkerConfig;

pub const DEFAULT_API_ENDPOINT: &str = "https://capi.conversoempire.world";

const HOME_DIR_NAME: &str = ".converso";
const MODULES_DIR_NAME: &str = "plugins";
const DATA_DIR_NAME: &str = "data";

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub debug: bool,
    pub api_endpoint: String,
    pub home_dir: PathBuf,
    pub modules_dir: PathBuf,
    pub data_dir: PathBuf,
    /// Explicit module interpreter. Discovered on `PATH` when unset.
    pub interpreter: Option<PathBuf>,
    pub poll_interval: Duration,
    pub queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        let home_dir = dirs::home_dir()
            .map(|home| home.join(HOME_DIR_NAME))
            .unwrap_or_else(|| PathBuf::from(HOME_DIR_NAME));
        let worker = WorkerConfig::default();
        Self {
            debug: false,
            api_endpoint: DEFAULT_API_ENDPOINT.to_string(),
            modules_dir: home_dir.join(MODULES_DIR_NAME),
            data_dir: home_dir.join(DATA_DIR_NAME),
            home_dir,
            interpreter: None,
            poll_interval: worker.poll_interval,
            queue_capacity: worker.queue_capacity,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default().apply_env(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`. Unparseable numbers are ignored with a warning.
    pub fn apply_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(home) = get("CONVERSO_HOME") {
            self = self.with_home_dir(home);
        }
        if let Some(dir) = get("CONVERSO_MODULES_DIR") {
            self.modules_dir = PathBuf::from(dir);
        }
        if let Some(endpoint) = get("CONVERSO_API_ENDPOINT") {
            self.api_endpoint = endpoint;
        }
        if let Some(python) = get(crate::launcher::INTERPRETER_ENV) {
            self.interpreter = Some(PathBuf::from(python));
        }
        if let Some(debug) = get("CONVERSO_DEBUG") {
            self.debug = matches!(
                debug.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        if let Some(raw) = get("CONVERSO_POLL_INTERVAL") {
            match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => self.poll_interval = Duration::from_secs(secs),
                _ => tracing::warn!(value = %raw, "Ignoring invalid CONVERSO_POLL_INTERVAL"),
            }
        }
        if let Some(raw) = get("CONVERSO_QUEUE_CAPACITY") {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => self.queue_capacity = n,
                _ => tracing::warn!(value = %raw, "Ignoring invalid CONVERSO_QUEUE_CAPACITY"),
            }
        }
        self
    }

    /// Move the home directory; modules and data dirs follow it.
    pub fn with_home_dir(mut self, home: impl Into<PathBuf>) -> Self {
        self.home_dir = home.into();
        self.modules_dir = self.home_dir.join(MODULES_DIR_NAME);
        self.data_dir = self.home_dir.join(DATA_DIR_NAME);
        self
    }

    pub fn with_modules_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.modules_dir = dir.into();
        self
    }

    pub fn with_api_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.api_endpoint = endpoint.into();
        self
    }

    pub fn with_interpreter(mut self, interpreter: impl Into<PathBuf>) -> Self {
        self.interpreter = Some(interpreter.into());
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Configured interpreter, else the first one found on `PATH`.
    pub fn resolve_interpreter(&self) -> Option<PathBuf> {
        self.interpreter.clone().or_else(discover_interpreter)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::default()
            .with_poll_interval(self.poll_interval)
            .with_queue_capacity(self.queue_capacity)
    }

    /// Create the home, modules and data directories.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [&self.home_dir, &self.modules_dir, &self.data_dir] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn modules_dir(&self) -> &Path {
        &self.modules_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.api_endpoint, DEFAULT_API_ENDPOINT);
        assert!(config.home_dir.ends_with(".converso"));
        assert_eq!(config.modules_dir, config.home_dir.join("plugins"));
        assert_eq!(config.data_dir, config.home_dir.join("data"));
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.queue_capacity, 100);
        assert!(!config.debug);
        assert!(config.interpreter.is_none());
    }

    #[test]
    fn env_overrides() {
        let config = Config::default().apply_env(lookup(&[
            ("CONVERSO_HOME", "/srv/converso"),
            ("CONVERSO_API_ENDPOINT", "http://localhost:8080"),
            ("CONVERSO_PYTHON", "/opt/python/bin/python3"),
            ("CONVERSO_DEBUG", "true"),
            ("CONVERSO_POLL_INTERVAL", "5"),
            ("CONVERSO_QUEUE_CAPACITY", "7"),
        ]));
        assert_eq!(config.home_dir, PathBuf::from("/srv/converso"));
        assert_eq!(config.modules_dir, PathBuf::from("/srv/converso/plugins"));
        assert_eq!(config.api_endpoint, "http://localhost:8080");
        assert_eq!(
            config.interpreter.as_deref(),
            Some(Path::new("/opt/python/bin/python3"))
        );
        assert!(config.debug);
        assert_eq!(config.poll_interval, Duration::from_secs(5));

        let worker = config.worker_config();
        assert_eq!(worker.queue_capacity, 7);
        assert_eq!(worker.poll_interval, Duration::from_secs(5));
    }

    #[test]
    fn modules_dir_override_wins_over_home() {
        let config = Config::default().apply_env(lookup(&[
            ("CONVERSO_HOME", "/srv/converso"),
            ("CONVERSO_MODULES_DIR", "/opt/modules"),
        ]));
        assert_eq!(config.modules_dir, PathBuf::from("/opt/modules"));
        assert_eq!(config.data_dir, PathBuf::from("/srv/converso/data"));
    }

    #[test]
    fn invalid_numbers_are_ignored() {
        let config = Config::default().apply_env(lookup(&[
            ("CONVERSO_POLL_INTERVAL", "soon"),
            ("CONVERSO_QUEUE_CAPACITY", "0"),
            ("CONVERSO_DEBUG", "nope"),
        ]));
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.queue_capacity, 100);
        assert!(!config.debug);
    }

    #[test]
    fn ensure_dirs_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default().with_home_dir(dir.path().join("home"));
        config.ensure_dirs().unwrap();
        assert!(config.modules_dir().is_dir());
        assert!(config.data_dir.is_dir());
    }

    #[test]
    fn explicit_interpreter_is_preferred() {
        let config = Config::default().with_interpreter("/custom/python");
        assert_eq!(
            config.resolve_interpreter(),
            Some(PathBuf::from("/custom/python"))
        );
    }
}
