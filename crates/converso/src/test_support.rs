//! Shared fixtures: shell-script modules and a launcher that counts calls.

use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::launcher::{
    LaunchError, LaunchedProcess, Launcher, ProcessHandle, ProcessLauncher, TerminateGrace,
};

/// Runs `__main__.py` files with `sh`, so fixtures need no Python.
pub fn sh_launcher() -> ProcessLauncher {
    ProcessLauncher::new()
        .with_interpreter("sh")
        .with_grace(TerminateGrace {
            term: Duration::from_millis(200),
            kill: Duration::from_secs(2),
        })
}

#[derive(Default)]
pub struct CountingLauncher {
    inner: ProcessLauncher,
    launches: AtomicUsize,
    terminates: AtomicUsize,
}

impl CountingLauncher {
    pub fn new() -> Self {
        Self {
            inner: sh_launcher(),
            ..Self::default()
        }
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn terminates(&self) -> usize {
        self.terminates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Launcher for CountingLauncher {
    fn launch(&self, entry_point: &Path) -> Result<LaunchedProcess, LaunchError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.inner.launch(entry_point)
    }

    async fn terminate(&self, handle: &mut ProcessHandle) -> Option<ExitStatus> {
        self.terminates.fetch_add(1, Ordering::SeqCst);
        handle.terminate().await
    }
}

/// Write a bare entry point script into `dir`.
pub fn write_entry(dir: &Path, script: &str) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join("__main__.py");
    std::fs::write(&path, script).unwrap();
    path
}

/// Write a complete module directory `root/name` with a manifest declaring `commands`.
pub fn write_module(root: &Path, name: &str, commands: &[&str], script: &str) -> PathBuf {
    let dir = root.join(name);
    write_entry(&dir, script);
    let manifest = serde_json::json!({
        "name": name,
        "version": "1.0.0",
        "description": format!("{name} test module"),
        "commands": commands,
        "dependencies": [],
        "author": "tests",
        "license": "MIT"
    });
    std::fs::write(
        dir.join("manifest.json"),
        serde_json::to_vec_pretty(&manifest).unwrap(),
    )
    .unwrap();
    dir
}

/// Script that reads the request, reports three stages and succeeds.
pub const THREE_STAGE_SCRIPT: &str = r#"cat > /dev/null
echo '{"stage":"fetching","current":1,"total":3,"percentage":33.3,"message":"one"}'
echo '{"stage":"processing","current":2,"total":3,"percentage":66.6,"message":"two"}'
echo '{"stage":"saving","current":3,"total":3,"percentage":100,"message":"three"}'
echo '{"success":true,"data":{"done":true},"error":""}'
"#;

/// Script that answers with the request it received under `data.request`.
pub const ECHO_SCRIPT: &str = r#"read -r line
printf '{"success":true,"data":{"request":%s},"error":""}\n' "$line"
"#;
