//! Version information for converso.

use std::path::Path;
use std::time::Duration;

/// Converso version from Cargo.toml
pub const CONVERSO_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information for the CLI and its module runtime.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub converso: &'static str,
    /// Module interpreter version (if one was found).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interpreter_path: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            converso: CONVERSO_VERSION,
            interpreter: None,
            interpreter_path: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interpreter(mut self, path: &Path, version: String) -> Self {
        self.interpreter_path = Some(path.display().to_string());
        self.interpreter = Some(version);
        self
    }
}

/// Ask an interpreter for its version (`<interpreter> --version`).
pub async fn detect_interpreter_version(interpreter: &Path) -> Option<String> {
    let output = tokio::time::timeout(
        Duration::from_secs(5),
        tokio::process::Command::new(interpreter)
            .arg("--version")
            .kill_on_drop(true)
            .output(),
    )
    .await
    .ok()?
    .ok()?;

    if !output.status.success() {
        return None;
    }
    // Python 2 printed the version on stderr.
    let text = if output.stdout.is_empty() {
        output.stderr
    } else {
        output.stdout
    };
    let version = String::from_utf8_lossy(&text).trim().to_string();
    (!version.is_empty()).then_some(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_info_has_converso_version() {
        let info = VersionInfo::new();
        assert_eq!(info.converso, CONVERSO_VERSION);
        assert!(info.interpreter.is_none());
    }

    #[test]
    fn version_info_serializes_minimal() {
        let info = VersionInfo {
            converso: "0.3.0",
            interpreter: None,
            interpreter_path: None,
        };
        insta::assert_json_snapshot!(info, @r#"
        {
          "converso": "0.3.0"
        }
        "#);
    }

    #[test]
    fn version_info_serializes_full() {
        let info = VersionInfo {
            converso: "0.3.0",
            interpreter: None,
            interpreter_path: None,
        }
        .with_interpreter(Path::new("/usr/bin/python3"), "Python 3.11.4".to_string());
        insta::assert_json_snapshot!(info, @r#"
        {
          "converso": "0.3.0",
          "interpreter": "Python 3.11.4",
          "interpreter_path": "/usr/bin/python3"
        }
        "#);
    }

    #[tokio::test]
    async fn missing_interpreter_has_no_version() {
        let dir = tempfile::tempdir().unwrap();
        assert!(
            detect_interpreter_version(&dir.path().join("nope"))
                .await
                .is_none()
        );
    }
}
