//! Subcommand implementations.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use converso::{
    Args, ArgsExt, CancellationToken, Config, Credentials, Dispatcher, ExecuteOptions,
    HttpJobApi, ModuleBridge, ModuleRegistry, ProcessLauncher, ProgressEvent, VersionInfo, Worker,
    detect_interpreter_version,
};
use tokio::sync::mpsc;

/// Parse `key=value`. The value is taken as JSON when it parses, else as a string.
pub fn parse_arg(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn load_registry(config: &Config) -> Result<Arc<ModuleRegistry>> {
    let registry = ModuleRegistry::new(config.modules_dir());
    let report = registry
        .load_all()
        .with_context(|| format!("failed to scan {}", config.modules_dir().display()))?;
    for failure in &report.failed {
        tracing::warn!(module = %failure.name, error = %failure.error, "Skipping module");
    }
    Ok(Arc::new(registry))
}

fn build_bridge(config: &Config) -> Result<Arc<ModuleBridge>> {
    let interpreter = config
        .resolve_interpreter()
        .context("no Python interpreter found; set CONVERSO_PYTHON")?;
    tracing::debug!(interpreter = %interpreter.display(), "Using module interpreter");
    Ok(Arc::new(ModuleBridge::new(Arc::new(ProcessLauncher::python(
        interpreter,
    )))))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn modules_list(config: &Config) -> Result<ExitCode> {
    let registry = load_registry(config)?;
    let modules = registry.list()?;
    if modules.is_empty() {
        eprintln!("No modules installed in {}", config.modules_dir().display());
        return Ok(ExitCode::SUCCESS);
    }
    for info in modules {
        let commands: Vec<&str> = info.manifest.commands.iter().map(String::as_str).collect();
        println!(
            "{:<20} {:<10} {}",
            info.name,
            info.manifest.version,
            commands.join(", ")
        );
    }
    Ok(ExitCode::SUCCESS)
}

pub fn modules_info(config: &Config, name: &str) -> Result<ExitCode> {
    let registry = load_registry(config)?;
    let info = registry.resolve(name)?;
    print_json(&info)?;
    Ok(ExitCode::SUCCESS)
}

pub fn modules_install(config: &Config, name: &str, source: &Path) -> Result<ExitCode> {
    let registry = load_registry(config)?;
    let info = registry
        .install(name, source)
        .with_context(|| format!("failed to install '{name}' from {}", source.display()))?;
    eprintln!("Installed {} {}", info.name, info.manifest.version);
    Ok(ExitCode::SUCCESS)
}

pub fn modules_uninstall(config: &Config, name: &str) -> Result<ExitCode> {
    let registry = load_registry(config)?;
    registry
        .uninstall(name)
        .with_context(|| format!("failed to uninstall '{name}'"))?;
    eprintln!("Uninstalled {name}");
    Ok(ExitCode::SUCCESS)
}

pub fn modules_update(config: &Config, name: &str, source: &Path) -> Result<ExitCode> {
    let registry = load_registry(config)?;
    let info = registry
        .update(name, source)
        .with_context(|| format!("failed to update '{name}' from {}", source.display()))?;
    eprintln!("Updated {} to {}", info.name, info.manifest.version);
    Ok(ExitCode::SUCCESS)
}

fn format_progress(event: &ProgressEvent) -> String {
    let mut line = format!(
        "[{}] {}/{} ({:.1}%)",
        event.stage, event.current, event.total, event.percentage
    );
    if !event.message.is_empty() {
        line.push(' ');
        line.push_str(&event.message);
    }
    line
}

pub async fn run(
    config: &Config,
    module: &str,
    command: &str,
    args: Vec<(String, serde_json::Value)>,
    timeout_secs: u64,
) -> Result<ExitCode> {
    let registry = load_registry(config)?;
    let bridge = build_bridge(config)?;
    let dispatcher = Dispatcher::new(registry, bridge, Credentials::from_env())
        .with_timeout(Duration::from_secs(timeout_secs));

    let args: Args = args.into_iter().collect();
    let (tx, mut rx) = mpsc::channel::<ProgressEvent>(64);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            eprintln!("{}", format_progress(&event));
        }
    });

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, cancelling module call");
            on_interrupt.cancel();
        }
    });

    let options = ExecuteOptions::new().with_progress(tx).with_cancel(cancel);
    let result = dispatcher.execute_with(module, command, args, options).await;
    interrupt.abort();
    // The sender went away with the options; the printer drains and exits.
    if let Err(e) = printer.await {
        tracing::error!(error = %e, "Progress printer panicked");
    }

    let response = result.with_context(|| format!("{module} {command} failed"))?;
    print_json(&response)?;
    if !response.success {
        eprintln!("error: {}", response.error);
        return Ok(ExitCode::FAILURE);
    }
    if let Some(message) = response.data.get_str("message") {
        eprintln!("{message}");
    }
    Ok(ExitCode::SUCCESS)
}

/// Wait for Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}

pub async fn worker(config: &Config) -> Result<ExitCode> {
    config
        .ensure_dirs()
        .with_context(|| format!("failed to create {}", config.home_dir.display()))?;

    let credentials = Credentials::from_env();
    if !credentials.is_present() {
        bail!("not authenticated; set CONVERSO_ACCESS_TOKEN");
    }

    let registry = load_registry(config)?;
    let bridge = build_bridge(config)?;
    let dispatcher = Arc::new(Dispatcher::new(
        registry,
        bridge.clone(),
        credentials.clone(),
    ));
    let api = Arc::new(HttpJobApi::new(config.api_endpoint.clone(), &credentials)?);

    let worker = Worker::new(
        config.worker_config(),
        dispatcher,
        api.clone(),
        api,
        credentials,
    );
    worker.start()?;
    tracing::info!(
        api_endpoint = %config.api_endpoint,
        modules_dir = %config.modules_dir().display(),
        "Serving jobs"
    );

    shutdown_signal().await;

    // A job already running is allowed to finish.
    worker.stop().await?;
    bridge.shutdown();
    Ok(ExitCode::SUCCESS)
}

pub async fn version(config: &Config) -> Result<ExitCode> {
    let mut info = VersionInfo::new();
    if let Some(interpreter) = config.resolve_interpreter()
        && let Some(version) = detect_interpreter_version(&interpreter).await
    {
        info = info.with_interpreter(&interpreter, version);
    }
    print_json(&info)?;
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_arg_reads_json_values() {
        assert_eq!(parse_arg("count=3").unwrap(), ("count".to_string(), json!(3)));
        assert_eq!(parse_arg("hd=true").unwrap(), ("hd".to_string(), json!(true)));
        assert_eq!(
            parse_arg(r#"tags=["a","b"]"#).unwrap(),
            ("tags".to_string(), json!(["a", "b"]))
        );
    }

    #[test]
    fn parse_arg_falls_back_to_string() {
        assert_eq!(
            parse_arg("url=https://youtube.com/watch?v=1").unwrap(),
            ("url".to_string(), json!("https://youtube.com/watch?v=1"))
        );
        assert_eq!(parse_arg("empty=").unwrap(), ("empty".to_string(), json!("")));
    }

    #[test]
    fn parse_arg_rejects_missing_separator() {
        assert!(parse_arg("novalue").is_err());
        assert!(parse_arg("=3").is_err());
    }

    #[test]
    fn progress_line_format() {
        let event = ProgressEvent::new("downloading", 3, 4).with_message("video.mp4");
        assert_eq!(
            format_progress(&event),
            "[downloading] 3/4 (75.0%) video.mp4"
        );
        let bare = ProgressEvent::new("saving", 0, 0);
        assert_eq!(format_progress(&bare), "[saving] 0/0 (0.0%)");
    }
}
