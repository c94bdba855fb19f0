//! converso - run, manage and serve out-of-process modules.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

/// Converso module runner
#[derive(Parser)]
#[command(name = "converso")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Modules directory (default: ~/.converso/plugins)
    #[arg(long, global = true)]
    modules_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage installed modules
    Modules {
        #[command(subcommand)]
        command: ModulesCommand,
    },

    /// Run a single module command and print its response
    Run {
        /// Module name
        module: String,

        /// Command declared by the module's manifest
        command: String,

        /// Command argument as key=value (value parsed as JSON when valid)
        #[arg(short, long = "arg", value_name = "KEY=VALUE", value_parser = commands::parse_arg)]
        args: Vec<(String, serde_json::Value)>,

        /// Timeout in seconds
        #[arg(short, long, default_value_t = 300)]
        timeout: u64,
    },

    /// Poll the job API and execute jobs until interrupted
    Worker {
        /// Job API base URL
        #[arg(long, env = "CONVERSO_API_ENDPOINT")]
        api_endpoint: Option<String>,
    },

    /// Print version information
    Version,
}

#[derive(Subcommand)]
enum ModulesCommand {
    /// List installed modules
    List,

    /// Show a module's manifest
    Info {
        name: String,
    },

    /// Install a module from a local directory
    Install {
        name: String,
        source: PathBuf,
    },

    /// Remove an installed module
    Uninstall {
        name: String,
    },

    /// Replace an installed module with a new copy
    Update {
        name: String,
        source: PathBuf,
    },
}

/// Install the tracing subscriber.
///
/// `RUST_LOG` wins when set. Otherwise `CONVERSO_LOG` picks the level for the
/// converso crates (default warn, `--debug` forces debug). `LOG_FORMAT=json`
/// switches to structured output. Logs go to stderr; stdout carries results.
fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("converso=debug,converso_cli=debug")
    } else if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("CONVERSO_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("info") => "info",
            Ok("error") => "error",
            _ => "warn",
        };
        EnvFilter::new(format!("converso={level},converso_cli={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");
    if use_json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = converso::Config::from_env();
    if cli.debug {
        config = config.with_debug(true);
    }
    if let Some(dir) = cli.modules_dir {
        config = config.with_modules_dir(dir);
    }
    init_tracing(config.debug);

    let result = match cli.command {
        Commands::Modules { command } => match command {
            ModulesCommand::List => commands::modules_list(&config),
            ModulesCommand::Info { name } => commands::modules_info(&config, &name),
            ModulesCommand::Install { name, source } => {
                commands::modules_install(&config, &name, &source)
            }
            ModulesCommand::Uninstall { name } => commands::modules_uninstall(&config, &name),
            ModulesCommand::Update { name, source } => {
                commands::modules_update(&config, &name, &source)
            }
        },
        Commands::Run {
            module,
            command,
            args,
            timeout,
        } => commands::run(&config, &module, &command, args, timeout).await,
        Commands::Worker { api_endpoint } => {
            if let Some(endpoint) = api_endpoint {
                config = config.with_api_endpoint(endpoint);
            }
            commands::worker(&config).await
        }
        Commands::Version => commands::version(&config).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::debug!(error = ?e, "Command failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
