//! memoize - CLI entry point

use clap::Parser;
use console::style;
use memoize::cli::{commands, Cli, LogFormat};
use memoize::config::{Config, ConfigManager, Settings};
use memoize::engine::Engine;
use memoize::error::{MemoizeError, MemoizeResult, EXIT_INTERNAL};
use memoize::invocation::Invocation;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    // Usage errors must not look like an exit code of the wrapped command
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(EXIT_INTERNAL)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match run(cli).await {
        Ok(code) => ExitCode::from((code & 0xff) as u8),
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(cli: Cli) -> MemoizeResult<i32> {
    if cli.command.is_empty() {
        return Err(MemoizeError::EmptyCommand);
    }

    // Load configuration
    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = config_manager.load().await?;

    init_logging(cli.verbose, log_format(&cli, &config));

    let cwd = std::env::current_dir()
        .map_err(|e| MemoizeError::io("getting current directory", e))?;
    let settings = Settings::resolve(&config, cli.overrides(), &cwd).await?;
    let invocation = Invocation::from_current(cli.command.clone(), &settings.env_keys)?;
    let engine = Engine::new(settings).await?;

    if cli.explain {
        commands::explain(&engine, &invocation).await
    } else if cli.forget {
        commands::forget(&engine, &invocation).await
    } else {
        commands::run(&engine, &invocation).await
    }
}

fn log_format(cli: &Cli, config: &Config) -> LogFormat {
    match cli.log_format {
        Some(format) => format,
        None if config.general.log_format == "json" => LogFormat::Json,
        None => LogFormat::Text,
    }
}

/// Logs go to stderr; stdout belongs to the wrapped command.
/// 0 = warn, 1 = info, 2 = debug, 3+ = trace
fn init_logging(verbose: u8, format: LogFormat) {
    let filter = match verbose {
        0 => EnvFilter::new("memoize=warn"),
        1 => EnvFilter::new("memoize=info"),
        2 => EnvFilter::new("memoize=debug"),
        _ => EnvFilter::new("memoize=trace"),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time();

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
