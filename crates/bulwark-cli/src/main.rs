//! `bulwark` command-line tool.
//!
//! ```text
//! bulwark fetch --url https://api.github.com/zen --service github --count 5
//! bulwark config --file bulwark.yaml
//! ```

use anyhow::{Context, Result};
use bulwark_core::CancellationToken;
use bulwark_runtime::{DependencyConfig, RuntimeError, Toolkit, ToolkitConfig};
use clap::{Parser, Subcommand, ValueEnum};
use reqwest::header::HeaderMap;
use reqwest::Method;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "bulwark", version, about = "Resilience toolkit for outbound HTTP calls")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send requests to a URL through breaker, retry, pool and degradation
    Fetch {
        /// Target URL
        #[arg(long)]
        url: String,

        /// Dependency name the requests are accounted under
        #[arg(long, default_value = "default")]
        service: String,

        /// Number of requests to send
        #[arg(long, default_value_t = 1)]
        count: u32,

        /// HTTP method
        #[arg(long, default_value = "GET")]
        method: String,

        /// YAML or JSON config file
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Print the effective configuration after defaults and validation
    Config {
        /// YAML or JSON config file
        #[arg(long)]
        file: Option<PathBuf>,

        #[arg(long, value_enum, default_value_t = Format::Yaml)]
        format: Format,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Yaml,
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "bulwark=debug" } else { "bulwark=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let result = match cli.command {
        Command::Fetch {
            url,
            service,
            count,
            method,
            config,
        } => fetch(url, service, count, method, config).await,
        Command::Config { file, format } => show_config(file, format),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<ToolkitConfig> {
    match path {
        Some(path) => ToolkitConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(ToolkitConfig::default()),
    }
}

async fn fetch(
    url: String,
    service: String,
    count: u32,
    method: String,
    config_path: Option<PathBuf>,
) -> Result<()> {
    let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .with_context(|| format!("invalid HTTP method '{method}'"))?;

    let mut config = load_config(config_path.as_ref())?;
    if !config.dependencies.iter().any(|dep| dep.name == service) {
        config.dependencies.push(DependencyConfig::new(service.clone()));
    }
    let toolkit = Toolkit::new(config)?;

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, cancelling in-flight request");
            on_signal.cancel();
        }
    });

    let headers = HeaderMap::new();
    for n in 1..=count {
        if shutdown.is_cancelled() {
            break;
        }
        match toolkit
            .fetch(&shutdown, &service, method.clone(), &url, &headers)
            .await
        {
            Ok(response) => println!("[{n}/{count}] {}", response.status()),
            Err(RuntimeError::Resilience(e)) if e.is_cancelled() => {
                println!("[{n}/{count}] cancelled");
                break;
            }
            Err(e) => println!("[{n}/{count}] {e}"),
        }
    }

    let stats = serde_json::to_string_pretty(&toolkit.stats())?;
    println!("{stats}");
    toolkit.close()?;
    Ok(())
}

fn show_config(path: Option<PathBuf>, format: Format) -> Result<()> {
    let config = load_config(path.as_ref())?;
    config.validate().context("configuration is invalid")?;

    let rendered = match format {
        Format::Yaml => config.to_yaml()?,
        Format::Json => serde_json::to_string_pretty(&config)?,
    };
    println!("{rendered}");
    Ok(())
}
