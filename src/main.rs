use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::{Input, Password};
use tracing_subscriber::{fmt, EnvFilter};

use influx_importer::api::client::{login, Client};
use influx_importer::catalog::MetricCatalog;
use influx_importer::config::{self, Config};
use influx_importer::extract::{ExtractSettings, Extractor};
use influx_importer::health::RunMetrics;
use influx_importer::sink::InfluxSink;

/// Incrementally extracts 128T metrics and alarm history into InfluxDB.
#[derive(Parser)]
#[command(name = "influx-importer", about)]
struct Cli {
    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Defaults to the config file's log_level, then "info".
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single extraction.
    Extract {
        /// Path to the YAML configuration file.
        #[arg(short, long, env = "INFLUX_IMPORTER_CONFIG")]
        config: PathBuf,
    },
    /// Print a configuration template listing every builtin metric.
    Init {
        /// Conductor URL to place in the template.
        #[arg(long, default_value = "")]
        url: String,
        /// JWT to place in the template.
        #[arg(long, default_value = "")]
        token: String,
    },
    /// Log into the conductor and print the resulting JWT.
    GetToken {
        /// Fully qualified conductor URL, e.g. https://10.0.1.29
        url: String,
        /// Reject self-signed conductor certificates.
        #[arg(long)]
        strict_tls: bool,
    },
    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected via env at build time.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Version => {
            println!("influx-importer {}", version::full());
            Ok(())
        }
        Command::Init { url, token } => {
            print!(
                "{}",
                config::render_template(&url, &token, &MetricCatalog::builtin())
            );
            Ok(())
        }
        Command::GetToken { url, strict_tls } => {
            init_tracing(cli.log_level.as_deref().unwrap_or("info"))?;
            get_token(&url, !strict_tls)
        }
        Command::Extract { config } => {
            let cfg = load_config(&config)?;
            init_tracing(cli.log_level.as_deref().unwrap_or(&cfg.log_level))?;

            tracing::info!(
                version = version::RELEASE,
                commit = version::git_commit(),
                "starting influx-importer",
            );

            runtime()?.block_on(extract(cfg))
        }
    }
}

fn init_tracing(level: &str) -> Result<()> {
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    Ok(())
}

fn load_config(path: &Path) -> Result<Config> {
    Config::load(path).with_context(|| format!("loading config from {}", path.display()))
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")
}

async fn extract(cfg: Config) -> Result<()> {
    let metrics = Arc::new(RunMetrics::new().context("registering run metrics")?);

    let client = Client::new(&cfg.target)
        .context("creating conductor client")?
        .with_metrics(metrics.request_callback());
    let sink = InfluxSink::new(&cfg.influx).context("creating InfluxDB sink")?;
    let settings = ExtractSettings::from_config(&cfg)?;

    let extractor = Extractor::new(
        Arc::new(client),
        Arc::new(sink),
        settings,
        Arc::clone(&metrics),
    );
    let result = extractor.run().await;

    if let Some(path) = &cfg.health.textfile {
        if let Err(e) = metrics.write_textfile(path) {
            tracing::warn!(path = %path.display(), error = %e, "writing run metrics failed");
        }
    }

    let summary = result?;
    if summary.failed > 0 {
        tracing::warn!(
            failed = summary.failed,
            routers = ?summary.failed_routers,
            "some items failed to export",
        );
    }

    Ok(())
}

fn get_token(url: &str, accept_invalid_certs: bool) -> Result<()> {
    let username: String = Input::new()
        .with_prompt("Username")
        .interact_text()
        .context("reading username")?;
    let password = Password::new()
        .with_prompt("Password")
        .interact()
        .context("reading password")?;

    let token = runtime()?.block_on(login(url, &username, &password, accept_invalid_certs))?;

    println!("{token}");

    Ok(())
}
