//! Nebula - integrity pinning and static auditing for remote installer scripts
//!
//! Logs always go to stderr. Stdout carries verified script bytes or
//! machine-readable output only, so `nebula verify | sh` is safe.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use nebula_core::config::NebulaConfig;
use nebula_core::fetch::{Fetcher, HttpFetcher};
use nebula_core::policy::PolicyEngine;

mod trust_cli;

/// Log levels
#[derive(Debug, Clone, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Parser, Debug)]
#[clap(
    name = "nebula",
    about = "Verify, lint and pin third-party installer scripts",
    version
)]
struct Cli {
    #[clap(subcommand)]
    command: Command,

    /// Set log level
    #[clap(long, default_value = "info", global = true)]
    log_level: LogLevel,

    /// Emit logs as JSON lines
    #[clap(long, global = true)]
    log_json: bool,

    /// Configuration file (default: ./nebula.yaml, then the user config dir)
    #[clap(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Parser, Debug)]
enum Command {
    /// Fetch the installer and admit it only if it matches its pinned hash
    Verify {
        /// Version to verify against (default: the `latest` pointer)
        #[clap(long)]
        version: Option<String>,

        /// Platform identifier to check against the pin (default: this host)
        #[clap(long)]
        platform: Option<String>,

        /// Read pins from a published manifest directory instead of the local one
        #[clap(long)]
        manifest_url: Option<String>,

        /// Write the verified script here instead of stdout
        #[clap(short, long)]
        output: Option<PathBuf>,

        /// Print the verification result as JSON (script only written with --output)
        #[clap(long)]
        json: bool,
    },

    /// Check a script against the security policy
    Lint {
        /// Script to lint (`-` or omitted: stdin)
        path: Option<PathBuf>,

        /// Fetch the script from a URL instead
        #[clap(long, conflicts_with = "path")]
        url: Option<String>,

        /// Output results as JSON
        #[clap(long)]
        json: bool,
    },

    /// Pin the latest upstream release if it passes the security policy
    Update {
        /// Fetch and audit, but write nothing
        #[clap(long)]
        dry_run: bool,

        /// Do not write the audited script snapshot
        #[clap(long)]
        no_snapshot: bool,
    },

    /// Show a pinned manifest entry
    Show {
        /// Version to show (default: the `latest` pointer)
        version: Option<String>,

        /// List every pinned version
        #[clap(long, conflicts_with = "version")]
        all: bool,

        /// Output as JSON
        #[clap(long)]
        json: bool,
    },

    /// Print the SHA-256 of a local file in manifest form
    Hash {
        /// File to hash
        path: PathBuf,
    },
}

/// Initialize tracing with CLI flags
///
/// Everything goes to stderr; stdout is reserved for script bytes.
fn initialize_tracing(log_level: &LogLevel, json: bool) {
    let filter = EnvFilter::new(log_level.to_filter_directive());

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    initialize_tracing(&cli.log_level, cli.log_json);

    let config = NebulaConfig::load(cli.config.as_deref())?;
    debug!("Effective configuration: {:?}", config);

    match cli.command {
        Command::Verify {
            version,
            platform,
            manifest_url,
            output,
            json,
        } => {
            trust_cli::verify_command(
                &config,
                trust_cli::VerifyArgs {
                    version,
                    platform,
                    manifest_url,
                    output,
                    json,
                },
            )
            .await
        }
        Command::Lint { path, url, json } => lint_command(&config, path, url, json).await,
        Command::Update {
            dry_run,
            no_snapshot,
        } => trust_cli::update_command(&config, dry_run, no_snapshot).await,
        Command::Show { version, all, json } => {
            trust_cli::show_command(&config, version, all, json).await
        }
        Command::Hash { path } => trust_cli::hash_command(&path).await,
    }
}

// Table row structure for violation display
#[derive(Tabled)]
struct ViolationRow {
    #[tabled(rename = "Rule")]
    rule: String,
    #[tabled(rename = "Line")]
    line: String,
    #[tabled(rename = "Detail")]
    detail: String,
}

async fn read_script(path: Option<&Path>, url: Option<&str>, config: &NebulaConfig) -> Result<(String, Vec<u8>)> {
    if let Some(url) = url {
        let fetcher = HttpFetcher::new(&config.fetch)?;
        let bytes = fetcher.fetch(url).await?;
        return Ok((url.to_string(), bytes));
    }

    match path {
        Some(path) if path != Path::new("-") => {
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("Failed to read script {}", path.display()))?;
            Ok((path.display().to_string(), bytes))
        }
        _ => {
            let mut bytes = Vec::new();
            io::stdin()
                .read_to_end(&mut bytes)
                .context("Failed to read script from stdin")?;
            Ok(("<stdin>".to_string(), bytes))
        }
    }
}

async fn lint_command(
    config: &NebulaConfig,
    path: Option<PathBuf>,
    url: Option<String>,
    json: bool,
) -> Result<()> {
    let (source, script) = read_script(path.as_deref(), url.as_deref(), config).await?;
    info!("Linting {} ({} bytes)", source, script.len());

    let engine = PolicyEngine::new(&config.policy);
    let report = engine.report(&script);

    if json {
        let json_output = serde_json::json!({
            "source": source,
            "clean": report.is_clean(),
            "report": report,
        });
        println!("{}", serde_json::to_string_pretty(&json_output)?);
    } else if report.is_clean() {
        println!("✅ {source}: no policy violations (sha256 {})", report.script_hash);
    } else {
        let rows: Vec<ViolationRow> = report
            .violations
            .iter()
            .map(|v| ViolationRow {
                rule: v.rule.to_string(),
                line: v.line.map(|l| l.to_string()).unwrap_or_else(|| "-".to_string()),
                detail: v.detail.clone(),
            })
            .collect();

        let table = Table::new(&rows)
            .with(Style::rounded())
            .with(Modify::new(Rows::first()).with(Alignment::center()))
            .to_string();

        println!(
            "❌ {source}: {} policy violation(s) (sha256 {})\n",
            report.violations.len(),
            report.script_hash
        );
        println!("{table}");
    }

    if !report.is_clean() {
        std::process::exit(1);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_verify_flags() {
        let cli = Cli::try_parse_from([
            "nebula",
            "--log-level",
            "debug",
            "verify",
            "--version",
            "v2025.1.6",
            "--platform",
            "linux-arm64",
            "-o",
            "install.sh",
        ])
        .unwrap();

        match cli.command {
            Command::Verify {
                version,
                platform,
                output,
                json,
                ..
            } => {
                assert_eq!(version.as_deref(), Some("v2025.1.6"));
                assert_eq!(platform.as_deref(), Some("linux-arm64"));
                assert_eq!(output, Some(PathBuf::from("install.sh")));
                assert!(!json);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_lint_path_and_url_conflict() {
        let result = Cli::try_parse_from(["nebula", "lint", "a.sh", "--url", "https://mise.run"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_show_all_conflicts_with_version() {
        assert!(Cli::try_parse_from(["nebula", "show", "--all"]).is_ok());
        assert!(Cli::try_parse_from(["nebula", "show", "v1", "--all"]).is_err());
    }
}
