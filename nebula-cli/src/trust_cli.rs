//! Trust CLI commands
//!
//! verify, update, show and hash: everything that reads or writes pins.

use anyhow::{Context, Result};
use nebula_core::config::NebulaConfig;
use nebula_core::fetch::{Fetcher, GithubReleases, HttpFetcher};
use nebula_core::platform::current_platform;
use nebula_core::policy::PolicyEngine;
use nebula_core::trust::hasher::hash_file;
use nebula_core::trust::{
    DirectoryStore, GateSettings, ManifestEntry, ManifestReader, RemoteManifest, Target,
    VerificationGate,
};
use nebula_core::update::{UpdateAgent, UpdateError, UpdateOutcome, UpdateSettings};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tabled::{settings::Style, Table, Tabled};
use tracing::{debug, info};

/// Arguments of `nebula verify`
pub struct VerifyArgs {
    pub version: Option<String>,
    pub platform: Option<String>,
    pub manifest_url: Option<String>,
    pub output: Option<PathBuf>,
    pub json: bool,
}

fn http_fetcher(config: &NebulaConfig) -> Result<Arc<dyn Fetcher>> {
    Ok(Arc::new(HttpFetcher::new(&config.fetch)?))
}

fn manifest_reader(
    config: &NebulaConfig,
    manifest_url: Option<String>,
    fetcher: Arc<dyn Fetcher>,
) -> Arc<dyn ManifestReader> {
    match manifest_url.or_else(|| config.manifest_url.clone()) {
        Some(url) => {
            info!("Reading pins from {}", url);
            Arc::new(RemoteManifest::new(fetcher, url))
        }
        None => {
            info!("Reading pins from {}", config.manifest_dir.display());
            Arc::new(DirectoryStore::new(config.manifest_dir.clone()))
        }
    }
}

pub async fn verify_command(config: &NebulaConfig, args: VerifyArgs) -> Result<()> {
    let fetcher = http_fetcher(config)?;
    let manifests = manifest_reader(config, args.manifest_url, fetcher.clone());

    let gate = VerificationGate::new(
        fetcher,
        manifests,
        GateSettings {
            installer_url: config.installer_url.clone(),
            platform: args.platform.unwrap_or_else(current_platform),
        },
    );

    let target = args.version.map(Target::Version).unwrap_or(Target::Latest);
    let result = gate
        .verify(&target)
        .await
        .context("Manifest store is corrupt or unreadable; refusing to verify")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    }

    if let Some(reason) = result.reject_reason() {
        eprintln!("❌ Rejected installer for {target}: {reason}");
        std::process::exit(1);
    }

    let version = result.version().unwrap_or("?").to_string();
    let hash = result
        .actual_hash()
        .map(|h| h.to_string())
        .unwrap_or_default();
    let script = result.into_script().unwrap_or_default();

    match args.output {
        Some(path) => {
            tokio::fs::write(&path, &script)
                .await
                .with_context(|| format!("Failed to write verified script to {}", path.display()))?;
            eprintln!("✅ Verified {version} (sha256 {hash}) -> {}", path.display());
        }
        None if args.json => {
            eprintln!("✅ Verified {version} (sha256 {hash}); use --output to write the script");
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&script)?;
            stdout.flush()?;
        }
    }

    Ok(())
}

pub async fn update_command(config: &NebulaConfig, dry_run: bool, no_snapshot: bool) -> Result<()> {
    let fetcher = http_fetcher(config)?;
    let releases = Arc::new(GithubReleases::new(
        fetcher.clone(),
        config.release_api_url.clone(),
    ));
    let store = Arc::new(DirectoryStore::new(config.manifest_dir.clone()));

    let agent = UpdateAgent::new(
        releases,
        fetcher,
        store,
        PolicyEngine::new(&config.policy),
        UpdateSettings {
            installer_url: config.installer_url.clone(),
            allowed_platforms: config.platform_set(),
            snapshot_path: if no_snapshot {
                None
            } else {
                config.snapshot_path.clone()
            },
        },
    );

    let outcome = match agent.run(dry_run).await {
        Ok(outcome) => outcome,
        Err(UpdateError::PolicyViolation {
            version,
            violations,
        }) => {
            eprintln!(
                "❌ {version} was NOT pinned: {} policy violation(s)",
                violations.len()
            );
            for violation in &violations {
                eprintln!("   - {violation}");
            }
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    };
    debug!("Update finished at {}", outcome.version());

    match &outcome {
        UpdateOutcome::UpToDate { version } => {
            println!("✅ Already up to date at {version}");
        }
        UpdateOutcome::PointerRepaired { version } => {
            println!("🔧 {version} was already pinned; latest pointer advanced to it");
        }
        UpdateOutcome::WouldRepairPointer { version } => {
            println!("🔍 Dry run: {version} is pinned, latest pointer would be advanced");
        }
        UpdateOutcome::WouldPin { entry } => {
            println!("🔍 Dry run: would pin {}", entry.version);
            println!("   sha256:    {}", entry.integrity_hash);
            println!("   platforms: {}", entry.allowed_platforms);
        }
        UpdateOutcome::Pinned { entry, snapshot } => {
            println!("✅ Pinned {}", entry.version);
            println!("   sha256:    {}", entry.integrity_hash);
            println!("   platforms: {}", entry.allowed_platforms);
            if let Some(path) = snapshot {
                println!("   snapshot:  {}", path.display());
            }
            println!("\n⚠️  Please run regression tests before pushing");
        }
    }

    Ok(())
}

// Table row structure for the pin listing
#[derive(Tabled)]
struct PinRow {
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "SHA-256")]
    hash: String,
    #[tabled(rename = "Platforms")]
    platforms: String,
    #[tabled(rename = "Latest")]
    latest: String,
}

fn print_entry(entry: &ManifestEntry, is_latest: bool) {
    let marker = if is_latest { " (latest)" } else { "" };
    println!("{}{}", entry.version, marker);
    println!("  sha256:    {}", entry.integrity_hash);
    println!("  platforms: {}", entry.allowed_platforms);
    if let Some(pinned_at) = entry.pinned_at {
        println!("  pinned at: {}", pinned_at.to_rfc3339());
    }
}

pub async fn show_command(
    config: &NebulaConfig,
    version: Option<String>,
    all: bool,
    json: bool,
) -> Result<()> {
    let store = DirectoryStore::new(config.manifest_dir.clone());
    let latest = store.latest_version().await?;

    if all {
        let mut entries = Vec::new();
        for version in store.versions()? {
            entries.push(store.lookup(&version).await?);
        }

        if json {
            let json_output = serde_json::json!({
                "latest": latest,
                "entries": entries,
            });
            println!("{}", serde_json::to_string_pretty(&json_output)?);
        } else if entries.is_empty() {
            println!("No versions pinned in {}", store.root().display());
        } else {
            let rows: Vec<PinRow> = entries
                .iter()
                .map(|e| PinRow {
                    version: e.version.clone(),
                    hash: e.integrity_hash.short(),
                    platforms: e.allowed_platforms.to_string(),
                    latest: if latest.as_deref() == Some(e.version.as_str()) {
                        "✓".to_string()
                    } else {
                        String::new()
                    },
                })
                .collect();
            println!("{}", Table::new(&rows).with(Style::rounded()));
        }
        return Ok(());
    }

    let entry = match version {
        Some(version) => store.lookup(&version).await?,
        None => store.resolve_latest().await?,
    };
    let is_latest = latest.as_deref() == Some(entry.version.as_str());

    if json {
        let json_output = serde_json::json!({
            "latest": is_latest,
            "entry": entry,
        });
        println!("{}", serde_json::to_string_pretty(&json_output)?);
    } else {
        print_entry(&entry, is_latest);
    }

    Ok(())
}

pub async fn hash_command(path: &Path) -> Result<()> {
    let hash = hash_file(path).await?;
    println!("BOOTSTRAPPER_SHA256={hash}");
    Ok(())
}
