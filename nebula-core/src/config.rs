//! Nebula configuration
//!
//! ## Configuration Sources (in precedence order)
//!
//! 1. `--config <path>` - explicit file, must exist
//! 2. `./nebula.yaml` - project-level config
//! 3. `<user config dir>/nebula/nebula.yaml` - global config
//! 4. Built-in defaults
//!
//! Every field is optional; missing fields take their defaults.
//!
//! ```yaml
//! manifest_dir: manifests/mise
//! installer_url: https://mise.run
//! default_platforms: [linux-x64]
//! fetch:
//!   timeout_seconds: 30
//! policy:
//!   allowed_domains: [github.com, mise.run]
//! ```

use crate::fetch::releases::DEFAULT_RELEASE_API_URL;
use crate::fetch::FetchSettings;
use crate::policy::PolicyConfig;
use crate::trust::manifest::PlatformSet;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File name looked up in the working directory and user config dir
pub const CONFIG_FILE_NAME: &str = "nebula.yaml";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NebulaConfig {
    /// Local manifest directory (`<version>.conf` records plus `latest`)
    #[serde(default = "default_manifest_dir")]
    pub manifest_dir: PathBuf,

    /// Published manifest directory; when set, `verify` reads pins from here
    #[serde(default)]
    pub manifest_url: Option<String>,

    /// Installer script location
    #[serde(default = "default_installer_url")]
    pub installer_url: String,

    /// Upstream "latest release" endpoint
    #[serde(default = "default_release_api_url")]
    pub release_api_url: String,

    /// Where `update` writes the audited script; `null` disables the snapshot
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: Option<PathBuf>,

    /// Platforms recorded on new pins
    #[serde(default = "default_platforms")]
    pub default_platforms: Vec<String>,

    /// Transport settings
    #[serde(default)]
    pub fetch: FetchSettings,

    /// Policy engine settings
    #[serde(default)]
    pub policy: PolicyConfig,
}

impl Default for NebulaConfig {
    fn default() -> Self {
        Self {
            manifest_dir: default_manifest_dir(),
            manifest_url: None,
            installer_url: default_installer_url(),
            release_api_url: default_release_api_url(),
            snapshot_path: default_snapshot_path(),
            default_platforms: default_platforms(),
            fetch: FetchSettings::default(),
            policy: PolicyConfig::default(),
        }
    }
}

fn default_manifest_dir() -> PathBuf {
    PathBuf::from("manifests/mise")
}

fn default_installer_url() -> String {
    "https://mise.run".to_string()
}

fn default_release_api_url() -> String {
    DEFAULT_RELEASE_API_URL.to_string()
}

fn default_snapshot_path() -> Option<PathBuf> {
    Some(PathBuf::from("scripts/mise/upstream-install.sh"))
}

fn default_platforms() -> Vec<String> {
    vec!["linux-x64".to_string()]
}

impl NebulaConfig {
    /// Load configuration following the documented precedence
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        Self::discover(explicit, Path::new("."), user_config_path().as_deref())
    }

    /// Load configuration from a single YAML file
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config: NebulaConfig = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    fn discover(explicit: Option<&Path>, working_dir: &Path, user_config: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            if !path.is_file() {
                bail!("Config file not found: {}", path.display());
            }
            return Self::load_from_path(path);
        }

        let project = working_dir.join(CONFIG_FILE_NAME);
        if project.is_file() {
            return Self::load_from_path(&project);
        }

        if let Some(user) = user_config.filter(|p| p.is_file()) {
            return Self::load_from_path(user);
        }

        debug!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    /// Platforms for new pins as a set
    pub fn platform_set(&self) -> PlatformSet {
        self.default_platforms.iter().map(String::as_str).collect()
    }
}

/// `<user config dir>/nebula/nebula.yaml`, if the platform has one
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "nebula")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}
