//! Configuration management for the control service.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::Args;
use crate::dispatcher::ProvisioningDefaults;

/// Location checked when no `--config` is given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/virtpilot/node.yaml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Hypervisor backend configuration
    pub hypervisor: HypervisorConfig,
    /// Install media catalog
    pub iso: IsoConfig,
    /// Migration protocol settings
    pub migration: MigrationConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Defaults with CLI overrides applied, for running without a file.
    pub fn default_with_cli(args: &Args) -> Self {
        Self::default().with_cli_overrides(args)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref listen) = args.listen {
            self.server.listen_address = listen.clone();
        }

        if let Some(ref uri) = args.default_uri {
            self.hypervisor.default_uri = uri.clone();
        }

        if let Some(ref iso_path) = args.iso_path {
            self.iso.path = PathBuf::from(iso_path);
        }

        if args.dev {
            self.hypervisor.backend = HypervisorBackend::Mock;
        }

        self
    }

    /// Defaults the dispatcher applies to new VMs.
    pub fn provisioning(&self) -> ProvisioningDefaults {
        ProvisioningDefaults {
            iso_dir: self.iso.path.clone(),
            bridge: self.hypervisor.bridge.clone(),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP API listens on
    pub listen_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Hypervisor backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Backend type
    pub backend: HypervisorBackend,
    /// URI used when a request does not name one
    pub default_uri: String,
    /// Libvirt storage pool disk volumes and clones are allocated from
    pub storage_pool: String,
    /// Bridge new VMs are attached to
    pub bridge: String,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            backend: HypervisorBackend::Mock,
            default_uri: "qemu:///system".to_string(),
            storage_pool: "default".to_string(),
            bridge: "br0".to_string(),
        }
    }
}

/// Hypervisor backend type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HypervisorBackend {
    /// In-memory backend for development and tests
    #[default]
    Mock,
    /// Libvirt/QEMU backend
    Libvirt,
}

/// Install media configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IsoConfig {
    /// Directory scanned for `*.iso` files
    pub path: PathBuf,
}

impl Default for IsoConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/libvirt/images"),
        }
    }
}

/// Migration configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// How long to wait for the destination to acknowledge a migrated VM
    pub ack_timeout_secs: u64,
    /// Bring migrated VMs back up in their previous state
    pub live: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            ack_timeout_secs: 30,
            live: true,
        }
    }
}

impl MigrationConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "hypervisor:\n  backend: libvirt\n  default_uri: qemu+ssh://node-a/system\nmigration:\n  ack_timeout_secs: 5\n"
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.hypervisor.backend, HypervisorBackend::Libvirt);
        assert_eq!(config.hypervisor.default_uri, "qemu+ssh://node-a/system");
        assert_eq!(config.hypervisor.bridge, "br0");
        assert_eq!(config.migration.ack_timeout(), Duration::from_secs(5));
        assert!(config.migration.live);
        assert_eq!(config.server.listen_address, "0.0.0.0:8080");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(dir.path().join("node.yaml")).is_err());
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "server: [not, a, map").unwrap();
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let args = Args::parse_from([
            "virtpilot-node",
            "--listen",
            "127.0.0.1:9000",
            "--iso-path",
            "/srv/iso",
            "--dev",
        ]);

        let mut config = Config::default();
        config.hypervisor.backend = HypervisorBackend::Libvirt;
        let config = config.with_cli_overrides(&args);

        assert_eq!(config.server.listen_address, "127.0.0.1:9000");
        assert_eq!(config.iso.path, PathBuf::from("/srv/iso"));
        assert_eq!(config.hypervisor.backend, HypervisorBackend::Mock);
        assert_eq!(config.provisioning().iso_dir, PathBuf::from("/srv/iso"));
    }
}
