//! Settings file, CLI overrides, and bootstrap-cache loading for a brypt node.
//!
//! Thin collaborator: this crate only loads and validates configuration, it
//! does not own any component lifetimes. Settings load from TOML
//! (`toml` + `serde`, the teacher's pattern in `zhtp/src/config`), CLI flags
//! parse with `clap`'s builder API (`zhtp/src/cli/argument_parsing.rs`), and
//! the bootstrap cache is a JSON file read with `serde_json`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::{Arg, Command};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to parse bootstrap cache: {0}")]
    BootstrapParse(#[from] serde_json::Error),
    #[error("invalid socket address {value:?}: {source}")]
    InvalidAddress { value: String, source: std::net::AddrParseError },
}

/// The node's persistent settings, loaded from a TOML file and overridable by
/// CLI flags.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Path to the file holding the node's identity seed/keypair bytes.
    pub identity_seed_path: PathBuf,
    /// Address this node's endpoint driver listens on.
    pub bind_address: SocketAddr,
    /// Addresses dialed at startup to join the mesh.
    #[serde(default)]
    pub connect_addresses: Vec<SocketAddr>,
    /// Path to the bootstrap cache JSON file (see [`BootstrapCache::load`]).
    pub bootstrap_cache_path: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Cluster identification number reported by `/info/node`.
    #[serde(default)]
    pub cluster: u32,
    /// Whether this node reports itself as a coordinator ("coordinator") rather
    /// than a plain mesh node ("node") in `/info/node`'s `designation` field.
    #[serde(default)]
    pub coordinator: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Applies CLI overrides in place; flags left unset on the command line
    /// leave the file-loaded value untouched.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) -> Result<(), ConfigError> {
        if let Some(bind) = &args.bind_address {
            self.bind_address = parse_address(bind)?;
        }
        if !args.connect_addresses.is_empty() {
            self.connect_addresses =
                args.connect_addresses.iter().map(|value| parse_address(value)).collect::<Result<_, _>>()?;
        }
        if let Some(path) = &args.bootstrap_cache_path {
            self.bootstrap_cache_path = path.clone();
        }
        if let Some(level) = &args.log_level {
            self.log_level = level.clone();
        }
        Ok(())
    }
}

fn parse_address(value: &str) -> Result<SocketAddr, ConfigError> {
    value.parse().map_err(|source| ConfigError::InvalidAddress { value: value.to_string(), source })
}

/// Parsed command-line flags. `config` is the only required flag; everything
/// else overrides a field of [`Settings`] when present.
#[derive(Debug, Clone)]
pub struct CliArgs {
    pub config: PathBuf,
    pub bind_address: Option<String>,
    pub connect_addresses: Vec<String>,
    pub bootstrap_cache_path: Option<PathBuf>,
    pub log_level: Option<String>,
}

pub fn parse_cli_arguments() -> CliArgs {
    let matches = Command::new("brypt")
        .version(env!("CARGO_PKG_VERSION"))
        .about("brypt mesh node")
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("PATH")
                .help("Path to the node's TOML settings file")
                .default_value("brypt.toml"),
        )
        .arg(Arg::new("bind").long("bind").value_name("ADDR").help("Override the listen address"))
        .arg(
            Arg::new("connect")
                .long("connect")
                .value_name("ADDR")
                .help("Dial an address at startup; may be repeated")
                .action(clap::ArgAction::Append),
        )
        .arg(Arg::new("bootstrap-cache").long("bootstrap-cache").value_name("PATH").help("Override the bootstrap cache path"))
        .arg(Arg::new("log-level").long("log-level").value_name("LEVEL").help("Override the tracing log level"))
        .get_matches();

    CliArgs {
        config: matches.get_one::<String>("config").expect("has default_value").into(),
        bind_address: matches.get_one::<String>("bind").cloned(),
        connect_addresses: matches
            .get_many::<String>("connect")
            .map(|values| values.cloned().collect())
            .unwrap_or_default(),
        bootstrap_cache_path: matches.get_one::<String>("bootstrap-cache").map(PathBuf::from),
        log_level: matches.get_one::<String>("log-level").cloned(),
    }
}

/// One bootstrap-cache entry: a known peer's identifier, dialable entry
/// address, and an optional location hint.
#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapRecord {
    pub identifier: Option<String>,
    pub entry: String,
    pub location: Option<String>,
}

/// A JSON object keyed by protocol name, each value an array of
/// [`BootstrapRecord`]s. Read once at startup by the process root and
/// consulted by the Tracking Service when aggregating fan-outs.
pub type BootstrapCache = HashMap<String, Vec<BootstrapRecord>>;

pub fn load_bootstrap_cache(path: impl AsRef<Path>) -> Result<BootstrapCache, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_load_from_toml() {
        let toml = r#"
            identity_seed_path = "/tmp/brypt.seed"
            bind_address = "127.0.0.1:9000"
            bootstrap_cache_path = "/tmp/bootstrap.json"
        "#;
        let dir = std::env::temp_dir().join(format!("brypt-config-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.toml");
        std::fs::write(&path, toml).unwrap();

        let settings = Settings::load_from_file(&path).unwrap();
        assert_eq!(settings.bind_address.to_string(), "127.0.0.1:9000");
        assert_eq!(settings.log_level, "info");
        assert!(settings.connect_addresses.is_empty());
    }

    #[test]
    fn cli_overrides_only_touch_provided_fields() {
        let mut settings = Settings {
            identity_seed_path: PathBuf::from("/tmp/seed"),
            bind_address: "127.0.0.1:9000".parse().unwrap(),
            connect_addresses: Vec::new(),
            bootstrap_cache_path: PathBuf::from("/tmp/bootstrap.json"),
            log_level: "info".to_string(),
            cluster: 0,
            coordinator: false,
        };
        let args = CliArgs {
            config: PathBuf::from("brypt.toml"),
            bind_address: Some("127.0.0.1:9100".to_string()),
            connect_addresses: Vec::new(),
            bootstrap_cache_path: None,
            log_level: None,
        };
        settings.apply_cli_overrides(&args).unwrap();
        assert_eq!(settings.bind_address.to_string(), "127.0.0.1:9100");
        assert_eq!(settings.bootstrap_cache_path, PathBuf::from("/tmp/bootstrap.json"));
    }

    #[test]
    fn invalid_override_address_is_rejected() {
        let mut settings = Settings {
            identity_seed_path: PathBuf::from("/tmp/seed"),
            bind_address: "127.0.0.1:9000".parse().unwrap(),
            connect_addresses: Vec::new(),
            bootstrap_cache_path: PathBuf::from("/tmp/bootstrap.json"),
            log_level: "info".to_string(),
            cluster: 0,
            coordinator: false,
        };
        let args = CliArgs {
            config: PathBuf::from("brypt.toml"),
            bind_address: Some("not-an-address".to_string()),
            connect_addresses: Vec::new(),
            bootstrap_cache_path: None,
            log_level: None,
        };
        assert!(settings.apply_cli_overrides(&args).is_err());
    }

    #[test]
    fn bootstrap_cache_parses_protocol_keyed_records() {
        let json = r#"{
            "tcp": [{"identifier": "abc", "entry": "127.0.0.1:35216"}, {"entry": "127.0.0.1:35217", "location": "us-east"}]
        }"#;
        let dir = std::env::temp_dir().join(format!("brypt-config-bootstrap-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bootstrap.json");
        std::fs::write(&path, json).unwrap();

        let cache = load_bootstrap_cache(&path).unwrap();
        let tcp = cache.get("tcp").expect("tcp protocol entries");
        assert_eq!(tcp.len(), 2);
        assert_eq!(tcp[0].identifier.as_deref(), Some("abc"));
        assert!(tcp[1].identifier.is_none());
    }
}
