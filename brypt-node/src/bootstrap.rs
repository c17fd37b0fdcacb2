//! Reads the bootstrap-cache JSON file once at startup (§6 "Bootstrap file
//! format") and exposes per-protocol entries to the Tracking Service and to
//! the service locator.

use std::path::Path;

use brypt_config::{BootstrapCache, BootstrapRecord, ConfigError};
use brypt_identifier::NodeId;

pub struct BootstrapService {
    cache: BootstrapCache,
}

impl BootstrapService {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Ok(Self { cache: brypt_config::load_bootstrap_cache(path)? })
    }

    pub fn empty() -> Self {
        Self { cache: BootstrapCache::new() }
    }

    pub fn entries_for(&self, protocol: &str) -> &[BootstrapRecord] {
        self.cache.get(protocol).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Peer identifiers named across every protocol's entries, parsed from hex.
    /// Entries with no identifier or an unparsable one are skipped.
    pub fn known_identifiers(&self) -> Vec<NodeId> {
        self.cache
            .values()
            .flatten()
            .filter_map(|record| record.identifier.as_deref())
            .filter_map(|hex| NodeId::from_hex(hex).ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_cache_returns_no_entries() {
        let service = BootstrapService::empty();
        assert!(service.entries_for("tcp").is_empty());
        assert!(service.known_identifiers().is_empty());
    }

    #[test]
    fn load_reads_protocol_keyed_records_from_disk() {
        let dir = std::env::temp_dir().join(format!("brypt-node-bootstrap-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bootstrap.json");
        let identifier = NodeId::new(vec![7u8; 20]).unwrap().to_hex();
        std::fs::write(
            &path,
            format!(r#"{{"tcp": [{{"identifier": "{identifier}", "entry": "127.0.0.1:35216"}}]}}"#),
        )
        .unwrap();

        let service = BootstrapService::load(&path).unwrap();
        assert_eq!(service.entries_for("tcp").len(), 1);
        assert_eq!(service.known_identifiers(), vec![NodeId::from_hex(&identifier).unwrap()]);
    }
}
