//! Loads or mints the node's static identity from the seed file named in
//! [`brypt_config::Settings`].

use std::path::Path;

use brypt_identifier::NodeId;
use rand::RngCore;
use tracing::info;

/// Reads 32 bytes of seed material from `path` and derives a [`NodeId`] from
/// it. If the file does not exist, generates fresh random seed bytes, writes
/// them to `path` for future runs, and derives the identifier from those.
pub fn load_or_create(path: &Path) -> anyhow::Result<NodeId> {
    let seed = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            let mut seed = vec![0u8; 32];
            rand::thread_rng().fill_bytes(&mut seed);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, &seed)?;
            info!(path = %path.display(), "generated a new node identity seed");
            seed
        }
        Err(error) => return Err(error.into()),
    };
    Ok(NodeId::from_public_key(&seed))
}
