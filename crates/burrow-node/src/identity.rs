//! Persistent node identity

use std::path::Path;

use burrow_dht::NodeId;
use tracing::warn;

/// Loads the node id from `path`, generating and persisting a fresh
/// one when the file is missing or unreadable.
///
/// Persistence failures are downgraded to a warning and an ephemeral
/// identity so a read-only filesystem never prevents startup.
pub fn load_or_generate(path: &Path) -> NodeId {
    match std::fs::read_to_string(path) {
        Ok(text) => match parse_hex_id(text.trim()) {
            Some(id) => return id,
            None => {
                warn!(path = %path.display(), "identity file is corrupt, regenerating");
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            warn!(path = %path.display(), %err, "failed to read identity file");
        }
    }

    let id = NodeId::random();
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(err) = std::fs::write(path, hex::encode(id.as_bytes())) {
        warn!(path = %path.display(), %err, "failed to persist identity, using ephemeral id");
    }
    id
}

fn parse_hex_id(text: &str) -> Option<NodeId> {
    let bytes = hex::decode(text).ok()?;
    NodeId::from_slice(&bytes)
}
