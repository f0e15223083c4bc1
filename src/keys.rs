//! Persistent SSH host identity.
//!
//! The key is generated on first start and reused afterwards so clients can
//! pin the server's fingerprint.

use russh_keys::key::KeyPair;
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::error::{Error, Result};

/// Load the host key at `path`, generating and persisting one if absent.
pub async fn obtain(path: &Path) -> Result<KeyPair> {
    if fs::try_exists(path).await? {
        let pem = fs::read_to_string(path).await?;
        let key = russh_keys::decode_secret_key(&pem, None)?;
        info!("Loaded host key from {}", path.display());
        return Ok(key);
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }

    let key = KeyPair::generate_ed25519()
        .ok_or_else(|| Error::Config("Failed to generate host key".into()))?;

    let mut pem = Vec::new();
    russh_keys::encode_pkcs8_pem(&key, &mut pem)?;

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(&pem).await?;
    file.sync_all().await?;

    info!("Generated new host key at {}", path.display());
    Ok(key)
}

/// SHA-256 fingerprint of the public half, as clients display it.
pub fn fingerprint(key: &KeyPair) -> Result<String> {
    Ok(key.clone_public_key()?.fingerprint())
}
