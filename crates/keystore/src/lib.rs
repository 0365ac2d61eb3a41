//! GarlicCraft Keystore
//!
//! Local identity persistence: the `router.keys` private-key file and the
//! `router.info` copy of the advertised RouterInfo.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

use garliccraft_core::{PrivateKeys, RouterInfo};
use garliccraft_crypto::SigType;

pub const KEYS_FILE: &str = "router.keys";
pub const INFO_FILE: &str = "router.info";

#[derive(Error, Debug)]
pub enum KeystoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Key file corrupt: {0}")]
    Corrupt(garliccraft_core::CoreError),
}

pub type Result<T> = std::result::Result<T, KeystoreError>;

/// Load `router.keys` from `dir`, or generate a fresh identity and persist
/// it. New identities default to Ed25519.
pub fn load_or_generate_keys(dir: &Path) -> Result<PrivateKeys> {
    let path = dir.join(KEYS_FILE);
    if path.exists() {
        let data = fs::read(&path)?;
        let keys = PrivateKeys::from_keys_bytes(&data).map_err(KeystoreError::Corrupt)?;
        info!(hash = ?keys.hash(), "loaded router identity");
        return Ok(keys);
    }
    let keys = PrivateKeys::generate(SigType::Ed25519)
        .expect("ed25519 generation is infallible");
    fs::create_dir_all(dir)?;
    fs::write(&path, keys.to_keys_bytes())?;
    info!(hash = ?keys.hash(), "generated new router identity");
    Ok(keys)
}

/// Persist the advertised RouterInfo alongside the keys.
pub fn save_router_info(dir: &Path, info: &RouterInfo) -> Result<()> {
    fs::create_dir_all(dir)?;
    fs::write(dir.join(INFO_FILE), info.to_bytes())?;
    Ok(())
}

pub fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".garliccraft")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_then_reload() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_generate_keys(dir.path()).unwrap();
        assert!(dir.path().join(KEYS_FILE).exists());

        let second = load_or_generate_keys(dir.path()).unwrap();
        assert_eq!(first.hash(), second.hash());
    }

    #[test]
    fn test_corrupt_keys_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(KEYS_FILE), b"garbage").unwrap();
        assert!(matches!(
            load_or_generate_keys(dir.path()),
            Err(KeystoreError::Corrupt(_))
        ));
    }

    #[test]
    fn test_save_router_info() {
        let dir = tempfile::tempdir().unwrap();
        let keys = load_or_generate_keys(dir.path()).unwrap();
        let mut info = RouterInfo::new(
            keys.identity().clone(),
            garliccraft_core::now_ms(),
            vec![],
            garliccraft_core::Capabilities::REACHABLE,
        );
        info.sign(&keys).unwrap();
        save_router_info(dir.path(), &info).unwrap();

        let loaded = RouterInfo::from_bytes(&fs::read(dir.path().join(INFO_FILE)).unwrap()).unwrap();
        assert!(loaded.verify().is_ok());
        assert_eq!(loaded.hash(), keys.hash());
    }
}
