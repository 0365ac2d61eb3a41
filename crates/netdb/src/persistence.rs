//! On-disk RouterInfo persistence.
//!
//! One file per record, raw encoded bytes, under `netDb/rX/` where `X` is
//! the first base64 character of the ident hash. LeaseSets are memory-only.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use garliccraft_core::{CoreError, Hash, Result, RouterInfo};

const NETDB_DIR: &str = "netDb";

pub struct Persistence {
    root: PathBuf,
}

impl Persistence {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            root: data_dir.join(NETDB_DIR),
        }
    }

    fn path_for(&self, hash: &Hash) -> PathBuf {
        let b64 = hash.to_base64();
        let shard = &b64[..1];
        self.root
            .join(format!("r{shard}"))
            .join(format!("routerInfo-{b64}.dat"))
    }

    pub fn store(&self, info: &RouterInfo) -> Result<()> {
        let path = self.path_for(&info.hash());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, info.to_bytes())?;
        Ok(())
    }

    pub fn remove(&self, hash: &Hash) -> Result<()> {
        let path = self.path_for(hash);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Walk `netDb/` and decode every record; undecodable files are deleted
    /// rather than retried forever.
    pub fn load_all(&self) -> Result<Vec<RouterInfo>> {
        let mut out = Vec::new();
        if !self.root.exists() {
            return Ok(out);
        }
        for shard in fs::read_dir(&self.root)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(shard.path())? {
                let entry = entry?;
                match Self::load_one(&entry.path()) {
                    Ok(info) => out.push(info),
                    Err(err) => {
                        debug!(path = %entry.path().display(), %err, "removing bad netdb file");
                        let _ = fs::remove_file(entry.path());
                    }
                }
            }
        }
        Ok(out)
    }

    fn load_one(path: &Path) -> Result<RouterInfo> {
        let data = fs::read(path)?;
        let info = RouterInfo::from_bytes(&data)?;
        info.verify()
            .map_err(|_| CoreError::AuthFailed("persisted router info signature"))?;
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use garliccraft_core::{now_ms, Capabilities, PrivateKeys, RouterAddress};
    use garliccraft_crypto::SigType;

    fn make_info() -> RouterInfo {
        let keys = PrivateKeys::generate(SigType::Ed25519).unwrap();
        let mut info = RouterInfo::new(
            keys.identity().clone(),
            now_ms(),
            vec![RouterAddress::ntcp("127.0.0.1", 1)],
            Capabilities::REACHABLE,
        );
        info.sign(&keys).unwrap();
        info
    }

    #[test]
    fn test_store_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::new(dir.path().to_path_buf());
        let info = make_info();

        persistence.store(&info).unwrap();
        let loaded = persistence.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].hash(), info.hash());

        persistence.remove(&info.hash()).unwrap();
        assert!(persistence.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::new(dir.path().to_path_buf());
        let info = make_info();
        persistence.store(&info).unwrap();

        let b64 = info.hash().to_base64();
        let expected = dir
            .path()
            .join(NETDB_DIR)
            .join(format!("r{}", &b64[..1]))
            .join(format!("routerInfo-{b64}.dat"));
        assert!(expected.exists());
        // raw encoded bytes, no container
        assert_eq!(fs::read(expected).unwrap(), info.to_bytes());
    }

    #[test]
    fn test_corrupt_file_removed_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::new(dir.path().to_path_buf());
        let shard_dir = dir.path().join(NETDB_DIR).join("rA");
        fs::create_dir_all(&shard_dir).unwrap();
        let bad = shard_dir.join("routerInfo-garbage.dat");
        fs::write(&bad, b"not a router info").unwrap();

        assert!(persistence.load_all().unwrap().is_empty());
        assert!(!bad.exists());
    }
}
