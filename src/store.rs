//! Durable, compressed snapshot of the current `Registered` set
//! Append-only from the engine's point of view: each `save` overwrites
//! the file in full.

use crate::codec::register;
use crate::error::StoreError;
use crate::model::RegisteredEntry;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use log::{debug, warn};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

pub struct QuotaStore {
    path: PathBuf,
}

impl QuotaStore {
    pub fn new<P: AsRef<Path>>(path: P) -> QuotaStore {
        QuotaStore {
            path: path.as_ref().to_owned(),
        }
    }

    /// Serializes, deflates with maximum compression, and overwrites the
    /// register file in place. Callers accept the "torn last write" risk as
    /// bounded by the sampler period.
    pub fn save(&self, entries: &[RegisteredEntry]) -> Result<(), StoreError> {
        let wire = register::serialize(entries);

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(wire.as_bytes())?;
        let compressed = encoder.finish()?;

        let mut file = File::create(&self.path)?;
        file.write_all(&compressed)?;

        debug!("-- -- wrote {} bytes to {}", compressed.len(), self.path.display());
        Ok(())
    }

    /// Inflates and parses the register. Any inflate or parse error yields
    /// an empty set rather than surfacing an error — the device is allowed
    /// to re-learn state from the server.
    pub fn load(&self) -> Vec<RegisteredEntry> {
        match self.try_load() {
            Ok(entries) => entries,
            Err(e) => {
                warn!("## ## failed to load register, starting empty: {}", e);
                Vec::new()
            }
        }
    }

    fn try_load(&self) -> Result<Vec<RegisteredEntry>, StoreError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let mut compressed = Vec::new();
        File::open(&self.path)?.read_to_end(&mut compressed)?;

        let mut decoder = ZlibDecoder::new(&compressed[..]);
        let mut wire = String::new();
        decoder
            .read_to_string(&mut wire)
            .map_err(|e| StoreError::Inflate(e.to_string()))?;

        Ok(register::parse(&wire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = QuotaStore::new(dir.path().join("qtareg"));

        let entries = vec![
            RegisteredEntry {
                package: "com.example.a".into(),
                uid: 10050,
                gid: 10050,
                quota_kib: 1,
                remaining_kib: None,
                anchor: false,
            },
            RegisteredEntry {
                package: "com.example.b".into(),
                uid: 10051,
                gid: 10051,
                quota_kib: 0,
                remaining_kib: None,
                anchor: false,
            },
        ];

        store.save(&entries).unwrap();
        assert_eq!(store.load(), entries);
    }

    #[test]
    fn missing_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = QuotaStore::new(dir.path().join("does-not-exist"));
        assert_eq!(store.load(), Vec::new());
    }

    #[test]
    fn corrupted_file_loads_as_empty_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qtareg");
        std::fs::write(&path, b"not zlib data at all").unwrap();

        let store = QuotaStore::new(path);
        assert_eq!(store.load(), Vec::new());
    }
}
