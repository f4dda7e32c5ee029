//! Content-addressed cubin registry
//!
//! Every loaded cubin is hashed and emitted once to
//! `<output-dir>/cubins/<hex-sha256>.cubin`; post-mortem tools re-read the
//! images from there by name. Two modules with identical bytes share one
//! file and therefore one load-module id, whatever vendor module ids they
//! carry. Hashing, writing and load-module registration are serialized by a
//! single spinlock; cubin loads are rare enough that contention does not
//! matter.

use std::fs;
use std::io::Write;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::concurrent_map::{SpinLock, SplayMap};
use crate::errors::ProfilingError;
use crate::ip::LoadModuleId;
use crate::sink::LoadMap;
use crate::stats::ProfilingStats;

/// SHA-256 digest of a cubin image.
pub type CubinHash = [u8; 32];

/// Registered identity of one vendor module id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CubinEntry {
    pub hash: CubinHash,
    pub lm_id: LoadModuleId,
    pub path: PathBuf,
}

/// Content-addressed store of loaded cubins.
pub struct CubinStore {
    cubin_dir: PathBuf,
    load_map: Arc<dyn LoadMap>,
    stats: Arc<ProfilingStats>,
    entries: SplayMap<u32, CubinEntry>,
    files_lock: SpinLock<()>,
}

impl CubinStore {
    pub fn new(
        output_dir: impl Into<PathBuf>,
        load_map: Arc<dyn LoadMap>,
        stats: Arc<ProfilingStats>,
    ) -> Self {
        CubinStore {
            cubin_dir: output_dir.into().join("cubins"),
            load_map,
            stats,
            entries: SplayMap::new(),
            files_lock: SpinLock::new(()),
        }
    }

    /// Previously registered entry for a vendor module id.
    pub fn lookup(&self, cubin_id: u32) -> Option<CubinEntry> {
        self.entries.get(&cubin_id)
    }

    /// Hash, emit and register a cubin. Re-inserting an already registered
    /// id is a no-op returning the existing entry.
    pub fn insert(&self, cubin_id: u32, cubin: &[u8]) -> Result<CubinEntry, ProfilingError> {
        if let Some(existing) = self.entries.get(&cubin_id) {
            return Ok(existing);
        }

        let _guard = self.files_lock.lock();
        // re-check under the lock; a racing load of the same module wins
        if let Some(existing) = self.entries.get(&cubin_id) {
            return Ok(existing);
        }

        let hash: CubinHash = Sha256::digest(cubin).into();
        let path = self.cubin_dir.join(format!("{}.cubin", hex::encode(hash)));

        self.ensure_cubin_dir()?;
        if self.write_cubin(&path, cubin)? {
            self.stats.add_cubin_written();
        }

        let lm_id = self.load_map.load_module_id(&path);
        let entry = CubinEntry { hash, lm_id, path };
        self.entries.insert(cubin_id, entry.clone());
        tracing::debug!(cubin_id, lm_id, "registered cubin");
        Ok(entry)
    }

    fn ensure_cubin_dir(&self) -> Result<(), ProfilingError> {
        if self.cubin_dir.is_dir() {
            return Ok(());
        }
        // group-writable with SGID so collaborating ranks share the cache
        let result = fs::DirBuilder::new()
            .recursive(true)
            .mode(0o2755)
            .create(&self.cubin_dir);
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Write the image unless a file with the same content hash already
    /// exists. Returns whether this call created the file.
    ///
    /// Exclusive creation makes concurrent processes race safely: exactly
    /// one writer wins, the others see `AlreadyExists`, and an empty or
    /// partial file is never observed under the final name by a loser.
    fn write_cubin(&self, path: &Path, cubin: &[u8]) -> Result<bool, ProfilingError> {
        let mut file = match fs::OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(err) => crate::errors::cubin_open_fatal(path, &err),
        };
        file.write_all(cubin).map_err(|_| ProfilingError::CubinEmit {
            path: path.to_path_buf(),
        })?;
        Ok(true)
    }

    pub fn cubin_count(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::InMemoryLoadMap;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> CubinStore {
        CubinStore::new(
            dir.path(),
            Arc::new(InMemoryLoadMap::new()),
            Arc::new(ProfilingStats::new()),
        )
    }

    #[test]
    fn test_insert_emits_file() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let entry = store.insert(10, b"fake cubin bytes").unwrap();
        assert!(entry.path.exists());
        assert_eq!(fs::read(&entry.path).unwrap(), b"fake cubin bytes");
        assert!(entry
            .path
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .ends_with(".cubin"));
    }

    #[test]
    fn test_identical_content_dedups_to_one_file_and_lm_id() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let bytes = vec![0x42u8; 1024 * 1024];

        let a = store.insert(10, &bytes).unwrap();
        let b = store.insert(11, &bytes).unwrap();

        assert_eq!(a.hash, b.hash);
        assert_eq!(a.path, b.path);
        assert_eq!(a.lm_id, b.lm_id);
        assert_eq!(store.cubin_count(), 2);

        let files: Vec<_> = fs::read_dir(dir.path().join("cubins")).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_duplicate_insert_same_id_is_noop() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let first = store.insert(10, b"content").unwrap();
        let again = store.insert(10, b"content").unwrap();
        assert_eq!(first, again);
        assert_eq!(store.cubin_count(), 1);
    }

    #[test]
    fn test_different_content_gets_different_lm_ids() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let a = store.insert(10, b"kernel a").unwrap();
        let b = store.insert(11, b"kernel b").unwrap();
        assert_ne!(a.hash, b.hash);
        assert_ne!(a.lm_id, b.lm_id);
    }

    #[test]
    fn test_preexisting_file_is_reused() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let bytes = b"already cached";

        let hash: CubinHash = Sha256::digest(bytes).into();
        let cubins = dir.path().join("cubins");
        fs::create_dir_all(&cubins).unwrap();
        let path = cubins.join(format!("{}.cubin", hex::encode(hash)));
        fs::write(&path, bytes).unwrap();
        let stats_before = store.stats.cubins_written();

        let entry = store.insert(10, bytes).unwrap();
        assert_eq!(entry.path, path);
        // EEXIST path: nothing newly written
        assert_eq!(store.stats.cubins_written(), stats_before);
    }

    #[test]
    fn test_lookup_unknown_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(store(&dir).lookup(99).is_none());
    }
}
