//! The freezer environment.
//!
//! A process-wide, lazily-opened environment rooted at a configured
//! directory. The directory holds one `freezer_<id>` sub-database per
//! logical database plus a lock file guarding against a second process.
//! The environment is deliberately closable: the flush coordinator closes
//! it before spawning a background child, and both sides reopen lazily
//! through the accessor on their next operation.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::config::FreezerConfig;
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::freezer::handle::Dbh;
use crate::freezer::subdb::SubDb;

const LOCK_FILE: &str = "LOCK";

/// Builds the name of the sub-database backing a logical database.
pub fn subdb_name(db_id: u32) -> String {
    format!("freezer_{db_id}")
}

pub struct FreezerEnv {
    dir: PathBuf,
    map_size: u64,
    max_dbs: u32,
    txn_capacity: usize,
    inner: Mutex<Option<Arc<EnvInner>>>,
}

pub(crate) struct EnvInner {
    pub(crate) dir: PathBuf,
    _lock: FileLock,
    pub(crate) subdbs: Mutex<HashMap<u32, Arc<RwLock<SubDb>>>>,
    pub(crate) writer_active: AtomicBool,
}

impl FreezerEnv {
    pub fn new(config: &FreezerConfig) -> Self {
        Self {
            dir: config.dir.clone(),
            map_size: config.map_size,
            max_dbs: config.db_count,
            txn_capacity: config.txn_capacity,
            inner: Mutex::new(None),
        }
    }

    /// Opens a handle against one sub-database: initializes the environment
    /// if needed, begins a transaction (writers claim the environment's
    /// single write slot), and opens or creates `freezer_<id>`.
    pub fn open(&self, db_id: u32, writer: bool) -> Result<Dbh> {
        if db_id >= self.max_dbs {
            return Err(Error::DbiOpen(format!(
                "db {db_id} out of range (env sized for {} sub-databases)",
                self.max_dbs
            )));
        }

        let inner = self.init()?;

        if writer
            && inner
                .writer_active
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
        {
            return Err(Error::TxnBegin(
                "write transaction already active".to_string(),
            ));
        }

        let subdb = match Self::open_subdb(&inner, db_id) {
            Ok(subdb) => subdb,
            Err(e) => {
                if writer {
                    inner.writer_active.store(false, Ordering::SeqCst);
                }
                return Err(e);
            }
        };

        Ok(Dbh::new(inner, db_id, subdb, writer, self.txn_capacity))
    }

    fn open_subdb(inner: &Arc<EnvInner>, db_id: u32) -> Result<Arc<RwLock<SubDb>>> {
        let mut subdbs = inner.subdbs.lock()?;
        if let Some(subdb) = subdbs.get(&db_id) {
            return Ok(subdb.clone());
        }
        let subdb = Arc::new(RwLock::new(SubDb::open(&inner.dir, &subdb_name(db_id))?));
        subdbs.insert(db_id, subdb.clone());
        Ok(subdb)
    }

    /// Lazily initializes the environment: creates the directory, acquires
    /// the lock file, and logs the sizing. Idempotent.
    fn init(&self) -> Result<Arc<EnvInner>> {
        let mut guard = self.inner.lock()?;
        if let Some(inner) = guard.as_ref() {
            return Ok(inner.clone());
        }

        tracing::debug!(dir = %self.dir.display(), "initialising freezer environment");

        fs::create_dir_all(&self.dir)
            .map_err(|e| Error::EnvInit(format!("{}: {e}", self.dir.display())))?;
        let lock = FileLock::lock(self.dir.join(LOCK_FILE))
            .map_err(|e| Error::EnvInit(format!("lock: {e}")))?;

        tracing::debug!(
            map_size = self.map_size,
            max_dbs = self.max_dbs,
            "freezer environment initialised"
        );

        let inner = Arc::new(EnvInner {
            dir: self.dir.clone(),
            _lock: lock,
            subdbs: Mutex::new(HashMap::new()),
            writer_active: AtomicBool::new(false),
        });
        *guard = Some(inner.clone());
        Ok(inner)
    }

    /// True if the environment is currently open.
    pub fn is_open(&self) -> bool {
        self.inner.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    /// The pre-spawn hook: drops the open environment so the background
    /// child and the next foreground operation both reopen lazily.
    pub fn close_env(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            if guard.take().is_some() {
                tracing::debug!("freezer environment closed");
            }
        }
    }

    /// Writes an atomic copy of the whole environment into `dest`: every
    /// sub-database file lands via a temp file and rename. Refuses while a
    /// write transaction is open.
    pub fn copy(&self, dest: &Path) -> Result<()> {
        let inner = self.init()?;
        if inner.writer_active.load(Ordering::SeqCst) {
            return Err(Error::Busy(
                "cannot copy environment while a write transaction is open".to_string(),
            ));
        }

        fs::create_dir_all(dest)?;

        let cached: HashMap<String, Arc<RwLock<SubDb>>> = {
            let subdbs = inner.subdbs.lock()?;
            let mut cached = HashMap::new();
            for subdb in subdbs.values() {
                let name = subdb.read()?.name().to_string();
                cached.insert(name, subdb.clone());
            }
            cached
        };

        for entry in fs::read_dir(&inner.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with("freezer_") {
                continue;
            }

            if let Some(subdb) = cached.get(name) {
                subdb.read()?.copy_to(dest)?;
            } else {
                // Not opened this session; the file on disk is already a
                // committed image, so a byte copy via temp+rename suffices.
                let tmp = dest.join(format!("{name}.tmp"));
                fs::copy(entry.path(), &tmp)?;
                fs::rename(&tmp, dest.join(name))?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn test_config(dir: &TempDir) -> FreezerConfig {
        FreezerConfig::new(dir.path()).db_count(4)
    }

    #[test]
    fn test_lazy_init_and_reopen() {
        let dir = TempDir::new().expect("tempdir");
        let env = FreezerEnv::new(&test_config(&dir));
        assert!(!env.is_open());

        let dbh = env.open(0, false).expect("open");
        assert!(env.is_open());
        dbh.close().expect("close");

        env.close_env();
        assert!(!env.is_open());

        // Reopens lazily
        let dbh = env.open(0, false).expect("reopen");
        dbh.close().expect("close");
        assert!(env.is_open());
    }

    #[test]
    fn test_db_id_out_of_range() {
        let dir = TempDir::new().expect("tempdir");
        let env = FreezerEnv::new(&test_config(&dir));
        assert!(matches!(env.open(4, false), Err(Error::DbiOpen(_))));
    }

    #[test]
    fn test_single_writer() {
        let dir = TempDir::new().expect("tempdir");
        let env = FreezerEnv::new(&test_config(&dir));

        let writer = env.open(0, true).expect("open writer");
        assert!(matches!(env.open(1, true), Err(Error::TxnBegin(_))));
        // Readers are unaffected
        env.open(1, false).expect("reader").close().unwrap();

        writer.close().expect("close");
        env.open(1, true).expect("writer again").close().unwrap();
    }

    #[test]
    fn test_copy_refuses_open_writer() {
        let dir = TempDir::new().expect("tempdir");
        let snap = TempDir::new().expect("tempdir");
        let env = FreezerEnv::new(&test_config(&dir));

        let writer = env.open(0, true).expect("open writer");
        assert!(matches!(env.copy(snap.path()), Err(Error::Busy(_))));
        writer.close().unwrap();

        env.copy(snap.path()).expect("copy");
    }

    #[test]
    fn test_copy_includes_unopened_subdbs() {
        let dir = TempDir::new().expect("tempdir");
        let snap = TempDir::new().expect("tempdir");

        {
            let env = FreezerEnv::new(&test_config(&dir));
            let mut dbh = env.open(2, true).expect("open");
            dbh.put(b"k".to_vec(), b"v".to_vec()).expect("put");
            dbh.close().expect("close");
        }

        // Fresh environment that never opened sub-database 2
        let env = FreezerEnv::new(&test_config(&dir));
        env.open(0, false).unwrap().close().unwrap();
        env.copy(snap.path()).expect("copy");

        let copied = SubDb::open(snap.path(), "freezer_2").expect("open copy");
        assert_eq!(copied.get(b"k"), Some(&b"v".to_vec()));
    }
}
