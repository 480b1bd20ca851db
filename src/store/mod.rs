//! The spillover store.
//!
//! Binds the in-memory tier to the freezer. Foreground mutations land in
//! the live map and mark their key dirty; the freezer only catches up when
//! a background flush drains the dirty set. Foreground reads serve the live
//! map first and fall through to the freezer only for keys that are not
//! shadowed by the dirty or flushing sets — a shadowed key's freezer copy
//! is stale by definition, so a shadowed miss means the key does not exist.
//!
//! # Tiering
//!
//! ```text
//!   set/del ──► live map ──► dirty set ──► (rotate) ──► flushing set
//!                  │                                         │
//!   get ◄──────────┤                                  background child
//!                  │ miss, not shadowed                      │
//!                  ▼                                         ▼
//!              freezer  ◄────────── put/del payloads ────────┘
//! ```

pub mod flush;
pub mod snapshot;
pub mod state;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::config::FreezerConfig;
use crate::db::Ldb;
use crate::error::{Error, Result};
use crate::format;
use crate::freezer::{Dbh, FreezerEnv, Walk};
use crate::metrics::{Metrics, Stats};
use crate::payload;
use crate::store::state::CoordState;

pub struct SpillStore {
    pub(crate) config: FreezerConfig,
    pub(crate) env: FreezerEnv,
    pub(crate) dbs: Vec<Arc<Ldb>>,
    pub(crate) stats: Stats,
    pub(crate) coord: CoordState,
}

impl SpillStore {
    /// Opens the store: the logical databases exist immediately, the
    /// freezer environment initializes lazily on first use.
    pub fn open(config: FreezerConfig) -> Result<Arc<Self>> {
        let env = FreezerEnv::new(&config);
        let dbs = (0..config.db_count).map(|id| Arc::new(Ldb::new(id))).collect();
        Ok(Arc::new(Self {
            config,
            env,
            dbs,
            stats: Stats::new(),
            coord: CoordState::default(),
        }))
    }

    pub fn db(&self, db_id: u32) -> Result<&Arc<Ldb>> {
        self.dbs
            .get(db_id as usize)
            .ok_or_else(|| Error::InvalidData(format!("no logical database {db_id}")))
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    // Foreground operations. Writes never touch the freezer directly; they
    // mark the key dirty and let the flush coordinator catch up.

    /// Inserts or updates a key.
    pub fn set(&self, db_id: u32, key: &[u8], value: Vec<u8>) -> Result<()> {
        let db = self.db(db_id)?;
        db.insert(key.to_vec(), value);
        db.dirty.touch(key);
        self.stats.record_mutation();
        Ok(())
    }

    /// Deletes a key. Returns whether it existed in either tier. The key is
    /// marked dirty regardless so a freezer-only copy is shadowed too.
    pub fn del(&self, db_id: u32, key: &[u8]) -> Result<bool> {
        let db = self.db(db_id)?;
        let shadowed = db.dirty.is_shadowed(key);
        let in_live = db.remove(key);
        db.dirty.touch(key);
        self.stats.record_mutation();

        if in_live {
            return Ok(true);
        }
        if shadowed {
            // Already memory-authoritative and absent from memory
            return Ok(false);
        }
        // Only the freezer can still know it
        Ok(self.exists_nds(db, key).unwrap_or(false))
    }

    /// Reads a key: live map first, then the freezer for unshadowed keys.
    /// A value pulled off disk is promoted into the live map (clean, not
    /// dirty). Freezer trouble degrades to a miss.
    pub fn get(&self, db_id: u32, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let db = self.db(db_id)?.clone();
        if let Some(value) = db.get(key) {
            self.stats.record_cache_hit();
            return Ok(Some(value));
        }

        self.stats.record_cache_miss();
        match self.get_nds(&db, key) {
            Ok(Some(value)) => {
                db.insert(key.to_vec(), value.clone());
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                tracing::warn!(db = db.id(), key = %format::key(key), error = %e,
                    "freezer read failed; treating as miss");
                Ok(None)
            }
        }
    }

    /// True iff the key exists in either tier.
    pub fn exists(&self, db_id: u32, key: &[u8]) -> Result<bool> {
        let db = self.db(db_id)?.clone();
        if db.contains(key) {
            self.stats.record_cache_hit();
            return Ok(true);
        }
        self.stats.record_cache_miss();
        match self.exists_nds(&db, key) {
            Ok(found) => Ok(found),
            Err(e) => {
                tracing::warn!(db = db.id(), key = %format::key(key), error = %e,
                    "freezer existence check failed; treating as miss");
                Ok(false)
            }
        }
    }

    // Freezer-side glue.

    /// The freezer miss path: fetches and decodes a stored value. Shadowed
    /// keys never reach the freezer — if a dirty key is not in memory it is
    /// logically deleted, and the disk copy is out of date.
    pub fn get_nds(&self, db: &Ldb, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let dbh = self.env.open(db.id(), false)?;
        tracing::debug!(db = db.id(), key = %format::key(key), "looking up key in freezer");

        if db.dirty.is_shadowed(key) {
            dbh.close()?;
            return Ok(None);
        }

        let stored = dbh.get(key)?;
        dbh.close()?;

        let Some(stored) = stored else {
            return Ok(None);
        };

        if !payload::verify(&stored) {
            tracing::warn!(db = db.id(), key = %format::key(key),
                "invalid payload for key; ignoring");
            return Ok(None);
        }
        match payload::decode::<Vec<u8>>(&stored) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!(db = db.id(), key = %format::key(key), error = %e,
                    "bad data format for key; ignoring");
                Ok(None)
            }
        }
    }

    /// Existence check against the freezer, with the same shadow
    /// short-circuit as [`get_nds`].
    pub fn exists_nds(&self, db: &Ldb, key: &[u8]) -> Result<bool> {
        let dbh = self.env.open(db.id(), false)?;
        if db.dirty.is_shadowed(key) {
            dbh.close()?;
            return Ok(false);
        }
        let found = dbh.exists(key)?;
        dbh.close()?;
        Ok(found)
    }

    /// Writes one value straight through to the freezer in dump-payload
    /// encoding. The flush child uses this path; foreground writes do not.
    pub fn set_nds(&self, db_id: u32, key: &[u8], value: &[u8]) -> Result<()> {
        tracing::debug!(db = db_id, key = %format::key(key), "writing key to freezer");
        let encoded = payload::encode(&value)?;
        let mut dbh = self.env.open(db_id, true)?;
        dbh.put(key.to_vec(), encoded)?;
        dbh.close()
    }

    /// Deletes one key straight from the freezer. Returns whether a key was
    /// deleted.
    pub fn del_nds(&self, db_id: u32, key: &[u8]) -> Result<bool> {
        tracing::debug!(db = db_id, key = %format::key(key), "deleting key from freezer");
        let mut dbh = self.env.open(db_id, true)?;
        let deleted = dbh.del(key)?;
        dbh.close()?;
        Ok(deleted)
    }

    /// Drops every entry in every sub-database.
    pub fn nuke_all(&self) -> Result<()> {
        for db in &self.dbs {
            let mut dbh = self.env.open(db.id(), true)?;
            dbh.drop_all()?;
            dbh.close()?;
        }
        Ok(())
    }

    /// Reads every freezer key into the live map. Idempotent: only the
    /// first call performs work. The cursor walk yields to `service` every
    /// `preload_interrupt_every` keys so the caller can run its event loop.
    pub fn preload(&self, service: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        if self.coord.preload_in_progress.load(Ordering::SeqCst)
            || self.coord.preload_complete.load(Ordering::SeqCst)
        {
            return Ok(());
        }
        tracing::info!("preloading all keys from the freezer");
        self.coord.preload_in_progress.store(true, Ordering::SeqCst);

        let result = self.preload_all(service);

        self.coord.preload_in_progress.store(false, Ordering::SeqCst);
        if result.is_ok() {
            tracing::info!("freezer preload complete");
            self.coord.preload_complete.store(true, Ordering::SeqCst);
        }
        result
    }

    fn preload_all(&self, service: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        for db in &self.dbs {
            let dbh = self.env.open(db.id(), false)?;
            let walk_result = dbh.cursor_walk(
                |key| {
                    if !db.contains(key) {
                        if let Some(value) = self.thaw(&dbh, db.id(), key) {
                            db.insert(key.to_vec(), value);
                        }
                    }
                    Ok(Walk::Continue)
                },
                self.config.preload_interrupt_every,
                service,
            );
            dbh.close()?;
            walk_result?;
        }
        Ok(())
    }

    /// Fetches and decodes one stored value through an already-open handle.
    fn thaw(&self, dbh: &Dbh, db_id: u32, key: &[u8]) -> Option<Vec<u8>> {
        let stored = match dbh.get(key) {
            Ok(stored) => stored?,
            Err(e) => {
                tracing::warn!(db = db_id, key = %format::key(key), error = %e,
                    "freezer read failed during preload; skipping");
                return None;
            }
        };
        if !payload::verify(&stored) {
            tracing::warn!(db = db_id, key = %format::key(key),
                "invalid payload for key; ignoring");
            return None;
        }
        match payload::decode::<Vec<u8>>(&stored) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(db = db_id, key = %format::key(key), error = %e,
                    "bad data format for key; ignoring");
                None
            }
        }
    }

    /// Total dirty keys across all logical databases.
    pub fn dirty_key_count(&self) -> usize {
        self.dbs.iter().map(|db| db.dirty.dirty_count()).sum()
    }

    /// Total flushing keys across all logical databases.
    pub fn flushing_key_count(&self) -> usize {
        self.dbs.iter().map(|db| db.dirty.flushing_count()).sum()
    }

    /// Assembles a point-in-time metrics snapshot.
    pub fn metrics(&self) -> Metrics {
        Metrics {
            flush_successes: self.stats.flush_successes(),
            flush_failures: self.stats.flush_failures(),
            cache_hits: self.stats.cache_hits(),
            cache_misses: self.stats.cache_misses(),
            lastsave: self.stats.lastsave(),
            dirty_keys: self.dirty_key_count(),
            flushing_keys: self.flushing_key_count(),
            preload_in_progress: self.coord.preload_in_progress.load(Ordering::SeqCst),
            preload_complete: self.coord.preload_complete.load(Ordering::SeqCst),
        }
    }
}
