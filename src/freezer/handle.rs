//! Short-lived sub-database handles.
//!
//! A `Dbh` pairs one transaction with one sub-database and lives for a
//! single operation. Writer handles hold the environment's single write
//! slot and buffer their operations; `close` commits the buffer in one
//! batch. A handle dropped without `close` aborts: the buffer is discarded
//! and the write slot released.

use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};
use crate::freezer::env::EnvInner;
use crate::freezer::subdb::{Op, SubDb};

/// Cursor-walk control flow.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Walk {
    Continue,
    Stop,
}

pub struct Dbh {
    env: Arc<EnvInner>,
    db_id: u32,
    subdb: Arc<RwLock<SubDb>>,
    writer: bool,
    pending: Vec<Op>,
    capacity: usize,
    released: bool,
}

impl Dbh {
    pub(crate) fn new(
        env: Arc<EnvInner>,
        db_id: u32,
        subdb: Arc<RwLock<SubDb>>,
        writer: bool,
        capacity: usize,
    ) -> Self {
        Self {
            env,
            db_id,
            subdb,
            writer,
            pending: Vec::new(),
            capacity,
            released: false,
        }
    }

    pub fn db_id(&self) -> u32 {
        self.db_id
    }

    /// Reads a stored payload. A write transaction sees its own buffered
    /// operations; a miss is `Ok(None)`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        for op in self.pending.iter().rev() {
            match op {
                Op::Put(k, v) if k == key => return Ok(Some(v.clone())),
                Op::Del(k) if k == key => return Ok(None),
                _ => {}
            }
        }
        Ok(self.subdb.read()?.get(key).cloned())
    }

    /// True iff the key is stored.
    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Buffers a put. A full transaction is committed in place and the put
    /// retried on the fresh one; the caller never sees `TxnFull`.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.require_writer()?;
        if self.pending.len() >= self.capacity {
            tracing::debug!(
                db = self.db_id,
                error = %Error::TxnFull,
                "committing full write transaction and retrying"
            );
            self.commit_pending()?;
        }
        self.pending.push(Op::Put(key, value));
        Ok(())
    }

    /// Buffers a delete. Returns whether the key was present.
    pub fn del(&mut self, key: &[u8]) -> Result<bool> {
        self.require_writer()?;
        if self.get(key)?.is_none() {
            return Ok(false);
        }
        if self.pending.len() >= self.capacity {
            tracing::debug!(
                db = self.db_id,
                error = %Error::TxnFull,
                "committing full write transaction and retrying"
            );
            self.commit_pending()?;
        }
        self.pending.push(Op::Del(key.to_vec()));
        Ok(true)
    }

    /// Removes every entry in the sub-database.
    pub fn drop_all(&mut self) -> Result<()> {
        self.require_writer()?;
        self.pending.clear();
        self.subdb.write()?.drop_all()
    }

    /// Iterates every stored key in order, handing each to `visit`. After
    /// every `interrupt_every` keys the externally supplied `service`
    /// callback runs so other clients get a look-in.
    pub fn cursor_walk(
        &self,
        mut visit: impl FnMut(&[u8]) -> Result<Walk>,
        interrupt_every: usize,
        service: &mut dyn FnMut() -> Result<()>,
    ) -> Result<()> {
        let keys = self.subdb.read()?.keys();
        let mut counter = 0usize;
        for key in keys {
            match visit(&key)? {
                Walk::Continue => {}
                Walk::Stop => {
                    tracing::debug!(db = self.db_id, "cursor walk stopped at visitor's request");
                    return Ok(());
                }
            }
            counter += 1;
            if interrupt_every > 0 && counter % interrupt_every == 0 {
                service()?;
            }
        }
        Ok(())
    }

    /// Commits (writer) or discards (reader) and releases the handle.
    pub fn close(mut self) -> Result<()> {
        if self.writer {
            self.commit_pending()?;
        }
        self.release();
        Ok(())
    }

    /// Closes an optional handle; a `None` is a no-op.
    pub fn close_opt(dbh: Option<Dbh>) -> Result<()> {
        match dbh {
            Some(dbh) => dbh.close(),
            None => Ok(()),
        }
    }

    fn commit_pending(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let ops = std::mem::take(&mut self.pending);
        self.subdb.write()?.apply(&ops)
    }

    fn require_writer(&self) -> Result<()> {
        if !self.writer {
            return Err(Error::TxnBegin(
                "write attempted on a read transaction".to_string(),
            ));
        }
        Ok(())
    }

    fn release(&mut self) {
        if self.writer && !self.released {
            self.env.writer_active.store(false, Ordering::SeqCst);
        }
        self.released = true;
    }
}

impl Drop for Dbh {
    fn drop(&mut self) {
        // A handle dropped without close() aborts: buffered operations are
        // discarded, the write slot is released.
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FreezerConfig;
    use crate::freezer::env::FreezerEnv;
    use crate::tmpfs::TempDir;

    fn open_env(dir: &TempDir) -> FreezerEnv {
        FreezerEnv::new(&FreezerConfig::new(dir.path()).db_count(4).txn_capacity(2))
    }

    #[test]
    fn test_put_get_del_round_trip() {
        let dir = TempDir::new().expect("tempdir");
        let env = open_env(&dir);

        let mut dbh = env.open(0, true).expect("open writer");
        dbh.put(b"k".to_vec(), b"v".to_vec()).expect("put");
        // Write transaction sees its own buffer
        assert_eq!(dbh.get(b"k").unwrap(), Some(b"v".to_vec()));
        dbh.close().expect("close");

        let dbh = env.open(0, false).expect("open reader");
        assert_eq!(dbh.get(b"k").unwrap(), Some(b"v".to_vec()));
        assert!(dbh.exists(b"k").unwrap());
        assert_eq!(dbh.get(b"missing").unwrap(), None);
        dbh.close().expect("close");

        let mut dbh = env.open(0, true).expect("open writer");
        assert!(dbh.del(b"k").expect("del"));
        assert!(!dbh.del(b"k").expect("del again"));
        dbh.close().expect("close");

        let dbh = env.open(0, false).expect("open reader");
        assert_eq!(dbh.get(b"k").unwrap(), None);
        dbh.close().expect("close");
    }

    #[test]
    fn test_full_transaction_commits_in_place() {
        let dir = TempDir::new().expect("tempdir");
        let env = open_env(&dir); // capacity 2

        let mut dbh = env.open(0, true).expect("open writer");
        for i in 0..10u32 {
            let key = format!("key_{i:03}").into_bytes();
            dbh.put(key, b"v".to_vec()).expect("put");
        }
        dbh.close().expect("close");

        let dbh = env.open(0, false).expect("open reader");
        for i in 0..10u32 {
            let key = format!("key_{i:03}").into_bytes();
            assert!(dbh.exists(&key).unwrap(), "key_{i:03} should be stored");
        }
        dbh.close().expect("close");
    }

    #[test]
    fn test_dropped_writer_aborts() {
        let dir = TempDir::new().expect("tempdir");
        let env = open_env(&dir);

        {
            let mut dbh = env.open(0, true).expect("open writer");
            dbh.put(b"k".to_vec(), b"v".to_vec()).expect("put");
            // dropped without close
        }

        // Buffer was discarded, slot released
        let mut dbh = env.open(0, true).expect("open writer again");
        assert_eq!(dbh.get(b"k").unwrap(), None);
        dbh.put(b"k2".to_vec(), b"v".to_vec()).expect("put");
        dbh.close().expect("close");
    }

    #[test]
    fn test_reader_rejects_writes() {
        let dir = TempDir::new().expect("tempdir");
        let env = open_env(&dir);

        let mut dbh = env.open(0, false).expect("open reader");
        assert!(matches!(
            dbh.put(b"k".to_vec(), b"v".to_vec()),
            Err(Error::TxnBegin(_))
        ));
        dbh.close().expect("close");
    }

    #[test]
    fn test_drop_all() {
        let dir = TempDir::new().expect("tempdir");
        let env = open_env(&dir);

        let mut dbh = env.open(0, true).expect("open writer");
        dbh.put(b"a".to_vec(), b"1".to_vec()).expect("put");
        dbh.put(b"b".to_vec(), b"2".to_vec()).expect("put");
        dbh.close().expect("close");

        let mut dbh = env.open(0, true).expect("open writer");
        dbh.drop_all().expect("drop_all");
        dbh.close().expect("close");

        let dbh = env.open(0, false).expect("open reader");
        assert_eq!(dbh.get(b"a").unwrap(), None);
        assert_eq!(dbh.get(b"b").unwrap(), None);
        dbh.close().expect("close");
    }

    #[test]
    fn test_cursor_walk_interrupts() {
        let dir = TempDir::new().expect("tempdir");
        let env = open_env(&dir);

        let mut dbh = env.open(0, true).expect("open writer");
        for i in 0..10u32 {
            dbh.put(format!("key_{i:03}").into_bytes(), b"v".to_vec())
                .expect("put");
        }
        dbh.close().expect("close");

        let dbh = env.open(0, false).expect("open reader");
        let mut visited = 0usize;
        let mut serviced = 0usize;
        dbh.cursor_walk(
            |_key| {
                visited += 1;
                Ok(Walk::Continue)
            },
            3,
            &mut || {
                serviced += 1;
                Ok(())
            },
        )
        .expect("walk");
        dbh.close().expect("close");

        assert_eq!(visited, 10);
        assert_eq!(serviced, 3);
    }

    #[test]
    fn test_cursor_walk_stops_early() {
        let dir = TempDir::new().expect("tempdir");
        let env = open_env(&dir);

        let mut dbh = env.open(0, true).expect("open writer");
        for i in 0..10u32 {
            dbh.put(format!("key_{i:03}").into_bytes(), b"v".to_vec())
                .expect("put");
        }
        dbh.close().expect("close");

        let dbh = env.open(0, false).expect("open reader");
        let mut visited = 0usize;
        dbh.cursor_walk(
            |_key| {
                visited += 1;
                Ok(if visited == 4 { Walk::Stop } else { Walk::Continue })
            },
            0,
            &mut || Ok(()),
        )
        .expect("walk");
        dbh.close().expect("close");

        assert_eq!(visited, 4);
    }

    #[test]
    fn test_close_opt_on_none() {
        assert!(Dbh::close_opt(None).is_ok());
    }
}
