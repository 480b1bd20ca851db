//! The background flush coordinator.
//!
//! A flush drains the dirty keys into the freezer without blocking the
//! foreground. The atomic section is the rotation: every database's dirty
//! set becomes its flushing set, an empty dirty set takes new mutations,
//! and the rotated keys' payloads are copied out as the child's frozen
//! view. The spawned child writes that view to the freezer and exits 0 or
//! 1; a periodic reaper collects the exit status and runs the completion
//! handler. On failure the flushing keys merge back into dirty — we cannot
//! know how far the child got, and a redundant write is cheaper than a
//! lost one.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::command::{Reply, Response};
use crate::error::{Error, Result};
use crate::payload;
use crate::store::state::{FlushBatch, FlushChild};
use crate::store::SpillStore;

/// Starts a background flush of all dirty keys.
pub fn background_dirty_flush(store: &Arc<SpillStore>) -> Result<()> {
    let rt = tokio::runtime::Handle::try_current()
        .map_err(|e| Error::ChildSpawnFailed(e.to_string()))?;

    let mut child_slot = store.coord.child.lock()?;
    if child_slot.is_some() {
        return Err(Error::Busy(
            "NDS background operation already in progress".to_string(),
        ));
    }
    for db in &store.dbs {
        if db.dirty.flushing_count() > 0 {
            tracing::error!(
                db = db.id(),
                "flush requested while keys are still flushing; \
                 this is not supposed to be able to happen"
            );
            return Err(Error::Busy("keys are already being flushed".to_string()));
        }
    }

    store.stats.snapshot_dirty_before_bgsave();

    // The child must not share open file state with the foreground; both
    // sides reopen lazily.
    store.env.close_env();

    let batches = match capture_batches(store) {
        Ok(batches) => batches,
        Err(e) => {
            for db in &store.dbs {
                db.dirty.merge_flushing_back();
            }
            return Err(e);
        }
    };

    let snapshot = store.coord.snapshot_in_progress.load(Ordering::SeqCst);
    let child_store = store.clone();
    let handle = rt.spawn(async move {
        tracing::debug!("flush child started");
        match child_store.flush_dirty_keys(batches, snapshot) {
            Ok(()) => 0,
            Err(e) => {
                tracing::warn!(error = %e, "flush child failed");
                1
            }
        }
    });

    tracing::debug!("dirty key flush started in background");
    *child_slot = Some(FlushChild { handle });
    Ok(())
}

/// Rotates every database and copies out the frozen view: the rotation plus
/// this capture is the moment the child's input is fixed. Keys present in
/// the live map are encoded to dump-payloads; keys deleted after they got
/// dirtied become tombstones.
fn capture_batches(store: &SpillStore) -> Result<Vec<FlushBatch>> {
    let mut batches = Vec::with_capacity(store.dbs.len());
    for db in &store.dbs {
        db.dirty.rotate()?;
        let keys = db.dirty.take_flushing_snapshot();
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            let entry = match db.get(&key) {
                Some(value) => (key, Some(payload::encode(&value)?)),
                None => (key, None),
            };
            entries.push(entry);
        }
        batches.push(FlushBatch {
            db_id: db.id(),
            entries,
        });
    }
    Ok(batches)
}

/// Non-blocking reap of a finished child; invoked periodically from the
/// scheduler. A join error (task panic) is treated as death by signal.
pub async fn check_child_complete(store: &Arc<SpillStore>) -> Result<()> {
    let child = {
        let mut slot = store.coord.child.lock()?;
        let finished = slot
            .as_ref()
            .map(|child| child.handle.is_finished())
            .unwrap_or(false);
        if !finished {
            return Ok(());
        }
        slot.take()
    };
    let Some(child) = child else {
        return Ok(());
    };
    match child.handle.await {
        Ok(exitcode) => on_child_exit(store, exitcode, false),
        Err(e) => {
            let died = Error::from(e);
            tracing::warn!(error = %died, "flush child did not exit cleanly");
            on_child_exit(store, 1, true)
        }
    }
}

/// The completion handler. Success settles the flushing sets and the dirty
/// counter; failure merges everything back into dirty so the next flush
/// retries it. Either way a deferred snapshot request launches the
/// follow-up flush+snapshot, with the requester still parked.
pub(crate) fn on_child_exit(store: &Arc<SpillStore>, exitcode: i32, by_signal: bool) -> Result<()> {
    tracing::info!(exitcode, by_signal, "background flush completed");

    let was_snapshot = store.coord.snapshot_in_progress.swap(false, Ordering::SeqCst);
    let pending = store.coord.snapshot_pending.swap(false, Ordering::SeqCst);

    if exitcode == 0 && !by_signal {
        for db in &store.dbs {
            db.dirty.clear_flushing();
        }
        store.stats.record_flush_success();
        if !pending {
            store.reply_parked(Response::Ok);
        }
    } else {
        store.stats.record_flush_failure();
        // We cannot know how far the child got before it died, so every
        // captured key is treated as still dirty and retried next time.
        for db in &store.dbs {
            db.dirty.merge_flushing_back();
        }
        if !pending {
            let what = if was_snapshot { "SNAPSHOT" } else { "FLUSH" };
            store.reply_parked(Response::Error(format!(
                "NDS {what} failed in child; consult logs for details"
            )));
        }
    }

    if pending {
        store.coord.snapshot_in_progress.store(true, Ordering::SeqCst);
        if let Err(e) = background_dirty_flush(store) {
            store
                .coord
                .snapshot_in_progress
                .store(false, Ordering::SeqCst);
            tracing::warn!(error = %e, "delayed snapshot failed to start");
            store.reply_parked(Response::Error(
                "Delayed NDS SNAPSHOT failed; consult logs for details".to_string(),
            ));
        }
    }

    Ok(())
}

/// The FLUSH admin command: parks the requester and starts a flush if none
/// is running; otherwise the reply rides on the current one.
pub fn flush_command(store: &Arc<SpillStore>) -> Reply {
    let rx = match store.park_requester() {
        Ok(rx) => rx,
        Err(reply) => return reply,
    };

    if !store.background_op_in_progress() {
        if let Err(e) = background_dirty_flush(store) {
            tracing::warn!(error = %e, "background flush failed to start");
            store.unpark_requester();
            return Reply::Now(Response::Error(
                "NDS FLUSH failed to start; consult logs for details".to_string(),
            ));
        }
    }
    Reply::Deferred(rx)
}

impl SpillStore {
    /// True while a background child is in flight.
    pub fn background_op_in_progress(&self) -> bool {
        self.coord
            .child
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    /// The child body: writes every captured entry to the freezer, then
    /// performs the environment copy if this flush carries a snapshot.
    pub(crate) fn flush_dirty_keys(&self, batches: Vec<FlushBatch>, snapshot: bool) -> Result<()> {
        for batch in &batches {
            tracing::debug!(
                db = batch.db_id,
                keys = batch.entries.len(),
                "flushing keys for db"
            );
            if batch.entries.is_empty() {
                continue;
            }

            let mut dbh = self.env.open(batch.db_id, true)?;
            for (key, encoded) in &batch.entries {
                match encoded {
                    Some(encoded) => dbh.put(key.clone(), encoded.clone())?,
                    // Key was deleted after it got dirtied
                    None => {
                        dbh.del(key)?;
                    }
                }
            }
            dbh.close()?;
        }
        tracing::debug!("flush complete");

        if snapshot {
            self.write_snapshot()?;
        }
        Ok(())
    }

    /// Claims the single requester slot. A second waiter is rejected, not
    /// queued, so misuse stays visible.
    pub(crate) fn park_requester(&self) -> std::result::Result<oneshot::Receiver<Response>, Reply> {
        let mut slot = match self.coord.requester.lock() {
            Ok(slot) => slot,
            Err(e) => return Err(Reply::Now(Response::Error(e.to_string()))),
        };
        if slot.is_some() {
            return Err(Reply::Now(Response::Error(
                "NDS background operation already in progress".to_string(),
            )));
        }
        let (tx, rx) = oneshot::channel();
        *slot = Some(tx);
        Ok(rx)
    }

    pub(crate) fn unpark_requester(&self) {
        if let Ok(mut slot) = self.coord.requester.lock() {
            slot.take();
        }
    }

    pub(crate) fn reply_parked(&self, response: Response) {
        if let Ok(mut slot) = self.coord.requester.lock() {
            if let Some(tx) = slot.take() {
                let _ = tx.send(response);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FreezerConfig;
    use crate::tmpfs::TempDir;
    use std::time::Duration;

    fn open_store(dir: &TempDir) -> Arc<SpillStore> {
        SpillStore::open(FreezerConfig::new(dir.path()).db_count(2)).expect("open store")
    }

    /// Reaps until no child is left (including a deferred follow-up).
    async fn drain_children(store: &Arc<SpillStore>) {
        for _ in 0..1000 {
            check_child_complete(store).await.expect("reap");
            let idle = !store.background_op_in_progress()
                && !store.coord.snapshot_pending.load(Ordering::SeqCst);
            if idle {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("background child never finished");
    }

    #[tokio::test]
    async fn test_flush_persists_and_clears_dirty() {
        let dir = TempDir::new().expect("tempdir");
        let store = open_store(&dir);

        store.set(0, b"a", b"1".to_vec()).unwrap();
        store.set(0, b"b", b"2".to_vec()).unwrap();
        assert_eq!(store.dirty_key_count(), 2);

        let reply = flush_command(&store);
        let rx = match reply {
            Reply::Deferred(rx) => rx,
            other => panic!("expected deferred reply, got {other:?}"),
        };

        drain_children(&store).await;
        assert_eq!(rx.await.unwrap(), Response::Ok);

        assert_eq!(store.dirty_key_count(), 0);
        assert_eq!(store.flushing_key_count(), 0);
        assert_eq!(store.stats().flush_successes(), 1);
        assert!(store.stats().lastsave() > 0);

        // The freezer now agrees with memory for both keys
        let db = store.db(0).unwrap();
        assert_eq!(store.get_nds(db, b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get_nds(db, b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn test_flush_writes_tombstone_for_deleted_key() {
        let dir = TempDir::new().expect("tempdir");
        let store = open_store(&dir);

        // Seed the freezer, then delete while the key is only on disk
        store.set_nds(0, b"gone", b"old").unwrap();
        store.del(0, b"gone").unwrap();

        background_dirty_flush(&store).unwrap();
        drain_children(&store).await;

        // Not shadowed anymore, and really deleted from disk
        assert_eq!(store.flushing_key_count(), 0);
        let db = store.db(0).unwrap();
        assert_eq!(store.get_nds(db, b"gone").unwrap(), None);
    }

    #[tokio::test]
    async fn test_writes_during_flush_land_in_new_dirty_set() {
        let dir = TempDir::new().expect("tempdir");
        let store = open_store(&dir);

        store.set(0, b"a", b"1".to_vec()).unwrap();
        background_dirty_flush(&store).unwrap();

        // Rotation has happened by the time the call returns; this write
        // must land in the fresh dirty set and survive the flush untouched.
        store.set(0, b"b", b"2".to_vec()).unwrap();
        assert_eq!(store.db(0).unwrap().dirty.dirty_count(), 1);

        drain_children(&store).await;

        let db = store.db(0).unwrap();
        assert_eq!(db.dirty.dirty_count(), 1);
        assert_eq!(db.dirty.flushing_count(), 0);
        assert_eq!(store.get_nds(db, b"a").unwrap(), Some(b"1".to_vec()));
        // b is still dirty, so it is shadowed and not yet on disk
        assert!(db.dirty.is_shadowed(b"b"));

        // The next flush drains it
        background_dirty_flush(&store).unwrap();
        drain_children(&store).await;
        assert_eq!(db.dirty.dirty_count(), 0);
        assert_eq!(store.get_nds(db, b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn test_child_failure_restores_dirty_keys() {
        // Point the environment at a path that cannot be a directory so the
        // child's lazy reopen fails and it exits nonzero.
        let dir = TempDir::new().expect("tempdir");
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let store =
            SpillStore::open(FreezerConfig::new(blocker.join("env")).db_count(2)).unwrap();

        store.set(0, b"a", b"1".to_vec()).unwrap();
        store.set(1, b"b", b"2".to_vec()).unwrap();

        let rx = match flush_command(&store) {
            Reply::Deferred(rx) => rx,
            other => panic!("expected deferred reply, got {other:?}"),
        };
        drain_children(&store).await;

        match rx.await.unwrap() {
            Response::Error(msg) => {
                assert_eq!(msg, "NDS FLUSH failed in child; consult logs for details");
            }
            other => panic!("expected error reply, got {other:?}"),
        }

        // Everything the child captured is dirty again
        assert_eq!(store.flushing_key_count(), 0);
        assert_eq!(store.dirty_key_count(), 2);
        assert!(store.db(0).unwrap().dirty.is_shadowed(b"a"));
        assert!(store.db(1).unwrap().dirty.is_shadowed(b"b"));
        assert_eq!(store.stats().flush_failures(), 1);
    }

    #[tokio::test]
    async fn test_second_flush_while_parked_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let store = open_store(&dir);

        store.set(0, b"a", b"1".to_vec()).unwrap();
        let rx = match flush_command(&store) {
            Reply::Deferred(rx) => rx,
            other => panic!("expected deferred reply, got {other:?}"),
        };

        match flush_command(&store) {
            Reply::Now(Response::Error(msg)) => {
                assert_eq!(msg, "NDS background operation already in progress");
            }
            other => panic!("expected busy rejection, got {other:?}"),
        }

        drain_children(&store).await;
        assert_eq!(rx.await.unwrap(), Response::Ok);
    }

    #[tokio::test]
    async fn test_flush_with_nonempty_flushing_set_is_loud() {
        let dir = TempDir::new().expect("tempdir");
        let store = open_store(&dir);

        store.set(0, b"a", b"1".to_vec()).unwrap();
        store.db(0).unwrap().dirty.rotate().unwrap();

        assert!(matches!(
            background_dirty_flush(&store),
            Err(Error::Busy(_))
        ));
    }

    #[tokio::test]
    async fn test_completion_handler_failure_path() {
        let dir = TempDir::new().expect("tempdir");
        let store = open_store(&dir);

        store.set(0, b"a", b"1".to_vec()).unwrap();
        store.db(0).unwrap().dirty.rotate().unwrap();
        store.set(0, b"b", b"2".to_vec()).unwrap();

        on_child_exit(&store, 1, false).unwrap();

        let db = store.db(0).unwrap();
        assert_eq!(db.dirty.flushing_count(), 0);
        assert_eq!(db.dirty.dirty_count(), 2);
        assert_eq!(store.stats().flush_failures(), 1);
    }

    #[tokio::test]
    async fn test_completion_handler_signal_death_is_failure() {
        let dir = TempDir::new().expect("tempdir");
        let store = open_store(&dir);

        store.set(0, b"a", b"1".to_vec()).unwrap();
        store.db(0).unwrap().dirty.rotate().unwrap();

        on_child_exit(&store, 0, true).unwrap();
        assert_eq!(store.stats().flush_failures(), 1);
        assert_eq!(store.db(0).unwrap().dirty.dirty_count(), 1);
    }

    #[tokio::test]
    async fn test_mutation_during_flush_survives_counter_settlement() {
        let dir = TempDir::new().expect("tempdir");
        let store = open_store(&dir);

        store.set(0, b"a", b"1".to_vec()).unwrap();
        background_dirty_flush(&store).unwrap();
        store.set(0, b"b", b"2".to_vec()).unwrap();
        drain_children(&store).await;

        // One mutation happened after the snapshot of the counter
        assert_eq!(store.stats().dirty(), 1);
    }
}
