//! The snapshot coordinator.
//!
//! A snapshot is an atomic on-disk copy of the whole freezer environment.
//! It always rides on a flush: the child drains the dirty keys first and
//! copies the environment afterwards, so the copy reflects exactly the
//! state it just wrote. If a flush is already running the request is
//! parked as pending and the completion handler launches the follow-up
//! flush+snapshot.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::command::{Reply, Response};
use crate::error::Result;
use crate::store::flush::background_dirty_flush;
use crate::store::SpillStore;

/// The SNAPSHOT admin command.
pub fn snapshot_command(store: &Arc<SpillStore>) -> Reply {
    if store.coord.snapshot_pending.load(Ordering::SeqCst)
        || store.coord.snapshot_in_progress.load(Ordering::SeqCst)
    {
        return Reply::Now(Response::Error(
            "NDS SNAPSHOT already in progress".to_string(),
        ));
    }

    let rx = match store.park_requester() {
        Ok(rx) => rx,
        Err(reply) => return reply,
    };

    if !store.background_op_in_progress() {
        store.coord.snapshot_in_progress.store(true, Ordering::SeqCst);
        if let Err(e) = background_dirty_flush(store) {
            store
                .coord
                .snapshot_in_progress
                .store(false, Ordering::SeqCst);
            tracing::warn!(error = %e, "snapshot failed to start");
            store.unpark_requester();
            return Reply::Now(Response::Error(
                "NDS SNAPSHOT failed to start; consult logs for details".to_string(),
            ));
        }
    } else {
        // A plain flush is already in flight; the completion handler will
        // launch the follow-up flush+snapshot.
        store.coord.snapshot_pending.store(true, Ordering::SeqCst);
    }
    Reply::Deferred(rx)
}

impl SpillStore {
    /// The child-side copy, run after draining: recreates the snapshot
    /// directory and copies every sub-database into it.
    pub(crate) fn write_snapshot(&self) -> Result<()> {
        let dest = self.config.snapshot_dir.clone();
        tracing::info!(dest = %dest.display(), "writing freezer snapshot");

        if dest.exists() {
            std::fs::remove_dir_all(&dest)?;
        }
        std::fs::create_dir_all(&dest)?;
        self.env.copy(&dest)?;

        tracing::info!(dest = %dest.display(), "freezer snapshot complete");
        Ok(())
    }
}
