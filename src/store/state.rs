use std::sync::atomic::AtomicBool;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::command::Response;

/// Coordination state for background work. At most one child runs at a
/// time; at most one client waits on it.
#[derive(Debug, Default)]
pub struct CoordState {
    /// The in-flight background flush child, if any.
    pub(crate) child: Mutex<Option<FlushChild>>,

    /// The single parked client waiting on a background operation.
    pub(crate) requester: Mutex<Option<oneshot::Sender<Response>>>,

    /// A snapshot was requested while a flush was already running; the
    /// completion handler starts the follow-up flush+snapshot.
    pub(crate) snapshot_pending: AtomicBool,

    /// The current (or next) child must copy the environment after draining.
    pub(crate) snapshot_in_progress: AtomicBool,

    pub(crate) preload_in_progress: AtomicBool,
    pub(crate) preload_complete: AtomicBool,
}

/// Handle on the spawned flush child. The task resolves to its exit code:
/// 0 success, 1 failure. A join error is the died-by-signal analog.
#[derive(Debug)]
pub(crate) struct FlushChild {
    pub(crate) handle: JoinHandle<i32>,
}

/// The frozen view of one logical database's rotated keys, captured at
/// rotation time: each entry is the dump-payload of the live value, or a
/// tombstone if the key was deleted after it got dirtied.
#[derive(Debug)]
pub(crate) struct FlushBatch {
    pub(crate) db_id: u32,
    pub(crate) entries: Vec<(Vec<u8>, Option<Vec<u8>>)>,
}
