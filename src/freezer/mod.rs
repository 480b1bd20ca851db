//! The freezer: an embedded, on-disk key/value environment backing the
//! in-memory tier.
//!
//! One environment per process, one named sub-database per logical database.
//! All access goes through short-lived handles ([`Dbh`]) pairing a
//! transaction with a sub-database; writers serialize on the environment's
//! single write slot. The environment can be closed and reopened around a
//! background flush so the child never shares live file state with the
//! foreground.

pub mod env;
pub mod handle;
pub mod subdb;

pub use env::{subdb_name, FreezerEnv};
pub use handle::{Dbh, Walk};
