use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Icebox errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The freezer environment could not be created, sized, or opened.
    EnvInit(String),
    /// A transaction could not be started against the environment.
    TxnBegin(String),
    /// A sub-database handle could not be opened or created.
    DbiOpen(String),
    /// The write transaction overflowed its capacity. Recoverable in place
    /// by committing and reopening; surfaced only if that also fails.
    TxnFull,
    /// A stored value failed integrity verification.
    Corrupt(String),
    /// The background flush child could not be spawned.
    ChildSpawnFailed(String),
    /// The background flush child exited nonzero or died abnormally.
    ChildDied(String),
    /// A background operation is already in flight, or the requester slot
    /// is occupied.
    Busy(String),
    /// Wrong number of arguments for an admin subcommand.
    BadArity(String),
    /// Unknown admin subcommand.
    BadSubcommand(String),
    /// Invalid data, typically decoding errors or unexpected internal values.
    InvalidData(String),
    /// An IO error.
    IO(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::EnvInit(msg) => write!(f, "freezer environment init failed: {msg}"),
            Error::TxnBegin(msg) => write!(f, "transaction begin failed: {msg}"),
            Error::DbiOpen(msg) => write!(f, "sub-database open failed: {msg}"),
            Error::TxnFull => write!(f, "transaction full"),
            Error::Corrupt(msg) => write!(f, "corrupt freezer value: {msg}"),
            Error::ChildSpawnFailed(msg) => write!(f, "background child spawn failed: {msg}"),
            Error::ChildDied(msg) => write!(f, "background child died: {msg}"),
            Error::Busy(msg) => write!(f, "{msg}"),
            Error::BadArity(sub) => write!(f, "Wrong number of arguments for NDS {sub}"),
            Error::BadSubcommand(_) => write!(
                f,
                "NDS subcommand must be one of: SNAPSHOT FLUSH CLEARSTATS PRELOAD"
            ),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// An icebox Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::ChildDied(err.to_string())
    }
}
