//! Core error taxonomy
//!
//! Programmer errors (`DuplicateMod`, `UnknownMod`, `InvariantViolation`)
//! surface immediately and are never retried. Filesystem-level failures feed
//! the link strategy fallback or abort the enclosing transaction.

use std::path::PathBuf;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An active mod with the same archive path and version already exists.
    #[error("mod already active: {archive} ({version})")]
    DuplicateMod { archive: String, version: String },

    /// The referenced mod key is not in the ledger.
    #[error("unknown mod key: {0}")]
    UnknownMod(String),

    /// An internal ledger invariant would be broken by the operation.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Every link strategy failed for this destination.
    #[error("failed to create link at {path}: {reason}")]
    LinkCreationFailed { path: PathBuf, reason: String },

    /// The materialization could not be removed.
    #[error("failed to remove link at {path}: {reason}")]
    LinkRemovalFailed { path: PathBuf, reason: String },

    /// A staged source file is missing or unreadable.
    #[error("staging area corrupt, missing source: {0}")]
    StagingCorrupt(PathBuf),

    /// Reading or writing the ledger document failed.
    #[error("ledger I/O error: {0}")]
    LedgerIo(String),

    /// Another process holds the ledger lock.
    #[error("ledger is locked by another process")]
    LedgerLocked,

    /// The transaction was aborted; carries the first failure.
    #[error("transaction aborted: {0}")]
    TransactionAborted(Box<Error>),

    /// The operation was cancelled; no changes were made.
    #[error("operation cancelled, no changes made")]
    Cancelled,

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wrap a failure as the cause of a transaction abort. Aborts are never
    /// nested and cancellation is reported as-is so callers can tell
    /// "user backed out" from "something broke".
    pub fn into_abort(self) -> Error {
        match self {
            Error::Cancelled => Error::Cancelled,
            Error::TransactionAborted(_) => self,
            other => Error::TransactionAborted(Box::new(other)),
        }
    }

    /// The root failure, unwrapping an abort wrapper if present.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::TransactionAborted(inner) => inner.root_cause(),
            other => other,
        }
    }
}
