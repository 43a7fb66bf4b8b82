// Copyright 2025 dirspace developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Error type for the embedded key-value store.

use std::fmt;

/// An error raised by the key-value store.
///
/// Unlike application-level errors, some of these are transient: a
/// [`Conflict`](KvError::Conflict) or [`PastVersion`](KvError::PastVersion)
/// means the transaction lost an optimistic race and re-running it is the
/// expected recovery, which is what [`Database::transact`] does.
///
/// [`Database::transact`]: crate::Database::transact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvError {
    /// The transaction read a key that a concurrent transaction committed a
    /// write to. The operations should be retried on a fresh transaction.
    Conflict,
    /// The transaction's read version fell behind the store's commit log and
    /// its reads can no longer be validated.
    PastVersion,
    /// The transaction's cancellation token fired.
    Cancelled,
    /// The transaction was already committed or cancelled.
    UsedAfterCommit,
}

/// A result type where the error is a [`KvError`].
pub type KvResult<T> = std::result::Result<T, KvError>;

impl KvError {
    /// Indicates the operations in the transaction should be retried on a
    /// fresh transaction because of a transient condition.
    pub fn is_retryable(&self) -> bool {
        matches!(self, KvError::Conflict | KvError::PastVersion)
    }
}

impl fmt::Display for KvError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KvError::Conflict => write!(f, "transaction conflict with a concurrent commit"),
            KvError::PastVersion => write!(f, "transaction read version is too old"),
            KvError::Cancelled => write!(f, "transaction was cancelled"),
            KvError::UsedAfterCommit => write!(f, "transaction was already resolved"),
        }
    }
}

impl std::error::Error for KvError {}
