// Copyright 2025 dirspace developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The embedded ordered key-value store.
//!
//! A [`Database`] is a lexicographically ordered mapping from binary keys to
//! binary values, mutated exclusively through optimistic [`Transaction`]s.
//! Reads are recorded in the transaction's read set; at commit time the read
//! set is validated against every commit that happened since the transaction
//! started, and any overlap fails the commit with a retryable
//! [`KvError::Conflict`](crate::KvError::Conflict). Writes buffer inside the
//! transaction (read-your-writes) and become visible atomically at commit.
//!
//! This is the substrate the directory layer runs on; the directory code
//! only ever touches the surface exposed here.

mod database;
mod transaction;

pub use database::{Database, TransactError, TransactOption};
pub use transaction::{
    CancellationToken, ConflictRangeType, KeyValue, KeyValues, RangeOption, Transaction,
    TransactionOption,
};
