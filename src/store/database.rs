// Copyright 2025 dirspace developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The embedded database and its transaction retry loop.

use crate::directory::cache::ResolutionCache;
use crate::error::{KvError, KvResult};
use crate::store::transaction::{apply_add, CancellationToken, Transaction, TrxState, WriteOp};

use futures::future::BoxFuture;
use log::{debug, trace};
use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Number of recent commits retained for conflict validation. A transaction
/// whose read version predates the retained window fails with `PastVersion`
/// and is retried on a fresh read version.
const COMMIT_LOG_LIMIT: usize = 4096;

#[derive(Debug)]
struct CommitRecord {
    version: u64,
    keys: Vec<Vec<u8>>,
    ranges: Vec<(Vec<u8>, Vec<u8>)>,
}

impl CommitRecord {
    fn conflicts_with(&self, state: &TrxState) -> bool {
        for key in &self.keys {
            if state.reads.contains(key) {
                return true;
            }
            if state
                .read_ranges
                .iter()
                .any(|(begin, end)| begin.as_slice() <= key.as_slice() && key.as_slice() < end)
            {
                return true;
            }
        }
        for (begin, end) in &self.ranges {
            if state
                .reads
                .iter()
                .any(|key| begin.as_slice() <= key.as_slice() && key.as_slice() < end.as_slice())
            {
                return true;
            }
            if state
                .read_ranges
                .iter()
                .any(|(rbegin, rend)| rbegin < end && begin < rend)
            {
                return true;
            }
        }
        false
    }
}

#[derive(Debug)]
struct DbState {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    version: u64,
    next_trx: u64,
    log: VecDeque<CommitRecord>,
    log_floor: u64,
}

struct DatabaseInner {
    state: Mutex<DbState>,
    cache: ResolutionCache,
}

/// An embedded, ordered, transactional key-value database.
///
/// Cloning is cheap and shares the underlying store. Modifications are
/// performed via [`Transaction`]s.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let state = self.inner.state.lock().expect("database state poisoned");
        f.debug_struct("Database")
            .field("version", &state.version)
            .field("keys", &state.data.len())
            .finish()
    }
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

impl Database {
    /// Creates an empty database.
    pub fn new() -> Self {
        Database {
            inner: Arc::new(DatabaseInner {
                state: Mutex::new(DbState {
                    data: BTreeMap::new(),
                    version: 0,
                    next_trx: 1,
                    log: VecDeque::new(),
                    log_floor: 0,
                }),
                cache: ResolutionCache::new(),
            }),
        }
    }

    /// Creates a new transaction on the database.
    pub fn create_trx(&self) -> KvResult<Transaction> {
        self.create_trx_with(CancellationToken::new())
    }

    /// Creates a new transaction carrying a cancellation token.
    pub fn create_trx_with(&self, token: CancellationToken) -> KvResult<Transaction> {
        token.check()?;
        let mut state = self.inner.state.lock().expect("database state poisoned");
        let id = state.next_trx;
        state.next_trx += 1;
        Ok(Transaction::new(self.clone(), id, state.version, token))
    }

    /// The current commit version.
    pub fn version(&self) -> u64 {
        let state = self.inner.state.lock().expect("database state poisoned");
        state.version
    }

    pub(crate) fn resolution_cache(&self) -> &ResolutionCache {
        &self.inner.cache
    }

    pub(crate) fn forget_transaction(&self, id: u64) {
        self.inner.cache.forget_transaction(id);
    }

    pub(crate) fn committed_value(&self, key: &[u8]) -> Option<Vec<u8>> {
        let state = self.inner.state.lock().expect("database state poisoned");
        state.data.get(key).cloned()
    }

    pub(crate) fn committed_range(&self, begin: &[u8], end: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let state = self.inner.state.lock().expect("database state poisoned");
        state
            .data
            .range::<[u8], _>((Bound::Included(begin), Bound::Excluded(end)))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    pub(crate) fn commit(&self, read_version: u64, trx: TrxState) -> KvResult<()> {
        if trx.writes.is_empty() && trx.cleared.is_empty() {
            return Ok(());
        }

        let mut state = self.inner.state.lock().expect("database state poisoned");

        if read_version < state.log_floor {
            return Err(KvError::PastVersion);
        }
        for record in state.log.iter().filter(|r| r.version > read_version) {
            if record.conflicts_with(&trx) {
                trace!(
                    "commit conflict: read version {} vs committed version {}",
                    read_version,
                    record.version
                );
                return Err(KvError::Conflict);
            }
        }

        // apply: cleared ranges first, surviving buffered writes after
        for range in &trx.cleared {
            let stale: Vec<Vec<u8>> = state
                .data
                .range::<[u8], _>((
                    Bound::Included(range.begin.as_slice()),
                    Bound::Excluded(range.end.as_slice()),
                ))
                .map(|(key, _)| key.clone())
                .collect();
            for key in stale {
                state.data.remove(&key);
            }
        }
        let mut conflict_keys = Vec::new();
        for (key, write) in &trx.writes {
            if write.conflict {
                conflict_keys.push(key.clone());
            }
            match &write.op {
                WriteOp::Set(value) => {
                    state.data.insert(key.clone(), value.clone());
                }
                WriteOp::Clear => {
                    state.data.remove(key);
                }
                WriteOp::Add(delta) => {
                    let sum = apply_add(state.data.get(key).map(|v| v.as_slice()), *delta);
                    state.data.insert(key.clone(), sum);
                }
            }
        }

        let mut conflict_ranges = trx.write_ranges;
        conflict_ranges.extend(
            trx.cleared
                .iter()
                .filter(|range| range.conflict)
                .map(|range| (range.begin.clone(), range.end.clone())),
        );

        state.version += 1;
        let version = state.version;
        state.log.push_back(CommitRecord {
            version,
            keys: conflict_keys,
            ranges: conflict_ranges,
        });
        while state.log.len() > COMMIT_LOG_LIMIT {
            if let Some(record) = state.log.pop_front() {
                state.log_floor = record.version;
            }
        }
        trace!("committed version {}", version);
        Ok(())
    }

    /// `transact` runs `f` against fresh transactions until the commit is
    /// accepted or a terminal error occurs.
    ///
    /// `f` may run several times; it must be safe to re-execute. Retryable
    /// store errors (conflicts, past versions) re-run the closure; any
    /// application error that does not unwrap to a retryable store error is
    /// returned as-is. The retry budget and a cancellation token come from
    /// `options`.
    ///
    /// # Warning
    ///
    /// Without a `retry_limit` or `time_out` this might loop for as long as
    /// the transaction stays contentious.
    pub async fn transact<T, E, F>(&self, f: F, options: TransactOption) -> Result<T, E>
    where
        E: TransactError,
        F: for<'a> Fn(&'a Transaction) -> BoxFuture<'a, Result<T, E>>,
    {
        let token = options.cancellation.clone().unwrap_or_default();
        let deadline = options.time_out.map(|d| Instant::now() + d);
        let mut tries: u32 = 0;
        let can_retry = |tries: u32| {
            options.retry_limit.map_or(true, |limit| tries < limit)
                && deadline.map_or(true, |d| Instant::now() < d)
        };
        loop {
            if let Err(err) = token.check() {
                return Err(E::from(err));
            }
            tries += 1;
            let trx = match self.create_trx_with(token.clone()) {
                Ok(trx) => trx,
                Err(err) => return Err(E::from(err)),
            };
            match f(&trx).await {
                Ok(item) => match trx.commit().await {
                    Ok(()) => return Ok(item),
                    Err(err) if err.is_retryable() && can_retry(tries) => {
                        debug!("retrying transaction after {}", err);
                        continue;
                    }
                    Err(err) => return Err(E::from(err)),
                },
                Err(user_err) => match user_err.try_into_kv_error() {
                    Ok(err) if err.is_retryable() && can_retry(tries) => {
                        debug!("retrying transaction after {}", err);
                        continue;
                    }
                    Ok(err) => return Err(E::from(err)),
                    Err(user_err) => return Err(user_err),
                },
            }
        }
    }
}

/// A trait that must be implemented to use [`Database::transact`] with
/// application error types.
///
/// Errors that unwrap to a retryable [`KvError`] restart the loop; every
/// other error is terminal.
pub trait TransactError: From<KvError> {
    fn try_into_kv_error(self) -> Result<KvError, Self>;
}

impl TransactError for KvError {
    fn try_into_kv_error(self) -> Result<KvError, Self> {
        Ok(self)
    }
}

/// A set of options that controls the behavior of [`Database::transact`].
#[derive(Default, Clone)]
pub struct TransactOption {
    /// Maximum number of attempts; unlimited when `None`.
    pub retry_limit: Option<u32>,
    /// Wall-clock budget across attempts, checked between attempts.
    pub time_out: Option<Duration>,
    /// Cancellation signal attached to every attempt's transaction.
    pub cancellation: Option<CancellationToken>,
}

impl TransactOption {
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            cancellation: Some(token),
            ..Self::default()
        }
    }
}
