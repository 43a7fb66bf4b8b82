// Copyright 2025 dirspace developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Transactions on the embedded store.

use crate::error::{KvError, KvResult};
use crate::store::Database;

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// A cooperative cancellation signal.
///
/// Cloning shares the signal. Every suspension point of a transaction carrying
/// the token checks it and aborts with [`KvError::Cancelled`] once it fired.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    fired: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the signal. Irrevocable.
    pub fn cancel(&self) {
        self.fired.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    pub(crate) fn check(&self) -> KvResult<()> {
        if self.is_cancelled() {
            Err(KvError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Options for a [`Transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOption {
    /// The next write of this transaction will not create a write conflict
    /// range, so concurrent readers of the written key are not forced to
    /// retry. Used by the prefix allocator for candidate reservations.
    NextWriteNoWriteConflictRange,
}

/// Whether a manual conflict range is added to the read or the write set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictRangeType {
    Read,
    Write,
}

/// A `begin..end` key range with result options, used by range reads.
#[derive(Debug, Clone, Default)]
pub struct RangeOption {
    /// Inclusive lower bound.
    pub begin: Vec<u8>,
    /// Exclusive upper bound.
    pub end: Vec<u8>,
    /// Maximum number of key-value pairs to return.
    pub limit: Option<usize>,
    /// Return pairs starting from the end of the range.
    pub reverse: bool,
}

impl From<(Vec<u8>, Vec<u8>)> for RangeOption {
    fn from((begin, end): (Vec<u8>, Vec<u8>)) -> Self {
        Self {
            begin,
            end,
            ..Self::default()
        }
    }
}

impl From<(&[u8], &[u8])> for RangeOption {
    fn from((begin, end): (&[u8], &[u8])) -> Self {
        Self {
            begin: begin.to_vec(),
            end: end.to_vec(),
            ..Self::default()
        }
    }
}

/// A key-value pair returned by a range read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    key: Vec<u8>,
    value: Vec<u8>,
}

impl KeyValue {
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }
}

/// An ordered batch of key-value pairs returned by a range read.
#[derive(Debug, Clone, Default)]
pub struct KeyValues {
    values: Vec<KeyValue>,
    more: bool,
}

impl KeyValues {
    /// True when the range holds further pairs past the requested limit.
    pub fn more(&self) -> bool {
        self.more
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn first(&self) -> Option<&KeyValue> {
        self.values.first()
    }

    pub fn get(&self, index: usize) -> Option<&KeyValue> {
        self.values.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<KeyValue> {
        self.values.iter()
    }
}

impl IntoIterator for KeyValues {
    type Item = KeyValue;
    type IntoIter = std::vec::IntoIter<KeyValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.into_iter()
    }
}

impl<'a> IntoIterator for &'a KeyValues {
    type Item = &'a KeyValue;
    type IntoIter = std::slice::Iter<'a, KeyValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}

#[derive(Debug, Clone)]
pub(crate) enum WriteOp {
    Set(Vec<u8>),
    Clear,
    Add(i64),
}

#[derive(Debug, Clone)]
pub(crate) struct BufferedWrite {
    pub(crate) op: WriteOp,
    pub(crate) conflict: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct ClearedRange {
    pub(crate) begin: Vec<u8>,
    pub(crate) end: Vec<u8>,
    pub(crate) conflict: bool,
}

#[derive(Debug, Default)]
pub(crate) struct TrxState {
    pub(crate) resolved: bool,
    pub(crate) writes: BTreeMap<Vec<u8>, BufferedWrite>,
    pub(crate) cleared: Vec<ClearedRange>,
    pub(crate) reads: BTreeSet<Vec<u8>>,
    pub(crate) read_ranges: Vec<(Vec<u8>, Vec<u8>)>,
    pub(crate) write_ranges: Vec<(Vec<u8>, Vec<u8>)>,
    next_write_no_conflict: bool,
}

impl TrxState {
    fn check_live(&self) -> KvResult<()> {
        if self.resolved {
            Err(KvError::UsedAfterCommit)
        } else {
            Ok(())
        }
    }

    fn in_cleared(&self, key: &[u8]) -> bool {
        self.cleared
            .iter()
            .any(|r| r.begin.as_slice() <= key && key < r.end.as_slice())
    }

    fn take_conflict_flag(&mut self) -> bool {
        !std::mem::replace(&mut self.next_write_no_conflict, false)
    }
}

/// Interprets a value as a little-endian 64-bit integer, padding or
/// truncating to 8 bytes, and adds `delta` with wrapping.
pub(crate) fn apply_add(base: Option<&[u8]>, delta: i64) -> Vec<u8> {
    let mut arr = [0u8; 8];
    if let Some(base) = base {
        let n = base.len().min(8);
        arr[..n].copy_from_slice(&base[..n]);
    }
    let sum = i64::from_le_bytes(arr).wrapping_add(delta);
    sum.to_le_bytes().to_vec()
}

/// A transaction on a [`Database`].
///
/// All reads suspend and may fail; all writes buffer locally and take effect
/// at [`commit`](Transaction::commit). Dropping an uncommitted transaction
/// discards its buffered writes.
pub struct Transaction {
    db: Database,
    id: u64,
    read_version: u64,
    token: CancellationToken,
    pub(crate) state: Mutex<TrxState>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("read_version", &self.read_version)
            .finish()
    }
}

impl Transaction {
    pub(crate) fn new(db: Database, id: u64, read_version: u64, token: CancellationToken) -> Self {
        Transaction {
            db,
            id,
            read_version,
            token,
            state: Mutex::new(TrxState::default()),
        }
    }

    /// The database this transaction runs against.
    pub fn database(&self) -> Database {
        self.db.clone()
    }

    /// The commit version of the database observed when this transaction was
    /// created.
    pub fn read_version(&self) -> u64 {
        self.read_version
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Whether this transaction has buffered any mutation yet.
    pub(crate) fn has_writes(&self) -> bool {
        let state = self.state.lock().expect("transaction state poisoned");
        !state.writes.is_empty() || !state.cleared.is_empty()
    }

    /// Sets an option on the transaction.
    pub fn set_option(&self, opt: TransactionOption) -> KvResult<()> {
        let mut state = self.state.lock().expect("transaction state poisoned");
        state.check_live()?;
        match opt {
            TransactionOption::NextWriteNoWriteConflictRange => {
                state.next_write_no_conflict = true;
            }
        }
        Ok(())
    }

    /// Reads a key.
    ///
    /// A `snapshot` read is not recorded in the read set and therefore does
    /// not cause conflicts with concurrent writers.
    pub async fn get(&self, key: &[u8], snapshot: bool) -> KvResult<Option<Vec<u8>>> {
        self.token.check()?;
        let mut state = self.state.lock().expect("transaction state poisoned");
        state.check_live()?;
        if !snapshot {
            state.reads.insert(key.to_vec());
        }

        if let Some(write) = state.writes.get(key) {
            return Ok(match &write.op {
                WriteOp::Set(value) => Some(value.clone()),
                WriteOp::Clear => None,
                WriteOp::Add(delta) => {
                    let base = self.db.committed_value(key);
                    Some(apply_add(base.as_deref(), *delta))
                }
            });
        }
        if state.in_cleared(key) {
            return Ok(None);
        }
        Ok(self.db.committed_value(key))
    }

    /// Reads an ordered batch of key-value pairs.
    pub async fn get_range(&self, opt: &RangeOption, snapshot: bool) -> KvResult<KeyValues> {
        self.token.check()?;
        let mut state = self.state.lock().expect("transaction state poisoned");
        state.check_live()?;
        if opt.begin >= opt.end {
            return Ok(KeyValues::default());
        }
        if !snapshot {
            state
                .read_ranges
                .push((opt.begin.clone(), opt.end.clone()));
        }

        let mut view: BTreeMap<Vec<u8>, Vec<u8>> = self
            .db
            .committed_range(&opt.begin, &opt.end)
            .into_iter()
            .filter(|(key, _)| !state.in_cleared(key))
            .collect();

        let buffered: Vec<(Vec<u8>, BufferedWrite)> = state
            .writes
            .range::<[u8], _>((
                Bound::Included(opt.begin.as_slice()),
                Bound::Excluded(opt.end.as_slice()),
            ))
            .map(|(key, write)| (key.clone(), write.clone()))
            .collect();
        for (key, write) in buffered {
            match write.op {
                WriteOp::Set(value) => {
                    view.insert(key, value);
                }
                WriteOp::Clear => {
                    view.remove(&key);
                }
                WriteOp::Add(delta) => {
                    let base = self.db.committed_value(&key);
                    view.insert(key, apply_add(base.as_deref(), delta));
                }
            }
        }

        let mut values: Vec<KeyValue> = view
            .into_iter()
            .map(|(key, value)| KeyValue { key, value })
            .collect();
        if opt.reverse {
            values.reverse();
        }
        let mut more = false;
        if let Some(limit) = opt.limit {
            if values.len() > limit {
                values.truncate(limit);
                more = true;
            }
        }
        Ok(KeyValues { values, more })
    }

    /// Buffers a write of `value` at `key`.
    pub fn set(&self, key: &[u8], value: &[u8]) {
        let mut state = self.state.lock().expect("transaction state poisoned");
        if state.resolved {
            return;
        }
        let conflict = state.take_conflict_flag();
        state.writes.insert(
            key.to_vec(),
            BufferedWrite {
                op: WriteOp::Set(value.to_vec()),
                conflict,
            },
        );
    }

    /// Buffers a clear of `key`.
    pub fn clear(&self, key: &[u8]) {
        let mut state = self.state.lock().expect("transaction state poisoned");
        if state.resolved {
            return;
        }
        let conflict = state.take_conflict_flag();
        state.writes.insert(
            key.to_vec(),
            BufferedWrite {
                op: WriteOp::Clear,
                conflict,
            },
        );
    }

    /// Buffers a clear of every key in `[begin, end)`.
    pub fn clear_range(&self, begin: &[u8], end: &[u8]) {
        let mut state = self.state.lock().expect("transaction state poisoned");
        if state.resolved || begin >= end {
            return;
        }
        let conflict = state.take_conflict_flag();
        let stale: Vec<Vec<u8>> = state
            .writes
            .range::<[u8], _>((Bound::Included(begin), Bound::Excluded(end)))
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            state.writes.remove(&key);
        }
        state.cleared.push(ClearedRange {
            begin: begin.to_vec(),
            end: end.to_vec(),
            conflict,
        });
    }

    /// Buffers a little-endian 64-bit wrapping add of `delta` at `key`.
    ///
    /// An absent value counts as zero. Unlike a read-modify-write this does
    /// not put `key` in the read set.
    pub fn atomic_add(&self, key: &[u8], delta: i64) {
        let mut state = self.state.lock().expect("transaction state poisoned");
        if state.resolved {
            return;
        }
        let conflict = state.take_conflict_flag();
        let cleared = state.in_cleared(key);
        let merged = match state.writes.remove(key) {
            Some(BufferedWrite {
                op: WriteOp::Set(value),
                conflict: previous,
            }) => BufferedWrite {
                op: WriteOp::Set(apply_add(Some(&value), delta)),
                conflict: previous || conflict,
            },
            Some(BufferedWrite {
                op: WriteOp::Add(previous_delta),
                conflict: previous,
            }) => BufferedWrite {
                op: WriteOp::Add(previous_delta.wrapping_add(delta)),
                conflict: previous || conflict,
            },
            Some(BufferedWrite {
                op: WriteOp::Clear,
                conflict: previous,
            }) => BufferedWrite {
                op: WriteOp::Set(apply_add(None, delta)),
                conflict: previous || conflict,
            },
            None if cleared => BufferedWrite {
                op: WriteOp::Set(apply_add(None, delta)),
                conflict,
            },
            None => BufferedWrite {
                op: WriteOp::Add(delta),
                conflict,
            },
        };
        state.writes.insert(key.to_vec(), merged);
    }

    /// Manually extends the read or write conflict set with `[begin, end)`.
    pub fn add_conflict_range(
        &self,
        begin: &[u8],
        end: &[u8],
        kind: ConflictRangeType,
    ) -> KvResult<()> {
        let mut state = self.state.lock().expect("transaction state poisoned");
        state.check_live()?;
        let range = (begin.to_vec(), end.to_vec());
        match kind {
            ConflictRangeType::Read => state.read_ranges.push(range),
            ConflictRangeType::Write => state.write_ranges.push(range),
        }
        Ok(())
    }

    /// Commits the buffered mutations.
    ///
    /// Fails with [`KvError::Conflict`] when a concurrent transaction
    /// committed a write overlapping this transaction's read set. A
    /// transaction without mutations commits trivially.
    pub async fn commit(self) -> KvResult<()> {
        self.token.check()?;
        let state = {
            let mut state = self.state.lock().expect("transaction state poisoned");
            state.check_live()?;
            state.resolved = true;
            std::mem::take(&mut *state)
        };
        self.db.commit(self.read_version, state)
    }

    /// Cancels the transaction, discarding the buffered mutations.
    pub fn cancel(self) {
        let mut state = self.state.lock().expect("transaction state poisoned");
        state.resolved = true;
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.db.forget_transaction(self.id);
    }
}
