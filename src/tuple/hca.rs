// Copyright 2025 dirspace developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The high-contention allocator behind directory prefix assignment.
//!
//! The allocation process works over candidate value windows. It uses two
//! subspaces to operate, the "counters" subspace and "recent" subspace
//! (derived from the subspace used to create the HCA).
//!
//! "counters" contains a single key `counters : window_start`, whose value is
//! the number of allocations in the current window. `window_start` is an
//! integer that marks the lower bound of values that can be assigned from the
//! current window. "recent" can contain many keys `recent : candidate`, where
//! each candidate is an integer that has been assigned to some client.
//!
//! Assignment has two stages that are executed in a loop until they both
//! succeed.
//!
//! 1. Find the current window. The client reads the latest
//!    `counters : window_start` and how many allocations have been made in
//!    the current window. If the window is more than half-full (using the
//!    window sizes of the schedule), the window is advanced: both subspaces
//!    are cleared below the new start and (1) is retried.
//! 2. Find a candidate value inside that window. The client picks a candidate
//!    between `window_start` and `window_start + window_size` and tries to
//!    reserve the key `recent : candidate`. If the reservation write survives
//!    (the window has not moved and nobody else took the candidate), the
//!    candidate is the allocated value. Otherwise (2), or (1) when the window
//!    moved, is repeated.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use futures::future;
use log::debug;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::error::KvError;
use crate::store::{ConflictRangeType, RangeOption, TransactError, Transaction, TransactionOption};
use crate::tuple::{PackError, Subspace};

const ONE: i64 = 1;

/// Bound on unproductive candidate reservations in a single `allocate` call.
/// With windows at most half-full each attempt succeeds with probability at
/// least one half, so hitting the bound means something is wrong with the
/// allocator state rather than bad luck.
const MAX_CANDIDATE_ATTEMPTS: usize = 128;

/// An error raised by the allocator.
pub enum HcaError {
    KvError(KvError),
    PackError(PackError),
    /// A counter value that is not an 8-byte integer.
    InvalidAllocatorState,
    /// Candidate reservation kept failing; see [`MAX_CANDIDATE_ATTEMPTS`].
    WindowExhausted,
    PoisonError,
}

impl fmt::Debug for HcaError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HcaError::KvError(err) => err.fmt(f),
            HcaError::PackError(err) => err.fmt(f),
            HcaError::InvalidAllocatorState => write!(f, "invalid allocator counter state"),
            HcaError::WindowExhausted => write!(f, "exhausted allocation candidates"),
            HcaError::PoisonError => write!(f, "mutex poisoned"),
        }
    }
}

impl fmt::Display for HcaError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl std::error::Error for HcaError {}

impl From<KvError> for HcaError {
    fn from(err: KvError) -> Self {
        Self::KvError(err)
    }
}
impl From<PackError> for HcaError {
    fn from(err: PackError) -> Self {
        Self::PackError(err)
    }
}
impl<T> From<PoisonError<T>> for HcaError {
    fn from(_err: PoisonError<T>) -> Self {
        Self::PoisonError
    }
}

impl TransactError for HcaError {
    fn try_into_kv_error(self) -> Result<KvError, Self> {
        match self {
            HcaError::KvError(err) => Ok(err),
            _ => Err(self),
        }
    }
}

/// Window sizes used as the allocation counter grows.
///
/// Larger windows are better for high contention, smaller ones keep the
/// allocated values (and hence the directory prefixes) short. The default
/// starts small and scales up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSchedule {
    pub small: i64,
    pub medium: i64,
    pub large: i64,
}

impl Default for WindowSchedule {
    fn default() -> Self {
        WindowSchedule {
            small: 64,
            medium: 1024,
            large: 8192,
        }
    }
}

impl WindowSchedule {
    fn window_size(&self, start: i64) -> i64 {
        // We don't want the windows to ever get *too* big because about
        // window_size/2 recent items stay stored.
        match start {
            _ if start < 255 => self.small,
            _ if start < 65535 => self.medium,
            _ => self.large,
        }
    }
}

/// Represents a high-contention allocator for a given subspace.
#[derive(Debug)]
pub struct HighContentionAllocator {
    counters: Subspace,
    recent: Subspace,
    schedule: WindowSchedule,
    allocation_mutex: Mutex<()>,
}

impl HighContentionAllocator {
    /// Constructs an allocator that will use the input subspace for assigning
    /// values. The given subspace should not be used by anything other than
    /// the allocator.
    pub fn new(subspace: Subspace) -> HighContentionAllocator {
        Self::with_schedule(subspace, WindowSchedule::default())
    }

    /// Constructs an allocator with an explicit window schedule.
    pub fn with_schedule(subspace: Subspace, schedule: WindowSchedule) -> HighContentionAllocator {
        HighContentionAllocator {
            counters: subspace.subspace(&0i64),
            recent: subspace.subspace(&1i64),
            schedule,
            allocation_mutex: Mutex::new(()),
        }
    }

    /// Returns an integer that
    ///   1) has never and will never be returned by another call to this
    ///      method on the same subspace
    ///   2) is nearly as short as possible given the above
    pub async fn allocate(&self, trx: &Transaction) -> Result<i64, HcaError> {
        let counters_range = RangeOption {
            limit: Some(1),
            reverse: true,
            ..RangeOption::from(&self.counters)
        };
        // SmallRng keeps the future Send, unlike the thread-local generator
        let mut rng = SmallRng::from_entropy();
        let mut attempts = 0;

        loop {
            let kvs = trx.get_range(&counters_range, true).await?;

            let mut start: i64 = if let Some(first) = kvs.first() {
                self.counters.unpack(first.key())?
            } else {
                0
            };

            let mut window_advanced = false;

            let window = loop {
                let counters_start = self.counters.subspace(&start);

                let mutex_guard = self.allocation_mutex.lock()?;
                if window_advanced {
                    debug!("allocator window advanced to {}", start);
                    trx.clear_range(self.counters.bytes(), counters_start.bytes());
                    trx.set_option(TransactionOption::NextWriteNoWriteConflictRange)?;
                    trx.clear_range(self.recent.bytes(), self.recent.subspace(&start).bytes());
                }

                // Increment the allocation count for the current window
                trx.atomic_add(counters_start.bytes(), ONE);
                let count_future = trx.get(counters_start.bytes(), true);
                drop(mutex_guard);

                let count_value = count_future.await?;
                let count = if let Some(count_value) = count_value {
                    if count_value.len() != 8 {
                        return Err(HcaError::InvalidAllocatorState);
                    }
                    let mut bytes = [0u8; 8];
                    bytes.copy_from_slice(&count_value);
                    i64::from_le_bytes(bytes)
                } else {
                    0
                };

                let window = self.schedule.window_size(start);
                if count * 2 < window {
                    break window;
                }

                start += window;
                window_advanced = true;
            };

            loop {
                // As of the snapshot being read from, the window is less than
                // half full, so this should be expected to take 2 tries. Under
                // high contention (and when the window advances), there is an
                // additional subsequent risk of conflict for this transaction.
                attempts += 1;
                if attempts > MAX_CANDIDATE_ATTEMPTS {
                    return Err(HcaError::WindowExhausted);
                }

                let candidate: i64 = rng.gen_range(start, start + window);
                let recent_candidate = self.recent.subspace(&candidate);

                // both reads must observe the state before the reservation
                // write below is buffered
                let (latest_counter, candidate_value) = future::try_join(
                    trx.get_range(&counters_range, true),
                    trx.get(recent_candidate.bytes(), false),
                )
                .await?;

                let mutex_guard = self.allocation_mutex.lock()?;
                trx.set_option(TransactionOption::NextWriteNoWriteConflictRange)?;
                trx.set(recent_candidate.bytes(), &[]);
                drop(mutex_guard);

                let current_window_start: i64 = if let Some(first) = latest_counter.first() {
                    self.counters.unpack(first.key())?
                } else {
                    0
                };

                if current_window_start > start {
                    break;
                }

                if candidate_value.is_none() {
                    let mut after = recent_candidate.bytes().to_vec();
                    after.push(0x00);
                    trx.add_conflict_range(
                        recent_candidate.bytes(),
                        &after,
                        ConflictRangeType::Write,
                    )?;
                    return Ok(candidate);
                }
            }
        }
    }
}
