// Copyright 2025 dirspace developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Errors raised by directory operations.

use crate::error::KvError;
use crate::path::{Path, PathError};
use crate::store::TransactError;
use crate::tuple::hca::HcaError;
use crate::tuple::PackError;

use std::fmt;

/// The failure condition of a [`DirectoryError`].
#[derive(Debug)]
pub enum DirectoryErrorKind {
    /// The directory does not exist.
    NotFound,
    /// A directory already exists where `create` was requested.
    AlreadyExists,
    /// The parent of a move destination does not exist.
    ParentNotFound,
    /// The stored layer id does not match the requested one, or the requested
    /// layer transition is forbidden.
    IncompatibleLayer {
        /// the layer id recorded in the directory
        stored: String,
        /// the layer id the caller supplied
        requested: String,
    },
    /// The path is malformed for this operation.
    InvalidPath(PathError),
    /// An absolute path that does not lie below the receiving directory.
    OutsideDirectory,
    /// No path was provided where one is required.
    NoPathProvided,
    /// The explicit prefix overlaps a live directory prefix.
    PrefixInUse,
    /// The prefix already holds content.
    PrefixNotEmpty,
    /// Manual prefixes are not enabled on this directory layer.
    PrefixNotAllowed,
    /// Source and destination of a move resolve to different partitions.
    CannotMoveBetweenPartitions,
    /// The destination of a move descends from its source.
    CannotMoveBetweenSubdirectories,
    /// The root of a directory layer cannot be moved.
    CannotMoveRootDirectory,
    /// The root of a directory layer cannot be removed or altered.
    CannotModifyRootDirectory,
    /// The handle was resolved against directory state that has since
    /// changed.
    StaleHandle,
    /// The on-disk format version is not usable by this implementation.
    Format(String),
    /// Directory metadata that cannot be decoded.
    Metadata(String),
    /// An error from the key-value store.
    Kv(KvError),
    /// An error from the prefix allocator.
    Hca(HcaError),
    /// An error from the key codec.
    Pack(PackError),
}

/// An error from a directory operation, carrying the operation name and the
/// path it was invoked with.
#[derive(Debug)]
pub struct DirectoryError {
    op: &'static str,
    path: Path,
    kind: DirectoryErrorKind,
}

impl DirectoryError {
    pub(crate) fn new(op: &'static str, path: Path, kind: DirectoryErrorKind) -> Self {
        DirectoryError { op, path, kind }
    }

    /// The operation that failed, e.g. `"open"`.
    pub fn op(&self) -> &'static str {
        self.op
    }

    /// The path the operation was invoked with.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> &DirectoryErrorKind {
        &self.kind
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.kind, DirectoryErrorKind::NotFound)
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self.kind, DirectoryErrorKind::AlreadyExists)
    }

    pub fn is_stale_handle(&self) -> bool {
        matches!(self.kind, DirectoryErrorKind::StaleHandle)
    }
}

impl fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "directory {} at \"{}\": ", self.op, self.path)?;
        match &self.kind {
            DirectoryErrorKind::NotFound => write!(f, "directory does not exist"),
            DirectoryErrorKind::AlreadyExists => write!(f, "directory already exists"),
            DirectoryErrorKind::ParentNotFound => write!(f, "parent directory does not exist"),
            DirectoryErrorKind::IncompatibleLayer { stored, requested } => write!(
                f,
                "layer mismatch: stored \"{}\", requested \"{}\"",
                stored, requested
            ),
            DirectoryErrorKind::InvalidPath(err) => write!(f, "invalid path: {}", err),
            DirectoryErrorKind::OutsideDirectory => {
                write!(f, "path does not lie below this directory")
            }
            DirectoryErrorKind::NoPathProvided => write!(f, "no path provided"),
            DirectoryErrorKind::PrefixInUse => write!(f, "prefix overlaps a live directory"),
            DirectoryErrorKind::PrefixNotEmpty => write!(f, "prefix already holds content"),
            DirectoryErrorKind::PrefixNotAllowed => {
                write!(f, "manual prefixes are not enabled here")
            }
            DirectoryErrorKind::CannotMoveBetweenPartitions => {
                write!(f, "cannot move between partitions")
            }
            DirectoryErrorKind::CannotMoveBetweenSubdirectories => {
                write!(f, "destination descends from the source")
            }
            DirectoryErrorKind::CannotMoveRootDirectory => {
                write!(f, "the root directory cannot be moved")
            }
            DirectoryErrorKind::CannotModifyRootDirectory => {
                write!(f, "the root directory cannot be modified")
            }
            DirectoryErrorKind::StaleHandle => write!(f, "handle is stale"),
            DirectoryErrorKind::Format(msg) => write!(f, "{}", msg),
            DirectoryErrorKind::Metadata(msg) => write!(f, "bad metadata: {}", msg),
            DirectoryErrorKind::Kv(err) => write!(f, "{}", err),
            DirectoryErrorKind::Hca(err) => write!(f, "{}", err),
            DirectoryErrorKind::Pack(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for DirectoryError {}

impl From<KvError> for DirectoryError {
    fn from(err: KvError) -> Self {
        DirectoryError::new("transaction", Path::new(), DirectoryErrorKind::Kv(err))
    }
}

impl TransactError for DirectoryError {
    fn try_into_kv_error(self) -> Result<KvError, Self> {
        match self.kind {
            DirectoryErrorKind::Kv(err) => Ok(err),
            DirectoryErrorKind::Hca(HcaError::KvError(err)) => Ok(err),
            _ => Err(self),
        }
    }
}
