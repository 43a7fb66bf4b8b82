// Copyright 2025 dirspace developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Directories: a level of indirection between logical paths and key prefixes.
//!
//! Directories are identified by hierarchical paths analogous to the paths
//! in a Unix-like file system. Each directory maps to a short, unique binary
//! prefix under which the caller stores its content; the directory layer
//! maintains the path-to-prefix mapping transactionally, so a directory can
//! be renamed or moved without touching the content stored under its prefix.
//!
//! ```
//! use dirspace::directory::{Directory, DirectoryLayer};
//! use dirspace::{Database, Path};
//!
//! async fn async_main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::new();
//!     let trx = db.create_trx()?;
//!
//!     let directory = DirectoryLayer::default();
//!     let path: Path = "/my-app/my-user".parse()?;
//!     let content = directory.create_or_open(&trx, &path, None).await?;
//!     trx.set(&content.pack(&("likes", 42)), b"");
//!
//!     // nothing is visible until the transaction commits
//!     trx.commit().await?;
//!     Ok(())
//! }
//!
//! futures::executor::block_on(async_main()).expect("failed to run");
//! ```

pub(crate) mod cache;
pub mod directory_layer;
pub mod directory_partition;
pub mod directory_subspace;
pub mod error;
pub mod facade;
pub(crate) mod node;

pub use directory_layer::DirectoryLayer;
pub use directory_partition::DirectoryPartition;
pub use directory_subspace::DirectorySubspace;
pub use error::{DirectoryError, DirectoryErrorKind};

use crate::path::Path;
use crate::store::Transaction;
use crate::tuple::{PackResult, Subspace, TuplePack, TupleUnpack};
use async_trait::async_trait;

/// `Directory` is the interface of everything that behaves like a directory:
/// the root layer itself, a directory subspace and a partition. Paths are
/// interpreted relative to the receiver; an absolute path must lie below the
/// receiver's own path.
#[async_trait]
pub trait Directory {
    /// Opens the directory at `path`, creating it (and its ancestors) when
    /// absent.
    async fn create_or_open(
        &self,
        trx: &Transaction,
        path: &Path,
        layer: Option<&str>,
    ) -> Result<DirectoryOutput, DirectoryError>;

    /// Creates the directory at `path`, failing when it already exists.
    async fn create(
        &self,
        trx: &Transaction,
        path: &Path,
        layer: Option<&str>,
    ) -> Result<DirectoryOutput, DirectoryError>;

    /// Opens the directory at `path`, failing when it does not exist.
    async fn open(
        &self,
        trx: &Transaction,
        path: &Path,
        layer: Option<&str>,
    ) -> Result<DirectoryOutput, DirectoryError>;

    /// Creates the directory at `path` under an externally chosen prefix.
    ///
    /// The prefix must be disjoint from every live directory prefix, and the
    /// directory layer must have been constructed with manual prefixes
    /// enabled.
    async fn register(
        &self,
        trx: &Transaction,
        path: &Path,
        layer: Option<&str>,
        prefix: &[u8],
    ) -> Result<DirectoryOutput, DirectoryError>;

    /// Checks whether the directory at `path` exists.
    async fn exists(&self, trx: &Transaction, path: &Path) -> Result<bool, DirectoryError>;

    /// Moves this directory to `new_path`.
    async fn move_directory(
        &self,
        trx: &Transaction,
        new_path: &Path,
    ) -> Result<DirectoryOutput, DirectoryError>;

    /// Moves the directory at `old_path` to `new_path`.
    ///
    /// Fails when `old_path` is absent, `new_path` is present, the parent of
    /// `new_path` is absent, `new_path` descends from `old_path`, or the two
    /// paths resolve to different partitions. Moving a directory onto its own
    /// path is a no-op success. The directory's prefix, and therefore its
    /// content, is unchanged.
    async fn move_to(
        &self,
        trx: &Transaction,
        old_path: &Path,
        new_path: &Path,
    ) -> Result<DirectoryOutput, DirectoryError>;

    /// Removes the directory at `path`, its subdirectories and all of their
    /// content.
    async fn remove(&self, trx: &Transaction, path: &Path) -> Result<bool, DirectoryError>;

    /// Lists the names of the direct subdirectories of `path`, in ascending
    /// name order.
    async fn list(&self, trx: &Transaction, path: &Path) -> Result<Vec<String>, DirectoryError>;

    /// Replaces the layer id of the directory at `path`.
    ///
    /// The root of a partition keeps its layer forever, and a regular
    /// directory cannot be turned into a partition in place.
    async fn change_layer(
        &self,
        trx: &Transaction,
        path: &Path,
        new_layer: &str,
    ) -> Result<DirectoryOutput, DirectoryError>;

    /// [`create`](Directory::create), reporting an existing directory as
    /// `None` instead of an error.
    async fn try_create(
        &self,
        trx: &Transaction,
        path: &Path,
        layer: Option<&str>,
    ) -> Result<Option<DirectoryOutput>, DirectoryError> {
        match self.create(trx, path, layer).await {
            Ok(output) => Ok(Some(output)),
            Err(err) if err.is_already_exists() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// [`open`](Directory::open), reporting a missing directory as `None`
    /// instead of an error.
    async fn try_open(
        &self,
        trx: &Transaction,
        path: &Path,
        layer: Option<&str>,
    ) -> Result<Option<DirectoryOutput>, DirectoryError> {
        match self.open(trx, path, layer).await {
            Ok(output) => Ok(Some(output)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// [`remove`](Directory::remove), reporting a missing directory as
    /// `false` instead of an error.
    async fn try_remove(&self, trx: &Transaction, path: &Path) -> Result<bool, DirectoryError> {
        match self.remove(trx, path).await {
            Ok(existed) => Ok(existed),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// [`list`](Directory::list), reporting a missing directory as `None`
    /// instead of an error.
    async fn try_list(
        &self,
        trx: &Transaction,
        path: &Path,
    ) -> Result<Option<Vec<String>>, DirectoryError> {
        match self.list(trx, path).await {
            Ok(names) => Ok(Some(names)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// The result of a directory operation: a regular directory subspace, or a
/// partition hosting a nested directory layer.
#[derive(Clone, Debug)]
pub enum DirectoryOutput {
    Subspace(DirectorySubspace),
    Partition(DirectoryPartition),
}

impl DirectoryOutput {
    /// Returns the subspace extending this directory's prefix with a packed
    /// tuple.
    ///
    /// # Panics
    ///
    /// Panics when called on a partition, whose prefix is reserved for its
    /// nested directory layer.
    pub fn subspace<T: TuplePack>(&self, t: &T) -> Subspace {
        match self {
            DirectoryOutput::Subspace(d) => d.subspace(t),
            DirectoryOutput::Partition(_) => {
                panic!("cannot open subspace in the root of a directory partition")
            }
        }
    }

    /// The directory's prefix.
    ///
    /// # Panics
    ///
    /// Panics when called on a partition.
    pub fn bytes(&self) -> &[u8] {
        match self {
            DirectoryOutput::Subspace(d) => d.bytes(),
            DirectoryOutput::Partition(_) => {
                panic!("cannot get key for the root of a directory partition")
            }
        }
    }

    /// Packs a tuple under the directory's prefix.
    ///
    /// # Panics
    ///
    /// Panics when called on a partition.
    pub fn pack<T: TuplePack>(&self, t: &T) -> Vec<u8> {
        match self {
            DirectoryOutput::Subspace(d) => d.pack(t),
            DirectoryOutput::Partition(_) => {
                panic!("cannot pack for the root of a directory partition")
            }
        }
    }

    /// Unpacks a key packed under the directory's prefix.
    ///
    /// # Panics
    ///
    /// Panics when called on a partition.
    pub fn unpack<'de, T: TupleUnpack<'de>>(&self, key: &'de [u8]) -> PackResult<T> {
        match self {
            DirectoryOutput::Subspace(d) => d.unpack(key),
            DirectoryOutput::Partition(_) => {
                panic!("cannot unpack keys using the root of a directory partition")
            }
        }
    }

    /// The key range below the directory's prefix.
    ///
    /// # Panics
    ///
    /// Panics when called on a partition.
    pub fn range(&self) -> (Vec<u8>, Vec<u8>) {
        match self {
            DirectoryOutput::Subspace(d) => d.range(),
            DirectoryOutput::Partition(_) => {
                panic!("cannot get range for the root of a directory partition")
            }
        }
    }

    /// The absolute path this directory was resolved at.
    pub fn path(&self) -> &Path {
        match self {
            DirectoryOutput::Subspace(d) => d.path(),
            DirectoryOutput::Partition(d) => d.path(),
        }
    }

    /// The directory's layer id.
    pub fn layer(&self) -> &str {
        match self {
            DirectoryOutput::Subspace(d) => d.layer(),
            DirectoryOutput::Partition(_) => directory_layer::PARTITION_LAYER,
        }
    }

    pub fn is_partition(&self) -> bool {
        matches!(self, DirectoryOutput::Partition(_))
    }

    /// Checks whether the resolution this handle was built from still holds.
    pub async fn is_valid(&self, trx: &Transaction) -> Result<bool, DirectoryError> {
        match self {
            DirectoryOutput::Subspace(d) => d.is_valid(trx).await,
            DirectoryOutput::Partition(d) => d.is_valid(trx).await,
        }
    }
}

#[async_trait]
impl Directory for DirectoryOutput {
    async fn create_or_open(
        &self,
        trx: &Transaction,
        path: &Path,
        layer: Option<&str>,
    ) -> Result<DirectoryOutput, DirectoryError> {
        match self {
            DirectoryOutput::Subspace(d) => d.create_or_open(trx, path, layer).await,
            DirectoryOutput::Partition(d) => d.create_or_open(trx, path, layer).await,
        }
    }

    async fn create(
        &self,
        trx: &Transaction,
        path: &Path,
        layer: Option<&str>,
    ) -> Result<DirectoryOutput, DirectoryError> {
        match self {
            DirectoryOutput::Subspace(d) => d.create(trx, path, layer).await,
            DirectoryOutput::Partition(d) => d.create(trx, path, layer).await,
        }
    }

    async fn open(
        &self,
        trx: &Transaction,
        path: &Path,
        layer: Option<&str>,
    ) -> Result<DirectoryOutput, DirectoryError> {
        match self {
            DirectoryOutput::Subspace(d) => d.open(trx, path, layer).await,
            DirectoryOutput::Partition(d) => d.open(trx, path, layer).await,
        }
    }

    async fn register(
        &self,
        trx: &Transaction,
        path: &Path,
        layer: Option<&str>,
        prefix: &[u8],
    ) -> Result<DirectoryOutput, DirectoryError> {
        match self {
            DirectoryOutput::Subspace(d) => d.register(trx, path, layer, prefix).await,
            DirectoryOutput::Partition(d) => d.register(trx, path, layer, prefix).await,
        }
    }

    async fn exists(&self, trx: &Transaction, path: &Path) -> Result<bool, DirectoryError> {
        match self {
            DirectoryOutput::Subspace(d) => d.exists(trx, path).await,
            DirectoryOutput::Partition(d) => d.exists(trx, path).await,
        }
    }

    async fn move_directory(
        &self,
        trx: &Transaction,
        new_path: &Path,
    ) -> Result<DirectoryOutput, DirectoryError> {
        match self {
            DirectoryOutput::Subspace(d) => d.move_directory(trx, new_path).await,
            DirectoryOutput::Partition(d) => d.move_directory(trx, new_path).await,
        }
    }

    async fn move_to(
        &self,
        trx: &Transaction,
        old_path: &Path,
        new_path: &Path,
    ) -> Result<DirectoryOutput, DirectoryError> {
        match self {
            DirectoryOutput::Subspace(d) => d.move_to(trx, old_path, new_path).await,
            DirectoryOutput::Partition(d) => d.move_to(trx, old_path, new_path).await,
        }
    }

    async fn remove(&self, trx: &Transaction, path: &Path) -> Result<bool, DirectoryError> {
        match self {
            DirectoryOutput::Subspace(d) => d.remove(trx, path).await,
            DirectoryOutput::Partition(d) => d.remove(trx, path).await,
        }
    }

    async fn list(&self, trx: &Transaction, path: &Path) -> Result<Vec<String>, DirectoryError> {
        match self {
            DirectoryOutput::Subspace(d) => d.list(trx, path).await,
            DirectoryOutput::Partition(d) => d.list(trx, path).await,
        }
    }

    async fn change_layer(
        &self,
        trx: &Transaction,
        path: &Path,
        new_layer: &str,
    ) -> Result<DirectoryOutput, DirectoryError> {
        match self {
            DirectoryOutput::Subspace(d) => d.change_layer(trx, path, new_layer).await,
            DirectoryOutput::Partition(d) => d.change_layer(trx, path, new_layer).await,
        }
    }
}

// Strinc returns the first key that would sort outside the range prefixed by
// the input.
pub(crate) fn strinc(key: Vec<u8>) -> Vec<u8> {
    let mut key = key;

    for i in (0..key.len()).rev() {
        if key[i] != 0xff {
            key[i] += 1;
            return key;
        } else {
            // stripping key from trailing 0xFF bytes
            key.remove(i);
        }
    }
    panic!("failed to strinc");
}
