// Copyright 2025 dirspace developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Partitions: directories hosting an independent nested directory layer.

use crate::directory::cache::ChainLink;
use crate::directory::directory_layer::{DirectoryLayer, DEFAULT_NODE_PREFIX, PARTITION_LAYER};
use crate::directory::directory_subspace::DirectorySubspace;
use crate::directory::error::DirectoryError;
use crate::directory::{Directory, DirectoryOutput};
use crate::path::Path;
use crate::store::Transaction;
use crate::tuple::Subspace;
use async_trait::async_trait;
use std::ops::Deref;
use std::sync::Arc;

/// A `DirectoryPartition` is a directory whose prefix is prepended to all of
/// its descendant directories' prefixes: below it lives a complete,
/// independent directory layer with its own node metadata, allocator and
/// metadata version register. It cannot be used as a subspace; create at
/// least one subdirectory to store content.
#[derive(Clone)]
pub struct DirectoryPartition {
    pub(crate) inner: Arc<DirectoryPartitionInner>,
}

#[derive(Debug)]
pub struct DirectoryPartitionInner {
    pub(crate) directory_subspace: DirectorySubspace,
    pub(crate) parent_directory_layer: DirectoryLayer,
}

impl Deref for DirectoryPartition {
    type Target = DirectoryPartitionInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl std::fmt::Debug for DirectoryPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

impl DirectoryPartition {
    pub(crate) fn new(
        path: Path,
        prefix: Vec<u8>,
        parent_directory_layer: DirectoryLayer,
        chain: Vec<ChainLink>,
        txn: u64,
    ) -> Self {
        let mut node_subspace_bytes = Vec::with_capacity(prefix.len() + DEFAULT_NODE_PREFIX.len());
        node_subspace_bytes.extend_from_slice(&prefix);
        node_subspace_bytes.extend_from_slice(DEFAULT_NODE_PREFIX);

        let new_directory_layer = DirectoryLayer::new_nested(
            Subspace::from_bytes(&node_subspace_bytes),
            Subspace::from_bytes(prefix.as_slice()),
            path.clone(),
            chain.clone(),
        );

        DirectoryPartition {
            inner: Arc::new(DirectoryPartitionInner {
                directory_subspace: DirectorySubspace::new(
                    path,
                    prefix,
                    &new_directory_layer,
                    PARTITION_LAYER.to_string(),
                    chain,
                    txn,
                ),
                parent_directory_layer,
            }),
        }
    }

    /// The nested directory layer rooted at this partition's prefix.
    pub(crate) fn nested_layer(&self) -> &DirectoryLayer {
        &self.inner.directory_subspace.directory_layer
    }

    /// The absolute path this partition was resolved at.
    pub fn path(&self) -> &Path {
        self.inner.directory_subspace.path()
    }

    /// The layer id, always `"partition"`.
    pub fn layer(&self) -> &str {
        PARTITION_LAYER
    }

    /// See [`DirectorySubspace::is_valid`].
    pub async fn is_valid(&self, trx: &Transaction) -> Result<bool, DirectoryError> {
        self.inner.directory_subspace.is_valid(trx).await
    }

    /// Operations on the partition itself (the empty path) run in the parent
    /// layer, everything below runs in the nested one.
    fn get_directory_layer_for_path(&self, path: &Path) -> DirectoryLayer {
        if path.is_empty() {
            self.parent_directory_layer.clone()
        } else {
            self.inner.directory_subspace.directory_layer.clone()
        }
    }

    fn partition_subpath(
        &self,
        op: &'static str,
        path: &Path,
        directory_layer: &DirectoryLayer,
    ) -> Result<Path, DirectoryError> {
        let base = self
            .inner
            .directory_subspace
            .path()
            .relative_to(directory_layer.path())
            .expect("partition path lies below its layer");
        let relative = if path.is_absolute() {
            match path.relative_to(self.inner.directory_subspace.path()) {
                Some(relative) => relative,
                None => {
                    return Err(DirectoryError::new(
                        op,
                        path.clone(),
                        crate::directory::error::DirectoryErrorKind::OutsideDirectory,
                    ))
                }
            }
        } else {
            path.clone()
        };
        base.join(&relative).map_err(|err| {
            DirectoryError::new(
                op,
                path.clone(),
                crate::directory::error::DirectoryErrorKind::InvalidPath(err),
            )
        })
    }
}

#[async_trait]
impl Directory for DirectoryPartition {
    async fn create_or_open(
        &self,
        trx: &Transaction,
        path: &Path,
        layer: Option<&str>,
    ) -> Result<DirectoryOutput, DirectoryError> {
        self.inner
            .directory_subspace
            .create_or_open(trx, path, layer)
            .await
    }

    async fn create(
        &self,
        trx: &Transaction,
        path: &Path,
        layer: Option<&str>,
    ) -> Result<DirectoryOutput, DirectoryError> {
        self.inner.directory_subspace.create(trx, path, layer).await
    }

    async fn open(
        &self,
        trx: &Transaction,
        path: &Path,
        layer: Option<&str>,
    ) -> Result<DirectoryOutput, DirectoryError> {
        self.inner.directory_subspace.open(trx, path, layer).await
    }

    async fn register(
        &self,
        trx: &Transaction,
        path: &Path,
        layer: Option<&str>,
        prefix: &[u8],
    ) -> Result<DirectoryOutput, DirectoryError> {
        self.inner
            .directory_subspace
            .register(trx, path, layer, prefix)
            .await
    }

    async fn exists(&self, trx: &Transaction, path: &Path) -> Result<bool, DirectoryError> {
        self.inner
            .directory_subspace
            .ensure_current(trx, "exists")
            .await?;
        let directory_layer = self.get_directory_layer_for_path(path);
        let sub_path = self.partition_subpath("exists", path, &directory_layer)?;
        directory_layer.exists(trx, &sub_path).await
    }

    async fn move_directory(
        &self,
        trx: &Transaction,
        new_path: &Path,
    ) -> Result<DirectoryOutput, DirectoryError> {
        self.inner
            .directory_subspace
            .ensure_current(trx, "move")
            .await?;
        let directory_layer = self.get_directory_layer_for_path(&Path::new());

        let new_relative = match new_path.relative_to(directory_layer.path()) {
            Some(relative) => relative,
            None => {
                return Err(DirectoryError::new(
                    "move",
                    new_path.clone(),
                    crate::directory::error::DirectoryErrorKind::CannotMoveBetweenPartitions,
                ))
            }
        };
        let old_relative = self
            .inner
            .directory_subspace
            .path()
            .relative_to(directory_layer.path())
            .expect("partition path lies below its layer");

        directory_layer
            .move_to(trx, &old_relative, &new_relative)
            .await
    }

    async fn move_to(
        &self,
        trx: &Transaction,
        old_path: &Path,
        new_path: &Path,
    ) -> Result<DirectoryOutput, DirectoryError> {
        self.inner
            .directory_subspace
            .move_to(trx, old_path, new_path)
            .await
    }

    async fn remove(&self, trx: &Transaction, path: &Path) -> Result<bool, DirectoryError> {
        self.inner
            .directory_subspace
            .ensure_current(trx, "remove")
            .await?;
        let directory_layer = self.get_directory_layer_for_path(path);
        let sub_path = self.partition_subpath("remove", path, &directory_layer)?;
        directory_layer.remove(trx, &sub_path).await
    }

    async fn list(&self, trx: &Transaction, path: &Path) -> Result<Vec<String>, DirectoryError> {
        self.inner.directory_subspace.list(trx, path).await
    }

    async fn change_layer(
        &self,
        trx: &Transaction,
        path: &Path,
        new_layer: &str,
    ) -> Result<DirectoryOutput, DirectoryError> {
        self.inner
            .directory_subspace
            .ensure_current(trx, "change_layer")
            .await?;
        let directory_layer = self.get_directory_layer_for_path(path);
        let sub_path = self.partition_subpath("change_layer", path, &directory_layer)?;
        directory_layer.change_layer(trx, &sub_path, new_layer).await
    }
}
