// Copyright 2025 dirspace developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The subspace handle a resolved directory yields.

use crate::directory::cache::ChainLink;
use crate::directory::directory_layer::DirectoryLayer;
use crate::directory::error::{DirectoryError, DirectoryErrorKind};
use crate::directory::node::decode_counter;
use crate::directory::{Directory, DirectoryOutput};
use crate::path::Path;
use crate::store::Transaction;
use crate::tuple::{PackResult, Subspace, TuplePack, TupleUnpack};
use async_trait::async_trait;

/// A `DirectorySubspace` represents the content of a directory, and it also
/// remembers the path it was opened with, offering convenience methods to
/// operate on the directory at that path.
///
/// The handle is an immutable value: it captures the directory tree state it
/// was resolved under (its validation chain). When an ancestor of the
/// directory is moved, relayered or removed, the handle turns stale and
/// further directory operations through it fail with `StaleHandle`;
/// [`is_valid`](DirectorySubspace::is_valid) tells the two states apart.
#[derive(Debug, Clone)]
pub struct DirectorySubspace {
    pub(crate) directory_layer: DirectoryLayer,
    subspace: Subspace,
    path: Path,
    layer: String,
    chain: Vec<ChainLink>,
    /// Id of the transaction the handle was resolved in. Inside that
    /// transaction the resolution is consistent by construction; any other
    /// transaction re-validates the chain first.
    txn: u64,
}

impl DirectorySubspace {
    pub(crate) fn new(
        path: Path,
        prefix: Vec<u8>,
        directory_layer: &DirectoryLayer,
        layer: String,
        chain: Vec<ChainLink>,
        txn: u64,
    ) -> Self {
        DirectorySubspace {
            directory_layer: directory_layer.clone(),
            subspace: Subspace::from_bytes(&prefix),
            path,
            layer,
            chain,
            txn,
        }
    }

    /// Returns the subspace extending this directory's prefix with a packed
    /// tuple.
    pub fn subspace<T: TuplePack>(&self, t: &T) -> Subspace {
        self.subspace.subspace(t)
    }

    /// The directory's prefix.
    pub fn bytes(&self) -> &[u8] {
        self.subspace.bytes()
    }

    pub fn pack<T: TuplePack>(&self, t: &T) -> Vec<u8> {
        self.subspace.pack(t)
    }

    pub fn unpack<'de, T: TupleUnpack<'de>>(&self, key: &'de [u8]) -> PackResult<T> {
        self.subspace.unpack(key)
    }

    pub fn range(&self) -> (Vec<u8>, Vec<u8>) {
        self.subspace.range()
    }

    /// The absolute path this directory was resolved at.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The directory's layer id.
    pub fn layer(&self) -> &str {
        &self.layer
    }

    pub fn is_start_of(&self, key: &[u8]) -> bool {
        self.subspace.is_start_of(key)
    }

    /// Re-reads the stamps captured at resolution and reports whether they
    /// all still hold. A `false` means the path this handle was resolved at
    /// no longer names the same directory.
    pub async fn is_valid(&self, trx: &Transaction) -> Result<bool, DirectoryError> {
        for link in &self.chain {
            let value = trx.get(&link.key, false).await.map_err(|err| {
                DirectoryError::new("validate", self.path.clone(), DirectoryErrorKind::Kv(err))
            })?;
            match value {
                None => return Ok(false),
                Some(value) => {
                    if decode_counter(Some(&value)) != link.stamp {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    /// Handles may travel between transactions; one resolved elsewhere must
    /// prove its resolution still holds before it is used.
    pub(crate) async fn ensure_current(
        &self,
        trx: &Transaction,
        op: &'static str,
    ) -> Result<(), DirectoryError> {
        if trx.id() == self.txn {
            return Ok(());
        }
        if self.is_valid(trx).await? {
            Ok(())
        } else {
            Err(DirectoryError::new(
                op,
                self.path.clone(),
                DirectoryErrorKind::StaleHandle,
            ))
        }
    }

    fn get_directory_layer_for_path(&self, _path: &Path) -> DirectoryLayer {
        self.directory_layer.clone()
    }

    /// Maps a caller-facing path onto a path relative to `directory_layer`,
    /// by way of this directory's own path.
    fn partition_subpath(
        &self,
        op: &'static str,
        path: &Path,
        directory_layer: Option<&DirectoryLayer>,
    ) -> Result<Path, DirectoryError> {
        let layer = directory_layer.unwrap_or(&self.directory_layer);
        let base = self
            .path
            .relative_to(layer.path())
            .expect("handle path lies below its layer");
        let relative = if path.is_absolute() {
            match path.relative_to(&self.path) {
                Some(relative) => relative,
                None => {
                    return Err(DirectoryError::new(
                        op,
                        path.clone(),
                        DirectoryErrorKind::OutsideDirectory,
                    ))
                }
            }
        } else {
            path.clone()
        };
        base.join(&relative).map_err(|err| {
            DirectoryError::new(op, path.clone(), DirectoryErrorKind::InvalidPath(err))
        })
    }
}

#[async_trait]
impl Directory for DirectorySubspace {
    async fn create_or_open(
        &self,
        trx: &Transaction,
        path: &Path,
        layer: Option<&str>,
    ) -> Result<DirectoryOutput, DirectoryError> {
        self.ensure_current(trx, "create_or_open").await?;
        let sub_path = self.partition_subpath("create_or_open", path, None)?;
        self.directory_layer
            .create_or_open(trx, &sub_path, layer)
            .await
    }

    async fn create(
        &self,
        trx: &Transaction,
        path: &Path,
        layer: Option<&str>,
    ) -> Result<DirectoryOutput, DirectoryError> {
        self.ensure_current(trx, "create").await?;
        let sub_path = self.partition_subpath("create", path, None)?;
        self.directory_layer.create(trx, &sub_path, layer).await
    }

    async fn open(
        &self,
        trx: &Transaction,
        path: &Path,
        layer: Option<&str>,
    ) -> Result<DirectoryOutput, DirectoryError> {
        self.ensure_current(trx, "open").await?;
        let sub_path = self.partition_subpath("open", path, None)?;
        self.directory_layer.open(trx, &sub_path, layer).await
    }

    async fn register(
        &self,
        trx: &Transaction,
        path: &Path,
        layer: Option<&str>,
        prefix: &[u8],
    ) -> Result<DirectoryOutput, DirectoryError> {
        self.ensure_current(trx, "register").await?;
        let sub_path = self.partition_subpath("register", path, None)?;
        self.directory_layer
            .register(trx, &sub_path, layer, prefix)
            .await
    }

    async fn exists(&self, trx: &Transaction, path: &Path) -> Result<bool, DirectoryError> {
        self.ensure_current(trx, "exists").await?;
        let directory_layer = self.get_directory_layer_for_path(path);
        let sub_path = self.partition_subpath("exists", path, Some(&directory_layer))?;
        directory_layer.exists(trx, &sub_path).await
    }

    async fn move_directory(
        &self,
        trx: &Transaction,
        new_path: &Path,
    ) -> Result<DirectoryOutput, DirectoryError> {
        self.ensure_current(trx, "move").await?;
        let directory_layer = self.get_directory_layer_for_path(&Path::new());

        let new_relative = match new_path.relative_to(directory_layer.path()) {
            Some(relative) => relative,
            None => {
                return Err(DirectoryError::new(
                    "move",
                    new_path.clone(),
                    DirectoryErrorKind::CannotMoveBetweenPartitions,
                ))
            }
        };
        let old_relative = self
            .path
            .relative_to(directory_layer.path())
            .expect("handle path lies below its layer");

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
        self.ensure_current(trx, "move").await?;
        let old_sub = self.partition_subpath("move", old_path, None)?;
        let new_sub = self.partition_subpath("move", new_path, None)?;
        self.directory_layer.move_to(trx, &old_sub, &new_sub).await
    }

    async fn remove(&self, trx: &Transaction, path: &Path) -> Result<bool, DirectoryError> {
        self.ensure_current(trx, "remove").await?;
        let directory_layer = self.get_directory_layer_for_path(path);
        let sub_path = self.partition_subpath("remove", path, Some(&directory_layer))?;
        directory_layer.remove(trx, &sub_path).await
    }

    async fn list(&self, trx: &Transaction, path: &Path) -> Result<Vec<String>, DirectoryError> {
        self.ensure_current(trx, "list").await?;
        let sub_path = self.partition_subpath("list", path, None)?;
        self.directory_layer.list(trx, &sub_path).await
    }

    async fn change_layer(
        &self,
        trx: &Transaction,
        path: &Path,
        new_layer: &str,
    ) -> Result<DirectoryOutput, DirectoryError> {
        self.ensure_current(trx, "change_layer").await?;
        let sub_path = self.partition_subpath("change_layer", path, None)?;
        self.directory_layer
            .change_layer(trx, &sub_path, new_layer)
            .await
    }
}
