// Copyright 2025 dirspace developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The default `Directory` implementation.

use crate::directory::cache::{CachedNode, ChainLink};
use crate::directory::directory_partition::DirectoryPartition;
use crate::directory::directory_subspace::DirectorySubspace;
use crate::directory::error::{DirectoryError, DirectoryErrorKind};
use crate::directory::node::{decode_counter, Node};
use crate::directory::{strinc, Directory, DirectoryOutput};
use crate::path::Path;
use crate::store::{RangeOption, Transaction};
use crate::tuple::hca::{HighContentionAllocator, WindowSchedule};
use crate::tuple::{Bytes, Element, Subspace};

use async_recursion::async_recursion;
use async_trait::async_trait;
use byteorder::{LittleEndian, WriteBytesExt};
use log::debug;

use std::ops::Deref;
use std::sync::Arc;

const MAJOR_VERSION: u32 = 1;
const MINOR_VERSION: u32 = 0;
const PATCH_VERSION: u32 = 0;

pub(crate) const DEFAULT_NODE_PREFIX: &[u8] = b"\xFE";
pub(crate) const PARTITION_LAYER: &str = "partition";

/// Child index entries: `node | ("child", name)` holds the child's prefix.
pub(crate) const CHILD_KEY: &str = "child";
/// `node | "layer"` holds the node's layer id.
pub(crate) const LAYER_KEY: &str = "layer";
/// `node | "stamp"` holds the node's resolution stamp.
pub(crate) const STAMP_KEY: &str = "stamp";
/// `root | "version"` is the metadata version register of the layer.
const VERSION_KEY: &str = "version";
/// `root | "format"` carries the on-disk format version triple.
const FORMAT_KEY: &str = "format";
const HCA_KEY: &str = "hca";

/// A `DirectoryLayer` defines a root for a directory tree.
///
/// The node subspace and content subspace control where the directory
/// metadata and contents, respectively, are stored. The default root
/// directory stores metadata in keys beginning with `\xFE` and allocates
/// content prefixes in the rest of the keyspace. This is appropriate for an
/// otherwise empty database; if the database holds other data, construct a
/// layer with non-overlapping subspaces instead.
#[derive(Clone)]
pub struct DirectoryLayer {
    pub(crate) inner: Arc<DirectoryLayerInner>,
}

impl std::fmt::Debug for DirectoryLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

#[derive(Debug)]
pub struct DirectoryLayerInner {
    pub(crate) root_node: Subspace,
    pub(crate) node_subspace: Subspace,
    pub(crate) content_subspace: Subspace,
    pub(crate) allocator: HighContentionAllocator,
    pub(crate) allow_manual_prefixes: bool,

    /// Absolute path of this layer's root; empty for the top-level layer,
    /// the partition's path for nested layers.
    pub(crate) path: Path,
    /// Ancestor stamps of the partition this layer is nested in, prepended
    /// to every chain resolved here.
    pub(crate) base_chain: Vec<ChainLink>,
}

impl Deref for DirectoryLayer {
    type Target = DirectoryLayerInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl Default for DirectoryLayer {
    fn default() -> Self {
        Self::new(
            Subspace::from_bytes(DEFAULT_NODE_PREFIX),
            Subspace::all(),
            false,
        )
    }
}

impl DirectoryLayer {
    pub fn new(
        node_subspace: Subspace,
        content_subspace: Subspace,
        allow_manual_prefixes: bool,
    ) -> Self {
        Self::with_schedule(
            node_subspace,
            content_subspace,
            allow_manual_prefixes,
            WindowSchedule::default(),
        )
    }

    /// A directory layer with an explicit allocator window schedule.
    pub fn with_schedule(
        node_subspace: Subspace,
        content_subspace: Subspace,
        allow_manual_prefixes: bool,
        schedule: WindowSchedule,
    ) -> Self {
        Self::build(
            node_subspace,
            content_subspace,
            allow_manual_prefixes,
            schedule,
            Path::root(),
            Vec::new(),
        )
    }

    pub(crate) fn new_nested(
        node_subspace: Subspace,
        content_subspace: Subspace,
        path: Path,
        base_chain: Vec<ChainLink>,
    ) -> Self {
        Self::build(
            node_subspace,
            content_subspace,
            false,
            WindowSchedule::default(),
            path,
            base_chain,
        )
    }

    fn build(
        node_subspace: Subspace,
        content_subspace: Subspace,
        allow_manual_prefixes: bool,
        schedule: WindowSchedule,
        path: Path,
        base_chain: Vec<ChainLink>,
    ) -> Self {
        let root_node = node_subspace.subspace(&Bytes::from(node_subspace.bytes()));

        DirectoryLayer {
            inner: Arc::new(DirectoryLayerInner {
                root_node: root_node.clone(),
                node_subspace,
                content_subspace,
                allocator: HighContentionAllocator::with_schedule(
                    root_node.subspace(&HCA_KEY),
                    schedule,
                ),
                allow_manual_prefixes,
                path,
                base_chain,
            }),
        }
    }

    /// The absolute path of this layer's root.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    fn err(&self, op: &'static str, path: &Path, kind: DirectoryErrorKind) -> DirectoryError {
        let absolute = if path.is_absolute() {
            path.clone()
        } else {
            self.to_absolute_path(path)
        };
        DirectoryError::new(op, absolute, kind)
    }

    pub(crate) fn to_absolute_path(&self, sub_path: &Path) -> Path {
        self.inner
            .path
            .join(sub_path)
            .expect("layer sub-paths are relative")
    }

    /// Maps a caller-facing path onto a path relative to this layer's root.
    fn to_relative(&self, op: &'static str, path: &Path) -> Result<Path, DirectoryError> {
        if !path.is_absolute() {
            return Ok(path.clone());
        }
        match path.relative_to(&self.inner.path) {
            Some(relative) => Ok(relative),
            None => Err(DirectoryError::new(
                op,
                path.clone(),
                DirectoryErrorKind::OutsideDirectory,
            )),
        }
    }

    fn node_with_prefix(&self, prefix: &[u8]) -> Subspace {
        self.inner.node_subspace.subspace(&Bytes::from(prefix))
    }

    fn node_with_optional_prefix(&self, prefix: Option<Vec<u8>>) -> Option<Subspace> {
        prefix.map(|prefix| self.node_with_prefix(&prefix))
    }

    fn version_key(&self) -> Vec<u8> {
        self.inner.root_node.pack(&VERSION_KEY)
    }

    fn format_key(&self) -> Vec<u8> {
        self.inner.root_node.pack(&FORMAT_KEY)
    }

    /// Cache key of this layer: the escaped text of its root path.
    fn layer_cache_key(&self) -> String {
        self.inner.path.to_string()
    }

    /// Reads the metadata version register. The read is not a snapshot read,
    /// which makes it the conflict guard for every cached resolution: any
    /// concurrent mutation of this layer bumps the register and forces the
    /// reader to retry.
    async fn read_register(
        &self,
        trx: &Transaction,
        op: &'static str,
        path: &Path,
    ) -> Result<u64, DirectoryError> {
        let value = trx
            .get(&self.version_key(), false)
            .await
            .map_err(|err| self.err(op, path, DirectoryErrorKind::Kv(err)))?;
        Ok(decode_counter(value.as_deref()))
    }

    fn bump_version(&self, trx: &Transaction) {
        trx.atomic_add(&self.version_key(), 1);
    }

    fn invalidate_cache(&self, trx: &Transaction, path: &Path) {
        let db = trx.database();
        db.resolution_cache()
            .invalidate(&self.to_absolute_path(path).to_string());
    }

    /// Walks `path` from this layer's root, collecting metadata and stamps.
    /// The walk stops early at a missing node or at a partition boundary.
    async fn find(
        &self,
        trx: &Transaction,
        op: &'static str,
        path: Path,
    ) -> Result<Node, DirectoryError> {
        // paths with interior layer tags need the full walk to assert them
        let cacheable = !path.is_empty() && !path.has_interior_layer_tags();
        let mut observed_register = None;
        if cacheable {
            if let Some(node) = self.cached_resolution(trx, op, &path).await? {
                return Ok(node);
            }
            // the register is observed before any node read, so an entry
            // installed under it can never be newer than its tag
            observed_register = Some(self.read_register(trx, op, &path).await?);
            if let Some(node) = self
                .cached_db_resolution(trx, op, &path, observed_register.expect("just set"))
                .await?
            {
                return Ok(node);
            }
        }

        let mut node = Node {
            subspace: Some(self.root_node.clone()),
            current_path: Path::new(),
            target_path: path.clone(),
            layer: String::new(),
            stamp: 0,
            loaded_metadata: false,
            chain: self.base_chain.clone(),
            directory_layer: self.clone(),
        };

        for index in 0..path.len() {
            let segment = path.get(index).expect("segment within bounds").clone();
            node.current_path.push(segment.clone());
            let node_subspace = match node.subspace {
                // on the first iteration this is the root node; later ones
                // only run when the previous node existed
                None => unreachable!("node subspace is not set"),
                Some(s) => s,
            };
            let key = node_subspace.pack(&(CHILD_KEY, segment.name()));

            let value = trx
                .get(&key, false)
                .await
                .map_err(|err| self.err(op, &path, DirectoryErrorKind::Kv(err)))?;

            node = Node {
                subspace: self.node_with_optional_prefix(value),
                current_path: node.current_path,
                target_path: path.clone(),
                layer: String::new(),
                stamp: 0,
                loaded_metadata: false,
                chain: node.chain,
                directory_layer: self.clone(),
            };

            node.load_metadata(trx).await?;

            if node.exists() && segment.has_layer() && segment.layer() != node.layer {
                return Err(self.err(
                    op,
                    &path,
                    DirectoryErrorKind::IncompatibleLayer {
                        stored: node.layer.clone(),
                        requested: segment.layer().to_string(),
                    },
                ));
            }

            if !node.exists() || node.layer == PARTITION_LAYER {
                return Ok(node);
            }
        }

        if !node.loaded_metadata {
            node.load_metadata(trx).await?;
        }

        if cacheable {
            self.install_cache(trx, &node, observed_register);
        }

        Ok(node)
    }

    /// Serves a resolution from the transaction-scoped cache.
    async fn cached_resolution(
        &self,
        trx: &Transaction,
        op: &'static str,
        path: &Path,
    ) -> Result<Option<Node>, DirectoryError> {
        let db = trx.database();
        let path_key = self.to_absolute_path(path).to_string();
        match db.resolution_cache().get_txn(trx.id(), &path_key) {
            Some(entry) => self.node_from_entry(op, path, entry).map(Some),
            None => Ok(None),
        }
    }

    /// Serves a resolution from the database-scoped cache, under a register
    /// value the caller just read.
    async fn cached_db_resolution(
        &self,
        trx: &Transaction,
        op: &'static str,
        path: &Path,
        register: u64,
    ) -> Result<Option<Node>, DirectoryError> {
        let db = trx.database();
        let cache = db.resolution_cache();
        let path_key = self.to_absolute_path(path).to_string();
        match cache.get_db(&self.layer_cache_key(), &path_key, register) {
            Some(entry) => {
                cache.install_txn(trx.id(), path_key, entry.clone());
                self.node_from_entry(op, path, entry).map(Some)
            }
            None => Ok(None),
        }
    }

    fn node_from_entry(
        &self,
        op: &'static str,
        path: &Path,
        entry: CachedNode,
    ) -> Result<Node, DirectoryError> {
        // the walk would have asserted the final segment's tag
        if let Some(last) = path.last() {
            if last.has_layer() && last.layer() != entry.layer {
                return Err(self.err(
                    op,
                    path,
                    DirectoryErrorKind::IncompatibleLayer {
                        stored: entry.layer.clone(),
                        requested: last.layer().to_string(),
                    },
                ));
            }
        }

        let stamp = entry.chain.last().map(|link| link.stamp).unwrap_or(0);
        Ok(Node {
            subspace: Some(self.node_with_prefix(&entry.prefix)),
            current_path: path.clone(),
            target_path: path.clone(),
            layer: entry.layer,
            stamp,
            loaded_metadata: true,
            chain: entry.chain,
            directory_layer: self.clone(),
        })
    }

    /// Installs a fully resolved node into the caches. The database scope
    /// only accepts resolutions from transactions without buffered writes,
    /// tagged with a register value observed before the walk, so state that
    /// might be rolled back or superseded never serves a newer reader.
    fn install_cache(&self, trx: &Transaction, node: &Node, register: Option<u64>) {
        if !node.exists() || node.current_path.is_empty() {
            return;
        }
        let subspace = node.subspace.as_ref().expect("node exists");
        let prefix: Bytes = match self.node_subspace.unpack(subspace.bytes()) {
            Ok(prefix) => prefix,
            Err(_) => return,
        };
        let entry = CachedNode {
            prefix: prefix.into_owned(),
            layer: node.layer.clone(),
            chain: node.chain.clone(),
        };
        let path_key = self.to_absolute_path(&node.current_path).to_string();
        let db = trx.database();
        let cache = db.resolution_cache();
        cache.install_txn(trx.id(), path_key.clone(), entry.clone());
        if let Some(register) = register {
            if !trx.has_writes() {
                cache.install_db(&self.layer_cache_key(), path_key, register, entry);
            }
        }
    }

    pub(crate) fn contents_of_node(
        &self,
        node: Subspace,
        path: Path,
        layer: String,
        chain: Vec<ChainLink>,
        trx: &Transaction,
    ) -> Result<DirectoryOutput, DirectoryError> {
        let prefix: Bytes = self
            .node_subspace
            .unpack(node.bytes())
            .map_err(|err| self.err("resolve", &path, DirectoryErrorKind::Pack(err)))?;
        let prefix = prefix.into_owned();

        if layer == PARTITION_LAYER {
            Ok(DirectoryOutput::Partition(DirectoryPartition::new(
                self.to_absolute_path(&path),
                prefix,
                self.clone(),
                chain,
                trx.id(),
            )))
        } else {
            Ok(DirectoryOutput::Subspace(DirectorySubspace::new(
                self.to_absolute_path(&path),
                prefix,
                self,
                layer,
                chain,
                trx.id(),
            )))
        }
    }

    /// The shared open-and/or-create walk behind `create_or_open`, `create`,
    /// `open` and `register`.
    #[async_recursion]
    pub(crate) async fn create_or_open_internal(
        &self,
        trx: &Transaction,
        op: &'static str,
        path: Path,
        prefix: Option<Vec<u8>>,
        layer: Option<String>,
        allow_create: bool,
        allow_open: bool,
    ) -> Result<DirectoryOutput, DirectoryError> {
        self.check_version(trx, op, &path, allow_create).await?;

        if prefix.is_some() && !self.allow_manual_prefixes {
            return Err(self.err(op, &path, DirectoryErrorKind::PrefixNotAllowed));
        }

        path.check_segments()
            .map_err(|err| self.err(op, &path, DirectoryErrorKind::InvalidPath(err)))?;
        if path.is_empty() {
            return Err(self.err(op, &path, DirectoryErrorKind::NoPathProvided));
        }

        let node = self.find(trx, op, path.clone()).await?;

        if node.exists() {
            if node.is_in_partition(false) {
                let sub_path = node.partition_subpath();
                match node.get_contents(trx)? {
                    DirectoryOutput::Subspace(_) => unreachable!("already in partition"),
                    DirectoryOutput::Partition(partition) => {
                        partition
                            .nested_layer()
                            .create_or_open_internal(
                                trx,
                                op,
                                sub_path,
                                prefix,
                                layer,
                                allow_create,
                                allow_open,
                            )
                            .await
                    }
                }
            } else {
                self.open_internal(trx, op, layer, &node, allow_open)
            }
        } else {
            self.create_internal(trx, op, path, layer, prefix, allow_create, node.chain)
                .await
        }
    }

    fn open_internal(
        &self,
        trx: &Transaction,
        op: &'static str,
        layer: Option<String>,
        node: &Node,
        allow_open: bool,
    ) -> Result<DirectoryOutput, DirectoryError> {
        if !allow_open {
            return Err(self.err(op, &node.current_path, DirectoryErrorKind::AlreadyExists));
        }

        if let Some(layer) = layer {
            // an empty requested layer matches anything
            if !layer.is_empty() && layer != node.layer {
                return Err(self.err(
                    op,
                    &node.current_path,
                    DirectoryErrorKind::IncompatibleLayer {
                        stored: node.layer.clone(),
                        requested: layer,
                    },
                ));
            }
        }

        node.get_contents(trx)
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_internal(
        &self,
        trx: &Transaction,
        op: &'static str,
        path: Path,
        layer: Option<String>,
        prefix: Option<Vec<u8>>,
        allow_create: bool,
        mut chain: Vec<ChainLink>,
    ) -> Result<DirectoryOutput, DirectoryError> {
        if !allow_create {
            return Err(self.err(op, &path, DirectoryErrorKind::NotFound));
        }

        // the explicit layer argument and the final segment's tag must agree
        let tag = path
            .last()
            .map(|segment| segment.layer().to_string())
            .unwrap_or_default();
        let layer = match layer {
            Some(layer) if !layer.is_empty() => {
                if !tag.is_empty() && tag != layer {
                    return Err(self.err(
                        op,
                        &path,
                        DirectoryErrorKind::IncompatibleLayer {
                            stored: tag,
                            requested: layer,
                        },
                    ));
                }
                layer
            }
            _ => tag,
        };

        self.check_version(trx, op, &path, true).await?;
        let new_prefix = self.get_prefix(trx, op, &path, prefix.clone()).await?;

        let is_free = self
            .is_prefix_free(trx, op, &path, &new_prefix, prefix.is_none())
            .await?;
        if !is_free {
            return Err(self.err(op, &path, DirectoryErrorKind::PrefixInUse));
        }

        let parent_node = self.get_parent_node(trx, op, &path).await?;
        let node = self.node_with_prefix(&new_prefix);

        let name = path.last().expect("path is nonempty").name();
        trx.set(&parent_node.pack(&(CHILD_KEY, name)), &new_prefix);
        trx.set(&node.pack(&LAYER_KEY), layer.as_bytes());
        let stamp_key = node.pack(&STAMP_KEY);
        trx.set(&stamp_key, &1u64.to_le_bytes());
        self.bump_version(trx);
        self.invalidate_cache(trx, &path);
        debug!(
            "created directory {} with prefix {:?}",
            self.to_absolute_path(&path),
            Bytes::from(new_prefix.as_slice())
        );

        chain.push(ChainLink {
            key: stamp_key,
            stamp: 1,
        });
        self.contents_of_node(node, path, layer, chain, trx)
    }

    async fn get_parent_node(
        &self,
        trx: &Transaction,
        op: &'static str,
        path: &Path,
    ) -> Result<Subspace, DirectoryError> {
        match path.parent() {
            Some(parent) if !parent.is_empty() => {
                let output = self
                    .create_or_open_internal(trx, op, parent, None, None, true, true)
                    .await?;
                Ok(self.node_with_prefix(output.bytes()))
            }
            _ => Ok(self.root_node.clone()),
        }
    }

    async fn is_prefix_free(
        &self,
        trx: &Transaction,
        op: &'static str,
        path: &Path,
        prefix: &[u8],
        snapshot: bool,
    ) -> Result<bool, DirectoryError> {
        if prefix.is_empty() {
            return Ok(false);
        }

        if self
            .node_containing_key(trx, op, path, prefix, snapshot)
            .await?
            .is_some()
        {
            return Ok(false);
        }

        let range = RangeOption {
            begin: self.node_subspace.pack(&Bytes::from(prefix)),
            end: self
                .node_subspace
                .pack(&Bytes::from(strinc(prefix.to_vec()))),
            limit: Some(1),
            reverse: false,
        };
        let result = trx
            .get_range(&range, snapshot)
            .await
            .map_err(|err| self.err(op, path, DirectoryErrorKind::Kv(err)))?;

        Ok(result.is_empty())
    }

    /// The live node, if any, whose prefix contains `key`.
    async fn node_containing_key(
        &self,
        trx: &Transaction,
        op: &'static str,
        path: &Path,
        key: &[u8],
        snapshot: bool,
    ) -> Result<Option<Subspace>, DirectoryError> {
        // keys inside the metadata space belong to the layer itself
        if key.starts_with(self.node_subspace.bytes()) {
            return Ok(Some(self.root_node.clone()));
        }

        let mut key_after = key.to_vec();
        key_after.push(0x00);
        let range = RangeOption {
            begin: self.node_subspace.range().0,
            end: self.node_subspace.pack(&Bytes::from(key_after.as_slice())),
            limit: Some(1),
            reverse: true,
        };

        let values = trx
            .get_range(&range, snapshot)
            .await
            .map_err(|err| self.err(op, path, DirectoryErrorKind::Kv(err)))?;

        if let Some(value) = values.first() {
            let elements: Vec<Element> = self
                .node_subspace
                .unpack(value.key())
                .map_err(|err| self.err(op, path, DirectoryErrorKind::Pack(err)))?;
            if let Some(previous) = elements.first().and_then(Element::as_bytes) {
                if key.starts_with(previous) {
                    return Ok(Some(self.node_with_prefix(previous)));
                }
            }
        }
        Ok(None)
    }

    async fn get_prefix(
        &self,
        trx: &Transaction,
        op: &'static str,
        path: &Path,
        prefix: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, DirectoryError> {
        match prefix {
            None => {
                // no prefix provided, allocating one
                let allocated = self
                    .allocator
                    .allocate(trx)
                    .await
                    .map_err(|err| self.err(op, path, DirectoryErrorKind::Hca(err)))?;
                let subspace = self.content_subspace.subspace(&allocated);

                let range = RangeOption {
                    limit: Some(1),
                    ..RangeOption::from(&subspace)
                };
                let result = trx
                    .get_range(&range, false)
                    .await
                    .map_err(|err| self.err(op, path, DirectoryErrorKind::Kv(err)))?;
                if !result.is_empty() {
                    return Err(self.err(op, path, DirectoryErrorKind::PrefixNotEmpty));
                }

                Ok(subspace.bytes().to_vec())
            }
            Some(prefix) => Ok(prefix),
        }
    }

    /// Checks the on-disk format version, initializing it on first mutation.
    async fn check_version(
        &self,
        trx: &Transaction,
        op: &'static str,
        path: &Path,
        allow_creation: bool,
    ) -> Result<(), DirectoryError> {
        let value = trx
            .get(&self.format_key(), false)
            .await
            .map_err(|err| self.err(op, path, DirectoryErrorKind::Kv(err)))?;

        match value {
            None => {
                if allow_creation {
                    self.initialize_directory(trx);
                }
                Ok(())
            }
            Some(value) => {
                if value.len() < 12 {
                    return Err(self.err(
                        op,
                        path,
                        DirectoryErrorKind::Format("incorrect format version length".to_string()),
                    ));
                }
                let mut arr = [0u8; 4];
                arr.copy_from_slice(&value[0..4]);
                let major = u32::from_le_bytes(arr);
                arr.copy_from_slice(&value[4..8]);
                let minor = u32::from_le_bytes(arr);
                arr.copy_from_slice(&value[8..12]);
                let patch = u32::from_le_bytes(arr);

                if major > MAJOR_VERSION {
                    let msg = format!(
                        "cannot load directory tree with format {}.{}.{} using layer {}.{}.{}",
                        major, minor, patch, MAJOR_VERSION, MINOR_VERSION, PATCH_VERSION
                    );
                    return Err(self.err(op, path, DirectoryErrorKind::Format(msg)));
                }

                if minor > MINOR_VERSION && allow_creation {
                    let msg = format!(
                        "directory tree with format {}.{}.{} is read-only when opened with layer {}.{}.{}",
                        major, minor, patch, MAJOR_VERSION, MINOR_VERSION, PATCH_VERSION
                    );
                    return Err(self.err(op, path, DirectoryErrorKind::Format(msg)));
                }

                Ok(())
            }
        }
    }

    fn initialize_directory(&self, trx: &Transaction) {
        let mut value = Vec::with_capacity(12);
        value
            .write_u32::<LittleEndian>(MAJOR_VERSION)
            .expect("writing to a vec cannot fail");
        value
            .write_u32::<LittleEndian>(MINOR_VERSION)
            .expect("writing to a vec cannot fail");
        value
            .write_u32::<LittleEndian>(PATCH_VERSION)
            .expect("writing to a vec cannot fail");
        trx.set(&self.format_key(), &value);
    }

    #[async_recursion]
    async fn exists_internal(
        &self,
        trx: &Transaction,
        op: &'static str,
        path: Path,
    ) -> Result<bool, DirectoryError> {
        self.check_version(trx, op, &path, false).await?;
        path.check_segments()
            .map_err(|err| self.err(op, &path, DirectoryErrorKind::InvalidPath(err)))?;

        let node = self.find(trx, op, path.clone()).await?;

        if !node.exists() {
            return Ok(false);
        }

        if node.is_in_partition(false) {
            return match node.get_contents(trx)? {
                DirectoryOutput::Subspace(_) => unreachable!("already in partition"),
                DirectoryOutput::Partition(partition) => {
                    partition
                        .nested_layer()
                        .exists_internal(trx, op, node.partition_subpath())
                        .await
                }
            };
        }

        Ok(true)
    }

    #[async_recursion]
    async fn list_internal(
        &self,
        trx: &Transaction,
        op: &'static str,
        path: Path,
    ) -> Result<Vec<String>, DirectoryError> {
        self.check_version(trx, op, &path, false).await?;
        path.check_segments()
            .map_err(|err| self.err(op, &path, DirectoryErrorKind::InvalidPath(err)))?;

        let node = self.find(trx, op, path.clone()).await?;
        if !node.exists() {
            return Err(self.err(op, &path, DirectoryErrorKind::NotFound));
        }
        if node.is_in_partition(true) {
            return match node.get_contents(trx)? {
                DirectoryOutput::Subspace(_) => unreachable!("already in partition"),
                DirectoryOutput::Partition(partition) => {
                    partition
                        .nested_layer()
                        .list_internal(trx, op, node.partition_subpath())
                        .await
                }
            };
        }

        node.list_children(trx).await
    }

    #[async_recursion]
    pub(crate) async fn move_to_internal(
        &self,
        trx: &Transaction,
        op: &'static str,
        old_path: Path,
        new_path: Path,
    ) -> Result<DirectoryOutput, DirectoryError> {
        self.check_version(trx, op, &old_path, true).await?;
        old_path
            .check_segments()
            .map_err(|err| self.err(op, &old_path, DirectoryErrorKind::InvalidPath(err)))?;
        new_path
            .check_segments()
            .map_err(|err| self.err(op, &new_path, DirectoryErrorKind::InvalidPath(err)))?;

        if old_path.is_empty() {
            return Err(self.err(op, &old_path, DirectoryErrorKind::CannotMoveRootDirectory));
        }
        if new_path.is_empty() {
            return Err(self.err(op, &new_path, DirectoryErrorKind::AlreadyExists));
        }

        if old_path.names() == new_path.names() {
            // moving a directory onto its own path is a no-op
            let node = self.find(trx, op, old_path.clone()).await?;
            if !node.exists() {
                return Err(self.err(op, &old_path, DirectoryErrorKind::NotFound));
            }
            if node.is_in_partition(false) {
                return match node.get_contents(trx)? {
                    DirectoryOutput::Subspace(_) => unreachable!("already in partition"),
                    DirectoryOutput::Partition(partition) => {
                        partition
                            .nested_layer()
                            .move_to_internal(
                                trx,
                                op,
                                node.partition_subpath(),
                                node.partition_subpath(),
                            )
                            .await
                    }
                };
            }
            return node.get_contents(trx);
        }

        if new_path.starts_with(&old_path) {
            return Err(self.err(
                op,
                &new_path,
                DirectoryErrorKind::CannotMoveBetweenSubdirectories,
            ));
        }

        let old_node = self.find(trx, op, old_path.clone()).await?;
        let new_node = self.find(trx, op, new_path.clone()).await?;

        if !old_node.exists() {
            return Err(self.err(op, &old_path, DirectoryErrorKind::NotFound));
        }

        if old_node.is_in_partition(false) || new_node.is_in_partition(false) {
            if !old_node.is_in_partition(false)
                || !new_node.is_in_partition(false)
                || old_node.current_path.names() != new_node.current_path.names()
            {
                return Err(self.err(
                    op,
                    &new_path,
                    DirectoryErrorKind::CannotMoveBetweenPartitions,
                ));
            }

            // both sides lie in the same partition, move within it
            return match old_node.get_contents(trx)? {
                DirectoryOutput::Subspace(_) => unreachable!("already in partition"),
                DirectoryOutput::Partition(partition) => {
                    partition
                        .nested_layer()
                        .move_to_internal(
                            trx,
                            op,
                            old_node.partition_subpath(),
                            new_node.partition_subpath(),
                        )
                        .await
                }
            };
        }

        if new_node.exists() {
            return Err(self.err(op, &new_path, DirectoryErrorKind::AlreadyExists));
        }

        let parent_path = new_path.parent().expect("new path is nonempty");
        let parent_node = self.find(trx, op, parent_path).await?;
        if !parent_node.exists() {
            return Err(self.err(op, &new_path, DirectoryErrorKind::ParentNotFound));
        }

        let parent_subspace = match parent_node.subspace {
            None => unreachable!("parent node exists"),
            Some(ref subspace) => subspace.clone(),
        };

        let old_subspace = old_node
            .subspace
            .clone()
            .expect("old node exists");
        let prefix: Bytes = self
            .node_subspace
            .unpack(old_subspace.bytes())
            .map_err(|err| self.err(op, &old_path, DirectoryErrorKind::Pack(err)))?;
        let prefix = prefix.into_owned();

        let new_key =
            parent_subspace.pack(&(CHILD_KEY, new_path.last().expect("nonempty").name()));
        trx.set(&new_key, &prefix);

        // the moved node resolves differently from now on; stale every
        // handle that captured it
        trx.atomic_add(&old_subspace.pack(&STAMP_KEY), 1);

        self.remove_from_parent(trx, op, &old_path).await?;
        self.bump_version(trx);
        self.invalidate_cache(trx, &old_path);
        self.invalidate_cache(trx, &new_path);

        let node = self.find(trx, op, new_path).await?;
        node.get_contents(trx)
    }

    async fn remove_from_parent(
        &self,
        trx: &Transaction,
        op: &'static str,
        path: &Path,
    ) -> Result<(), DirectoryError> {
        let parent_path = match path.parent() {
            None => return Err(self.err(op, path, DirectoryErrorKind::NoPathProvided)),
            Some(parent) => parent,
        };
        let last = path.last().expect("path is nonempty");

        let parent_node = self.find(trx, op, parent_path).await?;
        if let Some(subspace) = parent_node.subspace {
            trx.clear(&subspace.pack(&(CHILD_KEY, last.name())));
        }

        Ok(())
    }

    #[async_recursion]
    pub(crate) async fn remove_internal(
        &self,
        trx: &Transaction,
        op: &'static str,
        path: Path,
        fail_on_nonexistent: bool,
    ) -> Result<bool, DirectoryError> {
        self.check_version(trx, op, &path, true).await?;
        path.check_segments()
            .map_err(|err| self.err(op, &path, DirectoryErrorKind::InvalidPath(err)))?;

        if path.is_empty() {
            return Err(self.err(op, &path, DirectoryErrorKind::CannotModifyRootDirectory));
        }

        let node = self.find(trx, op, path.clone()).await?;

        if !node.exists() {
            return if fail_on_nonexistent {
                Err(self.err(op, &path, DirectoryErrorKind::NotFound))
            } else {
                Ok(false)
            };
        }

        if node.is_in_partition(false) {
            return match node.get_contents(trx)? {
                DirectoryOutput::Subspace(_) => unreachable!("already in partition"),
                DirectoryOutput::Partition(partition) => {
                    partition
                        .nested_layer()
                        .remove_internal(trx, op, node.partition_subpath(), fail_on_nonexistent)
                        .await
                }
            };
        }

        self.remove_recursive(trx, op, &path, node.subspace.clone().expect("node exists"))
            .await?;
        self.remove_from_parent(trx, op, &path).await?;
        self.bump_version(trx);
        self.invalidate_cache(trx, &path);

        Ok(true)
    }

    /// Deletes a node's children depth-first, then its content range and its
    /// own metadata rows.
    #[async_recursion]
    async fn remove_recursive(
        &self,
        trx: &Transaction,
        op: &'static str,
        path: &Path,
        node_sub: Subspace,
    ) -> Result<(), DirectoryError> {
        let child_space = node_sub.subspace(&(CHILD_KEY,));
        let (mut begin, end) = child_space.range();

        loop {
            let range = RangeOption {
                begin: begin.clone(),
                end: end.clone(),
                limit: Some(1024),
                reverse: false,
            };
            let values = trx
                .get_range(&range, false)
                .await
                .map_err(|err| self.err(op, path, DirectoryErrorKind::Kv(err)))?;
            let has_more = values.more();

            for value in values.iter() {
                let sub_node = self.node_with_prefix(value.value());
                self.remove_recursive(trx, op, path, sub_node).await?;
                begin = value.key().to_vec();
                begin.push(0x00);
            }

            if !has_more {
                break;
            }
        }

        let prefix: Bytes = self
            .node_subspace
            .unpack(node_sub.bytes())
            .map_err(|err| self.err(op, path, DirectoryErrorKind::Pack(err)))?;
        let prefix = prefix.into_owned();

        trx.clear_range(&prefix, &strinc(prefix.clone()));
        trx.clear_subspace_range(&node_sub);

        Ok(())
    }

    #[async_recursion]
    pub(crate) async fn change_layer_internal(
        &self,
        trx: &Transaction,
        op: &'static str,
        path: Path,
        new_layer: String,
    ) -> Result<DirectoryOutput, DirectoryError> {
        self.check_version(trx, op, &path, true).await?;
        path.check_segments()
            .map_err(|err| self.err(op, &path, DirectoryErrorKind::InvalidPath(err)))?;

        if path.is_empty() {
            return Err(self.err(op, &path, DirectoryErrorKind::CannotModifyRootDirectory));
        }

        let node = self.find(trx, op, path.clone()).await?;
        if !node.exists() {
            return Err(self.err(op, &path, DirectoryErrorKind::NotFound));
        }

        if node.is_in_partition(false) {
            return match node.get_contents(trx)? {
                DirectoryOutput::Subspace(_) => unreachable!("already in partition"),
                DirectoryOutput::Partition(partition) => {
                    partition
                        .nested_layer()
                        .change_layer_internal(trx, op, node.partition_subpath(), new_layer)
                        .await
                }
            };
        }

        // a partition keeps its layer, and a directory cannot become one
        if node.layer == PARTITION_LAYER {
            return Err(self.err(
                op,
                &path,
                DirectoryErrorKind::IncompatibleLayer {
                    stored: PARTITION_LAYER.to_string(),
                    requested: new_layer,
                },
            ));
        }
        if new_layer == PARTITION_LAYER {
            return Err(self.err(
                op,
                &path,
                DirectoryErrorKind::IncompatibleLayer {
                    stored: node.layer.clone(),
                    requested: new_layer,
                },
            ));
        }

        let subspace = node.subspace.as_ref().expect("node exists");
        trx.set(&subspace.pack(&LAYER_KEY), new_layer.as_bytes());
        trx.atomic_add(&subspace.pack(&STAMP_KEY), 1);
        self.bump_version(trx);
        self.invalidate_cache(trx, &path);

        let node = self.find(trx, op, path.clone()).await?;
        node.get_contents(trx)
    }
}

#[async_trait]
impl Directory for DirectoryLayer {
    async fn create_or_open(
        &self,
        trx: &Transaction,
        path: &Path,
        layer: Option<&str>,
    ) -> Result<DirectoryOutput, DirectoryError> {
        let path = self.to_relative("create_or_open", path)?;
        self.create_or_open_internal(
            trx,
            "create_or_open",
            path,
            None,
            layer.map(String::from),
            true,
            true,
        )
        .await
    }

    async fn create(
        &self,
        trx: &Transaction,
        path: &Path,
        layer: Option<&str>,
    ) -> Result<DirectoryOutput, DirectoryError> {
        let path = self.to_relative("create", path)?;
        self.create_or_open_internal(
            trx,
            "create",
            path,
            None,
            layer.map(String::from),
            true,
            false,
        )
        .await
    }

    async fn open(
        &self,
        trx: &Transaction,
        path: &Path,
        layer: Option<&str>,
    ) -> Result<DirectoryOutput, DirectoryError> {
        let path = self.to_relative("open", path)?;
        self.create_or_open_internal(
            trx,
            "open",
            path,
            None,
            layer.map(String::from),
            false,
            true,
        )
        .await
    }

    async fn register(
        &self,
        trx: &Transaction,
        path: &Path,
        layer: Option<&str>,
        prefix: &[u8],
    ) -> Result<DirectoryOutput, DirectoryError> {
        let path = self.to_relative("register", path)?;
        self.create_or_open_internal(
            trx,
            "register",
            path,
            Some(prefix.to_vec()),
            layer.map(String::from),
            true,
            false,
        )
        .await
    }

    async fn exists(&self, trx: &Transaction, path: &Path) -> Result<bool, DirectoryError> {
        let path = self.to_relative("exists", path)?;
        self.exists_internal(trx, "exists", path).await
    }

    async fn move_directory(
        &self,
        _trx: &Transaction,
        new_path: &Path,
    ) -> Result<DirectoryOutput, DirectoryError> {
        Err(self.err(
            "move",
            new_path,
            DirectoryErrorKind::CannotMoveRootDirectory,
        ))
    }

    async fn move_to(
        &self,
        trx: &Transaction,
        old_path: &Path,
        new_path: &Path,
    ) -> Result<DirectoryOutput, DirectoryError> {
        let old_path = self.to_relative("move", old_path)?;
        let new_path = self.to_relative("move", new_path)?;
        self.move_to_internal(trx, "move", old_path, new_path).await
    }

    async fn remove(&self, trx: &Transaction, path: &Path) -> Result<bool, DirectoryError> {
        let path = self.to_relative("remove", path)?;
        self.remove_internal(trx, "remove", path, true).await
    }

    async fn list(&self, trx: &Transaction, path: &Path) -> Result<Vec<String>, DirectoryError> {
        let path = self.to_relative("list", path)?;
        self.list_internal(trx, "list", path).await
    }

    async fn change_layer(
        &self,
        trx: &Transaction,
        path: &Path,
        new_layer: &str,
    ) -> Result<DirectoryOutput, DirectoryError> {
        let path = self.to_relative("change_layer", path)?;
        self.change_layer_internal(trx, "change_layer", path, new_layer.to_string())
            .await
    }
}
