// Copyright 2025 dirspace developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::directory::cache::ChainLink;
use crate::directory::directory_layer::{DirectoryLayer, CHILD_KEY, LAYER_KEY, STAMP_KEY};
use crate::directory::error::{DirectoryError, DirectoryErrorKind};
use crate::directory::DirectoryOutput;
use crate::path::Path;
use crate::store::{RangeOption, Transaction};
use crate::tuple::Subspace;

use futures::future;

/// Reads a little-endian counter value, padding or truncating to 8 bytes.
pub(crate) fn decode_counter(value: Option<&[u8]>) -> u64 {
    let mut arr = [0u8; 8];
    if let Some(value) = value {
        let n = value.len().min(8);
        arr[..n].copy_from_slice(&value[..n]);
    }
    u64::from_le_bytes(arr)
}

/// The state of one path walk step: the node the walked path resolved to so
/// far, its metadata, and the stamps collected along the way.
#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub(crate) subspace: Option<Subspace>,
    pub(crate) current_path: Path,
    pub(crate) target_path: Path,
    pub(crate) layer: String,
    pub(crate) stamp: u64,
    pub(crate) loaded_metadata: bool,
    pub(crate) chain: Vec<ChainLink>,
    pub(crate) directory_layer: DirectoryLayer,
}

impl Node {
    fn err(&self, op: &'static str, kind: DirectoryErrorKind) -> DirectoryError {
        DirectoryError::new(
            op,
            self.directory_layer.to_absolute_path(&self.current_path),
            kind,
        )
    }

    /// `load_metadata` reads the layer id and the stamp of the node, and
    /// extends the validation chain by the node's stamp. The layer root
    /// contributes no chain link; it is covered by the owning partition's
    /// chain, if any.
    pub(crate) async fn load_metadata(&mut self, trx: &Transaction) -> Result<(), DirectoryError> {
        if !self.exists() {
            self.loaded_metadata = true;
            return Ok(());
        }

        let subspace = self.subspace.as_ref().expect("node subspace is set");
        let layer_key = subspace.pack(&LAYER_KEY);
        let stamp_key = subspace.pack(&STAMP_KEY);
        let (layer_value, stamp_value) =
            future::try_join(trx.get(&layer_key, false), trx.get(&stamp_key, false))
                .await
                .map_err(|err| self.err("resolve", DirectoryErrorKind::Kv(err)))?;

        self.layer = match layer_value {
            None => String::new(),
            Some(bytes) => String::from_utf8(bytes).map_err(|_| {
                self.err(
                    "resolve",
                    DirectoryErrorKind::Metadata("layer id is not valid UTF-8".to_string()),
                )
            })?,
        };
        self.stamp = decode_counter(stamp_value.as_deref());
        if !self.current_path.is_empty() {
            self.chain.push(ChainLink {
                key: stamp_key,
                stamp: self.stamp,
            });
        }
        self.loaded_metadata = true;

        Ok(())
    }

    pub(crate) fn is_in_partition(&self, include_empty_subpath: bool) -> bool {
        assert!(self.loaded_metadata);

        self.exists()
            && self.layer == crate::directory::directory_layer::PARTITION_LAYER
            && (include_empty_subpath || self.target_path.len() > self.current_path.len())
    }

    /// The part of the target path below the node, relative to it.
    pub(crate) fn partition_subpath(&self) -> Path {
        self.target_path
            .slice(self.current_path.len()..self.target_path.len())
    }

    pub(crate) fn exists(&self) -> bool {
        self.subspace.is_some()
    }

    /// Lists the names of the node's children, in ascending name order.
    pub(crate) async fn list_children(
        &self,
        trx: &Transaction,
    ) -> Result<Vec<String>, DirectoryError> {
        let subspace = self.subspace.as_ref().expect("node subspace is set");
        let child_space = subspace.subspace(&(CHILD_KEY,));
        let (mut begin, end) = child_space.range();

        let mut names = Vec::new();
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
                .map_err(|err| self.err("list", DirectoryErrorKind::Kv(err)))?;
            let more = values.more();

            for value in values.iter() {
                let name: String = child_space
                    .unpack(value.key())
                    .map_err(|err| self.err("list", DirectoryErrorKind::Pack(err)))?;
                names.push(name);
                begin = value.key().to_vec();
                begin.push(0x00);
            }

            if !more {
                break;
            }
        }
        Ok(names)
    }

    pub(crate) fn get_contents(&self, trx: &Transaction) -> Result<DirectoryOutput, DirectoryError> {
        assert!(self.exists());
        assert!(self.loaded_metadata);

        let subspace = self.subspace.as_ref().expect("node subspace is set");
        self.directory_layer.contents_of_node(
            subspace.clone(),
            self.current_path.clone(),
            self.layer.clone(),
            self.chain.clone(),
            trx,
        )
    }
}
