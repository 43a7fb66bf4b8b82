// Copyright 2025 dirspace developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A transactional directory layer over an ordered key-value store.
//!
//! `dirspace` manages a hierarchical namespace: clients name logical
//! locations with paths like `/tenants/acme/docs`, and each location maps to
//! a short, unique binary key prefix under which the client stores whatever
//! it wants. The path-to-prefix mapping lives in the store itself and every
//! operation on it is transactional, so reorganizing the namespace (moving
//! or renaming a directory) never rewrites stored data; only the mapping
//! changes.
//!
//! The crate ships with an embedded in-memory [`Database`] providing the
//! ordered, optimistically concurrent transactions the layer runs on.
//!
//! ```
//! use dirspace::directory::{Directory, DirectoryLayer};
//! use dirspace::{Database, Path};
//!
//! async fn async_main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::new();
//!     let directory = DirectoryLayer::default();
//!
//!     let trx = db.create_trx()?;
//!     let docs = directory
//!         .create_or_open(&trx, &"/tenants/acme/docs".parse::<Path>()?, None)
//!         .await?;
//!     trx.set(&docs.pack(&"readme"), b"hello");
//!     trx.commit().await?;
//!     Ok(())
//! }
//!
//! futures::executor::block_on(async_main()).expect("failed to run");
//! ```

pub mod directory;
mod error;
mod path;
mod store;
pub mod tuple;

pub use crate::error::{KvError, KvResult};
pub use crate::path::{Path, PathError, Segment};
pub use crate::store::{
    CancellationToken, ConflictRangeType, Database, KeyValue, KeyValues, RangeOption,
    TransactError, TransactOption, Transaction, TransactionOption,
};
