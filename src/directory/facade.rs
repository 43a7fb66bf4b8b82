// Copyright 2025 dirspace developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Retrying forms of the directory operations.
//!
//! Every [`Directory`] operation also exists here as a free function taking
//! a [`Database`] and a [`TransactOption`] instead of a transaction: the
//! bare operation is executed inside [`Database::transact`], so conflicts
//! with concurrent transactions re-run it until the commit is accepted or
//! the retry budget runs out. Terminal directory errors (a missing
//! directory, a layer mismatch, a prefix clash, a stale handle, …) are never
//! retried.
//!
//! The `TransactOption` carries the cancellation token; cancellation aborts
//! the in-flight attempt and surfaces as
//! [`KvError::Cancelled`](crate::KvError::Cancelled).
//!
//! ```
//! use dirspace::directory::{facade, DirectoryLayer};
//! use dirspace::{Database, Path, TransactOption};
//!
//! async fn async_main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::new();
//!     let directory = DirectoryLayer::default();
//!     let path: Path = "/events".parse()?;
//!
//!     let events =
//!         facade::create_or_open(&db, &directory, &path, None, TransactOption::default()).await?;
//!     assert_eq!(events.path(), &path);
//!     Ok(())
//! }
//!
//! futures::executor::block_on(async_main()).expect("failed to run");
//! ```

use crate::directory::{Directory, DirectoryError, DirectoryOutput};
use crate::path::Path;
use crate::store::{Database, TransactOption};

/// Retrying [`Directory::create_or_open`].
pub async fn create_or_open<D>(
    db: &Database,
    directory: &D,
    path: &Path,
    layer: Option<&str>,
    options: TransactOption,
) -> Result<DirectoryOutput, DirectoryError>
where
    D: Directory + Sync + ?Sized,
{
    db.transact(|trx| directory.create_or_open(trx, path, layer), options)
        .await
}

/// Retrying [`Directory::create`].
pub async fn create<D>(
    db: &Database,
    directory: &D,
    path: &Path,
    layer: Option<&str>,
    options: TransactOption,
) -> Result<DirectoryOutput, DirectoryError>
where
    D: Directory + Sync + ?Sized,
{
    db.transact(|trx| directory.create(trx, path, layer), options)
        .await
}

/// Retrying [`Directory::try_create`].
pub async fn try_create<D>(
    db: &Database,
    directory: &D,
    path: &Path,
    layer: Option<&str>,
    options: TransactOption,
) -> Result<Option<DirectoryOutput>, DirectoryError>
where
    D: Directory + Sync + ?Sized,
{
    db.transact(|trx| directory.try_create(trx, path, layer), options)
        .await
}

/// Retrying [`Directory::open`].
pub async fn open<D>(
    db: &Database,
    directory: &D,
    path: &Path,
    layer: Option<&str>,
    options: TransactOption,
) -> Result<DirectoryOutput, DirectoryError>
where
    D: Directory + Sync + ?Sized,
{
    db.transact(|trx| directory.open(trx, path, layer), options)
        .await
}

/// Retrying [`Directory::try_open`].
pub async fn try_open<D>(
    db: &Database,
    directory: &D,
    path: &Path,
    layer: Option<&str>,
    options: TransactOption,
) -> Result<Option<DirectoryOutput>, DirectoryError>
where
    D: Directory + Sync + ?Sized,
{
    db.transact(|trx| directory.try_open(trx, path, layer), options)
        .await
}

/// Retrying [`Directory::register`].
pub async fn register<D>(
    db: &Database,
    directory: &D,
    path: &Path,
    layer: Option<&str>,
    prefix: &[u8],
    options: TransactOption,
) -> Result<DirectoryOutput, DirectoryError>
where
    D: Directory + Sync + ?Sized,
{
    db.transact(
        |trx| directory.register(trx, path, layer, prefix),
        options,
    )
    .await
}

/// Retrying [`Directory::exists`].
pub async fn exists<D>(
    db: &Database,
    directory: &D,
    path: &Path,
    options: TransactOption,
) -> Result<bool, DirectoryError>
where
    D: Directory + Sync + ?Sized,
{
    db.transact(|trx| directory.exists(trx, path), options).await
}

/// Retrying [`Directory::move_to`].
pub async fn move_to<D>(
    db: &Database,
    directory: &D,
    old_path: &Path,
    new_path: &Path,
    options: TransactOption,
) -> Result<DirectoryOutput, DirectoryError>
where
    D: Directory + Sync + ?Sized,
{
    db.transact(|trx| directory.move_to(trx, old_path, new_path), options)
        .await
}

/// Retrying [`Directory::remove`].
pub async fn remove<D>(
    db: &Database,
    directory: &D,
    path: &Path,
    options: TransactOption,
) -> Result<bool, DirectoryError>
where
    D: Directory + Sync + ?Sized,
{
    db.transact(|trx| directory.remove(trx, path), options).await
}

/// Retrying [`Directory::try_remove`].
pub async fn try_remove<D>(
    db: &Database,
    directory: &D,
    path: &Path,
    options: TransactOption,
) -> Result<bool, DirectoryError>
where
    D: Directory + Sync + ?Sized,
{
    db.transact(|trx| directory.try_remove(trx, path), options)
        .await
}

/// Retrying [`Directory::list`].
pub async fn list<D>(
    db: &Database,
    directory: &D,
    path: &Path,
    options: TransactOption,
) -> Result<Vec<String>, DirectoryError>
where
    D: Directory + Sync + ?Sized,
{
    db.transact(|trx| directory.list(trx, path), options).await
}

/// Retrying [`Directory::try_list`].
pub async fn try_list<D>(
    db: &Database,
    directory: &D,
    path: &Path,
    options: TransactOption,
) -> Result<Option<Vec<String>>, DirectoryError>
where
    D: Directory + Sync + ?Sized,
{
    db.transact(|trx| directory.try_list(trx, path), options)
        .await
}

/// Retrying [`Directory::change_layer`].
pub async fn change_layer<D>(
    db: &Database,
    directory: &D,
    path: &Path,
    new_layer: &str,
    options: TransactOption,
) -> Result<DirectoryOutput, DirectoryError>
where
    D: Directory + Sync + ?Sized,
{
    db.transact(
        |trx| directory.change_layer(trx, path, new_layer),
        options,
    )
    .await
}
