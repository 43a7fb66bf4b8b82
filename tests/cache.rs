// Copyright 2025 dirspace developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Resolution caching and handle validity across transactions.

use dirspace::directory::{Directory, DirectoryLayer};
use dirspace::Path;

mod common;

use common::path;

type TestResult = Result<(), Box<dyn std::error::Error>>;

async fn test_handle_reuse_across_transactions_async() -> TestResult {
    let db = common::database();
    let directory = DirectoryLayer::default();

    let trx = db.create_trx()?;
    directory.create_or_open(&trx, &path("/m/a"), None).await?;
    trx.commit().await?;

    let trx = db.create_trx()?;
    let handle = directory.open(&trx, &path("/m/a"), None).await?;
    trx.commit().await?;

    // nothing changed: the handle stays valid and usable elsewhere
    let trx = db.create_trx()?;
    assert!(handle.is_valid(&trx).await?);
    assert_eq!(handle.list(&trx, &Path::new()).await?, Vec::<String>::new());
    Ok(())
}

#[test]
fn test_handle_reuse_across_transactions() {
    futures::executor::block_on(test_handle_reuse_across_transactions_async())
        .expect("failed to run");
}

async fn test_handle_stale_after_move_async() -> TestResult {
    let db = common::database();
    let directory = DirectoryLayer::default();

    let trx = db.create_trx()?;
    directory.create_or_open(&trx, &path("/m/a"), None).await?;
    directory.create_or_open(&trx, &path("/n"), None).await?;
    trx.commit().await?;

    let trx = db.create_trx()?;
    let handle = directory.open(&trx, &path("/m/a"), None).await?;
    trx.commit().await?;

    let trx = db.create_trx()?;
    directory.move_to(&trx, &path("/m"), &path("/n/m")).await?;
    trx.commit().await?;

    let trx = db.create_trx()?;
    assert!(!handle.is_valid(&trx).await?);
    let err = handle.list(&trx, &Path::new()).await.unwrap_err();
    assert!(err.is_stale_handle());
    Ok(())
}

#[test]
fn test_handle_stale_after_move() {
    futures::executor::block_on(test_handle_stale_after_move_async()).expect("failed to run");
}

async fn test_handle_stale_after_remove_async() -> TestResult {
    let db = common::database();
    let directory = DirectoryLayer::default();

    let trx = db.create_trx()?;
    directory
        .create_or_open(&trx, &path("/tenants/acme/docs"), None)
        .await?;
    trx.commit().await?;

    let trx = db.create_trx()?;
    let handle = directory.open(&trx, &path("/tenants/acme/docs"), None).await?;
    trx.commit().await?;

    let trx = db.create_trx()?;
    directory.remove(&trx, &path("/tenants")).await?;
    trx.commit().await?;

    // removing an ancestor invalidates every handle below it
    let trx = db.create_trx()?;
    assert!(!handle.is_valid(&trx).await?);
    Ok(())
}

#[test]
fn test_handle_stale_after_remove() {
    futures::executor::block_on(test_handle_stale_after_remove_async()).expect("failed to run");
}

async fn test_handle_stale_after_change_layer_async() -> TestResult {
    let db = common::database();
    let directory = DirectoryLayer::default();

    let trx = db.create_trx()?;
    directory.create_or_open(&trx, &path("/cfg"), Some("v1")).await?;
    trx.commit().await?;

    let trx = db.create_trx()?;
    let handle = directory.open(&trx, &path("/cfg"), None).await?;
    trx.commit().await?;

    let trx = db.create_trx()?;
    directory.change_layer(&trx, &path("/cfg"), "v2").await?;
    trx.commit().await?;

    let trx = db.create_trx()?;
    assert!(!handle.is_valid(&trx).await?);
    Ok(())
}

#[test]
fn test_handle_stale_after_change_layer() {
    futures::executor::block_on(test_handle_stale_after_change_layer_async())
        .expect("failed to run");
}

async fn test_sibling_create_keeps_handles_valid_async() -> TestResult {
    let db = common::database();
    let directory = DirectoryLayer::default();

    let trx = db.create_trx()?;
    directory.create_or_open(&trx, &path("/m/a"), None).await?;
    trx.commit().await?;

    let trx = db.create_trx()?;
    let handle = directory.open(&trx, &path("/m/a"), None).await?;
    trx.commit().await?;

    // creating a sibling does not disturb existing resolutions
    let trx = db.create_trx()?;
    directory.create_or_open(&trx, &path("/m/b"), None).await?;
    trx.commit().await?;

    let trx = db.create_trx()?;
    assert!(handle.is_valid(&trx).await?);
    Ok(())
}

#[test]
fn test_sibling_create_keeps_handles_valid() {
    futures::executor::block_on(test_sibling_create_keeps_handles_valid_async())
        .expect("failed to run");
}

async fn test_repeated_resolution_in_one_transaction_async() -> TestResult {
    let db = common::database();
    let directory = DirectoryLayer::default();

    let trx = db.create_trx()?;
    let created = directory.create_or_open(&trx, &path("/q"), None).await?;
    // the second resolution is served from the transaction cache and agrees
    let opened = directory.open(&trx, &path("/q"), None).await?;
    assert_eq!(created.bytes(), opened.bytes());

    // uncommitted state never leaks into other transactions
    let other = db.create_trx()?;
    assert!(directory.try_open(&other, &path("/q"), None).await?.is_none());

    trx.commit().await?;

    let other = db.create_trx()?;
    assert!(directory.try_open(&other, &path("/q"), None).await?.is_some());
    Ok(())
}

#[test]
fn test_repeated_resolution_in_one_transaction() {
    futures::executor::block_on(test_repeated_resolution_in_one_transaction_async())
        .expect("failed to run");
}

async fn test_cached_resolution_tracks_mutations_async() -> TestResult {
    let db = common::database();
    let directory = DirectoryLayer::default();

    let trx = db.create_trx()?;
    directory.create_or_open(&trx, &path("/c1"), None).await?;
    directory.create_or_open(&trx, &path("/dest"), None).await?;
    trx.commit().await?;

    // warm the database-scoped cache with a read-only resolution
    let trx = db.create_trx()?;
    let first = directory.open(&trx, &path("/c1"), None).await?;
    trx.commit().await?;
    let trx = db.create_trx()?;
    let second = directory.open(&trx, &path("/c1"), None).await?;
    assert_eq!(first.bytes(), second.bytes());
    trx.commit().await?;

    let trx = db.create_trx()?;
    directory.move_to(&trx, &path("/c1"), &path("/dest/c1")).await?;
    trx.commit().await?;

    // the cache does not resurrect the old location, and the new one
    // resolves to the preserved prefix
    let trx = db.create_trx()?;
    assert!(directory.try_open(&trx, &path("/c1"), None).await?.is_none());
    let relocated = directory.open(&trx, &path("/dest/c1"), None).await?;
    assert_eq!(relocated.bytes(), first.bytes());
    Ok(())
}

#[test]
fn test_cached_resolution_tracks_mutations() {
    futures::executor::block_on(test_cached_resolution_tracks_mutations_async())
        .expect("failed to run");
}

async fn test_same_transaction_handle_needs_no_validation_async() -> TestResult {
    let db = common::database();
    let directory = DirectoryLayer::default();

    let trx = db.create_trx()?;
    let handle = directory.create_or_open(&trx, &path("/w/x"), None).await?;
    // usable immediately within the resolving transaction
    assert_eq!(handle.list(&trx, &Path::new()).await?, Vec::<String>::new());
    directory.create_or_open(&trx, &path("/w/x/y"), None).await?;
    assert_eq!(handle.list(&trx, &Path::new()).await?, vec!["y"]);
    trx.commit().await?;
    Ok(())
}

#[test]
fn test_same_transaction_handle_needs_no_validation() {
    futures::executor::block_on(test_same_transaction_handle_needs_no_validation_async())
        .expect("failed to run");
}
