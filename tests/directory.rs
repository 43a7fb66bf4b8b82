// Copyright 2025 dirspace developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use dirspace::directory::{Directory, DirectoryError, DirectoryErrorKind, DirectoryLayer};
use dirspace::tuple::{Bytes, Subspace};
use dirspace::{KvError, Path};

mod common;

use common::path;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn is_prefix_of(a: &[u8], b: &[u8]) -> bool {
    b.starts_with(a)
}

async fn test_create_or_open_async() -> TestResult {
    let db = common::database();
    let directory = DirectoryLayer::default();

    let trx = db.create_trx()?;
    let acme = directory
        .create_or_open(&trx, &path("/tenants/acme"), None)
        .await?;
    assert_eq!(acme.path(), &path("/tenants/acme"));
    assert_eq!(acme.layer(), "");
    assert!(!acme.is_partition());
    trx.commit().await?;

    let trx = db.create_trx()?;
    assert!(directory.exists(&trx, &path("/tenants")).await?);
    assert!(directory.exists(&trx, &path("/tenants/acme")).await?);
    assert!(!directory.exists(&trx, &path("/tenants/other")).await?);
    assert_eq!(directory.list(&trx, &path("/")).await?, vec!["tenants"]);
    assert_eq!(directory.list(&trx, &path("/tenants")).await?, vec!["acme"]);
    assert_eq!(
        directory.list(&trx, &path("/tenants/acme")).await?,
        Vec::<String>::new()
    );
    Ok(())
}

#[test]
fn test_create_or_open() {
    futures::executor::block_on(test_create_or_open_async()).expect("failed to run");
}

async fn test_create_or_open_is_idempotent_async() -> TestResult {
    let db = common::database();
    let directory = DirectoryLayer::default();

    let trx = db.create_trx()?;
    let first = directory.create_or_open(&trx, &path("/app"), None).await?;
    trx.commit().await?;

    let trx = db.create_trx()?;
    let second = directory.create_or_open(&trx, &path("/app"), None).await?;
    assert_eq!(first.path(), second.path());
    assert_eq!(first.bytes(), second.bytes());
    Ok(())
}

#[test]
fn test_create_or_open_is_idempotent() {
    futures::executor::block_on(test_create_or_open_is_idempotent_async()).expect("failed to run");
}

async fn test_layers_async() -> TestResult {
    let db = common::database();
    let directory = DirectoryLayer::default();

    let trx = db.create_trx()?;
    let docs = directory
        .create_or_open(&trx, &path("/tenants/acme/docs"), Some("docs"))
        .await?;
    assert_eq!(docs.layer(), "docs");
    trx.commit().await?;

    let trx = db.create_trx()?;
    // matching and empty layers open, a conflicting one fails
    directory
        .open(&trx, &path("/tenants/acme/docs"), Some("docs"))
        .await?;
    directory
        .open(&trx, &path("/tenants/acme/docs"), None)
        .await?;
    let err = directory
        .open(&trx, &path("/tenants/acme/docs"), Some("wrong"))
        .await
        .unwrap_err();
    match err.kind() {
        DirectoryErrorKind::IncompatibleLayer { stored, requested } => {
            assert_eq!(stored, "docs");
            assert_eq!(requested, "wrong");
        }
        kind => panic!("unexpected error kind: {:?}", kind),
    }

    // layer tags on path segments are asserted during the walk
    directory
        .open(&trx, &path("/tenants/acme/docs[docs]"), None)
        .await?;
    let err = directory
        .open(&trx, &path("/tenants/acme[nope]/docs"), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err.kind(),
        DirectoryErrorKind::IncompatibleLayer { .. }
    ));
    Ok(())
}

#[test]
fn test_layers() {
    futures::executor::block_on(test_layers_async()).expect("failed to run");
}

async fn test_create_and_open_strictness_async() -> TestResult {
    let db = common::database();
    let directory = DirectoryLayer::default();

    let trx = db.create_trx()?;
    let err = directory.open(&trx, &path("/missing"), None).await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(err.op(), "open");
    assert_eq!(err.path(), &path("/missing"));

    directory.create(&trx, &path("/solo"), None).await?;
    let err = directory.create(&trx, &path("/solo"), None).await.unwrap_err();
    assert!(err.is_already_exists());

    // try_* forms fold those two outcomes into absence
    assert!(directory.try_open(&trx, &path("/missing"), None).await?.is_none());
    assert!(directory.try_create(&trx, &path("/solo"), None).await?.is_none());
    assert!(directory.try_list(&trx, &path("/missing")).await?.is_none());
    assert!(!directory.try_remove(&trx, &path("/missing")).await?);
    Ok(())
}

#[test]
fn test_create_and_open_strictness() {
    futures::executor::block_on(test_create_and_open_strictness_async()).expect("failed to run");
}

async fn test_move_async() -> TestResult {
    let db = common::database();
    let directory = DirectoryLayer::default();

    let trx = db.create_trx()?;
    let docs = directory
        .create_or_open(&trx, &path("/tenants/acme/docs"), Some("docs"))
        .await?;
    let old_prefix = docs.bytes().to_vec();
    trx.set(&docs.pack(&"report"), b"q3");
    directory.create_or_open(&trx, &path("/archive"), None).await?;
    trx.commit().await?;

    let trx = db.create_trx()?;
    let moved = directory
        .move_to(&trx, &path("/tenants/acme/docs"), &path("/archive/docs"))
        .await?;
    assert_eq!(moved.path(), &path("/archive/docs"));
    assert_eq!(moved.bytes(), old_prefix.as_slice());
    assert_eq!(moved.layer(), "docs");
    trx.commit().await?;

    let trx = db.create_trx()?;
    assert_eq!(
        directory.list(&trx, &path("/tenants/acme")).await?,
        Vec::<String>::new()
    );
    assert_eq!(directory.list(&trx, &path("/archive")).await?, vec!["docs"]);
    // content moved with the prefix, untouched
    let reopened = directory.open(&trx, &path("/archive/docs"), None).await?;
    assert_eq!(
        trx.get(&reopened.pack(&"report"), false).await?.as_deref(),
        Some(&b"q3"[..])
    );
    Ok(())
}

#[test]
fn test_move() {
    futures::executor::block_on(test_move_async()).expect("failed to run");
}

async fn test_move_boundaries_async() -> TestResult {
    let db = common::database();
    let directory = DirectoryLayer::default();

    let trx = db.create_trx()?;
    let a = directory.create_or_open(&trx, &path("/a"), None).await?;
    directory.create_or_open(&trx, &path("/b"), None).await?;
    trx.commit().await?;

    let trx = db.create_trx()?;

    // moving onto itself is a no-op success
    let same = directory.move_to(&trx, &path("/a"), &path("/a")).await?;
    assert_eq!(same.bytes(), a.bytes());

    // destination below the source
    let err = directory
        .move_to(&trx, &path("/a"), &path("/a/inner"))
        .await
        .unwrap_err();
    assert!(matches!(
        err.kind(),
        DirectoryErrorKind::CannotMoveBetweenSubdirectories
    ));

    // destination already exists
    let err = directory
        .move_to(&trx, &path("/a"), &path("/b"))
        .await
        .unwrap_err();
    assert!(err.is_already_exists());

    // destination parent missing
    let err = directory
        .move_to(&trx, &path("/a"), &path("/missing/a"))
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), DirectoryErrorKind::ParentNotFound));

    // missing source
    let err = directory
        .move_to(&trx, &path("/ghost"), &path("/b/ghost"))
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    // the root cannot be moved
    let err = directory
        .move_to(&trx, &path("/"), &path("/b/root"))
        .await
        .unwrap_err();
    assert!(matches!(
        err.kind(),
        DirectoryErrorKind::CannotMoveRootDirectory
    ));
    let err = directory.move_directory(&trx, &path("/c")).await.unwrap_err();
    assert!(matches!(
        err.kind(),
        DirectoryErrorKind::CannotMoveRootDirectory
    ));
    Ok(())
}

#[test]
fn test_move_boundaries() {
    futures::executor::block_on(test_move_boundaries_async()).expect("failed to run");
}

async fn test_remove_async() -> TestResult {
    let db = common::database();
    let directory = DirectoryLayer::default();

    let trx = db.create_trx()?;
    let docs = directory
        .create_or_open(&trx, &path("/tenants/acme/docs"), None)
        .await?;
    let data_key = docs.pack(&"blob");
    trx.set(&data_key, b"payload");
    trx.commit().await?;

    let trx = db.create_trx()?;
    assert!(directory.remove(&trx, &path("/tenants")).await?);
    trx.commit().await?;

    let trx = db.create_trx()?;
    assert!(!directory.exists(&trx, &path("/tenants")).await?);
    assert!(!directory.exists(&trx, &path("/tenants/acme/docs")).await?);
    let err = directory
        .open(&trx, &path("/tenants/acme/docs"), None)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    // user data under the removed prefixes is gone as well
    assert_eq!(trx.get(&data_key, false).await?, None);

    // removing the root is refused
    let err = directory.remove(&trx, &path("/")).await.unwrap_err();
    assert!(matches!(
        err.kind(),
        DirectoryErrorKind::CannotModifyRootDirectory
    ));
    Ok(())
}

#[test]
fn test_remove() {
    futures::executor::block_on(test_remove_async()).expect("failed to run");
}

async fn test_removed_prefix_is_not_reused_async() -> TestResult {
    let db = common::database();
    let directory = DirectoryLayer::default();

    let trx = db.create_trx()?;
    let first = directory.create_or_open(&trx, &path("/victim"), None).await?;
    let first_prefix = first.bytes().to_vec();
    trx.commit().await?;

    let trx = db.create_trx()?;
    directory.remove(&trx, &path("/victim")).await?;
    trx.commit().await?;

    let trx = db.create_trx()?;
    let second = directory.create_or_open(&trx, &path("/victim"), None).await?;
    // the allocator only moves forward, so the new incarnation gets a fresh
    // prefix
    assert_ne!(second.bytes(), first_prefix.as_slice());
    Ok(())
}

#[test]
fn test_removed_prefix_is_not_reused() {
    futures::executor::block_on(test_removed_prefix_is_not_reused_async()).expect("failed to run");
}

async fn test_prefix_disjointness_async() -> TestResult {
    let db = common::database();
    let directory = DirectoryLayer::default();

    let trx = db.create_trx()?;
    let mut prefixes: Vec<Vec<u8>> = Vec::new();
    for i in 0..20 {
        let dir = directory
            .create_or_open(&trx, &Path::from_names(vec![format!("dir-{}", i)]), None)
            .await?;
        prefixes.push(dir.bytes().to_vec());
    }
    trx.commit().await?;

    for (i, a) in prefixes.iter().enumerate() {
        for (j, b) in prefixes.iter().enumerate() {
            if i != j {
                assert!(
                    !is_prefix_of(a, b),
                    "{:?} contains {:?}",
                    Bytes::from(a.as_slice()),
                    Bytes::from(b.as_slice())
                );
            }
        }
    }
    Ok(())
}

#[test]
fn test_prefix_disjointness() {
    futures::executor::block_on(test_prefix_disjointness_async()).expect("failed to run");
}

async fn test_invalid_paths_async() -> TestResult {
    let db = common::database();
    let directory = DirectoryLayer::default();

    let trx = db.create_trx()?;
    let err = directory
        .create_or_open(&trx, &Path::from_names(vec![""]), None)
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), DirectoryErrorKind::InvalidPath(_)));

    let err = directory
        .create_or_open(&trx, &path("/"), None)
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), DirectoryErrorKind::NoPathProvided));

    // whitespace is preserved, not trimmed
    let spaced = directory
        .create_or_open(&trx, &Path::from_names(vec![" a "]), None)
        .await?;
    assert_eq!(spaced.path().get(0).unwrap().name(), " a ");
    Ok(())
}

#[test]
fn test_invalid_paths() {
    futures::executor::block_on(test_invalid_paths_async()).expect("failed to run");
}

async fn test_register_async() -> TestResult {
    let db = common::database();
    let directory = DirectoryLayer::new(
        Subspace::from_bytes(b"\xFE"),
        Subspace::all(),
        true, // manual prefixes
    );

    let trx = db.create_trx()?;
    let custom = directory
        .register(&trx, &path("/custom"), None, b"\x02custom\x00")
        .await?;
    assert_eq!(custom.bytes(), b"\x02custom\x00");
    trx.commit().await?;

    let trx = db.create_trx()?;
    let reopened = directory.open(&trx, &path("/custom"), None).await?;
    assert_eq!(reopened.bytes(), b"\x02custom\x00");

    // a registered prefix must not contain a live prefix
    let err = directory
        .register(&trx, &path("/other"), None, b"\x02custom\x00\x01")
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), DirectoryErrorKind::PrefixInUse));

    // nor be contained in one
    let err = directory
        .register(&trx, &path("/other"), None, b"\x02cus")
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), DirectoryErrorKind::PrefixInUse));

    // nor collide exactly
    let err = directory
        .register(&trx, &path("/other"), None, b"\x02custom\x00")
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), DirectoryErrorKind::PrefixInUse));
    Ok(())
}

#[test]
fn test_register() {
    futures::executor::block_on(test_register_async()).expect("failed to run");
}

async fn test_register_requires_manual_prefixes_async() -> TestResult {
    let db = common::database();
    let directory = DirectoryLayer::default();

    let trx = db.create_trx()?;
    let err = directory
        .register(&trx, &path("/custom"), None, b"\x02custom\x00")
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), DirectoryErrorKind::PrefixNotAllowed));
    Ok(())
}

#[test]
fn test_register_requires_manual_prefixes() {
    futures::executor::block_on(test_register_requires_manual_prefixes_async())
        .expect("failed to run");
}

async fn test_change_layer_async() -> TestResult {
    let db = common::database();
    let directory = DirectoryLayer::default();

    let trx = db.create_trx()?;
    directory.create_or_open(&trx, &path("/cfg"), Some("v1")).await?;
    trx.commit().await?;

    let trx = db.create_trx()?;
    let changed = directory.change_layer(&trx, &path("/cfg"), "v2").await?;
    assert_eq!(changed.layer(), "v2");
    trx.commit().await?;

    let trx = db.create_trx()?;
    directory.open(&trx, &path("/cfg"), Some("v2")).await?;
    let err = directory
        .open(&trx, &path("/cfg"), Some("v1"))
        .await
        .unwrap_err();
    assert!(matches!(
        err.kind(),
        DirectoryErrorKind::IncompatibleLayer { .. }
    ));

    // a regular directory cannot become a partition in place
    let err = directory
        .change_layer(&trx, &path("/cfg"), "partition")
        .await
        .unwrap_err();
    assert!(matches!(
        err.kind(),
        DirectoryErrorKind::IncompatibleLayer { .. }
    ));

    // missing directory and root are refused
    let err = directory
        .change_layer(&trx, &path("/ghost"), "x")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    let err = directory
        .change_layer(&trx, &path("/"), "x")
        .await
        .unwrap_err();
    assert!(matches!(
        err.kind(),
        DirectoryErrorKind::CannotModifyRootDirectory
    ));
    Ok(())
}

#[test]
fn test_change_layer() {
    futures::executor::block_on(test_change_layer_async()).expect("failed to run");
}

async fn test_metadata_version_advances_async() -> TestResult {
    let db = common::database();
    let directory = DirectoryLayer::default();

    // the register lives at a documented location in the node subspace
    let node_subspace = Subspace::from_bytes(b"\xFE");
    let register_key = node_subspace
        .subspace(&Bytes::from(&b"\xFE"[..]))
        .pack(&"version");

    async fn register(db: &dirspace::Database, key: &[u8]) -> Result<u64, KvError> {
        let trx = db.create_trx()?;
        let value = trx.get(key, false).await?;
        let mut arr = [0u8; 8];
        if let Some(value) = &value {
            arr[..value.len().min(8)].copy_from_slice(&value[..value.len().min(8)]);
        }
        Ok(u64::from_le_bytes(arr))
    }

    let v0 = register(&db, &register_key).await?;

    let trx = db.create_trx()?;
    directory.create_or_open(&trx, &path("/one"), None).await?;
    trx.commit().await?;
    let v1 = register(&db, &register_key).await?;
    assert!(v1 > v0);

    let trx = db.create_trx()?;
    directory.change_layer(&trx, &path("/one"), "x").await?;
    trx.commit().await?;
    let v2 = register(&db, &register_key).await?;
    assert!(v2 > v1);

    let trx = db.create_trx()?;
    directory.create_or_open(&trx, &path("/two"), None).await?;
    directory.move_to(&trx, &path("/one"), &path("/two/one")).await?;
    trx.commit().await?;
    let v3 = register(&db, &register_key).await?;
    assert!(v3 > v2);

    let trx = db.create_trx()?;
    directory.remove(&trx, &path("/two")).await?;
    trx.commit().await?;
    let v4 = register(&db, &register_key).await?;
    assert!(v4 > v3);
    Ok(())
}

#[test]
fn test_metadata_version_advances() {
    futures::executor::block_on(test_metadata_version_advances_async()).expect("failed to run");
}

async fn test_concurrent_create_async() -> TestResult {
    let db = common::database();
    let directory = DirectoryLayer::default();

    let trx1 = db.create_trx()?;
    let trx2 = db.create_trx()?;

    let winner = directory.create(&trx1, &path("/x"), None).await?;
    let _loser = directory.create(&trx2, &path("/x"), None).await?;

    trx1.commit().await?;
    // the loser read directory state the winner changed
    let err = trx2.commit().await.unwrap_err();
    assert!(err.is_retryable());

    // re-running the loser observes the winner's directory
    let trx = db.create_trx()?;
    let err = directory.create(&trx, &path("/x"), None).await.unwrap_err();
    assert!(err.is_already_exists());
    let reopened = directory.create_or_open(&trx, &path("/x"), None).await?;
    assert_eq!(reopened.bytes(), winner.bytes());
    Ok(())
}

#[test]
fn test_concurrent_create() {
    futures::executor::block_on(test_concurrent_create_async()).expect("failed to run");
}

async fn test_error_reporting_async() -> TestResult {
    let db = common::database();
    let directory = DirectoryLayer::default();

    let trx = db.create_trx()?;
    let err = directory.open(&trx, &path("/a/b"), None).await.unwrap_err();
    let rendered = err.to_string();
    assert!(rendered.contains("open"));
    assert!(rendered.contains("/a/b"));

    let err: DirectoryError = KvError::Conflict.into();
    assert!(matches!(err.kind(), DirectoryErrorKind::Kv(KvError::Conflict)));
    Ok(())
}

#[test]
fn test_error_reporting() {
    futures::executor::block_on(test_error_reporting_async()).expect("failed to run");
}
