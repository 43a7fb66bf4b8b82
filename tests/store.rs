// Copyright 2025 dirspace developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use dirspace::{
    CancellationToken, Database, KvError, KvResult, RangeOption, TransactOption, Transaction,
    TransactionOption,
};
use futures::future::FutureExt;
use std::sync::atomic::{AtomicUsize, Ordering};

mod common;

async fn test_get_set_async() -> KvResult<()> {
    let db = common::database();

    let trx = db.create_trx()?;
    trx.set(b"hello", b"world");
    // read-your-writes: visible before commit
    assert_eq!(trx.get(b"hello", false).await?.as_deref(), Some(&b"world"[..]));
    trx.commit().await?;

    let trx = db.create_trx()?;
    assert_eq!(trx.get(b"hello", false).await?.as_deref(), Some(&b"world"[..]));
    assert_eq!(trx.get(b"missing", false).await?, None);
    trx.clear(b"hello");
    assert_eq!(trx.get(b"hello", false).await?, None);
    trx.commit().await?;

    let trx = db.create_trx()?;
    assert_eq!(trx.get(b"hello", false).await?, None);
    Ok(())
}

#[test]
fn test_get_set() {
    futures::executor::block_on(test_get_set_async()).expect("failed to run");
}

async fn test_conflict_async() -> KvResult<()> {
    let db = common::database();

    {
        let trx = db.create_trx()?;
        trx.set(b"k", b"0");
        trx.commit().await?;
    }

    let trx1 = db.create_trx()?;
    let trx2 = db.create_trx()?;

    let _ = trx1.get(b"k", false).await?;
    trx1.set(b"k", b"1");

    let _ = trx2.get(b"k", false).await?;
    trx2.set(b"k", b"2");

    trx1.commit().await?;
    assert_eq!(trx2.commit().await, Err(KvError::Conflict));

    let trx = db.create_trx()?;
    assert_eq!(trx.get(b"k", false).await?.as_deref(), Some(&b"1"[..]));
    Ok(())
}

#[test]
fn test_conflict() {
    futures::executor::block_on(test_conflict_async()).expect("failed to run");
}

async fn test_snapshot_read_does_not_conflict_async() -> KvResult<()> {
    let db = common::database();

    let trx1 = db.create_trx()?;
    let trx2 = db.create_trx()?;

    let _ = trx2.get(b"k", true).await?;
    trx2.set(b"other", b"");

    trx1.set(b"k", b"1");
    trx1.commit().await?;

    // the snapshot read is not in the read set
    trx2.commit().await?;
    Ok(())
}

#[test]
fn test_snapshot_read_does_not_conflict() {
    futures::executor::block_on(test_snapshot_read_does_not_conflict_async())
        .expect("failed to run");
}

async fn test_read_only_commit_async() -> KvResult<()> {
    let db = common::database();

    let trx1 = db.create_trx()?;
    let trx2 = db.create_trx()?;

    let _ = trx2.get(b"k", false).await?;

    trx1.set(b"k", b"1");
    trx1.commit().await?;

    // a transaction without mutations commits trivially
    trx2.commit().await?;
    Ok(())
}

#[test]
fn test_read_only_commit() {
    futures::executor::block_on(test_read_only_commit_async()).expect("failed to run");
}

async fn test_atomic_add_async() -> KvResult<()> {
    let db = common::database();

    let trx = db.create_trx()?;
    trx.atomic_add(b"counter", 10);
    trx.atomic_add(b"counter", 3);
    // read-your-writes applies pending atomic ops
    assert_eq!(
        trx.get(b"counter", false).await?.as_deref(),
        Some(&13i64.to_le_bytes()[..])
    );
    trx.commit().await?;

    let trx = db.create_trx()?;
    trx.atomic_add(b"counter", -4);
    trx.commit().await?;

    let trx = db.create_trx()?;
    assert_eq!(
        trx.get(b"counter", false).await?.as_deref(),
        Some(&9i64.to_le_bytes()[..])
    );
    Ok(())
}

#[test]
fn test_atomic_add() {
    futures::executor::block_on(test_atomic_add_async()).expect("failed to run");
}

async fn test_atomic_add_does_not_read_conflict_async() -> KvResult<()> {
    let db = common::database();

    let trx1 = db.create_trx()?;
    let trx2 = db.create_trx()?;
    trx1.atomic_add(b"counter", 1);
    trx2.atomic_add(b"counter", 1);
    trx1.commit().await?;
    trx2.commit().await?;

    let trx = db.create_trx()?;
    assert_eq!(
        trx.get(b"counter", false).await?.as_deref(),
        Some(&2i64.to_le_bytes()[..])
    );
    Ok(())
}

#[test]
fn test_atomic_add_does_not_read_conflict() {
    futures::executor::block_on(test_atomic_add_does_not_read_conflict_async())
        .expect("failed to run");
}

async fn test_clear_range_and_buffer_order_async() -> KvResult<()> {
    let db = common::database();

    {
        let trx = db.create_trx()?;
        for i in 0..5u8 {
            trx.set(&[b'a', i], &[i]);
        }
        trx.commit().await?;
    }

    let trx = db.create_trx()?;
    trx.set(&[b'a', 9], b"before");
    trx.clear_range(b"a", b"b");
    // a write buffered after the clear survives it
    trx.set(&[b'a', 2], b"kept");
    let range = trx
        .get_range(&RangeOption::from((&b"a"[..], &b"b"[..])), false)
        .await?;
    assert_eq!(range.len(), 1);
    assert_eq!(range.first().unwrap().value(), b"kept");
    trx.commit().await?;

    let trx = db.create_trx()?;
    let range = trx
        .get_range(&RangeOption::from((&b"a"[..], &b"b"[..])), false)
        .await?;
    assert_eq!(range.len(), 1);
    assert_eq!(range.first().unwrap().key(), &[b'a', 2]);
    Ok(())
}

#[test]
fn test_clear_range_and_buffer_order() {
    futures::executor::block_on(test_clear_range_and_buffer_order_async()).expect("failed to run");
}

async fn test_range_limit_reverse_async() -> KvResult<()> {
    let db = common::database();

    {
        let trx = db.create_trx()?;
        for i in 0..10u8 {
            trx.set(&[b'k', i], &[i]);
        }
        trx.commit().await?;
    }

    let trx = db.create_trx()?;
    let range = RangeOption {
        begin: b"k".to_vec(),
        end: b"l".to_vec(),
        limit: Some(3),
        reverse: false,
    };
    let values = trx.get_range(&range, false).await?;
    assert_eq!(values.len(), 3);
    assert!(values.more());
    assert_eq!(values.first().unwrap().key(), &[b'k', 0]);

    let range = RangeOption {
        begin: b"k".to_vec(),
        end: b"l".to_vec(),
        limit: Some(2),
        reverse: true,
    };
    let values = trx.get_range(&range, false).await?;
    assert_eq!(values.len(), 2);
    assert_eq!(values.first().unwrap().key(), &[b'k', 9]);
    assert_eq!(values.get(1).unwrap().key(), &[b'k', 8]);
    Ok(())
}

#[test]
fn test_range_limit_reverse() {
    futures::executor::block_on(test_range_limit_reverse_async()).expect("failed to run");
}

async fn test_no_write_conflict_range_option_async() -> KvResult<()> {
    let db = common::database();

    let trx1 = db.create_trx()?;
    let trx2 = db.create_trx()?;

    // trx2 reads the key trx1 writes without a conflict range
    let _ = trx2.get(b"reserved", false).await?;
    trx2.set(b"elsewhere", b"");

    trx1.set_option(TransactionOption::NextWriteNoWriteConflictRange)?;
    trx1.set(b"reserved", b"");
    trx1.commit().await?;

    trx2.commit().await?;
    Ok(())
}

#[test]
fn test_no_write_conflict_range_option() {
    futures::executor::block_on(test_no_write_conflict_range_option_async())
        .expect("failed to run");
}

async fn test_transact_retries_conflicts_async() -> KvResult<()> {
    let db = common::database();
    {
        let trx = db.create_trx()?;
        trx.set(b"contended", &0i64.to_le_bytes());
        trx.commit().await?;
    }

    let attempts = AtomicUsize::new(0);
    let db2 = db.clone();
    db.transact::<_, KvError, _>(
        |trx: &Transaction| {
            let db2 = db2.clone();
            let attempts = &attempts;
            async move {
                let value = trx.get(b"contended", false).await?;
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    // an interfering commit lands between read and commit
                    let other = db2.create_trx()?;
                    other.set(b"contended", b"interference");
                    other.commit().await?;
                }
                trx.set(b"contended", value.as_deref().unwrap_or(b""));
                Ok(())
            }
            .boxed()
        },
        TransactOption::default(),
    )
    .await?;

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    Ok(())
}

#[test]
fn test_transact_retries_conflicts() {
    futures::executor::block_on(test_transact_retries_conflicts_async()).expect("failed to run");
}

async fn test_cancellation_async() -> KvResult<()> {
    let db = common::database();

    let token = CancellationToken::new();
    let trx = db.create_trx_with(token.clone())?;
    token.cancel();
    assert_eq!(trx.get(b"k", false).await, Err(KvError::Cancelled));

    // a cancelled token aborts the retry loop up front
    let result: Result<(), KvError> = db
        .transact(
            |trx: &Transaction| async move { trx.get(b"k", false).await.map(|_| ()) }.boxed(),
            TransactOption::with_cancellation(token),
        )
        .await;
    assert_eq!(result, Err(KvError::Cancelled));
    Ok(())
}

#[test]
fn test_cancellation() {
    futures::executor::block_on(test_cancellation_async()).expect("failed to run");
}
