// Copyright 2025 dirspace developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::HashSet;
use std::iter::FromIterator;

use dirspace::tuple::hca::HighContentionAllocator;
use dirspace::tuple::Subspace;
use dirspace::KvResult;

mod common;

fn check_hca_result_uniqueness(results: &[i64]) {
    let result_set: HashSet<i64> = HashSet::from_iter(results.to_vec());

    if results.len() != result_set.len() {
        panic!(
            "Set size does not match results size: {} != {}",
            result_set.len(),
            results.len()
        );
    }
}

async fn test_hca_many_sequential_allocations_async() -> KvResult<()> {
    const N: usize = 1000;
    const KEY: &[u8] = b"test-hca-allocate";

    let db = common::database();
    let hca = HighContentionAllocator::new(Subspace::from_bytes(KEY));

    let mut all_ints = Vec::new();

    for _ in 0..N {
        let trx = db.create_trx()?;

        let next_int: i64 = hca.allocate(&trx).await.expect("allocation failed");
        all_ints.push(next_int);

        trx.commit().await?;
    }

    check_hca_result_uniqueness(&all_ints);

    Ok(())
}

#[test]
fn test_hca_many_sequential_allocations() {
    futures::executor::block_on(test_hca_many_sequential_allocations_async())
        .expect("failed to run");
}

async fn test_hca_interleaved_allocations_async() -> KvResult<()> {
    const N: usize = 100;
    const KEY: &[u8] = b"test-hca-allocate-interleaved";

    let db = common::database();
    let hca = HighContentionAllocator::new(Subspace::from_bytes(KEY));

    let mut all_ints = Vec::new();

    // two transactions in flight at a time; the loser of a candidate race
    // retries on a fresh transaction
    for _ in 0..N {
        let trx_a = db.create_trx()?;
        let trx_b = db.create_trx()?;

        let a: i64 = hca.allocate(&trx_a).await.expect("allocation failed");
        let b: i64 = hca.allocate(&trx_b).await.expect("allocation failed");
        all_ints.push(a);
        trx_a.commit().await?;

        match trx_b.commit().await {
            Ok(()) => all_ints.push(b),
            Err(err) if err.is_retryable() => {
                let retry = db.create_trx()?;
                let b: i64 = hca.allocate(&retry).await.expect("allocation failed");
                retry.commit().await?;
                all_ints.push(b);
            }
            Err(err) => return Err(err),
        }
    }

    assert_eq!(all_ints.len(), 2 * N);
    check_hca_result_uniqueness(&all_ints);

    Ok(())
}

#[test]
fn test_hca_interleaved_allocations() {
    futures::executor::block_on(test_hca_interleaved_allocations_async()).expect("failed to run");
}
