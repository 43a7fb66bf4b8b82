// Copyright 2025 dirspace developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use dirspace::{Database, Path};

/// A fresh empty database, with logging wired up for `RUST_LOG` runs.
#[allow(unused)]
pub fn database() -> Database {
    let _ = env_logger::builder().is_test(true).try_init();
    Database::new()
}

#[allow(unused)]
pub fn path(s: &str) -> Path {
    s.parse().expect("valid path")
}
