// Copyright 2020-2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Transactional memory stress tests
//!
//! Test subjects:
//! - lots of read / write alternations on a single hot word
//! - commit/retry overhead under the baseline (uncontended) case

use criterion::{criterion_group, criterion_main};
use memory::*;

// all memory benches
criterion_group!(benches, bnc_memory_usize);

// main
criterion_main!(benches);
