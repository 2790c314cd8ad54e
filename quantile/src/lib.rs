// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sparse quantile sketch with logarithmic buckets.
//!
//! Values are mapped to integer keys on a logarithmic scale so that the
//! sketch answers quantile queries with a bounded relative error, while
//! keeping only a capped number of (key, count) bins. The [`Agent`] front
//! end buffers inserts and folds them into the [`Sketch`] in batches, which
//! is what the hot aggregation paths use.
//!
//! The module also converts sketches to and from the DDSketch interchange
//! format, which is the on-wire form used in stats payloads.

mod agent;
mod config;
mod key;
mod sketch;
mod store;
mod summary;

pub mod ddsketch;
pub mod pb;

pub use agent::Agent;
pub use config::{Config, DEFAULT_BIN_LIMIT, DEFAULT_EPS, DEFAULT_MIN_VALUE};
pub use key::Key;
pub use sketch::Sketch;
pub use store::Bin;
pub use summary::Summary;
