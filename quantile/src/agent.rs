// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::config::Config;
use crate::key::Key;
use crate::sketch::Sketch;
use crate::store::KeyCount;

/// Capacity of the agent insert buffers.
const BUF_CAP: usize = 512;

/// Insert-optimized front end over [`Sketch`].
///
/// Unweighted inserts are buffered as bare keys and folded into the sketch
/// with a single sorted merge once the buffer fills up; weighted inserts go
/// through a (key, count) buffer that is flushed on every call.
#[derive(Debug, Clone, Default)]
pub struct Agent {
    pub sketch: Sketch,
    buf: Vec<Key>,
    count_buf: Vec<KeyCount>,
}

impl Agent {
    /// Insert a value observed with the given sample rate. Rates outside
    /// (0, 1] count as 1.
    pub fn insert(&mut self, config: &Config, v: f64, mut sample_rate: f64) {
        if sample_rate <= 0.0 || sample_rate > 1.0 {
            sample_rate = 1.0;
        }
        if sample_rate == 1.0 {
            self.sketch.basic.insert(v);
            self.buf.push(config.key(v));
            if self.buf.len() < BUF_CAP {
                return;
            }
            self.flush_buf(config);
            return;
        }
        let n = (1.0 / sample_rate) as u64;
        self.sketch.basic.insert_n(v, n);
        self.count_buf.push(KeyCount {
            k: config.key(v),
            n,
        });
        self.flush_count_buf(config);
    }

    /// Spread `count` values linearly across the buckets spanning
    /// [lower, upper].
    ///
    /// Fractional per-bucket shares only feed the carried remainder when
    /// above one, which keeps zero-count entries out of the sketch but can
    /// underfill the first buckets of a very wide range; whatever is left at
    /// the end lands in the last touched bucket so the total always equals
    /// `count`.
    pub fn insert_interpolate(&mut self, config: &Config, lower: f64, upper: f64, count: u64) {
        if count == 0 {
            return;
        }
        let keys: Vec<Key> = (config.key(lower)..=config.key(upper)).collect();
        if keys.is_empty() {
            return;
        }
        let mut whats_left = count;
        let distance = upper - lower;
        let mut start_idx = 0;
        let mut lower_b = config.bin_low(keys[0]);
        let mut remainder = 0.0_f64;
        let mut i = 1;
        while i < keys.len() && whats_left > 0 {
            let upper_b = config.bin_low(keys[i]);
            // share of the count falling between the two bucket boundaries
            let fkn = ((upper_b - lower_b) / distance) * count as f64;
            if fkn > 1.0 {
                remainder += fkn - fkn.trunc();
            }
            let mut kn = fkn as u64;
            if remainder > 1.0 {
                kn += 1;
                remainder -= 1.0;
            }
            if kn > 0 {
                let kn = kn.min(whats_left);
                self.count_buf.push(KeyCount {
                    k: keys[start_idx],
                    n: kn,
                });
                self.sketch.basic.insert_n(lower_b, kn);
                whats_left -= kn;
                start_idx = i;
                lower_b = upper_b;
            }
            i += 1;
        }
        if whats_left > 0 {
            self.count_buf.push(KeyCount {
                k: keys[start_idx],
                n: whats_left,
            });
            self.sketch
                .basic
                .insert_n(config.bin_low(keys[start_idx]), whats_left);
        }
        self.flush_count_buf(config);
    }

    /// Flush the buffers and return a deep copy of the sketch, or None when
    /// nothing was inserted.
    pub fn finish(&mut self, config: &Config) -> Option<Sketch> {
        self.flush(config);
        if self.sketch.is_empty() {
            return None;
        }
        Some(self.sketch.clone())
    }

    /// Fold any buffered inserts into the underlying sketch.
    pub fn flush(&mut self, config: &Config) {
        self.flush_buf(config);
        self.flush_count_buf(config);
    }

    fn flush_buf(&mut self, config: &Config) {
        if self.buf.is_empty() {
            return;
        }
        self.buf.sort_unstable();
        self.sketch.store.insert_keys(config, &self.buf);
        self.buf.clear();
    }

    fn flush_count_buf(&mut self, config: &Config) {
        if self.count_buf.is_empty() {
            return;
        }
        self.count_buf.sort_unstable_by_key(|kc| kc.k);
        self.sketch.store.insert_counts(config, &self.count_buf);
        self.count_buf.clear();
    }
}
