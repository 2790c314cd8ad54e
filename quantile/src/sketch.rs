// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use prost::Message;

use crate::config::Config;
use crate::ddsketch;
use crate::key::Key;
use crate::store::{Bin, SparseStore};
use crate::summary::Summary;

/// Sparse quantile sketch with logarithmic buckets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sketch {
    pub(crate) store: SparseStore,
    /// Exact summary of the inserted values.
    pub basic: Summary,
}

impl Sketch {
    pub fn count(&self) -> u64 {
        self.store.count
    }

    pub fn is_empty(&self) -> bool {
        self.store.count == 0
    }

    pub fn bins(&self) -> &[Bin] {
        &self.store.bins
    }

    /// Insert a single value.
    pub fn insert(&mut self, config: &Config, v: f64) {
        self.insert_vals(config, &[v]);
    }

    /// Insert a batch of values.
    pub fn insert_vals(&mut self, config: &Config, vals: &[f64]) {
        let mut keys: Vec<Key> = vals.iter().map(|&v| config.key(v)).collect();
        keys.sort_unstable();
        for &v in vals {
            self.basic.insert(v);
        }
        self.store.insert_keys(config, &keys);
    }

    /// Merge `other` into `self`, leaving `other` untouched.
    pub fn merge(&mut self, config: &Config, other: &Sketch) {
        self.basic.merge(&other.basic);
        self.store.merge(config, &other.store);
    }

    pub fn reset(&mut self) {
        self.store.bins.clear();
        self.store.count = 0;
        self.basic = Summary::default();
    }

    /// Return the value at quantile `q`.
    ///
    /// Quantiles at or below 0 return the minimum, at or above 1 the maximum;
    /// an empty sketch returns 0.
    pub fn quantile(&self, config: &Config, q: f64) -> f64 {
        if self.store.count == 0 {
            return 0.0;
        }
        if q <= 0.0 {
            return self.basic.min;
        }
        if q >= 1.0 {
            return self.basic.max;
        }

        let rank = rank(self.store.count, q);
        let last = self.store.bins.len() - 1;
        let mut n = 0.0;
        for (i, bin) in self.store.bins.iter().enumerate() {
            n += f64::from(bin.n);
            if n <= rank {
                continue;
            }
            let weight = (n - rank) / f64::from(bin.n);
            let mut v_low = config.f64(bin.k);
            let mut v_high = v_low * config.gamma();
            // both clamps apply on a single-bin sketch
            if i == 0 {
                v_low = self.basic.min;
            }
            if i == last {
                v_high = self.basic.max;
            }
            return v_low * weight + v_high * (1.0 - weight);
        }
        self.basic.max
    }

    /// Encode the sketch into its DDSketch protobuf wire form.
    pub fn encode_to_vec(&self, config: &Config) -> Result<Vec<u8>> {
        let proto = ddsketch::to_proto(config, self)?;
        Ok(proto.encode_to_vec())
    }
}

fn rank(count: u64, q: f64) -> f64 {
    (q * (count - 1) as f64).round_ties_even()
}
