// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::config::Config;
use crate::key::Key;

/// Maximum count a single bin can hold.
pub(crate) const MAX_BIN_WIDTH: u64 = u16::MAX as u64;

/// A bucket of the sketch: `n` values sharing the key `k`.
///
/// The same key may span several adjacent bins when its count overflows u16;
/// the partial remainder is stored before the full-width bins of that key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bin {
    pub k: Key,
    pub n: u16,
}

/// A (key, count) pair used for weighted inserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct KeyCount {
    pub(crate) k: Key,
    pub(crate) n: u64,
}

/// Ordered sequence of bins, sorted ascending by key.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct SparseStore {
    pub(crate) bins: Vec<Bin>,
    pub(crate) count: u64,
}

/// Append `n` values with key `k`, splitting into bins of at most
/// `MAX_BIN_WIDTH`. The remainder bin comes before the full ones.
fn append_safe(bins: &mut Vec<Bin>, k: Key, n: u64) {
    if n == 0 {
        return;
    }
    if n <= MAX_BIN_WIDTH {
        bins.push(Bin { k, n: n as u16 });
        return;
    }
    let remainder = (n % MAX_BIN_WIDTH) as u16;
    if remainder != 0 {
        bins.push(Bin { k, n: remainder });
    }
    for _ in 0..n / MAX_BIN_WIDTH {
        bins.push(Bin { k, n: u16::MAX });
    }
}

/// Number of leading entries of `keys[idx..]` equal to `keys[idx]`.
fn count_leading_equal(keys: &[Key], idx: usize) -> usize {
    let k = keys[idx];
    keys[idx..].iter().take_while(|&&key| key == k).count()
}

/// Sum the counts of the leading entries of `counts[idx..]` sharing a key.
/// Returns the index past the run and the summed count.
fn sum_leading_equal(counts: &[KeyCount], idx: usize) -> (usize, u64) {
    let k = counts[idx].k;
    let mut sum = 0;
    let mut next = idx;
    while next < counts.len() && counts[next].k == k {
        sum += counts[next].n;
        next += 1;
    }
    (next, sum)
}

/// Cap the number of bins by absorbing the leftmost ones into the first
/// retained bin. Counts above `MAX_BIN_WIDTH` spill into full-width bins
/// keeping the key of the bin being absorbed, reassembled ahead of the
/// retained tail. This skews the low tail of the distribution to the right,
/// which callers accept in exchange for the memory bound.
pub(crate) fn trim_left(bins: &mut Vec<Bin>, bin_limit: usize) {
    if bin_limit == 0 || bins.len() <= bin_limit {
        return;
    }
    let n_remove = bins.len() - bin_limit;
    let mut missing: u64 = 0;
    let mut overflow: Vec<Bin> = Vec::new();
    for bin in &bins[..n_remove] {
        missing += u64::from(bin.n);
        if missing > MAX_BIN_WIDTH {
            overflow.push(Bin {
                k: bin.k,
                n: u16::MAX,
            });
            missing -= MAX_BIN_WIDTH;
        }
    }
    let first_kept = bins[n_remove];
    missing += u64::from(first_kept.n);
    while missing > MAX_BIN_WIDTH {
        overflow.push(Bin {
            k: first_kept.k,
            n: u16::MAX,
        });
        missing -= MAX_BIN_WIDTH;
    }
    bins[n_remove] = Bin {
        k: first_kept.k,
        n: missing as u16,
    };
    overflow.extend_from_slice(&bins[n_remove..]);
    *bins = overflow;
}

impl SparseStore {
    /// Merge a sorted slice of keys into the bins with a single ordered walk.
    pub(crate) fn insert_keys(&mut self, config: &Config, keys: &[Key]) {
        debug_assert!(keys.windows(2).all(|w| w[0] <= w[1]));
        if keys.is_empty() {
            return;
        }
        self.count += keys.len() as u64;

        let mut tmp = Vec::with_capacity(self.bins.len() + keys.len());
        let mut bin_idx = 0;
        let mut key_idx = 0;
        while bin_idx < self.bins.len() && key_idx < keys.len() {
            let bin = self.bins[bin_idx];
            let key = keys[key_idx];
            if bin.k == key {
                let kn = count_leading_equal(keys, key_idx);
                append_safe(&mut tmp, key, u64::from(bin.n) + kn as u64);
                key_idx += kn;
                bin_idx += 1;
            } else if bin.k < key {
                tmp.push(bin);
                bin_idx += 1;
            } else {
                let kn = count_leading_equal(keys, key_idx);
                append_safe(&mut tmp, key, kn as u64);
                key_idx += kn;
            }
        }
        tmp.extend_from_slice(&self.bins[bin_idx..]);
        while key_idx < keys.len() {
            let kn = count_leading_equal(keys, key_idx);
            append_safe(&mut tmp, keys[key_idx], kn as u64);
            key_idx += kn;
        }
        trim_left(&mut tmp, config.bin_limit());
        self.bins = tmp;
    }

    /// Merge a sorted slice of (key, count) pairs into the bins.
    pub(crate) fn insert_counts(&mut self, config: &Config, counts: &[KeyCount]) {
        debug_assert!(counts.windows(2).all(|w| w[0].k <= w[1].k));
        let total: u64 = counts.iter().map(|kc| kc.n).sum();
        if total == 0 {
            return;
        }
        self.count += total;

        let mut tmp = Vec::with_capacity(self.bins.len() + counts.len());
        let mut bin_idx = 0;
        let mut idx = 0;
        while bin_idx < self.bins.len() && idx < counts.len() {
            let bin = self.bins[bin_idx];
            let key = counts[idx].k;
            if bin.k == key {
                let (next, kn) = sum_leading_equal(counts, idx);
                append_safe(&mut tmp, key, u64::from(bin.n) + kn);
                idx = next;
                bin_idx += 1;
            } else if bin.k < key {
                tmp.push(bin);
                bin_idx += 1;
            } else {
                let (next, kn) = sum_leading_equal(counts, idx);
                append_safe(&mut tmp, key, kn);
                idx = next;
            }
        }
        tmp.extend_from_slice(&self.bins[bin_idx..]);
        while idx < counts.len() {
            let (next, kn) = sum_leading_equal(counts, idx);
            append_safe(&mut tmp, counts[idx].k, kn);
            idx = next;
        }
        trim_left(&mut tmp, config.bin_limit());
        self.bins = tmp;
    }

    /// Merge another store into this one, leaving `other` untouched.
    pub(crate) fn merge(&mut self, config: &Config, other: &SparseStore) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            self.bins = other.bins.clone();
            self.count = other.count;
            return;
        }
        self.count += other.count;

        let mut tmp = Vec::with_capacity(self.bins.len() + other.bins.len());
        let mut i = 0;
        let mut j = 0;
        while i < self.bins.len() && j < other.bins.len() {
            let a = self.bins[i];
            let b = other.bins[j];
            if a.k == b.k {
                append_safe(&mut tmp, a.k, u64::from(a.n) + u64::from(b.n));
                i += 1;
                j += 1;
            } else if a.k < b.k {
                tmp.push(a);
                i += 1;
            } else {
                tmp.push(b);
                j += 1;
            }
        }
        tmp.extend_from_slice(&self.bins[i..]);
        tmp.extend_from_slice(&other.bins[j..]);
        trim_left(&mut tmp, config.bin_limit());
        self.bins = tmp;
    }
}
