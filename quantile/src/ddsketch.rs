// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Conversion between agent sketches and DDSketch-style logarithmic
//! sketches, in both directions.

use anyhow::{anyhow, bail, ensure, Result};
use prost::Message;

use crate::config::Config;
use crate::key::{is_inf, Key};
use crate::pb;
use crate::sketch::Sketch;
use crate::store::KeyCount;
use crate::summary::Summary;

/// Capability view over a foreign logarithmic sketch.
///
/// The conversion only needs the mapping parameters, iteration over the
/// positive and negative stores, the zero bucket and the exact summaries;
/// any DDSketch flavor providing those can be converted.
pub trait LogSketch {
    fn gamma(&self) -> f64;
    fn index_offset(&self) -> f64;
    fn zero_count(&self) -> f64;
    fn sum(&self) -> f64;
    fn min(&self) -> f64;
    fn max(&self) -> f64;
    /// Visit each (index, count) pair of the positive value store.
    fn for_each_positive(&self, visit: &mut dyn FnMut(i32, f64));
    /// Visit each (index, count) pair of the negative value store.
    fn for_each_negative(&self, visit: &mut dyn FnMut(i32, f64));
}

/// Logarithmic index mapping of the reference sketch: the index of a value
/// is the floor of its log in base gamma, shifted by the offset.
struct LogarithmicMapping {
    gamma: f64,
    index_offset: f64,
    multiplier: f64,
}

impl LogarithmicMapping {
    fn new(gamma: f64, index_offset: f64) -> Result<LogarithmicMapping> {
        ensure!(gamma > 1.0, "gamma must be greater than 1, got {gamma}");
        Ok(LogarithmicMapping {
            gamma,
            index_offset,
            multiplier: 1.0 / gamma.ln(),
        })
    }

    fn relative_accuracy(&self) -> f64 {
        1.0 - 2.0 / (1.0 + self.gamma)
    }

    fn index(&self, value: f64) -> i32 {
        let index = value.ln() * self.multiplier + self.index_offset;
        if index >= 0.0 {
            index as i32
        } else {
            index as i32 - 1
        }
    }

    fn lower_bound(&self, index: i32) -> f64 {
        ((f64::from(index) - self.index_offset) / self.multiplier).exp()
    }

    /// Representative value of the bucket at `index`.
    fn value(&self, index: i32) -> f64 {
        self.lower_bound(index) * (1.0 + self.relative_accuracy())
    }
}

/// Convert a foreign logarithmic sketch into an agent [`Sketch`].
///
/// The foreign indices are remapped through a mapping whose offset is the
/// agent bias plus one half: the half-key shift makes the reference
/// mapping's floor land on the same buckets as this engine's round-to-even
/// keys. Remapped indices at or below zero fold into the zero bucket;
/// indices beyond the key range are an error.
pub fn from_log_sketch(config: &Config, source: &dyn LogSketch) -> Result<Sketch> {
    let source_mapping = LogarithmicMapping::new(source.gamma(), source.index_offset())?;
    let target_mapping =
        LogarithmicMapping::new(source.gamma(), f64::from(config.bias()) + 0.5)?;

    let mut zeroes = source.zero_count();
    let mut entries: Vec<(Key, f64)> = Vec::new();
    let mut overflowed = false;

    source.for_each_positive(&mut |index, count| {
        let k = target_mapping.index(source_mapping.value(index));
        if k <= 0 {
            zeroes += count;
        } else if k >= i32::from(i16::MAX) {
            overflowed = true;
        } else {
            entries.push((k as Key, count));
        }
    });
    source.for_each_negative(&mut |index, count| {
        let k = target_mapping.index(source_mapping.value(index));
        if k <= 0 {
            zeroes += count;
        } else if k >= i32::from(i16::MAX) {
            overflowed = true;
        } else {
            entries.push((-(k as Key), count));
        }
    });
    if overflowed {
        bail!("bucket index overflows the sketch key range");
    }
    if zeroes > 0.0 {
        entries.push((0, zeroes));
    }

    let counts = counts_from_float(&mut entries);
    let cnt: u64 = counts.iter().map(|kc| kc.n).sum();

    let mut sketch = Sketch::default();
    sketch.store.insert_counts(config, &counts);
    sketch.basic = Summary {
        cnt,
        min: source.min(),
        max: source.max(),
        sum: source.sum(),
        avg: if cnt > 0 { source.sum() / cnt as f64 } else { 0.0 },
    };
    Ok(sketch)
}

/// Decode a DDSketch protobuf payload into an agent sketch.
pub fn from_encoded(config: &Config, data: &[u8]) -> Result<Sketch> {
    let proto =
        pb::DdSketch::decode(data).map_err(|e| anyhow!("invalid sketch payload: {e}"))?;
    if let Some(mapping) = &proto.mapping {
        ensure!(
            mapping.interpolation == pb::index_mapping::Interpolation::None as i32,
            "unsupported index mapping interpolation: {}",
            mapping.interpolation
        );
    }
    from_log_sketch(config, &proto)
}

/// Convert an agent sketch into the DDSketch protobuf form.
///
/// Bins keyed at the infinity sentinels have no representable value and
/// fail the conversion.
pub fn to_proto(config: &Config, sketch: &Sketch) -> Result<pb::DdSketch> {
    let mut positive = pb::Store::default();
    let mut negative = pb::Store::default();
    let mut zero_count = 0.0_f64;
    for bin in sketch.bins() {
        ensure!(
            !is_inf(bin.k),
            "cannot encode a sketch holding an infinity key"
        );
        let n = f64::from(bin.n);
        if bin.k == 0 {
            zero_count += n;
        } else if bin.k > 0 {
            *positive.bin_counts.entry(i32::from(bin.k)).or_insert(0.0) += n;
        } else {
            *negative.bin_counts.entry(i32::from(-bin.k)).or_insert(0.0) += n;
        }
    }
    Ok(pb::DdSketch {
        mapping: Some(pb::IndexMapping {
            gamma: config.gamma(),
            index_offset: f64::from(config.bias()),
            interpolation: pb::index_mapping::Interpolation::None as i32,
        }),
        positive_values: Some(positive),
        negative_values: Some(negative),
        zero_count,
    })
}

/// Redistribute float counts into integer counts, carrying the fractional
/// leftover of each bucket into the next one. The total is conserved to
/// within one: a final leftover of at least one half rounds the last bucket
/// up. Buckets that floor to zero are not emitted.
fn counts_from_float(entries: &mut Vec<(Key, f64)>) -> Vec<KeyCount> {
    entries.sort_by_key(|&(k, _)| k);
    let mut counts: Vec<KeyCount> = Vec::with_capacity(entries.len());
    let mut leftover = 0.0_f64;
    for &(k, c) in entries.iter() {
        let total = c + leftover;
        let n = total as u64;
        leftover = total - n as f64;
        if n > 0 {
            counts.push(KeyCount { k, n });
        }
    }
    if leftover >= 0.5 {
        if let Some(last) = counts.last_mut() {
            last.n += 1;
        }
    }
    counts
}

fn store_bins(store: Option<&pb::Store>, visit: &mut dyn FnMut(i32, f64)) {
    let Some(store) = store else { return };
    for (&index, &count) in &store.bin_counts {
        if count > 0.0 {
            visit(index, count);
        }
    }
    for (i, &count) in store.contiguous_bin_counts.iter().enumerate() {
        if count > 0.0 {
            visit(store.contiguous_bin_index_offset + i as i32, count);
        }
    }
}

/// Smallest and largest populated index of a store, if any.
fn store_extent(store: Option<&pb::Store>) -> Option<(i32, i32)> {
    let mut extent: Option<(i32, i32)> = None;
    store_bins(store, &mut |index, _| {
        extent = Some(match extent {
            None => (index, index),
            Some((lo, hi)) => (lo.min(index), hi.max(index)),
        });
    });
    extent
}

impl pb::DdSketch {
    fn log_mapping(&self) -> Option<LogarithmicMapping> {
        let mapping = self.mapping.as_ref()?;
        LogarithmicMapping::new(mapping.gamma, mapping.index_offset).ok()
    }
}

impl LogSketch for pb::DdSketch {
    fn gamma(&self) -> f64 {
        self.mapping.as_ref().map_or(0.0, |m| m.gamma)
    }

    fn index_offset(&self) -> f64 {
        self.mapping.as_ref().map_or(0.0, |m| m.index_offset)
    }

    fn zero_count(&self) -> f64 {
        self.zero_count
    }

    fn sum(&self) -> f64 {
        let Some(mapping) = self.log_mapping() else {
            return 0.0;
        };
        let mut sum = 0.0;
        store_bins(self.positive_values.as_ref(), &mut |index, count| {
            sum += count * mapping.value(index);
        });
        store_bins(self.negative_values.as_ref(), &mut |index, count| {
            sum -= count * mapping.value(index);
        });
        sum
    }

    fn min(&self) -> f64 {
        let Some(mapping) = self.log_mapping() else {
            return 0.0;
        };
        if let Some((_, hi)) = store_extent(self.negative_values.as_ref()) {
            return -mapping.value(hi);
        }
        if self.zero_count > 0.0 {
            return 0.0;
        }
        match store_extent(self.positive_values.as_ref()) {
            Some((lo, _)) => mapping.value(lo),
            None => 0.0,
        }
    }

    fn max(&self) -> f64 {
        let Some(mapping) = self.log_mapping() else {
            return 0.0;
        };
        if let Some((_, hi)) = store_extent(self.positive_values.as_ref()) {
            return mapping.value(hi);
        }
        if self.zero_count > 0.0 {
            return 0.0;
        }
        match store_extent(self.negative_values.as_ref()) {
            Some((lo, _)) => -mapping.value(lo),
            None => 0.0,
        }
    }

    fn for_each_positive(&self, visit: &mut dyn FnMut(i32, f64)) {
        store_bins(self.positive_values.as_ref(), visit);
    }

    fn for_each_negative(&self, visit: &mut dyn FnMut(i32, f64)) {
        store_bins(self.negative_values.as_ref(), visit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;

    fn proto_with_positive_bins(
        config: &Config,
        bins: &[(i32, f64)],
        zero_count: f64,
    ) -> pb::DdSketch {
        pb::DdSketch {
            mapping: Some(pb::IndexMapping {
                gamma: config.gamma(),
                index_offset: 0.0,
                interpolation: pb::index_mapping::Interpolation::None as i32,
            }),
            positive_values: Some(pb::Store {
                bin_counts: bins.iter().copied().collect(),
                contiguous_bin_counts: vec![],
                contiguous_bin_index_offset: 0,
            }),
            negative_values: None,
            zero_count,
        }
    }

    #[test]
    fn test_round_trip_through_proto() {
        let config = Config::default();
        let mut agent = Agent::default();
        for v in [0.25, 1.0, 1.0, 2.0, 35.2, 1000.0] {
            agent.insert(&config, v, 1.0);
        }
        let sketch = agent.finish(&config).unwrap();

        let encoded = sketch.encode_to_vec(&config).unwrap();
        let decoded = from_encoded(&config, &encoded).unwrap();

        assert_eq!(decoded.bins(), sketch.bins());
        assert_eq!(decoded.count(), sketch.count());
        // Extrema come back from the mapping, within its relative accuracy.
        assert!((decoded.basic.min - 0.25).abs() / 0.25 < 0.02);
        assert!((decoded.basic.max - 1000.0).abs() / 1000.0 < 0.02);
    }

    #[test]
    fn test_round_trip_with_negative_and_zero_values() {
        let config = Config::default();
        let mut agent = Agent::default();
        for v in [-5.0, -1.0, 0.0, 3.0] {
            agent.insert(&config, v, 1.0);
        }
        let sketch = agent.finish(&config).unwrap();

        let encoded = sketch.encode_to_vec(&config).unwrap();
        let decoded = from_encoded(&config, &encoded).unwrap();

        assert_eq!(decoded.bins(), sketch.bins());
        assert_eq!(decoded.count(), 4);
        assert!(decoded.basic.min < 0.0);
    }

    #[test]
    fn test_low_indices_fold_into_zero_bucket() {
        let config = Config::default();
        // Indices far below the representable range remap at or below key 0.
        let proto = proto_with_positive_bins(&config, &[(-2000, 3.0)], 2.0);
        let sketch = from_log_sketch(&config, &proto).unwrap();
        assert_eq!(sketch.count(), 5);
        assert_eq!(sketch.bins().len(), 1);
        assert_eq!(sketch.bins()[0].k, 0);
    }

    #[test]
    fn test_index_overflow_is_rejected() {
        let config = Config::default();
        let proto = proto_with_positive_bins(&config, &[(33_000, 1.0)], 0.0);
        assert!(from_log_sketch(&config, &proto).is_err());
    }

    #[test]
    fn test_unsupported_interpolation_is_rejected() {
        let config = Config::default();
        let mut proto = proto_with_positive_bins(&config, &[(10, 1.0)], 0.0);
        proto.mapping.as_mut().unwrap().interpolation =
            pb::index_mapping::Interpolation::Cubic as i32;
        let encoded = proto.encode_to_vec();
        assert!(from_encoded(&config, &encoded).is_err());
    }

    #[test]
    fn test_garbage_payload_is_rejected() {
        let config = Config::default();
        assert!(from_encoded(&config, b"not a sketch").is_err());
    }

    #[test]
    fn test_float_counts_are_conserved() {
        let config = Config::default();
        // 20 buckets of 0.45: total 9, no single bucket floors above zero
        // without the carried leftover.
        let bins: Vec<(i32, f64)> = (100..120).map(|i| (i, 0.45)).collect();
        let proto = proto_with_positive_bins(&config, &bins, 0.0);
        let sketch = from_log_sketch(&config, &proto).unwrap();
        let total = 20.0 * 0.45;
        assert!((sketch.count() as f64 - total).abs() <= 1.0);
    }

    #[test]
    fn test_counts_from_float_rounds_final_leftover_up() {
        let mut entries: Vec<(Key, f64)> = vec![(1, 1.2), (2, 1.4)];
        let counts = counts_from_float(&mut entries);
        // 2.6 in total: 1 + 1, leftover 0.6 rounds the last bucket up.
        assert_eq!(
            counts,
            vec![KeyCount { k: 1, n: 1 }, KeyCount { k: 2, n: 2 }]
        );
    }

    #[test]
    fn test_contiguous_store_representation() {
        let config = Config::default();
        let proto = pb::DdSketch {
            mapping: Some(pb::IndexMapping {
                gamma: config.gamma(),
                index_offset: 0.0,
                interpolation: pb::index_mapping::Interpolation::None as i32,
            }),
            positive_values: Some(pb::Store {
                bin_counts: Default::default(),
                contiguous_bin_counts: vec![1.0, 2.0, 3.0],
                contiguous_bin_index_offset: 50,
            }),
            negative_values: None,
            zero_count: 0.0,
        };
        let sketch = from_log_sketch(&config, &proto).unwrap();
        assert_eq!(sketch.count(), 6);
        assert!(sketch.bins().iter().all(|b| b.k > 0));
    }
}
