// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Aggregation keys and the per-group stats they index.
//!
//! Spans are grouped twice: the payload key carries the identity of the
//! emitting tracer, the buckets key the span fields the stats are broken
//! down by. Counts accumulate as floats so that many small sampling weights
//! don't lose precision, and are snapped to integers only on export.

use std::collections::HashMap;

use anyhow::Result;
use log::error;
use rand::rngs::SmallRng;
use rand::Rng;

use datadog_quantile::{Agent, Config as SketchConfig};
use datadog_stats_protobuf::pb;

const TAG_STATUS_CODE: &str = "http.status_code";
const TAG_SYNTHETICS_PREFIX: &str = "synthetics";

/// Top layer of the aggregation key: identifies the payload a stats entry
/// belongs to.
#[derive(Debug, Hash, PartialEq, Eq, Clone, Default)]
pub struct PayloadAggregationKey {
    pub env: String,
    pub hostname: String,
    pub version: String,
    pub container_id: String,
}

/// Bottom layer of the aggregation key: identifies a stats group within a
/// time bucket.
#[derive(Debug, Hash, PartialEq, Eq, Clone, Default)]
pub struct BucketsAggregationKey {
    pub service: String,
    pub name: String,
    pub resource: String,
    pub span_type: String,
    pub status_code: u32,
    pub synthetics: bool,
}

/// Compound key identifying one grouped-stats entry within a time bucket.
#[derive(Debug, Hash, PartialEq, Eq, Clone, Default)]
pub struct Aggregation {
    pub payload_key: PayloadAggregationKey,
    pub buckets_key: BucketsAggregationKey,
}

impl Aggregation {
    /// Return the aggregation key matching the given span.
    pub fn from_span(
        span: &pb::Span,
        origin: &str,
        payload_key: PayloadAggregationKey,
    ) -> Aggregation {
        Aggregation {
            payload_key,
            buckets_key: BucketsAggregationKey {
                service: span.service.clone(),
                name: span.name.clone(),
                resource: span.resource.clone(),
                span_type: span.r#type.clone(),
                status_code: get_status_code(span),
                synthetics: origin.starts_with(TAG_SYNTHETICS_PREFIX),
            },
        }
    }
}

/// Return the status code of a span based on the metrics and meta tags.
fn get_status_code(span: &pb::Span) -> u32 {
    if let Some(status_code) = span.metrics.get(TAG_STATUS_CODE) {
        *status_code as u32
    } else if let Some(status_code) = span.meta.get(TAG_STATUS_CODE) {
        status_code.parse().unwrap_or(0)
    } else {
        0
    }
}

/// The stats accumulated for one aggregation key.
#[derive(Debug, Default, Clone)]
pub(crate) struct GroupedStats {
    hits: f64,
    top_level_hits: f64,
    errors: f64,
    duration: f64,
    ok_distribution: Agent,
    err_distribution: Agent,
}

impl GroupedStats {
    fn insert(&mut self, config: &SketchConfig, span: &pb::Span, weight: f64, is_top: bool) {
        self.hits += weight;
        if is_top {
            self.top_level_hits += weight;
        }
        if span.error != 0 {
            self.errors += weight;
        }
        self.duration += span.duration as f64 * weight;

        let trunc_duration = ns_timestamp_to_float(span.duration.max(0) as u64);
        if span.error != 0 {
            self.err_distribution.insert(config, trunc_duration, 1.0);
        } else {
            self.ok_distribution.insert(config, trunc_duration, 1.0);
        }
    }

    fn export(
        mut self,
        config: &SketchConfig,
        key: &BucketsAggregationKey,
        rng: &mut SmallRng,
    ) -> Result<pb::ClientGroupedStats> {
        let ok_summary = match self.ok_distribution.finish(config) {
            Some(sketch) => sketch.encode_to_vec(config)?,
            None => Vec::new(),
        };
        let error_summary = match self.err_distribution.finish(config) {
            Some(sketch) => sketch.encode_to_vec(config)?,
            None => Vec::new(),
        };
        Ok(pb::ClientGroupedStats {
            service: key.service.clone(),
            name: key.name.clone(),
            resource: key.resource.clone(),
            http_status_code: key.status_code,
            r#type: key.span_type.clone(),
            synthetics: key.synthetics,

            hits: round(self.hits, rng),
            errors: round(self.errors, rng),
            duration: round(self.duration, rng),
            top_level_hits: round(self.top_level_hits, rng),

            ok_summary,
            error_summary,
        })
    }
}

/// A time bucket of raw stats, keyed by aggregation key.
#[derive(Debug, Clone)]
pub(crate) struct RawBucket {
    start: u64,
    duration: u64,
    data: HashMap<Aggregation, GroupedStats>,
}

impl RawBucket {
    pub(crate) fn new(start: u64, duration: u64) -> RawBucket {
        RawBucket {
            start,
            duration,
            data: HashMap::new(),
        }
    }

    /// Add a span to the stats group matching its aggregation key, creating
    /// the group on first sight.
    pub(crate) fn handle_span(
        &mut self,
        config: &SketchConfig,
        span: &pb::Span,
        weight: f64,
        is_top: bool,
        origin: &str,
        payload_key: PayloadAggregationKey,
    ) {
        assert!(!payload_key.env.is_empty(), "env should never be empty");
        let key = Aggregation::from_span(span, origin, payload_key);
        self.data
            .entry(key)
            .or_default()
            .insert(config, span, weight, is_top);
    }

    /// Convert the bucket into one ClientStatsBucket per payload key. A
    /// grouped-stats entry whose sketches fail to encode is dropped with a
    /// diagnostic and the export continues.
    pub(crate) fn export(
        self,
        config: &SketchConfig,
        rng: &mut SmallRng,
    ) -> HashMap<PayloadAggregationKey, pb::ClientStatsBucket> {
        let mut out: HashMap<PayloadAggregationKey, pb::ClientStatsBucket> = HashMap::new();
        for (key, stats) in self.data {
            let group = match stats.export(config, &key.buckets_key, rng) {
                Ok(group) => group,
                Err(err) => {
                    error!("Dropping stats group due to sketch encoding failure: {err}");
                    continue;
                }
            };
            out.entry(key.payload_key)
                .or_insert_with(|| pb::ClientStatsBucket {
                    start: self.start,
                    duration: self.duration,
                    stats: Vec::new(),
                    agent_time_shift: 0,
                })
                .stats
                .push(group);
        }
        out
    }
}

/// Round a float count to an integer, rounding up with a probability equal
/// to the fractional part. This keeps the expected sum of weights unbiased
/// across many exports.
fn round(v: f64, rng: &mut SmallRng) -> u64 {
    let i = v as u64;
    if rng.gen::<f64>() < v - i as f64 {
        i + 1
    } else {
        i
    }
}

/// Quantize a nanosecond duration to 10 bits of precision. This caps the
/// number of distinct values fed to the sketches while staying within about
/// 0.1% of the original duration.
fn ns_timestamp_to_float(mut ns: u64) -> f64 {
    let mut shift = 0;
    while ns > 1 << 10 {
        ns >>= 1;
        shift += 1;
    }
    (ns << shift) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn test_span(status_meta: Option<&str>, status_metric: Option<f64>) -> pb::Span {
        let mut span = pb::Span {
            service: "service".to_string(),
            name: "op".to_string(),
            resource: "res".to_string(),
            r#type: "web".to_string(),
            duration: 1_000_000,
            ..Default::default()
        };
        if let Some(code) = status_meta {
            span.meta.insert(TAG_STATUS_CODE.to_string(), code.to_string());
        }
        if let Some(code) = status_metric {
            span.metrics.insert(TAG_STATUS_CODE.to_string(), code);
        }
        span
    }

    #[test]
    fn test_status_code_from_metrics() {
        assert_eq!(get_status_code(&test_span(None, Some(418.0))), 418);
    }

    #[test]
    fn test_status_code_meta_fallback() {
        assert_eq!(get_status_code(&test_span(Some("503"), None)), 503);
        // metrics win over meta
        assert_eq!(get_status_code(&test_span(Some("503"), Some(200.0))), 200);
    }

    #[test]
    fn test_status_code_invalid_or_missing() {
        assert_eq!(get_status_code(&test_span(Some("x"), None)), 0);
        assert_eq!(get_status_code(&test_span(None, None)), 0);
    }

    #[test]
    fn test_synthetics_origin_prefix() {
        let span = test_span(None, None);
        let payload_key = PayloadAggregationKey {
            env: "env".to_string(),
            ..Default::default()
        };
        let key = Aggregation::from_span(&span, "synthetics-browser", payload_key.clone());
        assert!(key.buckets_key.synthetics);
        let key = Aggregation::from_span(&span, "rum", payload_key.clone());
        assert!(!key.buckets_key.synthetics);
        let key = Aggregation::from_span(&span, "", payload_key);
        assert!(!key.buckets_key.synthetics);
    }

    #[test]
    #[should_panic(expected = "env should never be empty")]
    fn test_empty_env_panics() {
        let mut bucket = RawBucket::new(0, 10);
        let span = test_span(None, None);
        bucket.handle_span(
            &SketchConfig::default(),
            &span,
            1.0,
            true,
            "",
            PayloadAggregationKey::default(),
        );
    }

    #[test]
    fn test_probabilistic_round_is_exact_on_integers() {
        let mut rng = SmallRng::seed_from_u64(42);
        assert_eq!(round(3.0, &mut rng), 3);
        assert_eq!(round(0.0, &mut rng), 0);
    }

    #[test]
    fn test_probabilistic_round_preserves_expectation() {
        let mut rng = SmallRng::seed_from_u64(42);
        let total: u64 = (0..10_000).map(|_| round(0.25, &mut rng)).sum();
        // expectation is 2500, allow a generous band
        assert!((2000..=3000).contains(&total), "total was {total}");
    }

    #[test]
    fn test_ns_timestamp_quantization() {
        // small durations stay exact
        assert_eq!(ns_timestamp_to_float(100), 100.0);
        assert_eq!(ns_timestamp_to_float(1024), 1024.0);
        // larger ones keep 10 bits of precision
        let quantized = ns_timestamp_to_float(1_000_000_007);
        assert!(quantized <= 1_000_000_007.0);
        assert!((1_000_000_007.0 - quantized) / 1_000_000_007.0 < 0.002);
        // idempotent on already-quantized values
        assert_eq!(ns_timestamp_to_float(quantized as u64), quantized);
    }

    #[test]
    fn test_export_groups_by_payload_key() {
        let config = SketchConfig::default();
        let mut rng = SmallRng::seed_from_u64(1);
        let mut bucket = RawBucket::new(10_000_000_000, 10_000_000_000);
        let span = test_span(None, None);
        let key_a = PayloadAggregationKey {
            env: "env-a".to_string(),
            ..Default::default()
        };
        let key_b = PayloadAggregationKey {
            env: "env-b".to_string(),
            ..Default::default()
        };
        bucket.handle_span(&config, &span, 1.0, true, "", key_a.clone());
        bucket.handle_span(&config, &span, 1.0, true, "", key_a.clone());
        bucket.handle_span(&config, &span, 1.0, false, "", key_b.clone());

        let exported = bucket.export(&config, &mut rng);
        assert_eq!(exported.len(), 2);
        let bucket_a = &exported[&key_a];
        assert_eq!(bucket_a.start, 10_000_000_000);
        assert_eq!(bucket_a.duration, 10_000_000_000);
        assert_eq!(bucket_a.stats.len(), 1);
        assert_eq!(bucket_a.stats[0].hits, 2);
        assert_eq!(bucket_a.stats[0].top_level_hits, 2);
        assert_eq!(bucket_a.stats[0].errors, 0);
        assert!(!bucket_a.stats[0].ok_summary.is_empty());
        assert!(bucket_a.stats[0].error_summary.is_empty());
        let bucket_b = &exported[&key_b];
        assert_eq!(bucket_b.stats[0].top_level_hits, 0);
    }

    #[test]
    fn test_weighted_counts_accumulate_as_floats() {
        let config = SketchConfig::default();
        let mut rng = SmallRng::seed_from_u64(7);
        let mut bucket = RawBucket::new(0, 10);
        let mut span = test_span(None, None);
        span.error = 1;
        let payload_key = PayloadAggregationKey {
            env: "env".to_string(),
            ..Default::default()
        };
        // 8 spans with weight 0.5 each: exactly 4 hits after rounding
        for _ in 0..8 {
            bucket.handle_span(&config, &span, 0.5, false, "", payload_key.clone());
        }
        let exported = bucket.export(&config, &mut rng);
        let group = &exported[&payload_key].stats[0];
        assert_eq!(group.hits, 4);
        assert_eq!(group.errors, 4);
        assert!(!group.error_summary.is_empty());
        assert!(group.ok_summary.is_empty());
    }
}
