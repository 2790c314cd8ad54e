// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helpers reading the span tags that drive stats computation.

use datadog_stats_protobuf::pb;

/// Metric set on spans at the top level of their service subtree.
const TOP_LEVEL_KEY: &str = "_top_level";
/// Metric set by tracers on spans that must be measured regardless of their
/// position in the trace.
const MEASURED_KEY: &str = "_dd.measured";
/// Metric present on partial snapshots of long-running spans.
const PARTIAL_VERSION_KEY: &str = "_dd.partial_version";
/// Metric carrying the rate at which the trace was sampled upstream.
const SAMPLE_RATE_KEY: &str = "_sample_rate";

fn has_flag(span: &pb::Span, key: &str) -> bool {
    span.metrics.get(key).is_some_and(|v| *v == 1.0)
}

/// Return true if the span starts a service boundary.
pub fn has_top_level(span: &pb::Span) -> bool {
    has_flag(span, TOP_LEVEL_KEY)
}

/// Return true if the span was flagged as stats-eligible by the
/// instrumentation.
pub fn is_measured(span: &pb::Span) -> bool {
    has_flag(span, MEASURED_KEY)
}

/// Return true if the span is a partial snapshot of a still-running span,
/// identified by a non-negative partial version.
pub fn is_partial_snapshot(span: &pb::Span) -> bool {
    span.metrics
        .get(PARTIAL_VERSION_KEY)
        .is_some_and(|v| *v >= 0.0)
}

/// Weight compensating for upstream trace sampling, computed from the root
/// span. 1 when the sample rate is missing or out of range.
pub fn weight(root: &pb::Span) -> f64 {
    match root.metrics.get(SAMPLE_RATE_KEY) {
        Some(&rate) if rate > 0.0 && rate <= 1.0 => 1.0 / rate,
        _ => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn span_with_metrics(metrics: &[(&str, f64)]) -> pb::Span {
        pb::Span {
            metrics: metrics
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect::<HashMap<_, _>>(),
            ..Default::default()
        }
    }

    #[test]
    fn test_top_level_and_measured() {
        assert!(has_top_level(&span_with_metrics(&[("_top_level", 1.0)])));
        assert!(!has_top_level(&span_with_metrics(&[("_top_level", 0.0)])));
        assert!(!has_top_level(&span_with_metrics(&[])));
        assert!(is_measured(&span_with_metrics(&[("_dd.measured", 1.0)])));
        assert!(!is_measured(&span_with_metrics(&[])));
    }

    #[test]
    fn test_partial_snapshot() {
        assert!(is_partial_snapshot(&span_with_metrics(&[(
            "_dd.partial_version",
            2.0
        )])));
        assert!(!is_partial_snapshot(&span_with_metrics(&[(
            "_dd.partial_version",
            -1.0
        )])));
        assert!(!is_partial_snapshot(&span_with_metrics(&[])));
    }

    #[test]
    fn test_weight() {
        assert_eq!(weight(&span_with_metrics(&[])), 1.0);
        assert_eq!(weight(&span_with_metrics(&[("_sample_rate", 0.5)])), 2.0);
        assert_eq!(weight(&span_with_metrics(&[("_sample_rate", 0.0)])), 1.0);
        assert_eq!(weight(&span_with_metrics(&[("_sample_rate", 2.0)])), 1.0);
    }
}
