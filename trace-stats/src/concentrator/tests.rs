// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;

use datadog_stats_protobuf::pb;

use super::{align_timestamp, Concentrator, Input, ProcessedTrace};
use crate::{Clock, Config};

const BUCKET_SIZE: u64 = 10_000_000_000;

fn secs(s: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(s)
}

fn top_level_span(end_secs: u64) -> pb::Span {
    let duration = 1_000_000_000_i64;
    pb::Span {
        service: "service".to_string(),
        name: "op".to_string(),
        resource: "res".to_string(),
        start: (end_secs * 1_000_000_000) as i64 - duration,
        duration,
        metrics: HashMap::from([("_top_level".to_string(), 1.0)]),
        ..Default::default()
    }
}

fn input_for(spans: Vec<pb::Span>, tracer_env: &str) -> Input {
    let root = spans.first().cloned().unwrap_or_default();
    Input {
        traces: vec![ProcessedTrace {
            chunk: pb::TraceChunk {
                spans,
                ..Default::default()
            },
            root,
            tracer_hostname: String::new(),
            tracer_env: tracer_env.to_string(),
            app_version: "v1".to_string(),
        }],
        container_id: "cid".to_string(),
    }
}

fn new_concentrator(now: SystemTime) -> Concentrator {
    let (out, _out_rx) = mpsc::channel(10);
    let mut config = Config::new("agent-env");
    config.hostname = "agent-host".to_string();
    config.agent_version = "0.5.0".to_string();
    Concentrator::new(&config, out, now).unwrap()
}

fn all_stats(payload: &pb::StatsPayload) -> Vec<&pb::ClientStatsBucket> {
    payload.stats.iter().flat_map(|p| p.stats.iter()).collect()
}

#[test]
fn test_align_timestamp() {
    assert_eq!(align_timestamp(1_234_567, 1_000), 1_234_000);
    assert_eq!(align_timestamp(1_000, 1_000), 1_000);
}

// A span older than the oldest accepted timestamp lands in the oldest
// bucket instead of creating one in the past.
#[test]
fn test_late_span_redirects_to_oldest_bucket() {
    let now = secs(1000);
    let concentrator = new_concentrator(now);
    concentrator.add(input_for(vec![top_level_span(800)], "env"));

    let payload = concentrator.flush(now, true);
    let buckets = all_stats(&payload);
    assert_eq!(buckets.len(), 1);
    assert_eq!(buckets[0].start, 1000 * 1_000_000_000);
    assert_eq!(buckets[0].duration, BUCKET_SIZE);
    assert_eq!(buckets[0].stats[0].hits, 1);
}

// Without force, the two most recent bucket intervals are held back.
#[test]
fn test_flush_holds_back_recent_buckets() {
    let now = secs(1000);
    let concentrator = new_concentrator(now);
    concentrator.add(input_for(vec![top_level_span(999)], "env"));

    let payload = concentrator.flush(now, false);
    assert!(payload.stats.is_empty(), "recent bucket must be held back");

    // two bucket intervals later the bucket is old enough
    let payload = concentrator.flush(secs(1020), false);
    let buckets = all_stats(&payload);
    assert_eq!(buckets.len(), 1);
    assert_eq!(buckets[0].start, 990 * 1_000_000_000);
    let now_ts = 1020 * 1_000_000_000;
    assert!(buckets[0].start <= now_ts - 2 * BUCKET_SIZE);
}

#[test]
fn test_flush_emits_nothing_twice() {
    let now = secs(1000);
    let concentrator = new_concentrator(now);
    concentrator.add(input_for(vec![top_level_span(999)], "env"));
    let first = concentrator.flush(secs(1050), false);
    assert_eq!(all_stats(&first).len(), 1);
    let second = concentrator.flush(secs(1050), false);
    assert!(all_stats(&second).is_empty());
}

#[test]
fn test_grouping_by_payload_key() {
    let now = secs(1000);
    let concentrator = new_concentrator(now);
    concentrator.add(input_for(vec![top_level_span(999)], "env-a"));
    concentrator.add(input_for(vec![top_level_span(999)], "env-b"));

    let payload = concentrator.flush(now, true);
    assert_eq!(payload.stats.len(), 2);
    let mut envs: Vec<&str> = payload.stats.iter().map(|p| p.env.as_str()).collect();
    envs.sort_unstable();
    assert_eq!(envs, vec!["env-a", "env-b"]);
    for client_payload in &payload.stats {
        assert_eq!(client_payload.version, "v1");
        assert_eq!(client_payload.container_id, "cid");
    }
    assert!(!payload.client_computed);
    assert_eq!(payload.agent_hostname, "agent-host");
    assert_eq!(payload.agent_env, "agent-env");
}

// Traces without an env fall back to the agent default.
#[test]
fn test_env_fallback() {
    let now = secs(1000);
    let concentrator = new_concentrator(now);
    concentrator.add(input_for(vec![top_level_span(999)], ""));

    let payload = concentrator.flush(now, true);
    assert_eq!(payload.stats.len(), 1);
    assert_eq!(payload.stats[0].env, "agent-env");
    assert_eq!(payload.stats[0].hostname, "agent-host");
}

#[test]
fn test_container_id_feature_gate() {
    let now = secs(1000);
    let (out, _out_rx) = mpsc::channel(10);
    let mut config = Config::new("agent-env");
    config.features.disable_cid_stats = true;
    let concentrator = Concentrator::new(&config, out, now).unwrap();
    concentrator.add(input_for(vec![top_level_span(999)], "env"));

    let payload = concentrator.flush(now, true);
    assert_eq!(payload.stats[0].container_id, "");
}

// Non top-level, non measured spans and partial snapshots are ignored.
#[test]
fn test_span_eligibility() {
    let now = secs(1000);
    let concentrator = new_concentrator(now);

    let mut plain = top_level_span(999);
    plain.metrics.clear();
    let mut measured = top_level_span(999);
    measured.metrics = HashMap::from([("_dd.measured".to_string(), 1.0)]);
    let mut partial = top_level_span(999);
    partial
        .metrics
        .insert("_dd.partial_version".to_string(), 4.0);

    concentrator.add(input_for(vec![plain, measured, partial], "env"));

    let payload = concentrator.flush(now, true);
    let buckets = all_stats(&payload);
    assert_eq!(buckets.len(), 1);
    // only the measured span contributes, and it is not top level
    assert_eq!(buckets[0].stats[0].hits, 1);
    assert_eq!(buckets[0].stats[0].top_level_hits, 0);
}

#[test]
fn test_weight_scales_counts() {
    let now = secs(1000);
    let concentrator = new_concentrator(now);
    let mut span = top_level_span(999);
    span.metrics.insert("_sample_rate".to_string(), 0.25);
    concentrator.add(input_for(vec![span], "env"));

    let payload = concentrator.flush(now, true);
    let buckets = all_stats(&payload);
    assert_eq!(buckets[0].stats[0].hits, 4);
    assert_eq!(buckets[0].stats[0].top_level_hits, 4);
}

#[test]
fn test_invalid_config_is_rejected() {
    let (out, _out_rx) = mpsc::channel(1);
    let config = Config::new("");
    assert!(Concentrator::new(&config, out, secs(0)).is_err());
}

// Start, feed the input channel, stop: the final forced flush arrives on
// the output channel.
#[tokio::test]
async fn test_start_stop_emits_final_flush() {
    let now = secs(1000);
    let (out, mut out_rx) = mpsc::channel(10);
    let config = Config::new("agent-env");
    let concentrator = Arc::new(
        Concentrator::new(&config, out, now)
            .unwrap()
            .with_clock(Clock::fixed(now)),
    );
    concentrator.start();
    // a second start must not steal the running tasks
    concentrator.start();

    concentrator
        .input()
        .send(input_for(vec![top_level_span(999)], "env"))
        .await
        .unwrap();
    // let the intake task drain the channel
    tokio::time::sleep(Duration::from_millis(100)).await;
    concentrator.stop().await;

    let payload = out_rx.recv().await.expect("final flush payload");
    let buckets = all_stats(&payload);
    assert_eq!(buckets.len(), 1);
    assert_eq!(buckets[0].stats[0].hits, 1);
}
