// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Aggregation of stats payloads that were already computed client side.
//!
//! Client payloads colliding on the same time bucket cannot simply be
//! summed: distributions must be forwarded untouched while counts are
//! summed once. When a bucket sees two or more payloads, each original is
//! emitted with its counts zeroed (tagged `distributions`) and one
//! synthetic payload carries the summed counts (tagged `counts`). A bucket
//! seeing a single payload passes it through unchanged.
//!
//! Bucket starts are aligned on odd seconds while concentrator buckets are
//! aligned on even ones, so no two count emissions from the same agent
//! share a second.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use log::debug;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use datadog_stats_protobuf::pb;

use crate::aggregation::{BucketsAggregationKey, PayloadAggregationKey};
use crate::{system_time_to_unix_duration, Clock, Config};

/// Duration of the aggregation time buckets.
const BUCKET_DURATION: Duration = Duration::from_secs(2);
/// Bucket duration advertised on re-aggregated count payloads.
const CLIENT_BUCKET_DURATION: Duration = Duration::from_secs(10);
/// How far in the past client buckets are accepted; older ones shift
/// forward.
const OLDEST_BUCKET_START: Duration = Duration::from_secs(20);
/// Period of the flush ticker.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);
/// Size of the input channel buffer.
const IN_CHANNEL_SIZE: usize = 100;

/// Tag set on payloads whose counts were moved into a synthetic aggregate.
const TAG_DISTRIBUTIONS: &str = "distributions";
/// Tag set on the synthetic payload carrying the aggregated counts.
const TAG_COUNTS: &str = "counts";

/// Align a timestamp on the start of an aggregation bucket: truncated to
/// the bucket duration, one second in.
#[inline]
fn align_agg_timestamp(t: u64) -> u64 {
    let bucket_ns = BUCKET_DURATION.as_nanos() as u64;
    t - (t % bucket_ns) + Duration::from_secs(1).as_nanos() as u64
}

/// Counts summed across the payloads colliding on a bucket.
#[derive(Debug, Default, Clone, Copy)]
struct AggregatedCounts {
    hits: u64,
    errors: u64,
    duration: u64,
}

/// A single aggregation time bucket.
///
/// The first payload is remembered untouched; from the second one on,
/// counts are split away from the distributions and summed per aggregation
/// key.
#[derive(Debug, Default)]
struct Bucket {
    start: u64,
    n: u64,
    first: Option<pb::ClientStatsPayload>,
    agg: HashMap<PayloadAggregationKey, HashMap<BucketsAggregationKey, AggregatedCounts>>,
}

impl Bucket {
    fn new(start: u64) -> Bucket {
        Bucket {
            start,
            ..Default::default()
        }
    }

    /// Record a payload, returning the payloads to emit right away.
    fn add(&mut self, payload: pb::ClientStatsPayload) -> Vec<pb::ClientStatsPayload> {
        self.n += 1;
        if self.n == 1 {
            self.first = Some(payload);
            return Vec::new();
        }
        if self.n == 2 {
            let first = self
                .first
                .take()
                .expect("a first payload is recorded before the second");
            self.aggregate_counts(&first);
            self.aggregate_counts(&payload);
            return vec![trim_counts(first), trim_counts(payload)];
        }
        self.aggregate_counts(&payload);
        vec![trim_counts(payload)]
    }

    fn aggregate_counts(&mut self, payload: &pb::ClientStatsPayload) {
        let payload_key = PayloadAggregationKey {
            env: payload.env.clone(),
            hostname: payload.hostname.clone(),
            version: payload.version.clone(),
            container_id: payload.container_id.clone(),
        };
        let groups = self.agg.entry(payload_key).or_default();
        for bucket in &payload.stats {
            for group in &bucket.stats {
                let counts = groups
                    .entry(BucketsAggregationKey {
                        service: group.service.clone(),
                        name: group.name.clone(),
                        resource: group.resource.clone(),
                        span_type: group.r#type.clone(),
                        status_code: group.http_status_code,
                        synthetics: group.synthetics,
                    })
                    .or_default();
                counts.hits += group.hits;
                counts.errors += group.errors;
                counts.duration += group.duration;
            }
        }
    }

    /// Emit the bucket content: the untouched payload when only one was
    /// seen, the synthetic count payloads otherwise.
    fn flush(self) -> Vec<pb::ClientStatsPayload> {
        if let Some(first) = self.first {
            return vec![first];
        }
        if self.n == 0 {
            return Vec::new();
        }
        self.aggregation_to_payloads()
    }

    fn aggregation_to_payloads(self) -> Vec<pb::ClientStatsPayload> {
        let start = self.start;
        self.agg
            .into_iter()
            .map(|(payload_key, groups)| {
                let stats = groups
                    .into_iter()
                    .map(|(key, counts)| pb::ClientGroupedStats {
                        service: key.service,
                        name: key.name,
                        resource: key.resource,
                        http_status_code: key.status_code,
                        r#type: key.span_type,
                        synthetics: key.synthetics,
                        hits: counts.hits,
                        errors: counts.errors,
                        duration: counts.duration,
                        ..Default::default()
                    })
                    .collect();
                pb::ClientStatsPayload {
                    hostname: payload_key.hostname,
                    env: payload_key.env,
                    version: payload_key.version,
                    container_id: payload_key.container_id,
                    agent_aggregation: TAG_COUNTS.to_string(),
                    stats: vec![pb::ClientStatsBucket {
                        start,
                        duration: CLIENT_BUCKET_DURATION.as_nanos() as u64,
                        stats,
                        agent_time_shift: 0,
                    }],
                    ..Default::default()
                }
            })
            .collect()
    }
}

/// Return the payload with its counts zeroed and its distributions kept,
/// tagged for the aggregation layer.
fn trim_counts(mut payload: pb::ClientStatsPayload) -> pb::ClientStatsPayload {
    payload.agent_aggregation = TAG_DISTRIBUTIONS.to_string();
    for bucket in &mut payload.stats {
        for group in &mut bucket.stats {
            group.hits = 0;
            group.errors = 0;
            group.duration = 0;
            group.top_level_hits = 0;
        }
    }
    payload
}

/// The bucket map and the identity stamped on emitted payloads. Only the
/// aggregator task touches it, so no lock is involved.
#[derive(Debug)]
struct Aggregator {
    buckets: HashMap<u64, Bucket>,
    agent_env: String,
    agent_hostname: String,
    agent_version: String,
}

impl Aggregator {
    /// Route each embedded client bucket into its aggregation bucket.
    /// Returns one batch of payloads to emit per client bucket.
    fn add(
        &mut self,
        now: SystemTime,
        mut payload: pb::ClientStatsPayload,
    ) -> Vec<Vec<pb::ClientStatsPayload>> {
        let mut batches = Vec::new();
        let client_buckets = std::mem::take(&mut payload.stats);
        for mut client_bucket in client_buckets {
            let client_start = client_bucket.start;
            let ts = self.aggregation_bucket_start(now, client_start);
            if ts != client_start {
                client_bucket.agent_time_shift = ts as i64 - client_start as i64;
                client_bucket.start = ts;
            }
            let bucket = self.buckets.entry(ts).or_insert_with(|| Bucket::new(ts));
            let mut single = payload.clone();
            single.stats = vec![client_bucket];
            let emitted = bucket.add(single);
            if !emitted.is_empty() {
                batches.push(emitted);
            }
        }
        batches
    }

    /// Bucket start for a client bucket timestamp: too-old buckets shift
    /// forward into the oldest accepted one, future ones clamp to now.
    fn aggregation_bucket_start(&self, now: SystemTime, client_ts: u64) -> u64 {
        let now_ns = system_time_to_unix_duration(now).as_nanos() as u64;
        let oldest = now_ns.saturating_sub(OLDEST_BUCKET_START.as_nanos() as u64);
        if client_ts < oldest {
            return align_agg_timestamp(oldest);
        }
        if client_ts > now_ns {
            return align_agg_timestamp(now_ns);
        }
        align_agg_timestamp(client_ts)
    }

    /// Flush the buckets that fell out of the accepted window.
    fn flush_on_time(&mut self, now: SystemTime) -> Vec<Vec<pb::ClientStatsPayload>> {
        let now_ns = system_time_to_unix_duration(now).as_nanos() as u64;
        let cutoff = align_agg_timestamp(
            now_ns.saturating_sub((OLDEST_BUCKET_START - BUCKET_DURATION).as_nanos() as u64),
        );
        let expired: Vec<u64> = self
            .buckets
            .keys()
            .filter(|&&ts| ts < cutoff)
            .copied()
            .collect();
        expired
            .into_iter()
            .filter_map(|ts| self.buckets.remove(&ts))
            .map(Bucket::flush)
            .filter(|batch| !batch.is_empty())
            .collect()
    }

    /// Flush every remaining bucket, on shutdown.
    fn flush_all(&mut self) -> Vec<Vec<pb::ClientStatsPayload>> {
        self.buckets
            .drain()
            .map(|(_, bucket)| bucket.flush())
            .filter(|batch| !batch.is_empty())
            .collect()
    }

    fn wrap(&self, batch: Vec<pb::ClientStatsPayload>) -> pb::StatsPayload {
        pb::StatsPayload {
            agent_hostname: self.agent_hostname.clone(),
            agent_env: self.agent_env.clone(),
            agent_version: self.agent_version.clone(),
            stats: batch,
            client_computed: true,
        }
    }
}

async fn send_batches(
    aggregator: &Aggregator,
    out: &mpsc::Sender<pb::StatsPayload>,
    batches: Vec<Vec<pb::ClientStatsPayload>>,
) {
    for batch in batches {
        if out.send(aggregator.wrap(batch)).await.is_err() {
            debug!("Stats channel closed, dropping client stats payloads");
            return;
        }
    }
}

async fn run(
    mut aggregator: Aggregator,
    mut in_rx: mpsc::Receiver<pb::ClientStatsPayload>,
    out: mpsc::Sender<pb::StatsPayload>,
    clock: Clock,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick of an interval fires immediately
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Exiting client stats aggregator, flushing remaining buckets");
                let batches = aggregator.flush_all();
                send_batches(&aggregator, &out, batches).await;
                break;
            }
            _ = ticker.tick() => {
                let batches = aggregator.flush_on_time(clock.now());
                send_batches(&aggregator, &out, batches).await;
            }
            payload = in_rx.recv() => match payload {
                Some(payload) => {
                    let batches = aggregator.add(clock.now(), payload);
                    send_batches(&aggregator, &out, batches).await;
                }
                None => {
                    let batches = aggregator.flush_all();
                    send_batches(&aggregator, &out, batches).await;
                    break;
                }
            },
        }
    }
}

/// Aggregation service for client-computed stats payloads.
///
/// A single task owns the bucket map and selects over the input channel,
/// the flush ticker and the cancellation signal.
pub struct ClientStatsAggregator {
    in_tx: mpsc::Sender<pb::ClientStatsPayload>,
    in_rx: Mutex<Option<mpsc::Receiver<pb::ClientStatsPayload>>>,
    aggregator: Mutex<Option<Aggregator>>,
    out: mpsc::Sender<pb::StatsPayload>,
    clock: Clock,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ClientStatsAggregator {
    pub fn new(
        config: &Config,
        out: mpsc::Sender<pb::StatsPayload>,
    ) -> Result<ClientStatsAggregator> {
        config.validate()?;
        let (in_tx, in_rx) = mpsc::channel(IN_CHANNEL_SIZE);
        Ok(ClientStatsAggregator {
            in_tx,
            in_rx: Mutex::new(Some(in_rx)),
            aggregator: Mutex::new(Some(Aggregator {
                buckets: HashMap::new(),
                agent_env: config.default_env.clone(),
                agent_hostname: config.hostname.clone(),
                agent_version: config.agent_version.clone(),
            })),
            out,
            clock: Clock::system(),
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
        })
    }

    /// Replace the time source, for tests.
    pub fn with_clock(mut self, clock: Clock) -> ClientStatsAggregator {
        self.clock = clock;
        self
    }

    /// Sender half of the input channel.
    pub fn input(&self) -> mpsc::Sender<pb::ClientStatsPayload> {
        self.in_tx.clone()
    }

    /// Launch the aggregation task. Calling start a second time is a no-op.
    pub fn start(&self) {
        let (Some(aggregator), Some(in_rx)) = (
            self.aggregator.lock().unwrap().take(),
            self.in_rx.lock().unwrap().take(),
        ) else {
            return;
        };
        let worker = tokio::spawn(run(
            aggregator,
            in_rx,
            self.out.clone(),
            self.clock.clone(),
            self.cancel.clone(),
        ));
        *self.worker.lock().unwrap() = Some(worker);
    }

    /// Cancel the task and wait for the remaining buckets to be emitted.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}
