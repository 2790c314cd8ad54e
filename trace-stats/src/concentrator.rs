// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The concentrator aggregates spans into time buckets and flushes them as
//! stats payloads.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use anyhow::Result;
use log::{debug, error};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use datadog_quantile::Config as SketchConfig;
use datadog_stats_protobuf::pb;

use crate::aggregation::{PayloadAggregationKey, RawBucket};
use crate::{span, system_time_to_unix_duration, Clock, Config};

/// Size of the input channel buffer.
const IN_CHANNEL_SIZE: usize = 100;

/// Number of bucket intervals held back from flushing, so that slightly
/// late spans still land in an open bucket.
const BUFFER_LEN: u64 = 2;

/// Align a timestamp on the start of a bucket.
#[inline]
fn align_timestamp(t: u64, bucket_size: u64) -> u64 {
    t - (t % bucket_size)
}

/// Input of the concentrator: a batch of processed traces sharing a
/// container id.
#[derive(Debug, Clone, Default)]
pub struct Input {
    pub traces: Vec<ProcessedTrace>,
    pub container_id: String,
}

/// A trace chunk together with the tracer metadata the stats computation
/// needs.
#[derive(Debug, Clone, Default)]
pub struct ProcessedTrace {
    pub chunk: pb::TraceChunk,
    pub root: pb::Span,
    pub tracer_hostname: String,
    pub tracer_env: String,
    pub app_version: String,
}

/// State guarded by the concentrator mutex: the open buckets and the oldest
/// timestamp data is still accepted for. Spans older than that get
/// redirected into the oldest bucket instead of creating one that would
/// never be flushed.
#[derive(Debug)]
struct State {
    buckets: HashMap<u64, RawBucket>,
    oldest_timestamp: u64,
    rng: SmallRng,
}

/// The aggregation core shared between the caller and the worker tasks.
#[derive(Debug)]
struct Inner {
    /// Size of the time buckets in nanos.
    bucket_size: u64,
    state: Mutex<State>,
    agent_env: String,
    agent_hostname: String,
    agent_version: String,
    cid_stats_enabled: bool,
    sketch_config: SketchConfig,
}

/// Span stats aggregation by time bucket and aggregation key.
///
/// `add` and `flush` serialize on the state mutex. The input-draining task
/// reads from the channel outside of the lock and only takes it for the
/// duration of the map mutations; the flush task sends on the output
/// channel, where a slow consumer applies backpressure all the way to the
/// input channel.
pub struct Concentrator {
    inner: Arc<Inner>,
    in_tx: mpsc::Sender<Input>,
    in_rx: Mutex<Option<mpsc::Receiver<Input>>>,
    out: mpsc::Sender<pb::StatsPayload>,
    clock: Clock,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Concentrator {
    /// Return a new concentrator flushing on `out`, accepting span data
    /// from `now` on.
    pub fn new(
        config: &Config,
        out: mpsc::Sender<pb::StatsPayload>,
        now: SystemTime,
    ) -> Result<Concentrator> {
        config.validate()?;
        let bucket_size = config.bucket_interval.as_nanos() as u64;
        let (in_tx, in_rx) = mpsc::channel(IN_CHANNEL_SIZE);
        Ok(Concentrator {
            inner: Arc::new(Inner {
                bucket_size,
                state: Mutex::new(State {
                    buckets: HashMap::new(),
                    oldest_timestamp: align_timestamp(
                        system_time_to_unix_duration(now).as_nanos() as u64,
                        bucket_size,
                    ),
                    rng: SmallRng::from_entropy(),
                }),
                agent_env: config.default_env.clone(),
                agent_hostname: config.hostname.clone(),
                agent_version: config.agent_version.clone(),
                cid_stats_enabled: config.features.cid_stats_enabled(),
                sketch_config: config.sketch,
            }),
            in_tx,
            in_rx: Mutex::new(Some(in_rx)),
            out,
            clock: Clock::system(),
            cancel: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Replace the time source, for tests.
    pub fn with_clock(mut self, clock: Clock) -> Concentrator {
        self.clock = clock;
        self
    }

    /// Sender half of the input channel.
    pub fn input(&self) -> mpsc::Sender<Input> {
        self.in_tx.clone()
    }

    /// Aggregate a batch of traces right away, without going through the
    /// input channel.
    ///
    /// Panics if a resolved aggregation env is empty: the config validation
    /// guarantees a non-empty default env, so this is a programmer error.
    pub fn add(&self, input: Input) {
        self.inner.add(input);
    }

    /// Drain all buckets older than `now - BUFFER_LEN * bucket_size` into a
    /// stats payload (all of them when `force` is set, typically on
    /// shutdown) and advance the oldest accepted timestamp.
    pub fn flush(&self, now: SystemTime, force: bool) -> pb::StatsPayload {
        self.inner.flush(now, force)
    }

    /// Launch the input-draining task and the flush-ticker task. Calling
    /// start a second time is a no-op.
    pub fn start(&self) {
        let Some(mut in_rx) = self.in_rx.lock().unwrap().take() else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        let cancel = self.cancel.clone();
        let intake = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    input = in_rx.recv() => match input {
                        Some(input) => inner.add(input),
                        None => break,
                    },
                }
            }
        });

        let inner = Arc::clone(&self.inner);
        let cancel = self.cancel.clone();
        let out = self.out.clone();
        let clock = self.clock.clone();
        let flusher = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_nanos(inner.bucket_size));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick of an interval fires immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Exiting concentrator, computing remaining stats");
                        let payload = inner.flush(clock.now(), true);
                        if out.send(payload).await.is_err() {
                            error!("Stats channel closed, dropping final stats payload");
                        }
                        break;
                    }
                    _ = ticker.tick() => {
                        let payload = inner.flush(clock.now(), false);
                        if out.send(payload).await.is_err() {
                            error!("Stats channel closed, exiting concentrator");
                            break;
                        }
                    }
                }
            }
        });
        self.workers.lock().unwrap().extend([intake, flusher]);
    }

    /// Cancel the tasks and wait for the final forced flush to be emitted.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            let _ = worker.await;
        }
    }
}

impl Inner {
    fn add(&self, input: Input) {
        let mut state = self.state.lock().unwrap();
        for trace in &input.traces {
            self.add_now(&mut state, trace, &input.container_id);
        }
    }

    fn add_now(&self, state: &mut State, trace: &ProcessedTrace, container_id: &str) {
        let hostname = if trace.tracer_hostname.is_empty() {
            &self.agent_hostname
        } else {
            &trace.tracer_hostname
        };
        let env = if trace.tracer_env.is_empty() {
            &self.agent_env
        } else {
            &trace.tracer_env
        };
        let container_id = if self.cid_stats_enabled {
            container_id
        } else {
            ""
        };
        let weight = span::weight(&trace.root);
        let payload_key = PayloadAggregationKey {
            env: env.clone(),
            hostname: hostname.clone(),
            version: trace.app_version.clone(),
            container_id: container_id.to_string(),
        };
        for span in &trace.chunk.spans {
            let is_top = span::has_top_level(span);
            if !(is_top || span::is_measured(span)) {
                continue;
            }
            if span::is_partial_snapshot(span) {
                continue;
            }
            let end = (span.start + span.duration) as u64;
            let mut bucket_timestamp = align_timestamp(end, self.bucket_size);
            // late spans are aggregated into the oldest open bucket
            if bucket_timestamp < state.oldest_timestamp {
                bucket_timestamp = state.oldest_timestamp;
            }
            state
                .buckets
                .entry(bucket_timestamp)
                .or_insert_with(|| RawBucket::new(bucket_timestamp, self.bucket_size))
                .handle_span(
                    &self.sketch_config,
                    span,
                    weight,
                    is_top,
                    &trace.chunk.origin,
                    payload_key.clone(),
                );
        }
    }

    fn flush(&self, now: SystemTime, force: bool) -> pb::StatsPayload {
        let now_timestamp = system_time_to_unix_duration(now).as_nanos() as u64;
        let cutoff = now_timestamp.saturating_sub(BUFFER_LEN * self.bucket_size);

        let mut state = self.state.lock().unwrap();
        let expired: Vec<u64> = state
            .buckets
            .keys()
            .filter(|&&ts| force || ts <= cutoff)
            .copied()
            .collect();
        let mut grouped: HashMap<PayloadAggregationKey, Vec<pb::ClientStatsBucket>> =
            HashMap::new();
        for ts in expired {
            if let Some(bucket) = state.buckets.remove(&ts) {
                for (key, client_bucket) in bucket.export(&self.sketch_config, &mut state.rng) {
                    grouped.entry(key).or_default().push(client_bucket);
                }
            }
        }
        state.oldest_timestamp = if force {
            align_timestamp(now_timestamp, self.bucket_size)
        } else {
            align_timestamp(now_timestamp, self.bucket_size)
                .saturating_sub((BUFFER_LEN - 1) * self.bucket_size)
        };
        drop(state);

        let stats = grouped
            .into_iter()
            .map(|(key, buckets)| pb::ClientStatsPayload {
                env: key.env,
                hostname: key.hostname,
                version: key.version,
                container_id: key.container_id,
                stats: buckets,
                ..Default::default()
            })
            .collect();
        pb::StatsPayload {
            agent_hostname: self.agent_hostname.clone(),
            agent_env: self.agent_env.clone(),
            agent_version: self.agent_version.clone(),
            stats,
            client_computed: false,
        }
    }
}

#[cfg(test)]
mod tests;
