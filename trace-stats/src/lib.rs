// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Aggregation of trace data into time-bucketed stats payloads.
//!
//! Two components share a single output channel of stats payloads: the
//! [`Concentrator`](concentrator::Concentrator) computes stats from raw
//! spans, while the
//! [`ClientStatsAggregator`](client_stats_aggregator::ClientStatsAggregator)
//! combines stats payloads that were already computed client side. Both are
//! driven by channels and a flush ticker, and flush whatever they hold when
//! stopped.

use std::fmt;
use std::sync::Arc;
use std::time::{self, Duration, SystemTime};

use anyhow::{ensure, Result};

pub mod aggregation;
pub mod client_stats_aggregator;
pub mod concentrator;
pub mod pipeline;
pub mod span;

/// Feature flags gating optional aggregation dimensions.
#[derive(Debug, Clone, Copy)]
pub struct Features {
    /// Aggregate stats by the container id of the emitting process.
    pub enable_cid_stats: bool,
    /// Force container id aggregation off, overriding `enable_cid_stats`.
    pub disable_cid_stats: bool,
}

impl Default for Features {
    fn default() -> Self {
        Features {
            enable_cid_stats: true,
            disable_cid_stats: false,
        }
    }
}

impl Features {
    pub(crate) fn cid_stats_enabled(&self) -> bool {
        self.enable_cid_stats && !self.disable_cid_stats
    }
}

/// Configuration of the stats components.
#[derive(Debug, Clone)]
pub struct Config {
    /// Size of the concentrator time buckets.
    pub bucket_interval: Duration,
    /// Env applied to stats of traces that don't carry one. Required: every
    /// aggregation key must have an env.
    pub default_env: String,
    /// Hostname identifying this agent on emitted payloads.
    pub hostname: String,
    /// Version identifying this agent on emitted payloads.
    pub agent_version: String,
    pub features: Features,
    /// Parameters of the latency sketches.
    pub sketch: datadog_quantile::Config,
}

impl Config {
    /// Return a config with the given default env and every other field at
    /// its default.
    pub fn new(default_env: impl Into<String>) -> Config {
        Config {
            bucket_interval: Duration::from_secs(10),
            default_env: default_env.into(),
            hostname: String::new(),
            agent_version: String::new(),
            features: Features::default(),
            sketch: datadog_quantile::Config::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.default_env.is_empty(), "default_env must not be empty");
        ensure!(
            !self.bucket_interval.is_zero(),
            "bucket_interval must not be zero"
        );
        Ok(())
    }
}

/// Time source of the stats components, injectable for deterministic tests.
#[derive(Clone)]
pub struct Clock(Arc<dyn Fn() -> SystemTime + Send + Sync>);

impl Clock {
    /// Clock following the system time.
    pub fn system() -> Clock {
        Clock(Arc::new(SystemTime::now))
    }

    /// Clock frozen at the given instant.
    pub fn fixed(now: SystemTime) -> Clock {
        Clock(Arc::new(move || now))
    }

    pub fn now(&self) -> SystemTime {
        (self.0)()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::system()
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clock").finish_non_exhaustive()
    }
}

/// Return a Duration between t and the unix epoch.
/// If t is before the unix epoch return 0.
pub(crate) fn system_time_to_unix_duration(t: SystemTime) -> Duration {
    t.duration_since(time::UNIX_EPOCH)
        .unwrap_or(Duration::from_nanos(0))
}
