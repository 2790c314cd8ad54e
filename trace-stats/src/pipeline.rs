// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wiring of the two stats components behind a single output channel.

use std::time::SystemTime;

use anyhow::Result;
use tokio::sync::mpsc;

use datadog_stats_protobuf::pb;

use crate::client_stats_aggregator::ClientStatsAggregator;
use crate::concentrator::{Concentrator, Input};
use crate::{Clock, Config};

/// Size of the shared output channel buffer. A slow consumer applies
/// backpressure to both components.
const OUT_CHANNEL_SIZE: usize = 100;

/// The concentrator and the client stats aggregator, flushing onto the same
/// output channel.
///
/// Emissions from the two components interleave; each payload is
/// self-describing through its `client_computed` flag, so consumers don't
/// rely on any ordering across them.
pub struct StatsPipeline {
    concentrator: Concentrator,
    client_stats_aggregator: ClientStatsAggregator,
}

impl StatsPipeline {
    /// Build both components around a fresh output channel and return the
    /// receiving half along with the pipeline.
    pub fn new(
        config: &Config,
        now: SystemTime,
    ) -> Result<(StatsPipeline, mpsc::Receiver<pb::StatsPayload>)> {
        let (out, out_rx) = mpsc::channel(OUT_CHANNEL_SIZE);
        let pipeline = StatsPipeline {
            concentrator: Concentrator::new(config, out.clone(), now)?,
            client_stats_aggregator: ClientStatsAggregator::new(config, out)?,
        };
        Ok((pipeline, out_rx))
    }

    /// Replace the time source of both components, for tests.
    pub fn with_clock(self, clock: Clock) -> StatsPipeline {
        StatsPipeline {
            concentrator: self.concentrator.with_clock(clock.clone()),
            client_stats_aggregator: self.client_stats_aggregator.with_clock(clock),
        }
    }

    /// Sender half of the span input channel.
    pub fn trace_input(&self) -> mpsc::Sender<Input> {
        self.concentrator.input()
    }

    /// Sender half of the client stats input channel.
    pub fn client_stats_input(&self) -> mpsc::Sender<pb::ClientStatsPayload> {
        self.client_stats_aggregator.input()
    }

    pub fn start(&self) {
        self.concentrator.start();
        self.client_stats_aggregator.start();
    }

    /// Stop both components; each flushes its remaining state on the output
    /// channel before completing.
    pub async fn stop(&self) {
        self.concentrator.stop().await;
        self.client_stats_aggregator.stop().await;
    }
}
