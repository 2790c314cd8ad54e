// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// A single finished span as reported by an instrumented process.
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Span {
    /// service is the name of the service with which this span is associated.
    #[prost(string, tag = "1")]
    #[serde(default)]
    pub service: ::prost::alloc::string::String,
    /// name is the operation name of this span.
    #[prost(string, tag = "2")]
    #[serde(default)]
    pub name: ::prost::alloc::string::String,
    /// resource is the resource name of this span, also sometimes called the endpoint (for web spans).
    #[prost(string, tag = "3")]
    #[serde(default)]
    pub resource: ::prost::alloc::string::String,
    /// traceID is the ID of the trace to which this span belongs.
    #[prost(uint64, tag = "4")]
    #[serde(default)]
    pub trace_id: u64,
    /// spanID is the ID of this span.
    #[prost(uint64, tag = "5")]
    #[serde(default)]
    pub span_id: u64,
    /// parentID is the ID of this span's parent, or zero if this span has no parent.
    #[prost(uint64, tag = "6")]
    #[serde(default)]
    pub parent_id: u64,
    /// start is the number of nanoseconds between the Unix epoch and the beginning of this span.
    #[prost(int64, tag = "7")]
    #[serde(default)]
    pub start: i64,
    /// duration is the time length of this span in nanoseconds.
    #[prost(int64, tag = "8")]
    #[serde(default)]
    pub duration: i64,
    /// error is 1 if there is an error associated with this span, or 0 if there is not.
    #[prost(int32, tag = "9")]
    #[serde(default)]
    pub error: i32,
    /// meta is a mapping from tag name to tag value for string-valued tags.
    #[prost(map = "string, string", tag = "10")]
    #[serde(default)]
    pub meta: ::std::collections::HashMap<
        ::prost::alloc::string::String,
        ::prost::alloc::string::String,
    >,
    /// metrics is a mapping from tag name to tag value for numeric-valued tags.
    #[prost(map = "string, double", tag = "11")]
    #[serde(default)]
    pub metrics: ::std::collections::HashMap<::prost::alloc::string::String, f64>,
    /// type is the type of the service with which this span is associated.
    #[prost(string, tag = "12")]
    #[serde(default)]
    pub r#type: ::prost::alloc::string::String,
}

/// TraceChunk represents a list of spans with the same trace ID, i.e. a chunk of a trace.
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TraceChunk {
    /// priority specifies the sampling priority of the trace.
    #[prost(int32, tag = "1")]
    #[serde(default)]
    pub priority: i32,
    /// origin specifies the origin product ("lambda", "rum", etc.) of the trace.
    #[prost(string, tag = "2")]
    #[serde(default)]
    pub origin: ::prost::alloc::string::String,
    /// spans specifies list of containing spans.
    #[prost(message, repeated, tag = "3")]
    #[serde(default)]
    pub spans: ::prost::alloc::vec::Vec<Span>,
    /// droppedTrace specifies whether the trace was dropped by samplers or not.
    #[prost(bool, tag = "4")]
    #[serde(default)]
    pub dropped_trace: bool,
}

/// ClientGroupedStats aggregates the stats of spans grouped by service, name, resource, type,
/// status code and synthetics origin.
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientGroupedStats {
    #[prost(string, tag = "1")]
    #[serde(default)]
    pub service: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    #[serde(default)]
    pub name: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    #[serde(default)]
    pub resource: ::prost::alloc::string::String,
    #[prost(uint32, tag = "4")]
    #[serde(rename = "HTTPStatusCode")]
    #[serde(default)]
    pub http_status_code: u32,
    #[prost(string, tag = "5")]
    #[serde(default)]
    pub r#type: ::prost::alloc::string::String,
    /// count of all spans aggregated in the groupedstats
    #[prost(uint64, tag = "6")]
    #[serde(default)]
    pub hits: u64,
    /// count of error spans aggregated in the groupedstats
    #[prost(uint64, tag = "7")]
    #[serde(default)]
    pub errors: u64,
    /// total duration in nanoseconds of spans aggregated in the bucket
    #[prost(uint64, tag = "8")]
    #[serde(default)]
    pub duration: u64,
    /// ddsketch summary of ok spans latencies encoded in protobuf
    #[prost(bytes = "vec", tag = "9")]
    #[serde(default)]
    #[serde(with = "serde_bytes")]
    pub ok_summary: ::prost::alloc::vec::Vec<u8>,
    /// ddsketch summary of error spans latencies encoded in protobuf
    #[prost(bytes = "vec", tag = "10")]
    #[serde(default)]
    #[serde(with = "serde_bytes")]
    pub error_summary: ::prost::alloc::vec::Vec<u8>,
    /// set to true on spans generated by synthetics traffic
    #[prost(bool, tag = "11")]
    #[serde(default)]
    pub synthetics: bool,
    /// count of top level spans aggregated in the groupedstats
    #[prost(uint64, tag = "12")]
    #[serde(default)]
    pub top_level_hits: u64,
}

/// ClientStatsBucket is a time bucket containing aggregated stats.
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientStatsBucket {
    /// bucket start in nanoseconds
    #[prost(uint64, tag = "1")]
    #[serde(default)]
    pub start: u64,
    /// bucket duration in nanoseconds
    #[prost(uint64, tag = "2")]
    #[serde(default)]
    pub duration: u64,
    #[prost(message, repeated, tag = "3")]
    #[serde(default)]
    pub stats: ::prost::alloc::vec::Vec<ClientGroupedStats>,
    /// AgentTimeShift is the shift applied by the agent stats aggregator to bucket start
    /// when it is outside of the accepted time window.
    #[prost(int64, tag = "4")]
    #[serde(default)]
    pub agent_time_shift: i64,
}

/// ClientStatsPayload is the first layer of span stats aggregation. It is also
/// the payload sent by tracers to the agent when client side stats are enabled.
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientStatsPayload {
    /// Hostname is the tracer hostname. It's extracted from spans with "_dd.hostname" meta
    /// or set by the agent.
    #[prost(string, tag = "1")]
    #[serde(default)]
    pub hostname: ::prost::alloc::string::String,
    /// env tag set on spans or in the tracers, used for aggregation
    #[prost(string, tag = "2")]
    #[serde(default)]
    pub env: ::prost::alloc::string::String,
    /// version tag set on spans or in the tracers, used for aggregation
    #[prost(string, tag = "3")]
    #[serde(default)]
    pub version: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "4")]
    #[serde(default)]
    pub stats: ::prost::alloc::vec::Vec<ClientStatsBucket>,
    /// informative field not used for aggregation
    #[prost(string, tag = "5")]
    #[serde(default)]
    pub lang: ::prost::alloc::string::String,
    /// informative field not used for aggregation
    #[prost(string, tag = "6")]
    #[serde(default)]
    pub tracer_version: ::prost::alloc::string::String,
    /// used on stats payloads sent by the tracer to identify uniquely a message
    #[prost(string, tag = "7")]
    #[serde(rename = "runtimeID")]
    #[serde(default)]
    pub runtime_id: ::prost::alloc::string::String,
    /// used on stats payloads sent by the tracer to identify uniquely a message
    #[prost(uint64, tag = "8")]
    #[serde(default)]
    pub sequence: u64,
    /// AgentAggregation is set by the agent on tracer payloads modified by the agent aggregation layer.
    /// Contains an empty string if no agent aggregation was applied.
    #[prost(string, tag = "9")]
    #[serde(default)]
    pub agent_aggregation: ::prost::alloc::string::String,
    /// Service is the main service of the tracer. It is part of the payload aggregation key.
    #[prost(string, tag = "10")]
    #[serde(default)]
    pub service: ::prost::alloc::string::String,
    /// ContainerID specifies the origin container ID. It is part of the payload aggregation key.
    #[prost(string, tag = "11")]
    #[serde(rename = "containerID")]
    #[serde(default)]
    pub container_id: ::prost::alloc::string::String,
    /// Tags specifies a list of tags obtained from the orchestrator (where applicable) using the
    /// specified containerID.
    #[prost(string, repeated, tag = "12")]
    #[serde(default)]
    pub tags: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

/// StatsPayload is the payload used to send stats from the agent to the backend.
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatsPayload {
    #[prost(string, tag = "1")]
    #[serde(default)]
    pub agent_hostname: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    #[serde(default)]
    pub agent_env: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "3")]
    #[serde(default)]
    pub stats: ::prost::alloc::vec::Vec<ClientStatsPayload>,
    #[prost(string, tag = "4")]
    #[serde(default)]
    pub agent_version: ::prost::alloc::string::String,
    /// ClientComputed is true if the stats payload was computed by the client and
    /// false if it was computed by the agent concentrator.
    #[prost(bool, tag = "5")]
    #[serde(default)]
    pub client_computed: bool,
}
