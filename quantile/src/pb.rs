// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Protobuf form of the DDSketch interchange format, used as the on-wire
//! encoding of the sketches.

/// A quantile sketch in the DDSketch interchange format.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DdSketch {
    /// The mapping between values and bucket indices.
    #[prost(message, optional, tag = "1")]
    pub mapping: ::core::option::Option<IndexMapping>,
    /// The store for positive values.
    #[prost(message, optional, tag = "2")]
    pub positive_values: ::core::option::Option<Store>,
    /// The store for negative values, indexed by the magnitude of the value.
    #[prost(message, optional, tag = "3")]
    pub negative_values: ::core::option::Option<Store>,
    /// The count of zero values, or values closer to zero than the mapping
    /// can distinguish.
    #[prost(double, tag = "4")]
    pub zero_count: f64,
}

/// How bucket indices map to value ranges.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IndexMapping {
    /// The base of the exponential mapping.
    #[prost(double, tag = "1")]
    pub gamma: f64,
    /// The offset added to the index.
    #[prost(double, tag = "2")]
    pub index_offset: f64,
    /// How values within a bucket are interpolated.
    #[prost(enumeration = "index_mapping::Interpolation", tag = "3")]
    pub interpolation: i32,
}

/// Nested message and enum types in `IndexMapping`.
pub mod index_mapping {
    #[derive(
        Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
    )]
    #[repr(i32)]
    pub enum Interpolation {
        None = 0,
        Linear = 1,
        Quadratic = 2,
        Cubic = 3,
    }

    impl Interpolation {
        /// String value of the enum field names used in the ProtoBuf
        /// definition.
        pub fn as_str_name(&self) -> &'static str {
            match self {
                Interpolation::None => "NONE",
                Interpolation::Linear => "LINEAR",
                Interpolation::Quadratic => "QUADRATIC",
                Interpolation::Cubic => "CUBIC",
            }
        }
    }
}

/// A set of bucket counts, either sparse or contiguous.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Store {
    /// The bucket counts keyed by index.
    #[prost(map = "sint32, double", tag = "1")]
    pub bin_counts: ::std::collections::HashMap<i32, f64>,
    /// Contiguous bucket counts for indices starting at
    /// `contiguous_bin_index_offset`.
    #[prost(double, repeated, tag = "2")]
    pub contiguous_bin_counts: ::prost::alloc::vec::Vec<f64>,
    #[prost(sint32, tag = "3")]
    pub contiguous_bin_index_offset: i32,
}
