// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Key of a sketch bin. The value to key mapping is defined by
/// [`Config`](crate::Config).
pub type Key = i16;

/// Largest key a finite value can map to.
pub(crate) const MAX_KEY: Key = i16::MAX - 1;

/// Sentinel key for values beyond the representable range, by sign.
pub(crate) const INF_KEY: Key = i16::MAX;

pub(crate) fn is_inf(k: Key) -> bool {
    k == INF_KEY || k == -INF_KEY
}
