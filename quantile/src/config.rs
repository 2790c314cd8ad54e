// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use anyhow::{ensure, Result};

use crate::key::{is_inf, Key, MAX_KEY};
use crate::store::MAX_BIN_WIDTH;

/// Default relative accuracy of the mapping.
pub const DEFAULT_EPS: f64 = 1.0 / 128.0;
/// Default smallest positive value the mapping distinguishes from zero.
pub const DEFAULT_MIN_VALUE: f64 = 1e-9;
/// Default cap on the number of bins of a sketch.
pub const DEFAULT_BIN_LIMIT: usize = 4096;

/// Immutable parameters of the logarithmic key mapping.
///
/// Adjacent bucket boundaries are `v` and `v * gamma`, so any value is within
/// a factor `1 + 2 * eps` of the value its key maps back to. The bias offsets
/// the exponent so that the smallest representable positive value has key 1,
/// leaving key 0 for zero and sub-minimum values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Config {
    bin_limit: usize,
    // gamma and its natural log
    gamma_v: f64,
    gamma_ln: f64,
    // extrema of the representable positive range, min normalized to a
    // bucket boundary so that key(min) == 1
    min_value: f64,
    max_value: f64,
    bias: i32,
}

impl Config {
    pub fn new(eps: f64, min_value: f64, bin_limit: usize) -> Result<Config> {
        ensure!(
            eps > 0.0 && eps <= 1.0,
            "eps must be within (0, 1], got {eps}"
        );
        ensure!(min_value > 0.0, "min value must be positive, got {min_value}");
        ensure!(bin_limit > 0, "bin limit must be positive, got {bin_limit}");
        let eps = eps * 2.0;
        let gamma_ln = eps.ln_1p();
        let emin = (min_value.ln() / gamma_ln).floor() as i32;
        let bias = -emin + 1;
        let mut config = Config {
            bin_limit,
            gamma_v: 1.0 + eps,
            gamma_ln,
            min_value: 0.0,
            max_value: 0.0,
            bias,
        };
        config.min_value = config.pow_gamma(f64::from(emin));
        config.max_value = config.pow_gamma(f64::from(i32::from(MAX_KEY) - bias));
        Ok(config)
    }

    /// Maximum number of bins a sketch with this config keeps after
    /// compression.
    pub fn bin_limit(&self) -> usize {
        self.bin_limit
    }

    /// Base of the logarithmic bucket mapping.
    pub fn gamma(&self) -> f64 {
        self.gamma_v
    }

    pub(crate) fn bias(&self) -> i32 {
        self.bias
    }

    /// Largest count a sketch with this config can hold without the bin cap
    /// forcing compression of full-width bins.
    pub fn max_count(&self) -> u64 {
        self.bin_limit as u64 * MAX_BIN_WIDTH
    }

    fn log_gamma(&self, v: f64) -> f64 {
        v.ln() / self.gamma_ln
    }

    fn pow_gamma(&self, y: f64) -> f64 {
        (y * self.gamma_ln).exp()
    }

    /// Return the key of the bucket containing `v`.
    pub fn key(&self, v: f64) -> Key {
        if v < 0.0 {
            return -self.key(-v);
        }
        if v == 0.0 || v < self.min_value {
            return 0;
        }
        // Rounding to even is what makes key(f64(k)) == k hold for every
        // representable key.
        let i = self.log_gamma(v).round_ties_even() as i32 + self.bias;
        i.clamp(1, i32::from(MAX_KEY)) as Key
    }

    /// Return the value at the lower boundary of the bucket with key `k`.
    pub fn f64(&self, k: Key) -> f64 {
        if k < 0 {
            return -self.f64(-k);
        }
        if is_inf(k) {
            return f64::INFINITY;
        }
        if k == 0 {
            return 0.0;
        }
        self.pow_gamma(f64::from(i32::from(k) - self.bias))
    }

    pub(crate) fn bin_low(&self, k: Key) -> f64 {
        self.f64(k)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new(DEFAULT_EPS, DEFAULT_MIN_VALUE, DEFAULT_BIN_LIMIT)
            .expect("default sketch config is valid")
    }
}
