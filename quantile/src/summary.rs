// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Exact count, sum, average and extrema of the values inserted into a
/// sketch, tracked next to the approximate bins.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Summary {
    pub cnt: u64,
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub avg: f64,
}

impl Summary {
    pub fn insert(&mut self, v: f64) {
        self.insert_n(v, 1);
    }

    /// Insert `n` occurrences of `v`.
    pub fn insert_n(&mut self, v: f64, n: u64) {
        if n == 0 {
            return;
        }
        if self.cnt == 0 {
            self.min = v;
            self.max = v;
        } else {
            if v < self.min {
                self.min = v;
            }
            if v > self.max {
                self.max = v;
            }
        }
        self.cnt += n;
        self.sum += v * n as f64;
        self.avg += (v - self.avg) * n as f64 / self.cnt as f64;
    }

    /// Merge `other` into `self`, recomputing the average by weight.
    pub fn merge(&mut self, other: &Summary) {
        if other.cnt == 0 {
            return;
        }
        if self.cnt == 0 {
            *self = *other;
            return;
        }
        self.cnt += other.cnt;
        self.sum += other.sum;
        self.avg += (other.avg - self.avg) * other.cnt as f64 / self.cnt as f64;
        if other.min < self.min {
            self.min = other.min;
        }
        if other.max > self.max {
            self.max = other.max;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert() {
        let mut summary = Summary::default();
        summary.insert(2.0);
        summary.insert(6.0);
        summary.insert(-1.0);
        assert_eq!(summary.cnt, 3);
        assert_eq!(summary.min, -1.0);
        assert_eq!(summary.max, 6.0);
        assert_eq!(summary.sum, 7.0);
        assert!((summary.avg - 7.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_insert_n() {
        let mut summary = Summary::default();
        summary.insert_n(3.0, 4);
        assert_eq!(summary.cnt, 4);
        assert_eq!(summary.sum, 12.0);
        assert_eq!(summary.avg, 3.0);
        assert_eq!(summary.min, 3.0);
        assert_eq!(summary.max, 3.0);
    }

    #[test]
    fn test_merge_is_commutative() {
        let mut a = Summary::default();
        a.insert(1.0);
        a.insert(5.0);
        let mut b = Summary::default();
        b.insert_n(10.0, 3);

        let mut ab = a;
        ab.merge(&b);
        let mut ba = b;
        ba.merge(&a);

        assert_eq!(ab.cnt, ba.cnt);
        assert_eq!(ab.sum, ba.sum);
        assert_eq!(ab.min, ba.min);
        assert_eq!(ab.max, ba.max);
        assert!((ab.avg - ba.avg).abs() < 1e-9);
    }

    #[test]
    fn test_merge_empty() {
        let mut a = Summary::default();
        let mut b = Summary::default();
        b.insert(4.0);
        a.merge(&b);
        assert_eq!(a, b);
        b.merge(&Summary::default());
        assert_eq!(a, b);
    }
}
