//! Closed `[start, end]` ranges of the reachability interval space

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::{REACHABILITY_INTERVAL_END, REACHABILITY_INTERVAL_START};
use crate::error::{ConsensusError, Result};

/// An interval where `end = start - 1` denotes the empty interval anchored at `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
    pub start: u64,
    pub end: u64,
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

impl Interval {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Empty interval anchored at `start`
    pub fn empty_at(start: u64) -> Self {
        Self { start, end: start.wrapping_sub(1) }
    }

    /// The full interval space owned by the reachability root
    pub fn maximal() -> Self {
        Self::new(REACHABILITY_INTERVAL_START, REACHABILITY_INTERVAL_END)
    }

    pub fn size(&self) -> u64 {
        self.end.wrapping_add(1).wrapping_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn increase(&self, offset: u64) -> Self {
        Self::new(self.start + offset, self.end + offset)
    }

    pub fn decrease(&self, offset: u64) -> Self {
        Self::new(self.start - offset, self.end - offset)
    }

    pub fn increase_start(&self, offset: u64) -> Self {
        Self::new(self.start + offset, self.end)
    }

    pub fn decrease_start(&self, offset: u64) -> Self {
        Self::new(self.start - offset, self.end)
    }

    pub fn increase_end(&self, offset: u64) -> Self {
        Self::new(self.start, self.end + offset)
    }

    pub fn decrease_end(&self, offset: u64) -> Self {
        Self::new(self.start, self.end - offset)
    }

    /// Splits into two halves; the left one gets the extra unit of an odd size
    pub fn split_half(&self) -> (Self, Self) {
        let left_size = self.size().div_ceil(2);
        let left = Self::new(self.start, self.start + left_size - 1);
        let right = Self::new(self.start + left_size, self.end);
        (left, right)
    }

    /// Splits into consecutive intervals of exactly the given sizes, which must sum to `size()`
    pub fn split_exact(&self, sizes: &[u64]) -> Result<Vec<Self>> {
        let total: u128 = sizes.iter().map(|s| *s as u128).sum();
        if total != self.size() as u128 {
            return Err(ConsensusError::Invariant(format!(
                "sizes sum to {total} but interval {self} has size {}",
                self.size()
            )));
        }
        let mut intervals = Vec::with_capacity(sizes.len());
        let mut start = self.start;
        for size in sizes {
            intervals.push(Self::new(start, start.wrapping_add(*size).wrapping_sub(1)));
            start = start.wrapping_add(*size);
        }
        Ok(intervals)
    }

    /// Splits so that every part gets at least its requested size, and the
    /// remaining slack is distributed exponentially by subtree size. Bigger
    /// subtrees receive proportionally more room to grow.
    pub fn split_exponential(&self, sizes: &[u64]) -> Result<Vec<Self>> {
        let interval_size = self.size();
        let sizes_sum: u64 = sizes.iter().sum();
        if interval_size < sizes_sum {
            return Err(ConsensusError::Invariant(format!(
                "interval {self} of size {interval_size} cannot hold {sizes_sum}"
            )));
        }
        if interval_size == sizes_sum {
            return self.split_exact(sizes);
        }

        let mut remaining_bias = interval_size - sizes_sum;
        let total_bias = remaining_bias as f64;
        let mut biased_sizes = Vec::with_capacity(sizes.len());
        let fractions = exponential_fractions(sizes);
        for (i, fraction) in fractions.iter().enumerate() {
            let bias = if i == fractions.len() - 1 {
                remaining_bias
            } else {
                remaining_bias.min((total_bias * fraction).round() as u64)
            };
            biased_sizes.push(sizes[i] + bias);
            remaining_bias -= bias;
        }
        self.split_exact(&biased_sizes)
    }

    /// Whether `other` lies inside `self` (both ends inclusive)
    pub fn contains(&self, other: Self) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn strictly_contains(&self, other: Self) -> bool {
        self.start <= other.start && other.end < self.end
    }
}

/// Fractions proportional to `2^size`, normalized by the largest size to stay in float range
fn exponential_fractions(sizes: &[u64]) -> Vec<f64> {
    let max_size = sizes.iter().copied().max().unwrap_or_default();
    let mut fractions: Vec<f64> = sizes.iter().map(|s| 1f64 / 2f64.powf((max_size - s) as f64)).collect();
    let fractions_sum: f64 = fractions.iter().sum();
    for fraction in fractions.iter_mut() {
        *fraction /= fractions_sum;
    }
    fractions
}
