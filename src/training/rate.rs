//! Variance maximizing rate adaption.
//!
//! Weight variance grows while the model learns useful structure and
//! flattens or shrinks near convergence or instability. The controller keeps
//! a sliding window of `var(W)` samples and sets the update rate from the
//! least-squares trend of that window.

use crate::config::OptimizationConfig;
use crate::core::LinkMatrix;
use std::collections::VecDeque;

/// Sliding-window controller of the global update rate.
#[derive(Debug, Clone)]
pub struct RateController {
    length: usize,
    interval: usize,
    wait: usize,
    factor: f32,
    min_rate: f32,
    max_rate: f32,
    /// Weight variances, newest first
    history: VecDeque<f32>,
}

impl RateController {
    pub fn new(length: usize, factor: f32, min_rate: f32, max_rate: f32) -> Self {
        Self {
            length,
            interval: 1,
            wait: 0,
            factor,
            min_rate,
            max_rate,
            history: VecDeque::with_capacity(length + 1),
        }
    }

    pub fn from_config(config: &OptimizationConfig) -> Self {
        Self {
            interval: config.vmra_interval.max(1),
            wait: config.vmra_wait,
            ..Self::new(
                config.vmra_length,
                config.vmra_factor,
                config.vmra_min_rate,
                config.vmra_max_rate,
            )
        }
    }

    /// Whether the controller should run at the given 0-based epoch.
    pub fn is_due(&self, epoch: usize) -> bool {
        epoch % self.interval == 0 && epoch > self.wait
    }

    /// Record the weight variance of `links` and return a new rate once the window is full.
    pub fn maybe_adapt(&mut self, links: &LinkMatrix) -> Option<f32> {
        self.observe(links.weight_variance())
    }

    /// Record a variance sample and return a new rate once the window is full.
    pub fn observe(&mut self, variance: f32) -> Option<f32> {
        self.history.push_front(variance);
        self.history.truncate(self.length);
        if self.history.len() < self.length || self.length < 2 {
            return None;
        }
        // slope over sample age: positive when variance has been falling
        let slope = least_squares_slope(self.history.iter().copied());
        let rate = (-slope * self.factor).clamp(self.min_rate, self.max_rate);
        if rate.is_finite() {
            Some(rate)
        } else {
            None
        }
    }

    /// Recorded variances, newest first.
    pub fn history(&self) -> &VecDeque<f32> {
        &self.history
    }
}

/// Slope of the least-squares line through `(i, yᵢ)`, `i = 0, 1, ...`.
#[allow(clippy::cast_precision_loss)]
fn least_squares_slope(values: impl Iterator<Item = f32>) -> f32 {
    let ys: Vec<f32> = values.collect();
    let n = ys.len() as f32;
    if ys.len() < 2 {
        return 0.0;
    }
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = ys.iter().sum::<f32>() / n;
    let mut num = 0.0f32;
    let mut den = 0.0f32;
    for (i, y) in ys.iter().enumerate() {
        let dx = i as f32 - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }
    num / den
}
