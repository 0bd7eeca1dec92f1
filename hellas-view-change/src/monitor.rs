//! Throughput and latency tracking used to decide when the primary is too slow.
//!
//! Time here is whatever unit the caller uses for `ordered_ts`, as `f64`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::ViewChangeConfig;

/// Throughput over fixed windows anchored at `first_ts`, smoothed with an EMA.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThroughputMeasurement {
    pub window_size: f64,
    pub min_count: u64,
    pub first_ts: f64,
    pub window_start_ts: f64,
    pub reqs_in_window: u64,
    /// Smoothed rate over all closed windows.
    pub throughput: f64,
}

impl ThroughputMeasurement {
    /// `window_size` must be positive; `ViewChangeConfig::validate` guarantees it.
    pub fn new(window_size: f64, min_count: u64, first_ts: f64) -> Self {
        debug_assert!(window_size > 0.0);
        Self {
            window_size,
            min_count,
            first_ts,
            window_start_ts: first_ts,
            reqs_in_window: 0,
            throughput: 0.0,
        }
    }

    fn alpha(&self) -> f64 {
        2.0 / (self.min_count as f64 + 1.0)
    }

    pub fn add_request(&mut self, ordered_ts: f64) {
        self.update_time(ordered_ts);
        self.reqs_in_window += 1;
    }

    /// Closes every window that ended at or before `current_ts`.
    pub fn update_time(&mut self, current_ts: f64) {
        if current_ts < self.window_start_ts + self.window_size {
            return;
        }
        let alpha = self.alpha();
        let rate = self.reqs_in_window as f64 / self.window_size;
        self.throughput = alpha * rate + (1.0 - alpha) * self.throughput;
        self.window_start_ts += self.window_size;
        self.reqs_in_window = 0;

        // the remaining windows are empty, each one just decays the average
        let empty = ((current_ts - self.window_start_ts) / self.window_size).floor();
        if empty >= 1.0 {
            self.throughput *= (1.0 - alpha).powf(empty);
            self.window_start_ts += empty * self.window_size;
        }
    }

    /// `None` until `min_count` windows have passed since `first_ts`.
    pub fn get_throughput(&mut self, request_time: f64) -> Option<f64> {
        if request_time < self.first_ts + self.window_size * self.min_count as f64 {
            return None;
        }
        self.update_time(request_time);
        Some(self.throughput)
    }
}

/// Running mean latency per client.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyMeasurement {
    /// client id -> (requests seen, mean latency)
    pub avg_latencies: BTreeMap<String, (u64, f64)>,
}

impl LatencyMeasurement {
    pub fn add_duration(&mut self, client_id: &str, duration: f64) {
        let (count, mean) = self
            .avg_latencies
            .entry(client_id.to_string())
            .or_insert((0, 0.0));
        *mean = (*mean * *count as f64 + duration) / (*count + 1) as f64;
        *count += 1;
    }

    pub fn get_avg_latency(&self, client_id: &str) -> Option<f64> {
        self.avg_latencies.get(client_id).map(|(_, mean)| *mean)
    }
}

/// The signal source for `NeedViewChange`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMonitor {
    pub throughput: ThroughputMeasurement,
    pub latency: LatencyMeasurement,
}

impl PerformanceMonitor {
    pub fn new(config: &ViewChangeConfig, first_ts: f64) -> Self {
        Self {
            throughput: ThroughputMeasurement::new(
                config.throughput_window_size as f64,
                config.throughput_min_count,
                first_ts,
            ),
            latency: LatencyMeasurement::default(),
        }
    }

    pub fn record_ordered(&mut self, ordered_ts: f64) {
        self.throughput.add_request(ordered_ts);
    }

    pub fn record_completion(&mut self, client_id: &str, latency: f64) {
        self.latency.add_duration(client_id, latency);
    }

    pub fn current_throughput(&mut self, now: f64) -> Option<f64> {
        self.throughput.get_throughput(now)
    }

    pub fn avg_latency(&self, client_id: &str) -> Option<f64> {
        self.latency.get_avg_latency(client_id)
    }

    /// True once throughput is known and has fallen below `min_throughput`.
    pub fn is_degraded(&mut self, now: f64, min_throughput: f64) -> bool {
        self.current_throughput(now)
            .is_some_and(|throughput| throughput < min_throughput)
    }
}
