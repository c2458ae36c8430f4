//! Autoscaling metrics store (§4.8): a time-indexed ring of
//! `(timestamp, value)` samples per replica, reported by replicas over the
//! `record_autoscaling_metrics` RPC (§4.10). Grounded in the
//! `autoscaling_metrics_store.window_average` call in `autoscale()`,
//! `original_source/python/ray/serve/controller.py`.

use std::collections::BTreeMap;

use fleetctl_types::ReplicaTag;

struct Sample {
    timestamp_s: f64,
    value: f64,
}

/// Samples older than `max_look_back_s` are evicted lazily on insertion, so
/// memory is bounded without a background sweep.
pub struct AutoscalingMetricsStore {
    max_look_back_s: f64,
    samples: BTreeMap<ReplicaTag, Vec<Sample>>,
}

impl AutoscalingMetricsStore {
    pub fn new(max_look_back_s: f64) -> Self {
        AutoscalingMetricsStore {
            max_look_back_s,
            samples: BTreeMap::new(),
        }
    }

    /// Records one value per replica tag in `points`, all stamped with the
    /// same `send_timestamp`.
    pub fn add_metrics_point(&mut self, points: &[(ReplicaTag, f64)], send_timestamp_s: f64) {
        let cutoff = send_timestamp_s - self.max_look_back_s;
        for (tag, value) in points {
            let entry = self.samples.entry(tag.clone()).or_default();
            entry.push(Sample {
                timestamp_s: send_timestamp_s,
                value: *value,
            });
            entry.retain(|sample| sample.timestamp_s >= cutoff);
        }
    }

    /// Mean of samples with `timestamp >= since_timestamp_s`; `None` if the
    /// replica has no such samples.
    pub fn window_average(&self, tag: &ReplicaTag, since_timestamp_s: f64) -> Option<f64> {
        let entry = self.samples.get(tag)?;
        let in_window: Vec<f64> = entry
            .iter()
            .filter(|sample| sample.timestamp_s >= since_timestamp_s)
            .map(|sample| sample.value)
            .collect();
        if in_window.is_empty() {
            return None;
        }
        Some(in_window.iter().sum::<f64>() / in_window.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_average_of_recent_samples() {
        let mut store = AutoscalingMetricsStore::new(60.0);
        let tag = ReplicaTag("r1".into());
        store.add_metrics_point(&[(tag.clone(), 2.0)], 100.0);
        store.add_metrics_point(&[(tag.clone(), 4.0)], 110.0);
        assert_eq!(store.window_average(&tag, 90.0), Some(3.0));
    }

    #[test]
    fn samples_outside_window_are_excluded() {
        let mut store = AutoscalingMetricsStore::new(60.0);
        let tag = ReplicaTag("r1".into());
        store.add_metrics_point(&[(tag.clone(), 2.0)], 100.0);
        store.add_metrics_point(&[(tag.clone(), 10.0)], 200.0);
        assert_eq!(store.window_average(&tag, 150.0), Some(10.0));
    }

    #[test]
    fn unknown_replica_returns_none() {
        let store = AutoscalingMetricsStore::new(60.0);
        assert_eq!(store.window_average(&ReplicaTag("none".into()), 0.0), None);
    }

    #[test]
    fn old_samples_are_evicted_on_insertion() {
        let mut store = AutoscalingMetricsStore::new(10.0);
        let tag = ReplicaTag("r1".into());
        store.add_metrics_point(&[(tag.clone(), 1.0)], 0.0);
        store.add_metrics_point(&[(tag.clone(), 9.0)], 100.0);
        // the sample at t=0 should have been evicted by the 100.0 insertion's cutoff of 90.0
        assert_eq!(store.window_average(&tag, 0.0), Some(9.0));
    }
}
