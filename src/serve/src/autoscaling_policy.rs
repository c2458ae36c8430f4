//! Autoscaling policy (§4.7): a pure function from observed per-replica
//! load to a target replica count. Grounded in
//! `BasicAutoscalingPolicy.get_decision_num_replicas` referenced from
//! `original_source/python/ray/serve/controller.py`'s `autoscale()`.

use crate::backend_state::AutoscalingConfig;

pub trait AutoscalingPolicy: Send + Sync {
    /// Returns the new target replica count, or `None` if the autoscaler
    /// should skip this deployment this round (§4.7: an empty observation
    /// list must never drive the count toward zero).
    fn get_decision_num_replicas(
        &self,
        current_num_ongoing_requests: &[f64],
        curr_target_num_replicas: u32,
    ) -> Option<u32>;

    /// The window, in seconds, `autoscale()` should pull ongoing-request
    /// observations from.
    fn look_back_period_s(&self) -> f64;
}

/// `clamp(round(sum(observations) / target_per_replica), min, max)`.
pub struct BasicAutoscalingPolicy {
    config: AutoscalingConfig,
}

impl BasicAutoscalingPolicy {
    pub fn new(config: AutoscalingConfig) -> Self {
        BasicAutoscalingPolicy { config }
    }
}

impl AutoscalingPolicy for BasicAutoscalingPolicy {
    fn get_decision_num_replicas(
        &self,
        current_num_ongoing_requests: &[f64],
        _curr_target_num_replicas: u32,
    ) -> Option<u32> {
        if current_num_ongoing_requests.is_empty() {
            return None;
        }
        let total: f64 = current_num_ongoing_requests.iter().sum();
        let raw = total / self.config.target_num_ongoing_requests_per_replica;
        let rounded = raw.round() as i64;
        let clamped = rounded.clamp(self.config.min_replicas as i64, self.config.max_replicas as i64);
        Some(clamped as u32)
    }

    fn look_back_period_s(&self) -> f64 {
        self.config.look_back_period_s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AutoscalingConfig {
        AutoscalingConfig {
            min_replicas: 1,
            max_replicas: 10,
            look_back_period_s: 30.0,
            target_num_ongoing_requests_per_replica: 2.0,
        }
    }

    #[test]
    fn s3_basic_decision() {
        let policy = BasicAutoscalingPolicy::new(config());
        let decision = policy.get_decision_num_replicas(&[4.0, 4.0, 4.0], 3);
        assert_eq!(decision, Some(6));
    }

    #[test]
    fn property8_empty_observations_skip() {
        let policy = BasicAutoscalingPolicy::new(config());
        assert_eq!(policy.get_decision_num_replicas(&[], 3), None);
    }

    #[test]
    fn decision_is_clamped_to_max() {
        let policy = BasicAutoscalingPolicy::new(config());
        assert_eq!(policy.get_decision_num_replicas(&[100.0], 1), Some(10));
    }

    #[test]
    fn decision_is_clamped_to_min() {
        let policy = BasicAutoscalingPolicy::new(config());
        assert_eq!(policy.get_decision_num_replicas(&[0.1], 5), Some(1));
    }
}
