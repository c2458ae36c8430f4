//! Serve controller (§4.6-§4.10): deployment reconciliation, autoscaling
//! policy, and the single-writer control loop.

pub mod autoscaling_metrics;
pub mod autoscaling_policy;
pub mod backend_state;
pub mod controller;
pub mod endpoint_state;
pub mod errors;
pub mod http_state;
pub mod replica_actor;

pub use autoscaling_metrics::AutoscalingMetricsStore;
pub use autoscaling_policy::{AutoscalingPolicy, BasicAutoscalingPolicy};
pub use backend_state::{AutoscalingConfig, BackendInfo, BackendStateManager, DeploymentConfig, ReplicaConfig, ReplicaState};
pub use controller::{ControllerConfig, ServeController, SNAPSHOT_KEY};
pub use endpoint_state::EndpointState;
pub use errors::ServeError;
pub use http_state::{HttpOptions, HttpState};
pub use replica_actor::{FakeReplicaActor, FakeReplicaActorFactory, ReplicaActor, ReplicaActorFactory};
