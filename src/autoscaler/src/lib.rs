//! Cluster autoscaler monitor (§4.1-§4.3): telemetry ingestion, demand
//! parsing, and the node-provisioning control loop.

pub mod demand;
pub mod errors;
pub mod event_summarizer;
pub mod load_metrics;
pub mod monitor;
pub mod node_provider;
pub mod telemetry;

pub use demand::{parse_resource_demands, ParsedDemand};
pub use errors::AutoscalerError;
pub use event_summarizer::EventSummarizer;
pub use load_metrics::{LoadMetrics, LoadMetricsSummary};
pub use monitor::{Autoscaler, AutoscalerReport, Monitor, MonitorConfig, NullAutoscaler};
pub use node_provider::{NodeProvider, NullNodeProvider};
pub use telemetry::{FakeTelemetryClient, TelemetryClient};
