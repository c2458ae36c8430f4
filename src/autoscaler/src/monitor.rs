//! Cluster autoscaler monitor loop (§4.3). A single long-lived loop that
//! ingests telemetry, updates [`LoadMetrics`], and drives an optional
//! [`Autoscaler`] (node launches/terminations are its concern, not this
//! loop's). Grounded in `Monitor._run`/`Monitor.run` in
//! `original_source/python/ray/autoscaler/_private/monitor.py`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleetctl_kv::{KvStore, Namespace};
use fleetctl_types::{Bundle, NodeId, TelemetryBatch};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::timeout;

use crate::demand::parse_resource_demands;
use crate::errors::AutoscalerError;
use crate::event_summarizer::EventSummarizer;
use crate::load_metrics::{LoadMetrics, LoadMetricsSummary};
use crate::node_provider::NodeProvider;
use crate::telemetry::TelemetryClient;

/// Well-known KV keys (§6).
pub const AUTOSCALING_STATUS_KEY: &str = "autoscaler-status";
pub const AUTOSCALING_ERROR_KEY: &str = "autoscaler-error";
pub const RESOURCE_REQUEST_KEY: &str = "autoscaler-resource-request";

/// Node launches/terminations are the autoscaler's concern (§4.3 step 6).
/// The actual scaling algorithm (mapping load to node counts) is out of
/// scope for this core (§1 Non-goals: "does not define the cloud-facing
/// node-launch protocol") — this trait is the seam a real implementation
/// plugs into, grounded in `StandardAutoscaler.update()` in the original.
#[async_trait]
pub trait Autoscaler: Send + Sync {
    async fn update(&self, load_metrics: &LoadMetricsSummary) -> Result<AutoscalerReport, AutoscalerError>;

    /// Every node id this autoscaler currently believes is live, used by
    /// the monitor's failure path to tear down workers (§4.3 failure
    /// semantics, §7 `FatalLoopError`).
    fn known_node_ids(&self) -> Vec<NodeId>;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AutoscalerReport {
    pub active_nodes: HashMap<String, usize>,
    pub pending_nodes: usize,
}

/// A minimal [`Autoscaler`] that reports the cluster's current node types
/// back verbatim and issues no launches — the scaling decision algorithm
/// itself is out of scope for this core (§1 Non-goals). Used to wire up
/// `--autoscaling-config` without shipping a cloud-specific policy.
pub struct NullAutoscaler {
    node_provider: Arc<dyn NodeProvider>,
}

impl NullAutoscaler {
    pub fn new(node_provider: Arc<dyn NodeProvider>) -> Self {
        NullAutoscaler { node_provider }
    }
}

#[async_trait]
impl Autoscaler for NullAutoscaler {
    async fn update(&self, load_metrics: &LoadMetricsSummary) -> Result<AutoscalerReport, AutoscalerError> {
        let _ = &self.node_provider;
        Ok(AutoscalerReport {
            active_nodes: HashMap::from([("default".to_string(), load_metrics.node_count)]),
            pending_nodes: 0,
        })
    }

    fn known_node_ids(&self) -> Vec<NodeId> {
        Vec::new()
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub update_interval: Duration,
    pub telemetry_timeout: Duration,
    pub max_demand_vector_len: usize,
    /// Addressing convention (§4.3 step 3): use the node id as the
    /// `LoadMetrics` key instead of the node-manager address.
    pub use_node_id_as_ip: bool,
    /// `RAY_AUTOSCALER_FATESHARE_WORKERS=1` (§6): kill workers on fatal
    /// controller failure.
    pub fateshare_workers: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            update_interval: Duration::from_secs(5),
            telemetry_timeout: Duration::from_secs(60),
            max_demand_vector_len: 1000,
            use_node_id_as_ip: false,
            fateshare_workers: false,
        }
    }
}

#[derive(Serialize)]
struct StatusReport {
    load_metrics_report: LoadMetricsReportView,
    time_unix_ms: i64,
    monitor_pid: u32,
    autoscaler_report: Option<AutoscalerReport>,
}

#[derive(Serialize)]
struct LoadMetricsReportView {
    totals: Bundle,
    available: Bundle,
    node_count: usize,
    cluster_full: bool,
}

impl From<&LoadMetricsSummary> for LoadMetricsReportView {
    fn from(s: &LoadMetricsSummary) -> Self {
        LoadMetricsReportView {
            totals: s.totals.clone(),
            available: s.available.clone(),
            node_count: s.node_count,
            cluster_full: s.cluster_full,
        }
    }
}

/// The autoscaler monitor. Owns [`LoadMetrics`] exclusively — it is the
/// only writer (§4.2 invariants).
pub struct Monitor {
    telemetry: Arc<dyn TelemetryClient>,
    kv: Arc<dyn KvStore>,
    namespace: Namespace,
    node_provider: Arc<dyn NodeProvider>,
    autoscaler: Option<Arc<dyn Autoscaler>>,
    load_metrics: LoadMetrics,
    event_summarizer: EventSummarizer,
    last_avail_resources: Option<Bundle>,
    config: MonitorConfig,
}

impl Monitor {
    pub fn new(
        telemetry: Arc<dyn TelemetryClient>,
        kv: Arc<dyn KvStore>,
        namespace: Namespace,
        node_provider: Arc<dyn NodeProvider>,
        autoscaler: Option<Arc<dyn Autoscaler>>,
        config: MonitorConfig,
    ) -> Self {
        Monitor {
            telemetry,
            kv,
            namespace,
            node_provider,
            autoscaler,
            load_metrics: LoadMetrics::new(),
            event_summarizer: EventSummarizer::new(),
            last_avail_resources: None,
            config,
        }
    }

    /// Read-only mode: true when no autoscaler was configured (§4.3). The
    /// loop becomes a passive mirror and issues no node launches.
    pub fn is_read_only(&self) -> bool {
        self.autoscaler.is_none()
    }

    pub fn load_metrics(&self) -> &LoadMetrics {
        &self.load_metrics
    }

    /// Runs one iteration of steps 2-8. Telemetry/KV/parse failures are
    /// caught and logged here per §7's `TransientIo`/`ParseError` policy —
    /// this returns `Ok` even when the tick produced no new information.
    /// Only an error from the autoscaler itself propagates, matching the
    /// original's `_run` (caught per-tick) vs. `run` (top-level) split.
    pub async fn tick(&mut self, pid: u32) -> Result<(), AutoscalerError> {
        match timeout(
            self.config.telemetry_timeout,
            self.telemetry.get_all_resource_usage(self.config.telemetry_timeout),
        )
        .await
        {
            Ok(Ok(batch)) => self.ingest_batch(batch),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "transient telemetry error, skipping tick");
            }
            Err(_) => {
                tracing::warn!("telemetry fetch timed out, skipping tick");
            }
        }

        self.apply_pending_resource_request().await;
        self.report_size_change_if_any();

        let autoscaler_report = match &self.autoscaler {
            Some(autoscaler) => {
                let summary = self.load_metrics.summary();
                Some(autoscaler.update(&summary).await?)
            }
            None => None,
        };

        for message in self.event_summarizer.summary() {
            tracing::info!("{message}");
        }
        self.event_summarizer.clear();

        let status = StatusReport {
            load_metrics_report: LoadMetricsReportView::from(&self.load_metrics.summary()),
            time_unix_ms: chrono::Utc::now().timestamp_millis(),
            monitor_pid: pid,
            autoscaler_report,
        };
        if let Ok(bytes) = serde_json::to_vec(&status) {
            if let Err(e) = self.kv.put(&self.namespace, AUTOSCALING_STATUS_KEY, bytes, true).await {
                tracing::warn!(error = %e, "failed to write autoscaler status");
            }
        }

        Ok(())
    }

    fn ingest_batch(&mut self, batch: TelemetryBatch) {
        let parsed = parse_resource_demands(&batch.resource_load_by_shape, self.config.max_demand_vector_len);
        for report in &batch.reports {
            let ip = report.addressing_identity(self.config.use_node_id_as_ip);
            self.load_metrics.update(
                &ip,
                report.totals.clone(),
                report.available.clone(),
                report.load.clone(),
                parsed.waiting.clone(),
                parsed.infeasible.clone(),
                batch.placement_group_load.clone(),
                report.cluster_full_of_actors_detected,
            );
        }
    }

    async fn apply_pending_resource_request(&mut self) {
        match self.kv.get(&self.namespace, RESOURCE_REQUEST_KEY).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<Vec<Bundle>>(&bytes) {
                Ok(requests) => self.load_metrics.set_resource_requests(requests),
                Err(e) => tracing::warn!(error = %e, "failed to parse pending resource request"),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "transient KV error fetching resource request"),
        }
    }

    fn report_size_change_if_any(&mut self) {
        let avail = self.load_metrics.resources_avail_summary();
        if Some(&avail) != self.last_avail_resources.as_ref() {
            self.event_summarizer.add("Resized to {}.", format!("{avail:?}"));
            self.last_avail_resources = Some(avail);
        }
    }

    /// Runs the loop until `stop` is set, retrying each tick's recoverable
    /// errors and propagating the fatal-error handling of §4.3/§7 if the
    /// autoscaler itself errors.
    pub async fn run(&mut self, mut stop: watch::Receiver<bool>, pid: u32) -> Result<(), AutoscalerError> {
        loop {
            if *stop.borrow() {
                return Ok(());
            }

            if let Err(e) = self.tick(pid).await {
                self.handle_fatal_error(&e).await;
                return Err(e);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.update_interval) => {}
                _ = stop.changed() => {}
            }
        }
    }

    /// §4.3 failure path / §7 `FatalLoopError`: push the error to the KV
    /// error key, optionally tear down worker nodes, retried until
    /// success.
    async fn handle_fatal_error(&self, error: &AutoscalerError) {
        tracing::error!(error = %error, "fatal error in monitor loop");
        let message = format!("The autoscaler failed with the following error:\n{error}");
        let _ = self
            .kv
            .put(&self.namespace, AUTOSCALING_ERROR_KEY, message.into_bytes(), true)
            .await;

        if self.config.fateshare_workers {
            if let Some(autoscaler) = &self.autoscaler {
                let ids = autoscaler.known_node_ids();
                let mut attempt = 0;
                loop {
                    attempt += 1;
                    match self.node_provider.terminate_nodes(&ids).await {
                        Ok(()) => break,
                        Err(e) => {
                            tracing::error!(error = %e, attempt, "cleanup exception tearing down workers, retrying");
                            tokio::time::sleep(Duration::from_secs(2)).await;
                            if attempt >= 5 {
                                tracing::error!("giving up tearing down workers after repeated failures");
                                break;
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_provider::NullNodeProvider;
    use crate::telemetry::FakeTelemetryClient;
    use fleetctl_kv::InMemoryKvStore;
    use fleetctl_types::{NodeReport, ResourceDemandRecord};

    fn bundle(pairs: &[(&str, f64)]) -> Bundle {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn report(ip: &str, cpu: f64) -> NodeReport {
        NodeReport {
            node_id: NodeId(ip.as_bytes().to_vec()),
            manager_address: ip.to_string(),
            totals: bundle(&[("CPU", cpu)]),
            available: bundle(&[("CPU", cpu)]),
            load: Bundle::new(),
            cluster_full_of_actors_detected: false,
        }
    }

    #[tokio::test]
    async fn tick_updates_load_metrics_and_writes_status() {
        let telemetry = Arc::new(FakeTelemetryClient::new(vec![TelemetryBatch {
            reports: vec![report("10.0.0.1:1", 4.0)],
            resource_load_by_shape: vec![ResourceDemandRecord {
                shape: bundle(&[("CPU", 1.0)]),
                ready_queued: 2,
                infeasible_queued: 0,
                backlog: 0,
            }],
            placement_group_load: vec![],
        }]));
        let kv = Arc::new(InMemoryKvStore::new());
        let namespace = Namespace::new("monitor", "ns");
        let mut monitor = Monitor::new(
            telemetry,
            kv.clone(),
            namespace.clone(),
            Arc::new(NullNodeProvider),
            None,
            MonitorConfig::default(),
        );

        assert!(monitor.is_read_only());
        monitor.tick(1234).await.unwrap();

        assert_eq!(monitor.load_metrics().node_count(), 1);
        let status = kv.get(&namespace, AUTOSCALING_STATUS_KEY).await.unwrap();
        assert!(status.is_some());
    }

    struct FailingAutoscaler;

    #[async_trait]
    impl Autoscaler for FailingAutoscaler {
        async fn update(&self, _: &LoadMetricsSummary) -> Result<AutoscalerReport, AutoscalerError> {
            Err(AutoscalerError::NodeProvider("boom".into()))
        }
        fn known_node_ids(&self) -> Vec<NodeId> {
            vec![]
        }
    }

    #[tokio::test]
    async fn fatal_autoscaler_error_writes_error_key_and_propagates() {
        let telemetry = Arc::new(FakeTelemetryClient::new(vec![TelemetryBatch::default()]));
        let kv = Arc::new(InMemoryKvStore::new());
        let namespace = Namespace::new("monitor", "ns");
        let mut monitor = Monitor::new(
            telemetry,
            kv.clone(),
            namespace.clone(),
            Arc::new(NullNodeProvider),
            Some(Arc::new(FailingAutoscaler)),
            MonitorConfig::default(),
        );

        let (_tx, rx) = watch::channel(false);
        let result = monitor.run(rx, 1).await;
        assert!(result.is_err());
        let error = kv.get(&namespace, AUTOSCALING_ERROR_KEY).await.unwrap();
        assert!(error.is_some());
    }

    #[tokio::test]
    async fn stop_signal_exits_cleanly() {
        let telemetry = Arc::new(FakeTelemetryClient::new(vec![TelemetryBatch::default()]));
        let kv = Arc::new(InMemoryKvStore::new());
        let mut monitor = Monitor::new(
            telemetry,
            kv,
            Namespace::new("monitor", "ns"),
            Arc::new(NullNodeProvider),
            None,
            MonitorConfig {
                update_interval: Duration::from_millis(1),
                ..MonitorConfig::default()
            },
        );
        let (tx, rx) = watch::channel(true);
        drop(tx);
        let result = monitor.run(rx, 1).await;
        assert!(result.is_ok());
    }
}
