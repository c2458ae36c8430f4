//! Telemetry client (§4.12, external collaborator): the wire protocol to
//! the global state service's `GetAllResourceUsage` RPC (§6) is out of
//! scope. This trait is the seam the monitor loop polls every tick, grounded
//! in `gcs_node_resources_stub.GetAllResourceUsage(...)` in
//! `original_source/python/ray/autoscaler/_private/monitor.py`.

use std::time::Duration;

use async_trait::async_trait;
use fleetctl_types::TelemetryBatch;

use crate::errors::AutoscalerError;

#[async_trait]
pub trait TelemetryClient: Send + Sync {
    async fn get_all_resource_usage(
        &self,
        timeout: Duration,
    ) -> Result<TelemetryBatch, AutoscalerError>;
}

/// A test double that returns a queued sequence of batches, one per call,
/// repeating the last one once the queue is drained.
pub struct FakeTelemetryClient {
    batches: parking_lot::Mutex<Vec<TelemetryBatch>>,
}

impl FakeTelemetryClient {
    pub fn new(batches: Vec<TelemetryBatch>) -> Self {
        FakeTelemetryClient {
            batches: parking_lot::Mutex::new(batches),
        }
    }
}

#[async_trait]
impl TelemetryClient for FakeTelemetryClient {
    async fn get_all_resource_usage(
        &self,
        _timeout: Duration,
    ) -> Result<TelemetryBatch, AutoscalerError> {
        let mut batches = self.batches.lock();
        if batches.len() > 1 {
            Ok(batches.remove(0))
        } else {
            Ok(batches.first().cloned().unwrap_or_default())
        }
    }
}
