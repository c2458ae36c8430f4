//! Node provider (§4.11, external collaborator). The cloud-facing
//! launch/terminate protocol is out of scope for this core (§1); this trait
//! is the seam the autoscaling policy drives, grounded in
//! `mz_orchestrator::{Orchestrator, NamespacedOrchestrator}` — the same
//! "abstract compute-provisioning backend" role in the teacher's own
//! controller (`src/controller/src/lib.rs`).

use async_trait::async_trait;
use fleetctl_types::NodeId;

use crate::errors::AutoscalerError;

#[async_trait]
pub trait NodeProvider: Send + Sync {
    async fn launch_nodes(&self, node_type: &str, count: usize) -> Result<(), AutoscalerError>;
    async fn terminate_nodes(&self, ids: &[NodeId]) -> Result<(), AutoscalerError>;
}

/// A no-op provider used in read-only mode (§4.3) and by tests: it logs the
/// action it would have taken and never actually provisions anything.
#[derive(Default)]
pub struct NullNodeProvider;

#[async_trait]
impl NodeProvider for NullNodeProvider {
    async fn launch_nodes(&self, node_type: &str, count: usize) -> Result<(), AutoscalerError> {
        tracing::debug!(node_type, count, "null node provider: would launch nodes");
        Ok(())
    }

    async fn terminate_nodes(&self, ids: &[NodeId]) -> Result<(), AutoscalerError> {
        tracing::debug!(count = ids.len(), "null node provider: would terminate nodes");
        Ok(())
    }
}
