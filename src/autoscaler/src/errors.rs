//! §7 error taxonomy for the cluster autoscaler monitor.

#[derive(Debug, thiserror::Error)]
pub enum AutoscalerError {
    /// Telemetry RPC timeout or KV temporary unavailability. Policy: log,
    /// skip the tick, continue.
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// A node-provider launch/terminate call failed. Treated the same as
    /// `TransientIo` by the monitor loop: logged, tick skipped.
    #[error("node provider error: {0}")]
    NodeProvider(String),
}
