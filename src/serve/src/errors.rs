//! §7 error taxonomy for the serve controller.

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    /// `prev_version` supplied to `deploy` does not match the existing
    /// deployment's version, or there is no existing deployment at all.
    /// Policy: surface to the caller; do not mutate.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// Lookup by an unknown deployment name. Policy: surface to caller.
    #[error("not found: {0}")]
    NotFound(String),

    /// KV store temporarily unavailable. Policy: log, skip, continue.
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// A route prefix violated the `/`-prefix invariant (§3).
    #[error(transparent)]
    InvalidRoute(#[from] fleetctl_types::InvalidRoutePrefix),

    /// A route prefix is already bound to a different active deployment
    /// (§3 invariant: route prefixes are unique across active deployments).
    #[error(transparent)]
    RoutePrefixConflict(#[from] crate::endpoint_state::RoutePrefixConflict),
}
