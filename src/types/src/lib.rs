//! Shared data model for the fleetctl control plane.
//!
//! Every type that crosses a process boundary (telemetry batches, KV store
//! payloads, long-poll snapshots) lives here so the autoscaler and serve
//! crates agree on a single wire shape.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A resource -> quantity mapping. `BTreeMap` keeps iteration order
/// deterministic, which matters for checkpoint round-tripping (§8 property 4).
pub type Bundle = BTreeMap<String, f64>;

/// Opaque node identifier. Carried as raw bytes on the wire, displayed as
/// hex for logs and addressing fallback (§4.3 step 3).
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct NodeId(#[serde(with = "hex_bytes")] pub Vec<u8>);

impl NodeId {
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        Ok(NodeId(hex::decode(s)?))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// Unique tag for a replica within its owning deployment.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ReplicaTag(pub String);

impl fmt::Display for ReplicaTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique name of a deployment.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct DeploymentName(pub String);

impl fmt::Display for DeploymentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier for an in-flight asynchronous goal (§4.5).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct GoalId(pub Uuid);

impl GoalId {
    pub fn new() -> Self {
        GoalId(Uuid::new_v4())
    }
}

impl Default for GoalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GoalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A snapshot of one node at one telemetry poll (§3 `NodeReport`). Not
/// persisted — consumed immediately by `LoadMetrics::update`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeReport {
    pub node_id: NodeId,
    pub manager_address: String,
    pub totals: Bundle,
    pub available: Bundle,
    pub load: Bundle,
    pub cluster_full_of_actors_detected: bool,
}

impl NodeReport {
    /// The addressing identity used as a `LoadMetrics` key: the
    /// node-manager address, or the node id when the provider is configured
    /// to use node ids as IPs (§4.3 step 3).
    pub fn addressing_identity(&self, use_node_id_as_ip: bool) -> String {
        if use_node_id_as_ip {
            self.node_id.to_hex()
        } else {
            self.manager_address.clone()
        }
    }
}

/// A single resource-demand record as reported by the telemetry service
/// (§3 `ResourceDemand`), before expansion by the demand-vector parser.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResourceDemandRecord {
    pub shape: Bundle,
    pub ready_queued: u32,
    pub infeasible_queued: u32,
    pub backlog: u32,
}

/// A placement-group demand blob (§6 `placement_group_load`). Opaque beyond
/// its identity and constituent bundles — the core does not schedule
/// placement groups, only forwards their presence.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlacementGroupDemand {
    pub id: String,
    pub bundles: Vec<Bundle>,
}

/// A batch returned by the telemetry service's `GetAllResourceUsage` (§6).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TelemetryBatch {
    pub reports: Vec<NodeReport>,
    pub resource_load_by_shape: Vec<ResourceDemandRecord>,
    pub placement_group_load: Vec<PlacementGroupDemand>,
}

/// Thrown when a route prefix violates the §3 invariant that a present
/// prefix must begin with `/`.
#[derive(Debug, thiserror::Error)]
#[error("route prefix {0:?} must start with '/'")]
pub struct InvalidRoutePrefix(pub String);

/// Validates the §3 route-prefix invariant. `None` (no route) always passes.
pub fn validate_route_prefix(prefix: &Option<String>) -> Result<(), InvalidRoutePrefix> {
    match prefix {
        Some(p) if !p.starts_with('/') => Err(InvalidRoutePrefix(p.clone())),
        _ => Ok(()),
    }
}
