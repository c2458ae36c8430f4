//! Load metrics (§4.2): an accumulator for per-node resource totals,
//! availability, and pending demand. Called exclusively from the monitor
//! loop (single-writer); `summary()` is a pure function of the current
//! per-node map, with no hidden state.

use fleetctl_types::{Bundle, PlacementGroupDemand};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
struct NodeEntry {
    totals: Bundle,
    available: Bundle,
    load: Bundle,
    waiting: Vec<Bundle>,
    infeasible: Vec<Bundle>,
    pending_placement_groups: Vec<PlacementGroupDemand>,
    cluster_full: bool,
}

/// A compact aggregate snapshot, as produced by [`LoadMetrics::summary`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadMetricsSummary {
    pub totals: Bundle,
    pub available: Bundle,
    pub node_count: usize,
    pub pending_demand: Vec<Bundle>,
    pub pending_infeasible: Vec<Bundle>,
    pub cluster_full: bool,
    pub resource_requests: Vec<Bundle>,
}

/// Per-node accumulator. `update` overwrites the whole entry for a node in
/// one atomic replacement (§5 ordering guarantee 3) — there is no partial
/// update across fields of the same node within a tick.
#[derive(Default)]
pub struct LoadMetrics {
    nodes: BTreeMap<String, NodeEntry>,
    resource_requests: Vec<Bundle>,
}

impl LoadMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &mut self,
        node_ip: &str,
        total: Bundle,
        available: Bundle,
        load: Bundle,
        waiting: Vec<Bundle>,
        infeasible: Vec<Bundle>,
        pending_placement_groups: Vec<PlacementGroupDemand>,
        cluster_full: bool,
    ) {
        self.nodes.insert(
            node_ip.to_string(),
            NodeEntry {
                totals: total,
                available,
                load,
                waiting,
                infeasible,
                pending_placement_groups,
                cluster_full,
            },
        );
    }

    /// Records a user-driven demand floor (§4.2 `set_resource_requests`).
    pub fn set_resource_requests(&mut self, requests: Vec<Bundle>) {
        self.resource_requests = requests;
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Aggregate over all nodes: total/available per resource, node count,
    /// pending demand.
    pub fn summary(&self) -> LoadMetricsSummary {
        let mut totals = Bundle::new();
        let mut available = Bundle::new();
        let mut pending_demand = Vec::new();
        let mut pending_infeasible = Vec::new();
        let mut cluster_full = false;

        for node in self.nodes.values() {
            for (resource, qty) in &node.totals {
                *totals.entry(resource.clone()).or_insert(0.0) += qty;
            }
            for (resource, qty) in &node.available {
                *available.entry(resource.clone()).or_insert(0.0) += qty;
            }
            pending_demand.extend(node.waiting.iter().cloned());
            pending_infeasible.extend(node.infeasible.iter().cloned());
            cluster_full |= node.cluster_full;
        }

        LoadMetricsSummary {
            totals,
            available,
            node_count: self.nodes.len(),
            pending_demand,
            pending_infeasible,
            cluster_full,
            resource_requests: self.resource_requests.clone(),
        }
    }

    /// A compact value used only for change detection between ticks (§4.3
    /// step 5): the summed available-resources bundle.
    pub fn resources_avail_summary(&self) -> Bundle {
        let mut available = Bundle::new();
        for node in self.nodes.values() {
            for (resource, qty) in &node.available {
                *available.entry(resource.clone()).or_insert(0.0) += qty;
            }
        }
        available
    }
}
