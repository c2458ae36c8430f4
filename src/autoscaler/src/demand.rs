//! Demand-vector parser (§4.1). Expands the compact
//! `(shape, ready_queued, infeasible_queued, backlog)` records reported by
//! the telemetry service into two ordered lists of bundles, `waiting` and
//! `infeasible`, capped at a configured maximum total length.
//!
//! Grounded in `parse_resource_demands` in
//! `original_source/python/ray/autoscaler/_private/monitor.py`: a task is
//! either ready-and-queued or structurally infeasible, never both; backlog
//! is attributed to whichever class currently dominates for that record.

use fleetctl_types::{Bundle, ResourceDemandRecord};

/// Output of [`parse_resource_demands`].
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ParsedDemand {
    pub waiting: Vec<Bundle>,
    pub infeasible: Vec<Bundle>,
}

impl ParsedDemand {
    pub fn len(&self) -> usize {
        self.waiting.len() + self.infeasible.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parses `records` into waiting/infeasible bundle lists, stopping once the
/// running total exceeds `max_len`. Truncation is stable: earlier bundles
/// (from earlier records, and within a record ready-before-infeasible-before-backlog)
/// are always retained over later ones.
///
/// Any malformed record is impossible to express in this typed API (the
/// counters are plain `u32`s), so unlike the Python original this function
/// cannot fail — callers that deserialize untrusted wire data should reject
/// malformed records before calling this, at which point §4.1's "failure
/// produces empty lists" policy degenerates to simply not including that
/// record.
pub fn parse_resource_demands(records: &[ResourceDemandRecord], max_len: usize) -> ParsedDemand {
    let mut out = ParsedDemand::default();

    for record in records {
        for _ in 0..record.ready_queued {
            out.waiting.push(record.shape.clone());
        }
        for _ in 0..record.infeasible_queued {
            out.infeasible.push(record.shape.clone());
        }

        // A task is ready-and-queued or infeasible, never both; backlog
        // follows whichever class this record populated.
        let backlog_target = if record.infeasible_queued > 0 {
            &mut out.infeasible
        } else {
            &mut out.waiting
        };
        for _ in 0..record.backlog {
            backlog_target.push(record.shape.clone());
        }

        if out.len() > max_len {
            break;
        }
    }

    out
}
