//! Replica actor handle (§4.13, external collaborator contract): the
//! controller drives replicas entirely through this trait, never through a
//! concrete RPC client. Teardown acknowledgment is `stop()` resolving, and
//! readiness is `is_ready()` returning `true` — mirrors the
//! `actor_handle.is_allocated`/`initialize_and_get_metadata` polling in
//! `original_source/python/ray/serve/backend_state.py`'s replica lifecycle
//! (not present in this pack's retrieved file set, so grounded instead on
//! `deploy`'s readiness-check framing in
//! `original_source/python/ray/serve/controller.py` and on the
//! `NamespacedOrchestrator` "wait for service" pattern in the teacher's
//! `src/controller/src/lib.rs`).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use fleetctl_types::{DeploymentName, ReplicaTag};

use crate::backend_state::ReplicaConfig;

#[async_trait]
pub trait ReplicaActor: Send + Sync {
    async fn is_ready(&self) -> bool;
    async fn stop(&self);
}

/// Constructs a fresh [`ReplicaActor`] for a deployment. The production
/// implementation would launch a real worker process; this workspace ships
/// only [`FakeReplicaActorFactory`] for tests.
pub trait ReplicaActorFactory: Send + Sync {
    fn spawn(
        &self,
        deployment: &DeploymentName,
        tag: &ReplicaTag,
        replica_config: &ReplicaConfig,
    ) -> Arc<dyn ReplicaActor>;
}

/// Becomes ready after a configurable number of `is_ready` polls, so tests
/// can exercise the STARTING -> RUNNING transition deterministically.
pub struct FakeReplicaActor {
    polls_until_ready: AtomicU32,
    stopped: std::sync::atomic::AtomicBool,
}

impl FakeReplicaActor {
    pub fn new(polls_until_ready: u32) -> Self {
        FakeReplicaActor {
            polls_until_ready: AtomicU32::new(polls_until_ready),
            stopped: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReplicaActor for FakeReplicaActor {
    async fn is_ready(&self) -> bool {
        let remaining = self.polls_until_ready.load(Ordering::SeqCst);
        if remaining == 0 {
            true
        } else {
            self.polls_until_ready.fetch_sub(1, Ordering::SeqCst);
            false
        }
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Spawns [`FakeReplicaActor`]s that all take the same fixed number of
/// polls to become ready.
pub struct FakeReplicaActorFactory {
    pub polls_until_ready: u32,
}

impl ReplicaActorFactory for FakeReplicaActorFactory {
    fn spawn(
        &self,
        _deployment: &DeploymentName,
        _tag: &ReplicaTag,
        _replica_config: &ReplicaConfig,
    ) -> Arc<dyn ReplicaActor> {
        Arc::new(FakeReplicaActor::new(self.polls_until_ready))
    }
}
