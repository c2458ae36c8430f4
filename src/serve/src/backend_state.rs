//! Backend state manager (§4.6): owns the per-deployment sub-state and
//! reconciles desired vs. actual replica counts on each `update()`. Grounded
//! in the `deploy_backend`/`autoscale`/`_put_serve_snapshot` flow of
//! `original_source/python/ray/serve/controller.py`, since the backend-state
//! module itself was not retrieved into this pack.

use std::collections::BTreeMap;
use std::sync::Arc;

use fleetctl_goals::GoalManager;
use fleetctl_types::{Bundle, DeploymentName, GoalId, ReplicaTag};
use serde::{Deserialize, Serialize};

use crate::replica_actor::{ReplicaActor, ReplicaActorFactory};

/// The code + resource shape a replica is instantiated from (§3
/// `Deployment`). Opaque beyond its resource footprint; the core never
/// inspects `code_descriptor`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicaConfig {
    pub resource_shape: Bundle,
    pub code_descriptor: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AutoscalingConfig {
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub look_back_period_s: f64,
    pub target_num_ongoing_requests_per_replica: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeploymentConfig {
    pub num_replicas: u32,
    pub autoscaling_config: Option<AutoscalingConfig>,
    /// Code/config identity tag. Unlike `num_replicas`, a changed version
    /// means the deployment is transitioning, not just resizing.
    pub version: Option<String>,
}

/// The public view of a deployment (§3 `Deployment`), as returned by
/// `get_backend`/`get_deployment_info`/`list_deployments`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendInfo {
    pub class_name: String,
    pub replica_config: ReplicaConfig,
    pub deployment_config: DeploymentConfig,
    pub deployer_job_id: Option<String>,
    pub start_time_ms: i64,
    /// `0` while the deployment is live; set once on deletion.
    pub end_time_ms: i64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ReplicaState {
    Starting,
    Updating,
    Running,
    Stopping,
    Stopped,
}

pub struct ReplicaRecord {
    pub state: ReplicaState,
    pub version: Option<String>,
    pub actor: Option<Arc<dyn ReplicaActor>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunningReplicaInfo {
    pub tag: ReplicaTag,
    pub version: Option<String>,
}

struct DeploymentState {
    info: BackendInfo,
    replicas: BTreeMap<ReplicaTag, ReplicaRecord>,
    next_replica_idx: u64,
    goal: Option<GoalId>,
}

impl DeploymentState {
    fn is_deleted(&self) -> bool {
        self.info.end_time_ms != 0
    }
}

/// Owns every deployment's sub-state: `(desired_config, replicas, version)`.
/// Single-writer — only the serve controller, under its write lock, calls
/// the mutating methods.
pub struct BackendStateManager {
    goals: GoalManager,
    factory: Arc<dyn ReplicaActorFactory>,
    deployments: BTreeMap<DeploymentName, DeploymentState>,
}

impl BackendStateManager {
    pub fn new(goals: GoalManager, factory: Arc<dyn ReplicaActorFactory>) -> Self {
        BackendStateManager {
            goals,
            factory,
            deployments: BTreeMap::new(),
        }
    }

    /// Seeds the manager with actors a fresh process found already running
    /// under its replica naming convention, treating them as `RUNNING`
    /// pending a readiness check rather than launching duplicates.
    pub fn recover_replica(
        &mut self,
        name: &DeploymentName,
        tag: ReplicaTag,
        version: Option<String>,
        actor: Arc<dyn ReplicaActor>,
    ) {
        if let Some(state) = self.deployments.get_mut(name) {
            state.replicas.insert(
                tag,
                ReplicaRecord {
                    state: ReplicaState::Running,
                    version,
                    actor: Some(actor),
                },
            );
        }
    }

    /// Idempotent. Creates a transition goal only when this is a brand-new
    /// deployment or its version tag changed; a config-only update (e.g. the
    /// autoscaler adjusting `num_replicas` in place) is applied immediately
    /// but reported as `(None, false)` since no new convergence goal is
    /// needed — `update()` picks up the new `num_replicas` on its own next
    /// tick. `start_time_ms` on the incoming `info` is honored only for a
    /// genuinely new or re-versioned deployment; a config-only update keeps
    /// the original start time.
    pub fn deploy_backend(&mut self, name: DeploymentName, mut info: BackendInfo) -> (Option<GoalId>, bool) {
        match self.deployments.get_mut(&name) {
            Some(existing) if !existing.is_deleted() => {
                let version_changed = existing.info.deployment_config.version != info.deployment_config.version;
                if version_changed {
                    let goal = self.goals.create_goal();
                    existing.info = info;
                    existing.goal = Some(goal);
                    (Some(goal), true)
                } else {
                    info.start_time_ms = existing.info.start_time_ms;
                    existing.info = info;
                    (None, false)
                }
            }
            _ => {
                let goal = self.goals.create_goal();
                self.deployments.insert(
                    name,
                    DeploymentState {
                        info,
                        replicas: BTreeMap::new(),
                        next_replica_idx: 0,
                        goal: Some(goal),
                    },
                );
                (Some(goal), true)
            }
        }
    }

    /// Marks every replica STOPPING and sets `end_time_ms`; idempotent for
    /// an already-deleted deployment. Returns `None` for an unknown name.
    pub fn delete_backend(&mut self, name: &DeploymentName) -> Option<GoalId> {
        let state = self.deployments.get_mut(name)?;
        if state.is_deleted() {
            return state.goal;
        }
        for replica in state.replicas.values_mut() {
            if replica.state != ReplicaState::Stopped {
                replica.state = ReplicaState::Stopping;
            }
        }
        state.info.end_time_ms = now_ms();
        let goal = self.goals.create_goal();
        state.goal = Some(goal);
        Some(goal)
    }

    pub fn get_backend(&self, name: &DeploymentName, include_deleted: bool) -> Option<BackendInfo> {
        let state = self.deployments.get(name)?;
        if state.is_deleted() && !include_deleted {
            return None;
        }
        Some(state.info.clone())
    }

    pub fn get_deployment_configs(&self, include_deleted: bool) -> BTreeMap<DeploymentName, BackendInfo> {
        self.deployments
            .iter()
            .filter(|(_, state)| include_deleted || !state.is_deleted())
            .map(|(name, state)| (name.clone(), state.info.clone()))
            .collect()
    }

    pub fn get_running_replica_infos(&self) -> BTreeMap<DeploymentName, Vec<RunningReplicaInfo>> {
        self.deployments
            .iter()
            .map(|(name, state)| {
                let running = state
                    .replicas
                    .iter()
                    .filter(|(_, r)| r.state == ReplicaState::Running)
                    .map(|(tag, r)| RunningReplicaInfo {
                        tag: tag.clone(),
                        version: r.version.clone(),
                    })
                    .collect();
                (name.clone(), running)
            })
            .collect()
    }

    /// Marks every deployment for deletion and returns the set of goals.
    pub fn shutdown(&mut self) -> Vec<GoalId> {
        let names: Vec<_> = self.deployments.keys().cloned().collect();
        names.into_iter().filter_map(|name| self.delete_backend(&name)).collect()
    }

    /// The reconciliation step. Bounded work per tick: for each deployment,
    /// closes exactly the gap between desired and actual, advances replicas
    /// through their readiness/teardown transitions, and resolves goals
    /// whose deployment reached a steady state.
    pub async fn update(&mut self) {
        for (name, state) in self.deployments.iter_mut() {
            let desired = if state.is_deleted() {
                0
            } else {
                state.info.deployment_config.num_replicas
            };
            let target_version = state.info.deployment_config.version.clone();

            reconcile_one(name, state, desired, &target_version, &self.factory).await;

            let steady = desired as usize
                == state
                    .replicas
                    .values()
                    .filter(|r| r.state == ReplicaState::Running)
                    .count()
                && !state
                    .replicas
                    .values()
                    .any(|r| matches!(r.state, ReplicaState::Starting | ReplicaState::Stopping));

            if steady {
                if let Some(goal) = state.goal.take() {
                    self.goals.complete(goal, None);
                }
            }
        }
    }
}

async fn reconcile_one(
    name: &DeploymentName,
    state: &mut DeploymentState,
    desired: u32,
    target_version: &Option<String>,
    factory: &Arc<dyn ReplicaActorFactory>,
) {
    // Only up-to-date replicas count toward the desired count; stale-version
    // ones are retired separately, below, at a bounded rate.
    let up_to_date_running_or_starting = state
        .replicas
        .values()
        .filter(|r| matches!(r.state, ReplicaState::Running | ReplicaState::Starting) && &r.version == target_version)
        .count() as i64;
    let delta = desired as i64 - up_to_date_running_or_starting;

    if delta > 0 {
        for _ in 0..delta {
            let tag = ReplicaTag(format!("{name}#{}", state.next_replica_idx));
            state.next_replica_idx += 1;
            let actor = factory.spawn(name, &tag, &state.info.replica_config);
            state.replicas.insert(
                tag,
                ReplicaRecord {
                    state: ReplicaState::Starting,
                    version: target_version.clone(),
                    actor: Some(actor),
                },
            );
        }
    } else if delta < 0 {
        let to_stop = (-delta) as usize;
        let running: Vec<ReplicaTag> = state
            .replicas
            .iter()
            .filter(|(_, r)| r.state == ReplicaState::Running && &r.version == target_version)
            .map(|(tag, _)| tag.clone())
            .take(to_stop)
            .collect();
        for tag in running {
            if let Some(r) = state.replicas.get_mut(&tag) {
                r.state = ReplicaState::Stopping;
            }
        }
    }

    // Stale-version replicas are retired at most one per tick: a version
    // change shouldn't tear down the whole old generation the moment the
    // replacements are requested, only drain it gradually as a rolling
    // update, bounding the transitions issued beyond what closes the gap.
    if let Some(tag) = state
        .replicas
        .iter()
        .find(|(_, r)| r.state == ReplicaState::Running && &r.version != target_version)
        .map(|(tag, _)| tag.clone())
    {
        if let Some(r) = state.replicas.get_mut(&tag) {
            r.state = ReplicaState::Stopping;
        }
    }

    let tags: Vec<ReplicaTag> = state.replicas.keys().cloned().collect();
    for tag in tags {
        let (current_state, actor) = {
            let record = state.replicas.get(&tag).expect("tag from own keys");
            (record.state, record.actor.clone())
        };
        match current_state {
            ReplicaState::Starting => {
                if let Some(actor) = &actor {
                    if actor.is_ready().await {
                        state.replicas.get_mut(&tag).unwrap().state = ReplicaState::Running;
                    }
                }
            }
            ReplicaState::Stopping => {
                if let Some(actor) = &actor {
                    actor.stop().await;
                }
                state.replicas.get_mut(&tag).unwrap().state = ReplicaState::Stopped;
            }
            _ => {}
        }
    }

    state.replicas.retain(|_, r| r.state != ReplicaState::Stopped);
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica_actor::FakeReplicaActorFactory;

    fn config(num_replicas: u32, version: &str) -> DeploymentConfig {
        DeploymentConfig {
            num_replicas,
            autoscaling_config: None,
            version: Some(version.to_string()),
        }
    }

    fn info(num_replicas: u32, version: &str) -> BackendInfo {
        BackendInfo {
            class_name: "Model".into(),
            replica_config: ReplicaConfig {
                resource_shape: Bundle::new(),
                code_descriptor: "model.py:Model".into(),
            },
            deployment_config: config(num_replicas, version),
            deployer_job_id: None,
            start_time_ms: 1_000,
            end_time_ms: 0,
        }
    }

    fn manager() -> BackendStateManager {
        BackendStateManager::new(
            GoalManager::new(),
            Arc::new(FakeReplicaActorFactory { polls_until_ready: 0 }),
        )
    }

    #[tokio::test]
    async fn property1_snapshot_matches_in_memory_after_update() {
        let mut mgr = manager();
        let name = DeploymentName("A".into());
        mgr.deploy_backend(name.clone(), info(2, "v1"));
        mgr.update().await;
        mgr.update().await; // readiness is instant with 0 polls, still drain starting->running
        let running = mgr.get_running_replica_infos();
        assert_eq!(running[&name].len(), 2);
    }

    #[tokio::test]
    async fn s5_delete_removes_from_live_list_but_keeps_for_include_deleted() {
        let mut mgr = manager();
        let name = DeploymentName("A".into());
        mgr.deploy_backend(name.clone(), info(1, "v1"));
        mgr.update().await;
        mgr.delete_backend(&name);
        assert!(mgr.get_backend(&name, false).is_none());
        let deleted = mgr.get_backend(&name, true).unwrap();
        assert_eq!(deleted.end_time_ms != 0, true);
        mgr.update().await;
        assert!(mgr.get_running_replica_infos()[&name].is_empty());
    }

    #[tokio::test]
    async fn property5_idempotent_redeploy_same_version_returns_updating_false() {
        let mut mgr = manager();
        let name = DeploymentName("A".into());
        let (goal1, updating1) = mgr.deploy_backend(name.clone(), info(2, "v1"));
        assert!(goal1.is_some());
        assert!(updating1);
        let (goal2, updating2) = mgr.deploy_backend(name.clone(), info(2, "v1"));
        assert!(goal2.is_none());
        assert!(!updating2);
    }

    #[tokio::test]
    async fn config_only_redeploy_preserves_start_time() {
        let mut mgr = manager();
        let name = DeploymentName("A".into());
        mgr.deploy_backend(name.clone(), info(2, "v1"));
        let mut resized = info(5, "v1");
        resized.start_time_ms = 999_999;
        mgr.deploy_backend(name.clone(), resized);
        let current = mgr.get_backend(&name, false).unwrap();
        assert_eq!(current.start_time_ms, 1_000);
        assert_eq!(current.deployment_config.num_replicas, 5);
    }

    #[tokio::test]
    async fn version_change_refreshes_start_time_and_issues_new_goal() {
        let mut mgr = manager();
        let name = DeploymentName("A".into());
        mgr.deploy_backend(name.clone(), info(2, "v1"));
        let mut v2 = info(2, "v2");
        v2.start_time_ms = 5_000;
        let (goal, updating) = mgr.deploy_backend(name.clone(), v2);
        assert!(goal.is_some());
        assert!(updating);
        assert_eq!(mgr.get_backend(&name, false).unwrap().start_time_ms, 5_000);
    }

    #[tokio::test]
    async fn version_change_retires_stale_replicas_one_per_tick() {
        let mut mgr = manager();
        let name = DeploymentName("A".into());
        mgr.deploy_backend(name.clone(), info(3, "v1"));
        mgr.update().await;
        assert_eq!(mgr.get_running_replica_infos()[&name].len(), 3);

        mgr.deploy_backend(name.clone(), info(3, "v2"));
        mgr.update().await;

        let running = mgr.get_running_replica_infos();
        let by_version = &running[&name];
        let v1_count = by_version.iter().filter(|r| r.version.as_deref() == Some("v1")).count();
        let v2_count = by_version.iter().filter(|r| r.version.as_deref() == Some("v2")).count();
        assert_eq!(v1_count, 2, "only one stale replica may retire per update() tick");
        assert_eq!(v2_count, 3);

        mgr.update().await;
        let running = mgr.get_running_replica_infos();
        assert_eq!(running[&name].iter().filter(|r| r.version.as_deref() == Some("v1")).count(), 1);

        mgr.update().await;
        let running = mgr.get_running_replica_infos();
        assert!(running[&name].iter().all(|r| r.version.as_deref() == Some("v2")));
    }

    #[tokio::test]
    async fn scale_down_moves_running_replicas_to_stopping_then_removes_them() {
        let mut mgr = manager();
        let name = DeploymentName("A".into());
        mgr.deploy_backend(name.clone(), info(3, "v1"));
        mgr.update().await;
        assert_eq!(mgr.get_running_replica_infos()[&name].len(), 3);

        mgr.deploy_backend(name.clone(), info(1, "v1"));
        mgr.update().await;
        assert_eq!(mgr.get_running_replica_infos()[&name].len(), 1);
    }
}
