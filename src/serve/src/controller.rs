//! Serve controller (§4.9, §4.10): the single-writer control loop and its
//! public RPC surface. Grounded in `ServeController.run_control_loop`/
//! `deploy`/`_put_serve_snapshot` in
//! `original_source/python/ray/serve/controller.py`; the write lock follows
//! the `asyncio.Lock` there and the `Arc<Mutex<...>>` idiom used throughout
//! the teacher's `mz-persist-client`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fleetctl_goals::GoalManager;
use fleetctl_kv::{KvStore, Namespace};
use fleetctl_longpoll::LongPollHost;
use fleetctl_types::{validate_route_prefix, DeploymentName, GoalId, ReplicaTag};
use serde::Serialize;
use tokio::sync::{watch, Mutex};

use crate::autoscaling_metrics::AutoscalingMetricsStore;
use crate::autoscaling_policy::{AutoscalingPolicy, BasicAutoscalingPolicy};
use crate::backend_state::{BackendInfo, BackendStateManager, DeploymentConfig, ReplicaConfig};
use crate::endpoint_state::EndpointState;
use crate::errors::ServeError;
use crate::http_state::{HttpOptions, HttpState};
use crate::replica_actor::ReplicaActorFactory;

pub const SNAPSHOT_KEY: &str = "serve-deployments-snapshot";

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    pub control_loop_period: Duration,
    pub max_metrics_look_back_s: f64,
    /// Testing hook (§4.9): probability, in `[0, 1]`, of terminating the
    /// process immediately after a checkpoint write is durably
    /// acknowledged. Zero in production.
    pub crash_after_checkpoint_probability: f64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            control_loop_period: Duration::from_secs(1),
            max_metrics_look_back_s: 600.0,
            crash_after_checkpoint_probability: 0.0,
        }
    }
}

struct ControllerState {
    backend_state_manager: BackendStateManager,
    endpoint_state: EndpointState,
    http_state: HttpState,
    policies: BTreeMap<DeploymentName, Arc<dyn AutoscalingPolicy>>,
    metrics_store: AutoscalingMetricsStore,
}

#[derive(Serialize)]
struct SnapshotEntry {
    name: String,
    class_name: String,
    version: Option<String>,
    route: Option<String>,
    start_time_ms: i64,
    end_time_ms: i64,
    status: &'static str,
    actors: BTreeMap<String, ActorSnapshotEntry>,
}

#[derive(Serialize)]
struct ActorSnapshotEntry {
    replica_tag: String,
    version: Option<String>,
}

pub struct ServeController {
    state: Mutex<ControllerState>,
    goals: GoalManager,
    longpoll: Arc<LongPollHost>,
    kv: Arc<dyn KvStore>,
    namespace: Namespace,
    config: ControllerConfig,
}

impl ServeController {
    pub fn new(
        kv: Arc<dyn KvStore>,
        namespace: Namespace,
        goals: GoalManager,
        longpoll: Arc<LongPollHost>,
        factory: Arc<dyn ReplicaActorFactory>,
        http_options: HttpOptions,
        config: ControllerConfig,
    ) -> Self {
        let state = ControllerState {
            backend_state_manager: BackendStateManager::new(goals.clone(), factory),
            endpoint_state: EndpointState::new(),
            http_state: HttpState::new(http_options),
            policies: BTreeMap::new(),
            metrics_store: AutoscalingMetricsStore::new(config.max_metrics_look_back_s),
        };
        ServeController {
            state: Mutex::new(state),
            goals,
            longpoll,
            kv,
            namespace,
            config,
        }
    }

    /// §4.10 `deploy`. On first deploy of an autoscaling-enabled
    /// deployment, `num_replicas` is forced to `min_replicas`.
    pub async fn deploy(
        &self,
        name: DeploymentName,
        replica_config: ReplicaConfig,
        mut deployment_config: DeploymentConfig,
        version: Option<String>,
        prev_version: Option<String>,
        route_prefix: Option<String>,
        deployer_job_id: Option<String>,
    ) -> Result<(Option<GoalId>, bool), ServeError> {
        validate_route_prefix(&route_prefix)?;
        deployment_config.version = version;

        let mut guard = self.state.lock().await;

        if let Some(prev) = &prev_version {
            match guard.backend_state_manager.get_backend(&name, false) {
                None => {
                    return Err(ServeError::PreconditionFailed(format!(
                        "prev_version {prev:?} given but deployment {name} does not exist"
                    )))
                }
                Some(existing) if existing.deployment_config.version.as_deref() != Some(prev.as_str()) => {
                    return Err(ServeError::PreconditionFailed(format!(
                        "prev_version {prev:?} does not match existing version {:?}",
                        existing.deployment_config.version
                    )))
                }
                Some(_) => {}
            }
        }

        if let Some(autoscaling) = deployment_config.autoscaling_config.clone() {
            deployment_config.num_replicas = autoscaling.min_replicas;
            guard
                .policies
                .insert(name.clone(), Arc::new(BasicAutoscalingPolicy::new(autoscaling)));
        } else {
            guard.policies.remove(&name);
        }

        let info = BackendInfo {
            class_name: replica_config.code_descriptor.clone(),
            replica_config,
            deployment_config,
            deployer_job_id,
            start_time_ms: now_ms(),
            end_time_ms: 0,
        };

        // Reject a conflicting route prefix before mutating backend state,
        // so a rejected deploy leaves no partial state behind.
        guard.endpoint_state.update_endpoint(name.clone(), route_prefix)?;
        let (goal, updating) = guard.backend_state_manager.deploy_backend(name, info);

        self.checkpoint_and_notify(&mut guard).await;
        Ok((goal, updating))
    }

    pub async fn delete_deployment(&self, name: &DeploymentName) -> Result<GoalId, ServeError> {
        let mut guard = self.state.lock().await;
        let goal = guard
            .backend_state_manager
            .delete_backend(name)
            .ok_or_else(|| ServeError::NotFound(name.to_string()))?;
        guard.policies.remove(name);
        self.checkpoint_and_notify(&mut guard).await;
        Ok(goal)
    }

    pub async fn get_deployment_info(&self, name: &DeploymentName) -> Result<(BackendInfo, Option<String>), ServeError> {
        let guard = self.state.lock().await;
        let info = guard
            .backend_state_manager
            .get_backend(name, false)
            .ok_or_else(|| ServeError::NotFound(name.to_string()))?;
        let route = guard.endpoint_state.get_route(name);
        Ok((info, route))
    }

    pub async fn list_deployments(&self, include_deleted: bool) -> BTreeMap<DeploymentName, (BackendInfo, Option<String>)> {
        let guard = self.state.lock().await;
        guard
            .backend_state_manager
            .get_deployment_configs(include_deleted)
            .into_iter()
            .map(|(name, info)| {
                let route = guard.endpoint_state.get_route(&name);
                (name, (info, route))
            })
            .collect()
    }

    pub async fn get_http_config(&self) -> HttpOptions {
        self.state.lock().await.http_state.config()
    }

    pub async fn get_root_url(&self) -> String {
        self.state.lock().await.http_state.root_url()
    }

    pub async fn get_http_proxies(&self) -> BTreeMap<fleetctl_types::NodeId, String> {
        self.state.lock().await.http_state.proxies()
    }

    pub async fn get_all_endpoints(&self) -> BTreeMap<DeploymentName, Option<String>> {
        let guard = self.state.lock().await;
        guard
            .backend_state_manager
            .get_deployment_configs(false)
            .into_keys()
            .map(|name| {
                let route = guard.endpoint_state.get_route(&name);
                (name, route)
            })
            .collect()
    }

    /// Forwards to the long-poll notifier. Read-only: takes no write lock.
    pub async fn listen_for_change(
        &self,
        known_versions: std::collections::HashMap<String, u64>,
    ) -> std::collections::HashMap<String, (u64, Vec<u8>)> {
        self.longpoll.listen_for_change(known_versions).await
    }

    pub async fn wait_for_goal(&self, id: GoalId) -> Option<String> {
        self.goals.wait_for_goal(id).await
    }

    pub async fn record_autoscaling_metrics(&self, points: &[(ReplicaTag, f64)], send_timestamp_s: f64) {
        let mut guard = self.state.lock().await;
        guard.metrics_store.add_metrics_point(points, send_timestamp_s);
    }

    pub async fn shutdown(&self) -> Vec<GoalId> {
        let mut guard = self.state.lock().await;
        let goals = guard.backend_state_manager.shutdown();
        guard.endpoint_state.shutdown();
        guard.http_state.shutdown();
        self.checkpoint_and_notify(&mut guard).await;
        goals
    }

    /// §4.9 step 1: for every autoscaling-enabled deployment, compute its
    /// target replica count and re-deploy in place if it differs. Errors are
    /// impossible by construction here (no I/O, no fallible parsing), so
    /// unlike the original this has no catch — a deployment with no recent
    /// observations is simply skipped.
    async fn autoscale(&self) {
        let mut guard = self.state.lock().await;
        let names: Vec<DeploymentName> = guard.policies.keys().cloned().collect();
        for name in names {
            let Some(policy) = guard.policies.get(&name).cloned() else {
                continue;
            };
            let Some(info) = guard.backend_state_manager.get_backend(&name, false) else {
                continue;
            };
            let running = guard
                .backend_state_manager
                .get_running_replica_infos()
                .remove(&name)
                .unwrap_or_default();

            let since = now_s() - policy.look_back_period_s();
            let observations: Vec<f64> = running
                .iter()
                .filter_map(|replica| guard.metrics_store.window_average(&replica.tag, since))
                .collect();
            if observations.is_empty() {
                continue;
            }

            let Some(decision) = policy.get_decision_num_replicas(&observations, info.deployment_config.num_replicas)
            else {
                continue;
            };
            if decision != info.deployment_config.num_replicas {
                let mut new_info = info;
                new_info.deployment_config.num_replicas = decision;
                guard.backend_state_manager.deploy_backend(name, new_info);
            }
        }
    }

    /// §4.9 main loop.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.control_loop_period);
        interval.tick().await;
        loop {
            if *stop.borrow() {
                return;
            }

            self.autoscale().await;

            {
                let mut guard = self.state.lock().await;
                guard.http_state.update();
                guard.backend_state_manager.update().await;
            }

            self.put_serve_snapshot().await;

            tokio::select! {
                _ = interval.tick() => {}
                _ = stop.changed() => {}
            }
        }
    }

    async fn put_serve_snapshot(&self) {
        let guard = self.state.lock().await;
        let bytes = self.build_snapshot_bytes(&guard);
        drop(guard);
        if let Err(e) = self.kv.put(&self.namespace, SNAPSHOT_KEY, bytes.clone(), true).await {
            tracing::warn!(error = %e, "failed to write serve snapshot");
            return;
        }
        self.longpoll.notify(SNAPSHOT_KEY, bytes);
    }

    /// Writes the checkpoint and notifies subscribers inside the same write
    /// lock critical section (§5 ordering guarantee 1). Applies the
    /// crash-after-checkpoint testing hook once the write is durably
    /// acknowledged.
    async fn checkpoint_and_notify(&self, guard: &mut ControllerState) {
        let bytes = self.build_snapshot_bytes(guard);
        if let Err(e) = self.kv.put(&self.namespace, SNAPSHOT_KEY, bytes.clone(), true).await {
            tracing::warn!(error = %e, "failed to checkpoint serve state");
            return;
        }
        self.longpoll.notify(SNAPSHOT_KEY, bytes);

        if self.config.crash_after_checkpoint_probability > 0.0
            && rand::random::<f64>() < self.config.crash_after_checkpoint_probability
        {
            tracing::error!("crash-after-checkpoint testing hook fired, terminating process");
            std::process::exit(1);
        }
    }

    fn build_snapshot_bytes(&self, state: &ControllerState) -> Vec<u8> {
        let running = state.backend_state_manager.get_running_replica_infos();
        let snapshot: BTreeMap<String, SnapshotEntry> = state
            .backend_state_manager
            .get_deployment_configs(true)
            .into_iter()
            .map(|(name, info)| {
                let route = state.endpoint_state.get_route(&name);
                let status = if info.end_time_ms != 0 { "DELETED" } else { "RUNNING" };
                let actors = if status == "RUNNING" {
                    running
                        .get(&name)
                        .into_iter()
                        .flatten()
                        .enumerate()
                        .map(|(i, replica)| {
                            (
                                format!("{name}-actor-{i}"),
                                ActorSnapshotEntry {
                                    replica_tag: replica.tag.to_string(),
                                    version: replica.version.clone(),
                                },
                            )
                        })
                        .collect()
                } else {
                    BTreeMap::new()
                };
                let entry = SnapshotEntry {
                    name: name.to_string(),
                    class_name: info.class_name.clone(),
                    version: info.deployment_config.version.clone(),
                    route,
                    start_time_ms: info.start_time_ms,
                    end_time_ms: info.end_time_ms,
                    status,
                    actors,
                };
                (name.to_string(), entry)
            })
            .collect();
        serde_json::to_vec(&snapshot).unwrap_or_default()
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn now_s() -> f64 {
    now_ms() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend_state::AutoscalingConfig;
    use crate::replica_actor::FakeReplicaActorFactory;
    use fleetctl_kv::InMemoryKvStore;
    use fleetctl_types::Bundle;

    fn make_controller(crash_probability: f64) -> ServeController {
        ServeController::new(
            Arc::new(InMemoryKvStore::new()),
            Namespace::new("serve", "default"),
            GoalManager::new(),
            Arc::new(LongPollHost::new()),
            Arc::new(FakeReplicaActorFactory { polls_until_ready: 0 }),
            HttpOptions::default(),
            ControllerConfig {
                control_loop_period: Duration::from_millis(5),
                crash_after_checkpoint_probability: crash_probability,
                ..ControllerConfig::default()
            },
        )
    }

    fn replica_config() -> ReplicaConfig {
        ReplicaConfig {
            resource_shape: Bundle::new(),
            code_descriptor: "model.py:Model".into(),
        }
    }

    fn deployment_config(num_replicas: u32) -> DeploymentConfig {
        DeploymentConfig {
            num_replicas,
            autoscaling_config: None,
            version: None,
        }
    }

    #[tokio::test]
    async fn s4_prev_version_mismatch_is_rejected() {
        let controller = make_controller(0.0);
        let name = DeploymentName("A".into());
        controller
            .deploy(
                name.clone(),
                replica_config(),
                deployment_config(1),
                Some("v1".into()),
                None,
                None,
                None,
            )
            .await
            .unwrap();

        let result = controller
            .deploy(
                name.clone(),
                replica_config(),
                deployment_config(1),
                Some("v3".into()),
                Some("v2".into()),
                None,
                None,
            )
            .await;
        assert!(matches!(result, Err(ServeError::PreconditionFailed(_))));
        let (info, _) = controller.get_deployment_info(&name).await.unwrap();
        assert_eq!(info.deployment_config.version.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn s5_list_deployments_excludes_deleted_unless_asked() {
        let controller = make_controller(0.0);
        let name = DeploymentName("A".into());
        controller
            .deploy(name.clone(), replica_config(), deployment_config(1), Some("v1".into()), None, None, None)
            .await
            .unwrap();
        controller.delete_deployment(&name).await.unwrap();

        let live = controller.list_deployments(false).await;
        assert!(!live.contains_key(&name));

        let all = controller.list_deployments(true).await;
        assert_eq!(all[&name].0.end_time_ms != 0, true);
    }

    #[tokio::test]
    async fn property6_live_list_never_has_deleted_entries() {
        let controller = make_controller(0.0);
        for i in 0..3 {
            let name = DeploymentName(format!("dep-{i}"));
            controller
                .deploy(name.clone(), replica_config(), deployment_config(1), Some("v1".into()), None, None, None)
                .await
                .unwrap();
        }
        controller
            .delete_deployment(&DeploymentName("dep-1".into()))
            .await
            .unwrap();
        let live = controller.list_deployments(false).await;
        assert!(live.values().all(|(info, _)| info.end_time_ms == 0));
    }

    #[tokio::test]
    async fn property5_idempotent_deploy_returns_updating_false_second_time() {
        let controller = make_controller(0.0);
        let name = DeploymentName("A".into());
        let (goal1, updating1) = controller
            .deploy(name.clone(), replica_config(), deployment_config(1), Some("v1".into()), None, None, None)
            .await
            .unwrap();
        assert!(goal1.is_some() && updating1);

        let (goal2, updating2) = controller
            .deploy(name.clone(), replica_config(), deployment_config(1), Some("v1".into()), None, None, None)
            .await
            .unwrap();
        assert!(goal2.is_none() && !updating2);
    }

    #[tokio::test]
    async fn autoscaling_deploy_forces_num_replicas_to_min() {
        let controller = make_controller(0.0);
        let name = DeploymentName("A".into());
        let mut config = deployment_config(4);
        config.autoscaling_config = Some(AutoscalingConfig {
            min_replicas: 2,
            max_replicas: 8,
            look_back_period_s: 30.0,
            target_num_ongoing_requests_per_replica: 2.0,
        });
        controller
            .deploy(name.clone(), replica_config(), config, Some("v1".into()), None, None, None)
            .await
            .unwrap();
        let (info, _) = controller.get_deployment_info(&name).await.unwrap();
        assert_eq!(info.deployment_config.num_replicas, 2);
    }

    #[tokio::test]
    async fn conflicting_route_prefix_is_rejected() {
        let controller = make_controller(0.0);
        controller
            .deploy(
                DeploymentName("A".into()),
                replica_config(),
                deployment_config(1),
                Some("v1".into()),
                None,
                Some("/shared".into()),
                None,
            )
            .await
            .unwrap();

        let result = controller
            .deploy(
                DeploymentName("B".into()),
                replica_config(),
                deployment_config(1),
                Some("v1".into()),
                None,
                Some("/shared".into()),
                None,
            )
            .await;
        assert!(matches!(result, Err(ServeError::RoutePrefixConflict(_))));
        // The rejected deploy must not have created a second deployment.
        assert!(controller.get_deployment_info(&DeploymentName("B".into())).await.is_err());
    }

    #[tokio::test]
    async fn invalid_route_prefix_is_rejected() {
        let controller = make_controller(0.0);
        let result = controller
            .deploy(
                DeploymentName("A".into()),
                replica_config(),
                deployment_config(1),
                Some("v1".into()),
                None,
                Some("no-leading-slash".into()),
                None,
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn shutdown_returns_a_goal_per_deployment() {
        let controller = make_controller(0.0);
        controller
            .deploy(DeploymentName("A".into()), replica_config(), deployment_config(1), Some("v1".into()), None, None, None)
            .await
            .unwrap();
        controller
            .deploy(DeploymentName("B".into()), replica_config(), deployment_config(1), Some("v1".into()), None, None, None)
            .await
            .unwrap();
        let goals = controller.shutdown().await;
        assert_eq!(goals.len(), 2);
    }
}
