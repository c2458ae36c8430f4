//! Endpoint state (§3 invariant: route prefixes are unique across active
//! deployments). Grounded in `self.endpoint_state.update_endpoint`/
//! `get_endpoint_route` calls in
//! `original_source/python/ray/serve/controller.py`'s `deploy`/
//! `get_deployment_info`.

use std::collections::BTreeMap;

use fleetctl_types::DeploymentName;

#[derive(Debug, thiserror::Error)]
#[error("route prefix {0:?} is already in use by another deployment")]
pub struct RoutePrefixConflict(pub String);

#[derive(Default)]
pub struct EndpointState {
    routes: BTreeMap<DeploymentName, Option<String>>,
}

impl EndpointState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the route for `name`, rejecting a prefix
    /// already owned by a different deployment.
    pub fn update_endpoint(
        &mut self,
        name: DeploymentName,
        route_prefix: Option<String>,
    ) -> Result<(), RoutePrefixConflict> {
        if let Some(prefix) = &route_prefix {
            if let Some((other, _)) = self
                .routes
                .iter()
                .find(|(other_name, other_prefix)| *other_name != &name && other_prefix.as_deref() == Some(prefix.as_str()))
            {
                return Err(RoutePrefixConflict(format!("{prefix} (held by {other})")));
            }
        }
        self.routes.insert(name, route_prefix);
        Ok(())
    }

    pub fn get_route(&self, name: &DeploymentName) -> Option<String> {
        self.routes.get(name).cloned().flatten()
    }

    pub fn delete_endpoint(&mut self, name: &DeploymentName) {
        self.routes.remove(name);
    }

    pub fn shutdown(&mut self) {
        self.routes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicting_route_prefix_is_rejected() {
        let mut state = EndpointState::new();
        state
            .update_endpoint(DeploymentName("a".into()), Some("/foo".into()))
            .unwrap();
        let result = state.update_endpoint(DeploymentName("b".into()), Some("/foo".into()));
        assert!(result.is_err());
    }

    #[test]
    fn same_deployment_can_keep_its_own_prefix() {
        let mut state = EndpointState::new();
        state
            .update_endpoint(DeploymentName("a".into()), Some("/foo".into()))
            .unwrap();
        assert!(state
            .update_endpoint(DeploymentName("a".into()), Some("/foo".into()))
            .is_ok());
    }

    #[test]
    fn delete_frees_the_prefix_for_reuse() {
        let mut state = EndpointState::new();
        state
            .update_endpoint(DeploymentName("a".into()), Some("/foo".into()))
            .unwrap();
        state.delete_endpoint(&DeploymentName("a".into()));
        assert!(state
            .update_endpoint(DeploymentName("b".into()), Some("/foo".into()))
            .is_ok());
    }
}
