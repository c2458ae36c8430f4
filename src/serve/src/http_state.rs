//! HTTP proxy state (§4.10 `get_http_config`/`get_root_url`/
//! `get_http_proxies`). The cloud-facing proxy process lifecycle is out of
//! scope for this core — this tracks registrations made by an external
//! launcher, mirroring the read side of `HTTPState` referenced from
//! `original_source/python/ray/serve/controller.py`'s `get_http_config`/
//! `get_root_url`/`get_http_proxies`.

use std::collections::BTreeMap;

use fleetctl_types::NodeId;
use serde::{Deserialize, Serialize};

const SERVE_ROOT_URL_ENV_KEY: &str = "SERVE_ROOT_URL";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpOptions {
    pub host: String,
    pub port: u16,
    pub root_url: String,
}

impl Default for HttpOptions {
    fn default() -> Self {
        HttpOptions {
            host: "0.0.0.0".into(),
            port: 8000,
            root_url: String::new(),
        }
    }
}

#[derive(Default)]
pub struct HttpState {
    config: HttpOptions,
    proxies: BTreeMap<NodeId, String>,
}

impl HttpState {
    pub fn new(config: HttpOptions) -> Self {
        HttpState {
            config,
            proxies: BTreeMap::new(),
        }
    }

    /// No proxy lifecycle is driven from this core; `update()` exists to
    /// mirror the reconciliation step's shape (§4.9 step 2) so a future
    /// proxy-launcher integration has a natural seam.
    pub fn update(&mut self) {}

    pub fn register_proxy(&mut self, node_id: NodeId, address: String) {
        self.proxies.insert(node_id, address);
    }

    pub fn deregister_proxy(&mut self, node_id: &NodeId) {
        self.proxies.remove(node_id);
    }

    pub fn config(&self) -> HttpOptions {
        self.config.clone()
    }

    pub fn proxies(&self) -> BTreeMap<NodeId, String> {
        self.proxies.clone()
    }

    pub fn root_url(&self) -> String {
        if !self.config.root_url.is_empty() {
            return self.config.root_url.clone();
        }
        if let Ok(url) = std::env::var(SERVE_ROOT_URL_ENV_KEY) {
            return url;
        }
        format!("http://{}:{}", self.config.host, self.config.port)
    }

    pub fn shutdown(&mut self) {
        self.proxies.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_url_falls_back_to_host_port_when_unset() {
        std::env::remove_var(SERVE_ROOT_URL_ENV_KEY);
        let state = HttpState::new(HttpOptions {
            host: "1.2.3.4".into(),
            port: 9000,
            root_url: String::new(),
        });
        assert_eq!(state.root_url(), "http://1.2.3.4:9000");
    }

    #[test]
    fn root_url_prefers_configured_value() {
        let state = HttpState::new(HttpOptions {
            host: "1.2.3.4".into(),
            port: 9000,
            root_url: "https://my-cluster.example".into(),
        });
        assert_eq!(state.root_url(), "https://my-cluster.example");
    }

    #[test]
    fn proxy_registration_round_trips() {
        let mut state = HttpState::new(HttpOptions::default());
        let id = NodeId(vec![1, 2, 3]);
        state.register_proxy(id.clone(), "10.0.0.1:8000".into());
        assert_eq!(state.proxies().len(), 1);
        state.deregister_proxy(&id);
        assert!(state.proxies().is_empty());
    }
}
