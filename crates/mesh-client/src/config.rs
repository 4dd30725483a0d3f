use std::{fmt, sync::Arc, time::Duration};

use signal_proto::{AppMessage, PeerId};

pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:3000/ws";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_LABEL_PREFIX: &str = "CH";

/// Decides whether an inbound message may need a routed reply.
pub type RequestClassifier = Arc<dyn Fn(&AppMessage) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct MeshConfig {
    /// Relay websocket endpoint.
    pub signaling_url: String,
    /// STUN/TURN urls handed to the direct transport. Empty disables them.
    pub ice_servers: Vec<String>,
    /// Data channel labels are `<prefix>_<local>_<remote>`.
    pub label_prefix: String,
    /// Applied by [`crate::MeshNode::request_all`]. `None` waits forever.
    pub request_timeout: Option<Duration>,
    pub request_classifier: RequestClassifier,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            label_prefix: DEFAULT_LABEL_PREFIX.to_string(),
            request_timeout: None,
            request_classifier: Arc::new(is_request_kind),
        }
    }
}

impl fmt::Debug for MeshConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeshConfig")
            .field("signaling_url", &self.signaling_url)
            .field("ice_servers", &self.ice_servers)
            .field("label_prefix", &self.label_prefix)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl MeshConfig {
    /// Read `MESH_SIGNALING_URL`, `MESH_ICE_SERVERS`, `MESH_DISABLE_STUN`
    /// and `MESH_REQUEST_TIMEOUT_MS`, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(url) = lookup("MESH_SIGNALING_URL").filter(|url| !url.trim().is_empty()) {
            config.signaling_url = url.trim().to_string();
        }
        if let Some(servers) = lookup("MESH_ICE_SERVERS") {
            config.ice_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect();
        }
        if lookup("MESH_DISABLE_STUN").is_some_and(|value| truthy(&value)) {
            config.ice_servers.clear();
        }
        if let Some(ms) = lookup("MESH_REQUEST_TIMEOUT_MS").and_then(|ms| ms.trim().parse().ok()) {
            config.request_timeout = Some(Duration::from_millis(ms));
        }
        config
    }

    pub fn with_signaling_url(mut self, url: impl Into<String>) -> Self {
        self.signaling_url = url.into();
        self
    }

    pub fn with_ice_servers(mut self, servers: Vec<String>) -> Self {
        self.ice_servers = servers;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_request_classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&AppMessage) -> bool + Send + Sync + 'static,
    {
        self.request_classifier = Arc::new(classifier);
        self
    }

    pub fn channel_label(&self, local: PeerId, remote: PeerId) -> String {
        format!("{}_{}_{}", self.label_prefix, local, remote)
    }
}

/// Default classifier: the message type ends in `REQUEST`.
pub fn is_request_kind(message: &AppMessage) -> bool {
    message.kind.to_ascii_uppercase().ends_with("REQUEST")
}

fn truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
