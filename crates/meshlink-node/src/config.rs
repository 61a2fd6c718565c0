//! Node configuration.

use serde::Deserialize;
use serde_json::Value;

fn default_host() -> String {
    "localhost".to_string()
}

fn default_state() -> Value {
    Value::Object(Default::default())
}

fn default_event_capacity() -> usize {
    256
}

/// Construction parameters for a [`Server`](crate::Server).
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Interface to listen on; also the host advertised to peers.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on. `0` picks an ephemeral port.
    pub port: u16,
    /// Initial local state.
    #[serde(default = "default_state")]
    pub state: Value,
    /// Buffered events per subscriber before slow receivers start lagging.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl ServerConfig {
    pub fn new(port: u16) -> Self {
        Self {
            host: default_host(),
            port,
            state: default_state(),
            event_capacity: default_event_capacity(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_state(mut self, state: Value) -> Self {
        self.state = state;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::new(22222);
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 22222);
        assert_eq!(config.state, serde_json::json!({}));
        assert_eq!(config.event_capacity, 256);
    }

    #[test]
    fn parse_toml() {
        let config: ServerConfig = toml::from_str(
            r#"
            port = 4000

            [state]
            name = "alpha"
            "#,
        )
        .unwrap();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 4000);
        assert_eq!(config.state, serde_json::json!({ "name": "alpha" }));
    }

    #[test]
    fn builder() {
        let config = ServerConfig::new(0)
            .with_host("127.0.0.1")
            .with_state(serde_json::json!({ "a": 1 }));
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.state, serde_json::json!({ "a": 1 }));
    }
}
