use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ServerError;
use crate::memory::arena::arena_len;

/// Engine configuration, fixed once the server is started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Pending-connection queue length passed to `listen`.
    pub backlog: i32,
    /// Number of pooled receive contexts. Also the number of buffer segments
    /// carved from the arena, so it caps the number of live connections.
    pub context_count: usize,
    /// Size in bytes of each buffer segment.
    pub buffer_size: usize,
    /// Pause between two drains of the event queue.
    #[serde(rename = "drain_interval_ms", with = "millis")]
    pub drain_interval: Duration,
    /// Disable Nagle on the listener and accepted connections.
    pub nodelay: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            backlog: 100,
            context_count: 1000,
            buffer_size: 1024,
            drain_interval: Duration::from_millis(1),
            nodelay: true,
        }
    }
}

impl ServerConfig {
    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_context_count(mut self, context_count: usize) -> Self {
        self.context_count = context_count;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_drain_interval(mut self, drain_interval: Duration) -> Self {
        self.drain_interval = drain_interval;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Parse a configuration from JSON. Missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, ServerError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ServerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if self.backlog <= 0 {
            return Err(ServerError::Config("backlog must be positive".into()));
        }
        if self.context_count == 0 {
            return Err(ServerError::Config("context_count must be positive".into()));
        }
        if self.buffer_size == 0 {
            return Err(ServerError::Config("buffer_size must be positive".into()));
        }
        if arena_len(self.context_count, self.buffer_size).is_none() {
            return Err(ServerError::Config(format!(
                "context_count x buffer_size ({} x {}) is too large",
                self.context_count, self.buffer_size
            )));
        }
        if self.drain_interval.is_zero() {
            return Err(ServerError::Config("drain_interval must be non-zero".into()));
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_constants() {
        let config = ServerConfig::default();
        assert_eq!(config.backlog, 100);
        assert_eq!(config.context_count, 1000);
        assert_eq!(config.buffer_size, 1024);
        assert_eq!(config.drain_interval, Duration::from_millis(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn json_overrides_only_given_fields() {
        let config = ServerConfig::from_json(r#"{"context_count": 8, "drain_interval_ms": 5}"#)
            .unwrap();
        assert_eq!(config.context_count, 8);
        assert_eq!(config.drain_interval, Duration::from_millis(5));
        assert_eq!(config.buffer_size, 1024);
    }

    #[test]
    fn rejects_zero_sizes() {
        let err = ServerConfig::default().with_buffer_size(0).validate();
        assert!(matches!(err, Err(ServerError::Config(_))));

        let err = ServerConfig::from_json(r#"{"drain_interval_ms": 0}"#);
        assert!(matches!(err, Err(ServerError::Config(_))));

        let err = ServerConfig::default()
            .with_context_count(usize::MAX / 2)
            .with_buffer_size(4)
            .validate();
        assert!(matches!(err, Err(ServerError::Config(_))));

        let err = ServerConfig::from_json("not json");
        assert!(matches!(err, Err(ServerError::Config(_))));
    }

    #[test]
    fn round_trips_through_json() {
        let config = ServerConfig::default()
            .with_backlog(16)
            .with_nodelay(false);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"drain_interval_ms\":1"));
        assert_eq!(ServerConfig::from_json(&json).unwrap(), config);
    }
}
