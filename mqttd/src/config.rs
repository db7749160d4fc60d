//! Broker configuration.
//!
//! Every field has a default, so a YAML file only needs the keys it changes:
//!
//! ```yaml
//! listen: 0.0.0.0:1883
//! keepalive: 30
//! offline_queue_size: 4096
//! work_group_id: 1
//! work_id: 7
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::MAX_PACKET_SIZE;
use crate::session::DEFAULT_OFFLINE_QUEUE_SIZE;
use crate::snowflake::MAX_WORKER_ID;

/// Default listen address.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:1883";
/// Default keepalive, in seconds.
pub const DEFAULT_KEEPALIVE: u16 = 60;
/// Default socket read buffer size.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;
/// Default outbound queue capacity per connection.
pub const DEFAULT_QUEUE_SIZE: usize = 128;

/// Broker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Listen address (host:port).
    pub listen: String,
    /// Idle seconds before the broker probes a client with PINGREQ. Also the
    /// read deadline base for clients that connect with keep-alive 0.
    /// Zero disables both.
    pub keepalive: u16,
    /// Initial read buffer capacity per connection.
    pub buffer_size: usize,
    /// Outbound queue capacity per connection; producers wait when full.
    pub queue_size: usize,
    /// Largest accepted remaining length.
    pub max_packet_size: usize,
    /// Offline queue capacity per session.
    pub offline_queue_size: usize,
    /// Work group identifier for connection IDs (0..=31).
    pub work_group_id: u8,
    /// Worker identifier for connection IDs (0..=31).
    pub work_id: u8,
    /// Answer UNSUBSCRIBE with a SUBACK-shaped packet carrying no return
    /// codes instead of a standard UNSUBACK.
    pub unsuback_as_suback: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            keepalive: DEFAULT_KEEPALIVE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            queue_size: DEFAULT_QUEUE_SIZE,
            max_packet_size: MAX_PACKET_SIZE,
            offline_queue_size: DEFAULT_OFFLINE_QUEUE_SIZE,
            work_group_id: 0,
            work_id: 0,
            unsuback_as_suback: true,
        }
    }
}

impl BrokerConfig {
    /// Create a new broker config.
    pub fn new(listen: impl Into<String>) -> Self {
        Self {
            listen: listen.into(),
            ..Default::default()
        }
    }

    /// Load a YAML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
            .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))
    }

    /// Parse and validate YAML config text.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(text).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the broker cannot run with.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("buffer_size", self.buffer_size),
            ("queue_size", self.queue_size),
            ("max_packet_size", self.max_packet_size),
            ("offline_queue_size", self.offline_queue_size),
        ] {
            if value == 0 {
                return Err(Error::InvalidConfig(format!("{name} must be positive")));
            }
        }
        if self.work_group_id > MAX_WORKER_ID || self.work_id > MAX_WORKER_ID {
            return Err(Error::InvalidConfig(format!(
                "work_group_id and work_id must be in 0..={MAX_WORKER_ID}"
            )));
        }
        Ok(())
    }

    /// Set the keepalive in seconds.
    pub fn keepalive(mut self, secs: u16) -> Self {
        self.keepalive = secs;
        self
    }

    /// Set the outbound queue capacity.
    pub fn queue_size(mut self, size: usize) -> Self {
        self.queue_size = size;
        self
    }

    /// Set the maximum packet size.
    pub fn max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Set the offline queue capacity.
    pub fn offline_queue_size(mut self, size: usize) -> Self {
        self.offline_queue_size = size;
        self
    }

    /// Set the connection ID generator seed.
    pub fn worker(mut self, work_group_id: u8, work_id: u8) -> Self {
        self.work_group_id = work_group_id;
        self.work_id = work_id;
        self
    }

    /// Choose the UNSUBSCRIBE reply shape.
    pub fn unsuback_as_suback(mut self, enabled: bool) -> Self {
        self.unsuback_as_suback = enabled;
        self
    }

    /// Configured keepalive as a duration, `None` when disabled.
    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive > 0).then(|| Duration::from_secs(u64::from(self.keepalive)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = BrokerConfig::from_yaml("listen: 127.0.0.1:1884\nwork_id: 7\n").unwrap();
        assert_eq!(config.listen, "127.0.0.1:1884");
        assert_eq!(config.work_id, 7);
        assert_eq!(config.keepalive, DEFAULT_KEEPALIVE);
        assert_eq!(config.offline_queue_size, DEFAULT_OFFLINE_QUEUE_SIZE);
        assert!(config.unsuback_as_suback);
    }

    #[test]
    fn test_validation() {
        assert!(BrokerConfig::from_yaml("queue_size: 0\n").is_err());
        assert!(BrokerConfig::from_yaml("work_group_id: 32\n").is_err());
        assert!(BrokerConfig::from_yaml("unknown: [\n").is_err());
        assert!(BrokerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_keepalive_interval() {
        assert_eq!(BrokerConfig::default().keepalive(0).keepalive_interval(), None);
        assert_eq!(
            BrokerConfig::default().keepalive(5).keepalive_interval(),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("mqttd-config-{}.yaml", std::process::id()));
        std::fs::write(&path, "keepalive: 15\n").unwrap();
        let config = BrokerConfig::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.keepalive, 15);

        assert!(matches!(BrokerConfig::load("/nonexistent/mqttd.yaml"), Err(Error::Io(_))));
    }
}
