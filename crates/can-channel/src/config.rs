use crate::{CanId, ChannelError, Result, CAN_SOCK_RAW};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Settings a [`CanChannel`](crate::CanChannel) is opened with.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Network interface, e.g. `can0` or `vcan0`.
    pub interface: String,
    #[serde(default = "default_protocol")]
    pub protocol: i32,
    /// Acceptance mask; 0 matches every frame.
    #[serde(default)]
    pub filter_mask: u32,
    /// Identifier used as the filter id when none is given.
    #[serde(default)]
    pub default_sender_id: u32,
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
}

fn default_protocol() -> i32 {
    CAN_SOCK_RAW
}
fn default_wait_timeout_ms() -> u64 {
    3000
}
fn default_batch_delay_ms() -> u64 {
    20
}

impl ChannelConfig {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            protocol: default_protocol(),
            filter_mask: 0,
            default_sender_id: 0,
            wait_timeout_ms: default_wait_timeout_ms(),
            batch_delay_ms: default_batch_delay_ms(),
        }
    }

    pub fn with_protocol(mut self, protocol: i32) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_filter_mask(mut self, mask: u32) -> Self {
        self.filter_mask = mask;
        self
    }

    pub fn with_default_sender_id(mut self, id: u32) -> Self {
        self.default_sender_id = id;
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    /// The configured sender id as a [`CanId`]; ids above 29 bits are rejected.
    pub fn default_sender(&self) -> Result<CanId> {
        CanId::try_from(self.default_sender_id).map_err(|raw| ChannelError::Init {
            message: format!("default sender id {raw:#x} exceeds 29 bits"),
            os_code: None,
        })
    }
}

/// Load a [`ChannelConfig`] from YAML (`.yml`/`.yaml`) or JSON (anything else).
pub fn load_config_file(path: impl AsRef<Path>) -> anyhow::Result<ChannelConfig> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading channel config: {}", path.display()))?;
    let is_yaml = path
        .extension()
        .map(|ext| ext == "yml" || ext == "yaml")
        .unwrap_or(false);
    let cfg: ChannelConfig = if is_yaml {
        serde_yaml::from_str(&raw).with_context(|| format!("parsing yaml: {}", path.display()))?
    } else {
        serde_json::from_str(&raw).with_context(|| format!("parsing json: {}", path.display()))?
    };
    cfg.default_sender()
        .with_context(|| format!("validating channel config: {}", path.display()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_fills_defaults() {
        let cfg: ChannelConfig = serde_yaml::from_str("interface: vcan0\nfilter_mask: 0x7FF\n")
            .unwrap();
        assert_eq!(cfg.interface, "vcan0");
        assert_eq!(cfg.protocol, CAN_SOCK_RAW);
        assert_eq!(cfg.filter_mask, 0x7FF);
        assert_eq!(cfg.wait_timeout(), Duration::from_millis(3000));
        assert_eq!(cfg.batch_delay(), Duration::from_millis(20));
    }

    #[test]
    fn json_round_trips_builder_values() {
        let cfg = ChannelConfig::new("can1")
            .with_default_sender_id(0x123)
            .with_wait_timeout(Duration::from_millis(50));
        let text = serde_json::to_string(&cfg).unwrap();
        let back: ChannelConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back, cfg);
        assert_eq!(back.default_sender().unwrap(), CanId::standard(0x123).unwrap());
    }

    #[test]
    fn oversized_sender_id_is_rejected() {
        let cfg = ChannelConfig::new("can0").with_default_sender_id(0xFFFF_FFFF);
        assert!(matches!(cfg.default_sender(), Err(ChannelError::Init { .. })));
    }

    #[test]
    fn loads_yaml_file_by_extension() {
        let dir = std::env::temp_dir().join(format!("can-channel-cfg-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("channel.yaml");
        fs::write(&path, "interface: can0\ndefault_sender_id: 0x18DAF110\n").unwrap();
        let cfg = load_config_file(&path).unwrap();
        assert!(cfg.default_sender().unwrap().is_extended());
        fs::remove_dir_all(&dir).ok();
    }
}
