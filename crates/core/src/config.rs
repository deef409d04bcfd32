//! Engine configuration. Every field has a default, so an empty config file
//! (or none at all) is valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bus::BusConfig;
use crate::comm::ReconnectPolicy;
use crate::decoder::DecoderConfig;
use crate::device::DeviceModel;
use crate::macros::RecordingConfig;
use crate::output::OutputConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub model: DeviceModel,
    pub decoder: DecoderConfig,
    pub reconnect: ReconnectPolicy,
    pub output: OutputConfig,
    pub bus: BusConfig,
    pub recording: RecordingConfig,
    /// Upper bound on one blocking read; also how quickly the dispatch
    /// loop notices a stop request.
    pub read_timeout_ms: u64,
    /// How long to wait for the first report after (re)connecting before
    /// assuming an idle device.
    pub resync_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: DeviceModel::default(),
            decoder: DecoderConfig::default(),
            reconnect: ReconnectPolicy::default(),
            output: OutputConfig::default(),
            bus: BusConfig::default(),
            recording: RecordingConfig::default(),
            read_timeout_ms: 50,
            resync_timeout_ms: 1000,
        }
    }
}

impl EngineConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }

    pub fn resync_timeout(&self) -> Duration {
        Duration::from_millis(self.resync_timeout_ms)
    }

    pub fn recording_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.recording.idle_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{"decoder":{"dead_zone":0.2},"read_timeout_ms":10}"#).unwrap();
        assert_eq!(cfg.decoder.dead_zone, 0.2);
        assert_eq!(cfg.decoder.axis_threshold, 0.05);
        assert_eq!(cfg.read_timeout_ms, 10);
        assert_eq!(cfg.reconnect, ReconnectPolicy::default());
        assert_eq!(cfg.output.lcd_min_interval_ms, 50);
    }

    #[test]
    fn zero_read_timeout_is_clamped() {
        let cfg = EngineConfig {
            read_timeout_ms: 0,
            ..EngineConfig::default()
        };
        assert_eq!(cfg.read_timeout(), Duration::from_millis(1));
    }
}
