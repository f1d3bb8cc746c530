use serde::{Deserialize, Serialize};

use crate::state::Rgb;

/// Conversion settle time mandated by the DS18B20 datasheet at 12-bit
/// resolution. Readings taken earlier than this come back garbage.
pub const SENSOR_SETTLE_MS: u64 = 750;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KettleConfig {
    pub target_temp_c: f32,
    pub sample_settle_ms: u64,
    pub idle_color: Rgb,
}

impl Default for KettleConfig {
    fn default() -> Self {
        Self {
            target_temp_c: 60.0,
            sample_settle_ms: SENSOR_SETTLE_MS,
            idle_color: Rgb::new(0, 0, 32),
        }
    }
}

impl KettleConfig {
    pub fn sanitize(&mut self) {
        self.target_temp_c = self.target_temp_c.clamp(0.0, 100.0);
        if self.sample_settle_ms < SENSOR_SETTLE_MS {
            self.sample_settle_ms = SENSOR_SETTLE_MS;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub listen_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            listen_port: 2137,
        }
    }
}

/// Everything the firmware reads at boot. Loaded once from a JSON file;
/// runtime changes are not written back (settings persistence is out of
/// scope for this protocol version).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub kettle: KettleConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn sanitize_clamps_target_and_settle_delay() {
        let mut config = KettleConfig {
            target_temp_c: 140.0,
            sample_settle_ms: 10,
            idle_color: Rgb::new(0, 0, 0),
        };
        config.sanitize();

        assert_eq!(config.target_temp_c, 100.0);
        assert_eq!(config.sample_settle_ms, SENSOR_SETTLE_MS);
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let config: RuntimeConfig = serde_json::from_str("{}").unwrap();

        assert_eq!(config.network.listen_port, 2137);
        assert_eq!(config.kettle.target_temp_c, 60.0);
    }
}
