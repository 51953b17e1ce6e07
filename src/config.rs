//! Controller configuration: device identity, data-point mapping and timing.
//!
//! Everything is plain serde so a host application can keep it in its own
//! JSON configuration. Durations are written in milliseconds.

use crate::error::{Result, TuyaError};
use crate::protocol::Version;
use crate::state::{StateMapping, StatusKind};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 6668;

/// Logical command names understood by [`crate::VacuumController`].
pub mod commands {
    pub const START: &str = "start";
    pub const START_MOP: &str = "start_mop";
    pub const PAUSE: &str = "pause";
    pub const STOP: &str = "stop";
    pub const RETURN_TO_BASE: &str = "return_to_base";
    pub const LOCATE: &str = "locate";
    pub const CLEAN_SPOT: &str = "clean_spot";
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

/// Connection parameters of one device. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub device_id: String,
    /// 16-byte local key, as text.
    pub local_key: String,
    pub protocol_version: Version,
}

impl DeviceConfig {
    pub fn new<H, I, K, V>(host: H, device_id: I, local_key: K, version: V) -> Result<Self>
    where
        H: Into<String>,
        I: Into<String>,
        K: Into<String>,
        V: TryInto<Version>,
        TuyaError: From<V::Error>,
    {
        let config = Self {
            host: host.into(),
            port: DEFAULT_PORT,
            device_id: device_id.into(),
            local_key: local_key.into(),
            protocol_version: version.try_into()?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Some firmwares listen on 6667 instead of the default 6668.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn local_key_bytes(&self) -> &[u8] {
        self.local_key.as_bytes()
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(TuyaError::InvalidConfig("host is empty".into()));
        }
        if self.device_id.trim().is_empty() {
            return Err(TuyaError::InvalidConfig("device_id is empty".into()));
        }
        if self.local_key.len() != 16 {
            return Err(TuyaError::InvalidConfig(format!(
                "local_key must be 16 bytes, got {}",
                self.local_key.len()
            )));
        }
        Ok(())
    }
}

impl TryFrom<&str> for Version {
    type Error = TuyaError;

    fn try_from(s: &str) -> Result<Self> {
        s.parse()
    }
}

impl TryFrom<f64> for Version {
    type Error = TuyaError;

    fn try_from(v: f64) -> Result<Self> {
        format!("{:.1}", v).parse()
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Number(f64),
        }

        let parsed = match Repr::deserialize(deserializer)? {
            Repr::Text(s) => Version::try_from(s.as_str()),
            Repr::Number(n) => Version::try_from(n),
        };
        parsed.map_err(serde::de::Error::custom)
    }
}

/// One logical command: write `value` to data point `dp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DpCommand {
    pub dp: String,
    pub value: Value,
}

impl DpCommand {
    pub fn new<I: Into<String>, V: Into<Value>>(dp: I, value: V) -> Self {
        Self {
            dp: dp.into(),
            value: value.into(),
        }
    }

    /// CONTROL `dps` object for this command.
    pub fn to_dps(&self) -> Value {
        let mut dps = serde_json::Map::new();
        dps.insert(self.dp.clone(), self.value.clone());
        Value::Object(dps)
    }
}

/// A data point with a fixed set of named choices (fan speed, direction).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoiceMapping {
    pub dp: String,
    pub values: BTreeMap<String, Value>,
}

impl ChoiceMapping {
    pub fn command(&self, choice: &str) -> Option<DpCommand> {
        self.values
            .get(choice)
            .map(|v| DpCommand::new(self.dp.clone(), v.clone()))
    }

    pub fn choices(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }
}

/// Logical names ↔ data points for one vacuum model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DpMapping {
    #[serde(default)]
    pub commands: BTreeMap<String, DpCommand>,
    #[serde(default)]
    pub fan_speed: Option<ChoiceMapping>,
    #[serde(default)]
    pub directions: Option<ChoiceMapping>,
    /// The model toggles pause by re-sending the running mode.
    #[serde(default)]
    pub pause_resends_mode: bool,
    #[serde(default)]
    pub state: StateMapping,
}

impl DpMapping {
    pub fn command(&self, name: &str) -> Option<&DpCommand> {
        self.commands.get(name)
    }

    /// Commands that write the same data point as `start` select a cleaning mode.
    pub fn is_mode_command(&self, name: &str) -> bool {
        match (self.commands.get(commands::START), self.commands.get(name)) {
            (Some(start), Some(cmd)) => start.dp == cmd.dp,
            _ => false,
        }
    }

    /// Tables for the Prosenic robot vacuums.
    pub fn prosenic() -> Self {
        let commands = BTreeMap::from([
            (commands::START.to_string(), DpCommand::new("25", "smart")),
            (commands::START_MOP.to_string(), DpCommand::new("25", "mop")),
            (commands::CLEAN_SPOT.to_string(), DpCommand::new("25", "sprial")),
            (
                commands::RETURN_TO_BASE.to_string(),
                DpCommand::new("25", "chargego"),
            ),
            (commands::STOP.to_string(), DpCommand::new("26", "stop")),
        ]);

        let fan_speed = ChoiceMapping {
            dp: "27".into(),
            values: ["ECO", "normal", "strong"]
                .into_iter()
                .map(|v| (v.to_string(), Value::from(v)))
                .collect(),
        };

        let directions = ChoiceMapping {
            dp: "26".into(),
            values: BTreeMap::from([
                ("forward".to_string(), Value::from("forward")),
                ("backward".to_string(), Value::from("backward")),
                ("turn_left".to_string(), Value::from("turnleft")),
                ("turn_right".to_string(), Value::from("turnright")),
                ("stop".to_string(), Value::from("stop")),
            ]),
        };

        let status_values = BTreeMap::from([
            ("0".to_string(), StatusKind::Idle),
            ("1".to_string(), StatusKind::Cleaning),
            ("2".to_string(), StatusKind::Cleaning),
            ("3".to_string(), StatusKind::Cleaning),
            ("4".to_string(), StatusKind::Returning),
            ("5".to_string(), StatusKind::Docked),
            ("7".to_string(), StatusKind::Paused),
            ("8".to_string(), StatusKind::Cleaning),
        ]);

        let fault_bits = [
            "side_brush",
            "roller_brush",
            "left_wheel",
            "right_wheel",
            "dust_bin",
            "off_ground",
            "collision_sensor",
            "water_tank",
            "virtual_wall",
            "trapped",
            "unknown",
        ]
        .into_iter()
        .enumerate()
        .map(|(i, name)| (1u32 << i, name.to_string()))
        .collect();

        Self {
            commands,
            fan_speed: Some(fan_speed),
            directions: Some(directions),
            pause_resends_mode: true,
            state: StateMapping {
                status_dp: Some("38".into()),
                status_values,
                fault_dp: Some("11".into()),
                fault_bits,
                battery_dp: Some("39".into()),
                fan_speed_dp: Some("27".into()),
                cleaning_area_dp: Some("41".into()),
                cleaning_time_dp: Some("42".into()),
                mop_equipped_dp: Some("49".into()),
            },
        }
    }
}

/// Serde helper storing a `Duration` as integer milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Timeouts, polling cadence and retry limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    #[serde(rename = "request_timeout_ms", with = "duration_ms")]
    pub request_timeout: Duration,
    #[serde(rename = "connect_timeout_ms", with = "duration_ms")]
    pub connect_timeout: Duration,
    #[serde(rename = "reconnect_min_ms", with = "duration_ms")]
    pub reconnect_min: Duration,
    #[serde(rename = "reconnect_max_ms", with = "duration_ms")]
    pub reconnect_max: Duration,
    #[serde(rename = "heartbeat_interval_ms", with = "duration_ms")]
    pub heartbeat_interval: Duration,
    #[serde(rename = "status_interval_ms", with = "duration_ms")]
    pub status_interval: Duration,
    #[serde(rename = "max_poll_interval_ms", with = "duration_ms")]
    pub max_poll_interval: Duration,
    #[serde(rename = "remember_fan_speed_delay_ms", with = "duration_ms")]
    pub remember_fan_speed_delay: Duration,
    /// Consecutive request timeouts that recycle the session.
    pub max_consecutive_timeouts: u32,
    /// Consecutive poll failures before the device is reported unavailable.
    pub poll_failure_threshold: u32,
    /// Consecutive undecryptable frames before the key is declared wrong.
    pub crypto_failure_limit: u32,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            reconnect_min: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            status_interval: Duration::from_secs(30),
            max_poll_interval: Duration::from_secs(120),
            remember_fan_speed_delay: Duration::from_secs(6),
            max_consecutive_timeouts: 3,
            poll_failure_threshold: 3,
            crypto_failure_limit: 3,
        }
    }
}

impl Timing {
    pub fn validate(&self) -> Result<()> {
        let non_zero = [
            ("request_timeout_ms", self.request_timeout),
            ("connect_timeout_ms", self.connect_timeout),
            ("heartbeat_interval_ms", self.heartbeat_interval),
            ("status_interval_ms", self.status_interval),
        ];
        for (name, d) in non_zero {
            if d.is_zero() {
                return Err(TuyaError::InvalidConfig(format!("{} must be > 0", name)));
            }
        }
        if self.reconnect_max < self.reconnect_min {
            return Err(TuyaError::InvalidConfig(
                "reconnect_max_ms is below reconnect_min_ms".into(),
            ));
        }
        if self.max_consecutive_timeouts == 0
            || self.poll_failure_threshold == 0
            || self.crypto_failure_limit == 0
        {
            return Err(TuyaError::InvalidConfig("limits must be at least 1".into()));
        }
        Ok(())
    }
}

/// Everything needed to build a [`crate::VacuumController`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VacuumConfig {
    #[serde(flatten)]
    pub device: DeviceConfig,
    pub dp_mapping: DpMapping,
    /// Re-apply the chosen fan speed after mode changes (the device resets it).
    #[serde(default)]
    pub remember_fan_speed: bool,
    #[serde(default)]
    pub timing: Timing,
}

impl VacuumConfig {
    pub fn new(device: DeviceConfig, dp_mapping: DpMapping) -> Self {
        Self {
            device,
            dp_mapping,
            remember_fan_speed: false,
            timing: Timing::default(),
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<()> {
        self.device.validate()?;
        self.timing.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_full_config() {
        let text = json!({
            "host": "192.168.1.50",
            "device_id": "bf0123456789abcdef",
            "local_key": "0123456789abcdef",
            "protocol_version": "3.3",
            "dp_mapping": {
                "commands": {
                    "start": {"dp": "2", "value": true},
                    "return_to_base": {"dp": "3", "value": "chargego"}
                },
                "fan_speed": {"dp": "9", "values": {"quiet": "gentle", "max": "strong"}},
                "state": {
                    "status_dp": "15",
                    "status_values": {"docked": "docked", "smart": "cleaning"},
                    "fault_dp": "18",
                    "fault_bits": {"1": "edge_brush"},
                    "battery_dp": "17"
                }
            },
            "timing": {"request_timeout_ms": 2500}
        })
        .to_string();

        let config = VacuumConfig::from_json(&text).unwrap();
        assert_eq!(config.device.port, DEFAULT_PORT);
        assert_eq!(config.device.protocol_version, Version::V3_3);
        assert_eq!(config.timing.request_timeout, Duration::from_millis(2500));
        assert_eq!(config.timing.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.dp_mapping.state.fault_bits[&1], "edge_brush");
        assert_eq!(
            config.dp_mapping.command("start").unwrap().to_dps(),
            json!({"2": true})
        );
        assert!(!config.remember_fan_speed);
    }

    #[test]
    fn test_numeric_version_and_port() {
        let config: DeviceConfig = serde_json::from_value(json!({
            "host": "10.0.0.2",
            "port": 6667,
            "device_id": "abc",
            "local_key": "0123456789abcdef",
            "protocol_version": 3.1
        }))
        .unwrap();
        assert_eq!(config.protocol_version, Version::V3_1);
        assert_eq!(config.port, 6667);
    }

    #[test]
    fn test_invalid_configs() {
        assert!(matches!(
            DeviceConfig::new("10.0.0.2", "abc", "short", "3.3"),
            Err(TuyaError::InvalidConfig(_))
        ));
        assert!(DeviceConfig::new("10.0.0.2", "abc", "0123456789abcdef", "3.5").is_err());
        assert!(DeviceConfig::new("", "abc", "0123456789abcdef", "3.3").is_err());

        let timing = Timing {
            reconnect_min: Duration::from_secs(60),
            ..Timing::default()
        };
        assert!(timing.validate().is_err());
    }

    #[test]
    fn test_prosenic_preset() {
        let mapping = DpMapping::prosenic();
        assert!(mapping.is_mode_command(commands::RETURN_TO_BASE));
        assert!(!mapping.is_mode_command(commands::STOP));
        assert!(mapping.command(commands::LOCATE).is_none());
        assert_eq!(mapping.state.fault_bits[&512], "trapped");
        assert_eq!(mapping.state.fault_bits.len(), 11);
        assert_eq!(
            mapping.fan_speed.unwrap().choices(),
            vec!["ECO", "normal", "strong"]
        );
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let device = DeviceConfig::new("10.0.0.2", "abc", "0123456789abcdef", "3.3").unwrap();
        let config = VacuumConfig::new(device, DpMapping::prosenic());
        let text = serde_json::to_string(&config).unwrap();
        assert_eq!(VacuumConfig::from_json(&text).unwrap(), config);
    }
}
