use crate::actuation::Mode;
use crate::auto::LuxCurve;
use crate::consts::*;
use crate::errors::*;
use crate::schedule::{ScheduleRule, default_rules};
use crate::solar::Location;
use crate::util::*;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde::Deserializer;
use smart_default::SmartDefault;

make_log_macro!(debug, "config");

/// Calibration of a single endpoint, either `[global]` or `[devices.<name>]`.
#[derive(Deserialize, Clone, Debug, PartialEq, SmartDefault)]
#[serde(default)]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    #[default(1.0)]
    #[serde(deserialize_with = "deserialize_root_scaling")]
    pub root_scaling: f64,

    #[default(1.0)]
    #[serde(deserialize_with = "deserialize_sleep_multiplier")]
    pub ddcci_sleep_multiplier: f64,

    /// Calibration values are given as 0-100 in the config, but mapped to 0-1
    #[default([0.0, 1.0])]
    #[serde(deserialize_with = "deserialize_calibration")]
    pub calibration: [f64; 2],
}

impl EndpointConfig {
    /// Map a raw device ratio onto the 0-100 scale the rest of the crate uses.
    pub fn ratio_to_percent(&self, ratio: f64) -> Result<u32> {
        let [low, high] = self.calibration;
        let scaled = ratio.clamp(0.0, 1.0).powf(self.root_scaling.recip());
        let relative = scale_to_clamped_absolute(scaled, low, high)?;
        Ok(clamp_percent(relative * 100.0))
    }

    /// Inverse of [`ratio_to_percent`](Self::ratio_to_percent).
    pub fn percent_to_ratio(&self, percent: u32) -> Result<f64> {
        let [low, high] = self.calibration;
        let relative = f64::from(percent.min(100)) / 100.0;
        Ok(scale_to_clamped_relative(relative, low, high)?.powf(self.root_scaling))
    }
}

fn deserialize_root_scaling<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let root_scaling = Deserialize::deserialize(deserializer)?;
    debug!("{:?}", root_scaling);

    if !ROOT_SCALING_RANGE.contains(&root_scaling) {
        return Err(serde::de::Error::invalid_value(
            serde::de::Unexpected::Float(root_scaling),
            &"number in the range of 0.1 to 10.",
        ));
    }

    Ok(root_scaling)
}

fn deserialize_sleep_multiplier<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let multiplier: f64 = Deserialize::deserialize(deserializer)?;
    if !(multiplier > 0.0 && multiplier.is_finite()) {
        return Err(serde::de::Error::invalid_value(
            serde::de::Unexpected::Float(multiplier),
            &"a positive number",
        ));
    }
    Ok(multiplier)
}

fn deserialize_calibration<'de, D>(deserializer: D) -> Result<[f64; 2], D::Error>
where
    D: Deserializer<'de>,
{
    let calibration: [f64; 2] = Deserialize::deserialize(deserializer)?;
    debug!("{:?}", calibration);
    if calibration[0] > calibration[1] {
        return Err(serde::de::Error::invalid_value(
            serde::de::Unexpected::Other(format!("{calibration:?}").as_str()),
            &format!(
                "Invalid scale parameters: {} > {}",
                calibration[0], calibration[1]
            )
            .as_str(),
        ));
    }

    for val in calibration {
        if !CALIBRATION_RANGE.contains(&val) {
            return Err(serde::de::Error::invalid_value(
                serde::de::Unexpected::Float(val),
                &"number in the range of 0.0 to 100.0",
            ));
        }
    }
    Ok(calibration.map(|val| val / 100.0))
}

fn deserialize_smoothing_factor<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let factor: f64 = Deserialize::deserialize(deserializer)?;
    if !(factor > 0.0 && factor <= 1.0) {
        return Err(serde::de::Error::invalid_value(
            serde::de::Unexpected::Float(factor),
            &"number greater than 0.0 and at most 1.0",
        ));
    }
    Ok(factor)
}

/// Deadline and retry budget of a single endpoint round-trip.
#[derive(Deserialize, Clone, Debug, PartialEq, SmartDefault)]
#[serde(default)]
#[serde(deny_unknown_fields)]
pub struct IoConfig {
    #[default(1500)]
    pub timeout_ms: u64,
    #[default(3)]
    pub retries: u8,
    #[default(50)]
    pub backoff_ms: u64,
}

impl IoConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Backoff before retry number `attempt + 1`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(1 << attempt.min(16)))
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq, SmartDefault)]
#[serde(default)]
#[serde(deny_unknown_fields)]
pub struct ActuationConfig {
    /// Largest change an automatic command may make per step, 0 for no limit.
    #[default(10)]
    pub max_step: u32,
    #[default(250)]
    pub step_interval_ms: u64,
}

impl ActuationConfig {
    pub fn step_interval(&self) -> Duration {
        Duration::from_millis(self.step_interval_ms.max(1))
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq, SmartDefault)]
#[serde(default)]
#[serde(deny_unknown_fields)]
pub struct AutoConfig {
    pub enabled: bool,
    #[default(2000)]
    pub tick_ms: u64,
    #[default(0.24)]
    #[serde(deserialize_with = "deserialize_smoothing_factor")]
    pub smoothing_factor: f64,
    #[default(4)]
    pub max_step: u32,
    #[default(2)]
    pub deadband: u32,
    #[default(2200)]
    pub sensor_poll_ms: u64,
    pub curve: LuxCurve,
}

impl AutoConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn sensor_poll(&self) -> Duration {
        Duration::from_millis(self.sensor_poll_ms.max(1))
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq, SmartDefault)]
#[serde(default)]
#[serde(deny_unknown_fields)]
pub struct ScheduleConfig {
    pub enabled: bool,
    #[default(true)]
    pub gradual: bool,
    #[default(30)]
    pub tick_secs: u64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[default(default_rules())]
    pub rules: Vec<ScheduleRule>,
}

impl ScheduleConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs.max(1))
    }

    /// The configured location, if both coordinates are present and valid.
    pub fn location(&self) -> Result<Option<Location>> {
        match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Location::new(latitude, longitude).map(Some),
            (None, None) => Ok(None),
            _ => Err(DimmerError::Other(
                "schedule needs both latitude and longitude".into(),
            )),
        }
    }
}

#[derive(Deserialize, Clone, Debug, SmartDefault)]
#[serde(default)]
#[serde(deny_unknown_fields)]
pub struct DimmerConfig {
    pub mode: Mode,
    /// Scan i2c buses for DDC/CI monitors.
    #[default(true)]
    pub ddc: bool,
    pub io: IoConfig,
    pub actuation: ActuationConfig,
    pub auto: AutoConfig,
    pub schedule: ScheduleConfig,
    global: EndpointConfig,
    devices: HashMap<String, EndpointConfig>,
}

impl DimmerConfig {
    /// Load `$XDG_CONFIG_HOME/dimmer/config.toml`, or the defaults if it does
    /// not exist.
    pub async fn load() -> Result<Self> {
        match config_path() {
            Some(path) if tokio::fs::try_exists(&path).await.unwrap_or(false) => {
                debug!("loading {}", path.display());
                Self::from_path(path).await
            }
            _ => {
                debug!("no config file, using defaults");
                Ok(DimmerConfig::default())
            }
        }
    }

    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        deserialize_toml_file(path).await
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        deserialize_toml_str(contents)
            .map_err(|message| DimmerError::Other(format!("Invalid config{message}")))
    }

    pub(crate) fn endpoint_config(&self, name: &str) -> EndpointConfig {
        if let Some(device_config) = self.devices.get(name) {
            debug!("{name}: {device_config:?}");
            device_config.clone()
        } else {
            debug!("{name}: using global config");
            self.global.clone()
        }
    }
}

fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auto::CurveKind;
    use crate::schedule::{Anchor, DisplayTarget};

    #[test]
    fn defaults_match_documented_values() {
        let config = DimmerConfig::default();
        assert_eq!(config.mode, Mode::Linked);
        assert!(config.ddc);
        assert_eq!(config.io.retries, 3);
        assert_eq!(config.auto.max_step, 4);
        assert_eq!(config.auto.smoothing_factor, 0.24);
        assert_eq!(config.auto.curve.kind, CurveKind::Linear);
        assert_eq!(config.schedule.rules.len(), 6);
        assert_eq!(config.schedule.location().unwrap(), None);
    }

    #[test]
    fn sections_and_device_overrides() {
        let config = DimmerConfig::from_toml(
            r#"
            mode = "unlinked"

            [global]
            root_scaling = 2.0

            [devices.intel_backlight]
            calibration = [10.0, 90.0]

            [auto]
            enabled = true
            curve = { kind = "logarithmic", max_lux = 500.0 }

            [schedule]
            latitude = 40.0
            longitude = -74.0

            [[schedule.rules]]
            anchor = "23:00"
            target_value = 20
            display = "display1"
            "#,
        )
        .unwrap();

        assert_eq!(config.mode, Mode::Unlinked);
        assert_eq!(config.endpoint_config("acpi_video0").root_scaling, 2.0);
        let panel = config.endpoint_config("intel_backlight");
        assert_eq!(panel.root_scaling, 1.0);
        assert_eq!(panel.calibration, [0.1, 0.9]);
        assert!(config.auto.enabled);
        assert_eq!(config.auto.curve.kind, CurveKind::Logarithmic);
        assert_eq!(config.auto.curve.max_lux, 500.0);
        assert_eq!(config.schedule.location().unwrap().unwrap().latitude, 40.0);

        let rule = &config.schedule.rules[0];
        assert_eq!(config.schedule.rules.len(), 1);
        assert!(matches!(rule.anchor, Anchor::Fixed(_)));
        assert_eq!(rule.display, DisplayTarget::Display1);
        assert_eq!(rule.offset_minutes, 0);
        assert!(rule.enabled);
    }

    #[test]
    fn invalid_values_are_rejected_with_a_line() {
        let err = DimmerConfig::from_toml("[global]\nroot_scaling = 20.0\n").unwrap_err();
        assert!(err.to_string().contains("0.1 to 10"), "{err}");

        assert!(DimmerConfig::from_toml("[global]\ncalibration = [80.0, 20.0]\n").is_err());
        assert!(DimmerConfig::from_toml("[auto]\nsmoothing_factor = 0.0\n").is_err());
        assert!(DimmerConfig::from_toml("[io]\nbogus = 1\n").is_err());
        assert!(DimmerConfig::from_toml("[schedule]\nlatitude = 95.0\nlongitude = 0.0\n")
            .unwrap()
            .schedule
            .location()
            .is_err());
    }

    #[tokio::test]
    async fn loads_from_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        tokio::fs::write(&path, "[actuation]\nmax_step = 0\n")
            .await
            .unwrap();
        let config = DimmerConfig::from_path(&path).await.unwrap();
        assert_eq!(config.actuation.max_step, 0);
        assert_eq!(config.actuation.step_interval_ms, 250);
    }

    #[test]
    fn percent_mapping_respects_calibration() {
        let plain = EndpointConfig::default();
        assert_eq!(plain.ratio_to_percent(0.5).unwrap(), 50);
        assert!((plain.percent_to_ratio(25).unwrap() - 0.25).abs() < 1e-9);

        let calibrated = EndpointConfig {
            calibration: [0.2, 0.8],
            ..EndpointConfig::default()
        };
        assert!((calibrated.percent_to_ratio(0).unwrap() - 0.2).abs() < 1e-9);
        assert!((calibrated.percent_to_ratio(100).unwrap() - 0.8).abs() < 1e-9);
        assert_eq!(calibrated.ratio_to_percent(0.5).unwrap(), 50);
        assert_eq!(calibrated.ratio_to_percent(0.1).unwrap(), 0);

        let rooted = EndpointConfig {
            root_scaling: 2.0,
            ..EndpointConfig::default()
        };
        for percent in [0, 10, 33, 50, 99, 100] {
            let ratio = rooted.percent_to_ratio(percent).unwrap();
            assert_eq!(rooted.ratio_to_percent(ratio).unwrap(), percent);
        }
    }
}
