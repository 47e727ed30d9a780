//! Models derived from `tado-openapi.yml` components.schemas.
//!
//! Scope: the subset of schemas the controller reads (zone state, mobile
//! device locations) or writes (zone overlays, presence lock).
//!
//! Notes
//! - Write-path structs skip `None` fields; the API rejects explicit nulls on overlays.
//! - Date/time fields use `chrono` (`DateTime<Utc>`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// =====================
// Scalar ID newtype wrappers
// =====================

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HomeId(pub i64);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MobileDeviceId(pub i64);

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ZoneId(pub i64);

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =====================
// Core enums (string enums in OpenAPI)
// =====================

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AirConditioningMode {
    Cool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HomePresence {
    Home,
    Away,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Power {
    #[serde(rename = "ON")]
    On,
    #[serde(rename = "OFF")]
    Off,
}

impl fmt::Display for Power {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Power::On => write!(f, "ON"),
            Power::Off => write!(f, "OFF"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TemperatureUnit {
    Celsius,
    Fahrenheit,
}

impl TemperatureUnit {
    pub fn symbol(self) -> &'static str {
        match self {
            TemperatureUnit::Celsius => "°C",
            TemperatureUnit::Fahrenheit => "°F",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ZoneOverlayTerminationType {
    /// Holds until replaced; the controller always overwrites its own overlay.
    Manual,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ZoneType {
    AirConditioning,
    Heating,
}

// =====================
// Core datapoint structs
// =====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Temperature {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub celsius: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fahrenheit: Option<f64>,
}

impl Temperature {
    pub fn in_unit(value: f64, unit: TemperatureUnit) -> Self {
        match unit {
            TemperatureUnit::Celsius => Temperature {
                celsius: Some(value),
                fahrenheit: None,
            },
            TemperatureUnit::Fahrenheit => Temperature {
                celsius: None,
                fahrenheit: Some(value),
            },
        }
    }

    pub fn value_in(&self, unit: TemperatureUnit) -> Option<f64> {
        match unit {
            TemperatureUnit::Celsius => self.celsius.or_else(|| self.fahrenheit.map(|f| (f - 32.0) * 5.0 / 9.0)),
            TemperatureUnit::Fahrenheit => self.fahrenheit.or_else(|| self.celsius.map(|c| c * 9.0 / 5.0 + 32.0)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TemperatureDataPoint {
    pub celsius: Option<f64>,
    pub fahrenheit: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "type")]
    pub r#type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PercentageDataPoint {
    #[serde(rename = "type")]
    pub r#type: Option<String>,
    pub percentage: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SensorDataPoints {
    pub inside_temperature: Option<TemperatureDataPoint>,
    pub humidity: Option<PercentageDataPoint>,
}

// =====================
// Presence
// =====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PresenceLock {
    pub home_presence: Option<HomePresence>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MobileDeviceSettings {
    pub geo_tracking_enabled: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MobileDeviceLocation {
    pub stale: Option<bool>,
    pub at_home: Option<bool>,
    pub relative_distance_from_home_fence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MobileDevice {
    pub id: Option<MobileDeviceId>,
    pub name: Option<String>,
    pub settings: Option<MobileDeviceSettings>,
    pub location: Option<MobileDeviceLocation>,
}

// =====================
// Zone overlay and setting
// =====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ZoneSetting {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#type: Option<ZoneType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power: Option<Power>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<Temperature>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<AirConditioningMode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ZoneOverlayTermination {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#type: Option<ZoneOverlayTerminationType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ZoneOverlay {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setting: Option<ZoneSetting>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination: Option<ZoneOverlayTermination>,
}

// =====================
// Zone state
// =====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ZoneStateLink {
    pub state: Option<String>, // ONLINE/OFFLINE
}

impl ZoneStateLink {
    pub fn is_online(&self) -> bool {
        self.state.as_deref().is_none_or(|s| s.eq_ignore_ascii_case("ONLINE"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ZoneState {
    pub setting: Option<ZoneSetting>,
    pub link: Option<ZoneStateLink>,
    pub sensor_data_points: Option<SensorDataPoints>,
}
