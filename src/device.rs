//! Device capability ports and their Tado-backed implementations.
//!
//! Ports are synchronous and return `DeviceError` instead of panicking; the
//! caller bounds every call with the HTTP agent's timeout.

use crate::client::{TadoClient, TadoClientError};
use crate::config::{ClimateSettings, HvacMode};
use crate::models::automation::SensorReading;
use crate::models::tado::{
    AirConditioningMode, HomeId, HomePresence, Power, PresenceLock, Temperature, TemperatureUnit, ZoneId,
    ZoneOverlay, ZoneOverlayTermination, ZoneOverlayTerminationType, ZoneSetting, ZoneState, ZoneType,
};
use log::debug;
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceError {
    Timeout,
    Transport(String),
    Rejected { status: u16, message: String },
    Malformed(String),
    Unsupported(String),
}

impl Display for DeviceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::Timeout => write!(f, "timed out"),
            DeviceError::Transport(s) => write!(f, "unreachable: {}", s),
            DeviceError::Rejected { status, message } => write!(f, "rejected ({}): {}", status, message),
            DeviceError::Malformed(s) => write!(f, "malformed response: {}", s),
            DeviceError::Unsupported(s) => write!(f, "unsupported: {}", s),
        }
    }
}

impl std::error::Error for DeviceError {}

impl From<TadoClientError> for DeviceError {
    fn from(value: TadoClientError) -> Self {
        match value {
            TadoClientError::Timeout => DeviceError::Timeout,
            TadoClientError::Transport(s) => DeviceError::Transport(s),
            TadoClientError::Http { status, message } => DeviceError::Rejected { status, message },
            TadoClientError::Json(e) => DeviceError::Malformed(e.to_string()),
            TadoClientError::Auth(s) => DeviceError::Rejected { status: 401, message: s },
        }
    }
}

pub trait ClimateDevices: Send + Sync {
    fn set_power(&self, zone_id: ZoneId, power: Power) -> Result<(), DeviceError>;
    fn set_target_temperature(&self, zone_id: ZoneId, value: f64) -> Result<(), DeviceError>;
    fn read_sensor(&self, zone_id: ZoneId) -> Result<SensorReading, DeviceError>;
}

pub trait LightPort: Send + Sync {
    fn set_light(&self, on: bool) -> Result<(), DeviceError>;
}

pub trait HomePresencePort: Send + Sync {
    fn set_home_presence(&self, presence: HomePresence) -> Result<(), DeviceError>;
}

/// Reading from a zone state. The data point timestamp is the observation
/// time; a reading without one cannot be aged and is rejected.
pub fn sensor_reading(state: &ZoneState, unit: TemperatureUnit) -> Result<SensorReading, DeviceError> {
    let points = state
        .sensor_data_points
        .as_ref()
        .ok_or_else(|| DeviceError::Malformed("zone state has no sensor data points".to_string()))?;
    let inside = points
        .inside_temperature
        .as_ref()
        .ok_or_else(|| DeviceError::Malformed("no inside temperature".to_string()))?;
    let temperature = Temperature {
        celsius: inside.celsius,
        fahrenheit: inside.fahrenheit,
    }
    .value_in(unit)
    .ok_or_else(|| DeviceError::Malformed("inside temperature has no value".to_string()))?;
    let observed_at = inside
        .timestamp
        .ok_or_else(|| DeviceError::Malformed("inside temperature has no timestamp".to_string()))?;

    Ok(SensorReading {
        temperature,
        humidity: points.humidity.as_ref().and_then(|h| h.percentage),
        observed_at,
        is_online: state.link.as_ref().is_none_or(|l| l.is_online()),
    })
}

#[derive(Debug, Clone, Copy, Default)]
struct ZoneCommand {
    power: Option<Power>,
    target: Option<f64>,
}

/// Tado overlays carry power and temperature together, so the adapter keeps
/// the last known value of each per zone and writes both on every change.
pub struct TadoDevices<'a> {
    client: &'a TadoClient,
    home_id: HomeId,
    unit: TemperatureUnit,
    modes: BTreeMap<ZoneId, HvacMode>,
    commands: Mutex<BTreeMap<ZoneId, ZoneCommand>>,
}

impl<'a> TadoDevices<'a> {
    pub fn new(client: &'a TadoClient, home_id: HomeId, unit: TemperatureUnit, settings: &ClimateSettings) -> Self {
        TadoDevices {
            client,
            home_id,
            unit,
            modes: settings.zones.iter().map(|z| (z.id, z.mode)).collect(),
            commands: Mutex::new(BTreeMap::new()),
        }
    }

    fn mode(&self, zone_id: ZoneId) -> Result<HvacMode, DeviceError> {
        self.modes
            .get(&zone_id)
            .copied()
            .ok_or_else(|| DeviceError::Unsupported(format!("zone {} is not configured", zone_id)))
    }

    fn with_command<T>(&self, zone_id: ZoneId, f: impl FnOnce(&mut ZoneCommand) -> T) -> Result<T, DeviceError> {
        let mut map = self
            .commands
            .lock()
            .map_err(|_| DeviceError::Unsupported("device cache lock poisoned".to_string()))?;
        Ok(f(map.entry(zone_id).or_default()))
    }

    fn push(&self, zone_id: ZoneId, cmd: ZoneCommand) -> Result<(), DeviceError> {
        let overlay = overlay_for(self.mode(zone_id)?, cmd, self.unit);
        debug!("Tado: zone {} overlay {:?}", zone_id, overlay.setting);
        self.client.put_zone_overlay(self.home_id, zone_id, &overlay)?;
        Ok(())
    }
}

fn overlay_for(mode: HvacMode, cmd: ZoneCommand, unit: TemperatureUnit) -> ZoneOverlay {
    let power = cmd.power.unwrap_or(Power::Off);
    let on = power == Power::On;
    let (r#type, ac_mode) = match mode {
        HvacMode::Heat => (ZoneType::Heating, None),
        HvacMode::Cool => (ZoneType::AirConditioning, on.then_some(AirConditioningMode::Cool)),
    };
    ZoneOverlay {
        setting: Some(ZoneSetting {
            r#type: Some(r#type),
            power: Some(power),
            temperature: cmd.target.filter(|_| on).map(|t| Temperature::in_unit(t, unit)),
            mode: ac_mode,
        }),
        termination: Some(ZoneOverlayTermination {
            r#type: Some(ZoneOverlayTerminationType::Manual),
        }),
    }
}

impl ClimateDevices for TadoDevices<'_> {
    fn set_power(&self, zone_id: ZoneId, power: Power) -> Result<(), DeviceError> {
        let cmd = self.with_command(zone_id, |c| ZoneCommand {
            power: Some(power),
            target: c.target,
        })?;
        self.push(zone_id, cmd)?;
        self.with_command(zone_id, |c| c.power = Some(power))
    }

    /// Remembered while the zone is off and sent with the next power-on.
    fn set_target_temperature(&self, zone_id: ZoneId, value: f64) -> Result<(), DeviceError> {
        let cmd = self.with_command(zone_id, |c| ZoneCommand {
            power: c.power,
            target: Some(value),
        })?;
        if cmd.power == Some(Power::On) {
            self.push(zone_id, cmd)?;
        }
        self.with_command(zone_id, |c| c.target = Some(value))
    }

    fn read_sensor(&self, zone_id: ZoneId) -> Result<SensorReading, DeviceError> {
        let state = self.client.get_zone_state(self.home_id, zone_id)?;
        if let Some(power) = state.setting.as_ref().and_then(|s| s.power) {
            self.with_command(zone_id, |c| c.power = Some(power))?;
        }
        sensor_reading(&state, self.unit)
    }
}

impl HomePresencePort for TadoDevices<'_> {
    fn set_home_presence(&self, presence: HomePresence) -> Result<(), DeviceError> {
        let lock = PresenceLock {
            home_presence: Some(presence),
        };
        self.client.put_presence_lock(self.home_id, &lock)?;
        Ok(())
    }
}

/// Exterior light behind an HTTP endpoint that takes `{"on": bool}`.
pub struct WebhookLight {
    agent: ureq::Agent,
    url: String,
}

impl WebhookLight {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build();
        WebhookLight {
            agent: ureq::Agent::new_with_config(config),
            url: url.into(),
        }
    }
}

impl LightPort for WebhookLight {
    fn set_light(&self, on: bool) -> Result<(), DeviceError> {
        let mut resp = self
            .agent
            .post(&self.url)
            .send_json(serde_json::json!({ "on": on }))
            .map_err(TadoClientError::from)?;
        let status = resp.status().as_u16();
        if (200..300).contains(&status) {
            Ok(())
        } else {
            let message = resp.body_mut().read_to_string().unwrap_or_default();
            Err(DeviceError::Rejected { status, message })
        }
    }
}
