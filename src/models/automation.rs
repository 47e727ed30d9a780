//! Domain records shared by the presence state machine, the climate controller
//! and the state store.
//!
//! Every durable record has exactly one writer:
//! - `PresenceRecord`: presence state machine
//! - `ComfortMode`: night schedule
//! - `ZoneControlState`: climate controller
//! - alert cooldowns: alert rate limiter

use crate::models::tado::{Power, ZoneId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PresenceState {
    Home,
    Away,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArrivalStage {
    None,
    PreArrival,
    Arrived,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub state: PresenceState,
    pub stage: ArrivalStage,
    pub updated_at: DateTime<Utc>,
}

impl PresenceRecord {
    /// Record written on first run: nobody home, no arrival in progress.
    pub fn initial(now: DateTime<Utc>) -> Self {
        PresenceRecord {
            state: PresenceState::Away,
            stage: ArrivalStage::None,
            updated_at: now,
        }
    }

    /// `ARRIVED ⇔ HOME`; `PRE_ARRIVAL` only while still away.
    pub fn is_consistent(&self) -> bool {
        match self.state {
            PresenceState::Home => self.stage == ArrivalStage::Arrived,
            PresenceState::Away => self.stage != ArrivalStage::Arrived,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComfortMode {
    pub night_mode: bool,
    pub set_at: DateTime<Utc>,
}

impl ComfortMode {
    pub fn initial(now: DateTime<Utc>) -> Self {
        ComfortMode {
            night_mode: false,
            set_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneControlState {
    pub zone_id: ZoneId,
    pub power: Power,
    pub last_power_change_at: Option<DateTime<Utc>>,
    pub cycles_in_current_hour: u32,
    pub cycle_window_started_at: DateTime<Utc>,
    /// Set iff `power == ON`.
    pub run_started_at: Option<DateTime<Utc>>,
    /// Latched by an out-of-range reading; only a manual clear releases it.
    pub safety_hold: bool,
    /// Last setpoint pushed to the device.
    pub target_temperature: Option<f64>,
}

impl ZoneControlState {
    pub fn initial(zone_id: ZoneId, now: DateTime<Utc>) -> Self {
        ZoneControlState {
            zone_id,
            power: Power::Off,
            last_power_change_at: None,
            cycles_in_current_hour: 0,
            cycle_window_started_at: now,
            run_started_at: None,
            safety_hold: false,
            target_temperature: None,
        }
    }
}

/// Ephemeral reading supplied by the device port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub temperature: f64,
    pub humidity: Option<f64>,
    pub observed_at: DateTime<Utc>,
    pub is_online: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceEvent {
    GeofenceEnter,
    GeofenceExit,
    NetworkAssociate,
    NetworkDisassociate,
}

impl fmt::Display for PresenceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PresenceEvent::GeofenceEnter => "geofence_enter",
            PresenceEvent::GeofenceExit => "geofence_exit",
            PresenceEvent::NetworkAssociate => "network_associate",
            PresenceEvent::NetworkDisassociate => "network_disassociate",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Intent {
    /// Stage 1: reversible pre-conditioning on a wide-radius signal.
    PreCondition,
    /// Stage 2: full arrival on a local-network join.
    FullArrival { skip_precondition: bool },
    /// Revert comfort actions. `aborted_arrival` marks a pre-arrival that never completed.
    Departure { aborted_arrival: bool },
    NoOp,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    SensorMissing,
    SensorOffline,
    SensorStale,
    SafetyLimit,
    SafetyHold,
    MaxRunTime,
    AwayGate,
    BelowBand,
    AboveBand,
    WithinBand,
    DwellDeferred,
}

impl DecisionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionReason::SensorMissing => "sensor missing",
            DecisionReason::SensorOffline => "sensor offline",
            DecisionReason::SensorStale => "sensor stale",
            DecisionReason::SafetyLimit => "outside safe temperature range",
            DecisionReason::SafetyHold => "safety hold",
            DecisionReason::MaxRunTime => "max run time reached",
            DecisionReason::AwayGate => "away",
            DecisionReason::BelowBand => "below band",
            DecisionReason::AboveBand => "above band",
            DecisionReason::WithinBand => "within band",
            DecisionReason::DwellDeferred => "dwell time not elapsed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneDecision {
    pub zone_id: ZoneId,
    pub power: Power,
    /// Setpoint the zone is regulated around this tick, if any.
    pub setpoint: Option<f64>,
    pub power_changed: bool,
    pub setpoint_changed: bool,
    pub reason: DecisionReason,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    SafetyLimit,
    SensorStale,
    MaxRunTime,
    ShortCycling,
    AutomationFailure,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::SafetyLimit => "SAFETY_LIMIT",
            AlertKind::SensorStale => "SENSOR_STALE",
            AlertKind::MaxRunTime => "MAX_RUN_TIME",
            AlertKind::ShortCycling => "SHORT_CYCLING",
            AlertKind::AutomationFailure => "AUTOMATION_FAILURE",
        }
    }

    /// Safety-class alerts are never suppressed by a cooldown.
    pub fn bypasses_cooldown(self) -> bool {
        matches!(self, AlertKind::SafetyLimit)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CooldownKey {
    pub kind: AlertKind,
    pub location: String,
}

impl CooldownKey {
    pub fn new(kind: AlertKind, location: impl Into<String>) -> Self {
        CooldownKey {
            kind,
            location: location.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub kind: AlertKind,
    pub location: String,
    pub priority: Priority,
    pub title: String,
    pub body: String,
}
