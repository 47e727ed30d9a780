//! Diesel row structs for the durable state records, and their conversions to
//! the domain types in `crate::models::automation`.
//!
//! Enums are stored as their serde names (`HOME`, `PRE_ARRIVAL`, `ON`, ...).

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::models::automation::{ComfortMode, CooldownKey, PresenceRecord, ZoneControlState};
use crate::models::tado::ZoneId;
use crate::schema;
use crate::store::StoreError;
use crate::utils::{parse_enum_name, serde_enum_name};

/// Primary key of the singleton rows.
pub const SINGLETON_ID: i16 = 1;

fn enum_name<T: Serialize>(val: &T) -> String {
    serde_enum_name(val).unwrap_or_default()
}

fn parse_field<T: serde::de::DeserializeOwned>(table: &str, column: &str, raw: &str) -> Result<T, StoreError> {
    parse_enum_name(raw).ok_or_else(|| StoreError::Corrupt(format!("{}.{} holds unknown value {:?}", table, column, raw)))
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, AsChangeset, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = schema::presence_state)]
pub struct PresenceRow {
    pub id: i16,
    pub state: String,
    pub stage: String,
    pub updated_at: DateTime<Utc>,
}

impl From<&PresenceRecord> for PresenceRow {
    fn from(rec: &PresenceRecord) -> Self {
        PresenceRow {
            id: SINGLETON_ID,
            state: enum_name(&rec.state),
            stage: enum_name(&rec.stage),
            updated_at: rec.updated_at,
        }
    }
}

impl TryFrom<PresenceRow> for PresenceRecord {
    type Error = StoreError;

    fn try_from(row: PresenceRow) -> Result<Self, Self::Error> {
        Ok(PresenceRecord {
            state: parse_field("presence_state", "state", &row.state)?,
            stage: parse_field("presence_state", "stage", &row.stage)?,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, AsChangeset, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = schema::comfort_mode)]
pub struct ComfortModeRow {
    pub id: i16,
    pub night_mode: bool,
    pub set_at: DateTime<Utc>,
}

impl From<&ComfortMode> for ComfortModeRow {
    fn from(mode: &ComfortMode) -> Self {
        ComfortModeRow {
            id: SINGLETON_ID,
            night_mode: mode.night_mode,
            set_at: mode.set_at,
        }
    }
}

impl From<ComfortModeRow> for ComfortMode {
    fn from(row: ComfortModeRow) -> Self {
        ComfortMode {
            night_mode: row.night_mode,
            set_at: row.set_at,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, AsChangeset, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = schema::zone_control_state)]
#[diesel(primary_key(zone_id))]
#[diesel(treat_none_as_null = true)]
pub struct ZoneControlRow {
    pub zone_id: i64,
    pub power: String,
    pub last_power_change_at: Option<DateTime<Utc>>,
    pub cycles_in_current_hour: i32,
    pub cycle_window_started_at: DateTime<Utc>,
    pub run_started_at: Option<DateTime<Utc>>,
    pub safety_hold: bool,
    pub target_temperature: Option<f64>,
}

impl From<&ZoneControlState> for ZoneControlRow {
    fn from(z: &ZoneControlState) -> Self {
        ZoneControlRow {
            zone_id: z.zone_id.0,
            power: enum_name(&z.power),
            last_power_change_at: z.last_power_change_at,
            cycles_in_current_hour: i32::try_from(z.cycles_in_current_hour).unwrap_or(i32::MAX),
            cycle_window_started_at: z.cycle_window_started_at,
            run_started_at: z.run_started_at,
            safety_hold: z.safety_hold,
            target_temperature: z.target_temperature,
        }
    }
}

impl TryFrom<ZoneControlRow> for ZoneControlState {
    type Error = StoreError;

    fn try_from(row: ZoneControlRow) -> Result<Self, Self::Error> {
        Ok(ZoneControlState {
            zone_id: ZoneId(row.zone_id),
            power: parse_field("zone_control_state", "power", &row.power)?,
            last_power_change_at: row.last_power_change_at,
            cycles_in_current_hour: u32::try_from(row.cycles_in_current_hour).unwrap_or(0),
            cycle_window_started_at: row.cycle_window_started_at,
            run_started_at: row.run_started_at,
            safety_hold: row.safety_hold,
            target_temperature: row.target_temperature,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::alert_cooldowns)]
pub struct AlertCooldownRow {
    pub alert_kind: String,
    pub location: String,
    pub last_sent_at: DateTime<Utc>,
}

impl AlertCooldownRow {
    pub fn new(key: &CooldownKey, last_sent_at: DateTime<Utc>) -> Self {
        AlertCooldownRow {
            alert_kind: key.kind.as_str().to_string(),
            location: key.location.clone(),
            last_sent_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::automation::{AlertKind, ArrivalStage, PresenceState};
    use crate::models::tado::Power;
    use chrono::TimeZone;

    #[test]
    fn zone_row_keeps_every_field() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 6, 0, 0).unwrap();
        let mut state = ZoneControlState::initial(ZoneId(7), now);
        state.power = Power::On;
        state.run_started_at = Some(now);
        state.last_power_change_at = Some(now);
        state.cycles_in_current_hour = 2;
        state.target_temperature = Some(20.5);

        let row = ZoneControlRow::from(&state);
        assert_eq!(row.power, "ON");
        assert_eq!(ZoneControlState::try_from(row).unwrap(), state);
    }

    #[test]
    fn unknown_stage_is_reported_as_corrupt() {
        let row = PresenceRow {
            id: SINGLETON_ID,
            state: "HOME".into(),
            stage: "HALFWAY".into(),
            updated_at: Utc::now(),
        };
        let err = PresenceRecord::try_from(row).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(ref m) if m.contains("HALFWAY")));

        let ok = PresenceRow {
            id: SINGLETON_ID,
            state: "HOME".into(),
            stage: "ARRIVED".into(),
            updated_at: Utc::now(),
        };
        let rec = PresenceRecord::try_from(ok).unwrap();
        assert_eq!((rec.state, rec.stage), (PresenceState::Home, ArrivalStage::Arrived));
    }

    #[test]
    fn cooldown_row_key() {
        let key = CooldownKey::new(AlertKind::MaxRunTime, "Bedroom");
        let row = AlertCooldownRow::new(&key, Utc::now());
        assert_eq!(row.alert_kind, "MAX_RUN_TIME");
        assert_eq!(row.location, "Bedroom");
    }
}
