//! PostgreSQL-backed [`StateStore`].
//!
//! Every update runs in its own transaction and locks the affected row with
//! `SELECT ... FOR UPDATE`; the connection mutex is held for that transaction
//! only. A backend error on a dead connection re-establishes it, so the next
//! call can succeed after a database restart.

use crate::db::models::{AlertCooldownRow, ComfortModeRow, PresenceRow, SINGLETON_ID, ZoneControlRow};
use crate::models::automation::{ComfortMode, CooldownKey, PresenceRecord, ZoneControlState};
use crate::models::tado::ZoneId;
use crate::schema;
use crate::store::{StateStore, StoreError, Transition, modify};
use chrono::{DateTime, Utc};
use diesel::PgConnection;
use diesel::prelude::*;
use diesel::upsert::excluded;
use log::{info, warn};
use std::sync::Mutex;

impl From<diesel::result::Error> for StoreError {
    fn from(value: diesel::result::Error) -> Self {
        StoreError::Backend(value.to_string())
    }
}

pub struct PgStore {
    database_url: String,
    conn: Mutex<PgConnection>,
}

/// Only backend failures can mean the connection itself is gone.
fn may_be_disconnected(err: &StoreError) -> bool {
    matches!(err, StoreError::Backend(_))
}

impl PgStore {
    pub fn new(conn: PgConnection, database_url: impl Into<String>) -> Self {
        PgStore {
            database_url: database_url.into(),
            conn: Mutex::new(conn),
        }
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut PgConnection) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let result = f(&mut conn);
        if let Err(e) = &result
            && may_be_disconnected(e)
            && diesel::sql_query("SELECT 1").execute(&mut *conn).is_err()
        {
            match PgConnection::establish(&self.database_url) {
                Ok(fresh) => {
                    *conn = fresh;
                    info!("Database connection re-established after: {}", e);
                }
                Err(reconnect) => warn!("Database unreachable, will retry on next call: {}", reconnect),
            }
        }
        result
    }
}

impl StateStore for PgStore {
    fn initialize(&self, zones: &[ZoneId], now: DateTime<Utc>) -> Result<(), StoreError> {
        use schema::comfort_mode::dsl as M;
        use schema::presence_state::dsl as P;
        use schema::zone_control_state::dsl as Z;

        self.with_conn(|conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                diesel::insert_into(P::presence_state)
                    .values(&PresenceRow::from(&PresenceRecord::initial(now)))
                    .on_conflict_do_nothing()
                    .execute(conn)?;
                diesel::insert_into(M::comfort_mode)
                    .values(&ComfortModeRow::from(&ComfortMode::initial(now)))
                    .on_conflict_do_nothing()
                    .execute(conn)?;
                let rows = zones
                    .iter()
                    .map(|z| ZoneControlRow::from(&ZoneControlState::initial(*z, now)))
                    .collect::<Vec<_>>();
                if !rows.is_empty() {
                    diesel::insert_into(Z::zone_control_state)
                        .values(&rows)
                        .on_conflict_do_nothing()
                        .execute(conn)?;
                }
                Ok(())
            })
        })
    }

    fn load_presence(&self) -> Result<PresenceRecord, StoreError> {
        use schema::presence_state::dsl as P;

        self.with_conn(|conn| {
            P::presence_state
                .find(SINGLETON_ID)
                .select(PresenceRow::as_select())
                .first(conn)
                .optional()?
                .ok_or(StoreError::Missing("presence"))
                .and_then(PresenceRecord::try_from)
        })
    }

    fn update_presence(
        &self,
        f: &mut dyn FnMut(&mut PresenceRecord),
    ) -> Result<Transition<PresenceRecord>, StoreError> {
        use schema::presence_state::dsl as P;

        self.with_conn(|conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                let row = P::presence_state
                    .find(SINGLETON_ID)
                    .select(PresenceRow::as_select())
                    .for_update()
                    .first(conn)
                    .optional()?
                    .ok_or(StoreError::Missing("presence"))?;
                let mut rec = PresenceRecord::try_from(row)?;
                let transition = modify(&mut rec, f);
                if transition.changed() {
                    diesel::update(P::presence_state.find(SINGLETON_ID))
                        .set(&PresenceRow::from(&transition.after))
                        .execute(conn)?;
                }
                Ok(transition)
            })
        })
    }

    fn load_comfort_mode(&self) -> Result<ComfortMode, StoreError> {
        use schema::comfort_mode::dsl as M;

        self.with_conn(|conn| {
            M::comfort_mode
                .find(SINGLETON_ID)
                .select(ComfortModeRow::as_select())
                .first(conn)
                .optional()?
                .map(ComfortMode::from)
                .ok_or(StoreError::Missing("comfort mode"))
        })
    }

    fn update_comfort_mode(&self, f: &mut dyn FnMut(&mut ComfortMode)) -> Result<Transition<ComfortMode>, StoreError> {
        use schema::comfort_mode::dsl as M;

        self.with_conn(|conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                let row = M::comfort_mode
                    .find(SINGLETON_ID)
                    .select(ComfortModeRow::as_select())
                    .for_update()
                    .first(conn)
                    .optional()?
                    .ok_or(StoreError::Missing("comfort mode"))?;
                let mut mode = ComfortMode::from(row);
                let transition = modify(&mut mode, f);
                if transition.changed() {
                    diesel::update(M::comfort_mode.find(SINGLETON_ID))
                        .set(&ComfortModeRow::from(&transition.after))
                        .execute(conn)?;
                }
                Ok(transition)
            })
        })
    }

    fn load_zone(&self, zone_id: ZoneId) -> Result<ZoneControlState, StoreError> {
        use schema::zone_control_state::dsl as Z;

        self.with_conn(|conn| {
            Z::zone_control_state
                .find(zone_id.0)
                .select(ZoneControlRow::as_select())
                .first(conn)
                .optional()?
                .ok_or(StoreError::UnknownZone(zone_id))
                .and_then(ZoneControlState::try_from)
        })
    }

    fn update_zone(
        &self,
        zone_id: ZoneId,
        f: &mut dyn FnMut(&mut ZoneControlState),
    ) -> Result<Transition<ZoneControlState>, StoreError> {
        use schema::zone_control_state::dsl as Z;

        self.with_conn(|conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                let row = Z::zone_control_state
                    .find(zone_id.0)
                    .select(ZoneControlRow::as_select())
                    .for_update()
                    .first(conn)
                    .optional()?
                    .ok_or(StoreError::UnknownZone(zone_id))?;
                let mut state = ZoneControlState::try_from(row)?;
                let transition = modify(&mut state, f);
                if transition.changed() {
                    diesel::update(Z::zone_control_state.find(zone_id.0))
                        .set(&ZoneControlRow::from(&transition.after))
                        .execute(conn)?;
                }
                Ok(transition)
            })
        })
    }

    fn load_cooldown(&self, key: &CooldownKey) -> Result<Option<DateTime<Utc>>, StoreError> {
        use schema::alert_cooldowns::dsl as C;

        self.with_conn(|conn| {
            let last = C::alert_cooldowns
                .find((key.kind.as_str(), key.location.as_str()))
                .select(C::last_sent_at)
                .first::<DateTime<Utc>>(conn)
                .optional()?;
            Ok(last)
        })
    }

    fn update_cooldown(
        &self,
        key: &CooldownKey,
        f: &mut dyn FnMut(&mut Option<DateTime<Utc>>),
    ) -> Result<Transition<Option<DateTime<Utc>>>, StoreError> {
        use schema::alert_cooldowns::dsl as C;

        self.with_conn(|conn| {
            conn.transaction::<_, StoreError, _>(|conn| {
                let existing = C::alert_cooldowns
                    .find((key.kind.as_str(), key.location.as_str()))
                    .select(AlertCooldownRow::as_select())
                    .for_update()
                    .first(conn)
                    .optional()?;
                let mut slot = existing.map(|row| row.last_sent_at);
                let transition = modify(&mut slot, f);
                match (transition.before, transition.after) {
                    (before, Some(ts)) if before != Some(ts) => {
                        diesel::insert_into(C::alert_cooldowns)
                            .values(&AlertCooldownRow::new(key, ts))
                            .on_conflict((C::alert_kind, C::location))
                            .do_update()
                            .set(C::last_sent_at.eq(excluded(C::last_sent_at)))
                            .execute(conn)?;
                    }
                    (Some(_), None) => {
                        diesel::delete(C::alert_cooldowns.find((key.kind.as_str(), key.location.as_str())))
                            .execute(conn)?;
                    }
                    _ => {}
                }
                Ok(transition)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnects_only_after_backend_errors() {
        assert!(may_be_disconnected(&StoreError::Backend("server closed the connection unexpectedly".into())));
        assert!(!may_be_disconnected(&StoreError::Missing("presence")));
        assert!(!may_be_disconnected(&StoreError::UnknownZone(ZoneId(4))));
        assert!(!may_be_disconnected(&StoreError::Corrupt("power".into())));
        assert!(!may_be_disconnected(&StoreError::Poisoned));
    }
}
