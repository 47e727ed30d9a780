//! Durable state boundary.
//!
//! Each record is read-modify-written atomically through an `update_*` call;
//! implementations hold their lock (or row lock) only for the duration of that
//! call, never across a whole tick.

use crate::models::automation::{ComfortMode, CooldownKey, PresenceRecord, ZoneControlState};
use crate::models::tado::ZoneId;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug)]
pub enum StoreError {
    /// Record was never created; `initialize` has not run.
    Missing(&'static str),
    UnknownZone(ZoneId),
    /// Stored value could not be decoded.
    Corrupt(String),
    Backend(String),
    Poisoned,
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Missing(what) => write!(f, "{} record missing; store not initialized", what),
            StoreError::UnknownZone(z) => write!(f, "no control state for zone {}", z),
            StoreError::Corrupt(s) => write!(f, "corrupt record: {}", s),
            StoreError::Backend(s) => write!(f, "storage backend error: {}", s),
            StoreError::Poisoned => write!(f, "state lock poisoned"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Value of a record before and after one read-modify-write.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition<T> {
    pub before: T,
    pub after: T,
}

impl<T: PartialEq> Transition<T> {
    pub fn changed(&self) -> bool {
        self.before != self.after
    }
}

pub trait StateStore: Send + Sync {
    /// Create every missing record. Existing records are left untouched.
    fn initialize(&self, zones: &[ZoneId], now: DateTime<Utc>) -> Result<(), StoreError>;

    fn load_presence(&self) -> Result<PresenceRecord, StoreError>;
    fn update_presence(
        &self,
        f: &mut dyn FnMut(&mut PresenceRecord),
    ) -> Result<Transition<PresenceRecord>, StoreError>;

    fn load_comfort_mode(&self) -> Result<ComfortMode, StoreError>;
    fn update_comfort_mode(&self, f: &mut dyn FnMut(&mut ComfortMode)) -> Result<Transition<ComfortMode>, StoreError>;

    fn load_zone(&self, zone_id: ZoneId) -> Result<ZoneControlState, StoreError>;
    fn update_zone(
        &self,
        zone_id: ZoneId,
        f: &mut dyn FnMut(&mut ZoneControlState),
    ) -> Result<Transition<ZoneControlState>, StoreError>;

    fn load_cooldown(&self, key: &CooldownKey) -> Result<Option<DateTime<Utc>>, StoreError>;
    fn update_cooldown(
        &self,
        key: &CooldownKey,
        f: &mut dyn FnMut(&mut Option<DateTime<Utc>>),
    ) -> Result<Transition<Option<DateTime<Utc>>>, StoreError>;
}

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>, StoreError> {
    m.lock().map_err(|_| StoreError::Poisoned)
}

pub(crate) fn modify<T: Clone>(slot: &mut T, f: &mut dyn FnMut(&mut T)) -> Transition<T> {
    let before = slot.clone();
    f(slot);
    Transition {
        before,
        after: slot.clone(),
    }
}

/// Process-local store: one mutex per record family. Used by tests and as a
/// reference for the semantics a persistent backend must match.
#[derive(Debug, Default)]
pub struct MemoryStore {
    presence: Mutex<Option<PresenceRecord>>,
    comfort: Mutex<Option<ComfortMode>>,
    zones: Mutex<BTreeMap<ZoneId, ZoneControlState>>,
    cooldowns: Mutex<BTreeMap<CooldownKey, DateTime<Utc>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn initialize(&self, zones: &[ZoneId], now: DateTime<Utc>) -> Result<(), StoreError> {
        lock(&self.presence)?.get_or_insert_with(|| PresenceRecord::initial(now));
        lock(&self.comfort)?.get_or_insert_with(|| ComfortMode::initial(now));
        let mut map = lock(&self.zones)?;
        for zone_id in zones {
            map.entry(*zone_id)
                .or_insert_with(|| ZoneControlState::initial(*zone_id, now));
        }
        Ok(())
    }

    fn load_presence(&self) -> Result<PresenceRecord, StoreError> {
        lock(&self.presence)?.clone().ok_or(StoreError::Missing("presence"))
    }

    fn update_presence(
        &self,
        f: &mut dyn FnMut(&mut PresenceRecord),
    ) -> Result<Transition<PresenceRecord>, StoreError> {
        let mut guard = lock(&self.presence)?;
        let rec = guard.as_mut().ok_or(StoreError::Missing("presence"))?;
        Ok(modify(rec, f))
    }

    fn load_comfort_mode(&self) -> Result<ComfortMode, StoreError> {
        lock(&self.comfort)?.clone().ok_or(StoreError::Missing("comfort mode"))
    }

    fn update_comfort_mode(&self, f: &mut dyn FnMut(&mut ComfortMode)) -> Result<Transition<ComfortMode>, StoreError> {
        let mut guard = lock(&self.comfort)?;
        let rec = guard.as_mut().ok_or(StoreError::Missing("comfort mode"))?;
        Ok(modify(rec, f))
    }

    fn load_zone(&self, zone_id: ZoneId) -> Result<ZoneControlState, StoreError> {
        lock(&self.zones)?
            .get(&zone_id)
            .cloned()
            .ok_or(StoreError::UnknownZone(zone_id))
    }

    fn update_zone(
        &self,
        zone_id: ZoneId,
        f: &mut dyn FnMut(&mut ZoneControlState),
    ) -> Result<Transition<ZoneControlState>, StoreError> {
        let mut guard = lock(&self.zones)?;
        let rec = guard.get_mut(&zone_id).ok_or(StoreError::UnknownZone(zone_id))?;
        Ok(modify(rec, f))
    }

    fn load_cooldown(&self, key: &CooldownKey) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(lock(&self.cooldowns)?.get(key).copied())
    }

    fn update_cooldown(
        &self,
        key: &CooldownKey,
        f: &mut dyn FnMut(&mut Option<DateTime<Utc>>),
    ) -> Result<Transition<Option<DateTime<Utc>>>, StoreError> {
        let mut guard = lock(&self.cooldowns)?;
        let mut slot = guard.get(key).copied();
        let transition = modify(&mut slot, f);
        match slot {
            Some(ts) => {
                guard.insert(key.clone(), ts);
            }
            None => {
                guard.remove(key);
            }
        }
        Ok(transition)
    }
}
