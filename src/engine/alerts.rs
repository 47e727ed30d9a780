//! Alert rate limiter: at most one notification per `(kind, location)` per
//! cooldown window. Safety-class alerts always pass.

use crate::models::automation::{AlertKind, CooldownKey};
use crate::store::{StateStore, StoreError};
use chrono::{DateTime, TimeDelta, Utc};
use log::debug;
use std::sync::Arc;

/// True iff nothing was sent yet or the cooldown has fully elapsed.
pub fn cooldown_elapsed(last_sent_at: Option<DateTime<Utc>>, now: DateTime<Utc>, cooldown: TimeDelta) -> bool {
    last_sent_at.is_none_or(|last| now - last >= cooldown)
}

#[derive(Clone)]
pub struct AlertLimiter {
    store: Arc<dyn StateStore>,
}

impl AlertLimiter {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        AlertLimiter { store }
    }

    pub fn should_send(
        &self,
        kind: AlertKind,
        location: &str,
        cooldown: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        if kind.bypasses_cooldown() {
            return Ok(true);
        }
        let last = self.store.load_cooldown(&CooldownKey::new(kind, location))?;
        Ok(cooldown_elapsed(last, now, cooldown))
    }

    pub fn record_sent(&self, kind: AlertKind, location: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.store
            .update_cooldown(&CooldownKey::new(kind, location), &mut |slot| *slot = Some(now))?;
        Ok(())
    }

    /// `should_send` + `record_sent` as a single read-modify-write, so two
    /// triggers racing on the same key cannot both pass.
    pub fn try_acquire(
        &self,
        kind: AlertKind,
        location: &str,
        cooldown: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let bypass = kind.bypasses_cooldown();
        let mut granted = false;
        self.store
            .update_cooldown(&CooldownKey::new(kind, location), &mut |slot| {
                granted = bypass || cooldown_elapsed(*slot, now, cooldown);
                if granted {
                    *slot = Some(now);
                }
            })?;
        if !granted {
            debug!("Alert {} for {} suppressed by cooldown", kind.as_str(), location);
        }
        Ok(granted)
    }
}
