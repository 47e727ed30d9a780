//! Night schedule: the only writer of the comfort mode record.

use crate::config::DailyWindow;
use crate::store::{StateStore, StoreError};
use chrono::{DateTime, NaiveTime, Utc};
use log::info;

/// Bring `night_mode` in line with the schedule. Returns the new value when
/// a boundary was crossed since the last call.
pub fn apply_night_schedule(
    store: &dyn StateStore,
    window: &DailyWindow,
    local_time: NaiveTime,
    now: DateTime<Utc>,
) -> Result<Option<bool>, StoreError> {
    let night = window.contains(local_time);
    let t = store.update_comfort_mode(&mut |mode| {
        if mode.night_mode != night {
            mode.night_mode = night;
            mode.set_at = now;
        }
    })?;
    if !t.changed() {
        return Ok(None);
    }
    info!(
        "Night mode {} at {}",
        if night { "started" } else { "ended" },
        local_time.format("%H:%M")
    );
    Ok(Some(night))
}
