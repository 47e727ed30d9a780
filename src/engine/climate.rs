//! Hysteresis climate controller.
//!
//! Deadband control with hard safety limits, built for a slow sensor feed.
//! Per zone and per tick, in priority order:
//!
//! 1. safety: missing/offline/stale reading, or a reading outside the safe range
//! 2. max run time
//! 3. presence gate
//! 4. mode (night / comfort / mirrored primary setpoint)
//! 5. hysteresis around the setpoint
//! 6. dwell-time enforcement
//! 7. cycle accounting
//!
//! The controller never talks to devices. `tick` commits the new zone records
//! and returns decisions; the tick runner applies them and calls [`ClimateController::restore`]
//! when a device call fails.

use crate::config::{AwayPolicy, ClimateSettings, HvacMode, ZoneConfig, ZoneRole};
use crate::engine::alerts::AlertLimiter;
use crate::models::automation::{
    Alert, AlertKind, ArrivalStage, ComfortMode, DecisionReason, PresenceRecord, PresenceState, Priority,
    SensorReading, ZoneControlState, ZoneDecision,
};
use crate::models::tado::{Power, TemperatureUnit, ZoneId};
use crate::store::{StateStore, StoreError, Transition};
use crate::utils::describe_duration;
use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;

const CYCLE_WINDOW: TimeDelta = TimeDelta::hours(1);

/// What presence and mode ask of a zone before any sensor is consulted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Target {
    Off,
    Setpoint(f64),
}

/// Presence gate followed by mode selection.
///
/// The primary zone counts as occupied during `PRE_ARRIVAL`; that is how
/// pre-conditioning raises its target ahead of the network join.
pub fn target_for(
    zone: &ZoneConfig,
    presence: &PresenceRecord,
    comfort: &ComfortMode,
    primary: Option<(HvacMode, f64)>,
) -> Target {
    if presence.state == PresenceState::Away {
        match zone.role {
            ZoneRole::Secondary => return Target::Off,
            ZoneRole::Primary if presence.stage != ArrivalStage::PreArrival => match zone.away_policy {
                AwayPolicy::Off => return Target::Off,
                AwayPolicy::Reduced { setpoint } => return Target::Setpoint(setpoint),
                AwayPolicy::Maintain => {}
            },
            ZoneRole::Primary => {}
        }
    }

    if comfort.night_mode {
        return Target::Setpoint(zone.night_setpoint);
    }
    match (zone.role, primary) {
        (ZoneRole::Secondary, Some((mode, setpoint))) if mode == zone.mode => Target::Setpoint(setpoint),
        _ => Target::Setpoint(zone.comfort_setpoint),
    }
}

/// `(on_threshold, off_threshold)` for heating; swapped roles for cooling.
pub fn thresholds(setpoint: f64, deadband: f64) -> (f64, f64) {
    (setpoint - deadband / 2.0, setpoint + deadband / 2.0)
}

/// Outside the band the reading decides; inside it the current power is kept.
pub fn hysteresis(mode: HvacMode, temperature: f64, setpoint: f64, deadband: f64, current: Power) -> (Power, DecisionReason) {
    let (low, high) = thresholds(setpoint, deadband);
    match mode {
        HvacMode::Heat if temperature < low => (Power::On, DecisionReason::BelowBand),
        HvacMode::Heat if temperature > high => (Power::Off, DecisionReason::AboveBand),
        HvacMode::Cool if temperature > high => (Power::On, DecisionReason::AboveBand),
        HvacMode::Cool if temperature < low => (Power::Off, DecisionReason::BelowBand),
        _ => (current, DecisionReason::WithinBand),
    }
}

/// Outcome of steps 1–5 for one zone.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub desired: Power,
    /// Forced changes skip dwell enforcement.
    pub forced: bool,
    pub setpoint: Option<f64>,
    pub reason: DecisionReason,
    pub latch_hold: bool,
    pub alert: Option<AlertKind>,
}

impl Verdict {
    fn forced_off(reason: DecisionReason, alert: Option<AlertKind>) -> Self {
        Verdict {
            desired: Power::Off,
            forced: true,
            setpoint: None,
            reason,
            latch_hold: false,
            alert,
        }
    }
}

pub fn evaluate(
    settings: &ClimateSettings,
    zone: &ZoneConfig,
    state: &ZoneControlState,
    reading: Option<&SensorReading>,
    target: Target,
    now: DateTime<Utc>,
) -> Verdict {
    // 1. safety
    let Some(reading) = reading else {
        return Verdict::forced_off(DecisionReason::SensorMissing, Some(AlertKind::SensorStale));
    };
    if !reading.is_online {
        return Verdict::forced_off(DecisionReason::SensorOffline, Some(AlertKind::SensorStale));
    }
    if now - reading.observed_at > settings.max_sensor_age() {
        return Verdict::forced_off(DecisionReason::SensorStale, Some(AlertKind::SensorStale));
    }
    if reading.temperature < settings.min_safe_temp || reading.temperature > settings.max_safe_temp {
        let mut verdict = Verdict::forced_off(DecisionReason::SafetyLimit, Some(AlertKind::SafetyLimit));
        verdict.latch_hold = true;
        return verdict;
    }
    if state.safety_hold {
        return Verdict::forced_off(DecisionReason::SafetyHold, None);
    }

    // 2. max run time
    if state.power == Power::On
        && state
            .run_started_at
            .is_some_and(|started| now - started >= settings.max_run_time())
    {
        return Verdict::forced_off(DecisionReason::MaxRunTime, Some(AlertKind::MaxRunTime));
    }

    // 3 + 4. presence gate, mode
    let setpoint = match target {
        Target::Off => {
            return Verdict {
                desired: Power::Off,
                forced: false,
                setpoint: None,
                reason: DecisionReason::AwayGate,
                latch_hold: false,
                alert: None,
            };
        }
        Target::Setpoint(s) => s,
    };

    // 5. hysteresis
    let (desired, reason) = hysteresis(
        zone.mode,
        reading.temperature,
        setpoint,
        settings.deadband_for(zone),
        state.power,
    );
    Verdict {
        desired,
        forced: false,
        setpoint: Some(setpoint),
        reason,
        latch_hold: false,
        alert: None,
    }
}

/// Dwell rule for an unforced change away from the current power.
pub fn dwell_allows(settings: &ClimateSettings, state: &ZoneControlState, desired: Power, now: DateTime<Utc>) -> bool {
    match (state.power, desired) {
        (Power::Off, Power::On) => state
            .last_power_change_at
            .is_none_or(|changed| now - changed >= settings.min_off_time()),
        (Power::On, Power::Off) => state
            .run_started_at
            .or(state.last_power_change_at)
            .is_none_or(|started| now - started >= settings.min_cycle_time()),
        _ => true,
    }
}

fn roll_cycle_window(state: &mut ZoneControlState, now: DateTime<Utc>) {
    if now - state.cycle_window_started_at >= CYCLE_WINDOW {
        state.cycle_window_started_at = now;
        state.cycles_in_current_hour = 0;
    }
}

fn realize(state: &mut ZoneControlState, power: Power, now: DateTime<Utc>) {
    state.power = power;
    state.last_power_change_at = Some(now);
    state.run_started_at = match power {
        Power::On => Some(now),
        Power::Off => None,
    };
    state.cycles_in_current_hour = state.cycles_in_current_hour.saturating_add(1);
}

/// Steps 6–7: commit the verdict into the zone record.
pub fn apply(
    settings: &ClimateSettings,
    state: &mut ZoneControlState,
    verdict: &Verdict,
    now: DateTime<Utc>,
) -> ZoneDecision {
    roll_cycle_window(state, now);
    if verdict.latch_hold {
        state.safety_hold = true;
    }

    let mut reason = verdict.reason;
    let mut power_changed = false;
    if verdict.desired != state.power {
        if verdict.forced || dwell_allows(settings, state, verdict.desired, now) {
            realize(state, verdict.desired, now);
            power_changed = true;
        } else {
            reason = DecisionReason::DwellDeferred;
        }
    }

    let mut setpoint_changed = false;
    if state.power == Power::On
        && let Some(setpoint) = verdict.setpoint
        && (power_changed || state.target_temperature != Some(setpoint))
    {
        state.target_temperature = Some(setpoint);
        setpoint_changed = true;
    }

    ZoneDecision {
        zone_id: state.zone_id,
        power: state.power,
        setpoint: verdict.setpoint,
        power_changed,
        setpoint_changed,
        reason,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ZoneOutcome {
    pub decision: ZoneDecision,
    pub record: Transition<ZoneControlState>,
}

#[derive(Debug, Default)]
pub struct TickOutcome {
    pub zones: Vec<ZoneOutcome>,
    /// Alerts that passed the rate limiter; the caller delivers them.
    pub alerts: Vec<Alert>,
}

impl TickOutcome {
    pub fn decisions(&self) -> impl Iterator<Item = &ZoneDecision> {
        self.zones.iter().map(|z| &z.decision)
    }

    pub fn decision(&self, zone_id: ZoneId) -> Option<&ZoneDecision> {
        self.decisions().find(|d| d.zone_id == zone_id)
    }
}

pub struct ClimateController {
    settings: ClimateSettings,
    unit: TemperatureUnit,
    store: Arc<dyn StateStore>,
    limiter: AlertLimiter,
}

impl ClimateController {
    pub fn new(settings: ClimateSettings, unit: TemperatureUnit, store: Arc<dyn StateStore>) -> Self {
        let limiter = AlertLimiter::new(store.clone());
        ClimateController {
            settings,
            unit,
            store,
            limiter,
        }
    }

    pub fn settings(&self) -> &ClimateSettings {
        &self.settings
    }

    /// Current targets for every zone, as the next tick would compute them.
    pub fn targets(&self, presence: &PresenceRecord, comfort: &ComfortMode) -> Vec<(ZoneId, Target)> {
        let primary = self.primary_target(presence, comfort);
        self.settings
            .zones_in_tick_order()
            .map(|zone| (zone.id, target_for(zone, presence, comfort, primary)))
            .collect()
    }

    fn primary_target(&self, presence: &PresenceRecord, comfort: &ComfortMode) -> Option<(HvacMode, f64)> {
        let primary = self.settings.primary()?;
        match target_for(primary, presence, comfort, None) {
            Target::Setpoint(s) => Some((primary.mode, s)),
            Target::Off => None,
        }
    }

    pub fn tick(
        &self,
        now: DateTime<Utc>,
        readings: &BTreeMap<ZoneId, SensorReading>,
    ) -> Result<TickOutcome, StoreError> {
        let presence = self.store.load_presence()?;
        let comfort = self.store.load_comfort_mode()?;
        let primary = self.primary_target(&presence, &comfort);

        let mut outcome = TickOutcome::default();
        for zone in self.settings.zones_in_tick_order() {
            let target = target_for(zone, &presence, &comfort, primary);
            let reading = readings.get(&zone.id);

            let mut decision = None;
            let mut verdict = None;
            let record = match self.store.update_zone(zone.id, &mut |state| {
                let v = evaluate(&self.settings, zone, state, reading, target, now);
                decision = Some(apply(&self.settings, state, &v, now));
                verdict = Some(v);
            }) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Climate: zone {} skipped this tick: {}", zone.name, e);
                    continue;
                }
            };
            let (Some(decision), Some(verdict)) = (decision, verdict) else {
                continue;
            };

            self.log_decision(zone, &decision, reading);
            let candidates = self.alert_candidates(zone, &verdict, &decision, &record.after, reading, now);
            outcome.alerts.extend(self.rate_limit(&zone.name, candidates, now));
            outcome.zones.push(ZoneOutcome { decision, record });
        }
        Ok(outcome)
    }

    /// Undo a committed tick for one zone after its device call failed, so
    /// the next tick compares against what the device is really doing.
    /// A latched safety hold survives the restore. Returns false when the
    /// record moved on in the meantime.
    pub fn restore(&self, record: &Transition<ZoneControlState>) -> Result<bool, StoreError> {
        let mut restored = false;
        self.store.update_zone(record.after.zone_id, &mut |state| {
            restored = false;
            if *state == record.after {
                let hold = state.safety_hold;
                *state = record.before.clone();
                state.safety_hold = hold;
                restored = true;
            }
        })?;
        Ok(restored)
    }

    /// Manual release of a latched safety hold.
    pub fn clear_safety_hold(&self, zone_id: ZoneId) -> Result<bool, StoreError> {
        let t = self.store.update_zone(zone_id, &mut |state| state.safety_hold = false)?;
        if t.changed() {
            info!("Climate: safety hold cleared for zone {}", zone_id);
        }
        Ok(t.changed())
    }

    fn log_decision(&self, zone: &ZoneConfig, decision: &ZoneDecision, reading: Option<&SensorReading>) {
        let temp = reading
            .map(|r| format!("{:.1}{}", r.temperature, self.unit.symbol()))
            .unwrap_or_else(|| "-".to_string());
        if decision.power_changed {
            info!(
                "Climate: {} -> {} ({}, reading {}, setpoint {})",
                zone.name,
                decision.power,
                decision.reason.as_str(),
                temp,
                decision
                    .setpoint
                    .map(|s| format!("{:.1}", s))
                    .unwrap_or_else(|| "-".to_string())
            );
        } else if decision.reason == DecisionReason::DwellDeferred {
            warn!("Climate: {} change deferred, dwell time not elapsed (reading {})", zone.name, temp);
        } else {
            debug!(
                "Climate: {} stays {} ({}, reading {})",
                zone.name,
                decision.power,
                decision.reason.as_str(),
                temp
            );
        }
    }

    fn alert_candidates(
        &self,
        zone: &ZoneConfig,
        verdict: &Verdict,
        decision: &ZoneDecision,
        state: &ZoneControlState,
        reading: Option<&SensorReading>,
        now: DateTime<Utc>,
    ) -> Vec<Alert> {
        let sym = self.unit.symbol();
        let mut candidates = Vec::new();

        match verdict.alert {
            Some(AlertKind::SafetyLimit) => {
                let temp = reading.map(|r| r.temperature).unwrap_or(f64::NAN);
                error!(
                    "SAFETY: {} reads {:.1}{} outside [{:.1}, {:.1}]; forced off and held",
                    zone.name, temp, sym, self.settings.min_safe_temp, self.settings.max_safe_temp
                );
                candidates.push(Alert {
                    kind: AlertKind::SafetyLimit,
                    location: zone.name.clone(),
                    priority: Priority::High,
                    title: format!("Safety cutoff: {}", zone.name),
                    body: format!(
                        "{} reads {:.1}{} (safe {:.1}–{:.1}{})\nForced off until cleared",
                        zone.name, temp, sym, self.settings.min_safe_temp, self.settings.max_safe_temp, sym
                    ),
                });
            }
            Some(AlertKind::SensorStale) => {
                let detail = match (decision.reason, reading) {
                    (DecisionReason::SensorStale, Some(r)) => {
                        format!("last reading {} old", describe_duration(now - r.observed_at))
                    }
                    (reason, _) => reason.as_str().to_string(),
                };
                warn!("Climate: {} fail-safe off: {}", zone.name, detail);
                candidates.push(Alert {
                    kind: AlertKind::SensorStale,
                    location: zone.name.clone(),
                    priority: Priority::Normal,
                    title: format!("Sensor problem: {}", zone.name),
                    body: format!("{}: {}\nZone kept off", zone.name, detail),
                });
            }
            Some(AlertKind::MaxRunTime) => {
                let ran = describe_duration(self.settings.max_run_time());
                warn!("Climate: {} hit max run time ({})", zone.name, ran);
                candidates.push(Alert {
                    kind: AlertKind::MaxRunTime,
                    location: zone.name.clone(),
                    priority: Priority::Normal,
                    title: format!("Max run time: {}", zone.name),
                    body: format!("{} ran for {}\nForced off", zone.name, ran),
                });
            }
            _ => {}
        }

        if decision.power_changed && state.cycles_in_current_hour > self.settings.max_cycles_per_hour {
            candidates.push(Alert {
                kind: AlertKind::ShortCycling,
                location: zone.name.clone(),
                priority: Priority::Low,
                title: format!("Short cycling: {}", zone.name),
                body: format!("{} switched {} times this hour", zone.name, state.cycles_in_current_hour),
            });
        }
        candidates
    }

    /// Keeps the alerts whose cooldown allows sending now.
    fn rate_limit(&self, zone_name: &str, candidates: Vec<Alert>, now: DateTime<Utc>) -> Vec<Alert> {
        let cooldown = self.settings.alert_cooldown();
        candidates
            .into_iter()
            .filter(|alert| match self.limiter.try_acquire(alert.kind, &alert.location, cooldown, now) {
                Ok(sent) => sent,
                Err(e) if alert.kind.bypasses_cooldown() => {
                    warn!("Climate: cooldown store unavailable ({}); sending safety alert anyway", e);
                    true
                }
                Err(e) => {
                    warn!("Climate: dropping {} alert for {}: {}", alert.kind.as_str(), zone_name, e);
                    false
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::load_fixture;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use proptest::prelude::*;

    const LIVING: ZoneId = ZoneId(1);
    const BEDROOM: ZoneId = ZoneId(2);
    const OFFICE: ZoneId = ZoneId(3);

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 18, 0, 0).unwrap()
    }

    fn setup() -> (ClimateController, Arc<MemoryStore>) {
        setup_with(|_| {})
    }

    fn setup_with(tweak: impl FnOnce(&mut ClimateSettings)) -> (ClimateController, Arc<MemoryStore>) {
        let mut settings = load_fixture();
        tweak(&mut settings);
        let store = Arc::new(MemoryStore::new());
        let ids: Vec<_> = settings.zones.iter().map(|z| z.id).collect();
        store.initialize(&ids, t0() - TimeDelta::hours(6)).unwrap();
        let controller = ClimateController::new(settings, TemperatureUnit::Fahrenheit, store.clone());
        (controller, store)
    }

    fn set_home(store: &MemoryStore) {
        store
            .update_presence(&mut |p| {
                p.state = PresenceState::Home;
                p.stage = ArrivalStage::Arrived;
            })
            .unwrap();
    }

    fn set_night(store: &MemoryStore, on: bool) {
        store.update_comfort_mode(&mut |m| m.night_mode = on).unwrap();
    }

    fn force_power(store: &MemoryStore, zone: ZoneId, power: Power, since: DateTime<Utc>) {
        store
            .update_zone(zone, &mut |s| {
                s.power = power;
                s.last_power_change_at = Some(since);
                s.run_started_at = (power == Power::On).then_some(since);
            })
            .unwrap();
    }

    fn reading(temperature: f64, observed_at: DateTime<Utc>) -> SensorReading {
        SensorReading {
            temperature,
            humidity: Some(40.0),
            observed_at,
            is_online: true,
        }
    }

    fn readings(pairs: &[(ZoneId, f64)], at: DateTime<Utc>) -> BTreeMap<ZoneId, SensorReading> {
        pairs.iter().map(|(z, t)| (*z, reading(*t, at))).collect()
    }

    #[test]
    fn hysteresis_heat_and_cool() {
        assert_eq!(hysteresis(HvacMode::Heat, 67.9, 70.0, 4.0, Power::Off).0, Power::On);
        assert_eq!(hysteresis(HvacMode::Heat, 72.1, 70.0, 4.0, Power::On).0, Power::Off);
        assert_eq!(hysteresis(HvacMode::Heat, 69.0, 70.0, 4.0, Power::On).0, Power::On);
        assert_eq!(hysteresis(HvacMode::Heat, 71.0, 70.0, 4.0, Power::Off).0, Power::Off);
        // thresholds themselves are inside the band
        assert_eq!(hysteresis(HvacMode::Heat, 68.0, 70.0, 4.0, Power::Off).1, DecisionReason::WithinBand);

        assert_eq!(hysteresis(HvacMode::Cool, 75.5, 74.0, 2.0, Power::Off).0, Power::On);
        assert_eq!(hysteresis(HvacMode::Cool, 72.5, 74.0, 2.0, Power::On).0, Power::Off);
        assert_eq!(hysteresis(HvacMode::Cool, 74.5, 74.0, 2.0, Power::On).0, Power::On);
    }

    #[test]
    fn night_mode_deadband_hold() {
        // 65°F against a 66°F night setpoint with a 4°F band (64..68): stay off
        let (controller, store) = setup();
        set_home(&store);
        set_night(&store, true);

        let out = controller.tick(t0(), &readings(&[(LIVING, 65.0)], t0())).unwrap();
        let d = out.decision(LIVING).unwrap();
        assert_eq!(d.power, Power::Off);
        assert_eq!(d.setpoint, Some(66.0));
        assert_eq!(d.reason, DecisionReason::WithinBand);
        assert!(!d.power_changed);
    }

    #[test]
    fn safety_override_always_alerts() {
        let (controller, store) = setup();
        set_home(&store);
        force_power(&store, LIVING, Power::On, t0() - TimeDelta::minutes(2));

        let out = controller.tick(t0(), &readings(&[(LIVING, 86.0)], t0())).unwrap();
        let d = out.decision(LIVING).unwrap();
        assert_eq!(d.power, Power::Off);
        assert!(d.power_changed, "safety cutoff ignores dwell time");
        assert_eq!(d.reason, DecisionReason::SafetyLimit);
        let living: Vec<_> = out.alerts.iter().filter(|a| a.location == "Living").collect();
        assert_eq!(living.len(), 1);
        assert_eq!(living[0].kind, AlertKind::SafetyLimit);
        assert_eq!(living[0].priority, Priority::High);

        let later = t0() + TimeDelta::minutes(1);
        let out = controller.tick(later, &readings(&[(LIVING, 86.0)], later)).unwrap();
        assert_eq!(out.decision(LIVING).unwrap().power, Power::Off);
        assert_eq!(
            out.alerts.iter().filter(|a| a.kind == AlertKind::SafetyLimit).count(),
            1,
            "identical safety alert one minute later must still be sent"
        );
    }

    #[test]
    fn safety_hold_latches_until_cleared() {
        let (controller, store) = setup();
        set_home(&store);

        controller.tick(t0(), &readings(&[(LIVING, 39.0)], t0())).unwrap();
        assert!(store.load_zone(LIVING).unwrap().safety_hold);

        // back in range and cold enough to heat, but held off
        let t1 = t0() + TimeDelta::hours(1);
        let out = controller.tick(t1, &readings(&[(LIVING, 60.0)], t1)).unwrap();
        let d = out.decision(LIVING).unwrap();
        assert_eq!((d.power, d.reason), (Power::Off, DecisionReason::SafetyHold));
        assert!(!out.alerts.iter().any(|a| a.location == "Living"));

        assert!(controller.clear_safety_hold(LIVING).unwrap());
        assert!(!controller.clear_safety_hold(LIVING).unwrap());
        let t2 = t1 + TimeDelta::minutes(5);
        let out = controller.tick(t2, &readings(&[(LIVING, 60.0)], t2)).unwrap();
        assert_eq!(out.decision(LIVING).unwrap().power, Power::On);
    }

    #[test]
    fn stale_or_offline_sensor_forces_off_with_rate_limited_alert() {
        let (controller, store) = setup();
        set_home(&store);
        force_power(&store, LIVING, Power::On, t0() - TimeDelta::minutes(1));

        let stale = readings(&[(LIVING, 50.0)], t0() - TimeDelta::minutes(31));
        let out = controller.tick(t0(), &stale).unwrap();
        let d = out.decision(LIVING).unwrap();
        assert_eq!((d.power, d.reason), (Power::Off, DecisionReason::SensorStale));
        assert!(out.alerts.iter().any(|a| a.kind == AlertKind::SensorStale && a.location == "Living"));

        let t1 = t0() + TimeDelta::minutes(5);
        let mut offline = readings(&[(LIVING, 50.0)], t1);
        offline.get_mut(&LIVING).unwrap().is_online = false;
        let out = controller.tick(t1, &offline).unwrap();
        assert_eq!(out.decision(LIVING).unwrap().reason, DecisionReason::SensorOffline);
        assert!(
            !out.alerts.iter().any(|a| a.location == "Living"),
            "second sensor alert inside the cooldown is suppressed"
        );

        // no reading at all for the other zones
        assert_eq!(out.decision(BEDROOM).unwrap().reason, DecisionReason::SensorMissing);
    }

    #[test]
    fn max_run_time_forces_off() {
        let (controller, store) = setup();
        set_home(&store);
        force_power(&store, LIVING, Power::On, t0() - TimeDelta::hours(4));

        let out = controller.tick(t0(), &readings(&[(LIVING, 60.0)], t0())).unwrap();
        let d = out.decision(LIVING).unwrap();
        assert_eq!((d.power, d.reason), (Power::Off, DecisionReason::MaxRunTime));
        assert!(out.alerts.iter().any(|a| a.kind == AlertKind::MaxRunTime));

        // min_off_time keeps it off on the next tick even though it is cold
        let t1 = t0() + TimeDelta::minutes(5);
        let out = controller.tick(t1, &readings(&[(LIVING, 60.0)], t1)).unwrap();
        assert_eq!(out.decision(LIVING).unwrap().reason, DecisionReason::DwellDeferred);
        assert_eq!(store.load_zone(LIVING).unwrap().power, Power::Off);
    }

    #[test]
    fn away_gates_secondaries_and_primary_follows_policy() {
        let (controller, _store) = setup();
        // away: primary uses its reduced setpoint of 62, bedroom is gated off
        let out = controller
            .tick(t0(), &readings(&[(LIVING, 59.0), (BEDROOM, 55.0), (OFFICE, 80.0)], t0()))
            .unwrap();
        let living = out.decision(LIVING).unwrap();
        assert_eq!((living.power, living.setpoint), (Power::On, Some(62.0)));
        let bedroom = out.decision(BEDROOM).unwrap();
        assert_eq!((bedroom.power, bedroom.reason), (Power::Off, DecisionReason::AwayGate));
        assert_eq!(out.decision(OFFICE).unwrap().power, Power::Off);
    }

    fn with_primary_policy(policy: AwayPolicy) -> (ClimateController, Arc<MemoryStore>) {
        setup_with(|settings| {
            for zone in settings.zones.iter_mut().filter(|z| z.role == ZoneRole::Primary) {
                zone.away_policy = policy;
            }
        })
    }

    #[test]
    fn away_policy_off_shuts_primary_down() {
        let (controller, store) = with_primary_policy(AwayPolicy::Off);
        force_power(&store, LIVING, Power::On, t0() - TimeDelta::hours(1));

        let out = controller
            .tick(t0(), &readings(&[(LIVING, 55.0), (BEDROOM, 55.0), (OFFICE, 80.0)], t0()))
            .unwrap();
        let living = out.decision(LIVING).unwrap();
        assert_eq!(
            (living.power, living.setpoint, living.reason),
            (Power::Off, None, DecisionReason::AwayGate)
        );
        assert!(living.power_changed);
        assert_eq!(out.decision(BEDROOM).unwrap().reason, DecisionReason::AwayGate);
        assert_eq!(store.load_zone(LIVING).unwrap().power, Power::Off);
    }

    #[test]
    fn away_policy_maintain_ignores_presence_for_primary_only() {
        let (controller, store) = with_primary_policy(AwayPolicy::Maintain);

        let out = controller
            .tick(t0(), &readings(&[(LIVING, 66.0), (BEDROOM, 55.0), (OFFICE, 80.0)], t0()))
            .unwrap();
        let living = out.decision(LIVING).unwrap();
        assert_eq!(
            (living.power, living.setpoint, living.reason),
            (Power::On, Some(70.0), DecisionReason::BelowBand)
        );
        let bedroom = out.decision(BEDROOM).unwrap();
        assert_eq!((bedroom.power, bedroom.reason), (Power::Off, DecisionReason::AwayGate));
        assert_eq!(out.decision(OFFICE).unwrap().reason, DecisionReason::AwayGate);

        // night setpoint still applies while away
        set_night(&store, true);
        let later = t0() + TimeDelta::minutes(30);
        let out = controller.tick(later, &readings(&[(LIVING, 67.0)], later)).unwrap();
        assert_eq!(out.decision(LIVING).unwrap().setpoint, Some(66.0));
    }

    #[test]
    fn pre_arrival_raises_primary_only() {
        let (controller, store) = setup();
        store.update_presence(&mut |p| p.stage = ArrivalStage::PreArrival).unwrap();

        let out = controller
            .tick(t0(), &readings(&[(LIVING, 66.0), (BEDROOM, 55.0)], t0()))
            .unwrap();
        let living = out.decision(LIVING).unwrap();
        assert_eq!((living.power, living.setpoint), (Power::On, Some(70.0)));
        assert_eq!(out.decision(BEDROOM).unwrap().reason, DecisionReason::AwayGate);
    }

    #[test]
    fn secondaries_mirror_primary_setpoint_when_modes_match() {
        let (controller, store) = setup();
        set_home(&store);
        let out = controller
            .tick(t0(), &readings(&[(LIVING, 69.0), (BEDROOM, 67.5), (OFFICE, 75.5)], t0()))
            .unwrap();
        // bedroom mirrors 70 (band 68..72): 67.5 is below, heat on
        let bedroom = out.decision(BEDROOM).unwrap();
        assert_eq!((bedroom.power, bedroom.setpoint), (Power::On, Some(70.0)));
        assert!(bedroom.setpoint_changed);
        // office cools around its own 74 with a 2° band
        let office = out.decision(OFFICE).unwrap();
        assert_eq!((office.power, office.setpoint), (Power::On, Some(74.0)));
    }

    #[test]
    fn dwell_defers_quick_reversal() {
        let (controller, store) = setup();
        set_home(&store);
        let out = controller.tick(t0(), &readings(&[(LIVING, 60.0)], t0())).unwrap();
        assert!(out.decision(LIVING).unwrap().power_changed);

        let t1 = t0() + TimeDelta::minutes(5);
        let out = controller.tick(t1, &readings(&[(LIVING, 75.0)], t1)).unwrap();
        let d = out.decision(LIVING).unwrap();
        assert_eq!((d.power, d.reason), (Power::On, DecisionReason::DwellDeferred));

        let t2 = t0() + TimeDelta::minutes(15);
        let out = controller.tick(t2, &readings(&[(LIVING, 75.0)], t2)).unwrap();
        assert_eq!(out.decision(LIVING).unwrap().power, Power::Off);
    }

    #[test]
    fn restore_undoes_failed_change_but_keeps_hold() {
        let (controller, store) = setup();
        set_home(&store);
        let before = store.load_zone(LIVING).unwrap();

        let out = controller.tick(t0(), &readings(&[(LIVING, 60.0)], t0())).unwrap();
        let record = &out.zones.iter().find(|z| z.decision.zone_id == LIVING).unwrap().record;
        assert!(controller.restore(record).unwrap());
        assert_eq!(store.load_zone(LIVING).unwrap(), before);

        // once the record moved on, restore is refused
        let t1 = t0() + TimeDelta::minutes(5);
        let out = controller.tick(t1, &readings(&[(LIVING, 60.0)], t1)).unwrap();
        let stale_record = out.zones[0].record.clone();
        controller.tick(t1 + TimeDelta::minutes(20), &readings(&[(LIVING, 75.0)], t1 + TimeDelta::minutes(20))).unwrap();
        assert!(!controller.restore(&stale_record).unwrap());

        // a safety latch set by the failed tick survives
        let t2 = t1 + TimeDelta::hours(1);
        let out = controller.tick(t2, &readings(&[(LIVING, 90.0)], t2)).unwrap();
        let record = out.zones[0].record.clone();
        controller.restore(&record).unwrap();
        assert!(store.load_zone(LIVING).unwrap().safety_hold);
    }

    #[test]
    fn short_cycling_warning_once_per_cooldown() {
        let (mut controller, store) = setup();
        controller.settings.min_off_time_secs = 0;
        controller.settings.min_cycle_time_secs = 0;
        set_home(&store);

        let mut warnings = 0;
        for i in 0..8 {
            let now = t0() + TimeDelta::minutes(i * 5);
            let temp = if i % 2 == 0 { 60.0 } else { 75.0 };
            let out = controller.tick(now, &readings(&[(LIVING, temp)], now)).unwrap();
            warnings += out.alerts.iter().filter(|a| a.kind == AlertKind::ShortCycling).count();
        }
        assert_eq!(warnings, 1);
        assert!(store.load_zone(LIVING).unwrap().cycles_in_current_hour > 3);
    }

    #[test]
    fn cycle_window_resets_after_an_hour() {
        let (controller, store) = setup();
        set_home(&store);
        store
            .update_zone(LIVING, &mut |s| {
                s.cycles_in_current_hour = 5;
                s.cycle_window_started_at = t0() - TimeDelta::minutes(61);
            })
            .unwrap();
        controller.tick(t0(), &readings(&[(LIVING, 60.0)], t0())).unwrap();
        let state = store.load_zone(LIVING).unwrap();
        assert_eq!(state.cycles_in_current_hour, 1);
        assert_eq!(state.cycle_window_started_at, t0());
    }

    proptest! {
        /// Readings strictly inside the band never flip power.
        #[test]
        fn no_chatter_inside_band(
            temps in proptest::collection::vec(68.01f64..71.99, 1..40),
            start_on in any::<bool>(),
        ) {
            let (controller, store) = setup();
            set_home(&store);
            let start = if start_on { Power::On } else { Power::Off };
            force_power(&store, LIVING, start, t0() - TimeDelta::minutes(1));

            for (i, t) in temps.iter().enumerate() {
                let now = t0() + TimeDelta::minutes(i as i64 * 5);
                let out = controller.tick(now, &readings(&[(LIVING, *t)], now)).unwrap();
                let d = out.decision(LIVING).unwrap();
                prop_assert_eq!(d.power, start);
                prop_assert!(!d.power_changed);
            }
        }

        /// Consecutive power changes respect min_off_time / min_cycle_time.
        #[test]
        fn dwell_is_enforced(
            steps in proptest::collection::vec((45.0f64..84.0, 1i64..20), 1..60),
        ) {
            let (controller, store) = setup();
            set_home(&store);
            let settings = controller.settings().clone();

            let mut now = t0();
            let mut last_change: Option<(DateTime<Utc>, Power)> = None;
            for (temp, gap_mins) in steps {
                now += TimeDelta::minutes(gap_mins);
                let out = controller.tick(now, &readings(&[(LIVING, temp)], now)).unwrap();
                let d = out.decision(LIVING).unwrap();
                if d.power_changed {
                    if let Some((at, _)) = last_change {
                        let min = match d.power {
                            Power::On => settings.min_off_time(),
                            Power::Off => settings.min_cycle_time(),
                        };
                        prop_assert!(now - at >= min, "change after {:?}, min {:?}", now - at, min);
                    }
                    last_change = Some((now, d.power));
                }
            }
        }

        /// A stale reading means OFF whatever the temperature or setpoint.
        #[test]
        fn stale_reading_is_fail_safe(
            temp in -20.0f64..120.0,
            extra_age_secs in 1i64..86_400,
            night in any::<bool>(),
        ) {
            let (controller, store) = setup();
            set_home(&store);
            set_night(&store, night);
            force_power(&store, LIVING, Power::On, t0() - TimeDelta::minutes(1));

            let age = controller.settings().max_sensor_age() + TimeDelta::seconds(extra_age_secs);
            let out = controller.tick(t0(), &readings(&[(LIVING, temp)], t0() - age)).unwrap();
            let d = out.decision(LIVING).unwrap();
            prop_assert_eq!(d.power, Power::Off);
            prop_assert_eq!(d.reason, DecisionReason::SensorStale);
            prop_assert!(!store.load_zone(LIVING).unwrap().safety_hold);
        }
    }
}
