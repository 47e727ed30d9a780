//! Single consumer of the trigger channel: presence events, ticks, and manual
//! commands are handled strictly one at a time.

use crate::config::DailyWindow;
use crate::engine::alerts::AlertLimiter;
use crate::engine::climate::ClimateController;
use crate::engine::presence::PresenceMachine;
use crate::models::automation::{Alert, AlertKind, Intent, PresenceEvent, Priority};
use crate::notify::Notifier;
use crate::services::automation::IntentExecutor;
use crate::services::climate::ClimateRunner;
use crate::services::schedule::apply_night_schedule;
use crate::services::triggers::Trigger;
use crate::store::StateStore;
use crate::utils::local_time_of_day;
use chrono::{DateTime, NaiveTime, Utc};
use log::{error, info, warn};
use std::sync::Arc;
use std::sync::mpsc::Receiver;

pub struct Dispatcher<'a> {
    store: Arc<dyn StateStore>,
    presence: PresenceMachine,
    controller: &'a ClimateController,
    runner: ClimateRunner<'a>,
    executor: IntentExecutor<'a>,
    limiter: AlertLimiter,
    notifier: &'a dyn Notifier,
    night_window: DailyWindow,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        store: Arc<dyn StateStore>,
        controller: &'a ClimateController,
        runner: ClimateRunner<'a>,
        executor: IntentExecutor<'a>,
        notifier: &'a dyn Notifier,
        night_window: DailyWindow,
    ) -> Self {
        Dispatcher {
            presence: PresenceMachine::new(store.clone()),
            limiter: AlertLimiter::new(store.clone()),
            store,
            controller,
            runner,
            executor,
            notifier,
            night_window,
        }
    }

    /// Blocks until every sender is gone.
    pub fn run(&self, rx: Receiver<Trigger>) {
        info!("Dispatcher started");
        for trigger in rx {
            let now = Utc::now();
            self.handle(trigger, now, local_time_of_day(now));
        }
        info!("All trigger sources closed; dispatcher stopping");
    }

    pub fn handle(&self, trigger: Trigger, now: DateTime<Utc>, local_time: NaiveTime) {
        match trigger {
            Trigger::Tick => self.tick(now, local_time),
            Trigger::Presence(event) => {
                if let Err(e) = self.presence_event(event, now, local_time) {
                    self.automation_failure("presence", &e, now);
                }
            }
            Trigger::ClearSafetyHold { zone } => self.clear_safety_hold(&zone),
        }
    }

    fn tick(&self, now: DateTime<Utc>, local_time: NaiveTime) {
        if let Err(e) = apply_night_schedule(self.store.as_ref(), &self.night_window, local_time, now) {
            warn!("Night schedule not applied: {}", e);
        }
        if let Err(e) = self.runner.run_tick(now) {
            self.automation_failure("climate", &e, now);
        }
    }

    fn presence_event(&self, event: PresenceEvent, now: DateTime<Utc>, local_time: NaiveTime) -> Result<(), String> {
        // 1) Commit the transition
        let intents = self
            .presence
            .on_event(event, now)
            .map_err(|e| format!("presence event {} not recorded: {}", event, e))?;
        if intents == [Intent::NoOp] {
            return Ok(());
        }

        // 2) Act on it
        let record = self.presence.current().map_err(|e| format!("presence reload failed: {}", e))?;
        let comfort = self
            .store
            .load_comfort_mode()
            .map_err(|e| format!("comfort mode load failed: {}", e))?;
        self.executor.execute(&intents, &record, &comfort, local_time);

        // 3) Let the presence gate take effect now rather than on the next scheduled tick
        self.runner
            .run_tick(now)
            .map_err(|e| format!("post-{} tick: {}", event, e))?;
        Ok(())
    }

    fn clear_safety_hold(&self, zone_name: &str) {
        let Some(zone) = self.controller.settings().zone_by_name(zone_name) else {
            warn!("clear_safety_hold: no zone named {:?}", zone_name);
            return;
        };
        match self.controller.clear_safety_hold(zone.id) {
            Ok(true) => self.notifier.send(
                &format!("Safety hold cleared: {}", zone.name),
                "Normal control resumes next tick",
                Priority::Normal,
            ),
            Ok(false) => info!("clear_safety_hold: {} was not held", zone.name),
            Err(e) => warn!("clear_safety_hold for {} failed: {}", zone.name, e),
        }
    }

    fn automation_failure(&self, location: &str, message: &str, now: DateTime<Utc>) {
        error!("{}", message);
        let alert = Alert {
            kind: AlertKind::AutomationFailure,
            location: location.to_string(),
            priority: Priority::High,
            title: "Automation failure".to_string(),
            body: message.to_string(),
        };
        let cooldown = self.controller.settings().alert_cooldown();
        match self.limiter.try_acquire(alert.kind, &alert.location, cooldown, now) {
            Ok(true) => self.notifier.send_alert(&alert),
            Ok(false) => {}
            // the store is the likely culprit; tell someone regardless
            Err(_) => self.notifier.send_alert(&alert),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::load_fixture;
    use crate::device::fakes::{Call, FakeDevices};
    use crate::models::automation::{PresenceState, SensorReading};
    use crate::models::tado::{Power, TemperatureUnit, ZoneId};
    use crate::notify::fakes::RecordingNotifier;
    use crate::services::automation::Ports;
    use crate::store::MemoryStore;
    use chrono::{TimeDelta, TimeZone};

    const LIVING: ZoneId = ZoneId(1);
    const BEDROOM: ZoneId = ZoneId(2);

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 20, 18, 0, 0).unwrap()
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn night() -> DailyWindow {
        DailyWindow {
            start: hm(22, 30),
            end: hm(6, 30),
        }
    }

    fn reading(temperature: f64, at: DateTime<Utc>) -> SensorReading {
        SensorReading {
            temperature,
            humidity: None,
            observed_at: at,
            is_online: true,
        }
    }

    fn with_dispatcher(f: impl FnOnce(&Dispatcher<'_>, &Arc<MemoryStore>, &FakeDevices, &RecordingNotifier)) {
        let settings = load_fixture();
        let store = Arc::new(MemoryStore::new());
        let ids: Vec<_> = settings.zones.iter().map(|z| z.id).collect();
        store.initialize(&ids, t0() - TimeDelta::hours(3)).unwrap();
        let controller = ClimateController::new(settings, TemperatureUnit::Fahrenheit, store.clone());
        let devices = FakeDevices::default();
        let notifier = RecordingNotifier::default();
        let ports = Ports {
            climate: &devices,
            presence: Some(&devices),
            light: None,
        };
        let runner = ClimateRunner::new(&controller, &devices, &notifier);
        let executor = IntentExecutor::new(&controller, ports, &notifier, night(), TemperatureUnit::Fahrenheit);
        let dispatcher = Dispatcher::new(store.clone(), &controller, runner, executor, &notifier, night());
        f(&dispatcher, &store, &devices, &notifier);
    }

    #[test]
    fn arrival_applies_gate_immediately() {
        with_dispatcher(|d, store, devices, notifier| {
            devices.set_reading(LIVING, reading(69.0, t0()));
            devices.set_reading(BEDROOM, reading(64.0, t0()));
            devices.set_reading(ZoneId(3), reading(74.0, t0()));

            d.handle(Trigger::Tick, t0(), hm(18, 0));
            assert!(!devices.calls().contains(&Call::Power(BEDROOM, Power::On)), "gated while away");

            d.handle(Trigger::Presence(PresenceEvent::NetworkAssociate), t0(), hm(18, 0));
            assert_eq!(store.load_presence().unwrap().state, PresenceState::Home);
            assert!(devices.calls().contains(&Call::Power(BEDROOM, Power::On)));
            assert_eq!(notifier.sent().last().unwrap().title, "Arrived Home");
        });
    }

    #[test]
    fn ticks_drive_night_mode() {
        with_dispatcher(|d, store, devices, _| {
            devices.set_reading(LIVING, reading(69.0, t0()));
            d.handle(Trigger::Tick, t0(), hm(23, 0));
            assert!(store.load_comfort_mode().unwrap().night_mode);
            d.handle(Trigger::Tick, t0(), hm(7, 0));
            assert!(!store.load_comfort_mode().unwrap().night_mode);
        });
    }

    #[test]
    fn clear_safety_hold_by_zone_name() {
        with_dispatcher(|d, store, _, notifier| {
            store.update_zone(LIVING, &mut |s| s.safety_hold = true).unwrap();
            d.handle(
                Trigger::ClearSafetyHold {
                    zone: "Kitchen".to_string(),
                },
                t0(),
                hm(12, 0),
            );
            assert!(store.load_zone(LIVING).unwrap().safety_hold);

            d.handle(
                Trigger::ClearSafetyHold {
                    zone: "Living".to_string(),
                },
                t0(),
                hm(12, 0),
            );
            assert!(!store.load_zone(LIVING).unwrap().safety_hold);
            assert_eq!(notifier.sent().last().unwrap().title, "Safety hold cleared: Living");
        });
    }

    #[test]
    fn store_failure_raises_one_automation_alert() {
        // presence record never created
        let settings = load_fixture();
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let controller = ClimateController::new(settings, TemperatureUnit::Fahrenheit, store.clone());
        let devices = FakeDevices::default();
        let notifier = RecordingNotifier::default();
        let ports = Ports {
            climate: &devices,
            presence: None,
            light: None,
        };
        let runner = ClimateRunner::new(&controller, &devices, &notifier);
        let executor = IntentExecutor::new(&controller, ports, &notifier, night(), TemperatureUnit::Fahrenheit);
        let d = Dispatcher::new(store, &controller, runner, executor, &notifier, night());

        d.handle(Trigger::Presence(PresenceEvent::GeofenceEnter), t0(), hm(18, 0));
        d.handle(Trigger::Presence(PresenceEvent::GeofenceEnter), t0() + TimeDelta::minutes(1), hm(18, 1));
        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].title, "Automation failure");
        assert_eq!(sent[0].priority, Priority::High);
    }
}
