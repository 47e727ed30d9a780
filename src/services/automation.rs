//! Runs the capability calls behind presence intents and reports what
//! happened as one summary notification.
//!
//! Actions that succeed stay applied when a later one fails; the summary lists
//! every outcome and is raised to HIGH priority on partial failure.

use crate::config::DailyWindow;
use crate::device::{ClimateDevices, DeviceError, HomePresencePort, LightPort};
use crate::engine::climate::{ClimateController, Target};
use crate::models::automation::{ComfortMode, Intent, PresenceRecord, Priority};
use crate::models::tado::{HomePresence, TemperatureUnit, ZoneId};
use crate::notify::Notifier;
use chrono::NaiveTime;
use log::{debug, info, warn};
use std::collections::BTreeSet;

#[derive(Clone, Copy)]
pub struct Ports<'a> {
    pub climate: &'a dyn ClimateDevices,
    pub presence: Option<&'a dyn HomePresencePort>,
    pub light: Option<&'a dyn LightPort>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutcome {
    /// Zone or device the action was aimed at.
    pub subject: String,
    /// Summary line when it worked, e.g. `Living → 21.0°C`.
    pub done: String,
    pub result: Result<(), DeviceError>,
}

impl ActionOutcome {
    pub fn line(&self) -> String {
        match &self.result {
            Ok(()) => self.done.clone(),
            Err(e) => format!("{}: FAILED ({})", self.subject, e),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AutomationReport {
    pub title: &'static str,
    pub actions: Vec<ActionOutcome>,
}

impl AutomationReport {
    pub fn failures(&self) -> usize {
        self.actions.iter().filter(|a| a.result.is_err()).count()
    }

    pub fn priority(&self) -> Priority {
        if self.failures() > 0 { Priority::High } else { Priority::Normal }
    }

    pub fn body(&self) -> String {
        if self.actions.is_empty() {
            return "No actions needed".to_string();
        }
        self.actions.iter().map(|a| a.line()).collect::<Vec<_>>().join("\n")
    }
}

fn title_for(intents: &[Intent]) -> Option<&'static str> {
    if intents.iter().any(|i| matches!(i, Intent::FullArrival { .. })) {
        Some("Arrived Home")
    } else if intents.contains(&Intent::Departure { aborted_arrival: false }) {
        Some("Left Home")
    } else if intents.contains(&Intent::Departure { aborted_arrival: true }) {
        Some("Arrival Aborted")
    } else if intents.contains(&Intent::PreCondition) {
        Some("Arriving")
    } else {
        None
    }
}

pub struct IntentExecutor<'a> {
    controller: &'a ClimateController,
    ports: Ports<'a>,
    notifier: &'a dyn Notifier,
    dark_window: DailyWindow,
    unit: TemperatureUnit,
}

/// Per-batch bookkeeping so stage 1 and stage 2 in one batch do not push the
/// same zone twice.
struct Batch<'r> {
    presence: &'r PresenceRecord,
    comfort: &'r ComfortMode,
    local_time: NaiveTime,
    pushed: BTreeSet<ZoneId>,
    actions: Vec<ActionOutcome>,
}

impl<'a> IntentExecutor<'a> {
    pub fn new(
        controller: &'a ClimateController,
        ports: Ports<'a>,
        notifier: &'a dyn Notifier,
        dark_window: DailyWindow,
        unit: TemperatureUnit,
    ) -> Self {
        IntentExecutor {
            controller,
            ports,
            notifier,
            dark_window,
            unit,
        }
    }

    /// Execute a batch of intents against the already committed presence
    /// record. Returns `None` for a pure no-op batch.
    pub fn execute(
        &self,
        intents: &[Intent],
        presence: &PresenceRecord,
        comfort: &ComfortMode,
        local_time: NaiveTime,
    ) -> Option<AutomationReport> {
        let title = title_for(intents)?;
        let mut batch = Batch {
            presence,
            comfort,
            local_time,
            pushed: BTreeSet::new(),
            actions: Vec::new(),
        };

        for intent in intents {
            match *intent {
                Intent::PreCondition => self.precondition(&mut batch),
                Intent::FullArrival { skip_precondition } => {
                    if !skip_precondition {
                        self.precondition(&mut batch);
                    }
                    self.full_arrival(&mut batch);
                }
                Intent::Departure { aborted_arrival } => self.departure(&mut batch, aborted_arrival),
                Intent::NoOp => {}
            }
        }

        let report = AutomationReport {
            title,
            actions: batch.actions,
        };
        let failures = report.failures();
        if failures > 0 {
            warn!(
                "{}: {} of {} action(s) failed",
                report.title,
                failures,
                report.actions.len()
            );
        } else {
            info!("{}: {} action(s) applied", report.title, report.actions.len());
        }
        self.notifier.send(report.title, &report.body(), report.priority());
        Some(report)
    }

    fn precondition(&self, batch: &mut Batch<'_>) {
        let targets = self.controller.targets(batch.presence, batch.comfort);
        if let Some(primary) = self.controller.settings().primary()
            && let Some((_, target)) = targets.iter().find(|(id, _)| *id == primary.id)
        {
            self.push_target(batch, primary.id, &primary.name, *target);
        }
        if self.dark_window.contains(batch.local_time) {
            self.light(batch, true);
        } else {
            debug!("Exterior light left alone outside the dark window");
        }
    }

    fn full_arrival(&self, batch: &mut Batch<'_>) {
        for (zone_id, target) in self.controller.targets(batch.presence, batch.comfort) {
            let Some(zone) = self.controller.settings().zone(zone_id) else {
                continue;
            };
            self.push_target(batch, zone_id, &zone.name, target);
        }
        self.home_presence(batch, HomePresence::Home);
    }

    fn departure(&self, batch: &mut Batch<'_>, aborted_arrival: bool) {
        if !aborted_arrival {
            self.home_presence(batch, HomePresence::Away);
        }
        let primary_id = self.controller.settings().primary().map(|p| p.id);
        for (zone_id, target) in self.controller.targets(batch.presence, batch.comfort) {
            // Only the primary zone was touched by pre-conditioning.
            if aborted_arrival && Some(zone_id) != primary_id {
                continue;
            }
            let Some(zone) = self.controller.settings().zone(zone_id) else {
                continue;
            };
            self.push_target(batch, zone_id, &zone.name, target);
        }
        self.light(batch, false);
    }

    fn push_target(&self, batch: &mut Batch<'_>, zone_id: ZoneId, name: &str, target: Target) {
        if !batch.pushed.insert(zone_id) {
            return;
        }
        let outcome = match target {
            Target::Setpoint(value) => ActionOutcome {
                subject: name.to_string(),
                done: format!("{} → {:.1}{}", name, value, self.unit.symbol()),
                result: self.ports.climate.set_target_temperature(zone_id, value),
            },
            // Power stays with the controller; the next tick gates the zone off.
            Target::Off => ActionOutcome {
                subject: name.to_string(),
                done: format!("{} off", name),
                result: Ok(()),
            },
        };
        if let Err(e) = &outcome.result {
            warn!("Setting target for {} failed: {}", name, e);
        }
        batch.actions.push(outcome);
    }

    fn light(&self, batch: &mut Batch<'_>, on: bool) {
        let Some(light) = self.ports.light else {
            return;
        };
        let result = light.set_light(on);
        if let Err(e) = &result {
            warn!("Exterior light {} failed: {}", if on { "on" } else { "off" }, e);
        }
        batch.actions.push(ActionOutcome {
            subject: "Exterior light".to_string(),
            done: format!("Exterior light {}", if on { "on" } else { "off" }),
            result,
        });
    }

    fn home_presence(&self, batch: &mut Batch<'_>, presence: HomePresence) {
        let Some(port) = self.ports.presence else {
            return;
        };
        let label = match presence {
            HomePresence::Home => "HOME",
            HomePresence::Away => "AWAY",
        };
        let result = port.set_home_presence(presence);
        if let Err(e) = &result {
            warn!("Setting Tado presence to {} failed: {}", label, e);
        }
        batch.actions.push(ActionOutcome {
            subject: "Tado presence".to_string(),
            done: format!("Tado presence {}", label),
            result,
        });
    }
}
