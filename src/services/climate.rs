//! One controller tick against real devices: read sensors, decide, apply,
//! and deliver whatever alerts got past the rate limiter.

use crate::device::{ClimateDevices, DeviceError};
use crate::engine::climate::{ClimateController, ZoneOutcome};
use crate::models::automation::SensorReading;
use crate::models::tado::{Power, ZoneId};
use crate::notify::Notifier;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::BTreeMap;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickSummary {
    pub zones: usize,
    pub changed: usize,
    pub failed: usize,
    pub alerts: usize,
}

pub struct ClimateRunner<'a> {
    controller: &'a ClimateController,
    devices: &'a dyn ClimateDevices,
    notifier: &'a dyn Notifier,
}

impl<'a> ClimateRunner<'a> {
    pub fn new(controller: &'a ClimateController, devices: &'a dyn ClimateDevices, notifier: &'a dyn Notifier) -> Self {
        ClimateRunner {
            controller,
            devices,
            notifier,
        }
    }

    fn read_sensors(&self) -> BTreeMap<ZoneId, SensorReading> {
        let mut readings = BTreeMap::new();
        for zone in &self.controller.settings().zones {
            match self.devices.read_sensor(zone.id) {
                Ok(reading) => {
                    readings.insert(zone.id, reading);
                }
                Err(e) => warn!("Reading sensor for {} failed: {}", zone.name, e),
            }
        }
        readings
    }

    /// Setpoint goes out before a power-on so the zone starts at the right target.
    fn apply(&self, outcome: &ZoneOutcome) -> Result<bool, DeviceError> {
        let d = &outcome.decision;
        let mut touched = false;
        if d.setpoint_changed
            && d.power == Power::On
            && let Some(setpoint) = d.setpoint
        {
            self.devices.set_target_temperature(d.zone_id, setpoint)?;
            touched = true;
        }
        if d.power_changed {
            self.devices.set_power(d.zone_id, d.power)?;
            touched = true;
        }
        Ok(touched)
    }

    pub fn run_tick(&self, now: DateTime<Utc>) -> Result<TickSummary, String> {
        let readings = self.read_sensors();
        let outcome = self
            .controller
            .tick(now, &readings)
            .map_err(|e| format!("climate tick failed: {}", e))?;

        let mut summary = TickSummary {
            zones: outcome.zones.len(),
            ..TickSummary::default()
        };
        for zone in &outcome.zones {
            match self.apply(zone) {
                Ok(true) => summary.changed += 1,
                Ok(false) => {}
                Err(e) => {
                    summary.failed += 1;
                    warn!(
                        "Applying {} to zone {} failed ({}); will retry next tick",
                        zone.decision.power, zone.decision.zone_id, e
                    );
                    match self.controller.restore(&zone.record) {
                        Ok(true) => debug!("Zone {} record restored", zone.decision.zone_id),
                        Ok(false) => debug!("Zone {} record moved on; not restored", zone.decision.zone_id),
                        Err(e) => warn!("Restoring zone {} record failed: {}", zone.decision.zone_id, e),
                    }
                }
            }
        }

        for alert in &outcome.alerts {
            self.notifier.send_alert(alert);
        }
        summary.alerts = outcome.alerts.len();

        if summary.changed > 0 || summary.failed > 0 || summary.alerts > 0 {
            info!(
                "Tick: {} zone(s), {} changed, {} failed, {} alert(s)",
                summary.zones, summary.changed, summary.failed, summary.alerts
            );
        } else {
            debug!("Tick: {} zone(s), nothing to do", summary.zones);
        }
        Ok(summary)
    }
}
