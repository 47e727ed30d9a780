//! Trigger sources. Each runs on its own thread and feeds the dispatcher
//! through one channel; a source stops when the dispatcher hangs up.

use crate::client::TadoClient;
use crate::models::automation::PresenceEvent;
use crate::models::tado::{HomeId, MobileDevice, MobileDeviceId};
use log::{debug, info, warn};
use serde::Deserialize;
use std::io::BufRead;
use std::sync::mpsc::Sender;
use std::thread;
use std::time::{Duration, Instant};

pub const GEOFENCE_POLL_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    Presence(PresenceEvent),
    Tick,
    ClearSafetyHold { zone: String },
}

#[derive(Debug, Deserialize)]
struct Coordinates {
    lat: f64,
    lon: f64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTrigger {
    event_type: String,
    #[serde(default)]
    coordinates: Option<Coordinates>,
    #[serde(default)]
    zone: Option<String>,
}

/// One JSON line, e.g. `{"event_type":"geofence_enter","coordinates":{"lat":46.05,"lon":14.5}}`.
/// Blank lines and `#` comments yield `Ok(None)`.
pub fn parse_trigger_line(line: &str) -> Result<Option<Trigger>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let de = &mut serde_json::Deserializer::from_str(line);
    let raw: RawTrigger = serde_path_to_error::deserialize(de).map_err(|e| format!("invalid trigger at {}", e))?;
    if let Some(c) = &raw.coordinates {
        debug!("Trigger {} at ({:.4}, {:.4})", raw.event_type, c.lat, c.lon);
    }

    let trigger = match raw.event_type.as_str() {
        "geofence_enter" => Trigger::Presence(PresenceEvent::GeofenceEnter),
        "geofence_exit" => Trigger::Presence(PresenceEvent::GeofenceExit),
        "network_associate" => Trigger::Presence(PresenceEvent::NetworkAssociate),
        "network_disassociate" => Trigger::Presence(PresenceEvent::NetworkDisassociate),
        "tick" => Trigger::Tick,
        "clear_safety_hold" => Trigger::ClearSafetyHold {
            zone: raw
                .zone
                .ok_or_else(|| "clear_safety_hold requires a zone".to_string())?,
        },
        other => return Err(format!("unknown event_type: {}", other)),
    };
    Ok(Some(trigger))
}

/// Forward triggers from a line-oriented reader (stdin or a file/FIFO) until
/// EOF. Bad lines are logged and skipped.
pub fn read_lines<R: BufRead>(reader: R, origin: &str, tx: &Sender<Trigger>) {
    for (index, line) in reader.lines().enumerate() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                warn!("{}: read failed at line {}: {}", origin, index + 1, e);
                break;
            }
        };
        match parse_trigger_line(&line) {
            Ok(Some(trigger)) => {
                if tx.send(trigger).is_err() {
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => warn!("{}:{}: {}", origin, index + 1, e),
        }
    }
    info!("Trigger source {} reached end of input", origin);
}

/// Turns mobile device locations into geofence edges.
#[derive(Debug, Default)]
pub struct GeofenceTracker {
    devices: Vec<MobileDeviceId>,
    last_home: Option<bool>,
}

impl GeofenceTracker {
    /// An empty list tracks every device with geo-tracking enabled.
    pub fn new(devices: Vec<MobileDeviceId>) -> Self {
        GeofenceTracker {
            devices,
            last_home: None,
        }
    }

    fn tracked(&self, device: &MobileDevice) -> bool {
        match device.id {
            Some(id) if !self.devices.is_empty() => self.devices.contains(&id),
            Some(_) => device
                .settings
                .as_ref()
                .and_then(|s| s.geo_tracking_enabled)
                .unwrap_or(false),
            None => false,
        }
    }

    /// Anyone at home counts as home. Stale locations are ignored; with no
    /// usable location nothing changes. The first observation always emits,
    /// and the presence machine turns it into a no-op when it already agrees.
    pub fn observe(&mut self, devices: &[MobileDevice]) -> Option<PresenceEvent> {
        let fresh: Vec<bool> = devices
            .iter()
            .filter(|d| self.tracked(d))
            .filter_map(|d| d.location.as_ref())
            .filter(|l| !l.stale.unwrap_or(false))
            .filter_map(|l| l.at_home)
            .collect();
        if fresh.is_empty() {
            return None;
        }
        let home = fresh.iter().any(|h| *h);
        if self.last_home == Some(home) {
            return None;
        }
        self.last_home = Some(home);
        Some(if home {
            PresenceEvent::GeofenceEnter
        } else {
            PresenceEvent::GeofenceExit
        })
    }
}

pub fn poll_geofence(client: &TadoClient, home_id: HomeId, mut tracker: GeofenceTracker, tx: &Sender<Trigger>) {
    loop {
        let tick_start = Instant::now();

        match client.get_mobile_devices(home_id) {
            Ok(devices) => {
                if let Some(event) = tracker.observe(&devices) {
                    info!("Geofence poller: {}", event);
                    if tx.send(Trigger::Presence(event)).is_err() {
                        return;
                    }
                }
            }
            Err(e) => warn!("Geofence poll failed: {}", e),
        }

        let elapsed = tick_start.elapsed();
        if elapsed < GEOFENCE_POLL_INTERVAL {
            thread::sleep(GEOFENCE_POLL_INTERVAL - elapsed);
        }
    }
}

/// Steady-cadence controller ticks, the first one immediately.
pub fn schedule_ticks(interval: Duration, tx: &Sender<Trigger>) {
    loop {
        let tick_start = Instant::now();
        if tx.send(Trigger::Tick).is_err() {
            return;
        }
        let elapsed = tick_start.elapsed();
        if elapsed < interval {
            thread::sleep(interval - elapsed);
        }
    }
}
