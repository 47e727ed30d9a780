//! Presence state machine.
//!
//! Turns geofence and local-network signals into a two-stage arrival:
//! a wide-radius geofence crossing pre-conditions the home, a network join
//! completes the arrival. A network join without a preceding geofence emits
//! both stages so the end state does not depend on which signals fired.
//!
//! The record is committed before any intent is acted on and is never rolled
//! back if those actions fail.

use crate::models::automation::{ArrivalStage, Intent, PresenceEvent, PresenceRecord, PresenceState};
use crate::store::{StateStore, StoreError};
use chrono::{DateTime, Utc};
use log::{debug, info};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub state: PresenceState,
    pub stage: ArrivalStage,
    pub intents: Vec<Intent>,
}

/// Transition table. `None` means the event does not move `(state, stage)`.
pub fn step(state: PresenceState, stage: ArrivalStage, event: PresenceEvent) -> Option<Step> {
    use ArrivalStage as S;
    use PresenceEvent as E;
    use PresenceState as P;

    let (state, stage, intents) = match (state, stage, event) {
        (P::Away, S::None, E::GeofenceEnter) => (P::Away, S::PreArrival, vec![Intent::PreCondition]),
        (P::Away, S::None, E::NetworkAssociate) => (
            P::Home,
            S::Arrived,
            vec![
                Intent::PreCondition,
                Intent::FullArrival {
                    skip_precondition: true,
                },
            ],
        ),
        (P::Away, S::PreArrival, E::NetworkAssociate) => (
            P::Home,
            S::Arrived,
            vec![Intent::FullArrival {
                skip_precondition: true,
            }],
        ),
        (P::Away, S::PreArrival, E::GeofenceExit) => (
            P::Away,
            S::None,
            vec![Intent::Departure {
                aborted_arrival: true,
            }],
        ),
        (P::Home, _, E::GeofenceExit | E::NetworkDisassociate) => (
            P::Away,
            S::None,
            vec![Intent::Departure {
                aborted_arrival: false,
            }],
        ),
        _ => return None,
    };
    Some(Step { state, stage, intents })
}

pub struct PresenceMachine {
    store: Arc<dyn StateStore>,
}

impl PresenceMachine {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        PresenceMachine { store }
    }

    pub fn current(&self) -> Result<PresenceRecord, StoreError> {
        self.store.load_presence()
    }

    /// Apply one event. Returns `[NoOp]` when nothing changed; repeated
    /// geofence signals near the boundary land here.
    pub fn on_event(&self, event: PresenceEvent, now: DateTime<Utc>) -> Result<Vec<Intent>, StoreError> {
        let mut intents = Vec::new();
        let transition = self.store.update_presence(&mut |rec| {
            intents.clear();
            if let Some(next) = step(rec.state, rec.stage, event) {
                rec.state = next.state;
                rec.stage = next.stage;
                rec.updated_at = now;
                intents = next.intents;
            }
        })?;

        if intents.is_empty() {
            debug!(
                "Presence: {} ignored in {:?}/{:?}",
                event, transition.after.state, transition.after.stage
            );
            return Ok(vec![Intent::NoOp]);
        }

        info!(
            "Presence: {} moved {:?}/{:?} -> {:?}/{:?} ({} intent(s))",
            event,
            transition.before.state,
            transition.before.stage,
            transition.after.state,
            transition.after.stage,
            intents.len()
        );
        Ok(intents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn machine() -> PresenceMachine {
        let store = Arc::new(MemoryStore::new());
        store.initialize(&[], t0()).unwrap();
        PresenceMachine::new(store)
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 17, 30, 0).unwrap()
    }

    fn position(m: &PresenceMachine) -> (PresenceState, ArrivalStage) {
        let rec = m.current().unwrap();
        (rec.state, rec.stage)
    }

    #[test]
    fn two_stage_arrival() {
        let m = machine();

        let intents = m.on_event(PresenceEvent::GeofenceEnter, t0()).unwrap();
        assert_eq!(intents, vec![Intent::PreCondition]);
        assert_eq!(position(&m), (PresenceState::Away, ArrivalStage::PreArrival));

        let intents = m.on_event(PresenceEvent::NetworkAssociate, t0()).unwrap();
        assert_eq!(
            intents,
            vec![Intent::FullArrival {
                skip_precondition: true
            }]
        );
        assert_eq!(position(&m), (PresenceState::Home, ArrivalStage::Arrived));
    }

    #[test]
    fn network_only_arrival_emits_both_stages_in_order() {
        let m = machine();
        let intents = m.on_event(PresenceEvent::NetworkAssociate, t0()).unwrap();
        assert_eq!(
            intents,
            vec![
                Intent::PreCondition,
                Intent::FullArrival {
                    skip_precondition: true
                }
            ]
        );
        assert_eq!(position(&m), (PresenceState::Home, ArrivalStage::Arrived));
    }

    #[test]
    fn repeated_geofence_is_noop() {
        let m = machine();
        m.on_event(PresenceEvent::GeofenceEnter, t0()).unwrap();
        let before = m.current().unwrap();
        let later = t0() + chrono::TimeDelta::minutes(3);
        assert_eq!(m.on_event(PresenceEvent::GeofenceEnter, later).unwrap(), vec![Intent::NoOp]);
        assert_eq!(m.current().unwrap(), before, "updated_at must not move on a no-op");
    }

    #[test]
    fn departure_from_home_by_either_signal() {
        for event in [PresenceEvent::GeofenceExit, PresenceEvent::NetworkDisassociate] {
            let m = machine();
            m.on_event(PresenceEvent::NetworkAssociate, t0()).unwrap();
            let intents = m.on_event(event, t0()).unwrap();
            assert_eq!(
                intents,
                vec![Intent::Departure {
                    aborted_arrival: false
                }]
            );
            assert_eq!(position(&m), (PresenceState::Away, ArrivalStage::None));

            // the other signal arriving late is a no-op
            assert_eq!(m.on_event(PresenceEvent::GeofenceExit, t0()).unwrap(), vec![Intent::NoOp]);
            assert_eq!(m.on_event(PresenceEvent::NetworkDisassociate, t0()).unwrap(), vec![Intent::NoOp]);
        }
    }

    #[test]
    fn leaving_geofence_before_arriving_aborts_preconditioning() {
        let m = machine();
        m.on_event(PresenceEvent::GeofenceEnter, t0()).unwrap();
        let intents = m.on_event(PresenceEvent::GeofenceExit, t0()).unwrap();
        assert_eq!(
            intents,
            vec![Intent::Departure {
                aborted_arrival: true
            }]
        );
        assert_eq!(position(&m), (PresenceState::Away, ArrivalStage::None));
    }

    #[test]
    fn events_while_away_without_arrival_are_noops() {
        let m = machine();
        assert_eq!(m.on_event(PresenceEvent::GeofenceExit, t0()).unwrap(), vec![Intent::NoOp]);
        assert_eq!(m.on_event(PresenceEvent::NetworkDisassociate, t0()).unwrap(), vec![Intent::NoOp]);
        assert_eq!(position(&m), (PresenceState::Away, ArrivalStage::None));
    }

    fn arb_arrival_signal() -> impl Strategy<Value = PresenceEvent> {
        prop_oneof![Just(PresenceEvent::GeofenceEnter), Just(PresenceEvent::NetworkAssociate)]
    }

    fn arb_event() -> impl Strategy<Value = PresenceEvent> {
        prop_oneof![
            Just(PresenceEvent::GeofenceEnter),
            Just(PresenceEvent::GeofenceExit),
            Just(PresenceEvent::NetworkAssociate),
            Just(PresenceEvent::NetworkDisassociate),
        ]
    }

    proptest! {
        /// Any interleaving of arrival signals that includes a network join
        /// ends HOME/ARRIVED with stage 1 fired exactly once.
        #[test]
        fn arrival_is_idempotent(
            mut events in proptest::collection::vec(arb_arrival_signal(), 0..12),
            join_at in 0usize..12,
        ) {
            let idx = join_at.min(events.len());
            events.insert(idx, PresenceEvent::NetworkAssociate);

            let m = machine();
            let mut all = Vec::new();
            for e in &events {
                all.extend(m.on_event(*e, t0()).unwrap());
            }

            prop_assert_eq!(position(&m), (PresenceState::Home, ArrivalStage::Arrived));
            let stage1 = all.iter().filter(|i| **i == Intent::PreCondition).count();
            let stage2 = all.iter().filter(|i| matches!(i, Intent::FullArrival { .. })).count();
            prop_assert_eq!(stage1, 1);
            prop_assert_eq!(stage2, 1);
        }

        /// No event sequence can produce an inconsistent record.
        #[test]
        fn record_stays_consistent(events in proptest::collection::vec(arb_event(), 0..24)) {
            let m = machine();
            for e in events {
                m.on_event(e, t0()).unwrap();
                prop_assert!(m.current().unwrap().is_consistent());
            }
        }
    }
}
