//! Tracker Registry
//!
//! Owns per-tracker state and hands out protocol slots.
//!
//! ```text
//!  (unknown) ──admit──► AwaitingRegistration ──complete──► Active
//!      ▲                        │                           │
//!      └────────fail────────────┘                      disconnect
//!                                                           ▼
//!                      AwaitingRegistration ◄──admit── Disconnected
//! ```
//!
//! Slots are reserved per tracker id for the whole session: a tracker that
//! reconnects gets its old slot back, and no other tracker ever receives it.
//! A slot is only reserved once its registration packet was sent.

use crate::domain::frame::{BatteryFrame, ImuFrame, MagStatus};
use crate::domain::math::{Quaternion, Vector3};
use crate::domain::models::{BatteryStatus, ButtonKind, ConnectionMode};
use crate::domain::tracker_settings::TrackerSettings;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    AwaitingRegistration,
    Active,
    Disconnected,
}

/// Result of admitting a frame's tracker id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Tracker is registered under this slot
    Active(u32),
    /// A registration request is already queued
    Pending,
    /// Caller must queue a registration request
    Enqueue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationKind {
    Handshake,
    SensorInfo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationPlan {
    pub tracker_id: String,
    pub slot: u32,
    pub kind: RegistrationKind,
}

#[derive(Debug, Clone, Copy, Default)]
struct ButtonCounters {
    main: Option<u8>,
    sub: Option<u8>,
}

#[derive(Debug, Clone)]
pub struct Tracker {
    pub id: String,
    pub mode: ConnectionMode,
    pub state: TrackerState,
    pub slot: Option<u32>,
    pub rotation: Quaternion,
    pub acceleration: Vector3,
    pub battery: BatteryStatus,
    pub mag: Option<MagStatus>,
    buttons: ButtonCounters,
}

impl Tracker {
    fn new(id: &str, mode: ConnectionMode) -> Self {
        Self {
            id: id.to_string(),
            mode,
            state: TrackerState::AwaitingRegistration,
            slot: None,
            rotation: Quaternion::IDENTITY,
            acceleration: Vector3::ZERO,
            battery: BatteryStatus::default(),
            mag: None,
            buttons: ButtonCounters::default(),
        }
    }
}

#[derive(Debug, Default)]
pub struct TrackerRegistry {
    trackers: HashMap<String, Tracker>,
    settings: HashMap<String, TrackerSettings>,
    slots: HashMap<String, u32>,
    next_slot: u32,
    handshake_sent: bool,
}

impl TrackerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Note that a frame arrived for `id`; tells the caller whether to queue
    /// a registration.
    pub fn admit(&mut self, id: &str, mode: ConnectionMode) -> Admission {
        match self.trackers.get_mut(id) {
            Some(tracker) => match tracker.state {
                TrackerState::Active => Admission::Active(tracker.slot.unwrap_or_default()),
                TrackerState::AwaitingRegistration => Admission::Pending,
                TrackerState::Disconnected => {
                    tracker.state = TrackerState::AwaitingRegistration;
                    tracker.mode = mode;
                    Admission::Enqueue
                }
            },
            None => {
                self.trackers.insert(id.to_string(), Tracker::new(id, mode));
                Admission::Enqueue
            }
        }
    }

    /// Decide which packet registers `id` and under which slot.
    ///
    /// Returns `None` when the tracker is no longer waiting (already active,
    /// disconnected or removed since the request was queued).
    pub fn plan_registration(&self, id: &str) -> Option<RegistrationPlan> {
        let tracker = self.trackers.get(id)?;
        if tracker.state != TrackerState::AwaitingRegistration {
            return None;
        }

        let (slot, kind) = if !self.handshake_sent {
            (self.next_slot, RegistrationKind::Handshake)
        } else {
            let slot = self.slots.get(id).copied().unwrap_or(self.next_slot);
            (slot, RegistrationKind::SensorInfo)
        };

        Some(RegistrationPlan {
            tracker_id: id.to_string(),
            slot,
            kind,
        })
    }

    /// Commit a plan whose packet was sent.
    ///
    /// The slot stays bound to the tracker even if it disconnected while the
    /// packet was in flight, since the server already knows it. Returns true
    /// only if the tracker became active.
    pub fn complete_registration(&mut self, plan: &RegistrationPlan) -> bool {
        let Some(tracker) = self.trackers.get_mut(&plan.tracker_id) else {
            return false;
        };

        tracker.slot = Some(plan.slot);
        let activated = tracker.state == TrackerState::AwaitingRegistration;
        if activated {
            tracker.state = TrackerState::Active;
        }
        if self.slots.insert(plan.tracker_id.clone(), plan.slot).is_none() {
            self.next_slot = self.next_slot.max(plan.slot + 1);
        }
        if plan.kind == RegistrationKind::Handshake {
            self.handshake_sent = true;
        }
        activated
    }

    /// Drop a tracker whose registration packet could not be sent
    pub fn fail_registration(&mut self, id: &str) {
        if self
            .trackers
            .get(id)
            .is_some_and(|t| t.state == TrackerState::AwaitingRegistration)
        {
            self.trackers.remove(id);
        }
    }

    /// Mark a tracker disconnected. Returns true if it was active.
    pub fn disconnect(&mut self, id: &str) -> bool {
        match self.trackers.get_mut(id) {
            Some(tracker) => {
                let was_active = tracker.state == TrackerState::Active;
                tracker.state = TrackerState::Disconnected;
                was_active
            }
            None => false,
        }
    }

    pub fn tracker(&self, id: &str) -> Option<&Tracker> {
        self.trackers.get(id)
    }

    fn active_mut(&mut self, id: &str) -> Option<&mut Tracker> {
        self.trackers
            .get_mut(id)
            .filter(|t| t.state == TrackerState::Active)
    }

    pub fn slot_of(&self, id: &str) -> Option<u32> {
        self.trackers
            .get(id)
            .filter(|t| t.state == TrackerState::Active)
            .and_then(|t| t.slot)
    }

    /// Store the latest IMU sample; returns the tracker's slot
    pub fn record_imu(&mut self, id: &str, frame: &ImuFrame) -> Option<u32> {
        let tracker = self.active_mut(id)?;
        tracker.rotation = frame.rotation;
        tracker.acceleration = frame.acceleration;
        tracker.slot
    }

    /// Merge a battery frame; returns the merged state
    pub fn record_battery(&mut self, id: &str, frame: &BatteryFrame) -> Option<BatteryStatus> {
        let tracker = self.active_mut(id)?;
        if frame.percent.is_some() {
            tracker.battery.percent = frame.percent;
        }
        if frame.voltage_mv.is_some() {
            tracker.battery.voltage_mv = frame.voltage_mv;
        }
        if frame.charge.is_some() {
            tracker.battery.charge = frame.charge;
        }
        Some(tracker.battery)
    }

    pub fn record_mag(&mut self, id: &str, status: MagStatus) -> bool {
        match self.active_mut(id) {
            Some(tracker) => {
                tracker.mag = Some(status);
                true
            }
            None => false,
        }
    }

    /// Store a button counter. Returns true only when it differs from the
    /// previously seen counter; the first value is a baseline.
    pub fn record_button(&mut self, id: &str, button: ButtonKind, count: u8) -> bool {
        let Some(tracker) = self.active_mut(id) else {
            return false;
        };
        let stored = match button {
            ButtonKind::Main => &mut tracker.buttons.main,
            ButtonKind::Sub => &mut tracker.buttons.sub,
        };
        let pressed = stored.is_some_and(|previous| previous != count);
        *stored = Some(count);
        pressed
    }

    pub fn record_settings(&mut self, id: &str, settings: TrackerSettings) {
        self.settings.insert(id.to_string(), settings);
    }

    pub fn settings(&self, id: &str) -> Option<TrackerSettings> {
        self.settings.get(id).copied()
    }

    /// Active tracker ids ordered by slot
    pub fn active_trackers(&self) -> Vec<String> {
        let mut active: Vec<&Tracker> = self
            .trackers
            .values()
            .filter(|t| t.state == TrackerState::Active)
            .collect();
        active.sort_by_key(|t| t.slot);
        active.into_iter().map(|t| t.id.clone()).collect()
    }

    /// Ids of every tracker currently attached through `mode`
    pub fn trackers_for(&self, mode: ConnectionMode) -> Vec<String> {
        self.trackers
            .values()
            .filter(|t| t.mode == mode)
            .map(|t| t.id.clone())
            .collect()
    }

    /// Forget the trackers of one transport. Returns those that were active.
    pub fn remove_mode(&mut self, mode: ConnectionMode) -> Vec<String> {
        let ids = self.trackers_for(mode);
        let mut removed = Vec::new();
        for id in ids {
            if let Some(tracker) = self.trackers.remove(&id) {
                if tracker.state == TrackerState::Active {
                    removed.push(id);
                }
            }
        }
        removed
    }

    /// Session teardown: release every slot
    pub fn clear(&mut self) {
        self.trackers.clear();
        self.settings.clear();
        self.slots.clear();
        self.next_slot = 0;
        self.handshake_sent = false;
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register(registry: &mut TrackerRegistry, id: &str) -> RegistrationPlan {
        assert_eq!(registry.admit(id, ConnectionMode::Serial), Admission::Enqueue);
        let plan = registry.plan_registration(id).unwrap();
        assert!(registry.complete_registration(&plan));
        plan
    }

    #[test]
    fn test_first_tracker_gets_handshake_slot_zero() {
        let mut registry = TrackerRegistry::new();
        let first = register(&mut registry, "Tracker2");
        assert_eq!(first.slot, 0);
        assert_eq!(first.kind, RegistrationKind::Handshake);

        let second = register(&mut registry, "Tracker0");
        assert_eq!(second.slot, 1);
        assert_eq!(second.kind, RegistrationKind::SensorInfo);

        let third = register(&mut registry, "Tracker1");
        assert_eq!(third.slot, 2);
        assert_eq!(registry.active_trackers(), vec!["Tracker2", "Tracker0", "Tracker1"]);
    }

    #[test]
    fn test_duplicate_admission_is_pending() {
        let mut registry = TrackerRegistry::new();
        assert_eq!(registry.admit("a", ConnectionMode::Bluetooth), Admission::Enqueue);
        assert_eq!(registry.admit("a", ConnectionMode::Bluetooth), Admission::Pending);
        let plan = registry.plan_registration("a").unwrap();
        assert!(registry.complete_registration(&plan));
        assert_eq!(registry.admit("a", ConnectionMode::Bluetooth), Admission::Active(0));
        assert!(registry.plan_registration("a").is_none());
        assert!(!registry.complete_registration(&plan));
    }

    #[test]
    fn test_failed_registration_leaks_no_slot() {
        let mut registry = TrackerRegistry::new();
        register(&mut registry, "a");

        registry.admit("b", ConnectionMode::Serial);
        let plan = registry.plan_registration("b").unwrap();
        assert_eq!(plan.slot, 1);
        registry.fail_registration("b");
        assert!(registry.tracker("b").is_none());

        let next = register(&mut registry, "c");
        assert_eq!(next.slot, 1);
        assert_eq!(register(&mut registry, "b").slot, 2);
    }

    #[test]
    fn test_failed_handshake_is_retried_as_handshake() {
        let mut registry = TrackerRegistry::new();
        registry.admit("a", ConnectionMode::Serial);
        registry.fail_registration("a");
        let plan = register(&mut registry, "b");
        assert_eq!(plan.kind, RegistrationKind::Handshake);
        assert_eq!(plan.slot, 0);
    }

    #[test]
    fn test_disconnect_during_registration_keeps_announced_slot() {
        let mut registry = TrackerRegistry::new();
        register(&mut registry, "Tracker0");

        registry.admit("Tracker1", ConnectionMode::Serial);
        let in_flight = registry.plan_registration("Tracker1").unwrap();
        assert_eq!(in_flight.slot, 1);
        registry.disconnect("Tracker1");
        assert!(!registry.complete_registration(&in_flight));
        assert_eq!(registry.slot_of("Tracker1"), None);

        let next = register(&mut registry, "Tracker2");
        assert_eq!(next.slot, 2);

        assert_eq!(registry.admit("Tracker1", ConnectionMode::Serial), Admission::Enqueue);
        let again = registry.plan_registration("Tracker1").unwrap();
        assert_eq!((again.slot, again.kind), (1, RegistrationKind::SensorInfo));
    }

    #[test]
    fn test_handshake_is_not_repeated_after_early_disconnect() {
        let mut registry = TrackerRegistry::new();
        registry.admit("Tracker0", ConnectionMode::Serial);
        let handshake = registry.plan_registration("Tracker0").unwrap();
        assert_eq!(handshake.kind, RegistrationKind::Handshake);
        registry.disconnect("Tracker0");
        assert!(!registry.complete_registration(&handshake));

        let plan = register(&mut registry, "Tracker1");
        assert_eq!((plan.slot, plan.kind), (1, RegistrationKind::SensorInfo));
    }

    #[test]
    fn test_reconnect_keeps_slot() {
        let mut registry = TrackerRegistry::new();
        register(&mut registry, "a");
        register(&mut registry, "b");

        assert!(registry.disconnect("b"));
        assert!(!registry.disconnect("b"));
        assert_eq!(registry.active_trackers(), vec!["a"]);

        let c = register(&mut registry, "c");
        assert_eq!(c.slot, 2);

        let b = register(&mut registry, "b");
        assert_eq!(b.slot, 1);
        assert_eq!(b.kind, RegistrationKind::SensorInfo);
    }

    #[test]
    fn test_frames_for_inactive_trackers_are_ignored() {
        let mut registry = TrackerRegistry::new();
        registry.admit("a", ConnectionMode::Serial);
        let frame = ImuFrame {
            rotation: Quaternion::IDENTITY,
            acceleration: Vector3::ZERO,
            ankle: None,
        };
        assert_eq!(registry.record_imu("a", &frame), None);
        assert!(!registry.record_button("a", ButtonKind::Main, 1));
        assert!(registry
            .record_battery(
                "a",
                &BatteryFrame {
                    percent: Some(50),
                    voltage_mv: None,
                    charge: None
                }
            )
            .is_none());
    }

    #[test]
    fn test_button_transitions_fire_once_per_change() {
        let mut registry = TrackerRegistry::new();
        register(&mut registry, "a");

        let counters = [3, 3, 3, 4, 4, 5, 5, 5, 15, 0, 0];
        let presses: Vec<bool> = counters
            .iter()
            .map(|&c| registry.record_button("a", ButtonKind::Main, c))
            .collect();
        assert_eq!(
            presses,
            vec![false, false, false, true, false, true, false, false, true, true, false]
        );

        // Sub button keeps its own baseline
        assert!(!registry.record_button("a", ButtonKind::Sub, 0));
        assert!(registry.record_button("a", ButtonKind::Sub, 1));
    }

    #[test]
    fn test_battery_merges_partial_frames() {
        let mut registry = TrackerRegistry::new();
        register(&mut registry, "a");
        registry.record_battery(
            "a",
            &BatteryFrame {
                percent: Some(80),
                voltage_mv: None,
                charge: None,
            },
        );
        let merged = registry
            .record_battery(
                "a",
                &BatteryFrame {
                    percent: None,
                    voltage_mv: Some(3950),
                    charge: None,
                },
            )
            .unwrap();
        assert_eq!(merged.percent, Some(80));
        assert_eq!(merged.voltage_mv, Some(3950));
    }

    #[test]
    fn test_remove_mode_and_clear() {
        let mut registry = TrackerRegistry::new();
        register(&mut registry, "serial");
        registry.admit("ble", ConnectionMode::Bluetooth);
        let plan = registry.plan_registration("ble").unwrap();
        registry.complete_registration(&plan);

        assert_eq!(registry.remove_mode(ConnectionMode::Serial), vec!["serial"]);
        assert_eq!(registry.active_trackers(), vec!["ble"]);

        registry.clear();
        assert!(registry.is_empty());
        let plan = register(&mut registry, "serial");
        assert_eq!(plan.kind, RegistrationKind::Handshake);
    }
}
