//! Live cache of the DE1's last observed machine state and role
//! availabilities, kept current by subscribing to the bus. Bridges the
//! device layer's events into the Sequence Recorder's
//! `ResourceSnapshotProvider` seam without the store crate depending on
//! the device manager.

use std::sync::{Arc, RwLock};

use pyde1_core::message::{Availability, DeviceRole, EventPayload, MachineState, Substate};
use pyde1_core::EventBus;
use pyde1_store::ResourceSnapshotProvider;

#[derive(Debug, Clone, Copy, Default)]
struct Snapshot {
    active_state: Option<MachineState>,
    substate: Option<Substate>,
    de1_availability: Option<Availability>,
    scale_availability: Option<Availability>,
    thermometer_availability: Option<Availability>,
}

/// Subscribes to `StateUpdate` and `DeviceAvailability` events and keeps
/// the latest of each in memory, for the `/de1/state` read path and for
/// the recorder's per-sequence resource snapshot.
pub struct DeviceStateCache {
    snapshot: Arc<RwLock<Snapshot>>,
}

impl DeviceStateCache {
    pub fn spawn(bus: EventBus) -> Self {
        let snapshot = Arc::new(RwLock::new(Snapshot::default()));
        let task_snapshot = snapshot.clone();
        tokio::spawn(async move {
            let mut sub = bus.subscribe(Some(vec!["StateUpdate", "DeviceAvailability"]));
            while let Some(event) = sub.recv().await {
                match event.payload {
                    EventPayload::StateUpdate(payload) => {
                        let mut snapshot = task_snapshot.write().expect("state cache lock poisoned");
                        snapshot.active_state = Some(payload.state);
                        snapshot.substate = Some(payload.substate);
                    }
                    EventPayload::DeviceAvailability(payload) => {
                        let mut snapshot = task_snapshot.write().expect("state cache lock poisoned");
                        match payload.role {
                            DeviceRole::De1 => snapshot.de1_availability = Some(payload.availability),
                            DeviceRole::Scale => snapshot.scale_availability = Some(payload.availability),
                            DeviceRole::Thermometer => {
                                snapshot.thermometer_availability = Some(payload.availability)
                            }
                            DeviceRole::Other => {}
                        }
                    }
                    _ => {}
                }
            }
        });
        DeviceStateCache { snapshot }
    }

    /// `GET /de1/state` — `{state, substate}`, `None` until the first
    /// `StateUpdate` arrives.
    pub fn state(&self) -> (Option<MachineState>, Option<Substate>) {
        let snapshot = self.snapshot.read().expect("state cache lock poisoned");
        (snapshot.active_state, snapshot.substate)
    }
}

impl ResourceSnapshotProvider for DeviceStateCache {
    fn active_state(&self) -> Option<MachineState> {
        self.snapshot.read().expect("state cache lock poisoned").active_state
    }

    fn resource_snapshot(&self) -> serde_json::Value {
        let snapshot = self.snapshot.read().expect("state cache lock poisoned");
        serde_json::json!({
            "substate": snapshot.substate,
            "de1_availability": snapshot.de1_availability,
            "scale_availability": snapshot.scale_availability,
            "thermometer_availability": snapshot.thermometer_availability,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pyde1_core::message::{ConnectivityPayload, DeviceAvailabilityPayload, StateUpdatePayload};

    #[tokio::test]
    async fn state_update_events_populate_the_cache() {
        let bus = EventBus::new();
        let cache = DeviceStateCache::spawn(bus.clone());

        bus.publish(
            "de1",
            EventPayload::StateUpdate(StateUpdatePayload {
                state: MachineState::Espresso,
                substate: Substate::Pour,
            }),
        );
        bus.publish(
            "de1",
            EventPayload::DeviceAvailability(DeviceAvailabilityPayload {
                role: DeviceRole::De1,
                availability: Availability::Ready,
                failure_reason: None,
            }),
        );
        // Unrelated event kinds are ignored.
        bus.publish(
            "de1",
            EventPayload::Connectivity(ConnectivityPayload {
                role: DeviceRole::De1,
                connected: true,
            }),
        );

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(cache.state(), (Some(MachineState::Espresso), Some(Substate::Pour)));
        assert_eq!(cache.active_state(), Some(MachineState::Espresso));
    }
}
