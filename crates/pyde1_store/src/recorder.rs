//! Fan-in of bus events into the store, implementing the Sequence
//! Recorder's ring-buffer / streaming-mode handoff: every event is
//! absorbed into the pre-sequence ring buffer until a sequence opens, at
//! which point the window is re-labeled under the new id and flushed, and
//! subsequent events stream straight to the store until the sequence
//! closes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pyde1_core::bus::EventBus;
use pyde1_core::message::{Event, EventPayload, Gate, GateState, MachineState};
use pyde1_device_config::ProfileRegistry;
use tracing::{error, warn};
use uuid::Uuid;

use crate::ring_buffer::RingBuffer;
use crate::store::{SequenceClose, SequenceSnapshot, Store};

/// A synchronous, no-I/O read of the fields the Recorder must capture the
/// instant a sequence opens. Implemented by whichever component holds the
/// live DE1/scale state (the device manager); kept as a trait here so this
/// crate never depends on the device layer.
pub trait ResourceSnapshotProvider: Send + Sync {
    /// The DE1's last observed `MachineState`, or `None` if never seen.
    fn active_state(&self) -> Option<MachineState>;
    /// Opaque JSON blob of DE1 settings/control/calibration/version and
    /// scale identity, persisted verbatim alongside the sequence row.
    fn resource_snapshot(&self) -> serde_json::Value;
}

/// A provider with nothing cached, for processes running the recorder
/// without a live device manager (e.g. import/export tooling).
pub struct NullResourceSnapshotProvider;

impl ResourceSnapshotProvider for NullResourceSnapshotProvider {
    fn active_state(&self) -> Option<MachineState> {
        None
    }

    fn resource_snapshot(&self) -> serde_json::Value {
        serde_json::json!({})
    }
}

const DEFAULT_PRE_SEQUENCE_WINDOW: Duration = Duration::from_secs(5);

pub struct SequenceRecorder {
    store: Store,
    profiles: Arc<ProfileRegistry>,
    snapshot: Arc<dyn ResourceSnapshotProvider>,
    ring: RingBuffer,
    pre_sequence_window: Duration,
    current: Option<Uuid>,
    start_flow: Option<DateTime<Utc>>,
    end_flow: Option<DateTime<Utc>>,
}

impl SequenceRecorder {
    pub fn new(store: Store, profiles: Arc<ProfileRegistry>, snapshot: Arc<dyn ResourceSnapshotProvider>) -> Self {
        SequenceRecorder::with_window(store, profiles, snapshot, DEFAULT_PRE_SEQUENCE_WINDOW)
    }

    pub fn with_window(
        store: Store,
        profiles: Arc<ProfileRegistry>,
        snapshot: Arc<dyn ResourceSnapshotProvider>,
        pre_sequence_window: Duration,
    ) -> Self {
        SequenceRecorder {
            store,
            profiles,
            snapshot,
            ring: RingBuffer::new(pre_sequence_window),
            pre_sequence_window,
            current: None,
            start_flow: None,
            end_flow: None,
        }
    }

    /// Subscribes to every event on `bus` and drives the recorder until
    /// the subscription closes.
    pub fn spawn(mut self, bus: EventBus) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut events = bus.subscribe(None);
            while let Some(event) = events.recv().await {
                self.handle(event).await;
            }
        })
    }

    async fn handle(&mut self, event: Event) {
        let sequence_id = event.header.sequence_id;
        let arrival_time = event.header.arrival_time;
        let mut closing = false;

        if let EventPayload::SequencerGate(ref payload) = event.payload {
            match (payload.gate, payload.state) {
                (Gate::SequenceStart, GateState::Set) => {
                    self.open_sequence(sequence_id, arrival_time).await;
                }
                (Gate::FlowBegin, GateState::Set) => self.start_flow = Some(arrival_time),
                (Gate::FlowEnd, GateState::Set) => self.end_flow = Some(arrival_time),
                (Gate::SequenceComplete, GateState::Set) => closing = true,
                _ => {}
            }
        }

        match self.current {
            Some(id) => {
                let mut event = event;
                event.header.sequence_id = id;
                if let Err(e) = self.store.insert_event(event).await {
                    error!(error = %e, sequence_id = %id, "could not persist streamed event");
                }
            }
            None => self.ring.push(event),
        }

        if closing {
            self.close_sequence(sequence_id, arrival_time).await;
        }
    }

    async fn open_sequence(&mut self, id: Uuid, start_sequence: DateTime<Utc>) {
        let active_state = self
            .snapshot
            .active_state()
            .map(|s| format!("{s:?}"))
            .unwrap_or_else(|| "Unknown".to_string());

        let (profile_id, profile_assumed) = match self.profiles.lookup_last_uploaded() {
            Some(profile_id) => (Some(profile_id), false),
            None => (None, true),
        };

        if let Err(e) = self
            .store
            .insert_sequence(SequenceSnapshot {
                id,
                active_state,
                start_sequence,
                profile_id,
                profile_assumed,
                resource_snapshot: self.snapshot.resource_snapshot(),
            })
            .await
        {
            error!(error = %e, sequence_id = %id, "could not open sequence row");
        }

        let cutoff = start_sequence
            - chrono::Duration::from_std(self.pre_sequence_window).unwrap_or_else(|_| chrono::Duration::zero());
        let claimed = self.ring.drain_since(cutoff);
        self.current = Some(id);
        for mut claimed_event in claimed {
            claimed_event.header.sequence_id = id;
            if let Err(e) = self.store.insert_event(claimed_event).await {
                warn!(error = %e, sequence_id = %id, "could not flush pre-sequence event");
            }
        }
    }

    async fn close_sequence(&mut self, id: Uuid, end_sequence: DateTime<Utc>) {
        let start_flow = self.start_flow.take();
        let end_flow = self.end_flow.take();
        if let Err(e) = self
            .store
            .close_sequence(SequenceClose {
                id,
                start_flow,
                end_flow,
                end_sequence,
            })
            .await
        {
            error!(error = %e, sequence_id = %id, "could not close sequence row");
        }
        self.store.flush().await;
        self.current = None;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pyde1_core::message::{EventHeader, SequenceCloseReason, SequencerGatePayload, ShotSamplePayload};

    fn shot_sample_event(t: DateTime<Utc>, volume: f64) -> Event {
        Event {
            header: EventHeader {
                arrival_time: t,
                create_time: t,
                ..EventHeader::new_now("de1")
            },
            payload: EventPayload::ShotSample(ShotSamplePayload {
                sample_time: 0.5,
                group_pressure: 6.0,
                group_flow: 2.0,
                mix_temp: 90.0,
                head_temp: 90.0,
                volume_pour: volume,
            }),
        }
    }

    fn gate_event(id: Uuid, gate: Gate, state: GateState, t: DateTime<Utc>) -> Event {
        Event {
            header: EventHeader {
                arrival_time: t,
                create_time: t,
                sequence_id: id,
                ..EventHeader::new_now("flow_sequencer")
            },
            payload: EventPayload::SequencerGate(SequencerGatePayload {
                gate,
                state,
                reason: if gate == Gate::SequenceComplete {
                    Some(SequenceCloseReason::Normal)
                } else {
                    None
                },
            }),
        }
    }

    #[tokio::test]
    async fn pre_sequence_samples_are_reclaimed_under_the_new_sequence_id() {
        let store = Store::open_in_memory().unwrap();
        let profiles = Arc::new(ProfileRegistry::new());
        let snapshot = Arc::new(NullResourceSnapshotProvider);
        let mut recorder =
            SequenceRecorder::with_window(store.clone(), profiles, snapshot, Duration::from_secs(5));

        let t0 = Utc::now();
        recorder.handle(shot_sample_event(t0, 0.2)).await;
        assert_eq!(recorder.ring.len(), 1);

        let id = Uuid::new_v4();
        let t1 = t0 + chrono::Duration::milliseconds(200);
        recorder
            .handle(gate_event(id, Gate::SequenceStart, GateState::Set, t1))
            .await;
        assert_eq!(recorder.current, Some(id));
        assert!(recorder.ring.is_empty());

        let t2 = t1 + chrono::Duration::seconds(20);
        recorder
            .handle(gate_event(id, Gate::SequenceComplete, GateState::Set, t2))
            .await;
        assert_eq!(recorder.current, None);

        let export = store.export_sequence(id).await.unwrap();
        assert!(export.contains("0.20"));
    }

    #[tokio::test]
    async fn samples_during_an_open_sequence_are_streamed_straight_to_the_store() {
        let store = Store::open_in_memory().unwrap();
        let profiles = Arc::new(ProfileRegistry::new());
        let snapshot = Arc::new(NullResourceSnapshotProvider);
        let mut recorder =
            SequenceRecorder::with_window(store.clone(), profiles, snapshot, Duration::from_secs(5));

        let t0 = Utc::now();
        recorder.handle(shot_sample_event(t0, 0.1)).await;
        recorder.handle(shot_sample_event(t0 + chrono::Duration::milliseconds(600), 0.15)).await;
        recorder.handle(shot_sample_event(t0 + chrono::Duration::milliseconds(1400), 0.18)).await;

        let id = Uuid::new_v4();
        let t1 = t0 + chrono::Duration::milliseconds(1800);
        recorder
            .handle(gate_event(id, Gate::SequenceStart, GateState::Set, t1))
            .await;
        assert_eq!(recorder.current, Some(id));

        // These arrive with no sequence id of their own (the sensor's default),
        // and must still land in the store under the now-open sequence.
        recorder.handle(shot_sample_event(t1 + chrono::Duration::milliseconds(200), 0.25)).await;
        recorder.handle(shot_sample_event(t1 + chrono::Duration::milliseconds(400), 0.32)).await;
        recorder.handle(shot_sample_event(t1 + chrono::Duration::milliseconds(600), 0.40)).await;

        let t2 = t1 + chrono::Duration::seconds(20);
        recorder
            .handle(gate_event(id, Gate::SequenceComplete, GateState::Set, t2))
            .await;
        assert_eq!(recorder.current, None);

        let export = store.export_sequence(id).await.unwrap();
        for volume in ["0.10", "0.15", "0.18", "0.25", "0.32", "0.40"] {
            assert!(export.contains(volume), "missing sample {volume} in export: {export}");
        }
    }

    #[tokio::test]
    async fn samples_older_than_the_window_are_not_reclaimed() {
        let store = Store::open_in_memory().unwrap();
        let profiles = Arc::new(ProfileRegistry::new());
        let snapshot = Arc::new(NullResourceSnapshotProvider);
        let mut recorder =
            SequenceRecorder::with_window(store.clone(), profiles, snapshot, Duration::from_secs(2));

        let t0 = Utc::now();
        recorder.handle(shot_sample_event(t0, 0.2)).await;

        let id = Uuid::new_v4();
        let t1 = t0 + chrono::Duration::seconds(5);
        recorder
            .handle(gate_event(id, Gate::SequenceStart, GateState::Set, t1))
            .await;

        let t2 = t1 + chrono::Duration::seconds(1);
        recorder
            .handle(gate_event(id, Gate::SequenceComplete, GateState::Set, t2))
            .await;

        let export = store.export_sequence(id).await.unwrap();
        assert!(!export.contains("0.20"));
    }

    #[tokio::test]
    async fn profile_assumed_is_true_until_a_profile_has_been_uploaded() {
        let store = Store::open_in_memory().unwrap();
        let profiles = Arc::new(ProfileRegistry::new());
        let snapshot = Arc::new(NullResourceSnapshotProvider);
        let mut recorder =
            SequenceRecorder::with_window(store, profiles.clone(), snapshot, Duration::from_secs(5));

        let id = Uuid::new_v4();
        recorder
            .handle(gate_event(id, Gate::SequenceStart, GateState::Set, Utc::now()))
            .await;
        assert!(recorder.current.is_some());

        // A profile uploaded mid-sequence only affects the *next* sequence.
        let source = br#"{
            "title": null, "author": null, "notes": null, "beverage": null,
            "target_volume": null, "target_weight": null,
            "steps": [
                {"name": "p", "temperature": 92.0, "pressure": 2.0, "flow": null,
                 "seconds": 5.0, "max_volume": null, "extended_limit": null}
            ]
        }"#
        .to_vec();
        profiles
            .insert(source, pyde1_device_config::FORMAT_TAG_V1, None, None, None, None)
            .unwrap();
        assert!(profiles.lookup_last_uploaded().is_some());
    }
}
