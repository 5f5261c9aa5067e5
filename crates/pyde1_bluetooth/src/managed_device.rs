//! Per-role Managed Bluetooth Device: a stable handle that keeps a logical
//! device (DE1, scale, thermometer) reachable, initialised, and
//! substitutable by physical model while the underlying transport comes and
//! goes. One `DashMap` entry per live device, commands routed through an
//! actor loop, generalized into a two-deep intent queue per role.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pyde1_core::message::{Availability, DeviceAvailabilityPayload, DeviceChangedPayload, DeviceRole};
use pyde1_core::{EventBus, EventPayload};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::scratch::ScratchArea;
use crate::specialization::SpecializationRegistry;
use crate::transport::Transport;

/// Coarse lifecycle state of a managed device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Initial,
    Capturing,
    Captured,
    Releasing,
    Released,
}

/// Terminal target a request can move the intent queue's `desired` slot to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intent {
    Captured,
    Released,
}

struct IntentQueue {
    current: LifecycleState,
    desired: Option<Intent>,
    /// Set just before issuing a locally-initiated release, distinguishing
    /// it from an unexpected disconnect per the reconnect policy.
    willful_disconnect: bool,
    ready: bool,
    address: Option<String>,
    specific_class: Option<String>,
    in_flight: Option<CancellationToken>,
}

impl IntentQueue {
    fn new() -> Self {
        IntentQueue {
            current: LifecycleState::Initial,
            desired: None,
            willful_disconnect: false,
            ready: false,
            address: None,
            specific_class: None,
            in_flight: None,
        }
    }
}

/// Policy knobs from `bluetooth.*` configuration driving capture retry.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub connect_timeout: Duration,
    pub reconnect_retry_count: u32,
    pub reconnect_gap: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            connect_timeout: Duration::from_secs(10),
            reconnect_retry_count: 10,
            reconnect_gap: Duration::from_secs(5),
        }
    }
}

/// A stable, role-keyed handle to a possibly-absent physical device.
/// Subscribers hold this handle across disconnect/reconnect and across
/// class specialisation: the handle's public contract never changes, only
/// the specific class name carried in `DeviceChanged` events.
pub struct ManagedDevice {
    role: DeviceRole,
    bus: EventBus,
    scratch: ScratchArea,
    registry: SpecializationRegistry,
    policy: ReconnectPolicy,
    state: Arc<Mutex<IntentQueue>>,
    transport: Arc<RwLock<Option<Arc<dyn Transport>>>>,
    sleeping_de1: Arc<AtomicBool>,
}

impl ManagedDevice {
    pub fn new(
        role: DeviceRole,
        bus: EventBus,
        scratch: ScratchArea,
        registry: SpecializationRegistry,
        policy: ReconnectPolicy,
    ) -> Self {
        ManagedDevice {
            role,
            bus,
            scratch,
            registry,
            policy,
            state: Arc::new(Mutex::new(IntentQueue::new())),
            transport: Arc::new(RwLock::new(None)),
            sleeping_de1: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn role(&self) -> DeviceRole {
        self.role
    }

    /// Notify this handle that the DE1 has gone to sleep (or woken), which
    /// gates whether an unexpected scale/thermometer disconnect is retried.
    pub fn set_de1_sleeping(&self, sleeping: bool) {
        self.sleeping_de1.store(sleeping, Ordering::Relaxed);
    }

    fn emit_availability(&self, availability: Availability, failure_reason: Option<String>) {
        self.bus.publish(
            self.role.to_string(),
            EventPayload::DeviceAvailability(DeviceAvailabilityPayload {
                role: self.role,
                availability,
                failure_reason,
            }),
        );
    }

    fn emit_device_changed(&self, specific_class: Option<String>) {
        self.bus.publish(
            self.role.to_string(),
            EventPayload::DeviceChanged(DeviceChangedPayload {
                role: self.role,
                specific_class,
            }),
        );
    }

    pub async fn is_ready(&self) -> bool {
        self.state.lock().await.ready
    }

    pub async fn availability(&self) -> Availability {
        let state = self.state.lock().await;
        match (state.current, state.ready) {
            (LifecycleState::Initial, _) => Availability::NotPresent,
            (LifecycleState::Capturing, _) => Availability::Capturing,
            (LifecycleState::Captured, true) => Availability::Ready,
            (LifecycleState::Captured, false) => Availability::Captured,
            (LifecycleState::Releasing, _) => Availability::Releasing,
            (LifecycleState::Released, _) => Availability::NotPresent,
        }
    }

    pub async fn current_address(&self) -> Option<String> {
        self.state.lock().await.address.clone()
    }

    /// Sets the target address. `None` forgets the device and reverts it to
    /// generic. If currently captured, triggers a release first.
    pub async fn assign_address(self: &Arc<Self>, address: Option<String>) {
        let mut state = self.state.lock().await;
        if state.address == address {
            return; // no-op: reassigning the same address twice
        }
        state.address = address;
        state.specific_class = None;
        drop(state);
        self.emit_device_changed(None);
        self.request_release_locked().await;
    }

    /// Requests a transition to Captured/Ready. Coalesces with an identical
    /// in-flight request; cancels an in-flight release where cancellable.
    pub async fn capture(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().await;
            if state.desired == Some(Intent::Captured) {
                return; // coalesced
            }
            state.desired = Some(Intent::Captured);
            if let Some(token) = state.in_flight.take() {
                token.cancel();
            }
        }
        self.drive().await;
    }

    /// Requests a transition to Released.
    pub async fn release(self: &Arc<Self>) {
        self.request_release_locked().await;
    }

    async fn request_release_locked(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().await;
            if state.desired == Some(Intent::Released) {
                return;
            }
            state.desired = Some(Intent::Released);
            state.willful_disconnect = true;
            if let Some(token) = state.in_flight.take() {
                token.cancel();
            }
        }
        self.drive().await;
    }

    /// Advances `current` toward `desired` by one step, spawning the
    /// long-running capture/release task. Idempotent: called from every
    /// public entry point and from the task's own completion.
    async fn drive(self: &Arc<Self>) {
        let desired = {
            let state = self.state.lock().await;
            state.desired
        };
        match desired {
            Some(Intent::Captured) => self.clone().spawn_capture().await,
            Some(Intent::Released) => self.clone().spawn_release().await,
            None => {}
        }
    }

    async fn spawn_capture(self: Arc<Self>) {
        let token = CancellationToken::new();
        {
            let mut state = self.state.lock().await;
            if matches!(state.current, LifecycleState::Capturing | LifecycleState::Captured) {
                return;
            }
            state.current = LifecycleState::Capturing;
            state.in_flight = Some(token.clone());
        }
        self.emit_availability(Availability::Capturing, None);

        let address = { self.state.lock().await.address.clone() };
        let Some(address) = address else {
            self.fail_capture("no address assigned").await;
            return;
        };

        let outcome = tokio::select! {
            _ = token.cancelled() => None,
            result = self.attempt_capture(&address) => Some(result),
        };
        match outcome {
            None => {
                info!(role = %self.role, "capture cancelled by a competing release request");
            }
            Some(Ok(())) => {
                self.scratch.mark_captured(self.role, &address);
                {
                    let mut state = self.state.lock().await;
                    state.current = LifecycleState::Captured;
                    state.ready = true;
                    state.in_flight = None;
                }
                self.emit_availability(Availability::Ready, None);
                self.monitor_disconnect();
            }
            Some(Err(reason)) => {
                self.fail_capture(&reason).await;
            }
        }
        // Desired may have changed (e.g. to Released) while we worked.
        let redrive = {
            let state = self.state.lock().await;
            !matches!((state.current, state.desired), (LifecycleState::Captured, Some(Intent::Captured)))
        };
        if redrive {
            self.drive().await;
        }
    }

    async fn fail_capture(self: &Arc<Self>, reason: &str) {
        warn!(role = %self.role, reason, "capture failed");
        let mut state = self.state.lock().await;
        state.current = LifecycleState::Released;
        state.ready = false;
        state.in_flight = None;
        drop(state);
        self.emit_availability(Availability::Unavailable, Some(reason.to_string()));
    }

    /// Connects, resolves class specialisation from the advertised name, and
    /// runs post-connect initialisation, retrying a read-back failure once
    /// before giving up on this attempt.
    async fn attempt_capture(self: &Arc<Self>, address: &str) -> Result<(), String> {
        let transport = {
            let guard = self.transport.read().await;
            guard.clone()
        };
        let Some(transport) = transport else {
            return Err("no transport configured for this role".to_string());
        };
        let connect = tokio::time::timeout(self.policy.connect_timeout, transport.connect(address));
        connect
            .await
            .map_err(|_| "connect timed out".to_string())?
            .map_err(|e| e.to_string())?;

        if let Some(name) = transport.advertised_name() {
            let specific = self.registry.resolve(&name);
            let mut state = self.state.lock().await;
            if state.specific_class != specific {
                state.specific_class = specific.clone();
                drop(state);
                self.emit_device_changed(specific);
            }
        }

        let mut attempts = 0;
        loop {
            match transport.initialize().await {
                Ok(()) => return Ok(()),
                Err(e) if attempts == 0 => {
                    attempts += 1;
                    warn!(role = %self.role, error = %e, "post-connect initialisation failed, retrying once");
                    continue;
                }
                Err(e) => return Err(e.to_string()),
            }
        }
    }

    /// Spawns a background watcher that re-enters Capturing on an
    /// unexpected disconnect, per the reconnect policy, unless the DE1 is
    /// Sleeping (in which case this device is allowed to sleep too).
    fn monitor_disconnect(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let transport = {
                let guard = this.transport.read().await;
                guard.clone()
            };
            let Some(transport) = transport else { return };
            transport.wait_unexpected_disconnect().await;

            let willful = {
                let mut state = this.state.lock().await;
                std::mem::replace(&mut state.willful_disconnect, false)
            };
            if willful {
                return; // this task's release() already owns the transition
            }
            if this.sleeping_de1.load(Ordering::Relaxed) {
                debug!(role = %this.role, "DE1 sleeping, releasing instead of reconnecting");
                this.release().await;
                return;
            }
            this.enter_releasing_then_reconnect().await;
        });
    }

    async fn enter_releasing_then_reconnect(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().await;
            state.current = LifecycleState::Releasing;
            state.ready = false;
        }
        self.emit_availability(Availability::Releasing, None);
        {
            let mut state = self.state.lock().await;
            state.current = LifecycleState::Released;
        }
        self.emit_availability(Availability::NotPresent, Some("unexpected disconnect".to_string()));

        for attempt in 0..self.policy.reconnect_retry_count {
            let desired_still_captured = {
                let state = self.state.lock().await;
                state.desired == Some(Intent::Captured)
            };
            if !desired_still_captured {
                return;
            }
            debug!(role = %self.role, attempt, "reconnect attempt after unexpected disconnect");
            self.drive().await;
            tokio::time::sleep(self.policy.reconnect_gap).await;
            if self.is_ready().await {
                return;
            }
        }
        warn!(role = %self.role, "exhausted reconnect attempts, will keep retrying per policy");
        // Repeat indefinitely. Loop again at the same gap.
        loop {
            let desired_still_captured = {
                let state = self.state.lock().await;
                state.desired == Some(Intent::Captured)
            };
            if !desired_still_captured {
                return;
            }
            self.drive().await;
            tokio::time::sleep(self.policy.reconnect_gap).await;
            if self.is_ready().await {
                return;
            }
        }
    }

    async fn spawn_release(self: Arc<Self>) {
        {
            let mut state = self.state.lock().await;
            if matches!(state.current, LifecycleState::Released | LifecycleState::Initial) {
                state.desired = None;
                state.in_flight = None;
                return;
            }
            state.current = LifecycleState::Releasing;
            state.ready = false;
        }
        self.emit_availability(Availability::Releasing, None);

        let transport = {
            let guard = self.transport.read().await;
            guard.clone()
        };
        if let Some(transport) = transport {
            if let Err(e) = transport.disconnect().await {
                warn!(role = %self.role, error = %e, "error while disconnecting, proceeding to Released anyway");
            }
        }
        self.scratch.clear(self.role);

        let mut state = self.state.lock().await;
        state.current = LifecycleState::Released;
        state.willful_disconnect = false;
        if state.desired == Some(Intent::Released) {
            state.desired = None;
        }
        state.in_flight = None;
        drop(state);
        self.emit_availability(Availability::NotPresent, None);

        self.drive().await;
    }

    /// Binds the transport implementation this handle drives. Done after
    /// construction so the handle itself can be created (and subscribed to)
    /// before a real `btleplug` adapter exists.
    pub async fn set_transport(&self, transport: Arc<dyn Transport>) {
        *self.transport.write().await = Some(transport);
    }

    /// The currently bound transport, if any, for issuing role-specific
    /// commands while the device is Ready.
    pub async fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.read().await.clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pyde1_core::error::DeviceError;
    use std::sync::atomic::AtomicUsize;

    struct FakeTransport {
        fail_connect: AtomicBool,
        connect_calls: AtomicUsize,
        disconnect_notify: Arc<tokio::sync::Notify>,
    }

    #[async_trait::async_trait]
    impl Transport for FakeTransport {
        async fn connect(&self, _address: &str) -> Result<(), DeviceError> {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(DeviceError::TransportError("fake".into(), "nope".into()));
            }
            Ok(())
        }
        async fn disconnect(&self) -> Result<(), DeviceError> {
            Ok(())
        }
        async fn initialize(&self) -> Result<(), DeviceError> {
            Ok(())
        }
        fn advertised_name(&self) -> Option<String> {
            Some("Skale2-1234".to_string())
        }
        async fn wait_unexpected_disconnect(&self) {
            self.disconnect_notify.notified().await;
        }
    }

    fn test_device(role: DeviceRole) -> Arc<ManagedDevice> {
        let dir = std::env::temp_dir().join(format!("pyde1-mbd-test-{}", uuid::Uuid::new_v4()));
        Arc::new(ManagedDevice::new(
            role,
            EventBus::new(),
            ScratchArea::new(dir, "btid"),
            SpecializationRegistry::with_known_models(),
            ReconnectPolicy {
                connect_timeout: Duration::from_millis(200),
                reconnect_retry_count: 2,
                reconnect_gap: Duration::from_millis(10),
            },
        ))
    }

    #[tokio::test]
    async fn assign_then_capture_reaches_ready() {
        let device = test_device(DeviceRole::Scale);
        device
            .set_transport(Arc::new(FakeTransport {
                fail_connect: AtomicBool::new(false),
                connect_calls: AtomicUsize::new(0),
                disconnect_notify: Arc::new(tokio::sync::Notify::new()),
            }))
            .await;
        device.assign_address(Some("AA:BB:CC:DD:EE:FF".to_string())).await;
        device.capture().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(device.is_ready().await);
    }

    #[tokio::test]
    async fn assigning_same_address_twice_is_a_no_op() {
        let device = test_device(DeviceRole::Scale);
        device.assign_address(Some("AA:BB:CC:DD:EE:FF".to_string())).await;
        let before = device.state.lock().await.desired;
        device.assign_address(Some("AA:BB:CC:DD:EE:FF".to_string())).await;
        let after = device.state.lock().await.desired;
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn assigning_null_forces_released() {
        let device = test_device(DeviceRole::Scale);
        device
            .set_transport(Arc::new(FakeTransport {
                fail_connect: AtomicBool::new(false),
                connect_calls: AtomicUsize::new(0),
                disconnect_notify: Arc::new(tokio::sync::Notify::new()),
            }))
            .await;
        device.assign_address(Some("AA:BB:CC:DD:EE:FF".to_string())).await;
        device.capture().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        device.assign_address(None).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(device.state.lock().await.current, LifecycleState::Released);
    }

    #[tokio::test]
    async fn repeated_capture_requests_coalesce() {
        let device = test_device(DeviceRole::Scale);
        device.assign_address(Some("AA:BB:CC:DD:EE:FF".to_string())).await;
        device.capture().await;
        device.capture().await;
        // Only one capture should be in flight; desired stays Captured.
        assert_eq!(device.state.lock().await.desired, Some(Intent::Captured));
    }
}
