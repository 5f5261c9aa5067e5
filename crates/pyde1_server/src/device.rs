//! DE1 Device Manager: owns the three [`ManagedDevice`] role handles (DE1,
//! Scale, Thermometer), runs the crash-recovery cleanup pass at startup,
//! and exposes `start_scan`/`stop_scan` plus the [`De1Control`] seam the
//! [`FlowSequencer`] drives the DE1 and scale through.
//!
//! One manager owns every live device handle and exposes scanning as a
//! command routed through an internal channel into a background task,
//! the same shape as a `{start_scanning,stop_scanning}` pair driving an event
//! loop rather than talking to the comm manager directly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pyde1_bluetooth::{ManagedDevice, ReconnectPolicy, ScratchArea, SpecializationRegistry};
use pyde1_bluetooth::transport::DeviceCommand;
use pyde1_core::error::DeviceError;
use pyde1_core::message::{Availability, DeviceRole, MachineState};
use pyde1_core::EventBus;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::sequencer::De1Control;

/// What the device manager needs from the underlying Bluetooth stack to
/// drive scanning and force-drop orphaned sessions left over from an
/// ungraceful exit. Implemented once over `btleplug`'s central adapter;
/// fakeable in tests.
#[async_trait]
pub trait Scanner: Send + Sync {
    async fn start_scan(&self, duration: Option<Duration>) -> Result<(), DeviceError>;
    async fn stop_scan(&self) -> Result<(), DeviceError>;
    /// Forces the OS Bluetooth stack to drop a session the process no
    /// longer tracks, per the on-connect crash-recovery procedure.
    async fn force_disconnect(&self, address: &str) -> Result<(), DeviceError>;
}

/// A [`Scanner`] that does nothing; used where no adapter is available
/// (tests, or a process started with Bluetooth disabled).
#[derive(Default)]
pub struct NullScanner;

#[async_trait]
impl Scanner for NullScanner {
    async fn start_scan(&self, _duration: Option<Duration>) -> Result<(), DeviceError> {
        Ok(())
    }
    async fn stop_scan(&self) -> Result<(), DeviceError> {
        Ok(())
    }
    async fn force_disconnect(&self, _address: &str) -> Result<(), DeviceError> {
        Ok(())
    }
}

enum ManagerCommand {
    StartScan(Option<Duration>),
    StopScan,
}

/// Owns the three role handles, wires them to the bus, and is the
/// `De1Control` the FlowSequencer drives. Cheap to clone.
#[derive(Clone)]
pub struct De1DeviceManager {
    de1: Arc<ManagedDevice>,
    scale: Arc<ManagedDevice>,
    thermometer: Arc<ManagedDevice>,
    scanner: Arc<dyn Scanner>,
    scratch: ScratchArea,
    commands: mpsc::UnboundedSender<ManagerCommand>,
}

impl De1DeviceManager {
    pub fn new(
        bus: EventBus,
        scratch: ScratchArea,
        registry: SpecializationRegistry,
        policy: ReconnectPolicy,
        scanner: Arc<dyn Scanner>,
    ) -> Self {
        let de1 = Arc::new(ManagedDevice::new(
            DeviceRole::De1,
            bus.clone(),
            scratch.clone(),
            registry.clone(),
            policy,
        ));
        let scale = Arc::new(ManagedDevice::new(
            DeviceRole::Scale,
            bus.clone(),
            scratch.clone(),
            registry.clone(),
            policy,
        ));
        let thermometer = Arc::new(ManagedDevice::new(
            DeviceRole::Thermometer,
            bus,
            scratch.clone(),
            registry,
            policy,
        ));

        let (tx, mut rx) = mpsc::unbounded_channel::<ManagerCommand>();
        let loop_scanner = scanner.clone();
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                let result = match command {
                    ManagerCommand::StartScan(duration) => loop_scanner.start_scan(duration).await,
                    ManagerCommand::StopScan => loop_scanner.stop_scan().await,
                };
                if let Err(e) = result {
                    warn!(error = %e, "scan command failed");
                }
            }
        });

        De1DeviceManager {
            de1,
            scale,
            thermometer,
            scanner,
            scratch,
            commands: tx,
        }
    }

    pub fn de1(&self) -> Arc<ManagedDevice> {
        self.de1.clone()
    }

    pub fn scale(&self) -> Arc<ManagedDevice> {
        self.scale.clone()
    }

    pub fn thermometer(&self) -> Arc<ManagedDevice> {
        self.thermometer.clone()
    }

    pub fn role(&self, role: DeviceRole) -> Option<Arc<ManagedDevice>> {
        match role {
            DeviceRole::De1 => Some(self.de1.clone()),
            DeviceRole::Scale => Some(self.scale.clone()),
            DeviceRole::Thermometer => Some(self.thermometer.clone()),
            DeviceRole::Other => None,
        }
    }

    /// `PATCH /scan` — `{begin: null|number}`. `None` scans indefinitely
    /// (until `stop_scan`); `Some(duration)` bounds the scan.
    pub fn start_scan(&self, duration: Option<Duration>) {
        let _ = self.commands.send(ManagerCommand::StartScan(duration));
    }

    pub fn stop_scan(&self) {
        let _ = self.commands.send(ManagerCommand::StopScan);
    }

    /// On-connect crash-recovery: iterates the scratch area for every
    /// role, forcing the OS to drop any session a prior, ungracefully
    /// terminated process left orphaned.
    pub async fn cleanup_stale_sessions(&self) {
        let roles = [DeviceRole::De1, DeviceRole::Scale, DeviceRole::Thermometer];
        let mut stale = Vec::new();
        self.scratch.cleanup_stale(&roles, |role, address| {
            stale.push((role, address));
        });
        for (role, address) in stale {
            info!(role = %role, address, "forcing OS to drop stale Bluetooth session");
            if let Err(e) = self.scanner.force_disconnect(&address).await {
                warn!(role = %role, address, error = %e, "failed to force-disconnect stale session");
            }
        }
    }

    /// Notifies every scale/thermometer handle of the DE1's sleep state so
    /// the unexpected-disconnect policy can choose to let them sleep too.
    pub async fn set_de1_sleeping(&self, sleeping: bool) {
        self.scale.set_de1_sleeping(sleeping);
        self.thermometer.set_de1_sleeping(sleeping);
    }
}

#[async_trait]
impl De1Control for De1DeviceManager {
    async fn request_state(&self, state: MachineState) -> Result<(), DeviceError> {
        let transport = self
            .de1
            .current_transport()
            .await
            .ok_or_else(|| DeviceError::DeviceNotConnected("de1".to_string()))?;
        transport.send_command(DeviceCommand::RequestState(state)).await
    }

    async fn tare_scale(&self) -> Result<(), DeviceError> {
        if !self.scale.is_ready().await {
            return Err(DeviceError::DeviceNotConnected("scale".to_string()));
        }
        let transport = self
            .scale
            .current_transport()
            .await
            .ok_or_else(|| DeviceError::DeviceNotConnected("scale".to_string()))?;
        transport.send_command(DeviceCommand::TareScale).await
    }

    async fn scale_ready(&self) -> bool {
        self.scale.is_ready().await
    }
}

/// Current availability snapshot across all three roles, used by the HTTP
/// `/de1/availability` read path.
pub struct RoleSnapshot {
    pub role: DeviceRole,
    pub address: Option<String>,
    pub availability: Availability,
}

impl De1DeviceManager {
    pub async fn snapshot(&self, role: DeviceRole) -> Option<RoleSnapshot> {
        let device = self.role(role)?;
        Some(RoleSnapshot {
            role,
            address: device.current_address().await,
            availability: device.availability().await,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pyde1_bluetooth::SpecializationRegistry;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingScanner {
        starts: AtomicUsize,
        force_disconnects: AtomicUsize,
    }

    #[async_trait]
    impl Scanner for CountingScanner {
        async fn start_scan(&self, _duration: Option<Duration>) -> Result<(), DeviceError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn stop_scan(&self) -> Result<(), DeviceError> {
            Ok(())
        }
        async fn force_disconnect(&self, _address: &str) -> Result<(), DeviceError> {
            self.force_disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn manager_with(scanner: Arc<CountingScanner>) -> (De1DeviceManager, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("pyde1-devicemgr-test-{}", uuid::Uuid::new_v4()));
        let manager = De1DeviceManager::new(
            EventBus::new(),
            ScratchArea::new(dir.clone(), "btid"),
            SpecializationRegistry::with_known_models(),
            ReconnectPolicy::default(),
            scanner,
        );
        (manager, dir)
    }

    #[tokio::test]
    async fn tare_scale_fails_when_scale_not_ready() {
        let scanner = Arc::new(CountingScanner::default());
        let (manager, dir) = manager_with(scanner);
        let result = manager.tare_scale().await;
        assert!(matches!(result, Err(DeviceError::DeviceNotConnected(_))));
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn cleanup_stale_sessions_forces_disconnect_for_each_leftover_file() {
        let scanner = Arc::new(CountingScanner::default());
        let (manager, dir) = manager_with(scanner.clone());
        manager.scratch.mark_captured(DeviceRole::Scale, "AA:BB:CC:DD:EE:FF");
        manager.cleanup_stale_sessions().await;
        assert_eq!(scanner.force_disconnects.load(Ordering::SeqCst), 1);
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn start_scan_routes_through_the_command_channel() {
        let scanner = Arc::new(CountingScanner::default());
        let (manager, dir) = manager_with(scanner.clone());
        manager.start_scan(Some(Duration::from_secs(5)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(scanner.starts.load(Ordering::SeqCst), 1);
        std::fs::remove_dir_all(dir).ok();
    }
}
