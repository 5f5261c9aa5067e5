//! Transport abstraction a [`crate::managed_device::ManagedDevice`] drives,
//! and the `btleplug`-backed implementation used in production. Modeled on
//! the connect/discover/subscribe/notify sequence from `btleplug`'s own
//! notification example, wrapped so the lifecycle supervisor never talks
//! to `btleplug` types directly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::StreamExt;
use pyde1_core::error::DeviceError;
use pyde1_core::message::MachineState;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Role-specific command a [`Transport`] may be asked to carry out, a seam
/// atop the raw connect/initialise surface. Encoding into the DE1's actual MMR
/// writes is peripheral-specific and left to each concrete `Transport`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviceCommand {
    RequestState(MachineState),
    TareScale,
}

/// What a [`ManagedDevice`](crate::managed_device::ManagedDevice) needs
/// from its underlying physical connection. Implemented once for real
/// hardware via `btleplug`; fakeable in tests.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, address: &str) -> Result<(), DeviceError>;
    async fn disconnect(&self) -> Result<(), DeviceError>;
    /// Post-connect initialisation (characteristic discovery, subscribe to
    /// notify characteristics, read startup registers). Completion flips
    /// the device's `Ready` refinement.
    async fn initialize(&self) -> Result<(), DeviceError>;
    /// The advertised name last seen for this peripheral, used to resolve
    /// class specialisation.
    fn advertised_name(&self) -> Option<String>;
    /// Resolves when the transport observes a disconnect it did not
    /// initiate itself via [`Transport::disconnect`].
    async fn wait_unexpected_disconnect(&self);
    /// Issues a role-specific command. The default rejects every command;
    /// a role's concrete transport overrides this for the commands it
    /// actually understands.
    async fn send_command(&self, command: DeviceCommand) -> Result<(), DeviceError> {
        let _ = command;
        Err(DeviceError::UnsupportedFeature(
            "this transport does not implement send_command".to_string(),
        ))
    }
}

/// A `btleplug`-backed [`Transport`] bound to one role's address.
pub struct BtleplugTransport {
    adapter: Adapter,
    peripheral: tokio::sync::RwLock<Option<Peripheral>>,
    advertised_name: tokio::sync::RwLock<Option<String>>,
    disconnect_notify: Arc<Notify>,
    willful: std::sync::atomic::AtomicBool,
}

impl BtleplugTransport {
    pub async fn new() -> Result<Self, DeviceError> {
        let manager = Manager::new()
            .await
            .map_err(|e| DeviceError::TransportError("adapter".to_string(), e.to_string()))?;
        let adapters = manager
            .adapters()
            .await
            .map_err(|e| DeviceError::TransportError("adapter".to_string(), e.to_string()))?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| DeviceError::TransportError("adapter".to_string(), "no Bluetooth adapter present".to_string()))?;
        Ok(BtleplugTransport {
            adapter,
            peripheral: tokio::sync::RwLock::new(None),
            advertised_name: tokio::sync::RwLock::new(None),
            disconnect_notify: Arc::new(Notify::new()),
            willful: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub async fn start_scan(&self) -> Result<(), DeviceError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| DeviceError::TransportError("scan".to_string(), e.to_string()))
    }

    async fn find_by_address(&self, address: &str) -> Result<Peripheral, DeviceError> {
        for peripheral in self
            .adapter
            .peripherals()
            .await
            .map_err(|e| DeviceError::TransportError("scan".to_string(), e.to_string()))?
        {
            if let Ok(Some(props)) = peripheral.properties().await {
                if props.address.to_string() == address {
                    if let Some(name) = &props.local_name {
                        *self.advertised_name.write().await = Some(name.clone());
                    }
                    return Ok(peripheral);
                }
            }
        }
        Err(DeviceError::DeviceNotConnected(address.to_string()))
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    async fn connect(&self, address: &str) -> Result<(), DeviceError> {
        let peripheral = self.find_by_address(address).await?;
        peripheral
            .connect()
            .await
            .map_err(|e| DeviceError::TransportError(address.to_string(), e.to_string()))?;
        *self.peripheral.write().await = Some(peripheral);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DeviceError> {
        self.willful.store(true, std::sync::atomic::Ordering::Release);
        if let Some(peripheral) = self.peripheral.write().await.take() {
            peripheral
                .disconnect()
                .await
                .map_err(|e| DeviceError::TransportError("disconnect".to_string(), e.to_string()))?;
        }
        Ok(())
    }

    async fn initialize(&self) -> Result<(), DeviceError> {
        let guard = self.peripheral.read().await;
        let Some(peripheral) = guard.as_ref() else {
            return Err(DeviceError::DeviceNotConnected("unbound".to_string()));
        };
        peripheral
            .discover_services()
            .await
            .map_err(|e| DeviceError::TransportError("discover_services".to_string(), e.to_string()))?;
        for characteristic in peripheral.characteristics() {
            if characteristic
                .properties
                .contains(btleplug::api::CharPropFlags::NOTIFY)
            {
                if let Err(e) = peripheral.subscribe(&characteristic).await {
                    warn!(error = %e, uuid = %characteristic.uuid, "could not subscribe to notify characteristic");
                }
            }
        }
        let notify = self.disconnect_notify.clone();
        let mut events = peripheral
            .notifications()
            .await
            .map_err(|e| DeviceError::TransportError("notifications".to_string(), e.to_string()))?;
        tokio::spawn(async move {
            while events.next().await.is_some() {
                debug!("characteristic notification received");
            }
            notify.notify_waiters();
        });
        Ok(())
    }

    fn advertised_name(&self) -> Option<String> {
        self.advertised_name.try_read().ok().and_then(|g| g.clone())
    }

    async fn wait_unexpected_disconnect(&self) {
        loop {
            self.disconnect_notify.notified().await;
            if !self.willful.swap(false, std::sync::atomic::Ordering::AcqRel) {
                return;
            }
        }
    }
}

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
