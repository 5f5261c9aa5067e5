//! `btleplug`-backed [`Scanner`](pyde1_server::device::Scanner): the one
//! real implementation `pyde1d` wires into the [`De1DeviceManager`], versus
//! the `NullScanner` used in tests and library-only embeddings.

use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager};
use pyde1_core::error::DeviceError;
use pyde1_server::device::Scanner;
use tracing::warn;

pub struct BtleplugScanner {
    adapter: Adapter,
}

impl BtleplugScanner {
    /// Picks the first adapter the platform reports, matching the single
    /// `BtleplugTransport::new` behaviour in `pyde1_bluetooth::transport`.
    pub async fn new() -> Result<Self, DeviceError> {
        let manager = Manager::new()
            .await
            .map_err(|e| DeviceError::TransportError("adapter".to_string(), e.to_string()))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| DeviceError::TransportError("adapter".to_string(), e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| {
                DeviceError::TransportError("adapter".to_string(), "no Bluetooth adapter present".to_string())
            })?;
        Ok(BtleplugScanner { adapter })
    }
}

#[async_trait]
impl Scanner for BtleplugScanner {
    async fn start_scan(&self, duration: Option<Duration>) -> Result<(), DeviceError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| DeviceError::TransportError("scan".to_string(), e.to_string()))?;
        if let Some(duration) = duration {
            let adapter = self.adapter.clone();
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                if let Err(e) = adapter.stop_scan().await {
                    warn!(error = %e, "timed scan could not be stopped cleanly");
                }
            });
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), DeviceError> {
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| DeviceError::TransportError("scan".to_string(), e.to_string()))
    }

    async fn force_disconnect(&self, address: &str) -> Result<(), DeviceError> {
        for peripheral in self
            .adapter
            .peripherals()
            .await
            .map_err(|e| DeviceError::TransportError("scan".to_string(), e.to_string()))?
        {
            if let Ok(Some(props)) = peripheral.properties().await {
                if props.address.to_string() == address {
                    return peripheral
                        .disconnect()
                        .await
                        .map_err(|e| DeviceError::TransportError(address.to_string(), e.to_string()));
                }
            }
        }
        // Not present in the adapter's view at all; nothing to force-drop.
        Ok(())
    }
}
