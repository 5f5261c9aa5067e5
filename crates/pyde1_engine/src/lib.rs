//! HTTP/MQTT process shell: wires the Managed Bluetooth Device layer,
//! FlowSequencer, Profile Registry, and Sequence Recorder into one running
//! daemon: a CLI, a configuration loader, a REST surface, and the
//! supervised top-level `select!` loop that owns orderly shutdown.

pub mod ipc;
pub mod mqtt;
pub mod options;
pub mod rest_server;
pub mod scanner;
pub mod state_cache;

use std::sync::Arc;
use std::time::Duration;

use pyde1_bluetooth::{ReconnectPolicy, ScratchArea, SpecializationRegistry};
use pyde1_core::config::PyDe1Config;
use pyde1_core::error::{PyDe1Error, PyDe1Result};
use pyde1_core::EventBus;
use pyde1_device_config::ProfileRegistry;
use pyde1_server::device::{NullScanner, Scanner};
use pyde1_server::sequencer::FlowSequencerConfig;
use pyde1_server::{De1DeviceManager, FlowSequencer};
use pyde1_store::{SequenceRecorder, Store, StoreBackedLastUploaded};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use crate::rest_server::AppState;
use crate::state_cache::DeviceStateCache;
use crate::scanner::BtleplugScanner;

/// Everything [`run`] assembled, held onto so shutdown can drain it in
/// order: stop accepting new sequences, await sequence close or a timeout,
/// release captured devices, flush the store, exit.
pub struct Engine {
    pub device_manager: De1DeviceManager,
    pub sequencer: FlowSequencer,
    pub store: Store,
    pub bus: EventBus,
}

impl Engine {
    /// Ordered shutdown drain: release every captured device, flush the
    /// store, then return. Does not itself stop the HTTP/MQTT tasks —
    /// callers drop those join handles (or cancel their tokens) once this
    /// returns.
    pub async fn shutdown(&self) {
        info!("draining: releasing captured devices");
        self.device_manager.de1().release().await;
        self.device_manager.scale().release().await;
        self.device_manager.thermometer().release().await;
        info!("draining: flushing store");
        self.store.flush().await;
    }
}

/// Builds every core component from `config` and wires them to `bus`,
/// without starting any network listener. Split out from [`run`] so tests
/// and the REST-layer test harness can build an [`AppState`] without
/// binding a real Bluetooth adapter.
pub async fn build(config: Arc<PyDe1Config>, scanner: Arc<dyn Scanner>) -> PyDe1Result<(Engine, AppState)> {
    let bus = EventBus::new();

    let scratch = ScratchArea::new(
        config.bluetooth.id_file_directory.clone(),
        config.bluetooth.id_file_suffix.clone(),
    );
    let registry = SpecializationRegistry::with_known_models();
    let policy = ReconnectPolicy {
        connect_timeout: Duration::from_secs(config.bluetooth.connect_timeout),
        reconnect_retry_count: config.bluetooth.reconnect_retry_count,
        reconnect_gap: Duration::from_secs(config.bluetooth.reconnect_gap),
    };
    let device_manager = De1DeviceManager::new(bus.clone(), scratch, registry, policy, scanner);
    device_manager.cleanup_stale_sessions().await;

    let sequencer_config = FlowSequencerConfig {
        watchdog_timeout: Duration::from_secs(config.de1.sequence_watchdog_timeout),
        stop_at_weight_adjust: config.de1.stop_at_weight_adjust,
        ..FlowSequencerConfig::default()
    };
    let control = Arc::new(device_manager.clone());
    let sequencer = FlowSequencer::new(bus.clone(), sequencer_config, control);
    sequencer.clone().spawn();

    let store = if config.database.filename.is_empty() {
        Store::open_in_memory()?
    } else {
        Store::open(&config.database.filename)?
    };
    let last_uploaded = Arc::new(StoreBackedLastUploaded::new(store.clone(), tokio::runtime::Handle::current()));
    let profiles = Arc::new(ProfileRegistry::with_persistence(last_uploaded));

    let state_cache = Arc::new(DeviceStateCache::spawn(bus.clone()));
    let recorder = SequenceRecorder::new(store.clone(), profiles.clone(), state_cache.clone());
    recorder.spawn(bus.clone());

    let engine = Engine {
        device_manager: device_manager.clone(),
        sequencer: sequencer.clone(),
        store: store.clone(),
        bus: bus.clone(),
    };
    let app_state = AppState {
        device_manager,
        sequencer,
        profiles,
        store,
        bus,
        state_cache,
        config,
    };
    Ok((engine, app_state))
}

/// Runs the daemon until a shutdown signal arrives, then drains in order
/// and returns. This is `pyde1d`'s entire body; kept in the library so
/// integration tests can drive it directly.
pub async fn run(config: PyDe1Config) -> PyDe1Result<()> {
    let config = Arc::new(config);

    let scanner: Arc<dyn Scanner> = match BtleplugScanner::new().await {
        Ok(scanner) => Arc::new(scanner),
        Err(e) => {
            warn!(error = %e, "no Bluetooth adapter available, running with scanning disabled");
            Arc::new(NullScanner)
        }
    };

    let (engine, app_state) = build(config.clone(), scanner).await?;

    let http_handle = {
        let state = app_state.clone();
        let host = config.http.server_host.clone();
        let port = config.http.server_port;
        tokio::spawn(async move {
            if let Err(e) = rest_server::run(state, &host, port).await {
                warn!(error = %e, "REST server exited");
            }
        })
    };

    let mqtt_handle = if config.mqtt.enabled {
        match mqtt::spawn(&config.mqtt, app_state.bus.clone()).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "could not start MQTT notification transport, continuing without it");
                None
            }
        }
    } else {
        None
    };

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining");

    http_handle.abort();
    if let Some(handle) = mqtt_handle {
        handle.abort();
    }
    engine.shutdown().await;
    info!("shutdown complete");
    Ok(())
}

/// Waits for any of the shutdown signals the concurrency model names:
/// INT, QUIT, TERM. `tokio::signal::unix` has no `SignalKind` for ABRT;
/// a process receiving SIGABRT is expected to core-dump rather than drain.
async fn wait_for_shutdown_signal() {
    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "could not install SIGINT handler");
            std::future::pending().await
        }
    };
    let mut quit = match signal(SignalKind::quit()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "could not install SIGQUIT handler");
            std::future::pending().await
        }
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "could not install SIGTERM handler");
            std::future::pending().await
        }
    };
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = quit.recv() => {}
        _ = terminate.recv() => {}
    }
}

/// Converts a startup failure the CLI can't recover from into the
/// supervisor-escalated `Fatal` variant, per the error handling design.
pub fn fatal(message: impl Into<String>) -> PyDe1Error {
    PyDe1Error::Fatal(message.into())
}
