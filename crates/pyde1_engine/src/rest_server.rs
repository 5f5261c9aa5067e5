//! HTTP request surface: a `State<Arc<AppState>>` extractor, one `Router`
//! nested under a versioned prefix, and a `thiserror`-derived error enum
//! implementing `IntoResponse` so every handler can just return
//! `Result<_, PyDe1RestError>`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, put};
use axum::{Json, Router};
use pyde1_core::config::PyDe1Config;
use pyde1_core::error::{DeviceError, PyDe1Error, SequencerError, ValidationError};
use pyde1_core::message::{DeviceRole, MachineState};
use pyde1_core::EventBus;
use pyde1_device_config::{ProfileError, ProfileRegistry};
use pyde1_server::sequencer::{ActiveStateConfig, ProfileOverride};
use pyde1_server::{De1DeviceManager, FlowSequencer};
use pyde1_store::Store;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::info;

use crate::state_cache::DeviceStateCache;

const REQUEST_MAPPING_VERSION: &str = "1.0.0";
const RESOURCE_VERSION: &str = "1.0.0";
const MODULE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Everything a request handler needs. Cheap to clone (every field is
/// itself an `Arc`-backed handle).
#[derive(Clone)]
pub struct AppState {
    pub device_manager: De1DeviceManager,
    pub sequencer: FlowSequencer,
    pub profiles: Arc<ProfileRegistry>,
    pub store: Store,
    pub bus: EventBus,
    pub state_cache: Arc<DeviceStateCache>,
    pub config: Arc<PyDe1Config>,
}

#[derive(Error, Debug)]
pub enum PyDe1RestError {
    #[error("request body: {0}")]
    JsonRejection(JsonRejection),
    #[error(transparent)]
    Core(#[from] PyDe1Error),
    #[error("method not supported for this resource")]
    MethodNotSupported,
}

impl From<JsonRejection> for PyDe1RestError {
    fn from(rejection: JsonRejection) -> Self {
        PyDe1RestError::JsonRejection(rejection)
    }
}

impl From<ProfileError> for PyDe1RestError {
    fn from(error: ProfileError) -> Self {
        PyDe1RestError::Core(PyDe1Error::Validation(ValidationError::ValueError(
            "profile".to_string(),
            error.to_string(),
        )))
    }
}

impl IntoResponse for PyDe1RestError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            PyDe1RestError::JsonRejection(rejection) => (StatusCode::BAD_REQUEST, rejection.body_text()),
            PyDe1RestError::MethodNotSupported => (StatusCode::NOT_IMPLEMENTED, self.to_string()),
            PyDe1RestError::Core(error) => {
                let status =
                    StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                (status, error.to_string())
            }
        };
        (status, message).into_response()
    }
}

#[derive(Serialize)]
struct VersionResponse {
    request_mapping: &'static str,
    resource_set: &'static str,
    module: &'static str,
}

async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        request_mapping: REQUEST_MAPPING_VERSION,
        resource_set: RESOURCE_VERSION,
        module: MODULE_VERSION,
    })
}

#[derive(Serialize)]
struct De1StateResponse {
    state: Option<MachineState>,
    substate: Option<pyde1_core::message::Substate>,
}

async fn de1_state(State(state): State<AppState>) -> Json<De1StateResponse> {
    let (active_state, substate) = state.state_cache.state();
    Json(De1StateResponse {
        state: active_state,
        substate,
    })
}

#[derive(Serialize)]
struct FeatureFlags {
    ghc_active: bool,
    rinse_control: bool,
    firmware_version: &'static str,
}

async fn feature_flags(State(state): State<AppState>) -> Json<FeatureFlags> {
    Json(FeatureFlags {
        ghc_active: state.sequencer.ghc_active().await,
        rinse_control: true,
        firmware_version: MODULE_VERSION,
    })
}

#[derive(Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum AvailabilityRequest {
    AssignAddress { role: DeviceRole, address: Option<String> },
    Capture { role: DeviceRole },
    Release { role: DeviceRole },
    Forget { role: DeviceRole },
}

#[derive(Serialize)]
struct SetterResult {
    role: DeviceRole,
    applied: bool,
}

async fn patch_availability(
    State(state): State<AppState>,
    body: Result<Json<AvailabilityRequest>, JsonRejection>,
) -> Result<Json<Vec<SetterResult>>, PyDe1RestError> {
    let Json(request) = body?;
    let (role, result) = match request {
        AvailabilityRequest::AssignAddress { role, address } => {
            let device = state
                .device_manager
                .role(role)
                .ok_or_else(|| PyDe1Error::Device(DeviceError::UnsupportedFeature(role.to_string())))?;
            device.assign_address(address).await;
            (role, true)
        }
        AvailabilityRequest::Capture { role } => {
            let device = state
                .device_manager
                .role(role)
                .ok_or_else(|| PyDe1Error::Device(DeviceError::UnsupportedFeature(role.to_string())))?;
            device.capture().await;
            (role, true)
        }
        AvailabilityRequest::Release { role } => {
            let device = state
                .device_manager
                .role(role)
                .ok_or_else(|| PyDe1Error::Device(DeviceError::UnsupportedFeature(role.to_string())))?;
            device.release().await;
            (role, true)
        }
        AvailabilityRequest::Forget { role } => {
            let device = state
                .device_manager
                .role(role)
                .ok_or_else(|| PyDe1Error::Device(DeviceError::UnsupportedFeature(role.to_string())))?;
            device.assign_address(None).await;
            (role, true)
        }
    };
    Ok(Json(vec![SetterResult { role, applied: result }]))
}

#[derive(Deserialize)]
struct ScanRequest {
    begin: Option<f64>,
}

async fn patch_scan(
    State(state): State<AppState>,
    body: Result<Json<ScanRequest>, JsonRejection>,
) -> Result<(), PyDe1RestError> {
    let Json(request) = body?;
    let duration = request.begin.map(Duration::from_secs_f64);
    state.device_manager.start_scan(duration);
    Ok(())
}

fn parse_mode(mode: &str) -> Result<MachineState, PyDe1RestError> {
    let state = match mode {
        "espresso" => MachineState::Espresso,
        "steam" => MachineState::Steam,
        "hot_water" => MachineState::HotWater,
        "hot_water_rinse" => MachineState::HotWaterRinse,
        other => {
            return Err(PyDe1RestError::Core(PyDe1Error::Validation(ValidationError::ValueError(
                "mode".to_string(),
                format!("{other} is not a controllable active state"),
            ))))
        }
    };
    Ok(state)
}

async fn get_control(State(state): State<AppState>, Path(mode): Path<String>) -> Result<Json<ActiveStateConfig>, PyDe1RestError> {
    let mode = parse_mode(&mode)?;
    state
        .sequencer
        .control_config(mode)
        .await
        .map(Json)
        .ok_or_else(|| {
            PyDe1RestError::Core(PyDe1Error::Sequencer(SequencerError::NotAnActiveState(format!(
                "{mode:?}"
            ))))
        })
}

async fn patch_control(
    State(state): State<AppState>,
    Path(mode): Path<String>,
    body: Result<Json<ActiveStateConfig>, JsonRejection>,
) -> Result<Json<Vec<SetterResult>>, PyDe1RestError> {
    let mode = parse_mode(&mode)?;
    let Json(config) = body?;
    state.sequencer.set_control_config(mode, config).await;
    Ok(Json(vec![SetterResult {
        role: DeviceRole::De1,
        applied: true,
    }]))
}

#[derive(Serialize)]
struct ProfileUploadResult {
    id: String,
    fingerprint: String,
}

async fn put_profile(
    State(state): State<AppState>,
    body: axum::body::Bytes,
) -> Result<Json<ProfileUploadResult>, PyDe1RestError> {
    let id = state
        .profiles
        .insert(body.to_vec(), pyde1_device_config::FORMAT_TAG_V1, None, None, None, None)?;
    let profile = state.profiles.get(&id)?;
    Ok(Json(ProfileUploadResult {
        id: profile.id,
        fingerprint: profile.fingerprint,
    }))
}

#[derive(Deserialize)]
struct ProfileIdRequest {
    id: String,
}

async fn put_profile_id(
    State(state): State<AppState>,
    body: Result<Json<ProfileIdRequest>, JsonRejection>,
) -> Result<Json<ProfileUploadResult>, PyDe1RestError> {
    let Json(request) = body?;
    let profile = state.profiles.select_last_uploaded(&request.id)?;

    if let Ok(doc) = serde_json::from_slice::<pyde1_device_config::ProfileDocument>(&profile.source) {
        state
            .sequencer
            .set_profile_override(ProfileOverride {
                target_volume: doc.target_volume.map(|v| v as f64),
                target_weight: doc.target_weight.map(|w| w as f64),
            })
            .await;
    }

    Ok(Json(ProfileUploadResult {
        id: profile.id,
        fingerprint: profile.fingerprint,
    }))
}

#[derive(Serialize)]
struct LogEntry {
    id: String,
    size_bytes: u64,
}

async fn list_logs(State(state): State<AppState>) -> Json<Vec<LogEntry>> {
    let mut entries = Vec::new();
    if let Ok(read_dir) = std::fs::read_dir(&state.config.logging.directory) {
        for entry in read_dir.flatten() {
            if let (Some(name), Ok(metadata)) = (entry.file_name().to_str().map(str::to_string), entry.metadata()) {
                entries.push(LogEntry {
                    id: name,
                    size_bytes: metadata.len(),
                });
            }
        }
    }
    Json(entries)
}

async fn get_log(State(state): State<AppState>, Path(id): Path<String>) -> Result<String, PyDe1RestError> {
    // Only a bare file name is accepted; reject anything that could escape
    // the logging directory.
    if id.contains('/') || id.contains("..") {
        return Err(PyDe1RestError::Core(PyDe1Error::Validation(ValidationError::ValueError(
            "id".to_string(),
            "log id must be a bare file name".to_string(),
        ))));
    }
    let path = std::path::Path::new(&state.config.logging.directory).join(&id);
    std::fs::read_to_string(&path).map_err(|e| {
        PyDe1RestError::Core(PyDe1Error::Validation(ValidationError::ValueError(id, e.to_string())))
    })
}

async fn export_sequence(
    State(state): State<AppState>,
    Path(id): Path<uuid::Uuid>,
) -> Result<String, PyDe1RestError> {
    Ok(state.store.export_sequence(id).await?)
}

/// Every registered path's `MethodRouter` falls back to this handler for
/// any method it doesn't explicitly implement, turning axum's default 405
/// into the 501 the error handling design specifies for this case.
async fn method_not_supported() -> PyDe1RestError {
    PyDe1RestError::MethodNotSupported
}

/// Builds the full `/api/v1` router.
pub fn router(state: AppState) -> Router {
    Router::new().nest(
        "/api/v1",
        Router::new()
            .route("/version", get(version).fallback(method_not_supported))
            .route("/de1/state", get(de1_state).fallback(method_not_supported))
            .route("/de1/feature_flags", get(feature_flags).fallback(method_not_supported))
            .route("/de1/availability", patch(patch_availability).fallback(method_not_supported))
            .route("/scan", patch(patch_scan).fallback(method_not_supported))
            .route(
                "/de1/control/:mode",
                get(get_control).patch(patch_control).fallback(method_not_supported),
            )
            .route("/de1/profile", put(put_profile).fallback(method_not_supported))
            .route("/de1/profile/id", put(put_profile_id).fallback(method_not_supported))
            .route("/logs", get(list_logs).fallback(method_not_supported))
            .route("/log/:id", get(get_log).fallback(method_not_supported))
            .route("/sequence/:id/export", get(export_sequence).fallback(method_not_supported))
            .with_state(state),
    )
}

/// Binds and serves the REST API on `host:port` until the returned future
/// is dropped or the listener errors.
pub async fn run(state: AppState, host: &str, port: u16) -> std::io::Result<()> {
    let app = router(state);
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));
    info!(%addr, "pyde1 REST API listening");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await
}

#[cfg(test)]
mod test {
    use super::*;
    use pyde1_bluetooth::{ReconnectPolicy, ScratchArea, SpecializationRegistry};
    use pyde1_server::sequencer::FlowSequencerConfig;
    use std::sync::Arc as StdArc;

    fn test_state() -> (AppState, std::path::PathBuf) {
        let bus = EventBus::new();
        let dir = std::env::temp_dir().join(format!("pyde1-rest-test-{}", uuid::Uuid::new_v4()));
        let device_manager = De1DeviceManager::new(
            bus.clone(),
            ScratchArea::new(dir.clone(), "btid"),
            SpecializationRegistry::with_known_models(),
            ReconnectPolicy::default(),
            StdArc::new(pyde1_server::device::NullScanner),
        );
        let control = StdArc::new(device_manager.clone());
        let sequencer = FlowSequencer::new(bus.clone(), FlowSequencerConfig::default(), control);
        let profiles = StdArc::new(ProfileRegistry::new());
        let store = Store::open_in_memory().unwrap();
        let state_cache = StdArc::new(DeviceStateCache::spawn(bus.clone()));
        let state = AppState {
            device_manager,
            sequencer,
            profiles,
            store,
            bus,
            state_cache,
            config: StdArc::new(PyDe1Config::default()),
        };
        (state, dir)
    }

    #[tokio::test]
    async fn version_reports_the_module_version() {
        let (state, dir) = test_state();
        let Json(response) = version().await;
        assert_eq!(response.module, MODULE_VERSION);
        std::fs::remove_dir_all(dir).ok();
        let _ = state;
    }

    #[tokio::test]
    async fn unknown_control_mode_is_rejected() {
        let (state, dir) = test_state();
        let result = get_control(State(state), Path("sleep".to_string())).await;
        assert!(result.is_err());
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn espresso_control_mode_round_trips_through_get_and_patch() {
        let (state, dir) = test_state();
        let Json(mut config) = get_control(State(state.clone()), Path("espresso".to_string()))
            .await
            .unwrap();
        config.stop_at_volume = Some(42.0);
        patch_control(State(state.clone()), Path("espresso".to_string()), Ok(Json(config)))
            .await
            .unwrap();
        let Json(updated) = get_control(State(state), Path("espresso".to_string())).await.unwrap();
        assert_eq!(updated.stop_at_volume, Some(42.0));
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn profile_upload_then_select_by_id_sets_the_override() {
        let (state, dir) = test_state();
        let source = br#"{
            "title": null, "author": null, "notes": null, "beverage": null,
            "target_volume": 36.0, "target_weight": null,
            "steps": [
                {"name": "p", "temperature": 92.0, "pressure": 9.0, "flow": null,
                 "seconds": 25.0, "max_volume": null, "extended_limit": null}
            ]
        }"#;
        let Json(uploaded) = put_profile(State(state.clone()), axum::body::Bytes::from_static(source))
            .await
            .unwrap();

        let Json(selected) = put_profile_id(
            State(state.clone()),
            Ok(Json(ProfileIdRequest { id: uploaded.id.clone() })),
        )
        .await
        .unwrap();
        assert_eq!(selected.id, uploaded.id);
        assert_eq!(state.profiles.lookup_last_uploaded(), Some(uploaded.id));
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn method_not_supported_maps_to_501() {
        let response = PyDe1RestError::MethodNotSupported.into_response();
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn log_id_with_path_traversal_is_rejected() {
        let (state, dir) = test_state();
        let result = get_log(State(state), Path("../secret".to_string())).await;
        assert!(result.is_err());
        std::fs::remove_dir_all(dir).ok();
    }
}
