//! The transactional store: a single `rusqlite` connection, owned
//! exclusively by a dedicated background thread, speaking WAL so other
//! processes may open the same file read-only. Writes arrive over a
//! channel and are batched on a short interval to amortise fsyncs, per
//! the Sequence Recorder design.

use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pyde1_core::error::{PyDe1Error, PyDe1Result, StoreError};
use pyde1_core::message::{Event, EventPayload};
use pyde1_device_config::{Profile, ProfileId};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::schema::{self, REQUIRED_SCHEMA_VERSION};

/// Fields captured at `SequenceStart.Set`, persisted once per sequence.
#[derive(Debug, Clone)]
pub struct SequenceSnapshot {
    pub id: Uuid,
    pub active_state: String,
    pub start_sequence: DateTime<Utc>,
    pub profile_id: Option<ProfileId>,
    pub profile_assumed: bool,
    /// DE1 settings/control/calibration/version and scale id, fetched
    /// synchronously from cached state (no on-wire reads on this path)
    /// and carried opaquely as JSON since the store has no interest in
    /// its internal shape.
    pub resource_snapshot: serde_json::Value,
}

/// Terminal fields set at `SequenceComplete.Set` / watchdog / device-lost
/// closure.
#[derive(Debug, Clone)]
pub struct SequenceClose {
    pub id: Uuid,
    pub start_flow: Option<DateTime<Utc>>,
    pub end_flow: Option<DateTime<Utc>>,
    pub end_sequence: DateTime<Utc>,
}

type Reply<T> = oneshot::Sender<PyDe1Result<T>>;

enum Command {
    InsertSequence(SequenceSnapshot, Reply<()>),
    CloseSequence(SequenceClose, Reply<()>),
    InsertEvent(Event, Reply<()>),
    InsertProfile(Profile, Reply<()>),
    GetProfile(ProfileId, Reply<Option<Profile>>),
    GetAllProfiles(oneshot::Sender<Vec<Profile>>),
    GetLastUploaded(oneshot::Sender<Option<ProfileId>>),
    SetLastUploaded(ProfileId, oneshot::Sender<()>),
    ExportSequence(Uuid, Reply<String>),
    Flush(oneshot::Sender<()>),
}

/// Handle to the store's writer thread. Cheap to clone; every clone
/// shares the same underlying connection via the command channel.
#[derive(Clone)]
pub struct Store {
    tx: std_mpsc::Sender<Command>,
}

const BATCH_INTERVAL: Duration = Duration::from_millis(100);
const MAX_BATCH: usize = 512;

impl Store {
    /// Opens (creating if absent) the store at `path`, performing schema
    /// upgrade if its `user_version` is below [`REQUIRED_SCHEMA_VERSION`],
    /// and spawns the dedicated writer thread.
    pub fn open(path: impl AsRef<Path>) -> PyDe1Result<Store> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                PyDe1Error::Store(StoreError::Backend(format!(
                    "could not create store directory {}: {e}",
                    parent.display()
                )))
            })?;
        }
        let mut conn = Connection::open(&path)
            .map_err(|e| PyDe1Error::Store(StoreError::Backend(e.to_string())))?;
        prepare_connection(&mut conn, &path)?;

        let (tx, rx) = std_mpsc::channel::<Command>();
        std::thread::Builder::new()
            .name("pyde1-store-writer".to_string())
            .spawn(move || writer_loop(conn, rx))
            .map_err(|e| PyDe1Error::Fatal(format!("could not spawn store writer thread: {e}")))?;

        Ok(Store { tx })
    }

    /// Opens an in-memory store, schema applied directly at
    /// [`REQUIRED_SCHEMA_VERSION`]. Used by tests and by a process run
    /// without `database.FILENAME` configured.
    pub fn open_in_memory() -> PyDe1Result<Store> {
        let mut conn = Connection::open_in_memory()
            .map_err(|e| PyDe1Error::Store(StoreError::Backend(e.to_string())))?;
        apply_fresh_schema(&mut conn)?;
        let (tx, rx) = std_mpsc::channel::<Command>();
        std::thread::Builder::new()
            .name("pyde1-store-writer".to_string())
            .spawn(move || writer_loop(conn, rx))
            .map_err(|e| PyDe1Error::Fatal(format!("could not spawn store writer thread: {e}")))?;
        Ok(Store { tx })
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> PyDe1Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .map_err(|_| PyDe1Error::Store(StoreError::Backend("store writer thread is gone".to_string())))?;
        reply_rx
            .await
            .map_err(|_| PyDe1Error::Store(StoreError::Backend("store writer thread dropped reply".to_string())))?
    }

    pub async fn insert_sequence(&self, snapshot: SequenceSnapshot) -> PyDe1Result<()> {
        self.call(|reply| Command::InsertSequence(snapshot, reply)).await
    }

    pub async fn close_sequence(&self, close: SequenceClose) -> PyDe1Result<()> {
        self.call(|reply| Command::CloseSequence(close, reply)).await
    }

    pub async fn insert_event(&self, event: Event) -> PyDe1Result<()> {
        self.call(|reply| Command::InsertEvent(event, reply)).await
    }

    pub async fn insert_profile(&self, profile: Profile) -> PyDe1Result<()> {
        self.call(|reply| Command::InsertProfile(profile, reply)).await
    }

    pub async fn get_profile(&self, id: ProfileId) -> PyDe1Result<Option<Profile>> {
        self.call(|reply| Command::GetProfile(id, reply)).await
    }

    /// Every profile row in the store, used to rehydrate
    /// [`pyde1_device_config::ProfileRegistry`]'s in-memory index at
    /// startup.
    pub async fn get_all_profiles(&self) -> Vec<Profile> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::GetAllProfiles(tx)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn get_last_uploaded(&self) -> Option<ProfileId> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::GetLastUploaded(tx)).is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    pub async fn set_last_uploaded(&self, id: ProfileId) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::SetLastUploaded(id, tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Renders one closed sequence to the legacy tab/whitespace export
    /// format. Fails with `IncompleteSequenceRecord` if the sequence has
    /// not yet closed.
    pub async fn export_sequence(&self, id: Uuid) -> PyDe1Result<String> {
        self.call(|reply| Command::ExportSequence(id, reply)).await
    }

    /// Blocks until every command enqueued so far has been applied.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Implements [`pyde1_device_config::LastUploadedStore`] over the store's
/// `persist_hkv` table so [`pyde1_device_config::ProfileRegistry`] can be
/// constructed with `with_persistence` against a live `Store`.
pub struct StoreBackedLastUploaded {
    store: Store,
    handle: tokio::runtime::Handle,
}

impl StoreBackedLastUploaded {
    pub fn new(store: Store, handle: tokio::runtime::Handle) -> Self {
        StoreBackedLastUploaded { store, handle }
    }
}

impl pyde1_device_config::LastUploadedStore for StoreBackedLastUploaded {
    fn get_last_uploaded(&self) -> Option<ProfileId> {
        let store = self.store.clone();
        tokio::task::block_in_place(|| self.handle.block_on(async move { store.get_last_uploaded().await }))
    }

    fn set_last_uploaded(&self, id: ProfileId) {
        let store = self.store.clone();
        tokio::task::block_in_place(|| self.handle.block_on(async move { store.set_last_uploaded(id).await }))
    }

    fn save_profile(&self, profile: &Profile) {
        let store = self.store.clone();
        let profile = profile.clone();
        tokio::task::block_in_place(|| {
            self.handle.block_on(async move {
                if let Err(e) = store.insert_profile(profile).await {
                    error!(error = %e, "could not persist uploaded profile");
                }
            })
        })
    }

    fn load_profiles(&self) -> Vec<Profile> {
        let store = self.store.clone();
        tokio::task::block_in_place(|| self.handle.block_on(async move { store.get_all_profiles().await }))
    }
}

fn prepare_connection(conn: &mut Connection, path: &Path) -> PyDe1Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(|e| PyDe1Error::Store(StoreError::Backend(e.to_string())))?;
    let current_version: i64 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(|e| PyDe1Error::Store(StoreError::Backend(e.to_string())))?;

    if current_version == 0 {
        apply_fresh_schema(conn)?;
        return Ok(());
    }
    if current_version > REQUIRED_SCHEMA_VERSION {
        return Err(PyDe1Error::Store(StoreError::SchemaTooNew(
            current_version,
            REQUIRED_SCHEMA_VERSION,
        )));
    }
    if current_version < REQUIRED_SCHEMA_VERSION {
        backup_store_file(path)?;
        for (target_version, sql) in schema::pending_upgrades(current_version) {
            info!(target_version, "applying store schema upgrade");
            conn.execute_batch(sql)
                .map_err(|e| PyDe1Error::Store(StoreError::Backend(e.to_string())))?;
            conn.pragma_update(None, "user_version", target_version)
                .map_err(|e| PyDe1Error::Store(StoreError::Backend(e.to_string())))?;
        }
    }
    Ok(())
}

fn apply_fresh_schema(conn: &mut Connection) -> PyDe1Result<()> {
    conn.execute_batch(&schema::create_all_sql())
        .map_err(|e| PyDe1Error::Store(StoreError::Backend(e.to_string())))?;
    conn.pragma_update(None, "user_version", REQUIRED_SCHEMA_VERSION)
        .map_err(|e| PyDe1Error::Store(StoreError::Backend(e.to_string())))?;
    Ok(())
}

fn backup_store_file(path: &Path) -> PyDe1Result<()> {
    let stamp = Utc::now().format("%Y%m%d_%H%M");
    let backup_path: PathBuf = {
        let mut name = path.as_os_str().to_os_string();
        name.push(format!(".{stamp}"));
        PathBuf::from(name)
    };
    std::fs::copy(path, &backup_path).map_err(|e| {
        PyDe1Error::Store(StoreError::Backend(format!(
            "could not back up store before schema upgrade: {e}"
        )))
    })?;
    info!(backup = %backup_path.display(), "backed up store before schema upgrade");
    Ok(())
}

fn writer_loop(conn: Connection, rx: std_mpsc::Receiver<Command>) {
    loop {
        let first = match rx.recv_timeout(BATCH_INTERVAL) {
            Ok(command) => command,
            Err(std_mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
        };
        let mut batch = vec![first];
        while batch.len() < MAX_BATCH {
            match rx.try_recv() {
                Ok(command) => batch.push(command),
                Err(_) => break,
            }
        }
        apply_batch(&conn, batch);
    }
    debug!("store writer thread exiting, channel closed");
}

fn apply_batch(conn: &Connection, batch: Vec<Command>) {
    if let Err(e) = conn.execute_batch("BEGIN IMMEDIATE") {
        error!(error = %e, "could not begin store write batch");
        return;
    }
    for command in batch {
        match command {
            Command::InsertSequence(snapshot, reply) => {
                let _ = reply.send(insert_sequence(conn, &snapshot));
            }
            Command::CloseSequence(close, reply) => {
                let _ = reply.send(close_sequence(conn, &close));
            }
            Command::InsertEvent(event, reply) => {
                let _ = reply.send(insert_event(conn, &event));
            }
            Command::InsertProfile(profile, reply) => {
                let _ = reply.send(insert_profile(conn, &profile));
            }
            Command::GetProfile(id, reply) => {
                let _ = reply.send(get_profile(conn, &id));
            }
            Command::GetAllProfiles(reply) => {
                let _ = reply.send(get_all_profiles(conn).unwrap_or_else(|e| {
                    error!(error = %e, "could not load persisted profiles");
                    Vec::new()
                }));
            }
            Command::GetLastUploaded(reply) => {
                let _ = reply.send(get_hkv(conn, "profile", "last_uploaded"));
            }
            Command::SetLastUploaded(id, reply) => {
                if let Err(e) = set_hkv(conn, "profile", "last_uploaded", &id) {
                    warn!(error = %e, "could not persist last-uploaded profile id");
                }
                let _ = reply.send(());
            }
            Command::ExportSequence(id, reply) => {
                let _ = reply.send(export_sequence(conn, id));
            }
            Command::Flush(reply) => {
                let _ = reply.send(());
            }
        }
    }
    if let Err(e) = conn.execute_batch("COMMIT") {
        error!(error = %e, "could not commit store write batch");
    }
}

fn insert_sequence(conn: &Connection, snapshot: &SequenceSnapshot) -> PyDe1Result<()> {
    conn.execute(
        "INSERT INTO sequence (id, active_state, start_sequence, profile_id, profile_assumed, resource_snapshot)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            snapshot.id.to_string(),
            snapshot.active_state,
            snapshot.start_sequence.to_rfc3339(),
            snapshot.profile_id,
            snapshot.profile_assumed as i64,
            snapshot.resource_snapshot.to_string(),
        ],
    )
    .map_err(|e| PyDe1Error::Store(StoreError::Backend(e.to_string())))?;
    Ok(())
}

fn close_sequence(conn: &Connection, close: &SequenceClose) -> PyDe1Result<()> {
    conn.execute(
        "UPDATE sequence SET start_flow = ?2, end_flow = ?3, end_sequence = ?4 WHERE id = ?1",
        params![
            close.id.to_string(),
            close.start_flow.map(|t| t.to_rfc3339()),
            close.end_flow.map(|t| t.to_rfc3339()),
            close.end_sequence.to_rfc3339(),
        ],
    )
    .map_err(|e| PyDe1Error::Store(StoreError::Backend(e.to_string())))?;
    Ok(())
}

/// Table each event kind is persisted to, mirroring the store layout's
/// per-event-table list.
fn table_for(payload: &EventPayload) -> &'static str {
    match payload {
        EventPayload::StateUpdate(_) => "state_update",
        EventPayload::ShotSample(_) => "shot_sample_with_volume_update",
        EventPayload::WeightAndFlow(_) => "weight_and_flow_update",
        EventPayload::WaterLevel(_) => "water_level_update",
        EventPayload::SequencerGate(_) => "sequencer_gate_notification",
        EventPayload::StopAt(_) => "stop_at_notification",
        EventPayload::ScaleTare(_) => "scale_tare_seen",
        EventPayload::AutoTare(_) => "auto_tare_notification",
        EventPayload::ScaleButton(_) => "scale_button_press",
        EventPayload::Connectivity(_) => "connectivity_change",
        EventPayload::DeviceAvailability(_) => "device_availability",
        EventPayload::DeviceChanged(_) => "scale_change",
        EventPayload::BlueDotUpdate(_) => "bluedot_update",
    }
}

fn insert_event(conn: &Connection, event: &Event) -> PyDe1Result<()> {
    let table = table_for(&event.payload);
    let header = &event.header;
    let result = match &event.payload {
        EventPayload::StateUpdate(p) => conn.execute(
            &format!("INSERT INTO {table} (sequence_id, version, sender, arrival_time, create_time, event_time, state, substate) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)"),
            params![header.sequence_id.to_string(), header.version, header.sender, header.arrival_time.to_rfc3339(), header.create_time.to_rfc3339(), header.event_time as i64, format!("{:?}", p.state), format!("{:?}", p.substate)],
        ),
        EventPayload::ShotSample(p) => conn.execute(
            &format!("INSERT INTO {table} (sequence_id, version, sender, arrival_time, create_time, event_time, sample_time, group_pressure, group_flow, mix_temp, head_temp, volume_pour) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)"),
            params![header.sequence_id.to_string(), header.version, header.sender, header.arrival_time.to_rfc3339(), header.create_time.to_rfc3339(), header.event_time as i64, p.sample_time, p.group_pressure, p.group_flow, p.mix_temp, p.head_temp, p.volume_pour],
        ),
        EventPayload::WeightAndFlow(p) => conn.execute(
            &format!("INSERT INTO {table} (sequence_id, version, sender, arrival_time, create_time, event_time, current_weight, current_weight_time, average_flow) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)"),
            params![header.sequence_id.to_string(), header.version, header.sender, header.arrival_time.to_rfc3339(), header.create_time.to_rfc3339(), header.event_time as i64, p.current_weight, p.current_weight_time, p.average_flow],
        ),
        EventPayload::WaterLevel(p) => conn.execute(
            &format!("INSERT INTO {table} (sequence_id, version, sender, arrival_time, create_time, event_time, level_mm, low_water_threshold_mm) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)"),
            params![header.sequence_id.to_string(), header.version, header.sender, header.arrival_time.to_rfc3339(), header.create_time.to_rfc3339(), header.event_time as i64, p.level_mm, p.low_water_threshold_mm],
        ),
        EventPayload::SequencerGate(p) => conn.execute(
            &format!("INSERT INTO {table} (sequence_id, version, sender, arrival_time, create_time, event_time, gate, state, reason) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)"),
            params![header.sequence_id.to_string(), header.version, header.sender, header.arrival_time.to_rfc3339(), header.create_time.to_rfc3339(), header.event_time as i64, format!("{:?}", p.gate), format!("{:?}", p.state), p.reason.map(|r| format!("{r:?}"))],
        ),
        EventPayload::StopAt(p) => conn.execute(
            &format!("INSERT INTO {table} (sequence_id, version, sender, arrival_time, create_time, event_time, kind, action, target, current) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)"),
            params![header.sequence_id.to_string(), header.version, header.sender, header.arrival_time.to_rfc3339(), header.create_time.to_rfc3339(), header.event_time as i64, format!("{:?}", p.kind), format!("{:?}", p.action), p.target, p.current],
        ),
        EventPayload::ScaleTare(p) => conn.execute(
            &format!("INSERT INTO {table} (sequence_id, version, sender, arrival_time, create_time, event_time, weight_at_tare) VALUES (?1,?2,?3,?4,?5,?6,?7)"),
            params![header.sequence_id.to_string(), header.version, header.sender, header.arrival_time.to_rfc3339(), header.create_time.to_rfc3339(), header.event_time as i64, p.weight_at_tare],
        ),
        EventPayload::AutoTare(p) => conn.execute(
            &format!("INSERT INTO {table} (sequence_id, version, sender, arrival_time, create_time, event_time, action) VALUES (?1,?2,?3,?4,?5,?6,?7)"),
            params![header.sequence_id.to_string(), header.version, header.sender, header.arrival_time.to_rfc3339(), header.create_time.to_rfc3339(), header.event_time as i64, format!("{:?}", p.action)],
        ),
        EventPayload::ScaleButton(p) => conn.execute(
            &format!("INSERT INTO {table} (sequence_id, version, sender, arrival_time, create_time, event_time, button) VALUES (?1,?2,?3,?4,?5,?6,?7)"),
            params![header.sequence_id.to_string(), header.version, header.sender, header.arrival_time.to_rfc3339(), header.create_time.to_rfc3339(), header.event_time as i64, format!("{:?}", p.button)],
        ),
        EventPayload::Connectivity(p) => conn.execute(
            &format!("INSERT INTO {table} (sequence_id, version, sender, arrival_time, create_time, event_time, role, connected) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)"),
            params![header.sequence_id.to_string(), header.version, header.sender, header.arrival_time.to_rfc3339(), header.create_time.to_rfc3339(), header.event_time as i64, p.role.to_string(), p.connected as i64],
        ),
        EventPayload::DeviceAvailability(p) => conn.execute(
            &format!("INSERT INTO {table} (sequence_id, version, sender, arrival_time, create_time, event_time, role, availability, failure_reason) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)"),
            params![header.sequence_id.to_string(), header.version, header.sender, header.arrival_time.to_rfc3339(), header.create_time.to_rfc3339(), header.event_time as i64, p.role.to_string(), format!("{:?}", p.availability), p.failure_reason],
        ),
        EventPayload::DeviceChanged(p) => conn.execute(
            &format!("INSERT INTO {table} (sequence_id, version, sender, arrival_time, create_time, event_time, role, specific_class) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)"),
            params![header.sequence_id.to_string(), header.version, header.sender, header.arrival_time.to_rfc3339(), header.create_time.to_rfc3339(), header.event_time as i64, p.role.to_string(), p.specific_class],
        ),
        EventPayload::BlueDotUpdate(p) => conn.execute(
            &format!("INSERT INTO {table} (sequence_id, version, sender, arrival_time, create_time, event_time, label, value) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)"),
            params![header.sequence_id.to_string(), header.version, header.sender, header.arrival_time.to_rfc3339(), header.create_time.to_rfc3339(), header.event_time as i64, p.label, p.value],
        ),
    };
    result
        .map(|_| ())
        .map_err(|e| PyDe1Error::Store(StoreError::Backend(e.to_string())))
}

fn insert_profile(conn: &Connection, profile: &Profile) -> PyDe1Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO profile (id, fingerprint, source, format_tag, title, author, notes, beverage, date_added)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
        params![
            profile.id,
            profile.fingerprint,
            profile.source,
            profile.format_tag,
            profile.title,
            profile.author,
            profile.notes,
            profile.beverage,
            profile.date_added.to_rfc3339(),
        ],
    )
    .map_err(|e| PyDe1Error::Store(StoreError::Backend(e.to_string())))?;
    Ok(())
}

fn get_profile(conn: &Connection, id: &str) -> PyDe1Result<Option<Profile>> {
    conn.query_row(
        "SELECT id, fingerprint, source, format_tag, title, author, notes, beverage, date_added FROM profile WHERE id = ?1",
        params![id],
        |row| {
            Ok(Profile {
                id: row.get(0)?,
                fingerprint: row.get(1)?,
                source: row.get(2)?,
                format_tag: row.get(3)?,
                title: row.get(4)?,
                author: row.get(5)?,
                notes: row.get(6)?,
                beverage: row.get(7)?,
                date_added: row
                    .get::<_, String>(8)?
                    .parse::<DateTime<Utc>>()
                    .unwrap_or_else(|_| Utc::now()),
            })
        },
    )
    .optional()
    .map_err(|e| PyDe1Error::Store(StoreError::Backend(e.to_string())))
}

fn get_all_profiles(conn: &Connection) -> PyDe1Result<Vec<Profile>> {
    let mut stmt = conn
        .prepare("SELECT id, fingerprint, source, format_tag, title, author, notes, beverage, date_added FROM profile")
        .map_err(|e| PyDe1Error::Store(StoreError::Backend(e.to_string())))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(Profile {
                id: row.get(0)?,
                fingerprint: row.get(1)?,
                source: row.get(2)?,
                format_tag: row.get(3)?,
                title: row.get(4)?,
                author: row.get(5)?,
                notes: row.get(6)?,
                beverage: row.get(7)?,
                date_added: row
                    .get::<_, String>(8)?
                    .parse::<DateTime<Utc>>()
                    .unwrap_or_else(|_| Utc::now()),
            })
        })
        .map_err(|e| PyDe1Error::Store(StoreError::Backend(e.to_string())))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| PyDe1Error::Store(StoreError::Backend(e.to_string())))?;
    Ok(rows)
}

fn get_hkv(conn: &Connection, header: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT value FROM persist_hkv WHERE header = ?1 AND key = ?2",
        params![header, key],
        |row| row.get(0),
    )
    .optional()
    .ok()
    .flatten()
}

fn set_hkv(conn: &Connection, header: &str, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO persist_hkv (header, key, value) VALUES (?1, ?2, ?3)
         ON CONFLICT(header, key) DO UPDATE SET value = excluded.value",
        params![header, key, value],
    )?;
    Ok(())
}

fn export_sequence(conn: &Connection, id: Uuid) -> PyDe1Result<String> {
    let id_str = id.to_string();
    let end_sequence: Option<String> = conn
        .query_row(
            "SELECT end_sequence FROM sequence WHERE id = ?1",
            params![id_str],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| PyDe1Error::Store(StoreError::Backend(e.to_string())))?
        .ok_or_else(|| PyDe1Error::Store(StoreError::IncompleteSequenceRecord(id_str.clone())))?;
    if end_sequence.is_none() {
        return Err(PyDe1Error::Store(StoreError::IncompleteSequenceRecord(id_str)));
    }

    let mut stmt = conn
        .prepare(
            "SELECT sample_time, group_pressure, group_flow, mix_temp, head_temp, volume_pour
             FROM shot_sample_with_volume_update WHERE sequence_id = ?1 ORDER BY sample_time ASC",
        )
        .map_err(|e| PyDe1Error::Store(StoreError::Backend(e.to_string())))?;
    let rows = stmt
        .query_map(params![id_str], |row| {
            Ok(crate::export::ShotSampleRow {
                sample_time: row.get(0)?,
                group_pressure: row.get(1)?,
                group_flow: row.get(2)?,
                mix_temp: row.get(3)?,
                head_temp: row.get(4)?,
                volume_pour: row.get(5)?,
            })
        })
        .map_err(|e| PyDe1Error::Store(StoreError::Backend(e.to_string())))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| PyDe1Error::Store(StoreError::Backend(e.to_string())))?;

    Ok(crate::export::render(&rows))
}

#[cfg(test)]
mod test {
    use super::*;
    use pyde1_core::message::{Event, EventHeader, ShotSamplePayload};

    #[tokio::test]
    async fn in_memory_store_accepts_sequence_and_events_then_closes() {
        let store = Store::open_in_memory().unwrap();
        let id = Uuid::new_v4();
        store
            .insert_sequence(SequenceSnapshot {
                id,
                active_state: "Espresso".to_string(),
                start_sequence: Utc::now(),
                profile_id: None,
                profile_assumed: true,
                resource_snapshot: serde_json::json!({}),
            })
            .await
            .unwrap();

        let header = EventHeader::new_now("de1").with_sequence_id(id);
        store
            .insert_event(Event {
                header,
                payload: EventPayload::ShotSample(ShotSamplePayload {
                    sample_time: 1.0,
                    group_pressure: 6.0,
                    group_flow: 2.0,
                    mix_temp: 92.0,
                    head_temp: 92.0,
                    volume_pour: 2.0,
                }),
            })
            .await
            .unwrap();

        let export_before_close = store.export_sequence(id).await;
        assert!(export_before_close.is_err());

        store
            .close_sequence(SequenceClose {
                id,
                start_flow: Some(Utc::now()),
                end_flow: Some(Utc::now()),
                end_sequence: Utc::now(),
            })
            .await
            .unwrap();

        let export = store.export_sequence(id).await.unwrap();
        assert!(export.contains("time\tpressure"));
        assert!(export.contains("2.00"));
    }

    #[tokio::test]
    async fn last_uploaded_round_trips_through_persist_hkv() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.get_last_uploaded().await, None);
        store.set_last_uploaded("abc123".to_string()).await;
        assert_eq!(store.get_last_uploaded().await, Some("abc123".to_string()));
    }
}
