//! Schema DDL and the sequential `upgrade.NNN.MMM.sql` statements applied
//! at process start, keyed off the store's `user_version` pragma.

/// Current schema version a freshly created store is stamped with, and
/// the version a booting process requires at minimum.
pub const REQUIRED_SCHEMA_VERSION: i64 = 3;

/// Columns common to every per-event table: the event header fields plus
/// the table's own kind-specific columns appended by each `CREATE TABLE`.
const EVENT_HEADER_COLUMNS: &str = "
    sequence_id TEXT NOT NULL,
    version TEXT NOT NULL,
    sender TEXT NOT NULL,
    arrival_time TEXT NOT NULL,
    create_time TEXT NOT NULL,
    event_time INTEGER NOT NULL,
";

/// Full schema as of [`REQUIRED_SCHEMA_VERSION`], applied directly to a
/// brand-new (empty) database file rather than replayed migration by
/// migration.
pub fn create_all_sql() -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS profile (
    id TEXT PRIMARY KEY,
    fingerprint TEXT NOT NULL,
    source BLOB NOT NULL,
    format_tag TEXT NOT NULL,
    title TEXT,
    author TEXT,
    notes TEXT,
    beverage TEXT,
    date_added TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sequence (
    id TEXT PRIMARY KEY,
    active_state TEXT NOT NULL,
    start_sequence TEXT NOT NULL,
    start_flow TEXT,
    end_flow TEXT,
    end_sequence TEXT,
    profile_id TEXT REFERENCES profile(id),
    profile_assumed INTEGER NOT NULL,
    resource_snapshot TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS state_update ({header}
    state TEXT NOT NULL,
    substate TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS shot_sample_with_volume_update ({header}
    sample_time REAL NOT NULL,
    group_pressure REAL NOT NULL,
    group_flow REAL NOT NULL,
    mix_temp REAL NOT NULL,
    head_temp REAL NOT NULL,
    volume_pour REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS weight_and_flow_update ({header}
    current_weight REAL NOT NULL,
    current_weight_time REAL NOT NULL,
    average_flow REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS water_level_update ({header}
    level_mm REAL NOT NULL,
    low_water_threshold_mm REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS sequencer_gate_notification ({header}
    gate TEXT NOT NULL,
    state TEXT NOT NULL,
    reason TEXT
);

CREATE TABLE IF NOT EXISTS stop_at_notification ({header}
    kind TEXT NOT NULL,
    action TEXT NOT NULL,
    target REAL NOT NULL,
    current REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS scale_tare_seen ({header}
    weight_at_tare REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS auto_tare_notification ({header}
    action TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS scale_button_press ({header}
    button TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS connectivity_change ({header}
    role TEXT NOT NULL,
    connected INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS device_availability ({header}
    role TEXT NOT NULL,
    availability TEXT NOT NULL,
    failure_reason TEXT
);

CREATE TABLE IF NOT EXISTS scale_change ({header}
    role TEXT NOT NULL,
    specific_class TEXT
);

CREATE TABLE IF NOT EXISTS bluedot_update ({header}
    label TEXT NOT NULL,
    value REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS persist_hkv (
    header TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT,
    PRIMARY KEY (header, key)
);
"#,
        header = EVENT_HEADER_COLUMNS
    )
}

/// `user_version` 1 → 2: adds `device_availability`.
pub const UPGRADE_001_002: &str = r#"
CREATE TABLE IF NOT EXISTS device_availability (
    sequence_id TEXT NOT NULL,
    version TEXT NOT NULL,
    sender TEXT NOT NULL,
    arrival_time TEXT NOT NULL,
    create_time TEXT NOT NULL,
    event_time INTEGER NOT NULL,
    role TEXT NOT NULL,
    availability TEXT NOT NULL,
    failure_reason TEXT
);
"#;

/// `user_version` 2 → 3: adds `scale_change` and `bluedot_update`.
pub const UPGRADE_002_003: &str = r#"
CREATE TABLE IF NOT EXISTS scale_change (
    sequence_id TEXT NOT NULL,
    version TEXT NOT NULL,
    sender TEXT NOT NULL,
    arrival_time TEXT NOT NULL,
    create_time TEXT NOT NULL,
    event_time INTEGER NOT NULL,
    role TEXT NOT NULL,
    specific_class TEXT
);
CREATE TABLE IF NOT EXISTS bluedot_update (
    sequence_id TEXT NOT NULL,
    version TEXT NOT NULL,
    sender TEXT NOT NULL,
    arrival_time TEXT NOT NULL,
    create_time TEXT NOT NULL,
    event_time INTEGER NOT NULL,
    label TEXT NOT NULL,
    value REAL NOT NULL
);
"#;

/// The base schema a version-1 store is assumed to already carry (every
/// table except the three added by the two upgrades above). Used only to
/// build realistic fixtures in tests; production stores are always
/// created at [`REQUIRED_SCHEMA_VERSION`] via [`create_all_sql`].
#[cfg(test)]
pub const VERSION_1_BASE_TABLES: &[&str] = &[
    "profile",
    "sequence",
    "state_update",
    "shot_sample_with_volume_update",
    "weight_and_flow_update",
    "water_level_update",
    "sequencer_gate_notification",
    "stop_at_notification",
    "scale_tare_seen",
    "auto_tare_notification",
    "scale_button_press",
    "connectivity_change",
    "persist_hkv",
];

/// Migrations to apply in ascending order, paired with the `user_version`
/// each one produces.
pub fn pending_upgrades(from_version: i64) -> Vec<(i64, &'static str)> {
    let mut upgrades = Vec::new();
    if from_version < 2 {
        upgrades.push((2, UPGRADE_001_002));
    }
    if from_version < 3 {
        upgrades.push((3, UPGRADE_002_003));
    }
    upgrades
}
