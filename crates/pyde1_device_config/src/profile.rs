//! Content-addressed profile storage and the compiler that turns a
//! profile's source bytes into the canonical frame sequence the
//! fingerprint is computed over.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::ProfileError;
use crate::frame::{CompiledFrames, ShotDescHeader, ShotExtFrame, ShotFrame, ShotTail};

pub type ProfileId = String;

/// A single step of the JSON profile document format (`format_tag ==
/// "pyde1_profile_v1"`), compiled in order into a [`ShotFrame`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileStep {
    pub name: String,
    pub temperature: f32,
    pub pressure: Option<f32>,
    pub flow: Option<f32>,
    pub seconds: f32,
    pub max_volume: Option<f32>,
    pub extended_limit: Option<ExtendedLimit>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExtendedLimit {
    pub range: f32,
    pub max: f32,
}

/// The JSON document a profile upload's source bytes deserialize to.
/// `title` / `author` / `notes` are metadata and are deliberately excluded
/// from the fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileDocument {
    pub title: Option<String>,
    pub author: Option<String>,
    pub notes: Option<String>,
    pub beverage: Option<String>,
    pub target_volume: Option<f32>,
    pub target_weight: Option<f32>,
    pub steps: Vec<ProfileStep>,
}

pub const FORMAT_TAG_V1: &str = "pyde1_profile_v1";

/// Compiles a parsed document into the canonical frame sequence.
/// Preinfuse frames are every step preceding the first with a non-null
/// `flow`, by convention of this format.
pub fn compile(doc: &ProfileDocument) -> Result<CompiledFrames, ProfileError> {
    if doc.steps.is_empty() {
        return Err(ProfileError::InvalidStep(0, "profile has no steps".to_string()));
    }
    let mut frames = Vec::with_capacity(doc.steps.len());
    let mut ext_frames = Vec::new();
    let mut preinfuse_count: u8 = 0;
    let mut seen_flow_step = false;

    for (idx, step) in doc.steps.iter().enumerate() {
        if step.seconds <= 0.0 {
            return Err(ProfileError::InvalidStep(
                idx,
                "seconds must be positive".to_string(),
            ));
        }
        if !seen_flow_step {
            if step.flow.is_some() {
                seen_flow_step = true;
            } else {
                preinfuse_count += 1;
            }
        }
        let (flag, set_val) = match (step.pressure, step.flow) {
            (Some(p), None) => (0u8, p),
            (None, Some(f)) => (1u8, f),
            (Some(p), Some(_)) => (0u8, p),
            (None, None) => {
                return Err(ProfileError::InvalidStep(
                    idx,
                    "step must set pressure or flow".to_string(),
                ))
            }
        };
        frames.push(ShotFrame {
            flag,
            set_val,
            temp: step.temperature,
            frame_len: step.seconds,
            trigger_val: 0.0,
            max_vol: step.max_volume.unwrap_or(0.0) as u16,
        });
        if let Some(limit) = step.extended_limit {
            ext_frames.push(ShotExtFrame {
                max_range: limit.range,
                max_value: limit.max,
            });
        }
    }

    let header = ShotDescHeader {
        header_version: 1,
        number_of_frames: frames.len() as u8,
        number_of_preinfuse_frames: preinfuse_count,
        minimum_pressure: 0.0,
        maximum_flow: frames
            .iter()
            .filter(|f| f.flag == 1)
            .map(|f| f.set_val)
            .fold(0.0_f32, f32::max),
    };
    let tail = ShotTail {
        target_volume: doc.target_volume.unwrap_or(0.0),
        target_weight: doc.target_weight.unwrap_or(0.0),
    };

    Ok(CompiledFrames {
        header,
        frames,
        ext_frames,
        tail,
    })
}

/// An immortal, content-addressed profile record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: ProfileId,
    pub fingerprint: String,
    pub source: Vec<u8>,
    pub format_tag: String,
    pub title: Option<String>,
    pub author: Option<String>,
    pub notes: Option<String>,
    pub beverage: Option<String>,
    pub date_added: DateTime<Utc>,
}

fn sha1_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Durable counterpart of [`ProfileRegistry::lookup_last_uploaded`], backed
/// by the `persist_hkv` table the store owns. The registry holds no
/// storage of its own; this keeps the registry testable without a real
/// store, the same way a device manager is handed a comm-manager builder
/// rather than owning transport setup itself.
pub trait LastUploadedStore: Send + Sync {
    fn get_last_uploaded(&self) -> Option<ProfileId>;
    fn set_last_uploaded(&self, id: ProfileId);
    /// Persists `profile` durably. The in-memory-only implementation
    /// (`ProfileRegistry::new`) leaves this a no-op: profiles live only as
    /// long as the process does. `ProfileRegistry::with_persistence` is
    /// given an implementation backed by the store's `profile` table so
    /// profiles stay immortal across restarts per the data model.
    fn save_profile(&self, _profile: &Profile) {}
    /// Every profile known to durable storage, loaded once at startup to
    /// rehydrate the registry's in-memory index.
    fn load_profiles(&self) -> Vec<Profile> {
        Vec::new()
    }
}

#[derive(Default)]
struct InMemoryLastUploaded(RwLock<Option<ProfileId>>);

impl LastUploadedStore for InMemoryLastUploaded {
    fn get_last_uploaded(&self) -> Option<ProfileId> {
        self.0.read().expect("lock poisoned").clone()
    }

    fn set_last_uploaded(&self, id: ProfileId) {
        *self.0.write().expect("lock poisoned") = Some(id);
    }
}

/// Content-addressed profile registry: `id = hash(source)`, duplicate-safe
/// insertion, fingerprint computed from the compiled frame sequence.
pub struct ProfileRegistry {
    profiles: DashMap<ProfileId, Profile>,
    last_uploaded: Arc<dyn LastUploadedStore>,
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProfileRegistry {
    pub fn new() -> Self {
        ProfileRegistry {
            profiles: DashMap::new(),
            last_uploaded: Arc::new(InMemoryLastUploaded::default()),
        }
    }

    /// Builds a registry whose `lookup_last_uploaded` persists through
    /// `store` (typically the sequence recorder's `persist_hkv` table)
    /// instead of process memory, rehydrating every previously-persisted
    /// profile into the in-memory index immediately.
    pub fn with_persistence(store: Arc<dyn LastUploadedStore>) -> Self {
        let profiles = DashMap::new();
        for profile in store.load_profiles() {
            profiles.insert(profile.id.clone(), profile);
        }
        ProfileRegistry {
            profiles,
            last_uploaded: store,
        }
    }

    /// Content-addressed, duplicate-safe insert. Re-uploading bit-identical
    /// source bytes returns the existing id without creating a new row.
    pub fn insert(
        &self,
        source: Vec<u8>,
        format_tag: &str,
        title: Option<String>,
        author: Option<String>,
        notes: Option<String>,
        beverage: Option<String>,
    ) -> Result<ProfileId, ProfileError> {
        if format_tag != FORMAT_TAG_V1 {
            return Err(ProfileError::UnrecognisedFormat(format_tag.to_string()));
        }
        let doc: ProfileDocument = serde_json::from_slice(&source)
            .map_err(|e| ProfileError::UnrecognisedFormat(e.to_string()))?;
        let compiled = compile(&doc)?;
        let id = sha1_hex(&source);
        let fingerprint = sha1_hex(&compiled.canonical_bytes());

        let is_new = !self.profiles.contains_key(&id);
        let profile = self.profiles.entry(id.clone()).or_insert_with(|| Profile {
            id: id.clone(),
            fingerprint,
            source,
            format_tag: format_tag.to_string(),
            title,
            author,
            notes,
            beverage,
            date_added: Utc::now(),
        });
        if is_new {
            self.last_uploaded.save_profile(&profile);
        }
        drop(profile);
        self.last_uploaded.set_last_uploaded(id.clone());
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Result<Profile, ProfileError> {
        self.profiles
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ProfileError::NotFound(id.to_string()))
    }

    /// The most recently uploaded profile's id, or `None` if the process
    /// (and its persisted key/value store) has never seen an upload.
    pub fn lookup_last_uploaded(&self) -> Option<ProfileId> {
        self.last_uploaded.get_last_uploaded()
    }

    /// `PUT /de1/profile/id` — marks an already-stored profile as the one
    /// the next sequence is brewed against, without re-uploading its
    /// source bytes.
    pub fn select_last_uploaded(&self, id: &str) -> Result<Profile, ProfileError> {
        let profile = self.get(id)?;
        self.last_uploaded.set_last_uploaded(profile.id.clone());
        Ok(profile)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn doc(title: &str) -> ProfileDocument {
        ProfileDocument {
            title: Some(title.to_string()),
            author: None,
            notes: None,
            beverage: Some("espresso".to_string()),
            target_volume: Some(36.0),
            target_weight: Some(40.0),
            steps: vec![
                ProfileStep {
                    name: "preinfuse".to_string(),
                    temperature: 92.0,
                    pressure: Some(2.0),
                    flow: None,
                    seconds: 20.0,
                    max_volume: None,
                    extended_limit: None,
                },
                ProfileStep {
                    name: "pour".to_string(),
                    temperature: 92.0,
                    pressure: None,
                    flow: Some(2.0),
                    seconds: 25.0,
                    max_volume: Some(200.0),
                    extended_limit: Some(ExtendedLimit {
                        range: 1.0,
                        max: 9.0,
                    }),
                },
            ],
        }
    }

    #[test]
    fn fingerprint_matches_across_differing_metadata() {
        let registry = ProfileRegistry::new();
        let s1 = serde_json::to_vec(&doc("Morning Blend")).unwrap();
        let s2 = serde_json::to_vec(&doc("Afternoon Blend")).unwrap();

        let id1 = registry.insert(s1, FORMAT_TAG_V1, None, None, None, None).unwrap();
        let id2 = registry.insert(s2, FORMAT_TAG_V1, None, None, None, None).unwrap();

        assert_ne!(id1, id2);
        let p1 = registry.get(&id1).unwrap();
        let p2 = registry.get(&id2).unwrap();
        assert_eq!(p1.fingerprint, p2.fingerprint);
    }

    #[test]
    fn duplicate_source_is_duplicate_safe() {
        let registry = ProfileRegistry::new();
        let source = serde_json::to_vec(&doc("Same")).unwrap();
        let id1 = registry.insert(source.clone(), FORMAT_TAG_V1, None, None, None, None).unwrap();
        let id2 = registry.insert(source, FORMAT_TAG_V1, None, None, None, None).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(registry.profiles.len(), 1);
    }

    #[test]
    fn lookup_last_uploaded_tracks_most_recent_insert() {
        let registry = ProfileRegistry::new();
        assert!(registry.lookup_last_uploaded().is_none());
        let source = serde_json::to_vec(&doc("Latest")).unwrap();
        let id = registry.insert(source, FORMAT_TAG_V1, None, None, None, None).unwrap();
        assert_eq!(registry.lookup_last_uploaded(), Some(id));
    }

    #[test]
    fn round_trip_preserves_source_bytes_exactly() {
        let registry = ProfileRegistry::new();
        let source = serde_json::to_vec(&doc("Roundtrip")).unwrap();
        let id = registry.insert(source.clone(), FORMAT_TAG_V1, None, None, None, None).unwrap();
        let profile = registry.get(&id).unwrap();
        assert_eq!(profile.source, source);
    }
}
