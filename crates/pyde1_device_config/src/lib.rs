//! Content-addressed profile registry: storage of uploaded profile source
//! bytes plus a fingerprint over the compiled on-wire instruction set.

pub mod error;
pub mod frame;
pub mod profile;

pub use error::ProfileError;
pub use frame::{CompiledFrames, ShotDescHeader, ShotExtFrame, ShotFrame, ShotTail};
pub use profile::{
    compile, ExtendedLimit, LastUploadedStore, Profile, ProfileDocument, ProfileId, ProfileRegistry,
    ProfileStep, FORMAT_TAG_V1,
};
