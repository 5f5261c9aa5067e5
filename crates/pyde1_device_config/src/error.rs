use displaydoc::Display;
use thiserror::Error;

/// Errors raised while parsing or compiling a profile upload.
#[derive(Debug, Error, Display, Clone, PartialEq, Eq)]
pub enum ProfileError {
    /// source bytes are not a recognised profile format: {0}
    UnrecognisedFormat(String),
    /// step {0}: {1}
    InvalidStep(usize, String),
    /// no profile has ever been uploaded
    NoProfileUploaded,
    /// profile {0} was not found
    NotFound(String),
}
