//! Interaction log: the recorded exchanges of a session and their file format.

pub mod body;
pub(crate) mod format;
pub mod interaction;
pub mod journal;
pub mod log;

use std::path::{Path, PathBuf};

pub use interaction::{Exchange, Headers, Interaction, Recording, RequestRecord, ResponseRecord};
pub use journal::Journal;
pub use log::{flush, load, InteractionLog};

/// Errors raised while reading or writing recordings.
#[derive(Debug, thiserror::Error)]
pub enum RecordingError {
    /// The file exists but does not describe a valid recording.
    #[error("recording {} is corrupt: {reason}", .path.display())]
    Corrupt {
        /// Offending file.
        path: PathBuf,
        /// What is wrong with it.
        reason: String,
    },
    /// No recording exists at the path.
    #[error("recording {} does not exist", .path.display())]
    NotFound {
        /// Missing file.
        path: PathBuf,
    },
    /// Filesystem failure.
    #[error("failed to {action} {}: {source}", .path.display())]
    Io {
        /// What was being attempted.
        action: &'static str,
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl RecordingError {
    pub(crate) fn corrupt(path: &Path, reason: impl Into<String>) -> Self {
        Self::Corrupt { path: path.to_path_buf(), reason: reason.into() }
    }

    pub(crate) fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io { action, path: path.to_path_buf(), source }
    }
}
