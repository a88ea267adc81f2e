//! Settings errors.

use std::path::PathBuf;

use thiserror::Error;

/// Why settings could not be produced.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file exists but could not be read.
    #[error("cannot read {}: {source}", path.display())]
    Read {
        /// File that was being read.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// The file is not JSON, or does not fit the settings shape.
    #[error("malformed settings: {0}")]
    Json(#[from] serde_json::Error),
    /// A value passed parsing but breaks a constraint.
    #[error("invalid {key}: {reason}")]
    Invalid {
        /// Dotted camelCase key, as written in the file.
        key: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

impl SettingsError {
    pub(crate) fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Settings result.
pub type Result<T> = std::result::Result<T, SettingsError>;
