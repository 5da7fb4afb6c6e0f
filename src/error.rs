//! Error types for the task database.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Cannot add task because the uuid '{uuid}' is not unique.")]
    DuplicateIdentity { uuid: Uuid },

    #[error("No task matches '{0}'.")]
    NotFound(String),

    #[error("{message} in {} at line {line}", .file.display())]
    Parse {
        file: PathBuf,
        line: usize,
        message: String,
    },

    #[error("{} line {line} uses file format {version}, which is no longer supported", .file.display())]
    UnsupportedFormat {
        file: PathBuf,
        line: usize,
        version: u8,
    },

    #[error("Could not acquire the lock on {} within {waited:?}", .path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("{} is read-only", .0.display())]
    ReadOnly(PathBuf),

    #[error("Invalid value '{value}' for attribute '{name}'")]
    InvalidAttribute { name: String, value: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Identity and lookup failures leave the database untouched, so a caller
    /// may report them and carry on.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::DuplicateIdentity { .. } | Self::NotFound(_) | Self::InvalidAttribute { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_carries_file_and_line() {
        let err = Error::Parse {
            file: PathBuf::from("/tmp/pending.data"),
            line: 7,
            message: "Unrecognized characters at end of line".into(),
        };
        assert_eq!(
            err.to_string(),
            "Unrecognized characters at end of line in /tmp/pending.data at line 7"
        );
        assert!(!err.is_recoverable());
    }

    #[test]
    fn lookup_errors_are_recoverable() {
        assert!(Error::NotFound("42".into()).is_recoverable());
        assert!(
            Error::DuplicateIdentity {
                uuid: Uuid::nil()
            }
            .is_recoverable()
        );
        let timeout = Error::LockTimeout {
            path: PathBuf::from("lock"),
            waited: Duration::from_secs(1),
        };
        assert!(!timeout.is_recoverable());
    }
}
