use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::bottle::BottleId;

#[derive(Error, Debug)]
pub enum BottleError {
    #[error("bottle {0} not found")]
    NotFound(BottleId),

    #[error("a bottle named {0:?} already exists")]
    DuplicateName(String),

    #[error("runner {0:?} is already registered")]
    DuplicateRunner(String),

    #[error("runner {0:?} is not registered")]
    UnknownRunner(String),

    #[error("bottle {0} has running programs")]
    InUse(BottleId),

    #[error("bottle {0} is busy")]
    Busy(BottleId),

    #[error("executable {0:?} not found")]
    ExecutableNotFound(PathBuf),

    #[error("failed to spawn {path:?}")]
    SpawnFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("bottle {id} is corrupt at {path:?}")]
    Corrupt {
        id: BottleId,
        path: PathBuf,
    },

    #[error("invalid bottle name {0:?}")]
    InvalidName(String),

    #[error("the path {0:?} is not a directory")]
    NotADirectory(PathBuf),

    #[error("IO failure")]
    IOFailure(#[from] io::Error),
}

impl BottleError {
    /// The raw OS error code behind a spawn or IO failure, if there is one.
    #[must_use]
    pub fn os_error_code(&self) -> Option<i32> {
        match self {
            BottleError::SpawnFailed { source, .. } | BottleError::IOFailure(source) => source.raw_os_error(),
            _ => None,
        }
    }

    pub(crate) fn invalid_data<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        BottleError::IOFailure(io::Error::new(io::ErrorKind::InvalidData, error))
    }
}
