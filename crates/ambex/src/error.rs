use std::path::PathBuf;

/// A `Result` alias where the `Err` case is `ambex::Error`.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{path}: {reason}")]
    Decode { path: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid {resource_type} {name:?}: {message}")]
    InvalidResource {
        resource_type: &'static str,
        name: String,
        message: String,
    },

    #[error("{path}: unrecognized resource type {type_url}")]
    UnrecognizedKind { path: PathBuf, type_url: String },

    #[error("inconsistent snapshot: {0}")]
    Inconsistent(String),

    #[error("snapshot install failed: {0}")]
    Install(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Watch(#[from] notify::Error),

    #[error(transparent)]
    Transport(#[from] tonic::transport::Error),

    #[error(transparent)]
    Reflection(#[from] tonic_reflection::server::Error),

    #[error("update channel closed, shutting down")]
    Shutdown,
}

impl Error {
    pub(crate) fn decode(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        Error::Decode {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn invalid(
        resource_type: &'static str,
        name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::InvalidResource {
            resource_type,
            name: name.into(),
            message: message.into(),
        }
    }

    /// Returns `true` if this error should only skip the input that caused it.
    pub(crate) fn is_input_error(&self) -> bool {
        matches!(
            self,
            Error::Decode { .. }
                | Error::InvalidResource { .. }
                | Error::UnrecognizedKind { .. }
                | Error::Inconsistent(_)
        )
    }
}
