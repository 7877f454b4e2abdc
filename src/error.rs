use std::io;
use std::path::Path;

use thiserror::Error;

/// Main error type for skymount operations
#[derive(Error, Debug)]
pub enum SkymountError {
    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Path already exists: {0}")]
    AlreadyExists(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Invalid handle")]
    InvalidHandle,

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Unknown backend method: {0}")]
    UnknownMethod(String),

    #[error("Invalid instance config: {0}")]
    InvalidConfig(String),

    #[error("Corrupted instance config: {0}")]
    CorruptedConfig(String),

    #[error("Unable to start instance: {0}")]
    Unable2Start(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Remote session error: {0}")]
    Session(String),

    #[error("{0}")]
    Other(String),
}

/// Status codes returned across the mount-driver boundary.
///
/// This is the only thing a driver ever sees from the router; error text
/// stays on our side of the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStatus {
    Success,
    NotFound,
    AlreadyExists,
    NotADirectory,
    InvalidHandle,
    AccessDenied,
    Error,
    NotImplemented,
}

impl DriverStatus {
    /// Convert status to libc errno for FUSE responses
    pub fn to_errno(self) -> i32 {
        match self {
            DriverStatus::Success => 0,
            DriverStatus::NotFound => libc::ENOENT,
            DriverStatus::AlreadyExists => libc::EEXIST,
            DriverStatus::NotADirectory => libc::ENOTDIR,
            DriverStatus::InvalidHandle => libc::EBADF,
            DriverStatus::AccessDenied => libc::EACCES,
            DriverStatus::Error => libc::EIO,
            DriverStatus::NotImplemented => libc::ENOSYS,
        }
    }
}

impl SkymountError {
    /// Classify an I/O error raised while operating on `path`.
    pub fn io(path: &Path, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => SkymountError::NotFound(path.display().to_string()),
            io::ErrorKind::AlreadyExists => {
                SkymountError::AlreadyExists(path.display().to_string())
            }
            io::ErrorKind::PermissionDenied => {
                SkymountError::AccessDenied(path.display().to_string())
            }
            _ => SkymountError::Io(err),
        }
    }

    pub fn not_found(path: &Path) -> Self {
        SkymountError::NotFound(path.display().to_string())
    }

    /// Taxonomy name used in control API response bodies
    pub fn code(&self) -> &'static str {
        match self {
            SkymountError::NotFound(_) => "NotFound",
            SkymountError::AlreadyExists(_) => "AlreadyExists",
            SkymountError::NotADirectory(_) => "NotADirectory",
            SkymountError::InvalidHandle => "InvalidHandle",
            SkymountError::AccessDenied(_) => "AccessDenied",
            SkymountError::UnknownMethod(_) => "UnknownMethod",
            SkymountError::InvalidConfig(_) => "InvalidConfig",
            SkymountError::CorruptedConfig(_) => "CorruptedConfig",
            SkymountError::Unable2Start(_) => "Unable2Start",
            SkymountError::Io(_) | SkymountError::Session(_) => "IOFault",
            SkymountError::Other(_) => "Error",
        }
    }

    /// Map to the closest mount-driver status
    pub fn status(&self) -> DriverStatus {
        match self {
            SkymountError::NotFound(_) => DriverStatus::NotFound,
            SkymountError::AlreadyExists(_) => DriverStatus::AlreadyExists,
            SkymountError::NotADirectory(_) => DriverStatus::NotADirectory,
            SkymountError::InvalidHandle => DriverStatus::InvalidHandle,
            SkymountError::AccessDenied(_) => DriverStatus::AccessDenied,
            SkymountError::Io(e) if e.kind() == io::ErrorKind::Unsupported => {
                DriverStatus::NotImplemented
            }
            _ => DriverStatus::Error,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SkymountError::NotFound(_))
    }
}

/// Result type alias for skymount operations
pub type Result<T> = std::result::Result<T, SkymountError>;
