use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// The primary error type for all operations in the `virtfs` crate.
#[derive(Debug, Error)]
pub enum VirtfsError {
    /// No sidecar record exists for the entry. The collector treats this as
    /// a host-native file; every other caller propagates it.
    #[error("no virtfs record for '{}'", path.display())]
    NotFound { path: PathBuf },

    /// The destination path exists with a type that conflicts with the one
    /// about to be materialized.
    #[error("type mismatch at '{}': expected {expected}, found {found}", path.display())]
    TypeMismatch {
        path: PathBuf,
        expected: &'static str,
        found: &'static str,
    },

    /// The entry's type bits are outside {regular, directory, symlink, fifo,
    /// char-device, block-device}.
    #[error("unsupported file type at '{}' (mode {mode:#o})", path.display())]
    UnsupportedType { path: PathBuf, mode: u32 },

    /// A device number that does not fit the 8-bit major / 8-bit minor packing.
    #[error("device {major}:{minor} at '{}' does not fit the 8/8 device packing", path.display())]
    DeviceOutOfRange { path: PathBuf, major: u32, minor: u32 },

    /// A sidecar file exists but cannot be parsed.
    #[error("malformed virtfs record '{}': {detail}", path.display())]
    MalformedRecord { path: PathBuf, detail: String },

    /// An archive member that cannot be staged safely.
    #[error("invalid archive member '{}': {detail}", path.display())]
    InvalidMember { path: PathBuf, detail: String },

    /// A configuration value that cannot be used.
    #[error("invalid configuration: {detail}")]
    Config { detail: String },

    /// Any other I/O failure. Never retried inside this crate.
    #[error("I/O error on path '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Coarse classification of a [`VirtfsError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    TypeMismatch,
    UnsupportedType,
    UnderlyingOs,
    Config,
}

impl VirtfsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VirtfsError::NotFound { .. } => ErrorKind::NotFound,
            VirtfsError::TypeMismatch { .. } => ErrorKind::TypeMismatch,
            VirtfsError::UnsupportedType { .. }
            | VirtfsError::DeviceOutOfRange { .. }
            | VirtfsError::InvalidMember { .. } => ErrorKind::UnsupportedType,
            VirtfsError::MalformedRecord { .. } | VirtfsError::Io { .. } => ErrorKind::UnderlyingOs,
            VirtfsError::Config { .. } => ErrorKind::Config,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        VirtfsError::Io { path: path.into(), source }
    }
}

pub type Result<T, E = VirtfsError> = std::result::Result<T, E>;

/// Attaches a path to a bare `io::Result`.
pub(crate) trait IoContext<T> {
    fn at(self, path: &Path) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn at(self, path: &Path) -> Result<T> {
        self.map_err(|e| VirtfsError::io(path, e))
    }
}
