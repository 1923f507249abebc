use std::fmt;
use std::io;

/// Win32 error code reported when the named service is not registered.
pub const ERROR_SERVICE_DOES_NOT_EXIST: i32 = 1060;

pub(crate) const ERROR_ACCESS_DENIED: i32 = 5;

pub type Result<T> = std::result::Result<T, Error>;

/// Classification of a failed operation.
///
/// Callers are expected to branch on the kind rather than on the message text.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    #[error("service manager connect fail")]
    ManagerConnectFail,

    #[error("service open fail")]
    OpenFail,

    #[error("service create fail")]
    CreateFail,

    #[error("service start fail")]
    StartFail,

    #[error("service stop fail")]
    StopFail,

    #[error("service stop timeout")]
    StopTimeout,

    #[error("service delete fail")]
    DeleteFail,

    #[error("service status get fail")]
    StatusGetFail,

    #[error("service already exists")]
    AlreadyExists,

    #[error("service recovery strategy set fail")]
    RecoveryStrategyFail,

    #[error("service security set fail")]
    SecuritySetFail,

    /// Registry, filesystem or enumeration failure while deciding whether a service is hidden.
    #[error("service visibility query fail")]
    VisibilityQueryFail,
}

/// An [`ErrorKind`] together with human readable context and, when the failure came from the
/// system, the underlying OS error.
#[derive(thiserror::Error, Debug)]
#[error("{kind}, {detail}")]
pub struct Error {
    kind: ErrorKind,
    detail: String,
    #[source]
    source: Option<io::Error>,
}

impl Error {
    /// Create an error that has no underlying OS error.
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Error {
            kind,
            detail: detail.into(),
            source: None,
        }
    }

    /// Create an error caused by a failed system call.
    pub fn with_source(kind: ErrorKind, context: impl fmt::Display, source: io::Error) -> Self {
        Error {
            kind,
            detail: format!("{}: {}", context, source),
            source: Some(source),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }

    /// Returns the Win32 error code of the underlying OS error, if there is one.
    pub fn raw_os_error(&self) -> Option<i32> {
        self.source.as_ref().and_then(io::Error::raw_os_error)
    }

    /// Whether this is an open failure caused by the service not being registered.
    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::OpenFail && self.raw_os_error() == Some(ERROR_SERVICE_DOES_NOT_EXIST)
    }
}

/// Attaches an [`ErrorKind`] to the failure of a system call.
///
/// Successful results pass through untouched, so the call can be made unconditionally.
pub trait Wrap<T> {
    fn wrap(self, kind: ErrorKind, context: impl fmt::Display) -> Result<T>;
}

impl<T> Wrap<T> for io::Result<T> {
    fn wrap(self, kind: ErrorKind, context: impl fmt::Display) -> Result<T> {
        self.map_err(|source| Error::with_source(kind, context, source))
    }
}

pub(crate) fn is_service_missing(error: &io::Error) -> bool {
    error.raw_os_error() == Some(ERROR_SERVICE_DOES_NOT_EXIST)
}

pub(crate) fn is_access_denied(error: &io::Error) -> bool {
    error.raw_os_error() == Some(ERROR_ACCESS_DENIED)
}
