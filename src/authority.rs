//! The operations the service control manager offers, as traits.
//!
//! [`ServiceController`](crate::controller::ServiceController) is written against these traits
//! only. [`ScmAuthority`](crate::service_manager::ScmAuthority) implements them with the Win32
//! API; tests implement them in memory.
//!
//! Every call reports failures as [`io::Error`] carrying the Win32 error code, the controller
//! decides which [`ErrorKind`](crate::ErrorKind) they map to. Handles release the underlying
//! system handle when dropped.

use std::ffi::{OsStr, OsString};
use std::io;

use crate::service::{
    ServiceAccess, ServiceConfig, ServiceFailureActions, ServiceInfo, ServiceManagerAccess,
    ServiceStatus,
};

/// Value stored under a service's registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistryValue {
    DisplayName,
    ImagePath,
}

impl RegistryValue {
    pub fn name(&self) -> &'static str {
        match self {
            RegistryValue::DisplayName => "DisplayName",
            RegistryValue::ImagePath => "ImagePath",
        }
    }
}

/// Entry point to the service control authority of a machine.
pub trait ControlAuthority {
    type Manager: ManagerSession;

    /// Open a connection to the service control manager.
    fn connect(&self, request_access: ServiceManagerAccess) -> io::Result<Self::Manager>;

    /// Read a string value from the registry key of a service.
    ///
    /// Returns `Ok(None)` if the key exists but the value does not. A missing key is an error.
    fn registry_value(&self, service: &OsStr, value: RegistryValue)
        -> io::Result<Option<OsString>>;
}

/// An open connection to the service control manager.
pub trait ManagerSession {
    type Service: ServiceHandle;

    /// Open an existing service.
    fn open_service(&self, name: &OsStr, request_access: ServiceAccess)
        -> io::Result<Self::Service>;

    /// Register a new service.
    fn create_service(
        &self,
        service_info: &ServiceInfo,
        service_access: ServiceAccess,
    ) -> io::Result<Self::Service>;

    /// Names of the win32 services the caller is able to enumerate.
    fn service_names(&self) -> io::Result<Vec<OsString>>;
}

/// An open service, limited to the access it was opened with.
pub trait ServiceHandle {
    fn start(&self) -> io::Result<()>;

    /// Send the stop control. Returns the status reported in response.
    fn stop(&self) -> io::Result<ServiceStatus>;

    fn query_status(&self) -> io::Result<ServiceStatus>;

    fn query_config(&self) -> io::Result<ServiceConfig>;

    /// Mark the service for deletion. The entry disappears once every handle is closed.
    fn delete(&self) -> io::Result<()>;

    fn update_failure_actions(&self, update: &ServiceFailureActions) -> io::Result<()>;

    fn failure_actions(&self) -> io::Result<ServiceFailureActions>;

    /// Replace the discretionary access control list of the service object with the DACL of
    /// `sddl`. The owner, group and system ACL are left alone.
    fn set_dacl(&self, sddl: &str) -> Result<(), DaclError>;

    /// The discretionary access control list of the service object, as SDDL.
    fn dacl(&self) -> io::Result<String>;
}

/// Failure of [`ServiceHandle::set_dacl`].
#[derive(thiserror::Error, Debug)]
pub enum DaclError {
    #[error("parsing SDDL")]
    Parse(#[source] io::Error),
    #[error("setting security")]
    Apply(#[source] io::Error),
}

impl DaclError {
    pub fn into_io(self) -> io::Error {
        match self {
            DaclError::Parse(error) | DaclError::Apply(error) => error,
        }
    }
}
