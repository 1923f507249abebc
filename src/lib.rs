// Copyright 2017 Amagicom AB.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A crate that manages the lifecycle of windows services from the outside: registration,
//! start, stop, deletion, status queries, crash recovery and visibility to regular users.
//!
//! # Controlling a service
//!
//! All operations live on [`ServiceController`], which talks to the system through a
//! [`ControlAuthority`]. On windows, [`ScmAuthority`] is the service control manager of the local
//! computer and the free functions at the root of this crate use it with the default
//! [`ControlConfig`].
//!
//! ```rust,no_run
//! # #[cfg(windows)]
//! # fn main() -> service_ctl::Result<()> {
//! use service_ctl::{ServiceController, ServiceInfo, ServiceState, ScmAuthority};
//!
//! let controller = ServiceController::new(ScmAuthority);
//! controller.create(&ServiceInfo::new("my_service", r"C:\path\to\my\service.exe", true))?;
//! controller.start("my_service")?;
//!
//! if controller.query_status("my_service")? == ServiceState::Running {
//!     controller.stop("my_service")?;
//! }
//! controller.delete("my_service")?;
//! # Ok(())
//! # }
//! # #[cfg(not(windows))]
//! # fn main() {}
//! ```
//!
//! # Failures
//!
//! Every operation returns an [`Error`] whose [`ErrorKind`] tells what went wrong. Callers
//! branch on the kind, the message is for humans:
//!
//! ```rust,no_run
//! # #[cfg(windows)]
//! # fn main() -> service_ctl::Result<()> {
//! use service_ctl::ErrorKind;
//!
//! match service_ctl::stop_service("my_service") {
//!     Ok(()) => {}
//!     Err(error) if error.kind() == ErrorKind::StopTimeout => {
//!         eprintln!("my_service is still shutting down");
//!     }
//!     Err(error) => return Err(error),
//! }
//! # Ok(())
//! # }
//! # #[cfg(not(windows))]
//! # fn main() {}
//! ```
//!
//! # Visibility
//!
//! [`ServiceController::set_hidden`] replaces the DACL of a service so that only the system and
//! administrators can see it, [`ServiceController::set_visible`] restores the default access of
//! interactive and service users. [`ServiceController::is_hidden`] is a best effort check, see
//! its documentation for the signals it looks at.

pub mod authority;
pub mod config;
pub mod controller;
mod error;
pub mod recovery;
pub mod security;
pub mod service;
mod shell_escape;

#[cfg(windows)]
mod privilege;
#[cfg(windows)]
mod registry;
#[cfg(windows)]
mod sc_handle;
#[cfg(windows)]
pub mod service_manager;

#[cfg(test)]
mod fake;

pub use crate::authority::{ControlAuthority, ManagerSession, ServiceHandle};
pub use crate::config::{ConfigError, ControlConfig};
pub use crate::controller::ServiceController;
pub use crate::error::{Error, ErrorKind, Result, Wrap, ERROR_SERVICE_DOES_NOT_EXIST};
pub use crate::recovery::RecoveryPolicy;
pub use crate::security::Visibility;
pub use crate::service::{ServiceInfo, ServiceState, ServiceStatus};

#[cfg(windows)]
pub use crate::privilege::is_admin;
#[cfg(windows)]
pub use crate::service_manager::ScmAuthority;

#[cfg(windows)]
use std::{ffi::OsStr, path::PathBuf};

#[cfg(windows)]
fn local_controller() -> ServiceController<ScmAuthority> {
    ServiceController::new(ScmAuthority)
}

/// Register a service, see [`ServiceController::create`].
#[cfg(windows)]
pub fn create_service(
    name: impl AsRef<OsStr>,
    executable_path: impl Into<PathBuf>,
    autostart: bool,
) -> Result<()> {
    local_controller().create(&ServiceInfo::new(name, executable_path, autostart))
}

#[cfg(windows)]
pub fn start_service(name: impl AsRef<OsStr>) -> Result<()> {
    local_controller().start(name)
}

/// Stop a service and wait for it, see [`ServiceController::stop`].
#[cfg(windows)]
pub fn stop_service(name: impl AsRef<OsStr>) -> Result<()> {
    local_controller().stop(name)
}

#[cfg(windows)]
pub fn delete_service(name: impl AsRef<OsStr>) -> Result<()> {
    local_controller().delete(name)
}

#[cfg(windows)]
pub fn query_service_status(name: impl AsRef<OsStr>) -> Result<ServiceState> {
    local_controller().query_status(name)
}

#[cfg(windows)]
pub fn service_exists(name: impl AsRef<OsStr>) -> Result<bool> {
    local_controller().exists(name)
}

/// Install the default recovery policy: three restarts, 15 seconds apart, with the failure count
/// reset after a minute.
#[cfg(windows)]
pub fn set_recovery_actions(name: impl AsRef<OsStr>) -> Result<()> {
    local_controller().set_recovery_actions(name)
}

#[cfg(windows)]
pub fn set_service_hidden(name: impl AsRef<OsStr>) -> Result<()> {
    local_controller().set_hidden(name)
}

#[cfg(windows)]
pub fn set_service_visible(name: impl AsRef<OsStr>) -> Result<()> {
    local_controller().set_visible(name)
}

#[cfg(windows)]
pub fn is_service_hidden(name: impl AsRef<OsStr>) -> Result<bool> {
    local_controller().is_hidden(name)
}
