use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::Path;
use std::thread;
use std::time::Instant;

use tracing::{debug, info, trace, warn};

use crate::authority::{ControlAuthority, ManagerSession, RegistryValue, ServiceHandle};
use crate::config::ControlConfig;
use crate::error::{is_access_denied, is_service_missing, Error, ErrorKind, Result, Wrap};
use crate::security::{Dacl, Visibility};
use crate::service::{
    ServiceAccess, ServiceConfig, ServiceFailureActions, ServiceInfo, ServiceManagerAccess,
    ServiceState, ServiceStatus,
};
use crate::shell_escape;

/// A service handle kept together with the manager connection it was opened through.
///
/// Fields drop in declaration order, so the service handle is closed before the connection.
struct OpenService<M: ManagerSession> {
    service: M::Service,
    _manager: M,
}

/// Lifecycle, recovery and visibility operations on services, by name.
///
/// Every call connects to the control authority and opens the service anew. Handles are
/// released before the call returns, on success and on failure alike.
pub struct ServiceController<A> {
    authority: A,
    config: ControlConfig,
}

impl<A: ControlAuthority> ServiceController<A> {
    pub fn new(authority: A) -> Self {
        Self::with_config(authority, ControlConfig::default())
    }

    pub fn with_config(authority: A, config: ControlConfig) -> Self {
        ServiceController { authority, config }
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub fn authority(&self) -> &A {
        &self.authority
    }

    fn connect(&self, request_access: ServiceManagerAccess) -> Result<A::Manager> {
        debug!(access = ?request_access, "connecting to the service control manager");
        self.authority
            .connect(request_access)
            .wrap(ErrorKind::ManagerConnectFail, "connecting to the service control manager")
    }

    fn open(&self, name: &OsStr, request_access: ServiceAccess) -> Result<OpenService<A::Manager>> {
        let manager = self.connect(ServiceManagerAccess::CONNECT)?;
        debug!(service = %name.to_string_lossy(), access = ?request_access, "opening service");
        let service = manager
            .open_service(name, request_access)
            .wrap(ErrorKind::OpenFail, name.to_string_lossy())?;
        Ok(OpenService {
            service,
            _manager: manager,
        })
    }

    /// Register a new service and install the configured recovery policy on it.
    ///
    /// Fails with [`ErrorKind::AlreadyExists`] if a service with the same name is registered,
    /// leaving that service untouched. When the recovery policy cannot be installed the new
    /// entry is deleted again, unless `rollback_on_recovery_failure` is disabled, and
    /// [`ErrorKind::RecoveryStrategyFail`] is returned either way.
    pub fn create(&self, service_info: &ServiceInfo) -> Result<()> {
        let name = service_info.name.to_string_lossy();
        debug!(service = %name, path = %service_info.executable_path.display(), "creating service");

        let manager =
            self.connect(ServiceManagerAccess::CONNECT | ServiceManagerAccess::CREATE_SERVICE)?;

        match manager.open_service(&service_info.name, ServiceAccess::QUERY_STATUS) {
            Ok(_existing) => return Err(Error::new(ErrorKind::AlreadyExists, name)),
            Err(error) if is_service_missing(&error) => {}
            Err(error) => return Err(Error::with_source(ErrorKind::OpenFail, &name, error)),
        }

        let service = manager
            .create_service(
                service_info,
                ServiceAccess::CHANGE_CONFIG | ServiceAccess::DELETE,
            )
            .wrap(ErrorKind::CreateFail, &name)?;

        let failure_actions = self.config.recovery.failure_actions();
        if let Err(error) = service.update_failure_actions(&failure_actions) {
            if self.config.rollback_on_recovery_failure {
                match service.delete() {
                    Ok(()) => info!(service = %name, "deleted service after failing to set recovery actions"),
                    Err(delete_error) => warn!(
                        service = %name,
                        error = %delete_error,
                        "failed to delete service after failing to set recovery actions"
                    ),
                }
            }
            return Err(Error::with_source(
                ErrorKind::RecoveryStrategyFail,
                &name,
                error,
            ));
        }

        info!(
            service = %name,
            start_type = ?service_info.start_type,
            "service created"
        );
        Ok(())
    }

    pub fn start(&self, name: impl AsRef<OsStr>) -> Result<()> {
        let name = name.as_ref();
        let open = self.open(name, ServiceAccess::START)?;
        open.service
            .start()
            .wrap(ErrorKind::StartFail, name.to_string_lossy())?;
        info!(service = %name.to_string_lossy(), "service started");
        Ok(())
    }

    /// Send the stop control and wait until the service reports [`ServiceState::Stopped`].
    ///
    /// The status is read every `poll_interval` until `stop_timeout` has passed, after which
    /// [`ErrorKind::StopTimeout`] is returned. Success is only reported after a status read
    /// that says the service is stopped.
    pub fn stop(&self, name: impl AsRef<OsStr>) -> Result<()> {
        let name = name.as_ref();
        let service_name = name.to_string_lossy();
        let open = self.open(name, ServiceAccess::STOP | ServiceAccess::QUERY_STATUS)?;

        let mut status = open
            .service
            .stop()
            .wrap(ErrorKind::StopFail, &service_name)?;
        let deadline = Instant::now().checked_add(self.config.stop_timeout);

        loop {
            if status.current_state == ServiceState::Stopped {
                info!(service = %service_name, "service stopped");
                return Ok(());
            }
            if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
                warn!(
                    service = %service_name,
                    state = %status.current_state,
                    timeout = ?self.config.stop_timeout,
                    "service did not stop in time"
                );
                return Err(Error::new(
                    ErrorKind::StopTimeout,
                    format!(
                        "{}: still {} after {:?}",
                        service_name, status.current_state, self.config.stop_timeout
                    ),
                ));
            }

            thread::sleep(self.config.poll_interval);
            status = open
                .service
                .query_status()
                .wrap(ErrorKind::StatusGetFail, &service_name)?;
            trace!(
                service = %service_name,
                state = %status.current_state,
                checkpoint = status.checkpoint,
                "polled service status"
            );
        }
    }

    /// Mark the service for deletion.
    ///
    /// The entry is removed by the system once every handle to it is closed, which may be
    /// after this call returns.
    pub fn delete(&self, name: impl AsRef<OsStr>) -> Result<()> {
        let name = name.as_ref();
        let open = self.open(name, ServiceAccess::DELETE)?;
        open.service
            .delete()
            .wrap(ErrorKind::DeleteFail, name.to_string_lossy())?;
        info!(service = %name.to_string_lossy(), "service marked for deletion");
        Ok(())
    }

    pub fn query_status(&self, name: impl AsRef<OsStr>) -> Result<ServiceState> {
        self.status(name).map(|status| status.current_state)
    }

    /// The full status, including checkpoint and wait hint of a pending transition.
    pub fn status(&self, name: impl AsRef<OsStr>) -> Result<ServiceStatus> {
        let name = name.as_ref();
        let open = self.open(name, ServiceAccess::QUERY_STATUS)?;
        open.service
            .query_status()
            .wrap(ErrorKind::StatusGetFail, name.to_string_lossy())
    }

    pub fn query_config(&self, name: impl AsRef<OsStr>) -> Result<ServiceConfig> {
        let name = name.as_ref();
        let open = self.open(name, ServiceAccess::QUERY_CONFIG)?;
        open.service.query_config().wrap(
            ErrorKind::StatusGetFail,
            format!("{}: querying configuration", name.to_string_lossy()),
        )
    }

    /// Returns `Ok(false)` only when the service is definitely not registered. Any other
    /// failure to find out is an error.
    pub fn exists(&self, name: impl AsRef<OsStr>) -> Result<bool> {
        match self.open(name.as_ref(), ServiceAccess::QUERY_STATUS) {
            Ok(_) => Ok(true),
            Err(error) if error.is_not_found() => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// Install the configured recovery policy, replacing the current failure actions.
    pub fn set_recovery_actions(&self, name: impl AsRef<OsStr>) -> Result<()> {
        let name = name.as_ref();
        let open = self.open(name, ServiceAccess::CHANGE_CONFIG)?;
        open.service
            .update_failure_actions(&self.config.recovery.failure_actions())
            .wrap(ErrorKind::RecoveryStrategyFail, name.to_string_lossy())?;
        info!(
            service = %name.to_string_lossy(),
            restarts = self.config.recovery.restart_count,
            "recovery actions set"
        );
        Ok(())
    }

    pub fn recovery_actions(&self, name: impl AsRef<OsStr>) -> Result<ServiceFailureActions> {
        let name = name.as_ref();
        let open = self.open(name, ServiceAccess::QUERY_CONFIG)?;
        open.service.failure_actions().wrap(
            ErrorKind::RecoveryStrategyFail,
            format!("{}: querying failure actions", name.to_string_lossy()),
        )
    }

    pub fn set_hidden(&self, name: impl AsRef<OsStr>) -> Result<()> {
        self.apply_visibility(name, Visibility::Hidden)
    }

    pub fn set_visible(&self, name: impl AsRef<OsStr>) -> Result<()> {
        self.apply_visibility(name, Visibility::Visible)
    }

    /// Replace the DACL of the service with the template for `visibility`.
    pub fn apply_visibility(&self, name: impl AsRef<OsStr>, visibility: Visibility) -> Result<()> {
        let name = name.as_ref();
        let service_name = name.to_string_lossy();
        let open = self.open(name, ServiceAccess::WRITE_DAC)?;

        open.service.set_dacl(visibility.sddl()).map_err(|error| {
            let context = format!("{}: {}", service_name, error);
            Error::with_source(ErrorKind::SecuritySetFail, context, error.into_io())
        })?;

        info!(service = %service_name, %visibility, "service visibility changed");
        Ok(())
    }

    /// Best effort guess whether the service is hidden from regular users.
    ///
    /// A service counts as hidden when its registry key has no `DisplayName`, when the
    /// executable of its `ImagePath` is not a file, when its DACL does not let interactive
    /// users query it, or when it is missing from the service enumeration. A caller that may
    /// not read the DACL goes by the enumeration alone. Failing to read any of these is an
    /// error rather than a verdict.
    pub fn is_hidden(&self, name: impl AsRef<OsStr>) -> Result<bool> {
        let name = name.as_ref();
        let service_name = name.to_string_lossy();
        debug!(service = %service_name, "checking service visibility");

        let display_name = self
            .authority
            .registry_value(name, RegistryValue::DisplayName)
            .wrap(
                ErrorKind::VisibilityQueryFail,
                format!("{}: reading DisplayName", service_name),
            )?;
        if display_name.is_none() {
            debug!(service = %service_name, "service has no display name");
            return Ok(true);
        }

        let image_path = self
            .authority
            .registry_value(name, RegistryValue::ImagePath)
            .wrap(
                ErrorKind::VisibilityQueryFail,
                format!("{}: reading ImagePath", service_name),
            )?
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::VisibilityQueryFail,
                    format!("{}: ImagePath is not set", service_name),
                )
            })?;
        let executable_found = executable_exists(&image_path).wrap(
            ErrorKind::VisibilityQueryFail,
            format!("{}: checking {}", service_name, image_path.to_string_lossy()),
        )?;
        if !executable_found {
            debug!(service = %service_name, image_path = %image_path.to_string_lossy(), "service executable is missing");
            return Ok(true);
        }

        let manager =
            self.connect(ServiceManagerAccess::CONNECT | ServiceManagerAccess::ENUMERATE_SERVICE)?;
        match manager.open_service(name, ServiceAccess::READ_CONTROL) {
            Ok(service) => {
                let sddl = service.dacl().wrap(
                    ErrorKind::VisibilityQueryFail,
                    format!("{}: reading security", service_name),
                )?;
                match Dacl::parse(&sddl) {
                    Ok(dacl) if Visibility::of(&dacl) == Visibility::Hidden => {
                        debug!(service = %service_name, "interactive users may not query the service");
                        return Ok(true);
                    }
                    Ok(_) => {}
                    Err(error) => {
                        debug!(service = %service_name, %error, %sddl, "skipping DACL check")
                    }
                }
            }
            // Callers outside the DACL can only tell by enumeration.
            Err(error) if is_access_denied(&error) => {
                debug!(service = %service_name, "security descriptor is not readable");
            }
            Err(error) => return Err(Error::with_source(ErrorKind::OpenFail, &service_name, error)),
        }

        let listed = manager
            .service_names()
            .wrap(
                ErrorKind::VisibilityQueryFail,
                format!("{}: enumerating services", service_name),
            )?
            .iter()
            .any(|listed_name| listed_name.eq_ignore_ascii_case(name));
        if !listed {
            debug!(service = %service_name, "service is not enumerated");
        }
        Ok(!listed)
    }
}

fn executable_exists(command_line: &OsStr) -> io::Result<bool> {
    for candidate in shell_escape::executable_candidates(command_line) {
        if is_file(&candidate)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn is_file(path: &Path) -> io::Result<bool> {
    match fs::metadata(path) {
        Ok(metadata) => Ok(metadata.is_file()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(error) => Err(error),
    }
}
