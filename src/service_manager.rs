//! The control authority of the local computer, implemented with the Win32 service API.

use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::time::Duration;
use std::{io, mem, ptr, slice};

use widestring::{WideCStr, WideCString};
use windows_sys::Win32::{
    Foundation::{self, ERROR_INSUFFICIENT_BUFFER, ERROR_MORE_DATA},
    Security::DACL_SECURITY_INFORMATION,
    Storage::FileSystem,
    System::{Services, Threading},
};

use crate::authority::{ControlAuthority, DaclError, ManagerSession, RegistryValue, ServiceHandle};
use crate::error::{ERROR_ACCESS_DENIED, ERROR_SERVICE_DOES_NOT_EXIST};
use crate::registry::RegKey;
use crate::sc_handle::ScHandle;
use crate::security::{self, LocalSecurityDescriptor};
use crate::service::{
    ParseRawError, ServiceAccess, ServiceAction, ServiceActionType, ServiceConfig,
    ServiceErrorControl, ServiceExitCode, ServiceFailureActions, ServiceFailureResetPeriod,
    ServiceInfo, ServiceManagerAccess, ServiceStartType, ServiceState, ServiceStatus, ServiceType,
    INFINITE,
};
use crate::shell_escape;

// The data model carries the raw values of the service API, checked here against the headers.
const _: () = {
    assert!(ServiceType::KERNEL_DRIVER.bits() == Services::SERVICE_KERNEL_DRIVER);
    assert!(ServiceType::FILE_SYSTEM_DRIVER.bits() == Services::SERVICE_FILE_SYSTEM_DRIVER);
    assert!(ServiceType::OWN_PROCESS.bits() == Services::SERVICE_WIN32_OWN_PROCESS);
    assert!(ServiceType::SHARE_PROCESS.bits() == Services::SERVICE_WIN32_SHARE_PROCESS);
    assert!(ServiceType::INTERACTIVE_PROCESS.bits() == Services::SERVICE_INTERACTIVE_PROCESS);

    assert!(ServiceAccess::QUERY_CONFIG.bits() == Services::SERVICE_QUERY_CONFIG);
    assert!(ServiceAccess::CHANGE_CONFIG.bits() == Services::SERVICE_CHANGE_CONFIG);
    assert!(ServiceAccess::QUERY_STATUS.bits() == Services::SERVICE_QUERY_STATUS);
    assert!(ServiceAccess::ENUMERATE_DEPENDENTS.bits() == Services::SERVICE_ENUMERATE_DEPENDENTS);
    assert!(ServiceAccess::START.bits() == Services::SERVICE_START);
    assert!(ServiceAccess::STOP.bits() == Services::SERVICE_STOP);
    assert!(ServiceAccess::PAUSE_CONTINUE.bits() == Services::SERVICE_PAUSE_CONTINUE);
    assert!(ServiceAccess::INTERROGATE.bits() == Services::SERVICE_INTERROGATE);
    assert!(ServiceAccess::USER_DEFINED_CONTROL.bits() == Services::SERVICE_USER_DEFINED_CONTROL);
    assert!(ServiceAccess::DELETE.bits() == FileSystem::DELETE);
    assert!(ServiceAccess::READ_CONTROL.bits() == FileSystem::READ_CONTROL);
    assert!(ServiceAccess::WRITE_DAC.bits() == FileSystem::WRITE_DAC);
    assert!(ServiceAccess::WRITE_OWNER.bits() == FileSystem::WRITE_OWNER);
    assert!(ServiceAccess::GENERIC_ALL.bits() == Foundation::GENERIC_ALL);
    assert!(ServiceAccess::GENERIC_EXECUTE.bits() == Foundation::GENERIC_EXECUTE);
    assert!(ServiceAccess::GENERIC_WRITE.bits() == Foundation::GENERIC_WRITE);
    assert!(ServiceAccess::GENERIC_READ.bits() == Foundation::GENERIC_READ);
    assert!(ServiceAccess::ALL_ACCESS.bits() == Services::SERVICE_ALL_ACCESS);

    assert!(ServiceManagerAccess::CONNECT.bits() == Services::SC_MANAGER_CONNECT);
    assert!(ServiceManagerAccess::CREATE_SERVICE.bits() == Services::SC_MANAGER_CREATE_SERVICE);
    assert!(
        ServiceManagerAccess::ENUMERATE_SERVICE.bits() == Services::SC_MANAGER_ENUMERATE_SERVICE
    );

    assert!(ServiceStartType::AutoStart as u32 == Services::SERVICE_AUTO_START);
    assert!(ServiceStartType::OnDemand as u32 == Services::SERVICE_DEMAND_START);
    assert!(ServiceStartType::Disabled as u32 == Services::SERVICE_DISABLED);

    assert!(ServiceErrorControl::Ignore as u32 == Services::SERVICE_ERROR_IGNORE);
    assert!(ServiceErrorControl::Normal as u32 == Services::SERVICE_ERROR_NORMAL);
    assert!(ServiceErrorControl::Severe as u32 == Services::SERVICE_ERROR_SEVERE);
    assert!(ServiceErrorControl::Critical as u32 == Services::SERVICE_ERROR_CRITICAL);

    assert!(ServiceState::Stopped as u32 == Services::SERVICE_STOPPED);
    assert!(ServiceState::StartPending as u32 == Services::SERVICE_START_PENDING);
    assert!(ServiceState::StopPending as u32 == Services::SERVICE_STOP_PENDING);
    assert!(ServiceState::Running as u32 == Services::SERVICE_RUNNING);
    assert!(ServiceState::ContinuePending as u32 == Services::SERVICE_CONTINUE_PENDING);
    assert!(ServiceState::PausePending as u32 == Services::SERVICE_PAUSE_PENDING);
    assert!(ServiceState::Paused as u32 == Services::SERVICE_PAUSED);

    assert!(ServiceActionType::None as i32 == Services::SC_ACTION_NONE);
    assert!(ServiceActionType::Restart as i32 == Services::SC_ACTION_RESTART);
    assert!(ServiceActionType::Reboot as i32 == Services::SC_ACTION_REBOOT);
    assert!(ServiceActionType::RunCommand as i32 == Services::SC_ACTION_RUN_COMMAND);

    assert!(INFINITE == Threading::INFINITE);

    assert!(ERROR_SERVICE_DOES_NOT_EXIST as u32 == Foundation::ERROR_SERVICE_DOES_NOT_EXIST);
    assert!(ERROR_ACCESS_DENIED as u32 == Foundation::ERROR_ACCESS_DENIED);
};

/// The maximum size of data buffer used by QueryServiceConfigW and QueryServiceConfig2W is 8K
const MAX_QUERY_BUFFER_SIZE: usize = 8 * 1024;

/// Initial buffer for EnumServicesStatusExW, grown when a single entry does not fit.
const ENUM_BUFFER_SIZE: usize = 64 * 1024;

/// The service control manager of the local computer.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScmAuthority;

impl ControlAuthority for ScmAuthority {
    type Manager = ServiceManager;

    fn connect(&self, request_access: ServiceManagerAccess) -> io::Result<ServiceManager> {
        ServiceManager::local_computer(request_access)
    }

    fn registry_value(
        &self,
        service: &OsStr,
        value: RegistryValue,
    ) -> io::Result<Option<OsString>> {
        RegKey::open_service(service)?.string_value(value.name())
    }
}

/// A connection to the service control manager.
pub struct ServiceManager {
    manager_handle: ScHandle,
}

impl ServiceManager {
    /// Connect to the active services database of the local computer.
    pub fn local_computer(request_access: ServiceManagerAccess) -> io::Result<Self> {
        let handle =
            unsafe { Services::OpenSCManagerW(ptr::null(), ptr::null(), request_access.bits()) };
        Ok(ServiceManager {
            manager_handle: unsafe { ScHandle::from_call(handle)? },
        })
    }
}

impl ManagerSession for ServiceManager {
    type Service = Service;

    fn open_service(&self, name: &OsStr, request_access: ServiceAccess) -> io::Result<Service> {
        let service_name = to_wide(name, "service name")?;
        let handle = unsafe {
            Services::OpenServiceW(
                self.manager_handle.raw_handle(),
                service_name.as_ptr(),
                request_access.bits(),
            )
        };
        Ok(Service::new(unsafe { ScHandle::from_call(handle)? }))
    }

    fn create_service(
        &self,
        service_info: &ServiceInfo,
        service_access: ServiceAccess,
    ) -> io::Result<Service> {
        let service_name = to_wide(&service_info.name, "service name")?;
        let display_name = to_wide(&service_info.display_name, "display name")?;
        let launch_command = to_wide(shell_escape::launch_command(service_info), "launch command")?;

        let handle = unsafe {
            Services::CreateServiceW(
                self.manager_handle.raw_handle(),
                service_name.as_ptr(),
                display_name.as_ptr(),
                service_access.bits(),
                service_info.service_type.bits(),
                service_info.start_type.to_raw(),
                service_info.error_control.to_raw(),
                launch_command.as_ptr(),
                ptr::null(),     // load ordering group
                ptr::null_mut(), // tag id within the load ordering group
                ptr::null(),     // dependencies
                ptr::null(),     // run as LocalSystem
                ptr::null(),     // password
            )
        };
        Ok(Service::new(unsafe { ScHandle::from_call(handle)? }))
    }

    fn service_names(&self) -> io::Result<Vec<OsString>> {
        let mut names = Vec::new();
        let mut buffer = AlignedBuffer::new(ENUM_BUFFER_SIZE);
        let mut resume_handle: u32 = 0;

        loop {
            let mut bytes_needed: u32 = 0;
            let mut services_returned: u32 = 0;
            let success = unsafe {
                Services::EnumServicesStatusExW(
                    self.manager_handle.raw_handle(),
                    Services::SC_ENUM_PROCESS_INFO,
                    Services::SERVICE_WIN32,
                    Services::SERVICE_STATE_ALL,
                    buffer.as_mut_ptr(),
                    buffer.len(),
                    &mut bytes_needed,
                    &mut services_returned,
                    &mut resume_handle,
                    ptr::null(),
                )
            };
            let more_data = if success != 0 {
                false
            } else {
                let error = io::Error::last_os_error();
                if error.raw_os_error() != Some(ERROR_MORE_DATA as i32) {
                    return Err(error);
                }
                true
            };

            let entries = unsafe {
                slice::from_raw_parts(
                    buffer.as_ptr() as *const Services::ENUM_SERVICE_STATUS_PROCESSW,
                    services_returned as usize,
                )
            };
            for entry in entries {
                names.push(unsafe { WideCStr::from_ptr_str(entry.lpServiceName) }.to_os_string());
            }

            if !more_data {
                return Ok(names);
            }
            if services_returned == 0 {
                buffer = AlignedBuffer::new(bytes_needed as usize);
            }
        }
    }
}

/// A handle to a registered service.
pub struct Service {
    service_handle: ScHandle,
}

impl Service {
    fn new(service_handle: ScHandle) -> Self {
        Service { service_handle }
    }

    fn control(&self, control: u32) -> io::Result<ServiceStatus> {
        let mut raw_status = unsafe { mem::zeroed::<Services::SERVICE_STATUS>() };
        let success = unsafe {
            Services::ControlService(self.service_handle.raw_handle(), control, &mut raw_status)
        };
        if success == 0 {
            Err(io::Error::last_os_error())
        } else {
            status_from_raw(&raw_status)
        }
    }

    /// Private helper to query the optional configuration parameters of windows services.
    ///
    /// # Safety
    ///
    /// `T` must be the structure the system writes for `kind`.
    unsafe fn query_config2<T>(&self, kind: u32, data: &mut AlignedBuffer) -> io::Result<*const T> {
        let mut bytes_written: u32 = 0;
        let success = Services::QueryServiceConfig2W(
            self.service_handle.raw_handle(),
            kind,
            data.as_mut_ptr(),
            data.len(),
            &mut bytes_written,
        );
        if success == 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(data.as_ptr() as *const T)
        }
    }

    /// Private helper to update the optional configuration parameters of windows services.
    unsafe fn change_config2<T>(&self, kind: u32, data: &mut T) -> io::Result<()> {
        let success = Services::ChangeServiceConfig2W(
            self.service_handle.raw_handle(),
            kind,
            data as *mut T as *const _,
        );
        if success == 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

impl ServiceHandle for Service {
    fn start(&self) -> io::Result<()> {
        let success =
            unsafe { Services::StartServiceW(self.service_handle.raw_handle(), 0, ptr::null()) };
        if success == 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn stop(&self) -> io::Result<ServiceStatus> {
        self.control(Services::SERVICE_CONTROL_STOP)
    }

    fn query_status(&self) -> io::Result<ServiceStatus> {
        let mut raw_status = unsafe { mem::zeroed::<Services::SERVICE_STATUS>() };
        let success = unsafe {
            Services::QueryServiceStatus(self.service_handle.raw_handle(), &mut raw_status)
        };
        if success == 0 {
            Err(io::Error::last_os_error())
        } else {
            status_from_raw(&raw_status)
        }
    }

    fn query_config(&self) -> io::Result<ServiceConfig> {
        let mut data = AlignedBuffer::new(MAX_QUERY_BUFFER_SIZE);
        let mut bytes_written: u32 = 0;
        let success = unsafe {
            Services::QueryServiceConfigW(
                self.service_handle.raw_handle(),
                data.as_mut_ptr().cast(),
                data.len(),
                &mut bytes_written,
            )
        };
        if success == 0 {
            return Err(io::Error::last_os_error());
        }

        let raw = unsafe { &*(data.as_ptr() as *const Services::QUERY_SERVICE_CONFIGW) };
        Ok(ServiceConfig {
            service_type: ServiceType::from_bits_truncate(raw.dwServiceType),
            start_type: ServiceStartType::from_raw(raw.dwStartType).map_err(invalid_data)?,
            error_control: ServiceErrorControl::from_raw(raw.dwErrorControl)
                .map_err(invalid_data)?,
            executable_path: PathBuf::from(unsafe { from_wide_ptr(raw.lpBinaryPathName) }.unwrap_or_default()),
            account_name: unsafe { from_wide_ptr(raw.lpServiceStartName) },
            display_name: unsafe { from_wide_ptr(raw.lpDisplayName) }.unwrap_or_default(),
        })
    }

    fn delete(&self) -> io::Result<()> {
        let success = unsafe { Services::DeleteService(self.service_handle.raw_handle()) };
        if success == 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn update_failure_actions(&self, update: &ServiceFailureActions) -> io::Result<()> {
        let mut reboot_msg = update
            .reboot_msg
            .as_ref()
            .map(|msg| to_wide(msg, "reboot message").map(WideCString::into_vec_with_nul))
            .transpose()?;
        let mut command = update
            .command
            .as_ref()
            .map(|command| to_wide(command, "failure command").map(WideCString::into_vec_with_nul))
            .transpose()?;
        let mut sc_actions: Option<Vec<Services::SC_ACTION>> = update.actions.as_ref().map(|actions| {
            actions
                .iter()
                .map(|action| Services::SC_ACTION {
                    Type: action.action_type.to_raw(),
                    Delay: action.delay_millis(),
                })
                .collect()
        });

        let mut raw_failure_actions = Services::SERVICE_FAILURE_ACTIONSW {
            dwResetPeriod: update.reset_period.to_raw(),
            lpRebootMsg: reboot_msg.as_mut().map_or(ptr::null_mut(), |s| s.as_mut_ptr()),
            lpCommand: command.as_mut().map_or(ptr::null_mut(), |s| s.as_mut_ptr()),
            cActions: sc_actions.as_ref().map_or(0, |actions| actions.len() as u32),
            lpsaActions: sc_actions
                .as_mut()
                .map_or(ptr::null_mut(), |actions| actions.as_mut_ptr()),
        };

        unsafe {
            self.change_config2(
                Services::SERVICE_CONFIG_FAILURE_ACTIONS,
                &mut raw_failure_actions,
            )
        }
    }

    fn failure_actions(&self) -> io::Result<ServiceFailureActions> {
        let mut data = AlignedBuffer::new(MAX_QUERY_BUFFER_SIZE);
        let raw = unsafe {
            &*self.query_config2::<Services::SERVICE_FAILURE_ACTIONSW>(
                Services::SERVICE_CONFIG_FAILURE_ACTIONS,
                &mut data,
            )?
        };

        let actions = if raw.lpsaActions.is_null() {
            None
        } else {
            let raw_actions =
                unsafe { slice::from_raw_parts(raw.lpsaActions, raw.cActions as usize) };
            Some(
                raw_actions
                    .iter()
                    .map(|action| {
                        Ok(ServiceAction {
                            action_type: ServiceActionType::from_raw(action.Type)
                                .map_err(invalid_data)?,
                            delay: Duration::from_millis(u64::from(action.Delay)),
                        })
                    })
                    .collect::<io::Result<Vec<_>>>()?,
            )
        };

        Ok(ServiceFailureActions {
            reset_period: ServiceFailureResetPeriod::from_raw(raw.dwResetPeriod),
            reboot_msg: unsafe { from_wide_ptr(raw.lpRebootMsg) },
            command: unsafe { from_wide_ptr(raw.lpCommand) },
            actions,
        })
    }

    fn set_dacl(&self, sddl: &str) -> Result<(), DaclError> {
        let descriptor = LocalSecurityDescriptor::from_sddl(sddl).map_err(DaclError::Parse)?;
        let success = unsafe {
            Services::SetServiceObjectSecurity(
                self.service_handle.raw_handle(),
                DACL_SECURITY_INFORMATION,
                descriptor.as_raw(),
            )
        };
        if success == 0 {
            Err(DaclError::Apply(io::Error::last_os_error()))
        } else {
            Ok(())
        }
    }

    fn dacl(&self) -> io::Result<String> {
        let mut bytes_needed: u32 = 0;
        let mut data = AlignedBuffer::new(0);
        loop {
            let success = unsafe {
                Services::QueryServiceObjectSecurity(
                    self.service_handle.raw_handle(),
                    DACL_SECURITY_INFORMATION,
                    data.as_mut_ptr().cast(),
                    data.len(),
                    &mut bytes_needed,
                )
            };
            if success != 0 {
                return unsafe { security::dacl_to_sddl(data.as_mut_ptr().cast()) };
            }
            let error = io::Error::last_os_error();
            if error.raw_os_error() != Some(ERROR_INSUFFICIENT_BUFFER as i32) {
                return Err(error);
            }
            data = AlignedBuffer::new(bytes_needed as usize);
        }
    }
}

/// Zeroed memory aligned for the structures the service API writes into caller buffers.
struct AlignedBuffer(Vec<u64>);

impl AlignedBuffer {
    fn new(bytes: usize) -> Self {
        AlignedBuffer(vec![0; (bytes + 7) / 8])
    }

    fn len(&self) -> u32 {
        u32::try_from(self.0.len() * 8).unwrap_or(u32::MAX)
    }

    fn as_ptr(&self) -> *const u8 {
        self.0.as_ptr().cast()
    }

    fn as_mut_ptr(&mut self) -> *mut u8 {
        self.0.as_mut_ptr().cast()
    }
}

fn status_from_raw(raw: &Services::SERVICE_STATUS) -> io::Result<ServiceStatus> {
    Ok(ServiceStatus {
        service_type: ServiceType::from_bits_truncate(raw.dwServiceType),
        current_state: ServiceState::from_raw(raw.dwCurrentState).map_err(invalid_data)?,
        exit_code: ServiceExitCode::from_raw(raw.dwWin32ExitCode, raw.dwServiceSpecificExitCode),
        checkpoint: raw.dwCheckPoint,
        wait_hint: Duration::from_millis(u64::from(raw.dwWaitHint)),
    })
}

fn invalid_data(error: ParseRawError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, error)
}

fn to_wide(s: impl AsRef<OsStr>, what: &str) -> io::Result<WideCString> {
    WideCString::from_os_str(s).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} contains a nul character", what),
        )
    })
}

/// # Safety
///
/// `ptr` must be null or point to a nul terminated wide string.
unsafe fn from_wide_ptr(ptr: *const u16) -> Option<OsString> {
    if ptr.is_null() {
        None
    } else {
        Some(WideCStr::from_ptr_str(ptr).to_os_string())
    }
}
