use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Raw value the system uses for an infinite failure reset period.
pub(crate) const INFINITE: u32 = 0xFFFF_FFFF;

bitflags::bitflags! {
    /// Kind of program behind a service entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ServiceType: u32 {
        /// Kernel mode driver
        const KERNEL_DRIVER = 0x0000_0001;

        /// File system driver
        const FILE_SYSTEM_DRIVER = 0x0000_0002;

        /// Runs alone in its process
        const OWN_PROCESS = 0x0000_0010;

        /// Runs in a process hosting other services too
        const SHARE_PROCESS = 0x0000_0020;

        /// May interact with the desktop
        const INTERACTIVE_PROCESS = 0x0000_0100;
    }
}

bitflags::bitflags! {
    /// Rights requested when opening a service.
    ///
    /// The same bits make up the rights mask of an access control entry on a service object.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ServiceAccess: u32 {
        /// Read the configuration
        const QUERY_CONFIG = 0x0000_0001;

        /// Change the configuration, failure actions included
        const CHANGE_CONFIG = 0x0000_0002;

        /// Read the status
        const QUERY_STATUS = 0x0000_0004;

        /// List dependent services
        const ENUMERATE_DEPENDENTS = 0x0000_0008;

        /// Start
        const START = 0x0000_0010;

        /// Send the stop control
        const STOP = 0x0000_0020;

        /// Send pause and continue controls
        const PAUSE_CONTINUE = 0x0000_0040;

        /// Send the interrogate control
        const INTERROGATE = 0x0000_0080;

        /// Send user defined controls
        const USER_DEFINED_CONTROL = 0x0000_0100;

        /// Mark for deletion
        const DELETE = 0x0001_0000;

        /// Read the security descriptor
        const READ_CONTROL = 0x0002_0000;

        /// Replace the DACL
        const WRITE_DAC = 0x0004_0000;

        /// Change the owner
        const WRITE_OWNER = 0x0008_0000;

        const GENERIC_ALL = 0x1000_0000;
        const GENERIC_EXECUTE = 0x2000_0000;
        const GENERIC_WRITE = 0x4000_0000;
        const GENERIC_READ = 0x8000_0000;

        /// Every specific and standard right a service object knows about.
        const ALL_ACCESS = 0x000F_01FF;
    }
}

impl ServiceAccess {
    /// Replace generic rights with the specific service rights they stand for.
    pub fn map_generic(self) -> ServiceAccess {
        let mut mapped = self
            - (ServiceAccess::GENERIC_ALL
                | ServiceAccess::GENERIC_EXECUTE
                | ServiceAccess::GENERIC_WRITE
                | ServiceAccess::GENERIC_READ);

        if self.contains(ServiceAccess::GENERIC_READ) {
            mapped |= ServiceAccess::READ_CONTROL
                | ServiceAccess::QUERY_CONFIG
                | ServiceAccess::QUERY_STATUS
                | ServiceAccess::INTERROGATE
                | ServiceAccess::ENUMERATE_DEPENDENTS;
        }
        if self.contains(ServiceAccess::GENERIC_WRITE) {
            mapped |= ServiceAccess::READ_CONTROL | ServiceAccess::CHANGE_CONFIG;
        }
        if self.contains(ServiceAccess::GENERIC_EXECUTE) {
            mapped |= ServiceAccess::READ_CONTROL
                | ServiceAccess::START
                | ServiceAccess::STOP
                | ServiceAccess::PAUSE_CONTINUE
                | ServiceAccess::USER_DEFINED_CONTROL;
        }
        if self.contains(ServiceAccess::GENERIC_ALL) {
            mapped |= ServiceAccess::ALL_ACCESS;
        }
        mapped
    }
}

bitflags::bitflags! {
    /// Rights requested when connecting to the service control manager.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ServiceManagerAccess: u32 {
        /// Open services
        const CONNECT = 0x0000_0001;

        /// Register new services
        const CREATE_SERVICE = 0x0000_0002;

        /// List registered services
        const ENUMERATE_SERVICE = 0x0000_0004;
    }
}

/// Declares a fieldless enum whose discriminants are the raw values the service control manager
/// uses, together with `to_raw` and a checked `from_raw`.
macro_rules! raw_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident: $raw:ident, $invalid:ident {
            $($(#[$variant_meta:meta])* $variant:ident = $value:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr($raw)]
        pub enum $name {
            $($(#[$variant_meta])* $variant = $value,)+
        }

        impl $name {
            pub fn to_raw(&self) -> $raw {
                *self as $raw
            }

            pub fn from_raw(raw: $raw) -> Result<$name, ParseRawError> {
                match raw {
                    $($value => Ok($name::$variant),)+
                    _ => Err(ParseRawError::$invalid(raw)),
                }
            }
        }
    };
}

raw_enum! {
    /// When the system starts a service.
    pub enum ServiceStartType: u32, InvalidInteger {
        /// At boot, by the service control manager
        AutoStart = 0x0000_0002,
        /// Only when someone asks for it
        OnDemand = 0x0000_0003,
        /// Never
        Disabled = 0x0000_0004,
    }
}

raw_enum! {
    /// What the system does when the service fails to start during boot.
    pub enum ServiceErrorControl: u32, InvalidInteger {
        Ignore = 0x0000_0000,
        Normal = 0x0000_0001,
        Severe = 0x0000_0002,
        Critical = 0x0000_0003,
    }
}

raw_enum! {
    /// Lifecycle state of a service, part of [`ServiceStatus`].
    pub enum ServiceState: u32, InvalidInteger {
        Stopped = 0x0000_0001,
        StartPending = 0x0000_0002,
        StopPending = 0x0000_0003,
        Running = 0x0000_0004,
        ContinuePending = 0x0000_0005,
        PausePending = 0x0000_0006,
        Paused = 0x0000_0007,
    }
}

impl ServiceState {
    /// Whether the service is between two stable states.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            ServiceState::StartPending
                | ServiceState::StopPending
                | ServiceState::ContinuePending
                | ServiceState::PausePending
        )
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ServiceState::Stopped => "stopped",
            ServiceState::StartPending => "start pending",
            ServiceState::StopPending => "stop pending",
            ServiceState::Running => "running",
            ServiceState::ContinuePending => "continue pending",
            ServiceState::PausePending => "pause pending",
            ServiceState::Paused => "paused",
        };
        f.write_str(text)
    }
}

/// Exit code a service reported, either a win32 error or a code of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceExitCode {
    Win32(u32),
    ServiceSpecific(u32),
}

impl ServiceExitCode {
    pub const NO_ERROR: Self = ServiceExitCode::Win32(0);

    const ERROR_SERVICE_SPECIFIC_ERROR: u32 = 1066;

    pub fn from_raw(win32_exit_code: u32, service_specific_exit_code: u32) -> Self {
        if win32_exit_code == Self::ERROR_SERVICE_SPECIFIC_ERROR {
            ServiceExitCode::ServiceSpecific(service_specific_exit_code)
        } else {
            ServiceExitCode::Win32(win32_exit_code)
        }
    }
}

impl Default for ServiceExitCode {
    fn default() -> Self {
        Self::NO_ERROR
    }
}

/// Service status as reported by the service control manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceStatus {
    pub service_type: ServiceType,

    pub current_state: ServiceState,

    /// Error reported while starting or stopping.
    pub exit_code: ServiceExitCode,

    /// Progress value of a lengthy start, stop, pause or continue operation. Zero when no
    /// transition is pending.
    pub checkpoint: u32,

    /// Estimated time for the pending operation.
    pub wait_hint: Duration,
}

impl ServiceStatus {
    /// A status in a stable state, with no transition in progress.
    pub fn settled(current_state: ServiceState) -> Self {
        ServiceStatus {
            service_type: ServiceType::OWN_PROCESS,
            current_state,
            exit_code: ServiceExitCode::NO_ERROR,
            checkpoint: 0,
            wait_hint: Duration::default(),
        }
    }
}

raw_enum! {
    /// What the service control manager does after a failure of the service.
    pub enum ServiceActionType: i32, InvalidIntegerSigned {
        None = 0,
        Restart = 1,
        Reboot = 2,
        RunCommand = 3,
    }
}

/// One step of a recovery policy: what to do after a failure, and how long to wait first.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceAction {
    pub action_type: ServiceActionType,
    pub delay: Duration,
}

impl ServiceAction {
    pub fn restart_after(delay: Duration) -> Self {
        ServiceAction {
            action_type: ServiceActionType::Restart,
            delay,
        }
    }

    /// The delay in the millisecond resolution the system stores, saturating at `u32::MAX`.
    pub fn delay_millis(&self) -> u32 {
        u32::try_from(self.delay.as_millis()).unwrap_or(u32::MAX)
    }
}

/// How long a service must run without failing before its failure count starts over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceFailureResetPeriod {
    Never,
    After(Duration),
}

impl ServiceFailureResetPeriod {
    pub fn from_raw(raw: u32) -> ServiceFailureResetPeriod {
        match raw {
            INFINITE => ServiceFailureResetPeriod::Never,
            _ => ServiceFailureResetPeriod::After(Duration::from_secs(raw as u64)),
        }
    }

    /// Seconds as the system stores them. Periods that do not fit are clamped just below the
    /// value meaning "never".
    pub fn to_raw(&self) -> u32 {
        match self {
            ServiceFailureResetPeriod::Never => INFINITE,
            ServiceFailureResetPeriod::After(duration) => {
                u32::try_from(duration.as_secs()).map_or(INFINITE - 1, |secs| secs.min(INFINITE - 1))
            }
        }
    }
}

/// Recovery policy of a service as the service control manager stores it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceFailureActions {
    pub reset_period: ServiceFailureResetPeriod,

    /// Broadcast before a reboot action. `None` leaves the stored message alone on update.
    pub reboot_msg: Option<OsString>,

    /// Run by a run-command action. `None` leaves the stored command alone on update.
    pub command: Option<OsString>,

    /// Actions for the first, second and later failures. `None` on update keeps the stored
    /// actions and reset period.
    pub actions: Option<Vec<ServiceAction>>,
}

/// Everything needed to register a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceInfo {
    /// Service name, unique among the registered services.
    pub name: OsString,

    /// Name shown in the services console.
    pub display_name: OsString,

    pub service_type: ServiceType,
    pub start_type: ServiceStartType,
    pub error_control: ServiceErrorControl,

    /// Executable to run. Quoted on registration when it contains whitespace.
    pub executable_path: PathBuf,

    /// Appended to the registered command line.
    pub launch_arguments: Vec<OsString>,
}

impl ServiceInfo {
    /// Describe an own-process service that is displayed under its own name.
    pub fn new(
        name: impl AsRef<OsStr>,
        executable_path: impl Into<PathBuf>,
        autostart: bool,
    ) -> Self {
        let name = name.as_ref().to_os_string();
        ServiceInfo {
            display_name: name.clone(),
            name,
            service_type: ServiceType::OWN_PROCESS,
            start_type: if autostart {
                ServiceStartType::AutoStart
            } else {
                ServiceStartType::OnDemand
            },
            error_control: ServiceErrorControl::Normal,
            executable_path: executable_path.into(),
            launch_arguments: Vec::new(),
        }
    }

    pub fn with_display_name(mut self, display_name: impl AsRef<OsStr>) -> Self {
        self.display_name = display_name.as_ref().to_os_string();
        self
    }

    pub fn with_launch_arguments(mut self, arguments: Vec<OsString>) -> Self {
        self.launch_arguments = arguments;
        self
    }
}

/// Configuration of a registered service as read back from the system.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceConfig {
    pub service_type: ServiceType,
    pub start_type: ServiceStartType,
    pub error_control: ServiceErrorControl,

    /// Command line of the service binary, including launch arguments.
    pub executable_path: PathBuf,

    /// Account the service runs as. `None` when the system does not report one.
    pub account_name: Option<OsString>,

    pub display_name: OsString,
}

/// Error returned when a raw value reported by the system has no corresponding variant.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseRawError {
    #[error("invalid integer value: {0}")]
    InvalidInteger(u32),
    #[error("invalid signed integer value: {0}")]
    InvalidIntegerSigned(i32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_info_start_type_follows_autostart() {
        let auto = ServiceInfo::new("T1", r"C:\a.exe", true);
        assert_eq!(auto.start_type, ServiceStartType::AutoStart);
        assert_eq!(auto.display_name, OsString::from("T1"));
        assert_eq!(auto.error_control, ServiceErrorControl::Normal);

        let manual = ServiceInfo::new("T1", r"C:\a.exe", false).with_display_name("Test one");
        assert_eq!(manual.start_type, ServiceStartType::OnDemand);
        assert_eq!(manual.display_name, OsString::from("Test one"));
    }

    #[test]
    fn test_service_state_rejects_unknown_value() {
        assert_eq!(ServiceState::from_raw(4), Ok(ServiceState::Running));
        assert_eq!(ServiceState::from_raw(0), Err(ParseRawError::InvalidInteger(0)));
        assert!(ServiceState::StopPending.is_pending());
        assert!(!ServiceState::Paused.is_pending());
    }

    #[test]
    fn test_reset_period_never_is_infinite() {
        assert_eq!(ServiceFailureResetPeriod::Never.to_raw(), INFINITE);
        assert_eq!(
            ServiceFailureResetPeriod::from_raw(60),
            ServiceFailureResetPeriod::After(Duration::from_secs(60))
        );
        let huge = ServiceFailureResetPeriod::After(Duration::from_secs(u64::MAX));
        assert_eq!(huge.to_raw(), INFINITE - 1);
    }

    #[test]
    fn test_generic_rights_are_mapped() {
        let mapped = (ServiceAccess::GENERIC_READ | ServiceAccess::STOP).map_generic();
        assert!(mapped.contains(ServiceAccess::QUERY_STATUS | ServiceAccess::STOP));
        assert!(!mapped.intersects(ServiceAccess::GENERIC_READ | ServiceAccess::START));
        assert_eq!(ServiceAccess::GENERIC_ALL.map_generic(), ServiceAccess::ALL_ACCESS);
    }

    #[test]
    fn test_service_specific_exit_code() {
        assert_eq!(
            ServiceExitCode::from_raw(1066, 42),
            ServiceExitCode::ServiceSpecific(42)
        );
        assert_eq!(ServiceExitCode::from_raw(5, 42), ServiceExitCode::Win32(5));
    }
}
