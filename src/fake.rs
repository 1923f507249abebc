//! An in-memory control authority that behaves like the service control manager closely enough
//! to exercise every operation without a privileged Windows session.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::ffi::{OsStr, OsString};
use std::io;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use crate::authority::{ControlAuthority, DaclError, ManagerSession, RegistryValue, ServiceHandle};
use crate::error::ERROR_SERVICE_DOES_NOT_EXIST;
use crate::security::{Dacl, Trustee, DEFAULT_SERVICE_SDDL};
use crate::service::{
    ServiceAccess, ServiceConfig, ServiceFailureActions,
    ServiceFailureResetPeriod, ServiceInfo, ServiceManagerAccess, ServiceState, ServiceStatus,
};
use crate::shell_escape;

pub const ERROR_FILE_NOT_FOUND: i32 = 2;
pub const ERROR_ACCESS_DENIED: i32 = 5;
pub const ERROR_INVALID_PARAMETER: i32 = 87;
pub const ERROR_SERVICE_ALREADY_RUNNING: i32 = 1056;
pub const ERROR_SERVICE_CANNOT_ACCEPT_CTRL: i32 = 1061;
pub const ERROR_SERVICE_NOT_ACTIVE: i32 = 1062;
pub const ERROR_SERVICE_MARKED_FOR_DELETE: i32 = 1072;
pub const ERROR_SERVICE_EXISTS: i32 = 1073;

/// A call into the authority that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Connect,
    Registry,
    Open,
    Create,
    Enumerate,
    Start,
    Stop,
    QueryStatus,
    QueryConfig,
    Delete,
    UpdateFailureActions,
    QueryFailureActions,
    ParseSddl,
    ApplyDacl,
    QueryDacl,
}

struct Entry {
    info: ServiceInfo,
    command_line: OsString,
    current_state: ServiceState,
    /// Status reads left until a pending transition settles. `None` never settles.
    pending_reads: Option<u32>,
    checkpoint: u32,
    failure_actions: Option<ServiceFailureActions>,
    dacl: Dacl,
    has_display_name_value: bool,
    marked_for_delete: bool,
    handles: usize,
    stop_controls: usize,
}

impl Entry {
    fn new(info: &ServiceInfo) -> Self {
        Entry {
            info: info.clone(),
            command_line: shell_escape::launch_command(info),
            current_state: ServiceState::Stopped,
            pending_reads: Some(0),
            checkpoint: 0,
            failure_actions: None,
            dacl: Dacl::parse(DEFAULT_SERVICE_SDDL).expect("default template parses"),
            has_display_name_value: true,
            marked_for_delete: false,
            handles: 0,
            stop_controls: 0,
        }
    }

    fn begin_transition(&mut self, pending: ServiceState, reads: Option<u32>) {
        self.checkpoint = 0;
        if reads == Some(0) {
            self.current_state = settled_state(pending);
        } else {
            self.current_state = pending;
            self.pending_reads = reads;
        }
    }

    fn read(&mut self) -> ServiceStatus {
        if self.current_state.is_pending() {
            match self.pending_reads {
                Some(left) if left <= 1 => {
                    self.current_state = settled_state(self.current_state);
                    self.checkpoint = 0;
                }
                Some(left) => {
                    self.pending_reads = Some(left - 1);
                    self.checkpoint += 1;
                }
                None => self.checkpoint += 1,
            }
        }
        self.status()
    }

    fn status(&self) -> ServiceStatus {
        let pending = self.current_state.is_pending();
        ServiceStatus {
            service_type: self.info.service_type,
            checkpoint: self.checkpoint,
            wait_hint: if pending {
                Duration::from_secs(2)
            } else {
                Duration::ZERO
            },
            ..ServiceStatus::settled(self.current_state)
        }
    }
}

fn settled_state(state: ServiceState) -> ServiceState {
    match state {
        ServiceState::StartPending | ServiceState::ContinuePending => ServiceState::Running,
        ServiceState::StopPending => ServiceState::Stopped,
        ServiceState::PausePending => ServiceState::Paused,
        other => other,
    }
}

#[derive(Default)]
struct State {
    services: BTreeMap<String, Entry>,
    failures: HashMap<Verb, i32>,
    start_reads: Option<u32>,
    stop_reads: Option<u32>,
    /// Principal whose access the service DACLs are checked against. `None` is unrestricted.
    caller: Option<Trustee>,
    manager_handles: usize,
    service_handles: usize,
}

impl State {
    fn check(&self, verb: Verb) -> io::Result<()> {
        match self.failures.get(&verb) {
            Some(code) => Err(io::Error::from_raw_os_error(*code)),
            None => Ok(()),
        }
    }

    fn entry_mut(&mut self, key: &str) -> io::Result<&mut Entry> {
        self.services
            .get_mut(key)
            .ok_or_else(|| io::Error::from_raw_os_error(ERROR_SERVICE_DOES_NOT_EXIST))
    }
}

fn key(name: &OsStr) -> String {
    name.to_string_lossy().to_ascii_lowercase()
}

fn require<T>(granted: T, needed: T) -> io::Result<()>
where
    T: bitflags::Flags + Copy,
{
    if granted.contains(needed) {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(ERROR_ACCESS_DENIED))
    }
}

/// Shared handle to the in-memory service database. Clones observe the same state.
#[derive(Clone)]
pub struct FakeAuthority {
    state: Rc<RefCell<State>>,
}

impl FakeAuthority {
    pub fn new() -> Self {
        let state = State {
            start_reads: Some(0),
            stop_reads: Some(0),
            ..State::default()
        };
        FakeAuthority {
            state: Rc::new(RefCell::new(state)),
        }
    }

    /// Register a service directly, as if somebody else had created it.
    pub fn insert(&self, info: &ServiceInfo) {
        self.state
            .borrow_mut()
            .services
            .insert(key(&info.name), Entry::new(info));
    }

    /// Make every subsequent call of `verb` fail with the Win32 error `code`.
    pub fn fail(&self, verb: Verb, code: i32) {
        self.state.borrow_mut().failures.insert(verb, code);
    }

    pub fn succeed(&self, verb: Verb) {
        self.state.borrow_mut().failures.remove(&verb);
    }

    /// Services report `StartPending` until the `reads`-th status read after a start.
    pub fn start_settles_after(&self, reads: u32) {
        self.state.borrow_mut().start_reads = Some(reads);
    }

    /// Services report `StopPending` until the `reads`-th status read after a stop.
    pub fn stop_settles_after(&self, reads: u32) {
        self.state.borrow_mut().stop_reads = Some(reads);
    }

    /// Services never leave `StopPending` once asked to stop.
    pub fn never_stop(&self) {
        self.state.borrow_mut().stop_reads = None;
    }

    pub fn set_state(&self, name: &str, current_state: ServiceState) {
        if let Some(entry) = self.state.borrow_mut().services.get_mut(&key(OsStr::new(name))) {
            entry.current_state = current_state;
        }
    }

    /// Open services and enumerate them as a member of `caller`, subject to each DACL.
    pub fn act_as(&self, caller: Trustee) {
        self.state.borrow_mut().caller = Some(caller);
    }

    /// Replace the DACL directly, bypassing the caller's access.
    pub fn set_dacl(&self, name: &str, sddl: &str) {
        if let Some(entry) = self.state.borrow_mut().services.get_mut(&key(OsStr::new(name))) {
            entry.dacl = Dacl::parse(sddl).expect("test DACL parses");
        }
    }

    /// Replace the `ImagePath` registry value.
    pub fn set_command_line(&self, name: &str, command_line: impl Into<OsString>) {
        if let Some(entry) = self.state.borrow_mut().services.get_mut(&key(OsStr::new(name))) {
            entry.command_line = command_line.into();
        }
    }

    pub fn remove_display_name(&self, name: &str) {
        if let Some(entry) = self.state.borrow_mut().services.get_mut(&key(OsStr::new(name))) {
            entry.has_display_name_value = false;
        }
    }

    /// Whether an entry exists, including one marked for deletion that still has open handles.
    pub fn is_registered(&self, name: &str) -> bool {
        self.state
            .borrow()
            .services
            .contains_key(&key(OsStr::new(name)))
    }

    pub fn state_of(&self, name: &str) -> Option<ServiceState> {
        self.state
            .borrow()
            .services
            .get(&key(OsStr::new(name)))
            .map(|entry| entry.current_state)
    }

    pub fn info(&self, name: &str) -> Option<ServiceInfo> {
        self.state
            .borrow()
            .services
            .get(&key(OsStr::new(name)))
            .map(|entry| entry.info.clone())
    }

    pub fn dacl(&self, name: &str) -> Option<Dacl> {
        self.state
            .borrow()
            .services
            .get(&key(OsStr::new(name)))
            .map(|entry| entry.dacl.clone())
    }

    pub fn installed_failure_actions(&self, name: &str) -> Option<ServiceFailureActions> {
        self.state
            .borrow()
            .services
            .get(&key(OsStr::new(name)))
            .and_then(|entry| entry.failure_actions.clone())
    }

    pub fn stop_controls(&self, name: &str) -> usize {
        self.state
            .borrow()
            .services
            .get(&key(OsStr::new(name)))
            .map_or(0, |entry| entry.stop_controls)
    }

    /// Manager connections plus service handles that have not been dropped yet.
    pub fn open_handles(&self) -> usize {
        let state = self.state.borrow();
        state.manager_handles + state.service_handles
    }
}

impl ControlAuthority for FakeAuthority {
    type Manager = FakeManager;

    fn connect(&self, request_access: ServiceManagerAccess) -> io::Result<FakeManager> {
        let mut state = self.state.borrow_mut();
        state.check(Verb::Connect)?;
        state.manager_handles += 1;
        Ok(FakeManager {
            state: Rc::clone(&self.state),
            access: request_access,
        })
    }

    fn registry_value(
        &self,
        service: &OsStr,
        value: RegistryValue,
    ) -> io::Result<Option<OsString>> {
        let state = self.state.borrow();
        state.check(Verb::Registry)?;
        let entry = state
            .services
            .get(&key(service))
            .ok_or_else(|| io::Error::from_raw_os_error(ERROR_FILE_NOT_FOUND))?;
        Ok(match value {
            RegistryValue::DisplayName if entry.has_display_name_value => {
                Some(entry.info.display_name.clone())
            }
            RegistryValue::DisplayName => None,
            RegistryValue::ImagePath => Some(entry.command_line.clone()),
        })
    }
}

pub struct FakeManager {
    state: Rc<RefCell<State>>,
    access: ServiceManagerAccess,
}

impl FakeManager {
    fn handle(&self, state: &mut State, key: String, access: ServiceAccess) -> FakeService {
        state.service_handles += 1;
        if let Some(entry) = state.services.get_mut(&key) {
            entry.handles += 1;
        }
        FakeService {
            state: Rc::clone(&self.state),
            key,
            access,
        }
    }
}

impl ManagerSession for FakeManager {
    type Service = FakeService;

    fn open_service(&self, name: &OsStr, request_access: ServiceAccess) -> io::Result<FakeService> {
        let mut state = self.state.borrow_mut();
        state.check(Verb::Open)?;
        require(self.access, ServiceManagerAccess::CONNECT)?;
        let key = key(name);
        let caller = state.caller.clone();
        let entry = state.entry_mut(&key)?;
        if let Some(caller) = caller {
            if !entry.dacl.allows(&caller, request_access) {
                return Err(io::Error::from_raw_os_error(ERROR_ACCESS_DENIED));
            }
        }
        Ok(self.handle(&mut state, key, request_access))
    }

    fn create_service(
        &self,
        service_info: &ServiceInfo,
        service_access: ServiceAccess,
    ) -> io::Result<FakeService> {
        let mut state = self.state.borrow_mut();
        state.check(Verb::Create)?;
        require(self.access, ServiceManagerAccess::CREATE_SERVICE)?;
        let key = key(&service_info.name);
        if let Some(entry) = state.services.get(&key) {
            let code = if entry.marked_for_delete {
                ERROR_SERVICE_MARKED_FOR_DELETE
            } else {
                ERROR_SERVICE_EXISTS
            };
            return Err(io::Error::from_raw_os_error(code));
        }
        state.services.insert(key.clone(), Entry::new(service_info));
        Ok(self.handle(&mut state, key, service_access))
    }

    fn service_names(&self) -> io::Result<Vec<OsString>> {
        let state = self.state.borrow();
        state.check(Verb::Enumerate)?;
        require(self.access, ServiceManagerAccess::ENUMERATE_SERVICE)?;
        Ok(state
            .services
            .values()
            .filter(|entry| {
                state.caller.as_ref().map_or(true, |caller| {
                    entry.dacl.allows(caller, ServiceAccess::QUERY_STATUS)
                })
            })
            .map(|entry| entry.info.name.clone())
            .collect())
    }
}

impl Drop for FakeManager {
    fn drop(&mut self) {
        self.state.borrow_mut().manager_handles -= 1;
    }
}

pub struct FakeService {
    state: Rc<RefCell<State>>,
    key: String,
    access: ServiceAccess,
}

impl FakeService {
    fn with_entry<T>(
        &self,
        verb: Verb,
        needed: ServiceAccess,
        f: impl FnOnce(&mut Entry, Option<u32>, Option<u32>) -> io::Result<T>,
    ) -> io::Result<T> {
        let mut state = self.state.borrow_mut();
        state.check(verb)?;
        require(self.access, needed)?;
        let (start_reads, stop_reads) = (state.start_reads, state.stop_reads);
        let entry = state.entry_mut(&self.key)?;
        f(entry, start_reads, stop_reads)
    }
}

impl ServiceHandle for FakeService {
    fn start(&self) -> io::Result<()> {
        self.with_entry(Verb::Start, ServiceAccess::START, |entry, start_reads, _| {
            if entry.marked_for_delete {
                return Err(io::Error::from_raw_os_error(ERROR_SERVICE_MARKED_FOR_DELETE));
            }
            if entry.current_state != ServiceState::Stopped {
                return Err(io::Error::from_raw_os_error(ERROR_SERVICE_ALREADY_RUNNING));
            }
            entry.begin_transition(ServiceState::StartPending, start_reads);
            Ok(())
        })
    }

    fn stop(&self) -> io::Result<ServiceStatus> {
        self.with_entry(Verb::Stop, ServiceAccess::STOP, |entry, _, stop_reads| {
            match entry.current_state {
                ServiceState::Stopped => {
                    Err(io::Error::from_raw_os_error(ERROR_SERVICE_NOT_ACTIVE))
                }
                ServiceState::StopPending => {
                    Err(io::Error::from_raw_os_error(ERROR_SERVICE_CANNOT_ACCEPT_CTRL))
                }
                _ => {
                    entry.stop_controls += 1;
                    entry.begin_transition(ServiceState::StopPending, stop_reads);
                    Ok(entry.status())
                }
            }
        })
    }

    fn query_status(&self) -> io::Result<ServiceStatus> {
        self.with_entry(Verb::QueryStatus, ServiceAccess::QUERY_STATUS, |entry, _, _| {
            Ok(entry.read())
        })
    }

    fn query_config(&self) -> io::Result<ServiceConfig> {
        self.with_entry(Verb::QueryConfig, ServiceAccess::QUERY_CONFIG, |entry, _, _| {
            Ok(ServiceConfig {
                service_type: entry.info.service_type,
                start_type: entry.info.start_type,
                error_control: entry.info.error_control,
                executable_path: PathBuf::from(&entry.command_line),
                account_name: Some(OsString::from("LocalSystem")),
                display_name: entry.info.display_name.clone(),
            })
        })
    }

    fn delete(&self) -> io::Result<()> {
        self.with_entry(Verb::Delete, ServiceAccess::DELETE, |entry, _, _| {
            if entry.marked_for_delete {
                return Err(io::Error::from_raw_os_error(ERROR_SERVICE_MARKED_FOR_DELETE));
            }
            entry.marked_for_delete = true;
            Ok(())
        })
    }

    fn update_failure_actions(&self, update: &ServiceFailureActions) -> io::Result<()> {
        self.with_entry(
            Verb::UpdateFailureActions,
            ServiceAccess::CHANGE_CONFIG,
            |entry, _, _| {
                entry.failure_actions = Some(update.clone());
                Ok(())
            },
        )
    }

    fn failure_actions(&self) -> io::Result<ServiceFailureActions> {
        self.with_entry(
            Verb::QueryFailureActions,
            ServiceAccess::QUERY_CONFIG,
            |entry, _, _| {
                Ok(entry.failure_actions.clone().unwrap_or(ServiceFailureActions {
                    reset_period: ServiceFailureResetPeriod::After(Duration::ZERO),
                    reboot_msg: None,
                    command: None,
                    actions: None,
                }))
            },
        )
    }

    fn set_dacl(&self, sddl: &str) -> Result<(), DaclError> {
        let dacl = {
            let state = self.state.borrow();
            state.check(Verb::ParseSddl).map_err(DaclError::Parse)?;
            Dacl::parse(sddl)
                .map_err(|_| DaclError::Parse(io::Error::from_raw_os_error(ERROR_INVALID_PARAMETER)))?
        };
        self.with_entry(Verb::ApplyDacl, ServiceAccess::WRITE_DAC, |entry, _, _| {
            entry.dacl = dacl;
            Ok(())
        })
        .map_err(DaclError::Apply)
    }

    fn dacl(&self) -> io::Result<String> {
        self.with_entry(Verb::QueryDacl, ServiceAccess::READ_CONTROL, |entry, _, _| {
            Ok(entry.dacl.to_string())
        })
    }
}

impl Drop for FakeService {
    fn drop(&mut self) {
        let mut state = self.state.borrow_mut();
        state.service_handles -= 1;
        let remove = match state.services.get_mut(&self.key) {
            Some(entry) => {
                entry.handles -= 1;
                entry.marked_for_delete && entry.handles == 0
            }
            None => false,
        };
        if remove {
            state.services.remove(&self.key);
        }
    }
}
