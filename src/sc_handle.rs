use std::io;

use windows_sys::Win32::System::Services;

/// Owns a service control manager or service handle and closes it when dropped.
pub(crate) struct ScHandle(Services::SC_HANDLE);

impl ScHandle {
    /// Take ownership of the handle returned by `OpenSCManagerW`, `OpenServiceW` or
    /// `CreateServiceW`. A null handle means the call failed, the thread's last error is
    /// returned instead.
    ///
    /// # Safety
    ///
    /// `handle` must be null or an open handle that nothing else closes.
    pub(crate) unsafe fn from_call(handle: Services::SC_HANDLE) -> io::Result<Self> {
        if handle.is_null() {
            Err(io::Error::last_os_error())
        } else {
            Ok(ScHandle(handle))
        }
    }

    pub(crate) fn raw_handle(&self) -> Services::SC_HANDLE {
        self.0
    }
}

impl Drop for ScHandle {
    fn drop(&mut self) {
        unsafe { Services::CloseServiceHandle(self.0) };
    }
}
