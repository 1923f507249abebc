use std::ffi::{c_void, OsStr, OsString};
use std::{io, ptr};

use widestring::{WideCStr, WideCString};
use windows_sys::Win32::{
    Foundation::{ERROR_FILE_NOT_FOUND, ERROR_MORE_DATA, ERROR_SUCCESS},
    System::Registry::{
        RegCloseKey, RegGetValueW, RegOpenKeyExW, HKEY, HKEY_LOCAL_MACHINE, KEY_READ,
        RRF_RT_REG_SZ,
    },
};

const SERVICES_KEY: &str = r"SYSTEM\CurrentControlSet\Services";

/// An open registry key, closed on drop.
pub(crate) struct RegKey(HKEY);

impl RegKey {
    /// Open the configuration key of a service for reading.
    pub(crate) fn open_service(name: &OsStr) -> io::Result<Self> {
        let mut path = OsString::from(SERVICES_KEY);
        path.push(r"\");
        path.push(name);
        let wide_path = WideCString::from_os_str(&path)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "service name contains a nul"))?;

        let mut key: HKEY = ptr::null_mut();
        let status =
            unsafe { RegOpenKeyExW(HKEY_LOCAL_MACHINE, wide_path.as_ptr(), 0, KEY_READ, &mut key) };
        if status != ERROR_SUCCESS {
            return Err(io::Error::from_raw_os_error(status as i32));
        }
        Ok(RegKey(key))
    }

    /// Read a `REG_SZ` value. `REG_EXPAND_SZ` values are returned with environment variables
    /// expanded. Returns `Ok(None)` if the value does not exist.
    pub(crate) fn string_value(&self, name: &str) -> io::Result<Option<OsString>> {
        let wide_name = WideCString::from_str(name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "value name contains a nul"))?;

        loop {
            let mut size: u32 = 0;
            let status = unsafe { self.get_value(&wide_name, ptr::null_mut(), &mut size) };
            match status {
                ERROR_SUCCESS => {}
                ERROR_FILE_NOT_FOUND => return Ok(None),
                error => return Err(io::Error::from_raw_os_error(error as i32)),
            }

            let mut data = vec![0u16; (size as usize + 1) / 2];
            let status = unsafe { self.get_value(&wide_name, data.as_mut_ptr().cast(), &mut size) };
            match status {
                ERROR_SUCCESS => {
                    let value = WideCStr::from_slice_truncate(&data)
                        .map(WideCStr::to_os_string)
                        .unwrap_or_else(|_| OsString::new());
                    return Ok(Some(value));
                }
                // The value grew between the two calls.
                ERROR_MORE_DATA => continue,
                ERROR_FILE_NOT_FOUND => return Ok(None),
                error => return Err(io::Error::from_raw_os_error(error as i32)),
            }
        }
    }

    unsafe fn get_value(&self, name: &WideCStr, data: *mut c_void, size: &mut u32) -> u32 {
        RegGetValueW(
            self.0,
            ptr::null(),
            name.as_ptr(),
            RRF_RT_REG_SZ,
            ptr::null_mut(),
            data,
            size,
        )
    }
}

impl Drop for RegKey {
    fn drop(&mut self) {
        unsafe { RegCloseKey(self.0) };
    }
}
