use std::{io, ptr};

use windows_sys::Win32::Security::{
    CheckTokenMembership, CreateWellKnownSid, WinBuiltinAdministratorsSid, SECURITY_MAX_SID_SIZE,
};

/// Whether the current process runs with membership in the built-in Administrators group.
///
/// Returns `false` when membership cannot be determined.
pub fn is_admin() -> bool {
    match administrators_membership() {
        Ok(is_member) => is_member,
        Err(error) => {
            tracing::debug!(%error, "unable to check administrators membership");
            false
        }
    }
}

fn administrators_membership() -> io::Result<bool> {
    // SIDs are made of 32 bit sub-authorities.
    let mut sid = [0u32; SECURITY_MAX_SID_SIZE as usize / 4];
    let mut sid_size = SECURITY_MAX_SID_SIZE;

    let success = unsafe {
        CreateWellKnownSid(
            WinBuiltinAdministratorsSid,
            ptr::null_mut(),
            sid.as_mut_ptr().cast(),
            &mut sid_size,
        )
    };
    if success == 0 {
        return Err(io::Error::last_os_error());
    }

    let mut is_member = 0;
    let success =
        unsafe { CheckTokenMembership(ptr::null_mut(), sid.as_mut_ptr().cast(), &mut is_member) };
    if success == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(is_member != 0)
}
