//! Discretionary access control lists in the Security Descriptor Definition Language.
//!
//! Only the DACL subset of SDDL is understood, which is all a service visibility template
//! needs:
//!
//! ```text
//! D:[flags](ace_type;ace_flags;rights;object_guid;inherit_object_guid;trustee)...
//! ```
//!
//! Rights are written with the two letter codes used for service objects, for example
//! `LC` for querying the status or `RP` for starting the service.

use std::fmt;
use std::str::FromStr;

use crate::service::ServiceAccess;

/// Grants control to the system and administrators only. Interactive and service users can no
/// longer open or list the service.
pub const HIDDEN_SERVICE_SDDL: &str =
    "D:(A;;CCLCSWRPWPDTLOCRRC;;;SY)(A;;CCDCLCSWRPWPDTLOCRSDRCWDWO;;;BA)";

/// The descriptor the system assigns to a newly created service.
pub const DEFAULT_SERVICE_SDDL: &str = "D:(A;;CCLCSWRPWPDTLOCRRC;;;SY)(A;;CCDCLCSWRPWPDTLOCRSDRCWDWO;;;BA)(A;;CCLCSWLOCRRC;;;IU)(A;;CCLCSWLOCRRC;;;SU)";

const RIGHT_CODES: &[(&str, ServiceAccess)] = &[
    ("CC", ServiceAccess::QUERY_CONFIG),
    ("DC", ServiceAccess::CHANGE_CONFIG),
    ("LC", ServiceAccess::QUERY_STATUS),
    ("SW", ServiceAccess::ENUMERATE_DEPENDENTS),
    ("RP", ServiceAccess::START),
    ("WP", ServiceAccess::STOP),
    ("DT", ServiceAccess::PAUSE_CONTINUE),
    ("LO", ServiceAccess::INTERROGATE),
    ("CR", ServiceAccess::USER_DEFINED_CONTROL),
    ("SD", ServiceAccess::DELETE),
    ("RC", ServiceAccess::READ_CONTROL),
    ("WD", ServiceAccess::WRITE_DAC),
    ("WO", ServiceAccess::WRITE_OWNER),
    ("GA", ServiceAccess::GENERIC_ALL),
    ("GX", ServiceAccess::GENERIC_EXECUTE),
    ("GW", ServiceAccess::GENERIC_WRITE),
    ("GR", ServiceAccess::GENERIC_READ),
];

static TRUSTEE_ALIASES: &[(&str, &str, Trustee)] = &[
    ("SY", "S-1-5-18", Trustee::LocalSystem),
    ("BA", "S-1-5-32-544", Trustee::BuiltinAdministrators),
    ("BU", "S-1-5-32-545", Trustee::BuiltinUsers),
    ("IU", "S-1-5-4", Trustee::InteractiveUsers),
    ("SU", "S-1-5-6", Trustee::ServiceUsers),
    ("AU", "S-1-5-11", Trustee::AuthenticatedUsers),
    ("WD", "S-1-1-0", Trustee::Everyone),
    ("LS", "S-1-5-19", Trustee::LocalService),
    ("NS", "S-1-5-20", Trustee::NetworkService),
];

/// Which of the two service visibility templates to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Visibility {
    /// Only the system and administrators may see and control the service.
    Hidden,
    /// Interactive and service users may additionally query and list the service.
    Visible,
}

impl Visibility {
    pub fn sddl(&self) -> &'static str {
        match self {
            Visibility::Hidden => HIDDEN_SERVICE_SDDL,
            Visibility::Visible => DEFAULT_SERVICE_SDDL,
        }
    }

    /// Classify a DACL by whether interactive users are allowed to query the service status,
    /// which is what listing tools need.
    pub fn of(dacl: &Dacl) -> Visibility {
        if dacl.allows(&Trustee::InteractiveUsers, ServiceAccess::QUERY_STATUS) {
            Visibility::Visible
        } else {
            Visibility::Hidden
        }
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Visibility::Hidden => f.write_str("hidden"),
            Visibility::Visible => f.write_str("visible"),
        }
    }
}

/// The principal an access control entry applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Trustee {
    LocalSystem,
    BuiltinAdministrators,
    BuiltinUsers,
    InteractiveUsers,
    ServiceUsers,
    AuthenticatedUsers,
    Everyone,
    LocalService,
    NetworkService,
    /// Any other principal, kept as its `S-1-...` string.
    Sid(String),
}

impl Trustee {
    /// Whether every principal that belongs to `member` also belongs to `self`.
    pub fn includes(&self, member: &Trustee) -> bool {
        if self == member || *self == Trustee::Everyone {
            return true;
        }
        match member {
            Trustee::InteractiveUsers => {
                matches!(self, Trustee::AuthenticatedUsers | Trustee::BuiltinUsers)
            }
            Trustee::BuiltinUsers
            | Trustee::ServiceUsers
            | Trustee::LocalService
            | Trustee::NetworkService => *self == Trustee::AuthenticatedUsers,
            _ => false,
        }
    }

    fn parse(text: &str) -> Result<Trustee, SddlError> {
        for (alias, sid, trustee) in TRUSTEE_ALIASES {
            if text == *alias || text.eq_ignore_ascii_case(sid) {
                return Ok(trustee.clone());
            }
        }
        let is_sid = match (text.get(..4), text.get(4..)) {
            (Some(prefix), Some(rest)) if !rest.is_empty() => {
                prefix.eq_ignore_ascii_case("S-1-")
                    && rest.split('-').all(|part| {
                        !part.is_empty() && part.bytes().all(|byte| byte.is_ascii_digit())
                    })
            }
            _ => false,
        };
        if is_sid {
            Ok(Trustee::Sid(text.to_ascii_uppercase()))
        } else {
            Err(SddlError::InvalidTrustee(text.to_owned()))
        }
    }
}

impl fmt::Display for Trustee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Trustee::Sid(sid) = self {
            return f.write_str(sid);
        }
        let alias = TRUSTEE_ALIASES
            .iter()
            .find(|(_, _, trustee)| trustee == self)
            .map_or("", |(alias, _, _)| *alias);
        f.write_str(alias)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AceType {
    AccessAllowed,
    AccessDenied,
}

/// A single access control entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Ace {
    pub ace_type: AceType,
    /// Inheritance flags such as `CI` or `OI`, kept verbatim.
    pub flags: String,
    pub rights: ServiceAccess,
    pub trustee: Trustee,
}

impl Ace {
    fn parse(text: &str) -> Result<Ace, SddlError> {
        let fields: Vec<&str> = text.split(';').collect();
        if fields.len() != 6 {
            return Err(SddlError::MalformedAce(text.to_owned()));
        }

        let ace_type = match fields[0] {
            "A" => AceType::AccessAllowed,
            "D" => AceType::AccessDenied,
            other => return Err(SddlError::UnsupportedAceType(other.to_owned())),
        };
        if !fields[3].is_empty() || !fields[4].is_empty() {
            return Err(SddlError::ObjectAce(text.to_owned()));
        }

        Ok(Ace {
            ace_type,
            flags: fields[1].to_owned(),
            rights: parse_rights(fields[2])?,
            trustee: Trustee::parse(fields[5])?,
        })
    }
}

impl fmt::Display for Ace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ace_type = match self.ace_type {
            AceType::AccessAllowed => "A",
            AceType::AccessDenied => "D",
        };
        write!(f, "({};{};", ace_type, self.flags)?;
        write_rights(f, self.rights)?;
        write!(f, ";;;{})", self.trustee)
    }
}

/// A discretionary access control list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dacl {
    /// Control flags such as `P` (protected) or `AI`, kept verbatim.
    pub flags: String,
    pub aces: Vec<Ace>,
}

impl Dacl {
    /// Parse an SDDL string that contains nothing but a DACL section.
    pub fn parse(sddl: &str) -> Result<Dacl, SddlError> {
        let body = sddl
            .trim()
            .strip_prefix("D:")
            .ok_or(SddlError::MissingDacl)?;

        let flags_end = body.find('(').unwrap_or(body.len());
        let (flags, mut rest) = body.split_at(flags_end);
        if !valid_dacl_flags(flags) {
            return match section_start(flags) {
                Some(section) => Err(SddlError::UnsupportedSection(section.to_owned())),
                None => Err(SddlError::UnsupportedDaclFlags(flags.to_owned())),
            };
        }

        let mut aces = Vec::new();
        while let Some(after_open) = rest.strip_prefix('(') {
            let close = after_open
                .find(')')
                .ok_or_else(|| SddlError::MalformedAce(after_open.to_owned()))?;
            aces.push(Ace::parse(&after_open[..close])?);
            rest = &after_open[close + 1..];
        }

        if !rest.is_empty() {
            return match section_start(rest) {
                Some(section) => Err(SddlError::UnsupportedSection(section.to_owned())),
                None => Err(SddlError::TrailingInput(rest.to_owned())),
            };
        }

        Ok(Dacl {
            flags: flags.to_owned(),
            aces,
        })
    }

    /// Evaluate the DACL for a principal that belongs to `trustee` the way the system does.
    /// Entries for `trustee` and for the groups that include it are visited in order. A deny
    /// entry for an outstanding right refuses access, allow entries grant access once they
    /// cover every requested right.
    pub fn allows(&self, trustee: &Trustee, requested: ServiceAccess) -> bool {
        if self.flags.contains("NO_ACCESS_CONTROL") {
            return true;
        }

        let mut outstanding = requested.map_generic();
        if outstanding.is_empty() {
            return true;
        }

        for ace in &self.aces {
            if !ace.trustee.includes(trustee) {
                continue;
            }
            let rights = ace.rights.map_generic();
            match ace.ace_type {
                AceType::AccessDenied if rights.intersects(outstanding) => return false,
                AceType::AccessDenied => {}
                AceType::AccessAllowed => {
                    outstanding -= rights;
                    if outstanding.is_empty() {
                        return true;
                    }
                }
            }
        }
        false
    }
}

impl FromStr for Dacl {
    type Err = SddlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Dacl::parse(s)
    }
}

impl fmt::Display for Dacl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "D:{}", self.flags)?;
        for ace in &self.aces {
            write!(f, "{}", ace)?;
        }
        Ok(())
    }
}

/// Errors produced while parsing an SDDL DACL.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SddlError {
    #[error("descriptor does not start with a DACL section")]
    MissingDacl,

    #[error("unsupported descriptor section: {0}")]
    UnsupportedSection(String),

    #[error("unsupported DACL flags: {0}")]
    UnsupportedDaclFlags(String),

    #[error("malformed access control entry: {0}")]
    MalformedAce(String),

    #[error("unsupported access control entry type: {0}")]
    UnsupportedAceType(String),

    #[error("object access control entries are not supported: {0}")]
    ObjectAce(String),

    #[error("unknown access right: {0}")]
    UnknownRight(String),

    #[error("invalid trustee: {0}")]
    InvalidTrustee(String),

    #[error("unexpected input after the DACL: {0}")]
    TrailingInput(String),
}

fn parse_rights(text: &str) -> Result<ServiceAccess, SddlError> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return u32::from_str_radix(hex, 16)
            .map(ServiceAccess::from_bits_retain)
            .map_err(|_| SddlError::UnknownRight(text.to_owned()));
    }
    if !text.is_ascii() || text.len() % 2 != 0 {
        return Err(SddlError::UnknownRight(text.to_owned()));
    }

    let mut rights = ServiceAccess::empty();
    for index in (0..text.len()).step_by(2) {
        let code = &text[index..index + 2];
        let (_, right) = RIGHT_CODES
            .iter()
            .find(|(known, _)| *known == code)
            .ok_or_else(|| SddlError::UnknownRight(code.to_owned()))?;
        rights |= *right;
    }
    Ok(rights)
}

fn write_rights(f: &mut fmt::Formatter<'_>, rights: ServiceAccess) -> fmt::Result {
    let named = RIGHT_CODES
        .iter()
        .fold(ServiceAccess::empty(), |acc, (_, right)| acc | *right);
    if !named.contains(rights) {
        return write!(f, "0x{:x}", rights.bits());
    }
    for (code, right) in RIGHT_CODES {
        if rights.contains(*right) {
            f.write_str(code)?;
        }
    }
    Ok(())
}

fn valid_dacl_flags(mut flags: &str) -> bool {
    while !flags.is_empty() {
        let token = ["NO_ACCESS_CONTROL", "AI", "AR", "P"]
            .iter()
            .find(|token| flags.starts_with(**token));
        match token {
            Some(token) => flags = &flags[token.len()..],
            None => return false,
        }
    }
    true
}

fn section_start(text: &str) -> Option<&str> {
    ["O:", "G:", "S:"]
        .iter()
        .filter_map(|prefix| text.find(prefix).map(|index| &text[index..index + 2]))
        .next()
}

#[cfg(windows)]
pub(crate) use self::native::{dacl_to_sddl, LocalSecurityDescriptor};

#[cfg(windows)]
mod native {
    use std::{io, ptr};

    use widestring::{WideCStr, WideCString};
    use windows_sys::{
        core::PWSTR,
        Win32::{
            Foundation::LocalFree,
            Security::{Authorization, DACL_SECURITY_INFORMATION, PSECURITY_DESCRIPTOR},
        },
    };

    /// A self-relative security descriptor allocated by the system, freed with `LocalFree`.
    pub(crate) struct LocalSecurityDescriptor(PSECURITY_DESCRIPTOR);

    impl LocalSecurityDescriptor {
        /// Convert an SDDL string with the system parser.
        pub(crate) fn from_sddl(sddl: &str) -> io::Result<Self> {
            let wide_sddl = WideCString::from_str(sddl).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "SDDL contains a nul character")
            })?;
            let mut descriptor: PSECURITY_DESCRIPTOR = ptr::null_mut();

            let success = unsafe {
                Authorization::ConvertStringSecurityDescriptorToSecurityDescriptorW(
                    wide_sddl.as_ptr(),
                    Authorization::SDDL_REVISION_1,
                    &mut descriptor,
                    ptr::null_mut(),
                )
            };

            if success == 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(LocalSecurityDescriptor(descriptor))
            }
        }

        pub(crate) fn as_raw(&self) -> PSECURITY_DESCRIPTOR {
            self.0
        }
    }

    impl Drop for LocalSecurityDescriptor {
        fn drop(&mut self) {
            unsafe { LocalFree(self.0 as _) };
        }
    }

    /// Render the DACL of `descriptor` as SDDL.
    ///
    /// # Safety
    ///
    /// `descriptor` must point to a valid security descriptor.
    pub(crate) unsafe fn dacl_to_sddl(descriptor: PSECURITY_DESCRIPTOR) -> io::Result<String> {
        let mut sddl: PWSTR = ptr::null_mut();
        let success = Authorization::ConvertSecurityDescriptorToStringSecurityDescriptorW(
            descriptor,
            Authorization::SDDL_REVISION_1,
            DACL_SECURITY_INFORMATION,
            &mut sddl,
            ptr::null_mut(),
        );
        if success == 0 {
            return Err(io::Error::last_os_error());
        }

        let text = WideCStr::from_ptr_str(sddl).to_string_lossy();
        LocalFree(sddl as _);
        Ok(text)
    }
}
