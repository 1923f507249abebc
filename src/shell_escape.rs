//! Quoting of command line arguments the way `CommandLineToArgvW` splits them again.

use std::borrow::Cow;
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;

use crate::service::{ServiceInfo, ServiceType};

/// Quote `s` if it is empty or contains whitespace or double quotes.
///
/// Strings that are not valid unicode are returned unchanged.
pub(crate) fn escape(s: Cow<'_, OsStr>) -> Cow<'_, OsStr> {
    let needs_quotes = match s.to_str() {
        Some(text) => text.is_empty() || text.contains([' ', '\t', '\n', '\x0b', '"']),
        None => false,
    };
    if !needs_quotes {
        return s;
    }
    let text = s.to_string_lossy();

    let mut escaped = String::with_capacity(text.len() + 2);
    escaped.push('"');
    let mut backslashes = 0;
    for ch in text.chars() {
        match ch {
            '\\' => backslashes += 1,
            '"' => {
                escaped.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
                backslashes = 0;
            }
            _ => {
                escaped.extend(std::iter::repeat('\\').take(backslashes));
                backslashes = 0;
            }
        }
        if ch != '\\' {
            escaped.push(ch);
        }
    }
    escaped.extend(std::iter::repeat('\\').take(backslashes * 2));
    escaped.push('"');

    Cow::Owned(OsString::from(escaped))
}

/// The command line registered for a service: the escaped executable path followed by the
/// escaped launch arguments.
///
/// Drivers take neither quoting nor arguments, their path is used verbatim.
pub(crate) fn launch_command(service_info: &ServiceInfo) -> OsString {
    if service_info
        .service_type
        .intersects(ServiceType::KERNEL_DRIVER | ServiceType::FILE_SYSTEM_DRIVER)
    {
        return service_info.executable_path.clone().into_os_string();
    }

    let mut command = escape(Cow::Borrowed(service_info.executable_path.as_os_str())).into_owned();
    for argument in &service_info.launch_arguments {
        command.push(" ");
        command.push(escape(Cow::Borrowed(argument.as_os_str())));
    }
    command
}

/// Paths the system may resolve as the executable of `command_line`.
///
/// A quoted command line names exactly one executable. Without quotes the system tries every
/// prefix that ends at whitespace, shortest first, followed by the whole line. Names without
/// an extension get `.exe` appended.
pub(crate) fn executable_candidates(command_line: &OsStr) -> Vec<PathBuf> {
    let text = command_line.to_string_lossy();
    let text = text.trim_start();

    if let Some(rest) = text.strip_prefix('"') {
        let end = rest.find('"').unwrap_or(rest.len());
        return vec![with_default_extension(&rest[..end])];
    }

    let mut candidates: Vec<PathBuf> = text
        .match_indices(char::is_whitespace)
        .map(|(end, _)| text[..end].trim_end())
        .chain(Some(text.trim_end()))
        .filter(|prefix| !prefix.is_empty())
        .map(with_default_extension)
        .collect();
    candidates.dedup();
    candidates
}

fn with_default_extension(name: &str) -> PathBuf {
    let mut path = PathBuf::from(name);
    if path.extension().is_none() {
        path.set_extension("exe");
    }
    path
}
