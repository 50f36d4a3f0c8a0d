//! Privilege check. Raw ICMP and low port probing need root on Unix and an
//! elevated shell on Windows; the process refuses to start without them.

use crate::error::ConfigError;

#[cfg(unix)]
pub fn ensure_elevated() -> Result<(), ConfigError> {
    // geteuid has no failure mode
    let euid = unsafe { libc::geteuid() };
    if euid == 0 {
        Ok(())
    } else {
        Err(ConfigError::MissingPrivileges)
    }
}

#[cfg(windows)]
pub fn ensure_elevated() -> Result<(), ConfigError> {
    // `net session` succeeds only in an elevated shell.
    let status = std::process::Command::new("net")
        .arg("session")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status();
    match status {
        Ok(status) if status.success() => Ok(()),
        _ => Err(ConfigError::MissingPrivileges),
    }
}

#[cfg(not(any(unix, windows)))]
pub fn ensure_elevated() -> Result<(), ConfigError> {
    Ok(())
}
