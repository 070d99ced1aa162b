//! Cross-platform utilities for the agent
//!
//! This module provides platform-agnostic functions for:
//! - Home and config directory paths
//! - `~` expansion for working directories sent from the phone
//! - Process signals (graceful terminate, forceful kill)
//! - Writing files readable only by the current user
//!
//! Supports Linux, macOS, and Windows.

use std::io;
use std::path::{Path, PathBuf};

/// Get the user's home directory in a cross-platform way.
pub fn home_dir() -> Option<PathBuf> {
    dirs_next::home_dir()
}

/// Get the agent config directory.
///
/// Returns:
/// - Linux/macOS: `~/.mobilecli`
/// - Windows: `%USERPROFILE%\.mobilecli`
pub fn config_dir() -> PathBuf {
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mobilecli")
}

/// Expand a leading `~` to the home directory.
///
/// Only `~` and `~/...` (or `~\...`) are expanded; `~user` forms are left alone.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/").or_else(|| path.strip_prefix("~\\")) {
        if let Some(home) = home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Platform name announced to the bridge
pub fn platform_name() -> &'static str {
    std::env::consts::OS
}

/// Get the system hostname for agent identification
pub fn host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "Unknown".to_string())
}

/// Check if a process is still alive.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    // kill with signal 0 checks if process exists without sending a signal
    kill(Pid::from_raw(pid as i32), None::<Signal>).is_ok()
}

#[cfg(windows)]
pub fn is_process_alive(pid: u32) -> bool {
    // PROCESS_QUERY_LIMITED_INFORMATION = 0x1000
    const PROCESS_QUERY_LIMITED_INFORMATION: u32 = 0x1000;
    const STILL_ACTIVE: u32 = 259;

    #[link(name = "kernel32")]
    extern "system" {
        fn OpenProcess(
            dwDesiredAccess: u32,
            bInheritHandle: i32,
            dwProcessId: u32,
        ) -> *mut std::ffi::c_void;
        fn CloseHandle(hObject: *mut std::ffi::c_void) -> i32;
        fn GetExitCodeProcess(hProcess: *mut std::ffi::c_void, lpExitCode: *mut u32) -> i32;
    }

    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle.is_null() {
            return false;
        }

        let mut exit_code: u32 = 0;
        let result = GetExitCodeProcess(handle, &mut exit_code);
        let is_alive = result != 0 && exit_code == STILL_ACTIVE;
        CloseHandle(handle);

        is_alive
    }
}

#[cfg(not(any(unix, windows)))]
pub fn is_process_alive(_pid: u32) -> bool {
    true
}

/// Ask a process to exit.
///
/// - Unix: Sends SIGTERM
/// - Windows: No signal distinction, uses TerminateProcess
///
/// Returns true if the signal/termination was sent successfully.
#[cfg(unix)]
pub fn terminate_process(pid: u32) -> bool {
    send_signal(pid, nix::sys::signal::Signal::SIGTERM)
}

/// Kill a process that ignored `terminate_process`.
///
/// - Unix: Sends SIGKILL
/// - Windows: Uses TerminateProcess
#[cfg(unix)]
pub fn kill_process(pid: u32) -> bool {
    send_signal(pid, nix::sys::signal::Signal::SIGKILL)
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid == 0 || pid > i32::MAX as u32 {
        tracing::warn!("Refusing to signal invalid pid {}", pid);
        return false;
    }
    kill(Pid::from_raw(pid as i32), signal).is_ok()
}

#[cfg(windows)]
pub fn terminate_process(pid: u32) -> bool {
    const PROCESS_TERMINATE: u32 = 0x0001;

    #[link(name = "kernel32")]
    extern "system" {
        fn OpenProcess(
            dwDesiredAccess: u32,
            bInheritHandle: i32,
            dwProcessId: u32,
        ) -> *mut std::ffi::c_void;
        fn CloseHandle(hObject: *mut std::ffi::c_void) -> i32;
        fn TerminateProcess(hProcess: *mut std::ffi::c_void, uExitCode: u32) -> i32;
    }

    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
        if handle.is_null() {
            return false;
        }

        let result = TerminateProcess(handle, 1);
        CloseHandle(handle);
        result != 0
    }
}

#[cfg(windows)]
pub fn kill_process(pid: u32) -> bool {
    terminate_process(pid)
}

#[cfg(not(any(unix, windows)))]
pub fn terminate_process(_pid: u32) -> bool {
    false
}

#[cfg(not(any(unix, windows)))]
pub fn kill_process(_pid: u32) -> bool {
    false
}

/// Write a file so that only the current user can read it (0600 on Unix).
pub fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        // mode() only applies on create; tighten files left by older versions
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
        file.write_all(contents)?;
        file.sync_all()
    }

    #[cfg(not(unix))]
    {
        std::fs::write(path, contents)
    }
}

/// Extract the last component from a path string, handling both
/// forward slashes and backslashes for cross-platform compatibility.
pub fn extract_path_basename(path: &str) -> &str {
    path.trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_path_basename_unix() {
        assert_eq!(extract_path_basename("/home/user/project"), "project");
        assert_eq!(extract_path_basename("/home/user/project/"), "project");
        assert_eq!(extract_path_basename("project"), "project");
    }

    #[test]
    fn test_extract_path_basename_windows() {
        assert_eq!(extract_path_basename(r"C:\Users\user\project"), "project");
        assert_eq!(extract_path_basename(r"C:\Users\user\project\"), "project");
    }

    #[test]
    fn test_expand_tilde() {
        let home = home_dir().unwrap();
        assert_eq!(expand_tilde("~"), home);
        assert_eq!(expand_tilde("~/code/api"), home.join("code/api"));
        assert_eq!(expand_tilde("/srv/api"), PathBuf::from("/srv/api"));
        assert_eq!(expand_tilde("~bob/api"), PathBuf::from("~bob/api"));
    }

    #[test]
    fn test_config_dir() {
        let dir = config_dir();
        assert!(dir.ends_with(".mobilecli"));
    }

    #[cfg(unix)]
    #[test]
    fn test_write_private_is_user_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("secret.json");
        write_private(&path, b"{}").unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{}");
    }
}
