// Author: BlackIce Project
// License: MIT

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

/// Held for the daemon's lifetime; the flock drops with the process.
pub struct InstanceLock {
    _file: File,
    path: PathBuf,
}

impl InstanceLock {
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

/// One daemon per user. A second instance exits early with a clear
/// message instead of fighting over the socket.
pub fn acquire_single_instance_lock() -> Result<InstanceLock, String> {
    let path = lock_path();
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&path)
        .map_err(|e| format!("cannot open lock file {}: {e}", path.display()))?;

    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        return Err("warden daemon is already running".to_string());
    }

    Ok(InstanceLock { _file: file, path })
}

fn lock_path() -> PathBuf {
    if let Some(runtime) = dirs::runtime_dir() {
        return runtime.join("warden").join("warden.lock");
    }
    let uid = unsafe { libc::getuid() };
    std::env::temp_dir().join(format!("warden-{uid}.lock"))
}

pub fn default_log_path() -> Option<PathBuf> {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .map(|d| d.join("warden").join("warden.log"))
}

/// The session display automation must never target. Environment first,
/// ":0" as the conventional fallback.
pub fn detect_user_display() -> String {
    std::env::var("DISPLAY")
        .ok()
        .filter(|d| !d.trim().is_empty())
        .unwrap_or_else(|| ":0".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_in_the_same_process_fails() {
        // flock is per-fd, but two opens of the same file contend.
        let first = acquire_single_instance_lock();
        if let Ok(lock) = first {
            assert!(acquire_single_instance_lock().is_err());
            drop(lock);
        }
    }

    #[test]
    fn user_display_falls_back_to_zero() {
        // Cannot unset the ambient env safely in-process; just check the
        // shape of whatever comes back.
        let d = detect_user_display();
        assert!(d.starts_with(':') || !d.is_empty());
    }
}
