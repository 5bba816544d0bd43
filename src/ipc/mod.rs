// Author: BlackIce Project
// License: MIT

pub mod handlers;
pub mod router;
pub mod server;

use std::path::PathBuf;

/// Daemon control socket, per-user.
pub fn socket_path() -> Result<PathBuf, String> {
    if let Some(runtime) = dirs::runtime_dir() {
        return Ok(runtime.join("warden").join("warden.sock"));
    }
    // No XDG runtime dir (headless session): fall back to a uid-scoped
    // path in tmp.
    let uid = unsafe { libc::getuid() };
    Ok(std::env::temp_dir().join(format!("warden-{uid}.sock")))
}
