// Author: BlackIce Project
// License: MIT

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const DEFAULT_MAX_BYTES: u64 = 5 * 1024 * 1024; // 5 MiB
const DEFAULT_KEEP_BACKUPS: u32 = 5;

pub struct LogPolicy {
    pub max_bytes: u64,
    pub keep_backups: u32,
}

impl Default for LogPolicy {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BYTES,
            keep_backups: DEFAULT_KEEP_BACKUPS,
        }
    }
}

/// Ensures the log file exists and rotates it if needed.
/// Returns whether to insert a raw blank line before the next run header.
pub fn prepare_log_file(path: &Path, policy: LogPolicy) -> io::Result<bool> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let meta = match fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };

    if meta.len() == 0 {
        return Ok(false);
    }

    if meta.len() >= policy.max_bytes {
        rotate(path, policy.keep_backups)?;
        return Ok(false);
    }

    Ok(true)
}

/// Writes a literal blank line, bypassing the tracing layer's prefixes.
pub fn write_raw_blank_line(path: &Path) -> io::Result<()> {
    let mut f = fs::OpenOptions::new().create(true).append(true).open(path)?;
    f.write_all(b"\n")?;
    f.flush()?;
    Ok(())
}

pub fn write_raw_line(path: &Path, line: &str) -> io::Result<()> {
    let mut f = fs::OpenOptions::new().create(true).append(true).open(path)?;
    f.write_all(line.as_bytes())?;
    f.write_all(b"\n")?;
    f.flush()?;
    Ok(())
}

pub fn run_header() -> String {
    let pid = std::process::id();
    format!("==================== warden daemon run start (pid={pid}) ====================")
}

fn backup_path(path: &Path, index: u32) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

fn rotate(path: &Path, keep: u32) -> io::Result<()> {
    if keep == 0 {
        fs::remove_file(path)?;
        return Ok(());
    }

    // Shift name.N → name.N+1, dropping the oldest.
    let _ = fs::remove_file(backup_path(path, keep));
    for index in (1..keep).rev() {
        let from = backup_path(path, index);
        if from.exists() {
            let _ = fs::rename(&from, backup_path(path, index + 1));
        }
    }
    fs::rename(path, backup_path(path, 1))?;
    Ok(())
}
