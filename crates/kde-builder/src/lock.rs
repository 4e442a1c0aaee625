//! Single-instance guard keyed by the configuration directory.
//!
//! The lock file holds the owning PID. Creation uses `O_CREAT|O_EXCL`
//! (`create_new`); when the file already exists and its owner is gone the
//! stale lock is removed and acquisition retried once.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::warn;

pub const LOCK_FILE: &str = ".kdesrc-lock";

pub fn lock_path(config_dir: &Path) -> PathBuf {
    config_dir.join(LOCK_FILE)
}

/// Held lock. Released on [`LockFile::release`] or drop.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Acquire the lock.
    ///
    /// When another live process holds it, `on_busy` is consulted with the
    /// owning PID; returning `true` steals the lock, `false` aborts.
    pub fn acquire(config_dir: &Path, on_busy: impl Fn(u32) -> bool) -> Result<Self> {
        let path = lock_path(config_dir);
        fs::create_dir_all(config_dir)
            .with_context(|| format!("failed to create {}", config_dir.display()))?;

        for attempt in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    return Ok(LockFile { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let owner = read_owner_pid(&path);
                    match owner {
                        Some(pid) if process_exists(pid) => {
                            if attempt == 0 && on_busy(pid) {
                                fs::remove_file(&path).with_context(|| {
                                    format!("failed to steal lock {}", path.display())
                                })?;
                                continue;
                            }
                            bail!(
                                "another kde-builder (pid {pid}) is already running with this configuration"
                            );
                        }
                        _ => {
                            warn!(path = %path.display(), "removing stale lock file");
                            fs::remove_file(&path).with_context(|| {
                                format!("failed to remove stale lock {}", path.display())
                            })?;
                            continue;
                        }
                    }
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("failed to create lock {}", path.display()));
                }
            }
        }
        bail!("unable to acquire lock {}", path.display());
    }

    pub fn release(&mut self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)
                .with_context(|| format!("failed to remove lock {}", self.path.display()))?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        // Best effort on abnormal exit paths.
        let _ = self.release();
    }
}

fn read_owner_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn process_exists(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}
