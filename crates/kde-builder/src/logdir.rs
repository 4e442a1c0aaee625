//! Per-run log directory management.
//!
//! Logs land in `<log-dir>/YYYY-MM-DD_NN/<project>/<phase>.log`, with `NN`
//! a per-day counter. `latest/<project>` and
//! `latest-by-phase/<project>/<phase>.log` symlinks always point at the
//! most recent run, and a GC pass deletes dated directories no symlink
//! references anymore.

use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tracing::debug;

use crate::phases::Phase;

#[derive(Debug, Clone)]
pub struct LogDir {
    base: PathBuf,
    run_id: String,
    pretend: bool,
}

impl LogDir {
    /// Allocate this run's dated directory under `base`.
    pub fn new(base: &Path, today: NaiveDate, pretend: bool) -> Result<Self> {
        let date = today.format("%Y-%m-%d").to_string();
        let mut counter = 1;
        if base.is_dir() {
            for entry in fs::read_dir(base)? {
                let name = entry?.file_name();
                let name = name.to_string_lossy().into_owned();
                if let Some(n) = name
                    .strip_prefix(&date)
                    .and_then(|rest| rest.strip_prefix(['_', '-']))
                    .and_then(|n| n.parse::<u32>().ok())
                {
                    counter = counter.max(n + 1);
                }
            }
        }
        let run_id = format!("{date}_{counter:02}");
        let dir = base.join(&run_id);
        if !pretend {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
        }
        Ok(LogDir {
            base: base.to_path_buf(),
            run_id,
            pretend,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn run_dir(&self) -> PathBuf {
        self.base.join(&self.run_id)
    }

    /// Path for one phase's log of one project. Creates the project
    /// directory and refreshes the `latest` symlinks.
    pub fn log_path(&self, project: &str, phase: Phase) -> Result<PathBuf> {
        self.log_path_named(project, phase.as_str())
    }

    /// Like [`LogDir::log_path`] but for tool-specific log names
    /// (`cmake.log`, `ninja.log`) that are not phases themselves.
    pub fn log_path_named(&self, project: &str, name: &str) -> Result<PathBuf> {
        let project_dir = self.run_dir().join(project);
        let log_file = project_dir.join(format!("{name}.log"));
        if self.pretend {
            return Ok(log_file);
        }
        fs::create_dir_all(&project_dir)
            .with_context(|| format!("failed to create {}", project_dir.display()))?;

        self.relink(
            &self.base.join("latest").join(project),
            &project_dir,
        )?;
        self.relink(
            &self
                .base
                .join("latest-by-phase")
                .join(project)
                .join(format!("{name}.log")),
            &log_file,
        )?;
        Ok(log_file)
    }

    /// Symlink this run's roll-up files into `latest/`.
    pub fn link_rollups(&self) -> Result<()> {
        if self.pretend {
            return Ok(());
        }
        for name in ["status-list.log", "screen.log"] {
            self.relink(
                &self.base.join("latest").join(name),
                &self.run_dir().join(name),
            )?;
        }
        Ok(())
    }

    fn relink(&self, link: &Path, target: &Path) -> Result<()> {
        if let Some(parent) = link.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        match fs::symlink_metadata(link) {
            Ok(_) => fs::remove_file(link)
                .with_context(|| format!("failed to replace symlink {}", link.display()))?,
            Err(_) => {}
        }
        symlink(target, link)
            .with_context(|| format!("failed to symlink {}", link.display()))?;
        Ok(())
    }
}

/// True if a file name looks like a dated run directory (`YYYY-MM-DD_NN`).
fn is_run_dir_id(name: &str) -> bool {
    extract_run_dir_id(name).is_some_and(|id| id == name)
}

/// Find a `YYYY-MM-DD_NN` (or `-NN`) fragment inside a path string.
fn extract_run_dir_id(text: &str) -> Option<&str> {
    for (start, _) in text.char_indices() {
        let rest = &text[start..];
        if rest.len() < 12 {
            return None;
        }
        let r = rest.as_bytes();
        let date_ok = r[..10]
            .iter()
            .enumerate()
            .all(|(i, b)| match i {
                4 | 7 => *b == b'-',
                _ => b.is_ascii_digit(),
            });
        if !date_ok || !(r[10] == b'_' || r[10] == b'-') {
            continue;
        }
        let digits = rest[11..]
            .bytes()
            .take_while(|b| b.is_ascii_digit())
            .count();
        if digits > 0 {
            return Some(&rest[..11 + digits]);
        }
    }
    None
}

/// Remove every dated log directory not referenced by any symlink under
/// `latest/` or `latest-by-phase/`.
pub fn delete_unreferenced_log_directories(logdir: &Path) -> Result<()> {
    if !logdir.join("latest").exists() {
        // Can happen when the very first run errors out early.
        return Ok(());
    }

    let mut found: Vec<String> = Vec::new();
    for entry in fs::read_dir(logdir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if is_run_dir_id(&name) {
            found.push(name);
        }
    }

    let mut keep: BTreeSet<String> = BTreeSet::new();
    for tracked in ["latest", "latest-by-phase"] {
        let dir = logdir.join(tracked);
        if dir.is_dir() {
            collect_symlinked_ids(&dir, &mut keep)?;
        }
    }

    debug!(
        removing = found.iter().filter(|id| !keep.contains(*id)).count(),
        total = found.len(),
        "removing old log directories"
    );
    for id in found {
        if !keep.contains(&id) {
            fs::remove_dir_all(logdir.join(&id))
                .with_context(|| format!("failed to remove old log directory {id}"))?;
        }
    }
    Ok(())
}

fn collect_symlinked_ids(dir: &Path, out: &mut BTreeSet<String>) -> Result<()> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("can't opendir {}", dir.display()))?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let meta = fs::symlink_metadata(&path)?;
        if meta.file_type().is_symlink() {
            let target = fs::read_link(&path)?;
            if let Some(id) = extract_run_dir_id(&target.to_string_lossy()) {
                out.insert(id.to_string());
            }
        } else if meta.is_dir() {
            collect_symlinked_ids(&path, out)?;
        }
        // Plain files (a stray ".directory", editor droppings) are skipped.
    }
    Ok(())
}

/// Drop stale per-project symlinks from `latest/` before a new run relinks
/// them. User-made symlinks that do not point into a dated directory stay.
pub fn cleanup_latest_log_dir(logdir: &Path, pretend: bool) -> Result<()> {
    if pretend {
        return Ok(());
    }
    let latest = logdir.join("latest");
    if !latest.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(&latest)? {
        let entry = entry?;
        let path = entry.path();
        if !fs::symlink_metadata(&path)?.file_type().is_symlink() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let target = fs::read_link(&path)?.to_string_lossy().into_owned();
        let points_into_run = extract_run_dir_id(&target).is_some();
        let is_rollup = name == "status-list.log" || name == "screen.log";
        if points_into_run || is_rollup {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use tempfile::tempdir;

    use super::*;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).expect("date")
    }

    #[test]
    fn run_ids_count_up_per_day() {
        let td = tempdir().expect("tempdir");
        let first = LogDir::new(td.path(), day(), false).expect("logdir");
        assert_eq!(first.run_id(), "2024-03-01_01");

        let second = LogDir::new(td.path(), day(), false).expect("logdir");
        assert_eq!(second.run_id(), "2024-03-01_02");

        let other_day = NaiveDate::from_ymd_opt(2024, 3, 2).expect("date");
        let third = LogDir::new(td.path(), other_day, false).expect("logdir");
        assert_eq!(third.run_id(), "2024-03-02_01");
    }

    #[test]
    fn log_path_creates_dirs_and_symlinks() {
        let td = tempdir().expect("tempdir");
        let logdir = LogDir::new(td.path(), day(), false).expect("logdir");
        let path = logdir.log_path("kcalc", Phase::Build).expect("path");
        assert!(path.parent().expect("parent").is_dir());
        assert!(path.ends_with("kcalc/build.log"));

        let latest = td.path().join("latest/kcalc");
        assert_eq!(
            fs::read_link(&latest).expect("latest link"),
            td.path().join("2024-03-01_01/kcalc")
        );
        let by_phase = td.path().join("latest-by-phase/kcalc/build.log");
        assert_eq!(
            fs::read_link(&by_phase).expect("by-phase link"),
            td.path().join("2024-03-01_01/kcalc/build.log")
        );
    }

    #[test]
    fn symlinks_move_to_the_newest_run() {
        let td = tempdir().expect("tempdir");
        let first = LogDir::new(td.path(), day(), false).expect("logdir");
        first.log_path("kcalc", Phase::Build).expect("path");
        let second = LogDir::new(td.path(), day(), false).expect("logdir");
        second.log_path("kcalc", Phase::Build).expect("path");

        let latest = fs::read_link(td.path().join("latest/kcalc")).expect("link");
        assert!(latest.to_string_lossy().contains("2024-03-01_02"));
    }

    #[test]
    fn pretend_mode_touches_nothing() {
        let td = tempdir().expect("tempdir");
        let logdir = LogDir::new(td.path(), day(), true).expect("logdir");
        let path = logdir.log_path("kcalc", Phase::Build).expect("path");
        assert!(!path.exists());
        assert!(!td.path().join("2024-03-01_01").exists());
    }

    #[test]
    fn gc_keeps_referenced_directories_only() {
        // P11: referenced dated dirs survive GC.
        let td = tempdir().expect("tempdir");
        let old = LogDir::new(td.path(), day(), false).expect("logdir");
        old.log_path("kcalc", Phase::Build).expect("path");
        let new = LogDir::new(td.path(), day(), false).expect("logdir");
        new.log_path("kcalc", Phase::Build).expect("path");

        delete_unreferenced_log_directories(td.path()).expect("gc");
        assert!(!td.path().join("2024-03-01_01").exists());
        assert!(td.path().join("2024-03-01_02").exists());
    }

    #[test]
    fn gc_without_latest_dir_is_a_no_op() {
        let td = tempdir().expect("tempdir");
        fs::create_dir_all(td.path().join("2024-03-01_01")).expect("mkdir");
        delete_unreferenced_log_directories(td.path()).expect("gc");
        assert!(td.path().join("2024-03-01_01").exists());
    }

    #[test]
    fn cleanup_latest_keeps_user_symlinks() {
        let td = tempdir().expect("tempdir");
        let logdir = LogDir::new(td.path(), day(), false).expect("logdir");
        logdir.log_path("kcalc", Phase::Build).expect("path");

        let user_target = td.path().join("notes.txt");
        fs::write(&user_target, "mine").expect("write");
        symlink(&user_target, td.path().join("latest/notes")).expect("symlink");

        cleanup_latest_log_dir(td.path(), false).expect("cleanup");
        assert!(!td.path().join("latest/kcalc").exists());
        assert!(td.path().join("latest/notes").exists());
    }

    #[test]
    fn run_dir_id_extraction() {
        assert!(is_run_dir_id("2024-03-01_01"));
        assert!(is_run_dir_id("2024-03-01-7"));
        assert!(!is_run_dir_id("latest"));
        assert!(!is_run_dir_id("2024-03-01"));
        assert_eq!(
            extract_run_dir_id("/logs/2024-03-01_02/kcalc/build.log"),
            Some("2024-03-01_02")
        );
        assert_eq!(extract_run_dir_id("/dev/null"), None);
    }
}
