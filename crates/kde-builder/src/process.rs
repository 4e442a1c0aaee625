//! Run a child process with its output captured to a per-phase log file.
//!
//! Every log file carries a header naming the command and working
//! directory and a trailer with the exit code, so a stale log is always
//! self-describing.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{Context, Result, bail};
use tracing::debug;

/// One logged invocation. `on_line` receives each line of stdout as it
/// arrives, for progress accounting, and may be `None`.
pub struct LoggedRun<'a> {
    pub argv: &'a [String],
    pub log_path: &'a Path,
    pub cwd: Option<&'a Path>,
    pub env: &'a BTreeMap<String, String>,
    pub pretend: bool,
}

pub fn run_logged(
    run: &LoggedRun<'_>,
    mut on_line: Option<&mut dyn FnMut(&str)>,
) -> Result<i32> {
    if run.argv.is_empty() {
        bail!("refusing to run an empty command line");
    }
    if run.pretend {
        debug!(argv = ?run.argv, "pretend: would run command");
        return Ok(0);
    }

    if let Some(parent) = run.log_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(run.log_path)
        .with_context(|| format!("failed to open log file {}", run.log_path.display()))?;

    let cwd = run
        .cwd
        .map(Path::to_path_buf)
        .map(Ok)
        .unwrap_or_else(std::env::current_dir)?;
    writeln!(log, "# kde-builder running: '{}'", run.argv.join(" "))?;
    writeln!(log, "# from directory: {}", cwd.display())?;

    let mut command = Command::new(&run.argv[0]);
    command.args(&run.argv[1..]).current_dir(&cwd);
    for (k, v) in run.env {
        command.env(k, v);
    }
    // stderr goes straight into the log so interleaving is preserved;
    // stdout is piped when a line callback wants to watch it.
    command.stderr(Stdio::from(log.try_clone()?));
    command.stdin(Stdio::null());

    let exit_code = if on_line.is_some() {
        command.stdout(Stdio::piped());
        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn {}", run.argv[0]))?;
        let stdout = child.stdout.take().context("child stdout missing")?;
        for line in BufReader::new(stdout).lines() {
            let line = line.unwrap_or_default();
            writeln!(log, "{line}")?;
            if let Some(cb) = on_line.as_deref_mut() {
                cb(&line);
            }
        }
        let status = child.wait().context("failed to wait for child")?;
        status.code().unwrap_or(-1)
    } else {
        command.stdout(Stdio::from(log.try_clone()?));
        let status = command
            .status()
            .with_context(|| format!("failed to spawn {}", run.argv[0]))?;
        status.code().unwrap_or(-1)
    };

    writeln!(log, "# exit code was: {exit_code}")?;
    Ok(exit_code)
}

/// Run a short command and capture trimmed stdout. For quick queries
/// (`git rev-parse`, version probes) whose output the caller consumes.
pub fn capture_output(
    argv: &[String],
    cwd: Option<&Path>,
    env: &BTreeMap<String, String>,
) -> Result<(i32, String)> {
    if argv.is_empty() {
        bail!("refusing to run an empty command line");
    }
    let mut command = Command::new(&argv[0]);
    command.args(&argv[1..]);
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }
    for (k, v) in env {
        command.env(k, v);
    }
    let output = command
        .output()
        .with_context(|| format!("failed to execute {}", argv[0]))?;
    Ok((
        output.status.code().unwrap_or(-1),
        String::from_utf8_lossy(&output.stdout).trim().to_string(),
    ))
}

/// Open (or create) this run's roll-up log and append one line.
pub fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")?;
    Ok(())
}
