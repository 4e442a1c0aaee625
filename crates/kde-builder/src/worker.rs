//! The update worker process and its plumbing.
//!
//! The build-parent re-invokes its own binary in a hidden worker mode with
//! the resolved update list serialized to a handoff file. The worker walks
//! the list in build order, streaming IPC frames to its stdout; a relay
//! thread in the parent drains that pipe at full speed into an unbounded
//! queue so a long compile never stalls the updater. Graceful stop is
//! cooperative: the parent drops a sentinel file next to the handoff and
//! the worker checks for it between projects.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ipc::{self, FrameSender, UpdaterIpc};
use crate::updater::{self, UpdateTask};

/// Hidden CLI flag that selects worker mode.
pub const WORKER_FLAG: &str = "--internal-update-worker";

/// Everything the worker needs, serialized into the handoff file.
#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateRunSpec {
    pub tasks: Vec<UpdateTask>,
}

pub fn stop_sentinel_path(handoff: &Path) -> PathBuf {
    handoff.with_extension("stop")
}

/// Request a graceful stop: the worker finishes its current project and
/// exits cleanly.
pub fn request_worker_stop(handoff: &Path) -> Result<()> {
    fs::write(stop_sentinel_path(handoff), b"stop")
        .with_context(|| format!("failed to write stop sentinel for {}", handoff.display()))
}

/// Entry point for worker mode; called by the CLI when it sees
/// [`WORKER_FLAG`]. Writes IPC frames to stdout and nothing else.
pub fn run_update_worker(handoff: &Path) -> Result<()> {
    let text = fs::read_to_string(handoff)
        .with_context(|| format!("failed to read handoff file {}", handoff.display()))?;
    let spec: UpdateRunSpec =
        serde_json::from_str(&text).context("invalid update handoff file")?;

    let stdout = std::io::stdout().lock();
    let mut sender = FrameSender::new(stdout);
    let mut ipc = UpdaterIpc::new(&mut sender);
    run_updates(&spec.tasks, &mut ipc, &mut || {
        stop_sentinel_path(handoff).exists()
    })
}

/// Shared update loop: the worker process and the synchronous in-process
/// fallback drive the same code, differing only in transport.
pub fn run_updates(
    tasks: &[UpdateTask],
    ipc: &mut UpdaterIpc<'_>,
    stop_requested: &mut dyn FnMut() -> bool,
) -> Result<()> {
    ipc.all_updating()?;
    for task in tasks {
        if stop_requested() {
            debug!("graceful stop requested; ending updates early");
            break;
        }
        ipc.set_logged_module(&task.name);
        match updater::update_project(task, ipc) {
            Ok(result) => {
                if result.commits_pulled > 0 {
                    let noun = if result.commits_pulled == 1 {
                        "commit"
                    } else {
                        "commits"
                    };
                    ipc.notify_update_success(
                        &task.name,
                        &format!("{} {noun} pulled", result.commits_pulled),
                    )?;
                } else {
                    ipc.notify_uptodate(&task.name, &refresh_reason(task))?;
                }
            }
            Err(e) => {
                ipc.send_log_message("updater", "error", &format!("{e:#}"))?;
                ipc.notify_update_failure(&task.name)?;
            }
        }
    }
    ipc.all_done()
}

/// Why an unchanged checkout should still be rebuilt, or empty.
fn refresh_reason(task: &UpdateTask) -> String {
    match &task.build_dir {
        Some(dir) if !dir.exists() => "the build directory is missing".to_string(),
        _ => String::new(),
    }
}

/// Spawn the worker as a child process of the current binary.
///
/// Returns the child and the handoff path (needed for stop requests). The
/// worker's stderr is discarded: the parent owns the TTY, and everything
/// the worker has to say arrives as IPC frames on stdout.
pub fn spawn_update_worker(spec: &UpdateRunSpec, handoff_dir: &Path) -> Result<(Child, PathBuf)> {
    fs::create_dir_all(handoff_dir)
        .with_context(|| format!("failed to create {}", handoff_dir.display()))?;
    let handoff = handoff_dir.join("update-worker.json");
    let json = serde_json::to_string(spec).context("failed to serialize update handoff")?;
    fs::write(&handoff, json)
        .with_context(|| format!("failed to write {}", handoff.display()))?;
    let _ = fs::remove_file(stop_sentinel_path(&handoff));

    let exe = std::env::current_exe().context("cannot locate own executable")?;
    let child = Command::new(exe)
        .arg(WORKER_FLAG)
        .arg(&handoff)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .context("failed to spawn update worker")?;
    Ok((child, handoff))
}

/// Drain a byte stream of IPC frames into an unbounded queue on a
/// dedicated thread. The receiver sees frames in exactly the order they
/// were written; the thread exits on EOF or when the receiver is dropped.
pub fn relay_frames(mut reader: impl Read + Send + 'static) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        while let Ok(Some(frame)) = ipc::read_frame(&mut reader) {
            if tx.send(frame).is_err() {
                break;
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use crate::ipc::{ChannelReceiver, IpcReceiver, IpcState, LocalQueue, MsgType, UpdateStatus};

    use super::*;

    fn pretend_task(name: &str, td: &Path) -> UpdateTask {
        UpdateTask {
            name: name.to_string(),
            source_dir: td.join("src").join(name),
            repository: format!("kde:{name}.git"),
            branch: Some("master".to_string()),
            tag: None,
            commit: None,
            git_user: None,
            build_dir: Some(td.join("build").join(name)),
            update_log: td.join(format!("{name}-update.log")),
            pretend: true,
        }
    }

    #[test]
    fn run_updates_brackets_the_stream() {
        let td = tempdir().expect("tempdir");
        let tasks = vec![pretend_task("a", td.path()), pretend_task("b", td.path())];
        let mut queue = LocalQueue::new();
        {
            let mut ipc = UpdaterIpc::new(&mut queue);
            run_updates(&tasks, &mut ipc, &mut || false).expect("updates");
        }

        let (first, _) = queue.recv().expect("recv").expect("first");
        assert_eq!(first, MsgType::AllUpdating);
        let mut last = first;
        while let Some((ty, _)) = queue.recv().expect("recv") {
            last = ty;
        }
        assert_eq!(last, MsgType::AllDone);
    }

    #[test]
    fn graceful_stop_skips_remaining_projects() {
        let td = tempdir().expect("tempdir");
        let tasks = vec![pretend_task("a", td.path()), pretend_task("b", td.path())];
        let mut queue = LocalQueue::new();
        let mut calls = 0;
        {
            let mut ipc = UpdaterIpc::new(&mut queue);
            // Stop after the first project.
            run_updates(&tasks, &mut ipc, &mut || {
                calls += 1;
                calls > 1
            })
            .expect("updates");
        }

        let mut project_messages = 0;
        while let Some((ty, _)) = queue.recv().expect("recv") {
            if matches!(
                ty,
                MsgType::ModuleSuccess | MsgType::ModuleUptodate | MsgType::ModuleFailure
            ) {
                project_messages += 1;
            }
        }
        assert_eq!(project_messages, 1);
    }

    #[test]
    fn pretend_updates_report_uptodate_with_missing_build_dir_reason() {
        let td = tempdir().expect("tempdir");
        let tasks = vec![pretend_task("a", td.path())];
        let mut queue = LocalQueue::new();
        {
            let mut ipc = UpdaterIpc::new(&mut queue);
            run_updates(&tasks, &mut ipc, &mut || false).expect("updates");
        }
        let mut state = IpcState::new();
        let mut printer = |_: &crate::ipc::LogMessage| {};
        let (status, _) = state
            .wait_for_module(&mut queue, "a", true, &mut printer)
            .expect("wait");
        // Build dir does not exist, so the skip is converted to a rebuild.
        assert_eq!(status, UpdateStatus::Success);
        assert!(state.refresh_reason_for("a").contains("build directory"));
    }

    #[test]
    fn handoff_spec_round_trips_as_json() {
        let td = tempdir().expect("tempdir");
        let spec = UpdateRunSpec {
            tasks: vec![pretend_task("a", td.path())],
        };
        let json = serde_json::to_string(&spec).expect("serialize");
        let back: UpdateRunSpec = serde_json::from_str(&json).expect("parse");
        assert_eq!(back.tasks.len(), 1);
        assert_eq!(back.tasks[0].name, "a");
    }

    #[test]
    fn relay_preserves_frame_order() {
        let mut bytes = Vec::new();
        for i in 0..10 {
            ipc::write_frame(
                &mut bytes,
                &ipc::encode_message(MsgType::ModuleLogMsg, &format!("m,updater,info,{i}")),
            )
            .expect("frame");
        }
        let rx = relay_frames(std::io::Cursor::new(bytes));
        let mut receiver = ChannelReceiver::new(rx);
        for i in 0..10 {
            let (_, payload) = receiver.recv().expect("recv").expect("frame");
            assert!(payload.ends_with(&format!(",{i}")));
        }
        assert_eq!(receiver.recv().expect("recv"), None);
    }

    #[test]
    fn stop_sentinel_lives_next_to_the_handoff() {
        let handoff = Path::new("/tmp/x/update-worker.json");
        assert_eq!(
            stop_sentinel_path(handoff),
            PathBuf::from("/tmp/x/update-worker.stop")
        );
    }
}
