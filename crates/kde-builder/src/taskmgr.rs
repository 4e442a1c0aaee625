//! Task manager: drives the update and build sides of a run and routes
//! messages between them.
//!
//! On a concurrent run the updater is a separate process (see
//! [`crate::worker`]) whose frames arrive through a relay thread; without
//! concurrency every update runs first, in-process, into a local queue the
//! build loop then drains. Either way the build loop below is the same.

use std::path::PathBuf;
use std::process::Child;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::context::BuildContext;
use crate::ipc::{ChannelReceiver, IpcState, LocalQueue, LogMessage, UpdaterIpc};
use crate::logdir::LogDir;
use crate::phases::Phase;
use crate::project::Project;
use crate::report::Reporter;
use crate::runner::{BuildRunner, ProjectResult};
use crate::signals::SignalState;
use crate::state::PersistentState;
use crate::updater::UpdateTask;
use crate::worker::{self, UpdateRunSpec};

/// What happened to every project this run touched, in build order.
#[derive(Debug, Default)]
pub struct RunOutcome {
    pub results: Vec<(String, ProjectResult)>,
    /// Projects never reached (graceful stop or hard signal).
    pub unreached: Vec<String>,
}

impl RunOutcome {
    pub fn built(&self) -> usize {
        self.results
            .iter()
            .filter(|(_, r)| !r.is_failure())
            .count()
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|(_, r)| r.is_failure()).count()
    }

    pub fn any_failure(&self) -> bool {
        self.failed() > 0
    }

    /// The resume list: everything from the first failure onward, plus
    /// whatever was never reached.
    pub fn resume_names(&self) -> Vec<String> {
        let first_failure = self
            .results
            .iter()
            .position(|(_, r)| r.is_failure());
        let mut names: Vec<String> = match first_failure {
            Some(at) => self.results[at..].iter().map(|(n, _)| n.clone()).collect(),
            None => Vec::new(),
        };
        names.extend(self.unreached.iter().cloned());
        names
    }

    pub fn failed_names(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|(_, r)| r.is_failure())
            .map(|(n, _)| n.clone())
            .collect()
    }
}

enum UpdateChannel {
    Local(LocalQueue),
    Worker {
        receiver: ChannelReceiver,
        child: Child,
        handoff: PathBuf,
    },
}

pub struct TaskManager<'a> {
    pub ctx: &'a mut BuildContext,
    pub state: &'a mut PersistentState,
    pub logdir: &'a LogDir,
    pub signals: SignalState,
}

impl TaskManager<'_> {
    /// Run the whole project list. Update outcomes gate each build; a
    /// failure under `stop-on-failure` (or SIGHUP) ends the run after the
    /// current project.
    pub fn run(
        &mut self,
        projects: &mut [Project],
        reporter: &mut dyn Reporter,
    ) -> Result<RunOutcome> {
        let any_update = projects.iter().any(|p| p.phases.has(Phase::Update));
        let any_build = projects
            .iter()
            .any(|p| p.phases.has(Phase::Build) || p.phases.has(Phase::Install));

        let tasks = self.update_tasks(projects)?;
        let mut channel = self.open_channel(&tasks, any_update, any_build)?;

        let stop_on_failure = self.ctx.option_bool(None, "stop-on-failure");
        let mut ipc_state = IpcState::new();
        let mut outcome = RunOutcome::default();
        let total = projects.len();

        for (idx, project) in projects.iter_mut().enumerate() {
            if self.signals.hard_signal().is_some() {
                outcome.unreached.push(project.name.clone());
                continue;
            }
            if self.signals.stop_requested() {
                self.forward_graceful_stop(&channel);
                outcome.unreached.push(project.name.clone());
                continue;
            }

            let name = project.name.clone();
            let has_update = any_update && project.phases.has(Phase::Update);

            let wait_result = {
                let mut printer = printer_for(reporter);
                match &mut channel {
                    UpdateChannel::Local(queue) => {
                        ipc_state.wait_for_module(queue, &name, has_update, &mut printer)
                    }
                    UpdateChannel::Worker { receiver, .. } => {
                        ipc_state.wait_for_module(receiver, &name, has_update, &mut printer)
                    }
                }
            };
            let (status, _message) = match wait_result {
                Ok(v) => v,
                Err(e) => {
                    reporter.error(&format!("{e:#}"));
                    outcome.unreached.push(name.clone());
                    continue;
                }
            };
            for msg in ipc_state.take_post_build_messages(&name) {
                project.add_post_build_message(msg);
            }
            let refresh_reason = ipc_state.refresh_reason_for(&name);
            ipc_state.forget_module(&name);

            let result = {
                let mut runner = BuildRunner {
                    ctx: self.ctx,
                    state: self.state,
                    logdir: self.logdir,
                    reporter,
                    position: idx + 1,
                    total,
                };
                runner.handle_project(project, status, &refresh_reason)
            };

            if let ProjectResult::Failed(phase, error_log) = &result {
                self.ctx.note_failure(&name, *phase, error_log.clone());
            } else if matches!(result, ProjectResult::FailedUpdate) {
                self.ctx.note_failure(&name, Phase::Update, None);
            }

            let failed = result.is_failure();
            outcome.results.push((name, result));

            if failed && stop_on_failure {
                warn!("stopping after failure, as requested");
                self.signals.request_stop();
            }
        }

        self.drain_and_close(&mut ipc_state, &mut channel, reporter)?;
        Ok(outcome)
    }

    fn update_tasks(&self, projects: &[Project]) -> Result<Vec<UpdateTask>> {
        let mut tasks = Vec::new();
        for project in projects {
            if !project.phases.has(Phase::Update) {
                continue;
            }
            if self.ctx.option_bool(Some(project), "no-src") {
                continue;
            }
            let repository = project
                .options
                .get("#resolved-repository")
                .map(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .or_else(|| {
                    Some(self.ctx.option_str(Some(project), "repository"))
                        .filter(|s| !s.is_empty())
                });
            let Some(repository) = repository else {
                debug!(project = %project.name, "no repository known; skipping update");
                continue;
            };

            let commit = Some(self.ctx.option_str(Some(project), "commit"))
                .filter(|s| !s.is_empty())
                .or_else(|| {
                    Some(self.ctx.option_str(Some(project), "revision")).filter(|s| !s.is_empty())
                });
            tasks.push(UpdateTask {
                name: project.name.clone(),
                source_dir: self.ctx.source_dir_for(project),
                repository,
                branch: project.requested_branch(),
                tag: Some(self.ctx.option_str(Some(project), "tag")).filter(|s| !s.is_empty()),
                commit,
                git_user: Some(self.ctx.option_str(Some(project), "git-user"))
                    .filter(|s| !s.is_empty()),
                build_dir: Some(self.ctx.build_dir_for(project)),
                update_log: self.logdir.log_path(&project.name, Phase::Update)?,
                pretend: self.ctx.pretending(),
            });
        }
        Ok(tasks)
    }

    fn open_channel(
        &mut self,
        tasks: &[UpdateTask],
        any_update: bool,
        any_build: bool,
    ) -> Result<UpdateChannel> {
        let concurrent = self.ctx.option_bool(None, "async")
            && any_update
            && any_build
            && !self.ctx.pretending()
            && !tasks.is_empty();

        if concurrent {
            let spec = UpdateRunSpec {
                tasks: tasks.to_vec(),
            };
            let handoff_dir = self.ctx.config_dir.join(".kde-builder-run");
            let (mut child, handoff) = worker::spawn_update_worker(&spec, &handoff_dir)?;
            let stdout = child
                .stdout
                .take()
                .context("update worker has no stdout")?;
            let receiver = ChannelReceiver::new(worker::relay_frames(stdout));
            return Ok(UpdateChannel::Worker {
                receiver,
                child,
                handoff,
            });
        }

        // Synchronous fallback: run all updates now, into a local queue.
        let mut queue = LocalQueue::new();
        {
            let mut ipc = UpdaterIpc::new(&mut queue);
            if !any_update || tasks.is_empty() {
                ipc.all_skipped()?;
            } else {
                let signals = self.signals.clone();
                worker::run_updates(tasks, &mut ipc, &mut || {
                    signals.stop_requested() || signals.hard_signal().is_some()
                })?;
            }
        }
        Ok(UpdateChannel::Local(queue))
    }

    fn forward_graceful_stop(&self, channel: &UpdateChannel) {
        if let UpdateChannel::Worker { handoff, .. } = channel {
            let _ = worker::request_worker_stop(handoff);
        }
    }

    fn drain_and_close(
        &mut self,
        ipc_state: &mut IpcState,
        channel: &mut UpdateChannel,
        reporter: &mut dyn Reporter,
    ) -> Result<()> {
        let hard_stop = self.signals.hard_signal().is_some();
        match channel {
            UpdateChannel::Local(queue) => {
                if !hard_stop {
                    ipc_state.wait_for_end(queue)?;
                }
            }
            UpdateChannel::Worker { receiver, child, handoff } => {
                if hard_stop {
                    let _ = child.kill();
                } else {
                    let _ = worker::request_worker_stop(handoff);
                    let _ = ipc_state.wait_for_end(receiver);
                }
                let _ = child.wait();
                let sentinel_path = worker::stop_sentinel_path(handoff);
                let _ = std::fs::remove_file(handoff);
                let _ = std::fs::remove_file(sentinel_path);
            }
        }

        // Only this process may touch the persistent store; apply the
        // writes the children forwarded.
        for write in std::mem::take(&mut ipc_state.persist_writes) {
            self.state.set(&write.module, &write.key, write.value);
        }

        for (module, msg) in ipc_state.drain_pending_messages() {
            reporter.info(&format!("{module}: {}", msg.text));
        }
        Ok(())
    }
}

fn printer_for(reporter: &mut dyn Reporter) -> impl FnMut(&LogMessage) + '_ {
    move |msg: &LogMessage| {
        let text = if msg.text.starts_with(char::is_whitespace) {
            msg.text.clone()
        } else {
            format!("\t{}", msg.text)
        };
        match msg.level.as_str() {
            "error" => reporter.error(&text),
            "warn" | "warning" => reporter.warn(&text),
            _ => reporter.info(&text),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::NaiveDate;
    use tempfile::tempdir;

    use crate::context::RunMode;
    use crate::options::OptionValue;

    use super::*;

    #[derive(Default)]
    struct TestReporter {
        infos: Vec<String>,
        errors: Vec<String>,
        ended: Vec<(String, bool)>,
    }

    impl Reporter for TestReporter {
        fn info(&mut self, msg: &str) {
            self.infos.push(msg.to_string());
        }
        fn warn(&mut self, _msg: &str) {}
        fn error(&mut self, msg: &str) {
            self.errors.push(msg.to_string());
        }
        fn end_project(&mut self, project: &str, success: bool, _elapsed: Duration) {
            self.ended.push((project.to_string(), success));
        }
    }

    fn test_ctx(td: &tempfile::TempDir) -> BuildContext {
        let mut ctx = BuildContext::new(td.path().join("cfg"));
        ctx.run_mode = RunMode::Build;
        for (key, dir) in [
            ("source-dir", "src"),
            ("build-dir", "build"),
            ("install-dir", "usr"),
            ("log-dir", "log"),
        ] {
            ctx.global
                .set(
                    key,
                    OptionValue::Str(td.path().join(dir).display().to_string()),
                )
                .expect("set");
        }
        ctx.global
            .set("pretend", OptionValue::Bool(true))
            .expect("set");
        ctx
    }

    fn project(name: &str, id: u32) -> Project {
        let mut p = Project::new(name, id);
        p.options
            .set_unchecked("#resolved-repository", OptionValue::Str(format!("kde:{name}.git")));
        p
    }

    #[test]
    fn synchronous_run_updates_then_builds_in_order() {
        let td = tempdir().expect("tempdir");
        let mut ctx = test_ctx(&td);
        let mut state = PersistentState::in_memory();
        let logdir = LogDir::new(
            &td.path().join("log"),
            NaiveDate::from_ymd_opt(2024, 3, 1).expect("date"),
            true,
        )
        .expect("logdir");

        let mut projects = vec![project("a", 1), project("b", 2)];
        let mut reporter = TestReporter::default();
        let mut mgr = TaskManager {
            ctx: &mut ctx,
            state: &mut state,
            logdir: &logdir,
            signals: SignalState::default(),
        };
        let outcome = mgr.run(&mut projects, &mut reporter).expect("run");

        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.built(), 2);
        assert_eq!(outcome.failed(), 0);
        assert_eq!(
            reporter.ended,
            vec![("a".to_string(), true), ("b".to_string(), true)]
        );
    }

    #[test]
    fn graceful_stop_flag_skips_remaining_projects() {
        let td = tempdir().expect("tempdir");
        let mut ctx = test_ctx(&td);
        let mut state = PersistentState::in_memory();
        let logdir = LogDir::new(
            &td.path().join("log"),
            NaiveDate::from_ymd_opt(2024, 3, 1).expect("date"),
            true,
        )
        .expect("logdir");

        let mut projects = vec![project("a", 1), project("b", 2)];
        let signals = SignalState::default();
        signals.request_stop();
        let mut reporter = TestReporter::default();
        let mut mgr = TaskManager {
            ctx: &mut ctx,
            state: &mut state,
            logdir: &logdir,
            signals,
        };
        let outcome = mgr.run(&mut projects, &mut reporter).expect("run");

        // P12-shaped: nothing runs, everything lands in unreached.
        assert!(outcome.results.is_empty());
        assert_eq!(outcome.unreached, vec!["a", "b"]);
    }

    #[test]
    fn no_update_phase_still_builds() {
        let td = tempdir().expect("tempdir");
        let mut ctx = test_ctx(&td);
        let mut state = PersistentState::in_memory();
        let logdir = LogDir::new(
            &td.path().join("log"),
            NaiveDate::from_ymd_opt(2024, 3, 1).expect("date"),
            true,
        )
        .expect("logdir");

        let mut projects = vec![project("a", 1)];
        projects[0]
            .phases
            .reset_to(vec![Phase::Build, Phase::Install]);
        let mut reporter = TestReporter::default();
        let mut mgr = TaskManager {
            ctx: &mut ctx,
            state: &mut state,
            logdir: &logdir,
            signals: SignalState::default(),
        };
        let outcome = mgr.run(&mut projects, &mut reporter).expect("run");
        assert_eq!(outcome.built(), 1);
    }

    #[test]
    fn resume_names_start_at_first_failure() {
        let outcome = RunOutcome {
            results: vec![
                ("p".to_string(), ProjectResult::Built),
                ("q".to_string(), ProjectResult::Built),
                (
                    "r".to_string(),
                    ProjectResult::Failed(Phase::Build, None),
                ),
                ("s".to_string(), ProjectResult::Built),
            ],
            unreached: vec!["t".to_string()],
        };
        // S5-shaped.
        assert_eq!(outcome.resume_names(), vec!["r", "s", "t"]);
        assert_eq!(outcome.failed_names(), vec!["r"]);
    }

}
