//! Per-project build runner: the configure → build → test → install
//! pipeline for one project whose update outcome is already known.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use tracing::{debug, warn};

use crate::buildsystem::{self, BuildEnv, BuildFlavor};
use crate::context::BuildContext;
use crate::ipc::UpdateStatus;
use crate::logdir::LogDir;
use crate::phases::Phase;
use crate::project::Project;
use crate::report::{Reporter, parse_progress};
use crate::state::{self, PersistentState};
use crate::updater;

/// Sentinel dropped in the build directory after a failed configure; its
/// presence forces configuring from scratch next run.
pub const REFRESH_ME: &str = ".refresh-me";

/// Terminal outcome of one project's build-side phases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectResult {
    Built,
    /// Update pulled nothing and nothing forces a rebuild.
    SkippedUnchanged,
    FailedUpdate,
    Failed(Phase, Option<PathBuf>),
}

impl ProjectResult {
    pub fn is_failure(&self) -> bool {
        matches!(self, ProjectResult::FailedUpdate | ProjectResult::Failed(..))
    }
}

pub struct BuildRunner<'a> {
    pub ctx: &'a BuildContext,
    pub state: &'a mut PersistentState,
    pub logdir: &'a LogDir,
    pub reporter: &'a mut dyn Reporter,
    pub position: usize,
    pub total: usize,
}

impl BuildRunner<'_> {
    /// Drive one project through its remaining phases.
    pub fn handle_project(
        &mut self,
        project: &mut Project,
        update_status: UpdateStatus,
        refresh_reason: &str,
    ) -> ProjectResult {
        let started = Instant::now();
        let result = self.handle_inner(project, update_status, refresh_reason);
        self.reporter
            .end_project(&project.name, !result.is_failure(), started.elapsed());
        result
    }

    fn handle_inner(
        &mut self,
        project: &mut Project,
        update_status: UpdateStatus,
        refresh_reason: &str,
    ) -> ProjectResult {
        let name = project.name.clone();

        if update_status == UpdateStatus::Failed {
            self.state.bump_failure_count(&name);
            self.reporter.error(&format!("{name}: failed to update"));
            return ProjectResult::FailedUpdate;
        }

        if !project.phases.has(Phase::Build) {
            // Install-only and uninstall-only runs come through here too.
            return self.non_build_phases(project);
        }

        let build_when_unchanged = self.ctx.option_bool(Some(project), "build-when-unchanged");
        if update_status == UpdateStatus::Skipped
            && refresh_reason.is_empty()
            && !build_when_unchanged
            && self.state.failure_count(&name) == 0
        {
            debug!(project = %name, "no code changes; skipping build");
            return ProjectResult::SkippedUnchanged;
        }

        // Assume failure until the pipeline finishes; a crash mid-build
        // then still counts against the project next run.
        self.state.bump_failure_count(&name);

        match self.run_build_pipeline(project, refresh_reason) {
            Ok(()) => {
                if !self.ctx.pretending() {
                    if let Some(rev) =
                        updater::current_revision(&self.ctx.source_dir_for(project))
                    {
                        self.state.set(&name, state::LAST_BUILD_REV_KEY, rev);
                    }
                }
                self.state.reset_failure_count(&name);
                self.apply_remove_after_install(project);
                ProjectResult::Built
            }
            Err(failure) => {
                self.reporter.error(&format!(
                    "{name}: {} phase failed: {:#}",
                    failure.phase, failure.source
                ));
                ProjectResult::Failed(failure.phase, failure.error_log)
            }
        }
    }

    fn non_build_phases(&mut self, project: &mut Project) -> ProjectResult {
        let phases: Vec<Phase> = project.phases.iter().collect();
        for phase in phases {
            if matches!(phase, Phase::Install | Phase::Uninstall) {
                if let Err(failure) = self.run_single_phase(project, phase) {
                    self.reporter.error(&format!(
                        "{}: {} failed: {:#}",
                        project.name, failure.phase, failure.source
                    ));
                    return ProjectResult::Failed(failure.phase, failure.error_log);
                }
            }
        }
        ProjectResult::Built
    }

    fn run_single_phase(&mut self, project: &mut Project, phase: Phase) -> Result<(), PhaseError> {
        let env = self.build_env(project);
        let flavor = self.flavor_for(project);
        self.reporter
            .begin_phase(&project.name, phase, self.position, self.total);
        let result = match phase {
            Phase::Install => flavor.install(&env),
            Phase::Uninstall => flavor.uninstall(&env),
            _ => Ok(()),
        };
        result.map_err(|e| PhaseError {
            phase,
            error_log: Some(env.error_log(phase.as_str())),
            source: e,
        })
    }

    fn run_build_pipeline(
        &mut self,
        project: &mut Project,
        refresh_reason: &str,
    ) -> Result<(), PhaseError> {
        let name = project.name.clone();
        let mut env = self.build_env(project);
        let flavor = self.flavor_for(project);

        self.check_required_programs(&name, flavor.as_ref(), &env)?;
        flavor
            .prepare_build_environment(&mut env)
            .map_err(|e| PhaseError::new(Phase::Build, e))?;

        self.create_build_system(project, &env)
            .map_err(|e| PhaseError::new(Phase::Build, e))?;

        let needs_configure = refresh_needed(&env, flavor.as_ref(), refresh_reason);
        if needs_configure {
            self.reporter
                .begin_phase(&name, Phase::Build, self.position, self.total);
            if let Err(e) = flavor.configure(&env) {
                // Force a from-scratch configure on the next attempt.
                if !env.pretend {
                    let _ = std::fs::write(env.build_dir.join(REFRESH_ME), b"");
                }
                return Err(PhaseError {
                    phase: Phase::Build,
                    error_log: Some(env.error_log("cmake")),
                    source: e,
                });
            }
            if !env.pretend {
                let _ = std::fs::remove_file(env.build_dir.join(REFRESH_ME));
            }
        }

        self.reporter
            .begin_phase(&name, Phase::Build, self.position, self.total);
        let progress = {
            let mut on_line = progress_watcher(&mut *self.reporter, &name);
            flavor.build(&env, &mut on_line)
        }
        .map_err(|e| PhaseError {
            phase: Phase::Build,
            error_log: Some(env.error_log("build")),
            source: e,
        })?;
        if !progress.was_successful {
            return Err(PhaseError {
                phase: Phase::Build,
                error_log: Some(env.error_log("build")),
                source: anyhow::anyhow!("{name}: build failed"),
            });
        }
        if progress.warnings > 0 {
            self.reporter
                .warn(&format!("{name}: build produced {} warnings", progress.warnings));
        }

        if project.phases.has(Phase::Test) {
            self.reporter
                .begin_phase(&name, Phase::Test, self.position, self.total);
            flavor.run_testsuite(&env).map_err(|e| PhaseError {
                phase: Phase::Test,
                error_log: Some(env.error_log("test")),
                source: e,
            })?;
        }

        // Skip the install only when the build had nothing to do and
        // install-after-build is off.
        if project.phases.has(Phase::Install) {
            let install_after_build =
                self.ctx.option_bool(Some(project), "install-after-build");
            if install_after_build || progress.work_done {
                self.reporter
                    .begin_phase(&name, Phase::Install, self.position, self.total);
                flavor.install(&env).map_err(|e| PhaseError {
                    phase: Phase::Install,
                    error_log: Some(env.error_log("install")),
                    source: e,
                })?;
            } else {
                debug!(project = %name, "nothing built and install-after-build disabled");
            }
        }
        Ok(())
    }

    /// Make the build directory exist, moving a stale one aside when the
    /// configured name changed since the last run.
    fn create_build_system(&mut self, project: &mut Project, env: &BuildEnv) -> Result<()> {
        let name = project.name.clone();
        let current = env.build_dir.display().to_string();
        if let Some(previous) = self.state.get_str(&name, "last-build-dir") {
            if previous != current && PathBuf::from(&previous).is_dir() && !env.pretend {
                let moved = format!("{previous}.old");
                if std::fs::rename(&previous, &moved).is_ok() {
                    let msg = format!(
                        "{name}: build directory moved from {previous} to {moved} after rename"
                    );
                    warn!("{msg}");
                    project.add_post_build_message(msg);
                }
            }
        }
        self.state.set(&name, "last-build-dir", current);
        if !env.pretend {
            std::fs::create_dir_all(&env.build_dir)?;
        }
        Ok(())
    }

    fn check_required_programs(
        &mut self,
        name: &str,
        flavor: &dyn BuildFlavor,
        env: &BuildEnv,
    ) -> Result<(), PhaseError> {
        if self.ctx.pretending() {
            return Ok(());
        }
        for program in flavor.required_programs(env) {
            if which::which(program).is_err() {
                return Err(PhaseError::new(
                    Phase::Build,
                    anyhow::anyhow!(
                        "{name}: required program \"{program}\" is not installed or not on PATH"
                    ),
                ));
            }
        }
        Ok(())
    }

    fn apply_remove_after_install(&mut self, project: &Project) {
        let mode = self.ctx.option_str(Some(project), "remove-after-install");
        if self.ctx.pretending() {
            return;
        }
        match mode.as_str() {
            "builddir" | "all" => {
                let _ = std::fs::remove_dir_all(self.ctx.build_dir_for(project));
                if mode == "all" {
                    let _ = std::fs::remove_dir_all(self.ctx.source_dir_for(project));
                }
            }
            _ => {}
        }
    }

    fn flavor_for(&self, project: &Project) -> Box<dyn BuildFlavor> {
        let source_dir = self.ctx.source_dir_for(project);
        let override_name = self.ctx.option_str(Some(project), "override-build-system");
        buildsystem::detect_flavor(
            &source_dir,
            &override_name,
            project.origin,
            project.is_catalog,
        )
    }

    /// Resolve every option a flavor consumes into a [`BuildEnv`].
    pub fn build_env(&self, project: &Project) -> BuildEnv {
        let ctx = self.ctx;
        let words = |key: &str| -> Vec<String> {
            ctx.option_str(Some(project), key)
                .split_whitespace()
                .map(str::to_string)
                .collect()
        };
        let generator = {
            let g = ctx.option_str(Some(project), "cmake-generator");
            if g.is_empty() { "Ninja".to_string() } else { g }
        };
        BuildEnv {
            project: project.name.clone(),
            source_dir: ctx.source_dir_for(project),
            build_dir: ctx.build_dir_for(project),
            install_prefix: ctx.install_prefix_for(project),
            env: ctx.build_environment(project),
            logdir: self.logdir.clone(),
            cmake_options: words("cmake-options"),
            cmake_generator: generator,
            configure_flags: words("configure-flags"),
            cxxflags: ctx.option_str(Some(project), "cxxflags"),
            make_options: words("make-options"),
            qmake_options: words("qmake-options"),
            meson_options: words("meson-options"),
            custom_build_command: Some(ctx.option_str(Some(project), "custom-build-command"))
                .filter(|s| !s.is_empty()),
            make_install_prefix: words("make-install-prefix"),
            num_cores: ctx.resolve_num_cores(Some(project), "num-cores"),
            num_cores_low_mem: ctx.resolve_num_cores(Some(project), "num-cores-low-mem"),
            taskset_cpu_list: Some(ctx.option_str(Some(project), "taskset-cpu-list"))
                .filter(|s| !s.is_empty()),
            pretend: ctx.pretending(),
        }
    }
}

/// Whether configure must run: never configured, forced by the sentinel,
/// or the updater supplied a reason.
fn refresh_needed(env: &BuildEnv, flavor: &dyn BuildFlavor, refresh_reason: &str) -> bool {
    if !refresh_reason.is_empty() {
        return true;
    }
    if env.build_dir.join(REFRESH_ME).exists() {
        return true;
    }
    !env.build_dir.join(flavor.configured_module_file_name()).exists()
}

struct PhaseError {
    phase: Phase,
    error_log: Option<PathBuf>,
    source: anyhow::Error,
}

impl PhaseError {
    fn new(phase: Phase, source: anyhow::Error) -> Self {
        PhaseError {
            phase,
            error_log: None,
            source,
        }
    }
}

/// Line callback wiring progress fractions into the reporter; shared by
/// the task manager's build loop.
pub fn progress_watcher<'a>(
    reporter: &'a mut dyn Reporter,
    project: &'a str,
) -> impl FnMut(&str) + 'a {
    move |line: &str| {
        if let Some(fraction) = parse_progress(line) {
            reporter.phase_progress(project, Phase::Build, Some(fraction));
        }
    }
}
