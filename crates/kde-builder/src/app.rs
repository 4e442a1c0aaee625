//! Top-level application flow: configuration to exit code.
//!
//! CLI → options → metadata fetch → selector resolution → dependency
//! resolution → phase filtering → task manager → finalization (persistent
//! state, log GC, failure report).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{Local, Utc};
use tracing::{debug, warn};

use crate::catalog::{BranchGroupResolver, ProjectCatalog};
use crate::config;
use crate::context::{BuildContext, RunMode, describe_project};
use crate::debug_order::{DebugInfo, sort_failures_in_debug_order};
use crate::deps::DependencyData;
use crate::graph::{self, ModuleGraph};
use crate::ipc::{LocalQueue, UpdaterIpc};
use crate::lock::LockFile;
use crate::logdir::{self, LogDir};
use crate::options::OptionsStore;
use crate::phases::Phase;
use crate::project::Project;
use crate::report::Reporter;
use crate::resolver::Resolver;
use crate::runner::ProjectResult;
use crate::signals::SignalState;
use crate::state::{self, PersistentState};
use crate::taskmgr::{RunOutcome, TaskManager};
use crate::updater::{self, UpdateTask};

/// Repository holding the project catalog and dependency metadata.
pub const METADATA_REPOSITORY: &str = "kde:sysadmin/repo-metadata.git";
pub const METADATA_DIR: &str = "repo-metadata";

/// Everything the CLI resolved from argv.
#[derive(Debug, Default)]
pub struct RunPlan {
    pub config_path: PathBuf,
    pub global_options: OptionsStore,
    pub per_project_options: BTreeMap<String, OptionsStore>,
    pub selectors: Vec<String>,
    pub ignore_selectors: Vec<String>,
    pub run_mode: RunMode,
    pub resume: bool,
    pub rebuild_failures: bool,
    /// No selectors means "everything in the configuration".
    pub all_config_projects: bool,
}

/// Run to completion. Returns the process exit code: 0 on full success, 1
/// on any project failure or internal error, the signal number after a
/// hard signal.
pub fn run(
    plan: RunPlan,
    reporter: &mut dyn Reporter,
    signals: SignalState,
    lock_prompt: impl Fn(u32) -> bool,
) -> Result<i32> {
    let doc = config::load_config(&plan.config_path)?;
    let config_dir = plan
        .config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    let mut ctx = BuildContext::new(config_dir);
    ctx.global = doc.global.clone();
    ctx.global.merge_from(&plan.global_options)?;
    ctx.cmdline_per_project = plan.per_project_options.clone();
    ctx.run_mode = plan.run_mode;

    let state_path = PathBuf::from(crate::options::expand_value(
        &ctx.option_str(None, "persistent-data-file"),
        &ctx.global,
    )?);
    let mut state = PersistentState::load(&state_path)?;

    // Resume semantics: the previous run's list is taken literally, with
    // sources and metadata assumed current.
    let mut selectors = plan.selectors.clone();
    if plan.resume {
        selectors = state.resume_list();
        if selectors.is_empty() {
            reporter.info("nothing to resume");
            return Ok(0);
        }
        force_resume_options(&mut ctx)?;
    } else if plan.rebuild_failures {
        selectors = state.last_failed_list();
        if selectors.is_empty() {
            reporter.info("no failures recorded from the last run");
            return Ok(0);
        }
        force_resume_options(&mut ctx)?;
    }

    // Single-instance guard, skipped in pretend and query modes.
    let _lock = if ctx.pretending() || ctx.run_mode == RunMode::Query {
        None
    } else {
        Some(LockFile::acquire(&ctx.config_dir, lock_prompt)?)
    };

    let metadata_dir = update_metadata(&ctx, &mut state, reporter)?;
    let catalog = load_catalog(metadata_dir.as_deref());
    let branch_groups = load_branch_groups(metadata_dir.as_deref());
    let dep_data = load_dependency_data(&ctx, metadata_dir.as_deref());

    // Selector resolution, then the dependency graph over the result.
    let mut resolver = Resolver::new(
        &doc,
        &ctx,
        catalog.as_ref(),
        branch_groups.as_ref(),
    );
    let resolved = resolver.resolve(
        &selectors,
        &plan.ignore_selectors,
        plan.all_config_projects,
    )?;
    let mut projects = resolved.projects;
    if projects.is_empty() {
        reporter.info("no projects to process");
        return Ok(0);
    }

    let seeds: Vec<usize> = (0..projects.len()).collect();
    let graph_result = {
        let mut factory = resolver.dependency_project_factory();
        graph::resolve_to_module_graph(&mut projects, &seeds, &dep_data, &mut factory)
    };
    let Some(module_graph) = graph_result.graph else {
        reporter.error("unable to resolve dependency graph; cannot continue");
        return Ok(1);
    };

    let order = graph::sort_into_build_order(&module_graph, &projects);
    let mut ordered: Vec<Project> = order.into_iter().map(|i| projects[i].clone()).collect();
    apply_phase_filters(&ctx, &mut ordered);

    if ctx.run_mode == RunMode::Query {
        for project in &ordered {
            reporter.info(&format!("{}:", project.name));
            for (key, value) in describe_project(&ctx, project) {
                reporter.info(&format!("    {key}: {value}"));
            }
        }
        return Ok(0);
    }

    let log_root = PathBuf::from(crate::options::expand_value(
        &ctx.option_str(None, "log-dir"),
        &ctx.global,
    )?);
    logdir::cleanup_latest_log_dir(&log_root, ctx.pretending())?;
    let logdir = LogDir::new(&log_root, Local::now().date_naive(), ctx.pretending())?;
    logdir.link_rollups()?;

    let outcome = {
        let mut mgr = TaskManager {
            ctx: &mut ctx,
            state: &mut state,
            logdir: &logdir,
            signals: signals.clone(),
        };
        mgr.run(&mut ordered, reporter)?
    };

    finalize(
        &ctx,
        &mut state,
        &logdir,
        &module_graph,
        &ordered,
        &outcome,
        reporter,
    )?;

    if let Some(sig) = signals.hard_signal() {
        return Ok(sig);
    }
    Ok(if outcome.any_failure() { 1 } else { 0 })
}

fn force_resume_options(ctx: &mut BuildContext) -> Result<()> {
    use crate::options::OptionValue;
    ctx.global.set("no-metadata", OptionValue::Bool(true))?;
    ctx.global.set("no-src", OptionValue::Bool(true))?;
    ctx.global
        .set("include-dependencies", OptionValue::Bool(false))?;
    Ok(())
}

/// Clone or update the metadata checkout. Pretend mode still downloads
/// (and a first run must), since dependency resolution needs the catalog.
fn update_metadata(
    ctx: &BuildContext,
    state: &mut PersistentState,
    reporter: &mut dyn Reporter,
) -> Result<Option<PathBuf>> {
    let source_root = PathBuf::from(crate::options::expand_value(
        &ctx.option_str(None, "source-dir"),
        &ctx.global,
    )?);
    let metadata_dir = source_root.join(METADATA_DIR);

    // no-metadata is honored only once a checkout exists; a first run has
    // nothing to resolve dependencies against without the download.
    if ctx.option_bool(None, "no-metadata") && metadata_dir.exists() {
        debug!("metadata update disabled");
        return Ok(Some(metadata_dir));
    }

    let task = UpdateTask {
        name: METADATA_DIR.to_string(),
        source_dir: metadata_dir.clone(),
        repository: METADATA_REPOSITORY.to_string(),
        branch: None,
        tag: None,
        commit: None,
        git_user: None,
        build_dir: None,
        update_log: std::env::temp_dir().join("kde-builder-metadata-update.log"),
        // Metadata must be present even in pretend runs.
        pretend: false,
    };
    let mut queue = LocalQueue::new();
    let mut ipc = UpdaterIpc::new(&mut queue);
    match updater::update_project(&task, &mut ipc) {
        Ok(_) => {
            state.set(
                state::GLOBAL_PROJECT,
                state::LAST_METADATA_UPDATE_KEY,
                Utc::now().timestamp(),
            );
        }
        Err(e) => {
            // A stale checkout is still usable; a missing one is not.
            if metadata_dir.exists() {
                reporter.warn(&format!("metadata update failed, using existing data: {e:#}"));
            } else {
                reporter.warn(&format!(
                    "metadata unavailable; selectors limited to configured projects: {e:#}"
                ));
                return Ok(None);
            }
        }
    }
    Ok(Some(metadata_dir))
}

fn load_catalog(metadata_dir: Option<&Path>) -> Option<ProjectCatalog> {
    let dir = metadata_dir?;
    match ProjectCatalog::from_checkout(dir) {
        Ok(catalog) => Some(catalog),
        Err(e) => {
            warn!("unable to read project catalog: {e:#}");
            None
        }
    }
}

fn load_branch_groups(metadata_dir: Option<&Path>) -> Option<BranchGroupResolver> {
    let path = metadata_dir?
        .join("dependencies")
        .join("logical-module-structure.yaml");
    let text = std::fs::read_to_string(path).ok()?;
    match BranchGroupResolver::from_yaml(&text) {
        Ok(resolver) => Some(resolver),
        Err(e) => {
            warn!("unable to read branch groups: {e:#}");
            None
        }
    }
}

fn load_dependency_data(ctx: &BuildContext, metadata_dir: Option<&Path>) -> DependencyData {
    let Some(dir) = metadata_dir else {
        return DependencyData::default();
    };
    let group = ctx.option_str(None, "branch-group");
    let candidates = [
        dir.join("dependencies")
            .join(format!("dependency-data-{group}")),
        dir.join("dependencies").join("dependency-data"),
    ];
    for path in candidates {
        if let Ok(text) = std::fs::read_to_string(&path) {
            let data = DependencyData::parse(&text);
            if data.syntax_errors > 0 {
                warn!(
                    errors = data.syntax_errors,
                    file = %path.display(),
                    "dependency data has syntax errors"
                );
            }
            return data;
        }
    }
    DependencyData::default()
}

/// Narrow each project's phase list to the run mode and the phase-related
/// options.
fn apply_phase_filters(ctx: &BuildContext, projects: &mut [Project]) {
    for project in projects.iter_mut() {
        match ctx.run_mode {
            RunMode::Install => project.phases.reset_to(vec![Phase::Install]),
            RunMode::Uninstall => project.phases.reset_to(vec![Phase::Uninstall]),
            RunMode::Build | RunMode::Query => {
                if ctx.option_bool(Some(project), "no-src") {
                    project.phases.filter_out(Phase::Update);
                }
                if ctx.option_bool(Some(project), "run-tests") {
                    project.phases.add_test_after_build();
                }
            }
        }
    }
}

fn finalize(
    ctx: &BuildContext,
    state: &mut PersistentState,
    logdir: &LogDir,
    module_graph: &ModuleGraph,
    projects: &[Project],
    outcome: &RunOutcome,
    reporter: &mut dyn Reporter,
) -> Result<()> {
    // Post-build messages, one block per project.
    for project in projects {
        for msg in &project.post_build_messages {
            reporter.warn(msg);
        }
    }

    state.set_resume_list(&outcome.resume_names());
    state.set_last_failed_list(&outcome.failed_names());

    if !ctx.pretending() {
        state.save()?;
        if ctx.option_bool(None, "purge-old-logs") {
            logdir::delete_unreferenced_log_directories(logdir.base())?;
        }
    }

    report_failures(ctx, state, module_graph, outcome, reporter);

    if !ctx.pretending() {
        let status_log = logdir.run_dir().join("status-list.log");
        let screen_log = logdir.run_dir().join("screen.log");
        for (name, result) in &outcome.results {
            let status = match result {
                ProjectResult::Built => "succeeded".to_string(),
                ProjectResult::SkippedUnchanged => "skipped".to_string(),
                ProjectResult::FailedUpdate => "failed to update".to_string(),
                ProjectResult::Failed(phase, _) => format!("failed ({phase})"),
            };
            let line = format!("{name}: {status}");
            crate::process::append_line(&status_log, &line)?;
            crate::process::append_line(&screen_log, &line)?;
        }
    }
    Ok(())
}

fn report_failures(
    ctx: &BuildContext,
    state: &PersistentState,
    module_graph: &ModuleGraph,
    outcome: &RunOutcome,
    reporter: &mut dyn Reporter,
) {
    if !outcome.any_failure() {
        return;
    }

    // Per-phase failure lists with the path to each error log.
    let mut by_phase: BTreeMap<Phase, Vec<String>> = BTreeMap::new();
    for (name, failure) in &ctx.failures {
        let entry = match &failure.error_log {
            Some(log) => format!("{name} - {}", log.display()),
            None => name.clone(),
        };
        by_phase.entry(failure.phase).or_default().push(entry);
    }
    for (phase, entries) in &by_phase {
        reporter.error(&format!("projects that failed to {phase}:"));
        for entry in entries {
            reporter.error(&format!("    {entry}"));
        }
    }

    // The most interesting failures first, by the debug-order heuristic.
    let failed = outcome.failed_names();
    if failed.len() > 1 {
        let mut info = DebugInfo::default();
        for (name, failure) in &ctx.failures {
            info.phases.insert(name.clone(), failure.phase);
        }
        for name in &failed {
            info.fail_counts
                .insert(name.clone(), state.failure_count(name));
        }
        let ranked = sort_failures_in_debug_order(module_graph, &info, &failed);
        reporter.info("most interesting failures first:");
        for name in ranked.iter().take(5) {
            reporter.info(&format!("    {name}"));
        }
    }

    // CMake-shaped failures usually mean missing build dependencies.
    let cmake_failed = failed.iter().any(|name| {
        module_graph
            .nodes
            .get(name)
            .is_some_and(|node| node.module.is_some())
    });
    if cmake_failed {
        reporter.info(
            "if configure steps failed, missing development packages are the usual cause; \
             try installing your distribution's build dependencies for these projects",
        );
    }
}
