mod status;

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{CommandFactory, Parser};
use clap_complete::Shell;

use kde_builder::app::{self, RunPlan};
use kde_builder::context::RunMode;
use kde_builder::options::{OptionValue, OptionsStore, coerce_scalar};
use kde_builder::signals;
use kde_builder::worker;

use status::StatusReporter;

#[derive(Parser, Debug)]
#[command(name = "kde-builder", version)]
#[command(about = "Update, build, and install projects in dependency order")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, default_value = "kde-builder.yaml")]
    rc_file: PathBuf,

    /// Don't actually take major actions; describe what would happen.
    #[arg(long, short = 'p')]
    pretend: bool,

    /// Skip the source update phase.
    #[arg(long)]
    no_src: bool,

    /// Skip the project-metadata download.
    #[arg(long)]
    no_metadata: bool,

    /// Do not pull in dependencies of the selected projects.
    #[arg(long)]
    no_include_dependencies: bool,

    /// Resume from the first project that failed last run.
    #[arg(long)]
    resume: bool,

    /// Build only the projects that failed last run.
    #[arg(long)]
    rebuild_failures: bool,

    /// Stop the whole run after the first project failure.
    #[arg(long)]
    stop_on_failure: bool,

    /// Run each project's test suite after building it.
    #[arg(long)]
    run_tests: bool,

    /// Only install already-built projects.
    #[arg(long)]
    install_only: bool,

    /// Uninstall the selected projects.
    #[arg(long)]
    uninstall: bool,

    /// Print resolved information about the selected projects and exit.
    #[arg(long)]
    query: bool,

    /// Set a global option, NAME=VALUE. Repeatable.
    #[arg(long = "option", short = 'o', value_name = "NAME=VALUE")]
    options: Vec<String>,

    /// Set an option on one project, PROJECT,NAME=VALUE. Repeatable.
    #[arg(long = "project-option", value_name = "PROJECT,NAME=VALUE")]
    project_options: Vec<String>,

    /// Skip these projects (or whole groups). Repeatable.
    #[arg(long = "ignore-projects", value_name = "NAME")]
    ignore_projects: Vec<String>,

    /// Verbose internal diagnostics.
    #[arg(long)]
    debug: bool,

    /// Generate shell completions and exit.
    #[arg(long, value_enum, value_name = "SHELL")]
    completions: Option<Shell>,

    /// Internal: run as the update worker over the given handoff file.
    #[arg(long = "internal-update-worker", hide = true, value_name = "FILE")]
    internal_update_worker: Option<PathBuf>,

    /// Projects, groups, or catalog selectors to process.
    selectors: Vec<String>,
}

fn main() {
    let cli = Cli::parse();

    // Worker mode speaks IPC frames on stdout and nothing else.
    if let Some(handoff) = &cli.internal_update_worker {
        let code = match worker::run_update_worker(handoff) {
            Ok(()) => 0,
            Err(_) => 1,
        };
        std::process::exit(code);
    }

    if let Some(shell) = cli.completions {
        let mut cmd = Cli::command();
        clap_complete::generate(shell, &mut cmd, "kde-builder", &mut std::io::stdout());
        return;
    }

    init_tracing(cli.debug);

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing(debug: bool) {
    use tracing_subscriber::EnvFilter;
    let default = if debug { "kde_builder=debug" } else { "kde_builder=warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<i32> {
    let plan = plan_from_cli(&cli)?;
    let signals = signals::install()?;
    let mut reporter = StatusReporter::new();

    let code = app::run(plan, &mut reporter, signals, prompt_to_steal_lock)?;
    reporter.finish();
    Ok(code)
}

fn plan_from_cli(cli: &Cli) -> Result<RunPlan> {
    let mut global = OptionsStore::new();
    for (flag, name) in [
        (cli.pretend, "pretend"),
        (cli.no_src, "no-src"),
        (cli.no_metadata, "no-metadata"),
        (cli.stop_on_failure, "stop-on-failure"),
        (cli.run_tests, "run-tests"),
    ] {
        if flag {
            global.set(name, OptionValue::Bool(true))?;
        }
    }
    if cli.no_include_dependencies {
        global.set("include-dependencies", OptionValue::Bool(false))?;
    }
    for spec in &cli.options {
        let (name, value) = parse_option_spec(spec)?;
        global
            .set(&name, value)
            .with_context(|| format!("in --option {spec}"))?;
    }

    let mut per_project: BTreeMap<String, OptionsStore> = BTreeMap::new();
    for spec in &cli.project_options {
        let (project, rest) = spec
            .split_once(',')
            .with_context(|| format!("--project-option needs PROJECT,NAME=VALUE, got {spec}"))?;
        let (name, value) = parse_option_spec(rest)?;
        per_project
            .entry(project.to_string())
            .or_default()
            .set(&name, value)
            .with_context(|| format!("in --project-option {spec}"))?;
    }

    let run_mode = match (cli.install_only, cli.uninstall, cli.query) {
        (false, false, false) => RunMode::Build,
        (true, false, false) => RunMode::Install,
        (false, true, false) => RunMode::Uninstall,
        (false, false, true) => RunMode::Query,
        _ => bail!("--install-only, --uninstall, and --query are mutually exclusive"),
    };
    if cli.resume && cli.rebuild_failures {
        bail!("--resume and --rebuild-failures are mutually exclusive");
    }
    if (cli.resume || cli.rebuild_failures) && !cli.selectors.is_empty() {
        bail!("--resume and --rebuild-failures take no selectors");
    }

    Ok(RunPlan {
        config_path: cli.rc_file.clone(),
        global_options: global,
        per_project_options: per_project,
        selectors: cli.selectors.clone(),
        ignore_selectors: cli.ignore_projects.clone(),
        run_mode,
        resume: cli.resume,
        rebuild_failures: cli.rebuild_failures,
        all_config_projects: cli.selectors.is_empty() && !cli.resume && !cli.rebuild_failures,
    })
}

fn parse_option_spec(spec: &str) -> Result<(String, OptionValue)> {
    let (name, value) = spec
        .split_once('=')
        .with_context(|| format!("expected NAME=VALUE, got {spec}"))?;
    Ok((name.to_string(), coerce_scalar(value.to_string())))
}

/// The lock is held by another live process; ask whether to proceed
/// anyway.
fn prompt_to_steal_lock(pid: u32) -> bool {
    eprint!(
        "another kde-builder (pid {pid}) seems to be running with this configuration.\n\
         Proceed anyway and take over the lock? [y/N] "
    );
    let _ = std::io::stderr().flush();
    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim(), "y" | "Y" | "yes")
}
