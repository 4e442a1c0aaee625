//! Build-system flavors.
//!
//! Each source tree builds with exactly one flavor, detected from its
//! contents (or forced with `override-build-system`). A flavor turns the
//! project's options into concrete command lines for the configure, build,
//! test, install, and uninstall steps.

mod autotools;
mod cmake_bootstrap;
mod generic;
mod kde_cmake;
mod meson;
mod qmake;
mod qt;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::debug;

use crate::logdir::LogDir;
use crate::process::{self, LoggedRun};
use crate::project::ProjectOrigin;

pub use autotools::Autotools;
pub use cmake_bootstrap::CmakeBootstrap;
pub use generic::Generic;
pub use kde_cmake::KdeCmake;
pub use meson::Meson;
pub use qmake::Qmake;
pub use qt::QtConfigure;

/// Everything a flavor needs to materialize and run its commands, resolved
/// from the option layers before the phase starts.
pub struct BuildEnv {
    pub project: String,
    pub source_dir: PathBuf,
    pub build_dir: PathBuf,
    pub install_prefix: PathBuf,
    pub env: BTreeMap<String, String>,
    pub logdir: LogDir,

    pub cmake_options: Vec<String>,
    pub cmake_generator: String,
    pub configure_flags: Vec<String>,
    pub cxxflags: String,
    pub make_options: Vec<String>,
    pub qmake_options: Vec<String>,
    pub meson_options: Vec<String>,
    pub custom_build_command: Option<String>,
    /// Argv prefix for install/uninstall, e.g. `sudo`.
    pub make_install_prefix: Vec<String>,

    pub num_cores: u32,
    pub num_cores_low_mem: u32,
    pub taskset_cpu_list: Option<String>,
    pub pretend: bool,
}

impl BuildEnv {
    /// Run one command, output logged under this project's directory.
    pub fn run(&self, log_name: &str, argv: &[String], cwd: &Path) -> Result<i32> {
        let log_path = self.logdir.log_path_named(&self.project, log_name)?;
        process::run_logged(
            &LoggedRun {
                argv,
                log_path: &log_path,
                cwd: Some(cwd),
                env: &self.env,
                pretend: self.pretend,
            },
            None,
        )
    }

    /// Like [`BuildEnv::run`] with a per-line callback on stdout.
    pub fn run_watching(
        &self,
        log_name: &str,
        argv: &[String],
        cwd: &Path,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<i32> {
        let log_path = self.logdir.log_path_named(&self.project, log_name)?;
        process::run_logged(
            &LoggedRun {
                argv,
                log_path: &log_path,
                cwd: Some(cwd),
                env: &self.env,
                pretend: self.pretend,
            },
            Some(on_line),
        )
    }

    /// The error log most relevant to a failed step.
    pub fn error_log(&self, log_name: &str) -> PathBuf {
        self.logdir
            .run_dir()
            .join(&self.project)
            .join(format!("{log_name}.log"))
    }
}

/// Result of the build step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildProgress {
    pub was_successful: bool,
    pub warnings: u32,
    /// False when the tool had nothing to do (everything up to date).
    pub work_done: bool,
}

/// The per-flavor contract.
pub trait BuildFlavor {
    fn name(&self) -> &'static str;

    /// Programs that must be on PATH before this flavor can work. Takes
    /// the environment so generator-dependent flavors can report their
    /// real requirement rather than a worst-case union.
    fn required_programs(&self, env: &BuildEnv) -> Vec<&'static str>;

    /// True when the build tool schedules its own parallelism (ninja).
    fn supports_auto_parallelism(&self) -> bool {
        false
    }

    /// File the configure step leaves behind; its absence means the build
    /// directory needs configuring from scratch.
    fn configured_module_file_name(&self) -> &'static str;

    fn configure(&self, env: &BuildEnv) -> Result<()>;

    /// Run the build tool. `on_line` observes each line of tool stdout,
    /// for progress display.
    fn build(&self, env: &BuildEnv, on_line: &mut dyn FnMut(&str)) -> Result<BuildProgress>;

    fn run_testsuite(&self, env: &BuildEnv) -> Result<()>;
    fn install(&self, env: &BuildEnv) -> Result<()>;
    fn uninstall(&self, env: &BuildEnv) -> Result<()>;

    /// Flavor-specific environment adjustments before any step runs.
    fn prepare_build_environment(&self, _env: &mut BuildEnv) -> Result<()> {
        Ok(())
    }
}

/// Detect the flavor for a source tree. First match wins:
/// `override-build-system`, Qt-supermodule origin, bootstrap-carrying
/// CMake, plain CMake (or any catalog project), qmake, autotools, meson,
/// and finally a bare `make` fallback.
pub fn detect_flavor(
    source_dir: &Path,
    override_build_system: &str,
    origin: ProjectOrigin,
    is_catalog: bool,
) -> Box<dyn BuildFlavor> {
    if !override_build_system.is_empty() {
        if let Some(flavor) = flavor_by_name(override_build_system) {
            return flavor;
        }
        debug!(override_build_system, "unknown build-system override; detecting instead");
    }

    if origin == ProjectOrigin::QtGroup {
        return Box::new(QtConfigure);
    }

    let has_cmake = source_dir.join("CMakeLists.txt").exists();
    if has_cmake && source_dir.join("bootstrap").exists() {
        return Box::new(CmakeBootstrap);
    }
    if has_cmake || is_catalog {
        return Box::new(KdeCmake);
    }
    if has_qmake_project(source_dir) {
        return Box::new(Qmake);
    }
    if source_dir.join("configure").exists() || source_dir.join("autogen.sh").exists() {
        return Box::new(Autotools);
    }
    if source_dir.join("meson.build").exists() {
        return Box::new(Meson);
    }
    Box::new(Generic)
}

pub fn flavor_by_name(name: &str) -> Option<Box<dyn BuildFlavor>> {
    Some(match name {
        "kde-cmake" | "cmake" => Box::new(KdeCmake) as Box<dyn BuildFlavor>,
        "cmake-bootstrap" => Box::new(CmakeBootstrap),
        "qmake" | "qmake5" | "qmake6" => Box::new(Qmake),
        "autotools" => Box::new(Autotools),
        "meson" => Box::new(Meson),
        "generic" => Box::new(Generic),
        "qt" | "qt4" | "qt5" | "qt6" => Box::new(QtConfigure),
        _ => return None,
    })
}

fn has_qmake_project(source_dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(source_dir) else {
        return false;
    };
    entries.flatten().any(|e| {
        e.file_name()
            .to_string_lossy()
            .ends_with(".pro")
    })
}

/// Assemble the final build-tool argv: user make-options with any naked
/// `-j` stripped, an explicit `-j N` for tools that need one, and a
/// `taskset` wrapper when CPU pinning was requested.
pub fn apply_parallelism(env: &BuildEnv, tool_argv: Vec<String>, auto_parallel: bool) -> Vec<String> {
    let mut argv = tool_argv;

    if !auto_parallel {
        argv.push("-j".to_string());
        argv.push(env.num_cores.to_string());
    }

    let mut skip_next_count = false;
    for opt in &env.make_options {
        if skip_next_count {
            skip_next_count = false;
            if opt.parse::<u32>().is_ok() {
                // The count belonging to a user "-j N"; both dropped.
                continue;
            }
        }
        if opt == "-j" {
            skip_next_count = true;
            continue;
        }
        argv.push(opt.clone());
    }

    if let Some(cpus) = env.taskset_cpu_list.as_ref().filter(|c| !c.is_empty()) {
        let mut wrapped = vec![
            "taskset".to_string(),
            "--cpu-list".to_string(),
            cpus.clone(),
        ];
        wrapped.extend(argv);
        return wrapped;
    }
    argv
}

/// Shared install/uninstall runner: `<prefix argv> <tool> <target>`.
pub(crate) fn run_make_target(
    env: &BuildEnv,
    tool: &str,
    target: &str,
    log_name: &str,
) -> Result<i32> {
    let mut argv = env.make_install_prefix.clone();
    argv.push(tool.to_string());
    argv.push(target.to_string());
    env.run(log_name, &argv, &env.build_dir)
}

pub(crate) fn ensure_exit_ok(project: &str, what: &str, code: i32) -> Result<()> {
    if code != 0 {
        bail!("{project}: {what} failed with exit code {code}");
    }
    Ok(())
}

/// Count of warning-looking lines in build output, a rough quality signal
/// surfaced in the report.
pub(crate) fn looks_like_warning(line: &str) -> bool {
    line.contains("warning:") || line.contains("Warning:")
}

pub(crate) fn mkdir_build_dir(env: &BuildEnv) -> Result<()> {
    if env.pretend {
        return Ok(());
    }
    std::fs::create_dir_all(&env.build_dir)
        .with_context(|| format!("failed to create build directory {}", env.build_dir.display()))
}


#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::testutil::pretend_env;
    use super::*;

    #[test]
    fn detection_prefers_override() {
        let td = tempdir().expect("tempdir");
        fs::write(td.path().join("CMakeLists.txt"), "").expect("write");
        let flavor = detect_flavor(td.path(), "meson", ProjectOrigin::Config, false);
        assert_eq!(flavor.name(), "meson");
    }

    #[test]
    fn detection_order_matches_contract() {
        let td = tempdir().expect("tempdir");

        // Empty tree, not catalog: generic.
        assert_eq!(
            detect_flavor(td.path(), "", ProjectOrigin::Config, false).name(),
            "generic"
        );

        fs::write(td.path().join("meson.build"), "").expect("write");
        assert_eq!(
            detect_flavor(td.path(), "", ProjectOrigin::Config, false).name(),
            "meson"
        );

        fs::write(td.path().join("configure"), "").expect("write");
        assert_eq!(
            detect_flavor(td.path(), "", ProjectOrigin::Config, false).name(),
            "autotools"
        );

        fs::write(td.path().join("app.pro"), "").expect("write");
        assert_eq!(
            detect_flavor(td.path(), "", ProjectOrigin::Config, false).name(),
            "qmake"
        );

        fs::write(td.path().join("CMakeLists.txt"), "").expect("write");
        assert_eq!(
            detect_flavor(td.path(), "", ProjectOrigin::Config, false).name(),
            "kde-cmake"
        );

        fs::write(td.path().join("bootstrap"), "").expect("write");
        assert_eq!(
            detect_flavor(td.path(), "", ProjectOrigin::Config, false).name(),
            "cmake-bootstrap"
        );
    }

    #[test]
    fn catalog_projects_default_to_kde_cmake() {
        let td = tempdir().expect("tempdir");
        assert_eq!(
            detect_flavor(td.path(), "", ProjectOrigin::Catalog, true).name(),
            "kde-cmake"
        );
    }

    #[test]
    fn qt_group_origin_selects_qt_flavor() {
        let td = tempdir().expect("tempdir");
        fs::write(td.path().join("CMakeLists.txt"), "").expect("write");
        assert_eq!(
            detect_flavor(td.path(), "", ProjectOrigin::QtGroup, true).name(),
            "qt"
        );
    }

    #[test]
    fn parallelism_adds_explicit_jobs_for_make() {
        let td = tempdir().expect("tempdir");
        let env = pretend_env(&td);
        let argv = apply_parallelism(&env, vec!["make".into()], false);
        assert_eq!(argv, vec!["make", "-j", "4"]);
    }

    #[test]
    fn parallelism_trusts_auto_parallel_tools() {
        let td = tempdir().expect("tempdir");
        let env = pretend_env(&td);
        let argv = apply_parallelism(&env, vec!["ninja".into()], true);
        assert_eq!(argv, vec!["ninja"]);
    }

    #[test]
    fn naked_j_in_user_options_is_stripped() {
        // B4.
        let td = tempdir().expect("tempdir");
        let mut env = pretend_env(&td);
        env.make_options = vec!["-j".into(), "VERBOSE=1".into()];
        let argv = apply_parallelism(&env, vec!["make".into()], false);
        assert_eq!(argv, vec!["make", "-j", "4", "VERBOSE=1"]);
    }

    #[test]
    fn user_j_with_count_is_stripped_entirely() {
        let td = tempdir().expect("tempdir");
        let mut env = pretend_env(&td);
        env.make_options = vec!["-j".into(), "12".into(), "VERBOSE=1".into()];
        let argv = apply_parallelism(&env, vec!["make".into()], false);
        assert_eq!(argv, vec!["make", "-j", "4", "VERBOSE=1"]);
    }

    #[test]
    fn taskset_wraps_the_whole_command() {
        let td = tempdir().expect("tempdir");
        let mut env = pretend_env(&td);
        env.taskset_cpu_list = Some("0-3".into());
        let argv = apply_parallelism(&env, vec!["ninja".into()], true);
        assert_eq!(argv, vec!["taskset", "--cpu-list", "0-3", "ninja"]);
    }

    #[test]
    fn warning_detection_is_conservative() {
        assert!(looks_like_warning("foo.cpp:3: warning: unused variable"));
        assert!(!looks_like_warning("everything is fine"));
    }

    #[test]
    fn flavor_names_resolve() {
        for name in [
            "kde-cmake",
            "cmake-bootstrap",
            "qmake",
            "autotools",
            "meson",
            "generic",
            "qt6",
        ] {
            assert!(flavor_by_name(name).is_some(), "{name} must resolve");
        }
        assert!(flavor_by_name("scons").is_none());
    }
}
