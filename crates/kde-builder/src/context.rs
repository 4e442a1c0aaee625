//! Process-global build context: the `global` option layer, run mode,
//! per-run paths, and the layered option resolution every component reads
//! through.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::options::{self, OptionValue, OptionsStore};
use crate::phases::Phase;
use crate::project::Project;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Build,
    Install,
    Uninstall,
    Query,
}

impl Default for RunMode {
    fn default() -> Self {
        RunMode::Build
    }
}

/// Outcome of one phase of one project, kept for the end-of-run report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectFailure {
    pub phase: Phase,
    pub error_log: Option<PathBuf>,
}

/// The process-global "global project".
///
/// Owns the global option layer and the command-line option layers. The
/// resolved project list, persistent state, and log manager are owned by
/// the application and threaded explicitly, per-function, not through here.
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    pub global: OptionsStore,
    /// Command-line options addressed to a specific project, highest layer.
    pub cmdline_per_project: BTreeMap<String, OptionsStore>,
    pub run_mode: RunMode,
    /// Directory the configuration was loaded from; anchors the lock file.
    pub config_dir: PathBuf,
    /// Failures recorded per project name, in discovery order.
    pub failures: Vec<(String, ProjectFailure)>,
}

impl BuildContext {
    pub fn new(config_dir: PathBuf) -> Self {
        BuildContext {
            config_dir,
            ..Default::default()
        }
    }

    /// Built-in defaults, the lowest precedence layer.
    pub fn builtin_default(key: &str) -> Option<OptionValue> {
        let v = match key {
            "source-dir" => OptionValue::Str("~/kde/src".into()),
            "build-dir" => OptionValue::Str("~/kde/build".into()),
            "install-dir" => OptionValue::Str("~/kde/usr".into()),
            "log-dir" => OptionValue::Str("~/kde/log".into()),
            "directory-layout" => OptionValue::Str("invent".into()),
            "branch-group" => OptionValue::Str("kf6-qt6".into()),
            "include-dependencies" => OptionValue::Bool(true),
            // Single documented default; the original varied by code path.
            "install-after-build" => OptionValue::Bool(true),
            "build-when-unchanged" => OptionValue::Bool(false),
            "stop-on-failure" => OptionValue::Bool(false),
            "async" => OptionValue::Bool(true),
            "num-cores" => OptionValue::Str("auto".into()),
            "num-cores-low-mem" => OptionValue::Str("auto".into()),
            "purge-old-logs" => OptionValue::Bool(true),
            "colorful-output" => OptionValue::Bool(true),
            "use-inactive-projects" => OptionValue::Bool(false),
            "run-tests" => OptionValue::Bool(false),
            "use-clean-install" => OptionValue::Bool(false),
            "remove-after-install" => OptionValue::Str("none".into()),
            "persistent-data-file" => {
                OptionValue::Str("~/.local/state/kde-builder-data.json".into())
            }
            _ => return None,
        };
        Some(v)
    }

    /// Layered option read.
    ///
    /// Precedence, highest first: command-line option targeted at the
    /// project; sticky global; the project's own (group-merged) value; the
    /// global layer; the built-in default. Appending options instead join
    /// the global and most-local values with a single space.
    pub fn resolve_option(&self, project: Option<&Project>, key: &str) -> Option<OptionValue> {
        let cmdline = project
            .and_then(|p| self.cmdline_per_project.get(&p.name))
            .and_then(|s| s.get(key));
        let own = project.and_then(|p| p.options.get(key));
        let global = self.global.get(key);

        if options::is_appending(key) {
            let local = cmdline.or(own).map(|v| v.as_str());
            let global = global.map(|v| v.as_str());
            return match (global, local) {
                (Some(g), Some(l)) if !g.is_empty() && !l.is_empty() => {
                    Some(OptionValue::Str(format!("{g} {l}")))
                }
                (Some(g), Some(l)) => Some(OptionValue::Str(format!("{g}{l}"))),
                (Some(g), None) => Some(OptionValue::Str(g)),
                (None, Some(l)) => Some(OptionValue::Str(l)),
                (None, None) => Self::builtin_default(key),
            };
        }

        if let Some(v) = cmdline {
            return Some(v.clone());
        }
        if options::is_sticky(key) {
            if let Some(v) = global {
                return Some(v.clone());
            }
        }
        if let Some(v) = own {
            return Some(v.clone());
        }
        if let Some(v) = global {
            return Some(v.clone());
        }
        Self::builtin_default(key)
    }

    pub fn option_str(&self, project: Option<&Project>, key: &str) -> String {
        self.resolve_option(project, key)
            .map(|v| v.as_str())
            .unwrap_or_default()
    }

    pub fn option_bool(&self, project: Option<&Project>, key: &str) -> bool {
        self.resolve_option(project, key)
            .is_some_and(|v| v.is_truthy())
    }

    pub fn pretending(&self) -> bool {
        self.option_bool(None, "pretend")
    }

    /// Resolve `num-cores` / `num-cores-low-mem` / `taskset-cpu-list`
    /// honoring the `auto` sentinel. A configured `0` coerces to 4.
    pub fn resolve_num_cores(&self, project: Option<&Project>, key: &str) -> u32 {
        let raw = self.option_str(project, key);
        if raw == "auto" {
            return if key == "num-cores-low-mem" {
                options::auto_num_cores_low_mem()
            } else {
                options::auto_num_cores()
            };
        }
        match raw.parse::<u32>() {
            Ok(0) | Err(_) => 4,
            Ok(n) => n,
        }
    }

    /// Absolute path of a directory-valued global option.
    pub fn absolute_path(&self, project: Option<&Project>, key: &str) -> PathBuf {
        PathBuf::from(self.option_str(project, key))
    }

    /// Source checkout directory for a project, honoring `directory-layout`.
    pub fn source_dir_for(&self, project: &Project) -> PathBuf {
        let base = self.absolute_path(Some(project), "source-dir");
        base.join(self.layout_fragment(project))
    }

    /// Build directory for a project. `dest-dir` overrides the leaf name and
    /// supports `${MODULE}` substitution.
    pub fn build_dir_for(&self, project: &Project) -> PathBuf {
        let base = self.absolute_path(Some(project), "build-dir");
        base.join(self.dest_fragment(project))
    }

    /// Installation prefix, with `${MODULE}` substitution in `install-dir`.
    pub fn install_prefix_for(&self, project: &Project) -> PathBuf {
        let raw = self.option_str(Some(project), "install-dir");
        PathBuf::from(raw.replace("${MODULE}", &project.name))
    }

    fn layout_fragment(&self, project: &Project) -> String {
        match self.option_str(Some(project), "directory-layout").as_str() {
            "flat" => project.name.clone(),
            "metadata" => project.full_project_path(),
            // "invent": mirror the forge's on-disk path when known.
            _ => project
                .full_path
                .clone()
                .unwrap_or_else(|| project.name.clone()),
        }
    }

    fn dest_fragment(&self, project: &Project) -> String {
        let dest = self.option_str(Some(project), "dest-dir");
        if dest.is_empty() {
            self.layout_fragment(project)
        } else {
            dest.replace("${MODULE}", &project.name)
        }
    }

    pub fn note_failure(&mut self, project: &str, phase: Phase, error_log: Option<PathBuf>) {
        self.failures
            .push((project.to_string(), ProjectFailure { phase, error_log }));
    }

    pub fn failure_for(&self, project: &str) -> Option<&ProjectFailure> {
        self.failures
            .iter()
            .find(|(name, _)| name == project)
            .map(|(_, f)| f)
    }

    /// Environment for a project's child processes.
    ///
    /// PATH is prepended with `binpath` and the installation `bin` dir; the
    /// usual discovery variables are prepended with the install prefix; then
    /// `set-env` entries apply verbatim.
    pub fn build_environment(&self, project: &Project) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = std::env::vars().collect();
        let prefix = self.install_prefix_for(project);

        let mut path_prepend: Vec<String> = Vec::new();
        let binpath = self.option_str(Some(project), "binpath");
        if !binpath.is_empty() {
            path_prepend.push(binpath);
        }
        path_prepend.push(prefix.join("bin").display().to_string());
        prepend_path_var(&mut env, "PATH", &path_prepend);

        prepend_path_var(
            &mut env,
            "LD_LIBRARY_PATH",
            &[prefix.join("lib").display().to_string()],
        );
        prepend_path_var(
            &mut env,
            "PKG_CONFIG_PATH",
            &[prefix.join("lib/pkgconfig").display().to_string()],
        );
        prepend_path_var(&mut env, "CMAKE_PREFIX_PATH", &[prefix.display().to_string()]);
        prepend_path_var(
            &mut env,
            "CMAKE_MODULE_PATH",
            &[prefix.join("lib/cmake").display().to_string()],
        );
        prepend_path_var(
            &mut env,
            "QT_PLUGIN_PATH",
            &[prefix.join("lib/plugins").display().to_string()],
        );
        prepend_path_var(
            &mut env,
            "XDG_DATA_DIRS",
            &[prefix.join("share").display().to_string()],
        );

        if let Some(OptionValue::Env(map)) = self.resolve_option(Some(project), "set-env") {
            for (k, v) in map {
                env.insert(k, v);
            }
        }
        env
    }
}

fn prepend_path_var(env: &mut BTreeMap<String, String>, var: &str, entries: &[String]) {
    let old = env.get(var).cloned().unwrap_or_default();
    let mut parts: Vec<String> = entries.to_vec();
    if !old.is_empty() {
        parts.push(old);
    }
    env.insert(var.to_string(), parts.join(":"));
}

/// Convenience for tests and the query mode: render a resolved option map.
pub fn describe_project(ctx: &BuildContext, project: &Project) -> Vec<(String, String)> {
    vec![
        ("source-dir".into(), ctx.source_dir_for(project).display().to_string()),
        ("build-dir".into(), ctx.build_dir_for(project).display().to_string()),
        (
            "install-dir".into(),
            ctx.install_prefix_for(project).display().to_string(),
        ),
        (
            "repository".into(),
            project
                .options
                .get("#resolved-repository")
                .map(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| ctx.option_str(Some(project), "repository")),
        ),
        (
            "branch".into(),
            project.requested_branch().unwrap_or_default(),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn ctx_with_global(pairs: &[(&str, OptionValue)]) -> BuildContext {
        let mut ctx = BuildContext::new(PathBuf::from("/tmp/cfg"));
        for (k, v) in pairs {
            ctx.global.set(k, v.clone()).expect("set global");
        }
        ctx
    }

    fn project_with(pairs: &[(&str, OptionValue)]) -> Project {
        let mut p = Project::new("kcalc", 7);
        for (k, v) in pairs {
            p.options.set(k, v.clone()).expect("set project");
        }
        p
    }

    #[test]
    fn project_option_overrides_global() {
        let ctx = ctx_with_global(&[("branch", OptionValue::Str("master".into()))]);
        let p = project_with(&[("branch", OptionValue::Str("release/24.02".into()))]);
        assert_eq!(ctx.option_str(Some(&p), "branch"), "release/24.02");
    }

    #[test]
    fn cmdline_per_project_beats_everything() {
        let mut ctx = ctx_with_global(&[("branch", OptionValue::Str("master".into()))]);
        let p = project_with(&[("branch", OptionValue::Str("release/24.02".into()))]);
        let mut cmdline = OptionsStore::new();
        cmdline
            .set("branch", OptionValue::Str("work/fix".into()))
            .expect("set");
        ctx.cmdline_per_project.insert("kcalc".into(), cmdline);
        assert_eq!(ctx.option_str(Some(&p), "branch"), "work/fix");
    }

    #[test]
    fn sticky_global_overrides_project_value() {
        let ctx = ctx_with_global(&[("colorful-output", OptionValue::Bool(false))]);
        let p = project_with(&[("colorful-output", OptionValue::Bool(true))]);
        assert!(!ctx.option_bool(Some(&p), "colorful-output"));
    }

    #[test]
    fn appending_options_concatenate_with_one_space() {
        let ctx = ctx_with_global(&[(
            "cmake-options",
            OptionValue::Str("-DCMAKE_BUILD_TYPE=Debug".into()),
        )]);
        let p = project_with(&[("cmake-options", OptionValue::Str("-DFOO=ON".into()))]);
        assert_eq!(
            ctx.option_str(Some(&p), "cmake-options"),
            "-DCMAKE_BUILD_TYPE=Debug -DFOO=ON"
        );
    }

    #[test]
    fn builtin_defaults_fill_the_bottom_layer() {
        let ctx = BuildContext::default();
        assert!(ctx.option_bool(None, "include-dependencies"));
        assert!(ctx.option_bool(None, "install-after-build"));
        assert_eq!(ctx.option_str(None, "directory-layout"), "invent");
    }

    #[test]
    fn num_cores_zero_coerces_to_four() {
        let ctx = ctx_with_global(&[("num-cores", OptionValue::Str("0".into()))]);
        assert_eq!(ctx.resolve_num_cores(None, "num-cores"), 4);
    }

    #[test]
    fn num_cores_auto_resolves_to_at_least_one() {
        let ctx = ctx_with_global(&[("num-cores", OptionValue::Str("auto".into()))]);
        assert!(ctx.resolve_num_cores(None, "num-cores") >= 1);
    }

    #[test]
    fn install_prefix_substitutes_module_name() {
        let ctx = ctx_with_global(&[(
            "install-dir",
            OptionValue::Str("/opt/kde/${MODULE}".into()),
        )]);
        let p = project_with(&[]);
        assert_eq!(
            ctx.install_prefix_for(&p),
            PathBuf::from("/opt/kde/kcalc")
        );
    }

    #[test]
    fn directory_layouts_differ() {
        let mut p = project_with(&[]);
        p.full_path = Some("utilities/kcalc".into());

        let flat = ctx_with_global(&[
            ("source-dir", OptionValue::Str("/src".into())),
            ("directory-layout", OptionValue::Str("flat".into())),
        ]);
        assert_eq!(flat.source_dir_for(&p), PathBuf::from("/src/kcalc"));

        let invent = ctx_with_global(&[("source-dir", OptionValue::Str("/src".into()))]);
        assert_eq!(
            invent.source_dir_for(&p),
            PathBuf::from("/src/utilities/kcalc")
        );
    }

    #[test]
    fn build_environment_prepends_prefix_paths() {
        let ctx = ctx_with_global(&[("install-dir", OptionValue::Str("/opt/kde".into()))]);
        let p = project_with(&[]);
        let env = ctx.build_environment(&p);
        assert!(env.get("PATH").expect("PATH").starts_with("/opt/kde/bin"));
        assert!(
            env.get("CMAKE_PREFIX_PATH")
                .expect("CMAKE_PREFIX_PATH")
                .starts_with("/opt/kde")
        );
    }

    #[test]
    fn set_env_entries_apply_verbatim() {
        let mut ctx = BuildContext::default();
        ctx.global
            .set("set-env", OptionValue::Str("CC clang".into()))
            .expect("set");
        let p = project_with(&[]);
        let env = ctx.build_environment(&p);
        assert_eq!(env.get("CC").map(String::as_str), Some("clang"));
    }

    proptest! {
        // P9: the layered read matches the documented precedence for plain
        // string options.
        #[test]
        fn option_layering_matches_precedence(
            global in prop::option::of("[a-z]{1,6}"),
            own in prop::option::of("[a-z]{1,6}"),
            cmdline in prop::option::of("[a-z]{1,6}"),
        ) {
            let mut ctx = BuildContext::default();
            if let Some(g) = &global {
                ctx.global.set("branch", OptionValue::Str(g.clone())).expect("g");
            }
            let mut p = Project::new("x", 1);
            if let Some(o) = &own {
                p.options.set("branch", OptionValue::Str(o.clone())).expect("o");
            }
            if let Some(c) = &cmdline {
                let mut store = OptionsStore::new();
                store.set("branch", OptionValue::Str(c.clone())).expect("c");
                ctx.cmdline_per_project.insert("x".into(), store);
            }

            let got = ctx.resolve_option(Some(&p), "branch").map(|v| v.as_str());
            let want = cmdline.or(own).or(global);
            prop_assert_eq!(got, want);
        }
    }
}
