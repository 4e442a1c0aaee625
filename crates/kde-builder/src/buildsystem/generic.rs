//! Fallback flavor: plain `make`, or whatever `custom-build-command` says.

use anyhow::Result;

use super::{
    BuildEnv, BuildFlavor, BuildProgress, apply_parallelism, ensure_exit_ok, looks_like_warning,
    mkdir_build_dir, run_make_target,
};

pub struct Generic;

impl Generic {
    fn tool(&self, env: &BuildEnv) -> String {
        env.custom_build_command
            .clone()
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| "make".to_string())
    }
}

impl BuildFlavor for Generic {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn required_programs(&self, _env: &BuildEnv) -> Vec<&'static str> {
        vec!["make"]
    }

    fn configured_module_file_name(&self) -> &'static str {
        "Makefile"
    }

    fn configure(&self, env: &BuildEnv) -> Result<()> {
        // Nothing to configure; the build runs straight from the source
        // tree (or a user-prepared build dir).
        mkdir_build_dir(env)
    }

    fn build(&self, env: &BuildEnv, on_line: &mut dyn FnMut(&str)) -> Result<BuildProgress> {
        let tool = self.tool(env);
        let custom = env
            .custom_build_command
            .as_ref()
            .is_some_and(|c| !c.is_empty());
        // A custom command owns its own parallelism flags.
        let argv = apply_parallelism(env, vec![tool], custom);

        let cwd = if env.source_dir.join("Makefile").exists() {
            &env.source_dir
        } else {
            &env.build_dir
        };
        let mut warnings = 0u32;
        let mut watch = |line: &str| {
            if looks_like_warning(line) {
                warnings += 1;
            }
            on_line(line);
        };
        let code = env.run_watching("build", &argv, cwd, &mut watch)?;
        Ok(BuildProgress {
            was_successful: code == 0,
            warnings,
            work_done: true,
        })
    }

    fn run_testsuite(&self, env: &BuildEnv) -> Result<()> {
        let code = run_make_target(env, "make", "check", "test")?;
        ensure_exit_ok(&env.project, "test suite", code)
    }

    fn install(&self, env: &BuildEnv) -> Result<()> {
        let code = run_make_target(env, "make", "install", "install")?;
        ensure_exit_ok(&env.project, "install", code)
    }

    fn uninstall(&self, env: &BuildEnv) -> Result<()> {
        let code = run_make_target(env, "make", "uninstall", "uninstall")?;
        ensure_exit_ok(&env.project, "uninstall", code)
    }
}
