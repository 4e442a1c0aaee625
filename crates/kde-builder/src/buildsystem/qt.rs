//! Qt supermodule flavor: the `configure` script Qt ships, then make.
//!
//! Selected only for projects that came from a Qt supermodule group, never
//! by tree sniffing (Qt trees also carry CMakeLists.txt).

use anyhow::Result;

use super::{
    BuildEnv, BuildFlavor, BuildProgress, apply_parallelism, ensure_exit_ok, looks_like_warning,
    mkdir_build_dir, run_make_target,
};

pub struct QtConfigure;

impl BuildFlavor for QtConfigure {
    fn name(&self) -> &'static str {
        "qt"
    }

    fn required_programs(&self, _env: &BuildEnv) -> Vec<&'static str> {
        vec!["make"]
    }

    fn configured_module_file_name(&self) -> &'static str {
        "Makefile"
    }

    fn configure(&self, env: &BuildEnv) -> Result<()> {
        mkdir_build_dir(env)?;
        let mut argv = vec![
            env.source_dir.join("configure").display().to_string(),
            "-prefix".to_string(),
            env.install_prefix.display().to_string(),
            // Qt's configure stops to ask otherwise.
            "-opensource".to_string(),
            "-confirm-license".to_string(),
        ];
        argv.extend(env.configure_flags.iter().cloned());
        let code = env.run("configure", &argv, &env.build_dir)?;
        ensure_exit_ok(&env.project, "qt configure", code)
    }

    fn build(&self, env: &BuildEnv, on_line: &mut dyn FnMut(&str)) -> Result<BuildProgress> {
        let argv = apply_parallelism(env, vec!["make".to_string()], false);
        let mut warnings = 0u32;
        let mut watch = |line: &str| {
            if looks_like_warning(line) {
                warnings += 1;
            }
            on_line(line);
        };
        let code = env.run_watching("build", &argv, &env.build_dir, &mut watch)?;
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
