//! Flavor for trees that ship a `bootstrap` script in front of CMake.

use anyhow::Result;

use super::{
    BuildEnv, BuildFlavor, BuildProgress, apply_parallelism, ensure_exit_ok, looks_like_warning,
    mkdir_build_dir, run_make_target,
};

pub struct CmakeBootstrap;

impl BuildFlavor for CmakeBootstrap {
    fn name(&self) -> &'static str {
        "cmake-bootstrap"
    }

    fn required_programs(&self, _env: &BuildEnv) -> Vec<&'static str> {
        vec!["cmake"]
    }

    fn configured_module_file_name(&self) -> &'static str {
        "Makefile"
    }

    fn configure(&self, env: &BuildEnv) -> Result<()> {
        mkdir_build_dir(env)?;
        let mut argv = vec![
            env.source_dir.join("bootstrap").display().to_string(),
            format!("--prefix={}", env.install_prefix.display()),
        ];
        argv.extend(env.configure_flags.iter().cloned());
        let code = env.run("bootstrap", &argv, &env.build_dir)?;
        ensure_exit_ok(&env.project, "bootstrap", code)
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
        let code = run_make_target(env, "make", "test", "test")?;
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
