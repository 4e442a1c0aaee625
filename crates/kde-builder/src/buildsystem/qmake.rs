//! qmake project flavor (`*.pro` trees).

use std::path::PathBuf;

use anyhow::{Result, bail};

use super::{
    BuildEnv, BuildFlavor, BuildProgress, apply_parallelism, ensure_exit_ok, looks_like_warning,
    mkdir_build_dir, run_make_target,
};

pub struct Qmake;

impl Qmake {
    fn project_file(&self, env: &BuildEnv) -> Result<PathBuf> {
        let mut candidates: Vec<PathBuf> = std::fs::read_dir(&env.source_dir)
            .ok()
            .into_iter()
            .flatten()
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "pro"))
            .collect();
        candidates.sort();
        match candidates.into_iter().next() {
            Some(path) => Ok(path),
            None if env.pretend => Ok(env.source_dir.join(format!("{}.pro", env.project))),
            None => bail!("{}: no .pro file found in {}", env.project, env.source_dir.display()),
        }
    }
}

impl BuildFlavor for Qmake {
    fn name(&self) -> &'static str {
        "qmake"
    }

    fn required_programs(&self, _env: &BuildEnv) -> Vec<&'static str> {
        vec!["qmake"]
    }

    fn configured_module_file_name(&self) -> &'static str {
        "Makefile"
    }

    fn configure(&self, env: &BuildEnv) -> Result<()> {
        mkdir_build_dir(env)?;
        let pro = self.project_file(env)?;
        let mut argv = vec!["qmake".to_string(), pro.display().to_string()];
        argv.extend(env.qmake_options.iter().cloned());
        argv.push(format!("PREFIX={}", env.install_prefix.display()));
        let code = env.run("qmake", &argv, &env.build_dir)?;
        ensure_exit_ok(&env.project, "qmake", code)
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
