//! Meson flavor.

use anyhow::Result;

use super::{
    BuildEnv, BuildFlavor, BuildProgress, apply_parallelism, ensure_exit_ok, looks_like_warning,
    mkdir_build_dir,
};

pub struct Meson;

impl BuildFlavor for Meson {
    fn name(&self) -> &'static str {
        "meson"
    }

    fn required_programs(&self, _env: &BuildEnv) -> Vec<&'static str> {
        vec!["meson", "ninja"]
    }

    fn supports_auto_parallelism(&self) -> bool {
        true
    }

    fn configured_module_file_name(&self) -> &'static str {
        "build.ninja"
    }

    fn configure(&self, env: &BuildEnv) -> Result<()> {
        mkdir_build_dir(env)?;
        let mut argv = vec![
            "meson".to_string(),
            "setup".to_string(),
            env.build_dir.display().to_string(),
            env.source_dir.display().to_string(),
            format!("--prefix={}", env.install_prefix.display()),
        ];
        argv.extend(env.meson_options.iter().cloned());
        let code = env.run("meson-setup", &argv, &env.source_dir)?;
        ensure_exit_ok(&env.project, "meson setup", code)
    }

    fn build(&self, env: &BuildEnv, on_line: &mut dyn FnMut(&str)) -> Result<BuildProgress> {
        let argv = apply_parallelism(env, vec!["ninja".to_string()], true);
        let mut warnings = 0u32;
        let mut work_done = false;
        let mut watch = |line: &str| {
            if looks_like_warning(line) {
                warnings += 1;
            }
            if !line.contains("no work to do") {
                work_done = true;
            }
            on_line(line);
        };
        let code = env.run_watching("build", &argv, &env.build_dir, &mut watch)?;
        Ok(BuildProgress {
            was_successful: code == 0,
            warnings,
            work_done,
        })
    }

    fn run_testsuite(&self, env: &BuildEnv) -> Result<()> {
        let argv = vec!["meson".to_string(), "test".to_string()];
        let code = env.run("test", &argv, &env.build_dir)?;
        ensure_exit_ok(&env.project, "test suite", code)
    }

    fn install(&self, env: &BuildEnv) -> Result<()> {
        let mut argv = env.make_install_prefix.clone();
        argv.extend(["meson".to_string(), "install".to_string()]);
        let code = env.run("install", &argv, &env.build_dir)?;
        ensure_exit_ok(&env.project, "install", code)
    }

    fn uninstall(&self, env: &BuildEnv) -> Result<()> {
        let mut argv = env.make_install_prefix.clone();
        argv.extend(["ninja".to_string(), "uninstall".to_string()]);
        let code = env.run("uninstall", &argv, &env.build_dir)?;
        ensure_exit_ok(&env.project, "uninstall", code)
    }
}
