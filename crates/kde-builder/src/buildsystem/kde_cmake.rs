//! CMake flavor used by catalog projects.

use anyhow::Result;

use super::{
    BuildEnv, BuildFlavor, BuildProgress, apply_parallelism, ensure_exit_ok, looks_like_warning,
    mkdir_build_dir, run_make_target,
};

pub struct KdeCmake;

impl KdeCmake {
    fn build_tool(&self, env: &BuildEnv) -> &'static str {
        if env.cmake_generator == "Ninja" {
            "ninja"
        } else {
            "make"
        }
    }

    fn uses_ninja(&self, env: &BuildEnv) -> bool {
        env.cmake_generator == "Ninja"
    }
}

impl BuildFlavor for KdeCmake {
    fn name(&self) -> &'static str {
        "kde-cmake"
    }

    fn required_programs(&self, env: &BuildEnv) -> Vec<&'static str> {
        if self.uses_ninja(env) {
            vec!["cmake", "ninja"]
        } else {
            vec!["cmake"]
        }
    }

    fn supports_auto_parallelism(&self) -> bool {
        // Resolved per-generator in build(); ninja is the default.
        true
    }

    fn configured_module_file_name(&self) -> &'static str {
        "cmake_install.cmake"
    }

    fn configure(&self, env: &BuildEnv) -> Result<()> {
        mkdir_build_dir(env)?;

        let mut argv = vec![
            "cmake".to_string(),
            "-B".to_string(),
            env.build_dir.display().to_string(),
            "-S".to_string(),
            env.source_dir.display().to_string(),
            "-G".to_string(),
            env.cmake_generator.clone(),
            format!("-DCMAKE_INSTALL_PREFIX={}", env.install_prefix.display()),
        ];
        if !env.cxxflags.is_empty() {
            argv.push(format!("-DCMAKE_CXX_FLAGS:STRING={}", env.cxxflags));
        }
        argv.extend(env.cmake_options.iter().cloned());

        let code = env.run("cmake", &argv, &env.build_dir)?;
        ensure_exit_ok(&env.project, "cmake configure", code)
    }

    fn build(&self, env: &BuildEnv, on_line: &mut dyn FnMut(&str)) -> Result<BuildProgress> {
        let tool = self.build_tool(env);
        let argv = apply_parallelism(env, vec![tool.to_string()], self.uses_ninja(env));

        let mut warnings = 0u32;
        let mut work_done = false;
        let mut watch = |line: &str| {
            if looks_like_warning(line) {
                warnings += 1;
            }
            // Ninja reports "no work to do"; make reports "Nothing to be
            // done". Anything else on stdout means the tool worked.
            if !line.contains("no work to do") && !line.contains("Nothing to be done") {
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
        let argv = vec![
            "ctest".to_string(),
            "--output-on-failure".to_string(),
            "--test-dir".to_string(),
            env.build_dir.display().to_string(),
        ];
        let code = env.run("test", &argv, &env.build_dir)?;
        ensure_exit_ok(&env.project, "test suite", code)
    }

    fn install(&self, env: &BuildEnv) -> Result<()> {
        let code = run_make_target(env, self.build_tool(env), "install", "install")?;
        ensure_exit_ok(&env.project, "install", code)
    }

    fn uninstall(&self, env: &BuildEnv) -> Result<()> {
        let code = run_make_target(env, self.build_tool(env), "uninstall", "uninstall")?;
        ensure_exit_ok(&env.project, "uninstall", code)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::super::testutil::pretend_env;
    use super::*;

    #[test]
    fn generator_selects_the_build_tool() {
        let td = tempdir().expect("tempdir");
        let mut env = pretend_env(&td);
        assert_eq!(KdeCmake.build_tool(&env), "ninja");
        env.cmake_generator = "Unix Makefiles".into();
        assert_eq!(KdeCmake.build_tool(&env), "make");
    }

    #[test]
    fn required_programs_follow_the_generator() {
        let td = tempdir().expect("tempdir");
        let mut env = pretend_env(&td);
        assert_eq!(KdeCmake.required_programs(&env), vec!["cmake", "ninja"]);
        env.cmake_generator = "Unix Makefiles".into();
        assert_eq!(KdeCmake.required_programs(&env), vec!["cmake"]);
    }

    #[test]
    fn pretend_configure_and_build_succeed_without_tools() {
        let td = tempdir().expect("tempdir");
        let env = pretend_env(&td);
        KdeCmake.configure(&env).expect("configure");
        let progress = KdeCmake.build(&env, &mut |_| {}).expect("build");
        assert!(progress.was_successful);
    }
}
