//! Per-entity option store with typed values and merge semantics.
//!
//! Every configurable entity (the build context, each project, each group
//! or override while it still exists) owns one [`OptionsStore`]. The store
//! itself only gets and sets; the layered read precedence across entities
//! lives in [`crate::context::BuildContext::resolve_option`].

use std::collections::BTreeMap;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::error::KbError;

/// A single option value.
///
/// Options are stringly-keyed but not stringly-typed: the registry below
/// declares the expected shape for every known option and `set` rejects
/// mismatches with [`KbError::BadOption`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Str(String),
    /// Nested `KEY -> value` map, used by `set-env`.
    Env(BTreeMap<String, String>),
    /// Nested `alias -> URL base` map, used by `git-repository-base`.
    RepoBase(BTreeMap<String, String>),
    /// Paths of the config files that defined an entity (`#defined-at`).
    DefinedAt(Vec<String>),
}

impl OptionValue {
    /// Everything is truthy except `false`, `0`, and the empty string.
    pub fn is_truthy(&self) -> bool {
        match self {
            OptionValue::Bool(b) => *b,
            OptionValue::Int(n) => *n != 0,
            OptionValue::Str(s) => !s.is_empty() && s != "false",
            OptionValue::Env(m) => !m.is_empty(),
            OptionValue::RepoBase(m) => !m.is_empty(),
            OptionValue::DefinedAt(v) => !v.is_empty(),
        }
    }

    /// Render as a flat string, the common case for command construction.
    pub fn as_str(&self) -> String {
        match self {
            OptionValue::Bool(b) => b.to_string(),
            OptionValue::Int(n) => n.to_string(),
            OptionValue::Str(s) => s.clone(),
            _ => String::new(),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            OptionValue::Int(n) => Some(*n),
            OptionValue::Str(s) => s.trim().parse().ok(),
            OptionValue::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_env(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            OptionValue::Env(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_repo_base(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            OptionValue::RepoBase(m) => Some(m),
            _ => None,
        }
    }
}

impl From<&str> for OptionValue {
    fn from(s: &str) -> Self {
        OptionValue::Str(s.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(s: String) -> Self {
        OptionValue::Str(s)
    }
}

impl From<bool> for OptionValue {
    fn from(b: bool) -> Self {
        OptionValue::Bool(b)
    }
}

impl From<i64> for OptionValue {
    fn from(n: i64) -> Self {
        OptionValue::Int(n)
    }
}

/// Expected value shape for a known option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    Bool,
    Int,
    Str,
    Env,
    RepoBase,
    List,
}

/// Merge behavior of a known option across the global/project layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionCategory {
    /// Project value overrides the global value.
    Plain,
    /// Global value wins even when a project sets its own.
    Sticky,
    /// Global and project values concatenate with a single space.
    Appending,
}

pub struct OptionSpec {
    pub name: &'static str,
    pub kind: OptionKind,
    pub category: OptionCategory,
}

macro_rules! opt {
    ($name:literal, $kind:ident) => {
        OptionSpec {
            name: $name,
            kind: OptionKind::$kind,
            category: OptionCategory::Plain,
        }
    };
    ($name:literal, $kind:ident, $cat:ident) => {
        OptionSpec {
            name: $name,
            kind: OptionKind::$kind,
            category: OptionCategory::$cat,
        }
    };
}

/// The closed set of recognized options. Setting anything else fails the
/// config parse.
pub static OPTION_REGISTRY: &[OptionSpec] = &[
    opt!("async", Bool),
    opt!("binpath", Str),
    opt!("branch", Str),
    opt!("branch-group", Str),
    opt!("build-dir", Str),
    opt!("build-when-unchanged", Bool),
    opt!("cmake-generator", Str),
    opt!("cmake-options", Str, Appending),
    opt!("cmake-toolchain", Str),
    opt!("colorful-output", Bool, Sticky),
    opt!("compile-commands-export", Bool),
    opt!("compile-commands-linking", Bool),
    opt!("configure-flags", Str, Appending),
    opt!("custom-build-command", Str),
    opt!("cxxflags", Str, Appending),
    opt!("dest-dir", Str),
    opt!("directory-layout", Str, Sticky),
    opt!("git-repository-base", RepoBase),
    opt!("git-user", Str),
    opt!("ignore-projects", List),
    opt!("include-dependencies", Bool),
    opt!("install-after-build", Bool),
    opt!("install-dir", Str),
    opt!("libname", Str),
    opt!("libpath", Str),
    opt!("log-dir", Str),
    opt!("make-install-prefix", Str),
    opt!("make-options", Str),
    opt!("meson-options", Str),
    opt!("no-metadata", Bool),
    opt!("no-src", Bool),
    opt!("num-cores", Str),
    opt!("num-cores-low-mem", Str),
    opt!("override-build-system", Str),
    opt!("persistent-data-file", Str),
    opt!("pretend", Bool, Sticky),
    opt!("purge-old-logs", Bool, Sticky),
    opt!("qmake-options", Str),
    opt!("qt-install-dir", Str),
    opt!("remove-after-install", Str),
    opt!("repository", Str),
    opt!("revision", Str),
    opt!("commit", Str),
    opt!("run-tests", Bool),
    opt!("set-env", Env),
    opt!("source-dir", Str),
    opt!("stop-on-failure", Bool, Sticky),
    opt!("tag", Str),
    opt!("taskset-cpu-list", Str),
    opt!("use-clean-install", Bool),
    opt!("use-inactive-projects", Bool, Sticky),
    opt!("use-projects", List),
];

/// Options whose names begin with `#` are internal per-run flags
/// (`#last-build-dir`, `#resolved-repository`, ...) and bypass the registry.
fn is_internal(name: &str) -> bool {
    name.starts_with('#')
}

pub fn lookup_spec(name: &str) -> Option<&'static OptionSpec> {
    OPTION_REGISTRY.iter().find(|s| s.name == name)
}

pub fn is_sticky(name: &str) -> bool {
    lookup_spec(name).is_some_and(|s| s.category == OptionCategory::Sticky)
}

pub fn is_appending(name: &str) -> bool {
    lookup_spec(name).is_some_and(|s| s.category == OptionCategory::Appending)
}

/// A bag of option values for one entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptionsStore {
    options: BTreeMap<String, OptionValue>,
}

impl OptionsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, key: &str) -> bool {
        self.options.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.options.get(key)
    }

    pub fn remove(&mut self, key: &str) {
        self.options.remove(key);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &OptionValue)> {
        self.options.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    /// Set an option, enforcing the registry's value shape.
    ///
    /// `set-env` appends to the nested map rather than replacing it, and
    /// `git-repository-base` accepts either a map (merged) or an
    /// `alias URL` string form.
    pub fn set(&mut self, name: &str, value: OptionValue) -> Result<(), KbError> {
        if name == "set-env" {
            return self.merge_set_env(value);
        }
        if name == "git-repository-base" {
            return self.merge_repo_base(value);
        }

        if !is_internal(name) {
            let spec = lookup_spec(name)
                .ok_or_else(|| KbError::bad_option(name, "unrecognized option name"))?;
            verify_kind(name, spec.kind, &value)?;
        }
        self.options.insert(name.to_string(), value);
        Ok(())
    }

    /// Set without registry validation. For internal flags and tests.
    pub fn set_unchecked(&mut self, name: &str, value: OptionValue) {
        self.options.insert(name.to_string(), value);
    }

    /// Merge every option of `other` into `self`, replacing existing values
    /// (except the usual `set-env` / `git-repository-base` accumulation).
    pub fn merge_from(&mut self, other: &OptionsStore) -> Result<(), KbError> {
        for (name, value) in &other.options {
            self.set(name, value.clone())?;
        }
        Ok(())
    }

    fn merge_set_env(&mut self, value: OptionValue) -> Result<(), KbError> {
        let entry = self
            .options
            .entry("set-env".to_string())
            .or_insert_with(|| OptionValue::Env(BTreeMap::new()));
        let OptionValue::Env(map) = entry else {
            return Err(KbError::bad_option("set-env", "internal value corruption"));
        };

        match value {
            OptionValue::Env(new) => {
                map.extend(new);
                Ok(())
            }
            OptionValue::Str(s) => match s.split_once(' ') {
                Some((var, val)) => {
                    map.insert(var.to_string(), val.trim_start().to_string());
                    Ok(())
                }
                None => Err(KbError::bad_option(
                    "set-env",
                    format!("expected \"VAR value\", got \"{s}\""),
                )),
            },
            _ => Err(KbError::bad_option(
                "set-env",
                "expected a mapping or a \"VAR value\" string",
            )),
        }
    }

    fn merge_repo_base(&mut self, value: OptionValue) -> Result<(), KbError> {
        let entry = self
            .options
            .entry("git-repository-base".to_string())
            .or_insert_with(|| OptionValue::RepoBase(BTreeMap::new()));
        let OptionValue::RepoBase(map) = entry else {
            return Err(KbError::bad_option(
                "git-repository-base",
                "internal value corruption",
            ));
        };

        match value {
            OptionValue::RepoBase(new) | OptionValue::Env(new) => {
                map.extend(new);
                Ok(())
            }
            OptionValue::Str(s) => match s.split_once(char::is_whitespace) {
                Some((alias, url)) if !url.trim().is_empty() => {
                    map.insert(alias.to_string(), url.trim().to_string());
                    Ok(())
                }
                _ => Err(KbError::bad_option(
                    "git-repository-base",
                    format!("expected \"alias URL\", got \"{s}\""),
                )),
            },
            _ => Err(KbError::bad_option(
                "git-repository-base",
                "expected a mapping or an \"alias URL\" string",
            )),
        }
    }
}

fn verify_kind(name: &str, kind: OptionKind, value: &OptionValue) -> Result<(), KbError> {
    let ok = match kind {
        OptionKind::Bool => matches!(value, OptionValue::Bool(_)),
        OptionKind::Int => matches!(value, OptionValue::Int(_) | OptionValue::Str(_)),
        OptionKind::Str => matches!(
            value,
            OptionValue::Str(_) | OptionValue::Int(_) | OptionValue::Bool(_)
        ),
        OptionKind::Env => matches!(value, OptionValue::Env(_)),
        OptionKind::RepoBase => matches!(value, OptionValue::RepoBase(_)),
        OptionKind::List => matches!(value, OptionValue::DefinedAt(_)),
    };
    if ok {
        Ok(())
    } else {
        Err(KbError::bad_option(
            name,
            format!("value has the wrong type for this option (expected {kind:?})"),
        ))
    }
}

/// Expand `${name}` references against the global option map, iteratively,
/// and `~` at the start of a path-like value to `$HOME`.
///
/// A value that after expansion is exactly `true` or `false` is converted
/// by the caller into a boolean; this function only does text substitution.
pub fn expand_value(raw: &str, globals: &OptionsStore) -> Result<String> {
    let mut out = raw.to_string();
    // Bounded iteration so a self-referential value cannot loop forever.
    for _ in 0..16 {
        let Some(start) = out.find("${") else { break };
        let Some(rel_end) = out[start..].find('}') else {
            bail!("unterminated ${{...}} reference in \"{raw}\"");
        };
        let end = start + rel_end;
        let name = &out[start + 2..end];
        let replacement = globals
            .get(name)
            .map(|v| v.as_str())
            .or_else(|| std::env::var(name).ok())
            .unwrap_or_default();
        out.replace_range(start..=end, &replacement);
    }

    if out == "~" || out.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            out = format!("{}{}", home.display(), &out[1..]);
        }
    }
    Ok(out)
}

/// Interpret an expanded string as the most specific option value.
pub fn coerce_scalar(expanded: String) -> OptionValue {
    match expanded.as_str() {
        "true" => OptionValue::Bool(true),
        "false" => OptionValue::Bool(false),
        _ => OptionValue::Str(expanded),
    }
}

/// `auto` resolution for `num-cores`: 80% of the available cores, minimum 1.
pub fn auto_num_cores() -> u32 {
    let ncpu = num_cpus::get() as u32;
    ((ncpu * 4) / 5).max(1)
}

/// `auto` resolution for `num-cores-low-mem`: one job per ~2 GiB of RAM,
/// bounded by the core count, minimum 1.
pub fn auto_num_cores_low_mem() -> u32 {
    let ncpu = num_cpus::get() as u32;
    let jobs = total_memory_kib()
        .map(|kib| (kib / 2_000_000) as u32)
        .unwrap_or(ncpu);
    jobs.clamp(1, ncpu)
}

fn total_memory_kib() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            return rest
                .trim()
                .trim_end_matches(" kB")
                .trim()
                .parse::<u64>()
                .ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn set_rejects_unknown_options() {
        let mut store = OptionsStore::new();
        let err = store
            .set("definitely-not-an-option", OptionValue::Bool(true))
            .expect_err("must fail");
        assert!(err.to_string().contains("unrecognized"));
    }

    #[test]
    fn set_rejects_non_boolean_for_boolean_option() {
        let mut store = OptionsStore::new();
        let err = store
            .set("install-after-build", OptionValue::Str("maybe".into()))
            .expect_err("must fail");
        assert!(err.to_string().contains("install-after-build"));
    }

    #[test]
    fn internal_flags_bypass_the_registry() {
        let mut store = OptionsStore::new();
        store
            .set("#last-build-dir", OptionValue::Str("/tmp/b".into()))
            .expect("internal flag");
        assert_eq!(
            store.get("#last-build-dir").map(|v| v.as_str()),
            Some("/tmp/b".to_string())
        );
    }

    #[test]
    fn set_env_string_form_appends_keys() {
        let mut store = OptionsStore::new();
        store
            .set("set-env", OptionValue::Str("CC clang".into()))
            .expect("set");
        store
            .set("set-env", OptionValue::Str("CXX clang++".into()))
            .expect("set");

        let env = store.get("set-env").and_then(|v| v.as_env()).expect("env");
        assert_eq!(env.get("CC").map(String::as_str), Some("clang"));
        assert_eq!(env.get("CXX").map(String::as_str), Some("clang++"));
    }

    #[test]
    fn set_env_map_form_merges() {
        let mut store = OptionsStore::new();
        store
            .set("set-env", OptionValue::Str("CC clang".into()))
            .expect("set");

        let mut more = BTreeMap::new();
        more.insert("CC".to_string(), "gcc".to_string());
        more.insert("LANG".to_string(), "C".to_string());
        store.set("set-env", OptionValue::Env(more)).expect("merge");

        let env = store.get("set-env").and_then(|v| v.as_env()).expect("env");
        assert_eq!(env.get("CC").map(String::as_str), Some("gcc"));
        assert_eq!(env.get("LANG").map(String::as_str), Some("C"));
    }

    #[test]
    fn repo_base_string_form_accumulates_aliases() {
        let mut store = OptionsStore::new();
        store
            .set(
                "git-repository-base",
                OptionValue::Str("qt6 https://invent.example/qt/".into()),
            )
            .expect("set");
        store
            .set(
                "git-repository-base",
                OptionValue::Str("own git@git.example:".into()),
            )
            .expect("set");

        let bases = store
            .get("git-repository-base")
            .and_then(|v| v.as_repo_base())
            .expect("bases");
        assert_eq!(bases.len(), 2);
        assert_eq!(
            bases.get("qt6").map(String::as_str),
            Some("https://invent.example/qt/")
        );
    }

    #[test]
    fn repo_base_rejects_missing_url() {
        let mut store = OptionsStore::new();
        let err = store
            .set("git-repository-base", OptionValue::Str("loner".into()))
            .expect_err("must fail");
        assert!(err.to_string().contains("alias URL"));
    }

    #[test]
    fn expand_value_resolves_global_references() {
        let mut globals = OptionsStore::new();
        globals
            .set("source-dir", OptionValue::Str("/src".into()))
            .expect("set");
        let out = expand_value("${source-dir}/log", &globals).expect("expand");
        assert_eq!(out, "/src/log");
    }

    #[test]
    fn expand_value_is_iterative() {
        let mut globals = OptionsStore::new();
        globals
            .set("install-dir", OptionValue::Str("${source-dir}/usr".into()))
            .expect("set");
        globals
            .set("source-dir", OptionValue::Str("/kde".into()))
            .expect("set");
        let out = expand_value("${install-dir}/bin", &globals).expect("expand");
        assert_eq!(out, "/kde/usr/bin");
    }

    #[test]
    fn expand_value_rejects_unterminated_reference() {
        let globals = OptionsStore::new();
        assert!(expand_value("${broken", &globals).is_err());
    }

    #[test]
    fn tilde_expands_to_home() {
        let globals = OptionsStore::new();
        let out = expand_value("~/kde/src", &globals).expect("expand");
        assert!(!out.starts_with('~'));
        assert!(out.ends_with("/kde/src"));
    }

    #[test]
    fn coerce_scalar_converts_trailing_booleans() {
        assert_eq!(coerce_scalar("true".into()), OptionValue::Bool(true));
        assert_eq!(coerce_scalar("false".into()), OptionValue::Bool(false));
        assert_eq!(
            coerce_scalar("falsey".into()),
            OptionValue::Str("falsey".into())
        );
    }

    #[test]
    fn falsy_values_are_falsy_everywhere() {
        assert!(!OptionValue::Bool(false).is_truthy());
        assert!(!OptionValue::Str(String::new()).is_truthy());
        assert!(!OptionValue::Str("false".into()).is_truthy());
        assert!(!OptionValue::Int(0).is_truthy());
        assert!(OptionValue::Bool(true).is_truthy());
    }

    #[test]
    fn auto_core_counts_are_at_least_one() {
        assert!(auto_num_cores() >= 1);
        assert!(auto_num_cores_low_mem() >= 1);
        assert!(auto_num_cores_low_mem() <= num_cpus::get() as u32);
    }

    #[test]
    fn sticky_and_appending_lookups_match_registry() {
        assert!(is_sticky("colorful-output"));
        assert!(!is_sticky("cmake-options"));
        assert!(is_appending("cmake-options"));
        assert!(is_appending("cxxflags"));
        assert!(!is_appending("branch"));
    }

    proptest! {
        // Merging a store into an empty one and reading back yields the
        // same values for every plain option.
        #[test]
        fn merge_from_preserves_plain_values(
            vals in prop::collection::btree_map("[a-z]{1,8}", "[a-z0-9/]{0,12}", 0..8)
        ) {
            let mut src = OptionsStore::new();
            for (k, v) in &vals {
                src.set_unchecked(&format!("#{k}"), OptionValue::Str(v.clone()));
            }
            let mut dst = OptionsStore::new();
            dst.merge_from(&src).expect("merge");
            for (k, v) in &vals {
                prop_assert_eq!(
                    dst.get(&format!("#{k}")).map(|o| o.as_str()),
                    Some(v.clone())
                );
            }
        }

        #[test]
        fn expansion_terminates_on_arbitrary_input(s in "[a-z${}~/]{0,40}") {
            let globals = OptionsStore::new();
            let _ = expand_value(&s, &globals);
        }
    }
}
