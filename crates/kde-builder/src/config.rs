//! Configuration file reader.
//!
//! The rc-file is YAML with dynamic top-level keys (`global`,
//! `project <name>`, `group <name>`, `override <name>`, `include <path>`),
//! so it is walked as a [`serde_yaml::Value`] rather than derived. Values
//! pass through `${...}` substitution against the global layer and `~`
//! home expansion before being stored.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde_yaml::Value;

use crate::options::{self, OptionValue, OptionsStore};

/// The `repository` sentinel that makes a group draw from the project
/// catalog instead of a raw URL base.
pub const CATALOG_REPOSITORY: &str = "kde-projects";

pub const CONFIG_VERSION: u64 = 2;

#[derive(Debug, Clone)]
pub struct DeclaredProject {
    pub name: String,
    pub create_id: u32,
    pub options: OptionsStore,
}

#[derive(Debug, Clone)]
pub struct DeclaredGroup {
    pub name: String,
    pub create_id: u32,
    pub repository: String,
    pub use_projects: Vec<String>,
    pub ignore_projects: Vec<String>,
    pub options: OptionsStore,
}

#[derive(Debug, Clone)]
pub struct DeclaredOverride {
    pub name: String,
    pub create_id: u32,
    pub use_projects: Option<Vec<String>>,
    pub options: OptionsStore,
}

/// Parsed configuration: the global layer plus the declarations in
/// rc-file order, each carrying its monotonic entry number.
#[derive(Debug, Clone, Default)]
pub struct ConfigDocument {
    pub global: OptionsStore,
    pub projects: Vec<DeclaredProject>,
    pub groups: Vec<DeclaredGroup>,
    pub overrides: Vec<DeclaredOverride>,
}

struct Loader {
    doc: ConfigDocument,
    next_id: u32,
    saw_version: bool,
    saw_global: bool,
    included: BTreeSet<PathBuf>,
}

/// Load a configuration file, following `include` directives.
pub fn load_config(path: &Path) -> Result<ConfigDocument> {
    let mut loader = Loader {
        doc: ConfigDocument::default(),
        next_id: 0,
        saw_version: false,
        saw_global: false,
        included: BTreeSet::new(),
    };
    loader.load_file(path)?;
    if !loader.saw_version {
        bail!(
            "{}: missing required key config-version: {CONFIG_VERSION}",
            path.display()
        );
    }
    if !loader.saw_global {
        bail!("{}: missing required global section", path.display());
    }
    Ok(loader.doc)
}

impl Loader {
    fn load_file(&mut self, path: &Path) -> Result<()> {
        let canonical = path
            .canonicalize()
            .with_context(|| format!("cannot open config file {}", path.display()))?;
        if !self.included.insert(canonical.clone()) {
            bail!("config file {} included twice", path.display());
        }

        let text = std::fs::read_to_string(&canonical)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let root: Value = serde_yaml::from_str(&text)
            .with_context(|| format!("invalid YAML in {}", path.display()))?;
        let Value::Mapping(map) = root else {
            bail!("{}: top level must be a mapping", path.display());
        };

        for (key, value) in map {
            let Value::String(key) = key else {
                bail!("{}: non-string top-level key", path.display());
            };
            self.dispatch_entry(&canonical, &key, value)
                .with_context(|| format!("{}: in entry \"{key}\"", path.display()))?;
        }
        Ok(())
    }

    fn dispatch_entry(&mut self, file: &Path, key: &str, value: Value) -> Result<()> {
        if key == "config-version" {
            if self.saw_version {
                bail!("duplicate config-version");
            }
            let Some(v) = value.as_u64() else {
                bail!("config-version must be an integer");
            };
            if v != CONFIG_VERSION {
                bail!("unsupported config-version {v}, expected {CONFIG_VERSION}");
            }
            self.saw_version = true;
            return Ok(());
        }

        if key == "global" {
            if self.saw_global {
                bail!("duplicate global section");
            }
            self.saw_global = true;
            let opts = self.read_options(file, value)?;
            self.doc.global.merge_from(&opts)?;
            return Ok(());
        }

        if let Some(rest) = key.strip_prefix("include ") {
            let target = options::expand_value(rest.trim(), &self.doc.global)?;
            let mut target = PathBuf::from(target);
            if target.is_relative() {
                let base = file.parent().unwrap_or_else(|| Path::new("."));
                target = base.join(target);
            }
            return self.load_file(&target);
        }

        if let Some(name) = key.strip_prefix("project ") {
            return self.read_project(file, name.trim(), value);
        }
        if let Some(name) = key.strip_prefix("group ") {
            return self.read_group(file, name.trim(), value);
        }
        if let Some(name) = key.strip_prefix("override ") {
            return self.read_override(file, name.trim(), value);
        }

        bail!("unknown top-level key \"{key}\"");
    }

    fn alloc_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn read_project(&mut self, file: &Path, name: &str, value: Value) -> Result<()> {
        if name.is_empty() {
            bail!("project declaration with empty name");
        }
        if self.doc.projects.iter().any(|p| p.name == name) {
            bail!("duplicate project declaration \"{name}\"");
        }
        let create_id = self.alloc_id();
        let mut opts = self.read_options(file, value)?;
        note_defined_at(&mut opts, file);
        self.doc.projects.push(DeclaredProject {
            name: name.to_string(),
            create_id,
            options: opts,
        });
        Ok(())
    }

    fn read_group(&mut self, file: &Path, name: &str, value: Value) -> Result<()> {
        if self.doc.groups.iter().any(|g| g.name == name) {
            bail!("duplicate group declaration \"{name}\"");
        }
        let create_id = self.alloc_id();
        let mut opts = self.read_options(file, value)?;

        let repository = opts
            .get("repository")
            .map(|v| v.as_str())
            .unwrap_or_default();
        if repository.is_empty() {
            bail!("group \"{name}\" has no repository");
        }
        opts.remove("repository");

        let use_projects = take_list(&mut opts, "use-projects");
        if use_projects.is_empty() {
            bail!("group \"{name}\" has no use-projects");
        }
        let ignore_projects = take_list(&mut opts, "ignore-projects");
        note_defined_at(&mut opts, file);

        self.doc.groups.push(DeclaredGroup {
            name: name.to_string(),
            create_id,
            repository,
            use_projects,
            ignore_projects,
            options: opts,
        });
        Ok(())
    }

    fn read_override(&mut self, file: &Path, name: &str, value: Value) -> Result<()> {
        if self.doc.overrides.iter().any(|o| o.name == name) {
            bail!("duplicate override declaration \"{name}\"");
        }
        let create_id = self.alloc_id();
        let mut opts = self.read_options(file, value)?;
        let use_projects = match take_list(&mut opts, "use-projects") {
            v if v.is_empty() => None,
            v => Some(v),
        };
        self.doc.overrides.push(DeclaredOverride {
            name: name.to_string(),
            create_id,
            use_projects,
            options: opts,
        });
        Ok(())
    }

    fn read_options(&self, file: &Path, value: Value) -> Result<OptionsStore> {
        let Value::Mapping(map) = value else {
            bail!("expected a mapping of options");
        };
        let mut store = OptionsStore::new();
        for (key, raw) in map {
            let Value::String(key) = key else {
                bail!("non-string option name");
            };
            let converted = self
                .convert_value(&key, raw)
                .with_context(|| format!("option \"{key}\""))?;
            store.set(&key, converted).map_err(|e| {
                // Prepend file context, the reason BadOption carries detail.
                anyhow::Error::from(e).context(format!("{}", file.display()))
            })?;
        }
        Ok(store)
    }

    fn convert_value(&self, key: &str, raw: Value) -> Result<OptionValue> {
        let value = match raw {
            Value::Bool(b) => OptionValue::Bool(b),
            Value::Number(n) => {
                let Some(i) = n.as_i64() else {
                    bail!("non-integer number");
                };
                OptionValue::Int(i)
            }
            Value::String(s) => {
                options::coerce_scalar(options::expand_value(&s, &self.doc.global)?)
            }
            Value::Sequence(seq) => {
                let mut items = Vec::with_capacity(seq.len());
                for item in seq {
                    let Value::String(s) = item else {
                        bail!("list entries must be strings");
                    };
                    items.push(options::expand_value(&s, &self.doc.global)?);
                }
                OptionValue::DefinedAt(items)
            }
            Value::Mapping(map) => {
                let mut nested = BTreeMap::new();
                for (k, v) in map {
                    let Value::String(k) = k else {
                        bail!("nested keys must be strings");
                    };
                    let v = match v {
                        Value::String(s) => options::expand_value(&s, &self.doc.global)?,
                        Value::Bool(b) => b.to_string(),
                        Value::Number(n) => n.to_string(),
                        _ => bail!("nested values must be scalars"),
                    };
                    nested.insert(k, v);
                }
                if key == "git-repository-base" {
                    OptionValue::RepoBase(nested)
                } else {
                    OptionValue::Env(nested)
                }
            }
            Value::Null => OptionValue::Str(String::new()),
            other => bail!("unsupported value {other:?}"),
        };
        Ok(value)
    }
}

fn take_list(opts: &mut OptionsStore, key: &str) -> Vec<String> {
    let list = match opts.get(key) {
        Some(OptionValue::DefinedAt(v)) => v.clone(),
        Some(other) => {
            let s = other.as_str();
            if s.is_empty() {
                Vec::new()
            } else {
                s.split_whitespace().map(str::to_string).collect()
            }
        }
        None => Vec::new(),
    };
    opts.remove(key);
    list
}

fn note_defined_at(opts: &mut OptionsStore, file: &Path) {
    let mut paths = match opts.get("#defined-at") {
        Some(OptionValue::DefinedAt(v)) => v.clone(),
        _ => Vec::new(),
    };
    paths.push(file.display().to_string());
    opts.set_unchecked("#defined-at", OptionValue::DefinedAt(paths));
}

/// Re-serialize an options store as YAML for round-trip testing and the
/// query mode.
pub fn options_to_yaml(store: &OptionsStore) -> Result<String> {
    let mut map = serde_yaml::Mapping::new();
    for (key, value) in store.iter() {
        if key.starts_with('#') {
            continue;
        }
        let v = match value {
            OptionValue::Bool(b) => Value::Bool(*b),
            OptionValue::Int(n) => Value::Number((*n).into()),
            OptionValue::Str(s) => Value::String(s.clone()),
            OptionValue::Env(m) | OptionValue::RepoBase(m) => Value::Mapping(
                m.iter()
                    .map(|(k, v)| (Value::String(k.clone()), Value::String(v.clone())))
                    .collect(),
            ),
            OptionValue::DefinedAt(v) => {
                Value::Sequence(v.iter().cloned().map(Value::String).collect())
            }
        };
        map.insert(Value::String(key.clone()), v);
    }
    serde_yaml::to_string(&Value::Mapping(map)).context("failed to serialize options")
}

impl ConfigDocument {
    /// The ignore list declared on the global layer.
    pub fn global_ignore_list(&self) -> Vec<String> {
        match self.global.get("ignore-projects") {
            Some(OptionValue::DefinedAt(v)) => v.clone(),
            _ => Vec::new(),
        }
    }
}
