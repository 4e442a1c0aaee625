//! Reader for the Makefile-like dependency declaration format.
//!
//! Lines have the shape `dependent[branch] : [-]source[branch]`. The
//! dependent side may end in `*` to declare a catch-all applying to every
//! project under a path prefix; a `-` on the source side removes an edge a
//! catch-all would have added.

use std::collections::BTreeMap;

use tracing::{debug, warn};

/// `adds` and `removes` for one `target:branch` key. Both lists are kept
/// sorted so graph construction is reproducible.
#[derive(Debug, Clone, Default)]
pub struct DependencyInfo {
    pub adds: Vec<String>,
    pub removes: Vec<String>,
}

/// A resolved direct dependency of some project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepRef {
    /// Short identifier of the dependency.
    pub item: String,
    /// The path as written in the declaration (may be a full virtual path).
    pub path: String,
    /// Pinned branch, `None` for the `*` wildcard.
    pub branch: Option<String>,
}

#[derive(Debug, Default)]
pub struct DirectDeps {
    pub dependencies: BTreeMap<String, DepRef>,
    pub trivial_cycles: u32,
    pub syntax_errors: u32,
}

/// Parsed dependency declarations.
#[derive(Debug, Default)]
pub struct DependencyData {
    /// Keyed by `item:branch` (`*` for the unspecified branch).
    dependencies_of: BTreeMap<String, DependencyInfo>,
    /// Keyed by the wildcarded dependent (`prefix*`), values `item:branch`.
    catch_all: BTreeMap<String, Vec<String>>,
    pub syntax_errors: u32,
}

/// Strip leading path components: `kde/kdelibs/foo` becomes `foo`.
pub fn shorten_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

impl DependencyData {
    /// Parse the dependency declarations from text.
    ///
    /// Malformed lines are counted (and reported by the caller); a
    /// wildcarded source is warned about and skipped.
    pub fn parse(text: &str) -> Self {
        let mut data = DependencyData::default();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            if let Err(()) = data.parse_line(line) {
                warn!(line = lineno + 1, text = line, "invalid dependency declaration");
                data.syntax_errors += 1;
            }
        }
        data.canonicalize();
        data
    }

    fn parse_line(&mut self, line: &str) -> Result<(), ()> {
        let (dependent_raw, source_raw) = line.split_once(':').ok_or(())?;
        let (dependent, dependent_branch) = split_branch(dependent_raw.trim())?;
        let (source, source_branch) = split_branch(source_raw.trim())?;
        if dependent.is_empty() || source.is_empty() {
            return Err(());
        }

        // A wildcarded source would make the edge ambiguous; skip it.
        if source.ends_with('*') {
            warn!(source, "ignoring dependency on wildcard project grouping");
            return Ok(());
        }

        let (negated, source) = match source.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, source),
        };
        if source.is_empty() {
            return Err(());
        }
        // The source can never be a catch-all, so shorten early to avoid
        // keying on a long path.
        let source_entry = format!("{}:{}", shorten_name(source), source_branch);

        if dependent.ends_with('*') {
            if negated {
                return Err(());
            }
            self.catch_all
                .entry(dependent.to_string())
                .or_default()
                .push(source_entry);
            return Ok(());
        }

        let key = format!("{}:{}", shorten_name(dependent), dependent_branch);
        // Always keep at least the `item:*` entry so lookups see the item.
        let wildcard_key = format!("{}:*", shorten_name(dependent));
        self.dependencies_of.entry(wildcard_key).or_default();

        let info = self.dependencies_of.entry(key).or_default();
        if negated {
            info.removes.push(source_entry);
        } else {
            info.adds.push(source_entry);
        }
        Ok(())
    }

    fn canonicalize(&mut self) {
        for info in self.dependencies_of.values_mut() {
            info.adds.sort();
            info.removes.sort();
        }
        for sources in self.catch_all.values_mut() {
            sources.sort();
        }
    }

    /// Direct dependencies of the project at `path`, checked out at
    /// `branch`. Catch-alls apply unless the path is under `third-party/`.
    pub fn direct_dependencies(&self, path: &str, branch: Option<&str>) -> DirectDeps {
        let item = shorten_name(path);
        let mut direct: Vec<String> = Vec::new();
        let mut exclusions: Vec<String> = Vec::new();

        if let Some(info) = self.dependencies_of.get(&format!("{item}:*")) {
            debug!(item, "handling dependencies without branch (*)");
            direct.extend(info.adds.iter().cloned());
            exclusions.extend(info.removes.iter().cloned());
        }
        if let Some(branch) = branch.filter(|b| !b.is_empty() && *b != "*") {
            if let Some(info) = self.dependencies_of.get(&format!("{item}:{branch}")) {
                debug!(item, branch, "handling dependencies with branch");
                direct.extend(info.adds.iter().cloned());
                exclusions.extend(info.removes.iter().cloned());
            }
        }

        if !path.starts_with("third-party/") {
            for (catch_all, sources) in &self.catch_all {
                let prefix = catch_all.trim_end_matches('*');
                if prefix.is_empty() || path.starts_with(prefix) {
                    direct.extend(sources.iter().cloned());
                }
            }
        }

        // Remove only exact `item:branch` matches; a catch-all exclusion
        // cannot remove a specific-branch edge.
        direct.retain(|dep| !exclusions.contains(dep));

        let mut result = DirectDeps::default();
        for dep in direct {
            let Some((dep_path, dep_branch)) = dep.split_once(':') else {
                result.syntax_errors += 1;
                continue;
            };
            if dep_path.is_empty() {
                result.syntax_errors += 1;
                continue;
            }
            let dep_item = shorten_name(dep_path);
            if dep_item == item {
                debug!(item, "breaking trivial self-cycle");
                result.trivial_cycles += 1;
                continue;
            }
            if result.dependencies.contains_key(dep_item) {
                continue;
            }
            let branch = match dep_branch {
                "" | "*" => None,
                b => Some(b.to_string()),
            };
            result.dependencies.insert(
                dep_item.to_string(),
                DepRef {
                    item: dep_item.to_string(),
                    path: dep_path.to_string(),
                    branch,
                },
            );
        }
        result
    }
}

/// Split `name[branch]` into the name and the branch (`*` when absent).
fn split_branch(token: &str) -> Result<(&str, &str), ()> {
    match token.split_once('[') {
        None => Ok((token, "*")),
        Some((name, rest)) => {
            let branch = rest.strip_suffix(']').ok_or(())?;
            if branch.is_empty() || branch.contains(char::is_whitespace) {
                return Err(());
            }
            Ok((name.trim_end(), branch))
        }
    }
}
