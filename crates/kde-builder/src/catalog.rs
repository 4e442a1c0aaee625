//! Project catalog reader and branch-group resolver.
//!
//! The catalog is a local checkout of the metadata repository: a directory
//! tree of `metadata.yaml` files, one per project. Selectors from the
//! configuration and the command line are matched against it here.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::debug;

/// How a catalog entry ended up in a result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoundBy {
    Direct,
    Wildcard,
}

#[derive(Debug, Clone)]
pub struct CatalogEntry {
    /// Short identifier, unique across the catalog.
    pub name: String,
    /// Full virtual path, e.g. `kde/kdelibs/baloo`.
    pub full_name: String,
    /// Repository fetch URL in `kde:<repopath>.git` alias form.
    pub repo: String,
    pub active: bool,
    pub found_by: FoundBy,
}

#[derive(Debug, Deserialize)]
struct MetadataFile {
    #[serde(default)]
    identifier: Option<String>,
    repopath: String,
    projectpath: String,
    #[serde(default)]
    repoactive: bool,
    #[serde(default)]
    kind: Option<String>,
}

/// In-memory map of every first-party project, keyed by short identifier.
#[derive(Debug, Default)]
pub struct ProjectCatalog {
    repositories: BTreeMap<String, CatalogEntry>,
}

impl ProjectCatalog {
    /// Walk a catalog checkout, loading every `metadata.yaml` whose `kind`
    /// is `software`.
    pub fn from_checkout(srcdir: &Path) -> Result<Self> {
        if !srcdir.is_dir() {
            bail!("no such source directory {}", srcdir.display());
        }
        let mut catalog = ProjectCatalog::default();
        catalog.walk(srcdir)?;
        if catalog.repositories.is_empty() {
            bail!(
                "failed to find project entries from {}",
                srcdir.display()
            );
        }
        Ok(catalog)
    }

    /// Build a catalog directly from entries. Used by tests and pretend runs
    /// that never fetched metadata.
    pub fn from_entries(entries: Vec<CatalogEntry>) -> Self {
        let repositories = entries.into_iter().map(|e| (e.name.clone(), e)).collect();
        ProjectCatalog { repositories }
    }

    fn walk(&mut self, dir: &Path) -> Result<()> {
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("cannot read {}", dir.display()))?;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                self.walk(&path)?;
            } else if entry.file_name() == "metadata.yaml" {
                self.read_metadata(&path)?;
            }
        }
        Ok(())
    }

    fn read_metadata(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let meta: MetadataFile = serde_yaml::from_str(&text)
            .with_context(|| format!("invalid metadata in {}", path.display()))?;

        if meta.kind.as_deref() != Some("software") {
            return Ok(());
        }
        // The metadata repository itself is handled as a special project.
        if meta.projectpath == "repo-management" {
            return Ok(());
        }

        let name = meta
            .identifier
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| meta.repopath.clone());
        self.repositories.insert(
            name.clone(),
            CatalogEntry {
                name,
                full_name: meta.projectpath,
                repo: format!("kde:{}.git", meta.repopath),
                active: meta.repoactive,
                found_by: FoundBy::Direct,
            },
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.repositories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repositories.is_empty()
    }

    pub fn entry(&self, name: &str) -> Option<&CatalogEntry> {
        self.repositories.get(name)
    }

    /// Resolve a selector to catalog entries.
    ///
    /// A bare identifier matches exactly; a trailing `*` prefix-matches the
    /// project path; a `/`-separated path matches right-anchored, component
    /// by component, with `*` components matching anything. A non-wildcard
    /// selector also tries `selector/*`, so `kdelibs` finds `kdelibs/foo`.
    pub fn entries_for_selector(&self, selector: &str) -> Vec<CatalogEntry> {
        let mut matched: BTreeMap<String, FoundBy> = BTreeMap::new();

        let mut selector = selector.to_string();
        if !selector.contains('*') && !selector.ends_with(".git") {
            self.collect_matches(&mut matched, &selector);
            selector.push_str("/*");
        }
        if let Some(stripped) = selector.strip_suffix(".git") {
            selector = stripped.to_string();
        }

        if !selector.contains('*') && !selector.contains('/') {
            if self.repositories.contains_key(&selector) {
                matched.entry(selector.clone()).or_insert(FoundBy::Direct);
            }
        } else {
            self.collect_matches(&mut matched, &selector);
        }

        matched
            .into_iter()
            .map(|(key, found_by)| {
                let mut entry = self.repositories[&key].clone();
                entry.found_by = found_by;
                entry
            })
            .collect()
    }

    fn collect_matches(&self, matched: &mut BTreeMap<String, FoundBy>, sel: &str) {
        let wild = sel.contains('*');
        for (key, entry) in &self.repositories {
            if path_matches_wildcard_search(&entry.full_name, sel) {
                let found_by = if wild { FoundBy::Wildcard } else { FoundBy::Direct };
                matched.entry(key.clone()).or_insert(found_by);
            }
        }
    }
}

/// Component-wise, right-anchored wildcard match of a selector against a
/// full project path.
pub fn path_matches_wildcard_search(project_path: &str, search_item: &str) -> bool {
    let search_parts: Vec<&str> = search_item.split('/').collect();
    let name_stack: Vec<&str> = project_path.split('/').collect();

    if name_stack.len() < search_parts.len() {
        return false;
    }
    let size_difference = name_stack.len() - search_parts.len();

    let mut i = 0;
    while i <= size_difference {
        // Find the common prefix, then require the remainder to match
        // item-for-item.
        while i <= size_difference && name_stack[i] != search_parts[0] && search_parts[0] != "*" {
            i += 1;
        }
        if i > size_difference {
            return false;
        }

        let mut found = true;
        for (j, part) in search_parts.iter().enumerate() {
            if *part == "*" {
                return true;
            }
            if *part != name_stack[i + j] {
                found = false;
                break;
            }
        }
        if found {
            return true;
        }
        i += 1;
    }
    false
}

/// Maps `(catalog path, branch-group name)` to a concrete git branch.
///
/// Per-project exact entries win; otherwise the longest matching wildcard
/// group; otherwise the `*` catch-all group.
#[derive(Debug, Default)]
pub struct BranchGroupResolver {
    groups: BTreeMap<String, BTreeMap<String, String>>,
}

impl BranchGroupResolver {
    pub fn from_yaml(text: &str) -> Result<Self> {
        #[derive(Deserialize)]
        struct File {
            #[serde(default)]
            groups: BTreeMap<String, BTreeMap<String, String>>,
        }
        let file: File = serde_yaml::from_str(text).context("invalid branch-group data")?;
        // Keys beginning with an underscore are comments per the metadata
        // format.
        let groups = file
            .groups
            .into_iter()
            .filter(|(k, _)| !k.starts_with('_'))
            .collect();
        Ok(BranchGroupResolver { groups })
    }

    pub fn from_groups(groups: BTreeMap<String, BTreeMap<String, String>>) -> Self {
        BranchGroupResolver { groups }
    }

    /// The branch for a project path under a logical group, or `None` when
    /// nothing matches. An empty string result means "elide this project".
    pub fn find_module_branch(&self, module: &str, logical_group: &str) -> Option<String> {
        if let Some(entry) = self.groups.get(module) {
            return entry.get(logical_group).cloned();
        }

        // Longest required-prefix wins among wildcarded groups.
        let mut candidates: Vec<(&str, &String)> = self
            .groups
            .keys()
            .filter(|k| k.ends_with('*') && k.len() > 1)
            .map(|k| (&k[..k.len() - 1], k))
            .filter(|(prefix, _)| module.starts_with(prefix))
            .collect();
        candidates.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        if let Some((_, key)) = candidates.first() {
            debug!(module, group = %key, "matched wildcard branch group");
            return self.groups[*key].get(logical_group).cloned();
        }

        self.groups
            .get("*")
            .and_then(|entry| entry.get(logical_group).cloned())
    }
}
