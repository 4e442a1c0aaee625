//! The atomic unit of work: one project, one source tree.

use crate::options::OptionsStore;
use crate::phases::PhaseList;

/// How a project came to exist in this run. Affects build-flavor detection
/// (Qt supermodule members use the qt flavors) and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectOrigin {
    /// Declared directly in the configuration.
    Config,
    /// Emitted by expanding a group.
    Group,
    /// Emitted by expanding a Qt supermodule group.
    QtGroup,
    /// Resolved from the project catalog (command-line selector or dep).
    Catalog,
}

/// A concrete project with fully merged options.
///
/// Created only by the selector resolver (and the dependency resolver's
/// project factory); mutated by the updater (revision info) and the build
/// runner (post-build messages, error log path) through the methods here.
#[derive(Debug, Clone)]
pub struct Project {
    pub name: String,
    /// Monotonic declaration id; ties in the build order break on this.
    pub create_id: u32,
    /// Merged option view: group options layered first, then the project's
    /// own, then overrides, then command-line per-project options.
    pub options: OptionsStore,
    pub phases: PhaseList,
    /// Full catalog path, e.g. `utilities/kcalc`. `None` for raw-URL projects.
    pub full_path: Option<String>,
    /// True when the project was resolved against the project catalog.
    pub is_catalog: bool,
    pub origin: ProjectOrigin,
    /// Name of the group this project was expanded from, if any.
    pub from_group: Option<String>,
    /// Messages deferred to the end-of-run report.
    pub post_build_messages: Vec<String>,
}

impl Project {
    pub fn new(name: impl Into<String>, create_id: u32) -> Self {
        Project {
            name: name.into(),
            create_id,
            options: OptionsStore::new(),
            phases: PhaseList::default(),
            full_path: None,
            is_catalog: false,
            origin: ProjectOrigin::Config,
            from_group: None,
            post_build_messages: Vec::new(),
        }
    }

    /// The repository path used for catalog and dependency matching.
    pub fn full_project_path(&self) -> String {
        self.full_path.clone().unwrap_or_else(|| self.name.clone())
    }

    /// The path used when consulting dependency rules. Non-catalog projects
    /// are namespaced under `third-party/` so catch-all rules skip them.
    pub fn dependency_path(&self) -> String {
        let path = self.full_project_path();
        if self.is_catalog {
            path
        } else {
            format!("third-party/{path}")
        }
    }

    pub fn add_post_build_message(&mut self, msg: impl Into<String>) {
        self.post_build_messages.push(msg.into());
    }

    /// The branch this project wants, if its checkout preference is a branch
    /// (as opposed to a tag or pinned commit). A branch assigned by the
    /// branch-group resolver counts, with lower precedence than an explicit
    /// `branch` option.
    pub fn requested_branch(&self) -> Option<String> {
        if self.options.has("commit")
            || self.options.has("revision")
            || self.options.has("tag")
        {
            return None;
        }
        self.options
            .get("branch")
            .or_else(|| self.options.get("#branch-group-branch"))
            .map(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use crate::options::OptionValue;

    use super::*;

    #[test]
    fn dependency_path_namespaces_non_catalog_projects() {
        let mut p = Project::new("fmt", 1);
        p.full_path = Some("libs/fmt".to_string());
        assert_eq!(p.dependency_path(), "third-party/libs/fmt");

        p.is_catalog = true;
        assert_eq!(p.dependency_path(), "libs/fmt");
    }

    #[test]
    fn full_project_path_falls_back_to_name() {
        let p = Project::new("kcalc", 1);
        assert_eq!(p.full_project_path(), "kcalc");
    }

    #[test]
    fn requested_branch_yields_to_pinned_refs() {
        let mut p = Project::new("kcalc", 1);
        p.options
            .set("branch", OptionValue::Str("master".into()))
            .expect("set");
        assert_eq!(p.requested_branch().as_deref(), Some("master"));

        p.options
            .set("tag", OptionValue::Str("v23.08.0".into()))
            .expect("set");
        assert_eq!(p.requested_branch(), None);
    }
}
