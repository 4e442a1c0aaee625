//! Selector resolution: declared projects, groups, overrides, command-line
//! selectors, and catalog wildcards become one uniquely-named list of
//! projects with fully layered options.

use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use tracing::{debug, warn};

use crate::catalog::{BranchGroupResolver, CatalogEntry, ProjectCatalog};
use crate::config::{CATALOG_REPOSITORY, ConfigDocument, DeclaredGroup, DeclaredOverride};
use crate::context::BuildContext;
use crate::error::KbError;
use crate::options::{OptionValue, OptionsStore};
use crate::project::{Project, ProjectOrigin};

/// Result of selector resolution: the run list in selection order, plus
/// the id counter dep-factory projects should continue from.
#[derive(Debug)]
pub struct ResolvedProjects {
    pub projects: Vec<Project>,
    pub next_create_id: u32,
}

pub struct Resolver<'a> {
    doc: &'a ConfigDocument,
    ctx: &'a BuildContext,
    catalog: Option<&'a ProjectCatalog>,
    branch_groups: Option<&'a BranchGroupResolver>,
    /// Overrides still pending; catalog-selector overrides are expanded
    /// out of this list up front.
    overrides: Vec<DeclaredOverride>,
    /// Options attached to short names by pre-expanded overrides.
    expanded_override_opts: BTreeMap<String, Vec<OptionsStore>>,
    next_id: u32,
}

impl<'a> Resolver<'a> {
    pub fn new(
        doc: &'a ConfigDocument,
        ctx: &'a BuildContext,
        catalog: Option<&'a ProjectCatalog>,
        branch_groups: Option<&'a BranchGroupResolver>,
    ) -> Self {
        let next_id = doc
            .projects
            .iter()
            .map(|p| p.create_id)
            .chain(doc.groups.iter().map(|g| g.create_id))
            .chain(doc.overrides.iter().map(|o| o.create_id))
            .max()
            .unwrap_or(0)
            + 1;
        Resolver {
            doc,
            ctx,
            catalog,
            branch_groups,
            overrides: doc.overrides.clone(),
            expanded_override_opts: BTreeMap::new(),
            next_id,
        }
    }

    fn alloc_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Resolve the whole run list.
    ///
    /// With no selectors: `all_config_projects` yields every configured
    /// project and group in declaration order (B1); otherwise the run is
    /// empty with a warning (B2).
    pub fn resolve(
        &mut self,
        selectors: &[String],
        ignore_selectors: &[String],
        all_config_projects: bool,
    ) -> Result<ResolvedProjects> {
        self.pre_expand_overrides()?;

        // Step 1-2: declared projects with their overrides layered on.
        let mut defined: BTreeMap<String, Project> = BTreeMap::new();
        for declared in &self.doc.projects {
            let mut project = Project::new(&declared.name, declared.create_id);
            project.options = declared.options.clone();
            self.attach_catalog_identity(&mut project);

            for ov in &self.overrides {
                // Options set later in the config already won.
                if ov.name == declared.name && ov.create_id > declared.create_id {
                    project.options.merge_from(&ov.options)?;
                }
            }
            self.apply_expanded_overrides(&mut project)?;
            defined.insert(declared.name.clone(), project);
        }

        // Step 4: expand groups in declaration order.
        let mut group_projects: Vec<Project> = Vec::new();
        for group in &self.doc.groups {
            let expanded = self.expand_group(group, &defined)?;
            for project in &expanded {
                if group_projects.iter().any(|p| p.name == project.name) {
                    bail!(
                        "project \"{}\" emitted by group \"{}\" is already declared",
                        project.name,
                        group.name
                    );
                }
            }
            group_projects.extend(expanded);
        }

        // Step 5: command-line selectors, in order.
        let mut run_list: Vec<Project> = Vec::new();
        let push_unique = |list: &mut Vec<Project>, project: Project| {
            if !list.iter().any(|p| p.name == project.name) {
                list.push(project);
            }
        };

        if selectors.is_empty() {
            if all_config_projects {
                for project in defined.values() {
                    push_unique(&mut run_list, project.clone());
                }
                for project in &group_projects {
                    push_unique(&mut run_list, project.clone());
                }
                run_list.sort_by_key(|p| p.create_id);
            } else {
                warn!("no projects selected and none implied; nothing to do");
            }
        } else {
            for selector in selectors {
                if let Some(project) = defined.get(selector) {
                    // A name shared by a project and a group resolves to
                    // the project.
                    push_unique(&mut run_list, project.clone());
                    continue;
                }
                if let Some(project) = group_projects.iter().find(|p| p.name == *selector) {
                    push_unique(&mut run_list, project.clone());
                    continue;
                }
                if let Some(group) = self.doc.groups.iter().find(|g| g.name == *selector) {
                    for project in group_projects
                        .iter()
                        .filter(|p| p.from_group.as_deref() == Some(group.name.as_str()))
                    {
                        push_unique(&mut run_list, project.clone());
                    }
                    continue;
                }
                let matches = self.catalog_selector_projects(selector)?;
                if matches.is_empty() {
                    return Err(KbError::UnknownProject(selector.clone()))
                        .context("selector matched no project, group, or catalog entry");
                }
                for project in matches {
                    push_unique(&mut run_list, project);
                }
            }
        }

        // Step 6: the ignore list, by short name and by source group.
        let mut ignored: Vec<String> = self.doc.global_ignore_list();
        ignored.extend(ignore_selectors.iter().cloned());
        run_list.retain(|project| !is_ignored(project, &ignored));

        // Branch-group resolution; an empty branch elides the project.
        self.apply_branch_groups(&mut run_list);

        // Materialize effective include-dependencies so the graph does not
        // need the context.
        for project in &mut run_list {
            let include = self.ctx.option_bool(Some(project), "include-dependencies");
            project
                .options
                .set("include-dependencies", OptionValue::Bool(include))?;
        }

        Ok(ResolvedProjects {
            projects: run_list,
            next_create_id: self.next_id,
        })
    }

    /// Step 3: overrides whose `use-projects` names catalog selectors are
    /// expanded to per-short-name option sets and removed from the list.
    fn pre_expand_overrides(&mut self) -> Result<()> {
        let mut remaining = Vec::new();
        for ov in std::mem::take(&mut self.overrides) {
            let Some(use_projects) = &ov.use_projects else {
                remaining.push(ov);
                continue;
            };
            for selector in use_projects {
                let entries = self
                    .catalog
                    .map(|c| c.entries_for_selector(selector))
                    .unwrap_or_default();
                if entries.is_empty() {
                    warn!(
                        %selector,
                        override_name = %ov.name,
                        "override use-projects selector matched nothing"
                    );
                }
                for entry in entries {
                    self.expanded_override_opts
                        .entry(entry.name)
                        .or_default()
                        .push(ov.options.clone());
                }
            }
        }
        self.overrides = remaining;
        Ok(())
    }

    fn apply_expanded_overrides(&self, project: &mut Project) -> Result<(), KbError> {
        if let Some(layers) = self.expanded_override_opts.get(&project.name) {
            for layer in layers {
                project.options.merge_from(layer)?;
            }
        }
        Ok(())
    }

    fn apply_single_overrides(&self, project: &mut Project) -> Result<(), KbError> {
        for ov in &self.overrides {
            if ov.name == project.name {
                project.options.merge_from(&ov.options)?;
            }
        }
        Ok(())
    }

    /// Give a declared project its catalog identity (path, fetch URL) when
    /// the catalog knows it and the config did not pin a repository.
    fn attach_catalog_identity(&self, project: &mut Project) {
        let repository = project
            .options
            .get("repository")
            .map(|v| v.as_str())
            .unwrap_or_default();
        if !repository.is_empty() && repository != CATALOG_REPOSITORY {
            project.options.set_unchecked(
                "#resolved-repository",
                OptionValue::Str(self.expand_repository_alias(&repository)),
            );
            return;
        }
        if let Some(entry) = self.catalog.and_then(|c| c.entry(&project.name)) {
            project.full_path = Some(entry.full_name.clone());
            project.is_catalog = true;
            project
                .options
                .set_unchecked("#resolved-repository", OptionValue::Str(entry.repo.clone()));
        }
    }

    /// Expand an `alias:rest` repository spec against `git-repository-base`.
    fn expand_repository_alias(&self, repository: &str) -> String {
        if let Some((alias, rest)) = repository.split_once(':') {
            if let Some(bases) = self
                .ctx
                .global
                .get("git-repository-base")
                .and_then(|v| v.as_repo_base())
            {
                if let Some(base) = bases.get(alias) {
                    return format!("{base}{rest}");
                }
            }
        }
        repository.to_string()
    }

    fn expand_group(
        &mut self,
        group: &DeclaredGroup,
        defined: &BTreeMap<String, Project>,
    ) -> Result<Vec<Project>> {
        // Overrides and command-line options aimed at the group itself
        // layer onto the group before it expands.
        let mut group_options = group.options.clone();
        for ov in &self.overrides {
            if ov.name == group.name {
                group_options.merge_from(&ov.options)?;
            }
        }
        if let Some(cmdline) = self.ctx.cmdline_per_project.get(&group.name) {
            group_options.merge_from(cmdline)?;
        }

        let from_catalog = group.repository == CATALOG_REPOSITORY;
        let qt_supermodule = group.repository.contains("code.qt.io");
        let use_inactive = self.ctx.option_bool(None, "use-inactive-projects");

        let mut out: Vec<Project> = Vec::new();
        for selector in &group.use_projects {
            let mut emitted: Vec<Project> = Vec::new();

            if from_catalog {
                let catalog = self
                    .catalog
                    .context("group uses the project catalog but no metadata is available")?;
                let entries = catalog.entries_for_selector(selector);
                if entries.is_empty() {
                    return Err(KbError::UnknownProject(selector.clone())).with_context(|| {
                        format!("in use-projects of group \"{}\"", group.name)
                    });
                }
                for entry in entries {
                    if !entry.active && !use_inactive {
                        debug!(project = %entry.name, "skipping inactive catalog project");
                        continue;
                    }
                    let id = self.alloc_id();
                    let mut project = project_from_catalog_entry(&entry, id);
                    project.origin = ProjectOrigin::Group;
                    emitted.push(project);
                }
            } else {
                let id = self.alloc_id();
                let mut project = Project::new(selector.clone(), id);
                let url = join_repository_base(&group.repository, selector);
                project
                    .options
                    .set_unchecked("#resolved-repository", OptionValue::Str(url));
                project.origin = if qt_supermodule {
                    ProjectOrigin::QtGroup
                } else {
                    ProjectOrigin::Group
                };
                emitted.push(project);
            }

            for mut project in emitted {
                if group.ignore_projects.iter().any(|ig| {
                    *ig == project.name
                        || project
                            .full_path
                            .as_deref()
                            .is_some_and(|p| crate::catalog::path_matches_wildcard_search(p, ig))
                }) {
                    continue;
                }
                if defined.contains_key(&project.name) {
                    bail!(
                        "group \"{}\" emits project \"{}\" which is already declared directly",
                        group.name,
                        project.name
                    );
                }

                // Layering: group policy, then overrides, then cmdline
                // options (the latter stay in their own layer).
                let own = std::mem::take(&mut project.options);
                project.options = group_options.clone();
                project.options.merge_from(&own)?;
                self.apply_single_overrides(&mut project)?;
                self.apply_expanded_overrides(&mut project)?;
                project.from_group = Some(group.name.clone());
                if !out.iter().any(|p: &Project| p.name == project.name) {
                    out.push(project);
                }
            }
        }
        Ok(out)
    }

    /// Selector resolution against the catalog for command-line selectors.
    fn catalog_selector_projects(&mut self, selector: &str) -> Result<Vec<Project>> {
        let Some(catalog) = self.catalog else {
            return Ok(Vec::new());
        };
        let use_inactive = self.ctx.option_bool(None, "use-inactive-projects");
        let mut out = Vec::new();
        for entry in catalog.entries_for_selector(selector) {
            if !entry.active && !use_inactive {
                continue;
            }
            let id = self.alloc_id();
            let mut project = project_from_catalog_entry(&entry, id);
            self.apply_single_overrides(&mut project)?;
            self.apply_expanded_overrides(&mut project)?;
            out.push(project);
        }
        Ok(out)
    }

    /// The project factory used while resolving transitive dependencies.
    pub fn dependency_project_factory(
        &mut self,
    ) -> impl FnMut(&str, &mut Vec<Project>) -> Option<usize> + '_ {
        move |name: &str, projects: &mut Vec<Project>| {
            let entry = self.catalog.and_then(|c| c.entry(name))?.clone();
            if !entry.active && !self.ctx.option_bool(None, "use-inactive-projects") {
                return None;
            }
            let id = self.alloc_id();
            let mut project = project_from_catalog_entry(&entry, id);
            if self.apply_single_overrides(&mut project).is_err()
                || self.apply_expanded_overrides(&mut project).is_err()
            {
                return None;
            }
            if let Some(resolver) = self.branch_groups {
                let group = branch_group_of(self.ctx, &project);
                apply_branch_group(&mut project, resolver, &group);
            }
            projects.push(project);
            Some(projects.len() - 1)
        }
    }

    fn apply_branch_groups(&self, run_list: &mut Vec<Project>) {
        let Some(resolver) = self.branch_groups else {
            return;
        };
        run_list.retain_mut(|project| {
            let group = branch_group_of(self.ctx, project);
            apply_branch_group(project, resolver, &group)
        });
    }
}

fn branch_group_of(ctx: &BuildContext, project: &Project) -> String {
    ctx.option_str(Some(project), "branch-group")
}

/// Resolve and record the branch-group branch. Returns false when the
/// branch-group maps this project to the empty string, eliding it.
fn apply_branch_group(
    project: &mut Project,
    resolver: &BranchGroupResolver,
    group: &str,
) -> bool {
    if !project.is_catalog || project.requested_branch().is_some() {
        return true;
    }
    let Some(path) = project.full_path.clone() else {
        return true;
    };
    match resolver.find_module_branch(&path, group) {
        Some(branch) if branch.is_empty() => {
            debug!(project = %project.name, group, "branch group elides project");
            false
        }
        Some(branch) => {
            project
                .options
                .set_unchecked("#branch-group-branch", OptionValue::Str(branch));
            true
        }
        None => true,
    }
}

pub fn project_from_catalog_entry(entry: &CatalogEntry, create_id: u32) -> Project {
    let mut project = Project::new(entry.name.clone(), create_id);
    project.full_path = Some(entry.full_name.clone());
    project.is_catalog = true;
    project.origin = ProjectOrigin::Catalog;
    project
        .options
        .set_unchecked("#resolved-repository", OptionValue::Str(entry.repo.clone()));
    project
}

fn join_repository_base(base: &str, name: &str) -> String {
    if base.ends_with('/') || base.ends_with(':') {
        format!("{base}{name}.git")
    } else {
        format!("{base}/{name}.git")
    }
}

fn is_ignored(project: &Project, ignored: &[String]) -> bool {
    ignored.iter().any(|ig| {
        *ig == project.name
            || project.from_group.as_deref() == Some(ig.as_str())
            || project
                .full_path
                .as_deref()
                .is_some_and(|p| crate::catalog::path_matches_wildcard_search(p, ig))
    })
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use crate::catalog::FoundBy;
    use crate::config::load_config;

    use super::*;

    fn catalog() -> ProjectCatalog {
        let entry = |name: &str, full: &str, active: bool| CatalogEntry {
            name: name.to_string(),
            full_name: full.to_string(),
            repo: format!("kde:{full}.git"),
            active,
            found_by: FoundBy::Direct,
        };
        ProjectCatalog::from_entries(vec![
            entry("kcalc", "utilities/kcalc", true),
            entry("kconfig", "frameworks/kconfig", true),
            entry("ki18n", "frameworks/ki18n", true),
            entry("kdewebkit", "frameworks/kdewebkit", false),
            entry("dolphin", "applications/dolphin", true),
        ])
    }

    fn parse(config: &str) -> ConfigDocument {
        let td = tempfile::tempdir().expect("tempdir");
        let path = td.path().join("kde-builder.yaml");
        std::fs::write(&path, config).expect("write");
        load_config(&path).expect("config")
    }

    fn resolve_with(
        config: &str,
        selectors: &[&str],
        all_config: bool,
    ) -> Result<Vec<Project>> {
        let doc = parse(config);
        let mut ctx = BuildContext::new(PathBuf::from("/tmp"));
        ctx.global = doc.global.clone();
        let catalog = catalog();
        let mut resolver = Resolver::new(&doc, &ctx, Some(&catalog), None);
        let selectors: Vec<String> = selectors.iter().map(|s| s.to_string()).collect();
        resolver
            .resolve(&selectors, &[], all_config)
            .map(|r| r.projects)
    }

    const GROUPS: &str = r#"
config-version: 2
global:
  include-dependencies: false

project special-kcalc:
  repository: kde:utilities/kcalc.git
  branch: work/my-feature

group frameworks:
  repository: kde-projects
  use-projects:
    - frameworks/*
  ignore-projects:
    - kdewebkit
  cmake-options: -DGROUP=ON

override kconfig:
  cmake-options: -DEXTRA=1
"#;

    #[test]
    fn group_expansion_applies_ignores_and_overrides() {
        // S6-shaped: the group ignores kdewebkit (also inactive here).
        let projects = resolve_with(GROUPS, &["frameworks"], false).expect("resolve");
        let names: Vec<&str> = projects.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["kconfig", "ki18n"]);

        let kconfig = &projects[0];
        assert_eq!(kconfig.from_group.as_deref(), Some("frameworks"));
        // The override layered after the group policy wins for kconfig.
        assert_eq!(
            kconfig.options.get("cmake-options").map(|v| v.as_str()),
            Some("-DEXTRA=1".to_string())
        );
        let ki18n = &projects[1];
        assert_eq!(
            ki18n.options.get("cmake-options").map(|v| v.as_str()),
            Some("-DGROUP=ON".to_string())
        );
    }

    #[test]
    fn override_beats_group_option() {
        let projects = resolve_with(GROUPS, &["kconfig"], false).expect("resolve");
        assert_eq!(projects.len(), 1);
        assert_eq!(
            projects[0]
                .options
                .get("cmake-options")
                .map(|v| v.as_str()),
            Some("-DEXTRA=1".to_string())
        );
    }

    #[test]
    fn declared_project_wins_over_catalog() {
        let projects = resolve_with(GROUPS, &["special-kcalc"], false).expect("resolve");
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].requested_branch().as_deref(), Some("work/my-feature"));
        assert_eq!(
            projects[0]
                .options
                .get("#resolved-repository")
                .map(|v| v.as_str()),
            Some("kde:utilities/kcalc.git".to_string())
        );
    }

    #[test]
    fn catalog_selector_expands_wildcards_filtered_by_active() {
        // P8.
        let projects = resolve_with(GROUPS, &["frameworks/*"], false).expect("resolve");
        let names: Vec<&str> = projects.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["kconfig", "ki18n"]);
    }

    #[test]
    fn inactive_projects_appear_when_enabled() {
        let config = GROUPS.replace(
            "include-dependencies: false",
            "include-dependencies: false\n  use-inactive-projects: true",
        );
        let projects = resolve_with(&config, &["frameworks/*"], false).expect("resolve");
        let names: Vec<&str> = projects.iter().map(|p| p.name.as_str()).collect();
        assert!(names.contains(&"kdewebkit"));
    }

    #[test]
    fn unknown_selector_is_an_error() {
        let err = resolve_with(GROUPS, &["does-not-exist"], false).expect_err("must fail");
        assert!(format!("{err:#}").contains("does-not-exist"));
    }

    #[test]
    fn no_selectors_no_flag_yields_empty_run() {
        // B2.
        let projects = resolve_with(GROUPS, &[], false).expect("resolve");
        assert!(projects.is_empty());
    }

    #[test]
    fn all_config_flag_yields_declaration_order() {
        // B1.
        let projects = resolve_with(GROUPS, &[], true).expect("resolve");
        let names: Vec<&str> = projects.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["special-kcalc", "kconfig", "ki18n"]);
    }

    #[test]
    fn run_list_has_no_duplicates() {
        // P1: selecting overlapping selectors dedupes by short name.
        let projects =
            resolve_with(GROUPS, &["frameworks", "kconfig", "frameworks/*"], false)
                .expect("resolve");
        let names: Vec<&str> = projects.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["kconfig", "ki18n"]);
    }

    #[test]
    fn raw_url_groups_join_base_and_name() {
        let config = r#"
config-version: 2
global: {}

group mine:
  repository: https://git.example.com/
  use-projects:
    - tool-a
    - tool-b
"#;
        let projects = resolve_with(config, &["mine"], false).expect("resolve");
        assert_eq!(projects.len(), 2);
        assert_eq!(
            projects[0]
                .options
                .get("#resolved-repository")
                .map(|v| v.as_str()),
            Some("https://git.example.com/tool-a.git".to_string())
        );
        assert!(!projects[0].is_catalog);
    }

    #[test]
    fn qt_supermodule_groups_tag_their_projects() {
        let config = r#"
config-version: 2
global: {}

group qt6-set:
  repository: https://code.qt.io/qt/
  use-projects:
    - qtbase
"#;
        let projects = resolve_with(config, &["qt6-set"], false).expect("resolve");
        assert_eq!(projects[0].origin, ProjectOrigin::QtGroup);
    }

    #[test]
    fn ignore_selectors_drop_projects_and_groups() {
        let doc = parse(GROUPS);
        let mut ctx = BuildContext::new(PathBuf::from("/tmp"));
        ctx.global = doc.global.clone();
        let catalog = catalog();
        let mut resolver = Resolver::new(&doc, &ctx, Some(&catalog), None);
        let resolved = resolver
            .resolve(
                &["frameworks".to_string(), "kcalc".to_string()],
                &["frameworks".to_string()],
                false,
            )
            .expect("resolve");
        let names: Vec<&str> = resolved.projects.iter().map(|p| p.name.as_str()).collect();
        // Everything from the ignored group is gone.
        assert_eq!(names, vec!["kcalc"]);
    }

    #[test]
    fn branch_group_elision_filters_before_the_graph() {
        // P7.
        let mut groups = BTreeMap::new();
        let mut per = BTreeMap::new();
        per.insert("kf6-qt6".to_string(), String::new());
        groups.insert("utilities/kcalc".to_string(), per);
        let mut catch_all = BTreeMap::new();
        catch_all.insert("kf6-qt6".to_string(), "master".to_string());
        groups.insert("*".to_string(), catch_all);
        let branch_groups = BranchGroupResolver::from_groups(groups);

        let doc = parse("config-version: 2\nglobal: {}\n");
        let mut ctx = BuildContext::new(PathBuf::from("/tmp"));
        ctx.global = doc.global.clone();
        let catalog = catalog();
        let mut resolver = Resolver::new(&doc, &ctx, Some(&catalog), Some(&branch_groups));
        let resolved = resolver
            .resolve(&["kcalc".to_string(), "dolphin".to_string()], &[], false)
            .expect("resolve");
        let names: Vec<&str> = resolved.projects.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["dolphin"]);
        assert_eq!(
            resolved.projects[0].requested_branch().as_deref(),
            Some("master")
        );
    }

    #[test]
    fn dependency_factory_creates_catalog_projects() {
        let doc = parse("config-version: 2\nglobal: {}\n");
        let mut ctx = BuildContext::new(PathBuf::from("/tmp"));
        ctx.global = doc.global.clone();
        let catalog = catalog();
        let mut resolver = Resolver::new(&doc, &ctx, Some(&catalog), None);

        let mut projects = Vec::new();
        {
            let mut factory = resolver.dependency_project_factory();
            let idx = factory("kconfig", &mut projects).expect("created");
            assert_eq!(projects[idx].name, "kconfig");
            assert!(projects[idx].is_catalog);
            assert!(factory("not-in-catalog", &mut projects).is_none());
        }
    }
}
