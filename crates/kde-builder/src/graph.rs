//! Dependency graph construction, cycle detection, vote propagation, and
//! the reproducible build-order sort.
//!
//! Nodes are short identifiers. Each node may refer back to a concrete
//! [`Project`] by index; dep targets unknown to the catalog become virtual
//! nodes (`module: None`, `build: false`) kept only for diagnostics.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, error};

use crate::deps::{DepRef, DependencyData};
use crate::project::Project;

#[derive(Debug, Default)]
pub struct GraphNode {
    pub votes: BTreeMap<String, u32>,
    pub path: String,
    pub build: bool,
    pub branch: Option<String>,
    pub deps: BTreeMap<String, DepRef>,
    /// Transitive dependency set, memoized by [`copy_up_dependencies`].
    pub all_deps: Option<BTreeSet<String>>,
    /// Index into the run's project list; `None` for virtual nodes.
    pub module: Option<usize>,
}

#[derive(Debug, Default)]
pub struct ModuleGraph {
    pub nodes: BTreeMap<String, GraphNode>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResolutionErrors {
    pub branch_errors: u32,
    pub path_errors: u32,
    pub trivial_cycles: u32,
    pub syntax_errors: u32,
    pub cycles: u32,
}

impl ResolutionErrors {
    pub fn is_fatal(&self) -> bool {
        self.branch_errors > 0
            || self.path_errors > 0
            || self.syntax_errors > 0
            || self.cycles > 0
    }
}

#[derive(Debug)]
pub struct GraphResult {
    /// `None` when resolution failed; see `errors`.
    pub graph: Option<ModuleGraph>,
    pub errors: ResolutionErrors,
}

/// Creates a [`Project`] for a dep target pulled in transitively, or
/// returns `None` for targets that should stay virtual.
pub type ProjectFactory<'a> = dyn FnMut(&str, &mut Vec<Project>) -> Option<usize> + 'a;

/// Build the graph from the selected projects, pulling in transitive
/// dependencies through the factory.
pub fn resolve_to_module_graph(
    projects: &mut Vec<Project>,
    seeds: &[usize],
    data: &DependencyData,
    factory: &mut ProjectFactory<'_>,
) -> GraphResult {
    let mut graph = ModuleGraph::default();
    let mut errors = ResolutionErrors::default();

    for &idx in seeds {
        let (item, branch, path, include_deps) = {
            let project = &projects[idx];
            (
                project.name.clone(),
                project.requested_branch(),
                project.dependency_path(),
                project
                    .options
                    .get("include-dependencies")
                    .map(|v| v.is_truthy())
                    .unwrap_or(true),
            )
        };

        if path.is_empty() {
            error!(%item, "unable to determine dependency path of project");
            errors.path_errors += 1;
            continue;
        }

        if let Some(node) = graph.nodes.get_mut(&item) {
            // Pulled in earlier through transitive deps; now it is selected
            // explicitly, so mark it for build and reconcile branches.
            debug!(%item, "project pulled in previously through dependencies");
            if branch_conflicts(node.branch.as_deref(), branch.as_deref()) {
                error!(%item, "dependency conflict in branches");
                errors.branch_errors += 1;
            } else if branch.is_some() {
                node.branch = branch;
            }
            node.build = true;
            node.module = Some(idx);
            continue;
        }

        let lookup = data.direct_dependencies(&path, branch.as_deref());
        errors.trivial_cycles += lookup.trivial_cycles;
        errors.syntax_errors += lookup.syntax_errors;

        graph.nodes.insert(
            item.clone(),
            GraphNode {
                votes: BTreeMap::new(),
                path,
                build: true,
                branch,
                deps: lookup.dependencies,
                all_deps: None,
                module: Some(idx),
            },
        );

        resolve_deps_of(&mut graph, projects, &item, include_deps, data, factory, &mut errors);
    }

    if errors.branch_errors > 0 || errors.path_errors > 0 || errors.syntax_errors > 0 {
        error!("unable to resolve dependency graph");
        return GraphResult {
            graph: None,
            errors,
        };
    }

    errors.cycles = check_dependency_cycles(&graph);
    if errors.cycles > 0 {
        error!(cycles = errors.cycles, "unable to resolve dependency graph");
        return GraphResult {
            graph: None,
            errors,
        };
    }

    copy_up_dependencies(&mut graph);
    run_dependency_vote(&mut graph);
    GraphResult {
        graph: Some(graph),
        errors,
    }
}

fn branch_conflicts(selected: Option<&str>, wanted: Option<&str>) -> bool {
    match (selected, wanted) {
        (Some(a), Some(b)) => a != b,
        _ => false,
    }
}

fn resolve_deps_of(
    graph: &mut ModuleGraph,
    projects: &mut Vec<Project>,
    item: &str,
    include_deps: bool,
    data: &DependencyData,
    factory: &mut ProjectFactory<'_>,
    errors: &mut ResolutionErrors,
) {
    let dep_refs: Vec<DepRef> = graph.nodes[item].deps.values().cloned().collect();

    for dep in dep_refs {
        debug!(item, dep = %dep.item, "resolving dependency edge");

        if let Some(node) = graph.nodes.get_mut(&dep.item) {
            if branch_conflicts(node.branch.as_deref(), dep.branch.as_deref()) {
                error!(
                    dep = %dep.item,
                    "dependency conflict in branches ({:?} is not {:?})",
                    node.branch,
                    dep.branch
                );
                errors.branch_errors += 1;
            } else if dep.branch.is_some() {
                node.branch = dep.branch.clone();
            }
            continue;
        }

        let module_idx = factory(&dep.item, projects);
        let resolved_path = match module_idx {
            Some(idx) => projects[idx].dependency_path(),
            // Virtual or misspelled target; keep the declared path.
            None => dep.path.clone(),
        };
        if module_idx.is_none() {
            debug!(dep = %dep.item, "will not build virtual or undefined project");
        }

        let lookup = data.direct_dependencies(&resolved_path, dep.branch.as_deref());
        errors.trivial_cycles += lookup.trivial_cycles;
        errors.syntax_errors += lookup.syntax_errors;

        if let (Some(idx), Some(pin)) = (module_idx, dep.branch.as_deref()) {
            if let Some(own) = projects[idx].requested_branch() {
                if own != pin {
                    error!(item, dep = %dep.item, pin, %own, "dependency needs a different branch");
                    errors.branch_errors += 1;
                }
            }
        }

        graph.nodes.insert(
            dep.item.clone(),
            GraphNode {
                votes: BTreeMap::new(),
                path: resolved_path,
                build: include_deps && module_idx.is_some(),
                branch: dep.branch.clone(),
                deps: lookup.dependencies,
                all_deps: None,
                module: module_idx,
            },
        );

        resolve_deps_of(graph, projects, &dep.item, include_deps, data, factory, errors);
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Trace {
    InProgress,
    Done(bool),
}

/// Three-color depth-first search from every node. Returns the number of
/// nodes implicated in at least one cycle.
pub fn check_dependency_cycles(graph: &ModuleGraph) -> u32 {
    let mut traces: BTreeMap<&str, Trace> = BTreeMap::new();
    let mut errors = 0;
    for item in graph.nodes.keys() {
        if detect_cycle(graph, &mut traces, item, item) {
            error!(%item, "circular dependency detected");
            errors += 1;
        }
    }
    errors
}

fn detect_cycle<'g>(
    graph: &'g ModuleGraph,
    traces: &mut BTreeMap<&'g str, Trace>,
    dep_item: &'g str,
    item: &str,
) -> bool {
    match traces.get(dep_item) {
        Some(Trace::Done(result)) => return *result,
        Some(Trace::InProgress) => {
            error!(dep_item, item, "found a dependency cycle");
            traces.insert(dep_item, Trace::Done(true));
            return true;
        }
        None => {}
    }
    traces.insert(dep_item, Trace::InProgress);

    let mut result = false;
    if let Some(node) = graph.nodes.get(dep_item) {
        for name in node.deps.keys() {
            if graph.nodes.contains_key(name) && detect_cycle(graph, traces, name, item) {
                result = true;
            }
        }
    }
    traces.insert(dep_item, Trace::Done(result));
    result
}

/// Fill `all_deps` for every node: direct deps plus each direct dep's
/// transitive set, memoized depth-first.
pub fn copy_up_dependencies(graph: &mut ModuleGraph) {
    let items: Vec<String> = graph.nodes.keys().cloned().collect();
    for item in items {
        copy_up_for(graph, &item);
    }
}

fn copy_up_for(graph: &mut ModuleGraph, item: &str) -> BTreeSet<String> {
    if let Some(done) = graph.nodes.get(item).and_then(|n| n.all_deps.clone()) {
        return done;
    }
    let direct: Vec<String> = graph
        .nodes
        .get(item)
        .map(|n| n.deps.keys().cloned().collect())
        .unwrap_or_default();

    let mut all: BTreeSet<String> = BTreeSet::new();
    for name in direct {
        if graph.nodes.contains_key(&name) {
            all.extend(copy_up_for(graph, &name));
        }
        all.insert(name);
    }
    if let Some(node) = graph.nodes.get_mut(item) {
        node.all_deps = Some(all.clone());
    }
    all
}

/// For every node, every transitive dependency gets one vote from it.
pub fn run_dependency_vote(graph: &mut ModuleGraph) {
    let edges: Vec<(String, Vec<String>)> = graph
        .nodes
        .iter()
        .map(|(item, node)| {
            (
                item.clone(),
                node.all_deps.iter().flatten().cloned().collect(),
            )
        })
        .collect();
    for (item, deps) in edges {
        for name in deps {
            if let Some(node) = graph.nodes.get_mut(&name) {
                *node.votes.entry(item.clone()).or_insert(0) += 1;
            }
        }
    }
}

/// Total order for distinct nodes: dependency relation first, then more
/// votes, then smaller declaration id, then name.
pub fn compare_build_order(
    graph: &ModuleGraph,
    projects: &[Project],
    a: &str,
    b: &str,
) -> Ordering {
    let a_votes = &graph.nodes[a].votes;
    let b_votes = &graph.nodes[b].votes;

    // A strict dependency relation dominates. Both directions true would be
    // a cycle, which detection has already excluded.
    let b_depends_on_a = a_votes.contains_key(b);
    let a_depends_on_b = b_votes.contains_key(a);
    match (b_depends_on_a, a_depends_on_b) {
        (true, _) => return Ordering::Less,
        (_, true) => return Ordering::Greater,
        _ => {}
    }

    // More votes builds earlier: popular nodes unlock more of the graph.
    match b_votes.len().cmp(&a_votes.len()) {
        Ordering::Equal => {}
        ord => return ord,
    }

    let a_id = graph.nodes[a].module.map(|i| projects[i].create_id);
    let b_id = graph.nodes[b].module.map(|i| projects[i].create_id);
    if let (Some(a_id), Some(b_id)) = (a_id, b_id) {
        match a_id.cmp(&b_id) {
            Ordering::Equal => {}
            ord => return ord,
        }
    }

    a.cmp(b)
}

/// The build order: every `build == true` node with a backing project,
/// sorted by [`compare_build_order`]. Virtual nodes are omitted.
pub fn sort_into_build_order(graph: &ModuleGraph, projects: &[Project]) -> Vec<usize> {
    let mut names: Vec<&String> = graph
        .nodes
        .iter()
        .filter(|(_, node)| node.build && node.module.is_some())
        .map(|(name, _)| name)
        .collect();
    names.sort_by(|a, b| compare_build_order(graph, projects, a, b));
    names
        .into_iter()
        .map(|name| graph.nodes[name].module.expect("filtered above"))
        .collect()
}
