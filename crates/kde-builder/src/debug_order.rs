//! Ranking of build failures from most to least interesting.
//!
//! A project that failed is likely to knock out everything depending on
//! it, so the report leads with probable root causes: dependency order
//! first, then root-ness, then popularity, then the failing phase, then
//! how new the failure is.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::graph::ModuleGraph;
use crate::phases::Phase;

/// Install failures "rarely" happen and usually mean system trouble; test
/// failures were explicitly asked for; update failures are often transient.
fn phase_score(phase: Option<Phase>) -> u8 {
    match phase {
        Some(Phase::Install) => 4,
        Some(Phase::Test) => 3,
        Some(Phase::Build) => 2,
        Some(Phase::Update) => 1,
        _ => 0,
    }
}

/// Extra signals for the ranking, gathered by the application.
#[derive(Debug, Default)]
pub struct DebugInfo {
    /// Failing phase per project name.
    pub phases: BTreeMap<String, Phase>,
    /// Persistent failure count per project name, before this run.
    pub fail_counts: BTreeMap<String, i64>,
}

pub fn compare_debug_order(
    graph: &ModuleGraph,
    info: &DebugInfo,
    name_a: &str,
    name_b: &str,
) -> Ordering {
    let node_a = &graph.nodes[name_a];
    let node_b = &graph.nodes[name_b];

    // If A depends on B and B is broken, A's failure is probably noise.
    let b_depends_on_a = node_a.votes.contains_key(name_b);
    let a_depends_on_b = node_b.votes.contains_key(name_a);
    match (b_depends_on_a, a_depends_on_b) {
        (true, _) => return Ordering::Less,
        (_, true) => return Ordering::Greater,
        _ => {}
    }

    // Favour roots over leaves: failures without dependencies cannot be
    // blamed on anything else.
    let is_root_a = node_a.deps.is_empty();
    let is_root_b = node_b.deps.is_empty();
    match (is_root_a, is_root_b) {
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        _ => {}
    }

    match node_b.votes.len().cmp(&node_a.votes.len()) {
        Ordering::Equal => {}
        ord => return ord,
    }

    let phase_a = phase_score(info.phases.get(name_a).copied());
    let phase_b = phase_score(info.phases.get(name_b).copied());
    match phase_b.cmp(&phase_a) {
        Ordering::Equal => {}
        ord => return ord,
    }

    // Persistently failing projects are stale news; fresh failures first.
    let fails_a = info.fail_counts.get(name_a).copied().unwrap_or(0);
    let fails_b = info.fail_counts.get(name_b).copied().unwrap_or(0);
    match fails_a.cmp(&fails_b) {
        Ordering::Equal => {}
        ord => return ord,
    }

    name_a.cmp(name_b)
}

/// Sort failed project names, most interesting first.
pub fn sort_failures_in_debug_order(
    graph: &ModuleGraph,
    info: &DebugInfo,
    failures: &[String],
) -> Vec<String> {
    let mut out: Vec<String> = failures
        .iter()
        .filter(|name| graph.nodes.contains_key(*name))
        .cloned()
        .collect();
    out.sort_by(|a, b| compare_debug_order(graph, info, a, b));
    // Names unknown to the graph go last, in stable order.
    out.extend(
        failures
            .iter()
            .filter(|name| !graph.nodes.contains_key(*name))
            .cloned(),
    );
    out
}
