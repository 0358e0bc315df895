//! Cycle detection over the `Blocks` dependency subgraph.
//!
//! Grounded on the arena-indexed graph approach used elsewhere in this
//! crate for semantic code graphs: build a `petgraph::graphmap::DiGraphMap`
//! over issue ids rather than hand-rolling pointer-chasing cycle detection.

use petgraph::algo::kosaraju_scc;
use petgraph::graphmap::DiGraphMap;

use super::types::{Dependency, DependencyKind};

/// Build a directed graph of `issue_id -> depends_on_id` edges restricted to
/// [`DependencyKind::Blocks`], then report the strongly-connected component
/// containing `start` if it has more than one member (a cycle).
pub fn detect_cycle_from(deps: &[Dependency], start: &str) -> Option<Vec<String>> {
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for dep in deps.iter().filter(|d| d.kind == DependencyKind::Blocks) {
        graph.add_edge(dep.issue_id.as_str(), dep.depends_on_id.as_str(), ());
    }

    if !graph.contains_node(start) {
        return None;
    }

    for component in kosaraju_scc(&graph) {
        if component.len() > 1 && component.contains(&start) {
            return Some(component.into_iter().map(str::to_string).collect());
        }
    }

    // A self-loop (issue depends on itself) is a one-node cycle that SCC
    // analysis alone won't flag.
    if graph.contains_edge(start, start) {
        return Some(vec![start.to_string()]);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dep(from: &str, to: &str) -> Dependency {
        Dependency {
            issue_id: from.to_string(),
            depends_on_id: to.to_string(),
            kind: DependencyKind::Blocks,
        }
    }

    #[test]
    fn no_cycle_in_dag() {
        let deps = vec![dep("a", "b"), dep("b", "c")];
        assert!(detect_cycle_from(&deps, "a").is_none());
    }

    #[test]
    fn detects_simple_cycle() {
        let deps = vec![dep("a", "b"), dep("b", "a")];
        let cycle = detect_cycle_from(&deps, "a").unwrap();
        assert_eq!(cycle.len(), 2);
    }

    #[test]
    fn detects_self_loop() {
        let deps = vec![dep("a", "a")];
        let cycle = detect_cycle_from(&deps, "a").unwrap();
        assert_eq!(cycle, vec!["a".to_string()]);
    }

    #[test]
    fn ignores_non_blocks_edges() {
        let deps = vec![Dependency {
            issue_id: "a".into(),
            depends_on_id: "b".into(),
            kind: DependencyKind::DiscoveredFrom,
        }];
        assert!(detect_cycle_from(&deps, "a").is_none());
    }
}
