//! Dependency ordering of migration operations
//!
//! Operations are held in an arena indexed by position. Cycle detection
//! walks the arena with explicit visit marks; ordering then runs Kahn's
//! algorithm with a priority heap so ties resolve by ascending priority,
//! then by declaration order.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use super::operation::MigrationOperation;
use crate::error::{ErrorCode, Result, SchemaFlowError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Done,
}

/// Arena of operations with dependency edges resolved to indices
#[derive(Debug)]
pub struct OperationGraph<'a> {
    nodes: &'a [MigrationOperation],
    /// `edges[i]` lists the operations `i` depends on
    edges: Vec<Vec<usize>>,
}

impl<'a> OperationGraph<'a> {
    /// Resolve dependency ids. Ids in `satisfied` belong to operations that
    /// already ran earlier in the path and impose no ordering here.
    pub fn build(nodes: &'a [MigrationOperation], satisfied: &HashSet<String>) -> Result<Self> {
        let mut index = HashMap::with_capacity(nodes.len());
        for (i, op) in nodes.iter().enumerate() {
            if index.insert(op.id.as_str(), i).is_some() || satisfied.contains(&op.id) {
                return Err(SchemaFlowError::config_with_code(
                    ErrorCode::CONFIG_DUPLICATE_OPERATION,
                    format!("operation id '{}' is declared more than once", op.id),
                ));
            }
        }

        let mut edges = Vec::with_capacity(nodes.len());
        for op in nodes {
            let mut deps = Vec::new();
            for dep in &op.depends_on {
                if let Some(&i) = index.get(dep.as_str()) {
                    deps.push(i);
                } else if !satisfied.contains(dep) {
                    return Err(SchemaFlowError::config_with_code(
                        ErrorCode::CONFIG_UNKNOWN_DEPENDENCY,
                        format!("operation '{}' depends on unknown operation '{}'", op.id, dep),
                    ));
                }
            }
            edges.push(deps);
        }

        Ok(Self { nodes, edges })
    }

    /// Find a dependency cycle, returned as the ids along it
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut marks = vec![Mark::Unvisited; self.nodes.len()];

        for root in 0..self.nodes.len() {
            if marks[root] != Mark::Unvisited {
                continue;
            }
            // (node, next edge to explore)
            let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
            marks[root] = Mark::Visiting;

            while let Some(frame) = stack.last_mut() {
                let (node, edge) = *frame;
                frame.1 += 1;
                if let Some(&dep) = self.edges[node].get(edge) {
                    match marks[dep] {
                        Mark::Unvisited => {
                            marks[dep] = Mark::Visiting;
                            stack.push((dep, 0));
                        }
                        Mark::Visiting => {
                            let start = stack.iter().position(|(n, _)| *n == dep).unwrap_or(0);
                            let mut cycle: Vec<String> = stack[start..]
                                .iter()
                                .map(|(n, _)| self.nodes[*n].id.clone())
                                .collect();
                            cycle.push(self.nodes[dep].id.clone());
                            return Some(cycle);
                        }
                        Mark::Done => {}
                    }
                } else {
                    marks[node] = Mark::Done;
                    stack.pop();
                }
            }
        }
        None
    }

    /// Dependency-respecting order as arena indices
    pub fn order(&self) -> Result<Vec<usize>> {
        if let Some(cycle) = self.find_cycle() {
            return Err(SchemaFlowError::config_with_code(
                ErrorCode::CONFIG_CIRCULAR_DEPENDENCY,
                format!("circular operation dependency: {}", cycle.join(" -> ")),
            ));
        }

        let mut remaining: Vec<usize> = self.edges.iter().map(Vec::len).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for (node, deps) in self.edges.iter().enumerate() {
            for &dep in deps {
                dependents[dep].push(node);
            }
        }

        let mut ready: BinaryHeap<Reverse<(i32, usize)>> = remaining
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == 0)
            .map(|(i, _)| Reverse((self.nodes[i].priority, i)))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse((_, node))) = ready.pop() {
            order.push(node);
            for &dependent in &dependents[node] {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    ready.push(Reverse((self.nodes[dependent].priority, dependent)));
                }
            }
        }
        Ok(order)
    }
}

/// Order `ops` by dependencies, breaking ties by priority
pub fn order_operations(
    ops: &[MigrationOperation],
    satisfied: &HashSet<String>,
) -> Result<Vec<MigrationOperation>> {
    let graph = OperationGraph::build(ops, satisfied)?;
    Ok(graph.order()?.into_iter().map(|i| ops[i].clone()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn op(id: &str, priority: i32, deps: &[&str]) -> MigrationOperation {
        let mut op = MigrationOperation::add_field(id, "items", id, json!(null)).with_priority(priority);
        for dep in deps {
            op = op.depends_on(*dep);
        }
        op
    }

    fn ids(ops: &[MigrationOperation]) -> Vec<&str> {
        ops.iter().map(|o| o.id.as_str()).collect()
    }

    #[test]
    fn test_priority_breaks_ties() {
        let ops = vec![op("c", 3, &[]), op("a", 1, &[]), op("b", 2, &[])];
        let ordered = order_operations(&ops, &HashSet::new()).unwrap();
        assert_eq!(ids(&ordered), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_dependencies_beat_priority() {
        let ops = vec![op("first", 10, &[]), op("second", 0, &["first"]), op("other", 5, &[])];
        let ordered = order_operations(&ops, &HashSet::new()).unwrap();
        assert_eq!(ids(&ordered), vec!["other", "first", "second"]);
    }

    #[test]
    fn test_equal_priority_keeps_declaration_order() {
        let ops = vec![op("x", 0, &[]), op("y", 0, &[]), op("z", 0, &[])];
        let ordered = order_operations(&ops, &HashSet::new()).unwrap();
        assert_eq!(ids(&ordered), vec!["x", "y", "z"]);
    }

    #[test]
    fn test_cycle_is_reported_with_path() {
        let ops = vec![op("a", 0, &["c"]), op("b", 0, &["a"]), op("c", 0, &["b"])];
        let graph = OperationGraph::build(&ops, &HashSet::new()).unwrap();
        let cycle = graph.find_cycle().unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 4);

        let err = graph.order().unwrap_err();
        assert_eq!(err.code(), ErrorCode::CONFIG_CIRCULAR_DEPENDENCY);
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let ops = vec![op("a", 0, &["a"])];
        let err = order_operations(&ops, &HashSet::new()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CONFIG_CIRCULAR_DEPENDENCY);
    }

    #[test]
    fn test_unknown_and_satisfied_dependencies() {
        let ops = vec![op("a", 0, &["earlier"])];
        let err = order_operations(&ops, &HashSet::new()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CONFIG_UNKNOWN_DEPENDENCY);

        let satisfied: HashSet<String> = ["earlier".to_string()].into_iter().collect();
        assert_eq!(order_operations(&ops, &satisfied).unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let ops = vec![op("a", 0, &[]), op("a", 1, &[])];
        let err = order_operations(&ops, &HashSet::new()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CONFIG_DUPLICATE_OPERATION);
    }
}
