// Copyright 2024 OctoFHIR Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Derivation ordering and cycle detection

use super::dependency::DependencySet;
use crate::error::ConfigurationError;
use crate::model::FieldPath;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// One derivation in the ordering graph
#[derive(Debug, Clone, Copy)]
pub struct DerivationNode<'a> {
    /// Value path the derivation writes; `None` for property derivations
    pub writes: Option<&'a FieldPath>,
    /// Paths the derivation reads
    pub dependencies: &'a DependencySet,
}

impl<'a> DerivationNode<'a> {
    /// Node writing the value at `writes`
    pub fn new(writes: Option<&'a FieldPath>, dependencies: &'a DependencySet) -> Self {
        Self {
            writes,
            dependencies,
        }
    }
}

/// Evaluation order of derivations
///
/// A derivation runs after every derivation writing a path it names. A
/// derivation reading the whole form also runs after the other writers,
/// except those that name its target, so it still precedes its readers.
/// Derivations reading themselves are not edges and only cycles among named
/// reads are errors. Ties keep declaration order.
pub fn derivation_order(nodes: &[DerivationNode<'_>]) -> Result<Vec<usize>, ConfigurationError> {
    let count = nodes.len();
    let mut graph = Graph::new(count);

    for (from, node) in nodes.iter().enumerate() {
        let Some(target) = node.writes else {
            continue;
        };
        for (to, reader) in nodes.iter().enumerate() {
            if from != to && names(reader.dependencies, target) {
                graph.add_edge(from, to);
            }
        }
    }
    if let Err(blocked) = graph.sort() {
        return Err(ConfigurationError::DerivationCycle {
            cycle: find_cycle(nodes, &graph.predecessors, &blocked),
        });
    }

    for (to, reader) in nodes.iter().enumerate() {
        if !reader.dependencies.is_whole_form() {
            continue;
        }
        for (from, writer) in nodes.iter().enumerate() {
            // whole-form writers only feed whole-form property derivations
            let feeds = writer.writes.is_some()
                && (!writer.dependencies.is_whole_form() || reader.writes.is_none());
            if from != to && feeds && !graph.reaches(to, from) {
                graph.add_edge(from, to);
            }
        }
    }

    graph.sort().map_err(|blocked| ConfigurationError::DerivationCycle {
        cycle: find_cycle(nodes, &graph.predecessors, &blocked),
    })
}

/// Whether `dependencies` names a path overlapping `target`, ignoring `*`
fn names(dependencies: &DependencySet, target: &FieldPath) -> bool {
    dependencies
        .paths()
        .any(|path| !path.is_wildcard() && path.overlaps(target))
}

struct Graph {
    successors: Vec<Vec<usize>>,
    predecessors: Vec<Vec<usize>>,
}

impl Graph {
    fn new(count: usize) -> Self {
        Self {
            successors: vec![Vec::new(); count],
            predecessors: vec![Vec::new(); count],
        }
    }

    fn add_edge(&mut self, from: usize, to: usize) {
        if !self.successors[from].contains(&to) {
            self.successors[from].push(to);
            self.predecessors[to].push(from);
        }
    }

    fn reaches(&self, from: usize, to: usize) -> bool {
        let mut visited = vec![false; self.successors.len()];
        let mut stack = vec![from];
        while let Some(index) = stack.pop() {
            if index == to {
                return true;
            }
            if std::mem::replace(&mut visited[index], true) {
                continue;
            }
            stack.extend(self.successors[index].iter().copied());
        }
        false
    }

    /// Kahn's algorithm with the lowest ready index first; on a cycle,
    /// the nodes that never became ready
    fn sort(&self) -> Result<Vec<usize>, Vec<bool>> {
        let count = self.successors.len();
        let mut in_degree: Vec<usize> = self.predecessors.iter().map(Vec::len).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = (0..count)
            .filter(|&index| in_degree[index] == 0)
            .map(Reverse)
            .collect();
        let mut order = Vec::with_capacity(count);

        while let Some(Reverse(index)) = ready.pop() {
            order.push(index);
            for &next in &self.successors[index] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }

        if order.len() < count {
            return Err(in_degree.iter().map(|&degree| degree > 0).collect());
        }
        Ok(order)
    }
}

/// Every blocked node has a blocked predecessor, so walking predecessors
/// from any of them must revisit a node.
fn find_cycle(
    nodes: &[DerivationNode<'_>],
    predecessors: &[Vec<usize>],
    blocked: &[bool],
) -> Vec<String> {
    let Some(start) = blocked.iter().position(|&flag| flag) else {
        return Vec::new();
    };

    let mut position = vec![None; nodes.len()];
    let mut walk = Vec::new();
    let mut current = start;
    let cycle_start = loop {
        if let Some(at) = position[current] {
            break at;
        }
        position[current] = Some(walk.len());
        walk.push(current);
        match predecessors[current].iter().copied().find(|&p| blocked[p]) {
            Some(previous) => current = previous,
            None => break 0,
        }
    };

    let mut cycle: Vec<String> = walk[cycle_start..]
        .iter()
        .rev()
        .map(|&index| label(&nodes[index]))
        .collect();
    if let Some(first) = cycle.first().cloned() {
        cycle.push(first);
    }
    cycle
}

fn label(node: &DerivationNode<'_>) -> String {
    node.writes
        .map(ToString::to_string)
        .unwrap_or_else(|| "<property>".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn path(s: &str) -> FieldPath {
        FieldPath::parse(s).unwrap()
    }

    fn deps(paths: &[&str]) -> DependencySet {
        paths.iter().map(|p| path(p)).collect()
    }

    #[test]
    fn test_chain_is_ordered_topologically() {
        // declared out of order: c = g(b), b = f(a)
        let (c, b) = (path("c"), path("b"));
        let (c_deps, b_deps) = (deps(&["b"]), deps(&["a"]));
        let nodes = [
            DerivationNode::new(Some(&c), &c_deps),
            DerivationNode::new(Some(&b), &b_deps),
        ];
        assert_eq!(derivation_order(&nodes).unwrap(), vec![1, 0]);
    }

    #[test]
    fn test_whole_form_runs_last() {
        let (summary, total) = (path("summary"), path("total"));
        let whole = DependencySet::whole_form();
        let total_deps = deps(&["qty", "price"]);
        let nodes = [
            DerivationNode::new(Some(&summary), &whole),
            DerivationNode::new(Some(&total), &total_deps),
        ];
        assert_eq!(derivation_order(&nodes).unwrap(), vec![1, 0]);
    }

    #[test]
    fn test_self_dependency_is_not_a_cycle() {
        let name = path("name");
        let name_deps = deps(&["name"]);
        let nodes = [DerivationNode::new(Some(&name), &name_deps)];
        assert_eq!(derivation_order(&nodes).unwrap(), vec![0]);
    }

    #[test]
    fn test_cycle_is_reported() {
        let (a, b, c) = (path("a"), path("b"), path("c"));
        let (a_deps, b_deps, c_deps) = (deps(&["b"]), deps(&["a"]), deps(&["a"]));
        let nodes = [
            DerivationNode::new(Some(&a), &a_deps),
            DerivationNode::new(Some(&b), &b_deps),
            DerivationNode::new(Some(&c), &c_deps),
        ];

        let Err(ConfigurationError::DerivationCycle { cycle }) = derivation_order(&nodes) else {
            panic!("expected a cycle");
        };
        assert_eq!(cycle.len(), 3);
        assert_eq!(cycle.first(), cycle.last());
        assert!(cycle.contains(&"a".to_string()) && cycle.contains(&"b".to_string()));
        assert!(!cycle.contains(&"c".to_string()));
    }

    #[test]
    fn test_property_derivations_follow_their_inputs() {
        // the property derivation reads `label`, whose writer also reads itself
        let label = path("label");
        let label_deps = deps(&["label"]);
        let other = deps(&["label"]);
        let nodes = [
            DerivationNode::new(None, &label_deps),
            DerivationNode::new(Some(&label), &other),
        ];
        assert_eq!(derivation_order(&nodes).unwrap(), vec![1, 0]);
    }

    #[test]
    fn test_whole_form_writer_precedes_its_readers() {
        // c = sum(a, b) declared before b = double(form)
        let (c, b) = (path("c"), path("b"));
        let c_deps = deps(&["a", "b"]);
        let whole = DependencySet::whole_form();
        let nodes = [
            DerivationNode::new(Some(&c), &c_deps),
            DerivationNode::new(Some(&b), &whole),
        ];
        assert_eq!(derivation_order(&nodes).unwrap(), vec![1, 0]);
    }

    #[test]
    fn test_whole_form_property_runs_after_every_writer() {
        let (summary, total) = (path("summary"), path("total"));
        let whole = DependencySet::whole_form();
        let total_deps = deps(&["qty"]);
        let nodes = [
            DerivationNode::new(None, &whole),
            DerivationNode::new(Some(&summary), &whole),
            DerivationNode::new(Some(&total), &total_deps),
        ];
        assert_eq!(derivation_order(&nodes).unwrap(), vec![2, 1, 0]);
    }
}
