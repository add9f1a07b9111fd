//! Dependency graph used for cycle detection at creation time.
//!
//! Edges run from a task to the tasks it depends on (waits for).
//! Edges may point at ids that do not exist yet; those nodes simply have
//! no outgoing edges.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

#[derive(Debug, Default)]
pub struct DependencyGraph {
    edges: HashMap<Uuid, HashSet<Uuid>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_edges(edges: impl IntoIterator<Item = (Uuid, Uuid)>) -> Self {
        let mut graph = Self::new();
        for (task, depends_on) in edges {
            graph.add_dependency(task, depends_on);
        }
        graph
    }

    /// `task` waits for `depends_on`.
    pub fn add_dependency(&mut self, task: Uuid, depends_on: Uuid) {
        self.edges.entry(task).or_default().insert(depends_on);
    }

    /// Find a cycle reachable from any of `roots`. The returned path starts
    /// and ends with the same task.
    pub fn find_cycle_from(&self, roots: impl IntoIterator<Item = Uuid>) -> Option<Vec<Uuid>> {
        let mut color: HashMap<Uuid, Color> = HashMap::new();
        let mut path = Vec::new();
        for root in roots {
            if color.get(&root).copied().unwrap_or(Color::White) == Color::White {
                if let Some(cycle) = self.visit(root, &mut color, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    /// Iterative DFS so deep chains can't overflow the stack.
    fn visit(
        &self,
        root: Uuid,
        color: &mut HashMap<Uuid, Color>,
        path: &mut Vec<Uuid>,
    ) -> Option<Vec<Uuid>> {
        let mut stack: Vec<(Uuid, Vec<Uuid>)> = vec![(root, self.sorted_deps(root))];
        color.insert(root, Color::Gray);
        path.push(root);

        while let Some((node, pending)) = stack.last_mut() {
            match pending.pop() {
                Some(next) => match color.get(&next).copied().unwrap_or(Color::White) {
                    Color::Gray => {
                        let start = path.iter().position(|n| *n == next).unwrap_or(0);
                        let mut cycle = path[start..].to_vec();
                        cycle.push(next);
                        return Some(cycle);
                    }
                    Color::Black => {}
                    Color::White => {
                        color.insert(next, Color::Gray);
                        path.push(next);
                        let deps = self.sorted_deps(next);
                        stack.push((next, deps));
                    }
                },
                None => {
                    color.insert(*node, Color::Black);
                    path.pop();
                    stack.pop();
                }
            }
        }
        None
    }

    // Sorted so cycle reports are deterministic.
    fn sorted_deps(&self, node: Uuid) -> Vec<Uuid> {
        let mut deps: Vec<Uuid> = self
            .edges
            .get(&node)
            .map(|d| d.iter().copied().collect())
            .unwrap_or_default();
        deps.sort_unstable_by(|a, b| b.cmp(a));
        deps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<Uuid> {
        let mut v: Vec<Uuid> = (0..n).map(|_| Uuid::new_v4()).collect();
        v.sort();
        v
    }

    #[test]
    fn acyclic_chain() {
        let v = ids(3);
        let graph = DependencyGraph::from_edges([(v[2], v[1]), (v[1], v[0])]);
        assert!(graph.find_cycle_from(v.clone()).is_none());
    }

    #[test]
    fn detects_three_cycle() {
        let v = ids(3);
        let graph = DependencyGraph::from_edges([(v[0], v[1]), (v[1], v[2]), (v[2], v[0])]);
        let cycle = graph.find_cycle_from([v[0]]).unwrap();
        assert_eq!(cycle, vec![v[0], v[1], v[2], v[0]]);
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let v = ids(1);
        let graph = DependencyGraph::from_edges([(v[0], v[0])]);
        assert_eq!(graph.find_cycle_from([v[0]]).unwrap(), vec![v[0], v[0]]);
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let v = ids(4);
        let graph = DependencyGraph::from_edges([
            (v[3], v[1]),
            (v[3], v[2]),
            (v[1], v[0]),
            (v[2], v[0]),
        ]);
        assert!(graph.find_cycle_from([v[3]]).is_none());
    }

    #[test]
    fn long_chain_does_not_overflow() {
        let v = ids(20_000);
        let graph = DependencyGraph::from_edges(v.windows(2).map(|w| (w[1], w[0])));
        assert!(graph.find_cycle_from([v[v.len() - 1]]).is_none());
    }
}
