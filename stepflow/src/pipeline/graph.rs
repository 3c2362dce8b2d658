//! Dependency graph bookkeeping for [`DagPipeline`](super::DagPipeline).

use crate::errors::{CircularDependencyError, FlowError, MissingDependencyError};
use std::collections::{HashMap, HashSet};

/// Step name to declared dependency names, plus declaration order.
///
/// Dependencies may name steps that are declared later. They are resolved
/// when the graph is traversed, at which point an undeclared name is an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    edges: HashMap<String, Vec<String>>,
    order: Vec<String>,
}

impl DependencyGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares `name` with its dependencies, replacing any earlier
    /// declaration while keeping its position.
    pub fn declare(&mut self, name: impl Into<String>, dependencies: Vec<String>) {
        let name = name.into();
        if !self.edges.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.edges.insert(name, dependencies);
    }

    /// Returns true if `name` was declared.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.edges.contains_key(name)
    }

    /// The declared dependencies of `name`.
    #[must_use]
    pub fn dependencies_of(&self, name: &str) -> Option<&[String]> {
        self.edges.get(name).map(Vec::as_slice)
    }

    /// Declared names in declaration order.
    #[must_use]
    pub fn declared(&self) -> &[String] {
        &self.order
    }

    /// Number of declared steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns true if nothing was declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Checks that every dependency is declared and that there are no cycles.
    pub fn validate(&self) -> Result<(), FlowError> {
        for name in &self.order {
            for dep in self.deps(name) {
                if !self.edges.contains_key(dep) {
                    return Err(MissingDependencyError::new(name.clone(), dep.clone()).into());
                }
            }
        }

        let mut visited: HashSet<&str> = HashSet::with_capacity(self.order.len());
        for name in &self.order {
            if !visited.contains(name.as_str()) {
                if let Some(cycle) = self.dfs_cycle(name, &mut visited) {
                    return Err(CircularDependencyError::new(cycle).into());
                }
            }
        }

        Ok(())
    }

    /// Returns every declared name with each dependency ahead of its
    /// dependents. Ties follow declaration order.
    pub fn sorted(&self) -> Result<Vec<String>, FlowError> {
        self.validate()?;

        let mut result = Vec::with_capacity(self.order.len());
        let mut visited: HashSet<&str> = HashSet::with_capacity(self.order.len());

        for name in &self.order {
            self.visit(name, &mut visited, &mut result);
        }

        Ok(result)
    }

    /// Partitions the graph into waves.
    ///
    /// A step lands in the first wave after all of its dependencies. Each
    /// wave is sorted by name.
    pub fn waves(&self) -> Result<Vec<Vec<String>>, FlowError> {
        let mut remaining = self.sorted()?;
        let mut placed: HashSet<String> = HashSet::with_capacity(remaining.len());
        let mut waves = Vec::new();

        while !remaining.is_empty() {
            let mut wave: Vec<String> = remaining
                .iter()
                .filter(|name| self.deps(name).iter().all(|dep| placed.contains(dep)))
                .cloned()
                .collect();

            if wave.is_empty() {
                return Err(FlowError::Internal(format!(
                    "No schedulable steps; remaining: {remaining:?}"
                )));
            }

            wave.sort();
            remaining.retain(|name| wave.binary_search(name).is_err());
            placed.extend(wave.iter().cloned());
            waves.push(wave);
        }

        Ok(waves)
    }

    /// Returns `name` and everything it transitively depends on, in
    /// declaration order.
    pub fn closure(&self, name: &str) -> Result<Vec<String>, FlowError> {
        if !self.contains(name) {
            return Err(FlowError::step_not_found(name));
        }

        let mut collected: HashSet<&str> = HashSet::new();
        let mut stack = vec![name];
        while let Some(current) = stack.pop() {
            if collected.insert(current) {
                stack.extend(self.deps(current).iter().map(String::as_str));
            }
        }

        Ok(self
            .order
            .iter()
            .filter(|n| collected.contains(n.as_str()))
            .cloned()
            .collect())
    }

    /// Returns the graph restricted to `names`.
    #[must_use]
    pub fn restricted_to(&self, names: &[String]) -> Self {
        let mut graph = Self::new();
        for name in self.order.iter().filter(|n| names.contains(n)) {
            graph.declare(name.clone(), self.deps(name).to_vec());
        }
        graph
    }

    /// Returns the union of two graphs. Shared names get the union of both
    /// dependency lists.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        let mut graph = self.clone();
        for name in &other.order {
            let mut deps = graph.deps(name).to_vec();
            for dep in other.deps(name) {
                if !deps.contains(dep) {
                    deps.push(dep.clone());
                }
            }
            graph.declare(name.clone(), deps);
        }
        graph
    }

    fn deps(&self, name: &str) -> &[String] {
        self.edges.get(name).map_or(&[], Vec::as_slice)
    }

    /// Post-order walk from `root`, appending each node after its
    /// dependencies. Frames hold a node and the index of its next dependency.
    fn visit<'a>(
        &'a self,
        root: &'a str,
        visited: &mut HashSet<&'a str>,
        result: &mut Vec<String>,
    ) {
        if !visited.insert(root) {
            return;
        }

        let mut stack: Vec<(&str, usize)> = vec![(root, 0)];
        while let Some(frame) = stack.last_mut() {
            let (node, next) = *frame;
            frame.1 += 1;
            match self.deps(node).get(next) {
                Some(dep) => {
                    if visited.insert(dep.as_str()) {
                        stack.push((dep.as_str(), 0));
                    }
                }
                None => {
                    result.push(node.to_string());
                    stack.pop();
                }
            }
        }
    }

    /// Depth-first search from `root` for a dependency edge back onto the
    /// current path. Returns the cycle with its first node repeated at the end.
    fn dfs_cycle<'a>(
        &'a self,
        root: &'a str,
        visited: &mut HashSet<&'a str>,
    ) -> Option<Vec<String>> {
        visited.insert(root);
        let mut on_path: HashSet<&str> = HashSet::from([root]);
        let mut stack: Vec<(&str, usize)> = vec![(root, 0)];

        while let Some(frame) = stack.last_mut() {
            let (node, next) = *frame;
            frame.1 += 1;
            match self.deps(node).get(next) {
                Some(dep) if on_path.contains(dep.as_str()) => {
                    let start = stack.iter().position(|(n, _)| *n == dep.as_str()).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        stack[start..].iter().map(|(n, _)| (*n).to_string()).collect();
                    cycle.push(dep.clone());
                    return Some(cycle);
                }
                Some(dep) => {
                    if visited.insert(dep.as_str()) {
                        on_path.insert(dep.as_str());
                        stack.push((dep.as_str(), 0));
                    }
                }
                None => {
                    on_path.remove(node);
                    stack.pop();
                }
            }
        }

        None
    }
}
