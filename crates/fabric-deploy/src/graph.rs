//! Same-kind dependency ordering.
//!
//! Nodes are item names. An edge `referenced -> referencing` means the
//! referenced item must exist before the referencing one is published.
//! Ordering is Kahn's algorithm with a FIFO ready queue, so ties are broken
//! by the order nodes were first registered.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("There is a cycle in the graph. Cannot determine a valid publish order.")]
pub struct CycleError;

#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    nodes: Vec<String>,
    index: BTreeMap<String, usize>,
    dependents: Vec<Vec<usize>>,
    in_degree: Vec<usize>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from `(item, referenced items)` pairs.
    ///
    /// Every item is registered before any edge, so items seed the ready
    /// queue in iteration order and referenced-only names follow.
    pub fn from_references<I>(references: I) -> Self
    where
        I: IntoIterator<Item = (String, Vec<String>)>,
    {
        let references: Vec<_> = references.into_iter().collect();
        let mut graph = Self::new();
        for (item, _) in &references {
            graph.add_item(item);
        }
        for (item, referenced) in &references {
            for target in referenced {
                graph.add_dependency(target, item);
            }
        }
        graph
    }

    fn node(&mut self, name: &str) -> usize {
        if let Some(&id) = self.index.get(name) {
            return id;
        }
        let id = self.nodes.len();
        self.nodes.push(name.to_string());
        self.index.insert(name.to_string(), id);
        self.dependents.push(Vec::new());
        self.in_degree.push(0);
        id
    }

    pub fn add_item(&mut self, name: &str) {
        self.node(name);
    }

    /// Record that `referencing` depends on `referenced`.
    ///
    /// Self references and repeated edges are ignored.
    pub fn add_dependency(&mut self, referenced: &str, referencing: &str) {
        if referenced == referencing {
            return;
        }
        let from = self.node(referenced);
        let to = self.node(referencing);
        if self.dependents[from].contains(&to) {
            return;
        }
        self.dependents[from].push(to);
        self.in_degree[to] += 1;
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Names that depend on `name`, in edge insertion order.
    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        self.index
            .get(name)
            .map(|&id| {
                self.dependents[id]
                    .iter()
                    .map(|&dep| self.nodes[dep].as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every node, dependencies before dependents.
    pub fn publish_order(&self) -> Result<Vec<String>, CycleError> {
        let mut in_degree = self.in_degree.clone();
        let mut ready: VecDeque<usize> = (0..self.nodes.len())
            .filter(|&id| in_degree[id] == 0)
            .collect();
        let mut out = Vec::with_capacity(self.nodes.len());

        while let Some(id) = ready.pop_front() {
            out.push(self.nodes[id].clone());
            for &dep in &self.dependents[id] {
                in_degree[dep] -= 1;
                if in_degree[dep] == 0 {
                    ready.push_back(dep);
                }
            }
        }

        if out.len() != self.nodes.len() {
            return Err(CycleError);
        }
        Ok(out)
    }

    /// Members of `to_remove`, dependents before dependencies.
    pub fn unpublish_order(&self, to_remove: &BTreeSet<String>) -> Result<Vec<String>, CycleError> {
        let mut order = self.publish_order()?;
        order.retain(|name| to_remove.contains(name));
        order.reverse();
        Ok(order)
    }
}
