//! Dependency graph over discovered modules.
//!
//! Nodes are kept in discovery order and reference each other by index.
//! The graph is only ever touched under the loader's admission guard.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};

use tracing::{debug, warn};

use crate::context::{ModuleContext, ModuleState};
use crate::error::{UnresolvedModule, UnresolvedReason};
use crate::id::ModuleId;

struct ModuleNode {
    context: Arc<ModuleContext>,
    dependencies: Vec<usize>,
    dependants: Vec<usize>,
    reasons: Vec<UnresolvedReason>,
}

impl ModuleNode {
    fn new(context: Arc<ModuleContext>) -> Self {
        Self {
            context,
            dependencies: Vec::new(),
            dependants: Vec::new(),
            reasons: Vec::new(),
        }
    }
}

#[derive(Default)]
pub(crate) struct ModuleGraph {
    nodes: Vec<ModuleNode>,
}

impl ModuleGraph {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Contexts in discovery order.
    pub(crate) fn contexts(&self) -> impl Iterator<Item = &Arc<ModuleContext>> {
        self.nodes.iter().map(|n| &n.context)
    }

    pub(crate) fn context(&self, index: usize) -> Option<&Arc<ModuleContext>> {
        self.nodes.get(index).map(|n| &n.context)
    }

    pub(crate) fn position_of(&self, id: ModuleId) -> Option<usize> {
        self.nodes.iter().position(|n| n.context.id() == id)
    }

    pub(crate) fn position_of_dir(&self, directory: &Path) -> Option<usize> {
        self.nodes
            .iter()
            .position(|n| n.context.directory() == Some(directory))
    }

    pub(crate) fn insert(&mut self, context: Arc<ModuleContext>) -> usize {
        self.nodes.push(ModuleNode::new(context));
        self.nodes.len().saturating_sub(1)
    }

    /// Remove a node. Edges are stale until the next [`rebuild`](Self::rebuild).
    pub(crate) fn remove(&mut self, index: usize) -> Option<Arc<ModuleContext>> {
        (index < self.nodes.len()).then(|| self.nodes.remove(index).context)
    }

    pub(crate) fn dependencies(&self, index: usize) -> &[usize] {
        self.nodes
            .get(index)
            .map_or(&[], |n| n.dependencies.as_slice())
    }

    pub(crate) fn dependants(&self, index: usize) -> &[usize] {
        self.nodes.get(index).map_or(&[], |n| n.dependants.as_slice())
    }

    pub(crate) fn reasons(&self, index: usize) -> &[UnresolvedReason] {
        self.nodes.get(index).map_or(&[], |n| n.reasons.as_slice())
    }

    /// Recompute every edge, resolved flag and pre-load state.
    pub(crate) fn rebuild(&mut self) {
        let positions: HashMap<ModuleId, usize> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.context.id(), i))
            .collect();

        for node in &mut self.nodes {
            node.dependencies.clear();
            node.dependants.clear();
            node.reasons.clear();
            node.context.set_resolved(false);
        }

        let mut edges = Vec::new();
        for (index, node) in self.nodes.iter_mut().enumerate() {
            let descriptor = node.context.descriptor();
            for requirement in &descriptor.dependencies {
                let Some(&target) = positions.get(&requirement.id) else {
                    warn!(
                        module_id = %descriptor.id,
                        dependency = %requirement.id,
                        "Dependency not found"
                    );
                    node.reasons.push(UnresolvedReason::Missing {
                        dependency: requirement.id,
                    });
                    continue;
                };
                edges.push((index, target, requirement.clone()));
            }
        }

        for (from, to, requirement) in edges {
            let found = self.nodes[to].context.descriptor().version.clone();
            if !requirement.is_satisfied_by(&found) {
                let node = &mut self.nodes[from];
                warn!(
                    module_id = %node.context.id(),
                    dependency = %requirement.id,
                    required = %requirement.minimum_version,
                    found = %found,
                    "Dependency version too low"
                );
                node.reasons.push(UnresolvedReason::VersionTooLow {
                    dependency: requirement.id,
                    required: requirement.minimum_version,
                    found,
                });
                continue;
            }
            if !self.nodes[from].dependencies.contains(&to) {
                self.nodes[from].dependencies.push(to);
                self.nodes[to].dependants.push(from);
            }
        }

        for index in 0..self.nodes.len() {
            if self.on_cycle(index) {
                warn!(
                    module_id = %self.nodes[index].context.id(),
                    "Module is part of a dependency cycle"
                );
                self.nodes[index].reasons.push(UnresolvedReason::Cycle);
            }
        }

        for node in &self.nodes {
            let link = |indices: &[usize]| -> Vec<Weak<ModuleContext>> {
                indices
                    .iter()
                    .map(|&i| Arc::downgrade(&self.nodes[i].context))
                    .collect()
            };
            let context = &node.context;
            context.set_links(link(&node.dependencies), link(&node.dependants));

            let resolved = node.reasons.is_empty();
            context.set_resolved(resolved);
            if !context.state().is_resident() {
                context.set_state(ModuleState::Resolving);
                context.set_state(if resolved {
                    ModuleState::Loadable
                } else {
                    ModuleState::Unresolved
                });
            }
        }
        debug!(modules = self.nodes.len(), "Dependency graph rebuilt");
    }

    /// Whether `start` can reach itself through dependency edges.
    fn on_cycle(&self, start: usize) -> bool {
        let mut visited = vec![false; self.nodes.len()];
        let mut stack: Vec<usize> = self.nodes[start].dependencies.clone();
        while let Some(current) = stack.pop() {
            if current == start {
                return true;
            }
            if std::mem::replace(&mut visited[current], true) {
                continue;
            }
            stack.extend_from_slice(&self.nodes[current].dependencies);
        }
        false
    }

    /// Transitive dependencies of `index`, deepest first.
    ///
    /// Depth is the longest dependency path from `index`. Ties keep
    /// discovery order.
    pub(crate) fn boundary_order(&self, index: usize) -> Vec<usize> {
        let count = self.nodes.len();
        let mut depth: Vec<Option<usize>> = vec![None; count];
        if index >= count {
            return Vec::new();
        }
        depth[index] = Some(0);

        // Longest-path relaxation; bounded so cycles cannot spin forever.
        for _ in 0..count {
            let mut changed = false;
            for current in 0..count {
                let Some(level) = depth[current] else {
                    continue;
                };
                let next = level.saturating_add(1);
                for &dependency in &self.nodes[current].dependencies {
                    if depth[dependency].is_none_or(|d| d < next) {
                        depth[dependency] = Some(next);
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }

        let mut order: Vec<(usize, usize)> = depth
            .iter()
            .enumerate()
            .filter(|&(i, _)| i != index)
            .filter_map(|(i, d)| d.map(|d| (i, d)))
            .collect();
        order.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        order.into_iter().map(|(i, _)| i).collect()
    }

    /// Modules that failed to resolve, with their reasons.
    pub(crate) fn unresolved(&self) -> Vec<UnresolvedModule> {
        self.nodes
            .iter()
            .filter(|n| !n.reasons.is_empty())
            .map(|n| UnresolvedModule {
                id: n.context.id(),
                reasons: n.reasons.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use semver::Version;

    use super::*;
    use crate::descriptor::ModuleDescriptor;
    use crate::entry::EntryType;

    fn id(n: u128) -> ModuleId {
        ModuleId::from_u128(n)
    }

    fn add(graph: &mut ModuleGraph, descriptor: ModuleDescriptor) -> Arc<ModuleContext> {
        let context = ModuleContext::managed(descriptor, EntryType::new("Probe"));
        graph.insert(Arc::clone(&context));
        context
    }

    fn module(n: u128) -> ModuleDescriptor {
        ModuleDescriptor::new(id(n), format!("m{n}.module")).with_version(Version::new(1, 0, 0))
    }

    #[test]
    fn chain_links_both_directions() {
        let mut graph = ModuleGraph::new();
        let a = add(&mut graph, module(1).with_dependency(id(2), Version::new(1, 0, 0)));
        let b = add(&mut graph, module(2).with_dependency(id(3), Version::new(0, 5, 0)));
        let c = add(&mut graph, module(3));
        graph.rebuild();

        assert_eq!(graph.dependencies(0), [1]);
        assert_eq!(graph.dependants(1), [0]);
        assert_eq!(graph.dependencies(1), [2]);
        for context in [&a, &b, &c] {
            assert!(context.is_resolved());
            assert_eq!(context.state(), ModuleState::Loadable);
        }
        assert_eq!(a.dependencies()[0].id(), id(2));
        assert_eq!(c.dependants()[0].id(), id(2));
        assert_eq!(graph.boundary_order(0), vec![2, 1]);
        assert!(graph.unresolved().is_empty());
    }

    #[test]
    fn missing_and_outdated_dependencies_are_unresolved() {
        let mut graph = ModuleGraph::new();
        let a = add(&mut graph, module(1).with_dependency(id(9), Version::new(1, 0, 0)));
        let b = add(&mut graph, module(2).with_dependency(id(3), Version::new(2, 0, 0)));
        add(&mut graph, module(3));
        graph.rebuild();

        assert_eq!(a.state(), ModuleState::Unresolved);
        assert_eq!(b.state(), ModuleState::Unresolved);
        assert!(graph.dependencies(1).is_empty());
        assert_eq!(
            graph.reasons(1),
            [UnresolvedReason::VersionTooLow {
                dependency: id(3),
                required: Version::new(2, 0, 0),
                found: Version::new(1, 0, 0),
            }]
        );
        let unresolved = graph.unresolved();
        assert_eq!(unresolved.len(), 2);
        assert_eq!(unresolved[0].reasons, [UnresolvedReason::Missing { dependency: id(9) }]);
    }

    #[test]
    fn cycles_are_detected() {
        let mut graph = ModuleGraph::new();
        let a = add(&mut graph, module(1).with_dependency(id(2), Version::new(1, 0, 0)));
        let b = add(&mut graph, module(2).with_dependency(id(1), Version::new(1, 0, 0)));
        let c = add(&mut graph, module(3).with_dependency(id(1), Version::new(1, 0, 0)));
        graph.rebuild();

        assert_eq!(a.state(), ModuleState::Unresolved);
        assert_eq!(b.state(), ModuleState::Unresolved);
        assert_eq!(graph.reasons(0), [UnresolvedReason::Cycle]);
        // Depends on the cycle but is not on it.
        assert!(c.is_resolved());
        assert_eq!(graph.boundary_order(2).len(), 2);
    }

    #[test]
    fn diamond_orders_shared_base_first() {
        let mut graph = ModuleGraph::new();
        add(
            &mut graph,
            module(1)
                .with_dependency(id(2), Version::new(1, 0, 0))
                .with_dependency(id(3), Version::new(1, 0, 0))
                .with_dependency(id(4), Version::new(1, 0, 0)),
        );
        add(&mut graph, module(2).with_dependency(id(4), Version::new(1, 0, 0)));
        add(&mut graph, module(3));
        add(&mut graph, module(4));
        graph.rebuild();

        assert_eq!(graph.boundary_order(0), vec![3, 1, 2]);
    }

    #[test]
    fn removal_then_rebuild_unlinks() {
        let mut graph = ModuleGraph::new();
        let a = add(&mut graph, module(1).with_dependency(id(2), Version::new(1, 0, 0)));
        add(&mut graph, module(2));
        graph.rebuild();
        assert!(a.is_resolved());

        let removed = graph.remove(graph.position_of(id(2)).unwrap()).unwrap();
        assert_eq!(removed.id(), id(2));
        assert!(graph.remove(5).is_none());
        graph.rebuild();
        assert_eq!(graph.len(), 1);
        assert!(!a.is_resolved());
        assert!(a.dependencies().is_empty());
    }
}
