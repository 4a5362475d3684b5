//! Dependency graph of resource declarations
//!
//! An edge `A -> B` means B needs A's identifier or outputs before it can be
//! submitted. [`StackGraph::build`] rejects duplicate ids, unknown
//! dependencies, undeclared output references and cycles, so every graph that
//! exists has a valid apply order.

use crate::error::GraphError;
use stackgraph_models::{ResourceDecl, ResourceId};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

#[derive(Debug, Clone)]
pub struct StackGraph {
    decls: Vec<ResourceDecl>,
    index: HashMap<ResourceId, usize>,
    /// dependents[i] = indices of resources that depend on resource i
    dependents: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl StackGraph {
    pub fn build(decls: Vec<ResourceDecl>) -> Result<Self, GraphError> {
        let mut index = HashMap::with_capacity(decls.len());
        for (i, decl) in decls.iter().enumerate() {
            if index.insert(decl.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateResource(decl.id.clone()));
            }
        }

        let mut dependents = vec![Vec::new(); decls.len()];
        let mut in_degree = vec![0usize; decls.len()];
        for (i, decl) in decls.iter().enumerate() {
            for reference in decl.references() {
                if !decl.depends_on.contains(&reference.resource) {
                    return Err(GraphError::UndeclaredReference {
                        resource: decl.id.clone(),
                        reference: reference.clone(),
                    });
                }
            }

            let mut seen = HashSet::new();
            for dependency in &decl.depends_on {
                let &dep = index
                    .get(dependency)
                    .ok_or_else(|| GraphError::UnknownDependency {
                        resource: decl.id.clone(),
                        dependency: dependency.clone(),
                    })?;
                if seen.insert(dep) {
                    dependents[dep].push(i);
                    in_degree[i] += 1;
                }
            }
        }

        // Kahn's algorithm; the ready set is ordered by declaration index so
        // the apply order is stable across runs
        let mut ready: BTreeSet<usize> = (0..decls.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(decls.len());
        while let Some(next) = ready.pop_first() {
            order.push(next);
            for &dependent in &dependents[next] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() != decls.len() {
            let cycle = on_cycle(&dependents, &in_degree)
                .into_iter()
                .map(|i| decls[i].id.clone())
                .collect();
            return Err(GraphError::Cycle(cycle));
        }

        Ok(Self {
            decls,
            index,
            dependents,
            order,
        })
    }

    pub fn len(&self) -> usize {
        self.decls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decls.is_empty()
    }

    pub fn get(&self, id: &ResourceId) -> Option<&ResourceDecl> {
        self.index.get(id).map(|&i| &self.decls[i])
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.index.contains_key(id)
    }

    /// Declarations in the order they were given
    pub fn decls(&self) -> &[ResourceDecl] {
        &self.decls
    }

    /// Topological order: every resource after everything it depends on
    pub fn apply_order(&self) -> Vec<&ResourceDecl> {
        self.order.iter().map(|&i| &self.decls[i]).collect()
    }

    /// Exact reverse of [`apply_order`](Self::apply_order)
    pub fn destroy_order(&self) -> Vec<&ResourceDecl> {
        self.order.iter().rev().map(|&i| &self.decls[i]).collect()
    }

    /// Every resource that transitively depends on `id`
    pub fn dependents_of(&self, id: &ResourceId) -> Vec<ResourceId> {
        let Some(&start) = self.index.get(id) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut queue: VecDeque<usize> = self.dependents[start].iter().copied().collect();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next) {
                queue.extend(self.dependents[next].iter().copied());
            }
        }
        self.ordered_ids(seen)
    }

    /// Every resource `id` transitively depends on
    pub fn dependencies_of(&self, id: &ResourceId) -> Vec<ResourceId> {
        let Some(&start) = self.index.get(id) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&ResourceId> = self.decls[start].depends_on.iter().collect();
        while let Some(next) = queue.pop_front() {
            if let Some(&i) = self.index.get(next) {
                if seen.insert(i) {
                    queue.extend(self.decls[i].depends_on.iter());
                }
            }
        }
        self.ordered_ids(seen)
    }

    /// Groups of resources whose dependencies all sit in earlier groups.
    /// Members of one wave could be created concurrently.
    pub fn waves(&self) -> Vec<Vec<ResourceId>> {
        let mut depth = vec![0usize; self.decls.len()];
        for &i in &self.order {
            for &dependent in &self.dependents[i] {
                depth[dependent] = depth[dependent].max(depth[i] + 1);
            }
        }

        let mut waves: Vec<Vec<ResourceId>> = Vec::new();
        for &i in &self.order {
            if waves.len() <= depth[i] {
                waves.resize_with(depth[i] + 1, Vec::new);
            }
            waves[depth[i]].push(self.decls[i].id.clone());
        }
        waves
    }

    fn ordered_ids(&self, members: HashSet<usize>) -> Vec<ResourceId> {
        self.order
            .iter()
            .filter(|i| members.contains(i))
            .map(|&i| self.decls[i].id.clone())
            .collect()
    }
}

/// Nodes Kahn's algorithm left behind that can reach themselves. Resources
/// that merely sit downstream of (or between) cycles are left out.
fn on_cycle(dependents: &[Vec<usize>], in_degree: &[usize]) -> Vec<usize> {
    let stuck = |i: usize| in_degree[i] > 0;
    (0..dependents.len())
        .filter(|&start| stuck(start))
        .filter(|&start| {
            let mut seen = HashSet::new();
            let mut queue: VecDeque<usize> = dependents[start].iter().copied().collect();
            while let Some(next) = queue.pop_front() {
                if next == start {
                    return true;
                }
                if stuck(next) && seen.insert(next) {
                    queue.extend(dependents[next].iter().copied());
                }
            }
            false
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackgraph_models::ResourceKind;

    fn decl(id: &str) -> ResourceDecl {
        ResourceDecl::new(id, ResourceKind::SnsTopic)
    }

    fn position(order: &[&ResourceDecl], id: &str) -> usize {
        order.iter().position(|d| d.id.as_str() == id).unwrap()
    }

    fn sample() -> StackGraph {
        StackGraph::build(vec![
            decl("function").output("role", "role", "arn").depends_on("topic"),
            decl("role"),
            decl("topic"),
            decl("target").output("arn", "function", "arn"),
        ])
        .unwrap()
    }

    #[test]
    fn apply_order_respects_every_edge() {
        let graph = sample();
        let order = graph.apply_order();
        assert_eq!(order.len(), 4);
        for decl in &order {
            for dep in &decl.depends_on {
                assert!(position(&order, dep.as_str()) < position(&order, decl.id.as_str()));
            }
        }
    }

    #[test]
    fn independent_resources_keep_declaration_order() {
        let graph = sample();
        let ids: Vec<&str> = graph.apply_order().iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["role", "topic", "function", "target"]);
    }

    #[test]
    fn destroy_order_is_reverse_of_apply_order() {
        let graph = sample();
        let mut apply: Vec<&str> = graph.apply_order().iter().map(|d| d.id.as_str()).collect();
        let destroy: Vec<&str> = graph.destroy_order().iter().map(|d| d.id.as_str()).collect();
        apply.reverse();
        assert_eq!(apply, destroy);
    }

    #[test]
    fn detects_cycles() {
        let err = StackGraph::build(vec![
            decl("a").depends_on("c"),
            decl("b").depends_on("a"),
            decl("c").depends_on("b"),
            decl("d"),
        ])
        .unwrap_err();
        assert_eq!(
            err,
            GraphError::Cycle(vec!["a".into(), "b".into(), "c".into()])
        );
    }

    #[test]
    fn cycle_error_leaves_out_downstream_resources() {
        let err = StackGraph::build(vec![
            decl("a").depends_on("b"),
            decl("b").depends_on("a"),
            decl("e").depends_on("a"),
            decl("x").depends_on("b"),
            decl("c").depends_on("x").depends_on("d"),
            decl("d").depends_on("c"),
        ])
        .unwrap_err();
        assert_eq!(
            err,
            GraphError::Cycle(vec!["a".into(), "b".into(), "c".into(), "d".into()])
        );
    }

    #[test]
    fn rejects_unknown_dependency() {
        let err = StackGraph::build(vec![decl("a").depends_on("ghost")]).unwrap_err();
        assert!(matches!(err, GraphError::UnknownDependency { .. }));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let err = StackGraph::build(vec![decl("a"), decl("a")]).unwrap_err();
        assert_eq!(err, GraphError::DuplicateResource("a".into()));
    }

    #[test]
    fn rejects_reference_without_dependency() {
        let mut function = decl("function").output("role", "role", "arn");
        function.depends_on.clear();
        let err = StackGraph::build(vec![decl("role"), function]).unwrap_err();
        assert!(matches!(err, GraphError::UndeclaredReference { .. }));
    }

    #[test]
    fn transitive_dependents_and_dependencies() {
        let graph = sample();
        assert_eq!(
            graph.dependents_of(&"role".into()),
            vec![ResourceId::from("function"), ResourceId::from("target")]
        );
        assert_eq!(
            graph.dependencies_of(&"target".into()),
            vec![
                ResourceId::from("role"),
                ResourceId::from("topic"),
                ResourceId::from("function")
            ]
        );
        assert!(graph.dependents_of(&"target".into()).is_empty());
    }

    #[test]
    fn waves_group_independent_branches() {
        let graph = sample();
        let waves = graph.waves();
        assert_eq!(waves.len(), 3);
        assert_eq!(waves[0], vec![ResourceId::from("role"), ResourceId::from("topic")]);
        assert_eq!(waves[1], vec![ResourceId::from("function")]);
        assert_eq!(waves[2], vec![ResourceId::from("target")]);
    }
}
