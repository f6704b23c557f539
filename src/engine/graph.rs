// Dependency graph algorithms shared by chain validation, scheduling and planning

//! # Dependency Graphs
//!
//! Nodes are any small ordered key (step numbers, agent kinds). `deps` maps a
//! node to the nodes it depends on; dependencies on nodes outside `nodes` are
//! ignored, callers validate references separately.
//!
//! Both algorithms are iterative (Kahn's algorithm) and report a cycle as
//! [`ChainError::CyclicDependency`] instead of truncating the order.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Debug;

use crate::{ChainError, Result};

/// Topological order; among ready nodes the smallest `priority` goes first
pub fn topological_sort_by<K, P, F>(nodes: &[K], deps: &BTreeMap<K, Vec<K>>, priority: F) -> Result<Vec<K>>
where
    K: Copy + Ord + Debug,
    P: Ord,
    F: Fn(&K) -> P,
{
    let node_set: BTreeSet<K> = nodes.iter().copied().collect();
    let mut in_degree: BTreeMap<K, usize> = node_set.iter().map(|n| (*n, 0)).collect();
    let mut dependents: BTreeMap<K, Vec<K>> = BTreeMap::new();

    for node in &node_set {
        let mut seen = BTreeSet::new();
        for dep in deps.get(node).into_iter().flatten() {
            if node_set.contains(dep) && seen.insert(*dep) {
                *in_degree.entry(*node).or_insert(0) += 1;
                dependents.entry(*dep).or_default().push(*node);
            }
        }
    }

    let mut ready: Vec<K> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(node, _)| *node)
        .collect();
    let mut order = Vec::with_capacity(node_set.len());

    while !ready.is_empty() {
        // (priority, node) keeps ties deterministic
        let index = ready
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| priority(a).cmp(&priority(b)).then(a.cmp(b)))
            .map(|(i, _)| i)
            .unwrap_or(0);
        let node = ready.swap_remove(index);
        order.push(node);

        for dependent in dependents.get(&node).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push(*dependent);
                }
            }
        }
    }

    if order.len() < node_set.len() {
        let placed: BTreeSet<K> = order.iter().copied().collect();
        let steps = node_set
            .iter()
            .filter(|n| !placed.contains(n))
            .map(|n| format!("{:?}", n))
            .collect();
        return Err(ChainError::CyclicDependency { steps });
    }

    Ok(order)
}

/// Topological order with ties broken by node order
pub fn topological_sort<K>(nodes: &[K], deps: &BTreeMap<K, Vec<K>>) -> Result<Vec<K>>
where
    K: Copy + Ord + Debug,
{
    topological_sort_by(nodes, deps, |node| *node)
}

/// Group nodes into dependency waves
///
/// Wave 0 holds every node without dependencies; a node lands in the wave one
/// past the highest wave among its dependencies.
pub fn dependency_waves<K>(nodes: &[K], deps: &BTreeMap<K, Vec<K>>) -> Result<Vec<Vec<K>>>
where
    K: Copy + Ord + Debug + std::hash::Hash,
{
    let order = topological_sort(nodes, deps)?;
    let mut level: HashMap<K, usize> = HashMap::with_capacity(order.len());
    let mut waves: Vec<Vec<K>> = Vec::new();

    for node in order {
        let wave = deps
            .get(&node)
            .into_iter()
            .flatten()
            .filter_map(|dep| level.get(dep))
            .map(|l| l + 1)
            .max()
            .unwrap_or(0);
        level.insert(node, wave);
        if waves.len() <= wave {
            waves.resize_with(wave + 1, Vec::new);
        }
        waves[wave].push(node);
    }

    for wave in &mut waves {
        wave.sort();
    }
    Ok(waves)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(edges: &[(u32, &[u32])]) -> BTreeMap<u32, Vec<u32>> {
        edges.iter().map(|(n, d)| (*n, d.to_vec())).collect()
    }

    #[test]
    fn test_linear_chain() {
        let d = deps(&[(1, &[]), (2, &[1]), (3, &[2])]);
        assert_eq!(topological_sort(&[3, 1, 2], &d).unwrap(), vec![1, 2, 3]);
        assert_eq!(dependency_waves(&[1, 2, 3], &d).unwrap(), vec![vec![1], vec![2], vec![3]]);
    }

    #[test]
    fn test_waves_respect_longest_path() {
        // 4 depends on 1 (wave 0) and 3 (wave 2) so it must land in wave 3
        let d = deps(&[(1, &[]), (2, &[1]), (3, &[2]), (4, &[1, 3]), (5, &[])]);
        let waves = dependency_waves(&[1, 2, 3, 4, 5], &d).unwrap();
        assert_eq!(waves, vec![vec![1, 5], vec![2], vec![3], vec![4]]);
    }

    #[test]
    fn test_every_node_once_and_after_its_dependencies() {
        let d = deps(&[
            (1, &[]),
            (2, &[]),
            (3, &[1]),
            (4, &[1, 2]),
            (5, &[3, 4]),
            (6, &[2]),
            (7, &[6, 5]),
        ]);
        let nodes: Vec<u32> = (1..=7).collect();
        let waves = dependency_waves(&nodes, &d).unwrap();

        let mut wave_of = HashMap::new();
        for (i, wave) in waves.iter().enumerate() {
            for node in wave {
                assert!(wave_of.insert(*node, i).is_none(), "node {} placed twice", node);
            }
        }
        assert_eq!(wave_of.len(), nodes.len());
        for (node, node_deps) in &d {
            for dep in node_deps {
                assert!(wave_of[node] > wave_of[dep]);
            }
        }
    }

    #[test]
    fn test_cycle_is_an_error() {
        let d = deps(&[(1, &[3]), (2, &[1]), (3, &[2]), (4, &[])]);
        match topological_sort(&[1, 2, 3, 4], &d) {
            Err(ChainError::CyclicDependency { steps }) => {
                assert_eq!(steps, vec!["1".to_string(), "2".to_string(), "3".to_string()]);
            }
            other => panic!("expected cycle error, got {:?}", other),
        }
        assert!(dependency_waves(&[1, 2, 3, 4], &d).is_err());
    }

    #[test]
    fn test_priority_breaks_ties() {
        let d = deps(&[(1, &[]), (2, &[]), (3, &[1, 2])]);
        let order = topological_sort_by(&[1, 2, 3], &d, |n| std::cmp::Reverse(*n)).unwrap();
        assert_eq!(order, vec![2, 1, 3]);
    }

    #[test]
    fn test_unknown_dependencies_are_ignored() {
        let d = deps(&[(1, &[99]), (2, &[1])]);
        assert_eq!(topological_sort(&[1, 2], &d).unwrap(), vec![1, 2]);
    }
}
