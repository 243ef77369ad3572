use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

/// Heap entry popping the smallest node first, so ties keep input order.
#[derive(Debug, PartialEq, Eq)]
struct MinHeapEntry(usize);

impl Ord for MinHeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.cmp(&self.0)
    }
}

impl PartialOrd for MinHeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Order `nodes` so that every node comes after the nodes it depends on.
///
/// `dependencies[n]` holds the nodes `n` depends on; edges to nodes outside
/// `nodes` are ignored. Among ready nodes the smallest goes first, which
/// makes the order deterministic. On a cycle, returns the nodes that could
/// not be ordered.
pub fn topological_sort(
    nodes: &BTreeSet<usize>,
    dependencies: &BTreeMap<usize, BTreeSet<usize>>,
) -> Result<Vec<usize>, BTreeSet<usize>> {
    let mut in_degree: BTreeMap<usize, usize> = nodes.iter().map(|n| (*n, 0)).collect();
    let mut dependents: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for node in nodes {
        for dependency in dependencies.get(node).into_iter().flatten() {
            if !nodes.contains(dependency) {
                continue;
            }
            *in_degree.entry(*node).or_default() += 1;
            dependents.entry(*dependency).or_default().push(*node);
        }
    }

    let mut heap: BinaryHeap<MinHeapEntry> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(node, _)| MinHeapEntry(*node))
        .collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(MinHeapEntry(node)) = heap.pop() {
        order.push(node);
        for dependent in dependents.get(&node).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    heap.push(MinHeapEntry(*dependent));
                }
            }
        }
    }

    if order.len() == nodes.len() {
        Ok(order)
    } else {
        let ordered: BTreeSet<usize> = order.into_iter().collect();
        Err(nodes.difference(&ordered).copied().collect())
    }
}

/// The members of `nodes` that lie on a dependency cycle within `nodes`.
pub fn nodes_on_cycles(nodes: &BTreeSet<usize>, dependencies: &BTreeMap<usize, BTreeSet<usize>>) -> BTreeSet<usize> {
    nodes
        .iter()
        .copied()
        .filter(|start| {
            let mut visited = BTreeSet::new();
            let mut stack: Vec<usize> = dependencies.get(start).into_iter().flatten().copied().collect();
            while let Some(node) = stack.pop() {
                if node == *start {
                    return true;
                }
                if !nodes.contains(&node) || !visited.insert(node) {
                    continue;
                }
                stack.extend(dependencies.get(&node).into_iter().flatten().copied());
            }
            false
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(edges: &[(usize, usize)]) -> BTreeMap<usize, BTreeSet<usize>> {
        let mut map: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
        for (node, dependency) in edges {
            map.entry(*node).or_default().insert(*dependency);
        }
        map
    }

    #[test]
    fn test_sort_is_stable_by_index() {
        let nodes: BTreeSet<usize> = (0..4).collect();
        assert_eq!(topological_sort(&nodes, &BTreeMap::new()).unwrap(), vec![0, 1, 2, 3]);

        // 0 depends on 3, 1 depends on 2
        let order = topological_sort(&nodes, &deps(&[(0, 3), (1, 2)])).unwrap();
        assert_eq!(order, vec![2, 1, 3, 0]);
    }

    #[test]
    fn test_edges_outside_nodes_are_ignored() {
        let nodes: BTreeSet<usize> = [1, 2].into_iter().collect();
        assert_eq!(topological_sort(&nodes, &deps(&[(1, 7), (2, 1)])).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_cycle_reports_stuck_nodes() {
        let nodes: BTreeSet<usize> = (0..4).collect();
        let dependencies = deps(&[(0, 1), (1, 0), (2, 1)]);
        let stuck = topological_sort(&nodes, &dependencies).unwrap_err();
        assert_eq!(stuck, [0, 1, 2].into_iter().collect());
        assert_eq!(nodes_on_cycles(&stuck, &dependencies), [0, 1].into_iter().collect());

        let self_loop = deps(&[(3, 3)]);
        assert!(topological_sort(&nodes, &self_loop).is_err());
        println!("✓ Cycles are detected and isolated");
    }
}
