//! Depth-bounded traversals over a neighbour function

use std::collections::{HashSet, VecDeque};

use crate::error::Result;
use crate::storage::Offset;

/// Breadth-first traversal from `start`, visiting nodes up to `max_depth`
/// hops away. Nodes come back in visit order; start nodes are depth 0.
pub fn bfs<F>(start: &[Offset], max_depth: usize, mut get_neighbors: F) -> Result<Vec<Offset>>
where
    F: FnMut(Offset) -> Result<Vec<Offset>>,
{
    let mut visited = HashSet::new();
    let mut queue: VecDeque<Offset> = start.iter().copied().collect();
    let mut result = Vec::new();
    let mut depth = 0;

    while !queue.is_empty() && depth <= max_depth {
        for _ in 0..queue.len() {
            let Some(node) = queue.pop_front() else {
                break;
            };
            if !visited.insert(node) {
                continue;
            }
            result.push(node);
            if depth == max_depth {
                continue;
            }
            for neighbor in get_neighbors(node)? {
                if !visited.contains(&neighbor) {
                    queue.push_back(neighbor);
                }
            }
        }
        depth += 1;
    }

    Ok(result)
}

/// Depth-first counterpart of [`bfs`].
pub fn dfs<F>(start: &[Offset], max_depth: usize, mut get_neighbors: F) -> Result<Vec<Offset>>
where
    F: FnMut(Offset) -> Result<Vec<Offset>>,
{
    let mut visited = HashSet::new();
    let mut stack: Vec<(Offset, usize)> = start.iter().rev().map(|&node| (node, 0)).collect();
    let mut result = Vec::new();

    while let Some((node, depth)) = stack.pop() {
        if !visited.insert(node) {
            continue;
        }
        result.push(node);
        if depth == max_depth {
            continue;
        }
        for neighbor in get_neighbors(node)?.into_iter().rev() {
            if !visited.contains(&neighbor) {
                stack.push((neighbor, depth + 1));
            }
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use std::collections::HashMap;

    fn graph(edges: &[(Offset, &[Offset])]) -> HashMap<Offset, Vec<Offset>> {
        edges.iter().map(|(src, dsts)| (*src, dsts.to_vec())).collect()
    }

    #[test]
    fn test_bfs_visits_by_level() {
        // 1 -> 2 -> 3, 1 -> 4
        let edges = graph(&[(1, &[2, 4]), (2, &[3])]);
        let result = bfs(&[1], 10, |id| Ok(edges.get(&id).cloned().unwrap_or_default())).unwrap();
        assert_eq!(result, vec![1, 2, 4, 3]);
    }

    #[test]
    fn test_bfs_max_depth() {
        let edges = graph(&[(1, &[2]), (2, &[3]), (3, &[4])]);
        let result = bfs(&[1], 2, |id| Ok(edges.get(&id).cloned().unwrap_or_default())).unwrap();
        assert_eq!(result, vec![1, 2, 3]);

        let mut calls = 0;
        let result = bfs(&[1], 0, |_| {
            calls += 1;
            Ok(vec![2])
        })
        .unwrap();
        assert_eq!(result, vec![1]);
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_cycles_terminate() {
        let edges = graph(&[(1, &[2]), (2, &[3]), (3, &[1])]);
        let lookup = |id: Offset| -> Result<Vec<Offset>> { Ok(edges.get(&id).cloned().unwrap_or_default()) };
        assert_eq!(bfs(&[1], 100, lookup).unwrap(), vec![1, 2, 3]);
        assert_eq!(dfs(&[1], 100, lookup).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_dfs_goes_deep_first() {
        // 1 -> {2, 5}, 2 -> 3 -> 4
        let edges = graph(&[(1, &[2, 5]), (2, &[3]), (3, &[4])]);
        let lookup = |id: Offset| -> Result<Vec<Offset>> { Ok(edges.get(&id).cloned().unwrap_or_default()) };
        assert_eq!(dfs(&[1], 10, lookup).unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(dfs(&[1], 1, lookup).unwrap(), vec![1, 2, 5]);
    }

    #[test]
    fn test_neighbour_errors_propagate() {
        let result = bfs(&[7], 3, |_| Err(StorageError::InvalidFormat("broken".into())));
        assert!(matches!(result, Err(StorageError::InvalidFormat(_))));
        assert!(bfs(&[], 3, |_| Ok(vec![1])).unwrap().is_empty());
    }
}
