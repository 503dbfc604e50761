//! Maximum-clique search over the loop-closure consistency matrix.
//!
//! Exact search is Bron-Kerbosch with pivoting. Past a configured problem
//! size the search degenerates combinatorially, so a greedy expansion
//! heuristic takes over: vertices are visited in descending degree order and
//! added when consistent with the clique built so far.

/// Symmetric boolean adjacency matrix and clique solvers.
pub struct MaxCliqueSolver {
    /// Above this many vertices, use the greedy heuristic.
    exact_bound: usize,
}

impl MaxCliqueSolver {
    pub fn new(exact_bound: usize) -> Self {
        Self { exact_bound }
    }

    /// Indices of a maximum (or maximal, in heuristic mode) clique.
    pub fn max_clique(&self, adjacency: &[Vec<bool>]) -> Vec<usize> {
        let n = adjacency.len();
        if n == 0 {
            return Vec::new();
        }
        debug_assert!(adjacency.iter().all(|row| row.len() == n));
        if n <= self.exact_bound {
            self.bron_kerbosch(adjacency)
        } else {
            self.greedy(adjacency)
        }
    }

    fn bron_kerbosch(&self, adjacency: &[Vec<bool>]) -> Vec<usize> {
        let n = adjacency.len();
        let mut best = Vec::new();
        let mut r = Vec::new();
        let p: Vec<usize> = (0..n).collect();
        let x = Vec::new();
        bk_recurse(adjacency, &mut r, p, x, &mut best);
        best.sort_unstable();
        best
    }

    fn greedy(&self, adjacency: &[Vec<bool>]) -> Vec<usize> {
        let n = adjacency.len();
        let mut order: Vec<usize> = (0..n).collect();
        let degree = |v: usize| adjacency[v].iter().filter(|&&edge| edge).count();
        order.sort_by_key(|&v| std::cmp::Reverse(degree(v)));

        let mut best: Vec<usize> = Vec::new();
        for &seed in &order {
            let mut clique = vec![seed];
            for &candidate in &order {
                if candidate == seed {
                    continue;
                }
                if clique.iter().all(|&member| adjacency[member][candidate]) {
                    clique.push(candidate);
                }
            }
            if clique.len() > best.len() {
                best = clique;
            }
        }
        best.sort_unstable();
        best
    }
}

fn bk_recurse(
    adjacency: &[Vec<bool>],
    r: &mut Vec<usize>,
    p: Vec<usize>,
    x: Vec<usize>,
    best: &mut Vec<usize>,
) {
    if p.is_empty() && x.is_empty() {
        if r.len() > best.len() {
            *best = r.clone();
        }
        return;
    }
    // Prune branches that cannot beat the incumbent.
    if r.len() + p.len() <= best.len() {
        return;
    }

    // Pivot on the vertex covering the most of P.
    let pivot = p
        .iter()
        .chain(x.iter())
        .copied()
        .max_by_key(|&u| p.iter().filter(|&&v| adjacency[u][v]).count())
        .unwrap();

    let candidates: Vec<usize> = p
        .iter()
        .copied()
        .filter(|&v| !adjacency[pivot][v])
        .collect();

    let mut p = p;
    let mut x = x;
    for v in candidates {
        r.push(v);
        let p_next: Vec<usize> = p.iter().copied().filter(|&u| adjacency[v][u]).collect();
        let x_next: Vec<usize> = x.iter().copied().filter(|&u| adjacency[v][u]).collect();
        bk_recurse(adjacency, r, p_next, x_next, best);
        r.pop();
        p.retain(|&u| u != v);
        x.push(v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adjacency_from_edges(n: usize, edges: &[(usize, usize)]) -> Vec<Vec<bool>> {
        let mut adjacency = vec![vec![false; n]; n];
        for &(i, j) in edges {
            adjacency[i][j] = true;
            adjacency[j][i] = true;
        }
        adjacency
    }

    #[test]
    fn test_empty() {
        let solver = MaxCliqueSolver::new(50);
        assert!(solver.max_clique(&[]).is_empty());
    }

    #[test]
    fn test_single_vertex() {
        let solver = MaxCliqueSolver::new(50);
        let adjacency = adjacency_from_edges(1, &[]);
        assert_eq!(solver.max_clique(&adjacency), vec![0]);
    }

    #[test]
    fn test_triangle_beats_edge() {
        // Vertices 0-1-2 form a triangle; 3-4 only an edge.
        let adjacency = adjacency_from_edges(5, &[(0, 1), (1, 2), (0, 2), (3, 4)]);
        let solver = MaxCliqueSolver::new(50);
        assert_eq!(solver.max_clique(&adjacency), vec![0, 1, 2]);
    }

    #[test]
    fn test_disconnected_vertices() {
        let adjacency = adjacency_from_edges(3, &[]);
        let solver = MaxCliqueSolver::new(50);
        assert_eq!(solver.max_clique(&adjacency).len(), 1);
    }

    #[test]
    fn test_greedy_finds_large_clique() {
        // A 4-clique on {0,1,2,3} plus scattered edges; force heuristic mode.
        let mut edges = vec![(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)];
        edges.extend([(4, 5), (5, 6)]);
        let adjacency = adjacency_from_edges(7, &edges);
        let solver = MaxCliqueSolver::new(2);
        let clique = solver.max_clique(&adjacency);
        assert_eq!(clique, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_exact_and_greedy_agree_on_clean_input() {
        let edges = vec![(0, 1), (1, 2), (0, 2), (2, 3)];
        let adjacency = adjacency_from_edges(4, &edges);
        let exact = MaxCliqueSolver::new(50).max_clique(&adjacency);
        let greedy = MaxCliqueSolver::new(1).max_clique(&adjacency);
        assert_eq!(exact.len(), greedy.len());
    }
}
