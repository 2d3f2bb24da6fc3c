//! Representative selection and absorption.
//!
//! Coarsening a level with `N` points keeps `⌈r·N⌉` of them:
//!
//! 1. Score every point by [`centrality`] on the fuzzy graph.
//! 2. Keep the top scores (ties by lower index) as representatives, listed in
//!    ascending index order; that order is the point order of the next level.
//! 3. Every other point walks along its strongest edge to a point not yet on
//!    its path until it meets a representative or a point whose owner is
//!    already known. Everything on the path joins that owner. Walks that run
//!    out of edges or hops join the most central representative.
//!
//! A representative's influence at the next level is `1 + absorbed`, so the
//! influences of a level sum to the size of the level below.

use super::config::sample_size;
use super::influence::centrality;
use crate::error::{Error, Result};
use crate::fuzzy::FuzzyGraph;
use crate::metric::PointSet;
use crate::neighbors::{check_neighbor_count, Candidate, NeighborGraph};
use log::{debug, warn};
use ndarray::{Array1, Array2};
use rayon::prelude::*;

/// Longest absorption walk before falling back.
pub const MAX_HOPS: usize = 64;

/// Outcome of coarsening one level.
#[derive(Debug, Clone, PartialEq)]
pub struct Coarsening {
    /// Surviving points, ascending.
    pub representatives: Vec<usize>,
    /// Next-level position owning each point of this level.
    pub absorption: Vec<usize>,
    /// `1 + absorbed` per representative.
    pub influence: Vec<f32>,
    /// Selection score per point of this level.
    pub centrality: Vec<f32>,
    /// Points that joined the fallback representative.
    pub fallbacks: usize,
}

/// Select representatives of `graph` and absorb the remaining points.
pub fn coarsen(graph: &FuzzyGraph, ratio: f64, damping: f64) -> Result<Coarsening> {
    let n = graph.len();
    let m = sample_size(ratio, n);
    if m == 0 || m >= n {
        return Err(Error::config(
            "sampling_ratios",
            format!("ratio {ratio} selects {m} of {n} points"),
        ));
    }

    let scores = centrality(graph, damping)?;
    let mut ranking: Vec<usize> = (0..n).collect();
    ranking.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));
    let most_central = ranking[0];

    let mut representatives = ranking[..m].to_vec();
    representatives.sort_unstable();

    let mut owner: Vec<Option<usize>> = vec![None; n];
    for (pos, &r) in representatives.iter().enumerate() {
        owner[r] = Some(pos);
    }
    let fallback = owner[most_central].unwrap_or(0);

    let mut fallbacks = 0;
    let mut path: Vec<usize> = Vec::with_capacity(MAX_HOPS + 1);
    for start in 0..n {
        if owner[start].is_some() {
            continue;
        }
        path.clear();
        path.push(start);
        let mut current = start;
        let mut resolved = None;
        for _ in 0..MAX_HOPS {
            let Some(next) = strongest_unvisited(graph, current, &path) else {
                break;
            };
            if let Some(o) = owner[next] {
                resolved = Some(o);
                break;
            }
            path.push(next);
            current = next;
        }
        let o = resolved.unwrap_or_else(|| {
            fallbacks += 1;
            fallback
        });
        for &p in &path {
            owner[p] = Some(o);
        }
    }
    if fallbacks > 0 {
        warn!("{fallbacks} absorption walks fell back to the most central representative");
    }

    let absorption: Vec<usize> = owner.into_iter().map(|o| o.unwrap_or(fallback)).collect();
    let mut influence = vec![0.0f32; m];
    for &o in &absorption {
        influence[o] += 1.0;
    }
    debug!(
        "coarsened {n} -> {m} points, largest absorption set {}",
        influence.iter().copied().fold(0.0, f32::max)
    );

    Ok(Coarsening {
        representatives,
        absorption,
        influence,
        centrality: scores.into_iter().map(|s| s as f32).collect(),
        fallbacks,
    })
}

/// Heaviest edge from `node` to a point not in `visited`; ties go to the lower index.
fn strongest_unvisited(graph: &FuzzyGraph, node: usize, visited: &[usize]) -> Option<usize> {
    let (cols, ws) = graph.row(node);
    let mut best: Option<(usize, f32)> = None;
    for (&j, &w) in cols.iter().zip(ws) {
        if visited.contains(&j) {
            continue;
        }
        match best {
            Some((_, bw)) if w <= bw => {}
            _ => best = Some((j, w)),
        }
    }
    best.map(|(j, _)| j)
}

/// Coordinates of `representatives` moved toward their nearest neighbors:
/// `x_r + Σ_j w_rj (x_j − x_r) / k` over the `k` neighbors `j` of `r`, with
/// `w` the fuzzy membership. The membership weights sum to at most `k`, so
/// the result stays inside the hull of `r` and its neighbors.
pub fn neighborhood_means(
    points: &PointSet,
    knn: &NeighborGraph,
    graph: &FuzzyGraph,
    representatives: &[usize],
) -> PointSet {
    let data = points.data();
    let scale = 1.0 / knn.k() as f32;
    let mut out = Array2::<f32>::zeros((representatives.len(), data.ncols()));
    for (pos, &r) in representatives.iter().enumerate() {
        let origin = data.row(r);
        let mut shift = Array1::<f32>::zeros(data.ncols());
        for &j in knn.neighbors(r) {
            shift.scaled_add(graph.weight(r, j), &(&data.row(j) - &origin));
        }
        let mut row = out.row_mut(pos);
        row.assign(&origin);
        row.scaled_add(scale, &shift);
    }
    points.with_data(out)
}

/// Neighbor graph over `representatives` derived from the neighbors they
/// share in the level below, without searching again.
///
/// A point `j` listed by representatives `a` and `b` contributes
/// `min(m_a, m_b) / max(m_a, m_b) / k`, where `m = w · d` is the membership
/// times the distance of that listing. Two representatives are `1 − Σ` apart.
/// Rows with fewer than `k` sharers are filled with the lowest-numbered
/// remaining representatives at distance 1.
pub fn shared_neighbor_graph(
    knn: &NeighborGraph,
    graph: &FuzzyGraph,
    representatives: &[usize],
) -> Result<NeighborGraph> {
    let k = knn.k();
    let m = representatives.len();
    check_neighbor_count(m, k)?;

    let mut listed_by: Vec<Vec<(usize, f32)>> = vec![Vec::new(); knn.len()];
    for (pos, &r) in representatives.iter().enumerate() {
        for (j, d) in knn.row(r) {
            listed_by[j].push((pos, graph.weight(r, j) * d));
        }
    }

    let scale = k as f32;
    let mut shared: Vec<Vec<(usize, f32)>> = vec![Vec::new(); m];
    for listing in &listed_by {
        for (x, &(a, ma)) in listing.iter().enumerate() {
            for &(b, mb) in &listing[x + 1..] {
                let s = overlap(ma, mb) / scale;
                shared[a].push((b, s));
                shared[b].push((a, s));
            }
        }
    }

    let rows: Vec<Vec<Candidate>> = shared
        .into_par_iter()
        .enumerate()
        .map(|(a, mut pairs)| {
            // Stable, so both directions of a pair sum in the same order.
            pairs.sort_by_key(|&(b, _)| b);
            let mut row: Vec<Candidate> = Vec::with_capacity(pairs.len() + k);
            for (b, s) in pairs {
                match row.last_mut() {
                    Some(last) if last.index == b => last.dist += s,
                    _ => row.push(Candidate::new(s, b)),
                }
            }
            for c in &mut row {
                c.dist = (1.0 - c.dist).max(0.0);
            }
            row.sort_unstable();
            row.truncate(k);
            let mut fill = 0;
            while row.len() < k {
                if fill != a && !row.iter().any(|c| c.index == fill) {
                    row.push(Candidate::new(1.0, fill));
                }
                fill += 1;
            }
            row
        })
        .collect();

    let isolated = rows
        .iter()
        .filter(|row| row.iter().all(|c| c.dist >= 1.0))
        .count();
    if isolated > 0 {
        warn!("{isolated} of {m} representatives share no neighbors with any other");
    }
    NeighborGraph::from_rows(k, rows)
}

fn overlap(a: f32, b: f32) -> f32 {
    let hi = a.max(b);
    if hi > 0.0 {
        a.min(b) / hi
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::Metric;
    use crate::neighbors::{ExactKdTree, NeighborIndex};
    use proptest::prelude::*;
    use rand::prelude::*;
    use rand::Rng;

    fn random_graph(n: usize, k: usize, seed: u64) -> (PointSet, NeighborGraph, FuzzyGraph) {
        let mut rng = StdRng::seed_from_u64(seed);
        let data = Array2::from_shape_fn((n, 2), |_| rng.random_range(0.0f32..10.0));
        let points = PointSet::new(data, Metric::Euclidean).unwrap();
        let knn = ExactKdTree::default().build(&points, k, 0).unwrap();
        let (g, _) = FuzzyGraph::from_neighbors(&knn, 1.0).unwrap();
        (points, knn, g)
    }

    fn symmetric(n: usize, edges: &[(usize, usize, f32)]) -> FuzzyGraph {
        let triplets = edges
            .iter()
            .flat_map(|&(i, j, w)| [(i, j, w), (j, i, w)])
            .collect();
        FuzzyGraph::from_triplets(n, triplets)
    }

    fn knn_rows(k: usize, rows: &[&[(f32, usize)]]) -> NeighborGraph {
        let rows = rows
            .iter()
            .map(|row| row.iter().map(|&(d, j)| Candidate::new(d, j)).collect())
            .collect();
        NeighborGraph::from_rows(k, rows).unwrap()
    }

    #[test]
    fn test_sizes_and_mass() {
        let (_, _, g) = random_graph(200, 10, 1);
        let c = coarsen(&g, 0.3, 0.85).unwrap();
        assert_eq!(c.representatives.len(), 60);
        assert_eq!(c.absorption.len(), 200);
        assert_eq!(c.influence.iter().sum::<f32>(), 200.0);
        assert!(c.representatives.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_representatives_absorb_themselves() {
        let (_, _, g) = random_graph(120, 8, 2);
        let c = coarsen(&g, 0.25, 0.85).unwrap();
        for (pos, &r) in c.representatives.iter().enumerate() {
            assert_eq!(c.absorption[r], pos);
            assert!(c.influence[pos] >= 1.0);
        }
    }

    #[test]
    fn test_selection_prefers_central_points() {
        // Star: the hub must survive.
        let mut triplets = Vec::new();
        for leaf in 1..10 {
            triplets.push((0, leaf, 1.0));
            triplets.push((leaf, 0, 1.0));
        }
        let g = FuzzyGraph::from_triplets(10, triplets);
        let c = coarsen(&g, 0.2, 0.85).unwrap();
        assert!(c.representatives.contains(&0));
        // Leaves tie; the lower index wins.
        assert_eq!(c.representatives, vec![0, 1]);
    }

    #[test]
    fn test_isolated_points_use_fallback() {
        let triplets = vec![(0, 1, 1.0), (1, 0, 1.0)];
        let g = FuzzyGraph::from_triplets(5, triplets);
        let c = coarsen(&g, 0.4, 0.85).unwrap();
        assert_eq!(c.absorption.len(), 5);
        assert!(c.fallbacks > 0);
        assert_eq!(c.influence.iter().sum::<f32>(), 5.0);
    }

    #[test]
    fn test_degenerate_ratio() {
        let (_, _, g) = random_graph(10, 3, 3);
        assert!(matches!(
            coarsen(&g, 0.999, 0.85),
            Err(Error::Configuration { .. })
        ));
    }

    #[test]
    fn test_neighborhood_means_stay_in_hull() {
        let (points, knn, g) = random_graph(50, 5, 4);
        let moved = neighborhood_means(&points, &knn, &g, &[0, 10, 20]);
        assert_eq!(moved.len(), 3);
        assert!(moved.data().iter().all(|&v| (0.0..=10.0).contains(&v)));
    }

    #[test]
    fn test_neighborhood_means_by_hand() {
        let data = ndarray::array![[0.0f32, 0.0], [2.0, 0.0], [0.0, 4.0]];
        let points = PointSet::new(data, Metric::Euclidean).unwrap();
        let knn = knn_rows(
            2,
            &[
                &[(2.0, 1), (4.0, 2)],
                &[(2.0, 0), (4.472, 2)],
                &[(4.0, 0), (4.472, 1)],
            ],
        );
        let g = symmetric(3, &[(0, 1, 1.0), (0, 2, 0.5), (1, 2, 0.25)]);
        let moved = neighborhood_means(&points, &knn, &g, &[0, 2]);
        // (0,0) + (1.0·(2,0) + 0.5·(0,4)) / 2
        assert_eq!(moved.row(0).to_vec(), vec![1.0, 1.0]);
        // (0,4) + (0.5·(0,−4) + 0.25·(2,−4)) / 2
        assert_eq!(moved.row(1).to_vec(), vec![0.25, 2.5]);
    }

    #[test]
    fn test_shared_neighbor_graph_by_hand() {
        let knn = knn_rows(
            2,
            &[
                &[(1.0, 1), (2.0, 3)],
                &[(1.0, 0), (1.0, 2)],
                &[(1.0, 1), (1.0, 3)],
                &[(1.0, 2), (2.0, 0)],
                &[(2.0, 3), (3.0, 1)],
            ],
        );
        let g = symmetric(
            5,
            &[
                (0, 1, 1.0),
                (0, 3, 0.5),
                (1, 2, 1.0),
                (2, 3, 0.5),
                (3, 4, 1.0),
                (1, 4, 0.25),
            ],
        );
        // Listings w·d through point 1: 1.0, 1.0, 0.75; through point 3: 1.0, 0.5, 2.0.
        let shared = shared_neighbor_graph(&knn, &g, &[0, 2, 4]).unwrap();
        assert_eq!(shared.neighbors(0), &[1, 2]);
        assert_eq!(shared.distances(0), &[0.25, 0.375]);
        assert_eq!(shared.neighbors(1), &[0, 2]);
        assert_eq!(shared.distances(1), &[0.25, 0.5]);
        assert_eq!(shared.neighbors(2), &[0, 1]);
        assert_eq!(shared.distances(2), &[0.375, 0.5]);
    }

    #[test]
    fn test_shared_neighbor_graph_pads_loners() {
        // Point 3 is listed by nobody else, so representative 3 shares nothing.
        let knn = knn_rows(
            1,
            &[&[(1.0, 1)], &[(1.0, 0)], &[(1.0, 1)], &[(5.0, 2)]],
        );
        let g = symmetric(4, &[(0, 1, 1.0), (1, 2, 1.0), (2, 3, 1.0)]);
        let shared = shared_neighbor_graph(&knn, &g, &[0, 2, 3]).unwrap();
        assert_eq!(shared.neighbors(0), &[1]);
        assert_eq!(shared.distances(0), &[0.0]);
        assert_eq!(shared.neighbors(2), &[0]);
        assert_eq!(shared.distances(2), &[1.0]);
    }

    #[test]
    fn test_shared_neighbor_graph_rejects_too_few_representatives() {
        let (_, knn, g) = random_graph(30, 5, 8);
        assert!(shared_neighbor_graph(&knn, &g, &[0, 1, 2]).is_err());
    }

    proptest! {
        #[test]
        fn absorption_is_total(
            n in 20usize..120,
            seed in 0u64..300,
            ratio in 0.1f64..0.9,
        ) {
            let (_, _, g) = random_graph(n, 5, seed);
            let m = sample_size(ratio, n);
            prop_assume!(m >= 1 && m < n);
            let c = coarsen(&g, ratio, 0.85).unwrap();
            prop_assert_eq!(c.absorption.len(), n);
            prop_assert!(c.absorption.iter().all(|&o| o < m));
            prop_assert_eq!(c.influence.iter().sum::<f32>() as usize, n);
        }

        #[test]
        fn shared_neighbor_edges_come_from_shared_lists(
            n in 40usize..120,
            seed in 0u64..200,
        ) {
            let (_, knn, g) = random_graph(n, 6, seed);
            let c = coarsen(&g, 0.4, 0.85).unwrap();
            let reps = &c.representatives;
            prop_assume!(reps.len() > 6);
            let shared = shared_neighbor_graph(&knn, &g, reps).unwrap();
            for a in 0..reps.len() {
                for (b, d) in shared.row(a) {
                    prop_assert!(b != a && (0.0..=1.0).contains(&d));
                    if d < 1.0 {
                        let common = knn
                            .neighbors(reps[a])
                            .iter()
                            .any(|j| knn.neighbors(reps[b]).contains(j));
                        prop_assert!(common);
                    }
                    if let Some(p) = shared.neighbors(b).iter().position(|&x| x == a) {
                        prop_assert_eq!(shared.distances(b)[p], d);
                    }
                }
            }
        }
    }
}
