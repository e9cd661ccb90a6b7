use log::debug;
use rayon::prelude::*;

use crate::prelude::*;

/// Builds the pairwise consistency graph of `correspondences` and keeps the
/// ones in its maximum k-core, in input order.
///
/// Two correspondences are consistent when a rigid motion can explain both,
/// i.e. their source-side and target-side separations differ by at most
/// twice the noise bound.
pub fn max_core_pruning(
    correspondences: &[Correspondence],
    source: &[Point],
    target: &[Point],
    noise_bound: f64,
) -> Vec<Correspondence> {
    if correspondences.len() < 2 {
        return correspondences.to_vec();
    }
    let adjacency = consistency_graph(correspondences, source, target, noise_bound);
    let core_numbers = core_numbers(&adjacency);
    let Some(&max_core) = core_numbers.iter().max() else {
        return Vec::new();
    };
    debug!(
        "Max core pruning: {} correspondences, max core {}",
        correspondences.len(),
        max_core
    );
    correspondences
        .iter()
        .zip(core_numbers.iter())
        .filter_map(|(&c, &core)| (core == max_core).then_some(c))
        .collect()
}

fn consistency_graph(
    correspondences: &[Correspondence],
    source: &[Point],
    target: &[Point],
    noise_bound: f64,
) -> Vec<Vec<usize>> {
    let bound = 2.0 * noise_bound;
    correspondences
        .par_iter()
        .enumerate()
        .map(|(a, &(source_a, target_a))| {
            correspondences
                .iter()
                .enumerate()
                .filter(|&(b, &(source_b, target_b))| {
                    let source_len = (source[source_a] - source[source_b]).norm();
                    let target_len = (target[target_a] - target[target_b]).norm();
                    b != a && (source_len - target_len).abs() <= bound
                })
                .map(|(b, _)| b)
                .collect()
        })
        .collect()
}

/// Core number of every vertex (Batagelj-Zaversnik bucket algorithm).
pub(crate) fn core_numbers(adjacency: &[Vec<usize>]) -> Vec<usize> {
    let num_vertices = adjacency.len();
    let mut degree = adjacency.iter().map(Vec::len).collect::<Vec<_>>();
    let max_degree = degree.iter().copied().max().unwrap_or(0);

    // bin[d]: start of the degree-d block inside `order`
    let mut bin = vec![0usize; max_degree + 1];
    for &d in &degree {
        bin[d] += 1;
    }
    let mut start = 0;
    for slot in bin.iter_mut() {
        let count = *slot;
        *slot = start;
        start += count;
    }
    let mut position = vec![0usize; num_vertices];
    let mut order = vec![0usize; num_vertices];
    for v in 0..num_vertices {
        position[v] = bin[degree[v]];
        order[position[v]] = v;
        bin[degree[v]] += 1;
    }
    for d in (1..=max_degree).rev() {
        bin[d] = bin[d - 1];
    }
    bin[0] = 0;

    for i in 0..num_vertices {
        let v = order[i];
        for &u in &adjacency[v] {
            if degree[u] > degree[v] {
                let du = degree[u];
                let pu = position[u];
                let pw = bin[du];
                let w = order[pw];
                if u != w {
                    position[u] = pw;
                    order[pu] = w;
                    position[w] = pu;
                    order[pw] = u;
                }
                bin[du] += 1;
                degree[u] -= 1;
            }
        }
    }
    degree
}

#[cfg(test)]
mod tests {
    use nalgebra::{Rotation3, Vector3};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    #[test]
    fn test_core_numbers() {
        // Triangle 0-1-2 with a pendant vertex 3 attached to 0.
        let adjacency = vec![vec![1, 2, 3], vec![0, 2], vec![0, 1], vec![0]];
        assert_eq!(core_numbers(&adjacency), vec![2, 2, 2, 1]);
        assert!(core_numbers(&[]).is_empty());
    }

    #[test]
    fn test_outliers_removed() {
        let mut rng = StdRng::seed_from_u64(17);
        let source = (0..60)
            .map(|_| {
                Point::new(
                    rng.random_range(-10.0..10.0),
                    rng.random_range(-10.0..10.0),
                    rng.random_range(-10.0..10.0),
                )
            })
            .collect::<Vec<_>>();
        let rotation = Rotation3::from_euler_angles(0.3, 0.0, -1.1);
        let translation = Vector3::new(5.0, 2.0, -3.0);
        let target = source
            .iter()
            .map(|p| rotation * p + translation)
            .collect::<Vec<_>>();

        let mut correspondences = (0..50).map(|i| (i, i)).collect::<Vec<_>>();
        // Ten wrong pairings.
        correspondences.extend((50..60).map(|i| (i, 109 - i)));

        let kept = max_core_pruning(&correspondences, &source, &target, 0.05);
        let expected = (0..50).map(|i| (i, i)).collect::<Vec<_>>();
        assert_eq!(kept, expected);
    }

    #[test]
    fn test_too_few_pass_through() {
        let source = vec![Point::origin()];
        let kept = max_core_pruning(&[(0, 0)], &source, &source, 0.1);
        assert_eq!(kept, vec![(0, 0)]);
    }
}
