use ahash::{HashMap, HashMapExt};
use hora::core::ann_index::ANNIndex;
use hora::core::metrics::Metric;
use hora::core::node::Node;
use hora::index::hnsw_idx::HNSWIndex;
use hora::index::hnsw_params::HNSWParams;
use log::debug;
use rayon::prelude::*;

use crate::error::IndexError;
use crate::prelude::*;

/// Accuracy/speed knobs of the descriptor index. None of them change what a
/// query means, only how hard the graph is searched for it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexParams {
    /// Candidate list size while searching. Equivalent of FLANN's `checks`.
    pub search_budget: usize,
    /// Candidate list size while inserting.
    pub build_budget: usize,
    /// Links kept per node on the upper layers.
    pub neighbors: usize,
}

impl Default for IndexParams {
    fn default() -> Self {
        Self {
            search_budget: 128,
            build_budget: 128,
            neighbors: 32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub index: usize,
    pub squared_distance: f64,
}

/// Approximate k-nearest-neighbor index over a descriptor set.
///
/// Backed by an HNSW graph. Bit-identical descriptors, common on flat regions,
/// share one graph node; queries expand it back into every descriptor it
/// stands for, lowest index first.
///
/// Building over an empty set is rejected by the callers, not here: the
/// matcher checks emptiness before it gets this far.
pub struct DescriptorIndex {
    index: HNSWIndex<f64, u64>,
    /// Descriptor indices behind each graph node.
    members: Vec<Vec<usize>>,
    len: usize,
}

impl DescriptorIndex {
    pub fn build(descriptors: &[Descriptor]) -> Result<Self, IndexError> {
        Self::build_with(descriptors, IndexParams::default())
    }

    pub fn build_with(descriptors: &[Descriptor], params: IndexParams) -> Result<Self, IndexError> {
        debug_assert!(!descriptors.is_empty());
        let hnsw_params = HNSWParams::<f64>::default()
            .max_item(descriptors.len().max(1))
            .n_neighbor(params.neighbors)
            .n_neighbor0(params.neighbors * 2)
            .ef_build(params.build_budget)
            .ef_search(params.search_budget);
        let mut index = HNSWIndex::new(DESCRIPTOR_DIM, &hnsw_params);
        let mut nodes: HashMap<[u64; DESCRIPTOR_DIM], usize> = HashMap::with_capacity(descriptors.len());
        let mut members: Vec<Vec<usize>> = Vec::new();
        for (i, descriptor) in descriptors.iter().enumerate() {
            let next = members.len();
            let node = *nodes.entry(descriptor.map(f64::to_bits)).or_insert(next);
            if node == next {
                index
                    .add_node(&Node::new_with_idx(descriptor, node as u64))
                    .map_err(|reason| IndexError::Insert { index: i, reason })?;
                members.push(Vec::new());
            }
            members[node].push(i);
        }
        index.build(Metric::Euclidean).map_err(IndexError::Build)?;
        if members.len() < descriptors.len() {
            debug!(
                "Indexed {} descriptors as {} distinct nodes",
                descriptors.len(),
                members.len()
            );
        }
        Ok(Self {
            index,
            members,
            len: descriptors.len(),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Up to `k` neighbors of `descriptor`, nearest first.
    pub fn query(&self, descriptor: &Descriptor, k: usize) -> Vec<Neighbor> {
        let mut neighbors = self
            .index
            .search_nodes(descriptor, k)
            .into_iter()
            .filter_map(|(node, distance)| Some(((*node.idx())? as usize, distance * distance)))
            .flat_map(|(node, squared_distance)| {
                self.members[node].iter().map(move |&index| Neighbor {
                    index,
                    squared_distance,
                })
            })
            .collect::<Vec<_>>();
        // stable, so members of one node keep their ascending order
        neighbors.sort_by(|a, b| a.squared_distance.total_cmp(&b.squared_distance));
        neighbors.truncate(k);
        neighbors
    }

    pub fn nearest(&self, descriptor: &Descriptor) -> Option<Neighbor> {
        self.query(descriptor, 1).into_iter().next()
    }

    /// Runs one independent `query` per descriptor in parallel. Searching does
    /// not mutate the graph, so the result is the same as querying in a loop.
    pub fn query_batch(&self, descriptors: &[Descriptor], k: usize) -> Vec<Vec<Neighbor>> {
        descriptors
            .par_iter()
            .map(|descriptor| self.query(descriptor, k))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use all_asserts::assert_le;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    fn random_descriptors(rng: &mut StdRng, count: usize) -> Vec<Descriptor> {
        (0..count)
            .map(|_| std::array::from_fn(|_| rng.random_range(0.0..100.0)))
            .collect()
    }

    #[test]
    fn test_finds_itself() {
        let mut rng = StdRng::seed_from_u64(7);
        let descriptors = random_descriptors(&mut rng, 64);
        let index = DescriptorIndex::build(&descriptors).unwrap();
        assert_eq!(index.len(), 64);
        for (i, descriptor) in descriptors.iter().enumerate() {
            let nearest = index.nearest(descriptor).unwrap();
            assert_eq!(nearest.index, i);
            assert_le!(nearest.squared_distance, 1e-9);
        }
    }

    #[test]
    fn test_identical_descriptors_share_a_node() {
        let mut descriptors = vec![[0.0; DESCRIPTOR_DIM]; 200];
        descriptors.push([1.0; DESCRIPTOR_DIM]);
        let index = DescriptorIndex::build(&descriptors).unwrap();
        assert_eq!(index.len(), 201);
        assert_eq!(index.members.len(), 2);

        let nearest = index.nearest(&[0.0; DESCRIPTOR_DIM]).unwrap();
        assert_eq!(nearest.index, 0);
        assert_eq!(nearest.squared_distance, 0.0);
        let neighbors = index.query(&[0.0; DESCRIPTOR_DIM], 3);
        assert_eq!(
            neighbors.iter().map(|n| n.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(index.nearest(&[0.9; DESCRIPTOR_DIM]).unwrap().index, 200);
    }

    #[test]
    fn test_results_sorted_ascending() {
        let mut rng = StdRng::seed_from_u64(11);
        let descriptors = random_descriptors(&mut rng, 50);
        let index = DescriptorIndex::build(&descriptors).unwrap();
        let neighbors = index.query(&descriptors[3], 5);
        assert_eq!(neighbors.len(), 5);
        for pair in neighbors.windows(2) {
            assert_le!(pair[0].squared_distance, pair[1].squared_distance);
        }
    }

    #[test]
    fn test_batch_matches_single_queries() {
        let mut rng = StdRng::seed_from_u64(3);
        let descriptors = random_descriptors(&mut rng, 80);
        let queries = random_descriptors(&mut rng, 20);
        let index = DescriptorIndex::build(&descriptors).unwrap();
        let batched = index.query_batch(&queries, 3);
        let single = queries.iter().map(|q| index.query(q, 3)).collect::<Vec<_>>();
        assert_eq!(batched, single);
    }
}
