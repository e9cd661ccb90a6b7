use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use log::{debug, warn};
use nalgebra::Vector3;
use rand::Rng;
use rayon::prelude::*;

use crate::descriptor_index::{DescriptorIndex, IndexParams, Neighbor};
use crate::error::IndexError;
use crate::prelude::*;
use crate::tuple_test::{TRIALS_PER_CANDIDATE, capped_tuple_test, tuple_test};

/// Threshold on the squared-distance ratio between best and second best match.
pub const THR_RATIO_TEST: f64 = 0.9;
pub const THR_DIST: f64 = 60.0;

const UNRESOLVED: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchingMode {
    /// Single threaded; combines both search directions, then sorts and dedups.
    Exhaustive,
    /// Parallel mutual matching with a capped tuple test. Output is neither
    /// sorted nor deduplicated.
    #[default]
    Optimized,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchingConfig {
    pub use_absolute_scale: bool,
    pub use_crosscheck: bool,
    pub use_tuple_test: bool,
    /// Edge length ratio bound of the tuple test. Zero disables it.
    pub tuple_scale: f64,
    /// Descriptor distance above which optimized matching drops a candidate.
    pub distance_threshold: f64,
    pub max_correspondences: usize,
    pub mode: MatchingMode,
    pub use_ratio_test: bool,
    pub ratio_threshold: f64,
    pub index: IndexParams,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            use_absolute_scale: true,
            use_crosscheck: true,
            use_tuple_test: true,
            tuple_scale: 0.95,
            distance_threshold: THR_DIST,
            max_correspondences: 5000,
            mode: MatchingMode::Optimized,
            use_ratio_test: false,
            ratio_threshold: THR_RATIO_TEST,
            index: IndexParams::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MatchStats {
    /// Correspondences that reached the tuple test (or the output, if skipped).
    pub candidates: usize,
    pub output: usize,
    pub tuple_trials: usize,
    pub index_building: Duration,
    pub search: Duration,
    pub correspondence: Duration,
    pub tuple_test: Duration,
}

/// Recenters both clouds on their own centroid and divides both by one shared
/// scale, so the relative geometry between them is untouched. Returns that
/// scale: `1.0` in absolute mode, otherwise the largest centroid distance over
/// both clouds.
pub fn normalize_points(source: &mut [Point], target: &mut [Point], use_absolute_scale: bool) -> f64 {
    let mut max_radius = 0.0_f64;
    for cloud in [&mut *source, &mut *target] {
        if cloud.is_empty() {
            continue;
        }
        let mean = cloud.iter().map(|p| p.coords).sum::<Vector3<f64>>() / cloud.len() as f64;
        for point in cloud.iter_mut() {
            point.coords -= mean;
            max_radius = max_radius.max(point.coords.norm());
        }
    }

    let global_scale = if use_absolute_scale || max_radius <= 0.0 {
        1.0
    } else {
        max_radius
    };
    if global_scale != 1.0 {
        for point in source.iter_mut().chain(target.iter_mut()) {
            point.coords /= global_scale;
        }
    }
    global_scale
}

#[derive(Clone, Copy)]
struct CloudView<'a> {
    points: &'a [Point],
    descriptors: &'a [Descriptor],
}

impl CloudView<'_> {
    fn len(&self) -> usize {
        self.points.len()
    }
}

/// The two clouds of one matching call, oriented so that `tree_side` is the
/// larger one. Every index pair produced internally is `(tree_side, query_side)`;
/// `restore` maps it back to the caller's `(source, target)` order.
struct OrientedClouds<'a> {
    tree_side: CloudView<'a>,
    query_side: CloudView<'a>,
    swapped: bool,
}

impl<'a> OrientedClouds<'a> {
    fn new(source: CloudView<'a>, target: CloudView<'a>) -> Self {
        let swapped = target.len() > source.len();
        if swapped {
            Self {
                tree_side: target,
                query_side: source,
                swapped,
            }
        } else {
            Self {
                tree_side: source,
                query_side: target,
                swapped,
            }
        }
    }

    fn restore(&self, correspondences: &mut [Correspondence]) {
        if self.swapped {
            for (i, j) in correspondences.iter_mut() {
                std::mem::swap(i, j);
            }
        }
    }
}

/// Turns two descriptor sets into candidate point correspondences.
///
/// Nothing but the configuration and the statistics of the last call survive
/// between calls.
#[derive(Debug, Clone, Default)]
pub struct CorrespondenceMatcher {
    config: MatchingConfig,
    stats: MatchStats,
}

impl CorrespondenceMatcher {
    pub fn new(config: MatchingConfig) -> Self {
        Self {
            config,
            stats: MatchStats::default(),
        }
    }

    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: MatchingConfig) {
        self.config = config;
    }

    pub fn stats(&self) -> &MatchStats {
        &self.stats
    }

    /// `establish_with_rng` seeded from the operating system.
    pub fn establish(
        &mut self,
        source_points: &[Point],
        target_points: &[Point],
        source_descriptors: &[Descriptor],
        target_descriptors: &[Descriptor],
    ) -> Result<Vec<Correspondence>, IndexError> {
        self.establish_with_rng(
            source_points,
            target_points,
            source_descriptors,
            target_descriptors,
            &mut rand::rng(),
        )
    }

    /// Returns `(source_index, target_index)` pairs.
    ///
    /// # Panics
    /// If a cloud and its descriptor set differ in length.
    pub fn establish_with_rng<R: Rng + ?Sized>(
        &mut self,
        source_points: &[Point],
        target_points: &[Point],
        source_descriptors: &[Descriptor],
        target_descriptors: &[Descriptor],
        rng: &mut R,
    ) -> Result<Vec<Correspondence>, IndexError> {
        assert_eq!(
            source_points.len(),
            source_descriptors.len(),
            "every source point needs exactly one descriptor"
        );
        assert_eq!(
            target_points.len(),
            target_descriptors.len(),
            "every target point needs exactly one descriptor"
        );
        self.stats = MatchStats::default();

        if source_points.is_empty() || target_points.is_empty() {
            warn!(
                "Skipping matching, empty cloud. Source length: {}, Target length: {}",
                source_points.len(),
                target_points.len()
            );
            return Ok(Vec::new());
        }

        let mut source = source_points.to_vec();
        let mut target = target_points.to_vec();
        if self.config.mode == MatchingMode::Exhaustive {
            let scale = normalize_points(&mut source, &mut target, self.config.use_absolute_scale);
            debug!("Normalized clouds with global scale {scale}");
        }

        let clouds = OrientedClouds::new(
            CloudView {
                points: &source,
                descriptors: source_descriptors,
            },
            CloudView {
                points: &target,
                descriptors: target_descriptors,
            },
        );
        debug!(
            "Starting {:?} matching. Source length: {}, Target length: {}, swapped: {}",
            self.config.mode,
            source.len(),
            target.len(),
            clouds.swapped
        );

        let correspondences = match self.config.mode {
            MatchingMode::Exhaustive => self.exhaustive_matching(&clouds, rng)?,
            MatchingMode::Optimized => self.optimized_matching(&clouds, rng)?,
        };
        self.stats.output = correspondences.len();
        debug!(
            "Matching finished: {} candidates, {} correspondences",
            self.stats.candidates, self.stats.output
        );
        Ok(correspondences)
    }

    fn build_indices(
        &mut self,
        clouds: &OrientedClouds,
    ) -> Result<(DescriptorIndex, DescriptorIndex), IndexError> {
        let start = Instant::now();
        let tree_index = DescriptorIndex::build_with(clouds.tree_side.descriptors, self.config.index)?;
        let query_index = DescriptorIndex::build_with(clouds.query_side.descriptors, self.config.index)?;
        self.stats.index_building = start.elapsed();
        Ok((tree_index, query_index))
    }

    fn exhaustive_matching<R: Rng + ?Sized>(
        &mut self,
        clouds: &OrientedClouds,
        rng: &mut R,
    ) -> Result<Vec<Correspondence>, IndexError> {
        let (tree_index, query_index) = self.build_indices(clouds)?;
        let num_tree = clouds.tree_side.len();
        let num_query = clouds.query_side.len();

        let start = Instant::now();
        // Reverse matches are looked up lazily, once per tree point that
        // some query point landed on.
        let mut tree_to_query: Vec<Option<usize>> = vec![None; num_tree];
        let mut query_to_tree = Vec::with_capacity(num_query);
        for (j, descriptor) in clouds.query_side.descriptors.iter().enumerate() {
            let Some(Neighbor { index: i, .. }) = tree_index.nearest(descriptor) else {
                continue;
            };
            if tree_to_query[i].is_none() {
                tree_to_query[i] = query_index
                    .nearest(&clouds.tree_side.descriptors[i])
                    .map(|n| n.index);
            }
            query_to_tree.push((i, j));
        }
        let forward = tree_to_query
            .iter()
            .enumerate()
            .filter_map(|(i, j)| j.map(|j| (i, j)))
            .collect::<Vec<_>>();
        self.stats.search = start.elapsed();

        let start = Instant::now();
        let mut correspondences = if self.config.use_crosscheck {
            cross_check(&forward, &query_to_tree, num_tree, num_query)
        } else {
            let mut combined = forward;
            combined.extend_from_slice(&query_to_tree);
            combined
        };
        self.stats.correspondence = start.elapsed();
        self.stats.candidates = correspondences.len();

        if self.config.use_tuple_test && self.config.tuple_scale != 0.0 {
            let start = Instant::now();
            self.stats.tuple_trials = correspondences.len() * TRIALS_PER_CANDIDATE;
            correspondences = tuple_test(
                &correspondences,
                clouds.tree_side.points,
                clouds.query_side.points,
                self.config.tuple_scale,
                rng,
            );
            self.stats.tuple_test = start.elapsed();
        }

        clouds.restore(&mut correspondences);
        correspondences.sort_unstable();
        correspondences.dedup();
        Ok(correspondences)
    }

    fn optimized_matching<R: Rng + ?Sized>(
        &mut self,
        clouds: &OrientedClouds,
        rng: &mut R,
    ) -> Result<Vec<Correspondence>, IndexError> {
        let (tree_index, query_index) = self.build_indices(clouds)?;
        let tree_descriptors = clouds.tree_side.descriptors;

        let start = Instant::now();
        let use_ratio_test = self.config.use_ratio_test && tree_index.len() >= 2;
        let k = if use_ratio_test { 2 } else { 1 };
        let nearest = tree_index.query_batch(clouds.query_side.descriptors, k);
        self.stats.search = start.elapsed();

        let start = Instant::now();
        let sqr_threshold = self.config.distance_threshold * self.config.distance_threshold;
        let ratio_threshold = self.config.ratio_threshold;
        // Reverse match per tree point, shared by all workers without a lock.
        // Any worker resolving index i stores the same value, so a race only
        // costs a redundant query.
        let tree_to_query = std::iter::repeat_with(|| AtomicUsize::new(UNRESOLVED))
            .take(tree_index.len())
            .collect::<Vec<_>>();

        let mut correspondences = nearest
            .par_iter()
            .enumerate()
            .fold(Vec::new, |mut local, (j, neighbors)| {
                let Some(best) = neighbors.first() else {
                    return local;
                };
                if best.squared_distance > sqr_threshold {
                    return local;
                }
                if use_ratio_test {
                    if let Some(second) = neighbors.get(1) {
                        let ratio = best.squared_distance / second.squared_distance;
                        if ratio > ratio_threshold || !ratio.is_finite() {
                            return local;
                        }
                    }
                }
                let i = best.index;
                let mut reverse = tree_to_query[i].load(Ordering::Relaxed);
                if reverse == UNRESOLVED {
                    reverse = query_index
                        .nearest(&tree_descriptors[i])
                        .map_or(UNRESOLVED, |n| n.index);
                    tree_to_query[i].store(reverse, Ordering::Relaxed);
                }
                if reverse == j {
                    local.push((i, j));
                }
                local
            })
            .reduce(Vec::new, |mut merged, local| {
                merged.extend(local);
                merged
            });
        self.stats.correspondence = start.elapsed();
        self.stats.candidates = correspondences.len();

        if self.config.use_tuple_test && self.config.tuple_scale != 0.0 {
            let start = Instant::now();
            let outcome = capped_tuple_test(
                &correspondences,
                clouds.tree_side.points,
                clouds.query_side.points,
                self.config.tuple_scale,
                self.config.max_correspondences,
                rng,
            );
            self.stats.tuple_trials = outcome.trials;
            correspondences = outcome.correspondences;
            self.stats.tuple_test = start.elapsed();
        }

        clouds.restore(&mut correspondences);
        Ok(correspondences)
    }
}

/// Keeps the pairs `(i, j)` where `i` maps to `j` and `j` maps back to `i`,
/// over every recorded neighbor of each index.
fn cross_check(
    forward: &[Correspondence],
    reverse: &[Correspondence],
    num_tree: usize,
    num_query: usize,
) -> Vec<Correspondence> {
    let mut tree_neighbors: Vec<Vec<usize>> = vec![Vec::new(); num_tree];
    let mut query_neighbors: Vec<Vec<usize>> = vec![Vec::new(); num_query];
    for &(i, j) in forward {
        tree_neighbors[i].push(j);
    }
    for &(i, j) in reverse {
        query_neighbors[j].push(i);
    }

    let mut mutual = Vec::new();
    for (i, neighbors) in tree_neighbors.iter().enumerate() {
        for &j in neighbors {
            for &back in &query_neighbors[j] {
                if back == i {
                    mutual.push((i, j));
                }
            }
        }
    }
    mutual
}
