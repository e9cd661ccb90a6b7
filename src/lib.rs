use std::borrow::Cow;
use std::fmt::Display;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::downsample::{VoxelGridSampler, VoxelSampler};
use crate::error::{ConfigError, RegistrationError};
use crate::feature_matching::{CorrespondenceMatcher, MatchStats, MatchingConfig, MatchingMode, THR_DIST};
use crate::gnc_solver::{PoseSolver, RegistrationSolution, RobustRegistrationSolver, RotationEstimation, SolverParams};
use crate::graph_pruning::max_core_pruning;
use crate::point_feature_histograms::{FasterPfh, FeatureExtractor};
use crate::prelude::*;

pub mod prelude {
    // there is no information on the value of bin size H in the paper.
    // 5 comes from the original FPFH paper
    // https://web.archive.org/web/20240906202141/
    // https://www.cvl.iis.u-tokyo.ac.jp/class2016/2016w/papers/6.3DdataProcessing/Rusu_FPFH_ICRA2009.pdf
    // and 11 from PCL https://web.archive.org/web/20240429124409/
    // https://pcl.readthedocs.io/projects/tutorials/en/latest/fpfh_estimation.html
    pub const HISTOGRAM_NUM_BINS: usize = 11;
    pub const DESCRIPTOR_DIM: usize = HISTOGRAM_NUM_BINS * 3;

    use nalgebra::Point3;

    pub type Point = Point3<f64>;
    pub type Descriptor = [f64; DESCRIPTOR_DIM];
    /// `(source_index, target_index)`
    pub type Correspondence = (usize, usize);
}

pub mod descriptor_index;
pub mod downsample;
pub mod error;
pub mod feature_matching;
pub mod gnc_solver;
pub mod graph_pruning;
pub mod normal_estimation;
pub mod point_feature_histograms;
pub mod query;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PruningMode {
    None,
    /// Keep the maximum k-core of the pairwise consistency graph.
    #[default]
    MaxCore,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegistrationConfig {
    pub voxel_size: f64,
    pub use_voxel_sampling: bool,
    pub rotation_estimation: RotationEstimation,
    pub num_max_corr: usize,
    // Below params just work in general cases
    pub normal_radius_gain: f64,
    pub fpfh_radius_gain: f64,
    pub max_linearity: f64,
    // The smaller, the more conservative
    pub pruning_noise_bound_gain: f64,
    pub solver_noise_bound_gain: f64,
    pub pruning: PruningMode,
    pub tuple_scale: f64,
    pub matching_mode: MatchingMode,
    pub use_ratio_test: bool,
    pub use_crosscheck: bool,
    /// Fixed seed for the tuple test. `None` draws fresh entropy every call.
    pub seed: Option<u64>,
}

impl RegistrationConfig {
    pub fn new(voxel_size: f64) -> Self {
        Self {
            voxel_size,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.voxel_size.is_finite() || self.voxel_size <= 0.0 {
            return Err(ConfigError::InvalidVoxelSize(self.voxel_size));
        }
        if self.solver_noise_bound_gain >= self.pruning_noise_bound_gain {
            return Err(ConfigError::NoiseBoundGainOrder {
                solver: self.solver_noise_bound_gain,
                pruning: self.pruning_noise_bound_gain,
            });
        }
        if !(0.0..1.0).contains(&self.tuple_scale) {
            return Err(ConfigError::InvalidTupleScale(self.tuple_scale));
        }
        if self.num_max_corr == 0 {
            return Err(ConfigError::ZeroMaxCorrespondences);
        }
        Ok(())
    }

    pub fn build(self) -> Result<Registration, ConfigError> {
        Registration::new(self)
    }

    pub fn matching_config(&self) -> MatchingConfig {
        MatchingConfig {
            use_absolute_scale: true,
            use_crosscheck: self.use_crosscheck,
            use_tuple_test: self.tuple_scale != 0.0,
            tuple_scale: self.tuple_scale,
            distance_threshold: THR_DIST,
            max_correspondences: self.num_max_corr,
            mode: self.matching_mode,
            use_ratio_test: self.use_ratio_test,
            ..Default::default()
        }
    }

    pub fn solver_params(&self) -> SolverParams {
        SolverParams {
            noise_bound: self.solver_noise_bound_gain * self.voxel_size,
            rotation_estimation: self.rotation_estimation,
            ..Default::default()
        }
    }
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            voxel_size: 0.3,
            use_voxel_sampling: true,
            rotation_estimation: RotationEstimation::GncTls,
            num_max_corr: 5000,
            normal_radius_gain: 3.0,
            fpfh_radius_gain: 5.0,
            max_linearity: 1.0,
            pruning_noise_bound_gain: 1.0,
            solver_noise_bound_gain: 0.75,
            pruning: PruningMode::MaxCore,
            tuple_scale: 0.95,
            matching_mode: MatchingMode::Optimized,
            use_ratio_test: false,
            use_crosscheck: true,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Timings {
    pub processing: Duration,
    pub extraction: Duration,
    pub matching: Duration,
    pub pruning: Duration,
    pub solving: Duration,
    pub matcher: MatchStats,
}

impl Timings {
    pub fn total(&self) -> Duration {
        self.processing + self.extraction + self.matching + self.pruning + self.solving
    }
}

impl Display for Timings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Timings:
  Voxelization: {:?}
  Extraction: {:?}
  Matching: {:?}
    Index Building: {:?}
    Search: {:?}
    Correspondences: {:?}
    Tuple Test: {:?}
  Pruning: {:?}
  Solving: {:?}
  Total: {:?}
  Matching Candidates: {}",
            self.processing,
            self.extraction,
            self.matching,
            self.matcher.index_building,
            self.matcher.search,
            self.matcher.correspondence,
            self.matcher.tuple_test,
            self.pruning,
            self.solving,
            self.total(),
            self.matcher.candidates,
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistrationScore {
    pub initial_pairs: usize,
    pub pruned_pairs: usize,
    pub rotation_inliers: usize,
    pub translation_inliers: usize,
}

impl Display for RegistrationScore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Correspondences: initial {}, pruned {}, rotation inliers {}, translation inliers {}",
            self.initial_pairs, self.pruned_pairs, self.rotation_inliers, self.translation_inliers
        )
    }
}

/// Matched 3D positions; `source[k]` corresponds to `target[k]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeypointPair {
    pub source: Vec<Point>,
    pub target: Vec<Point>,
}

impl KeypointPair {
    fn gather(source: &[Point], target: &[Point], correspondences: &[Correspondence]) -> Self {
        Self {
            source: correspondences.iter().map(|&(i, _)| source[i]).collect(),
            target: correspondences.iter().map(|&(_, j)| target[j]).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
    }
}

/// Sampling, description, matching, pruning and robust solving of one
/// source/target pair per call.
#[derive(Debug)]
pub struct Registration<E = FasterPfh, S = VoxelGridSampler, P = RobustRegistrationSolver> {
    config: RegistrationConfig,
    extractor: E,
    sampler: S,
    solver: P,
    matcher: CorrespondenceMatcher,
    source_keypoints: Vec<Point>,
    target_keypoints: Vec<Point>,
    initial_correspondences: Vec<Correspondence>,
    pruned_correspondences: Vec<Correspondence>,
    timings: Timings,
}

impl Registration {
    pub fn new(config: RegistrationConfig) -> Result<Self, ConfigError> {
        Self::with_collaborators(
            config,
            FasterPfh::from_config(&config),
            VoxelGridSampler,
            RobustRegistrationSolver::new(config.solver_params()),
        )
    }
}

impl<E: FeatureExtractor, S: VoxelSampler, P: PoseSolver> Registration<E, S, P> {
    pub fn with_collaborators(
        config: RegistrationConfig,
        extractor: E,
        sampler: S,
        solver: P,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            extractor,
            sampler,
            solver,
            matcher: CorrespondenceMatcher::new(config.matching_config()),
            source_keypoints: Vec::new(),
            target_keypoints: Vec::new(),
            initial_correspondences: Vec::new(),
            pruned_correspondences: Vec::new(),
            timings: Timings::default(),
        })
    }

    pub fn config(&self) -> &RegistrationConfig {
        &self.config
    }

    /// Replaces the configuration and hands it to every collaborator. The
    /// current configuration stays in place if the new one is invalid.
    pub fn configure(&mut self, config: RegistrationConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.config = config;
        self.matcher.set_config(config.matching_config());
        self.extractor.reconfigure(&config);
        self.solver.reconfigure(&config);
        self.solver.reset();
        Ok(())
    }

    fn clear(&mut self) {
        self.source_keypoints.clear();
        self.target_keypoints.clear();
        self.initial_correspondences.clear();
        self.pruned_correspondences.clear();
        self.timings = Timings::default();
    }

    /// Matched keypoint positions between `source` and `target`.
    pub fn match_clouds(
        &mut self,
        source: &[Point],
        target: &[Point],
    ) -> Result<KeypointPair, RegistrationError> {
        self.clear();
        let config = self.config;

        let start = Instant::now();
        let (source_input, target_input): (Cow<[Point]>, Cow<[Point]>) = if config.use_voxel_sampling {
            (
                Cow::Owned(self.sampler.sample(source, config.voxel_size)),
                Cow::Owned(self.sampler.sample(target, config.voxel_size)),
            )
        } else {
            (Cow::Borrowed(source), Cow::Borrowed(target))
        };
        self.timings.processing = start.elapsed();

        let start = Instant::now();
        // Some points cannot be described, so there may be fewer keypoints
        // than input points.
        let (source_keypoints, source_descriptors) = self.extractor.extract(&source_input);
        let (target_keypoints, target_descriptors) = self.extractor.extract(&target_input);
        assert_eq!(source_keypoints.len(), source_descriptors.len());
        assert_eq!(target_keypoints.len(), target_descriptors.len());
        self.source_keypoints = source_keypoints;
        self.target_keypoints = target_keypoints;
        self.timings.extraction = start.elapsed();
        debug!(
            "Extracted {} source and {} target keypoints",
            self.source_keypoints.len(),
            self.target_keypoints.len()
        );

        if self.source_keypoints.is_empty() || self.target_keypoints.is_empty() {
            warn!("No keypoints to match");
            return Ok(KeypointPair::default());
        }

        let start = Instant::now();
        let correspondences = match config.seed {
            Some(seed) => self.matcher.establish_with_rng(
                &self.source_keypoints,
                &self.target_keypoints,
                &source_descriptors,
                &target_descriptors,
                &mut StdRng::seed_from_u64(seed),
            )?,
            None => self.matcher.establish(
                &self.source_keypoints,
                &self.target_keypoints,
                &source_descriptors,
                &target_descriptors,
            )?,
        };
        self.timings.matcher = *self.matcher.stats();
        self.timings.matching = start.elapsed();

        let start = Instant::now();
        self.pruned_correspondences = match config.pruning {
            PruningMode::None => correspondences.clone(),
            PruningMode::MaxCore => max_core_pruning(
                &correspondences,
                &self.source_keypoints,
                &self.target_keypoints,
                config.pruning_noise_bound_gain * config.voxel_size,
            ),
        };
        self.initial_correspondences = correspondences;
        self.timings.pruning = start.elapsed();

        Ok(KeypointPair::gather(
            &self.source_keypoints,
            &self.target_keypoints,
            &self.pruned_correspondences,
        ))
    }

    /// Rigid transform taking `source` onto `target`. Too few matches yield the
    /// solver's reset solution, i.e. an invalid identity.
    pub fn estimate(
        &mut self,
        source: &[Point],
        target: &[Point],
    ) -> Result<RegistrationSolution, RegistrationError> {
        self.solver.reset();
        let matched = self.match_clouds(source, target)?;
        if matched.len() < 2 {
            warn!("Only {} matched pairs, skipping the solver", matched.len());
            return Ok(self.solver.solution().clone());
        }

        let start = Instant::now();
        self.solver.solve(&matched.source, &matched.target)?;
        self.timings.solving = start.elapsed();

        let solution = self.solver.solution().clone();
        info!(
            "Registration {}: {}",
            if solution.valid { "succeeded" } else { "failed" },
            self.score()
        );
        Ok(solution)
    }

    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    pub fn score(&self) -> RegistrationScore {
        let solution = self.solver.solution();
        RegistrationScore {
            initial_pairs: self.initial_correspondences.len(),
            pruned_pairs: self.pruned_correspondences.len(),
            rotation_inliers: solution.rotation_inliers.len(),
            translation_inliers: solution.translation_inliers.len(),
        }
    }

    pub fn solution(&self) -> &RegistrationSolution {
        self.solver.solution()
    }

    /// Keypoints kept by the extractor in the last call.
    pub fn keypoints(&self) -> KeypointPair {
        KeypointPair {
            source: self.source_keypoints.clone(),
            target: self.target_keypoints.clone(),
        }
    }

    pub fn initial_correspondences(&self) -> &[Correspondence] {
        &self.initial_correspondences
    }

    pub fn pruned_correspondences(&self) -> &[Correspondence] {
        &self.pruned_correspondences
    }

    /// Keypoint pairs of the matching output, before pruning.
    pub fn initial_keypoint_pairs(&self) -> KeypointPair {
        KeypointPair::gather(
            &self.source_keypoints,
            &self.target_keypoints,
            &self.initial_correspondences,
        )
    }
}
