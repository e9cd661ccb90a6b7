use log::debug;
use nalgebra::linalg::SVD;
use nalgebra::{DVector, Isometry3, Matrix3, Matrix3xX, Rotation3, UnitQuaternion, Vector3};

use crate::RegistrationConfig;
use crate::error::SolverError;
use crate::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationEstimation {
    /// Yaw only. Use when pitch and roll are not dominant, e.g. ground robots.
    Quatro,
    /// Full 3D rotation.
    #[default]
    GncTls,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverParams {
    pub noise_bound: f64,
    pub rotation_estimation: RotationEstimation,
    pub gnc_factor: f64,
    pub max_iterations: usize,
    pub cost_threshold: f64,
}

impl Default for SolverParams {
    fn default() -> Self {
        Self {
            noise_bound: 0.01,
            rotation_estimation: RotationEstimation::GncTls,
            gnc_factor: 1.4,
            max_iterations: 100,
            cost_threshold: 0.005,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationSolution {
    pub valid: bool,
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
    pub scale: f64,
    /// Correspondence indices accepted by the rotation stage.
    pub rotation_inliers: Vec<usize>,
    /// Subset of the rotation inliers accepted by the translation stage.
    pub translation_inliers: Vec<usize>,
}

impl Default for RegistrationSolution {
    /// Identity transform, flagged invalid.
    fn default() -> Self {
        Self {
            valid: false,
            rotation: Matrix3::identity(),
            translation: Vector3::zeros(),
            scale: 1.0,
            rotation_inliers: Vec::new(),
            translation_inliers: Vec::new(),
        }
    }
}

impl RegistrationSolution {
    pub fn as_isometry(&self) -> Result<Isometry3<f64>, Isometry3<f64>> {
        let iso = Isometry3::from_parts(
            self.translation.into(),
            UnitQuaternion::from_matrix(&self.rotation),
        );
        if self.valid { Ok(iso) } else { Err(iso) }
    }
}

/// Outlier-robust rigid pose estimation from putative point pairs.
pub trait PoseSolver {
    /// Drops the last solution; `solution()` reports the identity afterwards.
    fn reset(&mut self);

    /// # Errors
    /// When `source` and `target` differ in length.
    fn solve(&mut self, source: &[Point], target: &[Point]) -> Result<(), SolverError>;

    fn solution(&self) -> &RegistrationSolution;

    fn reconfigure(&mut self, _config: &RegistrationConfig) {}
}

/// Graduated non-convexity over a truncated least squares cost.
#[derive(Debug, Clone, Default)]
pub struct RobustRegistrationSolver {
    params: SolverParams,
    solution: RegistrationSolution,
    iterations: usize,
}

impl RobustRegistrationSolver {
    pub fn new(params: SolverParams) -> Self {
        Self {
            params,
            solution: RegistrationSolution::default(),
            iterations: 0,
        }
    }

    pub fn params(&self) -> &SolverParams {
        &self.params
    }

    /// GNC iterations run by the last `solve`.
    pub fn iterations(&self) -> usize {
        self.iterations
    }
}

impl PoseSolver for RobustRegistrationSolver {
    fn reset(&mut self) {
        self.solution = RegistrationSolution::default();
        self.iterations = 0;
    }

    fn solve(&mut self, source: &[Point], target: &[Point]) -> Result<(), SolverError> {
        if source.len() != target.len() {
            return Err(SolverError::LengthMismatch {
                source_len: source.len(),
                target_len: target.len(),
            });
        }
        self.reset();
        if source.len() < 2 {
            return Ok(());
        }

        let source = points_to_matrix(source);
        let target = points_to_matrix(target);
        let Some(outcome) = graduated_non_convexity(&self.params, &source, &target) else {
            debug!("GNC solver found no consistent subset");
            return Ok(());
        };
        self.iterations = outcome.iterations;

        let rotation_inliers = outcome
            .weights
            .iter()
            .enumerate()
            .filter_map(|(i, &w)| (w >= 0.5).then_some(i))
            .collect::<Vec<_>>();

        let noise_bound_sq = effective_noise_bound_sq(self.params.noise_bound);
        let translation_inliers = rotation_inliers
            .iter()
            .copied()
            .filter(|&i| {
                let residual = target.column(i) - (outcome.rotation * source.column(i) + outcome.translation);
                residual.norm_squared() <= noise_bound_sq
            })
            .collect::<Vec<_>>();

        let mut translation = outcome.translation;
        if !translation_inliers.is_empty() {
            translation = translation_inliers
                .iter()
                .map(|&i| target.column(i) - outcome.rotation * source.column(i))
                .sum::<Vector3<f64>>()
                / translation_inliers.len() as f64;
        }

        debug!(
            "GNC solver: {} iterations, {} rotation inliers, {} translation inliers",
            outcome.iterations,
            rotation_inliers.len(),
            translation_inliers.len()
        );
        self.solution = RegistrationSolution {
            valid: !translation_inliers.is_empty(),
            rotation: outcome.rotation,
            translation,
            scale: 1.0,
            rotation_inliers,
            translation_inliers,
        };
        Ok(())
    }

    fn solution(&self) -> &RegistrationSolution {
        &self.solution
    }

    fn reconfigure(&mut self, config: &RegistrationConfig) {
        self.params.noise_bound = config.solver_noise_bound_gain * config.voxel_size;
        self.params.rotation_estimation = config.rotation_estimation;
    }
}

fn points_to_matrix(points: &[Point]) -> Matrix3xX<f64> {
    Matrix3xX::from_columns(bytemuck::cast_slice::<Point, Vector3<f64>>(points))
}

fn effective_noise_bound_sq(noise_bound: f64) -> f64 {
    let noise_bound_sq = noise_bound * noise_bound;
    if noise_bound_sq < 1e-16 { 1e-2 } else { noise_bound_sq }
}

struct GncOutcome {
    rotation: Matrix3<f64>,
    translation: Vector3<f64>,
    weights: DVector<f64>,
    iterations: usize,
}

// Follows the GNC-TLS loop of TEASER++ (registration.cc, GNCTLSRotationSolver),
// extended to estimate translation jointly.
fn graduated_non_convexity(
    params: &SolverParams,
    source: &Matrix3xX<f64>,
    target: &Matrix3xX<f64>,
) -> Option<GncOutcome> {
    let noise_bound_sq = effective_noise_bound_sq(params.noise_bound);
    let mut weights = DVector::from_element(source.ncols(), 1.0);
    let mut mu = 1.0;
    let mut prev_cost = f64::INFINITY;
    let mut rotation = Matrix3::identity();
    let mut translation = Vector3::zeros();
    let mut iterations = 0;

    while iterations < params.max_iterations {
        iterations += 1;
        (rotation, translation) =
            weighted_rigid_fit(source, target, &weights, params.rotation_estimation)?;
        let residuals_sq = source
            .column_iter()
            .zip(target.column_iter())
            .map(|(s, t)| (t - (rotation * s + translation)).norm_squared())
            .collect::<Vec<_>>();

        if iterations == 1 {
            let max_residual = residuals_sq.iter().copied().fold(0.0, f64::max);
            mu = 1.0 / (2.0 * max_residual / noise_bound_sq - 1.0);
            // every residual is already within the bound
            if mu <= 0.0 {
                break;
            }
        }

        let th_outlier = (mu + 1.0) / mu * noise_bound_sq;
        let th_inlier = mu / (mu + 1.0) * noise_bound_sq;
        let mut cost = 0.0;
        for (weight, &residual_sq) in weights.iter_mut().zip(residuals_sq.iter()) {
            cost += *weight * residual_sq;
            *weight = if residual_sq >= th_outlier {
                0.0
            } else if residual_sq <= th_inlier {
                1.0
            } else {
                ((noise_bound_sq * mu * (mu + 1.0) / residual_sq).sqrt() - mu).clamp(0.0, 1.0)
            };
        }
        let cost_diff = (cost - prev_cost).abs();
        mu *= params.gnc_factor;
        prev_cost = cost;
        if cost_diff < params.cost_threshold {
            break;
        }
    }

    Some(GncOutcome {
        rotation,
        translation,
        weights,
        iterations,
    })
}

/// Weighted least squares rigid fit. `None` when the weights vanish.
fn weighted_rigid_fit(
    source: &Matrix3xX<f64>,
    target: &Matrix3xX<f64>,
    weights: &DVector<f64>,
    estimation: RotationEstimation,
) -> Option<(Matrix3<f64>, Vector3<f64>)> {
    let weight_sum = weights.sum();
    if weight_sum <= 1e-16 {
        return None;
    }
    let source_centroid: Vector3<f64> = (source * weights) / weight_sum;
    let target_centroid: Vector3<f64> = (target * weights) / weight_sum;
    let pairs = source
        .column_iter()
        .zip(target.column_iter())
        .zip(weights.iter())
        .map(|((s, t), &w)| (s - source_centroid, t - target_centroid, w));

    let rotation = match estimation {
        RotationEstimation::GncTls => {
            let h = pairs.fold(Matrix3::zeros(), |h, (s, t, w)| h + s * t.transpose() * w);
            // adaptation of https://igl.ethz.ch/projects/ARAP/svd_rot.pdf
            let svd = SVD::new(h, true, true);
            let u = svd.u?;
            let mut v = svd.v_t?.transpose();
            if u.determinant() * v.determinant() < 0.0 {
                v.set_column(2, &(-v.column(2).clone_owned()));
            }
            v * u.transpose()
        }
        RotationEstimation::Quatro => {
            let (cos_sum, sin_sum) = pairs.fold((0.0, 0.0), |(c, s_acc), (s, t, w)| {
                (c + w * (s.x * t.x + s.y * t.y), s_acc + w * (s.x * t.y - s.y * t.x))
            });
            Rotation3::from_axis_angle(&Vector3::z_axis(), sin_sum.atan2(cos_sum)).into_inner()
        }
    };
    let translation = target_centroid - rotation * source_centroid;
    Some((rotation, translation))
}

#[cfg(test)]
mod tests {
    use std::f64::consts::FRAC_PI_4;

    use all_asserts::assert_le;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    fn random_points(rng: &mut StdRng, count: usize) -> Vec<Point> {
        (0..count)
            .map(|_| Point::new(rng.random(), rng.random(), rng.random()))
            .collect()
    }

    fn apply(points: &[Point], rotation: &Matrix3<f64>, translation: &Vector3<f64>) -> Vec<Point> {
        points
            .iter()
            .map(|p| Point::from(rotation * p.coords + translation))
            .collect()
    }

    #[test]
    fn test_ok() {
        let mut rng = StdRng::seed_from_u64(42);
        let source_points = random_points(&mut rng, 256);

        let angle = FRAC_PI_4;
        #[rustfmt::skip]
        let rotation = Matrix3::new(
            angle.cos(), -angle.sin(), 0.0,
            angle.sin(), angle.cos(), 0.0,
            0.0, 0.0, 1.0
        );
        let translation = Vector3::new(42.0, 1.0, 99.0);
        let target_points = apply(&source_points, &rotation, &translation);

        let mut solver = RobustRegistrationSolver::new(SolverParams {
            cost_threshold: 1e-6,
            ..Default::default()
        });
        solver.solve(&source_points, &target_points).unwrap();
        let solution = solver.solution();

        assert!(solution.valid);
        assert_le!((solution.rotation - rotation).norm(), 1e-6);
        assert_le!((solution.translation - translation).norm(), 1e-6);
        assert_eq!(solution.rotation_inliers.len(), 256);
        assert_eq!(solution.translation_inliers.len(), 256);
        assert!(solution.as_isometry().is_ok());
    }

    #[test]
    fn test_rejects_outliers() {
        let mut rng = StdRng::seed_from_u64(7);
        let source_points = random_points(&mut rng, 100).iter().map(|p| p * 10.0).collect::<Vec<_>>();
        let rotation = Rotation3::from_euler_angles(0.2, -0.1, 1.0).into_inner();
        let translation = Vector3::new(-3.0, 4.0, 0.5);
        let mut target_points = apply(&source_points, &rotation, &translation);
        for point in target_points.iter_mut().skip(80) {
            *point = Point::new(
                rng.random_range(-30.0..30.0),
                rng.random_range(-30.0..30.0),
                rng.random_range(-30.0..30.0),
            );
        }

        let mut solver = RobustRegistrationSolver::new(SolverParams {
            noise_bound: 0.05,
            cost_threshold: 1e-12,
            ..Default::default()
        });
        solver.solve(&source_points, &target_points).unwrap();
        let solution = solver.solution();

        assert!(solution.valid);
        assert_le!((solution.rotation - rotation).norm(), 1e-3);
        assert_le!((solution.translation - translation).norm(), 1e-3);
        assert!(solution.translation_inliers.iter().all(|&i| i < 80));
        assert_le!(solution.translation_inliers.len(), solution.rotation_inliers.len());
    }

    #[test]
    fn test_quatro_recovers_yaw() {
        let mut rng = StdRng::seed_from_u64(3);
        let source_points = random_points(&mut rng, 64);
        let rotation = Rotation3::from_axis_angle(&Vector3::z_axis(), -0.6).into_inner();
        let translation = Vector3::new(1.0, 2.0, -0.5);
        let target_points = apply(&source_points, &rotation, &translation);

        let mut solver = RobustRegistrationSolver::new(SolverParams {
            rotation_estimation: RotationEstimation::Quatro,
            ..Default::default()
        });
        solver.solve(&source_points, &target_points).unwrap();
        let solution = solver.solution();
        assert!(solution.valid);
        assert_le!((solution.rotation - rotation).norm(), 1e-9);
        assert_le!((solution.translation - translation).norm(), 1e-9);
    }

    #[test]
    fn test_degenerate_inputs() {
        let mut solver = RobustRegistrationSolver::default();
        let point = [Point::new(1.0, 2.0, 3.0)];
        solver.solve(&point, &point).unwrap();
        assert_eq!(solver.solution(), &RegistrationSolution::default());
        assert!(solver.solution().as_isometry().is_err());

        let error = solver.solve(&point, &[]).unwrap_err();
        assert!(matches!(
            error,
            SolverError::LengthMismatch {
                source_len: 1,
                target_len: 0
            }
        ));
    }
}
