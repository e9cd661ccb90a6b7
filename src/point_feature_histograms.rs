use std::f64::consts::PI;
use std::time::Instant;

use log::debug;
use nalgebra::Vector3;
use rayon::prelude::*;

use crate::RegistrationConfig;
use crate::normal_estimation::estimate_normals;
use crate::prelude::*;
use crate::query::PointQuery;

/// Turns a cloud into keypoints and one descriptor per keypoint.
///
/// Implementations may drop points they cannot describe, so
/// `keypoints.len() <= cloud.len()`, but must return exactly one descriptor
/// per keypoint.
pub trait FeatureExtractor {
    fn extract(&self, cloud: &[Point]) -> (Vec<Point>, Vec<Descriptor>);

    /// Picks up radii and thresholds from a new registration configuration.
    fn reconfigure(&mut self, _config: &RegistrationConfig) {}
}

/// Fast point feature histograms over radius neighborhoods.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FasterPfh {
    pub normal_radius: f64,
    pub fpfh_radius: f64,
    pub max_linearity: f64,
}

impl FasterPfh {
    pub fn from_config(config: &RegistrationConfig) -> Self {
        Self {
            normal_radius: config.normal_radius_gain * config.voxel_size,
            fpfh_radius: config.fpfh_radius_gain * config.voxel_size,
            max_linearity: config.max_linearity,
        }
    }
}

impl FeatureExtractor for FasterPfh {
    fn extract(&self, cloud: &[Point]) -> (Vec<Point>, Vec<Descriptor>) {
        if cloud.is_empty() {
            return (Vec::new(), Vec::new());
        }
        let start = Instant::now();
        let query = PointQuery::new(cloud);
        let normals = estimate_normals(cloud, &query, self.normal_radius, self.max_linearity);
        let (descriptors, kept) = fast_point_feature_histograms(cloud, &query, &normals, self.fpfh_radius);
        let keypoints = kept.iter().map(|&i| cloud[i]).collect::<Vec<_>>();
        debug!(
            "FPFH: {} of {} points described in {:?}",
            keypoints.len(),
            cloud.len(),
            start.elapsed()
        );
        (keypoints, descriptors)
    }

    fn reconfigure(&mut self, config: &RegistrationConfig) {
        *self = Self::from_config(config);
    }
}

/// Darboux frame angles (alpha, phi, theta) between two oriented points, or
/// `None` when the frame is degenerate.
fn pair_features(
    point_a: Point,
    point_b: Point,
    mut normal_a: Vector3<f64>,
    mut normal_b: Vector3<f64>,
) -> Option<[f64; 3]> {
    let mut direction = (point_b - point_a).try_normalize(f64::EPSILON)?;

    let cos_a = normal_a.dot(&direction);
    let cos_b = normal_b.dot(&direction);
    // source of the frame is the point whose normal is closer to the line
    let phi = if cos_a.abs().acos() > cos_b.abs().acos() {
        std::mem::swap(&mut normal_a, &mut normal_b);
        direction.neg_mut();
        -cos_b
    } else {
        cos_a
    };

    let v = direction.cross(&normal_a).try_normalize(f64::EPSILON)?;
    let w = normal_a.cross(&v);
    let alpha = v.dot(&normal_b);
    let theta = w.dot(&normal_b).atan2(normal_a.dot(&normal_b));
    Some([theta, alpha, phi])
}

fn accumulate(features: &[f64; 3], histogram: &mut Descriptor) {
    const LOWER: [f64; 3] = [-PI, -1.0, -1.0];
    const UPPER: [f64; 3] = [PI, 1.0, 1.0];

    for (slot, feature) in features.iter().enumerate() {
        let ratio = (feature - LOWER[slot]) / (UPPER[slot] - LOWER[slot]);
        let bin = ((ratio * HISTOGRAM_NUM_BINS as f64).max(0.0).floor() as usize)
            .min(HISTOGRAM_NUM_BINS - 1);
        histogram[slot * HISTOGRAM_NUM_BINS + bin] += 1.0;
    }
}

/// First pass: histogram of pair features between each point and its direct
/// neighbors, scaled to sum to 100 per feature.
fn simplified_histograms(
    points: &[Point],
    query: &PointQuery,
    normals: &[Option<Vector3<f64>>],
    radius: f64,
) -> Vec<Option<Descriptor>> {
    points
        .par_iter()
        .enumerate()
        .map(|(index, point)| {
            let normal = normals[index]?;
            let mut histogram = [0.0; DESCRIPTOR_DIM];
            let mut num_pairs = 0usize;
            for (neighbor_index, neighbor) in query.within_radius(point, radius) {
                if neighbor_index == index {
                    continue;
                }
                let Some(neighbor_normal) = normals[neighbor_index] else {
                    continue;
                };
                if let Some(features) = pair_features(*point, neighbor, normal, neighbor_normal) {
                    accumulate(&features, &mut histogram);
                    num_pairs += 1;
                }
            }
            if num_pairs == 0 {
                return None;
            }
            let scale = 100.0 / num_pairs as f64;
            histogram.iter_mut().for_each(|v| *v *= scale);
            Some(histogram)
        })
        .collect()
}

/// Returns the descriptors and, for each, the index of the point it describes.
pub fn fast_point_feature_histograms(
    points: &[Point],
    query: &PointQuery,
    normals: &[Option<Vector3<f64>>],
    radius: f64,
) -> (Vec<Descriptor>, Vec<usize>) {
    let simplified = simplified_histograms(points, query, normals, radius);
    let (described, descriptors): (Vec<usize>, Vec<Descriptor>) = simplified
        .par_iter()
        .enumerate()
        .filter_map(|(index, histogram)| histogram.map(|histogram| (index, histogram)))
        .map(|(index, mut descriptor)| {
            let point = points[index];
            for (neighbor_index, neighbor) in query.within_radius(&point, radius) {
                if neighbor_index == index {
                    continue;
                }
                let Some(neighbor_histogram) = simplified[neighbor_index] else {
                    continue;
                };
                let weight = 1.0 / nalgebra::distance_squared(&point, &neighbor);
                if !weight.is_finite() {
                    continue;
                }
                for (value, neighbor_value) in descriptor.iter_mut().zip(neighbor_histogram.iter()) {
                    *value += neighbor_value * weight;
                }
            }
            for block in descriptor.chunks_mut(HISTOGRAM_NUM_BINS) {
                let sum = block.iter().sum::<f64>();
                let scale = if sum.abs() < 1e-6 { 0.0 } else { 100.0 / sum };
                block.iter_mut().for_each(|v| *v *= scale);
            }
            (index, descriptor)
        })
        .unzip();

    (descriptors, described)
}

#[cfg(test)]
mod tests {
    use all_asserts::{assert_gt, assert_le, assert_lt};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    fn sphere(count: usize, seed: u64) -> Vec<Point> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..count)
            .map(|_| {
                let direction = Vector3::new(
                    rng.random_range(-1.0..1.0),
                    rng.random_range(-1.0..1.0),
                    rng.random_range(-1.0..1.0),
                )
                .normalize();
                Point::from(direction * 2.0 + Vector3::new(5.0, 0.0, 0.0))
            })
            .collect()
    }

    #[test]
    fn test_pair_features_in_range() {
        let features = pair_features(
            Point::new(0.0, 0.0, 0.0),
            Point::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(0.0, 0.6, 0.8),
        )
        .unwrap();
        assert_le!(features[0].abs(), PI);
        assert_le!(features[1].abs(), 1.0);
        assert_le!(features[2].abs(), 1.0);
        assert!(
            pair_features(
                Point::origin(),
                Point::origin(),
                Vector3::z(),
                Vector3::z()
            )
            .is_none()
        );
    }

    #[test]
    fn test_extract_keeps_counts_aligned() {
        let cloud = sphere(1500, 4);
        let extractor = FasterPfh {
            normal_radius: 0.5,
            fpfh_radius: 0.8,
            max_linearity: 0.99,
        };
        let (keypoints, descriptors) = extractor.extract(&cloud);
        assert_eq!(keypoints.len(), descriptors.len());
        assert_le!(keypoints.len(), cloud.len());
        assert_gt!(keypoints.len(), 0);
        for descriptor in &descriptors {
            for block in descriptor.chunks(HISTOGRAM_NUM_BINS) {
                let sum = block.iter().sum::<f64>();
                assert!((sum - 100.0).abs() < 1e-6 || sum == 0.0);
            }
        }
    }

    #[test]
    fn test_descriptors_paired_with_described_points() {
        let cloud = sphere(800, 8);
        let query = PointQuery::new(&cloud);
        let mut normals = estimate_normals(&cloud, &query, 0.5, 0.99);
        for normal in normals.iter_mut().step_by(3) {
            *normal = None;
        }

        let (descriptors, kept) = fast_point_feature_histograms(&cloud, &query, &normals, 0.8);
        assert_eq!(descriptors.len(), kept.len());
        assert_gt!(kept.len(), 0);
        for pair in kept.windows(2) {
            assert_lt!(pair[0], pair[1]);
        }
        for &index in &kept {
            assert!(normals[index].is_some());
        }
    }

    #[test]
    fn test_isolated_points_dropped() {
        let cloud = vec![
            Point::new(0.0, 0.0, 0.0),
            Point::new(100.0, 0.0, 0.0),
            Point::new(0.0, 100.0, 0.0),
        ];
        let extractor = FasterPfh {
            normal_radius: 1.0,
            fpfh_radius: 1.0,
            max_linearity: 1.0,
        };
        let (keypoints, descriptors) = extractor.extract(&cloud);
        assert!(keypoints.is_empty());
        assert!(descriptors.is_empty());
        assert_eq!(extractor.extract(&[]).0.len(), 0);
    }
}
