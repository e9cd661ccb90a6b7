use std::time::Instant;

use ahash::{HashMap, HashMapExt};
use log::debug;
use nalgebra::Vector3;
use rayon::prelude::*;

use crate::prelude::Point;

/// Grid downsampling: every occupied voxel collapses to one representative.
pub trait VoxelSampler {
    fn sample(&self, cloud: &[Point], voxel_size: f64) -> Vec<Point>;
}

/// Replaces the points of each occupied voxel with their centroid. Output is
/// ordered by voxel key, so identical inputs give identical outputs.
#[derive(Debug, Clone, Copy, Default)]
pub struct VoxelGridSampler;

const COORD_BITS: u32 = 21;
const COORD_OFFSET: i64 = 1 << (COORD_BITS - 1);
const COORD_MASK: u64 = (1 << COORD_BITS) - 1;

/// Packs the voxel coordinates of a scaled point into one key, 21 bits per
/// axis. Coordinates beyond +-2^20 voxels wrap.
fn voxel_key(scaled: Vector3<f64>) -> u64 {
    let cell = scaled.map(|x| ((x.floor() as i64 + COORD_OFFSET) as u64) & COORD_MASK);
    cell.x | (cell.y << COORD_BITS) | (cell.z << (2 * COORD_BITS))
}

type VoxelSums = HashMap<u64, (Vector3<f64>, usize)>;

impl VoxelSampler for VoxelGridSampler {
    fn sample(&self, cloud: &[Point], voxel_size: f64) -> Vec<Point> {
        let start = Instant::now();
        let inv_voxel_size = 1.0 / voxel_size;
        let sums = cloud
            .par_iter()
            .fold(VoxelSums::new, |mut sums, point| {
                let entry = sums
                    .entry(voxel_key(point.coords * inv_voxel_size))
                    .or_insert((Vector3::zeros(), 0));
                entry.0 += point.coords;
                entry.1 += 1;
                sums
            })
            .reduce(VoxelSums::new, |mut merged, partial| {
                for (key, (sum, count)) in partial {
                    let entry = merged.entry(key).or_insert((Vector3::zeros(), 0));
                    entry.0 += sum;
                    entry.1 += count;
                }
                merged
            });

        let mut voxels = sums.into_iter().collect::<Vec<_>>();
        voxels.par_sort_unstable_by_key(|(key, _)| *key);
        let sampled = voxels
            .into_iter()
            .map(|(_, (sum, count))| Point::from(sum / count as f64))
            .collect::<Vec<_>>();
        debug!(
            "Downsampled {} points to {} with voxel size {} in {:?}",
            cloud.len(),
            sampled.len(),
            voxel_size,
            start.elapsed()
        );
        sampled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_points_in_one_voxel_collapse() {
        let cloud = vec![
            Point::new(0.1, 0.1, 0.1),
            Point::new(0.3, 0.3, 0.3),
            Point::new(1.5, 0.2, 0.2),
        ];
        let sampled = VoxelGridSampler.sample(&cloud, 1.0);
        assert_eq!(sampled.len(), 2);
        for expected in [Point::new(0.2, 0.2, 0.2), Point::new(1.5, 0.2, 0.2)] {
            assert!(sampled.iter().any(|p| (p - expected).norm() < 1e-12));
        }
    }

    #[test]
    fn test_negative_coordinates_keep_separate_voxels() {
        let cloud = vec![Point::new(-0.5, 0.0, 0.0), Point::new(0.5, 0.0, 0.0)];
        assert_eq!(VoxelGridSampler.sample(&cloud, 1.0).len(), 2);
    }

    #[test]
    fn test_empty_cloud() {
        assert!(VoxelGridSampler.sample(&[], 0.5).is_empty());
    }

    #[test]
    fn test_deterministic_order() {
        let cloud = (0..500)
            .map(|i| Point::new((i % 17) as f64 * 0.37, (i % 5) as f64, (i / 50) as f64 * 0.9))
            .collect::<Vec<_>>();
        assert_eq!(
            VoxelGridSampler.sample(&cloud, 0.5),
            VoxelGridSampler.sample(&cloud, 0.5)
        );
    }
}
