use nalgebra::{Matrix3, SymmetricEigen, Vector3};
use rayon::prelude::*;

use crate::prelude::*;
use crate::query::PointQuery;

const MIN_NEIGHBORS: usize = 3;

/// PCA normal of every point over its radius neighborhood, oriented towards
/// the sensor origin. `None` for sparse neighborhoods and for neighborhoods
/// whose linearity `(l1 - l2) / l1` exceeds `max_linearity`, where no stable
/// normal exists.
pub fn estimate_normals(
    points: &[Point],
    query: &PointQuery,
    radius: f64,
    max_linearity: f64,
) -> Vec<Option<Vector3<f64>>> {
    points
        .par_iter()
        .map_with(Vec::<Point>::new(), |neighbors, point| {
            neighbors.clear();
            neighbors.extend(query.within_radius(point, radius).map(|(_, p)| p));
            if neighbors.len() < MIN_NEIGHBORS {
                return None;
            }
            let centroid = Point::from(
                neighbors.iter().map(|p| p.coords).sum::<Vector3<f64>>() / neighbors.len() as f64,
            );
            let covariance = neighbors
                .iter()
                .map(|p| {
                    let deviation = p - centroid;
                    deviation * deviation.transpose()
                })
                .sum::<Matrix3<f64>>()
                / (neighbors.len() - 1) as f64;

            let eigen = SymmetricEigen::new(covariance);
            let mut order = [0usize, 1, 2];
            order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));
            let [largest, middle, _] = order.map(|i| eigen.eigenvalues[i]);
            if largest <= 0.0 || (largest - middle) / largest > max_linearity {
                return None;
            }
            let normal: Vector3<f64> = eigen.eigenvectors.column(order[2]).into_owned();
            Some(if centroid.coords.dot(&normal) > 0.0 {
                -normal
            } else {
                normal
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use all_asserts::assert_gt;

    use super::*;

    fn grid_plane(z: f64) -> Vec<Point> {
        (0..15)
            .flat_map(|x| (0..15).map(move |y| Point::new(x as f64 * 0.1, y as f64 * 0.1, z)))
            .collect()
    }

    #[test]
    fn test_plane_normals_face_origin() {
        let points = grid_plane(2.0);
        let query = PointQuery::new(&points);
        let normals = estimate_normals(&points, &query, 0.25, 1.0);
        for normal in normals.iter().flatten() {
            assert_gt!(normal.z.abs(), 0.999);
            assert!(normal.z < 0.0);
        }
        assert!(normals.iter().all(Option::is_some));
    }

    #[test]
    fn test_line_rejected_by_linearity() {
        let points = (0..20)
            .map(|i| Point::new(i as f64 * 0.1, 0.0, 0.0))
            .collect::<Vec<_>>();
        let query = PointQuery::new(&points);
        let normals = estimate_normals(&points, &query, 0.35, 0.9);
        assert!(normals.iter().all(Option::is_none));
    }
}
