use rstar::RTree;
use rstar::primitives::GeomWithData;

use crate::prelude::*;

type IndexedPoint = GeomWithData<[f64; 3], usize>;

/// R-tree over the positions of one cloud, for radius neighborhoods.
pub struct PointQuery {
    tree: RTree<IndexedPoint>,
}

impl PointQuery {
    pub fn new(points: &[Point]) -> Self {
        let tree = RTree::bulk_load(
            points
                .iter()
                .enumerate()
                .map(|(id, p)| GeomWithData::new([p.x, p.y, p.z], id))
                .collect(),
        );
        Self { tree }
    }

    /// Indices and positions of every point within `radius` of `center`,
    /// the center itself included when it belongs to the cloud.
    pub fn within_radius(
        &self,
        center: &Point,
        radius: f64,
    ) -> impl Iterator<Item = (usize, Point)> + '_ {
        self.tree
            .locate_within_distance([center.x, center.y, center.z], radius * radius)
            .map(|n| (n.data, Point::from(*n.geom())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_within_radius() {
        let points = (0..10)
            .map(|i| Point::new(i as f64, 0.0, 0.0))
            .collect::<Vec<_>>();
        let query = PointQuery::new(&points);
        let mut found = query
            .within_radius(&Point::new(4.0, 0.0, 0.0), 1.5)
            .map(|(i, _)| i)
            .collect::<Vec<_>>();
        found.sort_unstable();
        assert_eq!(found, vec![3, 4, 5]);
    }
}
