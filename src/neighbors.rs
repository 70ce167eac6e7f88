use crate::error::{FillError, FillResult};
use crate::types::UnitCollection;
use rayon::prelude::*;
use rstar::primitives::GeomWithData;
use rstar::RTree;
use std::collections::HashMap;
use tracing::debug;

type CentroidEntry = GeomWithData<[f64; 2], usize>;

/// K nearest units per unit, by Euclidean distance between centroids.
///
/// Each list starts with the unit itself. Equidistant candidates keep the
/// order in which they appear in the source collection.
#[derive(Debug, Clone)]
pub struct NeighborIndex {
    k: usize,
    ids: Vec<String>,
    neighbors: Vec<Vec<String>>,
    positions: HashMap<String, usize>,
}

impl NeighborIndex {
    pub fn build(collection: &UnitCollection, k: usize) -> FillResult<Self> {
        if k == 0 {
            return Err(FillError::InvalidParameter(
                "neighbor count must be at least 1".to_string(),
            ));
        }
        if k > collection.len() {
            return Err(FillError::InvalidParameter(format!(
                "neighbor count {} exceeds the {} available units",
                k,
                collection.len()
            )));
        }

        let centroids = collection
            .iter()
            .map(|unit| match unit.centroid() {
                Some(p) if p.x().is_finite() && p.y().is_finite() => Ok([p.x(), p.y()]),
                _ => Err(FillError::InvalidData(format!(
                    "unit '{}' has no usable centroid",
                    unit.id
                ))),
            })
            .collect::<FillResult<Vec<[f64; 2]>>>()?;

        debug!("Building centroid tree for {} units", centroids.len());
        let tree = RTree::bulk_load(
            centroids
                .iter()
                .enumerate()
                .map(|(i, c)| CentroidEntry::new(*c, i))
                .collect(),
        );

        let nearest: Vec<Vec<usize>> = centroids
            .par_iter()
            .enumerate()
            .map(|(i, c)| nearest_positions(&tree, i, c, k))
            .collect();

        let ids: Vec<String> = collection.iter().map(|u| u.id.clone()).collect();
        let neighbors = nearest
            .into_iter()
            .map(|list| list.into_iter().map(|j| ids[j].clone()).collect())
            .collect();
        let positions = ids.iter().enumerate().map(|(i, id)| (id.clone(), i)).collect();

        Ok(Self {
            k,
            ids,
            neighbors,
            positions,
        })
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn neighbors_of(&self, id: &str) -> Option<&[String]> {
        self.positions.get(id).map(|&i| self.neighbors[i].as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.ids
            .iter()
            .zip(&self.neighbors)
            .map(|(id, list)| (id.as_str(), list.as_slice()))
    }
}

fn nearest_positions(tree: &RTree<CentroidEntry>, own: usize, at: &[f64; 2], k: usize) -> Vec<usize> {
    let wanted = k - 1;
    let mut found: Vec<(f64, usize)> = Vec::with_capacity(k);
    if wanted > 0 {
        // The tree orders ties arbitrarily, so keep pulling past the last
        // wanted distance until it is strictly exceeded.
        for (entry, d2) in tree.nearest_neighbor_iter_with_distance_2(at) {
            if found.len() >= wanted && d2 > found[wanted - 1].0 {
                break;
            }
            if entry.data != own {
                found.push((d2, entry.data));
            }
        }
        found.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    }

    let mut out = Vec::with_capacity(k);
    out.push(own);
    out.extend(found.into_iter().take(wanted).map(|(_, j)| j));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::tests::square;
    use crate::types::SpatialUnit;

    /// Five unit squares whose centroids sit at (0,0) (1,0) (0,1) (1,1) (3,0).
    fn grid() -> UnitCollection {
        let origins = [
            ("a", -0.5, -0.5),
            ("b", 0.5, -0.5),
            ("c", -0.5, 0.5),
            ("d", 0.5, 0.5),
            ("e", 2.5, -0.5),
        ];
        UnitCollection::new(
            origins
                .iter()
                .map(|(id, x, y)| SpatialUnit::new(*id, square(*x, *y)))
                .collect(),
        )
        .unwrap()
    }

    fn ids(list: &[String]) -> Vec<&str> {
        list.iter().map(String::as_str).collect()
    }

    #[test]
    fn five_point_grid_k3() {
        let index = NeighborIndex::build(&grid(), 3).unwrap();
        assert_eq!(index.k(), 3);
        assert_eq!(ids(index.neighbors_of("a").unwrap()), ["a", "b", "c"]);
        assert_eq!(ids(index.neighbors_of("b").unwrap()), ["b", "a", "d"]);
        assert_eq!(ids(index.neighbors_of("c").unwrap()), ["c", "a", "d"]);
        assert_eq!(ids(index.neighbors_of("d").unwrap()), ["d", "b", "c"]);
        assert_eq!(ids(index.neighbors_of("e").unwrap()), ["e", "b", "d"]);
    }

    #[test]
    fn k_equal_to_len_lists_everything() {
        let index = NeighborIndex::build(&grid(), 5).unwrap();
        for (id, list) in index.iter() {
            assert_eq!(list.len(), 5);
            assert_eq!(list[0], id);
        }
        assert_eq!(ids(index.neighbors_of("e").unwrap()), ["e", "b", "d", "a", "c"]);
    }

    #[test]
    fn k_of_one_is_self() {
        let index = NeighborIndex::build(&grid(), 1).unwrap();
        assert_eq!(ids(index.neighbors_of("c").unwrap()), ["c"]);
    }

    #[test]
    fn k_too_large_or_zero() {
        assert!(matches!(
            NeighborIndex::build(&grid(), 6),
            Err(FillError::InvalidParameter(_))
        ));
        assert!(matches!(
            NeighborIndex::build(&grid(), 0),
            Err(FillError::InvalidParameter(_))
        ));
    }

    #[test]
    fn coincident_centroids_keep_self_first() {
        let units = UnitCollection::new(vec![
            SpatialUnit::new("x", square(0.0, 0.0)),
            SpatialUnit::new("y", square(0.0, 0.0)),
            SpatialUnit::new("z", square(5.0, 0.0)),
        ])
        .unwrap();
        let index = NeighborIndex::build(&units, 2).unwrap();
        assert_eq!(ids(index.neighbors_of("y").unwrap()), ["y", "x"]);
        assert_eq!(ids(index.neighbors_of("x").unwrap()), ["x", "y"]);
    }

    #[test]
    fn empty_geometry_is_invalid() {
        let units = UnitCollection::new(vec![
            SpatialUnit::new("x", square(0.0, 0.0)),
            SpatialUnit::new("void", geo::MultiPolygon::new(vec![])),
        ])
        .unwrap();
        assert!(matches!(
            NeighborIndex::build(&units, 1),
            Err(FillError::InvalidData(_))
        ));
    }

    #[test]
    fn unknown_id() {
        let index = NeighborIndex::build(&grid(), 2).unwrap();
        assert!(index.neighbors_of("zz").is_none());
        assert_eq!(index.len(), 5);
    }
}
