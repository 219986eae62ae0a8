//! Clipping rasters to vector boundaries
//!
//! Clipping only changes pixel validity: the grid, transform and bounds of the
//! tile stay as they are. Clip once at the end of a pipeline rather than
//! before every step.

use crate::types::{Mask, Tile, NO_DATA};
use geo::{coord, BoundingRect, Intersects, MultiPolygon, Rect};
use ndarray::Zip;

/// Restricts tiles to the pixels whose centers fall inside a geometry
#[derive(Debug, Clone)]
pub struct GeometryClipper {
    geometry: MultiPolygon<f64>,
    extent: Option<Rect<f64>>,
}

impl GeometryClipper {
    pub fn new(geometry: impl Into<MultiPolygon<f64>>) -> Self {
        let geometry = geometry.into();
        let extent = geometry.bounding_rect();
        Self { geometry, extent }
    }

    pub fn geometry(&self) -> &MultiPolygon<f64> {
        &self.geometry
    }

    /// Pixel-center containment mask for `tile`. Centers on the boundary count
    /// as inside.
    pub fn inside_mask(&self, tile: &Tile) -> Mask {
        let mut mask = Mask::from_elem(tile.shape(), false);
        let Some(extent) = self.extent else {
            return mask;
        };
        let transform = *tile.geo_transform();

        let test = |(row, col): (usize, usize), inside: &mut bool| {
            let (x, y) = transform.pixel_center(row, col);
            if x < extent.min().x || x > extent.max().x || y < extent.min().y || y > extent.max().y {
                return;
            }
            let center = coord! { x: x, y: y };
            *inside = self.geometry.0.iter().any(|polygon| polygon.intersects(&center));
        };

        #[cfg(feature = "parallel")]
        Zip::indexed(&mut mask).par_for_each(test);
        #[cfg(not(feature = "parallel"))]
        Zip::indexed(&mut mask).for_each(test);

        mask
    }

    /// Set every pixel outside the geometry to no-data, in all bands
    pub fn clip(&self, tile: &Tile) -> Tile {
        let mask = self.inside_mask(tile);
        let inside = mask.iter().filter(|&&m| m).count();
        log::debug!(
            "Clipping tile {}: {}/{} pixel centers inside boundary",
            tile.label(),
            inside,
            mask.len()
        );

        tile.map_bands(|grid| {
            Zip::from(grid)
                .and(&mask)
                .map_collect(|&value, &keep| if keep { value } else { NO_DATA })
        })
    }
}

/// Clip `tile` to `geometry`
pub fn clip(tile: &Tile, geometry: &MultiPolygon<f64>) -> Tile {
    GeometryClipper::new(geometry.clone()).clip(tile)
}

impl Tile {
    /// Fluent form of [`clip`]
    pub fn clip(&self, geometry: &MultiPolygon<f64>) -> Tile {
        clip(self, geometry)
    }
}
