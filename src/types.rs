use chrono::{DateTime, Utc};
use geo::{coord, LineString, MultiPolygon, Polygon};
use indexmap::IndexMap;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Pixel value stored in every band
pub type Pixel = f32;

/// 2D band grid (rows x cols)
pub type BandGrid = Array2<Pixel>;

/// Per-pixel validity grid, `true` = keep
pub type Mask = Array2<bool>;

/// No-data sentinel. NaN never compares equal to a measured value, so a masked
/// pixel cannot be confused with a valid zero.
pub const NO_DATA: Pixel = f32::NAN;

/// Metadata key carrying a tile's identifier
pub const INDEX_KEY: &str = "system:index";

/// Returns true when `value` is the no-data sentinel
#[inline]
pub fn is_no_data(value: Pixel) -> bool {
    value.is_nan()
}

/// Scalar metadata value attached to tiles and features
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl MetadataValue {
    /// Numeric view of the value, if it has one
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetadataValue::Integer(i) => Some(*i as f64),
            MetadataValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl std::fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetadataValue::Bool(b) => write!(f, "{}", b),
            MetadataValue::Integer(i) => write!(f, "{}", i),
            MetadataValue::Float(v) => write!(f, "{}", v),
            MetadataValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::Text(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        MetadataValue::Integer(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        MetadataValue::Float(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        MetadataValue::Bool(value)
    }
}

/// Key-value metadata record
pub type Metadata = BTreeMap<String, MetadataValue>;

/// Affine pixel-to-world transform (GDAL ordering)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform with square pixels of `pixel_size` world units
    pub fn north_up(top_left_x: f64, top_left_y: f64, pixel_size: f64) -> Self {
        Self {
            top_left_x,
            pixel_width: pixel_size,
            rotation_x: 0.0,
            top_left_y,
            rotation_y: 0.0,
            pixel_height: -pixel_size,
        }
    }

    /// World coordinate of a fractional pixel position
    pub fn apply(&self, row: f64, col: f64) -> (f64, f64) {
        let x = self.top_left_x + col * self.pixel_width + row * self.rotation_x;
        let y = self.top_left_y + col * self.rotation_y + row * self.pixel_height;
        (x, y)
    }

    /// World coordinate of the center of pixel (row, col)
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        self.apply(row as f64 + 0.5, col as f64 + 0.5)
    }

    /// Outline of a `rows` x `cols` grid as a closed polygon
    pub fn footprint(&self, rows: usize, cols: usize) -> Polygon<f64> {
        let (rows, cols) = (rows as f64, cols as f64);
        let corners = [(0.0, 0.0), (0.0, cols), (rows, cols), (rows, 0.0), (0.0, 0.0)];
        let ring: Vec<_> = corners
            .iter()
            .map(|&(r, c)| {
                let (x, y) = self.apply(r, c);
                coord! { x: x, y: y }
            })
            .collect();
        Polygon::new(LineString::from(ring), vec![])
    }
}

/// One multi-band raster image with a footprint, an acquisition time and metadata.
///
/// Tiles are values: every operation in this crate returns a new tile and
/// leaves its inputs untouched. All bands share one grid shape.
#[derive(Debug, Clone)]
pub struct Tile {
    bands: IndexMap<String, BandGrid>,
    geo_transform: GeoTransform,
    bounds: Polygon<f64>,
    timestamp: Option<DateTime<Utc>>,
    metadata: Metadata,
}

impl Tile {
    /// Build a tile from named bands. Bounds default to the grid extent.
    pub fn new<S: Into<String>>(
        geo_transform: GeoTransform,
        bands: Vec<(S, BandGrid)>,
    ) -> CompositeResult<Self> {
        let bands: IndexMap<String, BandGrid> =
            bands.into_iter().map(|(name, grid)| (name.into(), grid)).collect();
        Self::from_parts(bands, geo_transform, None, None, Metadata::new())
    }

    /// Assemble a tile from all of its parts, checking the shared-shape invariant
    pub fn from_parts(
        bands: IndexMap<String, BandGrid>,
        geo_transform: GeoTransform,
        bounds: Option<Polygon<f64>>,
        timestamp: Option<DateTime<Utc>>,
        metadata: Metadata,
    ) -> CompositeResult<Self> {
        let shape = match bands.values().next() {
            Some(first) => first.dim(),
            None => {
                return Err(CompositeError::InvalidFormat(
                    "a tile needs at least one band".to_string(),
                ))
            }
        };
        if let Some((name, grid)) = bands.iter().find(|(_, g)| g.dim() != shape) {
            return Err(CompositeError::ShapeMismatch(format!(
                "band '{}' is {:?}, expected {:?}",
                name,
                grid.dim(),
                shape
            )));
        }

        let bounds = bounds.unwrap_or_else(|| geo_transform.footprint(shape.0, shape.1));
        Ok(Self {
            bands,
            geo_transform,
            bounds,
            timestamp,
            metadata,
        })
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_bounds(mut self, bounds: Polygon<f64>) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn with_property(mut self, key: &str, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Shorthand for setting `system:index`
    pub fn with_index(self, index: &str) -> Self {
        self.with_property(INDEX_KEY, index)
    }

    /// Grid shape shared by all bands (rows, cols)
    pub fn shape(&self) -> (usize, usize) {
        self.bands
            .values()
            .next()
            .map(|grid| grid.dim())
            .unwrap_or((0, 0))
    }

    pub fn geo_transform(&self) -> &GeoTransform {
        &self.geo_transform
    }

    pub fn bounds(&self) -> &Polygon<f64> {
        &self.bounds
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn property(&self, key: &str) -> Option<&MetadataValue> {
        self.metadata.get(key)
    }

    /// The `system:index` value, if the tile carries one
    pub fn index(&self) -> Option<String> {
        self.property(INDEX_KEY).map(|v| v.to_string())
    }

    /// Identifier used in error messages
    pub fn label(&self) -> String {
        self.index().unwrap_or_else(|| "<unindexed>".to_string())
    }

    pub fn band_names(&self) -> Vec<&str> {
        self.bands.keys().map(|k| k.as_str()).collect()
    }

    pub fn has_band(&self, name: &str) -> bool {
        self.bands.contains_key(name)
    }

    pub fn bands(&self) -> impl Iterator<Item = (&str, &BandGrid)> {
        self.bands.iter().map(|(name, grid)| (name.as_str(), grid))
    }

    pub fn band_count(&self) -> usize {
        self.bands.len()
    }

    /// Look up a band, signalling `BandNotFound` when it is absent
    pub fn band(&self, name: &str) -> CompositeResult<&BandGrid> {
        self.bands
            .get(name)
            .ok_or_else(|| CompositeError::BandNotFound {
                band: name.to_string(),
                tile: self.label(),
            })
    }

    /// Number of pixels in `band` that are not no-data
    pub fn valid_pixel_count(&self, band: &str) -> CompositeResult<usize> {
        Ok(self.band(band)?.iter().filter(|v| !is_no_data(**v)).count())
    }

    /// New tile holding only `names`, in the requested order
    pub fn select(&self, names: &[&str]) -> CompositeResult<Tile> {
        let mut bands = IndexMap::with_capacity(names.len());
        for name in names {
            bands.insert(name.to_string(), self.band(name)?.clone());
        }
        self.replace_bands(bands)
    }

    pub fn rename(&self, from: &str, to: &str) -> CompositeResult<Tile> {
        self.band(from)?;
        let bands = self
            .bands
            .iter()
            .filter(|(name, _)| name.as_str() == from || name.as_str() != to)
            .map(|(name, grid)| {
                let name = if name == from { to.to_string() } else { name.clone() };
                (name, grid.clone())
            })
            .collect();
        self.replace_bands(bands)
    }

    /// New tile with `grid` stored as `name`. An existing band of that name is
    /// replaced in place, otherwise the band is appended.
    pub fn with_band(&self, name: &str, grid: BandGrid) -> CompositeResult<Tile> {
        if grid.dim() != self.shape() {
            return Err(CompositeError::ShapeMismatch(format!(
                "band '{}' is {:?}, tile {} is {:?}",
                name,
                grid.dim(),
                self.label(),
                self.shape()
            )));
        }
        let mut bands = self.bands.clone();
        bands.insert(name.to_string(), grid);
        self.replace_bands(bands)
    }

    /// Append every band of `other` to this tile
    pub fn add_bands(&self, other: &Tile) -> CompositeResult<Tile> {
        let mut bands = self.bands.clone();
        for (name, grid) in other.bands() {
            if grid.dim() != self.shape() {
                return Err(CompositeError::ShapeMismatch(format!(
                    "cannot add {:?} band '{}' to {:?} tile {}",
                    grid.dim(),
                    name,
                    self.shape(),
                    self.label()
                )));
            }
            bands.insert(name.to_string(), grid.clone());
        }
        self.replace_bands(bands)
    }

    /// Same tile with every band passed through `f`. `f` must keep the shape.
    pub(crate) fn map_bands<F>(&self, f: F) -> Tile
    where
        F: Fn(&BandGrid) -> BandGrid,
    {
        Tile {
            bands: self
                .bands
                .iter()
                .map(|(name, grid)| (name.clone(), f(grid)))
                .collect(),
            ..self.clone_header()
        }
    }

    /// Same geometry, time and metadata with a new band set
    pub(crate) fn replace_bands(&self, bands: IndexMap<String, BandGrid>) -> CompositeResult<Tile> {
        Tile::from_parts(
            bands,
            self.geo_transform,
            Some(self.bounds.clone()),
            self.timestamp,
            self.metadata.clone(),
        )
    }

    pub(crate) fn with_metadata_replaced(mut self, metadata: Metadata) -> Tile {
        self.metadata = metadata;
        self
    }

    pub(crate) fn without_timestamp(mut self) -> Tile {
        self.timestamp = None;
        self
    }

    fn clone_header(&self) -> Tile {
        Tile {
            bands: IndexMap::new(),
            geo_transform: self.geo_transform,
            bounds: self.bounds.clone(),
            timestamp: self.timestamp,
            metadata: self.metadata.clone(),
        }
    }
}

/// Tiles are equal when geometry, time, metadata and bands match. Pixels
/// compare by bit pattern, so no-data equals no-data.
impl PartialEq for Tile {
    fn eq(&self, other: &Self) -> bool {
        self.geo_transform == other.geo_transform
            && self.bounds == other.bounds
            && self.timestamp == other.timestamp
            && self.metadata == other.metadata
            && self.bands.len() == other.bands.len()
            && self
                .bands
                .iter()
                .zip(other.bands.iter())
                .all(|((name_a, a), (name_b, b))| name_a == name_b && same_pixels(a, b))
    }
}

fn same_pixels(a: &BandGrid, b: &BandGrid) -> bool {
    a.dim() == b.dim()
        && a.iter()
            .zip(b.iter())
            .all(|(x, y)| x.to_bits() == y.to_bits() || (is_no_data(*x) && is_no_data(*y)))
}

/// Ordered sequence of tiles
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TileCollection {
    tiles: Vec<Tile>,
}

impl TileCollection {
    pub fn new(tiles: Vec<Tile>) -> Self {
        Self { tiles }
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Tile> {
        self.tiles.iter()
    }

    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }

    pub fn into_tiles(self) -> Vec<Tile> {
        self.tiles
    }

    pub fn first(&self) -> Option<&Tile> {
        self.tiles.first()
    }

    /// Tile whose `system:index` equals `index`
    pub fn get(&self, index: &str) -> Option<&Tile> {
        self.tiles
            .iter()
            .find(|tile| tile.index().as_deref() == Some(index))
    }
}

impl FromIterator<Tile> for TileCollection {
    fn from_iter<I: IntoIterator<Item = Tile>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl IntoIterator for TileCollection {
    type Item = Tile;
    type IntoIter = std::vec::IntoIter<Tile>;

    fn into_iter(self) -> Self::IntoIter {
        self.tiles.into_iter()
    }
}

impl<'a> IntoIterator for &'a TileCollection {
    type Item = &'a Tile;
    type IntoIter = std::slice::Iter<'a, Tile>;

    fn into_iter(self) -> Self::IntoIter {
        self.tiles.iter()
    }
}

/// Vector feature: polygon geometry plus properties
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub geometry: Polygon<f64>,
    pub properties: Metadata,
}

impl Feature {
    pub fn new(geometry: Polygon<f64>) -> Self {
        Self {
            geometry,
            properties: Metadata::new(),
        }
    }

    pub fn with_property(mut self, key: &str, value: impl Into<MetadataValue>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }
}

/// Ordered set of vector features
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureCollection {
    features: Vec<Feature>,
}

impl FeatureCollection {
    pub fn new(features: Vec<Feature>) -> Self {
        Self { features }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Feature> {
        self.features.iter()
    }

    /// All feature polygons as one geometry, for bounds filters and clipping
    pub fn geometry(&self) -> MultiPolygon<f64> {
        MultiPolygon::new(self.features.iter().map(|f| f.geometry.clone()).collect())
    }
}

impl FromIterator<Feature> for FeatureCollection {
    fn from_iter<I: IntoIterator<Item = Feature>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Error types for compositing operations
#[derive(Debug, thiserror::Error)]
pub enum CompositeError {
    #[error("Band '{band}' not found in tile {tile}")]
    BandNotFound { band: String, tile: String },

    #[error("Metadata key not found: {0}")]
    KeyNotFound(String),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Unbound variable in expression: {0}")]
    UnboundVariable(String),

    #[error("Tile {tile_id} failed: {source}")]
    PerTileFailure {
        tile_id: String,
        source: Box<CompositeError>,
    },

    #[error("Collection is empty")]
    EmptyCollection,

    #[error("Dataset not found: {0}")]
    DatasetNotFound(String),

    #[error("Expression parse error: {0}")]
    Parse(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for compositing operations
pub type CompositeResult<T> = Result<T, CompositeError>;

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn two_band_tile() -> Tile {
        Tile::new(
            GeoTransform::north_up(0.0, 2.0, 1.0),
            vec![
                ("B4", array![[1.0, 2.0], [3.0, 4.0]]),
                ("B8", array![[5.0, 6.0], [7.0, 8.0]]),
            ],
        )
        .unwrap()
        .with_index("T1")
    }

    #[test]
    fn test_tile_rejects_mixed_shapes() {
        let result = Tile::new(
            GeoTransform::north_up(0.0, 2.0, 1.0),
            vec![("a", Array2::zeros((2, 2))), ("b", Array2::zeros((3, 2)))],
        );
        assert!(matches!(result, Err(CompositeError::ShapeMismatch(_))));
    }

    #[test]
    fn test_tile_requires_a_band() {
        let bands: Vec<(&str, BandGrid)> = Vec::new();
        let result = Tile::new(GeoTransform::north_up(0.0, 0.0, 1.0), bands);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_band_reports_tile() {
        let tile = two_band_tile();
        match tile.band("QA60") {
            Err(CompositeError::BandNotFound { band, tile }) => {
                assert_eq!(band, "QA60");
                assert_eq!(tile, "T1");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_select_rename_and_add_bands() {
        let tile = two_band_tile();

        let selected = tile.select(&["B8"]).unwrap();
        assert_eq!(selected.band_names(), vec!["B8"]);
        assert_eq!(selected.index().as_deref(), Some("T1"));

        let renamed = tile.rename("B8", "nir").unwrap();
        assert_eq!(renamed.band_names(), vec!["B4", "nir"]);

        let extra = Tile::new(
            GeoTransform::north_up(0.0, 2.0, 1.0),
            vec![("ndvi", array![[0.1, 0.2], [0.3, 0.4]])],
        )
        .unwrap();
        let combined = tile.add_bands(&extra).unwrap();
        assert_eq!(combined.band_names(), vec!["B4", "B8", "ndvi"]);
        // the input is untouched
        assert_eq!(tile.band_count(), 2);
    }

    #[test]
    fn test_footprint_and_pixel_centers() {
        let gt = GeoTransform::north_up(10.0, 20.0, 2.0);
        assert_eq!(gt.pixel_center(0, 0), (11.0, 19.0));
        assert_eq!(gt.pixel_center(1, 2), (15.0, 17.0));

        let footprint = gt.footprint(2, 3);
        let xs: Vec<f64> = footprint.exterior().coords().map(|c| c.x).collect();
        assert_eq!(xs, vec![10.0, 16.0, 16.0, 10.0, 10.0]);
    }

    #[test]
    fn test_tiles_with_no_data_compare_equal() {
        let masked = Tile::new(
            GeoTransform::north_up(0.0, 2.0, 1.0),
            vec![("B4", array![[1.0, NO_DATA], [3.0, 4.0]])],
        )
        .unwrap();
        assert_eq!(masked, masked.clone());
        assert_eq!(TileCollection::new(vec![masked.clone()]), TileCollection::new(vec![masked.clone()]));

        let other = masked.with_band("B4", array![[1.0, 2.0], [3.0, 4.0]]).unwrap();
        assert_ne!(masked, other);
        assert_ne!(masked, masked.rename("B4", "red").unwrap());
    }

    #[test]
    fn test_metadata_value_json() {
        let values: Vec<MetadataValue> = serde_json::from_str(r#"[true, 3, 2.5, "x"]"#).unwrap();
        assert_eq!(
            values,
            vec![
                MetadataValue::Bool(true),
                MetadataValue::Integer(3),
                MetadataValue::Float(2.5),
                MetadataValue::Text("x".to_string()),
            ]
        );
    }
}
