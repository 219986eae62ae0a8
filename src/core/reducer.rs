use crate::types::{
    is_no_data, BandGrid, CompositeError, CompositeResult, Metadata, MetadataValue, Pixel, Tile,
    TileCollection, NO_DATA,
};
use indexmap::IndexMap;
use ndarray::{ArrayView2, Zip};
use serde::{Deserialize, Serialize};

/// Metadata key recording how many tiles went into a composite
pub const SOURCE_COUNT_KEY: &str = "system:source_count";
/// Earliest acquisition among a composite's inputs (RFC 3339)
pub const TIME_START_KEY: &str = "system:time_start";
/// Latest acquisition among a composite's inputs (RFC 3339)
pub const TIME_END_KEY: &str = "system:time_end";

/// Per-pixel statistical reducers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reducer {
    Mean,
    /// Middle value; even counts average the two middle values
    Median,
    Sum,
    Min,
    Max,
}

impl Reducer {
    /// Reduce one pixel stack. No-data entries are ignored; an empty or
    /// all-no-data stack reduces to no-data.
    pub fn apply(&self, values: &[Pixel]) -> Pixel {
        let mut valid: Vec<Pixel> = values.iter().copied().filter(|v| !is_no_data(*v)).collect();
        self.apply_valid(&mut valid)
    }

    /// `values` must already be free of no-data. May reorder `values`.
    fn apply_valid(&self, values: &mut [Pixel]) -> Pixel {
        if values.is_empty() {
            return NO_DATA;
        }
        let n = values.len();
        match self {
            Reducer::Mean => {
                let sum: f64 = values.iter().map(|&v| v as f64).sum();
                (sum / n as f64) as Pixel
            }
            Reducer::Median => {
                values.sort_unstable_by(|a, b| a.total_cmp(b));
                if n % 2 == 1 {
                    values[n / 2]
                } else {
                    ((values[n / 2 - 1] as f64 + values[n / 2] as f64) / 2.0) as Pixel
                }
            }
            Reducer::Sum => values.iter().map(|&v| v as f64).sum::<f64>() as Pixel,
            Reducer::Min => values.iter().copied().fold(Pixel::INFINITY, Pixel::min),
            Reducer::Max => values.iter().copied().fold(Pixel::NEG_INFINITY, Pixel::max),
        }
    }
}

impl std::fmt::Display for Reducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reducer::Mean => write!(f, "mean"),
            Reducer::Median => write!(f, "median"),
            Reducer::Sum => write!(f, "sum"),
            Reducer::Min => write!(f, "min"),
            Reducer::Max => write!(f, "max"),
        }
    }
}

impl std::str::FromStr for Reducer {
    type Err = CompositeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mean" => Ok(Reducer::Mean),
            "median" => Ok(Reducer::Median),
            "sum" => Ok(Reducer::Sum),
            "min" => Ok(Reducer::Min),
            "max" => Ok(Reducer::Max),
            _ => Err(CompositeError::Processing(format!("Invalid reducer: {}", s))),
        }
    }
}

/// Composites a stack of aligned tiles into one tile
pub struct ReducerEngine {
    reducer: Reducer,
}

impl ReducerEngine {
    pub fn new(reducer: Reducer) -> Self {
        Self { reducer }
    }

    /// Median compositing, the usual choice for cloud-free mosaics
    pub fn median() -> Self {
        Self::new(Reducer::Median)
    }

    pub fn reducer(&self) -> Reducer {
        self.reducer
    }

    /// Reduce `tiles` band by band, pixel by pixel.
    ///
    /// All tiles must carry the same band set and grid shape. The composite
    /// takes its geometry from the first tile, has no timestamp, and records
    /// its provenance in metadata.
    pub fn reduce(&self, tiles: &[Tile]) -> CompositeResult<Tile> {
        let first = tiles.first().ok_or(CompositeError::EmptyCollection)?;
        check_alignment(tiles)?;

        let (rows, cols) = first.shape();
        log::info!(
            "Reducing {} tiles ({} bands, {}x{}) with {}",
            tiles.len(),
            first.band_count(),
            rows,
            cols,
            self.reducer
        );

        let mut bands = IndexMap::with_capacity(first.band_count());
        for name in first.band_names() {
            let views: Vec<ArrayView2<Pixel>> = tiles
                .iter()
                .map(|tile| tile.band(name).map(|grid| grid.view()))
                .collect::<CompositeResult<_>>()?;
            bands.insert(name.to_string(), self.reduce_band(&views, (rows, cols)));
        }

        let composite = first
            .replace_bands(bands)?
            .with_metadata_replaced(provenance(tiles))
            .without_timestamp();

        log::info!("Reduction complete");
        Ok(composite)
    }

    #[cfg(feature = "parallel")]
    fn reduce_band(&self, views: &[ArrayView2<Pixel>], shape: (usize, usize)) -> BandGrid {
        let mut output = BandGrid::from_elem(shape, NO_DATA);
        Zip::indexed(&mut output).par_for_each(|index, out| {
            *out = self.reduce_pixel(views, index);
        });
        output
    }

    #[cfg(not(feature = "parallel"))]
    fn reduce_band(&self, views: &[ArrayView2<Pixel>], shape: (usize, usize)) -> BandGrid {
        let mut output = BandGrid::from_elem(shape, NO_DATA);
        Zip::indexed(&mut output).for_each(|index, out| {
            *out = self.reduce_pixel(views, index);
        });
        output
    }

    fn reduce_pixel(&self, views: &[ArrayView2<Pixel>], index: (usize, usize)) -> Pixel {
        let mut stack: Vec<Pixel> = views
            .iter()
            .map(|view| view[index])
            .filter(|v| !is_no_data(*v))
            .collect();
        self.reducer.apply_valid(&mut stack)
    }
}

/// Same band names, grid shape and geo transform in every tile
fn check_alignment(tiles: &[Tile]) -> CompositeResult<()> {
    let Some(first) = tiles.first() else {
        return Ok(());
    };
    let shape = first.shape();
    let mut names = first.band_names();
    names.sort_unstable();

    for tile in &tiles[1..] {
        if tile.shape() != shape {
            return Err(CompositeError::ShapeMismatch(format!(
                "tile {} is {:?}, tile {} is {:?}",
                tile.label(),
                tile.shape(),
                first.label(),
                shape
            )));
        }
        if tile.geo_transform() != first.geo_transform() {
            return Err(CompositeError::ShapeMismatch(format!(
                "tile {} is georeferenced at {:?}, tile {} at {:?}",
                tile.label(),
                tile.geo_transform(),
                first.label(),
                first.geo_transform()
            )));
        }
        let mut other = tile.band_names();
        other.sort_unstable();
        if other != names {
            return Err(CompositeError::ShapeMismatch(format!(
                "tile {} has bands {:?}, expected {:?}",
                tile.label(),
                other,
                names
            )));
        }
    }
    Ok(())
}

fn provenance(tiles: &[Tile]) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert(
        SOURCE_COUNT_KEY.to_string(),
        MetadataValue::Integer(tiles.len() as i64),
    );

    let start = tiles.iter().filter_map(|t| t.timestamp()).min();
    let end = tiles.iter().filter_map(|t| t.timestamp()).max();
    if let (Some(start), Some(end)) = (start, end) {
        metadata.insert(TIME_START_KEY.to_string(), start.to_rfc3339().into());
        metadata.insert(TIME_END_KEY.to_string(), end.to_rfc3339().into());
    }
    metadata
}

/// Composite a collection with `reducer`
pub fn reduce(collection: &TileCollection, reducer: Reducer) -> CompositeResult<Tile> {
    ReducerEngine::new(reducer).reduce(collection.tiles())
}

impl TileCollection {
    /// Fluent form of [`reduce`]
    pub fn reduce(&self, reducer: Reducer) -> CompositeResult<Tile> {
        reduce(self, reducer)
    }

    pub fn mean(&self) -> CompositeResult<Tile> {
        reduce(self, Reducer::Mean)
    }

    pub fn median(&self) -> CompositeResult<Tile> {
        reduce(self, Reducer::Median)
    }
}
