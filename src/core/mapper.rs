use crate::core::bitmask::BitmaskProcessor;
use crate::core::clip::GeometryClipper;
use crate::types::{CompositeError, CompositeResult, Tile, TileCollection};

/// A per-tile transformation. Implementations must not share mutable state
/// between calls; tiles are transformed concurrently.
pub trait TileTransform: Send + Sync {
    fn apply(&self, tile: &Tile) -> CompositeResult<Tile>;
}

impl<F> TileTransform for F
where
    F: Fn(&Tile) -> CompositeResult<Tile> + Send + Sync,
{
    fn apply(&self, tile: &Tile) -> CompositeResult<Tile> {
        self(tile)
    }
}

impl TileTransform for BitmaskProcessor {
    fn apply(&self, tile: &Tile) -> CompositeResult<Tile> {
        self.process(tile)
    }
}

impl TileTransform for GeometryClipper {
    fn apply(&self, tile: &Tile) -> CompositeResult<Tile> {
        Ok(self.clip(tile))
    }
}

/// Transforms applied one after another; the first failure stops the chain
pub struct Chain {
    steps: Vec<Box<dyn TileTransform>>,
}

impl Chain {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn then(mut self, step: impl TileTransform + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl Default for Chain {
    fn default() -> Self {
        Self::new()
    }
}

impl TileTransform for Chain {
    fn apply(&self, tile: &Tile) -> CompositeResult<Tile> {
        let mut current = tile.clone();
        for step in &self.steps {
            current = step.apply(&current)?;
        }
        Ok(current)
    }
}

/// One tile the transform rejected
#[derive(Debug)]
pub struct TileFailure {
    /// Position of the tile in the input collection
    pub position: usize,
    /// `system:index` of the tile, or `#<position>` when it has none
    pub tile_id: String,
    /// `CompositeError::PerTileFailure` wrapping the transform's error
    pub error: CompositeError,
}

/// Result of mapping a collection: successful tiles in input order, plus
/// every failure. Failed tiles are excluded, so
/// `tiles.len() + failures.len()` equals the input size.
#[derive(Debug, Default)]
pub struct MapOutcome {
    pub tiles: TileCollection,
    pub failures: Vec<TileFailure>,
}

impl MapOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// The mapped collection, or the first failure if any tile failed
    pub fn into_result(self) -> CompositeResult<TileCollection> {
        match self.failures.into_iter().next() {
            Some(failure) => Err(failure.error),
            None => Ok(self.tiles),
        }
    }
}

/// Apply `transform` to every tile independently.
///
/// A tile whose transform fails is left out of the output and recorded in
/// `failures`; the rest of the batch still runs.
pub fn map<T>(collection: &TileCollection, transform: &T) -> MapOutcome
where
    T: TileTransform + ?Sized,
{
    log::info!("Mapping transform over {} tiles", collection.len());

    let results = run(collection.tiles(), transform);

    let mut outcome = MapOutcome::default();
    let mut tiles = Vec::with_capacity(collection.len());
    for (position, (input, result)) in collection.iter().zip(results).enumerate() {
        match result {
            Ok(tile) => tiles.push(tile),
            Err(e) => {
                let tile_id = input.index().unwrap_or_else(|| format!("#{}", position));
                log::warn!("Excluding tile {} from mapped collection: {}", tile_id, e);
                outcome.failures.push(TileFailure {
                    position,
                    tile_id: tile_id.clone(),
                    error: CompositeError::PerTileFailure {
                        tile_id,
                        source: Box::new(e),
                    },
                });
            }
        }
    }
    outcome.tiles = TileCollection::new(tiles);

    if !outcome.is_complete() {
        log::warn!(
            "{} of {} tiles failed during map",
            outcome.failures.len(),
            collection.len()
        );
    }
    outcome
}

#[cfg(feature = "parallel")]
fn run<T>(tiles: &[Tile], transform: &T) -> Vec<CompositeResult<Tile>>
where
    T: TileTransform + ?Sized,
{
    use rayon::prelude::*;

    tiles.par_iter().map(|tile| transform.apply(tile)).collect()
}

#[cfg(not(feature = "parallel"))]
fn run<T>(tiles: &[Tile], transform: &T) -> Vec<CompositeResult<Tile>>
where
    T: TileTransform + ?Sized,
{
    tiles.iter().map(|tile| transform.apply(tile)).collect()
}

impl TileCollection {
    /// Fluent form of [`map`]
    pub fn map<T>(&self, transform: &T) -> MapOutcome
    where
        T: TileTransform + ?Sized,
    {
        map(self, transform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bitmask::BitmaskParams;
    use crate::types::{is_no_data, GeoTransform};
    use geo::{polygon, MultiPolygon};
    use ndarray::{array, Array2};

    fn tile(index: &str, value: f32, with_qa: bool) -> Tile {
        let mut bands = vec![("B4", Array2::from_elem((2, 2), value))];
        if with_qa {
            bands.push(("QA60", array![[0.0, 1024.0], [0.0, 0.0]]));
        }
        Tile::new(GeoTransform::north_up(0.0, 2.0, 1.0), bands)
            .unwrap()
            .with_index(index)
    }

    fn collection() -> TileCollection {
        TileCollection::new(vec![
            tile("a", 1.0, true),
            tile("b", 2.0, false),
            tile("c", 3.0, true),
        ])
    }

    #[test]
    fn test_identity_map_preserves_collection() {
        let input = collection();
        let identity = |t: &Tile| -> CompositeResult<Tile> { Ok(t.clone()) };
        let outcome = input.map(&identity);
        assert!(outcome.is_complete());
        assert_eq!(outcome.tiles, input);
    }

    #[test]
    fn test_identity_map_preserves_masked_collection() {
        let processor = BitmaskProcessor::new(BitmaskParams {
            scale_divisor: None,
            ..BitmaskParams::default()
        });
        let masked = TileCollection::new(vec![tile("a", 1.0, true), tile("c", 3.0, true)])
            .map(&processor)
            .into_result()
            .unwrap();
        assert!(is_no_data(masked.tiles()[0].band("B4").unwrap()[[0, 1]]));

        let identity = |t: &Tile| -> CompositeResult<Tile> { Ok(t.clone()) };
        assert_eq!(masked.map(&identity).tiles, masked);
    }

    #[test]
    fn test_failures_are_excluded_and_recorded() {
        let processor = BitmaskProcessor::new(BitmaskParams {
            scale_divisor: None,
            ..BitmaskParams::default()
        });
        let outcome = map(&collection(), &processor);

        let kept: Vec<String> = outcome.tiles.iter().filter_map(|t| t.index()).collect();
        assert_eq!(kept, vec!["a", "c"]);
        assert_eq!(outcome.failures.len(), 1);

        let failure = &outcome.failures[0];
        assert_eq!(failure.position, 1);
        assert_eq!(failure.tile_id, "b");
        match &failure.error {
            CompositeError::PerTileFailure { tile_id, source } => {
                assert_eq!(tile_id, "b");
                assert!(matches!(**source, CompositeError::BandNotFound { .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(outcome.into_result().is_err());
    }

    #[test]
    fn test_unindexed_tiles_are_identified_by_position() {
        let unindexed = TileCollection::new(vec![Tile::new(
            GeoTransform::north_up(0.0, 0.0, 1.0),
            vec![("B4", array![[1.0]])],
        )
        .unwrap()]);
        let outcome = unindexed.map(&BitmaskProcessor::sentinel2());
        assert_eq!(outcome.failures[0].tile_id, "#0");
    }

    #[test]
    fn test_chain_with_captured_boundary() {
        let boundary: MultiPolygon<f64> =
            polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 2.0), (x: 0.0, y: 2.0)].into();
        let add_ndvi = |t: &Tile| -> CompositeResult<Tile> {
            let nd = t.expression("B4 * 2", &[("B4", "B4")])?.rename("result", "double")?;
            t.add_bands(&nd)
        };
        let chain = Chain::new()
            .then(BitmaskProcessor::new(BitmaskParams {
                scale_divisor: None,
                ..BitmaskParams::default()
            }))
            .then(add_ndvi)
            .then(GeometryClipper::new(boundary));
        assert_eq!(chain.len(), 3);

        let outcome = TileCollection::new(vec![tile("a", 1.0, true), tile("c", 3.0, true)]).map(&chain);
        assert!(outcome.is_complete());
        let c = outcome.tiles.get("c").unwrap();
        let double = c.band("double").unwrap();
        assert_eq!(double[[1, 0]], 6.0);
        // right column is outside the boundary
        assert!(is_no_data(double[[1, 1]]));
        // bit 10 set at (0, 1)
        assert!(is_no_data(c.band("B4").unwrap()[[0, 1]]));
    }

    #[test]
    fn test_empty_collection() {
        let outcome = TileCollection::default().map(&BitmaskProcessor::sentinel2());
        assert!(outcome.tiles.is_empty());
        assert!(outcome.is_complete());
    }
}
