//! End-to-end compositing: filter, mask, reduce, clip, derive.
//!
//! Two products come out of one configuration:
//! - a clipped composite with a derived band evaluated on it ([`CompositePipeline::run`])
//! - the unreduced collection with a derived band appended to every tile
//!   ([`CompositePipeline::map_per_tile`])

use crate::core::bitmask::{BitmaskParams, BitmaskProcessor};
use crate::core::clip::GeometryClipper;
use crate::core::expression::{BandRef, Bindings, Expression};
use crate::core::filter::{Comparison, Predicate};
use crate::core::mapper::{map, Chain, MapOutcome, TileFailure};
use crate::core::reducer::{Reducer, ReducerEngine};
use crate::io::render::{Renderer, VisParams};
use crate::types::{CompositeResult, MetadataValue, Tile, TileCollection};
use chrono::{DateTime, TimeZone, Utc};
use geo::MultiPolygon;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

/// Metadata predicate as written in a config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataFilter {
    pub key: String,
    pub op: Comparison,
    pub value: MetadataValue,
}

/// Pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Acquisition window, inclusive
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub metadata_filter: Option<MetadataFilter>,
    pub bitmask: BitmaskParams,
    pub reducer: Reducer,
    /// Band math evaluated on the clipped composite
    pub expression: String,
    /// Expression operand -> composite band
    pub bindings: BTreeMap<String, String>,
    pub output_band: String,
    /// Band pair (a, b) for the per-tile normalized difference
    pub per_tile_bands: (String, String),
    pub per_tile_band: String,
    /// Clip the per-tile derived band to the boundary
    pub clip_per_tile: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        // Summer 2021 Sentinel-2 NDVI
        let bindings = [("NIR", "B8"), ("RED", "B4")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            start: utc(2021, 6, 1, 0, 0, 0),
            end: utc(2021, 8, 31, 23, 59, 59),
            metadata_filter: None,
            bitmask: BitmaskParams::default(),
            reducer: Reducer::Median,
            expression: "((NIR - RED) / (NIR + RED))".to_string(),
            bindings,
            output_band: "ndvi".to_string(),
            per_tile_bands: ("B8".to_string(), "B4".to_string()),
            per_tile_band: "ndvi".to_string(),
            clip_per_tile: true,
        }
    }
}

fn utc(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
        .single()
        .unwrap_or_default()
}

impl PipelineConfig {
    pub fn from_json_str(json: &str) -> CompositeResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> CompositeResult<Self> {
        log::info!("Reading pipeline config from {}", path.as_ref().display());
        Ok(serde_json::from_reader(File::open(path)?)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> CompositeResult<()> {
        serde_json::to_writer_pretty(BufWriter::new(File::create(path)?), self)?;
        Ok(())
    }

    /// Date window, boundary intersection and the optional metadata test
    pub fn selection(&self, boundary: &MultiPolygon<f64>) -> Predicate {
        let mut parts = vec![
            Predicate::date(self.start, self.end),
            Predicate::Bounds(boundary.clone()),
        ];
        if let Some(filter) = &self.metadata_filter {
            parts.push(Predicate::compare(&filter.key, filter.op, filter.value.clone()));
        }
        Predicate::And(parts)
    }
}

/// Everything [`CompositePipeline::run`] produces
#[derive(Debug)]
pub struct PipelineOutput {
    /// Tiles left after filtering
    pub selected: usize,
    /// Clipped composite
    pub composite: Tile,
    /// Single-band result of the expression over the composite
    pub derived: Tile,
    /// Tiles dropped during masking
    pub failures: Vec<TileFailure>,
}

impl PipelineOutput {
    /// Report counts and hand both products to a renderer
    pub fn publish(
        &self,
        renderer: &mut dyn Renderer,
        composite_vis: &VisParams,
        derived_vis: &VisParams,
    ) -> CompositeResult<()> {
        renderer.print("Tiles selected:", &self.selected.to_string());
        renderer.print("Tiles excluded:", &self.failures.len().to_string());
        renderer.add_layer(&self.composite, composite_vis, "composite")?;
        renderer.add_layer(&self.derived, derived_vis, "derived")?;
        Ok(())
    }
}

/// Filter -> mask -> reduce -> clip -> expression, driven by a [`PipelineConfig`]
pub struct CompositePipeline {
    config: PipelineConfig,
    expression: Expression,
}

impl CompositePipeline {
    /// Validates the expression up front
    pub fn new(config: PipelineConfig) -> CompositeResult<Self> {
        let expression = Expression::parse(&config.expression)?;
        Ok(Self { config, expression })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Tiles matching the date window, boundary and metadata filter
    pub fn select(&self, collection: &TileCollection, boundary: &MultiPolygon<f64>) -> TileCollection {
        collection.filter(&self.config.selection(boundary))
    }

    pub fn run(
        &self,
        collection: &TileCollection,
        boundary: &MultiPolygon<f64>,
    ) -> CompositeResult<PipelineOutput> {
        log::info!(
            "Running composite pipeline over {} tiles ({} to {})",
            collection.len(),
            self.config.start,
            self.config.end
        );

        let selected = self.select(collection, boundary);
        log::info!("Selected {} tiles", selected.len());

        let masked = map(&selected, &BitmaskProcessor::new(self.config.bitmask.clone()));
        let composite = ReducerEngine::new(self.config.reducer).reduce(masked.tiles.tiles())?;

        // clip once, after compositing
        let composite = GeometryClipper::new(boundary.clone()).clip(&composite);

        let bindings: Bindings = self
            .config
            .bindings
            .iter()
            .map(|(name, band)| (name.clone(), BandRef::new(&composite, band)))
            .collect();
        let derived = self.expression.evaluate(&bindings, &self.config.output_band)?;

        log::info!(
            "Pipeline complete: {} tiles composited, {} excluded",
            masked.tiles.len(),
            masked.failures.len()
        );
        Ok(PipelineOutput {
            selected: selected.len(),
            composite,
            derived,
            failures: masked.failures,
        })
    }

    /// Per-tile chain: mask, then append the normalized difference band
    /// (clipped to `boundary` when configured)
    pub fn per_tile_transform(&self, boundary: &MultiPolygon<f64>) -> Chain {
        let (band_a, band_b) = self.config.per_tile_bands.clone();
        let name = self.config.per_tile_band.clone();
        let clipper = self
            .config
            .clip_per_tile
            .then(|| GeometryClipper::new(boundary.clone()));

        Chain::new()
            .then(BitmaskProcessor::new(self.config.bitmask.clone()))
            .then(move |tile: &Tile| -> CompositeResult<Tile> {
                let mut index = tile
                    .normalized_difference(&band_a, &band_b)?
                    .rename(crate::core::expression::NORMALIZED_DIFFERENCE_BAND, &name)?;
                if let Some(clipper) = &clipper {
                    index = clipper.clip(&index);
                }
                tile.add_bands(&index)
            })
    }

    /// Select tiles and append the derived band to each one
    pub fn map_per_tile(&self, collection: &TileCollection, boundary: &MultiPolygon<f64>) -> MapOutcome {
        let selected = self.select(collection, boundary);
        map(&selected, &self.per_tile_transform(boundary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{is_no_data, GeoTransform};
    use geo::polygon;
    use ndarray::Array2;

    fn s2_tile(day: u32, red: f32, nir: f32, qa: f32) -> Tile {
        let shape = (4, 4);
        Tile::new(
            GeoTransform::north_up(0.0, 4.0, 1.0),
            vec![
                ("B4", Array2::from_elem(shape, red)),
                ("B8", Array2::from_elem(shape, nir)),
                ("QA60", Array2::from_elem(shape, qa)),
            ],
        )
        .unwrap()
        .with_timestamp(Utc.with_ymd_and_hms(2021, 7, day, 16, 0, 0).unwrap())
        .with_index(&format!("202107{:02}T160000_T18STJ", day))
    }

    fn boundary() -> MultiPolygon<f64> {
        polygon![(x: 0.0, y: 0.0), (x: 2.0, y: 0.0), (x: 2.0, y: 4.0), (x: 0.0, y: 4.0)].into()
    }

    #[test]
    fn test_run_composites_clear_tiles() {
        let collection = TileCollection::new(vec![
            s2_tile(1, 1000.0, 3000.0, 0.0),
            s2_tile(2, 2000.0, 4000.0, 0.0),
            s2_tile(3, 9000.0, 9000.0, 1024.0), // cloudy
        ]);
        let pipeline = CompositePipeline::new(PipelineConfig::default()).unwrap();
        let output = pipeline.run(&collection, &boundary()).unwrap();

        assert_eq!(output.selected, 3);
        assert!(output.failures.is_empty());

        let red = output.composite.band("B4").unwrap();
        assert!((red[[0, 0]] - 0.15).abs() < 1e-6);
        assert!(is_no_data(red[[0, 3]]));

        let ndvi = output.derived.band("ndvi").unwrap();
        let expected = (0.35f32 - 0.15) / (0.35 + 0.15);
        assert!((ndvi[[2, 1]] - expected).abs() < 1e-6);
        assert!(is_no_data(ndvi[[2, 2]]));
    }

    #[test]
    fn test_config_json_round_trip() {
        let config = PipelineConfig {
            metadata_filter: Some(MetadataFilter {
                key: "CLOUDY_PIXEL_PERCENTAGE".to_string(),
                op: Comparison::LessThan,
                value: MetadataValue::Float(20.0),
            }),
            ..PipelineConfig::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        config.save(&path).unwrap();
        assert_eq!(PipelineConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_bad_expression_is_rejected_up_front() {
        let config = PipelineConfig {
            expression: "(NIR - RED".to_string(),
            ..PipelineConfig::default()
        };
        assert!(CompositePipeline::new(config).is_err());
    }
}
