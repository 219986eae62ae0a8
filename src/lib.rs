//! rastack: cloud-masked composites and band math over georeferenced tile stacks
//!
//! Filter a tile collection by date, footprint and metadata, mask clouds from
//! a QA bitmask, reduce the stack per pixel, clip to a boundary and evaluate
//! band expressions such as NDVI on the result.

pub mod types;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use crate::types::{
    BandGrid, CompositeError, CompositeResult, Feature, FeatureCollection, GeoTransform,
    Metadata, MetadataValue, Pixel, Tile, TileCollection, NO_DATA,
};

pub use crate::core::{
    BitmaskParams, BitmaskProcessor, CompositePipeline, Expression, GeometryClipper,
    PipelineConfig, Predicate, Reducer,
};

pub use crate::io::{InMemoryCatalog, LoadScope, NoopRenderer, Renderer, TileSource, TileStore};
