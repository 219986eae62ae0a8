//! Core compositing modules

pub mod filter;
pub mod bitmask;
pub mod reducer;
pub mod clip;
pub mod expression;
pub mod mapper;
pub mod pipeline;

// Re-export main types
pub use filter::{Comparison, Filterable, Predicate};
pub use bitmask::{BitmaskParams, BitmaskProcessor};
pub use reducer::{Reducer, ReducerEngine};
pub use clip::GeometryClipper;
pub use expression::{BandRef, Bindings, Expression};
pub use mapper::{Chain, MapOutcome, TileFailure, TileTransform};
pub use pipeline::{CompositePipeline, MetadataFilter, PipelineConfig, PipelineOutput};
