//! Tile storage, loading and display services

pub mod tile_store;
pub mod source;
pub mod render;

pub use tile_store::TileStore;
pub use source::{InMemoryCatalog, LoadScope, TileSource};
pub use render::{NoopRenderer, Renderer, VisParams};
