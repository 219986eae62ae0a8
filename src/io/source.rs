use crate::core::filter::Predicate;
use crate::io::tile_store::TileStore;
use crate::types::{CompositeError, CompositeResult, TileCollection};
use chrono::{DateTime, Utc};
use geo::MultiPolygon;
use std::collections::HashMap;

/// Temporal and spatial scope of a load request
#[derive(Debug, Clone, Default)]
pub struct LoadScope {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub region: Option<MultiPolygon<f64>>,
}

impl LoadScope {
    /// No restriction
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_dates(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self.end = Some(end);
        self
    }

    pub fn with_region(mut self, region: impl Into<MultiPolygon<f64>>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Predicate equivalent of this scope, or `None` when unrestricted
    pub fn predicate(&self) -> Option<Predicate> {
        let mut parts = Vec::new();
        if self.start.is_some() || self.end.is_some() {
            parts.push(Predicate::date(
                self.start.unwrap_or(DateTime::<Utc>::MIN_UTC),
                self.end.unwrap_or(DateTime::<Utc>::MAX_UTC),
            ));
        }
        if let Some(region) = &self.region {
            parts.push(Predicate::Bounds(region.clone()));
        }
        match parts.len() {
            0 => None,
            1 => parts.pop(),
            _ => Some(Predicate::And(parts)),
        }
    }

    pub fn apply(&self, collection: TileCollection) -> TileCollection {
        match self.predicate() {
            Some(predicate) => collection.filter(&predicate),
            None => collection,
        }
    }
}

/// Loading service: resolves a dataset name to a tile collection
pub trait TileSource {
    fn load_collection(&self, dataset: &str, scope: &LoadScope) -> CompositeResult<TileCollection>;
}

/// Named collections held in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    datasets: HashMap<String, TileCollection>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, dataset: &str, collection: TileCollection) {
        self.datasets.insert(dataset.to_string(), collection);
    }

    pub fn with_dataset(mut self, dataset: &str, collection: TileCollection) -> Self {
        self.insert(dataset, collection);
        self
    }
}

impl TileSource for InMemoryCatalog {
    fn load_collection(&self, dataset: &str, scope: &LoadScope) -> CompositeResult<TileCollection> {
        let collection = self
            .datasets
            .get(dataset)
            .ok_or_else(|| CompositeError::DatasetNotFound(dataset.to_string()))?;
        let loaded = scope.apply(collection.clone());
        log::info!("Loaded {} tiles from in-memory dataset {}", loaded.len(), dataset);
        Ok(loaded)
    }
}

impl TileSource for TileStore {
    /// Datasets are subdirectories of the store root
    fn load_collection(&self, dataset: &str, scope: &LoadScope) -> CompositeResult<TileCollection> {
        if !self.dataset_path(dataset)?.is_dir() {
            return Err(CompositeError::DatasetNotFound(dataset.to_string()));
        }
        let collection = self.dataset(dataset)?.load_all()?;
        Ok(scope.apply(collection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GeoTransform, Tile};
    use chrono::TimeZone;
    use geo::polygon;
    use ndarray::array;

    fn catalog() -> InMemoryCatalog {
        let tiles = (1..=3)
            .map(|month| {
                Tile::new(
                    GeoTransform::north_up(month as f64 * 100.0, 10.0, 1.0),
                    vec![("B4", array![[month as f32]])],
                )
                .unwrap()
                .with_timestamp(Utc.with_ymd_and_hms(2021, month, 15, 0, 0, 0).unwrap())
                .with_index(&format!("m{}", month))
            })
            .collect();
        InMemoryCatalog::new().with_dataset("COPERNICUS/S2_SR", tiles)
    }

    #[test]
    fn test_scope_filters_dates_and_region() {
        let catalog = catalog();
        let all = catalog.load_collection("COPERNICUS/S2_SR", &LoadScope::all()).unwrap();
        assert_eq!(all.len(), 3);

        let scope = LoadScope::all().with_dates(
            Utc.with_ymd_and_hms(2021, 2, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2021, 12, 31, 0, 0, 0).unwrap(),
        );
        assert_eq!(catalog.load_collection("COPERNICUS/S2_SR", &scope).unwrap().len(), 2);

        let region = polygon![(x: 300.0, y: 9.0), (x: 300.5, y: 9.0), (x: 300.5, y: 9.5)];
        let scope = scope.with_region(region);
        let loaded = catalog.load_collection("COPERNICUS/S2_SR", &scope).unwrap();
        assert_eq!(loaded.first().and_then(|t| t.index()).as_deref(), Some("m3"));
        assert_eq!(loaded.len(), 1);
    }

    #[test]
    fn test_unknown_dataset() {
        let result = catalog().load_collection("LANDSAT/LC08", &LoadScope::all());
        assert!(matches!(result, Err(CompositeError::DatasetNotFound(_))));
    }
}
