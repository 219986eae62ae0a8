//! Predicate filtering for tile and feature collections

use crate::types::{
    CompositeError, CompositeResult, Feature, FeatureCollection, MetadataValue, Tile,
    TileCollection,
};
use chrono::{DateTime, Utc};
use geo::{Intersects, MultiPolygon, Polygon};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Anything a predicate can be tested against
pub trait Filterable {
    /// Acquisition time, if the item has one
    fn acquired(&self) -> Option<DateTime<Utc>>;
    /// Footprint used for spatial tests
    fn footprint(&self) -> &Polygon<f64>;
    /// Metadata lookup
    fn lookup(&self, key: &str) -> Option<&MetadataValue>;
}

impl Filterable for Tile {
    fn acquired(&self) -> Option<DateTime<Utc>> {
        self.timestamp()
    }

    fn footprint(&self) -> &Polygon<f64> {
        self.bounds()
    }

    fn lookup(&self, key: &str) -> Option<&MetadataValue> {
        self.property(key)
    }
}

impl Filterable for Feature {
    fn acquired(&self) -> Option<DateTime<Utc>> {
        None
    }

    fn footprint(&self) -> &Polygon<f64> {
        &self.geometry
    }

    fn lookup(&self, key: &str) -> Option<&MetadataValue> {
        self.properties.get(key)
    }
}

/// Comparison operators for metadata predicates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Equals,
    NotEquals,
    LessThan,
    GreaterThan,
}

/// Boolean predicate over tiles or features
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// `start <= time <= end`, both ends inclusive
    Date {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    /// Footprint intersects the reference geometry
    Bounds(MultiPolygon<f64>),
    /// `metadata[key] <op> value`
    Metadata {
        key: String,
        op: Comparison,
        value: MetadataValue,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn date(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Predicate::Date { start, end }
    }

    pub fn bounds(geometry: impl Into<MultiPolygon<f64>>) -> Self {
        Predicate::Bounds(geometry.into())
    }

    pub fn equals(key: &str, value: impl Into<MetadataValue>) -> Self {
        Predicate::Metadata {
            key: key.to_string(),
            op: Comparison::Equals,
            value: value.into(),
        }
    }

    pub fn compare(key: &str, op: Comparison, value: impl Into<MetadataValue>) -> Self {
        Predicate::Metadata {
            key: key.to_string(),
            op,
            value: value.into(),
        }
    }

    /// Test one item.
    ///
    /// Signals `KeyNotFound` when a metadata predicate names a key the item
    /// does not carry; [`filter`] turns that into a non-match.
    pub fn test<T: Filterable>(&self, item: &T) -> CompositeResult<bool> {
        match self {
            Predicate::Date { start, end } => Ok(item
                .acquired()
                .map(|t| *start <= t && t <= *end)
                .unwrap_or(false)),
            Predicate::Bounds(geometry) => {
                let footprint = item.footprint();
                Ok(geometry.0.iter().any(|polygon| footprint.intersects(polygon)))
            }
            Predicate::Metadata { key, op, value } => {
                let actual = item
                    .lookup(key)
                    .ok_or_else(|| CompositeError::KeyNotFound(key.clone()))?;
                Ok(compare_values(actual, *op, value))
            }
            Predicate::And(parts) => {
                for part in parts {
                    if !part.test(item)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Predicate::Or(parts) => {
                for part in parts {
                    if part.test(item)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Predicate::Not(inner) => Ok(!inner.test(item)?),
        }
    }
}

fn compare_values(actual: &MetadataValue, op: Comparison, expected: &MetadataValue) -> bool {
    let ordering = match (actual.as_f64(), expected.as_f64()) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => match (actual, expected) {
            (MetadataValue::Text(a), MetadataValue::Text(b)) => Some(a.cmp(b)),
            (MetadataValue::Bool(a), MetadataValue::Bool(b)) => Some(a.cmp(b)),
            _ => None,
        },
    };

    match (op, ordering) {
        (Comparison::Equals, Some(o)) => o == Ordering::Equal,
        (Comparison::NotEquals, Some(o)) => o != Ordering::Equal,
        // values of different kinds are never equal
        (Comparison::NotEquals, None) => true,
        (Comparison::LessThan, Some(o)) => o == Ordering::Less,
        (Comparison::GreaterThan, Some(o)) => o == Ordering::Greater,
        (_, None) => false,
    }
}

/// Keep the items matching `predicate`, in their original order
pub fn filter_items<'a, T, I>(items: I, predicate: &Predicate) -> Vec<T>
where
    T: Filterable + Clone + 'a,
    I: IntoIterator<Item = &'a T>,
{
    items
        .into_iter()
        .filter(|item| match predicate.test(*item) {
            Ok(keep) => keep,
            Err(CompositeError::KeyNotFound(key)) => {
                log::debug!("metadata key '{}' missing, treating as non-match", key);
                false
            }
            Err(e) => {
                log::warn!("predicate failed, treating as non-match: {}", e);
                false
            }
        })
        .cloned()
        .collect()
}

/// Filter a tile collection
pub fn filter(collection: &TileCollection, predicate: &Predicate) -> TileCollection {
    let kept = TileCollection::new(filter_items(collection.iter(), predicate));
    log::debug!(
        "Filter {:?} kept {}/{} tiles",
        predicate_kind(predicate),
        kept.len(),
        collection.len()
    );
    kept
}

/// Filter a feature collection
pub fn filter_features(collection: &FeatureCollection, predicate: &Predicate) -> FeatureCollection {
    FeatureCollection::new(filter_items(collection.iter(), predicate))
}

fn predicate_kind(predicate: &Predicate) -> &'static str {
    match predicate {
        Predicate::Date { .. } => "date",
        Predicate::Bounds(_) => "bounds",
        Predicate::Metadata { .. } => "metadata",
        Predicate::And(_) => "and",
        Predicate::Or(_) => "or",
        Predicate::Not(_) => "not",
    }
}

impl TileCollection {
    /// Fluent form of [`filter`]
    pub fn filter(&self, predicate: &Predicate) -> TileCollection {
        filter(self, predicate)
    }

    /// Keep tiles acquired within `[start, end]`
    pub fn filter_date(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> TileCollection {
        filter(self, &Predicate::date(start, end))
    }

    /// Keep tiles whose footprint intersects `geometry`
    pub fn filter_bounds(&self, geometry: &MultiPolygon<f64>) -> TileCollection {
        filter(self, &Predicate::Bounds(geometry.clone()))
    }

    /// Keep tiles where `metadata[key] <op> value`
    pub fn filter_metadata(
        &self,
        key: &str,
        op: Comparison,
        value: impl Into<MetadataValue>,
    ) -> TileCollection {
        filter(self, &Predicate::compare(key, op, value))
    }
}

impl FeatureCollection {
    pub fn filter(&self, predicate: &Predicate) -> FeatureCollection {
        filter_features(self, predicate)
    }
}
