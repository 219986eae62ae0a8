use crate::types::{is_no_data, CompositeError, CompositeResult, Mask, Tile, NO_DATA};
use ndarray::Zip;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Quality-band masking parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BitmaskParams {
    /// Name of the quality-assurance band
    pub qa_band: String,
    /// Bits that must all be zero for a pixel to be kept
    pub bit_positions: BTreeSet<u8>,
    /// Divisor applied to valid pixels after masking (e.g. 10000 for reflectance)
    pub scale_divisor: Option<f32>,
}

impl Default for BitmaskParams {
    fn default() -> Self {
        // Sentinel-2 QA60: bit 10 opaque cloud, bit 11 cirrus
        Self {
            qa_band: "QA60".to_string(),
            bit_positions: [10, 11].into_iter().collect(),
            scale_divisor: Some(10000.0),
        }
    }
}

/// Cloud/quality masking driven by a bit-packed QA band
#[derive(Debug, Clone)]
pub struct BitmaskProcessor {
    params: BitmaskParams,
}

impl BitmaskProcessor {
    pub fn new(params: BitmaskParams) -> Self {
        Self { params }
    }

    /// Processor with Sentinel-2 QA60 cloud and cirrus bits
    pub fn sentinel2() -> Self {
        Self::new(BitmaskParams::default())
    }

    pub fn params(&self) -> &BitmaskParams {
        &self.params
    }

    /// Mask the tile, then rescale it if a divisor is configured
    pub fn process(&self, tile: &Tile) -> CompositeResult<Tile> {
        let masked = apply_cloud_mask(tile, &self.params.qa_band, &self.params.bit_positions)?;
        match self.params.scale_divisor {
            Some(divisor) => scale(&masked, divisor),
            None => Ok(masked),
        }
    }
}

/// Validity mask from `qa_band`: a pixel is valid iff every bit in
/// `bit_positions` is zero. No-data QA pixels are invalid.
pub fn compute_mask(tile: &Tile, qa_band: &str, bit_positions: &BTreeSet<u8>) -> CompositeResult<Mask> {
    let qa = tile.band(qa_band)?;

    if let Some(bad) = bit_positions.iter().find(|&&bit| bit > 31) {
        return Err(CompositeError::Processing(format!(
            "bit position {} is outside a 32-bit QA word",
            bad
        )));
    }
    let bits: u32 = bit_positions.iter().fold(0, |acc, &bit| acc | (1u32 << bit));

    Ok(qa.mapv(|value| {
        if is_no_data(value) || value < 0.0 {
            return false;
        }
        (value as u32) & bits == 0
    }))
}

/// Replace pixels where `mask` is false with no-data, in every band
pub fn update_mask(tile: &Tile, mask: &Mask) -> CompositeResult<Tile> {
    if mask.dim() != tile.shape() {
        return Err(CompositeError::ShapeMismatch(format!(
            "mask is {:?}, tile {} is {:?}",
            mask.dim(),
            tile.label(),
            tile.shape()
        )));
    }

    Ok(tile.map_bands(|grid| {
        Zip::from(grid)
            .and(mask)
            .map_collect(|&value, &keep| if keep { value } else { NO_DATA })
    }))
}

/// Compute the QA mask and apply it to all bands
pub fn apply_cloud_mask(
    tile: &Tile,
    qa_band: &str,
    bit_positions: &BTreeSet<u8>,
) -> CompositeResult<Tile> {
    let mask = compute_mask(tile, qa_band, bit_positions)?;
    let kept = mask.iter().filter(|&&keep| keep).count();
    log::debug!(
        "QA mask on tile {}: kept {}/{} pixels (bits {:?} of {})",
        tile.label(),
        kept,
        mask.len(),
        bit_positions,
        qa_band
    );
    update_mask(tile, &mask)
}

/// Divide every valid pixel by `divisor`; no-data stays no-data
pub fn scale(tile: &Tile, divisor: f32) -> CompositeResult<Tile> {
    if divisor == 0.0 || !divisor.is_finite() {
        return Err(CompositeError::Processing(format!(
            "invalid scale divisor {}",
            divisor
        )));
    }
    Ok(tile.map_bands(|grid| grid.mapv(|v| v / divisor)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GeoTransform;
    use ndarray::array;

    fn qa_tile(qa: ndarray::Array2<f32>) -> Tile {
        let shape = qa.dim();
        Tile::new(
            GeoTransform::north_up(0.0, 0.0, 10.0),
            vec![
                ("B4", ndarray::Array2::from_elem(shape, 1200.0)),
                ("QA60", qa),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_cloud_and_cirrus_bits_are_masked() {
        // 0b110000000000 = 3072: bits 10 and 11 set
        let tile = qa_tile(array![[0.0, 1024.0], [2048.0, 3072.0]]);
        let processor = BitmaskProcessor::new(BitmaskParams {
            scale_divisor: None,
            ..BitmaskParams::default()
        });

        let masked = processor.process(&tile).unwrap();
        let b4 = masked.band("B4").unwrap();
        assert_eq!(b4[[0, 0]], 1200.0);
        assert!(is_no_data(b4[[0, 1]]));
        assert!(is_no_data(b4[[1, 0]]));
        assert!(is_no_data(b4[[1, 1]]));

        // QA band itself is masked too
        assert!(is_no_data(masked.band("QA60").unwrap()[[1, 1]]));
    }

    #[test]
    fn test_unrelated_bits_do_not_mask() {
        let tile = qa_tile(array![[1.0 + 512.0]]);
        let mask = compute_mask(&tile, "QA60", &[10, 11].into_iter().collect()).unwrap();
        assert!(mask[[0, 0]]);
    }

    #[test]
    fn test_missing_qa_band() {
        let tile = Tile::new(
            GeoTransform::north_up(0.0, 0.0, 10.0),
            vec![("B4", array![[1.0]])],
        )
        .unwrap();
        let result = BitmaskProcessor::sentinel2().process(&tile);
        assert!(matches!(result, Err(CompositeError::BandNotFound { .. })));
    }

    #[test]
    fn test_scale_keeps_no_data_distinct_from_zero() {
        let tile = qa_tile(array![[0.0, 3072.0]]).with_band("B2", array![[0.0, 5.0]]).unwrap();
        let processed = BitmaskProcessor::sentinel2().process(&tile).unwrap();

        let b2 = processed.band("B2").unwrap();
        assert_eq!(b2[[0, 0]], 0.0);
        assert!(is_no_data(b2[[0, 1]]));
        assert!((processed.band("B4").unwrap()[[0, 0]] - 0.12).abs() < 1e-6);
    }

    #[test]
    fn test_invalid_parameters() {
        let tile = qa_tile(array![[0.0]]);
        assert!(scale(&tile, 0.0).is_err());
        assert!(compute_mask(&tile, "QA60", &[32].into_iter().collect()).is_err());

        let wrong_shape = Mask::from_elem((2, 2), true);
        assert!(matches!(
            update_mask(&tile, &wrong_shape),
            Err(CompositeError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_inputs_are_not_mutated() {
        let tile = qa_tile(array![[3072.0]]);
        let _ = BitmaskProcessor::sentinel2().process(&tile).unwrap();
        assert_eq!(tile.band("B4").unwrap()[[0, 0]], 1200.0);
    }
}
