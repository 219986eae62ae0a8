use crate::types::{
    BandGrid, CompositeError, CompositeResult, GeoTransform, Metadata, Pixel, Tile,
    TileCollection,
};
use chrono::{DateTime, Utc};
use geo::{LineString, Polygon};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const SIDECAR_EXT: &str = "json";
const BANDS_EXT: &str = "bands";

/// Sidecar record stored next to each tile's band file
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TileSidecar {
    id: String,
    timestamp: Option<DateTime<Utc>>,
    geo_transform: GeoTransform,
    /// Exterior ring of the footprint as [x, y] pairs
    bounds: Vec<[f64; 2]>,
    metadata: Metadata,
    rows: usize,
    cols: usize,
    bands: Vec<String>,
}

/// Directory of tiles, one `<id>.bands` + `<id>.json` pair per tile.
///
/// Band files hold each band row-major as little-endian f32, bands in sidecar
/// order. Subdirectories are datasets.
#[derive(Debug, Clone)]
pub struct TileStore {
    root: PathBuf,
}

impl TileStore {
    /// Open (and create if needed) a store rooted at `root`
    pub fn open<P: AsRef<Path>>(root: P) -> CompositeResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        log::debug!("Opened tile store at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store for the dataset named `name` under this root. Slashes in the
    /// name (`COPERNICUS/S2_SR`) become nested directories.
    pub fn dataset(&self, name: &str) -> CompositeResult<TileStore> {
        TileStore::open(self.dataset_path(name)?)
    }

    pub(crate) fn dataset_path(&self, name: &str) -> CompositeResult<PathBuf> {
        let mut path = self.root.clone();
        for segment in name.split('/') {
            validate_id(segment)?;
            path.push(segment);
        }
        Ok(path)
    }

    /// Write `tile` under its `system:index`. Returns the id.
    pub fn save(&self, tile: &Tile) -> CompositeResult<String> {
        let id = tile.index().ok_or_else(|| {
            CompositeError::InvalidFormat("cannot store a tile without system:index".to_string())
        })?;
        validate_id(&id)?;

        let (rows, cols) = tile.shape();
        let sidecar = TileSidecar {
            id: id.clone(),
            timestamp: tile.timestamp(),
            geo_transform: *tile.geo_transform(),
            bounds: tile.bounds().exterior().coords().map(|c| [c.x, c.y]).collect(),
            metadata: tile.metadata().clone(),
            rows,
            cols,
            bands: tile.band_names().iter().map(|s| s.to_string()).collect(),
        };

        let mut writer = BufWriter::new(File::create(self.path_for(&id, BANDS_EXT))?);
        for (_, grid) in tile.bands() {
            for value in grid.iter() {
                writer.write_all(&value.to_le_bytes())?;
            }
        }
        writer.flush()?;

        let sidecar_file = File::create(self.path_for(&id, SIDECAR_EXT))?;
        serde_json::to_writer_pretty(BufWriter::new(sidecar_file), &sidecar)?;

        log::debug!("Stored tile {} ({} bands, {}x{})", id, sidecar.bands.len(), rows, cols);
        Ok(id)
    }

    pub fn save_collection(&self, collection: &TileCollection) -> CompositeResult<Vec<String>> {
        collection.iter().map(|tile| self.save(tile)).collect()
    }

    /// Read the tile stored under `id`
    pub fn load(&self, id: &str) -> CompositeResult<Tile> {
        validate_id(id)?;
        let sidecar: TileSidecar =
            serde_json::from_reader(File::open(self.path_for(id, SIDECAR_EXT))?)?;
        let bytes = fs::read(self.path_for(id, BANDS_EXT))?;

        let band_len = sidecar.rows.checked_mul(sidecar.cols);
        let expected = band_len
            .and_then(|n| n.checked_mul(sidecar.bands.len()))
            .and_then(|n| n.checked_mul(std::mem::size_of::<Pixel>()));
        let (Some(band_len), Some(expected)) = (band_len, expected) else {
            return Err(CompositeError::InvalidFormat(format!(
                "sidecar for {} declares an impossible {}x{} grid of {} bands",
                id,
                sidecar.rows,
                sidecar.cols,
                sidecar.bands.len()
            )));
        };
        if bytes.len() != expected {
            return Err(CompositeError::InvalidFormat(format!(
                "band file for {} has {} bytes, expected {}",
                id,
                bytes.len(),
                expected
            )));
        }

        let values: Vec<Pixel> = bytes
            .chunks_exact(std::mem::size_of::<Pixel>())
            .map(|chunk| Pixel::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();

        let mut bands = IndexMap::with_capacity(sidecar.bands.len());
        for (name, chunk) in sidecar.bands.iter().zip(values.chunks(band_len.max(1))) {
            let grid = BandGrid::from_shape_vec((sidecar.rows, sidecar.cols), chunk.to_vec())
                .map_err(|e| CompositeError::InvalidFormat(format!("band '{}': {}", name, e)))?;
            bands.insert(name.clone(), grid);
        }

        if sidecar.bounds.len() < 4 {
            return Err(CompositeError::InvalidFormat(format!(
                "footprint of {} has {} vertices",
                id,
                sidecar.bounds.len()
            )));
        }
        let ring: Vec<(f64, f64)> = sidecar.bounds.iter().map(|p| (p[0], p[1])).collect();
        let bounds = Polygon::new(LineString::from(ring), vec![]);

        Tile::from_parts(
            bands,
            sidecar.geo_transform,
            Some(bounds),
            sidecar.timestamp,
            sidecar.metadata,
        )
    }

    /// Ids of every stored tile, sorted. Only `.json` files with a matching
    /// `.bands` file count.
    pub fn list_ids(&self) -> CompositeResult<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SIDECAR_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                // sidecars without a band file are not tiles
                if !self.path_for(stem, BANDS_EXT).is_file() {
                    log::debug!("Skipping {}: no band file", path.display());
                    continue;
                }
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Every stored tile, ordered by id
    pub fn load_all(&self) -> CompositeResult<TileCollection> {
        let ids = self.list_ids()?;
        log::info!("Loading {} tiles from {}", ids.len(), self.root.display());
        ids.iter().map(|id| self.load(id)).collect()
    }

    fn path_for(&self, id: &str, extension: &str) -> PathBuf {
        self.root.join(format!("{}.{}", id, extension))
    }
}

fn validate_id(id: &str) -> CompositeResult<()> {
    if id.is_empty() || id == "." || id == ".." || id.contains(|c: char| c == '/' || c == '\\') {
        return Err(CompositeError::InvalidFormat(format!("invalid tile id '{}'", id)));
    }
    Ok(())
}
