use crate::types::{CompositeError, CompositeResult, Tile};
use serde::{Deserialize, Serialize};

/// Display parameters for a raster layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VisParams {
    /// One band (palette) or three bands (RGB)
    #[serde(default)]
    pub bands: Vec<String>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Hex colours, low to high
    #[serde(default)]
    pub palette: Vec<String>,
}

impl VisParams {
    /// Sentinel-2 true colour over reflectance
    pub fn true_color(min: f64, max: f64) -> Self {
        Self {
            bands: vec!["B4".to_string(), "B3".to_string(), "B2".to_string()],
            min: Some(min),
            max: Some(max),
            palette: Vec::new(),
        }
    }

    /// Check the parameters against the tile being displayed
    pub fn validate(&self, tile: &Tile) -> CompositeResult<()> {
        for band in &self.bands {
            tile.band(band)?;
        }
        if let (Some(min), Some(max)) = (self.min, self.max) {
            if min > max {
                return Err(CompositeError::InvalidFormat(format!(
                    "stretch min {} exceeds max {}",
                    min, max
                )));
            }
        }
        if let Some(bad) = self.palette.iter().find(|c| !is_hex_colour(c)) {
            return Err(CompositeError::InvalidFormat(format!("bad palette colour '{}'", bad)));
        }
        Ok(())
    }
}

fn is_hex_colour(colour: &str) -> bool {
    let digits = colour.strip_prefix('#').unwrap_or(colour);
    digits.len() == 6 && digits.chars().all(|c| c.is_ascii_hexdigit())
}

/// Map/console service the pipeline reports to
pub trait Renderer {
    fn add_layer(&mut self, tile: &Tile, vis: &VisParams, name: &str) -> CompositeResult<()>;
    fn print(&mut self, label: &str, value: &str);
}

/// Renderer that draws nothing: it validates, logs and remembers layer names
#[derive(Debug, Default)]
pub struct NoopRenderer {
    layers: Vec<String>,
    lines: Vec<String>,
}

impl NoopRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn layers(&self) -> &[String] {
        &self.layers
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}

impl Renderer for NoopRenderer {
    fn add_layer(&mut self, tile: &Tile, vis: &VisParams, name: &str) -> CompositeResult<()> {
        vis.validate(tile)?;
        log::debug!("Layer '{}' from tile {} with {:?}", name, tile.label(), vis);
        self.layers.push(name.to_string());
        Ok(())
    }

    fn print(&mut self, label: &str, value: &str) {
        log::info!("{} {}", label, value);
        self.lines.push(format!("{} {}", label, value));
    }
}
