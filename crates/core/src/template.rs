//! Reference images and the descriptors that say where and how to look for
//! them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::Rect;

/// Which hit to report when several positions clear the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    /// First position above threshold in row-major scan order.
    First,
    /// Highest-scoring position in the region.
    #[default]
    Best,
}

/// Grayscale reference image with an optional mask (non-zero = compared).
#[derive(Debug, Clone)]
pub struct TemplateImage {
    pub name: String,
    pub pixels: GrayImage,
    pub mask: Option<GrayImage>,
}

impl TemplateImage {
    pub fn new(name: impl Into<String>, pixels: GrayImage) -> Self {
        Self { name: name.into(), pixels, mask: None }
    }

    pub fn with_mask(mut self, mask: GrayImage) -> Result<Self, ConfigError> {
        if mask.dimensions() != self.pixels.dimensions() {
            return Err(ConfigError::invalid(format!(
                "mask for '{}' is {:?}, template is {:?}",
                self.name,
                mask.dimensions(),
                self.pixels.dimensions()
            )));
        }
        self.mask = Some(mask);
        Ok(self)
    }

    /// Load a template (and optional mask) from disk as grayscale.
    pub fn load(name: &str, path: &Path, mask: Option<&Path>) -> Result<Self, ConfigError> {
        let pixels = load_grayscale(path)?;
        let template = Self::new(name, pixels);
        match mask {
            Some(mask_path) => template.with_mask(load_grayscale(mask_path)?),
            None => Ok(template),
        }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }
}

/// Everything needed to look for one visual feature. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct TemplateDescriptor {
    pub id: String,
    pub image: TemplateImage,
    /// Where to search; a zero-area rect means the whole frame.
    pub roi: Rect,
    pub threshold: f32,
    pub policy: MatchPolicy,
}

pub type SharedTemplate = Arc<TemplateDescriptor>;

fn load_grayscale(path: &Path) -> Result<GrayImage, ConfigError> {
    image::open(path)
        .map(|img| img.to_luma8())
        .map_err(|source| ConfigError::Image { path: path.to_path_buf(), source })
}

/// Conventional mask location: `shop.png` -> `shopmask.png`.
pub fn default_mask_path(template_path: &Path) -> PathBuf {
    let stem = template_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let name = match template_path.extension() {
        Some(ext) => format!("{}mask.{}", stem, ext.to_string_lossy()),
        None => format!("{}mask", stem),
    };
    template_path.with_file_name(name)
}
