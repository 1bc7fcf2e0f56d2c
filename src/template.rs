// Template bank: decoded button images with precomputed grayscale and
// scale-pyramid variants. Templates are immutable once loaded and
// content-addressed: loading the same bytes twice returns the existing
// id and does not grow the bank.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::imageops::FilterType;
use image::RgbImage;
use tracing::{debug, warn};

use crate::error::TemplateError;

/// Content-addressed template identity (FNV-1a 64 over decoded pixels).
pub type TemplateId = u64;

/// One scale variant of a template, tightly packed.
#[derive(Debug, Clone)]
pub struct TemplateVariant {
    pub scale: f32,
    pub width: u32,
    pub height: u32,
    /// 3 bytes per pixel, B-G-R order (matching capture frames).
    pub bgr: Vec<u8>,
    /// 1 byte per pixel, Rec.601 luma.
    pub gray: Vec<u8>,
}

/// A loaded template with its pyramid.
#[derive(Debug)]
pub struct Template {
    pub id: TemplateId,
    pub path: PathBuf,
    /// Native (scale 1.0) size.
    pub width: u32,
    pub height: u32,
    /// Variants in configured scale order, duplicates removed.
    pub variants: Vec<TemplateVariant>,
}

/// Ordered bank of templates. Match order is load order.
pub struct TemplateBank {
    scales: Vec<f32>,
    templates: Vec<Arc<Template>>,
    by_id: HashMap<TemplateId, usize>,
}

impl TemplateBank {
    /// `scales` is the pyramid ratio list (deduplicated, order kept).
    pub fn new(scales: &[f32]) -> Self {
        let mut dedup: Vec<f32> = Vec::new();
        for &s in scales {
            if s > 0.0 && !dedup.iter().any(|&d| (d - s).abs() < f32::EPSILON) {
                dedup.push(s);
            }
        }
        if dedup.is_empty() {
            dedup.push(1.0);
        }
        Self {
            scales: dedup,
            templates: Vec::new(),
            by_id: HashMap::new(),
        }
    }

    /// Decode a template and build its variants. A duplicate (same
    /// decoded bytes) returns the existing id without growing the bank.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<TemplateId, TemplateError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| TemplateError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let decoded = image::load_from_memory(&bytes)
            .map_err(|e| TemplateError::BadTemplate {
                path: path.display().to_string(),
                detail: e.to_string(),
            })?
            .to_rgb8();

        if decoded.width() == 0 || decoded.height() == 0 {
            return Err(TemplateError::BadTemplate {
                path: path.display().to_string(),
                detail: "zero-area image".into(),
            });
        }

        let id = fnv1a64(decoded.as_raw(), decoded.width(), decoded.height());
        if let Some(&idx) = self.by_id.get(&id) {
            debug!(path = %path.display(), id, "duplicate template, reusing");
            return Ok(self.templates[idx].id);
        }

        let mut variants = Vec::with_capacity(self.scales.len());
        for &scale in &self.scales {
            match build_variant(&decoded, scale) {
                Some(v) => variants.push(v),
                None => {
                    warn!(
                        path = %path.display(),
                        scale,
                        "scale collapses template to zero area, skipping variant"
                    );
                }
            }
        }
        if variants.is_empty() {
            return Err(TemplateError::BadTemplate {
                path: path.display().to_string(),
                detail: "no usable scale variant".into(),
            });
        }

        let template = Arc::new(Template {
            id,
            path: path.to_path_buf(),
            width: decoded.width(),
            height: decoded.height(),
            variants,
        });
        self.by_id.insert(id, self.templates.len());
        self.templates.push(template);
        Ok(id)
    }

    /// Re-decode every template from its source path. Templates whose
    /// files went bad are dropped with a warning; the remainder keeps
    /// the original order.
    pub fn reload_all(&mut self) {
        let paths: Vec<PathBuf> = self.templates.iter().map(|t| t.path.clone()).collect();
        self.templates.clear();
        self.by_id.clear();
        for path in paths {
            if let Err(e) = self.load(&path) {
                warn!(error = %e, "dropping template on reload");
            }
        }
    }

    pub fn get(&self, id: TemplateId) -> Option<Arc<Template>> {
        self.by_id
            .get(&id)
            .map(|&idx| Arc::clone(&self.templates[idx]))
    }

    /// Templates in match (load) order.
    pub fn templates(&self) -> &[Arc<Template>] {
        &self.templates
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

fn build_variant(native: &RgbImage, scale: f32) -> Option<TemplateVariant> {
    let scaled = if (scale - 1.0).abs() < f32::EPSILON {
        native.clone()
    } else {
        let w = (native.width() as f32 * scale).round() as u32;
        let h = (native.height() as f32 * scale).round() as u32;
        if w == 0 || h == 0 {
            return None;
        }
        image::imageops::resize(native, w, h, FilterType::Triangle)
    };

    let (width, height) = (scaled.width(), scaled.height());
    let mut bgr = Vec::with_capacity((width * height * 3) as usize);
    let mut gray = Vec::with_capacity((width * height) as usize);
    for px in scaled.pixels() {
        let [r, g, b] = px.0;
        bgr.extend_from_slice(&[b, g, r]);
        gray.push(luma(r, g, b));
    }

    Some(TemplateVariant {
        scale,
        width,
        height,
        bgr,
        gray,
    })
}

/// Rec.601 integer luma, matching the matcher's frame conversion.
pub(crate) fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((299 * r as u32 + 587 * g as u32 + 114 * b as u32) / 1000) as u8
}

fn fnv1a64(pixels: &[u8], width: u32, height: u32) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for chunk in [&width.to_le_bytes()[..], &height.to_le_bytes()[..]] {
        for &b in chunk {
            hash ^= b as u64;
            hash = hash.wrapping_mul(PRIME);
        }
    }
    for &b in pixels {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}
