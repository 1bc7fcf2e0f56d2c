// Normalized cross-correlation template matching over a frame ROI.
//
// Scores are zero-mean NCC (the TM_CCOEFF_NORMED family): window
// statistics come from integral images, the numerator is a direct dot
// product against the zero-meaned template, so each (template, scale)
// pair costs O(roi_area * template_area). Frames are read row-wise
// through `Frame::row`, which keeps the matcher correct on any row
// pitch.
//
// Multi-template: templates are evaluated in configuration order with
// early exit: the first qualifying template wins the tick.
// Multi-scale: all scales of one template are evaluated and the best
// score wins; ties prefer the scale closest to native, then the
// top-left-most location.

use std::sync::Arc;
use std::time::Instant;

use crate::capture::frame::Frame;
use crate::config::Roi;
use crate::template::{Template, TemplateId, TemplateVariant};

/// Windows with variance below this are flat (score undefined → 0).
const VARIANCE_EPSILON: f64 = 1e-6;

/// A qualifying match in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchResult {
    pub template_id: TemplateId,
    /// Center of the matched region, frame coordinates.
    pub center: (i32, i32),
    /// NCC score in [0, 1].
    pub score: f32,
    pub scale: f32,
    pub timestamp: Instant,
}

/// Matcher configuration distilled from the config document.
#[derive(Debug, Clone, Copy)]
pub struct MatchSettings {
    pub threshold: f32,
    pub grayscale: bool,
}

pub struct Matcher {
    settings: MatchSettings,
}

impl Matcher {
    pub fn new(settings: MatchSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> MatchSettings {
        self.settings
    }

    /// Evaluate templates in order against the frame ROI and return the
    /// first qualifying match. A frame smaller than every variant is a
    /// non-match, not an error.
    pub fn find_first(
        &self,
        frame: &Frame,
        templates: &[Arc<Template>],
        roi: Roi,
    ) -> Option<MatchResult> {
        let region = clip_roi(frame, roi)?;
        let planes = extract_planes(frame, region, self.settings.grayscale);
        let integrals: Vec<Integral> = planes.iter().map(Integral::build).collect();

        for template in templates {
            if let Some(m) = self.match_template(template, &planes, &integrals, region) {
                if m.score >= self.settings.threshold {
                    return Some(m);
                }
            }
        }
        None
    }

    /// Best (score-wise) placement of one template across its scales.
    fn match_template(
        &self,
        template: &Template,
        planes: &[Plane],
        integrals: &[Integral],
        region: Region,
    ) -> Option<MatchResult> {
        let mut best: Option<(f32, f32, (usize, usize), &TemplateVariant)> = None;

        for variant in &template.variants {
            let Some((x, y, score)) = match_variant(variant, planes, integrals, self.settings)
            else {
                continue;
            };

            let replace = match best {
                None => true,
                Some((best_score, best_scale, _, _)) => {
                    score > best_score
                        || (score == best_score
                            && (1.0 - variant.scale).abs() < (1.0 - best_scale).abs())
                }
            };
            if replace {
                best = Some((score, variant.scale, (x, y), variant));
            }
        }

        let (score, scale, (x, y), variant) = best?;
        Some(MatchResult {
            template_id: template.id,
            center: (
                region.x + x as i32 + variant.width as i32 / 2,
                region.y + y as i32 + variant.height as i32 / 2,
            ),
            score,
            scale,
            timestamp: Instant::now(),
        })
    }
}

// ---------------------------------------------------------------------------
// Region / plane extraction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Region {
    x: i32,
    y: i32,
    w: usize,
    h: usize,
}

/// Clip the configured ROI to the frame. Zero width or height selects
/// the whole frame; a ROI fully outside the frame yields None.
fn clip_roi(frame: &Frame, roi: Roi) -> Option<Region> {
    if roi.is_full_frame() {
        return Some(Region {
            x: 0,
            y: 0,
            w: frame.width as usize,
            h: frame.height as usize,
        });
    }
    let x0 = roi.x.max(0);
    let y0 = roi.y.max(0);
    let x1 = (roi.x + roi.w as i32).min(frame.width as i32);
    let y1 = (roi.y + roi.h as i32).min(frame.height as i32);
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some(Region {
        x: x0,
        y: y0,
        w: (x1 - x0) as usize,
        h: (y1 - y0) as usize,
    })
}

struct Plane {
    w: usize,
    h: usize,
    data: Vec<f32>,
}

/// Extract matching planes from the frame region: one luma plane, or
/// B, G, R planes for color matching. Rows are accessed through
/// `Frame::row` so pitch padding is never read.
fn extract_planes(frame: &Frame, region: Region, grayscale: bool) -> Vec<Plane> {
    let bpp = frame.bytes_per_pixel();
    let plane_count = if grayscale { 1 } else { 3 };
    let mut planes: Vec<Plane> = (0..plane_count)
        .map(|_| Plane {
            w: region.w,
            h: region.h,
            data: vec![0.0; region.w * region.h],
        })
        .collect();

    for row in 0..region.h {
        let src = frame.row((region.y as usize + row) as u32);
        let base = row * region.w;
        for col in 0..region.w {
            let px = &src[(region.x as usize + col) * bpp..];
            let (b, g, r) = (px[0], px[1], px[2]);
            if grayscale {
                planes[0].data[base + col] = crate::template::luma(r, g, b) as f32;
            } else {
                planes[0].data[base + col] = b as f32;
                planes[1].data[base + col] = g as f32;
                planes[2].data[base + col] = r as f32;
            }
        }
    }
    planes
}

/// Summed-area tables of values and squares, (w+1)×(h+1).
struct Integral {
    w: usize,
    sum: Vec<f64>,
    sumsq: Vec<f64>,
}

impl Integral {
    fn build(plane: &Plane) -> Self {
        let (w, h) = (plane.w, plane.h);
        let stride = w + 1;
        let mut sum = vec![0.0f64; stride * (h + 1)];
        let mut sumsq = vec![0.0f64; stride * (h + 1)];
        for y in 0..h {
            let mut row_sum = 0.0f64;
            let mut row_sq = 0.0f64;
            for x in 0..w {
                let v = plane.data[y * w + x] as f64;
                row_sum += v;
                row_sq += v * v;
                sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row_sum;
                sumsq[(y + 1) * stride + x + 1] = sumsq[y * stride + x + 1] + row_sq;
            }
        }
        Self { w, sum, sumsq }
    }

    /// (Σv, Σv²) over the window at (x, y) with size (tw, th).
    fn window(&self, x: usize, y: usize, tw: usize, th: usize) -> (f64, f64) {
        let stride = self.w + 1;
        let (x1, y1) = (x + tw, y + th);
        let s = self.sum[y1 * stride + x1] + self.sum[y * stride + x]
            - self.sum[y * stride + x1]
            - self.sum[y1 * stride + x];
        let q = self.sumsq[y1 * stride + x1] + self.sumsq[y * stride + x]
            - self.sumsq[y * stride + x1]
            - self.sumsq[y1 * stride + x];
        (s, q)
    }
}

// ---------------------------------------------------------------------------
// Per-variant correlation
// ---------------------------------------------------------------------------

/// Zero-meaned template planes plus their summed variance.
struct PreparedTemplate {
    planes: Vec<Vec<f32>>,
    variance: f64,
}

fn prepare_template(variant: &TemplateVariant, grayscale: bool) -> PreparedTemplate {
    let n = (variant.width * variant.height) as usize;
    let sources: Vec<Vec<f32>> = if grayscale {
        vec![variant.gray.iter().map(|&v| v as f32).collect()]
    } else {
        // Split interleaved BGR into planes.
        let mut b = Vec::with_capacity(n);
        let mut g = Vec::with_capacity(n);
        let mut r = Vec::with_capacity(n);
        for px in variant.bgr.chunks_exact(3) {
            b.push(px[0] as f32);
            g.push(px[1] as f32);
            r.push(px[2] as f32);
        }
        vec![b, g, r]
    };

    let mut planes = Vec::with_capacity(sources.len());
    let mut variance = 0.0f64;
    for src in sources {
        let mean = src.iter().map(|&v| v as f64).sum::<f64>() / n as f64;
        let centered: Vec<f32> = src.iter().map(|&v| (v as f64 - mean) as f32).collect();
        variance += centered.iter().map(|&v| (v as f64) * (v as f64)).sum::<f64>();
        planes.push(centered);
    }

    PreparedTemplate { planes, variance }
}

/// Best placement of one variant. Row-major scan keeps the first of
/// equal scores, which is the top-left-most location.
fn match_variant(
    variant: &TemplateVariant,
    planes: &[Plane],
    integrals: &[Integral],
    settings: MatchSettings,
) -> Option<(usize, usize, f32)> {
    let region_w = planes[0].w;
    let region_h = planes[0].h;
    let tw = variant.width as usize;
    let th = variant.height as usize;
    if tw > region_w || th > region_h || tw == 0 || th == 0 {
        return None;
    }

    let prepared = prepare_template(variant, settings.grayscale);
    if prepared.variance < VARIANCE_EPSILON {
        // Flat template: correlation is undefined everywhere.
        return None;
    }
    let n = (tw * th) as f64;

    let mut best: Option<(usize, usize, f32)> = None;
    for y in 0..=(region_h - th) {
        for x in 0..=(region_w - tw) {
            let mut window_var = 0.0f64;
            for integral in integrals {
                let (s, q) = integral.window(x, y, tw, th);
                window_var += q - s * s / n;
            }
            if window_var < VARIANCE_EPSILON {
                continue;
            }

            // Numerator: Σ w·t' per plane. Since Σ t' = 0, this equals
            // Σ (w − w̄)(t − t̄) without centering the window.
            let mut numerator = 0.0f64;
            for (plane, tplane) in planes.iter().zip(&prepared.planes) {
                for ty in 0..th {
                    let wrow = &plane.data[(y + ty) * region_w + x..][..tw];
                    let trow = &tplane[ty * tw..][..tw];
                    let mut acc = 0.0f32;
                    for (wv, tv) in wrow.iter().zip(trow) {
                        acc += wv * tv;
                    }
                    numerator += acc as f64;
                }
            }

            let score = (numerator / (window_var * prepared.variance).sqrt()) as f32;
            let score = score.clamp(-1.0, 1.0);
            if best.map_or(true, |(_, _, b)| score > b) {
                best = Some((x, y, score));
            }
        }
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::PixelFormat;
    use std::path::PathBuf;

    /// Build a BGRA frame from a per-pixel gray-value function.
    fn gray_frame(w: u32, h: u32, f: impl Fn(u32, u32) -> u8) -> Frame {
        let mut data = Vec::with_capacity((w * h * 4) as usize);
        for y in 0..h {
            for x in 0..w {
                let v = f(x, y);
                data.extend_from_slice(&[v, v, v, 255]);
            }
        }
        Frame::from_tight(w, h, PixelFormat::Bgra8, data)
    }

    /// Template whose gray plane is given by `f` (BGR kept consistent).
    fn gray_template(id: TemplateId, w: u32, h: u32, f: impl Fn(u32, u32) -> u8) -> Arc<Template> {
        Arc::new(Template {
            id,
            path: PathBuf::from("test.png"),
            width: w,
            height: h,
            variants: vec![gray_variant(w, h, 1.0, &f)],
        })
    }

    fn gray_variant(w: u32, h: u32, scale: f32, f: &impl Fn(u32, u32) -> u8) -> TemplateVariant {
        let mut bgr = Vec::new();
        let mut gray = Vec::new();
        for y in 0..h {
            for x in 0..w {
                let v = f(x, y);
                bgr.extend_from_slice(&[v, v, v]);
                gray.push(v);
            }
        }
        TemplateVariant {
            scale,
            width: w,
            height: h,
            bgr,
            gray,
        }
    }

    /// A distinctive 4x4 pattern embedded at (off_x, off_y).
    fn pattern(x: u32, y: u32) -> u8 {
        ((x * 61 + y * 97) % 200) as u8 + 20
    }

    fn frame_with_pattern(w: u32, h: u32, off_x: u32, off_y: u32) -> Frame {
        gray_frame(w, h, |x, y| {
            if x >= off_x && x < off_x + 4 && y >= off_y && y < off_y + 4 {
                pattern(x - off_x, y - off_y)
            } else {
                10
            }
        })
    }

    fn matcher(threshold: f32) -> Matcher {
        Matcher::new(MatchSettings {
            threshold,
            grayscale: true,
        })
    }

    #[test]
    fn test_exact_match_scores_one() {
        let frame = frame_with_pattern(16, 12, 5, 3);
        let template = gray_template(1, 4, 4, pattern);

        let m = matcher(0.9)
            .find_first(&frame, &[template], Roi::default())
            .expect("exact pattern must match");
        assert!(m.score > 0.99, "score {}", m.score);
        // Center of a 4x4 block at (5, 3) is (5+2, 3+2).
        assert_eq!(m.center, (7, 5));
        assert_eq!(m.scale, 1.0);
    }

    #[test]
    fn test_threshold_gates_weak_matches() {
        let frame = frame_with_pattern(16, 12, 5, 3);
        // A different pattern correlates poorly.
        let template = gray_template(1, 4, 4, |x, y| pattern(3 - x, 3 - y));
        assert!(matcher(0.95)
            .find_first(&frame, &[template], Roi::default())
            .is_none());
    }

    #[test]
    fn test_roi_zero_equals_full_frame() {
        let frame = frame_with_pattern(20, 20, 9, 11);
        let template = gray_template(1, 4, 4, pattern);
        let m = matcher(0.9);

        let full = m
            .find_first(&frame, std::slice::from_ref(&template), Roi::default())
            .unwrap();
        let explicit = m
            .find_first(
                &frame,
                std::slice::from_ref(&template),
                Roi {
                    x: 0,
                    y: 0,
                    w: 20,
                    h: 20,
                },
            )
            .unwrap();
        assert_eq!(full.center, explicit.center);
        assert_eq!(full.score, explicit.score);
    }

    #[test]
    fn test_roi_offsets_back_to_frame_coords() {
        let frame = frame_with_pattern(32, 24, 10, 8);
        let template = gray_template(1, 4, 4, pattern);

        let m = matcher(0.9)
            .find_first(
                &frame,
                &[template],
                Roi {
                    x: 8,
                    y: 6,
                    w: 12,
                    h: 10,
                },
            )
            .unwrap();
        // Same frame coordinates as a full-frame match.
        assert_eq!(m.center, (12, 10));
    }

    #[test]
    fn test_roi_excluding_pattern_misses() {
        let frame = frame_with_pattern(32, 24, 10, 8);
        let template = gray_template(1, 4, 4, pattern);
        assert!(matcher(0.9)
            .find_first(
                &frame,
                &[template],
                Roi {
                    x: 20,
                    y: 0,
                    w: 12,
                    h: 24
                }
            )
            .is_none());
    }

    #[test]
    fn test_frame_too_small_is_non_match() {
        let frame = gray_frame(3, 3, |_, _| 50);
        let template = gray_template(1, 4, 4, pattern);
        assert!(matcher(0.5)
            .find_first(&frame, &[template], Roi::default())
            .is_none());
    }

    #[test]
    fn test_flat_window_scores_zero_not_nan() {
        // Uniform frame: every window is degenerate; a structured
        // template must not match.
        let frame = gray_frame(10, 10, |_, _| 128);
        let template = gray_template(1, 4, 4, pattern);
        assert!(matcher(0.1)
            .find_first(&frame, &[template], Roi::default())
            .is_none());
    }

    #[test]
    fn test_first_template_wins() {
        let frame = frame_with_pattern(16, 12, 5, 3);
        let first = gray_template(1, 4, 4, pattern);
        let second = gray_template(2, 4, 4, pattern);

        let m = matcher(0.9)
            .find_first(&frame, &[first, second], Roi::default())
            .unwrap();
        assert_eq!(m.template_id, 1);
    }

    #[test]
    fn test_strided_frame_matches_like_tight() {
        // The pitch-shear property: a frame built from a padded stride
        // must match identically to the tight-packed equivalent.
        let tight = frame_with_pattern(10, 8, 4, 2);
        let row_bytes = 10 * 4;
        let pitch = row_bytes + 24;
        let mut strided = vec![0xEEu8; pitch * 8];
        for y in 0..8u32 {
            strided[y as usize * pitch..y as usize * pitch + row_bytes]
                .copy_from_slice(tight.row(y));
        }
        let sheared = Frame::from_strided(10, 8, PixelFormat::Bgra8, &strided, pitch);

        let template = gray_template(1, 4, 4, pattern);
        let m = matcher(0.9);
        let a = m
            .find_first(&tight, std::slice::from_ref(&template), Roi::default())
            .unwrap();
        let b = m
            .find_first(&sheared, std::slice::from_ref(&template), Roi::default())
            .unwrap();
        assert_eq!(a.center, b.center);
        assert_eq!(a.score, b.score);
    }

    #[test]
    fn test_multi_scale_prefers_best_score() {
        // Frame contains the pattern magnified 2x (nearest-neighbor);
        // the 2.0-scale variant should win over the native one.
        let frame = gray_frame(24, 20, |x, y| {
            if (4..12).contains(&x) && (6..14).contains(&y) {
                pattern((x - 4) / 2, (y - 6) / 2)
            } else {
                10
            }
        });
        let scaled = TemplateVariant {
            scale: 2.0,
            ..gray_variant(8, 8, 2.0, &|x, y| pattern(x / 2, y / 2))
        };
        let template = Arc::new(Template {
            id: 7,
            path: PathBuf::from("test.png"),
            width: 4,
            height: 4,
            variants: vec![gray_variant(4, 4, 1.0, &pattern), scaled],
        });

        let m = matcher(0.9)
            .find_first(&frame, &[template], Roi::default())
            .unwrap();
        assert_eq!(m.scale, 2.0);
        assert_eq!(m.center, (8, 10));
    }

    #[test]
    fn test_color_matching_finds_exact_color_block() {
        // Gray background with a colored 2x2 block at (3, 4):
        // red, green / blue, white (BGRA in the frame).
        let block: [[u8; 4]; 4] = [
            [0, 0, 255, 255],
            [0, 255, 0, 255],
            [255, 0, 0, 255],
            [255, 255, 255, 255],
        ];
        let mut data = Vec::new();
        for y in 0..10u32 {
            for x in 0..10u32 {
                if (3..5).contains(&x) && (4..6).contains(&y) {
                    let idx = ((y - 4) * 2 + (x - 3)) as usize;
                    data.extend_from_slice(&block[idx]);
                } else {
                    data.extend_from_slice(&[90, 90, 90, 255]);
                }
            }
        }
        let frame = Frame::from_tight(10, 10, PixelFormat::Bgra8, data);

        // Same block as a BGR template.
        let bgr: Vec<u8> = block.iter().flat_map(|px| px[..3].to_vec()).collect();
        let gray: Vec<u8> = block.iter().map(|px| luma_bgra(px)).collect();
        let template = Arc::new(Template {
            id: 3,
            path: PathBuf::from("test.png"),
            width: 2,
            height: 2,
            variants: vec![TemplateVariant {
                scale: 1.0,
                width: 2,
                height: 2,
                bgr,
                gray,
            }],
        });

        let color_matcher = Matcher::new(MatchSettings {
            threshold: 0.95,
            grayscale: false,
        });
        let m = color_matcher
            .find_first(&frame, &[template], Roi::default())
            .expect("exact color block must match");
        assert!(m.score > 0.99, "score {}", m.score);
        assert_eq!(m.center, (4, 5));
    }

    fn luma_bgra(px: &[u8; 4]) -> u8 {
        crate::template::luma(px[2], px[1], px[0])
    }
}
