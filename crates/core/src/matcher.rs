//! Template matching.
//!
//! [`MatchPrimitive`] is the raw "find this image in that region" capability.
//! [`TemplateMatcher`] wraps it with descriptor handling: region resolution
//! and the threshold rule (below threshold is "not found", never a weak hit).

use std::sync::Arc;

use image::GrayImage;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::template::{MatchPolicy, TemplateDescriptor, TemplateImage};
use crate::types::{Frame, Point, Rect};

/// Raw hit reported by a primitive, in haystack coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawMatch {
    pub x: u32,
    pub y: u32,
    pub confidence: f32,
}

pub trait MatchPrimitive: Send + Sync {
    /// Search `region` of `haystack` for `needle`. `region` is already
    /// clipped to the haystack and at least as large as the needle.
    fn locate(
        &self,
        haystack: &GrayImage,
        needle: &TemplateImage,
        region: Rect,
        policy: MatchPolicy,
        threshold: f32,
    ) -> Option<RawMatch>;
}

/// Confirmed match of a descriptor inside a frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Match {
    pub top_left: Point,
    pub center: Point,
    pub width: u32,
    pub height: u32,
    pub confidence: f32,
}

/// Descriptor-aware wrapper over a [`MatchPrimitive`]. Holds no state
/// besides the primitive, so results depend only on the inputs.
#[derive(Clone)]
pub struct TemplateMatcher {
    primitive: Arc<dyn MatchPrimitive>,
}

impl TemplateMatcher {
    pub fn new(primitive: Arc<dyn MatchPrimitive>) -> Self {
        Self { primitive }
    }

    /// Look for `template` in `frame`, optionally narrowed to `within`.
    pub fn find(&self, frame: &Frame, template: &TemplateDescriptor, within: Option<Rect>) -> Option<Match> {
        let image = &template.image;
        let region = self.search_region(frame, template, within)?;
        let raw = self.primitive.locate(frame.image(), image, region, template.policy, template.threshold)?;
        if raw.confidence < template.threshold {
            return None;
        }
        let top_left = Point::new(raw.x as i32, raw.y as i32);
        Some(Match {
            top_left,
            center: top_left.offset((image.width() / 2) as i32, (image.height() / 2) as i32),
            width: image.width(),
            height: image.height(),
            confidence: raw.confidence,
        })
    }

    fn search_region(&self, frame: &Frame, template: &TemplateDescriptor, within: Option<Rect>) -> Option<Rect> {
        let (tw, th) = template.image.pixels.dimensions();
        let bounds = frame.bounds();
        if bounds.w < tw || bounds.h < th {
            return None;
        }
        let fits = |r: &Rect| r.fits_within(bounds.w, bounds.h) && r.w >= tw && r.h >= th;

        let roi = if template.roi.is_empty() {
            bounds
        } else if fits(&template.roi) {
            template.roi
        } else {
            tracing::debug!(
                target: "matcher",
                template = %template.id,
                roi = ?template.roi,
                "roi unusable for this frame, searching whole frame"
            );
            bounds
        };

        match within {
            None => Some(roi),
            Some(extra) => roi.intersect(&extra).filter(|r| r.w >= tw && r.h >= th),
        }
    }
}

/// Zero-mean normalized cross-correlation (the `CCOEFF_NORMED` score),
/// honouring template masks. Scores lie in [-1, 1].
#[derive(Debug, Clone, Copy, Default)]
pub struct NccPrimitive;

struct Prepared {
    /// (dx, dy, zero-mean template value) for every compared pixel.
    taps: Vec<(u32, u32, f64)>,
    template_mean: f64,
    template_energy: f64,
}

impl Prepared {
    fn new(needle: &TemplateImage) -> Self {
        let mut raw = Vec::new();
        for (x, y, p) in needle.pixels.enumerate_pixels() {
            let compared = needle.mask.as_ref().map_or(true, |m| m.get_pixel(x, y)[0] > 0);
            if compared {
                raw.push((x, y, p[0] as f64));
            }
        }
        let n = raw.len().max(1) as f64;
        let template_mean = raw.iter().map(|t| t.2).sum::<f64>() / n;
        let taps: Vec<_> = raw.into_iter().map(|(x, y, v)| (x, y, v - template_mean)).collect();
        let template_energy = taps.iter().map(|t| t.2 * t.2).sum();
        Self { taps, template_mean, template_energy }
    }

    fn score(&self, haystack: &GrayImage, x0: u32, y0: u32) -> f64 {
        if self.taps.is_empty() {
            return 0.0;
        }
        let n = self.taps.len() as f64;
        let (mut sum, mut sum_sq, mut cross) = (0.0, 0.0, 0.0);
        for &(dx, dy, t) in &self.taps {
            let v = haystack.get_pixel(x0 + dx, y0 + dy)[0] as f64;
            sum += v;
            sum_sq += v * v;
            cross += t * v;
        }
        let mean = sum / n;
        let variance = (sum_sq - n * mean * mean).max(0.0);
        const FLAT: f64 = 1e-6;
        if self.template_energy < FLAT {
            // Flat template: only a flat window of the same brightness matches.
            return if variance < FLAT { 1.0 - (mean - self.template_mean).abs() / 255.0 } else { 0.0 };
        }
        if variance < FLAT {
            return 0.0;
        }
        cross / (self.template_energy * variance).sqrt()
    }

    fn best_in_row(&self, haystack: &GrayImage, y: u32, xs: std::ops::Range<u32>) -> Option<RawMatch> {
        xs.map(|x| RawMatch { x, y, confidence: self.score(haystack, x, y) as f32 })
            .fold(None, |best: Option<RawMatch>, m| match best {
                Some(b) if b.confidence >= m.confidence => Some(b),
                _ => Some(m),
            })
    }

    fn first_in_row(&self, haystack: &GrayImage, y: u32, xs: std::ops::Range<u32>, threshold: f32) -> Option<RawMatch> {
        xs.map(|x| RawMatch { x, y, confidence: self.score(haystack, x, y) as f32 })
            .find(|m| m.confidence >= threshold)
    }
}

impl MatchPrimitive for NccPrimitive {
    fn locate(
        &self,
        haystack: &GrayImage,
        needle: &TemplateImage,
        region: Rect,
        policy: MatchPolicy,
        threshold: f32,
    ) -> Option<RawMatch> {
        let (tw, th) = needle.pixels.dimensions();
        if region.w < tw || region.h < th {
            return None;
        }
        let prepared = Prepared::new(needle);
        let xs = region.x..region.right() - tw + 1;
        let ys = region.y..region.bottom() - th + 1;

        #[cfg(feature = "parallel")]
        let hit = match policy {
            MatchPolicy::First => ys
                .into_par_iter()
                .find_map_first(|y| prepared.first_in_row(haystack, y, xs.clone(), threshold)),
            MatchPolicy::Best => ys
                .into_par_iter()
                .filter_map(|y| prepared.best_in_row(haystack, y, xs.clone()))
                .reduce_with(|a, b| if b.confidence > a.confidence { b } else { a }),
        };

        #[cfg(not(feature = "parallel"))]
        let hit = match policy {
            MatchPolicy::First => ys
                .into_iter()
                .find_map(|y| prepared.first_in_row(haystack, y, xs.clone(), threshold)),
            MatchPolicy::Best => ys
                .filter_map(|y| prepared.best_in_row(haystack, y, xs.clone()))
                .fold(None, |best: Option<RawMatch>, m| match best {
                    Some(b) if b.confidence >= m.confidence => Some(b),
                    _ => Some(m),
                }),
        };

        hit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    /// Deterministic pseudo-random background.
    fn noise(w: u32, h: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| {
            let mut v = x.wrapping_mul(73_856_093) ^ y.wrapping_mul(19_349_663);
            v ^= v >> 13;
            v = v.wrapping_mul(0x5bd1_e995);
            v ^= v >> 15;
            Luma([(v & 0xff) as u8])
        })
    }

    fn crop(img: &GrayImage, r: Rect) -> GrayImage {
        image::imageops::crop_imm(img, r.x, r.y, r.w, r.h).to_image()
    }

    fn descriptor(image: TemplateImage, roi: Rect, threshold: f32) -> TemplateDescriptor {
        TemplateDescriptor { id: image.name.clone(), image, roi, threshold, policy: MatchPolicy::Best }
    }

    #[test]
    fn finds_exact_crop_with_full_confidence() {
        let screen = noise(80, 60);
        let needle = TemplateImage::new("patch", crop(&screen, Rect::new(30, 20, 8, 6)));
        let matcher = TemplateMatcher::new(Arc::new(NccPrimitive));
        let frame = Frame::new(screen, 0);

        let hit = matcher.find(&frame, &descriptor(needle, Rect::default(), 0.95), None).unwrap();
        assert_eq!(hit.top_left, Point::new(30, 20));
        assert_eq!(hit.center, Point::new(34, 23));
        assert!(hit.confidence > 0.999);
    }

    #[test]
    fn roi_excluding_the_feature_reports_not_found() {
        let screen = noise(80, 60);
        let needle = TemplateImage::new("patch", crop(&screen, Rect::new(50, 40, 8, 6)));
        let matcher = TemplateMatcher::new(Arc::new(NccPrimitive));
        let frame = Frame::new(screen, 0);

        let desc = descriptor(needle, Rect::new(0, 0, 40, 30), 0.95);
        assert!(matcher.find(&frame, &desc, None).is_none());
    }

    #[test]
    fn far_out_roi_falls_back_without_panicking() {
        let screen = noise(40, 30);
        let needle = TemplateImage::new("patch", crop(&screen, Rect::new(5, 5, 6, 6)));
        let matcher = TemplateMatcher::new(Arc::new(NccPrimitive));
        let desc = descriptor(needle, Rect::new(u32::MAX - 3, 0, 10, 10), 0.95);
        let hit = matcher.find(&Frame::new(screen, 0), &desc, None).unwrap();
        assert_eq!(hit.top_left, Point::new(5, 5));
    }

    #[test]
    fn extra_region_narrows_the_search() {
        let screen = noise(80, 60);
        let needle = TemplateImage::new("patch", crop(&screen, Rect::new(10, 10, 6, 6)));
        let matcher = TemplateMatcher::new(Arc::new(NccPrimitive));
        let frame = Frame::new(screen, 0);
        let desc = descriptor(needle, Rect::default(), 0.95);

        assert!(matcher.find(&frame, &desc, Some(Rect::new(0, 0, 30, 30))).is_some());
        assert!(matcher.find(&frame, &desc, Some(Rect::new(40, 30, 40, 30))).is_none());
    }

    #[test]
    fn masked_pixels_are_ignored() {
        let screen = noise(40, 40);
        let mut pixels = crop(&screen, Rect::new(12, 12, 6, 6));
        // Corrupt one corner of the template and mask it out.
        let mut mask = GrayImage::from_pixel(6, 6, Luma([255]));
        for y in 0..3 {
            for x in 0..3 {
                pixels.put_pixel(x, y, Luma([255]));
                mask.put_pixel(x, y, Luma([0]));
            }
        }
        let needle = TemplateImage::new("masked", pixels).with_mask(mask).unwrap();
        let matcher = TemplateMatcher::new(Arc::new(NccPrimitive));
        let hit = matcher
            .find(&Frame::new(screen, 0), &descriptor(needle, Rect::default(), 0.99), None)
            .unwrap();
        assert_eq!(hit.top_left, Point::new(12, 12));
    }

    #[test]
    fn below_threshold_is_not_found() {
        struct Weak;
        impl MatchPrimitive for Weak {
            fn locate(&self, _: &GrayImage, _: &TemplateImage, _: Rect, _: MatchPolicy, _: f32) -> Option<RawMatch> {
                Some(RawMatch { x: 1, y: 1, confidence: 0.5 })
            }
        }
        let matcher = TemplateMatcher::new(Arc::new(Weak));
        let needle = TemplateImage::new("any", GrayImage::new(2, 2));
        let frame = Frame::new(GrayImage::new(10, 10), 0);
        assert!(matcher.find(&frame, &descriptor(needle, Rect::default(), 0.8), None).is_none());
    }

    #[test]
    fn template_larger_than_frame_is_not_found() {
        let matcher = TemplateMatcher::new(Arc::new(NccPrimitive));
        let needle = TemplateImage::new("big", GrayImage::new(20, 20));
        let frame = Frame::new(GrayImage::new(10, 10), 0);
        assert!(matcher.find(&frame, &descriptor(needle, Rect::default(), 0.1), None).is_none());
    }

    #[test]
    fn first_policy_stops_at_first_hit_in_scan_order() {
        // Two identical flat patches on a textured background.
        let mut screen = noise(60, 40);
        for (ox, oy) in [(40, 5), (5, 25)] {
            for y in 0..4 {
                for x in 0..4 {
                    screen.put_pixel(ox + x, oy + y, Luma([250]));
                }
            }
        }
        let needle = TemplateImage::new("flat", GrayImage::from_pixel(4, 4, Luma([250])));
        let mut desc = descriptor(needle, Rect::default(), 0.99);
        desc.policy = MatchPolicy::First;
        let matcher = TemplateMatcher::new(Arc::new(NccPrimitive));
        let hit = matcher.find(&Frame::new(screen, 0), &desc, None).unwrap();
        assert_eq!(hit.top_left, Point::new(40, 5));
    }
}
