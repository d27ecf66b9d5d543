//! Haar-like cascade classifier.
//!
//! Evaluates a boosted cascade of decision stumps over rectangle features on
//! an integral image, scans the image at multiple window scales, and merges
//! overlapping raw hits into face regions.
//!
//! Cascades load from this crate's JSON layout or from OpenCV's
//! `opencv-cascade-classifier` XML (see [`crate::opencv`]).

use crate::types::BoundingBox;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Classifier compiled into the binary.
const BUNDLED_FRONTALFACE: &str = include_str!("../cascades/frontalface_coarse.json");

/// Relative edge tolerance used when clustering raw hits.
pub const GROUP_EPS: f64 = 0.2;

const MAX_RECTS_PER_FEATURE: usize = 3;

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("cascade file not found: {0}")]
    NotFound(String),
    #[error("reading cascade: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing cascade: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("parsing OpenCV cascade: {0}")]
    Xml(#[from] quick_xml::DeError),
    #[error("invalid cascade: {0}")]
    Invalid(String),
}

/// Base detection window, in pixels.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct WindowSize {
    pub width: u32,
    pub height: u32,
}

/// Rectangle of a Haar-like feature, relative to the base window.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct WeightedRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub weight: f32,
}

/// Decision stump over a single rectangle feature.
#[derive(Debug, Clone, Deserialize)]
pub struct WeakClassifier {
    pub feature: Vec<WeightedRect>,
    pub threshold: f32,
    /// Contribution when the normalized feature value is below `threshold`.
    pub left: f32,
    pub right: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Stage {
    pub threshold: f32,
    pub classifiers: Vec<WeakClassifier>,
}

/// A cascade of boosted stages, deserialized from JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct HaarCascade {
    #[serde(default)]
    pub name: String,
    pub window: WindowSize,
    pub stages: Vec<Stage>,
}

impl HaarCascade {
    /// The frontal-face classifier shipped with the crate.
    pub fn bundled() -> Result<Self, CascadeError> {
        Self::from_json(BUNDLED_FRONTALFACE)
    }

    /// Load and validate a cascade file. `.xml` files are read as OpenCV
    /// cascades, anything else as JSON.
    pub fn from_path(path: &Path) -> Result<Self, CascadeError> {
        if !path.exists() {
            return Err(CascadeError::NotFound(path.display().to_string()));
        }
        let raw = std::fs::read_to_string(path)?;
        let is_xml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("xml"));
        let cascade = if is_xml {
            let name = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
            Self::from_opencv_xml(&raw, &name)?
        } else {
            Self::from_json(&raw)?
        };
        tracing::info!(
            path = %path.display(),
            name = %cascade.name,
            stages = cascade.stages.len(),
            "loaded cascade"
        );
        Ok(cascade)
    }

    /// Parse and validate a cascade from a JSON document.
    pub fn from_json(raw: &str) -> Result<Self, CascadeError> {
        let cascade: HaarCascade = serde_json::from_str(raw)?;
        cascade.validate()?;
        Ok(cascade)
    }

    /// Parse and validate an OpenCV `opencv-cascade-classifier` document.
    pub fn from_opencv_xml(raw: &str, name: &str) -> Result<Self, CascadeError> {
        let cascade = crate::opencv::parse(raw, name)?;
        cascade.validate()?;
        Ok(cascade)
    }

    /// Check structural invariants the evaluator relies on.
    pub fn validate(&self) -> Result<(), CascadeError> {
        let WindowSize { width, height } = self.window;
        if width == 0 || height == 0 {
            return Err(CascadeError::Invalid(format!("window must be non-empty, got {width}x{height}")));
        }
        if self.stages.is_empty() {
            return Err(CascadeError::Invalid("cascade has no stages".into()));
        }

        for (s, stage) in self.stages.iter().enumerate() {
            if stage.classifiers.is_empty() {
                return Err(CascadeError::Invalid(format!("stage {s} has no classifiers")));
            }
            if !stage.threshold.is_finite() {
                return Err(CascadeError::Invalid(format!("stage {s} threshold is not finite")));
            }
            for (c, weak) in stage.classifiers.iter().enumerate() {
                let n = weak.feature.len();
                if n == 0 || n > MAX_RECTS_PER_FEATURE {
                    return Err(CascadeError::Invalid(format!(
                        "stage {s} classifier {c}: feature must have 1..={MAX_RECTS_PER_FEATURE} rects, got {n}"
                    )));
                }
                if ![weak.threshold, weak.left, weak.right].iter().all(|v| v.is_finite()) {
                    return Err(CascadeError::Invalid(format!(
                        "stage {s} classifier {c}: non-finite threshold or leaf value"
                    )));
                }
                for r in &weak.feature {
                    let inside = r.x.checked_add(r.width).is_some_and(|right| right <= width)
                        && r.y.checked_add(r.height).is_some_and(|bottom| bottom <= height);
                    if r.width == 0 || r.height == 0 || !inside || !r.weight.is_finite() {
                        return Err(CascadeError::Invalid(format!(
                            "stage {s} classifier {c}: rect ({}, {}, {}, {}) is empty or outside the {width}x{height} window",
                            r.x, r.y, r.width, r.height
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Collect every window accepted by all stages.
    ///
    /// The window starts at the base size (or `min_size`, whichever is larger)
    /// and grows by `scale_factor` until it no longer fits the image. Windows
    /// step by two base pixels up to scale 2 and by one base pixel above it.
    /// `scale_factor` must exceed 1.
    pub(crate) fn scan(
        &self,
        image: &IntegralImage,
        scale_factor: f64,
        min_size: u32,
    ) -> Vec<BoundingBox> {
        let base_w = self.window.width as f64;
        let base_h = self.window.height as f64;
        let mut scale = (min_size as f64 / base_w.min(base_h)).max(1.0);
        let mut hits = Vec::new();

        loop {
            let scaled = ScaledCascade::new(self, scale);
            if scaled.width > image.width || scaled.height > image.height {
                break;
            }

            let base_step = if scale > 2.0 { scale } else { 2.0 * scale };
            let step = base_step.round().max(1.0) as u32;
            let before = hits.len();

            let mut y = 0;
            while y + scaled.height <= image.height {
                let mut x = 0;
                while x + scaled.width <= image.width {
                    if scaled.accepts(image, x, y) {
                        hits.push(BoundingBox {
                            x,
                            y,
                            width: scaled.width,
                            height: scaled.height,
                            neighbors: 1,
                        });
                    }
                    x += step;
                }
                y += step;
            }

            tracing::trace!(
                scale,
                window = scaled.width,
                step,
                hits = hits.len() - before,
                "scanned scale"
            );
            scale *= scale_factor;
        }

        hits
    }
}

/// Summed-area tables of pixel values and squared pixel values.
pub struct IntegralImage {
    width: u32,
    height: u32,
    sum: Vec<u64>,
    sq_sum: Vec<u64>,
}

impl IntegralImage {
    /// Build from row-major 8-bit intensities.
    pub fn new(pixels: &[u8], width: u32, height: u32) -> Self {
        let w = width as usize;
        let h = height as usize;
        let stride = w + 1;
        let mut sum = vec![0u64; stride * (h + 1)];
        let mut sq_sum = vec![0u64; stride * (h + 1)];

        for y in 0..h {
            let mut row = 0u64;
            let mut row_sq = 0u64;
            for x in 0..w {
                let p = pixels.get(y * w + x).copied().unwrap_or(0) as u64;
                row += p;
                row_sq += p * p;
                sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row;
                sq_sum[(y + 1) * stride + x + 1] = sq_sum[y * stride + x + 1] + row_sq;
            }
        }

        Self { width, height, sum, sq_sum }
    }

    /// Sum of pixels in the rectangle. The rectangle must lie inside the image.
    pub fn rect_sum(&self, x: u32, y: u32, width: u32, height: u32) -> u64 {
        Self::lookup(&self.sum, self.width, x, y, width, height)
    }

    /// Sum of squared pixels in the rectangle.
    pub fn rect_sq_sum(&self, x: u32, y: u32, width: u32, height: u32) -> u64 {
        Self::lookup(&self.sq_sum, self.width, x, y, width, height)
    }

    fn lookup(table: &[u64], image_width: u32, x: u32, y: u32, width: u32, height: u32) -> u64 {
        let stride = image_width as usize + 1;
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + width as usize, y0 + height as usize);
        table[y1 * stride + x1] + table[y0 * stride + x0]
            - table[y0 * stride + x1]
            - table[y1 * stride + x0]
    }
}

struct ScaledRect {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    weight: f64,
}

struct ScaledClassifier {
    rects: Vec<ScaledRect>,
    threshold: f64,
    left: f64,
    right: f64,
}

struct ScaledStage {
    threshold: f64,
    classifiers: Vec<ScaledClassifier>,
}

/// A cascade with rectangles resized to one window scale.
struct ScaledCascade {
    width: u32,
    height: u32,
    /// Variance window `(dx, dy, width, height)`: the window inset by one
    /// base pixel on each side.
    norm: (u32, u32, u32, u32),
    stages: Vec<ScaledStage>,
}

impl ScaledCascade {
    fn new(cascade: &HaarCascade, scale: f64) -> Self {
        let width = (cascade.window.width as f64 * scale).round() as u32;
        let height = (cascade.window.height as f64 * scale).round() as u32;
        let inset = scale.round() as u32;
        let norm = if width > 2 * inset && height > 2 * inset {
            (inset, inset, width - 2 * inset, height - 2 * inset)
        } else {
            (0, 0, width, height)
        };

        let stages = cascade
            .stages
            .iter()
            .map(|stage| ScaledStage {
                threshold: stage.threshold as f64,
                classifiers: stage
                    .classifiers
                    .iter()
                    .map(|weak| ScaledClassifier {
                        rects: scale_feature(&weak.feature, scale, width, height),
                        threshold: weak.threshold as f64,
                        left: weak.left as f64,
                        right: weak.right as f64,
                    })
                    .collect(),
            })
            .collect();

        Self { width, height, norm, stages }
    }

    /// Run every stage on the window at (x, y); reject at the first failing stage.
    fn accepts(&self, image: &IntegralImage, x: u32, y: u32) -> bool {
        let (dx, dy, nw, nh) = self.norm;
        let area = nw as f64 * nh as f64;
        let mean = image.rect_sum(x + dx, y + dy, nw, nh) as f64 / area;
        let variance = image.rect_sq_sum(x + dx, y + dy, nw, nh) as f64 / area - mean * mean;
        let norm = if variance > 0.0 { variance.sqrt() } else { 1.0 };
        let inv = 1.0 / (area * norm);

        for stage in &self.stages {
            let mut total = 0.0;
            for weak in &stage.classifiers {
                let raw: f64 = weak
                    .rects
                    .iter()
                    .map(|r| r.weight * image.rect_sum(x + r.x, y + r.y, r.width, r.height) as f64)
                    .sum();
                total += if raw * inv < weak.threshold { weak.left } else { weak.right };
            }
            if total < stage.threshold {
                return false;
            }
        }
        true
    }
}

/// Resize feature rectangles to a window of `win_w` x `win_h`.
///
/// Rounding changes rectangle areas, so for a zero-sum feature the first
/// weight is recomputed to keep the scaled feature zero-sum.
fn scale_feature(rects: &[WeightedRect], scale: f64, win_w: u32, win_h: u32) -> Vec<ScaledRect> {
    let mut scaled: Vec<ScaledRect> = rects
        .iter()
        .map(|r| {
            let x = ((r.x as f64 * scale).round() as u32).min(win_w.saturating_sub(1));
            let y = ((r.y as f64 * scale).round() as u32).min(win_h.saturating_sub(1));
            let width = ((r.width as f64 * scale).round() as u32).clamp(1, win_w - x);
            let height = ((r.height as f64 * scale).round() as u32).clamp(1, win_h - y);
            ScaledRect { x, y, width, height, weight: r.weight as f64 }
        })
        .collect();

    let base_area = |r: &WeightedRect| r.width as f64 * r.height as f64;
    let signed: f64 = rects.iter().map(|r| r.weight as f64 * base_area(r)).sum();
    let magnitude: f64 = rects.iter().map(|r| (r.weight as f64 * base_area(r)).abs()).sum();

    if scaled.len() > 1 && signed.abs() <= 1e-6 * magnitude {
        let area = |r: &ScaledRect| r.width as f64 * r.height as f64;
        let rest: f64 = scaled[1..].iter().map(|r| r.weight * area(r)).sum();
        scaled[0].weight = -rest / area(&scaled[0]);
    }

    scaled
}

fn similar(a: &BoundingBox, b: &BoundingBox, eps: f64) -> bool {
    let delta = eps * (a.width.min(b.width) as f64 + a.height.min(b.height) as f64) * 0.5;
    let close = |p: u32, q: u32| (p as f64 - q as f64).abs() <= delta;
    close(a.x, b.x)
        && close(a.y, b.y)
        && close(a.x + a.width, b.x + b.width)
        && close(a.y + a.height, b.y + b.height)
}

fn find_root(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

/// Merge raw hits into face regions.
///
/// Hits are clustered transitively by [`similar`]; each cluster is averaged.
/// Clusters with `min_neighbors` or fewer members are dropped, as are
/// clusters nested inside a better-supported one. Output keeps the order in
/// which clusters were first encountered.
pub(crate) fn group_rectangles(
    hits: &[BoundingBox],
    min_neighbors: u32,
    eps: f64,
) -> Vec<BoundingBox> {
    let n = hits.len();
    let mut parent: Vec<usize> = (0..n).collect();

    for i in 0..n {
        for j in (i + 1)..n {
            if similar(&hits[i], &hits[j], eps) {
                let ri = find_root(&mut parent, i);
                let rj = find_root(&mut parent, j);
                if ri != rj {
                    parent[ri.max(rj)] = ri.min(rj);
                }
            }
        }
    }

    // Cluster index per root, in first-encountered order.
    let mut cluster_of_root: Vec<Option<usize>> = vec![None; n];
    let mut sums: Vec<[u64; 4]> = Vec::new();
    let mut members: Vec<u32> = Vec::new();
    let mut support: Vec<u32> = Vec::new();

    for (i, hit) in hits.iter().enumerate() {
        let root = find_root(&mut parent, i);
        let c = match cluster_of_root[root] {
            Some(c) => c,
            None => {
                cluster_of_root[root] = Some(sums.len());
                sums.push([0; 4]);
                members.push(0);
                support.push(0);
                sums.len() - 1
            }
        };
        let s = &mut sums[c];
        s[0] += hit.x as u64;
        s[1] += hit.y as u64;
        s[2] += hit.width as u64;
        s[3] += hit.height as u64;
        members[c] += 1;
        support[c] += hit.neighbors.max(1);
    }

    let averaged: Vec<BoundingBox> = sums
        .iter()
        .zip(members.iter().zip(&support))
        .map(|(s, (&count, &neighbors))| {
            let avg = |v: u64| (v as f64 / count as f64).round() as u32;
            BoundingBox {
                x: avg(s[0]),
                y: avg(s[1]),
                width: avg(s[2]),
                height: avg(s[3]),
                neighbors,
            }
        })
        .collect();

    let survivors: Vec<&BoundingBox> = averaged
        .iter()
        .filter(|b| b.neighbors > min_neighbors)
        .collect();

    survivors
        .iter()
        .enumerate()
        .filter(|(i, inner)| {
            !survivors.iter().enumerate().any(|(j, outer)| {
                *i != j && nested(inner, outer, eps) && {
                    let (n1, n2) = (inner.neighbors, outer.neighbors);
                    n2 > n1.max(3) || n1 < 3
                }
            })
        })
        .map(|(_, b)| **b)
        .collect()
}

/// Whether `inner` lies within `outer` expanded by `eps` of its size.
fn nested(inner: &BoundingBox, outer: &BoundingBox, eps: f64) -> bool {
    let dx = (outer.width as f64 * eps).round() as i64;
    let dy = (outer.height as f64 * eps).round() as i64;
    let (ix, iy, iw, ih) = (inner.x as i64, inner.y as i64, inner.width as i64, inner.height as i64);
    let (ox, oy, ow, oh) = (outer.x as i64, outer.y as i64, outer.width as i64, outer.height as i64);
    ix >= ox - dx && iy >= oy - dy && ix + iw <= ox + ow + dx && iy + ih <= oy + oh + dy
}
