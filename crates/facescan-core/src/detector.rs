//! Cascade face detector and face-crop encoder.
//!
//! Decodes an image, converts it to luma, scans it with a Haar-like cascade,
//! and turns the largest detected region into a 100x100 intensity vector
//! normalized to [0, 1].

use crate::cascade::{self, CascadeError, HaarCascade, IntegralImage};
use crate::types::{BoundingBox, FeatureVector};
use image::imageops::{self, FilterType};
use image::GrayImage;
use std::path::Path;
use thiserror::Error;

// --- Named constants ---
/// Side length of the canonical face crop.
pub const FACE_SIZE: u32 = 100;
/// Length of every vector produced by [`FaceDetector::detect_and_encode`].
pub const FEATURE_LENGTH: usize = (FACE_SIZE * FACE_SIZE) as usize;
const DEFAULT_SCALE_FACTOR: f64 = 1.3;
const DEFAULT_MIN_NEIGHBORS: u32 = 5;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("image decode failed: {0}")]
    DecodeFailure(#[from] image::ImageError),
    #[error("no face detected")]
    NotFound,
    #[error("invalid detector parameters: {0}")]
    InvalidParams(String),
    #[error("cascade: {0}")]
    Cascade(#[from] CascadeError),
}

impl DetectorError {
    /// Whether the caller should report "no face detected".
    ///
    /// Decode failures count as no face.
    pub fn is_no_face(&self) -> bool {
        matches!(self, DetectorError::NotFound | DetectorError::DecodeFailure(_))
    }
}

/// Sliding-window tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorParams {
    /// Window growth per pyramid level; must exceed 1.
    pub scale_factor: f64,
    /// A region needs more than this many raw hits to be reported.
    pub min_neighbors: u32,
    /// Smallest window side in pixels; 0 means the cascade's base window.
    pub min_size: u32,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            scale_factor: DEFAULT_SCALE_FACTOR,
            min_neighbors: DEFAULT_MIN_NEIGHBORS,
            min_size: 0,
        }
    }
}

impl DetectorParams {
    pub fn validate(&self) -> Result<(), DetectorError> {
        if !(self.scale_factor.is_finite() && self.scale_factor > 1.0) {
            return Err(DetectorError::InvalidParams(format!(
                "scale factor must be greater than 1, got {}",
                self.scale_factor
            )));
        }
        Ok(())
    }
}

/// Immutable face detector: a validated cascade plus scan parameters.
///
/// Holds no interior state, so one instance can serve concurrent callers.
#[derive(Debug, Clone)]
pub struct FaceDetector {
    cascade: HaarCascade,
    params: DetectorParams,
}

impl FaceDetector {
    pub fn new(cascade: HaarCascade, params: DetectorParams) -> Result<Self, DetectorError> {
        params.validate()?;
        cascade.validate()?;
        tracing::debug!(
            cascade = %cascade.name,
            scale_factor = params.scale_factor,
            min_neighbors = params.min_neighbors,
            min_size = params.min_size,
            "face detector ready"
        );
        Ok(Self { cascade, params })
    }

    /// Detector using the bundled frontal-face cascade and default parameters.
    pub fn bundled() -> Result<Self, DetectorError> {
        Self::new(HaarCascade::bundled()?, DetectorParams::default())
    }

    /// Detector using a cascade file on disk.
    pub fn load(cascade_path: &Path, params: DetectorParams) -> Result<Self, DetectorError> {
        Self::new(HaarCascade::from_path(cascade_path)?, params)
    }

    pub fn cascade(&self) -> &HaarCascade {
        &self.cascade
    }

    /// Detect all face regions in an encoded image, in first-encountered order.
    pub fn detect(&self, image_bytes: &[u8]) -> Result<Vec<BoundingBox>, DetectorError> {
        let gray = decode_luma(image_bytes)?;
        Ok(self.detect_gray(&gray))
    }

    /// Detect all face regions in a luma image.
    pub fn detect_gray(&self, gray: &GrayImage) -> Vec<BoundingBox> {
        let (width, height) = gray.dimensions();
        let integral = IntegralImage::new(gray.as_raw(), width, height);
        let hits = self
            .cascade
            .scan(&integral, self.params.scale_factor, self.params.min_size);
        let faces = cascade::group_rectangles(&hits, self.params.min_neighbors, cascade::GROUP_EPS);

        tracing::debug!(
            width,
            height,
            raw_hits = hits.len(),
            faces = faces.len(),
            "detection complete"
        );
        faces
    }

    /// Encode the largest face in an encoded image.
    ///
    /// Returns [`DetectorError::DecodeFailure`] for unreadable input and
    /// [`DetectorError::NotFound`] when no region survives grouping.
    pub fn detect_and_encode(&self, image_bytes: &[u8]) -> Result<FeatureVector, DetectorError> {
        let gray = decode_luma(image_bytes).map_err(|e| {
            tracing::warn!(error = %e, "could not decode image");
            e
        })?;

        let faces = self.detect_gray(&gray);
        let Some(face) = select_largest(&faces) else {
            tracing::warn!("no faces detected in the image");
            return Err(DetectorError::NotFound);
        };

        tracing::info!(
            x = face.x,
            y = face.y,
            width = face.width,
            height = face.height,
            neighbors = face.neighbors,
            candidates = faces.len(),
            "largest face selected"
        );

        Ok(encode_region(&gray, face))
    }
}

/// Decode any supported image format into 8-bit luma.
fn decode_luma(image_bytes: &[u8]) -> Result<GrayImage, DetectorError> {
    Ok(image::load_from_memory(image_bytes)?.to_luma8())
}

/// Pick the region with the largest area; the first one wins ties.
pub fn select_largest(faces: &[BoundingBox]) -> Option<&BoundingBox> {
    faces.iter().fold(None, |best: Option<&BoundingBox>, face| match best {
        Some(b) if b.area() >= face.area() => Some(b),
        _ => Some(face),
    })
}

/// Crop `region`, resize it to [`FACE_SIZE`] square with bilinear filtering,
/// and flatten row-major into values divided by 255.
pub fn encode_region(gray: &GrayImage, region: &BoundingBox) -> FeatureVector {
    let crop = imageops::crop_imm(gray, region.x, region.y, region.width, region.height).to_image();
    let resized = imageops::resize(&crop, FACE_SIZE, FACE_SIZE, FilterType::Triangle);
    resized
        .as_raw()
        .iter()
        .map(|&p| p as f32 / 255.0)
        .collect::<Vec<f32>>()
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Luma};
    use std::io::Cursor;

    const SKIN: u8 = 190;
    const BACKGROUND: u8 = 180;

    /// Intensity of one cell of a 24x24 face template: dark eyes and mouth on skin.
    fn face_cell(col: i64, row: i64) -> u8 {
        if !(0..24).contains(&col) || !(0..24).contains(&row) {
            return BACKGROUND;
        }
        let eye = (6..=10).contains(&row) && ((3..=8).contains(&col) || (15..=20).contains(&col));
        let mouth = (17..=19).contains(&row) && (7..=16).contains(&col);
        if eye {
            40
        } else if mouth {
            60
        } else {
            SKIN
        }
    }

    /// Square image with a synthetic face of `face_size` pixels at (`fx`, `fy`).
    fn synthetic_face(image_size: u32, fx: u32, fy: u32, face_size: u32) -> GrayImage {
        let size = face_size as i64;
        GrayImage::from_fn(image_size, image_size, |px, py| {
            let dx = px as i64 - fx as i64;
            let dy = py as i64 - fy as i64;
            if dx < 0 || dy < 0 || dx >= size || dy >= size {
                Luma([BACKGROUND])
            } else {
                Luma([face_cell(dx * 24 / size, dy * 24 / size)])
            }
        })
    }

    fn png_bytes(img: &GrayImage) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    fn face_png() -> Vec<u8> {
        png_bytes(&synthetic_face(200, 40, 40, 116))
    }

    #[test]
    fn test_default_params() {
        let params = DetectorParams::default();
        assert_eq!(params.scale_factor, 1.3);
        assert_eq!(params.min_neighbors, 5);
    }

    #[test]
    fn test_rejects_non_growing_scale_factor() {
        let params = DetectorParams { scale_factor: 1.0, ..Default::default() };
        let err = FaceDetector::new(HaarCascade::bundled().unwrap(), params).unwrap_err();
        assert!(matches!(err, DetectorError::InvalidParams(_)));
    }

    #[test]
    fn test_garbage_bytes_are_decode_failure() {
        let detector = FaceDetector::bundled().unwrap();
        let err = detector.detect_and_encode(b"definitely not an image").unwrap_err();
        assert!(matches!(err, DetectorError::DecodeFailure(_)));
        assert!(err.is_no_face());
    }

    #[test]
    fn test_blank_image_not_found() {
        let detector = FaceDetector::bundled().unwrap();
        let blank = GrayImage::from_pixel(160, 120, Luma([128]));
        let err = detector.detect_and_encode(&png_bytes(&blank)).unwrap_err();
        assert!(matches!(err, DetectorError::NotFound));
        assert!(err.is_no_face());
    }

    /// Uniform noise from a 64-bit LCG, row-major.
    fn lcg_noise(width: u32, height: u32, seed: u64) -> GrayImage {
        let mut state = seed;
        let pixels = (0..width * height)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                (state >> 56) as u8
            })
            .collect();
        GrayImage::from_raw(width, height, pixels).unwrap()
    }

    fn assert_no_face(detector: &FaceDetector, img: &GrayImage, what: &str) {
        let faces = detector.detect(&png_bytes(img)).unwrap();
        assert!(faces.is_empty(), "{what}: unexpected faces {faces:?}");
        let err = detector.detect_and_encode(&png_bytes(img)).unwrap_err();
        assert!(matches!(err, DetectorError::NotFound), "{what}: {err:?}");
    }

    #[test]
    fn test_noise_not_found() {
        let detector = FaceDetector::bundled().unwrap();
        for seed in 1..=4 {
            assert_no_face(&detector, &lcg_noise(200, 200, seed), &format!("noise seed {seed}"));
        }
    }

    #[test]
    fn test_textures_not_found() {
        let detector = FaceDetector::bundled().unwrap();
        for cell in [8, 12] {
            let checker = GrayImage::from_fn(160, 160, |x, y| {
                Luma([if (x / cell + y / cell) % 2 == 1 { 255 } else { 0 }])
            });
            assert_no_face(&detector, &checker, &format!("checkerboard {cell}"));
        }
        for period in [4, 8] {
            let rows = GrayImage::from_fn(160, 160, |_, y| Luma([if (y / period) % 2 == 1 { 255 } else { 0 }]));
            let columns = GrayImage::from_fn(160, 160, |x, _| Luma([if (x / period) % 2 == 1 { 255 } else { 0 }]));
            assert_no_face(&detector, &rows, &format!("horizontal stripes {period}"));
            assert_no_face(&detector, &columns, &format!("vertical stripes {period}"));
        }
        let gradient = GrayImage::from_fn(160, 160, |x, y| Luma([((x + y) * 255 / 320) as u8]));
        assert_no_face(&detector, &gradient, "gradient");
    }

    #[test]
    fn test_synthetic_face_detected() {
        let detector = FaceDetector::bundled().unwrap();
        let faces = detector.detect(&face_png()).unwrap();
        assert!(!faces.is_empty());

        let largest = select_largest(&faces).unwrap();
        let cx = largest.x + largest.width / 2;
        let cy = largest.y + largest.height / 2;
        assert!((40..156).contains(&cx), "centre x {cx} outside face");
        assert!((40..156).contains(&cy), "centre y {cy} outside face");
        assert!(largest.neighbors > 5);
    }

    #[test]
    fn test_encoded_vector_shape_and_range() {
        let detector = FaceDetector::bundled().unwrap();
        let vector = detector.detect_and_encode(&face_png()).unwrap();
        assert_eq!(vector.len(), FEATURE_LENGTH);
        assert!(vector.as_slice().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let detector = FaceDetector::bundled().unwrap();
        let bytes = face_png();
        let a = detector.detect_and_encode(&bytes).unwrap();
        let b = detector.detect_and_encode(&bytes).unwrap();
        let bits = |v: &FeatureVector| v.as_slice().iter().map(|x| x.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&a), bits(&b));
    }

    #[test]
    fn test_encode_region_uniform_patch() {
        let gray = GrayImage::from_pixel(64, 48, Luma([51]));
        let region = BoundingBox { x: 10, y: 5, width: 30, height: 30, neighbors: 6 };
        let vector = encode_region(&gray, &region);
        assert_eq!(vector.len(), FEATURE_LENGTH);
        assert!(vector.as_slice().iter().all(|&v| v == 51.0 / 255.0));
    }

    #[test]
    fn test_encode_region_is_row_major() {
        // Left half black, right half white: each row goes dark → bright.
        let gray = GrayImage::from_fn(200, 200, |x, _| Luma([if x < 100 { 0 } else { 255 }]));
        let region = BoundingBox { x: 0, y: 0, width: 200, height: 200, neighbors: 6 };
        let vector = encode_region(&gray, &region);
        let values = vector.as_slice();
        let row = FACE_SIZE as usize;
        assert_eq!(values[0], 0.0);
        assert_eq!(values[row - 1], 1.0);
        assert_eq!(values[row], 0.0);
    }

    #[test]
    fn test_select_largest_prefers_area() {
        let faces = [
            BoundingBox { x: 0, y: 0, width: 30, height: 30, neighbors: 9 },
            BoundingBox { x: 50, y: 0, width: 40, height: 40, neighbors: 6 },
            BoundingBox { x: 99, y: 0, width: 35, height: 35, neighbors: 7 },
        ];
        assert_eq!(select_largest(&faces).unwrap().x, 50);
    }

    #[test]
    fn test_select_largest_tie_keeps_first() {
        let faces = [
            BoundingBox { x: 1, y: 0, width: 20, height: 40, neighbors: 6 },
            BoundingBox { x: 2, y: 0, width: 40, height: 20, neighbors: 6 },
        ];
        assert_eq!(select_largest(&faces).unwrap().x, 1);
    }

    #[test]
    fn test_select_largest_empty() {
        assert!(select_largest(&[]).is_none());
    }
}
