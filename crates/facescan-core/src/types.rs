use serde::Serialize;

/// Axis-aligned face region in source-image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Number of raw detector hits merged into this region.
    pub neighbors: u32,
}

impl BoundingBox {
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Fixed-length face feature vector.
///
/// Components produced by the detector lie in [0, 1]. The vector is immutable
/// once built: there is no mutable access to its components.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    values: Vec<f32>,
}

impl FeatureVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean distance between two vectors of equal length.
    ///
    /// Accumulates in f64 so that long vectors (10000 components) do not lose
    /// precision. Callers must check lengths first; extra components of the
    /// longer vector are ignored.
    pub fn euclidean_distance(&self, other: &FeatureVector) -> f64 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| {
                let d = *a as f64 - *b as f64;
                d * d
            })
            .sum::<f64>()
            .sqrt()
    }
}

impl From<Vec<f32>> for FeatureVector {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// An enrolled identity's vector, as handed to a matcher.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub identity: String,
    pub vector: FeatureVector,
}

impl Candidate {
    pub fn new(identity: impl Into<String>, vector: FeatureVector) -> Self {
        Self {
            identity: identity.into(),
            vector,
        }
    }
}
