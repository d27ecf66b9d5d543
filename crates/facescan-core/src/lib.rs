//! facescan-core — Face detection, encoding and matching.
//!
//! A Haar-like cascade locates faces; the largest one is cropped to a
//! 100x100 intensity vector, which is matched against enrolled vectors by
//! Euclidean distance.

pub mod cascade;
pub mod detector;
pub mod encoding;
pub mod matcher;
pub mod opencv;
pub mod types;

pub use cascade::{CascadeError, HaarCascade};
pub use detector::{DetectorError, DetectorParams, FaceDetector, FEATURE_LENGTH};
pub use encoding::EncodingError;
pub use matcher::{find_match, EuclideanMatcher, Match, Matcher, DEFAULT_TOLERANCE};
pub use types::{BoundingBox, Candidate, FeatureVector};
