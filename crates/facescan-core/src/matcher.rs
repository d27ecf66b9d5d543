//! Nearest-neighbour matching of a query vector against enrolled candidates.

use crate::types::{Candidate, FeatureVector};

/// Tolerance used when the caller does not configure one.
pub const DEFAULT_TOLERANCE: f64 = 0.8;

/// A candidate accepted by the matcher.
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    /// Identity of the closest candidate.
    pub identity: String,
    /// Similarity percentage in [0, 100], rounded to two decimals.
    pub confidence: f64,
}

/// Strategy for comparing a query vector against an ordered candidate list.
///
/// `tolerance` must lie in (0, 1]. Implementations do not validate it; the
/// configuration layer is responsible for rejecting other values.
pub trait Matcher {
    fn compare(&self, query: &FeatureVector, candidates: &[Candidate], tolerance: f64)
        -> Option<Match>;
}

/// Euclidean-distance matcher with a linear scan over all candidates.
///
/// Similarity is the distance expressed as a percentage of the largest
/// distance possible between two vectors whose components lie in
/// `[lower, upper]`.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    lower: f64,
    upper: f64,
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self { lower: 0.0, upper: 1.0 }
    }
}

impl EuclideanMatcher {
    /// Matcher for vectors whose components lie in `[lower, upper]`.
    pub fn with_bounds(lower: f64, upper: f64) -> Self {
        Self { lower, upper }
    }

    /// Largest Euclidean distance between two vectors of `len` components.
    pub fn max_distance(&self, len: usize) -> f64 {
        (len as f64).sqrt() * (self.upper - self.lower)
    }

    /// Similarity percentage for a distance between vectors of `len` components.
    pub fn similarity(&self, distance: f64, len: usize) -> f64 {
        let max_distance = self.max_distance(len);
        if max_distance <= 0.0 {
            return if distance == 0.0 { 100.0 } else { 0.0 };
        }
        (100.0 - distance / max_distance * 100.0).clamp(0.0, 100.0)
    }
}

impl Matcher for EuclideanMatcher {
    fn compare(
        &self,
        query: &FeatureVector,
        candidates: &[Candidate],
        tolerance: f64,
    ) -> Option<Match> {
        if candidates.is_empty() || query.is_empty() {
            return None;
        }

        let mut best_distance = f64::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, candidate) in candidates.iter().enumerate() {
            if candidate.vector.len() != query.len() {
                tracing::warn!(
                    identity = %candidate.identity,
                    expected = query.len(),
                    actual = candidate.vector.len(),
                    "skipping candidate with mismatched vector length"
                );
                continue;
            }
            let distance = query.euclidean_distance(&candidate.vector);
            // Strict comparison keeps the first candidate on ties.
            if distance < best_distance {
                best_distance = distance;
                best_idx = Some(i);
            }
        }

        let idx = best_idx?;
        let similarity = self.similarity(best_distance, query.len());
        let threshold = (1.0 - tolerance) * 100.0;

        tracing::debug!(
            candidates = candidates.len(),
            distance = best_distance,
            similarity,
            threshold,
            "best candidate"
        );

        if similarity >= threshold {
            Some(Match {
                identity: candidates[idx].identity.clone(),
                confidence: round2(similarity),
            })
        } else {
            None
        }
    }
}

/// Find the closest candidate within tolerance using [`EuclideanMatcher`]
/// with components bounded by [0, 1].
pub fn find_match(
    query: &FeatureVector,
    candidates: &[Candidate],
    tolerance: f64,
) -> Option<Match> {
    EuclideanMatcher::default().compare(query, candidates, tolerance)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(values: &[f32]) -> FeatureVector {
        FeatureVector::new(values.to_vec())
    }

    #[test]
    fn test_empty_candidates_no_match() {
        let q = vector(&[0.5, 0.5]);
        assert_eq!(find_match(&q, &[], DEFAULT_TOLERANCE), None);
    }

    #[test]
    fn test_self_match_full_confidence() {
        let q = FeatureVector::new((0..10_000).map(|i| (i % 256) as f32 / 255.0).collect());
        let candidates = [Candidate::new("self", q.clone())];
        let m = find_match(&q, &candidates, DEFAULT_TOLERANCE).unwrap();
        assert_eq!(m.identity, "self");
        assert_eq!(m.confidence, 100.0);
    }

    #[test]
    fn test_opposite_corners_rejected() {
        let zeros = FeatureVector::new(vec![0.0; 10_000]);
        let ones = FeatureVector::new(vec![1.0; 10_000]);
        let candidates = [Candidate::new("far", ones)];
        assert_eq!(find_match(&zeros, &candidates, DEFAULT_TOLERANCE), None);
        assert_eq!(find_match(&zeros, &candidates, 0.5), None);
    }

    #[test]
    fn test_opposite_corners_accepted_at_full_tolerance() {
        let zeros = FeatureVector::new(vec![0.0; 100]);
        let ones = FeatureVector::new(vec![1.0; 100]);
        let candidates = [Candidate::new("far", ones)];
        let m = find_match(&zeros, &candidates, 1.0).unwrap();
        assert_eq!(m.identity, "far");
        assert_eq!(m.confidence, 0.0);
    }

    #[test]
    fn test_picks_closest_candidate() {
        // Best match is last: every candidate is scanned.
        let q = vector(&[0.9, 0.1, 0.5, 0.5]);
        let candidates = [
            Candidate::new("a", vector(&[0.0, 1.0, 0.0, 1.0])),
            Candidate::new("b", vector(&[0.5, 0.5, 0.5, 0.5])),
            Candidate::new("c", vector(&[0.9, 0.1, 0.5, 0.4])),
        ];
        let m = find_match(&q, &candidates, DEFAULT_TOLERANCE).unwrap();
        assert_eq!(m.identity, "c");
        // distance 0.1 over max sqrt(4) = 2 → 95%
        assert_eq!(m.confidence, 95.0);
    }

    #[test]
    fn test_tie_keeps_first_candidate() {
        let q = vector(&[0.5, 0.5]);
        let candidates = [
            Candidate::new("first", vector(&[0.75, 0.5])),
            Candidate::new("second", vector(&[0.25, 0.5])),
        ];
        let m = find_match(&q, &candidates, DEFAULT_TOLERANCE).unwrap();
        assert_eq!(m.identity, "first");
    }

    #[test]
    fn test_threshold_boundary_accepts_equal() {
        // distance 1 over max 2 → similarity exactly 50, threshold (1 - 0.5) * 100 = 50
        let q = vector(&[0.0, 0.0, 0.0, 0.0]);
        let candidates = [Candidate::new("edge", vector(&[0.5, 0.5, 0.5, 0.5]))];
        let m = find_match(&q, &candidates, 0.5).unwrap();
        assert_eq!(m.confidence, 50.0);
        assert_eq!(find_match(&q, &candidates, 0.49), None);
    }

    #[test]
    fn test_confidence_rounded_to_two_decimals() {
        let q = vector(&[0.0, 0.0, 0.0]);
        let candidates = [Candidate::new("x", vector(&[0.1, 0.0, 0.0]))];
        let m = find_match(&q, &candidates, DEFAULT_TOLERANCE).unwrap();
        // 100 - 0.1 / sqrt(3) * 100 = 94.2264973...
        assert_eq!(m.confidence, 94.23);
        assert!((0.0..=100.0).contains(&m.confidence));
    }

    #[test]
    fn test_mismatched_lengths_skipped() {
        let q = vector(&[0.5, 0.5]);
        let candidates = [
            Candidate::new("short", vector(&[0.5])),
            Candidate::new("ok", vector(&[0.5, 0.4])),
        ];
        let m = find_match(&q, &candidates, DEFAULT_TOLERANCE).unwrap();
        assert_eq!(m.identity, "ok");

        let only_bad = [Candidate::new("short", vector(&[0.5]))];
        assert_eq!(find_match(&q, &only_bad, DEFAULT_TOLERANCE), None);
    }

    #[test]
    fn test_custom_bounds_scale_max_distance() {
        let m = EuclideanMatcher::with_bounds(-1.0, 1.0);
        assert!((m.max_distance(4) - 4.0).abs() < 1e-12);
        assert!((m.similarity(2.0, 4) - 50.0).abs() < 1e-12);
        assert!((EuclideanMatcher::default().max_distance(10_000) - 100.0).abs() < 1e-12);
    }
}
