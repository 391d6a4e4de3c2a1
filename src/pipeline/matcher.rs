use std::str::FromStr;
use crate::pipeline::extractor::FaceDescriptor;

/// Euclidean cut-off between two descriptors of the same person.
///
/// ArcFace descriptors are L2-normalized, so `d² = 2 - 2·cos` and 0.54 means a
/// cosine similarity above roughly 0.85. That is strict for ArcFace: many
/// same-person pairs score 0.4 to 0.7. Raise `FACEFIND_THRESHOLD`, or set
/// `FACEFIND_METRIC=cosine` with a cosine-distance threshold, when real
/// matches are missed.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.54;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistanceMetric {
    #[default]
    Euclidean,
    Cosine,
}

impl FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "euclidean" | "l2" => Ok(DistanceMetric::Euclidean),
            "cosine" => Ok(DistanceMetric::Cosine),
            other => Err(format!("unknown distance metric: {}", other)),
        }
    }
}

pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - (dot_product / (norm_a * norm_b))
}

/// Decides whether a candidate face belongs to the probe person.
///
/// A candidate matches when its smallest distance to any probe descriptor is
/// strictly below the threshold. Descriptors of a different length than the
/// probe are never comparable and never match.
#[derive(Debug, Clone)]
pub struct FaceMatcher {
    probes: Vec<Vec<f32>>,
    threshold: f32,
    metric: DistanceMetric,
}

impl FaceMatcher {
    pub fn new<I>(probes: I, threshold: f32, metric: DistanceMetric) -> Self
    where
        I: IntoIterator<Item = Vec<f32>>,
    {
        Self {
            probes: probes.into_iter().filter(|p| !p.is_empty()).collect(),
            threshold,
            metric,
        }
    }

    pub fn threshold(&self) -> f32 { self.threshold }
    pub fn metric(&self) -> DistanceMetric { self.metric }
    pub fn probe_count(&self) -> usize { self.probes.len() }

    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() {
            return f32::INFINITY;
        }
        match self.metric {
            DistanceMetric::Euclidean => euclidean_distance(a, b),
            DistanceMetric::Cosine => cosine_distance(a, b),
        }
    }

    pub fn best_distance(&self, candidate: &[f32]) -> Option<f32> {
        self.probes
            .iter()
            .map(|p| self.distance(p, candidate))
            .filter(|d| d.is_finite())
            .min_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
    }

    pub fn is_match(&self, candidate: &[f32]) -> bool {
        matches!(self.best_distance(candidate), Some(d) if d < self.threshold)
    }

    /// True if any face in the image matches; bystanders don't cancel a match.
    pub fn any_match(&self, faces: &[FaceDescriptor]) -> bool {
        faces.iter().any(|f| self.is_match(&f.vector))
    }
}
