use serde::{Deserialize, Serialize};

/// Bounding box of a detected face in original image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
}

impl FaceRegion {
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }
}

/// One detected face: where it is and its embedding.
#[derive(Debug, Clone)]
pub struct FaceDescriptor {
    pub region: FaceRegion,
    pub vector: Vec<f32>,
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("face models are still loading")]
    NotReady,
    #[error("failed to decode image: {0}")]
    Decode(String),
    #[error("face inference failed: {0}")]
    Inference(String),
}

/// Turns image bytes into zero or more face descriptors.
///
/// An empty list means no face was found; errors are reserved for images that
/// could not be decoded or an inference backend that failed. Implementations are
/// blocking and get called from `spawn_blocking`.
pub trait DescriptorExtractor: Send + Sync + 'static {
    fn is_ready(&self) -> bool;
    fn extract(&self, image_bytes: &[u8]) -> Result<Vec<FaceDescriptor>, ExtractError>;
}
