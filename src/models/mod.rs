pub mod image_ref;

pub use image_ref::{ImageReference, MatchRecord, SourceCollection};
