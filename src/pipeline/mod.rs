pub mod extractor;
pub mod matcher;
pub mod fetch;
pub mod corpus;
pub mod progress;
pub mod results;
pub mod scanner;
pub mod job;
#[cfg(feature = "facial-recognition")]
pub mod face;
