//! Screenshot extraction: a Gemini-backed [`Extractor`](snackngo_core::collaborators::Extractor)
//! and the parsers that turn its free-text replies into field values.

pub mod gemini;
pub mod parse;

pub use gemini::{GeminiConfig, GeminiExtractor};
