//! Payload checks and conversion into canonical series.

pub mod extract;
pub mod normalize;
pub mod validate;

pub use normalize::{adjusted_score, NormalizeStats, Normalizer};
pub use validate::{ValidationReport, Validator, DEFAULT_SAMPLE_SIZE};
