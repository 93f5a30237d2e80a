use crate::conversions::cell::CellValue;

use super::{SupportedType, Transformer, TransformerError};

const COMPATIBLE_TYPES: &[SupportedType] = &[
    SupportedType::String,
    SupportedType::Integer,
    SupportedType::Float,
    SupportedType::Boolean,
    SupportedType::Timestamp,
];

/// Passes values through unchanged. Useful for exercising the pipeline
/// plumbing without masking anything.
pub struct NoopTransformer;

impl Transformer for NoopTransformer {
    fn transform(&self, value: CellValue) -> Result<CellValue, TransformerError> {
        Ok(value)
    }

    fn compatible_types(&self) -> &[SupportedType] {
        COMPATIBLE_TYPES
    }
}
