//! Per-column value transformers for masking and anonymisation.
//!
//! Transformers are pure and deterministic given their salt, so replaying
//! the same WAL produces the same masked values.

use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;

use crate::conversions::cell::CellValue;
use crate::error::{Classify, ErrorKind};

pub mod at_email;
pub mod noop;
pub mod registry;
pub mod string;

pub use registry::TransformerRegistry;

#[derive(Debug, Error)]
pub enum TransformerError {
    #[error("value type not supported by transformer")]
    UnsupportedValueType,

    #[error("unsupported transformer: {0}")]
    UnsupportedTransformer(String),

    #[error("invalid transformer parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },
}

impl Classify for TransformerError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

/// Source types a transformer accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportedType {
    String,
    Integer,
    Float,
    Boolean,
    Timestamp,
}

pub trait Transformer: Send + Sync {
    fn transform(&self, value: CellValue) -> Result<CellValue, TransformerError>;

    fn compatible_types(&self) -> &[SupportedType];
}

pub type ParameterValues = HashMap<String, String>;

/// Configuration of one transformer instance, as it appears in the rules
/// file.
#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
pub struct TransformerConfig {
    pub name: String,
    #[serde(default)]
    pub parameters: ParameterValues,
}

pub(crate) fn parameter_or_default(
    params: &ParameterValues,
    name: &str,
    default: &str,
) -> String {
    params
        .get(name)
        .cloned()
        .unwrap_or_else(|| default.to_string())
}
