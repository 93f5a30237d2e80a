use sha2::{Digest, Sha256};

use crate::conversions::cell::CellValue;

use super::{
    parameter_or_default, ParameterValues, SupportedType, Transformer, TransformerError,
};

const ALPHABET: &[u8; 62] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

const COMPATIBLE_TYPES: &[SupportedType] = &[SupportedType::String];

/// Replaces a string with alphanumerics of the same length, derived from a
/// salted hash of the input so the mapping is stable across replays.
pub struct StringTransformer {
    salt: String,
}

impl StringTransformer {
    pub fn new(params: &ParameterValues) -> Result<Self, TransformerError> {
        Ok(Self {
            salt: parameter_or_default(params, "salt", "defaultsalt"),
        })
    }
}

impl Transformer for StringTransformer {
    fn transform(&self, value: CellValue) -> Result<CellValue, TransformerError> {
        let CellValue::String(s) = value else {
            return Err(TransformerError::UnsupportedValueType);
        };

        let mut hasher = Sha256::new();
        hasher.update(self.salt.as_bytes());
        hasher.update(s.as_bytes());
        let digest = hasher.finalize();

        let out: String = s
            .chars()
            .enumerate()
            .map(|(i, _)| ALPHABET[digest[i % digest.len()] as usize % ALPHABET.len()] as char)
            .collect();
        Ok(CellValue::String(out))
    }

    fn compatible_types(&self) -> &[SupportedType] {
        COMPATIBLE_TYPES
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_same_length_output() {
        let t = StringTransformer::new(&ParameterValues::new()).unwrap();
        let CellValue::String(first) = t
            .transform(CellValue::String("sensitive".to_string()))
            .unwrap()
        else {
            panic!("expected string");
        };
        let CellValue::String(second) = t
            .transform(CellValue::String("sensitive".to_string()))
            .unwrap()
        else {
            panic!("expected string");
        };

        assert_eq!(first, second);
        assert_eq!(first.len(), "sensitive".len());
        assert_ne!(first, "sensitive");
    }

    #[test]
    fn rejects_non_string_values() {
        let t = StringTransformer::new(&ParameterValues::new()).unwrap();
        assert!(matches!(
            t.transform(CellValue::Bool(true)),
            Err(TransformerError::UnsupportedValueType)
        ));
    }
}
