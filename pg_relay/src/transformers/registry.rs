use std::collections::HashMap;

use super::at_email::AtEmailTransformer;
use super::noop::NoopTransformer;
use super::string::StringTransformer;
use super::{ParameterValues, Transformer, TransformerConfig, TransformerError};

pub type BuilderFn = fn(&ParameterValues) -> Result<Box<dyn Transformer>, TransformerError>;

/// Maps transformer names to constructors. Populated with the built-in
/// catalogue at startup; third parties register additional builders without
/// touching the core.
pub struct TransformerRegistry {
    builders: HashMap<String, BuilderFn>,
}

impl TransformerRegistry {
    pub fn empty() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("noop", |_| Ok(Box::new(NoopTransformer)));
        registry.register("string", |params| {
            Ok(Box::new(StringTransformer::new(params)?))
        });
        registry.register("at_email", |params| {
            Ok(Box::new(AtEmailTransformer::new(params)?))
        });
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, builder: BuilderFn) {
        self.builders.insert(name.into(), builder);
    }

    pub fn build(
        &self,
        config: &TransformerConfig,
    ) -> Result<Box<dyn Transformer>, TransformerError> {
        let builder = self
            .builders
            .get(&config.name)
            .ok_or_else(|| TransformerError::UnsupportedTransformer(config.name.clone()))?;
        builder(&config.parameters)
    }
}

impl Default for TransformerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversions::cell::CellValue;

    #[test]
    fn builds_registered_transformers() {
        let registry = TransformerRegistry::with_defaults();
        let transformer = registry
            .build(&TransformerConfig {
                name: "noop".to_string(),
                parameters: ParameterValues::new(),
            })
            .unwrap();

        assert_eq!(
            transformer.transform(CellValue::Int(1)).unwrap(),
            CellValue::Int(1)
        );
    }

    #[test]
    fn unknown_names_are_rejected() {
        let registry = TransformerRegistry::with_defaults();
        let err = registry
            .build(&TransformerConfig {
                name: "invalid".to_string(),
                parameters: ParameterValues::new(),
            })
            .unwrap_err();

        assert!(matches!(
            err,
            TransformerError::UnsupportedTransformer(name) if name == "invalid"
        ));
    }

    #[test]
    fn third_parties_can_register() {
        let mut registry = TransformerRegistry::empty();
        registry.register("custom", |_| Ok(Box::new(NoopTransformer)));

        assert!(registry
            .build(&TransformerConfig {
                name: "custom".to_string(),
                parameters: ParameterValues::new(),
            })
            .is_ok());
    }
}
