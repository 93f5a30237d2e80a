use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::conversions::change_event::ChangeEvent;
use crate::transformers::{Transformer, TransformerConfig, TransformerError, TransformerRegistry};

use super::{Processor, ProcessorError};

/// Per-table transformer rules, as loaded from the rules file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransformerRules {
    #[serde(default)]
    pub transformers: Vec<TableRules>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableRules {
    pub schema: String,
    pub table: String,
    #[serde(default)]
    pub column_rules: HashMap<String, TransformerConfig>,
}

#[derive(Debug, Error)]
pub enum TransformerRulesError {
    #[error("reading transformer rules: {0}")]
    Io(#[from] std::io::Error),

    #[error("parsing transformer rules: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Transformer(#[from] TransformerError),
}

impl TransformerRules {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TransformerRulesError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }
}

type ColumnTransformers = HashMap<String, Box<dyn Transformer>>;

/// Applies per-(schema, table, column) value transformations before events
/// reach the batcher. Events without matching rules pass through untouched.
pub struct TransformerProcessor<P: Processor> {
    transformer_map: HashMap<String, ColumnTransformers>,
    next: P,
}

impl<P: Processor> TransformerProcessor<P> {
    pub fn new(
        rules: &TransformerRules,
        registry: &TransformerRegistry,
        next: P,
    ) -> Result<Self, TransformerRulesError> {
        Ok(Self {
            transformer_map: transformer_map_from_rules(rules, registry)?,
            next,
        })
    }
}

fn transformer_map_from_rules(
    rules: &TransformerRules,
    registry: &TransformerRegistry,
) -> Result<HashMap<String, ColumnTransformers>, TransformerRulesError> {
    let mut map = HashMap::new();
    for table_rules in &rules.transformers {
        let key = format!("{}/{}", table_rules.schema, table_rules.table);
        let mut column_transformers = ColumnTransformers::new();
        for (column, config) in &table_rules.column_rules {
            column_transformers.insert(column.clone(), registry.build(config)?);
        }
        map.insert(key, column_transformers);
    }
    Ok(map)
}

#[async_trait]
impl<P: Processor> Processor for TransformerProcessor<P> {
    async fn process_event(&self, mut event: ChangeEvent) -> Result<(), ProcessorError> {
        let key = format!("{}/{}", event.schema, event.table);
        if let Some(column_transformers) = self.transformer_map.get(&key) {
            for column in event.columns.iter_mut().chain(event.identity.iter_mut()) {
                if column.value.is_null() {
                    continue;
                }
                if let Some(transformer) = column_transformers.get(&column.name) {
                    column.value = transformer.transform(column.value.clone())?;
                }
            }
        }
        self.next.process_event(event).await
    }
}
