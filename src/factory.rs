//! External collaborator interfaces (§6): the training algorithm and the
//! row preprocessing step are deliberately out of scope as *trainable
//! functionality* (§1), so this module defines only the seams a real
//! implementation plugs into, plus one small deterministic reference
//! implementation of each for tests and as a usage example.

use std::collections::HashMap;
use std::sync::Arc;

use crate::ast::{root, Environment, Node, Opcode};
use crate::dataset::Dataset;
use crate::error::Error;
use crate::value::Value;

/// Builds a prediction program from a dataset and an opaque transforms
/// string, scoring it (lower is better). Resolved by name from a
/// `FactoryRegistry`; the core never inspects training internals.
pub trait Factory: Send + Sync {
    fn train(&self, dataset: &Dataset, transforms: &str) -> Result<(Node, i32), Error>;
}

/// Resolves factory names to implementations, mirroring how `var`/`category`
/// opcodes resolve row indices: by name, with an explicit unknown-name error
/// rather than a panic.
#[derive(Clone, Default)]
pub struct FactoryRegistry {
    factories: HashMap<String, Arc<dyn Factory>>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, factory: Arc<dyn Factory>) {
        self.factories.insert(name.into(), factory);
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Factory>, Error> {
        self.factories
            .get(name)
            .cloned()
            .ok_or_else(|| Error::FactoryUnknown(name.to_string()))
    }
}

/// Optional row transform applied before prediction (the "wordmap" input
/// preprocessing, §1/§6); the core only defines the seam and a no-op.
pub trait RowPreprocessor: Send + Sync {
    fn preprocess(&self, env: Environment) -> Environment;
}

pub struct IdentityPreprocessor;

impl RowPreprocessor for IdentityPreprocessor {
    fn preprocess(&self, env: Environment) -> Environment {
        env
    }
}

/// A reference `Factory`: predicts the most common category in the
/// dataset's last column, scoring by misclassification count on the
/// training rows themselves. Not a real training algorithm -- a usage
/// example and a deterministic fixture for the dispatch/protocol tests.
pub struct MajorityClassFactory;

impl Factory for MajorityClassFactory {
    fn train(&self, dataset: &Dataset, _transforms: &str) -> Result<(Node, i32), Error> {
        let label_col = dataset
            .columns
            .len()
            .checked_sub(1)
            .ok_or(Error::TypeMismatch {
                expected: "at least one column",
                actual: "empty dataset",
            })?;

        let mut counts: HashMap<u32, usize> = HashMap::new();
        for row in &dataset.rows {
            if let Some(Value::Category(c)) = row.get(label_col) {
                *counts.entry(*c).or_insert(0) += 1;
            }
        }

        let majority = counts
            .iter()
            .max_by_key(|(_, count)| **count)
            .map(|(c, _)| *c)
            .unwrap_or(0);

        let misclassified = dataset
            .rows
            .iter()
            .filter(|row| row.get(label_col) != Some(&Value::Category(majority)))
            .count();

        let tree = root(Node::leaf(Opcode::Category, Value::Category(majority)));
        Ok((tree, misclassified as i32))
    }
}

/// Always sleeps far longer than any realistic `remote_worker_timeout` --
/// a deterministic fixture for exercising worker-timeout cancellation
/// (S6), playing the same role `MajorityClassFactory` plays for the
/// ordinary training path.
pub struct SleepyFactory;

impl Factory for SleepyFactory {
    fn train(&self, _dataset: &Dataset, _transforms: &str) -> Result<(Node, i32), Error> {
        std::thread::sleep(std::time::Duration::from_secs(3600));
        Ok((root(Node::leaf(Opcode::Category, Value::Category(0))), 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::eval;
    use crate::dataset::{Column, ColumnType};

    fn dataset() -> Dataset {
        Dataset::new(
            vec![
                Column {
                    name: "x0".into(),
                    kind: ColumnType::Continuous,
                },
                Column {
                    name: "label".into(),
                    kind: ColumnType::Categorical,
                },
            ],
            vec![
                vec![Value::Float(1.0), Value::Category(1)],
                vec![Value::Float(2.0), Value::Category(1)],
                vec![Value::Float(3.0), Value::Category(2)],
            ],
        )
    }

    #[test]
    fn majority_class_factory_predicts_most_common_label() {
        let (tree, score) = MajorityClassFactory.train(&dataset(), "").unwrap();
        assert_eq!(eval(&tree, &Environment::default()).unwrap(), Value::Category(1));
        assert_eq!(score, 1);
    }

    #[test]
    fn registry_reports_unknown_factory_by_name() {
        let registry = FactoryRegistry::new();
        assert!(registry.resolve("nonexistent").is_err());
    }

    #[test]
    fn registry_resolves_registered_factory() {
        let mut registry = FactoryRegistry::new();
        registry.register("majority", Arc::new(MajorityClassFactory));
        assert!(registry.resolve("majority").is_ok());
    }
}
