//! Declarative message transforms

use serde_json::Value;

use crate::error::TransformError;

/// Reshapes a parsed message before it is published.
pub trait Transform: Send + Sync {
    fn evaluate(&self, input: &Value) -> Result<Value, TransformError>;
}

/// Transform backed by a JMESPath expression, compiled once up front.
pub struct JmesPathTransform {
    expression: jmespath::Expression<'static>,
}

impl JmesPathTransform {
    pub fn compile(source: &str) -> Result<Self, TransformError> {
        let expression =
            jmespath::compile(source).map_err(|e| TransformError::Compile(e.to_string()))?;
        Ok(Self { expression })
    }

    pub fn source(&self) -> &str {
        self.expression.as_str()
    }
}

impl Transform for JmesPathTransform {
    fn evaluate(&self, input: &Value) -> Result<Value, TransformError> {
        let result = self
            .expression
            .search(input)
            .map_err(|e| TransformError::Evaluate(e.to_string()))?;
        serde_json::to_value(&*result).map_err(|e| TransformError::Evaluate(e.to_string()))
    }
}
