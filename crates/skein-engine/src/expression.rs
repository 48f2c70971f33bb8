//! Expression capability and template resolution.
//!
//! Stage inputs and the workflow output are *templates*: value trees whose
//! leaves may be expressions. The resolver walks a template and replaces
//! every expression leaf with its evaluation against the current data model,
//! preserving structure and keys. The expression language itself lives
//! behind the [`Expression`] trait; [`JexlExpression`] is the bundled
//! implementation.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::context::WorkflowContext;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from expression evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("failed to evaluate expression '{expression}': {message}")]
    EvalFailed { expression: String, message: String },
}

// ---------------------------------------------------------------------------
// Expression
// ---------------------------------------------------------------------------

/// An expression evaluated against the live data model.
///
/// Evaluation receives the full data model
/// (`{input, steps.<id>.<stage>.<output>}`) and the immutable workflow
/// context byte-mapping. The `Display` form is used in diagnostics.
pub trait Expression: fmt::Debug + fmt::Display + Send + Sync {
    fn evaluate(
        &self,
        data_model: &Value,
        workflow_context: &WorkflowContext,
    ) -> Result<Value, ExpressionError>;
}

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

/// A value tree with embedded expression leaves.
///
/// Mappings and sequences are recursed into during resolution; keys are
/// never evaluated. Literal leaves are returned as-is.
#[derive(Debug, Clone)]
pub enum Template {
    /// A plain value, passed through unchanged.
    Literal(Value),
    /// An expression leaf, replaced by its evaluation.
    Expr(Arc<dyn Expression>),
    /// An ordered sequence of templates.
    Seq(Vec<Template>),
    /// A mapping of templates, keyed by string.
    Map(BTreeMap<String, Template>),
}

impl Template {
    /// A literal leaf.
    pub fn literal(value: impl Into<Value>) -> Self {
        Template::Literal(value.into())
    }

    /// An expression leaf.
    pub fn expr(expression: impl Expression + 'static) -> Self {
        Template::Expr(Arc::new(expression))
    }
}

impl From<Value> for Template {
    fn from(value: Value) -> Self {
        Template::Literal(value)
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Resolve a template against the data model, replacing every expression
/// leaf with its evaluated result.
///
/// The first evaluation failure is surfaced; nothing is partially mutated
/// (the input template is untouched, the output is built fresh).
pub fn resolve_expressions(
    template: &Template,
    data_model: &Value,
    workflow_context: &WorkflowContext,
) -> Result<Value, ExpressionError> {
    match template {
        Template::Literal(value) => Ok(value.clone()),
        Template::Expr(expression) => {
            tracing::debug!(expression = %expression, "evaluating expression");
            expression.evaluate(data_model, workflow_context)
        }
        Template::Seq(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(resolve_expressions(item, data_model, workflow_context)?);
            }
            Ok(Value::Array(out))
        }
        Template::Map(entries) => {
            let mut out = Map::with_capacity(entries.len());
            for (key, item) in entries {
                out.insert(
                    key.clone(),
                    resolve_expressions(item, data_model, workflow_context)?,
                );
            }
            Ok(Value::Object(out))
        }
    }
}

// ---------------------------------------------------------------------------
// JexlExpression
// ---------------------------------------------------------------------------

/// A JEXL expression evaluated against the data model.
///
/// Covers dotted-path references (`steps.a.exec.done.msg`, `input.x`) as
/// well as general JEXL operators. The workflow context is not reachable
/// from JEXL; implementations that need the byte side-channel provide their
/// own [`Expression`].
#[derive(Debug, Clone)]
pub struct JexlExpression {
    source: String,
}

impl JexlExpression {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

impl fmt::Display for JexlExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Expression for JexlExpression {
    fn evaluate(
        &self,
        data_model: &Value,
        _workflow_context: &WorkflowContext,
    ) -> Result<Value, ExpressionError> {
        jexl_eval::Evaluator::new()
            .eval_in_context(&self.source, data_model)
            .map_err(|e| ExpressionError::EvalFailed {
                expression: self.source.clone(),
                message: e.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
