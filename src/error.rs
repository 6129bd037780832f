//! Error type shared by every component of the trainer.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::tensor::Shape;

/// Which kind of tensor a non-finite value was found in.
///
/// The distinction matters: a bad gradient can be skipped, a bad parameter
/// cannot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueRole {
    Gradient,
    Parameter,
    Activation,
}

impl fmt::Display for ValueRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueRole::Gradient => "gradient",
            ValueRole::Parameter => "parameter",
            ValueRole::Activation => "activation",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum LstmError {
    #[error("{kind} `{key}` not found")]
    NotFound { kind: &'static str, key: String },

    #[error("shape mismatch in {context}: expected {expected} elements, found {found}")]
    ShapeMismatch {
        context: String,
        expected: usize,
        found: usize,
    },

    #[error("non-finite value in {role} `{tensor}`{}", describe_location(.layer, .timestep))]
    NonFiniteValue {
        role: ValueRole,
        tensor: String,
        layer: Option<usize>,
        timestep: Option<usize>,
    },

    #[error("resource exhausted allocating {elements} elements for tensor {shape}")]
    ResourceExhausted { shape: Shape, elements: usize },

    #[error("invalid sequence: {0}")]
    InvalidSequence(String),

    /// Model dimensions, session names or record ids that cannot be used.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LstmError>;

impl LstmError {
    pub fn not_found(kind: &'static str, key: impl fmt::Display) -> Self {
        LstmError::NotFound { kind, key: key.to_string() }
    }

    pub fn shape_mismatch(context: impl Into<String>, expected: usize, found: usize) -> Self {
        LstmError::ShapeMismatch { context: context.into(), expected, found }
    }

    pub fn non_finite(role: ValueRole, tensor: impl Into<String>) -> Self {
        LstmError::NonFiniteValue { role, tensor: tensor.into(), layer: None, timestep: None }
    }

    /// Attach a layer id to a `NonFiniteValue`; other kinds pass through.
    pub fn at_layer(self, id: usize) -> Self {
        match self {
            LstmError::NonFiniteValue { role, tensor, timestep, .. } => {
                LstmError::NonFiniteValue { role, tensor, layer: Some(id), timestep }
            }
            other => other,
        }
    }

    /// Attach a timestep to a `NonFiniteValue`; other kinds pass through.
    pub fn at_timestep(self, t: usize) -> Self {
        match self {
            LstmError::NonFiniteValue { role, tensor, layer, .. } => {
                LstmError::NonFiniteValue { role, tensor, layer, timestep: Some(t) }
            }
            other => other,
        }
    }

    /// Only a non-finite gradient is locally recoverable (the update for that
    /// parameter is skipped). Everything else aborts training.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, LstmError::NonFiniteValue { role: ValueRole::Gradient, .. })
    }
}

fn describe_location(layer: &Option<usize>, timestep: &Option<usize>) -> String {
    match (layer, timestep) {
        (Some(l), Some(t)) => format!(" (layer {}, timestep {})", l, t),
        (Some(l), None) => format!(" (layer {})", l),
        (None, Some(t)) => format!(" (timestep {})", t),
        (None, None) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_gradient_non_finite_is_recoverable() {
        assert!(LstmError::non_finite(ValueRole::Gradient, "w_f").is_recoverable());
        assert!(!LstmError::non_finite(ValueRole::Parameter, "w_f").is_recoverable());
        assert!(!LstmError::non_finite(ValueRole::Activation, "hidden_next").is_recoverable());
        assert!(!LstmError::not_found("timestep", 3).is_recoverable());
    }

    #[test]
    fn message_carries_location() {
        let err = LstmError::non_finite(ValueRole::Parameter, "u_o").at_layer(8).at_timestep(2);
        let msg = err.to_string();
        assert!(msg.contains("parameter `u_o`"), "{}", msg);
        assert!(msg.contains("layer 8, timestep 2"), "{}", msg);
    }
}
