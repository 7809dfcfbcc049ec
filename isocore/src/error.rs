use thiserror::Error;

/// Errors raised on degenerate inputs. Malformed distributions are rejected
/// at construction so the alignment and scoring code can assume well-formed
/// vectors throughout.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IsocoreError {
    #[error("isotopomer distribution must contain at least one fraction")]
    EmptyDistribution,

    #[error("fraction and confidence vectors differ in length ({fractions} vs {confidence})")]
    LengthMismatch { fractions: usize, confidence: usize },

    #[error("cannot align empty sequences")]
    EmptyAlignment,

    #[error("node {node} already holds an observation for experiment {experiment}")]
    DuplicateExperiment { node: String, experiment: String },
}

pub type Result<T> = std::result::Result<T, IsocoreError>;
