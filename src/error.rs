use thiserror::Error;

/// Errors reported by the matcher.
///
/// Both kinds indicate bad data from upstream rather than a transient
/// condition; retrying the same call yields the same error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MatchError {
    /// The query is empty or the threshold is not a positive number.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    /// A candidate descriptor has a different length than the query.
    #[error("dimension mismatch at candidate {index}: expected {expected}, found {found}")]
    DimensionMismatch {
        expected: usize,
        found: usize,
        index: usize,
    },
}
