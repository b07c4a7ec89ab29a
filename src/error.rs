use crate::instantiators::InstantiatorKind;

pub type Result<T, E = ConsistencyError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum ConsistencyError {
    #[error("Instantiation failed ({kind:?}): {reason}")]
    InstantiationFailed { kind: InstantiatorKind, reason: String },

    #[error("Elicitation failed for '{question}': {reason}")]
    ElicitationFailed { question: String, reason: String },

    #[error("Arbitrage infeasible: {0}")]
    ArbitrageInfeasible(String),

    #[error("Arbitrage did not converge after {iterations} iterations (regret {regret:.6})")]
    ArbitrageDidNotConverge { iterations: usize, regret: f64 },

    #[error("Invariant violated for {checker}: residual {residual:.6}")]
    InvariantViolated { checker: String, residual: f64 },

    #[error("Cache miss in read-only mode: {0}")]
    CacheMiss(String),

    #[error("Missing slot '{slot}' for checker {checker}")]
    MissingSlot { checker: String, slot: String },

    #[error("Unknown checker: {0}")]
    UnknownChecker(String),

    #[error("Response does not match schema: {0}")]
    Schema(String),

    #[error("Invalid question: {0}")]
    InvalidQuestion(String),

    #[error("Text generator error: {0}")]
    Generator(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Cache database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl ConsistencyError {
    /// Errors that only invalidate the tuple being processed.
    /// Everything else aborts the run.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            ConsistencyError::InstantiationFailed { .. }
                | ConsistencyError::ElicitationFailed { .. }
                | ConsistencyError::ArbitrageInfeasible(_)
                | ConsistencyError::ArbitrageDidNotConverge { .. }
                | ConsistencyError::InvariantViolated { .. }
                | ConsistencyError::MissingSlot { .. }
                | ConsistencyError::Schema(_)
                | ConsistencyError::InvalidQuestion(_)
                | ConsistencyError::Generator(_)
        )
    }

    /// Short label used in skip tallies.
    pub fn kind_label(&self) -> &'static str {
        match self {
            ConsistencyError::InstantiationFailed { .. } => "instantiation_failed",
            ConsistencyError::ElicitationFailed { .. } => "elicitation_failed",
            ConsistencyError::ArbitrageInfeasible(_) => "arbitrage_infeasible",
            ConsistencyError::ArbitrageDidNotConverge { .. } => "arbitrage_did_not_converge",
            ConsistencyError::InvariantViolated { .. } => "invariant_violated",
            ConsistencyError::CacheMiss(_) => "cache_miss",
            ConsistencyError::MissingSlot { .. } => "missing_slot",
            ConsistencyError::UnknownChecker(_) => "unknown_checker",
            ConsistencyError::Schema(_) => "schema",
            ConsistencyError::InvalidQuestion(_) => "invalid_question",
            ConsistencyError::Generator(_) => "generator",
            ConsistencyError::Config(_) => "config",
            ConsistencyError::Io(_) => "io",
            ConsistencyError::Json(_) => "json",
            ConsistencyError::Sqlite(_) => "sqlite",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locality() {
        let err = ConsistencyError::ElicitationFailed {
            question: "q".to_string(),
            reason: "not a probability".to_string(),
        };
        assert!(err.is_local());
        assert!(!ConsistencyError::CacheMiss("k".to_string()).is_local());
        assert!(!ConsistencyError::Config("bad".to_string()).is_local());
    }
}
