use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("unknown resolution strategy: {0}")]
    UnknownStrategy(String),

    #[error("unknown user choice: {0}")]
    UnknownChoice(String),

    #[error("unknown conflict kind: {0}")]
    UnknownConflictKind(String),

    #[error("clock error: {0}")]
    Clock(String),
}
