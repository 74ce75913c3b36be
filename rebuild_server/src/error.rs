//! Error taxonomy for the rebuild engine.
//!
//! Planning and submission errors are split into transient and
//! structural/permanent variants; callers branch on `is_transient()`.

use thiserror::Error;

/// Persistence failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("planned build references unknown parent index {0}")]
    InvalidParent(usize),
}

impl StoreError {
    pub fn corrupt<E: std::fmt::Display>(e: E) -> Self {
        Self::Corrupt(e.to_string())
    }
}

/// Errors raised by the event/build services (store facade, scheduler,
/// aggregator).
#[derive(Debug, Error)]
pub enum RebuildError {
    #[error("invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("{entity} {id} kept changing under concurrent updates")]
    Contention { entity: &'static str, id: i64 },

    #[error("worker pool is shut down")]
    Shutdown,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures of the external metadata collaborator.
#[derive(Debug, Clone, Error)]
pub enum MetadataError {
    /// Network or service hiccup; the lookup can be retried.
    #[error("metadata lookup failed transiently: {0}")]
    Transient(String),

    /// The metadata does not exist or cannot be interpreted.
    #[error("metadata unavailable: {0}")]
    Unavailable(String),
}

impl MetadataError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Failures of the external build-system collaborator.
#[derive(Debug, Clone, Error)]
pub enum SubmitError {
    #[error("build system unreachable: {0}")]
    Transient(String),

    #[error("build system rejected the build: {0}")]
    Permanent(String),
}

impl SubmitError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Errors produced while computing the rebuild tree.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("transient planning error: {0}")]
    Transient(String),

    #[error("planning failed: {0}")]
    Structural(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PlanError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<MetadataError> for PlanError {
    fn from(e: MetadataError) -> Self {
        match e {
            MetadataError::Transient(msg) => Self::Transient(msg),
            MetadataError::Unavailable(msg) => Self::Structural(msg),
        }
    }
}

/// Outcome of a handler that could not complete.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Transient(String),

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Rebuild(#[from] RebuildError),
}

impl HandlerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<PlanError> for HandlerError {
    fn from(e: PlanError) -> Self {
        match e {
            PlanError::Transient(msg) => Self::Transient(msg),
            PlanError::Structural(msg) => Self::Failed(msg),
            PlanError::Store(e) => Self::Rebuild(RebuildError::Store(e)),
        }
    }
}

impl From<MetadataError> for HandlerError {
    fn from(e: MetadataError) -> Self {
        PlanError::from(e).into()
    }
}

impl From<StoreError> for HandlerError {
    fn from(e: StoreError) -> Self {
        Self::Rebuild(RebuildError::Store(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_errors_map_onto_planning_taxonomy() {
        let transient: PlanError = MetadataError::Transient("timeout".into()).into();
        assert!(transient.is_transient());

        let structural: PlanError = MetadataError::Unavailable("no advisory".into()).into();
        assert!(!structural.is_transient());
        assert!(matches!(structural, PlanError::Structural(_)));
    }

    #[test]
    fn plan_errors_keep_transience_through_handler_errors() {
        let err: HandlerError = PlanError::Transient("503".into()).into();
        assert!(err.is_transient());

        let err: HandlerError = PlanError::Structural("cycle".into()).into();
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "cycle");
    }
}
