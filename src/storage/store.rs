//! The request state store contract.
//!
//! Every operation that can complete a request's data set returns, computed
//! inside the same exclusive section as the mutation, whether `generate_hint`
//! is owed: the request is ready, no publish was recorded with
//! [`HintStore::mark_hint_requested`] and no hint exists. Exactly one fresh
//! fill observes the transition; a redelivered fill observes it again only
//! while the publish that should have followed is missing.

use async_trait::async_trait;
use thiserror::Error;

use super::migrations::MigrationError;
use crate::models::{
    EnhancedProgram, EnhancementPhase, Hint, HintGenerationPhase, NewEnhancementPhase, NewHint,
    NewHintGenerationPhase, NewRequest, ProgramRun, Reflection, Request, TraceData,
};

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The entity already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// The entity does not exist.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[source] sqlx::Error),

    /// A stored value could not be decoded.
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),
}

impl StoreError {
    /// Returns true for failures that may go away on retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::ConnectionFailed(_) | StoreError::QueryFailed(_)
        )
    }
}

/// Postgres SQLSTATE for unique constraint violations.
const UNIQUE_VIOLATION: &str = "23505";

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row".to_string()),
            sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                StoreError::DuplicateKey(
                    db_err
                        .constraint()
                        .map(str::to_string)
                        .unwrap_or_else(|| db_err.message().to_string()),
                )
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::ConnectionFailed(err.to_string())
            }
            _ => StoreError::QueryFailed(err),
        }
    }
}

/// Transactional storage of requests and their phase records.
///
/// Implementations serialize every read-modify-write on one request through
/// a per-request exclusive section and lock the rows they rewrite.
#[async_trait]
pub trait HintStore: Send + Sync {
    /// Creates a request. Fails with `DuplicateKey` if the id is taken.
    async fn add_request(&self, request: NewRequest) -> Result<Request, StoreError>;

    async fn load_request(&self, request_id: i64) -> Result<Request, StoreError>;

    /// Records the student program's output and runtime.
    ///
    /// Filled once: if the pair is already set the call changes nothing and
    /// reports whether `generate_hint` is still owed (see
    /// [`HintStore::hint_request_pending`]).
    async fn update_request_with_test_results(
        &self,
        request_id: i64,
        output: String,
        run_time: f64,
    ) -> Result<(Request, bool), StoreError>;

    /// Creates the request's reflection. Fails with `DuplicateKey` on a second call.
    async fn add_reflection(
        &self,
        request_id: i64,
        question: String,
        answer: String,
    ) -> Result<(Reflection, bool), StoreError>;

    async fn load_reflection(&self, request_id: i64) -> Result<Option<Reflection>, StoreError>;

    /// Creates an enhancement phase and one unscored row per program, atomically.
    /// `model_n` is the number of programs.
    async fn add_enhancement_phase(
        &self,
        request_id: i64,
        phase: NewEnhancementPhase,
        programs: Vec<String>,
    ) -> Result<(EnhancementPhase, Vec<EnhancedProgram>), StoreError>;

    /// The most recently created phase of the request.
    async fn load_latest_enhancement_phase(
        &self,
        request_id: i64,
    ) -> Result<Option<EnhancementPhase>, StoreError>;

    /// Records the phase outcome. Filled once; later calls return the stored phase.
    async fn update_enhancement_phase_outcome(
        &self,
        phase_id: i64,
        n_correct_enhancements: i32,
        best_enhanced_program: Option<String>,
    ) -> Result<EnhancementPhase, StoreError>;

    async fn load_enhanced_program(&self, id: i64) -> Result<EnhancedProgram, StoreError>;

    /// The programs of a phase, in insertion order.
    async fn load_enhanced_programs(&self, phase_id: i64)
        -> Result<Vec<EnhancedProgram>, StoreError>;

    /// Records a program's verdict, output and runtime.
    ///
    /// Filled once: if the verdict is already set the call changes nothing
    /// and reports whether `generate_hint` is still owed.
    async fn update_enhanced_program(
        &self,
        id: i64,
        run: ProgramRun,
    ) -> Result<(EnhancedProgram, bool), StoreError>;

    /// Creates the hint generation phase and its hint in one transaction.
    async fn add_hint_generation(
        &self,
        request_id: i64,
        phase: NewHintGenerationPhase,
        hint: NewHint,
    ) -> Result<(HintGenerationPhase, Hint), StoreError>;

    /// Creates the request's hint. Fails with `DuplicateKey` if one exists.
    async fn add_hint(&self, request_id: i64, hint: NewHint) -> Result<Hint, StoreError>;

    async fn load_hint(&self, request_id: i64) -> Result<Option<Hint>, StoreError>;

    /// Everything recorded for a request, for delivery.
    async fn load_trace(&self, request_id: i64) -> Result<TraceData, StoreError>;

    /// Records that `generate_hint` was published. Keeps the first timestamp.
    async fn mark_hint_requested(&self, request_id: i64) -> Result<(), StoreError>;

    /// True when the request is ready but `generate_hint` was never recorded
    /// as published and no hint exists.
    async fn hint_request_pending(&self, request_id: i64) -> Result<bool, StoreError>;

    /// Whether the request has everything hint generation needs. No side effects.
    async fn is_ready(&self, request_id: i64) -> Result<bool, StoreError>;
}
