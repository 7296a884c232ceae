//! Readiness of a request for hint generation.
//!
//! Readiness is recomputed from durable state on every mutation instead of
//! being tracked with a counter: phase completions arrive from independent
//! workers in any order, and only a fresh read under the request's exclusive
//! section gives every caller the same answer.

use std::fmt;

/// State of the latest enhancement phase, as seen by the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseProgress {
    /// Number of variants the phase asked for.
    pub model_n: i64,
    /// Rows belonging to the phase.
    pub created: i64,
    /// Rows with a correctness verdict.
    pub scored: i64,
}

/// The facts readiness depends on, read inside one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadinessSnapshot {
    pub request_exists: bool,
    /// Output and runtime of the student program are both set.
    pub has_test_results: bool,
    pub has_reflection: bool,
    /// `None` when no enhancement phase exists yet.
    pub latest_phase: Option<PhaseProgress>,
    /// `generate_hint` has been published and acknowledged by the store.
    pub hint_requested: bool,
    pub has_hint: bool,
}

/// First condition that keeps a request from being ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blocker {
    RequestMissing,
    StudentProgramNotRun,
    ReflectionMissing,
    EnhancementPhaseMissing,
    /// The phase does not own exactly `model_n` programs.
    ProgramsNotCreated { created: i64, expected: i64 },
    /// Some programs have no verdict yet.
    ProgramsNotRun { run: i64, created: i64 },
}

impl fmt::Display for Blocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Blocker::RequestMissing => write!(f, "request does not exist"),
            Blocker::StudentProgramNotRun => write!(f, "student program has not been run"),
            Blocker::ReflectionMissing => write!(f, "reflection not received"),
            Blocker::EnhancementPhaseMissing => write!(f, "no enhancement phase"),
            Blocker::ProgramsNotCreated { created, expected } => {
                write!(f, "{} of {} enhanced programs created", created, expected)
            }
            Blocker::ProgramsNotRun { run, created } => {
                write!(f, "{} of {} enhanced programs run", run, created)
            }
        }
    }
}

/// Outcome of a readiness evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReady(Blocker),
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

/// Decides whether a request has everything hint generation needs.
///
/// Conditions are checked in order and the first failing one is reported.
/// The program count must equal `model_n` exactly; an over-count is not ready.
pub fn evaluate(snapshot: &ReadinessSnapshot) -> Readiness {
    if !snapshot.request_exists {
        return Readiness::NotReady(Blocker::RequestMissing);
    }
    if !snapshot.has_test_results {
        return Readiness::NotReady(Blocker::StudentProgramNotRun);
    }
    if !snapshot.has_reflection {
        return Readiness::NotReady(Blocker::ReflectionMissing);
    }

    let Some(phase) = snapshot.latest_phase else {
        return Readiness::NotReady(Blocker::EnhancementPhaseMissing);
    };

    if phase.created != phase.model_n {
        return Readiness::NotReady(Blocker::ProgramsNotCreated {
            created: phase.created,
            expected: phase.model_n,
        });
    }
    if phase.scored != phase.created {
        return Readiness::NotReady(Blocker::ProgramsNotRun {
            run: phase.scored,
            created: phase.created,
        });
    }

    Readiness::Ready
}

/// Whether `generate_hint` still has to be published for the request.
///
/// True when the request is ready, no `generate_hint` publication has been
/// recorded and no hint exists. A mutation that made the request ready but
/// whose publish failed leaves this true, so the retried task publishes it.
pub fn hint_request_due(snapshot: &ReadinessSnapshot) -> bool {
    evaluate(snapshot).is_ready() && !snapshot.hint_requested && !snapshot.has_hint
}

/// [`hint_request_due`], logging the blocker tagged with the request id.
pub(crate) fn hint_request_due_logged(request_id: i64, snapshot: &ReadinessSnapshot) -> bool {
    match evaluate(snapshot) {
        Readiness::Ready if hint_request_due(snapshot) => {
            tracing::info!(request_id, "Request is ready for hint generation");
            true
        }
        Readiness::Ready => {
            tracing::debug!(request_id, "Request ready, hint generation already requested");
            false
        }
        Readiness::NotReady(blocker) => {
            tracing::debug!(request_id, blocker = %blocker, "Request not ready");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_snapshot() -> ReadinessSnapshot {
        ReadinessSnapshot {
            request_exists: true,
            has_test_results: true,
            has_reflection: true,
            latest_phase: Some(PhaseProgress {
                model_n: 3,
                created: 3,
                scored: 3,
            }),
            hint_requested: false,
            has_hint: false,
        }
    }

    #[test]
    fn test_complete_snapshot_is_ready() {
        assert_eq!(evaluate(&complete_snapshot()), Readiness::Ready);
        assert!(evaluate(&complete_snapshot()).is_ready());
    }

    #[test]
    fn test_missing_request() {
        let snapshot = ReadinessSnapshot::default();
        assert_eq!(
            evaluate(&snapshot),
            Readiness::NotReady(Blocker::RequestMissing)
        );
    }

    #[test]
    fn test_conditions_reported_in_order() {
        let mut snapshot = complete_snapshot();
        snapshot.has_test_results = false;
        snapshot.has_reflection = false;
        assert_eq!(
            evaluate(&snapshot),
            Readiness::NotReady(Blocker::StudentProgramNotRun)
        );

        snapshot.has_test_results = true;
        assert_eq!(
            evaluate(&snapshot),
            Readiness::NotReady(Blocker::ReflectionMissing)
        );

        snapshot.has_reflection = true;
        snapshot.latest_phase = None;
        assert_eq!(
            evaluate(&snapshot),
            Readiness::NotReady(Blocker::EnhancementPhaseMissing)
        );
    }

    #[test]
    fn test_requires_exact_count_and_all_scored() {
        let mut snapshot = complete_snapshot();
        snapshot.latest_phase = Some(PhaseProgress {
            model_n: 3,
            created: 3,
            scored: 2,
        });
        assert_eq!(
            evaluate(&snapshot),
            Readiness::NotReady(Blocker::ProgramsNotRun { run: 2, created: 3 })
        );

        snapshot.latest_phase = Some(PhaseProgress {
            model_n: 3,
            created: 3,
            scored: 3,
        });
        assert!(evaluate(&snapshot).is_ready());
    }

    #[test]
    fn test_over_count_is_not_ready() {
        let mut snapshot = complete_snapshot();
        snapshot.latest_phase = Some(PhaseProgress {
            model_n: 3,
            created: 4,
            scored: 4,
        });
        assert_eq!(
            evaluate(&snapshot),
            Readiness::NotReady(Blocker::ProgramsNotCreated {
                created: 4,
                expected: 3
            })
        );
    }

    #[test]
    fn test_hint_request_due_once() {
        let mut snapshot = complete_snapshot();
        assert!(hint_request_due(&snapshot));

        snapshot.hint_requested = true;
        assert!(evaluate(&snapshot).is_ready());
        assert!(!hint_request_due(&snapshot));

        snapshot.hint_requested = false;
        snapshot.has_hint = true;
        assert!(!hint_request_due(&snapshot));

        snapshot.has_hint = false;
        snapshot.has_reflection = false;
        assert!(!hint_request_due(&snapshot));
    }

    #[test]
    fn test_blocker_display() {
        let blocker = Blocker::ProgramsNotRun { run: 1, created: 5 };
        assert_eq!(blocker.to_string(), "1 of 5 enhanced programs run");
    }
}
