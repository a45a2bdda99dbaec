//! Allowed job state transitions and constructors for each of them.
//!
//! ```text
//! CREATED ──debit──▶ DEBITED ──submit──▶ SUBMITTED ──▶ SUCCEEDED
//!    │                  │                    │
//!    └──────────────────┴────────────────────┴────────▶ FAILED
//! ```
//!
//! SUCCEEDED and FAILED are terminal. Nothing in here touches storage: the store applies a
//! [`JobTransition`] as a compare-and-set against the state the caller observed.

use chrono::{DateTime, Utc};

use super::types::{FailureReason, JobState, JobTransition};

impl JobState {
    /// Whether `self → next` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Created, Debited)
                | (Created, Failed)
                | (Debited, Submitted)
                | (Debited, Failed)
                | (Submitted, Succeeded)
                | (Submitted, Failed)
        )
    }
}

impl JobTransition {
    fn to(state: JobState) -> Self {
        Self {
            to: state,
            external_correlation_id: None,
            result_ref: None,
            failure_reason: None,
            failure_detail: None,
            submitted_at: None,
            next_poll_at: None,
        }
    }

    pub fn debited() -> Self {
        Self::to(JobState::Debited)
    }

    /// Provider accepted the job. The first status poll is scheduled at `first_poll_at`.
    pub fn submitted(correlation_id: impl Into<String>, now: DateTime<Utc>, first_poll_at: DateTime<Utc>) -> Self {
        Self {
            external_correlation_id: Some(correlation_id.into()),
            submitted_at: Some(now),
            next_poll_at: Some(first_poll_at),
            ..Self::to(JobState::Submitted)
        }
    }

    pub fn succeeded(result_ref: Option<String>) -> Self {
        Self {
            result_ref,
            ..Self::to(JobState::Succeeded)
        }
    }

    pub fn failed(reason: FailureReason, detail: Option<String>) -> Self {
        Self {
            failure_reason: Some(reason),
            failure_detail: detail,
            ..Self::to(JobState::Failed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use JobState::*;

    #[rstest]
    #[case(Created, Debited)]
    #[case(Created, Failed)]
    #[case(Debited, Submitted)]
    #[case(Debited, Failed)]
    #[case(Submitted, Succeeded)]
    #[case(Submitted, Failed)]
    fn test_forward_edges_are_allowed(#[case] from: JobState, #[case] to: JobState) {
        assert!(from.can_transition_to(to));
    }

    #[rstest]
    #[case(Created, Submitted)]
    #[case(Created, Succeeded)]
    #[case(Debited, Created)]
    #[case(Debited, Succeeded)]
    #[case(Submitted, Debited)]
    #[case(Submitted, Submitted)]
    #[case(Succeeded, Failed)]
    #[case(Failed, Succeeded)]
    #[case(Failed, Failed)]
    fn test_other_edges_are_rejected(#[case] from: JobState, #[case] to: JobState) {
        assert!(!from.can_transition_to(to));
    }

    #[test]
    fn test_terminal_states_have_no_outgoing_edges() {
        for terminal in [Succeeded, Failed] {
            assert!(terminal.is_terminal());
            for next in [Created, Debited, Submitted, Succeeded, Failed] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_submitted_records_correlation_and_schedule() {
        let now = Utc::now();
        let first_poll = now + chrono::Duration::seconds(30);
        let transition = JobTransition::submitted("pred-1", now, first_poll);
        assert_eq!(transition.to, Submitted);
        assert_eq!(transition.external_correlation_id.as_deref(), Some("pred-1"));
        assert_eq!(transition.submitted_at, Some(now));
        assert_eq!(transition.next_poll_at, Some(first_poll));
    }

    #[test]
    fn test_failed_clears_poll_schedule() {
        let transition = JobTransition::failed(FailureReason::Timeout, Some("no signal".into()));
        assert_eq!(transition.to, Failed);
        assert_eq!(transition.failure_reason, Some(FailureReason::Timeout));
        assert_eq!(transition.next_poll_at, None);
    }
}
