//! Stateful property testing for the job store.
//!
//! Drives a real in-memory `JobStore` and a plain reference model through
//! the same random sequence of submissions, claims, transitions and
//! cancellations, checking after every step that:
//!
//! - Claims pick the earliest-due waiting job (ties by submission order)
//! - Disallowed transitions are rejected and leave the job untouched
//! - Terminal jobs never change state again
//! - Removed jobs are gone for good

use chrono::{DateTime, Duration, Utc};
use proptest::prelude::*;
use proptest_state_machine::{ReferenceStateMachine, StateMachineTest, prop_state_machine};
use serde_json::json;

use postline_scheduler::{JobState, JobStore, JobUpdate, NewJob, SchedulerError};

/// Operations that can be performed on the store.
#[derive(Debug, Clone)]
pub enum StoreOp {
    /// Submit a job due `delay` seconds from now.
    Submit { delay: i64 },
    /// Move the clock forward.
    Advance { secs: i64 },
    /// Claim the next due job.
    Claim,
    /// Transition job `index` to a terminal state.
    Finish { index: usize, state: JobState },
    /// Send job `index` back to waiting, due `delay` seconds from now.
    Retry { index: usize, delay: i64 },
    /// Delete job `index`.
    Remove { index: usize },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelJob {
    pub state: JobState,
    pub due: i64,
}

/// Reference model: jobs by submission index, `None` once removed.
#[derive(Clone, Debug, Default)]
pub struct StoreModel {
    pub jobs: Vec<Option<ModelJob>>,
    /// Seconds since the test epoch.
    pub clock: i64,
    /// Index returned by the most recent claim.
    pub last_claimed: Option<usize>,
    /// Whether the most recent operation should have succeeded.
    pub last_ok: bool,
}

impl StoreModel {
    fn next_due(&self) -> Option<usize> {
        self.jobs
            .iter()
            .enumerate()
            .filter_map(|(index, job)| job.as_ref().map(|job| (index, job)))
            .filter(|(_, job)| job.state == JobState::Waiting && job.due <= self.clock)
            .min_by_key(|(index, job)| (job.due, *index))
            .map(|(index, _)| index)
    }

    fn transition(&mut self, index: usize, next: JobState, due: Option<i64>) {
        self.last_ok = match self.jobs.get_mut(index).and_then(Option::as_mut) {
            Some(job) if job.state.can_transition_to(next) => {
                job.state = next;
                if let Some(due) = due {
                    job.due = due;
                }
                true
            }
            _ => false,
        };
    }
}

fn terminal_state() -> impl Strategy<Value = JobState> {
    prop_oneof![
        Just(JobState::Completed),
        Just(JobState::Failed),
        Just(JobState::Cancelled),
    ]
}

impl ReferenceStateMachine for StoreModel {
    type State = Self;
    type Transition = StoreOp;

    fn init_state() -> BoxedStrategy<Self::State> {
        Just(Self::default()).boxed()
    }

    fn transitions(state: &Self::State) -> BoxedStrategy<Self::Transition> {
        let base = prop_oneof![
            3 => (60i64..600).prop_map(|delay| StoreOp::Submit { delay }),
            2 => (1i64..300).prop_map(|secs| StoreOp::Advance { secs }),
            3 => Just(StoreOp::Claim),
        ];

        if state.jobs.is_empty() {
            return base.boxed();
        }

        let count = state.jobs.len();
        prop_oneof![
            4 => base,
            2 => (0..count, terminal_state())
                .prop_map(|(index, state)| StoreOp::Finish { index, state }),
            1 => (0..count, 1i64..120).prop_map(|(index, delay)| StoreOp::Retry { index, delay }),
            1 => (0..count).prop_map(|index| StoreOp::Remove { index }),
        ]
        .boxed()
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        state.last_claimed = None;
        match transition {
            StoreOp::Submit { delay } => {
                state.jobs.push(Some(ModelJob {
                    state: JobState::Waiting,
                    due: state.clock + delay,
                }));
                state.last_ok = true;
            }
            StoreOp::Advance { secs } => {
                state.clock += secs;
                state.last_ok = true;
            }
            StoreOp::Claim => {
                state.last_claimed = state.next_due();
                if let Some(index) = state.last_claimed {
                    if let Some(job) = state.jobs[index].as_mut() {
                        job.state = JobState::Active;
                    }
                }
                state.last_ok = true;
            }
            StoreOp::Finish { index, state: next } => {
                state.transition(*index, *next, None);
            }
            StoreOp::Retry { index, delay } => {
                let due = state.clock + delay;
                state.transition(*index, JobState::Waiting, Some(due));
            }
            StoreOp::Remove { index } => {
                state.last_ok = state.jobs[*index].take().is_some();
            }
        }
        state
    }

    fn preconditions(state: &Self::State, transition: &Self::Transition) -> bool {
        match transition {
            StoreOp::Finish { index, .. }
            | StoreOp::Retry { index, .. }
            | StoreOp::Remove { index } => *index < state.jobs.len(),
            StoreOp::Submit { .. } | StoreOp::Advance { .. } | StoreOp::Claim => true,
        }
    }
}

/// Test harness wrapping a real in-memory store.
pub struct StoreHarness {
    store: JobStore,
    epoch: DateTime<Utc>,
    ids: Vec<String>,
    clock: i64,
}

impl StoreHarness {
    fn new() -> Self {
        // The store keeps millisecond precision
        let epoch = DateTime::from_timestamp_millis(Utc::now().timestamp_millis())
            .expect("current time out of range");
        Self {
            store: JobStore::open_in_memory().expect("Failed to open in-memory store"),
            epoch,
            ids: Vec::new(),
            clock: 0,
        }
    }

    fn at(&self, secs: i64) -> DateTime<Utc> {
        self.epoch + Duration::seconds(secs)
    }

    /// Apply `op`, returning the claimed index and whether the store accepted it.
    fn apply_operation(&mut self, op: &StoreOp) -> (Option<usize>, bool) {
        match op {
            StoreOp::Submit { delay } => {
                let due = self.clock + delay;
                let job = NewJob::new(
                    "http://localhost/cb",
                    json!({"due": due}),
                    vec![],
                    self.at(due),
                );
                let stored = self.store.put(job).expect("submit failed");
                self.ids.push(stored.id);
                (None, true)
            }
            StoreOp::Advance { secs } => {
                self.clock += secs;
                (None, true)
            }
            StoreOp::Claim => {
                let claimed = self
                    .store
                    .claim_due(self.at(self.clock))
                    .expect("claim failed");
                let index = claimed.map(|job| {
                    assert_eq!(job.state, JobState::Active);
                    self.ids
                        .iter()
                        .position(|id| *id == job.id)
                        .expect("claimed unknown job")
                });
                (index, true)
            }
            StoreOp::Finish { index, state } => {
                let result = self
                    .store
                    .update_state(&self.ids[*index], *state, JobUpdate::default());
                (None, self.accepted(result.map(|_| ())))
            }
            StoreOp::Retry { index, delay } => {
                let update = JobUpdate {
                    due_time: Some(self.at(self.clock + delay)),
                    ..Default::default()
                };
                let result = self
                    .store
                    .update_state(&self.ids[*index], JobState::Waiting, update);
                (None, self.accepted(result.map(|_| ())))
            }
            StoreOp::Remove { index } => {
                let result = self.store.remove(&self.ids[*index]);
                (None, self.accepted(result))
            }
        }
    }

    fn accepted(&self, result: Result<(), SchedulerError>) -> bool {
        match result {
            Ok(()) => true,
            Err(SchedulerError::NotFound(_) | SchedulerError::InvalidTransition { .. }) => false,
            Err(e) => panic!("unexpected store error: {e}"),
        }
    }

    fn verify_invariants(&self, model: &StoreModel) {
        let stored = self.store.list(None).expect("list failed");
        let expected: Vec<(&String, &ModelJob)> = self
            .ids
            .iter()
            .zip(model.jobs.iter())
            .filter_map(|(id, job)| job.as_ref().map(|job| (id, job)))
            .collect();

        assert_eq!(
            stored.len(),
            expected.len(),
            "job count mismatch: store {} vs model {}",
            stored.len(),
            expected.len()
        );

        for (job, (id, model_job)) in stored.iter().zip(expected) {
            assert_eq!(&job.id, id, "insertion order diverged");
            assert_eq!(job.state, model_job.state, "state mismatch for {}", id);
            assert_eq!(job.due_time, self.at(model_job.due), "due mismatch for {}", id);
        }
    }
}

impl StateMachineTest for StoreHarness {
    type SystemUnderTest = Self;
    type Reference = StoreModel;

    fn init_test(
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) -> Self::SystemUnderTest {
        Self::new()
    }

    fn apply(
        mut state: Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
        transition: <Self::Reference as ReferenceStateMachine>::Transition,
    ) -> Self::SystemUnderTest {
        let (claimed, ok) = state.apply_operation(&transition);
        assert_eq!(claimed, ref_state.last_claimed, "claimed the wrong job");
        assert_eq!(ok, ref_state.last_ok, "acceptance mismatch for {:?}", transition);
        state.verify_invariants(ref_state);
        state
    }

    fn check_invariants(
        state: &Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) {
        state.verify_invariants(ref_state);
    }
}

prop_state_machine! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        max_shrink_iters: 10000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn store_state_machine_test(sequential 1..60 => StoreHarness);
}
