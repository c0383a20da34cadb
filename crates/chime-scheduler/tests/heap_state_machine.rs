//! Stateful property testing for the timer heap.
//!
//! Uses proptest-state-machine to drive `TimerHeap` through random
//! insert/pop/remove sequences against a sorted-vector model. The model
//! tracks:
//!
//! - Pop order by (due time, insertion sequence)
//! - Replacement of an id that is already queued
//! - Removal of arbitrary ids

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use proptest_state_machine::{ReferenceStateMachine, StateMachineTest, prop_state_machine};

use chime_scheduler::{Job, JobType, Payload, Schedule, TimerHeap};

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
}

fn job(id: &str) -> Job {
    let mut job = Job::new(
        JobType::Email,
        Schedule::OneTime {
            at: base() + Duration::days(1),
        },
        Payload::new(),
        0,
        base(),
    )
    .unwrap();
    job.id = id.to_string();
    job
}

/// Operations that can be performed on the heap.
#[derive(Debug, Clone)]
pub enum HeapOperation {
    /// Insert (or replace) a job due `offset` seconds after base.
    Insert { id: u8, offset: i64 },
    /// Pop the minimum.
    Pop,
    /// Remove a job by id.
    Remove { id: u8 },
    /// Pop everything due at or before `offset`.
    PopDue { offset: i64 },
}

/// Reference model: entries kept sorted by (due, seq).
#[derive(Clone, Debug, Default)]
pub struct HeapModel {
    entries: Vec<(i64, u64, u8)>,
    next_seq: u64,
}

impl HeapModel {
    fn insert(&mut self, id: u8, offset: i64) {
        self.remove(id);
        self.entries.push((offset, self.next_seq, id));
        self.next_seq += 1;
        self.entries.sort();
    }

    fn remove(&mut self, id: u8) -> Option<(i64, u64, u8)> {
        let pos = self.entries.iter().position(|e| e.2 == id)?;
        Some(self.entries.remove(pos))
    }

    fn pop(&mut self) -> Option<(i64, u64, u8)> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0))
        }
    }
}

impl ReferenceStateMachine for HeapModel {
    type State = Self;
    type Transition = HeapOperation;

    fn init_state() -> BoxedStrategy<Self::State> {
        Just(Self::default()).boxed()
    }

    fn transitions(_state: &Self::State) -> BoxedStrategy<Self::Transition> {
        prop_oneof![
            // Narrow ranges so ties and replacements are common
            5 => (0u8..16, 0i64..20).prop_map(|(id, offset)| HeapOperation::Insert { id, offset }),
            2 => Just(HeapOperation::Pop),
            2 => (0u8..16).prop_map(|id| HeapOperation::Remove { id }),
            1 => (0i64..20).prop_map(|offset| HeapOperation::PopDue { offset }),
        ]
        .boxed()
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        match transition {
            HeapOperation::Insert { id, offset } => state.insert(*id, *offset),
            HeapOperation::Pop => {
                state.pop();
            }
            HeapOperation::Remove { id } => {
                state.remove(*id);
            }
            HeapOperation::PopDue { offset } => {
                while state.entries.first().is_some_and(|e| e.0 <= *offset) {
                    state.pop();
                }
            }
        }
        state
    }
}

/// The heap under test, with a private model to check each result.
pub struct HeapHarness {
    heap: TimerHeap,
    model: HeapModel,
}

impl HeapHarness {
    fn apply_operation(&mut self, op: &HeapOperation) {
        match op {
            HeapOperation::Insert { id, offset } => {
                let had = self.model.entries.iter().any(|e| e.2 == *id);
                let replaced = self
                    .heap
                    .insert(job(&id.to_string()), base() + Duration::seconds(*offset));
                assert_eq!(replaced.is_some(), had, "replacement mismatch for {id}");
                self.model.insert(*id, *offset);
            }
            HeapOperation::Pop => {
                let popped = self.heap.pop().map(|e| e.job.id);
                let expected = self.model.pop().map(|e| e.2.to_string());
                assert_eq!(popped, expected);
            }
            HeapOperation::Remove { id } => {
                let removed = self.heap.remove(&id.to_string()).map(|e| e.due);
                let expected = self
                    .model
                    .remove(*id)
                    .map(|e| base() + Duration::seconds(e.0));
                assert_eq!(removed, expected);
            }
            HeapOperation::PopDue { offset } => {
                let now = base() + Duration::seconds(*offset);
                while let Some(entry) = self.heap.pop_due(now) {
                    let expected = self.model.pop().map(|e| e.2.to_string());
                    assert_eq!(Some(entry.job.id), expected);
                }
                assert!(
                    self.model.entries.first().is_none_or(|e| e.0 > *offset),
                    "pop_due left a due entry behind"
                );
            }
        }
    }
}

impl StateMachineTest for HeapHarness {
    type SystemUnderTest = Self;
    type Reference = HeapModel;

    fn init_test(
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) -> Self::SystemUnderTest {
        Self {
            heap: TimerHeap::new(),
            model: HeapModel::default(),
        }
    }

    fn apply(
        mut state: Self::SystemUnderTest,
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
        transition: <Self::Reference as ReferenceStateMachine>::Transition,
    ) -> Self::SystemUnderTest {
        state.apply_operation(&transition);
        state
    }

    fn check_invariants(
        state: &Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) {
        // Invariant: size matches the reference
        assert_eq!(state.heap.len(), ref_state.entries.len());
        assert_eq!(state.heap.is_empty(), ref_state.entries.is_empty());

        // Invariant: root is the reference minimum
        let expected_min = ref_state
            .entries
            .first()
            .map(|e| base() + Duration::seconds(e.0));
        assert_eq!(state.heap.next_due(), expected_min);
        assert_eq!(
            state.heap.peek().map(|e| e.job.id.clone()),
            ref_state.entries.first().map(|e| e.2.to_string())
        );

        // Invariant: every queued id is findable
        for (_, _, id) in &ref_state.entries {
            assert!(state.heap.contains(&id.to_string()), "lost id {id}");
        }
    }
}

prop_state_machine! {
    #![proptest_config(ProptestConfig {
        // Use fewer cases for CI
        cases: 50,
        max_shrink_iters: 5000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn heap_state_machine_test(sequential 1..60 => HeapHarness);
}
