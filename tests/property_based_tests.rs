use mediaflow_core::progress::{AdvanceMode, ProgressTracker};
use mediaflow_core::stages::{Stage, StageDefinition, StageError};
use proptest::prelude::*;

/// Snake-case stage ids with strictly increasing progress in 1..100
fn valid_stage_list() -> impl Strategy<Value = Vec<Stage>> {
    prop::collection::btree_set(1i32..100, 1..8).prop_map(|progresses| {
        progresses
            .into_iter()
            .enumerate()
            .map(|(i, progress)| Stage::new(format!("stage_{i}"), progress).unwrap())
            .collect()
    })
}

#[derive(Debug, Clone)]
enum Step {
    Next(u32),
    Substep,
    SetSubstep(u32),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0u32..6).prop_map(Step::Next),
        Just(Step::Substep),
        (0u32..10).prop_map(Step::SetSubstep),
    ]
}

proptest! {
    /// Property: accepted stage lists are strictly increasing with unique ids
    #[test]
    fn accepted_stage_lists_are_strictly_increasing(stages in valid_stage_list()) {
        let definition = StageDefinition::validated(stages).unwrap();
        let all = definition.all_stages();
        prop_assert_eq!(all.first().map(|s| s.id.as_str()), Some("initializing"));
        prop_assert_eq!(all.last().map(|s| s.id.as_str()), Some("complete"));
        for pair in all[..all.len() - 1].windows(2) {
            prop_assert!(pair[0].progress < pair[1].progress);
        }
    }

    /// Property: any decrease in declared progress is rejected
    #[test]
    fn decreasing_stage_lists_are_rejected(
        stages in valid_stage_list().prop_filter("need two stages", |s| s.len() >= 2),
        swap in any::<prop::sample::Index>(),
    ) {
        let mut stages = stages;
        let i = swap.index(stages.len() - 1);
        let (a, b) = (stages[i].progress, stages[i + 1].progress);
        stages[i].progress = b;
        stages[i + 1].progress = a;
        let rejected = matches!(
            StageDefinition::validated(stages),
            Err(StageError::NonIncreasing { .. })
        );
        prop_assert!(rejected);
    }

    /// Property: a repeated stage id is rejected
    #[test]
    fn duplicate_stage_ids_are_rejected(
        stages in valid_stage_list().prop_filter("need two stages", |s| s.len() >= 2),
    ) {
        let mut stages = stages;
        let last = stages.len() - 1;
        stages[last].id = stages[0].id.clone();
        let rejected = matches!(
            StageDefinition::validated(stages),
            Err(StageError::DuplicateId { .. })
        );
        prop_assert!(rejected);
    }

    /// Property: current_progress never decreases across next_stage and substep calls
    #[test]
    fn progress_is_monotonic(stages in valid_stage_list(), steps in prop::collection::vec(step(), 0..40)) {
        let definition = StageDefinition::validated(stages).unwrap();
        let mut tracker = ProgressTracker::new(definition, AdvanceMode::Sequential);
        let mut last = tracker.current_progress();

        for step in steps {
            match step {
                Step::Next(total) => {
                    // running off the end is an error and leaves the tracker unchanged
                    let _ = tracker.next_stage(total);
                }
                Step::Substep => tracker.increment_substep(),
                Step::SetSubstep(n) => {
                    let target = n.max(tracker.current_substep());
                    tracker.set_substep(target);
                }
            }
            let now = tracker.current_progress();
            prop_assert!(now >= last, "progress went from {} to {}", last, now);
            prop_assert!((0..=100).contains(&now));
            last = now;
        }
    }
}
