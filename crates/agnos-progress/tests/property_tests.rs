//! Property-based tests for progress composition

use std::sync::Arc;

use agnos_progress::{ProgressHandle, create_steps, monotonic, with_progress};
use parking_lot::Mutex;
use proptest::prelude::*;

fn recording_root() -> (Arc<Mutex<Vec<f64>>>, ProgressHandle) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let root = {
        let seen = Arc::clone(&seen);
        ProgressHandle::new(Arc::new(move |v: f64| seen.lock().push(v)))
    };
    (seen, root)
}

fn arb_fractions() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(0.0f64..=1.0, 1..8)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_steps_stay_in_unit_range(
        weights in prop::collection::vec(0u32..50, 1..10),
        fraction in -2.0f64..3.0,
    ) {
        let steps = create_steps(&weights, &ProgressHandle::discard());
        prop_assert_eq!(steps.len(), weights.len());
        for step in &steps {
            let value = step.map(fraction);
            prop_assert!((0.0..=1.0).contains(&value), "value {} out of range", value);
        }
    }

    #[test]
    fn prop_sequential_steps_are_non_decreasing(
        weights in prop::collection::vec(0u32..50, 1..10),
        fractions in arb_fractions(),
    ) {
        let (seen, root) = recording_root();
        let mut sorted = fractions.clone();
        sorted.sort_by(f64::total_cmp);

        for step in create_steps(&weights, &root) {
            for &f in &sorted {
                step.report(f);
            }
            step.complete();
        }

        let seen = seen.lock();
        for pair in seen.windows(2) {
            if let [a, b] = pair {
                prop_assert!(b + 1e-12 >= *a, "progress went back from {} to {}", a, b);
            }
        }
    }

    #[test]
    fn prop_last_item_completion_reaches_one(len in 1usize..20) {
        let (seen, root) = recording_root();
        for (_, handle) in with_progress(0..len, &root) {
            handle.complete();
        }
        let seen = seen.lock();
        prop_assert_eq!(seen.len(), len);
        let last = seen.last().copied().unwrap_or_default();
        prop_assert!((last - 1.0).abs() < 1e-9);
    }

    #[test]
    fn prop_monotonic_output_never_decreases(values in prop::collection::vec(0.0f64..=1.0, 0..32)) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let filtered = {
            let seen = Arc::clone(&seen);
            monotonic(Arc::new(move |v: f64| seen.lock().push(v)))
        };
        for v in values {
            filtered(v);
        }
        let seen = seen.lock();
        for pair in seen.windows(2) {
            if let [a, b] = pair {
                prop_assert!(b >= a);
            }
        }
    }
}
