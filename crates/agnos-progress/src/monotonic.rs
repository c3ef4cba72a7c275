//! Regression filter for composed progress

use std::sync::Arc;

use parking_lot::Mutex;

use crate::handle::ProgressSink;
use crate::is_indeterminate;

/// Wrap `sink` so that values lower than the last forwarded one are dropped.
///
/// The [`INDETERMINATE`](crate::INDETERMINATE) sentinel is always forwarded
/// and resets the floor, so a stage that goes back to a spinner can restart
/// from zero afterwards.
pub fn monotonic(sink: ProgressSink) -> ProgressSink {
    let floor: Mutex<Option<f64>> = Mutex::new(None);
    Arc::new(move |value: f64| {
        if is_indeterminate(value) {
            *floor.lock() = None;
            sink(value);
            return;
        }

        let forward = {
            let mut floor = floor.lock();
            match *floor {
                Some(last) if value < last => false,
                _ => {
                    *floor = Some(value);
                    true
                }
            }
        };
        if forward {
            sink(value);
        }
    })
}
