//! Weighted progress composition for multi-stage flashing runs
//!
//! A flashing run is made of stages, stages are made of images, and images are
//! made of download and write phases. Each layer only knows its own local
//! fraction in `[0, 1]`; this crate maps those local fractions onto a single
//! overall signal.
//!
//! # Overview
//!
//! - [`ProgressHandle`]: a linear slice of the overall range bound to a sink
//! - [`create_steps`] and [`create_step_array`]: split a handle into weighted sub-steps
//! - [`with_progress`]: pair every item of a collection with an equal slice
//! - [`monotonic`]: drop regressions before they reach the sink
//!
//! The value [`INDETERMINATE`] is reserved for stages that cannot estimate
//! completion and is never produced by a handle.
//!
//! # Example
//!
//! ```
//! use std::sync::{Arc, Mutex};
//! use agnos_progress::{ProgressHandle, create_steps};
//!
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let sink = {
//!     let seen = Arc::clone(&seen);
//!     Arc::new(move |value: f64| {
//!         if let Ok(mut seen) = seen.lock() {
//!             seen.push(value);
//!         }
//!     })
//! };
//!
//! let root = ProgressHandle::new(sink);
//! let steps = create_steps(&[2, 1], &root);
//! for step in &steps {
//!     step.complete();
//! }
//!
//! let seen = seen.lock().map(|s| s.clone()).unwrap_or_default();
//! assert_eq!(seen.len(), 2);
//! assert!((seen[0] - 2.0 / 3.0).abs() < 1e-9);
//! assert!((seen[1] - 1.0).abs() < 1e-9);
//! ```

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![deny(unused_must_use)]
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod handle;
pub mod monotonic;
pub mod sequence;

pub use handle::{ProgressHandle, ProgressSink, create_step_array, create_steps};
pub use monotonic::monotonic;
pub use sequence::{WithProgress, with_progress};

/// Reserved progress value meaning "indeterminate, show a spinner".
pub const INDETERMINATE: f64 = -1.0;

/// Returns `true` if `value` is the [`INDETERMINATE`] sentinel.
#[inline]
pub fn is_indeterminate(value: f64) -> bool {
    (value - INDETERMINATE).abs() < f64::EPSILON
}
