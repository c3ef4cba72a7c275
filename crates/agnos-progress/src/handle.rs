//! Progress handles and weighted step composition

use std::fmt;
use std::sync::Arc;

/// Receiver of overall progress values.
pub type ProgressSink = Arc<dyn Fn(f64) + Send + Sync>;

/// A linear slice `[start, start + span]` of the overall progress range.
///
/// Reporting a local fraction `f` sends `start + span * f` to the sink. Slices
/// of slices compose by narrowing the range, so nesting costs nothing at
/// report time.
#[derive(Clone)]
pub struct ProgressHandle {
    start: f64,
    span: f64,
    sink: ProgressSink,
}

impl ProgressHandle {
    /// Create a root handle covering the full `[0, 1]` range.
    pub fn new(sink: ProgressSink) -> Self {
        Self {
            start: 0.0,
            span: 1.0,
            sink,
        }
    }

    /// A handle that discards every report.
    pub fn discard() -> Self {
        Self::new(Arc::new(|_: f64| {}))
    }

    /// Map a local fraction onto the overall range without reporting it.
    ///
    /// Fractions outside `[0, 1]` are clamped and NaN counts as zero.
    pub fn map(&self, fraction: f64) -> f64 {
        let fraction = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0)
        };
        (self.start + self.span * fraction).clamp(0.0, 1.0)
    }

    /// Report a local fraction.
    pub fn report(&self, fraction: f64) {
        (self.sink)(self.map(fraction));
    }

    /// Report local completion.
    pub fn complete(&self) {
        self.report(1.0);
    }

    /// Narrow this handle to the local sub-range `[from, to]`.
    pub fn slice(&self, from: f64, to: f64) -> Self {
        let from = self.map(from);
        let to = self.map(to).max(from);
        Self {
            start: from,
            span: to - from,
            sink: Arc::clone(&self.sink),
        }
    }

    /// Start of this handle's range.
    pub fn start(&self) -> f64 {
        self.start
    }

    /// Width of this handle's range.
    pub fn span(&self) -> f64 {
        self.span
    }
}

impl fmt::Debug for ProgressHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressHandle")
            .field("start", &self.start)
            .field("span", &self.span)
            .finish_non_exhaustive()
    }
}

/// Split `parent` into one handle per weight.
///
/// Handle `i` reporting `f` yields
/// `(sum(weights[..i]) + weights[i] * f) / sum(weights)` within the parent.
/// When every weight is zero the steps share the parent range.
pub fn create_steps(weights: &[u32], parent: &ProgressHandle) -> Vec<ProgressHandle> {
    let total: u64 = weights.iter().map(|&w| u64::from(w)).sum();
    if total == 0 {
        return weights.iter().map(|_| parent.clone()).collect();
    }

    let total = total as f64;
    let mut before = 0u64;
    weights
        .iter()
        .map(|&weight| {
            let from = before as f64 / total;
            before = before.saturating_add(u64::from(weight));
            let to = before as f64 / total;
            parent.slice(from, to)
        })
        .collect()
}

/// Fixed-size form of [`create_steps`] for destructuring at the call site.
pub fn create_step_array<const N: usize>(
    weights: [u32; N],
    parent: &ProgressHandle,
) -> [ProgressHandle; N] {
    let mut steps = create_steps(&weights, parent).into_iter();
    std::array::from_fn(|_| steps.next().unwrap_or_else(|| parent.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<f64>>>, ProgressSink) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink: ProgressSink = {
            let seen = Arc::clone(&seen);
            Arc::new(move |v: f64| seen.lock().push(v))
        };
        (seen, sink)
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_root_handle_passes_fraction_through() {
        let (seen, sink) = recorder();
        let root = ProgressHandle::new(sink);
        root.report(0.25);
        root.complete();
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen.first().is_some_and(|&v| close(v, 0.25)));
        assert!(seen.get(1).is_some_and(|&v| close(v, 1.0)));
    }

    #[test]
    fn test_report_clamps_out_of_range() {
        let root = ProgressHandle::discard();
        assert!(close(root.map(-0.5), 0.0));
        assert!(close(root.map(7.0), 1.0));
        assert!(close(root.map(f64::NAN), 0.0));
    }

    #[test]
    fn test_create_steps_two_to_one() {
        let (seen, sink) = recorder();
        let steps = create_steps(&[2, 1], &ProgressHandle::new(sink));
        assert_eq!(steps.len(), 2);
        for step in &steps {
            step.complete();
        }
        let seen = seen.lock();
        assert!(seen.first().is_some_and(|&v| close(v, 2.0 / 3.0)));
        assert!(seen.get(1).is_some_and(|&v| close(v, 1.0)));
    }

    #[test]
    fn test_create_steps_partial_fraction() {
        let steps = create_steps(&[1, 2], &ProgressHandle::discard());
        let second = steps.get(1).map(|s| s.map(0.5));
        assert!(second.is_some_and(|v| close(v, 1.0 / 3.0 + 1.0 / 3.0)));
    }

    #[test]
    fn test_create_steps_zero_weight_step_is_a_point() {
        let steps = create_steps(&[1, 0, 1], &ProgressHandle::discard());
        let middle = steps.get(1).map(|s| (s.map(0.0), s.map(1.0)));
        assert!(middle.is_some_and(|(a, b)| close(a, 0.5) && close(b, 0.5)));
    }

    #[test]
    fn test_create_steps_all_zero_weights_share_parent() {
        let parent = ProgressHandle::discard().slice(0.2, 0.4);
        let steps = create_steps(&[0, 0], &parent);
        assert!(steps.iter().all(|s| close(s.map(1.0), 0.4)));
    }

    #[test]
    fn test_nested_steps_compose() {
        let outer = create_steps(&[1, 1], &ProgressHandle::discard());
        let inner = outer.get(1).map(|h| create_steps(&[3, 1], h));
        let value = inner
            .as_ref()
            .and_then(|steps| steps.first())
            .map(|h| h.map(1.0));
        assert!(value.is_some_and(|v| close(v, 0.5 + 0.5 * 0.75)));
    }

    #[test]
    fn test_step_array_destructures() {
        let [first, second] = create_step_array([3, 1], &ProgressHandle::discard());
        assert!(close(first.map(1.0), 0.75));
        assert!(close(second.map(0.0), 0.75));
        assert!(close(second.map(1.0), 1.0));
    }

    #[test]
    fn test_slice_never_inverts() {
        let handle = ProgressHandle::discard().slice(0.8, 0.2);
        assert!(handle.span() >= 0.0);
        assert!(close(handle.start(), 0.8));
    }
}
