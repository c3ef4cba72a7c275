//! Per-item progress over an ordered collection

use std::iter::{Enumerate, FusedIterator};

use crate::handle::ProgressHandle;

/// Lazy sequence of `(item, handle)` pairs produced by [`with_progress`].
///
/// The `k`-th handle covers `[k / len, (k + 1) / len]` of the parent range.
#[derive(Debug)]
pub struct WithProgress<I> {
    items: Enumerate<I>,
    len: usize,
    parent: ProgressHandle,
}

/// Pair each item of `items` with an equal slice of `parent`.
///
/// The sequence is finite and yields exactly as many pairs as the input has
/// items. To start over, call again with a fresh collection.
pub fn with_progress<I>(items: I, parent: &ProgressHandle) -> WithProgress<I::IntoIter>
where
    I: IntoIterator,
    I::IntoIter: ExactSizeIterator,
{
    let items = items.into_iter();
    let len = items.len();
    WithProgress {
        items: items.enumerate(),
        len,
        parent: parent.clone(),
    }
}

impl<I> Iterator for WithProgress<I>
where
    I: Iterator,
{
    type Item = (I::Item, ProgressHandle);

    fn next(&mut self) -> Option<Self::Item> {
        let (index, item) = self.items.next()?;
        let len = self.len.max(1) as f64;
        let from = index as f64 / len;
        let to = (index as f64 + 1.0) / len;
        Some((item, self.parent.slice(from, to)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.items.size_hint()
    }
}

impl<I> ExactSizeIterator for WithProgress<I> where I: ExactSizeIterator {}

impl<I> FusedIterator for WithProgress<I> where I: FusedIterator {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use parking_lot::Mutex;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_second_of_three_at_half() {
        let root = ProgressHandle::discard();
        let mapped: Vec<f64> = with_progress(["x", "y", "z"], &root)
            .map(|(_, handle)| handle.map(0.5))
            .collect();
        assert_eq!(mapped.len(), 3);
        assert!(mapped.get(1).is_some_and(|&v| close(v, 0.5)));
    }

    #[test]
    fn test_length_matches_input() {
        let root = ProgressHandle::discard();
        let seq = with_progress(vec![1, 2, 3, 4], &root);
        assert_eq!(seq.len(), 4);
        assert_eq!(seq.count(), 4);
    }

    #[test]
    fn test_empty_collection_yields_nothing() {
        let root = ProgressHandle::discard();
        let mut seq = with_progress(Vec::<u8>::new(), &root);
        assert!(seq.next().is_none());
    }

    #[test]
    fn test_items_keep_order_and_reports_reach_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let root = {
            let seen = Arc::clone(&seen);
            ProgressHandle::new(Arc::new(move |v: f64| seen.lock().push(v)))
        };

        let mut order = Vec::new();
        for (item, handle) in with_progress(['a', 'b'], &root) {
            order.push(item);
            handle.complete();
        }

        assert_eq!(order, vec!['a', 'b']);
        let seen = seen.lock();
        assert!(seen.first().is_some_and(|&v| close(v, 0.5)));
        assert!(seen.get(1).is_some_and(|&v| close(v, 1.0)));
    }
}
