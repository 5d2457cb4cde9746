//! Bounded fan-out of read-side remote calls.
//!
//! The walker and the errored-row refresh hand a batch of at most
//! `concurrency` lookups to `map_batch`, which runs them on scoped threads and
//! returns results in input order. Store writes stay on the calling thread.
//! Storage moves never go through here; they are issued one at a time.

use std::thread;

/// Apply `f` to every item, at most `items.len()` at a time, preserving order.
///
/// A batch of one runs inline.
pub(crate) fn map_batch<T, R, F>(items: &[T], f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    if items.len() <= 1 {
        return items.iter().map(&f).collect();
    }

    let f = &f;
    thread::scope(|scope| {
        let handles: Vec<_> = items
            .iter()
            .map(|item| scope.spawn(move || f(item)))
            .collect();

        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(result) => result,
                Err(panic) => std::panic::resume_unwind(panic),
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_map_batch_preserves_input_order() {
        let items = vec![30u64, 10, 20];
        let results = map_batch(&items, |delay| {
            thread::sleep(Duration::from_millis(*delay));
            *delay * 2
        });
        assert_eq!(results, vec![60, 20, 40]);
    }

    #[test]
    fn test_map_batch_runs_calls_concurrently() {
        let in_flight = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let items = vec![(); 4];

        map_batch(&items, |_| {
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        assert!(peak.load(Ordering::SeqCst) > 1, "Expected overlapping calls");
    }

    #[test]
    fn test_map_batch_handles_empty_input() {
        let items: Vec<u32> = Vec::new();
        let results: Vec<u32> = map_batch(&items, |x| *x);
        assert!(results.is_empty());
    }
}
