//! Bounded worker pool on scoped threads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;

use tracing::debug;

/// Apply `f` to every item with at most `limit` items in flight.
///
/// Results are returned in input order. With a limit of one (or a single
/// item) everything runs on the calling thread.
pub fn run_bounded<T, R, F>(items: Vec<T>, limit: usize, f: F) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Sync,
{
    let total = items.len();
    let workers = limit.clamp(1, total.max(1));
    if workers == 1 {
        return items.into_iter().map(f).collect();
    }

    debug!(total, workers, "running bounded pool");
    let slots: Vec<Mutex<Option<T>>> = items.into_iter().map(|i| Mutex::new(Some(i))).collect();
    let results: Vec<Mutex<Option<R>>> = (0..total).map(|_| Mutex::new(None)).collect();
    let cursor = AtomicUsize::new(0);

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    let idx = cursor.fetch_add(1, Ordering::SeqCst);
                    if idx >= total {
                        break;
                    }
                    let item = slots[idx]
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .take();
                    if let Some(item) = item {
                        let out = f(item);
                        *results[idx].lock().unwrap_or_else(PoisonError::into_inner) = Some(out);
                    }
                }
            });
        }
    });

    results
        .into_iter()
        .filter_map(|slot| slot.into_inner().unwrap_or_else(PoisonError::into_inner))
        .collect()
}
