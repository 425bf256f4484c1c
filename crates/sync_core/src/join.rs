//! Fan-out/fan-in join used by the fetcher at both nesting levels.

use std::future::Future;

use futures::stream::{FuturesUnordered, StreamExt};
use shared::error::{Partial, SyncError};

/// Outcome of [`gather`]: one slot per task in submission order, plus the
/// first error observed in completion order.
pub(crate) struct Gathered<T> {
    pub slots: Vec<Option<T>>,
    pub first_error: Option<SyncError>,
}

impl<T> Gathered<T> {
    pub fn successes(self) -> Vec<T> {
        self.slots.into_iter().flatten().collect()
    }
}

/// Runs every task concurrently and returns once all of them have completed.
///
/// A failing task never cancels its siblings. A task that succeeds with a
/// partial error keeps its value and contributes the error.
pub(crate) async fn gather<T, F>(tasks: impl IntoIterator<Item = F>) -> Gathered<T>
where
    F: Future<Output = Result<Partial<T>, SyncError>>,
{
    let mut pending: FuturesUnordered<_> = tasks
        .into_iter()
        .enumerate()
        .map(|(index, task)| async move { (index, task.await) })
        .collect();

    let mut slots: Vec<Option<T>> = (0..pending.len()).map(|_| None).collect();
    let mut first_error = None;

    while let Some((index, outcome)) = pending.next().await {
        let error = match outcome {
            Ok(partial) => {
                slots[index] = Some(partial.value);
                partial.error
            }
            Err(err) => Some(err),
        };
        if first_error.is_none() {
            first_error = error;
        }
    }

    Gathered { slots, first_error }
}

#[cfg(test)]
#[path = "tests/join_tests.rs"]
mod tests;
