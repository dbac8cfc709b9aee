//! Fixed-width parallel batch transformation with per-item failure isolation.
//!
//! One [`TransformPool`] per stage, width from `etl_workers`. The two
//! recoverable conversion failures are counted and dropped; anything else is
//! fatal to the batch, surfaced after every submitted item has run (there is
//! no cancellation).

use rayon::prelude::*;
use tracing::warn;

use crate::error::{ConvertError, ConvertResult};

/// Counts of items dropped from a batch, by recoverable failure kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscardTally {
    pub invalid_data_rows: usize,
    pub invalid_labels: usize,
}

impl DiscardTally {
    pub fn total(&self) -> usize {
        self.invalid_data_rows + self.invalid_labels
    }
}

/// A transformed batch. `items.len() + discarded.total()` equals the number
/// of submitted items.
#[derive(Debug)]
pub struct BatchOutcome<T> {
    pub items: Vec<T>,
    pub discarded: DiscardTally,
}

/// Dedicated worker pool applying a fallible conversion across a batch.
pub struct TransformPool {
    pool: rayon::ThreadPool,
}

impl TransformPool {
    pub fn new(width: usize) -> ConvertResult<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(width.max(1))
            .thread_name(|i| format!("etl-worker-{i}"))
            .build()
            .map_err(|e| ConvertError::WorkerPool {
                message: e.to_string(),
            })?;
        Ok(Self { pool })
    }

    pub fn width(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run `transform` over every item, collecting successes in input order.
    ///
    /// Recoverable failures are logged, counted, and dropped. A fatal
    /// failure is returned (first in input order) only after the whole
    /// batch has run; no item is processed twice.
    pub fn transform_batch<I, T, F>(&self, items: &[I], transform: F) -> ConvertResult<BatchOutcome<T>>
    where
        I: Sync,
        T: Send,
        F: Fn(&I) -> ConvertResult<T> + Sync,
    {
        let results: Vec<ConvertResult<T>> = self
            .pool
            .install(|| items.par_iter().map(|item| transform(item)).collect());

        let mut outcome = BatchOutcome {
            items: Vec::with_capacity(results.len()),
            discarded: DiscardTally::default(),
        };
        for result in results {
            match result {
                Ok(item) => outcome.items.push(item),
                Err(err @ ConvertError::InvalidDataRow { .. }) => {
                    outcome.discarded.invalid_data_rows += 1;
                    warn!(error = %err, "discarding data row");
                }
                Err(err @ ConvertError::InvalidLabel { .. }) => {
                    outcome.discarded.invalid_labels += 1;
                    warn!(error = %err, "discarding label");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(outcome)
    }
}
