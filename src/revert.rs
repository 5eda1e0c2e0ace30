//! Compensation list for partially applied work.
//!
//! Completed steps are recorded as plain values. On failure they are undone
//! newest first; a failed undo is logged and the unwind moves on.

use std::fmt;
use std::future::Future;

#[derive(Debug)]
pub struct Reverter<T: fmt::Debug> {
    steps: Vec<T>,
}

impl<T: fmt::Debug> Default for Reverter<T> {
    fn default() -> Self {
        Self { steps: Vec::new() }
    }
}

impl<T: fmt::Debug> Reverter<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, step: T) {
        self.steps.push(step);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Keep everything; nothing will be undone.
    pub fn commit(mut self) -> Vec<T> {
        std::mem::take(&mut self.steps)
    }

    /// Undo every recorded step in reverse order. Returns the number of undo
    /// steps that failed. Failed steps are not retried.
    pub async fn unwind<F, Fut>(mut self, mut undo: F) -> usize
    where
        F: FnMut(T) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let mut failed = 0;
        while let Some(step) = self.steps.pop() {
            let step_label = format!("{:?}", step);
            match undo(step).await {
                Ok(()) => tracing::debug!(step = %step_label, "Reverted step"),
                Err(e) => {
                    failed += 1;
                    tracing::warn!(step = %step_label, "Failed to revert step: {:#}", e);
                }
            }
        }
        failed
    }
}

impl<T: fmt::Debug> Drop for Reverter<T> {
    fn drop(&mut self) {
        if !self.steps.is_empty() {
            tracing::warn!(
                steps = ?self.steps,
                "Reverter dropped without commit or unwind"
            );
        }
    }
}
