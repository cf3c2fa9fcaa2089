//! Batch provider over batches already held in memory

use super::{Batch, BatchProvider};
use crate::error::Result;

/// Replays a fixed list of batches in order
#[derive(Debug, Clone)]
pub struct InMemoryProvider {
    batches: Vec<Batch>,
    cursor: usize,
}

impl InMemoryProvider {
    pub fn new(batches: Vec<Batch>) -> Self {
        Self { batches, cursor: 0 }
    }
}

impl BatchProvider for InMemoryProvider {
    fn len(&self) -> usize {
        self.batches.len()
    }

    fn reset(&mut self) -> Result<()> {
        self.cursor = 0;
        Ok(())
    }

    fn next_batch(&mut self) -> Result<Option<Batch>> {
        let batch = self.batches.get(self.cursor).cloned();
        if batch.is_some() {
            self.cursor += 1;
        }
        Ok(batch)
    }
}
