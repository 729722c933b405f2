use std::collections::HashSet;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::store::{BulkAction, IndexStore, StoreError};

/// Number of buffered actions that triggers a flush.
pub const DEFAULT_SIZE: usize = 1000;
/// Number of distinct target indexes that triggers a flush. The store's bulk
/// queues are partitioned per index, so flushes spanning many indexes inflate
/// queue pressure.
pub const DEFAULT_INDEXES_SIZE: usize = 5;

const MAX_FLUSH_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Buffers bulk actions and flushes them to the store when either threshold
/// is met. Call [`Batch::finish`] at the end of a clean scope; on an error
/// path, dropping the batch abandons the buffered tail, which is what the
/// orchestrator's recovery expects.
pub struct Batch<'a, S: IndexStore + ?Sized> {
    store: &'a S,
    size: usize,
    indexes_size: usize,
    retry_delay: Duration,
    indexes: HashSet<String>,
    actions: Vec<BulkAction>,
}

impl<'a, S: IndexStore + ?Sized> Batch<'a, S> {
    pub fn new(store: &'a S) -> Batch<'a, S> {
        Batch::with_limits(store, DEFAULT_SIZE, DEFAULT_INDEXES_SIZE)
    }

    pub fn with_limits(store: &'a S, size: usize, indexes_size: usize) -> Batch<'a, S> {
        Batch {
            store,
            size,
            indexes_size,
            retry_delay: RETRY_DELAY,
            indexes: HashSet::new(),
            actions: Vec::new(),
        }
    }

    /// How long to wait before retrying a rejected bulk request.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn add(&mut self, action: BulkAction) -> Result<()> {
        self.indexes.insert(action.index.clone());
        self.actions.push(action);
        if self.actions.len() >= self.size || self.indexes.len() >= self.indexes_size {
            self.flush()?;
        }
        Ok(())
    }

    pub fn add_all(&mut self, actions: impl IntoIterator<Item = BulkAction>) -> Result<()> {
        for action in actions {
            self.add(action)?;
        }
        Ok(())
    }

    /// Send the buffered actions. Rejected bulk requests are retried a few
    /// times; transport errors are propagated untouched. Flushing an empty
    /// batch is a no-op.
    pub fn flush(&mut self) -> Result<()> {
        if self.actions.is_empty() {
            return Ok(());
        }
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.store.bulk(&self.actions) {
                Ok(()) => {
                    if attempts > 1 {
                        info!("bulk request succeeded after {attempts} attempts");
                    }
                    break;
                }
                Err(source @ StoreError::BulkRejected(_)) => {
                    if attempts >= MAX_FLUSH_ATTEMPTS {
                        return Err(Error::BulkFailed { attempts, source });
                    }
                    warn!("bulk request was rejected, trying again in a few seconds");
                    std::thread::sleep(self.retry_delay);
                }
                Err(source) => return Err(source.into()),
            }
        }
        self.actions.clear();
        self.indexes.clear();
        // Let the store work through what it just received.
        self.store.settle(1);
        Ok(())
    }

    /// Flush whatever remains and consume the batch.
    pub fn finish(mut self) -> Result<()> {
        self.flush()
    }
}
