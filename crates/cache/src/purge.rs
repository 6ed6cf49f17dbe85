//! Deferred purge of idle tile sub-pools
//!
//! Sub-pools post [`PurgeRequest`]s when their last live buffer comes back.
//! The [`PurgeScheduler`] runs on the control thread, coalesces requests per
//! pixel size and executes one only after the debounce window passed without
//! a newer request for the same sub-pool. The pool re-validates the free
//! stamp before releasing any memory.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender, TryRecvError};

use crate::pool::{PurgeRequest, TileBufferPool, TileBufferPoolConfig};

#[derive(Debug, Clone, Copy)]
struct PendingPurge {
    free_stamp: u64,
    last_requested_at: Instant,
}

/// Control-thread side of the deferred purge
pub struct PurgeScheduler {
    pool: Arc<TileBufferPool>,
    requests: Receiver<PurgeRequest>,
    debounce: Duration,
    pending: HashMap<usize, PendingPurge>,
}

impl PurgeScheduler {
    /// Create a pool wired to a new purge scheduler
    ///
    /// # Example
    ///
    /// ```
    /// use std::time::Duration;
    /// use anim_frame_cache::pool::TileBufferPoolConfig;
    /// use anim_frame_cache::purge::PurgeScheduler;
    ///
    /// let (pool, mut purges) =
    ///     PurgeScheduler::with_pool(TileBufferPoolConfig::default(), Duration::from_secs(3));
    /// let buffer = pool.allocate(4);
    /// drop(buffer);
    /// assert_eq!(purges.pump(), 0);
    /// ```
    pub fn with_pool(config: TileBufferPoolConfig, debounce: Duration) -> (Arc<TileBufferPool>, Self) {
        let (tx, rx) = unbounded();
        let pool = TileBufferPool::with_purge_sink(config, tx);
        let scheduler = Self::new(Arc::clone(&pool), rx, debounce);
        (pool, scheduler)
    }

    pub fn new(pool: Arc<TileBufferPool>, requests: Receiver<PurgeRequest>, debounce: Duration) -> Self {
        Self {
            pool,
            requests,
            debounce,
            pending: HashMap::new(),
        }
    }

    /// Create a channel suitable for [`TileBufferPool::with_purge_sink`]
    pub fn channel() -> (Sender<PurgeRequest>, Receiver<PurgeRequest>) {
        unbounded()
    }

    pub fn pool(&self) -> &Arc<TileBufferPool> {
        &self.pool
    }

    /// Receiving end of the request channel, for use in a select loop
    pub fn requests(&self) -> &Receiver<PurgeRequest> {
        &self.requests
    }

    /// Number of sub-pools with a pending purge
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Record one request that was received outside of [`pump`](Self::pump)
    pub fn schedule(&mut self, request: PurgeRequest) {
        self.schedule_at(request, Instant::now());
    }

    fn schedule_at(&mut self, request: PurgeRequest, now: Instant) {
        // A newer request replaces the older one and restarts the window
        self.pending.insert(
            request.pixel_size,
            PendingPurge {
                free_stamp: request.free_stamp,
                last_requested_at: now,
            },
        );
    }

    /// Drain the channel and run every purge whose window elapsed
    ///
    /// Returns the number of sub-pools actually purged.
    pub fn pump(&mut self) -> usize {
        self.pump_at(Instant::now())
    }

    /// Same as [`pump`](Self::pump) with an explicit clock
    pub fn pump_at(&mut self, now: Instant) -> usize {
        loop {
            match self.requests.try_recv() {
                Ok(request) => self.schedule_at(request, now),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        let debounce = self.debounce;
        let due: Vec<(usize, u64)> = self
            .pending
            .iter()
            .filter(|(_, pending)| now.saturating_duration_since(pending.last_requested_at) >= debounce)
            .map(|(pixel_size, pending)| (*pixel_size, pending.free_stamp))
            .collect();

        let mut purged = 0;
        for (pixel_size, free_stamp) in due {
            self.pending.remove(&pixel_size);
            if self.pool.try_purge(PurgeRequest {
                pixel_size,
                free_stamp,
            }) {
                purged += 1;
            } else {
                tracing::trace!(pixel_size, free_stamp, "stale purge request dropped");
            }
        }
        purged
    }

    /// Earliest instant at which a pending purge becomes due
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .map(|pending| pending.last_requested_at + self.debounce)
            .min()
    }
}
