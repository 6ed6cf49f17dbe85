//! Pooled allocator for tile pixel buffers
//!
//! Every pixel buffer held by the cache (live tile patches, serialized frame
//! tiles, diff bases) is a fixed-size chunk borrowed from a [`TileBufferPool`].
//! The pool keeps one independent sub-pool per distinct pixel byte-size. A
//! chunk is large enough for one bordered tile:
//! `(tile_width + 2 * border) * (tile_height + 2 * border) * pixel_size` bytes.
//!
//! Buffers are handed out as [`TileBuffer`] handles which return their chunk
//! to the owning sub-pool when dropped.
//!
//! When the last live buffer of a sub-pool is returned and the sub-pool's
//! high-water mark exceeded the purge threshold, the sub-pool posts a
//! [`PurgeRequest`] instead of releasing its memory right away. The request
//! is executed later on the control thread by
//! [`PurgeScheduler`](crate::purge::PurgeScheduler), and only if nothing was
//! allocated or released in the meantime.

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crossbeam::channel::Sender;
use parking_lot::{Mutex, RwLock};

use crate::tile::TileGeometry;

/// Configuration for the tile buffer pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileBufferPoolConfig {
    /// Tile grid geometry; determines the chunk size
    pub geometry: TileGeometry,
    /// Minimum number of chunks reserved in one growth step
    pub min_chunks_per_step: usize,
    /// Maximum number of chunks reserved in one growth step
    pub max_chunks_per_step: usize,
    /// High-water mark (in chunks) above which an idle sub-pool is purged
    pub purge_threshold: usize,
}

impl Default for TileBufferPoolConfig {
    fn default() -> Self {
        Self {
            geometry: TileGeometry::default(),
            min_chunks_per_step: 4,
            max_chunks_per_step: 64,
            purge_threshold: 16,
        }
    }
}

/// Request to release the memory of an idle sub-pool
///
/// `free_stamp` is the sub-pool's release counter at the time the request
/// was posted. The purge only happens if the counter is unchanged when the
/// request is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurgeRequest {
    /// Pixel byte-size identifying the sub-pool
    pub pixel_size: usize,
    /// Release counter observed when the request was posted
    pub free_stamp: u64,
}

/// Snapshot of one sub-pool's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubPoolStats {
    /// Pixel byte-size served by this sub-pool
    pub pixel_size: usize,
    /// Chunk size in bytes
    pub chunk_size: usize,
    /// Buffers currently handed out
    pub live: usize,
    /// Largest number of simultaneously live buffers since the last purge
    pub high_water: usize,
    /// Chunks currently reserved (live + free)
    pub reserved: usize,
    /// Chunks sitting in the free list
    pub free: usize,
    /// Monotonic release counter
    pub free_stamp: u64,
}

struct SubPoolState {
    free: Vec<Box<[u8]>>,
    reserved: usize,
    live: usize,
    high_water: usize,
    free_stamp: u64,
}

struct SubPool {
    pixel_size: usize,
    chunk_size: usize,
    config: TileBufferPoolConfig,
    purge_sink: Option<Sender<PurgeRequest>>,
    state: Mutex<SubPoolState>,
}

impl SubPool {
    fn new(
        pixel_size: usize,
        config: TileBufferPoolConfig,
        purge_sink: Option<Sender<PurgeRequest>>,
    ) -> Self {
        Self {
            pixel_size,
            chunk_size: config.geometry.chunk_pixels() * pixel_size,
            config,
            purge_sink,
            state: Mutex::new(SubPoolState {
                free: Vec::new(),
                reserved: 0,
                live: 0,
                high_water: 0,
                free_stamp: 0,
            }),
        }
    }

    fn take(&self) -> Box<[u8]> {
        let mut state = self.state.lock();

        if state.free.is_empty() {
            // Grow proportionally to the current reservation
            let min_step = self.config.min_chunks_per_step.max(1);
            let max_step = self.config.max_chunks_per_step.max(min_step);
            let step = state.reserved.clamp(min_step, max_step);
            state.free.reserve(step);
            for _ in 0..step {
                state.free.push(vec![0u8; self.chunk_size].into_boxed_slice());
            }
            state.reserved += step;

            tracing::debug!(
                pixel_size = self.pixel_size,
                step,
                reserved = state.reserved,
                "tile pool grown"
            );
        }

        state.live += 1;
        state.high_water = state.high_water.max(state.live);

        match state.free.pop() {
            Some(chunk) => chunk,
            // Unreachable after the growth step above
            None => vec![0u8; self.chunk_size].into_boxed_slice(),
        }
    }

    fn give_back(&self, chunk: Box<[u8]>) {
        debug_assert_eq!(chunk.len(), self.chunk_size, "chunk returned to the wrong pool");

        let request = {
            let mut state = self.state.lock();
            if chunk.len() == self.chunk_size {
                state.free.push(chunk);
            } else {
                state.reserved = state.reserved.saturating_sub(1);
            }
            state.live = state.live.saturating_sub(1);
            state.free_stamp += 1;

            if state.live == 0 && state.high_water > self.config.purge_threshold {
                Some(PurgeRequest {
                    pixel_size: self.pixel_size,
                    free_stamp: state.free_stamp,
                })
            } else {
                None
            }
        };

        if let (Some(request), Some(sink)) = (request, self.purge_sink.as_ref()) {
            // The control thread may already be gone during shutdown
            let _ = sink.send(request);
        }
    }

    fn try_purge(&self, free_stamp: u64) -> bool {
        let mut state = self.state.lock();

        if state.live != 0 || state.free_stamp != free_stamp {
            return false;
        }

        let released = state.free.len();
        state.free = Vec::new();
        state.reserved = 0;
        state.high_water = 0;

        tracing::debug!(
            pixel_size = self.pixel_size,
            released_chunks = released,
            "tile pool purged"
        );
        true
    }

    fn stats(&self) -> SubPoolStats {
        let state = self.state.lock();
        SubPoolStats {
            pixel_size: self.pixel_size,
            chunk_size: self.chunk_size,
            live: state.live,
            high_water: state.high_water,
            reserved: state.reserved,
            free: state.free.len(),
            free_stamp: state.free_stamp,
        }
    }
}

/// Thread-safe pooled allocator for tile pixel buffers
///
/// Shared between the render thread, conversion workers and the control
/// thread. Allocation and release are serialized per sub-pool.
///
/// # Example
///
/// ```
/// use anim_frame_cache::pool::{TileBufferPool, TileBufferPoolConfig};
///
/// let pool = TileBufferPool::new(TileBufferPoolConfig::default());
///
/// let mut buffer = pool.allocate(4);
/// buffer.set_len(16 * 16 * 4);
/// buffer.fill(0xff);
///
/// assert_eq!(pool.stats_for(4).unwrap().live, 1);
/// drop(buffer);
/// assert_eq!(pool.stats_for(4).unwrap().live, 0);
/// ```
pub struct TileBufferPool {
    config: TileBufferPoolConfig,
    purge_sink: Option<Sender<PurgeRequest>>,
    sub_pools: RwLock<HashMap<usize, Arc<SubPool>>>,
}

impl TileBufferPool {
    /// Create a pool that never schedules deferred purges
    pub fn new(config: TileBufferPoolConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            purge_sink: None,
            sub_pools: RwLock::new(HashMap::new()),
        })
    }

    /// Create a pool that posts purge requests into `purge_sink`
    ///
    /// The receiving end belongs to the control thread's
    /// [`PurgeScheduler`](crate::purge::PurgeScheduler).
    pub fn with_purge_sink(config: TileBufferPoolConfig, purge_sink: Sender<PurgeRequest>) -> Arc<Self> {
        Arc::new(Self {
            config,
            purge_sink: Some(purge_sink),
            sub_pools: RwLock::new(HashMap::new()),
        })
    }

    /// Get the pool configuration
    pub fn config(&self) -> &TileBufferPoolConfig {
        &self.config
    }

    /// Chunk size in bytes for the given pixel size
    pub fn chunk_size(&self, pixel_size: usize) -> usize {
        self.config.geometry.chunk_pixels() * pixel_size
    }

    fn sub_pool(&self, pixel_size: usize) -> Arc<SubPool> {
        if let Some(pool) = self.sub_pools.read().get(&pixel_size) {
            return Arc::clone(pool);
        }

        let mut pools = self.sub_pools.write();
        Arc::clone(pools.entry(pixel_size).or_insert_with(|| {
            Arc::new(SubPool::new(pixel_size, self.config, self.purge_sink.clone()))
        }))
    }

    /// Allocate one chunk for pixels of `pixel_size` bytes
    ///
    /// The returned buffer's length equals its full capacity; use
    /// [`TileBuffer::set_len`] to narrow it to the patch size.
    ///
    /// # Panics
    ///
    /// Panics if `pixel_size` is zero.
    pub fn allocate(&self, pixel_size: usize) -> TileBuffer {
        assert!(pixel_size > 0, "pixel size must be non-zero");

        let pool = self.sub_pool(pixel_size);
        let data = pool.take();
        let len = data.len();

        TileBuffer {
            data: Some(data),
            len,
            pool,
        }
    }

    /// Allocate a buffer holding exactly `pixel_count` pixels
    ///
    /// Returns `None` if the pixels do not fit into one chunk.
    pub fn allocate_pixels(&self, pixel_size: usize, pixel_count: usize) -> Option<TileBuffer> {
        let len = pixel_count.checked_mul(pixel_size)?;
        if len > self.chunk_size(pixel_size) {
            return None;
        }

        let mut buffer = self.allocate(pixel_size);
        buffer.set_len(len);
        Some(buffer)
    }

    /// Return a buffer to its sub-pool
    ///
    /// Equivalent to dropping the buffer; the pixel size is checked against
    /// the sub-pool the buffer was borrowed from.
    pub fn release(&self, buffer: TileBuffer, pixel_size: usize) {
        debug_assert_eq!(
            buffer.pixel_size(),
            pixel_size,
            "buffer released with a mismatching pixel size"
        );
        drop(buffer);
    }

    /// Execute a purge request
    ///
    /// Releases all reserved chunks of the sub-pool if it still has no live
    /// buffers and no release happened since the request was posted.
    /// Returns true if memory was released.
    pub fn try_purge(&self, request: PurgeRequest) -> bool {
        let pool = self.sub_pools.read().get(&request.pixel_size).cloned();
        match pool {
            Some(pool) => pool.try_purge(request.free_stamp),
            None => false,
        }
    }

    /// Statistics for the sub-pool serving `pixel_size`, if it exists
    pub fn stats_for(&self, pixel_size: usize) -> Option<SubPoolStats> {
        self.sub_pools.read().get(&pixel_size).map(|pool| pool.stats())
    }

    /// Statistics for every sub-pool, ordered by pixel size
    pub fn stats(&self) -> Vec<SubPoolStats> {
        let mut stats: Vec<_> = self.sub_pools.read().values().map(|pool| pool.stats()).collect();
        stats.sort_by_key(|s| s.pixel_size);
        stats
    }
}

impl fmt::Debug for TileBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileBufferPool")
            .field("config", &self.config)
            .field("sub_pools", &self.stats())
            .finish()
    }
}

/// Pixel buffer borrowed from a [`TileBufferPool`]
///
/// Dereferences to the first [`len`](TileBuffer::len) bytes of the chunk.
/// The chunk goes back to its sub-pool when the handle is dropped.
pub struct TileBuffer {
    data: Option<Box<[u8]>>,
    len: usize,
    pool: Arc<SubPool>,
}

impl TileBuffer {
    /// Pixel byte-size of the sub-pool this buffer belongs to
    pub fn pixel_size(&self) -> usize {
        self.pool.pixel_size
    }

    /// Full chunk size in bytes
    pub fn capacity(&self) -> usize {
        self.pool.chunk_size
    }

    /// Logical length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the logical length is zero
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of whole pixels in the logical length
    pub fn pixel_count(&self) -> usize {
        self.len / self.pool.pixel_size
    }

    /// Set the logical length
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds the chunk capacity.
    pub fn set_len(&mut self, len: usize) {
        assert!(
            len <= self.capacity(),
            "tile buffer length {} exceeds chunk capacity {}",
            len,
            self.capacity()
        );
        self.len = len;
    }
}

impl Deref for TileBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self.data.as_deref() {
            Some(data) => &data[..self.len],
            None => &[],
        }
    }
}

impl DerefMut for TileBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        match self.data.as_deref_mut() {
            Some(data) => &mut data[..len],
            None => &mut [],
        }
    }
}

impl Clone for TileBuffer {
    fn clone(&self) -> Self {
        let mut data = self.pool.take();
        data[..self.len].copy_from_slice(self);

        TileBuffer {
            data: Some(data),
            len: self.len,
            pool: Arc::clone(&self.pool),
        }
    }
}

impl Drop for TileBuffer {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.pool.give_back(data);
        }
    }
}

impl fmt::Debug for TileBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileBuffer")
            .field("pixel_size", &self.pixel_size())
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}
