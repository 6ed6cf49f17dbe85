//! Pluggable frame persistence behind the cache index
//!
//! [`FrameCacheSwapper`] is what [`AnimationFrameCache`] talks to when it
//! needs to keep, fetch or drop the tiles of a frame. Two backends exist:
//!
//! - [`InMemoryFrameSwapper`] keeps the live tile lists in a map.
//! - [`DiskFrameSwapper`] compresses frames into files via
//!   [`FrameCacheStore`].
//!
//! The swapper boundary never reports errors. Failures are logged and turn
//! into "frame not cached", which the cache handles as a miss.
//!
//! Saving can be split across threads. [`FrameCacheSwapper::preparer`]
//! hands out a [`FramePreparer`] that does the heavy part of a save (for
//! the disk backend: diffing and compression) wherever it runs, and
//! [`FrameCacheSwapper::save_prepared`] stores the result.
//!
//! [`AnimationFrameCache`]: crate::frame_cache::AnimationFrameCache

use std::collections::HashMap;
use std::sync::Arc;

use crate::builder::UpdateInfoBuilder;
use crate::config::FrameCacheConfig;
use crate::frame::FrameId;
use crate::rect::Rect;
use crate::store::{EncodedFrame, FrameCacheStore, FrameEncoder};
use crate::tile::{dirty_image_rect, TileUpdateInfo};

/// Tile list shared between the swapper and the upload collaborator
pub type SharedTiles = Arc<Vec<TileUpdateInfo>>;

/// Frame readied for a swapper, possibly on another thread
pub enum PreparedFrame {
    Tiles(Vec<TileUpdateInfo>),
    /// Diffed and compressed for the disk backend
    Encoded(EncodedFrame),
}

/// Heavy half of a save, detached from the swapper
#[derive(Clone, Default)]
pub enum FramePreparer {
    /// Keeps tiles as they are
    #[default]
    Passthrough,
    Encode(FrameEncoder),
}

impl FramePreparer {
    pub fn prepare(&self, tiles: Vec<TileUpdateInfo>, image_bounds: &Rect) -> PreparedFrame {
        match self {
            FramePreparer::Passthrough => PreparedFrame::Tiles(tiles),
            FramePreparer::Encode(encoder) => PreparedFrame::Encoded(encoder.encode(tiles, image_bounds)),
        }
    }
}

/// Storage backend for cached frames
pub trait FrameCacheSwapper: Send {
    /// Take ownership of `tiles` and keep them under `frame_id`
    fn save_frame(&mut self, frame_id: FrameId, tiles: Vec<TileUpdateInfo>, image_bounds: &Rect);

    /// Snapshot for preparing frames away from the swapper
    fn preparer(&self) -> FramePreparer {
        FramePreparer::Passthrough
    }

    /// Keep a frame made by [`preparer`](Self::preparer) under `frame_id`
    fn save_prepared(&mut self, frame_id: FrameId, frame: PreparedFrame, image_bounds: &Rect) {
        match frame {
            PreparedFrame::Tiles(tiles) => self.save_frame(frame_id, tiles, image_bounds),
            PreparedFrame::Encoded(_) => {
                tracing::warn!(frame_id, "encoded frame handed to a swapper that cannot store it");
            }
        }
    }

    /// Tiles of `frame_id`, or `None` if they are not available
    fn load_frame(&mut self, frame_id: FrameId) -> Option<SharedTiles>;

    fn move_frame(&mut self, src: FrameId, dst: FrameId);

    fn forget_frame(&mut self, frame_id: FrameId);

    fn has_frame(&self, frame_id: FrameId) -> bool;

    fn frame_level_of_detail(&self, frame_id: FrameId) -> Option<u32>;

    /// Full-resolution area covered by the stored tiles
    fn frame_dirty_rect(&self, frame_id: FrameId) -> Option<Rect>;

    /// Number of frames currently held
    fn frame_count(&self) -> usize;
}

#[derive(Debug)]
struct MemoryFrame {
    tiles: SharedTiles,
    level_of_detail: u32,
    dirty_rect: Rect,
}

/// Keeps frames as live tile lists
#[derive(Debug, Default)]
pub struct InMemoryFrameSwapper {
    frames: HashMap<FrameId, MemoryFrame>,
}

impl InMemoryFrameSwapper {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameCacheSwapper for InMemoryFrameSwapper {
    fn save_frame(&mut self, frame_id: FrameId, tiles: Vec<TileUpdateInfo>, image_bounds: &Rect) {
        let level_of_detail = tiles.first().map_or(0, |tile| tile.level_of_detail);
        let dirty_rect = dirty_image_rect(&tiles, image_bounds);

        self.frames.insert(
            frame_id,
            MemoryFrame {
                tiles: Arc::new(tiles),
                level_of_detail,
                dirty_rect,
            },
        );
    }

    fn load_frame(&mut self, frame_id: FrameId) -> Option<SharedTiles> {
        self.frames.get(&frame_id).map(|frame| Arc::clone(&frame.tiles))
    }

    fn move_frame(&mut self, src: FrameId, dst: FrameId) {
        if let Some(frame) = self.frames.remove(&src) {
            self.frames.insert(dst, frame);
        }
    }

    fn forget_frame(&mut self, frame_id: FrameId) {
        self.frames.remove(&frame_id);
    }

    fn has_frame(&self, frame_id: FrameId) -> bool {
        self.frames.contains_key(&frame_id)
    }

    fn frame_level_of_detail(&self, frame_id: FrameId) -> Option<u32> {
        self.frames.get(&frame_id).map(|frame| frame.level_of_detail)
    }

    fn frame_dirty_rect(&self, frame_id: FrameId) -> Option<Rect> {
        self.frames.get(&frame_id).map(|frame| frame.dirty_rect)
    }

    fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

/// Keeps frames compressed on disk
pub struct DiskFrameSwapper {
    store: FrameCacheStore,
    builder: Arc<UpdateInfoBuilder>,
}

impl DiskFrameSwapper {
    /// Wrap a store; `builder` rebuilds update records on load
    pub fn new(store: FrameCacheStore, builder: Arc<UpdateInfoBuilder>) -> Self {
        Self { store, builder }
    }

    pub fn store(&self) -> &FrameCacheStore {
        &self.store
    }
}

impl FrameCacheSwapper for DiskFrameSwapper {
    fn save_frame(&mut self, frame_id: FrameId, tiles: Vec<TileUpdateInfo>, image_bounds: &Rect) {
        if let Err(err) = self.store.save(frame_id, tiles, image_bounds) {
            tracing::warn!(frame_id, error = %err, "failed to swap frame out, dropping it");
        }
    }

    fn preparer(&self) -> FramePreparer {
        FramePreparer::Encode(self.store.encoder())
    }

    fn save_prepared(&mut self, frame_id: FrameId, frame: PreparedFrame, image_bounds: &Rect) {
        match frame {
            PreparedFrame::Tiles(tiles) => self.save_frame(frame_id, tiles, image_bounds),
            PreparedFrame::Encoded(encoded) => {
                if let Err(err) = self.store.commit(frame_id, encoded) {
                    tracing::warn!(frame_id, error = %err, "failed to swap frame out, dropping it");
                }
            }
        }
    }

    fn load_frame(&mut self, frame_id: FrameId) -> Option<SharedTiles> {
        match self.store.load(frame_id, &self.builder) {
            Ok(tiles) => Some(Arc::new(tiles)),
            Err(err) => {
                tracing::warn!(frame_id, error = %err, "failed to load swapped frame");
                None
            }
        }
    }

    fn move_frame(&mut self, src: FrameId, dst: FrameId) {
        if let Err(err) = self.store.move_frame(src, dst) {
            tracing::warn!(src, dst, error = %err, "failed to move swapped frame");
        }
    }

    fn forget_frame(&mut self, frame_id: FrameId) {
        if let Err(err) = self.store.forget(frame_id) {
            tracing::warn!(frame_id, error = %err, "failed to remove swapped frame data");
        }
    }

    fn has_frame(&self, frame_id: FrameId) -> bool {
        self.store.has_frame(frame_id)
    }

    fn frame_level_of_detail(&self, frame_id: FrameId) -> Option<u32> {
        self.store.level_of_detail(frame_id)
    }

    fn frame_dirty_rect(&self, frame_id: FrameId) -> Option<Rect> {
        self.store.dirty_rect(frame_id)
    }

    fn frame_count(&self) -> usize {
        self.store.frame_count()
    }
}

/// Pick the swapper backend selected by `config`
///
/// Falls back to the in-memory backend when the swap directory cannot be
/// created.
pub fn create_swapper(config: &FrameCacheConfig, builder: Arc<UpdateInfoBuilder>) -> Box<dyn FrameCacheSwapper> {
    if !config.use_on_disk_swap {
        return Box::new(InMemoryFrameSwapper::new());
    }

    match FrameCacheStore::new(&config.swap_directory, Arc::clone(builder.pool())) {
        Ok(store) => Box::new(DiskFrameSwapper::new(store, builder)),
        Err(err) => {
            tracing::warn!(
                directory = %config.swap_directory.display(),
                error = %err,
                "cannot use on-disk swap, keeping frames in memory"
            );
            Box::new(InMemoryFrameSwapper::new())
        }
    }
}
