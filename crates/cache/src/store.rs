//! Frame persistence on top of the serializer
//!
//! [`FrameCacheStore`] turns the builder's [`TileUpdateInfo`] lists into
//! serializer [`Frame`]s and back. Besides the pixels it remembers, per
//! frame, the level of detail, the dirty image rectangle, the image bounds
//! and the color space, which is everything needed to rebuild the update
//! records on load.
//!
//! Consecutive frames of an animation tend to look alike, so frames are
//! diff-encoded against the last frame that was stored in full:
//!
//! - *Full*: the pixels are stored as-is and become the new diff base.
//! - *Diff*: the pixels minus the base are stored.
//! - *Copy*: the frame equals the base byte for byte; nothing is written.
//!
//! Serializer data is reference counted and deleted once no record refers
//! to it.
//!
//! Saving is split in two so the expensive part can leave the control
//! thread. A [`FrameEncoder`] taken from the store picks the encoding,
//! diffs and compresses the frame on whatever thread runs it. The resulting
//! [`EncodedFrame`] is handed to [`FrameCacheStore::commit`], which only
//! writes the file and updates the bookkeeping. If the diff base was
//! released in between, the commit falls back to storing the frame in full.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::builder::UpdateInfoBuilder;
use crate::error::{CacheError, CacheResult};
use crate::frame::{add_frames, estimate_uniqueness, subtract_frames, Frame, FrameId, FrameTile};
use crate::pool::TileBufferPool;
use crate::rect::Rect;
use crate::serializer::{FrameDataSerializer, FramePayload};
use crate::tile::{dirty_image_rect, ColorSpaceTag, TileUpdateInfo};

/// Frames less unique than this are stored as a diff
const MAX_DIFF_UNIQUENESS: f64 = 0.5;
/// Portion of pixels sampled when comparing against the diff base
const UNIQUENESS_SAMPLING_PORTION: f64 = 0.01;

/// How a frame's pixels are stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredFrameKind {
    Full { data_id: FrameId },
    Diff { data_id: FrameId, base_id: FrameId },
    Copy { base_id: FrameId },
}

impl StoredFrameKind {
    fn data_ids(&self) -> impl Iterator<Item = FrameId> {
        let (first, second) = match *self {
            StoredFrameKind::Full { data_id } => (Some(data_id), None),
            StoredFrameKind::Diff { data_id, base_id } => (Some(data_id), Some(base_id)),
            StoredFrameKind::Copy { base_id } => (Some(base_id), None),
        };
        first.into_iter().chain(second)
    }
}

#[derive(Debug, Clone)]
struct FrameRecord {
    kind: StoredFrameKind,
    pixel_size: usize,
    level_of_detail: u32,
    dirty_image_rect: Rect,
    image_bounds: Rect,
    color_space: ColorSpaceTag,
}

#[derive(Clone)]
struct CachedFrame {
    data_id: FrameId,
    frame: Arc<Frame>,
}

enum EncodedContent {
    Full { frame: Arc<Frame>, payload: FramePayload },
    /// `diff` is kept to rebuild the frame if `base` is gone at commit time
    Diff { base: CachedFrame, diff: Frame, payload: FramePayload },
    Copy { base: CachedFrame },
}

impl EncodedContent {
    fn full(frame: Frame) -> Self {
        let payload = FrameDataSerializer::encode(&frame);
        EncodedContent::Full {
            frame: Arc::new(frame),
            payload,
        }
    }
}

/// Frame diffed and compressed, waiting for [`FrameCacheStore::commit`]
pub struct EncodedFrame {
    content: EncodedContent,
    pixel_size: usize,
    level_of_detail: u32,
    dirty_image_rect: Rect,
    image_bounds: Rect,
    color_space: ColorSpaceTag,
}

impl EncodedFrame {
    pub fn level_of_detail(&self) -> u32 {
        self.level_of_detail
    }

    pub fn dirty_image_rect(&self) -> Rect {
        self.dirty_image_rect
    }

    /// Returns true if the frame was encoded against a diff base
    pub fn is_delta(&self) -> bool {
        !matches!(self.content, EncodedContent::Full { .. })
    }
}

/// Off-thread half of [`FrameCacheStore::save`]
///
/// Holds a snapshot of the store's diff base. Cheap to clone and `Send`.
#[derive(Clone, Default)]
pub struct FrameEncoder {
    base: Option<CachedFrame>,
}

impl FrameEncoder {
    /// Move the pixels out of `tiles`, diff them against the base and
    /// compress the result
    pub fn encode(&self, tiles: Vec<TileUpdateInfo>, image_bounds: &Rect) -> EncodedFrame {
        let level_of_detail = tiles.first().map_or(0, |tile| tile.level_of_detail);
        let color_space = tiles.first().map(|tile| tile.color_space.clone()).unwrap_or_default();
        let pixel_size = tiles.first().map_or(0, |tile| tile.pixel_size());

        let dirty_image_rect = dirty_image_rect(&tiles, image_bounds);

        let mut frame = Frame::new(0, pixel_size);
        frame.tiles.reserve(tiles.len());
        for tile in tiles {
            debug_assert_eq!(tile.level_of_detail, level_of_detail, "mixed levels of detail in one frame");
            let (col, row, rect) = (tile.col, tile.row, tile.patch_rect);
            frame.tiles.push(FrameTile::new(col, row, rect, tile.into_buffer()));
        }

        EncodedFrame {
            content: self.encode_content(frame),
            pixel_size,
            level_of_detail,
            dirty_image_rect,
            image_bounds: *image_bounds,
            color_space,
        }
    }

    fn encode_content(&self, mut frame: Frame) -> EncodedContent {
        let Some(base) = self.base.as_ref() else {
            return EncodedContent::full(frame);
        };

        let uniqueness = estimate_uniqueness(&base.frame, &frame, UNIQUENESS_SAMPLING_PORTION);
        if !uniqueness.is_some_and(|u| u < MAX_DIFF_UNIQUENESS) {
            return EncodedContent::full(frame);
        }

        if subtract_frames(&mut frame, &base.frame) {
            return EncodedContent::Copy { base: base.clone() };
        }
        let payload = FrameDataSerializer::encode(&frame);
        EncodedContent::Diff {
            base: base.clone(),
            diff: frame,
            payload,
        }
    }
}

/// Disk-backed frame storage with diff encoding
pub struct FrameCacheStore {
    serializer: FrameDataSerializer,
    records: HashMap<FrameId, FrameRecord>,
    data_refs: HashMap<FrameId, usize>,
    last_full: Option<CachedFrame>,
    last_loaded_base: Option<CachedFrame>,
}

impl FrameCacheStore {
    /// Create a store writing under `swap_directory`
    ///
    /// # Errors
    /// Returns an error if the serializer directory cannot be created.
    pub fn new(swap_directory: &Path, pool: Arc<TileBufferPool>) -> CacheResult<Self> {
        Ok(Self::with_serializer(FrameDataSerializer::new(swap_directory, pool)?))
    }

    pub fn with_serializer(serializer: FrameDataSerializer) -> Self {
        Self {
            serializer,
            records: HashMap::new(),
            data_refs: HashMap::new(),
            last_full: None,
            last_loaded_base: None,
        }
    }

    pub fn serializer(&self) -> &FrameDataSerializer {
        &self.serializer
    }

    /// Encoder diffing against the current base
    pub fn encoder(&self) -> FrameEncoder {
        FrameEncoder {
            base: self.last_full.clone(),
        }
    }

    /// Store `tiles` under `frame_id`
    ///
    /// Encodes on the calling thread; see [`encoder`](Self::encoder) to do
    /// that elsewhere. An existing frame with the same id is replaced.
    ///
    /// # Errors
    /// Returns an error if writing to disk fails; nothing is recorded then.
    pub fn save(&mut self, frame_id: FrameId, tiles: Vec<TileUpdateInfo>, image_bounds: &Rect) -> CacheResult<()> {
        let encoded = self.encoder().encode(tiles, image_bounds);
        self.commit(frame_id, encoded)
    }

    /// Write an encoded frame and record it under `frame_id`
    ///
    /// An existing frame with the same id is replaced.
    ///
    /// # Errors
    /// Returns an error if writing to disk fails; nothing is recorded then.
    pub fn commit(&mut self, frame_id: FrameId, encoded: EncodedFrame) -> CacheResult<()> {
        if self.records.contains_key(&frame_id) {
            self.forget(frame_id)?;
        }

        let content = self.rebase(encoded.content);
        let kind = match content {
            EncodedContent::Full { frame, payload } => {
                let data_id = self.serializer.save_payload(&payload)?;
                self.last_full = Some(CachedFrame { data_id, frame });
                StoredFrameKind::Full { data_id }
            }
            EncodedContent::Diff { base, payload, .. } => {
                let data_id = self.serializer.save_payload(&payload)?;
                StoredFrameKind::Diff {
                    data_id,
                    base_id: base.data_id,
                }
            }
            EncodedContent::Copy { base } => StoredFrameKind::Copy { base_id: base.data_id },
        };

        for data_id in kind.data_ids() {
            *self.data_refs.entry(data_id).or_insert(0) += 1;
        }

        tracing::debug!(frame_id, ?kind, level_of_detail = encoded.level_of_detail, "frame stored");

        self.records.insert(
            frame_id,
            FrameRecord {
                kind,
                pixel_size: encoded.pixel_size,
                level_of_detail: encoded.level_of_detail,
                dirty_image_rect: encoded.dirty_image_rect,
                image_bounds: encoded.image_bounds,
                color_space: encoded.color_space,
            },
        );
        Ok(())
    }

    /// Turn a delta whose base data was released into a full frame
    fn rebase(&self, content: EncodedContent) -> EncodedContent {
        match content {
            EncodedContent::Diff { base, mut diff, .. } if !self.data_refs.contains_key(&base.data_id) => {
                tracing::debug!(base_id = base.data_id, "diff base released before commit, storing in full");
                add_frames(&mut diff, &base.frame);
                EncodedContent::full(diff)
            }
            EncodedContent::Copy { base } if !self.data_refs.contains_key(&base.data_id) => {
                tracing::debug!(base_id = base.data_id, "copy base released before commit, storing in full");
                EncodedContent::full(Frame::clone(&base.frame))
            }
            content => content,
        }
    }

    /// Rebuild the update records of `frame_id`
    ///
    /// # Errors
    /// Returns an error if the frame is unknown, its data cannot be read,
    /// or the stored data is inconsistent with its record.
    pub fn load(&mut self, frame_id: FrameId, builder: &UpdateInfoBuilder) -> CacheResult<Vec<TileUpdateInfo>> {
        let record = self
            .records
            .get(&frame_id)
            .cloned()
            .ok_or(CacheError::MissingFrame(frame_id))?;

        let frame = match record.kind {
            StoredFrameKind::Full { data_id } => match self.last_full.as_ref() {
                Some(cached) if cached.data_id == data_id => Frame::clone(&cached.frame),
                _ => self.serializer.load(data_id)?,
            },
            StoredFrameKind::Diff { data_id, base_id } => {
                let mut diff = self.serializer.load(data_id)?;
                let base = self.base_frame(base_id)?;
                if !diff.is_compatible_with(base) {
                    return Err(CacheError::corrupted(frame_id, "diff does not match its base"));
                }
                add_frames(&mut diff, base);
                diff
            }
            StoredFrameKind::Copy { base_id } => Frame::clone(self.base_frame(base_id)?),
        };

        if !frame.tiles.is_empty() && frame.pixel_size != record.pixel_size {
            debug_assert!(false, "stored pixel size does not match the record");
            return Err(CacheError::corrupted(frame_id, "pixel size mismatch"));
        }

        let tiles = frame
            .tiles
            .into_iter()
            .map(|tile| {
                builder.restore_tile(
                    tile.col,
                    tile.row,
                    tile.rect,
                    record.level_of_detail,
                    &record.image_bounds,
                    record.color_space.clone(),
                    tile.data,
                )
            })
            .collect();

        Ok(tiles)
    }

    fn base_frame(&mut self, data_id: FrameId) -> CacheResult<&Frame> {
        let cached_in = |slot: &Option<CachedFrame>| slot.as_ref().is_some_and(|c| c.data_id == data_id);

        if !cached_in(&self.last_full) && !cached_in(&self.last_loaded_base) {
            let frame = Arc::new(self.serializer.load(data_id)?);
            self.last_loaded_base = Some(CachedFrame { data_id, frame });
        }

        match (&self.last_full, &self.last_loaded_base) {
            (Some(cached), _) if cached.data_id == data_id => Ok(cached.frame.as_ref()),
            (_, Some(cached)) if cached.data_id == data_id => Ok(cached.frame.as_ref()),
            _ => Err(CacheError::MissingFrame(data_id)),
        }
    }

    /// Re-key `src` as `dst`, replacing any frame stored under `dst`
    ///
    /// # Errors
    /// Returns [`CacheError::MissingFrame`] if `src` is unknown.
    pub fn move_frame(&mut self, src: FrameId, dst: FrameId) -> CacheResult<()> {
        if src == dst {
            return Ok(());
        }
        if !self.records.contains_key(&src) {
            return Err(CacheError::MissingFrame(src));
        }
        if self.records.contains_key(&dst) {
            self.forget(dst)?;
        }
        if let Some(record) = self.records.remove(&src) {
            self.records.insert(dst, record);
        }
        Ok(())
    }

    /// Drop `frame_id` and release data no other frame refers to
    ///
    /// # Errors
    /// Returns an error if a data file cannot be removed. The record is
    /// dropped regardless.
    pub fn forget(&mut self, frame_id: FrameId) -> CacheResult<()> {
        let Some(record) = self.records.remove(&frame_id) else {
            return Ok(());
        };

        let mut result = Ok(());
        for data_id in record.kind.data_ids() {
            if let Err(err) = self.release_data(data_id) {
                result = Err(err);
            }
        }
        result
    }

    fn release_data(&mut self, data_id: FrameId) -> CacheResult<()> {
        let remaining = match self.data_refs.get_mut(&data_id) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining > 0 {
            return Ok(());
        }

        self.data_refs.remove(&data_id);
        if self.last_full.as_ref().is_some_and(|c| c.data_id == data_id) {
            self.last_full = None;
        }
        if self.last_loaded_base.as_ref().is_some_and(|c| c.data_id == data_id) {
            self.last_loaded_base = None;
        }

        tracing::trace!(data_id, "frame data released");
        self.serializer.forget(data_id)
    }

    /// Returns true if `frame_id` is recorded and its data is on disk
    pub fn has_frame(&self, frame_id: FrameId) -> bool {
        match self.records.get(&frame_id) {
            Some(record) => record.kind.data_ids().all(|id| self.serializer.has_frame(id)),
            None => false,
        }
    }

    pub fn level_of_detail(&self, frame_id: FrameId) -> Option<u32> {
        self.records.get(&frame_id).map(|record| record.level_of_detail)
    }

    /// Full-resolution rectangle covered by the stored tiles
    pub fn dirty_rect(&self, frame_id: FrameId) -> Option<Rect> {
        self.records.get(&frame_id).map(|record| record.dirty_image_rect)
    }

    pub fn stored_kind(&self, frame_id: FrameId) -> Option<StoredFrameKind> {
        self.records.get(&frame_id).map(|record| record.kind)
    }

    /// Number of recorded frames
    pub fn frame_count(&self) -> usize {
        self.records.len()
    }
}
