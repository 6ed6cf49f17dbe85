//! Time-indexed cache of converted animation frames
//!
//! [`AnimationFrameCache`] maps animation time onto stored frames. The index
//! is a sorted map of [`CacheEntry`] records, each covering a half-open
//! time interval. Several entries may point at one frame (a *hold*); the
//! frame is only dropped from the swapper once its last entry is gone.
//!
//! All mutation happens on the control thread. Rendering and conversion
//! run elsewhere and hand their results in through
//! [`AnimationFrameCache::add_converted_frame_data`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::builder::{ProjectionSource, UpdateInfoBuilder};
use crate::config::FrameCacheConfig;
use crate::frame::FrameId;
use crate::rect::{effective_level_of_detail, Rect};
use crate::swapper::{create_swapper, FrameCacheSwapper, FramePreparer, PreparedFrame};
use crate::tile::{PixelFormat, TileUpdateInfo};

/// Half-open span of animation time, `end == None` means forever
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeSpan {
    pub start: i32,
    pub end: Option<i32>,
}

impl TimeSpan {
    /// Finite span `[start, end)`
    pub const fn new(start: i32, end: i32) -> Self {
        Self { start, end: Some(end) }
    }

    /// Span covering `start` and everything after it
    pub const fn infinite_from(start: i32) -> Self {
        Self { start, end: None }
    }

    /// Span covering exactly one frame
    ///
    /// The last representable time holds forever.
    pub const fn single(time: i32) -> Self {
        match time.checked_add(1) {
            Some(end) => Self::new(time, end),
            None => Self::infinite_from(time),
        }
    }

    pub fn is_infinite(&self) -> bool {
        self.end.is_none()
    }

    pub fn is_empty(&self) -> bool {
        self.end.is_some_and(|end| end <= self.start)
    }

    pub fn contains(&self, time: i32) -> bool {
        time >= self.start && self.end.map_or(true, |end| time < end)
    }

    fn end_key(&self) -> i64 {
        self.end.map_or(i64::MAX, i64::from)
    }

    /// Returns true if the spans overlap
    pub fn intersects(&self, other: &TimeSpan) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && i64::from(self.start) < other.end_key()
            && i64::from(other.start) < self.end_key()
    }

    fn touches(&self, other: &TimeSpan) -> bool {
        i64::from(self.start) <= other.end_key() && i64::from(other.start) <= self.end_key()
    }

    fn union(&self, other: &TimeSpan) -> TimeSpan {
        TimeSpan {
            start: self.start.min(other.start),
            end: match (self.end, other.end) {
                (Some(a), Some(b)) => Some(a.max(b)),
                _ => None,
            },
        }
    }
}

/// Normalized set of time spans: sorted, disjoint and non-adjacent
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimeSpanSet {
    spans: Vec<TimeSpan>,
}

impl TimeSpanSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a span, merging it with every span it overlaps or touches
    pub fn insert(&mut self, span: TimeSpan) {
        if span.is_empty() {
            return;
        }

        let mut merged = span;
        let mut spans = Vec::with_capacity(self.spans.len() + 1);
        for existing in self.spans.drain(..) {
            if existing.touches(&merged) {
                merged = merged.union(&existing);
            } else {
                spans.push(existing);
            }
        }
        spans.push(merged);
        spans.sort_by_key(|span| span.start);
        self.spans = spans;
    }

    pub fn spans(&self) -> &[TimeSpan] {
        &self.spans
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn contains(&self, time: i32) -> bool {
        self.spans.iter().any(|span| span.contains(time))
    }
}

impl FromIterator<TimeSpan> for TimeSpanSet {
    fn from_iter<I: IntoIterator<Item = TimeSpan>>(iter: I) -> Self {
        let mut set = TimeSpanSet::new();
        for span in iter {
            set.insert(span);
        }
        set
    }
}

/// Maps `[start, start + length)` onto a stored frame
///
/// A negative `length` means the entry holds from `start` onwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntry {
    pub start: i32,
    pub length: i32,
    pub frame_id: FrameId,
}

impl CacheEntry {
    /// Entry for `span`; spans longer than `i32::MAX` keep their end
    fn from_span(span: TimeSpan, frame_id: FrameId) -> Self {
        let Some(end) = span.end else {
            return Self {
                start: span.start,
                length: -1,
                frame_id,
            };
        };

        match end.checked_sub(span.start) {
            Some(length) => Self {
                start: span.start,
                length,
                frame_id,
            },
            None => Self {
                start: end - i32::MAX,
                length: i32::MAX,
                frame_id,
            },
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.length < 0
    }

    /// Exclusive end, `None` when unbounded
    pub fn end(&self) -> Option<i32> {
        if self.is_unbounded() {
            None
        } else {
            Some(self.start + self.length)
        }
    }

    pub fn span(&self) -> TimeSpan {
        TimeSpan {
            start: self.start,
            end: self.end(),
        }
    }

    pub fn contains(&self, time: i32) -> bool {
        self.span().contains(time)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Cached,
    Uncached,
}

/// Layer-stack analysis telling which times render identically
pub trait IdenticalFramesProvider: Send {
    /// Times whose rendering is identical to the one at `time`
    fn identical_frames(&self, time: i32) -> TimeSpanSet;
}

/// GPU-upload collaborator
pub trait TileUploader {
    fn upload(&mut self, tiles: &[TileUpdateInfo]);
}

/// Cache statistics for monitoring
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameCacheStats {
    /// Number of entries in the time index
    pub entries: usize,
    /// Number of distinct frames referenced by the index
    pub stored_frames: usize,
    /// Uploads served from the cache
    pub hits: u64,
    /// Uploads requested for uncached times
    pub misses: u64,
    /// Frames added since creation
    pub frames_added: u64,
    /// Frames dropped from the swapper since creation
    pub frames_forgotten: u64,
}

impl FrameCacheStats {
    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Patches read from a projection, not yet converted for display
pub struct FrameData {
    pub tiles: Vec<TileUpdateInfo>,
    pub pixel_format: PixelFormat,
}

/// Everything needed to turn a projection into cacheable tiles
///
/// Snapshot of the cache settings, safe to hand to another thread.
#[derive(Clone)]
pub struct FrameDataFetcher {
    builder: Arc<UpdateInfoBuilder>,
    preparer: FramePreparer,
    image_bounds: Rect,
    frame_size_limit: u32,
}

impl FrameDataFetcher {
    pub fn image_bounds(&self) -> Rect {
        self.image_bounds
    }

    /// Level of detail used for `region`
    pub fn level_of_detail(&self, region: &Rect) -> u32 {
        effective_level_of_detail(self.frame_size_limit, region)
    }

    /// Read `region` from `source` into tile patches
    pub fn fetch(&self, source: &dyn ProjectionSource, region: &Rect) -> FrameData {
        let region = region.intersected(&self.image_bounds);
        let level_of_detail = self.level_of_detail(&region);

        FrameData {
            tiles: self
                .builder
                .build(&region, source, &self.image_bounds, level_of_detail, false),
            pixel_format: source.pixel_format(),
        }
    }

    /// Convert fetched patches for display
    pub fn convert(&self, data: FrameData) -> Vec<TileUpdateInfo> {
        self.builder.convert_tiles(data.tiles, &data.pixel_format)
    }

    /// Ready converted tiles for the swapper, compressing them if it
    /// stores frames on disk
    pub fn prepare(&self, tiles: Vec<TileUpdateInfo>) -> PreparedFrame {
        self.preparer.prepare(tiles, &self.image_bounds)
    }
}

/// Time-indexed frame cache
pub struct AnimationFrameCache {
    swapper: Box<dyn FrameCacheSwapper>,
    builder: Arc<UpdateInfoBuilder>,
    entries: BTreeMap<i32, CacheEntry>,
    frame_refs: HashMap<FrameId, Vec<i32>>,
    next_frame_id: FrameId,
    image_bounds: Rect,
    frame_size_limit: u32,
    identical_frames: Option<Box<dyn IdenticalFramesProvider>>,
    stats: FrameCacheStats,
}

impl AnimationFrameCache {
    /// Create a cache with the swapper backend selected by `config`
    pub fn new(config: &FrameCacheConfig, builder: Arc<UpdateInfoBuilder>, image_bounds: Rect) -> Self {
        let swapper = create_swapper(config, Arc::clone(&builder));
        Self::with_swapper(swapper, builder, image_bounds, config.effective_frame_size_limit())
    }

    pub fn with_swapper(
        swapper: Box<dyn FrameCacheSwapper>,
        builder: Arc<UpdateInfoBuilder>,
        image_bounds: Rect,
        frame_size_limit: u32,
    ) -> Self {
        Self {
            swapper,
            builder,
            entries: BTreeMap::new(),
            frame_refs: HashMap::new(),
            next_frame_id: 1,
            image_bounds,
            frame_size_limit,
            identical_frames: None,
            stats: FrameCacheStats::default(),
        }
    }

    /// Install the identical-frames analysis
    ///
    /// Without one, every frame is assumed unique to its own time.
    pub fn set_identical_frames_provider(&mut self, provider: Box<dyn IdenticalFramesProvider>) {
        self.identical_frames = Some(provider);
    }

    pub fn builder(&self) -> &Arc<UpdateInfoBuilder> {
        &self.builder
    }

    pub fn swapper(&self) -> &dyn FrameCacheSwapper {
        self.swapper.as_ref()
    }

    pub fn image_bounds(&self) -> Rect {
        self.image_bounds
    }

    pub fn frame_size_limit(&self) -> u32 {
        self.frame_size_limit
    }

    /// Change the LOD ceiling; frames cached so far are kept
    pub fn set_frame_size_limit(&mut self, frame_size_limit: u32) {
        self.frame_size_limit = frame_size_limit;
    }

    /// Level of detail frames covering `rect` are cached at
    pub fn effective_level_of_detail(&self, rect: &Rect) -> u32 {
        effective_level_of_detail(self.frame_size_limit, rect)
    }

    /// Snapshot of the settings needed to produce tiles for this cache
    pub fn frame_data_fetcher(&self) -> FrameDataFetcher {
        FrameDataFetcher {
            builder: Arc::clone(&self.builder),
            preparer: self.swapper.preparer(),
            image_bounds: self.image_bounds,
            frame_size_limit: self.frame_size_limit,
        }
    }

    /// Entry covering `time`, if any
    fn entry_at(&self, time: i32) -> Option<&CacheEntry> {
        self.entries
            .range(..=time)
            .next_back()
            .map(|(_, entry)| entry)
            .filter(|entry| entry.contains(time))
    }

    pub fn frame_status(&self, time: i32) -> FrameStatus {
        if self.entry_at(time).is_some() {
            FrameStatus::Cached
        } else {
            FrameStatus::Uncached
        }
    }

    pub fn frame_id_at(&self, time: i32) -> Option<FrameId> {
        self.entry_at(time).map(|entry| entry.frame_id)
    }

    /// Hand the cached tiles for `time` to `uploader`
    ///
    /// Returns false on a miss; misses are resolved by regeneration, never
    /// here. A frame the swapper can no longer produce is dropped from the
    /// index.
    pub fn upload_frame(&mut self, time: i32, uploader: &mut dyn TileUploader) -> bool {
        let Some(frame_id) = self.frame_id_at(time) else {
            self.stats.misses += 1;
            return false;
        };

        match self.swapper.load_frame(frame_id) {
            Some(tiles) => {
                uploader.upload(&tiles);
                self.stats.hits += 1;
                true
            }
            None => {
                tracing::warn!(time, frame_id, "cached frame unavailable, dropping it");
                self.drop_frame(frame_id);
                self.stats.misses += 1;
                false
            }
        }
    }

    /// Insert freshly converted tiles rendered for `time`
    ///
    /// The frame is entered for every time the identical-frames analysis
    /// reports as rendering the same as `time`. Returns false if the
    /// swapper failed to keep the frame.
    pub fn add_converted_frame_data(&mut self, tiles: Vec<TileUpdateInfo>, time: i32) -> bool {
        self.add_prepared_frame(PreparedFrame::Tiles(tiles), time)
    }

    /// Like [`add_converted_frame_data`](Self::add_converted_frame_data)
    /// for a frame made by [`FrameDataFetcher::prepare`]
    pub fn add_prepared_frame(&mut self, frame: PreparedFrame, time: i32) -> bool {
        let mut range = match self.identical_frames.as_ref() {
            Some(provider) => provider.identical_frames(time),
            None => TimeSpanSet::new(),
        };
        if !range.contains(time) {
            range.insert(TimeSpan::single(time));
        }

        for span in range.spans() {
            self.invalidate(*span);
        }

        let frame_id = self.next_frame_id;
        self.next_frame_id += 1;

        self.swapper.save_prepared(frame_id, frame, &self.image_bounds);
        if !self.swapper.has_frame(frame_id) {
            tracing::warn!(time, frame_id, "frame was not stored, leaving time uncached");
            return false;
        }

        for span in range.spans() {
            self.insert_entry(CacheEntry::from_span(*span, frame_id));
        }
        self.stats.frames_added += 1;

        tracing::debug!(time, frame_id, spans = range.spans().len(), "frame cached");
        true
    }

    /// The source changed over `range`: forget everything cached there
    pub fn frames_changed(&mut self, range: TimeSpan) {
        tracing::debug!(?range, "frames changed");
        self.invalidate(range);
    }

    /// Drop frames in `range` that are too coarse or do not cover enough
    ///
    /// A frame is dropped when its level of detail is coarser than the one
    /// `region_of_interest` would be cached at now, or when its dirty rect
    /// does not contain `minimal_rect`.
    pub fn drop_low_quality_frames(&mut self, range: TimeSpan, region_of_interest: &Rect, minimal_rect: &Rect) {
        let required_lod = self.effective_level_of_detail(region_of_interest);

        let doomed: Vec<TimeSpan> = self
            .entries
            .values()
            .filter(|entry| entry.span().intersects(&range))
            .filter(|entry| {
                let lod = self.swapper.frame_level_of_detail(entry.frame_id);
                let dirty = self.swapper.frame_dirty_rect(entry.frame_id);
                lod.map_or(true, |lod| lod > required_lod)
                    || dirty.map_or(true, |dirty| !dirty.contains_rect(minimal_rect))
            })
            .map(|entry| entry.span())
            .collect();

        for span in doomed {
            tracing::debug!(?span, "dropping low quality frame");
            self.invalidate(span);
        }
    }

    /// Remove or shorten every entry intersecting `span`
    fn invalidate(&mut self, span: TimeSpan) {
        if span.is_empty() {
            return;
        }

        let first = self
            .entries
            .range(..=span.start)
            .next_back()
            .filter(|(_, entry)| entry.contains(span.start))
            .map_or(span.start, |(start, _)| *start);

        let keys: Vec<i32> = match span.end {
            Some(end) => self.entries.range(first..end).map(|(start, _)| *start).collect(),
            None => self.entries.range(first..).map(|(start, _)| *start).collect(),
        };

        for key in keys {
            let Some(entry) = self.entries.get(&key).copied() else {
                continue;
            };

            let right = match span.end {
                Some(end) if entry.end().map_or(true, |entry_end| entry_end > end) => Some(CacheEntry::from_span(
                    TimeSpan {
                        start: end,
                        end: entry.end(),
                    },
                    entry.frame_id,
                )),
                _ => None,
            };

            if let Some(right) = right {
                self.insert_entry(right);
            }

            if entry.start < span.start {
                // Left part survives in place
                if let Some(kept) = self.entries.get_mut(&key) {
                    kept.length = span.start.saturating_sub(entry.start);
                }
            } else {
                self.entries.remove(&key);
                self.remove_ref(entry.frame_id, key);
            }
        }
    }

    fn insert_entry(&mut self, entry: CacheEntry) {
        debug_assert!(entry.length != 0, "empty cache entry");
        self.entries.insert(entry.start, entry);
        self.frame_refs.entry(entry.frame_id).or_default().push(entry.start);
    }

    fn remove_ref(&mut self, frame_id: FrameId, start: i32) {
        let now_unused = match self.frame_refs.get_mut(&frame_id) {
            Some(starts) => {
                starts.retain(|&s| s != start);
                starts.is_empty()
            }
            None => false,
        };

        if now_unused {
            self.frame_refs.remove(&frame_id);
            self.swapper.forget_frame(frame_id);
            self.stats.frames_forgotten += 1;
            tracing::trace!(frame_id, "frame forgotten");
        }
    }

    /// Remove every entry referencing `frame_id` and forget the frame
    fn drop_frame(&mut self, frame_id: FrameId) {
        let starts = self.frame_refs.get(&frame_id).cloned().unwrap_or_default();
        for start in starts {
            self.entries.remove(&start);
            self.remove_ref(frame_id, start);
        }
    }

    /// Forget every cached frame
    pub fn clear(&mut self) {
        let frame_ids: Vec<FrameId> = self.frame_refs.keys().copied().collect();
        for frame_id in frame_ids {
            self.drop_frame(frame_id);
        }
        debug_assert!(self.entries.is_empty());
    }

    /// The canvas was resized; cached tiles no longer line up
    pub fn image_bounds_changed(&mut self, image_bounds: Rect) {
        if image_bounds == self.image_bounds {
            return;
        }
        tracing::debug!(?image_bounds, "image bounds changed, clearing frame cache");
        self.clear();
        self.image_bounds = image_bounds;
    }

    /// Index entries in time order
    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    /// Every time covered by a cached frame
    pub fn cached_frames(&self) -> TimeSpanSet {
        self.entries.values().map(|entry| entry.span()).collect()
    }

    pub fn stats(&self) -> FrameCacheStats {
        FrameCacheStats {
            entries: self.entries.len(),
            stored_frames: self.frame_refs.len(),
            ..self.stats
        }
    }

    /// Verify the index invariants
    ///
    /// # Errors
    /// Describes the first violation found.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut previous: Option<&CacheEntry> = None;
        let mut ref_count = 0usize;

        for (key, entry) in &self.entries {
            if *key != entry.start {
                return Err(format!("entry at {} is keyed as {}", entry.start, key));
            }
            if entry.length == 0 {
                return Err(format!("entry at {} is empty", entry.start));
            }
            if let Some(prev) = previous {
                match prev.end() {
                    None => return Err(format!("unbounded entry at {} is not the last one", prev.start)),
                    Some(end) if end > entry.start => {
                        return Err(format!("entries at {} and {} overlap", prev.start, entry.start));
                    }
                    _ => {}
                }
            }
            let referenced = self
                .frame_refs
                .get(&entry.frame_id)
                .is_some_and(|starts| starts.contains(&entry.start));
            if !referenced {
                return Err(format!("entry at {} is missing from frame references", entry.start));
            }
            previous = Some(entry);
        }

        for (frame_id, starts) in &self.frame_refs {
            if starts.is_empty() {
                return Err(format!("frame {} has no references", frame_id));
            }
            if !self.swapper.has_frame(*frame_id) {
                return Err(format!("frame {} is referenced but not stored", frame_id));
            }
            ref_count += starts.len();
        }

        if ref_count != self.entries.len() {
            return Err(format!(
                "{} frame references for {} entries",
                ref_count,
                self.entries.len()
            ));
        }
        Ok(())
    }
}
