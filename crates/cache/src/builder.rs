//! Partitioning of canvas regions into tile update records
//!
//! [`UpdateInfoBuilder`] reads pixels from a [`ProjectionSource`] and cuts
//! them into per-tile patches aligned to the tile grid, optionally masking
//! channels and converting into a display color space on the way.
//!
//! The grid is computed over the update rectangle grown by the tile border,
//! so a tile whose bordered area overlaps the update only along its seam
//! still receives a patch. Rectangles in the produced records are expressed
//! in level-of-detail space.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::pool::{TileBuffer, TileBufferPool};
use crate::rect::Rect;
use crate::tile::{ColorSpaceTag, PixelFormat, TileEdges, TileGeometry, TileUpdateInfo};

/// Full-canvas pixel source for one animation time
///
/// Implemented by the rendering collaborator. `read_pixels` must fill `dst`
/// with `rect.area() * pixel_format().pixel_size()` bytes in row-major
/// order. `rect` is given in level-of-detail space.
pub trait ProjectionSource: Send + Sync {
    fn pixel_format(&self) -> PixelFormat;

    fn color_space(&self) -> ColorSpaceTag;

    fn read_pixels(&self, rect: &Rect, level_of_detail: u32, dst: &mut [u8]);
}

/// Soft-proofing parameters
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProofingConfig {
    /// Space being simulated
    pub proofing_space: ColorSpaceTag,
    /// Rendering intent as understood by the color converter
    pub intent: u32,
    /// Mark out-of-gamut pixels
    pub gamut_warning: bool,
}

/// Color transform factory supplied by the color management collaborator
pub trait ColorConverter: Send + Sync {
    fn create_transform(
        &self,
        source_format: PixelFormat,
        source: &ColorSpaceTag,
        destination: &ColorSpaceTag,
        proofing: Option<&ProofingConfig>,
    ) -> Box<dyn PixelTransform>;
}

/// Ready-to-run color transform
pub trait PixelTransform: Send {
    /// Pixel byte-size of the transform output
    fn dst_pixel_size(&self) -> usize;

    fn apply(&self, src: &[u8], dst: &mut [u8], pixel_count: usize);
}

/// Display conversion and channel selection settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversionOptions {
    /// Destination color space; `None` keeps the source space
    pub destination: Option<ColorSpaceTag>,
    pub proofing: Option<ProofingConfig>,
    /// Per-channel selection; `None` selects every channel
    pub channel_flags: Option<Vec<bool>>,
    /// Show a lone selected channel in its own color instead of grey
    pub show_single_channel_as_color: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TransformKey {
    source_format: PixelFormat,
    source: ColorSpaceTag,
    destination: ColorSpaceTag,
    proofing: Option<ProofingConfig>,
}

struct CachedTransform {
    key: TransformKey,
    transform: Box<dyn PixelTransform>,
}

#[derive(Default)]
struct BuilderState {
    options: ConversionOptions,
    transform: Option<CachedTransform>,
}

enum ChannelMask {
    Keep,
    Zero(Vec<bool>),
    Broadcast(usize),
}

/// Builds [`TileUpdateInfo`] lists from a projection
pub struct UpdateInfoBuilder {
    geometry: TileGeometry,
    pool: Arc<TileBufferPool>,
    converter: Option<Arc<dyn ColorConverter>>,
    state: Mutex<BuilderState>,
}

impl UpdateInfoBuilder {
    /// Create a builder without color conversion support
    pub fn new(geometry: TileGeometry, pool: Arc<TileBufferPool>) -> Self {
        Self {
            geometry,
            pool,
            converter: None,
            state: Mutex::new(BuilderState::default()),
        }
    }

    /// Attach the color management collaborator
    pub fn with_converter(mut self, converter: Arc<dyn ColorConverter>) -> Self {
        self.converter = Some(converter);
        self
    }

    pub fn geometry(&self) -> &TileGeometry {
        &self.geometry
    }

    pub fn pool(&self) -> &Arc<TileBufferPool> {
        &self.pool
    }

    pub fn conversion_options(&self) -> ConversionOptions {
        self.state.lock().options.clone()
    }

    /// Replace all conversion settings
    ///
    /// The cached transform is kept and rebuilt lazily if the destination
    /// or the proofing setup no longer matches.
    pub fn set_conversion_options(&self, options: ConversionOptions) {
        self.state.lock().options = options;
    }

    pub fn set_destination(&self, destination: Option<ColorSpaceTag>) {
        self.state.lock().options.destination = destination;
    }

    pub fn set_proofing_config(&self, proofing: Option<ProofingConfig>) {
        self.state.lock().options.proofing = proofing;
    }

    pub fn set_channel_flags(&self, channel_flags: Option<Vec<bool>>, show_single_channel_as_color: bool) {
        let mut state = self.state.lock();
        state.options.channel_flags = channel_flags;
        state.options.show_single_channel_as_color = show_single_channel_as_color;
    }

    /// Cut `rect` into per-tile patches
    ///
    /// `rect` and `image_bounds` are full-resolution canvas rectangles.
    /// Tiles are visited column-major; tiles without overlap are skipped
    /// without allocating. When `convert` is set and a destination space
    /// is configured, the patches are converted into it.
    ///
    /// # Example
    ///
    /// ```
    /// use std::sync::Arc;
    /// use anim_frame_cache::builder::{ProjectionSource, UpdateInfoBuilder};
    /// use anim_frame_cache::pool::{TileBufferPool, TileBufferPoolConfig};
    /// use anim_frame_cache::rect::Rect;
    /// use anim_frame_cache::tile::{ColorSpaceTag, PixelFormat, TileGeometry};
    ///
    /// struct White;
    ///
    /// impl ProjectionSource for White {
    ///     fn pixel_format(&self) -> PixelFormat { PixelFormat::RGBA8 }
    ///     fn color_space(&self) -> ColorSpaceTag { ColorSpaceTag::new("sRGB") }
    ///     fn read_pixels(&self, _: &Rect, _: u32, dst: &mut [u8]) { dst.fill(0xff) }
    /// }
    ///
    /// let geometry = TileGeometry::new(64, 64, 1);
    /// let pool = TileBufferPool::new(TileBufferPoolConfig { geometry, ..Default::default() });
    /// let builder = UpdateInfoBuilder::new(geometry, pool);
    ///
    /// let bounds = Rect::new(0, 0, 100, 100);
    /// let tiles = builder.build(&bounds, &White, &bounds, 0, false);
    /// assert_eq!(tiles.len(), 4);
    /// ```
    pub fn build(
        &self,
        rect: &Rect,
        source: &dyn ProjectionSource,
        image_bounds: &Rect,
        level_of_detail: u32,
        convert: bool,
    ) -> Vec<TileUpdateInfo> {
        let update_rect = rect.intersected(image_bounds);
        if update_rect.is_empty() {
            return Vec::new();
        }

        let lod_bounds = image_bounds.scaled_down(level_of_detail);
        let lod_rect = update_rect.scaled_down(level_of_detail).intersected(&lod_bounds);
        if lod_rect.is_empty() {
            return Vec::new();
        }

        let format = source.pixel_format();
        let pixel_size = format.pixel_size();
        let source_space = source.color_space();
        let options = self.conversion_options();
        let mask = channel_mask(&format, &options);

        let grown = lod_rect.grown(self.geometry.border);
        let first_col = self.geometry.column_of(grown.left().max(lod_bounds.left()));
        let last_col = self.geometry.column_of(grown.right().min(lod_bounds.right()) - 1);
        let first_row = self.geometry.row_of(grown.top().max(lod_bounds.top()));
        let last_row = self.geometry.row_of(grown.bottom().min(lod_bounds.bottom()) - 1);

        let mut tiles = Vec::new();

        for col in first_col..=last_col {
            for row in first_row..=last_row {
                let tile_rect = self.geometry.texture_rect(col, row);
                let physical = tile_rect.grown(self.geometry.border).intersected(&lod_bounds);
                let patch = physical.intersected(&lod_rect);
                if patch.is_empty() {
                    continue;
                }

                let Some(mut buffer) = self.pool.allocate_pixels(pixel_size, patch.area()) else {
                    debug_assert!(false, "patch larger than a pooled chunk");
                    continue;
                };

                source.read_pixels(&patch, level_of_detail, &mut buffer);
                apply_channel_mask(&mut buffer, &format, &mask);

                let (buffer, color_space) = if convert {
                    self.convert(buffer, &format, &source_space, &options, patch.area())
                } else {
                    (buffer, source_space.clone())
                };

                tracing::trace!(col, row, ?patch, level_of_detail, "tile patch built");

                tiles.push(TileUpdateInfo::new(
                    col,
                    row,
                    tile_rect,
                    patch,
                    level_of_detail,
                    patch == physical,
                    TileEdges::of(&tile_rect, &lod_bounds),
                    color_space,
                    buffer,
                ));
            }
        }

        tiles
    }

    /// Convert already built patches into the destination color space
    ///
    /// Used when patches are built on one thread and converted on another.
    /// `source_format` is the pixel format the patches were read with.
    pub fn convert_tiles(&self, tiles: Vec<TileUpdateInfo>, source_format: &PixelFormat) -> Vec<TileUpdateInfo> {
        let options = self.conversion_options();
        if self.converter.is_none() || options.destination.is_none() {
            return tiles;
        }

        tiles
            .into_iter()
            .map(|tile| {
                let pixel_count = tile.patch_rect.area();
                tile.map_buffer(|buffer, color_space| {
                    self.convert(buffer, source_format, color_space, &options, pixel_count)
                })
            })
            .collect()
    }

    /// Rebuild an update record from stored tile data
    ///
    /// `patch_rect` is the level-of-detail rectangle the pixels cover and
    /// `image_bounds` the full-resolution canvas bounds at save time.
    #[allow(clippy::too_many_arguments)]
    pub fn restore_tile(
        &self,
        col: i32,
        row: i32,
        patch_rect: Rect,
        level_of_detail: u32,
        image_bounds: &Rect,
        color_space: ColorSpaceTag,
        buffer: TileBuffer,
    ) -> TileUpdateInfo {
        let lod_bounds = image_bounds.scaled_down(level_of_detail);
        let tile_rect = self.geometry.texture_rect(col, row);
        let physical = tile_rect.grown(self.geometry.border).intersected(&lod_bounds);

        TileUpdateInfo::new(
            col,
            row,
            tile_rect,
            patch_rect,
            level_of_detail,
            patch_rect == physical,
            TileEdges::of(&tile_rect, &lod_bounds),
            color_space,
            buffer,
        )
    }

    fn convert(
        &self,
        buffer: TileBuffer,
        format: &PixelFormat,
        source_space: &ColorSpaceTag,
        options: &ConversionOptions,
        pixel_count: usize,
    ) -> (TileBuffer, ColorSpaceTag) {
        let (Some(converter), Some(destination)) = (self.converter.as_ref(), options.destination.as_ref()) else {
            return (buffer, source_space.clone());
        };

        if destination == source_space && options.proofing.is_none() {
            return (buffer, source_space.clone());
        }

        let key = TransformKey {
            source_format: *format,
            source: source_space.clone(),
            destination: destination.clone(),
            proofing: options.proofing.clone(),
        };

        let mut state = self.state.lock();
        let stale = state.transform.as_ref().map_or(true, |cached| cached.key != key);
        if stale {
            tracing::debug!(source = %key.source, destination = %key.destination, "color transform rebuilt");
            let transform =
                converter.create_transform(key.source_format, &key.source, &key.destination, key.proofing.as_ref());
            state.transform = Some(CachedTransform { key, transform });
        }

        let Some(cached) = state.transform.as_ref() else {
            return (buffer, source_space.clone());
        };

        let Some(mut converted) = self.pool.allocate_pixels(cached.transform.dst_pixel_size(), pixel_count) else {
            tracing::warn!("converted patch does not fit a pooled chunk, keeping source pixels");
            return (buffer, source_space.clone());
        };

        cached.transform.apply(&buffer, &mut converted, pixel_count);
        (converted, destination.clone())
    }
}

impl fmt::Debug for UpdateInfoBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateInfoBuilder")
            .field("geometry", &self.geometry)
            .field("options", &self.conversion_options())
            .finish()
    }
}

fn channel_mask(format: &PixelFormat, options: &ConversionOptions) -> ChannelMask {
    let Some(flags) = options.channel_flags.as_ref() else {
        return ChannelMask::Keep;
    };
    if flags.len() != format.channel_count {
        return ChannelMask::Keep;
    }

    let color_channels: Vec<usize> = (0..format.channel_count)
        .filter(|&channel| Some(channel) != format.alpha_channel)
        .collect();
    let selected: Vec<usize> = color_channels.iter().copied().filter(|&channel| flags[channel]).collect();

    if selected.len() == color_channels.len() {
        ChannelMask::Keep
    } else if selected.len() == 1 && !options.show_single_channel_as_color {
        ChannelMask::Broadcast(selected[0])
    } else {
        let mut keep = flags.clone();
        // Alpha is never masked
        if let Some(alpha) = format.alpha_channel {
            keep[alpha] = true;
        }
        ChannelMask::Zero(keep)
    }
}

fn apply_channel_mask(pixels: &mut [u8], format: &PixelFormat, mask: &ChannelMask) {
    let channel_bytes = format.channel_bytes;
    let pixel_size = format.pixel_size();
    if pixel_size == 0 {
        return;
    }

    match mask {
        ChannelMask::Keep => {}
        ChannelMask::Zero(keep) => {
            for pixel in pixels.chunks_exact_mut(pixel_size) {
                for (channel, value) in pixel.chunks_exact_mut(channel_bytes).enumerate() {
                    if !keep[channel] {
                        value.fill(0);
                    }
                }
            }
        }
        ChannelMask::Broadcast(selected) => {
            let offset = selected * channel_bytes;
            for pixel in pixels.chunks_exact_mut(pixel_size) {
                let mut value = [0u8; 16];
                let width = channel_bytes.min(value.len());
                value[..width].copy_from_slice(&pixel[offset..offset + width]);

                for channel in 0..format.channel_count {
                    if Some(channel) == format.alpha_channel {
                        continue;
                    }
                    let start = channel * channel_bytes;
                    pixel[start..start + width].copy_from_slice(&value[..width]);
                }
            }
        }
    }
}
