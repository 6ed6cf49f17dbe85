//! Tile geometry and per-tile update records
//!
//! A [`TileUpdateInfo`] is the transient unit that flows between the
//! builder, the GPU-upload collaborator and the frame store. It is never
//! persisted as-is: the store keeps the raw pixels plus enough metadata to
//! rebuild it on load.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::pool::TileBuffer;
use crate::rect::Rect;

/// Fixed tile grid layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileGeometry {
    /// Texture tile width in pixels (without border)
    pub tile_width: i32,
    /// Texture tile height in pixels (without border)
    pub tile_height: i32,
    /// Extra pixels added on every side of a physical tile
    pub border: i32,
}

impl Default for TileGeometry {
    fn default() -> Self {
        Self {
            tile_width: 256,
            tile_height: 256,
            border: 1,
        }
    }
}

impl TileGeometry {
    pub const fn new(tile_width: i32, tile_height: i32, border: i32) -> Self {
        Self {
            tile_width,
            tile_height,
            border,
        }
    }

    /// Number of pixels in one bordered tile
    pub fn chunk_pixels(&self) -> usize {
        let width = (self.tile_width + 2 * self.border).max(1) as usize;
        let height = (self.tile_height + 2 * self.border).max(1) as usize;
        width * height
    }

    /// Texture rectangle (without border) of the tile at `(col, row)`
    pub fn texture_rect(&self, col: i32, row: i32) -> Rect {
        Rect::new(
            col * self.tile_width,
            row * self.tile_height,
            self.tile_width,
            self.tile_height,
        )
    }

    /// Column index containing pixel column `x`
    pub fn column_of(&self, x: i32) -> i32 {
        x.div_euclid(self.tile_width)
    }

    /// Row index containing pixel row `y`
    pub fn row_of(&self, y: i32) -> i32 {
        y.div_euclid(self.tile_height)
    }
}

/// Opaque color space identifier
///
/// Color management itself is an external collaborator; the cache only
/// needs to compare and persist the identity of a space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ColorSpaceTag(pub String);

impl ColorSpaceTag {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ColorSpaceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Layout of one pixel in a source projection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelFormat {
    /// Number of channels (including alpha)
    pub channel_count: usize,
    /// Bytes per channel
    pub channel_bytes: usize,
    /// Index of the alpha channel, if any
    pub alpha_channel: Option<usize>,
}

impl PixelFormat {
    /// 8-bit RGBA
    pub const RGBA8: PixelFormat = PixelFormat {
        channel_count: 4,
        channel_bytes: 1,
        alpha_channel: Some(3),
    };

    /// 16-bit RGBA
    pub const RGBA16: PixelFormat = PixelFormat {
        channel_count: 4,
        channel_bytes: 2,
        alpha_channel: Some(3),
    };

    pub fn pixel_size(&self) -> usize {
        self.channel_count * self.channel_bytes
    }
}

/// Whether a tile sits on an edge of the image
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TileEdges {
    pub top: bool,
    pub left: bool,
    pub right: bool,
    pub bottom: bool,
}

impl TileEdges {
    /// Edge flags of the tile `texture_rect` within `image_bounds`
    ///
    /// Both rectangles must be expressed at the same level of detail.
    pub fn of(texture_rect: &Rect, image_bounds: &Rect) -> Self {
        Self {
            top: texture_rect.top() <= image_bounds.top(),
            left: texture_rect.left() <= image_bounds.left(),
            right: texture_rect.right() >= image_bounds.right(),
            bottom: texture_rect.bottom() >= image_bounds.bottom(),
        }
    }
}

/// Pixel patch for one tile of the grid
///
/// Rectangles are expressed in level-of-detail space: when
/// `level_of_detail > 0` they index the downsampled image.
#[derive(Debug, Clone)]
pub struct TileUpdateInfo {
    /// Grid column
    pub col: i32,
    /// Grid row
    pub row: i32,
    /// Texture rectangle of the tile (without border)
    pub tile_rect: Rect,
    /// Rectangle actually covered by `buffer`
    pub patch_rect: Rect,
    /// Downsampling level the patch was produced at
    pub level_of_detail: u32,
    /// Set when the patch covers the whole bordered tile
    pub covers_full_tile: bool,
    /// Position of the tile relative to the image edges
    pub edges: TileEdges,
    /// Color space of the pixels in `buffer`
    pub color_space: ColorSpaceTag,
    buffer: TileBuffer,
}

impl TileUpdateInfo {
    /// Assemble an update record around an already filled buffer
    ///
    /// # Panics
    ///
    /// Panics in debug builds when the buffer length does not match the
    /// patch area.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        col: i32,
        row: i32,
        tile_rect: Rect,
        patch_rect: Rect,
        level_of_detail: u32,
        covers_full_tile: bool,
        edges: TileEdges,
        color_space: ColorSpaceTag,
        buffer: TileBuffer,
    ) -> Self {
        debug_assert_eq!(
            buffer.len(),
            patch_rect.area() * buffer.pixel_size(),
            "patch buffer does not match its rectangle"
        );

        Self {
            col,
            row,
            tile_rect,
            patch_rect,
            level_of_detail,
            covers_full_tile,
            edges,
            color_space,
            buffer,
        }
    }

    /// Pixel bytes of the patch, row-major
    pub fn pixels(&self) -> &[u8] {
        &self.buffer
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    pub fn pixel_size(&self) -> usize {
        self.buffer.pixel_size()
    }

    /// Patch rectangle scaled back to full resolution
    pub fn image_rect(&self) -> Rect {
        self.patch_rect.scaled_up(self.level_of_detail)
    }

    /// Take ownership of the pixel buffer
    pub fn into_buffer(self) -> TileBuffer {
        self.buffer
    }

    pub(crate) fn map_buffer<F>(self, f: F) -> Self
    where
        F: FnOnce(TileBuffer, &ColorSpaceTag) -> (TileBuffer, ColorSpaceTag),
    {
        let Self {
            col,
            row,
            tile_rect,
            patch_rect,
            level_of_detail,
            covers_full_tile,
            edges,
            color_space,
            buffer,
        } = self;
        let (buffer, color_space) = f(buffer, &color_space);

        Self {
            col,
            row,
            tile_rect,
            patch_rect,
            level_of_detail,
            covers_full_tile,
            edges,
            color_space,
            buffer,
        }
    }
}

/// Full-resolution area touched by `tiles`, clipped to `image_bounds`
pub fn dirty_image_rect(tiles: &[TileUpdateInfo], image_bounds: &Rect) -> Rect {
    tiles
        .iter()
        .fold(Rect::default(), |acc, tile| acc.united(&tile.image_rect()))
        .intersected(image_bounds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_chunk_pixels() {
        let geometry = TileGeometry::new(256, 128, 1);
        assert_eq!(geometry.chunk_pixels(), 258 * 130);
    }

    #[test]
    fn test_geometry_grid_lookup() {
        let geometry = TileGeometry::new(64, 64, 0);
        assert_eq!(geometry.column_of(0), 0);
        assert_eq!(geometry.column_of(63), 0);
        assert_eq!(geometry.column_of(64), 1);
        assert_eq!(geometry.column_of(-1), -1);
        assert_eq!(geometry.texture_rect(2, 1), Rect::new(128, 64, 64, 64));
    }

    #[test]
    fn test_pixel_format_size() {
        assert_eq!(PixelFormat::RGBA8.pixel_size(), 4);
        assert_eq!(PixelFormat::RGBA16.pixel_size(), 8);
    }

    #[test]
    fn test_edges() {
        let bounds = Rect::new(0, 0, 100, 100);
        let corner = TileEdges::of(&Rect::new(0, 0, 64, 64), &bounds);
        assert!(corner.top && corner.left && !corner.right && !corner.bottom);

        let last = TileEdges::of(&Rect::new(64, 64, 64, 64), &bounds);
        assert!(!last.top && !last.left && last.right && last.bottom);
    }
}
