//! Flat frame records and frame-to-frame pixel arithmetic
//!
//! A [`Frame`] is the storage-side view of a cached frame: a list of tiles,
//! each carrying its grid position, rectangle and a pooled pixel buffer.
//! The free functions below compare and diff two frames of identical shape.

use crate::pool::TileBuffer;
use crate::rect::Rect;

/// Opaque frame identifier
pub type FrameId = i32;

/// One tile of a stored frame
#[derive(Debug, Clone)]
pub struct FrameTile {
    pub col: i32,
    pub row: i32,
    /// Rectangle covered by `data`
    pub rect: Rect,
    /// Exactly `pixel_size * rect.area()` bytes
    pub data: TileBuffer,
}

impl FrameTile {
    pub fn new(col: i32, row: i32, rect: Rect, data: TileBuffer) -> Self {
        Self { col, row, rect, data }
    }
}

/// Frame in serializer format
#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_id: FrameId,
    pub pixel_size: usize,
    pub tiles: Vec<FrameTile>,
}

impl Frame {
    pub fn new(frame_id: FrameId, pixel_size: usize) -> Self {
        Self {
            frame_id,
            pixel_size,
            tiles: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Total pixel bytes over all tiles
    pub fn byte_size(&self) -> usize {
        self.tiles.iter().map(|tile| tile.data.len()).sum()
    }

    /// Returns true if both frames have the same pixel size and the same
    /// tile layout in the same order
    pub fn is_compatible_with(&self, other: &Frame) -> bool {
        self.pixel_size == other.pixel_size
            && self.tiles.len() == other.tiles.len()
            && self.tiles.iter().zip(&other.tiles).all(|(lhs, rhs)| {
                lhs.col == rhs.col
                    && lhs.row == rhs.row
                    && lhs.rect == rhs.rect
                    && lhs.data.len() == rhs.data.len()
            })
    }
}

/// Estimate the fraction of pixels that differ between two frames
///
/// Every `round(1 / sampling_portion)`-th pixel of each tile is compared
/// byte-for-byte. Returns `None` when the frames have different shapes or
/// nothing could be sampled.
///
/// # Example
///
/// ```
/// use anim_frame_cache::frame::{estimate_uniqueness, Frame};
///
/// let lhs = Frame::new(1, 4);
/// let rhs = Frame::new(2, 4);
/// // No tiles: nothing to sample
/// assert_eq!(estimate_uniqueness(&lhs, &rhs, 0.1), None);
/// ```
pub fn estimate_uniqueness(lhs: &Frame, rhs: &Frame, sampling_portion: f64) -> Option<f64> {
    if !lhs.is_compatible_with(rhs) || sampling_portion.is_nan() || sampling_portion <= 0.0 {
        return None;
    }

    let pixel_size = lhs.pixel_size;
    let step = ((1.0 / sampling_portion).round() as usize).max(1);

    let mut sampled = 0usize;
    let mut different = 0usize;

    for (lhs_tile, rhs_tile) in lhs.tiles.iter().zip(&rhs.tiles) {
        let lhs_pixels = lhs_tile.data.chunks_exact(pixel_size);
        let rhs_pixels = rhs_tile.data.chunks_exact(pixel_size);

        for (a, b) in lhs_pixels.zip(rhs_pixels).step_by(step) {
            sampled += 1;
            if a != b {
                different += 1;
            }
        }
    }

    if sampled == 0 {
        None
    } else {
        Some(different as f64 / sampled as f64)
    }
}

macro_rules! word_ops {
    ($sub:ident, $add:ident, $ty:ty) => {
        fn $sub(dst: &mut [u8], src: &[u8]) -> bool {
            const WIDTH: usize = std::mem::size_of::<$ty>();
            let mut identical = true;
            for (d, s) in dst.chunks_exact_mut(WIDTH).zip(src.chunks_exact(WIDTH)) {
                let mut dw = [0u8; WIDTH];
                let mut sw = [0u8; WIDTH];
                dw.copy_from_slice(d);
                sw.copy_from_slice(s);
                let value = <$ty>::from_le_bytes(dw).wrapping_sub(<$ty>::from_le_bytes(sw));
                identical &= value == 0;
                d.copy_from_slice(&value.to_le_bytes());
            }
            identical
        }

        fn $add(dst: &mut [u8], src: &[u8]) {
            const WIDTH: usize = std::mem::size_of::<$ty>();
            for (d, s) in dst.chunks_exact_mut(WIDTH).zip(src.chunks_exact(WIDTH)) {
                let mut dw = [0u8; WIDTH];
                let mut sw = [0u8; WIDTH];
                dw.copy_from_slice(d);
                sw.copy_from_slice(s);
                let value = <$ty>::from_le_bytes(dw).wrapping_add(<$ty>::from_le_bytes(sw));
                d.copy_from_slice(&value.to_le_bytes());
            }
        }
    };
}

word_ops!(sub_u64, add_u64, u64);
word_ops!(sub_u32, add_u32, u32);
word_ops!(sub_u16, add_u16, u16);
word_ops!(sub_u8, add_u8, u8);

fn word_width(pixel_size: usize) -> usize {
    match pixel_size {
        n if n % 8 == 0 => 8,
        n if n % 4 == 0 => 4,
        n if n % 2 == 0 => 2,
        _ => 1,
    }
}

/// Replace `dst` with `dst - src`, word by word
///
/// Returns true if the frames were byte-identical, in which case `dst` is
/// now all zeros. Frames of different shape are left untouched and reported
/// as not identical.
pub fn subtract_frames(dst: &mut Frame, src: &Frame) -> bool {
    if !dst.is_compatible_with(src) {
        debug_assert!(false, "subtracting frames of different shape");
        return false;
    }

    let sub: fn(&mut [u8], &[u8]) -> bool = match word_width(dst.pixel_size) {
        8 => sub_u64,
        4 => sub_u32,
        2 => sub_u16,
        _ => sub_u8,
    };

    let mut identical = true;
    for (d, s) in dst.tiles.iter_mut().zip(&src.tiles) {
        identical &= sub(&mut d.data, &s.data);
    }
    identical
}

/// Replace `dst` with `dst + src`, word by word
///
/// Inverse of [`subtract_frames`].
pub fn add_frames(dst: &mut Frame, src: &Frame) {
    if !dst.is_compatible_with(src) {
        debug_assert!(false, "adding frames of different shape");
        return;
    }

    let add: fn(&mut [u8], &[u8]) = match word_width(dst.pixel_size) {
        8 => add_u64,
        4 => add_u32,
        2 => add_u16,
        _ => add_u8,
    };

    for (d, s) in dst.tiles.iter_mut().zip(&src.tiles) {
        add(&mut d.data, &s.data);
    }
}
