//! Integer rectangles and level-of-detail scaling
//!
//! All canvas geometry in the cache (image bounds, tile rectangles, patch
//! rectangles, dirty rectangles) is expressed with [`Rect`]. Edges are
//! half-open: a rect covers `x..x + width` and `y..y + height`.

/// Axis-aligned integer rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    /// Left edge (inclusive)
    pub x: i32,
    /// Top edge (inclusive)
    pub y: i32,
    /// Width in pixels
    pub width: i32,
    /// Height in pixels
    pub height: i32,
}

impl Rect {
    /// Create a new rectangle
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Create a rectangle from its half-open edges
    pub fn from_edges(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self::new(left, top, right - left, bottom - top)
    }

    /// Left edge (inclusive)
    pub fn left(&self) -> i32 {
        self.x
    }

    /// Top edge (inclusive)
    pub fn top(&self) -> i32 {
        self.y
    }

    /// Right edge (exclusive)
    pub fn right(&self) -> i32 {
        self.x + self.width
    }

    /// Bottom edge (exclusive)
    pub fn bottom(&self) -> i32 {
        self.y + self.height
    }

    /// Returns true if the rectangle covers no pixels
    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    /// Number of pixels covered by the rectangle
    pub fn area(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            self.width as usize * self.height as usize
        }
    }

    /// The larger of width and height
    pub fn max_dimension(&self) -> i32 {
        self.width.max(self.height)
    }

    /// Intersection of two rectangles (empty when they do not overlap)
    pub fn intersected(&self, other: &Rect) -> Rect {
        let left = self.left().max(other.left());
        let top = self.top().max(other.top());
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());

        if right <= left || bottom <= top {
            Rect::default()
        } else {
            Rect::from_edges(left, top, right, bottom)
        }
    }

    /// Smallest rectangle containing both rectangles
    ///
    /// Empty rectangles are ignored.
    pub fn united(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }

        Rect::from_edges(
            self.left().min(other.left()),
            self.top().min(other.top()),
            self.right().max(other.right()),
            self.bottom().max(other.bottom()),
        )
    }

    /// Returns true if `other` lies completely inside this rectangle
    ///
    /// An empty `other` is contained in every rectangle.
    pub fn contains_rect(&self, other: &Rect) -> bool {
        if other.is_empty() {
            return true;
        }
        !self.is_empty()
            && other.left() >= self.left()
            && other.top() >= self.top()
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    /// Returns true if the pixel at `(px, py)` is inside the rectangle
    pub fn contains_point(&self, px: i32, py: i32) -> bool {
        px >= self.left() && px < self.right() && py >= self.top() && py < self.bottom()
    }

    /// Grow the rectangle by `border` pixels on every side
    pub fn grown(&self, border: i32) -> Rect {
        Rect::new(
            self.x - border,
            self.y - border,
            self.width + 2 * border,
            self.height + 2 * border,
        )
    }

    /// Scale the rectangle down to level of detail `lod`
    ///
    /// The result is aligned outwards so that every full-resolution pixel
    /// touched by `self` maps into the scaled rectangle.
    pub fn scaled_down(&self, lod: u32) -> Rect {
        if lod == 0 || self.is_empty() {
            return *self;
        }

        let factor = 1i32 << lod;
        Rect::from_edges(
            self.left().div_euclid(factor),
            self.top().div_euclid(factor),
            div_ceil(self.right(), factor),
            div_ceil(self.bottom(), factor),
        )
    }

    /// Scale a level-of-detail rectangle back to full resolution
    pub fn scaled_up(&self, lod: u32) -> Rect {
        if lod == 0 {
            return *self;
        }

        let factor = 1i32 << lod;
        Rect::new(
            self.x * factor,
            self.y * factor,
            self.width * factor,
            self.height * factor,
        )
    }
}

fn div_ceil(value: i32, divisor: i32) -> i32 {
    -((-value).div_euclid(divisor))
}

/// Level of detail needed to fit `rect` under a pixel ceiling
///
/// Returns 0 when `frame_size_limit` is 0 (ceiling disabled) or when the
/// rectangle already fits. Otherwise returns the smallest `n` such that the
/// largest dimension of `rect`, divided by `2^n`, fits the limit.
///
/// # Example
///
/// ```
/// use anim_frame_cache::rect::{effective_level_of_detail, Rect};
///
/// assert_eq!(effective_level_of_detail(1024, &Rect::new(0, 0, 4096, 100)), 2);
/// assert_eq!(effective_level_of_detail(1024, &Rect::new(0, 0, 2048, 100)), 1);
/// assert_eq!(effective_level_of_detail(1024, &Rect::new(0, 0, 1000, 100)), 0);
/// ```
pub fn effective_level_of_detail(frame_size_limit: u32, rect: &Rect) -> u32 {
    let max_dimension = rect.max_dimension().max(0) as u64;
    let limit = frame_size_limit as u64;

    if limit == 0 || max_dimension <= limit {
        return 0;
    }

    let mut lod = 0u32;
    while max_dimension > limit << lod {
        lod += 1;
    }
    lod
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intersection() {
        let a = Rect::new(0, 0, 100, 100);
        let b = Rect::new(50, 50, 100, 100);
        assert_eq!(a.intersected(&b), Rect::new(50, 50, 50, 50));

        let c = Rect::new(200, 200, 10, 10);
        assert!(a.intersected(&c).is_empty());

        // Touching edges do not overlap
        let d = Rect::new(100, 0, 10, 10);
        assert!(a.intersected(&d).is_empty());
    }

    #[test]
    fn test_united_ignores_empty() {
        let a = Rect::new(10, 10, 5, 5);
        assert_eq!(a.united(&Rect::default()), a);
        assert_eq!(Rect::default().united(&a), a);
        assert_eq!(
            a.united(&Rect::new(0, 0, 2, 2)),
            Rect::from_edges(0, 0, 15, 15)
        );
    }

    #[test]
    fn test_contains() {
        let a = Rect::new(0, 0, 100, 100);
        assert!(a.contains_rect(&Rect::new(10, 10, 90, 90)));
        assert!(!a.contains_rect(&Rect::new(10, 10, 91, 90)));
        assert!(a.contains_rect(&Rect::default()));
        assert!(a.contains_point(99, 99));
        assert!(!a.contains_point(100, 99));
    }

    #[test]
    fn test_scaled_down_aligns_outwards() {
        let r = Rect::new(3, 5, 10, 3);
        let scaled = r.scaled_down(1);
        assert_eq!(scaled, Rect::from_edges(1, 2, 7, 4));

        let negative = Rect::new(-3, -3, 2, 2);
        assert_eq!(negative.scaled_down(1), Rect::from_edges(-2, -2, 0, 0));

        assert_eq!(r.scaled_down(0), r);
    }

    #[test]
    fn test_scaled_up() {
        let r = Rect::new(1, 2, 3, 4);
        assert_eq!(r.scaled_up(2), Rect::new(4, 8, 12, 16));
        assert!(r.scaled_up(2).scaled_down(2) == r);
    }

    #[test]
    fn test_effective_lod_examples() {
        let limit = 1024;
        assert_eq!(effective_level_of_detail(limit, &Rect::new(0, 0, 4096, 10)), 2);
        assert_eq!(effective_level_of_detail(limit, &Rect::new(0, 0, 2048, 10)), 1);
        assert_eq!(effective_level_of_detail(limit, &Rect::new(0, 0, 1000, 10)), 0);
        assert_eq!(effective_level_of_detail(limit, &Rect::new(0, 0, 10, 1025)), 1);
    }

    #[test]
    fn test_effective_lod_disabled() {
        assert_eq!(effective_level_of_detail(0, &Rect::new(0, 0, 100_000, 10)), 0);
    }

    #[test]
    fn test_effective_lod_is_monotonic() {
        let limit = 1024;
        let mut previous = 0;
        for width in (1..20_000).step_by(97) {
            let lod = effective_level_of_detail(limit, &Rect::new(0, 0, width, 1));
            assert!(lod >= previous, "lod decreased at width {}", width);
            previous = lod;
        }
    }
}
