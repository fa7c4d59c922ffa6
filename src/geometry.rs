//! Rectangles and the guest↔host scale transform
//!
//! Guest coordinates are the pixels X clients and guest Wayland clients see.
//! Host coordinates are the logical units of the host compositor. A guest
//! length `l` maps to `l / scale` on the host and a host length `h` maps back
//! to `h * scale`.
//!
//! Without a viewporter on the host the factor is rounded to an integer so
//! that buffers can be presented with `wl_surface.set_buffer_scale` and no
//! half-pixel seams appear. With a viewporter the factor keeps its fractional
//! part and surfaces get an explicit viewport destination instead.

/// Smallest accepted scale factor
pub const MIN_SCALE: f64 = 0.1;

/// Largest accepted scale factor
pub const MAX_SCALE: f64 = 10.0;

/// Lower bound for coordinates used as "infinite" damage
pub const MIN_SIZE: i32 = i32::MIN / 10;

/// Upper bound for coordinates used as "infinite" damage
pub const MAX_SIZE: i32 = i32::MAX / 10;

/// Axis-aligned rectangle in pixel coordinates
///
/// Width and height are signed so that clipping arithmetic never wraps; a
/// rectangle with a non-positive extent is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// The rectangle covering every representable coordinate
    pub const fn infinite() -> Self {
        Self {
            x: MIN_SIZE,
            y: MIN_SIZE,
            width: MAX_SIZE - MIN_SIZE,
            height: MAX_SIZE - MIN_SIZE,
        }
    }

    pub fn from_corners(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        let x = x1.min(x2);
        let y = y1.min(y2);
        Self {
            x,
            y,
            width: x1.max(x2) - x,
            height: y1.max(y2) - y,
        }
    }

    #[inline]
    pub fn x2(&self) -> i32 {
        self.x.saturating_add(self.width)
    }

    #[inline]
    pub fn y2(&self) -> i32 {
        self.y.saturating_add(self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    pub fn area(&self) -> i64 {
        if self.is_empty() {
            0
        } else {
            self.width as i64 * self.height as i64
        }
    }

    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        x >= self.x && x < self.x2() && y >= self.y && y < self.y2()
    }

    pub fn contains(&self, other: &Rect) -> bool {
        other.is_empty()
            || (other.x >= self.x
                && other.y >= self.y
                && other.x2() <= self.x2()
                && other.y2() <= self.y2())
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        !(self.is_empty()
            || other.is_empty()
            || self.x2() <= other.x
            || other.x2() <= self.x
            || self.y2() <= other.y
            || other.y2() <= self.y)
    }

    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        if !self.intersects(other) {
            return None;
        }
        Some(Rect::from_corners(
            self.x.max(other.x),
            self.y.max(other.y),
            self.x2().min(other.x2()),
            self.y2().min(other.y2()),
        ))
    }

    /// Smallest rectangle enclosing both
    pub fn bounding(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Rect::from_corners(
            self.x.min(other.x),
            self.y.min(other.y),
            self.x2().max(other.x2()),
            self.y2().max(other.y2()),
        )
    }

    /// Parts of `self` not covered by `other`, as at most four disjoint rectangles
    pub fn subtract(&self, other: &Rect) -> Vec<Rect> {
        let Some(cut) = self.intersection(other) else {
            return if self.is_empty() { Vec::new() } else { vec![*self] };
        };

        let mut parts = Vec::with_capacity(4);
        // Band above the cut
        if cut.y > self.y {
            parts.push(Rect::from_corners(self.x, self.y, self.x2(), cut.y));
        }
        // Band below the cut
        if cut.y2() < self.y2() {
            parts.push(Rect::from_corners(self.x, cut.y2(), self.x2(), self.y2()));
        }
        // Left and right of the cut, limited to the cut's rows
        if cut.x > self.x {
            parts.push(Rect::from_corners(self.x, cut.y, cut.x, cut.y2()));
        }
        if cut.x2() < self.x2() {
            parts.push(Rect::from_corners(cut.x2(), cut.y, self.x2(), cut.y2()));
        }
        parts
    }
}

/// Linear transform between guest pixels and host logical units
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scale {
    factor: f64,
    fractional: bool,
}

impl Default for Scale {
    fn default() -> Self {
        Self {
            factor: 1.0,
            fractional: false,
        }
    }
}

impl Scale {
    /// Builds a transform from a desired factor.
    ///
    /// The factor is clamped to `[MIN_SCALE, MAX_SCALE]`. Unless `viewport`
    /// is set it is then rounded to the nearest integer (never below 1).
    ///
    /// Rounding happens after clamping on purpose: without a viewport the
    /// host only takes integer buffer scales, so a sub-unit request such as
    /// 0.3 becomes 1 rather than the unusable 0.1 that rounding first and
    /// clamping second would give.
    pub fn new(desired: f64, viewport: bool) -> Self {
        let desired = if desired.is_finite() { desired } else { 1.0 };
        let clamped = desired.clamp(MIN_SCALE, MAX_SCALE);
        let factor = if viewport {
            clamped
        } else {
            clamped.round().max(1.0)
        };
        Self {
            factor,
            fractional: viewport,
        }
    }

    #[inline]
    pub fn factor(&self) -> f64 {
        self.factor
    }

    /// Whether surfaces are presented through a viewport destination
    #[inline]
    pub fn uses_viewport(&self) -> bool {
        self.fractional
    }

    /// Integer buffer scale for hosts without a viewporter
    pub fn buffer_scale(&self) -> i32 {
        self.factor.round().max(1.0) as i32
    }

    /// Guest pixels to host units
    #[inline]
    pub fn to_host(&self, guest: i32) -> i32 {
        (guest as f64 / self.factor).round() as i32
    }

    /// Host units to guest pixels
    #[inline]
    pub fn to_guest(&self, host: i32) -> i32 {
        (host as f64 * self.factor).round() as i32
    }

    /// Guest length to host length, rounding up so nothing is cut off
    #[inline]
    pub fn to_host_ceil(&self, guest: i32) -> i32 {
        (guest as f64 / self.factor).ceil() as i32
    }

    /// 24.8 fixed-point host coordinate to guest fixed-point
    #[inline]
    pub fn fixed_to_guest(&self, fixed: i32) -> i32 {
        (fixed as f64 * self.factor).round() as i32
    }

    /// 24.8 fixed-point guest coordinate to host fixed-point
    #[inline]
    pub fn fixed_to_host(&self, fixed: i32) -> i32 {
        (fixed as f64 / self.factor).round() as i32
    }

    /// Rectangle in guest pixels to host units, scaling both corners
    pub fn rect_to_host(&self, rect: Rect) -> Rect {
        let x1 = (rect.x as f64 / self.factor) as i32;
        let y1 = (rect.y as f64 / self.factor) as i32;
        let x2 = (rect.x2() as f64 / self.factor) as i32;
        let y2 = (rect.y2() as f64 / self.factor) as i32;
        Rect::from_corners(x1, y1, x2, y2)
    }

    /// Rectangle in host units to guest pixels, scaling both corners
    pub fn rect_to_guest(&self, rect: Rect) -> Rect {
        let x1 = (rect.x as f64 * self.factor) as i32;
        let y1 = (rect.y as f64 * self.factor) as i32;
        let x2 = (rect.x2() as f64 * self.factor) as i32;
        let y2 = (rect.y2() as f64 * self.factor) as i32;
        Rect::from_corners(x1, y1, x2, y2)
    }

    /// Surface damage in guest pixels to host damage.
    ///
    /// The rectangle is outset by one pixel before scaling and rounded
    /// outwards, so the host always repaints at least what changed.
    pub fn damage_to_host(&self, rect: Rect) -> Rect {
        let x1 = (MIN_SIZE.max(rect.x.saturating_sub(1)) as f64 / self.factor).floor() as i32;
        let y1 = (MIN_SIZE.max(rect.y.saturating_sub(1)) as f64 / self.factor).floor() as i32;
        let x2 = (MAX_SIZE.min(rect.x2().saturating_add(1)) as f64 / self.factor).ceil() as i32;
        let y2 = (MAX_SIZE.min(rect.y2().saturating_add(1)) as f64 / self.factor).ceil() as i32;
        Rect::from_corners(x1, y1, x2, y2)
    }
}
