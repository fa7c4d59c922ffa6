//! Damage accumulation for output buffers
//!
//! Every output buffer remembers which parts of it are stale relative to the
//! guest's shared memory. Damage posted on a surface is added to all of that
//! surface's buffers, and a buffer's damage is cleared only when its contents
//! are refreshed during a commit.
//!
//! The region is kept as a set of pairwise disjoint rectangles, so it is an
//! exact union (no bounding-box approximation) and copying it never touches
//! a pixel twice.
//!
//! # Example
//!
//! ```
//! use carafe::geometry::Rect;
//! use carafe::transport::damage::Region;
//!
//! let mut damage = Region::new();
//! damage.add(Rect::new(0, 0, 10, 10));
//! damage.add(Rect::new(5, 5, 10, 10));
//!
//! assert!(damage.contains_point(12, 12));
//! assert_eq!(damage.area(), 175);
//! ```

use crate::geometry::Rect;

/// Union of rectangles in buffer pixel coordinates
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Region {
    rects: Vec<Rect>,
}

impl Region {
    pub fn new() -> Self {
        Self::default()
    }

    /// A region covering everything; new buffers start fully damaged
    pub fn full() -> Self {
        Self {
            rects: vec![Rect::infinite()],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn clear(&mut self) {
        self.rects.clear();
    }

    /// Adds `rect` to the region, keeping the stored rectangles disjoint
    pub fn add(&mut self, rect: Rect) {
        if rect.is_empty() {
            return;
        }
        if self.rects.iter().any(|r| r.contains(&rect)) {
            return;
        }

        // Rectangles swallowed by the new one are dropped outright
        self.rects.retain(|r| !rect.contains(r));

        let mut pieces = vec![rect];
        for existing in &self.rects {
            pieces = pieces
                .into_iter()
                .flat_map(|p| p.subtract(existing))
                .collect();
            if pieces.is_empty() {
                return;
            }
        }
        self.rects.extend(pieces);
    }

    /// Adds every rectangle of `other`
    pub fn union_with(&mut self, other: &Region) {
        for rect in &other.rects {
            self.add(*rect);
        }
    }

    pub fn contains_point(&self, x: i32, y: i32) -> bool {
        self.rects.iter().any(|r| r.contains_point(x, y))
    }

    pub fn area(&self) -> i64 {
        self.rects.iter().map(Rect::area).sum()
    }

    pub fn rects(&self) -> &[Rect] {
        &self.rects
    }

    /// Bounding box of the whole region
    pub fn extents(&self) -> Rect {
        self.rects
            .iter()
            .fold(Rect::default(), |acc, r| acc.bounding(r))
    }

    /// Rectangles of the region clipped to `bounds`
    pub fn clipped(&self, bounds: &Rect) -> impl Iterator<Item = Rect> + '_ {
        let bounds = *bounds;
        self.rects
            .iter()
            .filter_map(move |r| r.intersection(&bounds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_rect_ignored() {
        let mut region = Region::new();
        region.add(Rect::new(5, 5, 0, 10));
        assert!(region.is_empty());
    }

    #[test]
    fn test_contained_rect_is_noop() {
        let mut region = Region::new();
        region.add(Rect::new(0, 0, 100, 100));
        region.add(Rect::new(10, 10, 5, 5));
        assert_eq!(region.rects().len(), 1);
    }

    #[test]
    fn test_overlap_counted_once() {
        let mut region = Region::new();
        region.add(Rect::new(0, 0, 10, 10));
        region.add(Rect::new(5, 5, 10, 10));
        assert_eq!(region.area(), 175);
        assert_eq!(region.extents(), Rect::new(0, 0, 15, 15));
    }

    #[test]
    fn test_full_region_clips_to_buffer() {
        let region = Region::full();
        let clipped: Vec<_> = region.clipped(&Rect::new(0, 0, 64, 32)).collect();
        assert_eq!(clipped, vec![Rect::new(0, 0, 64, 32)]);
    }

    fn arb_rect() -> impl Strategy<Value = Rect> {
        (0i32..40, 0i32..40, 0i32..20, 0i32..20).prop_map(|(x, y, w, h)| Rect::new(x, y, w, h))
    }

    proptest! {
        #[test]
        fn prop_region_is_exact_union(rects in prop::collection::vec(arb_rect(), 0..12)) {
            let mut region = Region::new();
            for r in &rects {
                region.add(*r);
            }
            for x in 0..60 {
                for y in 0..60 {
                    let expected = rects.iter().any(|r| r.contains_point(x, y));
                    prop_assert_eq!(region.contains_point(x, y), expected);
                }
            }
        }

        #[test]
        fn prop_region_rects_disjoint(rects in prop::collection::vec(arb_rect(), 0..12)) {
            let mut region = Region::new();
            for r in &rects {
                region.add(*r);
            }
            let stored = region.rects();
            for (i, a) in stored.iter().enumerate() {
                for b in &stored[i + 1..] {
                    prop_assert!(!a.intersects(b));
                }
            }
        }

        #[test]
        fn prop_union_is_idempotent(rects in prop::collection::vec(arb_rect(), 0..8)) {
            let mut once = Region::new();
            for r in &rects {
                once.add(*r);
            }
            let mut twice = once.clone();
            for r in &rects {
                twice.add(*r);
            }
            prop_assert_eq!(once.area(), twice.area());
        }
    }
}
