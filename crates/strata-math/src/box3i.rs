//! Axis-aligned integer box in chunk coordinates.
//!
//! A `Box3i` is stored as an origin and a size, covering the half-open cell
//! range `[pos, pos + size)`. Boxes with any non-positive size component are
//! empty. This is the unit of work for clipbox streaming: resident regions,
//! volume bounds and diff deltas are all chunk boxes.

use glam::IVec3;
use serde::{Deserialize, Serialize};

use crate::coords::{ceil_div, floor_div};

/// Half-open axis-aligned box of grid cells, `[pos, pos + size)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Box3i {
    pub pos: IVec3,
    pub size: IVec3,
}

impl Box3i {
    /// The empty box at the origin.
    pub const ZERO: Box3i = Box3i {
        pos: IVec3::ZERO,
        size: IVec3::ZERO,
    };

    pub fn new(pos: IVec3, size: IVec3) -> Self {
        Self { pos, size }
    }

    /// Box covering `[min, max)`. Degenerate inputs produce an empty box.
    pub fn from_min_max(min: IVec3, max: IVec3) -> Self {
        Self {
            pos: min,
            size: (max - min).max(IVec3::ZERO),
        }
    }

    /// Exclusive upper corner.
    pub fn end(&self) -> IVec3 {
        self.pos + self.size
    }

    /// True if the box contains no cells.
    pub fn is_empty(&self) -> bool {
        self.size.x <= 0 || self.size.y <= 0 || self.size.z <= 0
    }

    /// Number of cells in the box.
    pub fn cell_count(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            self.size.x as u64 * self.size.y as u64 * self.size.z as u64
        }
    }

    pub fn contains_point(&self, p: IVec3) -> bool {
        let end = self.end();
        p.x >= self.pos.x
            && p.y >= self.pos.y
            && p.z >= self.pos.z
            && p.x < end.x
            && p.y < end.y
            && p.z < end.z
    }

    /// True if every cell of `other` is a cell of `self`. Empty boxes are
    /// contained in everything.
    pub fn contains(&self, other: Box3i) -> bool {
        if other.is_empty() {
            return true;
        }
        let end = self.end();
        let oend = other.end();
        other.pos.x >= self.pos.x
            && other.pos.y >= self.pos.y
            && other.pos.z >= self.pos.z
            && oend.x <= end.x
            && oend.y <= end.y
            && oend.z <= end.z
    }

    /// True if the boxes share at least one cell.
    pub fn intersects(&self, other: Box3i) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        let end = self.end();
        let oend = other.end();
        self.pos.x < oend.x
            && self.pos.y < oend.y
            && self.pos.z < oend.z
            && other.pos.x < end.x
            && other.pos.y < end.y
            && other.pos.z < end.z
    }

    /// Common cells of both boxes; empty if they don't intersect.
    pub fn intersection(&self, other: Box3i) -> Box3i {
        Box3i::from_min_max(self.pos.max(other.pos), self.end().min(other.end()))
    }

    /// Restrict this box to `bounds`.
    pub fn clip(&mut self, bounds: Box3i) {
        *self = self.clipped(bounds);
    }

    pub fn clipped(&self, bounds: Box3i) -> Box3i {
        self.intersection(bounds)
    }

    /// Grow this box to also cover `other`. Empty operands are ignored so a
    /// cleared box never drags the result toward the origin.
    pub fn merge_with(&mut self, other: Box3i) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            *self = other;
            return;
        }
        *self = Box3i::from_min_max(self.pos.min(other.pos), self.end().max(other.end()));
    }

    /// Box grown by `amount` cells on every face. Negative amounts shrink;
    /// over-shrinking produces an empty box.
    pub fn padded(&self, amount: i32) -> Box3i {
        Box3i {
            pos: self.pos - IVec3::splat(amount),
            size: (self.size + IVec3::splat(2 * amount)).max(IVec3::ZERO),
        }
    }

    /// Smallest box on a coarser grid covering this box: the minimum rounds
    /// down, the end rounds up.
    pub fn downscaled(&self, step: i32) -> Box3i {
        Box3i::from_min_max(floor_div(self.pos, step), ceil_div(self.end(), step))
    }

    /// Largest box on a coarser grid fully inside this box: the minimum
    /// rounds up, the end rounds down. May be empty.
    pub fn downscaled_inner(&self, step: i32) -> Box3i {
        Box3i::from_min_max(ceil_div(self.pos, step), floor_div(self.end(), step))
    }

    pub fn scaled(&self, factor: i32) -> Box3i {
        Box3i {
            pos: self.pos * factor,
            size: self.size * factor,
        }
    }

    /// Rounded outward so both the position and the size are even. This is
    /// what keeps non-root LOD boxes aligned to whole groups of 8 siblings.
    pub fn snapped_even_outward(&self) -> Box3i {
        self.downscaled(2).scaled(2)
    }

    /// Visit every cell position in the box.
    pub fn for_each_cell(&self, mut f: impl FnMut(IVec3)) {
        let end = self.end();
        for z in self.pos.z..end.z {
            for y in self.pos.y..end.y {
                for x in self.pos.x..end.x {
                    f(IVec3::new(x, y, z));
                }
            }
        }
    }

    /// Cells of `self` not covered by `other`, emitted as up to six disjoint
    /// boxes. Together with `self ∩ other` the emitted boxes partition
    /// `self`.
    pub fn difference(&self, other: Box3i, mut f: impl FnMut(Box3i)) {
        if self.is_empty() {
            return;
        }
        if !self.intersects(other) {
            f(*self);
            return;
        }

        let mut min = self.pos;
        let mut max = self.end();
        let omin = other.pos;
        let omax = other.end();

        // Peel one slab per face of the intersection, shrinking the
        // remaining region after each cut.
        if omin.x > min.x {
            f(Box3i::from_min_max(min, IVec3::new(omin.x, max.y, max.z)));
            min.x = omin.x;
        }
        if omax.x < max.x {
            f(Box3i::from_min_max(IVec3::new(omax.x, min.y, min.z), max));
            max.x = omax.x;
        }
        if omin.y > min.y {
            f(Box3i::from_min_max(min, IVec3::new(max.x, omin.y, max.z)));
            min.y = omin.y;
        }
        if omax.y < max.y {
            f(Box3i::from_min_max(IVec3::new(min.x, omax.y, min.z), max));
            max.y = omax.y;
        }
        if omin.z > min.z {
            f(Box3i::from_min_max(min, IVec3::new(max.x, max.y, omin.z)));
            min.z = omin.z;
        }
        if omax.z < max.z {
            f(Box3i::from_min_max(IVec3::new(min.x, min.y, omax.z), max));
        }
    }
}
