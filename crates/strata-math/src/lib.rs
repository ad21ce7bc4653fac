//! Integer chunk-grid math: axis-aligned chunk boxes, floor/ceil grid
//! division, and octree child coordinate arithmetic.

pub mod box3i;
pub mod coords;

pub use box3i::Box3i;
pub use coords::{
    ceil_div, ceil_div_i32, child_position, child_position_from_first_sibling, floor_div,
    floor_div_i32,
};
