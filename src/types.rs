//! Common types and traits for the rack coordinate space.
//!
//! This module defines the integer coordinate triple used to address slots
//! and the identifier newtypes shared by every other module.

use std::fmt;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Integer position inside a rack grid.
///
/// * `x` - width (column across the rack face)
/// * `y` - depth (0 is the front, access side)
/// * `z` - height (level)
///
/// # Examples
/// ```
/// use rackflow::types::Coord;
///
/// let slot = Coord::new(3, 1, 1);
/// assert!(slot.same_column(&Coord::new(3, 0, 1)));
/// ```
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
pub struct Coord {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl Coord {
    /// Creates a new coordinate.
    #[inline]
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// The intake/exit position every delivered box ends up at.
    #[inline]
    pub const fn origin() -> Self {
        Self::new(0, 0, 0)
    }

    /// Converts to tuple format.
    #[inline]
    pub const fn as_tuple(&self) -> (i32, i32, i32) {
        (self.x, self.y, self.z)
    }

    /// Two coordinates share a column when width and height match; depth may differ.
    #[inline]
    pub fn same_column(&self, other: &Self) -> bool {
        self.x == other.x && self.z == other.z
    }

    /// Checks if the coordinate lies inside a grid of the given extent (exclusive upper bounds).
    #[inline]
    pub fn fits_within(&self, width: u32, depth: u32, height: u32) -> bool {
        in_range(self.x, width) && in_range(self.y, depth) && in_range(self.z, height)
    }
}

fn in_range(value: i32, extent: u32) -> bool {
    value >= 0 && (value as u32) < extent
}

impl From<(i32, i32, i32)> for Coord {
    #[inline]
    fn from(tuple: (i32, i32, i32)) -> Self {
        Self::new(tuple.0, tuple.1, tuple.2)
    }
}

impl fmt::Display for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{},{})", self.x, self.y, self.z)
    }
}

/// Identifier of a top-level rack (e.g. `RACK-A`, `DUMMY-01`).
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
#[serde(transparent)]
pub struct RackId(pub String);

impl RackId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store-assigned slot identifier.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
#[serde(transparent)]
pub struct SlotId(pub u32);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

/// Business key of a box (e.g. `QBE1004004002`). Immutable once minted.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
#[serde(transparent)]
pub struct BoxId(pub String);

impl BoxId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BoxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BoxId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Trait for objects with a position in the rack coordinate space.
pub trait Positioned {
    /// Returns the current coordinates.
    fn coord(&self) -> Coord;

    /// Depth of the object; smaller values sit closer to the access side.
    fn depth(&self) -> i32 {
        self.coord().y
    }
}

impl Positioned for Coord {
    fn coord(&self) -> Coord {
        *self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_column_ignores_depth() {
        let a = Coord::new(2, 5, 1);
        assert!(a.same_column(&Coord::new(2, 0, 1)));
        assert!(!a.same_column(&Coord::new(2, 5, 2)));
        assert!(!a.same_column(&Coord::new(3, 5, 1)));
    }

    #[test]
    fn test_fits_within_bounds() {
        assert!(Coord::new(0, 0, 0).fits_within(1, 1, 1));
        assert!(Coord::new(3, 4, 2).fits_within(4, 5, 3));
        assert!(!Coord::new(4, 0, 0).fits_within(4, 5, 3));
        assert!(!Coord::new(-1, 0, 0).fits_within(4, 5, 3));
    }

    #[test]
    fn test_coord_display() {
        assert_eq!(Coord::new(9, 9, 0).to_string(), "(9,9,0)");
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let json = serde_json::to_string(&BoxId::new("QBE1004004002")).unwrap();
        assert_eq!(json, "\"QBE1004004002\"");
        let json = serde_json::to_string(&SlotId(7)).unwrap();
        assert_eq!(json, "7");
    }
}
