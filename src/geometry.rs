//! Geometric helpers for access paths inside a rack.
//!
//! Boxes are reached from the front of a rack (y = 0) moving towards larger
//! depths. A position can only be reached once every position in front of it
//! in the same column has been cleared.

use std::cmp::Ordering;

use crate::types::{BoxId, Coord, Positioned};

/// Checks whether `candidate` sits in front of `target` and blocks access to it.
///
/// Same column (x and z), strictly smaller depth.
///
/// # Examples
/// ```
/// use rackflow::geometry::in_front_of;
/// use rackflow::types::Coord;
///
/// assert!(in_front_of(&Coord::new(2, 3, 1), &Coord::new(2, 5, 1)));
/// assert!(!in_front_of(&Coord::new(2, 3, 2), &Coord::new(2, 5, 1)));
/// ```
pub fn in_front_of(candidate: &Coord, target: &Coord) -> bool {
    candidate.same_column(target) && candidate.y < target.y
}

/// Clearing order: nearest to the access side first, ties broken by box id.
pub fn nearest_first<P: Positioned>(a: (&P, &BoxId), b: (&P, &BoxId)) -> Ordering {
    a.0.depth()
        .cmp(&b.0.depth())
        .then_with(|| a.1.cmp(b.1))
}

/// Return order: deepest first, ties broken by box id.
pub fn deepest_first<P: Positioned>(a: (&P, &BoxId), b: (&P, &BoxId)) -> Ordering {
    b.0.depth()
        .cmp(&a.0.depth())
        .then_with(|| a.1.cmp(b.1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shallower_box_in_same_column_blocks() {
        let target = Coord::new(2, 5, 1);
        assert!(in_front_of(&Coord::new(2, 0, 1), &target));
        assert!(in_front_of(&Coord::new(2, 4, 1), &target));
    }

    #[test]
    fn same_depth_or_deeper_never_blocks() {
        let target = Coord::new(2, 5, 1);
        assert!(!in_front_of(&target, &target));
        assert!(!in_front_of(&Coord::new(2, 6, 1), &target));
    }

    #[test]
    fn other_column_never_blocks() {
        let target = Coord::new(2, 5, 1);
        assert!(!in_front_of(&Coord::new(2, 1, 2), &target));
        assert!(!in_front_of(&Coord::new(1, 1, 1), &target));
    }

    #[test]
    fn orderings_break_ties_by_id() {
        let shallow = Coord::new(0, 1, 0);
        let deep = Coord::new(0, 3, 0);
        let a = BoxId::new("A");
        let b = BoxId::new("B");

        assert_eq!(nearest_first((&shallow, &b), (&deep, &a)), Ordering::Less);
        assert_eq!(deepest_first((&shallow, &a), (&deep, &b)), Ordering::Greater);
        assert_eq!(nearest_first((&shallow, &a), (&shallow, &b)), Ordering::Less);
        assert_eq!(deepest_first((&deep, &a), (&deep, &b)), Ordering::Less);
    }
}
