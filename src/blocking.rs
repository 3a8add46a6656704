//! Blocking resolution for a target rack position.
//!
//! A box blocks a target when it is stored in-location in the same rack grid,
//! in the same (x, z) column, at a strictly smaller depth. Staged boxes have
//! already left the grid and never block.

use crate::geometry::{in_front_of, nearest_first};
use crate::model::WarehouseBox;
use crate::occupancy::OccupancyIndex;
use crate::types::{BoxId, Coord, RackId};

/// Returns the boxes that must be cleared before `target` in `rack` can be reached.
///
/// Ordered nearest first (ascending depth, then box id). `exclude` drops one
/// box from the result, typically the box that is itself being moved.
pub fn resolve_blocking<'a>(
    index: &OccupancyIndex<'a>,
    rack: &RackId,
    target: Coord,
    exclude: Option<&BoxId>,
) -> Vec<&'a WarehouseBox> {
    let mut blocking: Vec<&WarehouseBox> = index
        .boxes()
        .filter(|candidate| candidate.is_in_location())
        .filter(|candidate| Some(&candidate.id) != exclude)
        .filter(|candidate| index.grid_rack_of(candidate) == Some(rack))
        .filter(|candidate| in_front_of(&candidate.coord, &target))
        .collect();
    blocking.sort_by(|a, b| nearest_first((*a, &a.id), (*b, &b.id)));
    blocking
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BoxState, Rack};
    use crate::store::NewSlot;
    use crate::store::fixtures::*;

    fn ids(found: &[&WarehouseBox]) -> Vec<String> {
        found.iter().map(|b| b.id.to_string()).collect()
    }

    #[test]
    fn returns_column_boxes_in_front_nearest_first() {
        let mut wh = warehouse(1);
        stored_box(&mut wh, "Y4", Coord::new(2, 4, 1));
        stored_box(&mut wh, "Y1", Coord::new(2, 1, 1));
        stored_box(&mut wh, "Y3", Coord::new(2, 3, 1));
        stored_box(&mut wh, "OTHER-LEVEL", Coord::new(2, 5, 2));
        stored_box(&mut wh, "BEHIND", Coord::new(2, 6, 1));
        stored_box(&mut wh, "OTHER-COLUMN", Coord::new(1, 1, 1));

        let index = OccupancyIndex::new(&wh);
        let found = resolve_blocking(&index, &rack_a(), Coord::new(2, 5, 1), None);
        assert_eq!(ids(&found), vec!["Y1", "Y3", "Y4"]);
    }

    #[test]
    fn ignores_out_of_location_and_staged_boxes() {
        let mut wh = warehouse(2);
        let slot = grid_slot(&wh, Coord::new(2, 1, 1));
        put_box(&mut wh, "OUT", slot, None, BoxState::OutLocation);
        let staging = staging_slot(&wh, Coord::new(9, 8, 0));
        put_box(&mut wh, "STAGED", staging, None, BoxState::OutLocation);

        let index = OccupancyIndex::new(&wh);
        let target = Coord::new(9, 9, 0);
        assert!(resolve_blocking(&index, &rack_a(), target, None).is_empty());
        assert!(resolve_blocking(&index, &rack_a(), Coord::new(2, 5, 1), None).is_empty());
    }

    #[test]
    fn other_rack_never_blocks() {
        let mut wh = warehouse(0);
        let rack_b = RackId::new("RACK-B");
        wh.add_rack(Rack::new(rack_b.clone(), "Rack B", (5, 5, 2)).unwrap())
            .unwrap();
        let slot = wh
            .add_slot(NewSlot::grid("B-2-1-1", &rack_b, Coord::new(2, 1, 1)))
            .unwrap();
        put_box(&mut wh, "IN-B", slot, Some(slot), BoxState::InLocation);

        let index = OccupancyIndex::new(&wh);
        assert!(resolve_blocking(&index, &rack_a(), Coord::new(2, 5, 1), None).is_empty());
        assert_eq!(resolve_blocking(&index, &rack_b, Coord::new(2, 3, 1), None).len(), 1);
    }

    #[test]
    fn excluded_box_is_skipped() {
        let mut wh = warehouse(0);
        let mover = stored_box(&mut wh, "MOVER", Coord::new(2, 0, 1));
        stored_box(&mut wh, "BLOCKER", Coord::new(2, 1, 1));

        let index = OccupancyIndex::new(&wh);
        let found = resolve_blocking(&index, &rack_a(), Coord::new(2, 4, 1), Some(&mover));
        assert_eq!(ids(&found), vec!["BLOCKER"]);
    }
}
