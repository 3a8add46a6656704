//! Read-only occupancy projection over the warehouse tables.
//!
//! Answers "what occupies slot (x,y,z)?" and "which boxes are staged?"
//! without mutating anything. All orderings are deterministic.

use serde::Serialize;
use utoipa::ToSchema;

use crate::geometry::deepest_first;
use crate::model::{Slot, WarehouseBox};
use crate::store::Warehouse;
use crate::types::{Coord, RackId, SlotId};

/// How a coordinate lookup found its box.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LookupMatch {
    /// The box is in-location at the slot
    Occupant,
    /// The slot is the box's home; the box is elsewhere
    Home,
}

/// Query view over a borrowed warehouse.
#[derive(Clone, Copy)]
pub struct OccupancyIndex<'a> {
    warehouse: &'a Warehouse,
}

impl<'a> OccupancyIndex<'a> {
    pub fn new(warehouse: &'a Warehouse) -> Self {
        Self { warehouse }
    }

    /// Addressable slot at `(rack, x, y, z)`.
    pub fn slot_at(&self, rack: &RackId, coord: Coord) -> Option<&'a Slot> {
        self.warehouse
            .slot_by_coord(Some(rack), coord)
            .filter(|slot| slot.is_box)
    }

    /// The box currently in-location at `(rack, x, y, z)`.
    pub fn box_at(&self, rack: &RackId, coord: Coord) -> Option<&'a WarehouseBox> {
        self.slot_at(rack, coord)
            .and_then(|slot| self.warehouse.occupant(slot.id))
    }

    /// Box at `(rack, x, y, z)`, else the box whose home that slot is.
    pub fn lookup(
        &self,
        rack: &RackId,
        coord: Coord,
    ) -> Option<(&'a Slot, &'a WarehouseBox, LookupMatch)> {
        let slot = self.slot_at(rack, coord)?;
        self.box_at(rack, coord)
            .map(|b| (slot, b, LookupMatch::Occupant))
            .or_else(|| {
                self.warehouse
                    .home_claimant(slot.id)
                    .map(|b| (slot, b, LookupMatch::Home))
            })
    }

    /// Boxes out-of-location somewhere other than staging, by id.
    pub fn boxes_outside(&self) -> Vec<&'a WarehouseBox> {
        self.warehouse
            .boxes()
            .filter(|b| !b.is_in_location())
            .filter(|b| !self.location_of(b).is_some_and(Slot::is_staging))
            .collect()
    }

    /// An addressable grid slot of `rack` that is neither occupied nor anyone's home.
    pub fn free_slot(&self, rack: &RackId) -> Option<&'a Slot> {
        self.warehouse.slots().find(|slot| {
            slot.is_grid()
                && slot.rack.as_ref() == Some(rack)
                && !self.is_claimed(slot.id)
        })
    }

    /// Rack grid slot at `coord`, looking in `preferred` first and then in every rack.
    pub fn find_grid_slot(&self, coord: Coord, preferred: Option<&RackId>) -> Option<&'a Slot> {
        preferred
            .and_then(|rack| self.slot_at(rack, coord))
            .filter(|slot| slot.is_grid())
            .or_else(|| {
                self.warehouse
                    .slots()
                    .find(|slot| slot.is_grid() && slot.coord == coord)
            })
    }

    /// Staging slot at `coord` in any staging area.
    pub fn find_staging_slot(&self, coord: Coord) -> Option<&'a Slot> {
        self.warehouse
            .slots()
            .find(|slot| slot.is_staging() && slot.coord == coord)
    }

    pub fn has_staging(&self) -> bool {
        self.warehouse.slots().any(Slot::is_staging)
    }

    /// Staging slots with no box in them, in slot order.
    pub fn free_staging_slots(&self) -> Vec<&'a Slot> {
        self.warehouse
            .slots()
            .filter(|slot| slot.is_staging() && !self.is_present(slot.id))
            .collect()
    }

    /// Boxes sitting out-of-location in staging, deepest first.
    ///
    /// `staging_rack` narrows the result to one staging area.
    pub fn boxes_in_staging(&self, staging_rack: Option<&RackId>) -> Vec<&'a WarehouseBox> {
        let mut staged: Vec<&WarehouseBox> = self
            .warehouse
            .boxes()
            .filter(|b| !b.is_in_location())
            .filter(|b| {
                self.location_of(b).is_some_and(|slot| {
                    slot.is_staging()
                        && staging_rack.is_none_or(|rack| slot.rack.as_ref() == Some(rack))
                })
            })
            .collect();
        staged.sort_by(|a, b| deepest_first((*a, &a.id), (*b, &b.id)));
        staged
    }

    pub fn boxes(&self) -> impl Iterator<Item = &'a WarehouseBox> + use<'a> {
        self.warehouse.boxes()
    }

    /// Slot the box currently sits in.
    pub fn location_of(&self, record: &WarehouseBox) -> Option<&'a Slot> {
        self.warehouse.slot(record.current_location)
    }

    /// Rack whose grid the box currently occupies; `None` outside the grid.
    pub fn grid_rack_of(&self, record: &WarehouseBox) -> Option<&'a RackId> {
        self.location_of(record)
            .filter(|slot| slot.is_grid())
            .and_then(|slot| slot.rack.as_ref())
    }

    /// Box physically at the slot, whatever its state.
    pub fn present_at(&self, slot_id: SlotId) -> Option<&'a WarehouseBox> {
        self.warehouse
            .boxes()
            .find(|b| b.current_location == slot_id)
    }

    fn is_present(&self, slot_id: SlotId) -> bool {
        self.present_at(slot_id).is_some()
    }

    fn is_claimed(&self, slot_id: SlotId) -> bool {
        self.warehouse.occupant(slot_id).is_some()
            || self.warehouse.home_claimant(slot_id).is_some()
    }
}
