//! In-memory transactional warehouse store.
//!
//! Holds the rack, slot, box, key and movement tables. Every write that puts a
//! box in-location goes through an occupancy check, so the one-box-per-slot
//! invariant is enforced at write time instead of being assumed.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::error::{Result, WarehouseError};
use crate::model::{BoxKey, BoxState, MovementRecord, Rack, Slot, WarehouseBox};
use crate::types::{BoxId, Coord, RackId, SlotId};

/// Slot definition before the store assigns an id.
#[derive(Clone, Debug)]
pub struct NewSlot {
    pub name: String,
    pub rack: Option<RackId>,
    pub coord: Coord,
    pub is_box: bool,
    pub is_rack: bool,
    pub is_dummy: bool,
}

impl NewSlot {
    /// Addressable grid position inside `rack`.
    pub fn grid(name: impl Into<String>, rack: &RackId, coord: Coord) -> Self {
        Self {
            name: name.into(),
            rack: Some(rack.clone()),
            coord,
            is_box: true,
            is_rack: true,
            is_dummy: false,
        }
    }

    /// Addressable staging position.
    pub fn staging(name: impl Into<String>, rack: Option<&RackId>, coord: Coord) -> Self {
        Self {
            name: name.into(),
            rack: rack.cloned(),
            coord,
            is_box: true,
            is_rack: false,
            is_dummy: true,
        }
    }

    /// Free-standing addressable location such as the intake door.
    pub fn intake(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rack: None,
            coord: Coord::origin(),
            is_box: true,
            is_rack: false,
            is_dummy: false,
        }
    }
}

/// Box definition before an id is minted.
#[derive(Clone, Debug)]
pub struct NewBox {
    pub key: String,
    pub home: Option<SlotId>,
    /// Initial location; the intake slot when absent
    pub location: Option<SlotId>,
}

/// Location write applied to a single box.
#[derive(Clone, Debug)]
pub struct LocationUpdate {
    /// New current location; `None` keeps the current one and only updates coordinates
    pub location: Option<SlotId>,
    /// New home slot; `None` keeps the existing assignment
    pub home: Option<SlotId>,
    pub coord: Coord,
    pub state: BoxState,
}

/// The warehouse tables.
#[derive(Clone, Debug, Default)]
pub struct Warehouse {
    racks: BTreeMap<RackId, Rack>,
    slots: BTreeMap<SlotId, Slot>,
    slot_index: HashMap<(Option<RackId>, Coord), SlotId>,
    boxes: BTreeMap<BoxId, WarehouseBox>,
    // Derived from box state; rebuilt on every location write.
    occupants: HashMap<SlotId, BoxId>,
    keys: BTreeMap<String, BoxKey>,
    history: Vec<MovementRecord>,
    applied: BTreeSet<(String, BoxId)>,
    next_slot_id: u32,
}

impl Warehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` as one unit: on error every table is restored to its prior state.
    pub fn transaction<T>(&mut self, f: impl FnOnce(&mut Warehouse) -> Result<T>) -> Result<T> {
        let checkpoint = self.clone();
        match f(self) {
            Ok(value) => Ok(value),
            Err(err) => {
                *self = checkpoint;
                Err(err)
            }
        }
    }

    // ---------------------------------------------------------------------
    // Layout
    // ---------------------------------------------------------------------

    pub fn add_rack(&mut self, rack: Rack) -> Result<()> {
        if self.racks.contains_key(&rack.id) {
            return Err(WarehouseError::validation(format!(
                "Rack {} already exists",
                rack.id
            )));
        }
        self.racks.insert(rack.id.clone(), rack);
        Ok(())
    }

    pub fn add_slot(&mut self, new: NewSlot) -> Result<SlotId> {
        let id = SlotId(self.next_slot_id.max(1));
        self.insert_slot(Slot {
            id,
            name: new.name,
            rack: new.rack,
            coord: new.coord,
            is_box: new.is_box,
            is_rack: new.is_rack,
            is_dummy: new.is_dummy,
        })?;
        Ok(id)
    }

    /// Inserts a slot with a pre-assigned id (snapshot restore).
    pub fn insert_slot(&mut self, slot: Slot) -> Result<()> {
        if self.slots.contains_key(&slot.id) {
            return Err(WarehouseError::validation(format!(
                "Slot id {} already exists",
                slot.id
            )));
        }
        let parent = match &slot.rack {
            Some(rack_id) => Some(
                self.racks
                    .get(rack_id)
                    .ok_or_else(|| WarehouseError::RackNotFound(rack_id.clone()))?,
            ),
            None => None,
        };
        slot.validate(parent)?;

        if slot.is_box {
            let key = (slot.rack.clone(), slot.coord);
            if let Some(existing) = self.slot_index.get(&key) {
                return Err(WarehouseError::validation(format!(
                    "Slot '{}' duplicates {} at {}",
                    slot.name, existing, slot.coord
                )));
            }
            self.slot_index.insert(key, slot.id);
        }
        self.next_slot_id = self.next_slot_id.max(slot.id.0 + 1);
        self.slots.insert(slot.id, slot);
        Ok(())
    }

    pub fn register_key(&mut self, key: BoxKey) -> Result<()> {
        if self.keys.contains_key(&key.key) {
            return Err(WarehouseError::validation(format!(
                "Box key '{}' already exists",
                key.key
            )));
        }
        self.keys.insert(key.key.clone(), key);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Boxes
    // ---------------------------------------------------------------------

    /// Creates a box and mints its id from the key's sequence.
    ///
    /// Without an explicit location the box starts at the intake slot named
    /// `intake_name`; the sequence is only consumed once every check passed.
    pub fn create_box(
        &mut self,
        new: NewBox,
        intake_name: &str,
        now: DateTime<Utc>,
    ) -> Result<BoxId> {
        if !self.keys.contains_key(&new.key) {
            return Err(WarehouseError::KeyNotFound(new.key));
        }
        if let Some(home) = new.home {
            let slot = self.slot(home).ok_or(WarehouseError::SlotNotFound(home))?;
            if !slot.is_grid() {
                return Err(WarehouseError::validation(format!(
                    "Home slot '{}' is not a rack position",
                    slot.name
                )));
            }
            self.check_home_free(home, None)?;
        }
        let location = match new.location {
            Some(id) => self.slot(id).ok_or(WarehouseError::SlotNotFound(id))?,
            None => self
                .intake_slot(intake_name)
                .ok_or_else(|| WarehouseError::IntakeMissing(intake_name.to_string()))?,
        };
        let (location_id, coord) = (location.id, location.coord);
        let state = if location.is_grid() {
            self.check_vacant(location_id, None)?;
            BoxState::InLocation
        } else {
            BoxState::OutLocation
        };

        let id = match self.keys.get_mut(&new.key) {
            Some(key) => key.mint(now),
            None => return Err(WarehouseError::KeyNotFound(new.key)),
        };
        if self.boxes.contains_key(&id) {
            return Err(WarehouseError::validation(format!(
                "Box id {} already exists",
                id
            )));
        }

        self.boxes.insert(
            id.clone(),
            WarehouseBox {
                id: id.clone(),
                key: new.key,
                current_location: location_id,
                home_location: new.home,
                coord,
                state,
            },
        );
        if state == BoxState::InLocation {
            self.occupants.insert(location_id, id.clone());
        }
        Ok(id)
    }

    /// Inserts a fully specified box (snapshot restore).
    pub fn restore_box(&mut self, record: WarehouseBox) -> Result<()> {
        if self.boxes.contains_key(&record.id) {
            return Err(WarehouseError::validation(format!(
                "Box id {} already exists",
                record.id
            )));
        }
        let location = self
            .slot(record.current_location)
            .ok_or(WarehouseError::SlotNotFound(record.current_location))?;
        if let Some(home) = record.home_location {
            self.slot(home).ok_or(WarehouseError::SlotNotFound(home))?;
            self.check_home_free(home, Some(&record.id))?;
        }
        if record.is_in_location() && location.is_grid() {
            self.check_vacant(location.id, Some(&record.id))?;
            self.occupants
                .insert(record.current_location, record.id.clone());
        }
        self.boxes.insert(record.id.clone(), record);
        Ok(())
    }

    /// Writes a new location for a box, rejecting duplicate occupancy.
    pub fn apply_location(&mut self, box_id: &BoxId, update: LocationUpdate) -> Result<()> {
        let current = self
            .boxes
            .get(box_id)
            .ok_or_else(|| WarehouseError::BoxNotFound(box_id.clone()))?;
        let previous = current.current_location;
        let location = update.location.unwrap_or(previous);
        let slot = self
            .slots
            .get(&location)
            .ok_or(WarehouseError::SlotNotFound(location))?;
        if let Some(home) = update.home {
            self.slot(home).ok_or(WarehouseError::SlotNotFound(home))?;
            self.check_home_free(home, Some(box_id))?;
        }
        let occupies = update.state == BoxState::InLocation && slot.is_grid();
        if occupies {
            self.check_vacant(location, Some(box_id))?;
        }

        if self.occupants.get(&previous) == Some(box_id) {
            self.occupants.remove(&previous);
        }
        if let Some(record) = self.boxes.get_mut(box_id) {
            record.current_location = location;
            record.coord = update.coord;
            record.state = update.state;
            if update.home.is_some() {
                record.home_location = update.home;
            }
        }
        if occupies {
            self.occupants.insert(location, box_id.clone());
        }
        Ok(())
    }

    fn check_home_free(&self, slot_id: SlotId, claimant: Option<&BoxId>) -> Result<()> {
        match self.home_claimant(slot_id) {
            Some(owner) if Some(&owner.id) != claimant => {
                let name = self.slots.get(&slot_id).map(|s| s.name.as_str()).unwrap_or("?");
                Err(WarehouseError::validation(format!(
                    "Slot '{}' is already the home of box {}",
                    name, owner.id
                )))
            }
            _ => Ok(()),
        }
    }

    fn check_vacant(&self, slot_id: SlotId, claimant: Option<&BoxId>) -> Result<()> {
        match self.occupant(slot_id) {
            Some(occupant) if Some(&occupant.id) != claimant => {
                let coord = self.slots.get(&slot_id).map(|s| s.coord).unwrap_or_default();
                Err(WarehouseError::DuplicateOccupancy {
                    slot: slot_id,
                    coord,
                    occupant: occupant.id.clone(),
                })
            }
            _ => Ok(()),
        }
    }

    // ---------------------------------------------------------------------
    // History
    // ---------------------------------------------------------------------

    /// Appends an audit entry; both ends and the box must exist.
    pub fn append_history(&mut self, record: MovementRecord) -> Result<()> {
        if !self.boxes.contains_key(&record.box_id) {
            return Err(WarehouseError::Persistence(format!(
                "history references unknown box {}",
                record.box_id
            )));
        }
        for slot in [record.source, record.destination] {
            if !self.slots.contains_key(&slot) {
                return Err(WarehouseError::Persistence(format!(
                    "history references unknown {}",
                    slot
                )));
            }
        }
        self.history.push(record);
        Ok(())
    }

    /// Replaces the audit trail (snapshot restore); every entry is re-checked.
    pub fn restore_history(&mut self, records: Vec<MovementRecord>) -> Result<()> {
        self.history.clear();
        for record in records {
            self.append_history(record)?;
        }
        Ok(())
    }

    pub fn mark_applied(&mut self, operation_id: &str, box_id: &BoxId) {
        self.applied
            .insert((operation_id.to_string(), box_id.clone()));
    }

    pub fn is_applied(&self, operation_id: &str, box_id: &BoxId) -> bool {
        self.applied
            .contains(&(operation_id.to_string(), box_id.clone()))
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    pub fn rack(&self, id: &RackId) -> Option<&Rack> {
        self.racks.get(id)
    }

    pub fn racks(&self) -> impl Iterator<Item = &Rack> {
        self.racks.values()
    }

    pub fn slot(&self, id: SlotId) -> Option<&Slot> {
        self.slots.get(&id)
    }

    /// Slots in id (creation) order.
    pub fn slots(&self) -> impl Iterator<Item = &Slot> {
        self.slots.values()
    }

    /// Addressable slot at an exact key.
    pub fn slot_by_coord(&self, rack: Option<&RackId>, coord: Coord) -> Option<&Slot> {
        self.slot_index
            .get(&(rack.cloned(), coord))
            .and_then(|id| self.slots.get(id))
    }

    pub fn get_box(&self, id: &BoxId) -> Option<&WarehouseBox> {
        self.boxes.get(id)
    }

    /// Boxes in id order.
    pub fn boxes(&self) -> impl Iterator<Item = &WarehouseBox> {
        self.boxes.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &BoxKey> {
        self.keys.values()
    }

    /// The box in-location at `slot_id`, verified against the authoritative box state.
    pub fn occupant(&self, slot_id: SlotId) -> Option<&WarehouseBox> {
        self.occupants
            .get(&slot_id)
            .and_then(|id| self.boxes.get(id))
            .filter(|b| b.is_in_location() && b.current_location == slot_id)
    }

    /// Box whose home is `slot_id`, if any.
    pub fn home_claimant(&self, slot_id: SlotId) -> Option<&WarehouseBox> {
        self.boxes
            .values()
            .find(|b| b.home_location == Some(slot_id))
    }

    /// Addressable slot called `name`, used as the intake/exit door.
    pub fn intake_slot(&self, name: &str) -> Option<&Slot> {
        self.slots.values().find(|s| s.is_box && s.name == name)
    }

    pub fn history(&self) -> &[MovementRecord] {
        &self.history
    }

    pub fn history_for<'a>(&'a self, box_id: &'a BoxId) -> impl Iterator<Item = &'a MovementRecord> {
        self.history.iter().filter(move |r| &r.box_id == box_id)
    }

    pub fn applied(&self) -> impl Iterator<Item = &(String, BoxId)> {
        self.applied.iter()
    }
}
