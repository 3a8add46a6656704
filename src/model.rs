//! Data models for the rack warehouse.
//!
//! This module defines the persisted entities of the coordinate space:
//! - `Rack`: a top-level container with a fixed grid extent
//! - `Slot`: an addressable point, either in a rack grid, in staging or at the intake
//! - `WarehouseBox`: a storage unit and its authoritative location state
//! - `BoxKey`: a naming prefix with its own id sequence
//! - `MovementRecord`: an append-only audit entry
//!
//! `WarehouseBox::state` together with `WarehouseBox::current_location` is the
//! only source of truth for occupancy. Slots never store a back-reference.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::{Result, WarehouseError};
use crate::types::{BoxId, Coord, Positioned, RackId, SlotId};

/// Maximum length of a box key prefix.
pub const MAX_KEY_LEN: usize = 10;

/// Zero padding of the sequence part of a minted box id.
pub const SEQUENCE_PADDING: usize = 6;

/// A top-level rack with its grid extent.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct Rack {
    pub id: RackId,
    pub name: String,
    /// Number of columns across the rack face (x)
    pub width: u32,
    /// Number of positions front to back (y)
    pub depth: u32,
    /// Number of levels (z)
    pub height: u32,
}

impl Rack {
    pub fn new(id: RackId, name: impl Into<String>, extent: (u32, u32, u32)) -> Result<Self> {
        let (width, depth, height) = extent;
        if width == 0 || depth == 0 || height == 0 {
            return Err(WarehouseError::validation(format!(
                "Rack {} must have a non-empty extent, got {}x{}x{}",
                id, width, depth, height
            )));
        }
        Ok(Self {
            id,
            name: name.into(),
            width,
            depth,
            height,
        })
    }

    /// Checks whether a coordinate lies inside this rack's grid.
    pub fn contains(&self, coord: &Coord) -> bool {
        coord.fits_within(self.width, self.depth, self.height)
    }

    /// Number of addressable positions in the grid.
    pub fn capacity(&self) -> u64 {
        u64::from(self.width) * u64::from(self.depth) * u64::from(self.height)
    }
}

/// An addressable point in the coordinate space.
///
/// # Fields
/// * `is_box` - the slot holds exactly one box (addressable unit)
/// * `is_rack` - the slot belongs to a rack grid
/// * `is_dummy` - the slot is temporary staging
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct Slot {
    pub id: SlotId,
    pub name: String,
    /// Parent rack; `None` for free-standing locations like the intake door
    pub rack: Option<RackId>,
    pub coord: Coord,
    #[serde(default)]
    pub is_box: bool,
    #[serde(default)]
    pub is_rack: bool,
    #[serde(default)]
    pub is_dummy: bool,
}

impl Slot {
    /// Addressable grid position inside a rack.
    pub fn is_grid(&self) -> bool {
        self.is_box && self.is_rack
    }

    /// Addressable staging position.
    pub fn is_staging(&self) -> bool {
        self.is_box && self.is_dummy
    }

    /// Validates the slot against its parent rack.
    ///
    /// A slot flagged `is_box` inside a rack must have coordinates within that
    /// rack's grid; a grid slot without a rack is rejected outright.
    pub fn validate(&self, parent: Option<&Rack>) -> Result<()> {
        if self.is_rack && self.is_dummy {
            return Err(WarehouseError::validation(format!(
                "Slot '{}' cannot be both rack grid and staging",
                self.name
            )));
        }
        match (self.is_box, self.is_rack, parent) {
            (true, true, None) => Err(WarehouseError::validation(format!(
                "Grid slot '{}' has no parent rack",
                self.name
            ))),
            (true, _, Some(rack)) if !rack.contains(&self.coord) => {
                Err(WarehouseError::validation(format!(
                    "Slot '{}' at {} lies outside rack {} ({}x{}x{})",
                    self.name, self.coord, rack.id, rack.width, rack.depth, rack.height
                )))
            }
            _ => Ok(()),
        }
    }
}

impl Positioned for Slot {
    fn coord(&self) -> Coord {
        self.coord
    }
}

/// Lifecycle state of a box.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BoxState {
    /// Stored at an addressable rack position
    InLocation,
    /// Delivered, staged or otherwise outside its rack position
    OutLocation,
}

/// A storage unit tracked by the warehouse.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct WarehouseBox {
    pub id: BoxId,
    /// Key prefix the id was minted from
    pub key: String,
    /// Where the box is right now; never unset
    pub current_location: SlotId,
    /// Assigned long-term position, if any
    pub home_location: Option<SlotId>,
    pub coord: Coord,
    pub state: BoxState,
}

impl WarehouseBox {
    pub fn is_in_location(&self) -> bool {
        self.state == BoxState::InLocation
    }
}

impl Positioned for WarehouseBox {
    fn coord(&self) -> Coord {
        self.coord
    }
}

/// Naming prefix for boxes; each key owns its own monotonic sequence.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct BoxKey {
    pub name: String,
    pub key: String,
    /// Next sequence number to hand out
    #[serde(default = "default_next_sequence")]
    pub next_sequence: u64,
}

fn default_next_sequence() -> u64 {
    1
}

impl BoxKey {
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let key = key.into();
        validate_key(&key)?;
        if name.trim().is_empty() {
            return Err(WarehouseError::validation("Box key name must not be empty"));
        }
        Ok(Self {
            name,
            key,
            next_sequence: default_next_sequence(),
        })
    }

    /// Mints the next box id: key + year + zero-padded sequence.
    ///
    /// # Examples
    /// ```
    /// use rackflow::model::BoxKey;
    ///
    /// let mut key = BoxKey::new("Quality", "QBE").unwrap();
    /// let now = chrono::Utc::now();
    /// let id = key.mint(now);
    /// assert!(id.as_str().ends_with("000001"));
    /// ```
    pub fn mint(&mut self, now: DateTime<Utc>) -> BoxId {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        BoxId::new(format!(
            "{}{:04}{:0width$}",
            self.key,
            now.year(),
            sequence,
            width = SEQUENCE_PADDING
        ))
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(WarehouseError::validation("Box key must not be empty"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(WarehouseError::validation(format!(
            "Box key '{}' exceeds {} characters",
            key, MAX_KEY_LEN
        )));
    }
    if !key.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(WarehouseError::validation(format!(
            "Box key '{}' must be ASCII alphanumeric",
            key
        )));
    }
    Ok(())
}

/// Immutable audit entry appended once per completed operation per box.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct MovementRecord {
    pub box_id: BoxId,
    /// Operation that caused the move, used to keep history exactly-once
    pub operation_id: String,
    pub source: SlotId,
    pub destination: SlotId,
    pub recorded_at: DateTime<Utc>,
}
