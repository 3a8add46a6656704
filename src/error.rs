//! Error taxonomy for planning and reconciliation.
//!
//! Validation and invariant errors abort the call that raised them. Audit
//! failures during reconciliation never surface here; they are logged and
//! swallowed by the reconciler.

use thiserror::Error;

use crate::types::{BoxId, Coord, RackId, SlotId};

/// Main error type of the warehouse core.
#[derive(Error, Debug)]
pub enum WarehouseError {
    /// Requested box identifier has no matching record
    #[error("Box not found: {0}")]
    BoxNotFound(BoxId),

    #[error("Slot not found: {0}")]
    SlotNotFound(SlotId),

    #[error("Rack not found: {0}")]
    RackNotFound(RackId),

    #[error("Box key not found: {0}")]
    KeyNotFound(String),

    /// Neither an occupant nor a home claim at a rack position
    #[error("No box at {coord} in rack {rack}")]
    NoBoxAt { rack: RackId, coord: Coord },

    /// A plan needs staging capacity that does not exist
    #[error("No staging slot available: {needed} required, {available} free")]
    NoStagingAvailable { needed: usize, available: usize },

    /// Write-time violation of the one-box-per-slot invariant
    #[error("Slot {slot} at {coord} is already occupied by box {occupant}")]
    DuplicateOccupancy {
        slot: SlotId,
        coord: Coord,
        occupant: BoxId,
    },

    /// Inbound completion payload is missing required fields
    #[error("Malformed completion notification: missing {}", .missing.join(", "))]
    MalformedNotification { missing: Vec<&'static str> },

    #[error("Validation error: {0}")]
    Validation(String),

    /// No intake/door slot is configured
    #[error("Intake location '{0}' not found")]
    IntakeMissing(String),

    /// Another plan for the same box has not finished dispatching
    #[error("An operation for box {0} is already in flight")]
    OperationInFlight(BoxId),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for warehouse operations
pub type Result<T> = std::result::Result<T, WarehouseError>;

impl WarehouseError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Stable machine-readable code, used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            WarehouseError::BoxNotFound(_) => "box_not_found",
            WarehouseError::SlotNotFound(_) => "slot_not_found",
            WarehouseError::RackNotFound(_) => "rack_not_found",
            WarehouseError::KeyNotFound(_) => "key_not_found",
            WarehouseError::NoBoxAt { .. } => "no_box_at",
            WarehouseError::NoStagingAvailable { .. } => "no_staging_available",
            WarehouseError::DuplicateOccupancy { .. } => "duplicate_occupancy",
            WarehouseError::MalformedNotification { .. } => "malformed_notification",
            WarehouseError::Validation(_) => "validation",
            WarehouseError::IntakeMissing(_) => "intake_missing",
            WarehouseError::OperationInFlight(_) => "operation_in_flight",
            WarehouseError::Persistence(_) | WarehouseError::Io(_) | WarehouseError::Json(_) => {
                "persistence"
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_notification_lists_missing_fields() {
        let err = WarehouseError::MalformedNotification {
            missing: vec!["box_id", "status"],
        };
        assert_eq!(
            err.to_string(),
            "Malformed completion notification: missing box_id, status"
        );
        assert_eq!(err.code(), "malformed_notification");
    }

    #[test]
    fn duplicate_occupancy_names_occupant() {
        let err = WarehouseError::DuplicateOccupancy {
            slot: SlotId(4),
            coord: Coord::new(3, 1, 1),
            occupant: BoxId::new("QBE1004004001"),
        };
        assert!(err.to_string().contains("QBE1004004001"));
        assert!(err.to_string().contains("(3,1,1)"));
    }
}
