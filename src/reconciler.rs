//! State reconciliation for completion notifications.
//!
//! The middleware reports each finished move per box. A `completed` report
//! commits the new location, a `failed` report changes nothing. Replaying a
//! report converges to the same final state and does not append history twice.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;

use crate::error::{Result, WarehouseError};
use crate::model::{BoxState, MovementRecord, WarehouseBox};
use crate::occupancy::OccupancyIndex;
use crate::store::{LocationUpdate, Warehouse};
use crate::types::{BoxId, Coord, SlotId};

/// Reported coordinates; every axis is optional on the wire.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, ToSchema)]
pub struct ReportedLocation {
    pub x: Option<i32>,
    pub y: Option<i32>,
    pub z: Option<i32>,
}

impl ReportedLocation {
    fn coord(&self) -> Option<Coord> {
        Some(Coord::new(self.x?, self.y?, self.z?))
    }
}

impl From<Coord> for ReportedLocation {
    fn from(coord: Coord) -> Self {
        Self {
            x: Some(coord.x),
            y: Some(coord.y),
            z: Some(coord.z),
        }
    }
}

/// Completion payload as received from the middleware.
#[derive(Clone, Debug, Default, Deserialize, Serialize, ToSchema)]
pub struct CompletionNotification {
    pub operation_id: Option<String>,
    pub operation_type: Option<String>,
    pub box_id: Option<String>,
    pub status: Option<String>,
    pub new_location: Option<ReportedLocation>,
}

/// Class of operation a completion refers to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CompletionKind {
    /// `put_in`, `place`
    Store,
    /// `picking`, `deliver`
    Retrieve,
    /// `move_to_dummy`
    Stage,
    /// Anything else; reconciled as a no-op
    Other(String),
}

impl CompletionKind {
    fn parse(raw: &str) -> Self {
        match raw {
            "put_in" | "place" => CompletionKind::Store,
            "picking" | "deliver" => CompletionKind::Retrieve,
            "move_to_dummy" => CompletionKind::Stage,
            other => CompletionKind::Other(other.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompletionStatus {
    Completed,
    /// Any non-completed status, kept verbatim for the report
    Failed(String),
}

/// A completion notification with all required fields present.
#[derive(Clone, Debug)]
pub struct ValidatedNotification {
    pub operation_id: String,
    pub kind: CompletionKind,
    pub box_id: BoxId,
    pub status: CompletionStatus,
    pub new_location: Option<Coord>,
}

fn required(value: Option<String>, name: &'static str, missing: &mut Vec<&'static str>) -> String {
    match value {
        Some(value) if !value.trim().is_empty() => value,
        _ => {
            missing.push(name);
            String::new()
        }
    }
}

impl CompletionNotification {
    /// Checks that `operation_id`, `operation_type`, `box_id` and `status` are present and non-empty.
    pub fn validate(self) -> Result<ValidatedNotification> {
        let mut missing = Vec::new();
        let operation_id = required(self.operation_id, "operation_id", &mut missing);
        let operation_type = required(self.operation_type, "operation_type", &mut missing);
        let box_id = required(self.box_id, "box_id", &mut missing);
        let status = required(self.status, "status", &mut missing);
        if !missing.is_empty() {
            return Err(WarehouseError::MalformedNotification { missing });
        }

        Ok(ValidatedNotification {
            operation_id,
            kind: CompletionKind::parse(&operation_type),
            box_id: BoxId::new(box_id),
            status: if status == "completed" {
                CompletionStatus::Completed
            } else {
                CompletionStatus::Failed(status)
            },
            new_location: self.new_location.and_then(|loc| loc.coord()),
        })
    }
}

/// Non-fatal condition found while reconciling; logged for operator review.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum ReconcileWarning {
    /// Reported coordinates do not resolve to a known slot
    InconsistentLocation { coord: Coord },
    /// No staging slot could take the box; its location is unchanged
    NoStagingSlot,
    /// The reported staging slot already holds another box; a free one was used
    StagingSlotTaken { coord: Coord, occupant: BoxId },
    /// The intake slot is missing; the box was not moved
    IntakeMissing { name: String },
    /// Location was updated but the audit entry could not be written
    HistoryNotRecorded { reason: String },
}

/// Box state after a reconciliation.
#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct BoxSnapshot {
    pub box_id: BoxId,
    pub location: SlotId,
    pub location_name: String,
    pub coord: Coord,
    pub state: BoxState,
}

/// What a reconciliation did.
#[derive(Clone, Debug, Serialize, ToSchema)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Applied {
        operation_id: String,
        kind: CompletionKind,
        box_state: BoxSnapshot,
        history_recorded: bool,
        warnings: Vec<ReconcileWarning>,
    },
    /// The middleware reported a failure; nothing was changed
    Failed {
        operation_id: String,
        box_id: BoxId,
        status: String,
    },
    /// Completed with an unknown operation type; nothing was changed
    Ignored {
        operation_id: String,
        operation_type: String,
    },
}

/// Applies completion notifications to the warehouse.
#[derive(Clone, Debug)]
pub struct Reconciler {
    intake_name: String,
}

impl Reconciler {
    pub fn new(intake_name: impl Into<String>) -> Self {
        Self {
            intake_name: intake_name.into(),
        }
    }

    /// Validates and applies a raw notification.
    ///
    /// Malformed payloads and unknown boxes fail before anything is touched.
    pub fn reconcile(
        &self,
        warehouse: &mut Warehouse,
        notification: CompletionNotification,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome> {
        let notification = notification.validate()?;
        self.apply(warehouse, notification, now)
    }

    pub fn apply(
        &self,
        warehouse: &mut Warehouse,
        notification: ValidatedNotification,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome> {
        let ValidatedNotification {
            operation_id,
            kind,
            box_id,
            status,
            new_location,
        } = notification;

        let record = warehouse
            .get_box(&box_id)
            .ok_or_else(|| WarehouseError::BoxNotFound(box_id.clone()))?;
        let source = record.current_location;

        if let CompletionStatus::Failed(status) = status {
            error!("Operation {} failed for box {}: {}", operation_id, box_id, status);
            return Ok(ReconcileOutcome::Failed {
                operation_id,
                box_id,
                status,
            });
        }

        let mut warnings = Vec::new();
        let update = match &kind {
            CompletionKind::Store => {
                let coord = require_location(new_location)?;
                Some(self.store_update(warehouse, record, coord, &mut warnings))
            }
            CompletionKind::Retrieve => self.retrieve_update(warehouse, &mut warnings),
            CompletionKind::Stage => self.stage_update(warehouse, record, new_location, &mut warnings),
            CompletionKind::Other(operation_type) => {
                debug!(
                    "Ignoring completed operation {} of unknown type '{}'",
                    operation_id, operation_type
                );
                return Ok(ReconcileOutcome::Ignored {
                    operation_id,
                    operation_type: operation_type.clone(),
                });
            }
        };

        if let Some(update) = update {
            warehouse.apply_location(&box_id, update)?;
        }

        let history_recorded = record_history(warehouse, &operation_id, &box_id, source, now)
            .unwrap_or_else(|err| {
                warn!("Could not record history for box {}: {}", box_id, err);
                warnings.push(ReconcileWarning::HistoryNotRecorded {
                    reason: err.to_string(),
                });
                false
            });

        let box_state = snapshot(warehouse, &box_id)?;
        info!(
            "Reconciled {} ({:?}): box {} at {} {}",
            operation_id, kind, box_id, box_state.location_name, box_state.coord
        );
        Ok(ReconcileOutcome::Applied {
            operation_id,
            kind,
            box_state,
            history_recorded,
            warnings,
        })
    }

    /// Store-class: into the rack slot at the reported coordinates.
    fn store_update(
        &self,
        warehouse: &Warehouse,
        record: &WarehouseBox,
        coord: Coord,
        warnings: &mut Vec<ReconcileWarning>,
    ) -> LocationUpdate {
        let index = OccupancyIndex::new(warehouse);
        let preferred = record
            .home_location
            .and_then(|home| warehouse.slot(home))
            .and_then(|home| home.rack.as_ref());

        match index.find_grid_slot(coord, preferred) {
            Some(slot) => LocationUpdate {
                location: Some(slot.id),
                // another box's home stays with that box
                home: match warehouse.home_claimant(slot.id) {
                    Some(owner) if owner.id != record.id => None,
                    _ => Some(slot.id),
                },
                coord,
                state: BoxState::InLocation,
            },
            None => {
                warn!(
                    "No rack slot at {} for box {}; updating coordinates only",
                    coord, record.id
                );
                warnings.push(ReconcileWarning::InconsistentLocation { coord });
                LocationUpdate {
                    location: None,
                    home: None,
                    coord,
                    state: BoxState::InLocation,
                }
            }
        }
    }

    /// Retrieve-class: out to the intake slot at the origin.
    fn retrieve_update(
        &self,
        warehouse: &Warehouse,
        warnings: &mut Vec<ReconcileWarning>,
    ) -> Option<LocationUpdate> {
        match warehouse.intake_slot(&self.intake_name) {
            Some(intake) => Some(LocationUpdate {
                location: Some(intake.id),
                home: None,
                coord: Coord::origin(),
                state: BoxState::OutLocation,
            }),
            None => {
                error!("Intake location '{}' not found", self.intake_name);
                warnings.push(ReconcileWarning::IntakeMissing {
                    name: self.intake_name.clone(),
                });
                None
            }
        }
    }

    /// Relocate-to-staging: exact staging slot, else any free one, else unchanged.
    fn stage_update(
        &self,
        warehouse: &Warehouse,
        record: &WarehouseBox,
        reported: Option<Coord>,
        warnings: &mut Vec<ReconcileWarning>,
    ) -> Option<LocationUpdate> {
        let index = OccupancyIndex::new(warehouse);
        let exact = reported
            .and_then(|coord| index.find_staging_slot(coord))
            .filter(|slot| match index.present_at(slot.id) {
                Some(other) if other.id != record.id => {
                    warn!(
                        "Staging slot {} already holds box {}; picking a free one for {}",
                        slot.coord, other.id, record.id
                    );
                    warnings.push(ReconcileWarning::StagingSlotTaken {
                        coord: slot.coord,
                        occupant: other.id.clone(),
                    });
                    false
                }
                _ => true,
            });
        let slot = exact.or_else(|| index.free_staging_slots().into_iter().next());

        match slot {
            Some(slot) => Some(LocationUpdate {
                location: Some(slot.id),
                home: None,
                coord: slot.coord,
                state: BoxState::OutLocation,
            }),
            None => {
                error!(
                    "No staging slot available for box {}; location left unchanged",
                    record.id
                );
                warnings.push(ReconcileWarning::NoStagingSlot);
                None
            }
        }
    }
}

fn require_location(location: Option<Coord>) -> Result<Coord> {
    location.ok_or(WarehouseError::MalformedNotification {
        missing: vec!["new_location"],
    })
}

/// Appends the audit entry once per (operation, box). Returns whether a new entry was written.
fn record_history(
    warehouse: &mut Warehouse,
    operation_id: &str,
    box_id: &BoxId,
    source: SlotId,
    now: DateTime<Utc>,
) -> Result<bool> {
    if warehouse.is_applied(operation_id, box_id) {
        debug!("History for {} / {} already recorded", operation_id, box_id);
        return Ok(false);
    }
    let destination = warehouse
        .get_box(box_id)
        .map(|b| b.current_location)
        .ok_or_else(|| WarehouseError::BoxNotFound(box_id.clone()))?;
    warehouse.append_history(MovementRecord {
        box_id: box_id.clone(),
        operation_id: operation_id.to_string(),
        source,
        destination,
        recorded_at: now,
    })?;
    warehouse.mark_applied(operation_id, box_id);
    Ok(true)
}

fn snapshot(warehouse: &Warehouse, box_id: &BoxId) -> Result<BoxSnapshot> {
    let record = warehouse
        .get_box(box_id)
        .ok_or_else(|| WarehouseError::BoxNotFound(box_id.clone()))?;
    let location_name = warehouse
        .slot(record.current_location)
        .map(|slot| slot.name.clone())
        .unwrap_or_default();
    Ok(BoxSnapshot {
        box_id: record.id.clone(),
        location: record.current_location,
        location_name,
        coord: record.coord,
        state: record.state,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{Planner, StepAction};
    use crate::store::fixtures::*;

    fn completed(op: &str, kind: &str, box_id: &str, at: Option<Coord>) -> CompletionNotification {
        CompletionNotification {
            operation_id: Some(op.to_string()),
            operation_type: Some(kind.to_string()),
            box_id: Some(box_id.to_string()),
            status: Some("completed".to_string()),
            new_location: at.map(ReportedLocation::from),
        }
    }

    fn reconciler() -> Reconciler {
        Reconciler::new(INTAKE)
    }

    fn assert_unique_occupancy(wh: &Warehouse) {
        let mut seen = std::collections::HashSet::new();
        for b in wh.boxes().filter(|b| b.is_in_location()) {
            let slot = wh.slot(b.current_location).unwrap();
            assert!(
                seen.insert((slot.rack.clone(), b.coord)),
                "two boxes in-location at {:?} {}",
                slot.rack,
                b.coord
            );
        }
    }

    #[test]
    fn retrieve_end_to_end() {
        let mut wh = warehouse(1);
        let target_slot = grid_slot(&wh, Coord::new(3, 1, 1));
        stored_box(&mut wh, "QBE1004004002", Coord::new(3, 1, 1));
        stored_box(&mut wh, "QBE1004004001", Coord::new(3, 0, 1));

        let plan = Planner::default()
            .plan_retrieve(&wh, &BoxId::new("QBE1004004002"), Utc::now())
            .unwrap();
        assert_eq!(plan.sequence[0].action, StepAction::MoveToDummy);
        assert_eq!(plan.sequence[1].action, StepAction::Deliver);

        let r = reconciler();
        let op = plan.operation_id.as_str();
        r.reconcile(
            &mut wh,
            completed(op, "move_to_dummy", "QBE1004004001", Some(Coord::new(9, 9, 0))),
            Utc::now(),
        )
        .unwrap();
        r.reconcile(
            &mut wh,
            completed(op, "deliver", "QBE1004004002", Some(Coord::origin())),
            Utc::now(),
        )
        .unwrap();

        let index = OccupancyIndex::new(&wh);
        assert!(index.box_at(&rack_a(), Coord::new(3, 1, 1)).is_none());
        assert!(wh.occupant(target_slot).is_none());

        let staged = wh.get_box(&BoxId::new("QBE1004004001")).unwrap();
        assert_eq!(staged.current_location, staging_slot(&wh, Coord::new(9, 9, 0)));
        assert_eq!(staged.coord, Coord::new(9, 9, 0));
        assert_eq!(index.boxes_in_staging(None)[0].id, staged.id);

        let delivered = wh.get_box(&BoxId::new("QBE1004004002")).unwrap();
        assert_eq!(delivered.state, BoxState::OutLocation);
        assert_eq!(delivered.coord, Coord::origin());
        assert_eq!(wh.slot(delivered.current_location).unwrap().name, INTAKE);
        assert_eq!(wh.history().len(), 2);
    }

    #[test]
    fn replayed_retrieve_converges_without_double_history() {
        let mut wh = warehouse(1);
        stored_box(&mut wh, "QBE1004004002", Coord::new(3, 1, 1));
        let r = reconciler();
        let note = completed("PICKING-1", "picking", "QBE1004004002", None);

        r.reconcile(&mut wh, note.clone(), Utc::now()).unwrap();
        let outcome = r.reconcile(&mut wh, note, Utc::now()).unwrap();

        let b = wh.get_box(&BoxId::new("QBE1004004002")).unwrap();
        assert_eq!(b.coord, Coord::origin());
        assert_eq!(b.state, BoxState::OutLocation);
        assert_eq!(wh.history().len(), 1);
        assert!(matches!(
            outcome,
            ReconcileOutcome::Applied {
                history_recorded: false,
                ..
            }
        ));
    }

    #[test]
    fn store_completion_sets_location_and_home() {
        let mut wh = warehouse(1);
        let intake = wh.intake_slot(INTAKE).unwrap().id;
        let id = put_box(&mut wh, "QBE1", intake, None, BoxState::OutLocation);

        let outcome = reconciler()
            .reconcile(
                &mut wh,
                completed("PUT_IN-1", "put_in", "QBE1", Some(Coord::new(3, 1, 1))),
                Utc::now(),
            )
            .unwrap();

        let slot = grid_slot(&wh, Coord::new(3, 1, 1));
        let b = wh.get_box(&id).unwrap();
        assert_eq!(b.current_location, slot);
        assert_eq!(b.home_location, Some(slot));
        assert_eq!(b.state, BoxState::InLocation);
        assert!(matches!(outcome, ReconcileOutcome::Applied { ref warnings, .. } if warnings.is_empty()));
        assert_unique_occupancy(&wh);
    }

    #[test]
    fn store_completion_into_occupied_slot_is_rejected() {
        let mut wh = warehouse(1);
        stored_box(&mut wh, "SITTER", Coord::new(3, 1, 1));
        let intake = wh.intake_slot(INTAKE).unwrap().id;
        put_box(&mut wh, "QBE1", intake, None, BoxState::OutLocation);

        let err = reconciler()
            .reconcile(
                &mut wh,
                completed("PUT_IN-1", "place", "QBE1", Some(Coord::new(3, 1, 1))),
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, WarehouseError::DuplicateOccupancy { .. }));
        assert_eq!(
            wh.get_box(&BoxId::new("QBE1")).unwrap().current_location,
            intake
        );
        assert!(wh.history().is_empty());
        assert_unique_occupancy(&wh);
    }

    #[test]
    fn store_completion_at_unknown_coordinates_warns() {
        let mut wh = warehouse(1);
        let intake = wh.intake_slot(INTAKE).unwrap().id;
        put_box(&mut wh, "QBE1", intake, None, BoxState::OutLocation);

        let outcome = reconciler()
            .reconcile(
                &mut wh,
                completed("PUT_IN-1", "put_in", "QBE1", Some(Coord::new(42, 1, 1))),
                Utc::now(),
            )
            .unwrap();

        let b = wh.get_box(&BoxId::new("QBE1")).unwrap();
        assert_eq!(b.current_location, intake);
        assert_eq!(b.coord, Coord::new(42, 1, 1));
        match outcome {
            ReconcileOutcome::Applied { warnings, .. } => assert_eq!(
                warnings,
                vec![ReconcileWarning::InconsistentLocation {
                    coord: Coord::new(42, 1, 1)
                }]
            ),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn unresolved_store_completions_leave_intake_shared() {
        let mut wh = warehouse(1);
        let intake = wh.intake_slot(INTAKE).unwrap().id;
        put_box(&mut wh, "QBE1", intake, None, BoxState::OutLocation);
        put_box(&mut wh, "QBE2", intake, None, BoxState::OutLocation);

        let r = reconciler();
        r.reconcile(
            &mut wh,
            completed("PUT_IN-1", "put_in", "QBE1", Some(Coord::new(42, 1, 1))),
            Utc::now(),
        )
        .unwrap();
        let second = r
            .reconcile(
                &mut wh,
                completed("PUT_IN-2", "put_in", "QBE2", Some(Coord::new(43, 1, 1))),
                Utc::now(),
            )
            .unwrap();

        assert!(matches!(
            second,
            ReconcileOutcome::Applied { ref warnings, .. }
                if warnings == &vec![ReconcileWarning::InconsistentLocation {
                    coord: Coord::new(43, 1, 1)
                }]
        ));
        for id in ["QBE1", "QBE2"] {
            let b = wh.get_box(&BoxId::new(id)).unwrap();
            assert_eq!(b.current_location, intake);
            assert_eq!(b.state, BoxState::InLocation);
        }
        assert!(wh.occupant(intake).is_none());
        assert_eq!(wh.history().len(), 2);
    }

    #[test]
    fn concurrent_plans_never_stack_blockers_in_one_staging_slot() {
        let mut wh = warehouse(2);
        stored_box(&mut wh, "T1", Coord::new(3, 1, 1));
        stored_box(&mut wh, "B1", Coord::new(3, 0, 1));
        stored_box(&mut wh, "T2", Coord::new(5, 1, 1));
        stored_box(&mut wh, "B2", Coord::new(5, 0, 1));

        let planner = Planner::default();
        let first = planner
            .plan_retrieve(&wh, &BoxId::new("T1"), Utc::now())
            .unwrap();
        let second = planner
            .plan_retrieve(&wh, &BoxId::new("T2"), Utc::now())
            .unwrap();
        assert_eq!(first.sequence[0].to, second.sequence[0].to);

        let r = reconciler();
        r.reconcile(
            &mut wh,
            completed(&first.operation_id, "move_to_dummy", "B1", Some(first.sequence[0].to)),
            Utc::now(),
        )
        .unwrap();
        let outcome = r
            .reconcile(
                &mut wh,
                completed(&second.operation_id, "move_to_dummy", "B2", Some(second.sequence[0].to)),
                Utc::now(),
            )
            .unwrap();

        let b1 = wh.get_box(&BoxId::new("B1")).unwrap();
        let b2 = wh.get_box(&BoxId::new("B2")).unwrap();
        assert_eq!(b1.current_location, staging_slot(&wh, Coord::new(9, 9, 0)));
        assert_eq!(b2.current_location, staging_slot(&wh, Coord::new(9, 8, 0)));
        assert_eq!(b2.coord, Coord::new(9, 8, 0));
        assert!(matches!(
            outcome,
            ReconcileOutcome::Applied { ref warnings, .. }
                if warnings == &vec![ReconcileWarning::StagingSlotTaken {
                    coord: Coord::new(9, 9, 0),
                    occupant: BoxId::new("B1"),
                }]
        ));
    }

    #[test]
    fn store_completion_keeps_another_boxes_home() {
        let mut wh = warehouse(1);
        let slot = grid_slot(&wh, Coord::new(2, 2, 2));
        let staged = staging_slot(&wh, Coord::new(9, 9, 0));
        put_box(&mut wh, "OWNER", staged, Some(slot), BoxState::OutLocation);
        let intake = wh.intake_slot(INTAKE).unwrap().id;
        put_box(&mut wh, "QBE1", intake, None, BoxState::OutLocation);

        reconciler()
            .reconcile(
                &mut wh,
                completed("PUT_IN-1", "put_in", "QBE1", Some(Coord::new(2, 2, 2))),
                Utc::now(),
            )
            .unwrap();

        let b = wh.get_box(&BoxId::new("QBE1")).unwrap();
        assert_eq!(b.current_location, slot);
        assert_eq!(b.home_location, None);
        assert_eq!(wh.home_claimant(slot).unwrap().id.as_str(), "OWNER");
    }

    #[test]
    fn staging_falls_back_to_any_free_slot() {
        let mut wh = warehouse(2);
        let id = stored_box(&mut wh, "QBE1", Coord::new(3, 0, 1));

        reconciler()
            .reconcile(
                &mut wh,
                completed("PICKING-1", "move_to_dummy", "QBE1", Some(Coord::new(0, 0, 5))),
                Utc::now(),
            )
            .unwrap();

        let b = wh.get_box(&id).unwrap();
        assert_eq!(b.current_location, staging_slot(&wh, Coord::new(9, 9, 0)));
        assert_eq!(b.coord, Coord::new(9, 9, 0));
        assert_eq!(b.state, BoxState::OutLocation);
    }

    #[test]
    fn staging_without_any_slot_leaves_location_unchanged() {
        let mut wh = warehouse(0);
        let id = stored_box(&mut wh, "QBE1", Coord::new(3, 0, 1));
        let before = wh.get_box(&id).unwrap().current_location;

        let outcome = reconciler()
            .reconcile(
                &mut wh,
                completed("PICKING-1", "move_to_dummy", "QBE1", Some(Coord::new(9, 9, 0))),
                Utc::now(),
            )
            .unwrap();

        let b = wh.get_box(&id).unwrap();
        assert_eq!(b.current_location, before);
        assert_eq!(b.state, BoxState::InLocation);
        assert!(matches!(
            outcome,
            ReconcileOutcome::Applied { ref warnings, .. }
                if warnings == &vec![ReconcileWarning::NoStagingSlot]
        ));
    }

    #[test]
    fn missing_required_field_mutates_nothing() {
        let mut wh = warehouse(1);
        let id = stored_box(&mut wh, "QBE1", Coord::new(3, 1, 1));
        let mut note = completed("PICKING-1", "picking", "QBE1", None);
        note.box_id = None;
        note.status = Some(String::new());

        let err = reconciler().reconcile(&mut wh, note, Utc::now()).unwrap_err();
        match err {
            WarehouseError::MalformedNotification { missing } => {
                assert_eq!(missing, vec!["box_id", "status"])
            }
            other => panic!("unexpected error {other:?}"),
        }
        let b = wh.get_box(&id).unwrap();
        assert_eq!(b.state, BoxState::InLocation);
        assert_eq!(b.coord, Coord::new(3, 1, 1));
        assert!(wh.history().is_empty());
    }

    #[test]
    fn failed_status_is_reported_without_mutation() {
        let mut wh = warehouse(1);
        let id = stored_box(&mut wh, "QBE1", Coord::new(3, 1, 1));
        let mut note = completed("PICKING-9", "picking", "QBE1", None);
        note.status = Some("failed".to_string());

        let outcome = reconciler().reconcile(&mut wh, note, Utc::now()).unwrap();
        assert!(matches!(
            outcome,
            ReconcileOutcome::Failed { ref operation_id, .. } if operation_id == "PICKING-9"
        ));
        assert_eq!(wh.get_box(&id).unwrap().state, BoxState::InLocation);
        assert!(wh.history().is_empty());
    }

    #[test]
    fn unknown_operation_type_is_ignored() {
        let mut wh = warehouse(1);
        stored_box(&mut wh, "QBE1", Coord::new(3, 1, 1));
        let outcome = reconciler()
            .reconcile(&mut wh, completed("X-1", "inventory", "QBE1", None), Utc::now())
            .unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Ignored { .. }));
        assert!(wh.history().is_empty());
    }

    #[test]
    fn unknown_box_is_not_found() {
        let mut wh = warehouse(1);
        let err = reconciler()
            .reconcile(&mut wh, completed("P-1", "picking", "GHOST", None), Utc::now())
            .unwrap_err();
        assert!(matches!(err, WarehouseError::BoxNotFound(_)));
    }

    #[test]
    fn store_completion_without_coordinates_is_malformed() {
        let mut wh = warehouse(1);
        stored_box(&mut wh, "QBE1", Coord::new(3, 1, 1));
        let err = reconciler()
            .reconcile(&mut wh, completed("P-1", "put_in", "QBE1", None), Utc::now())
            .unwrap_err();
        assert!(matches!(err, WarehouseError::MalformedNotification { .. }));
    }
}
