//! Move-sequence planning for retrieve, store and reclaim operations.
//!
//! The planner never executes anything: it reads the warehouse, resolves
//! blocking boxes and emits an ordered `OperationPlan` that the middleware
//! carries out. A failed plan emits nothing.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use utoipa::ToSchema;

use crate::blocking::resolve_blocking;
use crate::error::{Result, WarehouseError};
use crate::model::{Slot, WarehouseBox};
use crate::occupancy::OccupancyIndex;
use crate::store::Warehouse;
use crate::types::{BoxId, Coord, RackId, SlotId};

/// Configuration for the planner.
#[derive(Clone, Debug)]
pub struct PlannerConfig {
    /// Maximum number of staged boxes returned by one reclaim plan
    pub reclaim_batch_size: usize,
    /// Name of the intake/exit slot
    pub intake_name: String,
}

impl PlannerConfig {
    pub const DEFAULT_RECLAIM_BATCH_SIZE: usize = 20;
    pub const DEFAULT_INTAKE_NAME: &'static str = "Puerta";

    /// Creates a builder for custom configuration.
    pub fn builder() -> PlannerConfigBuilder {
        PlannerConfigBuilder::default()
    }
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            reclaim_batch_size: Self::DEFAULT_RECLAIM_BATCH_SIZE,
            intake_name: Self::DEFAULT_INTAKE_NAME.to_string(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct PlannerConfigBuilder {
    config: PlannerConfig,
}

impl PlannerConfigBuilder {
    pub fn reclaim_batch_size(mut self, size: usize) -> Self {
        self.config.reclaim_batch_size = size;
        self
    }

    pub fn intake_name(mut self, name: impl Into<String>) -> Self {
        self.config.intake_name = name.into();
        self
    }

    pub fn build(self) -> PlannerConfig {
        self.config
    }
}

/// Requested operation type, as sent to the middleware.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Picking,
    PutIn,
    CleanUp,
}

impl OperationKind {
    fn id_prefix(&self) -> &'static str {
        match self {
            OperationKind::Picking => "PICKING",
            OperationKind::PutIn => "PUT_IN",
            OperationKind::CleanUp => "CLEANUP",
        }
    }

    pub fn default_priority(&self) -> Priority {
        match self {
            OperationKind::Picking | OperationKind::PutIn => Priority::Normal,
            OperationKind::CleanUp => Priority::Low,
        }
    }
}

/// Atomic move inside a plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    /// Relocate a blocking box to staging
    MoveToDummy,
    /// Bring the target box to the intake/exit position
    Deliver,
    /// Put a box into a rack position
    Place,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Normal,
    Low,
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct PlanStep {
    /// 1-based position in the sequence
    pub step: u32,
    pub action: StepAction,
    pub box_id: BoxId,
    pub from: Coord,
    pub to: Coord,
    pub description: String,
}

/// Summary of the box an operation is about.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct TargetBox {
    pub id: BoxId,
    pub current_pos: Coord,
    pub target_pos: Coord,
}

/// Ordered list of moves plus metadata, dispatched to the middleware as-is.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct OperationPlan {
    pub operation_id: String,
    pub operation_type: OperationKind,
    pub timestamp: DateTime<Utc>,
    pub priority: Priority,
    pub target_box: TargetBox,
    pub sequence: Vec<PlanStep>,
}

impl OperationPlan {
    pub fn step_count(&self) -> usize {
        self.sequence.len()
    }
}

/// Where a store operation should put the box.
#[derive(Clone, Debug, Default, Deserialize, ToSchema)]
pub struct StoreTarget {
    /// Explicit destination slot
    #[serde(default)]
    pub slot: Option<SlotId>,
    /// Rack to pick a free slot from when the box has no home slot
    #[serde(default)]
    pub rack: Option<RackId>,
}

/// Why a staged box was left out of a reclaim plan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum SkipReason {
    NoHomeSlot,
    HomeOccupied { occupant: BoxId },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::NoHomeSlot => write!(f, "box has no recorded home slot"),
            SkipReason::HomeOccupied { occupant } => {
                write!(f, "home slot is occupied by box {}", occupant)
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct SkippedBox {
    pub box_id: BoxId,
    pub reason: SkipReason,
}

/// Result of a reclaim request: the plan (if any box can go home) and the skipped boxes.
#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct ReclaimPlan {
    pub plan: Option<OperationPlan>,
    pub skipped: Vec<SkippedBox>,
}

/// Mints operation ids: type prefix, subject, second-resolution timestamp and a
/// process-wide counter so two requests in the same second never collide.
#[derive(Debug, Default)]
pub struct OperationIdGenerator {
    counter: AtomicU64,
}

impl OperationIdGenerator {
    pub fn next(&self, kind: OperationKind, subject: Option<&str>, now: DateTime<Utc>) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let stamp = now.format("%Y%m%d-%H%M%S");
        match subject {
            Some(subject) => format!("{}-{}-{}-{:04}", kind.id_prefix(), subject, stamp, n),
            None => format!("{}-{}-{:04}", kind.id_prefix(), stamp, n),
        }
    }
}

#[derive(Default)]
struct SequenceBuilder {
    steps: Vec<PlanStep>,
}

impl SequenceBuilder {
    fn push(
        &mut self,
        action: StepAction,
        box_id: &BoxId,
        from: Coord,
        to: Coord,
        description: String,
    ) {
        self.steps.push(PlanStep {
            step: self.steps.len() as u32 + 1,
            action,
            box_id: box_id.clone(),
            from,
            to,
            description,
        });
    }

    /// One relocate-to-staging step per blocker, each to its own free staging slot.
    fn stage_blockers(
        &mut self,
        index: &OccupancyIndex<'_>,
        blockers: &[&WarehouseBox],
    ) -> Result<()> {
        if blockers.is_empty() {
            return Ok(());
        }
        let free = index.free_staging_slots();
        if free.len() < blockers.len() {
            return Err(WarehouseError::NoStagingAvailable {
                needed: blockers.len(),
                available: free.len(),
            });
        }
        for (blocker, slot) in blockers.iter().zip(free) {
            self.push(
                StepAction::MoveToDummy,
                &blocker.id,
                blocker.coord,
                slot.coord,
                format!("Move box {} to staging {}", blocker.id, slot.name),
            );
        }
        Ok(())
    }

    fn build(self) -> Vec<PlanStep> {
        self.steps
    }
}

/// The move-sequence planner.
#[derive(Debug, Default)]
pub struct Planner {
    config: PlannerConfig,
    ids: OperationIdGenerator,
}

impl Planner {
    pub fn new(config: PlannerConfig) -> Self {
        Self {
            config,
            ids: OperationIdGenerator::default(),
        }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Plans taking a box out of the rack to the intake/exit position.
    ///
    /// Every box in front of it in its column goes to staging first, nearest
    /// first. Fails if the warehouse has no staging area at all or too few
    /// free staging slots for the blockers.
    pub fn plan_retrieve(
        &self,
        warehouse: &Warehouse,
        box_id: &BoxId,
        now: DateTime<Utc>,
    ) -> Result<OperationPlan> {
        let target = find_box(warehouse, box_id)?;
        let index = OccupancyIndex::new(warehouse);

        let blockers = match index.grid_rack_of(target) {
            Some(rack) => resolve_blocking(&index, rack, target.coord, Some(&target.id)),
            None => Vec::new(),
        };
        if !index.has_staging() {
            return Err(WarehouseError::NoStagingAvailable {
                needed: blockers.len(),
                available: 0,
            });
        }

        let mut sequence = SequenceBuilder::default();
        sequence.stage_blockers(&index, &blockers)?;
        sequence.push(
            StepAction::Deliver,
            &target.id,
            target.coord,
            Coord::origin(),
            format!("Deliver box {} to central position", target.id),
        );

        let plan = self.finish(
            OperationKind::Picking,
            Some(target.id.as_str()),
            TargetBox {
                id: target.id.clone(),
                current_pos: target.coord,
                target_pos: Coord::origin(),
            },
            sequence,
            now,
        );
        debug!(
            "Planned retrieve {} with {} blocking boxes",
            plan.operation_id,
            blockers.len()
        );
        Ok(plan)
    }

    /// Plans putting a box into a rack position.
    ///
    /// The destination is the explicit slot of `target`, else the box's home
    /// slot, else a free slot of `target.rack`.
    pub fn plan_store(
        &self,
        warehouse: &Warehouse,
        box_id: &BoxId,
        target: &StoreTarget,
        now: DateTime<Utc>,
    ) -> Result<OperationPlan> {
        let subject = find_box(warehouse, box_id)?;
        let index = OccupancyIndex::new(warehouse);
        let destination = resolve_destination(warehouse, &index, subject, target)?;

        if let Some(occupant) = warehouse.occupant(destination.id) {
            if occupant.id == subject.id {
                return Err(WarehouseError::validation(format!(
                    "Box {} is already stored at {}",
                    subject.id, destination.name
                )));
            }
            return Err(WarehouseError::DuplicateOccupancy {
                slot: destination.id,
                coord: destination.coord,
                occupant: occupant.id.clone(),
            });
        }

        let blockers = match &destination.rack {
            Some(rack) => resolve_blocking(&index, rack, destination.coord, Some(&subject.id)),
            None => Vec::new(),
        };

        let mut sequence = SequenceBuilder::default();
        sequence.stage_blockers(&index, &blockers)?;
        sequence.push(
            StepAction::Place,
            &subject.id,
            subject.coord,
            destination.coord,
            format!("Place box {} in {}", subject.id, destination.name),
        );

        let plan = self.finish(
            OperationKind::PutIn,
            Some(subject.id.as_str()),
            TargetBox {
                id: subject.id.clone(),
                current_pos: subject.coord,
                target_pos: destination.coord,
            },
            sequence,
            now,
        );
        debug!(
            "Planned store {} into {} with {} blocking boxes",
            plan.operation_id,
            destination.name,
            blockers.len()
        );
        Ok(plan)
    }

    /// Plans returning staged boxes to their home slots.
    ///
    /// Takes at most `reclaim_batch_size` staged boxes, deepest first. Boxes
    /// without a usable home slot are skipped and reported, never failed.
    pub fn plan_reclaim(&self, warehouse: &Warehouse, now: DateTime<Utc>) -> ReclaimPlan {
        let index = OccupancyIndex::new(warehouse);
        let batch = index.boxes_in_staging(None);

        let mut sequence = SequenceBuilder::default();
        let mut skipped = Vec::new();
        let mut first: Option<TargetBox> = None;

        for staged in batch.into_iter().take(self.config.reclaim_batch_size) {
            let home = match staged.home_location.and_then(|id| warehouse.slot(id)) {
                Some(home) => home,
                None => {
                    skipped.push(SkippedBox {
                        box_id: staged.id.clone(),
                        reason: SkipReason::NoHomeSlot,
                    });
                    continue;
                }
            };
            if let Some(occupant) = warehouse.occupant(home.id) {
                skipped.push(SkippedBox {
                    box_id: staged.id.clone(),
                    reason: SkipReason::HomeOccupied {
                        occupant: occupant.id.clone(),
                    },
                });
                continue;
            }

            sequence.push(
                StepAction::Place,
                &staged.id,
                staged.coord,
                home.coord,
                format!("Return box {} from staging to {}", staged.id, home.name),
            );
            first.get_or_insert_with(|| TargetBox {
                id: staged.id.clone(),
                current_pos: staged.coord,
                target_pos: home.coord,
            });
        }

        let plan = first.map(|target_box| {
            self.finish(OperationKind::CleanUp, None, target_box, sequence, now)
        });
        if let Some(plan) = &plan {
            debug!(
                "Planned reclaim {} for {} boxes ({} skipped)",
                plan.operation_id,
                plan.step_count(),
                skipped.len()
            );
        }
        ReclaimPlan { plan, skipped }
    }

    fn finish(
        &self,
        kind: OperationKind,
        subject: Option<&str>,
        target_box: TargetBox,
        sequence: SequenceBuilder,
        now: DateTime<Utc>,
    ) -> OperationPlan {
        OperationPlan {
            operation_id: self.ids.next(kind, subject, now),
            operation_type: kind,
            timestamp: now,
            priority: kind.default_priority(),
            target_box,
            sequence: sequence.build(),
        }
    }
}

fn find_box<'a>(warehouse: &'a Warehouse, box_id: &BoxId) -> Result<&'a WarehouseBox> {
    warehouse
        .get_box(box_id)
        .ok_or_else(|| WarehouseError::BoxNotFound(box_id.clone()))
}

fn resolve_destination<'a>(
    warehouse: &'a Warehouse,
    index: &OccupancyIndex<'a>,
    subject: &WarehouseBox,
    target: &StoreTarget,
) -> Result<&'a Slot> {
    let slot = if let Some(id) = target.slot {
        warehouse.slot(id).ok_or(WarehouseError::SlotNotFound(id))?
    } else if let Some(home) = subject.home_location {
        warehouse.slot(home).ok_or(WarehouseError::SlotNotFound(home))?
    } else if let Some(rack) = &target.rack {
        if warehouse.rack(rack).is_none() {
            return Err(WarehouseError::RackNotFound(rack.clone()));
        }
        index.free_slot(rack).ok_or_else(|| {
            WarehouseError::validation(format!("Rack {} has no free slot", rack))
        })?
    } else {
        return Err(WarehouseError::validation(format!(
            "Box {} has no home slot and no destination was given",
            subject.id
        )));
    };

    if !slot.is_grid() {
        return Err(WarehouseError::validation(format!(
            "Destination '{}' is not a rack position",
            slot.name
        )));
    }
    Ok(slot)
}
