//! JSON snapshot of the whole warehouse.
//!
//! A snapshot is rebuilt through the same validating writes as live data, so a
//! document that violates occupancy or layout rules is rejected on load.

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::info;

use crate::error::{Result, WarehouseError};
use crate::model::{BoxKey, MovementRecord, Rack, Slot, WarehouseBox};
use crate::store::Warehouse;
use crate::types::BoxId;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppliedOperation {
    pub operation_id: String,
    pub box_id: BoxId,
}

/// Serialized form of every warehouse table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WarehouseSnapshot {
    pub version: u32,
    pub racks: Vec<Rack>,
    pub slots: Vec<Slot>,
    pub keys: Vec<BoxKey>,
    pub boxes: Vec<WarehouseBox>,
    #[serde(default)]
    pub history: Vec<MovementRecord>,
    #[serde(default)]
    pub applied: Vec<AppliedOperation>,
}

impl WarehouseSnapshot {
    pub fn capture(warehouse: &Warehouse) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            racks: warehouse.racks().cloned().collect(),
            slots: warehouse.slots().cloned().collect(),
            keys: warehouse.keys().cloned().collect(),
            boxes: warehouse.boxes().cloned().collect(),
            history: warehouse.history().to_vec(),
            applied: warehouse
                .applied()
                .map(|(operation_id, box_id)| AppliedOperation {
                    operation_id: operation_id.clone(),
                    box_id: box_id.clone(),
                })
                .collect(),
        }
    }

    /// Rebuilds a warehouse; racks first, then slots, keys, boxes and history.
    pub fn restore(self) -> Result<Warehouse> {
        if self.version > SNAPSHOT_VERSION {
            return Err(WarehouseError::Persistence(format!(
                "snapshot version {} is newer than supported version {}",
                self.version, SNAPSHOT_VERSION
            )));
        }
        let mut warehouse = Warehouse::new();
        for rack in self.racks {
            warehouse.add_rack(rack)?;
        }
        for slot in self.slots {
            warehouse.insert_slot(slot)?;
        }
        for key in self.keys {
            warehouse.register_key(key)?;
        }
        for record in self.boxes {
            warehouse.restore_box(record)?;
        }
        warehouse.restore_history(self.history)?;
        for applied in self.applied {
            warehouse.mark_applied(&applied.operation_id, &applied.box_id);
        }
        Ok(warehouse)
    }
}

/// Loads a snapshot; `Ok(None)` when the file does not exist yet.
pub fn load_snapshot(path: &Path) -> Result<Option<Warehouse>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let snapshot: WarehouseSnapshot = serde_json::from_str(&raw)?;
    let warehouse = snapshot.restore().map_err(|err| {
        WarehouseError::Persistence(format!("invalid snapshot {}: {}", path.display(), err))
    })?;
    info!(
        "Loaded warehouse snapshot from {} ({} boxes)",
        path.display(),
        warehouse.boxes().count()
    );
    Ok(Some(warehouse))
}

/// Writes the snapshot next to `path` and atomically renames it into place.
pub fn save_snapshot(path: &Path, warehouse: &Warehouse) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut file = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut file, &WarehouseSnapshot::capture(warehouse))?;
    file.flush()?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|err| err.error)?;
    Ok(())
}
