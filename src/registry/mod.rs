// Replicated registry of hives, bees, and cell ownership
// The canonical store driven by the consensus core; every mutation arrives
// through apply/apply_conf_change, every read through the query methods

pub mod cells;
pub mod command;
pub mod model;

pub use cells::CellStore;
pub use command::{RegistryCommand, RegistryReply};
pub use model::{BeeInfo, CellKey, Colony, HiveInfo, MappedCells};

use std::collections::BTreeMap;
use std::sync::RwLock;

use raft::eraftpb::{ConfChange, ConfChangeType};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Error;
use crate::raft::request::NodeInfo;
use crate::raft::store::Store;

/// The replicated state. Ordered maps keep `save` byte-identical across
/// replicas at the same applied log prefix.
#[derive(Debug, Default, Serialize, Deserialize)]
struct State {
    hive_id: u64,
    bee_id: u64,
    hives: BTreeMap<u64, HiveInfo>,
    bees: BTreeMap<u64, BeeInfo>,
    cells: CellStore,
}

/// In-memory directory of hives, bees, and cell-to-colony assignments,
/// replicated by feeding it to a consensus node as its store.
#[derive(Debug)]
pub struct Registry {
    name: String,
    state: RwLock<State>,
}

impl Registry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(State {
                // Start from one so the bootstrap hive keeps id 1.
                hive_id: 1,
                ..State::default()
            }),
        }
    }

    // ==================== Read API ====================

    pub fn hives(&self) -> Vec<HiveInfo> {
        self.state.read().unwrap().hives.values().cloned().collect()
    }

    pub fn hive(&self, id: u64) -> Result<HiveInfo, Error> {
        self.state
            .read()
            .unwrap()
            .hives
            .get(&id)
            .cloned()
            .ok_or(Error::NoSuchHive)
    }

    pub fn bees(&self) -> Vec<BeeInfo> {
        self.state.read().unwrap().bees.values().cloned().collect()
    }

    pub fn bee(&self, id: u64) -> Result<BeeInfo, Error> {
        self.state
            .read()
            .unwrap()
            .bees
            .get(&id)
            .cloned()
            .ok_or(Error::NoSuchBee)
    }

    pub fn bees_of_hive(&self, id: u64) -> Vec<BeeInfo> {
        self.state
            .read()
            .unwrap()
            .bees
            .values()
            .filter(|b| b.hive == id)
            .cloned()
            .collect()
    }

    pub fn bee_and_hive(&self, id: u64) -> Result<(BeeInfo, HiveInfo), Error> {
        let state = self.state.read().unwrap();
        let bee = state.bees.get(&id).cloned().ok_or(Error::NoSuchBee)?;
        assert_eq!(bee.id, id, "bee {id} has invalid info {bee:?}");
        let hive = state
            .hives
            .get(&bee.hive)
            .cloned()
            .ok_or(Error::NoSuchHive)?;
        Ok((bee, hive))
    }

    /// The unique bee whose colony covers every listed cell, with a flag
    /// telling whether it covers them all. When cells are split across bees
    /// or unmapped, the flag is false and the first discovered owner is
    /// returned.
    pub fn bee_for_cells(&self, app: &str, cells: &[CellKey]) -> Result<(BeeInfo, bool), Error> {
        let state = self.state.read().unwrap();
        let mut info = BeeInfo::default();
        let mut has_all = true;
        for cell in cells {
            let Some(colony) = state.cells.colony(app, cell) else {
                has_all = false;
                continue;
            };
            if info.id == 0 {
                info = state.bees.get(&colony.leader).cloned().unwrap_or_default();
                assert_eq!(
                    info.id, colony.leader,
                    "bee {} has invalid info {:?}",
                    colony.leader, info
                );
            } else if info.id != colony.leader {
                // Inconsistencies are resolved by consensus.
                has_all = false;
            }
            if !has_all {
                return Ok((info, has_all));
            }
        }
        if info.id == 0 {
            return Err(Error::NoSuchBee);
        }
        Ok((info, has_all))
    }

    /// Seeds the hive directory at boot, before the node starts applying.
    pub fn init_hives(&self, hives: BTreeMap<u64, HiveInfo>) {
        let mut state = self.state.write().unwrap();
        for hive in hives.into_values() {
            state.add_hive(hive);
        }
    }
}

impl Store for Registry {
    type Command = RegistryCommand;
    type Reply = RegistryReply;

    fn apply(&self, cmd: RegistryCommand) -> Result<Option<RegistryReply>, Error> {
        let mut state = self.state.write().unwrap();
        match cmd {
            RegistryCommand::NoOp => Ok(None),
            RegistryCommand::NewHiveId { addr } => {
                let id = state.new_hive_id(&addr);
                debug!(registry = %self.name, id, "allocated hive id");
                Ok(Some(RegistryReply::Id(id)))
            }
            RegistryCommand::NewBeeId => {
                let id = state.new_bee_id();
                debug!(registry = %self.name, id, "allocated bee id");
                Ok(Some(RegistryReply::Id(id)))
            }
            RegistryCommand::AddBee(info) => {
                debug!(
                    registry = %self.name,
                    bee = info.id,
                    app = %info.app,
                    detached = info.detached,
                    "adding bee"
                );
                state.add_bee(info).map(|()| None)
            }
            RegistryCommand::DelBee(id) => {
                debug!(registry = %self.name, bee = id, "removing bee");
                state.del_bee(id).map(|()| None)
            }
            RegistryCommand::MoveBee { id, from, to } => {
                state.move_bee(id, from, to).map(|()| None)
            }
            RegistryCommand::UpdateColony { old, new } => {
                debug!(registry = %self.name, %old, %new, "updating colony");
                state.update_colony(&old, &new).map(|()| None)
            }
            RegistryCommand::LockCells { colony, app, cells } => state
                .lock_cells(colony, &app, &cells)
                .map(|c| Some(RegistryReply::Colony(c))),
            RegistryCommand::TransferCells { from, to } => {
                state.transfer_cells(&from, &to).map(|()| None)
            }
        }
    }

    fn apply_conf_change(&self, cc: &ConfChange, info: NodeInfo) -> Result<(), Error> {
        let mut state = self.state.write().unwrap();
        match cc.change_type() {
            ConfChangeType::AddNode => {
                assert_eq!(
                    info.id, cc.node_id,
                    "conf change for node {} carries info for {}",
                    cc.node_id, info.id
                );
                if !info.addr.is_empty() {
                    state.add_hive(HiveInfo::new(info.id, info.addr.clone()));
                }
                debug!(registry = %self.name, hive = %info, "added hive");
            }
            ConfChangeType::RemoveNode => {
                let _ = state.del_hive(cc.node_id);
                debug!(registry = %self.name, hive = cc.node_id, "deleted hive");
            }
            ConfChangeType::AddLearnerNode => {}
        }
        Ok(())
    }

    fn save(&self) -> Result<Vec<u8>, Error> {
        let state = self.state.read().unwrap();
        debug!(registry = %self.name, "saved");
        Ok(serde_json::to_vec(&*state)?)
    }

    fn restore(&self, data: &[u8]) -> Result<(), Error> {
        let mut state = self.state.write().unwrap();
        *state = serde_json::from_slice(data)?;
        debug!(registry = %self.name, "restored");
        Ok(())
    }
}

impl State {
    fn new_hive_id(&mut self, addr: &str) -> u64 {
        self.hive_id += 1;
        if !addr.is_empty() {
            self.add_hive(HiveInfo::new(self.hive_id, addr));
        }
        self.hive_id
    }

    fn new_bee_id(&mut self) -> u64 {
        self.bee_id += 1;
        self.bee_id
    }

    fn add_hive(&mut self, info: HiveInfo) {
        for hive in self.hives.values() {
            // Two live hives must never share an address.
            assert!(
                hive.addr != info.addr || hive.id == info.id,
                "duplicate address {} for hives {} and {}",
                info.addr,
                info.id,
                hive.id
            );
        }
        self.hives.insert(info.id, info);
    }

    fn del_hive(&mut self, id: u64) -> Result<(), Error> {
        self.hives.remove(&id).map(|_| ()).ok_or(Error::NoSuchHive)
    }

    fn add_bee(&mut self, info: BeeInfo) -> Result<(), Error> {
        assert_ne!(info.id, 0, "invalid bee info: {info:?}");
        if self.bees.contains_key(&info.id) {
            return Err(Error::DuplicateBee);
        }
        assert!(
            info.id <= self.bee_id,
            "bee id {} was never allocated (last id {})",
            info.id,
            self.bee_id
        );
        self.bees.insert(info.id, info);
        Ok(())
    }

    fn del_bee(&mut self, id: u64) -> Result<(), Error> {
        self.bees.remove(&id).map(|_| ()).ok_or(Error::NoSuchBee)
    }

    fn move_bee(&mut self, id: u64, from: u64, to: u64) -> Result<(), Error> {
        let bee = self.bees.get_mut(&id).ok_or(Error::NoSuchBee)?;
        if bee.hive != from {
            return Err(Error::InvalidParam);
        }
        if from == to {
            return Ok(());
        }
        bee.hive = to;
        Ok(())
    }

    /// The bee must exist: colony updates referencing unknown bees are a
    /// broken replication invariant, not a caller mistake.
    fn must_bee(&self, id: u64) -> BeeInfo {
        self.bees
            .get(&id)
            .cloned()
            .unwrap_or_else(|| panic!("cannot find bee {id}"))
    }

    fn update_colony(&mut self, old: &Colony, new: &Colony) -> Result<(), Error> {
        if old.is_nil() || new.is_nil() {
            return Err(Error::InvalidParam);
        }
        let app = self.must_bee(new.leader).app;
        self.cells.update_colony(&app, old, new);

        if old.leader != new.leader {
            let mut bee = self.must_bee(old.leader);
            bee.colony = if new.contains(old.leader) {
                new.clone()
            } else {
                Colony::default()
            };
            self.bees.insert(old.leader, bee);
        }
        for follower in &old.followers {
            if !new.contains(*follower) {
                let mut bee = self.must_bee(*follower);
                bee.colony = Colony::default();
                self.bees.insert(*follower, bee);
            }
        }
        for follower in &new.followers {
            let mut bee = self.must_bee(*follower);
            bee.colony = new.clone();
            self.bees.insert(*follower, bee);
        }
        let mut bee = self.must_bee(new.leader);
        bee.colony = new.clone();
        self.bees.insert(new.leader, bee);
        Ok(())
    }

    fn lock_cells(
        &mut self,
        mut colony: Colony,
        app: &str,
        cells: &[CellKey],
    ) -> Result<Colony, Error> {
        if colony.leader == 0 {
            return Err(Error::InvalidParam);
        }
        let mut locked = false;
        let mut open: MappedCells = Vec::with_capacity(cells.len());
        for cell in cells {
            let Some(owner) = self.cells.colony(app, cell) else {
                if locked {
                    self.cells.assign(app, cell, colony.clone());
                } else {
                    open.push(cell.clone());
                }
                continue;
            };
            if locked && owner != colony {
                // Cells in one request owned by two distinct colonies.
                return Err(Error::ColonyConflict {
                    app: app.to_string(),
                    cell: cell.to_string(),
                });
            }
            locked = true;
            colony = owner;
        }

        if locked {
            for cell in &open {
                self.cells.assign(app, cell, colony.clone());
            }
            return Ok(colony);
        }
        for cell in cells {
            self.cells.assign(app, cell, colony.clone());
        }
        Ok(colony)
    }

    fn transfer_cells(&mut self, from: &Colony, to: &Colony) -> Result<(), Error> {
        let bee = self.bees.get(&from.leader).ok_or(Error::NoSuchBee)?;
        let app = bee.app.clone();
        let keys = self.cells.cells(from.leader);
        if keys.is_empty() {
            return Err(Error::InvalidParam);
        }
        for key in keys {
            self.cells.assign(&app, &key, to.clone());
        }
        Ok(())
    }
}
