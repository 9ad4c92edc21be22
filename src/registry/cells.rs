// Cell ownership: which colony owns each (app, cell) pair

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::model::{CellKey, Colony, MappedCells};

/// Ownership map from application and cell to the owning colony. The nested
/// string-keyed maps keep the serialized form deterministic across replicas.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CellStore {
    apps: BTreeMap<String, BTreeMap<String, BTreeMap<String, Colony>>>,
}

impl CellStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&mut self, app: &str, cell: &CellKey, colony: Colony) {
        self.apps
            .entry(app.to_string())
            .or_default()
            .entry(cell.dict.clone())
            .or_default()
            .insert(cell.key.clone(), colony);
    }

    pub fn colony(&self, app: &str, cell: &CellKey) -> Option<Colony> {
        self.apps.get(app)?.get(&cell.dict)?.get(&cell.key).cloned()
    }

    /// Every cell led by `bee`, in deterministic order.
    pub fn cells(&self, bee: u64) -> MappedCells {
        let mut out = Vec::new();
        for dicts in self.apps.values() {
            for (dict, keys) in dicts {
                for (key, colony) in keys {
                    if colony.leader == bee {
                        out.push(CellKey::new(dict.clone(), key.clone()));
                    }
                }
            }
        }
        out
    }

    /// Reassigns every cell of `app` owned by `old` to `new`.
    pub fn update_colony(&mut self, app: &str, old: &Colony, new: &Colony) {
        if let Some(dicts) = self.apps.get_mut(app) {
            for keys in dicts.values_mut() {
                for colony in keys.values_mut() {
                    if colony == old {
                        *colony = new.clone();
                    }
                }
            }
        }
    }
}
