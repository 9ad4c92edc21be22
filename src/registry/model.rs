// Registry data model: hives, bees, colonies, and cell keys

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// One cluster member: id plus the address peers dial to reach it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HiveInfo {
    pub id: u64,
    pub addr: String,
}

impl HiveInfo {
    pub fn new(id: u64, addr: impl Into<String>) -> Self {
        Self {
            id,
            addr: addr.into(),
        }
    }
}

/// Metadata about one bee (actor instance).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BeeInfo {
    pub id: u64,
    pub hive: u64,
    pub app: String,
    pub colony: Colony,
    pub detached: bool,
}

/// A replicated group of bees: one leader plus followers, jointly owning a
/// set of cells. A colony with leader 0 is nil.
#[derive(Clone, Debug, Default, Eq, Serialize, Deserialize)]
pub struct Colony {
    pub leader: u64,
    pub followers: Vec<u64>,
}

impl Colony {
    pub fn new(leader: u64) -> Self {
        Self {
            leader,
            followers: Vec::new(),
        }
    }

    pub fn is_nil(&self) -> bool {
        self.leader == 0
    }

    pub fn contains(&self, id: u64) -> bool {
        self.leader == id || self.followers.contains(&id)
    }
}

impl PartialEq for Colony {
    /// Follower order carries no meaning.
    fn eq(&self, other: &Self) -> bool {
        if self.leader != other.leader || self.followers.len() != other.followers.len() {
            return false;
        }
        let mut ours = self.followers.clone();
        let mut theirs = other.followers.clone();
        ours.sort_unstable();
        theirs.sort_unstable();
        ours == theirs
    }
}

impl Display for Colony {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "colony(leader={}, followers={:?})", self.leader, self.followers)
    }
}

/// An application-defined key naming one unit of sharded state. The pair
/// `(app, cell)` maps to the colony that owns it.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellKey {
    pub dict: String,
    pub key: String,
}

impl CellKey {
    pub fn new(dict: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            dict: dict.into(),
            key: key.into(),
        }
    }
}

impl Display for CellKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.dict, self.key)
    }
}

/// The cells a handler maps a message to.
pub type MappedCells = Vec<CellKey>;
