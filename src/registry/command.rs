// Registry commands and replies
// These are the operations replicated through consensus; the variant name
// doubles as the registered decode tag in persisted entries and snapshots

use serde::{Deserialize, Serialize};

use super::model::{BeeInfo, Colony, MappedCells};

/// All operations that go through consensus against the registry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RegistryCommand {
    /// Barrier: forces every earlier update to be applied before returning.
    NoOp,

    /// Allocates a fresh hive id; a non-empty addr also registers the hive.
    NewHiveId { addr: String },

    /// Allocates a fresh bee id.
    NewBeeId,

    /// Registers a bee under an already-allocated id.
    AddBee(BeeInfo),

    /// Removes a bee.
    DelBee(u64),

    /// Moves a bee from one hive to another.
    MoveBee { id: u64, from: u64, to: u64 },

    /// Re-homes cells and colony pointers from a colony to its successor.
    UpdateColony { old: Colony, new: Colony },

    /// Locks cells for a colony, adopting the current owner when one exists.
    LockCells {
        colony: Colony,
        app: String,
        cells: MappedCells,
    },

    /// Moves every cell led by `from`'s leader over to `to`.
    TransferCells { from: Colony, to: Colony },
}

/// Replies produced by applying registry commands.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RegistryReply {
    Id(u64),
    Colony(Colony),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commands_decode_by_variant_name() {
        let bytes = serde_json::to_vec(&RegistryCommand::NewHiveId {
            addr: "127.0.0.1:7621".to_string(),
        })
        .unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains("NewHiveId"));

        let decoded: RegistryCommand = serde_json::from_slice(&bytes).unwrap();
        assert!(matches!(decoded, RegistryCommand::NewHiveId { addr } if addr == "127.0.0.1:7621"));
    }

    #[test]
    fn test_unknown_variant_fails_decode() {
        assert!(serde_json::from_slice::<RegistryCommand>(b"{\"Retired\":{}}").is_err());
    }
}
