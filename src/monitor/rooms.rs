//! Room id to display name lookup

use std::collections::BTreeMap;

const BUILTIN_ROOMS: &[(u32, &str)] = &[
    (1, "salon"),
    (2, "eetkamer"),
    (3, "bedroom"),
    (4, "bureau_achter"),
];

/// Static room table with optional configured overrides
#[derive(Debug, Clone, PartialEq)]
pub struct RoomDirectory {
    names: BTreeMap<u32, String>,
}

impl Default for RoomDirectory {
    fn default() -> Self {
        Self::builtin()
    }
}

impl RoomDirectory {
    pub fn builtin() -> Self {
        Self {
            names: BUILTIN_ROOMS
                .iter()
                .map(|(id, name)| (*id, (*name).to_string()))
                .collect(),
        }
    }

    /// Built-in table with `overrides` taking precedence
    pub fn with_overrides(overrides: BTreeMap<u32, String>) -> Self {
        let mut directory = Self::builtin();
        directory.names.extend(overrides);
        directory
    }

    /// Name for a room, `"Room N"` when unknown
    pub fn resolve(&self, room_id: u32) -> String {
        self.names
            .get(&room_id)
            .cloned()
            .unwrap_or_else(|| format!("Room {room_id}"))
    }
}
