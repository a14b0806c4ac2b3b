//! Entity state records and immutable world snapshots
//!
//! Every field is stored in the quantised integer form the simulation
//! produces. Nothing at this layer converts back to floating point, so two
//! states compare equal exactly when the simulation produced the same values.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Number of delta-encodable fields on an entity
pub const ENTITY_FIELD_COUNT: usize = 12;

/// Position units per world unit used by the demo simulation and client
pub const ORIGIN_SCALE: f32 = 8.0;

/// Networked state of a single entity
///
/// Field order is part of the wire format: the delta encoder addresses
/// fields by their index in [`EntityState::fields`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct EntityState {
    /// Stable entity id, unique within a snapshot
    pub id: u32,
    pub origin: [i32; 3],
    pub velocity: [i32; 3],
    pub angles: [i32; 3],
    pub model_index: i32,
    pub frame: i32,
    pub flags: i32,
}

impl EntityState {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    /// Returns the field values in wire order
    pub fn fields(&self) -> [i32; ENTITY_FIELD_COUNT] {
        [
            self.origin[0],
            self.origin[1],
            self.origin[2],
            self.velocity[0],
            self.velocity[1],
            self.velocity[2],
            self.angles[0],
            self.angles[1],
            self.angles[2],
            self.model_index,
            self.frame,
            self.flags,
        ]
    }

    /// Rebuilds an entity from its id and wire-ordered field values
    pub fn from_fields(id: u32, f: [i32; ENTITY_FIELD_COUNT]) -> Self {
        Self {
            id,
            origin: [f[0], f[1], f[2]],
            velocity: [f[3], f[4], f[5]],
            angles: [f[6], f[7], f[8]],
            model_index: f[9],
            frame: f[10],
            flags: f[11],
        }
    }
}

/// Point-in-time record of every networked entity
///
/// Snapshots are never mutated after construction. The server shares them
/// between sessions behind an `Arc`, so a snapshot lives exactly as long as
/// some session still holds it as a baseline or as an unacknowledged frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    tick: u32,
    entities: BTreeMap<u32, EntityState>,
}

impl Snapshot {
    /// Builds a snapshot, keying entities by id. A later duplicate id wins.
    pub fn new(tick: u32, entities: impl IntoIterator<Item = EntityState>) -> Self {
        Self {
            tick,
            entities: entities.into_iter().map(|e| (e.id, e)).collect(),
        }
    }

    pub fn empty(tick: u32) -> Self {
        Self {
            tick,
            entities: BTreeMap::new(),
        }
    }

    pub fn tick(&self) -> u32 {
        self.tick
    }

    pub fn get(&self, id: u32) -> Option<&EntityState> {
        self.entities.get(&id)
    }

    /// Entities in ascending id order
    pub fn entities(&self) -> impl Iterator<Item = &EntityState> {
        self.entities.values()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_preserve_order() {
        let mut state = EntityState::new(7);
        state.origin = [1, 2, 3];
        state.velocity = [4, 5, 6];
        state.angles = [7, 8, 9];
        state.model_index = 10;
        state.frame = 11;
        state.flags = 12;

        let fields = state.fields();
        assert_eq!(fields, [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
        assert_eq!(EntityState::from_fields(7, fields), state);
    }

    #[test]
    fn test_snapshot_orders_entities_by_id() {
        let snapshot = Snapshot::new(
            3,
            vec![EntityState::new(9), EntityState::new(2), EntityState::new(5)],
        );

        let ids: Vec<u32> = snapshot.entities().map(|e| e.id).collect();
        assert_eq!(ids, vec![2, 5, 9]);
        assert_eq!(snapshot.tick(), 3);
        assert_eq!(snapshot.len(), 3);
    }

    #[test]
    fn test_snapshot_duplicate_id_keeps_last() {
        let mut later = EntityState::new(1);
        later.frame = 4;
        let snapshot = Snapshot::new(0, vec![EntityState::new(1), later]);

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get(1).map(|e| e.frame), Some(4));
    }
}
