//! Snapshot delta compression
//!
//! The encoder walks the baseline and the current snapshot in entity-id
//! order and emits one tagged record per entity that differs:
//!
//! - `New` carries the full state of an entity the baseline lacks
//! - `Delta` carries a changed-field mask and only the changed values
//! - `Removed` marks an entity that disappeared since the baseline
//!
//! Entities identical in both snapshots produce no record at all. With no
//! baseline every current entity is sent as `New`.

use crate::entity::{EntityState, Snapshot, ENTITY_FIELD_COUNT};
use crate::ProtocolError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// One tagged entity record inside a delta payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityUpdate {
    New(EntityState),
    Delta {
        id: u32,
        /// Bit `i` set means field `i` changed
        changed: u16,
        /// Changed values, in field order
        values: Vec<i32>,
    },
    Removed {
        id: u32,
    },
}

impl EntityUpdate {
    pub fn id(&self) -> u32 {
        match self {
            EntityUpdate::New(state) => state.id,
            EntityUpdate::Delta { id, .. } | EntityUpdate::Removed { id } => *id,
        }
    }
}

/// Encoded difference between a baseline and a current snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaPayload {
    /// Tick of the snapshot this payload reconstructs
    pub tick: u32,
    /// Tick of the baseline the receiver must apply it to, if any
    pub baseline_tick: Option<u32>,
    /// Records sorted by entity id
    pub updates: Vec<EntityUpdate>,
}

impl DeltaPayload {
    /// Serialises the payload. Identical payloads always give identical bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn is_full(&self) -> bool {
        self.baseline_tick.is_none()
    }
}

/// Computes the per-field delta of `to` against `from`
///
/// Returns `None` when no field changed.
pub fn diff_entity(from: &EntityState, to: &EntityState) -> Option<EntityUpdate> {
    let old = from.fields();
    let new = to.fields();

    let mut changed = 0u16;
    let mut values = Vec::new();
    for i in 0..ENTITY_FIELD_COUNT {
        if old[i] != new[i] {
            changed |= 1 << i;
            values.push(new[i]);
        }
    }

    if changed == 0 {
        None
    } else {
        Some(EntityUpdate::Delta {
            id: to.id,
            changed,
            values,
        })
    }
}

/// Encodes `current` relative to `baseline`
///
/// Pure: the output depends only on the two snapshots.
pub fn encode(baseline: Option<&Snapshot>, current: &Snapshot) -> DeltaPayload {
    let Some(baseline) = baseline else {
        return DeltaPayload {
            tick: current.tick(),
            baseline_tick: None,
            updates: current.entities().copied().map(EntityUpdate::New).collect(),
        };
    };

    let mut updates = Vec::new();
    let mut old_iter = baseline.entities().peekable();
    let mut new_iter = current.entities().peekable();

    loop {
        let order = match (old_iter.peek(), new_iter.peek()) {
            (None, None) => break,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(old), Some(new)) => old.id.cmp(&new.id),
        };

        match order {
            Ordering::Less => {
                if let Some(old) = old_iter.next() {
                    updates.push(EntityUpdate::Removed { id: old.id });
                }
            }
            Ordering::Greater => {
                if let Some(new) = new_iter.next() {
                    updates.push(EntityUpdate::New(*new));
                }
            }
            Ordering::Equal => {
                if let (Some(old), Some(new)) = (old_iter.next(), new_iter.next()) {
                    if let Some(update) = diff_entity(old, new) {
                        updates.push(update);
                    }
                }
            }
        }
    }

    DeltaPayload {
        tick: current.tick(),
        baseline_tick: Some(baseline.tick()),
        updates,
    }
}

/// Reconstructs the snapshot a payload describes
///
/// The caller passes the snapshot matching `payload.baseline_tick`; a missing
/// or mismatched baseline is an error rather than a silent full reset.
pub fn apply(baseline: Option<&Snapshot>, payload: &DeltaPayload) -> Result<Snapshot, ProtocolError> {
    let mut entities: Vec<EntityState> = match (payload.baseline_tick, baseline) {
        (None, _) => Vec::new(),
        (Some(tick), Some(base)) if base.tick() == tick => base.entities().copied().collect(),
        (Some(tick), _) => return Err(ProtocolError::MissingBaseline(tick)),
    };

    for update in &payload.updates {
        match update {
            EntityUpdate::New(state) => {
                entities.retain(|e| e.id != state.id);
                entities.push(*state);
            }
            EntityUpdate::Delta {
                id,
                changed,
                values,
            } => {
                let entity = entities
                    .iter_mut()
                    .find(|e| e.id == *id)
                    .ok_or(ProtocolError::UnknownEntity(*id))?;

                let mut fields = entity.fields();
                let mut next = values.iter();
                for (i, field) in fields.iter_mut().enumerate() {
                    if changed & (1 << i) != 0 {
                        *field = *next.next().ok_or(ProtocolError::ShortDelta(*id))?;
                    }
                }
                *entity = EntityState::from_fields(*id, fields);
            }
            EntityUpdate::Removed { id } => entities.retain(|e| e.id != *id),
        }
    }

    Ok(Snapshot::new(payload.tick, entities))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(id: u32, x: i32) -> EntityState {
        let mut state = EntityState::new(id);
        state.origin = [x, 0, 0];
        state.model_index = 1;
        state
    }

    #[test]
    fn test_full_encode_without_baseline() {
        let current = Snapshot::new(10, vec![entity(3, 5), entity(1, 7)]);
        let payload = encode(None, &current);

        assert!(payload.is_full());
        assert_eq!(payload.tick, 10);
        assert_eq!(payload.updates.len(), 2);
        assert!(payload
            .updates
            .iter()
            .all(|u| matches!(u, EntityUpdate::New(_))));
        assert_eq!(payload.updates[0].id(), 1);
        assert_eq!(payload.updates[1].id(), 3);
    }

    #[test]
    fn test_delta_only_changed_field() {
        let baseline = Snapshot::new(1, vec![entity(1, 10), entity(2, 20)]);
        let current = Snapshot::new(2, vec![entity(1, 10), entity(2, 24)]);

        let payload = encode(Some(&baseline), &current);

        assert_eq!(payload.baseline_tick, Some(1));
        assert_eq!(
            payload.updates,
            vec![EntityUpdate::Delta {
                id: 2,
                changed: 0b1,
                values: vec![24],
            }]
        );
    }

    #[test]
    fn test_new_and_removed_markers_are_id_sorted() {
        let baseline = Snapshot::new(1, vec![entity(1, 0), entity(4, 0)]);
        let current = Snapshot::new(2, vec![entity(2, 0), entity(4, 0), entity(5, 0)]);

        let payload = encode(Some(&baseline), &current);
        let ids: Vec<u32> = payload.updates.iter().map(EntityUpdate::id).collect();

        assert_eq!(ids, vec![1, 2, 5]);
        assert!(matches!(payload.updates[0], EntityUpdate::Removed { id: 1 }));
        assert!(matches!(payload.updates[1], EntityUpdate::New(_)));
        assert!(matches!(payload.updates[2], EntityUpdate::New(_)));
    }

    #[test]
    fn test_encode_is_deterministic() {
        let baseline = Snapshot::new(1, (0..50).map(|i| entity(i, i as i32)));
        let current = Snapshot::new(2, (10..60).map(|i| entity(i, i as i32 * 2)));

        let first = encode(Some(&baseline), &current).to_bytes().unwrap();
        let second = encode(Some(&baseline), &current).to_bytes().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_no_epsilon_in_comparison() {
        let baseline = Snapshot::new(1, vec![entity(1, 100)]);
        let current = Snapshot::new(2, vec![entity(1, 101)]);

        let payload = encode(Some(&baseline), &current);
        assert_eq!(payload.updates.len(), 1);
    }

    #[test]
    fn test_apply_reconstructs_current() {
        let baseline = Snapshot::new(1, vec![entity(1, 10), entity(2, 20), entity(3, 30)]);
        let mut moved = entity(2, 21);
        moved.frame = 3;
        let current = Snapshot::new(2, vec![entity(1, 10), moved, entity(9, 90)]);

        let payload = encode(Some(&baseline), &current);
        let rebuilt = apply(Some(&baseline), &payload).unwrap();
        assert_eq!(rebuilt, current);
    }

    #[test]
    fn test_apply_rejects_wrong_baseline() {
        let baseline = Snapshot::new(1, vec![entity(1, 10)]);
        let other = Snapshot::new(5, vec![entity(1, 10)]);
        let current = Snapshot::new(6, vec![entity(1, 11)]);

        let payload = encode(Some(&baseline), &current);
        assert!(matches!(
            apply(Some(&other), &payload),
            Err(ProtocolError::MissingBaseline(1))
        ));
        assert!(matches!(
            apply(None, &payload),
            Err(ProtocolError::MissingBaseline(1))
        ));
    }
}
