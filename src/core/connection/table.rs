//! Arena-backed connection table: room → peer → slot.
//!
//! Slots carry a generation so reports from a task whose connection was
//! already replaced can be recognised and ignored.

use super::ConnectionKey;
use crate::core::relay::protocol::{PeerId, RoomId};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    index: usize,
    generation: u64,
}

struct Slot<T> {
    generation: u64,
    entry: Option<(ConnectionKey, T)>,
}

pub struct ConnectionTable<T> {
    slots: Vec<Slot<T>>,
    rooms: HashMap<RoomId, HashMap<PeerId, SlotId>>,
    free: Vec<usize>,
    next_generation: u64,
}

impl<T> Default for ConnectionTable<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            rooms: HashMap::new(),
            free: Vec::new(),
            next_generation: 0,
        }
    }
}

impl<T> ConnectionTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot_of(&self, key: &ConnectionKey) -> Option<SlotId> {
        self.rooms.get(&key.room)?.get(&key.peer).copied()
    }

    /// Insert `value` for `key`. An existing entry is evicted and returned,
    /// so there is never more than one per key.
    pub fn insert(&mut self, key: ConnectionKey, value: T) -> (SlotId, Option<T>) {
        let evicted = self.remove(&key);

        self.next_generation += 1;
        let generation = self.next_generation;
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Slot {
                    generation,
                    entry: Some((key.clone(), value)),
                };
                index
            }
            None => {
                self.slots.push(Slot {
                    generation,
                    entry: Some((key.clone(), value)),
                });
                self.slots.len() - 1
            }
        };

        let id = SlotId { index, generation };
        self.rooms.entry(key.room).or_default().insert(key.peer, id);
        (id, evicted)
    }

    pub fn contains(&self, key: &ConnectionKey) -> bool {
        self.slot_of(key).is_some()
    }

    pub fn get(&self, key: &ConnectionKey) -> Option<&T> {
        let id = self.slot_of(key)?;
        self.slots[id.index].entry.as_ref().map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &ConnectionKey) -> Option<&mut T> {
        let id = self.slot_of(key)?;
        self.slots[id.index].entry.as_mut().map(|(_, v)| v)
    }

    /// Look up by slot; `None` when the slot was freed or reused since.
    pub fn resolve_mut(&mut self, id: SlotId) -> Option<(&ConnectionKey, &mut T)> {
        let slot = self.slots.get_mut(id.index)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_mut().map(|(k, v)| (&*k, v))
    }

    pub fn remove(&mut self, key: &ConnectionKey) -> Option<T> {
        let id = self.slot_of(key)?;
        self.remove_slot(id).map(|(_, v)| v)
    }

    /// Remove by slot, only if the generation still matches.
    pub fn remove_slot(&mut self, id: SlotId) -> Option<(ConnectionKey, T)> {
        let slot = self.slots.get_mut(id.index)?;
        if slot.generation != id.generation {
            return None;
        }
        let (key, value) = slot.entry.take()?;
        self.free.push(id.index);

        if let Some(peers) = self.rooms.get_mut(&key.room) {
            peers.remove(&key.peer);
            if peers.is_empty() {
                self.rooms.remove(&key.room);
            }
        }
        Some((key, value))
    }

    pub fn keys_in_room(&self, room: &str) -> Vec<ConnectionKey> {
        self.rooms
            .get(room)
            .map(|peers| {
                peers
                    .keys()
                    .map(|peer| ConnectionKey::new(room, peer))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn keys(&self) -> Vec<ConnectionKey> {
        self.slots
            .iter()
            .filter_map(|s| s.entry.as_ref().map(|(k, _)| k.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }
}
