//! Indexing registry.
//!
//! Stable mapping from (variable name, sub-index) keys to dense slots `0..len`.
//! One registry is kept for the noisy states and one for the measured outputs of a window.
//! Keys are registered during the window build pass, after `freeze` the mapping never changes.

use std::collections::HashMap;
use std::fmt;

use crate::error::{EstimateError, Result};
use crate::models::SubIndex;

/// Dense registry slot.
pub type Slot = usize;

/// A registered (variable name, sub-index) key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    pub name: String,
    pub index: SubIndex,
}

impl Key {
    pub fn new(name: &str, index: SubIndex) -> Key {
        Key {
            name: name.to_string(),
            index,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.index.parts().is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}{}", self.name, self.index)
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    keys: Vec<Key>,
    slots: HashMap<Key, Slot>,
    frozen: bool,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Registers a key at the next free slot.
    pub fn register(&mut self, name: &str, index: SubIndex) -> Result<Slot> {
        let key = Key::new(name, index);
        if self.frozen {
            return Err(EstimateError::ModelConstructionError {
                reason: format!("registry is frozen, cannot register {}", key),
            });
        }
        if self.slots.contains_key(&key) {
            return Err(EstimateError::DuplicateKey { key: key.to_string() });
        }
        let slot = self.keys.len();
        self.slots.insert(key.clone(), slot);
        self.keys.push(key);
        Ok(slot)
    }

    pub fn resolve(&self, name: &str, index: &SubIndex) -> Result<Slot> {
        let key = Key::new(name, index.clone());
        match self.slots.get(&key) {
            Some(slot) => Ok(*slot),
            None => Err(EstimateError::UnknownKey { key: key.to_string() }),
        }
    }

    /// Ends the build pass.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn key(&self, slot: Slot) -> Option<&Key> {
        self.keys.get(slot)
    }

    /// Keys in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Slot, &Key)> {
        self.keys.iter().enumerate()
    }

    /// Display labels in slot order.
    pub fn labels(&self) -> Vec<String> {
        self.keys.iter().map(Key::to_string).collect()
    }
}
