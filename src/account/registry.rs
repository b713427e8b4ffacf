//! Ordered, deduplicated registry of installed extensions.
//!
//! Iteration follows insertion order until the first removal. Removal is a
//! swap-delete: the last entry moves into the removed slot.

use std::collections::HashMap;
use thiserror::Error;

use crate::types::Address;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("extension id must not be the zero identity")]
    ZeroId,
    #[error("extension {0} is already registered")]
    Duplicate(Address),
    #[error("extension {0} is not registered")]
    NotMember(Address),
}

#[derive(Debug, Clone)]
pub struct Registry<T> {
    entries: Vec<(Address, T)>,
    index: HashMap<Address, usize>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self { entries: Vec::new(), index: HashMap::new() }
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: Address, item: T) -> Result<(), RegistryError> {
        if id.is_zero() {
            return Err(RegistryError::ZeroId);
        }
        if self.index.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        self.index.insert(id, self.entries.len());
        self.entries.push((id, item));
        Ok(())
    }

    pub fn remove(&mut self, id: &Address) -> Result<T, RegistryError> {
        let slot = self.index.remove(id).ok_or(RegistryError::NotMember(*id))?;
        let (_, item) = self.entries.swap_remove(slot);
        if let Some((moved, _)) = self.entries.get(slot) {
            self.index.insert(*moved, slot);
        }
        Ok(item)
    }

    pub fn contains(&self, id: &Address) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &Address) -> Option<&T> {
        self.index.get(id).map(|&slot| &self.entries[slot].1)
    }

    pub fn get_mut(&mut self, id: &Address) -> Option<&mut T> {
        let slot = *self.index.get(id)?;
        self.entries.get_mut(slot).map(|(_, item)| item)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> Vec<Address> {
        self.entries.iter().map(|(id, _)| *id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Address, &T)> {
        self.entries.iter().map(|(id, item)| (id, item))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&Address, &mut T)> {
        self.entries.iter_mut().map(|(id, item)| (&*id, item))
    }
}
