//! # Cache Store
//!
//! Owns every request's incremental evaluator state between ticks.
//!
//! The store never looks inside a state; it only hands states out for a
//! tick and takes the evaluator's replacements back. A handle stays valid
//! from [`CacheStore::allocate`] until [`CacheStore::release`], and handle
//! values are never reused, so two requests can not end up sharing a slot.
//!
//! Releasing a handle twice is an error ([`CacheError::InvalidHandle`]),
//! not a no-op.

use std::collections::HashMap;
use std::fmt;
use serde::{Deserialize, Serialize};
use crate::error::CacheError;
use crate::request::RequestId;

/// Opaque reference to one request's slot in a [`CacheStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheHandle(u64);

impl fmt::Display for CacheHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cache#{}", self.0)
    }
}

#[derive(Debug)]
struct Slot<C> {
    owner: RequestId,
    /// `None` before the first evaluation, and while the state is checked
    /// out for a tick.
    state: Option<C>,
}

/// Per-request storage for evaluator cache states of type `C`.
#[derive(Debug)]
pub struct CacheStore<C> {
    next: u64,
    slots: HashMap<CacheHandle, Slot<C>>,
}

impl<C> Default for CacheStore<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> CacheStore<C> {
    pub fn new() -> Self {
        Self {
            next: 0,
            slots: HashMap::new(),
        }
    }

    /// Reserves an empty slot for `owner`.
    pub fn allocate(&mut self, owner: RequestId) -> CacheHandle {
        let handle = CacheHandle(self.next);
        self.next += 1;
        self.slots.insert(handle, Slot { owner, state: None });
        handle
    }

    /// Checks the state out of its slot for evaluation.
    ///
    /// Returns `Ok(None)` for a request that has not been evaluated yet.
    pub fn take(&mut self, handle: CacheHandle) -> Result<Option<C>, CacheError> {
        self.slots
            .get_mut(&handle)
            .map(|slot| slot.state.take())
            .ok_or(CacheError::InvalidHandle(handle))
    }

    /// Stores the state produced by the latest evaluation.
    pub fn update(&mut self, handle: CacheHandle, state: C) -> Result<(), CacheError> {
        let slot = self.slots.get_mut(&handle).ok_or(CacheError::InvalidHandle(handle))?;
        slot.state = Some(state);
        Ok(())
    }

    /// Frees the slot, returning whatever state it still held so the
    /// evaluator can dispose of it.
    pub fn release(&mut self, handle: CacheHandle) -> Result<Option<C>, CacheError> {
        self.slots
            .remove(&handle)
            .map(|slot| slot.state)
            .ok_or(CacheError::InvalidHandle(handle))
    }

    /// Frees every slot still allocated, in no particular order.
    pub fn release_all(&mut self) -> Vec<(CacheHandle, Option<C>)> {
        self.slots
            .drain()
            .map(|(handle, slot)| (handle, slot.state))
            .collect()
    }

    /// The request a live handle was allocated for.
    pub fn owner(&self, handle: CacheHandle) -> Option<RequestId> {
        self.slots.get(&handle).map(|slot| slot.owner)
    }

    pub fn contains(&self, handle: CacheHandle) -> bool {
        self.slots.contains_key(&handle)
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
