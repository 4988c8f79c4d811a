// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A fixed-capacity slot allocator for native resources.
//!
//! Native layers need to hand out small, stable handles for things like open
//! files, directory iterators, or worker jobs, without allocating at run time.
//! A [`Pool`] is created with a fixed number of slots. [`Pool::reserve`]
//! moves a value into the first free slot and returns a [`Handle`] to it;
//! [`Pool::free`] gives the slot back and returns the value.
//!
//! Running out of slots is an error ([`PoolError::NoSpaceAvailable`]); the
//! pool never grows.
//!
//! # Handles
//!
//! A `Handle` remembers which pool it came from and which _generation_ of its
//! slot it refers to. Presenting a handle to the wrong pool, or presenting it
//! again after it was freed (even if the slot has since been reused), is
//! reported as [`PoolError::ItemNotFoundInPool`] rather than silently acting
//! on somebody else's item.
//!
//! # Sharing
//!
//! `Pool` is a plain data structure with `&mut self` operations. To share one
//! between tasks, put it in a mutex.

#![warn(
    elided_lifetimes_in_paths,
    explicit_outlives_requirements,
    missing_debug_implementations,
    missing_docs,
    semicolon_in_expressions_from_macros,
    single_use_lifetimes,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unsafe_op_in_unsafe_fn,
    unused_qualifications
)]

use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;

/// Reasons a pool operation can fail.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum PoolError {
    /// The pool was described with unusable parameters (zero capacity).
    #[error("invalid pool parameters")]
    ErrorInEntryParameters,
    /// Every slot is in use.
    #[error("no space available in pool")]
    NoSpaceAvailable,
    /// The handle does not name a live item of this pool, or no item matched.
    #[error("item not found in pool")]
    ItemNotFoundInPool,
}

impl PoolError {
    /// Native status code for this error. `0` means success.
    pub fn code(&self) -> i32 {
        match self {
            PoolError::ErrorInEntryParameters => 1,
            PoolError::NoSpaceAvailable => 2,
            PoolError::ItemNotFoundInPool => 3,
        }
    }
}

/// Shorthand for results of pool operations.
pub type Result<T> = core::result::Result<T, PoolError>;

/// Stable reference to an item reserved in a [`Pool`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Handle {
    pool: u32,
    index: u32,
    generation: u32,
}

impl Handle {
    /// Slot index of the item within its pool.
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Source of pool identities, so handles can't cross pools.
static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(1);

/// Fixed-capacity store of `T`.
#[derive(Debug)]
pub struct Pool<T> {
    id: u32,
    slots: Box<[Slot<T>]>,
    used: usize,
}

impl<T> Pool<T> {
    /// Creates an empty pool with room for `capacity` items.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 || u32::try_from(capacity).is_err() {
            return Err(PoolError::ErrorInEntryParameters);
        }
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                value: None,
            })
            .collect();
        Ok(Pool {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            slots,
            used: 0,
        })
    }

    /// Moves `value` into the first free slot.
    ///
    /// If the pool is full, fails with [`PoolError::NoSpaceAvailable`] and
    /// `value` is dropped.
    pub fn reserve(&mut self, value: T) -> Result<Handle> {
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| s.value.is_none())
            .ok_or(PoolError::NoSpaceAvailable)?;
        slot.value = Some(value);
        self.used += 1;
        log::trace!("pool {}: reserved slot {}", self.id, index);
        Ok(Handle {
            pool: self.id,
            // Capacity fits in u32, checked in `new`.
            index: index as u32,
            generation: slot.generation,
        })
    }

    /// Releases the slot named by `handle`, returning its value.
    pub fn free(&mut self, handle: Handle) -> Result<T> {
        let slot = self.slot_mut(handle)?;
        let value = slot.value.take().ok_or(PoolError::ItemNotFoundInPool)?;
        slot.generation = slot.generation.wrapping_add(1);
        self.used -= 1;
        log::trace!("pool {}: freed slot {}", self.id, handle.index);
        Ok(value)
    }

    /// Finds the first used item for which `matches` returns `true`.
    pub fn get(&self, mut matches: impl FnMut(&T) -> bool) -> Result<Handle> {
        self.iter()
            .find(|&(_, v)| matches(v))
            .map(|(h, _)| h)
            .ok_or(PoolError::ItemNotFoundInPool)
    }

    /// Borrows the item named by `handle`.
    pub fn get_ref(&self, handle: Handle) -> Result<&T> {
        if handle.pool != self.id {
            return Err(PoolError::ItemNotFoundInPool);
        }
        self.slots
            .get(handle.index())
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.value.as_ref())
            .ok_or(PoolError::ItemNotFoundInPool)
    }

    /// Mutably borrows the item named by `handle`.
    pub fn get_mut(&mut self, handle: Handle) -> Result<&mut T> {
        self.slot_mut(handle)?
            .value
            .as_mut()
            .ok_or(PoolError::ItemNotFoundInPool)
    }

    /// Iterates over used items in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> + '_ {
        let id = self.id;
        self.slots.iter().enumerate().filter_map(move |(i, s)| {
            s.value.as_ref().map(|v| {
                (
                    Handle {
                        pool: id,
                        index: i as u32,
                        generation: s.generation,
                    },
                    v,
                )
            })
        })
    }

    /// Number of used slots.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Checks whether every slot is in use.
    pub fn is_full(&self) -> bool {
        self.used == self.slots.len()
    }

    fn slot_mut(&mut self, handle: Handle) -> Result<&mut Slot<T>> {
        if handle.pool != self.id {
            return Err(PoolError::ItemNotFoundInPool);
        }
        self.slots
            .get_mut(handle.index())
            .filter(|s| s.generation == handle.generation)
            .ok_or(PoolError::ItemNotFoundInPool)
    }
}
