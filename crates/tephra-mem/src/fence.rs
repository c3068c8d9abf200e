//! # Fence Manager
//!
//! Pool of reusable host-side completion signals.
//!
//! A fence waits for one submission sequence and signals once the completed
//! value has moved past it, the same rule the deferred deletion queue
//! applies. Released fences go back on a free list; a [`FenceId`] carries
//! the slot generation so a stale id cannot observe or release the fence's
//! next user.

use alloc::vec::Vec;

use spin::Mutex;

use tephra_core::{Error, Handle, Result};

/// Marker for fence handles
#[derive(Debug)]
pub enum FenceMarker {}

/// Fence handle
pub type FenceId = Handle<FenceMarker>;

fn encode(index: u32, generation: u32) -> FenceId {
    FenceId::new((u64::from(generation) << 32) | u64::from(index))
}

fn decode(id: FenceId) -> (usize, u32) {
    ((id.id() & 0xFFFF_FFFF) as usize, (id.id() >> 32) as u32)
}

#[derive(Debug, Clone, Copy)]
struct FenceSlot {
    generation: u32,
    target: u64,
    in_use: bool,
    reported: bool,
}

/// Fence counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FenceStats {
    /// Fences ever created
    pub created: u64,
    /// Fences currently acquired
    pub in_use: usize,
    /// Fences on the free list
    pub free: usize,
    /// Acquisitions served from the free list
    pub reused: u64,
}

#[derive(Debug, Default)]
struct FenceState {
    slots: Vec<FenceSlot>,
    free: Vec<u32>,
    created: u64,
    reused: u64,
}

impl FenceState {
    fn slot(&self, id: FenceId) -> Result<&FenceSlot> {
        let (index, generation) = decode(id);
        match self.slots.get(index) {
            Some(slot) if slot.in_use && slot.generation == generation => Ok(slot),
            _ => Err(Error::NotFound),
        }
    }
}

/// Reusable completion signals
#[derive(Debug, Default)]
pub struct FenceManager {
    state: Mutex<FenceState>,
}

impl FenceManager {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Fence that signals once the completed value exceeds `target`
    pub fn acquire(&self, target: u64) -> FenceId {
        let mut state = self.state.lock();
        if let Some(index) = state.free.pop() {
            state.reused += 1;
            let slot = &mut state.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.target = target;
            slot.in_use = true;
            slot.reported = false;
            return encode(index, slot.generation);
        }

        let index = state.slots.len() as u32;
        state.slots.push(FenceSlot {
            generation: 0,
            target,
            in_use: true,
            reported: false,
        });
        state.created += 1;
        encode(index, 0)
    }

    /// Timeline value a fence waits for
    pub fn target(&self, id: FenceId) -> Result<u64> {
        self.state.lock().slot(id).map(|slot| slot.target)
    }

    /// Check if a fence has signaled
    pub fn is_signaled(&self, id: FenceId, completed: u64) -> Result<bool> {
        self.state.lock().slot(id).map(|slot| completed > slot.target)
    }

    /// Return a fence to the pool
    pub fn release(&self, id: FenceId) -> Result<()> {
        let mut state = self.state.lock();
        state.slot(id)?;
        let (index, _) = decode(id);
        state.slots[index].in_use = false;
        state.free.push(index as u32);
        Ok(())
    }

    /// Fences that signaled since the last poll
    pub fn poll(&self, completed: u64) -> Vec<FenceId> {
        let mut state = self.state.lock();
        state
            .slots
            .iter_mut()
            .enumerate()
            .filter(|(_, slot)| slot.in_use && !slot.reported && completed > slot.target)
            .map(|(index, slot)| {
                slot.reported = true;
                encode(index as u32, slot.generation)
            })
            .collect()
    }

    /// Counters
    pub fn stats(&self) -> FenceStats {
        let state = self.state.lock();
        FenceStats {
            created: state.created,
            in_use: state.slots.len() - state.free.len(),
            free: state.free.len(),
            reused: state.reused,
        }
    }
}
