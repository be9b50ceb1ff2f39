// SPDX-FileCopyrightText: 2025 nvn-rs contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Events: 32-bit counters in pool memory that both the CPU and queued GPU
//! work can signal and wait on.

use nvn_common::GpuVAddr;
use thiserror::Error;

use crate::finalize::Retire;
use crate::memory_pool::{MemoryPool, MemoryPoolError, PoolRef};

/// Size of the counter an event occupies.
pub const EVENT_SIZE: u64 = 4;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("event offset 0x{0:X} is not 4-byte aligned")]
    Misaligned(u64),
    #[error("event pool is not GPU accessible")]
    NoGpuAddress,
    #[error(transparent)]
    Pool(#[from] MemoryPoolError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EventSignalMode {
    Write = 0,
    Add = 1,
}

impl EventSignalMode {
    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Write),
            1 => Some(Self::Add),
            _ => None,
        }
    }

    pub(crate) fn apply(self, current: u32, value: u32) -> u32 {
        match self {
            Self::Write => value,
            Self::Add => current.wrapping_add(value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EventWaitMode {
    Equal = 0,
    /// Passes once the counter is at or past the target, modulo 2^32.
    GreaterOrEqualWrap = 1,
}

impl EventWaitMode {
    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Equal),
            1 => Some(Self::GreaterOrEqualWrap),
            _ => None,
        }
    }

    /// Whether a counter value `current` satisfies a wait for `target`.
    pub fn passes(self, current: u32, target: u32) -> bool {
        match self {
            Self::Equal => current == target,
            Self::GreaterOrEqualWrap => current.wrapping_sub(target) < 0x8000_0000,
        }
    }
}

/// Pipeline stage after which a GPU signal is performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EventSignalLocation {
    Top = 0,
    VertexPipe = 1,
    /// After all prior work, including its memory writes.
    Bottom = 2,
}

impl EventSignalLocation {
    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Top),
            1 => Some(Self::VertexPipe),
            2 => Some(Self::Bottom),
            _ => None,
        }
    }
}

pub struct Event {
    pool: PoolRef,
    offset: u64,
    address: GpuVAddr,
}

impl Event {
    pub fn new(pool: &MemoryPool, offset: u64) -> Result<Self, EventError> {
        if offset % EVENT_SIZE != 0 {
            return Err(EventError::Misaligned(offset));
        }
        let pool = pool.reference();
        pool.check_range(offset, EVENT_SIZE)?;
        let base = pool.gpu_address().ok_or(EventError::NoGpuAddress)?;
        Ok(Self {
            pool,
            offset,
            address: base + offset,
        })
    }

    /// Signal from the CPU. Visible to GPU waits immediately.
    pub fn signal(&self, mode: EventSignalMode, value: u32) -> Result<(), EventError> {
        let shared = &self.pool.device().shared;
        let next = {
            let mut mem = shared.memory.write();
            let current = mem.gpu_read_u32(self.address).map_err(|_| EventError::NoGpuAddress)?;
            let next = mode.apply(current, value);
            mem.write_coherent(self.address, &next.to_le_bytes())
                .map_err(|_| EventError::NoGpuAddress)?;
            next
        };
        shared.bump_epoch();
        log::trace!("event: CPU signal @0x{:X} -> {}", self.address, next);
        Ok(())
    }

    pub fn get_value(&self) -> Result<u32, EventError> {
        self.pool
            .device()
            .shared
            .memory
            .read()
            .gpu_read_u32(self.address)
            .map_err(|_| EventError::NoGpuAddress)
    }

    pub fn address(&self) -> GpuVAddr {
        self.address
    }

    pub fn pool_offset(&self) -> u64 {
        self.offset
    }

    pub(crate) fn pool(&self) -> &PoolRef {
        &self.pool
    }
}

impl Retire for Event {}
