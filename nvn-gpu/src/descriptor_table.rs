// SPDX-FileCopyrightText: 2025 nvn-rs contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! GPU-side descriptor cache.
//!
//! The 3D engine reads texture and sampler descriptors through one table per
//! pool kind. The first read of an index fetches the record from GPU memory;
//! later reads are served from the cache even if memory has since been
//! rewritten. The cache is dropped when a different pool is bound
//! ([`DescriptorTable::synchronize`]) or on an explicit
//! [`DescriptorTable::invalidate`].

use nvn_common::GpuVAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableReadError {
    /// No pool bound.
    Unbound,
    /// Index beyond the bound pool's capacity.
    OutOfRange(u32),
    /// The descriptor's address is not mapped.
    Unmapped(GpuVAddr),
}

pub struct DescriptorTable<const ENTRY_SIZE: usize> {
    gpu_addr: GpuVAddr,
    count: u32,
    /// Bitset of cached indices, 64 per word.
    cached: Vec<u64>,
    entries: Vec<[u8; ENTRY_SIZE]>,
}

impl<const ENTRY_SIZE: usize> Default for DescriptorTable<ENTRY_SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const ENTRY_SIZE: usize> DescriptorTable<ENTRY_SIZE> {
    pub fn new() -> Self {
        Self {
            gpu_addr: 0,
            count: 0,
            cached: Vec::new(),
            entries: Vec::new(),
        }
    }

    /// Bind the pool at `gpu_addr` holding `count` entries. Returns `true`
    /// if the binding changed, which drops every cached entry.
    pub fn synchronize(&mut self, gpu_addr: GpuVAddr, count: u32) -> bool {
        if gpu_addr == self.gpu_addr && count == self.count {
            return false;
        }
        self.gpu_addr = gpu_addr;
        self.count = count;
        self.entries = vec![[0u8; ENTRY_SIZE]; count as usize];
        self.cached = vec![0u64; (count as usize).div_ceil(64)];
        true
    }

    /// Read entry `index`, fetching it with `gpu_read` on a cache miss.
    pub fn read(
        &mut self,
        index: u32,
        gpu_read: &dyn Fn(GpuVAddr, &mut [u8]) -> Result<(), GpuVAddr>,
    ) -> Result<[u8; ENTRY_SIZE], TableReadError> {
        if !self.is_valid() {
            return Err(TableReadError::Unbound);
        }
        if index >= self.count {
            return Err(TableReadError::OutOfRange(index));
        }

        let word = (index / 64) as usize;
        let mask = 1u64 << (index % 64);
        if self.cached[word] & mask != 0 {
            return Ok(self.entries[index as usize]);
        }

        let gpu_va = self.gpu_addr + index as u64 * ENTRY_SIZE as u64;
        let mut buffer = [0u8; ENTRY_SIZE];
        gpu_read(gpu_va, &mut buffer).map_err(TableReadError::Unmapped)?;
        self.entries[index as usize] = buffer;
        self.cached[word] |= mask;
        Ok(buffer)
    }

    /// Drop every cached entry; the binding stays.
    pub fn invalidate(&mut self) {
        self.cached.fill(0);
    }

    pub fn gpu_addr(&self) -> GpuVAddr {
        self.gpu_addr
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_valid(&self) -> bool {
        self.gpu_addr != 0
    }
}

/// Texture descriptor cache.
pub type TextureTable = DescriptorTable<32>;

/// Sampler descriptor cache.
pub type SamplerTable = DescriptorTable<32>;
