// SPDX-FileCopyrightText: 2025 nvn-rs contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Backing store of the software GPU.
//!
//! Every physical memory pool owns one region of the device's physical
//! address space. A region holds the bytes the GPU sees and, for CPU-cached
//! pools, a separate CPU cache image. Nothing keeps the two images coherent:
//! CPU writes land in the cache image until flushed, and GPU writes are only
//! visible to CPU reads after an invalidate.

use std::collections::{BTreeMap, HashMap};

use nvn_common::{GpuVAddr, PhysAddr, PAGE_SIZE_U64, VIRTUAL_PAGE_SIZE};

use crate::memory_manager::{GpuMemoryManager, StorageClass};

/// Physical addresses start above zero so a zero address is never valid.
const FIRST_PHYS_ADDR: PhysAddr = 0x1_0000_0000;

struct Region {
    /// Bytes as seen by the GPU (and by uncached CPU access).
    memory: Vec<u8>,
    /// CPU cache image for CPU-cached pools.
    cpu_cache: Option<Vec<u8>>,
}

/// Device physical memory: a set of regions keyed by base address.
pub struct PhysicalMemory {
    regions: BTreeMap<PhysAddr, Region>,
    next_base: PhysAddr,
}

impl PhysicalMemory {
    pub fn new() -> Self {
        Self {
            regions: BTreeMap::new(),
            next_base: FIRST_PHYS_ADDR,
        }
    }

    /// Adopt `storage` as a new region and return its base address.
    pub fn allocate(&mut self, storage: Vec<u8>, cpu_cached: bool) -> PhysAddr {
        let base = self.next_base;
        let size = storage.len() as u64;
        // Keep regions on virtual-page boundaries so 64 KiB mappings never
        // straddle two regions.
        let stride = size.div_ceil(VIRTUAL_PAGE_SIZE).max(1) * VIRTUAL_PAGE_SIZE;
        self.next_base += stride + VIRTUAL_PAGE_SIZE;

        let cpu_cache = cpu_cached.then(|| storage.clone());
        self.regions.insert(
            base,
            Region {
                memory: storage,
                cpu_cache,
            },
        );
        log::trace!("phys: allocate PA 0x{:X} size 0x{:X} cached={}", base, size, cpu_cached);
        base
    }

    /// Release a region. Returns its storage.
    pub fn release(&mut self, base: PhysAddr) -> Option<Vec<u8>> {
        self.regions.remove(&base).map(|r| r.memory)
    }

    fn locate(&self, pa: PhysAddr, len: usize) -> Option<(&Region, usize)> {
        let (&base, region) = self.regions.range(..=pa).next_back()?;
        let offset = (pa - base) as usize;
        (offset + len <= region.memory.len()).then_some((region, offset))
    }

    fn locate_mut(&mut self, pa: PhysAddr, len: usize) -> Option<(&mut Region, usize)> {
        let (&base, region) = self.regions.range_mut(..=pa).next_back()?;
        let offset = (pa - base) as usize;
        (offset + len <= region.memory.len()).then_some((region, offset))
    }

    /// Read GPU-visible bytes.
    pub fn read(&self, pa: PhysAddr, dst: &mut [u8]) -> bool {
        match self.locate(pa, dst.len()) {
            Some((region, offset)) => {
                dst.copy_from_slice(&region.memory[offset..offset + dst.len()]);
                true
            }
            None => false,
        }
    }

    /// Write GPU-visible bytes. The CPU cache image is left stale.
    pub fn write(&mut self, pa: PhysAddr, src: &[u8]) -> bool {
        match self.locate_mut(pa, src.len()) {
            Some((region, offset)) => {
                region.memory[offset..offset + src.len()].copy_from_slice(src);
                true
            }
            None => false,
        }
    }

    /// Driver write: lands in GPU-visible memory and in the CPU cache image.
    pub fn write_coherent(&mut self, pa: PhysAddr, src: &[u8]) -> bool {
        match self.locate_mut(pa, src.len()) {
            Some((region, offset)) => {
                region.memory[offset..offset + src.len()].copy_from_slice(src);
                if let Some(cache) = &mut region.cpu_cache {
                    cache[offset..offset + src.len()].copy_from_slice(src);
                }
                true
            }
            None => false,
        }
    }

    /// CPU read through the pool mapping.
    pub fn cpu_read(&self, pa: PhysAddr, dst: &mut [u8]) -> bool {
        match self.locate(pa, dst.len()) {
            Some((region, offset)) => {
                let image = region.cpu_cache.as_ref().unwrap_or(&region.memory);
                dst.copy_from_slice(&image[offset..offset + dst.len()]);
                true
            }
            None => false,
        }
    }

    /// CPU write through the pool mapping.
    pub fn cpu_write(&mut self, pa: PhysAddr, src: &[u8]) -> bool {
        match self.locate_mut(pa, src.len()) {
            Some((region, offset)) => {
                let image = match &mut region.cpu_cache {
                    Some(cache) => cache,
                    None => &mut region.memory,
                };
                image[offset..offset + src.len()].copy_from_slice(src);
                true
            }
            None => false,
        }
    }

    /// Push CPU cache contents of a range to memory.
    pub fn flush(&mut self, pa: PhysAddr, len: usize) -> bool {
        match self.locate_mut(pa, len) {
            Some((region, offset)) => {
                if let Some(cache) = &region.cpu_cache {
                    region.memory[offset..offset + len].copy_from_slice(&cache[offset..offset + len]);
                }
                true
            }
            None => false,
        }
    }

    /// Pull memory contents of a range into the CPU cache.
    pub fn invalidate(&mut self, pa: PhysAddr, len: usize) -> bool {
        match self.locate_mut(pa, len) {
            Some((region, offset)) => {
                if let Some(cache) = &mut region.cpu_cache {
                    cache[offset..offset + len].copy_from_slice(&region.memory[offset..offset + len]);
                }
                true
            }
            None => false,
        }
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }
}

impl Default for PhysicalMemory {
    fn default() -> Self {
        Self::new()
    }
}

/// Address space + physical memory, guarded together by the device.
pub struct GpuMemory {
    pub mm: GpuMemoryManager,
    pub phys: PhysicalMemory,
    /// Storage class currently bound to each physical virtual-page region,
    /// with the number of virtual pages mapping it.
    class_bindings: HashMap<PhysAddr, (StorageClass, u32)>,
}

impl GpuMemory {
    pub fn new() -> Self {
        Self {
            mm: GpuMemoryManager::new(),
            phys: PhysicalMemory::new(),
            class_bindings: HashMap::new(),
        }
    }

    /// Read through the GPU address space. Returns the faulting VA.
    pub fn gpu_read(&self, gpu_va: GpuVAddr, dst: &mut [u8]) -> Result<(), GpuVAddr> {
        let phys = &self.phys;
        self.mm.read(gpu_va, dst, &|pa, buf| phys.read(pa, buf))
    }

    /// Write through the GPU address space. Returns the faulting VA.
    pub fn gpu_write(&mut self, gpu_va: GpuVAddr, src: &[u8]) -> Result<(), GpuVAddr> {
        let phys = &mut self.phys;
        self.mm.write(gpu_va, src, &mut |pa, buf| phys.write(pa, buf))
    }

    /// Driver write through the GPU address space, keeping the CPU cache
    /// image in step.
    pub fn write_coherent(&mut self, gpu_va: GpuVAddr, src: &[u8]) -> Result<(), GpuVAddr> {
        let phys = &mut self.phys;
        self.mm.write(gpu_va, src, &mut |pa, buf| phys.write_coherent(pa, buf))
    }

    pub fn gpu_read_u32(&self, gpu_va: GpuVAddr) -> Result<u32, GpuVAddr> {
        let mut buf = [0u8; 4];
        self.gpu_read(gpu_va, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Bind a physical virtual-page region to `class`, or bump its use count
    /// when it already carries that class. Fails if the region is in use
    /// with a different class.
    pub fn bind_class(&mut self, phys_page: PhysAddr, class: StorageClass) -> Result<(), StorageClass> {
        match self.class_bindings.get_mut(&phys_page) {
            Some((existing, count)) if *existing == class => {
                *count += 1;
                Ok(())
            }
            Some((existing, _)) => Err(*existing),
            None => {
                self.class_bindings.insert(phys_page, (class, 1));
                Ok(())
            }
        }
    }

    pub fn unbind_class(&mut self, phys_page: PhysAddr) {
        if let Some((_, count)) = self.class_bindings.get_mut(&phys_page) {
            *count -= 1;
            if *count == 0 {
                self.class_bindings.remove(&phys_page);
            }
        }
    }

    /// Storage class a physical region is currently bound to.
    pub fn bound_class(&self, phys_page: PhysAddr) -> Option<StorageClass> {
        self.class_bindings.get(&phys_page).map(|(class, _)| *class)
    }
}

impl Default for GpuMemory {
    fn default() -> Self {
        Self::new()
    }
}

/// Round a size up to whole pages.
pub(crate) fn page_round(size: u64) -> u64 {
    size.div_ceil(PAGE_SIZE_U64) * PAGE_SIZE_U64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_distinct_regions() {
        let mut phys = PhysicalMemory::new();
        let a = phys.allocate(vec![0; 0x1000], false);
        let b = phys.allocate(vec![0; 0x1000], false);
        assert_ne!(a, b);
        assert_eq!(a % VIRTUAL_PAGE_SIZE, 0);
        assert_eq!(b % VIRTUAL_PAGE_SIZE, 0);
        assert_eq!(phys.region_count(), 2);
        assert!(phys.release(a).is_some());
        assert_eq!(phys.region_count(), 1);
    }

    #[test]
    fn test_out_of_region_access_fails() {
        let mut phys = PhysicalMemory::new();
        let base = phys.allocate(vec![0; 0x1000], false);
        let mut buf = [0u8; 8];
        assert!(!phys.read(base + 0xFFC, &mut buf));
        assert!(!phys.read(base - 1, &mut buf));
        assert!(phys.read(base + 0xFF8, &mut buf));
    }

    #[test]
    fn test_uncached_cpu_write_visible_to_gpu() {
        let mut phys = PhysicalMemory::new();
        let base = phys.allocate(vec![0; 0x1000], false);
        assert!(phys.cpu_write(base + 8, &[1, 2, 3, 4]));
        let mut buf = [0u8; 4];
        assert!(phys.read(base + 8, &mut buf));
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn test_cached_cpu_write_needs_flush() {
        let mut phys = PhysicalMemory::new();
        let base = phys.allocate(vec![0; 0x1000], true);
        phys.cpu_write(base, &[0xAA; 4]);

        let mut buf = [0u8; 4];
        phys.read(base, &mut buf);
        assert_eq!(buf, [0; 4]);

        phys.flush(base, 4);
        phys.read(base, &mut buf);
        assert_eq!(buf, [0xAA; 4]);
    }

    #[test]
    fn test_cached_gpu_write_needs_invalidate() {
        let mut phys = PhysicalMemory::new();
        let base = phys.allocate(vec![0; 0x1000], true);
        phys.write(base + 16, &[0x55; 4]);

        let mut buf = [0u8; 4];
        phys.cpu_read(base + 16, &mut buf);
        assert_eq!(buf, [0; 4]);

        phys.invalidate(base + 16, 4);
        phys.cpu_read(base + 16, &mut buf);
        assert_eq!(buf, [0x55; 4]);
    }

    #[test]
    fn test_coherent_write_updates_both_images() {
        let mut phys = PhysicalMemory::new();
        let base = phys.allocate(vec![0; 0x1000], true);
        phys.write_coherent(base, &[7; 4]);
        let mut gpu = [0u8; 4];
        let mut cpu = [0u8; 4];
        phys.read(base, &mut gpu);
        phys.cpu_read(base, &mut cpu);
        assert_eq!(gpu, [7; 4]);
        assert_eq!(cpu, [7; 4]);
    }

    #[test]
    fn test_gpu_read_write_through_address_space() {
        let mut mem = GpuMemory::new();
        let base = mem.phys.allocate(vec![0; 0x2000], false);
        let va = mem.mm.alloc_any(base, 0x2000, StorageClass::BUFFER);

        mem.gpu_write(va + 0xFFE, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        mem.gpu_read(va + 0xFFE, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);

        assert_eq!(mem.gpu_read(va + 0x2000, &mut buf), Err(va + 0x2000));
    }

    #[test]
    fn test_class_binding_conflicts() {
        let mut mem = GpuMemory::new();
        assert!(mem.bind_class(0x10000, StorageClass::BUFFER).is_ok());
        assert!(mem.bind_class(0x10000, StorageClass::BUFFER).is_ok());
        assert_eq!(mem.bind_class(0x10000, StorageClass::TEXTURE), Err(StorageClass::BUFFER));

        mem.unbind_class(0x10000);
        mem.unbind_class(0x10000);
        assert_eq!(mem.bound_class(0x10000), None);
        assert!(mem.bind_class(0x10000, StorageClass::TEXTURE).is_ok());
    }

    #[test]
    fn test_page_round() {
        assert_eq!(page_round(1), PAGE_SIZE_U64);
        assert_eq!(page_round(PAGE_SIZE_U64), PAGE_SIZE_U64);
    }
}
