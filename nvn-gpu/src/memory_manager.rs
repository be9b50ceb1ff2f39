// SPDX-FileCopyrightText: 2025 nvn-rs contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! GPU virtual address space manager.
//!
//! Maps GPU virtual addresses (40-bit, 1 TiB) to device physical addresses
//! using a 2-level page table with 4 KB pages. Each entry also carries the
//! storage class the page was mapped with, so the cache/compression hardware
//! knows how to interpret the bytes behind it.
//!
//! Layout: `[L0: 14 bits][L1: 14 bits][Offset: 12 bits]` = 40 bits total.
//! Entry: `[physical page address: 52 bits][unused: 4 bits][storage class: 8 bits]`.

use nvn_common::{GpuVAddr, PhysAddr};

const PAGE_BITS: u32 = 12;
const PAGE_SIZE: u64 = 1 << PAGE_BITS;
const L1_BITS: u32 = 14;
const L0_BITS: u32 = 14;
const L1_SIZE: usize = 1 << L1_BITS; // 16384 entries per L1 table

/// Sentinel for unmapped pages.
const INVALID_ENTRY: u64 = u64::MAX;

const CLASS_MASK: u64 = 0xFF;

/// Total GPU address space: 40 bits = 1 TiB.
pub const GPU_VA_BITS: u32 = L0_BITS + L1_BITS + PAGE_BITS;
pub const GPU_VA_SIZE: u64 = 1 << GPU_VA_BITS;

/// First GPU VA handed out; the low 64 MB stay unmapped so null-ish
/// addresses always fault.
const FIRST_ALLOC_VA: u64 = 0x0400_0000;

/// How the GPU's cache and compression hardware interprets a mapped page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageClass(pub u8);

impl StorageClass {
    /// Not mapped / no interpretation.
    pub const NONE: Self = Self(0);
    /// Linear buffer data (vertex, index, uniform, copy sources...).
    pub const BUFFER: Self = Self(1);
    /// Texture data in the generic block-linear layout.
    pub const TEXTURE: Self = Self(2);
    /// Texture data eligible for framebuffer compression.
    pub const TEXTURE_COMPRESSED: Self = Self(3);

    pub fn is_texture(self) -> bool {
        matches!(self, Self::TEXTURE | Self::TEXTURE_COMPRESSED)
    }
}

/// GPU virtual memory manager with a 2-level page table.
pub struct GpuMemoryManager {
    /// L0 table: each entry is an optional L1 page table.
    page_table: Vec<Option<Box<[u64; L1_SIZE]>>>,
    /// Next free GPU VA for bump allocation.
    next_alloc: u64,
}

impl GpuMemoryManager {
    pub fn new() -> Self {
        let l0_size = 1 << L0_BITS;
        let mut page_table = Vec::with_capacity(l0_size);
        for _ in 0..l0_size {
            page_table.push(None);
        }
        Self {
            page_table,
            next_alloc: FIRST_ALLOC_VA,
        }
    }

    /// Map a contiguous range of GPU VA to physical addresses.
    pub fn map(&mut self, gpu_va: GpuVAddr, phys: PhysAddr, size: u64, class: StorageClass) {
        let mut offset = 0u64;
        while offset < size {
            self.set_entry(gpu_va + offset, Some((phys + offset, class)));
            offset += PAGE_SIZE;
        }
        log::trace!(
            "gpu_mm: map GPU 0x{:X}..0x{:X} -> PA 0x{:X} class={}",
            gpu_va,
            gpu_va + size,
            phys,
            class.0
        );
    }

    /// Unmap a contiguous GPU VA range.
    pub fn unmap(&mut self, gpu_va: GpuVAddr, size: u64) {
        let mut offset = 0u64;
        while offset < size {
            self.set_entry(gpu_va + offset, None);
            offset += PAGE_SIZE;
        }
        log::trace!("gpu_mm: unmap GPU 0x{:X}..0x{:X}", gpu_va, gpu_va + size);
    }

    /// Translate a GPU VA to a physical address.
    /// Returns `None` if the page is not mapped.
    pub fn translate(&self, gpu_va: GpuVAddr) -> Option<PhysAddr> {
        let page_offset = gpu_va & (PAGE_SIZE - 1);
        let entry = self.get_entry(gpu_va);
        if entry == INVALID_ENTRY {
            None
        } else {
            Some((entry & !(PAGE_SIZE - 1)) + page_offset)
        }
    }

    /// Storage class of the page containing `gpu_va`, if mapped.
    pub fn storage_class(&self, gpu_va: GpuVAddr) -> Option<StorageClass> {
        let entry = self.get_entry(gpu_va);
        if entry == INVALID_ENTRY {
            None
        } else {
            Some(StorageClass((entry & CLASS_MASK) as u8))
        }
    }

    /// Whether every page of `[gpu_va, gpu_va + size)` is mapped.
    pub fn is_range_mapped(&self, gpu_va: GpuVAddr, size: u64) -> bool {
        if size == 0 {
            return self.translate(gpu_va).is_some();
        }
        let Some(end) = gpu_va.checked_add(size) else {
            return false;
        };
        if end > GPU_VA_SIZE {
            return false;
        }
        let mut page = gpu_va & !(PAGE_SIZE - 1);
        while page < end {
            if self.translate(page).is_none() {
                return false;
            }
            page += PAGE_SIZE;
        }
        true
    }

    /// Reserve `size` bytes of GPU VA (rounded up to whole pages) aligned to
    /// `alignment`, without mapping anything.
    pub fn reserve(&mut self, size: u64, alignment: u64) -> GpuVAddr {
        let alignment = alignment.max(PAGE_SIZE);
        let aligned_size = (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let gpu_va = (self.next_alloc + alignment - 1) & !(alignment - 1);
        self.next_alloc = gpu_va + aligned_size;
        gpu_va
    }

    /// Reserve GPU VA and map it to a physical range in one step.
    pub fn alloc_any(&mut self, phys: PhysAddr, size: u64, class: StorageClass) -> GpuVAddr {
        let gpu_va = self.reserve(size, PAGE_SIZE);
        let aligned_size = (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        self.map(gpu_va, phys, aligned_size, class);
        gpu_va
    }

    /// Read bytes from GPU VA space using a physical memory reader.
    ///
    /// Returns the first unmapped GPU VA on failure; bytes before it have
    /// already been copied into `dst`.
    pub fn read(
        &self,
        gpu_va: GpuVAddr,
        dst: &mut [u8],
        read_phys: &dyn Fn(PhysAddr, &mut [u8]) -> bool,
    ) -> Result<(), GpuVAddr> {
        let mut offset = 0usize;
        while offset < dst.len() {
            let va = gpu_va + offset as u64;
            let page_off = (va & (PAGE_SIZE - 1)) as usize;
            let chunk_size = std::cmp::min(dst.len() - offset, PAGE_SIZE as usize - page_off);

            match self.translate(va) {
                Some(pa) if read_phys(pa, &mut dst[offset..offset + chunk_size]) => {}
                _ => return Err(va),
            }
            offset += chunk_size;
        }
        Ok(())
    }

    /// Write bytes to GPU VA space using a physical memory writer.
    ///
    /// Returns the first unmapped GPU VA on failure.
    pub fn write(
        &self,
        gpu_va: GpuVAddr,
        src: &[u8],
        write_phys: &mut dyn FnMut(PhysAddr, &[u8]) -> bool,
    ) -> Result<(), GpuVAddr> {
        let mut offset = 0usize;
        while offset < src.len() {
            let va = gpu_va + offset as u64;
            let page_off = (va & (PAGE_SIZE - 1)) as usize;
            let chunk_size = std::cmp::min(src.len() - offset, PAGE_SIZE as usize - page_off);
            match self.translate(va) {
                Some(pa) if write_phys(pa, &src[offset..offset + chunk_size]) => {}
                _ => return Err(va),
            }
            offset += chunk_size;
        }
        Ok(())
    }

    // ── Internal helpers ─────────────────────────────────────────────────

    fn l0_index(gpu_va: u64) -> usize {
        ((gpu_va >> (L1_BITS + PAGE_BITS)) & ((1 << L0_BITS) - 1)) as usize
    }

    fn l1_index(gpu_va: u64) -> usize {
        ((gpu_va >> PAGE_BITS) & ((1 << L1_BITS) - 1)) as usize
    }

    fn set_entry(&mut self, gpu_va: u64, target: Option<(PhysAddr, StorageClass)>) {
        let l0 = Self::l0_index(gpu_va);
        let l1 = Self::l1_index(gpu_va);

        let table = match (&mut self.page_table[l0], target) {
            // No L1 table and we're unmapping: nothing to do.
            (None, None) => return,
            (slot, _) => slot.get_or_insert_with(|| Box::new([INVALID_ENTRY; L1_SIZE])),
        };

        table[l1] = match target {
            Some((pa, class)) => (pa & !(PAGE_SIZE - 1)) | class.0 as u64,
            None => INVALID_ENTRY,
        };
    }

    fn get_entry(&self, gpu_va: u64) -> u64 {
        if gpu_va >= GPU_VA_SIZE {
            return INVALID_ENTRY;
        }
        let l0 = Self::l0_index(gpu_va);
        let l1 = Self::l1_index(gpu_va);

        match &self.page_table[l0] {
            Some(table) => table[l1],
            None => INVALID_ENTRY,
        }
    }
}

impl Default for GpuMemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_and_translate() {
        let mut mm = GpuMemoryManager::new();
        mm.map(0x1000, 0xDEAD_0000, 0x2000, StorageClass::BUFFER);

        assert_eq!(mm.translate(0x1000), Some(0xDEAD_0000));
        assert_eq!(mm.translate(0x1500), Some(0xDEAD_0500));
        assert_eq!(mm.translate(0x2000), Some(0xDEAD_1000));
        assert_eq!(mm.translate(0x2FFF), Some(0xDEAD_1FFF));
    }

    #[test]
    fn test_storage_class_stored_per_page() {
        let mut mm = GpuMemoryManager::new();
        mm.map(0x1000, 0xA000, 0x1000, StorageClass::BUFFER);
        mm.map(0x2000, 0xB000, 0x1000, StorageClass::TEXTURE);

        assert_eq!(mm.storage_class(0x1800), Some(StorageClass::BUFFER));
        assert_eq!(mm.storage_class(0x2000), Some(StorageClass::TEXTURE));
        assert_eq!(mm.storage_class(0x3000), None);
        // The class bits never leak into the translated address.
        assert_eq!(mm.translate(0x2004), Some(0xB004));
    }

    #[test]
    fn test_unmapped_returns_none() {
        let mm = GpuMemoryManager::new();
        assert_eq!(mm.translate(0x1000), None);
        assert_eq!(mm.translate(0), None);
        assert_eq!(mm.translate(GPU_VA_SIZE + 0x1000), None);
    }

    #[test]
    fn test_unmap() {
        let mut mm = GpuMemoryManager::new();
        mm.map(0x1000, 0xBEEF_0000, 0x1000, StorageClass::BUFFER);
        assert_eq!(mm.translate(0x1000), Some(0xBEEF_0000));

        mm.unmap(0x1000, 0x1000);
        assert_eq!(mm.translate(0x1000), None);
    }

    #[test]
    fn test_alloc_any() {
        let mut mm = GpuMemoryManager::new();
        let va1 = mm.alloc_any(0xAAAA_0000, 0x3000, StorageClass::BUFFER);
        let va2 = mm.alloc_any(0xBBBB_0000, 0x1000, StorageClass::BUFFER);

        assert_eq!(va1, FIRST_ALLOC_VA);
        assert_eq!(va2, va1 + 0x3000);

        assert_eq!(mm.translate(va1), Some(0xAAAA_0000));
        assert_eq!(mm.translate(va2), Some(0xBBBB_0000));
    }

    #[test]
    fn test_reserve_alignment() {
        let mut mm = GpuMemoryManager::new();
        mm.reserve(0x1000, 0x1000);
        let va = mm.reserve(0x2_0000, 0x1_0000);
        assert_eq!(va % 0x1_0000, 0);
        assert_eq!(mm.translate(va), None);
    }

    #[test]
    fn test_is_range_mapped() {
        let mut mm = GpuMemoryManager::new();
        mm.map(0x1000, 0xA000, 0x2000, StorageClass::BUFFER);
        assert!(mm.is_range_mapped(0x1000, 0x2000));
        assert!(mm.is_range_mapped(0x1FF0, 0x20));
        assert!(!mm.is_range_mapped(0x1000, 0x2001));
        assert!(!mm.is_range_mapped(u64::MAX - 4, 8));
    }

    #[test]
    fn test_read_via_callback() {
        let mut mm = GpuMemoryManager::new();
        mm.map(0x1000, 0x8000_0000, 0x1000, StorageClass::BUFFER);

        let mut buf = [0u8; 4];
        let result = mm.read(0x1000, &mut buf, &|addr, dst| {
            let bytes = (addr as u32).to_le_bytes();
            let len = dst.len().min(bytes.len());
            dst[..len].copy_from_slice(&bytes[..len]);
            true
        });

        assert!(result.is_ok());
        assert_eq!(u32::from_le_bytes(buf), 0x8000_0000);
    }

    #[test]
    fn test_read_unmapped_reports_address() {
        let mut mm = GpuMemoryManager::new();
        mm.map(0x1000, 0x8000_0000, 0x1000, StorageClass::BUFFER);

        let mut buf = [0u8; 8];
        let result = mm.read(0x1FFC, &mut buf, &|_, dst| {
            dst.fill(0xAB);
            true
        });
        assert_eq!(result, Err(0x2000));
        assert_eq!(&buf[..4], &[0xAB; 4]);
    }

    #[test]
    fn test_write_cross_page() {
        let mut mm = GpuMemoryManager::new();
        // Map two consecutive pages to different physical addresses.
        mm.map(0x1000, 0xA000_0000, 0x1000, StorageClass::BUFFER);
        mm.map(0x2000, 0xB000_0000, 0x1000, StorageClass::BUFFER);

        let mut written: Vec<(u64, Vec<u8>)> = Vec::new();
        let data = [1, 2, 3, 4, 5, 6, 7, 8];
        let result = mm.write(0x1FFC, &data, &mut |addr, src| {
            written.push((addr, src.to_vec()));
            true
        });

        assert!(result.is_ok());
        assert_eq!(written.len(), 2);
        assert_eq!(written[0].0, 0xA000_0FFC);
        assert_eq!(written[0].1, vec![1, 2, 3, 4]);
        assert_eq!(written[1].0, 0xB000_0000);
        assert_eq!(written[1].1, vec![5, 6, 7, 8]);
    }
}
