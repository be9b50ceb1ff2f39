// SPDX-FileCopyrightText: 2025 nvn-rs contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Memory pools: GPU-addressable memory with explicit CPU/GPU caching.
//!
//! A pool is created from a [`MemoryPoolBuilder`] snapshot. Regular pools
//! own physical storage and a GPU VA range; physical pools own storage but no
//! VA; virtual pools own a VA range but no storage and are populated with
//! [`MemoryPool::map_virtual`].
//!
//! CPU-cached pools are not coherent with the GPU: CPU writes must be pushed
//! with [`MemoryPool::flush`] and GPU writes pulled with
//! [`MemoryPool::invalidate`].

use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;
use thiserror::Error;

use nvn_common::{is_aligned, is_page_aligned, GpuVAddr, PhysAddr, VIRTUAL_PAGE_SIZE};

use crate::device::Device;
use crate::finalize::Retire;
use crate::memory_manager::StorageClass;

bitflags! {
    /// Memory pool properties. Exactly one `CPU_*` and one `GPU_*` access
    /// mode must be set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryPoolFlags: u32 {
        const CPU_NO_ACCESS = 0x1;
        const CPU_UNCACHED  = 0x2;
        const CPU_CACHED    = 0x4;
        const GPU_NO_ACCESS = 0x8;
        const GPU_UNCACHED  = 0x10;
        const GPU_CACHED    = 0x20;
        const SHADER_CODE   = 0x40;
        const COMPRESSIBLE  = 0x80;
        const PHYSICAL      = 0x100;
        const VIRTUAL       = 0x200;

        const CPU_ACCESS_MASK = Self::CPU_NO_ACCESS.bits() | Self::CPU_UNCACHED.bits() | Self::CPU_CACHED.bits();
        const GPU_ACCESS_MASK = Self::GPU_NO_ACCESS.bits() | Self::GPU_UNCACHED.bits() | Self::GPU_CACHED.bits();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuAccess {
    None,
    Uncached,
    Cached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuAccess {
    None,
    Uncached,
    Cached,
}

impl MemoryPoolFlags {
    /// The CPU access mode, if exactly one is set.
    pub fn cpu_access(self) -> Option<CpuAccess> {
        match self & Self::CPU_ACCESS_MASK {
            m if m == Self::CPU_NO_ACCESS => Some(CpuAccess::None),
            m if m == Self::CPU_UNCACHED => Some(CpuAccess::Uncached),
            m if m == Self::CPU_CACHED => Some(CpuAccess::Cached),
            _ => None,
        }
    }

    /// The GPU access mode, if exactly one is set.
    pub fn gpu_access(self) -> Option<GpuAccess> {
        match self & Self::GPU_ACCESS_MASK {
            m if m == Self::GPU_NO_ACCESS => Some(GpuAccess::None),
            m if m == Self::GPU_UNCACHED => Some(GpuAccess::Uncached),
            m if m == Self::GPU_CACHED => Some(GpuAccess::Cached),
            _ => None,
        }
    }
}

/// Errors returned by memory pool operations.
#[derive(Debug, Error)]
pub enum MemoryPoolError {
    #[error("pool size must be non-zero")]
    ZeroSize,

    #[error("size 0x{0:X} is not a multiple of the pool page size")]
    MisalignedSize(u64),

    #[error("provided storage is {storage:#X} bytes but the pool size is {size:#X}")]
    StorageSizeMismatch { storage: usize, size: u64 },

    #[error("exactly one CPU access mode is required, got {0:?}")]
    InvalidCpuAccess(MemoryPoolFlags),

    #[error("exactly one GPU access mode is required, got {0:?}")]
    InvalidGpuAccess(MemoryPoolFlags),

    #[error("incompatible pool flags {0:?}")]
    IncompatibleFlags(MemoryPoolFlags),

    #[error("virtual pools cannot take caller storage")]
    VirtualWithStorage,

    #[error("range [0x{offset:X}, +0x{size:X}) exceeds pool size 0x{pool_size:X}")]
    OutOfBounds { offset: u64, size: u64, pool_size: u64 },

    #[error("0x{0:X} is not aligned to the virtual page size")]
    MisalignedMapping(u64),

    #[error("pool is not a virtual pool")]
    NotVirtual,

    #[error("mapping source is not a physical pool")]
    NotPhysical,

    #[error("mapping source belongs to a different device")]
    ForeignPool,

    #[error("a mapping needs a storage class")]
    MissingStorageClass,

    #[error("physical page 0x{phys:X} is mapped as class {existing:?}, cannot map as {requested:?}")]
    StorageClassConflict {
        phys: PhysAddr,
        existing: StorageClass,
        requested: StorageClass,
    },

    #[error("mapping request {index} failed: {reason}")]
    MappingFailed {
        index: usize,
        reason: Box<MemoryPoolError>,
    },

    #[error("pool has no CPU access")]
    NoCpuAccess,

    #[error("pool still has {0} dependent objects")]
    InUse(usize),
}

/// One page range to bind into a virtual pool. A request without a physical
/// pool unmaps the range.
#[derive(Clone, Copy)]
pub struct MappingRequest<'a> {
    pub physical_pool: Option<&'a MemoryPool>,
    pub physical_offset: u64,
    pub virtual_offset: u64,
    pub size: u64,
    pub storage_class: StorageClass,
}

/// A virtual page's current backing.
struct VirtualPage {
    /// Keeps the physical pool alive while mapped.
    _source: PoolRef,
    phys_page: PhysAddr,
}

pub(crate) struct PoolInner {
    device: Device,
    flags: MemoryPoolFlags,
    size: u64,
    phys_base: Option<PhysAddr>,
    gpu_address: Option<GpuVAddr>,
    dependents: AtomicUsize,
    /// Virtual page offset -> backing. Only used by virtual pools.
    virtual_pages: Mutex<BTreeMap<u64, VirtualPage>>,
}

impl PoolInner {
    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn flags(&self) -> MemoryPoolFlags {
        self.flags
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn gpu_address(&self) -> Option<GpuVAddr> {
        self.gpu_address
    }

    pub fn cpu_access(&self) -> CpuAccess {
        self.flags.cpu_access().unwrap_or(CpuAccess::None)
    }

    pub fn gpu_access(&self) -> GpuAccess {
        self.flags.gpu_access().unwrap_or(GpuAccess::None)
    }

    pub fn check_range(&self, offset: u64, size: u64) -> Result<(), MemoryPoolError> {
        match offset.checked_add(size) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(MemoryPoolError::OutOfBounds {
                offset,
                size,
                pool_size: self.size,
            }),
        }
    }

    pub fn cpu_read(&self, offset: u64, dst: &mut [u8]) -> Result<(), MemoryPoolError> {
        let base = self.cpu_base()?;
        self.check_range(offset, dst.len() as u64)?;
        self.device.shared.memory.read().phys.cpu_read(base + offset, dst);
        Ok(())
    }

    pub fn cpu_write(&self, offset: u64, src: &[u8]) -> Result<(), MemoryPoolError> {
        let base = self.cpu_base()?;
        self.check_range(offset, src.len() as u64)?;
        self.device.shared.memory.write().phys.cpu_write(base + offset, src);
        Ok(())
    }

    /// Write on behalf of the driver (descriptors, recorded commands): the
    /// bytes become visible to the GPU and the CPU cache image alike.
    pub fn driver_write(&self, offset: u64, src: &[u8]) -> Result<(), MemoryPoolError> {
        let base = self.phys_base.ok_or(MemoryPoolError::NoCpuAccess)?;
        self.check_range(offset, src.len() as u64)?;
        self.device.shared.memory.write().phys.write_coherent(base + offset, src);
        Ok(())
    }

    fn cpu_base(&self) -> Result<PhysAddr, MemoryPoolError> {
        match (self.cpu_access(), self.phys_base) {
            (CpuAccess::Uncached | CpuAccess::Cached, Some(base)) => Ok(base),
            _ => Err(MemoryPoolError::NoCpuAccess),
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let pages = std::mem::take(&mut *self.virtual_pages.lock());
        {
            let mut mem = self.device.shared.memory.write();
            for page in pages.values() {
                mem.unbind_class(page.phys_page);
            }
            if let Some(va) = self.gpu_address {
                mem.mm.unmap(va, self.size);
            }
            if let Some(base) = self.phys_base {
                mem.phys.release(base);
            }
        }
        log::debug!(
            "memory_pool: released pool va={:X?} size=0x{:X}",
            self.gpu_address,
            self.size
        );
        // Physical pools backing our pages are released only after the
        // memory lock is dropped.
        drop(pages);
    }
}

/// Counted reference from a dependent object (view, descriptor pool,
/// recorder block, virtual mapping) to its pool.
pub(crate) struct PoolRef(Arc<PoolInner>);

impl PoolRef {
    fn new(inner: &Arc<PoolInner>) -> Self {
        inner.dependents.fetch_add(1, Ordering::AcqRel);
        Self(inner.clone())
    }
}

impl Clone for PoolRef {
    fn clone(&self) -> Self {
        Self::new(&self.0)
    }
}

impl Drop for PoolRef {
    fn drop(&mut self) {
        self.0.dependents.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Deref for PoolRef {
    type Target = PoolInner;

    fn deref(&self) -> &PoolInner {
        &self.0
    }
}

/// Builder snapshot for [`MemoryPool`].
pub struct MemoryPoolBuilder {
    device: Device,
    storage: Option<Vec<u8>>,
    size: u64,
    flags: MemoryPoolFlags,
}

impl MemoryPoolBuilder {
    pub fn new(device: &Device) -> Self {
        Self {
            device: device.clone(),
            storage: None,
            size: 0,
            flags: MemoryPoolFlags::CPU_UNCACHED | MemoryPoolFlags::GPU_CACHED,
        }
    }

    /// Use caller-provided storage; the pool size becomes its length.
    pub fn set_storage(mut self, storage: Vec<u8>) -> Self {
        self.size = storage.len() as u64;
        self.storage = Some(storage);
        self
    }

    pub fn set_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn set_flags(mut self, flags: MemoryPoolFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn build(self) -> Result<MemoryPool, MemoryPoolError> {
        use MemoryPoolFlags as F;

        let flags = self.flags;
        if self.size == 0 {
            return Err(MemoryPoolError::ZeroSize);
        }
        if !is_page_aligned(self.size) {
            return Err(MemoryPoolError::MisalignedSize(self.size));
        }
        if let Some(storage) = &self.storage {
            if storage.len() as u64 != self.size {
                return Err(MemoryPoolError::StorageSizeMismatch {
                    storage: storage.len(),
                    size: self.size,
                });
            }
        }
        let cpu = flags.cpu_access().ok_or(MemoryPoolError::InvalidCpuAccess(flags))?;
        let gpu = flags.gpu_access().ok_or(MemoryPoolError::InvalidGpuAccess(flags))?;

        let is_virtual = flags.contains(F::VIRTUAL);
        let is_physical = flags.contains(F::PHYSICAL);
        let incompatible = (is_virtual && is_physical)
            || (is_virtual && (cpu != CpuAccess::None || gpu == GpuAccess::None))
            || (is_physical && gpu != GpuAccess::None)
            || (gpu == GpuAccess::None && flags.intersects(F::SHADER_CODE | F::COMPRESSIBLE));
        if incompatible {
            return Err(MemoryPoolError::IncompatibleFlags(flags));
        }
        if is_virtual && self.storage.is_some() {
            return Err(MemoryPoolError::VirtualWithStorage);
        }

        let (phys_base, gpu_address) = {
            let mut mem = self.device.shared.memory.write();
            if is_virtual {
                (None, Some(mem.mm.reserve(self.size, VIRTUAL_PAGE_SIZE)))
            } else {
                let storage = self.storage.unwrap_or_else(|| vec![0u8; self.size as usize]);
                let base = mem.phys.allocate(storage, cpu == CpuAccess::Cached);
                let va = (gpu != GpuAccess::None).then(|| {
                    let class = if flags.contains(F::COMPRESSIBLE) {
                        StorageClass::TEXTURE_COMPRESSED
                    } else {
                        StorageClass::BUFFER
                    };
                    mem.mm.alloc_any(base, self.size, class)
                });
                (Some(base), va)
            }
        };

        log::debug!(
            "memory_pool: created size=0x{:X} flags={:?} va={:X?}",
            self.size,
            flags,
            gpu_address
        );

        Ok(MemoryPool {
            inner: Arc::new(PoolInner {
                device: self.device,
                flags,
                size: self.size,
                phys_base,
                gpu_address,
                dependents: AtomicUsize::new(0),
                virtual_pages: Mutex::new(BTreeMap::new()),
            }),
        })
    }
}

/// A GPU-addressable memory pool.
pub struct MemoryPool {
    inner: Arc<PoolInner>,
}

impl MemoryPool {
    pub fn size(&self) -> u64 {
        self.inner.size
    }

    pub fn flags(&self) -> MemoryPoolFlags {
        self.inner.flags
    }

    pub fn cpu_access(&self) -> CpuAccess {
        self.inner.cpu_access()
    }

    pub fn gpu_access(&self) -> GpuAccess {
        self.inner.gpu_access()
    }

    /// GPU VA of the first byte, `None` for physical-only and GPU-no-access
    /// pools.
    pub fn gpu_address(&self) -> Option<GpuVAddr> {
        self.inner.gpu_address
    }

    pub fn is_virtual(&self) -> bool {
        self.inner.flags.contains(MemoryPoolFlags::VIRTUAL)
    }

    pub fn is_physical(&self) -> bool {
        self.inner.flags.contains(MemoryPoolFlags::PHYSICAL)
    }

    /// Number of live views, descriptor pools, recorder blocks and virtual
    /// mappings that depend on this pool.
    pub fn dependents(&self) -> usize {
        self.inner.dependents.load(Ordering::Acquire)
    }

    /// CPU mapping of the pool, or `None` for pools without CPU access.
    pub fn map(&self) -> Option<PoolMapping<'_>> {
        self.inner.cpu_base().ok().map(|_| PoolMapping { pool: &self.inner })
    }

    /// Push CPU-cached writes in `[offset, offset + size)` to memory.
    pub fn flush(&self, offset: u64, size: u64) -> Result<(), MemoryPoolError> {
        self.inner.check_range(offset, size)?;
        match (self.cpu_access(), self.inner.phys_base) {
            (CpuAccess::Cached, Some(base)) => {
                self.inner.device.shared.memory.write().phys.flush(base + offset, size as usize);
            }
            (CpuAccess::None, _) => {
                log::debug!("memory_pool: flush on a pool without CPU access ignored");
            }
            _ => {}
        }
        Ok(())
    }

    /// Pull memory contents of `[offset, offset + size)` into the CPU cache.
    pub fn invalidate(&self, offset: u64, size: u64) -> Result<(), MemoryPoolError> {
        self.inner.check_range(offset, size)?;
        match (self.cpu_access(), self.inner.phys_base) {
            (CpuAccess::Cached, Some(base)) => {
                self.inner
                    .device
                    .shared
                    .memory
                    .write()
                    .phys
                    .invalidate(base + offset, size as usize);
            }
            (CpuAccess::None, _) => {
                log::debug!("memory_pool: invalidate on a pool without CPU access ignored");
            }
            _ => {}
        }
        Ok(())
    }

    /// Bind page ranges of physical pools into this virtual pool.
    ///
    /// Requests are applied in order. On failure the error carries the index
    /// of the failing request; which of the other requests took effect is
    /// unspecified and the caller must re-validate or remap everything.
    pub fn map_virtual(&self, requests: &[MappingRequest<'_>]) -> Result<(), MemoryPoolError> {
        if !self.is_virtual() {
            return Err(MemoryPoolError::NotVirtual);
        }
        for (index, request) in requests.iter().enumerate() {
            self.apply_mapping(request)
                .map_err(|reason| MemoryPoolError::MappingFailed {
                    index,
                    reason: Box::new(reason),
                })?;
        }
        Ok(())
    }

    fn apply_mapping(&self, req: &MappingRequest<'_>) -> Result<(), MemoryPoolError> {
        for value in [req.virtual_offset, req.size, req.physical_offset] {
            if !is_aligned(value, VIRTUAL_PAGE_SIZE) {
                return Err(MemoryPoolError::MisalignedMapping(value));
            }
        }
        if req.size == 0 {
            return Err(MemoryPoolError::ZeroSize);
        }
        self.inner.check_range(req.virtual_offset, req.size)?;

        let source = match req.physical_pool {
            Some(pool) => {
                if !pool.is_physical() {
                    return Err(MemoryPoolError::NotPhysical);
                }
                if !pool.inner.device.same_device(&self.inner.device) {
                    return Err(MemoryPoolError::ForeignPool);
                }
                if req.storage_class == StorageClass::NONE {
                    return Err(MemoryPoolError::MissingStorageClass);
                }
                pool.inner.check_range(req.physical_offset, req.size)?;
                let base = pool.inner.phys_base.ok_or(MemoryPoolError::NotPhysical)?;
                Some((pool, base + req.physical_offset))
            }
            None => None,
        };

        let va_base = self.inner.gpu_address.ok_or(MemoryPoolError::NotVirtual)?;
        let mut retired = Vec::new();
        let mut pages = self.inner.virtual_pages.lock();
        let mut mem = self.inner.device.shared.memory.write();

        let page_count = req.size / VIRTUAL_PAGE_SIZE;
        for i in 0..page_count {
            let page_offset = req.virtual_offset + i * VIRTUAL_PAGE_SIZE;
            let va = va_base + page_offset;

            if let Some(old) = pages.remove(&page_offset) {
                mem.unbind_class(old.phys_page);
                mem.mm.unmap(va, VIRTUAL_PAGE_SIZE);
                retired.push(old);
            }

            if let Some((pool, phys_start)) = source {
                let phys_page = phys_start + i * VIRTUAL_PAGE_SIZE;
                if let Err(existing) = mem.bind_class(phys_page, req.storage_class) {
                    log::warn!(
                        "memory_pool: storage class conflict at PA 0x{:X} ({:?} vs {:?})",
                        phys_page,
                        existing,
                        req.storage_class
                    );
                    return Err(MemoryPoolError::StorageClassConflict {
                        phys: phys_page,
                        existing,
                        requested: req.storage_class,
                    });
                }
                mem.mm.map(va, phys_page, VIRTUAL_PAGE_SIZE, req.storage_class);
                pages.insert(
                    page_offset,
                    VirtualPage {
                        _source: pool.reference(),
                        phys_page,
                    },
                );
            }
        }

        drop(mem);
        drop(pages);
        drop(retired);
        Ok(())
    }

    /// Destroy the pool. Fails, handing the pool back, while anything still
    /// depends on it.
    pub fn finalize(self) -> Result<(), (MemoryPool, MemoryPoolError)> {
        let dependents = self.dependents();
        if dependents > 0 {
            return Err((self, MemoryPoolError::InUse(dependents)));
        }
        drop(self);
        Ok(())
    }

    pub fn device(&self) -> &Device {
        &self.inner.device
    }

    pub(crate) fn reference(&self) -> PoolRef {
        PoolRef::new(&self.inner)
    }
}

impl Retire for MemoryPool {
    fn can_retire(&self) -> bool {
        self.dependents() == 0
    }
}

impl std::fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPool")
            .field("size", &self.inner.size)
            .field("flags", &self.inner.flags)
            .field("gpu_address", &self.inner.gpu_address)
            .finish()
    }
}

/// CPU view of a pool. Writes to CPU-cached pools stay in the CPU cache
/// until [`MemoryPool::flush`].
pub struct PoolMapping<'a> {
    pool: &'a PoolInner,
}

impl PoolMapping<'_> {
    pub fn read(&self, offset: u64, dst: &mut [u8]) -> Result<(), MemoryPoolError> {
        self.pool.cpu_read(offset, dst)
    }

    pub fn write(&self, offset: u64, src: &[u8]) -> Result<(), MemoryPoolError> {
        self.pool.cpu_write(offset, src)
    }

    pub fn read_u32(&self, offset: u64) -> Result<u32, MemoryPoolError> {
        let mut buf = [0u8; 4];
        self.read(offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn write_u32(&self, offset: u64, value: u32) -> Result<(), MemoryPoolError> {
        self.write(offset, &value.to_le_bytes())
    }

    pub fn len(&self) -> u64 {
        self.pool.size
    }

    pub fn is_empty(&self) -> bool {
        self.pool.size == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nvn_common::settings::DeviceSettings;

    fn device() -> Device {
        Device::new(DeviceSettings::default())
    }

    fn pool(device: &Device, size: u64, flags: MemoryPoolFlags) -> MemoryPool {
        MemoryPoolBuilder::new(device)
            .set_size(size)
            .set_flags(flags)
            .build()
            .unwrap()
    }

    // ── Creation ─────────────────────────────────────────────────────────

    #[test]
    fn test_build_default_pool() {
        let dev = device();
        let pool = MemoryPoolBuilder::new(&dev).set_size(0x1_0000).build().unwrap();
        assert_eq!(pool.size(), 0x1_0000);
        assert_eq!(pool.cpu_access(), CpuAccess::Uncached);
        assert_eq!(pool.gpu_access(), GpuAccess::Cached);
        assert!(pool.gpu_address().is_some());
    }

    #[test]
    fn test_misaligned_size_fails() {
        let dev = device();
        let err = MemoryPoolBuilder::new(&dev).set_size(0x1001).build().unwrap_err();
        assert!(matches!(err, MemoryPoolError::MisalignedSize(0x1001)));
        let err = MemoryPoolBuilder::new(&dev).set_size(0).build().unwrap_err();
        assert!(matches!(err, MemoryPoolError::ZeroSize));
    }

    #[test]
    fn test_misaligned_storage_fails() {
        let dev = device();
        let err = MemoryPoolBuilder::new(&dev)
            .set_storage(vec![0u8; 100])
            .build()
            .unwrap_err();
        assert!(matches!(err, MemoryPoolError::MisalignedSize(100)));
    }

    #[test]
    fn test_provided_storage_is_adopted() {
        let dev = device();
        let mut storage = vec![0u8; 0x1000];
        storage[0..4].copy_from_slice(&[9, 8, 7, 6]);
        let pool = MemoryPoolBuilder::new(&dev).set_storage(storage).build().unwrap();
        let mapping = pool.map().unwrap();
        let mut buf = [0u8; 4];
        mapping.read(0, &mut buf).unwrap();
        assert_eq!(buf, [9, 8, 7, 6]);
    }

    #[test]
    fn test_access_modes_must_be_exclusive() {
        let dev = device();
        let both_cpu = MemoryPoolFlags::CPU_CACHED
            | MemoryPoolFlags::CPU_UNCACHED
            | MemoryPoolFlags::GPU_CACHED;
        let err = MemoryPoolBuilder::new(&dev)
            .set_size(0x1000)
            .set_flags(both_cpu)
            .build()
            .unwrap_err();
        assert!(matches!(err, MemoryPoolError::InvalidCpuAccess(_)));

        let no_gpu = MemoryPoolFlags::CPU_CACHED;
        let err = MemoryPoolBuilder::new(&dev)
            .set_size(0x1000)
            .set_flags(no_gpu)
            .build()
            .unwrap_err();
        assert!(matches!(err, MemoryPoolError::InvalidGpuAccess(_)));
    }

    #[test]
    fn test_incompatible_flags() {
        let dev = device();
        let cases = [
            MemoryPoolFlags::CPU_UNCACHED | MemoryPoolFlags::GPU_CACHED | MemoryPoolFlags::VIRTUAL,
            MemoryPoolFlags::CPU_UNCACHED | MemoryPoolFlags::GPU_CACHED | MemoryPoolFlags::PHYSICAL,
            MemoryPoolFlags::CPU_UNCACHED | MemoryPoolFlags::GPU_NO_ACCESS | MemoryPoolFlags::SHADER_CODE,
        ];
        for flags in cases {
            let err = MemoryPoolBuilder::new(&dev)
                .set_size(0x1000)
                .set_flags(flags)
                .build()
                .unwrap_err();
            assert!(matches!(err, MemoryPoolError::IncompatibleFlags(_)), "{flags:?}");
        }
    }

    // ── CPU mapping and coherency ────────────────────────────────────────

    #[test]
    fn test_map_no_access_returns_none() {
        let dev = device();
        let pool = pool(&dev, 0x1000, MemoryPoolFlags::CPU_NO_ACCESS | MemoryPoolFlags::GPU_CACHED);
        assert!(pool.map().is_none());
        // Flush/invalidate are meaningless but harmless.
        assert!(pool.flush(0, 0x1000).is_ok());
        assert!(pool.invalidate(0, 0x1000).is_ok());
    }

    #[test]
    fn test_cached_pool_flush_makes_write_gpu_visible() {
        let dev = device();
        let pool = pool(&dev, 0x1_0000, MemoryPoolFlags::CPU_CACHED | MemoryPoolFlags::GPU_CACHED);
        let va = pool.gpu_address().unwrap();
        pool.map().unwrap().write(0, &[1, 2, 3, 4]).unwrap();

        let mut buf = [0u8; 4];
        dev.shared.memory.read().gpu_read(va, &mut buf).unwrap();
        assert_eq!(buf, [0; 4]);

        pool.flush(0, 4).unwrap();
        dev.shared.memory.read().gpu_read(va, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn test_cached_pool_invalidate_pulls_gpu_write() {
        let dev = device();
        let pool = pool(&dev, 0x1000, MemoryPoolFlags::CPU_CACHED | MemoryPoolFlags::GPU_CACHED);
        let va = pool.gpu_address().unwrap();
        dev.shared.memory.write().gpu_write(va + 8, &[0xEE; 4]).unwrap();

        let mapping = pool.map().unwrap();
        assert_eq!(mapping.read_u32(8).unwrap(), 0);
        pool.invalidate(8, 4).unwrap();
        assert_eq!(mapping.read_u32(8).unwrap(), 0xEEEE_EEEE);
    }

    #[test]
    fn test_uncached_pool_needs_no_flush() {
        let dev = device();
        let pool = pool(&dev, 0x1000, MemoryPoolFlags::CPU_UNCACHED | MemoryPoolFlags::GPU_CACHED);
        pool.map().unwrap().write_u32(0x10, 0xCAFE_F00D).unwrap();
        let va = pool.gpu_address().unwrap();
        assert_eq!(dev.shared.memory.read().gpu_read_u32(va + 0x10), Ok(0xCAFE_F00D));
    }

    #[test]
    fn test_mapping_bounds() {
        let dev = device();
        let pool = pool(&dev, 0x1000, MemoryPoolFlags::CPU_UNCACHED | MemoryPoolFlags::GPU_CACHED);
        let mapping = pool.map().unwrap();
        assert!(mapping.write(0xFFE, &[0; 4]).is_err());
        assert!(pool.flush(0x800, 0x1000).is_err());
    }

    // ── Virtual pools ────────────────────────────────────────────────────

    fn physical(dev: &Device, size: u64) -> MemoryPool {
        pool(
            dev,
            size,
            MemoryPoolFlags::CPU_UNCACHED | MemoryPoolFlags::GPU_NO_ACCESS | MemoryPoolFlags::PHYSICAL,
        )
    }

    fn virtual_pool(dev: &Device, size: u64) -> MemoryPool {
        pool(
            dev,
            size,
            MemoryPoolFlags::CPU_NO_ACCESS | MemoryPoolFlags::GPU_CACHED | MemoryPoolFlags::VIRTUAL,
        )
    }

    #[test]
    fn test_physical_pool_has_no_gpu_address() {
        let dev = device();
        let phys = physical(&dev, 0x2_0000);
        assert!(phys.gpu_address().is_none());
        assert!(phys.map().is_some());
    }

    #[test]
    fn test_map_virtual_exposes_physical_bytes() {
        let dev = device();
        let phys = physical(&dev, 0x2_0000);
        let virt = virtual_pool(&dev, 0x4_0000);

        phys.map().unwrap().write_u32(0x1_0004, 0x1234_5678).unwrap();
        virt.map_virtual(&[MappingRequest {
            physical_pool: Some(&phys),
            physical_offset: 0x1_0000,
            virtual_offset: 0x2_0000,
            size: 0x1_0000,
            storage_class: StorageClass::BUFFER,
        }])
        .unwrap();

        let va = virt.gpu_address().unwrap() + 0x2_0004;
        let mem = dev.shared.memory.read();
        assert_eq!(mem.gpu_read_u32(va), Ok(0x1234_5678));
        assert_eq!(mem.mm.storage_class(va), Some(StorageClass::BUFFER));
        // Unmapped part of the virtual range faults.
        assert!(mem.gpu_read_u32(virt.gpu_address().unwrap()).is_err());
        drop(mem);

        assert_eq!(phys.dependents(), 1);
    }

    #[test]
    fn test_map_virtual_unmap_releases_physical() {
        let dev = device();
        let phys = physical(&dev, 0x1_0000);
        let virt = virtual_pool(&dev, 0x1_0000);
        virt.map_virtual(&[MappingRequest {
            physical_pool: Some(&phys),
            physical_offset: 0,
            virtual_offset: 0,
            size: 0x1_0000,
            storage_class: StorageClass::TEXTURE,
        }])
        .unwrap();

        let (phys, err) = phys.finalize().unwrap_err();
        assert!(matches!(err, MemoryPoolError::InUse(1)));

        virt.map_virtual(&[MappingRequest {
            physical_pool: None,
            physical_offset: 0,
            virtual_offset: 0,
            size: 0x1_0000,
            storage_class: StorageClass::TEXTURE,
        }])
        .unwrap();
        assert_eq!(phys.dependents(), 0);
        assert!(dev.shared.memory.read().gpu_read_u32(virt.gpu_address().unwrap()).is_err());
        assert!(phys.finalize().is_ok());
    }

    #[test]
    fn test_map_virtual_alignment() {
        let dev = device();
        let phys = physical(&dev, 0x2_0000);
        let virt = virtual_pool(&dev, 0x2_0000);
        let err = virt
            .map_virtual(&[MappingRequest {
                physical_pool: Some(&phys),
                physical_offset: 0x1000,
                virtual_offset: 0,
                size: 0x1_0000,
                storage_class: StorageClass::BUFFER,
            }])
            .unwrap_err();
        match err {
            MemoryPoolError::MappingFailed { index, reason } => {
                assert_eq!(index, 0);
                assert!(matches!(*reason, MemoryPoolError::MisalignedMapping(0x1000)));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_storage_class_mixing_rejected() {
        let dev = device();
        let phys = physical(&dev, 0x1_0000);
        let virt = virtual_pool(&dev, 0x2_0000);
        let base = MappingRequest {
            physical_pool: Some(&phys),
            physical_offset: 0,
            virtual_offset: 0,
            size: 0x1_0000,
            storage_class: StorageClass::BUFFER,
        };
        let aliased_texture = MappingRequest {
            virtual_offset: 0x1_0000,
            storage_class: StorageClass::TEXTURE,
            ..base
        };
        let err = virt.map_virtual(&[base, aliased_texture]).unwrap_err();
        match err {
            MemoryPoolError::MappingFailed { index, reason } => {
                assert_eq!(index, 1);
                assert!(matches!(*reason, MemoryPoolError::StorageClassConflict { .. }));
            }
            other => panic!("unexpected error {other:?}"),
        }

        // Aliasing with the same class is fine.
        let aliased_buffer = MappingRequest {
            virtual_offset: 0x1_0000,
            ..base
        };
        assert!(virt.map_virtual(&[aliased_buffer]).is_ok());
    }

    #[test]
    fn test_map_virtual_requires_virtual_and_physical() {
        let dev = device();
        let regular = pool(&dev, 0x1_0000, MemoryPoolFlags::CPU_UNCACHED | MemoryPoolFlags::GPU_CACHED);
        let virt = virtual_pool(&dev, 0x1_0000);
        assert!(matches!(regular.map_virtual(&[]), Err(MemoryPoolError::NotVirtual)));

        let err = virt
            .map_virtual(&[MappingRequest {
                physical_pool: Some(&regular),
                physical_offset: 0,
                virtual_offset: 0,
                size: 0x1_0000,
                storage_class: StorageClass::BUFFER,
            }])
            .unwrap_err();
        assert!(matches!(
            err,
            MemoryPoolError::MappingFailed { ref reason, .. } if matches!(**reason, MemoryPoolError::NotPhysical)
        ));
    }

    // ── Lifetime ─────────────────────────────────────────────────────────

    #[test]
    fn test_finalize_releases_storage() {
        let dev = device();
        let pool = pool(&dev, 0x1000, MemoryPoolFlags::CPU_UNCACHED | MemoryPoolFlags::GPU_CACHED);
        let va = pool.gpu_address().unwrap();
        assert!(pool.finalize().is_ok());
        assert!(dev.shared.memory.read().gpu_read_u32(va).is_err());
        assert_eq!(dev.shared.memory.read().phys.region_count(), 0);
    }

    #[test]
    fn test_finalize_with_dependents_fails() {
        let dev = device();
        let pool = pool(&dev, 0x1000, MemoryPoolFlags::CPU_UNCACHED | MemoryPoolFlags::GPU_CACHED);
        let dep = pool.reference();
        let (pool, err) = pool.finalize().unwrap_err();
        assert!(matches!(err, MemoryPoolError::InUse(1)));
        drop(dep);
        assert!(pool.finalize().is_ok());
    }
}
