// SPDX-FileCopyrightText: 2025 nvn-rs contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Texture and sampler descriptor pools.
//!
//! A descriptor pool is a fixed-capacity array of 32-byte records in a
//! memory pool. The leading reserved entries belong to the driver. Records
//! are little-endian; an all-zero record is unregistered.
//!
//! Texture record layout:
//!
//! | offset | field       |
//! |--------|-------------|
//! | 0x00   | address u64 |
//! | 0x08   | width u32   |
//! | 0x0C   | height u32  |
//! | 0x10   | depth u16   |
//! | 0x12   | levels u16  |
//! | 0x14   | format u32  |
//! | 0x18   | base level u16, level count u16 |
//! | 0x1C   | kind u8, target u8 |
//!
//! Sampler record layout: valid u8, min/mag/mip filters, three wrap modes,
//! one pad byte, then max anisotropy, min lod, max lod, lod bias as f32 and
//! the RGBA8 border colour.

use std::io::{self, Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use nvn_common::{
    is_aligned, GpuVAddr, DESCRIPTOR_SIZE, MAX_SAMPLER_POOL_SIZE, MAX_TEXTURE_POOL_SIZE,
    RESERVED_SAMPLER_DESCRIPTORS, RESERVED_TEXTURE_DESCRIPTORS,
};

use crate::device::Device;
use crate::finalize::Retire;
use crate::memory_pool::{CpuAccess, GpuAccess, MemoryPool, MemoryPoolError, PoolRef};
use crate::resource::{Filter, Format, MipFilter, Sampler, Texture, TextureTarget, TextureView, WrapMode};

const TEXTURE_ID_BITS: u32 = 20;
const TEXTURE_ID_MASK: u64 = (1 << TEXTURE_ID_BITS) - 1;
const SAMPLER_ID_BITS: u32 = 12;
const SAMPLER_ID_MASK: u64 = (1 << SAMPLER_ID_BITS) - 1;

#[derive(Debug, Error)]
pub enum DescriptorPoolError {
    #[error("offset 0x{0:X} is not descriptor aligned")]
    MisalignedOffset(u64),

    #[error("{count} descriptors requested, at least {reserved} are reserved")]
    TooFewDescriptors { count: u32, reserved: u32 },

    #[error("{count} descriptors requested, at most {max} allowed")]
    TooManyDescriptors { count: u32, max: u32 },

    #[error("descriptor pool must live in CPU- and GPU-accessible memory")]
    PoolNotAccessible,

    #[error("descriptor index {0} is reserved")]
    ReservedIndex(u32),

    #[error("descriptor index {id} beyond capacity {capacity}")]
    IndexOutOfRange { id: u32, capacity: u32 },

    #[error("descriptor {0} is not registered")]
    Unregistered(u32),

    #[error("view selects levels {base}..{end} of a {levels}-level texture")]
    ViewLevelsOutOfRange { base: u32, end: u32, levels: u32 },

    #[error("{which} id {id} does not fit the {bits}-bit handle field")]
    HandleIdTooLarge { which: &'static str, id: u32, bits: u32 },

    #[error("descriptor record could not be read back")]
    Unreadable,

    #[error(transparent)]
    Memory(#[from] MemoryPoolError),
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Combined texture + sampler handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TextureHandle(pub u64);

/// Handle for load/store image access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ImageHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SeparateTextureHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SeparateSamplerHandle(pub u64);

impl TextureHandle {
    pub fn texture_id(self) -> u32 {
        (self.0 & TEXTURE_ID_MASK) as u32
    }

    pub fn sampler_id(self) -> u32 {
        ((self.0 >> TEXTURE_ID_BITS) & SAMPLER_ID_MASK) as u32
    }
}

fn pack_handle(texture_id: u32, sampler_id: u32) -> Result<u64, DescriptorPoolError> {
    if texture_id as u64 > TEXTURE_ID_MASK {
        return Err(DescriptorPoolError::HandleIdTooLarge {
            which: "texture",
            id: texture_id,
            bits: TEXTURE_ID_BITS,
        });
    }
    if sampler_id as u64 > SAMPLER_ID_MASK {
        return Err(DescriptorPoolError::HandleIdTooLarge {
            which: "sampler",
            id: sampler_id,
            bits: SAMPLER_ID_BITS,
        });
    }
    Ok(texture_id as u64 | ((sampler_id as u64) << TEXTURE_ID_BITS))
}

/// Handle derivation. Ids wider than their handle field are rejected.
impl Device {
    pub fn texture_handle(&self, texture_id: u32, sampler_id: u32) -> Result<TextureHandle, DescriptorPoolError> {
        pack_handle(texture_id, sampler_id).map(TextureHandle)
    }

    pub fn image_handle(&self, image_id: u32) -> Result<ImageHandle, DescriptorPoolError> {
        pack_handle(image_id, 0).map(ImageHandle)
    }

    pub fn separate_texture_handle(&self, texture_id: u32) -> Result<SeparateTextureHandle, DescriptorPoolError> {
        pack_handle(texture_id, 0).map(SeparateTextureHandle)
    }

    pub fn separate_sampler_handle(&self, sampler_id: u32) -> Result<SeparateSamplerHandle, DescriptorPoolError> {
        pack_handle(0, sampler_id).map(SeparateSamplerHandle)
    }
}

// ---------------------------------------------------------------------------
// Descriptor records
// ---------------------------------------------------------------------------

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    Texture = 1,
    Image = 2,
}

/// Decoded texture descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDescriptor {
    pub address: GpuVAddr,
    pub width: u32,
    pub height: u32,
    pub depth: u16,
    pub levels: u16,
    pub format: Format,
    pub base_level: u16,
    pub level_count: u16,
    pub kind: DescriptorKind,
    pub target: TextureTarget,
}

impl TextureDescriptor {
    fn from_texture(
        texture: &Texture,
        view: Option<&TextureView>,
        kind: DescriptorKind,
    ) -> Result<Self, DescriptorPoolError> {
        let view = view.copied().unwrap_or_default();
        let level_count = view
            .level_count
            .unwrap_or_else(|| texture.levels().saturating_sub(view.base_level));
        let end = view.base_level + level_count;
        if level_count == 0 || end > texture.levels() {
            return Err(DescriptorPoolError::ViewLevelsOutOfRange {
                base: view.base_level,
                end,
                levels: texture.levels(),
            });
        }
        Ok(Self {
            address: texture.address(),
            width: texture.width(),
            height: texture.height(),
            depth: texture.depth() as u16,
            levels: texture.levels() as u16,
            format: view.format.unwrap_or(texture.format()),
            base_level: view.base_level as u16,
            level_count: level_count as u16,
            kind,
            target: view.target.unwrap_or(texture.target()),
        })
    }

    fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_u64::<LittleEndian>(self.address)?;
        w.write_u32::<LittleEndian>(self.width)?;
        w.write_u32::<LittleEndian>(self.height)?;
        w.write_u16::<LittleEndian>(self.depth)?;
        w.write_u16::<LittleEndian>(self.levels)?;
        w.write_u32::<LittleEndian>(self.format.0)?;
        w.write_u16::<LittleEndian>(self.base_level)?;
        w.write_u16::<LittleEndian>(self.level_count)?;
        w.write_u8(self.kind as u8)?;
        w.write_u8(self.target as u8)
    }

    pub fn encode(&self) -> [u8; DESCRIPTOR_SIZE] {
        let mut raw = [0u8; DESCRIPTOR_SIZE];
        let written = self.write_to(&mut &mut raw[..]);
        debug_assert!(written.is_ok(), "texture descriptor overflows {} bytes", DESCRIPTOR_SIZE);
        raw
    }

    /// Decode a record; `None` for an unregistered or corrupt entry.
    pub fn decode(raw: &[u8; DESCRIPTOR_SIZE]) -> Option<Self> {
        let mut r = Cursor::new(&raw[..]);
        let address = r.read_u64::<LittleEndian>().ok()?;
        let width = r.read_u32::<LittleEndian>().ok()?;
        let height = r.read_u32::<LittleEndian>().ok()?;
        let depth = r.read_u16::<LittleEndian>().ok()?;
        let levels = r.read_u16::<LittleEndian>().ok()?;
        let format = Format(r.read_u32::<LittleEndian>().ok()?);
        let base_level = r.read_u16::<LittleEndian>().ok()?;
        let level_count = r.read_u16::<LittleEndian>().ok()?;
        let kind = match r.read_u8().ok()? {
            1 => DescriptorKind::Texture,
            2 => DescriptorKind::Image,
            _ => return None,
        };
        let target = TextureTarget::from_u8(r.read_u8().ok()?)?;
        Some(Self {
            address,
            width,
            height,
            depth,
            levels,
            format,
            base_level,
            level_count,
            kind,
            target,
        })
    }
}

/// Decoded sampler descriptor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDescriptor {
    pub sampler: Sampler,
}

impl SamplerDescriptor {
    fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        let s = &self.sampler;
        w.write_u8(1)?;
        w.write_u8(s.min_filter as u8)?;
        w.write_u8(s.mag_filter as u8)?;
        w.write_u8(s.mip_filter as u8)?;
        for wrap in s.wrap {
            w.write_u8(wrap as u8)?;
        }
        w.write_u8(0)?;
        w.write_f32::<LittleEndian>(s.max_anisotropy)?;
        w.write_f32::<LittleEndian>(s.min_lod)?;
        w.write_f32::<LittleEndian>(s.max_lod)?;
        w.write_f32::<LittleEndian>(s.lod_bias)?;
        w.write_all(&s.border_color)
    }

    pub fn encode(&self) -> [u8; DESCRIPTOR_SIZE] {
        let mut raw = [0u8; DESCRIPTOR_SIZE];
        let written = self.write_to(&mut &mut raw[..]);
        debug_assert!(written.is_ok(), "sampler descriptor overflows {} bytes", DESCRIPTOR_SIZE);
        raw
    }

    pub fn decode(raw: &[u8; DESCRIPTOR_SIZE]) -> Option<Self> {
        let mut r = Cursor::new(&raw[..]);
        if r.read_u8().ok()? != 1 {
            return None;
        }
        let min_filter = Filter::from_u8(r.read_u8().ok()?)?;
        let mag_filter = Filter::from_u8(r.read_u8().ok()?)?;
        let mip_filter = MipFilter::from_u8(r.read_u8().ok()?)?;
        let mut wrap = [WrapMode::Repeat; 3];
        for slot in &mut wrap {
            *slot = WrapMode::from_u8(r.read_u8().ok()?)?;
        }
        r.read_u8().ok()?;
        let max_anisotropy = r.read_f32::<LittleEndian>().ok()?;
        let min_lod = r.read_f32::<LittleEndian>().ok()?;
        let max_lod = r.read_f32::<LittleEndian>().ok()?;
        let lod_bias = r.read_f32::<LittleEndian>().ok()?;
        let mut border_color = [0u8; 4];
        r.read_exact(&mut border_color).ok()?;
        Some(Self {
            sampler: Sampler {
                min_filter,
                mag_filter,
                mip_filter,
                wrap,
                max_anisotropy,
                min_lod,
                max_lod,
                lod_bias,
                border_color,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Pools
// ---------------------------------------------------------------------------

/// Region of a memory pool holding `capacity` descriptors.
struct DescriptorRegion {
    pool: PoolRef,
    offset: u64,
    capacity: u32,
    reserved: u32,
    address: GpuVAddr,
}

impl DescriptorRegion {
    fn new(
        pool: &MemoryPool,
        offset: u64,
        capacity: u32,
        reserved: u32,
        max: u32,
    ) -> Result<Self, DescriptorPoolError> {
        if !is_aligned(offset, DESCRIPTOR_SIZE as u64) {
            return Err(DescriptorPoolError::MisalignedOffset(offset));
        }
        if capacity < reserved {
            return Err(DescriptorPoolError::TooFewDescriptors {
                count: capacity,
                reserved,
            });
        }
        if capacity > max {
            return Err(DescriptorPoolError::TooManyDescriptors { count: capacity, max });
        }
        if pool.cpu_access() == CpuAccess::None || pool.gpu_access() == GpuAccess::None {
            return Err(DescriptorPoolError::PoolNotAccessible);
        }
        let address = pool.gpu_address().ok_or(DescriptorPoolError::PoolNotAccessible)?;
        let pool = pool.reference();
        pool.check_range(offset, capacity as u64 * DESCRIPTOR_SIZE as u64)?;
        Ok(Self {
            pool,
            offset,
            capacity,
            reserved,
            address: address + offset,
        })
    }

    fn check_id(&self, id: u32) -> Result<(), DescriptorPoolError> {
        if id >= self.capacity {
            return Err(DescriptorPoolError::IndexOutOfRange {
                id,
                capacity: self.capacity,
            });
        }
        if id < self.reserved {
            return Err(DescriptorPoolError::ReservedIndex(id));
        }
        Ok(())
    }

    fn slot_offset(&self, id: u32) -> u64 {
        self.offset + id as u64 * DESCRIPTOR_SIZE as u64
    }

    fn write(&self, id: u32, raw: &[u8; DESCRIPTOR_SIZE]) -> Result<(), DescriptorPoolError> {
        self.check_id(id)?;
        self.pool.driver_write(self.slot_offset(id), raw)?;
        Ok(())
    }

    /// Read the GPU-visible record.
    fn read(&self, id: u32) -> Result<[u8; DESCRIPTOR_SIZE], DescriptorPoolError> {
        if id >= self.capacity {
            return Err(DescriptorPoolError::IndexOutOfRange {
                id,
                capacity: self.capacity,
            });
        }
        let mut raw = [0u8; DESCRIPTOR_SIZE];
        self.pool
            .device()
            .shared
            .memory
            .read()
            .gpu_read(self.address + id as u64 * DESCRIPTOR_SIZE as u64, &mut raw)
            .map_err(|_| DescriptorPoolError::Unreadable)?;
        Ok(raw)
    }
}

/// Table of texture and image descriptors.
pub struct TexturePool {
    region: DescriptorRegion,
}

impl TexturePool {
    pub fn new(pool: &MemoryPool, offset: u64, num_descriptors: u32) -> Result<Self, DescriptorPoolError> {
        let region = DescriptorRegion::new(
            pool,
            offset,
            num_descriptors,
            RESERVED_TEXTURE_DESCRIPTORS,
            MAX_TEXTURE_POOL_SIZE,
        )?;
        log::debug!(
            "texture_pool: {} descriptors at VA 0x{:X}",
            num_descriptors,
            region.address
        );
        Ok(Self { region })
    }

    pub fn register_texture(
        &self,
        id: u32,
        texture: &Texture,
        view: Option<&TextureView>,
    ) -> Result<(), DescriptorPoolError> {
        let desc = TextureDescriptor::from_texture(texture, view, DescriptorKind::Texture)?;
        self.region.write(id, &desc.encode())
    }

    pub fn register_image(
        &self,
        id: u32,
        texture: &Texture,
        view: Option<&TextureView>,
    ) -> Result<(), DescriptorPoolError> {
        let desc = TextureDescriptor::from_texture(texture, view, DescriptorKind::Image)?;
        self.region.write(id, &desc.encode())
    }

    /// Decode the descriptor at `id` from pool memory.
    pub fn read_descriptor(&self, id: u32) -> Result<TextureDescriptor, DescriptorPoolError> {
        let raw = self.region.read(id)?;
        TextureDescriptor::decode(&raw).ok_or(DescriptorPoolError::Unregistered(id))
    }

    pub fn capacity(&self) -> u32 {
        self.region.capacity
    }

    pub fn gpu_address(&self) -> GpuVAddr {
        self.region.address
    }

    pub fn pool_offset(&self) -> u64 {
        self.region.offset
    }

    pub(crate) fn same_device(&self, device: &Device) -> bool {
        self.region.pool.device().same_device(device)
    }
}

impl Retire for TexturePool {}

/// Table of sampler descriptors.
pub struct SamplerPool {
    region: DescriptorRegion,
}

impl SamplerPool {
    pub fn new(pool: &MemoryPool, offset: u64, num_descriptors: u32) -> Result<Self, DescriptorPoolError> {
        let region = DescriptorRegion::new(
            pool,
            offset,
            num_descriptors,
            RESERVED_SAMPLER_DESCRIPTORS,
            MAX_SAMPLER_POOL_SIZE,
        )?;
        log::debug!(
            "sampler_pool: {} descriptors at VA 0x{:X}",
            num_descriptors,
            region.address
        );
        Ok(Self { region })
    }

    pub fn register_sampler(&self, id: u32, sampler: &Sampler) -> Result<(), DescriptorPoolError> {
        let desc = SamplerDescriptor { sampler: *sampler };
        self.region.write(id, &desc.encode())
    }

    pub fn read_descriptor(&self, id: u32) -> Result<SamplerDescriptor, DescriptorPoolError> {
        let raw = self.region.read(id)?;
        SamplerDescriptor::decode(&raw).ok_or(DescriptorPoolError::Unregistered(id))
    }

    pub fn capacity(&self) -> u32 {
        self.region.capacity
    }

    pub fn gpu_address(&self) -> GpuVAddr {
        self.region.address
    }

    pub fn pool_offset(&self) -> u64 {
        self.region.offset
    }

    pub(crate) fn same_device(&self, device: &Device) -> bool {
        self.region.pool.device().same_device(device)
    }
}

impl Retire for SamplerPool {}
