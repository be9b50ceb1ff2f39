// SPDX-FileCopyrightText: 2025 nvn-rs contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! 3D engine.
//!
//! Tracks the bound texture and sampler pools, resolves texture bindings
//! through the descriptor tables and accounts draws. Rasterization is out of
//! scope for the software GPU; a draw only validates and fetches its inputs
//! (index data, indirect records).

use byteorder::{ByteOrder, LittleEndian};

use super::{address_from, ClassId, Engine, ENGINE_REG_COUNT};
use crate::descriptor_pool::{SamplerDescriptor, TextureDescriptor, TextureHandle};
use crate::descriptor_table::TableReadError;
use crate::device::MAX_TEXTURE_BINDINGS;
use crate::executor::{BoundTexture, ExecContext, ExecError};
use crate::fault::{FaultAccess, QueueErrorInfo};

// ── Register constants (method addresses) ────────────────────────────────────

pub(crate) const TEXTURE_POOL_ADDRESS_HIGH: u32 = 0x00;
pub(crate) const TEXTURE_POOL_ADDRESS_LOW: u32 = 0x01;
pub(crate) const TEXTURE_POOL_COUNT: u32 = 0x02;
pub(crate) const SET_TEXTURE_POOL: u32 = 0x03;
pub(crate) const SAMPLER_POOL_ADDRESS_HIGH: u32 = 0x04;
pub(crate) const SAMPLER_POOL_ADDRESS_LOW: u32 = 0x05;
pub(crate) const SAMPLER_POOL_COUNT: u32 = 0x06;
pub(crate) const SET_SAMPLER_POOL: u32 = 0x07;

pub(crate) const BIND_TEXTURE_SLOT: u32 = 0x08;
pub(crate) const BIND_TEXTURE_HANDLE_LOW: u32 = 0x09;
/// Trigger: resolve and bind the latched handle.
pub(crate) const BIND_TEXTURE_HANDLE_HIGH: u32 = 0x0A;

pub(crate) const DRAW_FIRST: u32 = 0x10;
pub(crate) const DRAW_COUNT: u32 = 0x11;
pub(crate) const DRAW_INSTANCE_COUNT: u32 = 0x12;
pub(crate) const DRAW_BASE_INSTANCE: u32 = 0x13;
/// Trigger; the value is the primitive mode.
pub(crate) const DRAW_ARRAYS: u32 = 0x14;

pub(crate) const INDEX_BUFFER_ADDRESS_HIGH: u32 = 0x18;
pub(crate) const INDEX_BUFFER_ADDRESS_LOW: u32 = 0x19;
pub(crate) const INDEX_SIZE: u32 = 0x1A;
pub(crate) const INDEXED_COUNT: u32 = 0x1B;
pub(crate) const INDEXED_INSTANCE_COUNT: u32 = 0x1C;
pub(crate) const INDEXED_FIRST_INDEX: u32 = 0x1D;
pub(crate) const INDEXED_BASE_VERTEX: u32 = 0x1E;
pub(crate) const INDEXED_BASE_INSTANCE: u32 = 0x1F;
/// Trigger; the value is the primitive mode.
pub(crate) const DRAW_ELEMENTS: u32 = 0x20;

pub(crate) const ARRAYS_INDIRECT_ADDRESS_HIGH: u32 = 0x21;
pub(crate) const ARRAYS_INDIRECT_ADDRESS_LOW: u32 = 0x22;
pub(crate) const DRAW_ARRAYS_INDIRECT: u32 = 0x23;
pub(crate) const ELEMENTS_INDIRECT_ADDRESS_HIGH: u32 = 0x24;
pub(crate) const ELEMENTS_INDIRECT_ADDRESS_LOW: u32 = 0x25;
pub(crate) const DRAW_ELEMENTS_INDIRECT: u32 = 0x26;

const LAST_METHOD: u32 = DRAW_ELEMENTS_INDIRECT;

/// Largest host buffer used while fetching index data.
const INDEX_FETCH_CHUNK: u64 = 0x1_0000;

/// Primitive topology of a draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DrawPrimitive {
    Points = 0,
    Lines = 1,
    LineLoop = 2,
    LineStrip = 3,
    Triangles = 4,
    TriangleStrip = 5,
    TriangleFan = 6,
    Quads = 7,
    QuadStrip = 8,
    Polygon = 9,
    LinesAdjacency = 10,
    LineStripAdjacency = 11,
    TrianglesAdjacency = 12,
    TriangleStripAdjacency = 13,
    Patches = 14,
}

impl DrawPrimitive {
    pub fn from_raw(raw: u32) -> Option<Self> {
        use DrawPrimitive::*;
        const ALL: [DrawPrimitive; 15] = [
            Points,
            Lines,
            LineLoop,
            LineStrip,
            Triangles,
            TriangleStrip,
            TriangleFan,
            Quads,
            QuadStrip,
            Polygon,
            LinesAdjacency,
            LineStripAdjacency,
            TrianglesAdjacency,
            TriangleStripAdjacency,
            Patches,
        ];
        ALL.get(raw as usize).copied()
    }
}

/// Width of one index in an index buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    UnsignedByte,
    UnsignedShort,
    UnsignedInt,
}

impl IndexType {
    pub fn size(self) -> u32 {
        match self {
            Self::UnsignedByte => 1,
            Self::UnsignedShort => 2,
            Self::UnsignedInt => 4,
        }
    }

    fn from_size(size: u32) -> Option<Self> {
        match size {
            1 => Some(Self::UnsignedByte),
            2 => Some(Self::UnsignedShort),
            4 => Some(Self::UnsignedInt),
            _ => None,
        }
    }
}

/// Parameters of one indexed draw.
#[derive(Debug, Clone, Copy)]
struct IndexedDraw {
    count: u32,
    instance_count: u32,
    first_index: u32,
    base_vertex: i32,
}

pub struct Threed {
    regs: Box<[u32; ENGINE_REG_COUNT]>,
}

impl Threed {
    pub fn new() -> Self {
        Self {
            regs: Box::new([0u32; ENGINE_REG_COUNT]),
        }
    }

    fn reg(&self, method: u32) -> u32 {
        self.regs[method as usize]
    }

    fn reg_address(&self, high: u32, low: u32) -> u64 {
        address_from(self.reg(high), self.reg(low))
    }

    // ── Pool binding ─────────────────────────────────────────────────────

    fn handle_set_texture_pool(&mut self, ctx: &mut ExecContext<'_>) {
        let address = self.reg_address(TEXTURE_POOL_ADDRESS_HIGH, TEXTURE_POOL_ADDRESS_LOW);
        let count = self.reg(TEXTURE_POOL_COUNT);
        if ctx.state.texture_table.synchronize(address, count) {
            log::debug!("Threed: texture pool 0x{:X} ({} descriptors)", address, count);
        }
    }

    fn handle_set_sampler_pool(&mut self, ctx: &mut ExecContext<'_>) {
        let address = self.reg_address(SAMPLER_POOL_ADDRESS_HIGH, SAMPLER_POOL_ADDRESS_LOW);
        let count = self.reg(SAMPLER_POOL_COUNT);
        if ctx.state.sampler_table.synchronize(address, count) {
            log::debug!("Threed: sampler pool 0x{:X} ({} descriptors)", address, count);
        }
    }

    // ── Texture binding ──────────────────────────────────────────────────

    fn handle_bind_texture(&mut self, ctx: &mut ExecContext<'_>) -> Result<(), ExecError> {
        let slot = self.reg(BIND_TEXTURE_SLOT);
        let handle = TextureHandle(self.reg_address(BIND_TEXTURE_HANDLE_HIGH, BIND_TEXTURE_HANDLE_LOW));
        if slot >= MAX_TEXTURE_BINDINGS {
            log::error!("Threed: texture slot {} out of range", slot);
            return Err(QueueErrorInfo::engine(None).into());
        }
        if handle.0 == 0 {
            ctx.state.bound_textures[slot as usize] = None;
            return Ok(());
        }

        let texture = {
            let mem = ctx.env.shared.memory.read();
            let raw = ctx
                .state
                .texture_table
                .read(handle.texture_id(), &|va, buf| mem.gpu_read(va, buf))
                .map_err(table_fault)?;
            TextureDescriptor::decode(&raw)
        };
        let Some(texture) = texture else {
            log::error!("Threed: texture {} is not a valid descriptor", handle.texture_id());
            return Err(QueueErrorInfo::engine(None).into());
        };

        let sampler = match handle.sampler_id() {
            0 => None,
            id => {
                let mem = ctx.env.shared.memory.read();
                let raw = ctx
                    .state
                    .sampler_table
                    .read(id, &|va, buf| mem.gpu_read(va, buf))
                    .map_err(table_fault)?;
                match SamplerDescriptor::decode(&raw) {
                    Some(sampler) => Some(sampler),
                    None => {
                        log::error!("Threed: sampler {} is not a valid descriptor", id);
                        return Err(QueueErrorInfo::engine(None).into());
                    }
                }
            }
        };

        log::trace!("Threed: slot {} <- texture {} @0x{:X}", slot, handle.texture_id(), texture.address);
        ctx.state.bound_textures[slot as usize] = Some(BoundTexture {
            slot,
            handle,
            texture,
            sampler,
        });
        Ok(())
    }

    // ── Draws ────────────────────────────────────────────────────────────

    fn account_draw(ctx: &mut ExecContext<'_>, count: u32, instance_count: u32) {
        let stats = ctx.stats();
        stats.draws += 1;
        stats.vertices = stats.vertices.saturating_add(count as u64 * instance_count.max(1) as u64);
    }

    fn handle_draw_arrays(&mut self, mode: u32, ctx: &mut ExecContext<'_>) -> Result<(), ExecError> {
        check_mode(mode)?;
        let count = self.reg(DRAW_COUNT);
        let instances = self.reg(DRAW_INSTANCE_COUNT);
        log::trace!(
            "Threed: draw arrays first={} count={} instances={}",
            self.reg(DRAW_FIRST),
            count,
            instances
        );
        Self::account_draw(ctx, count, instances);
        Ok(())
    }

    fn fetch_indices(&self, ctx: &mut ExecContext<'_>, draw: IndexedDraw) -> Result<(), ExecError> {
        let Some(index_type) = IndexType::from_size(self.reg(INDEX_SIZE)) else {
            log::error!("Threed: bad index size {}", self.reg(INDEX_SIZE));
            return Err(QueueErrorInfo::engine(None).into());
        };
        let size = index_type.size() as u64;
        let base = self.reg_address(INDEX_BUFFER_ADDRESS_HIGH, INDEX_BUFFER_ADDRESS_LOW);
        let Some(start) = base.checked_add(draw.first_index as u64 * size) else {
            log::error!("Threed: index buffer 0x{:X} + {} wraps", base, draw.first_index);
            return Err(QueueErrorInfo::mmu(base, FaultAccess::Read).into());
        };
        let bytes = draw.count as u64 * size;
        if bytes > 0 {
            ctx.check_range(start, bytes, FaultAccess::Read)?;
        }
        let mut fetched = 0;
        let mut chunk = vec![0u8; bytes.min(INDEX_FETCH_CHUNK) as usize];
        while fetched < bytes {
            let len = (bytes - fetched).min(INDEX_FETCH_CHUNK) as usize;
            ctx.read(start + fetched, &mut chunk[..len])?;
            fetched += len as u64;
        }
        log::trace!(
            "Threed: draw elements count={} instances={} base_vertex={} ({:?} @0x{:X})",
            draw.count,
            draw.instance_count,
            draw.base_vertex,
            index_type,
            start
        );
        Self::account_draw(ctx, draw.count, draw.instance_count);
        Ok(())
    }

    fn handle_draw_elements(&mut self, mode: u32, ctx: &mut ExecContext<'_>) -> Result<(), ExecError> {
        check_mode(mode)?;
        let draw = IndexedDraw {
            count: self.reg(INDEXED_COUNT),
            instance_count: self.reg(INDEXED_INSTANCE_COUNT),
            first_index: self.reg(INDEXED_FIRST_INDEX),
            base_vertex: self.reg(INDEXED_BASE_VERTEX) as i32,
        };
        self.fetch_indices(ctx, draw)
    }

    fn handle_draw_arrays_indirect(&mut self, mode: u32, ctx: &mut ExecContext<'_>) -> Result<(), ExecError> {
        check_mode(mode)?;
        let address = self.reg_address(ARRAYS_INDIRECT_ADDRESS_HIGH, ARRAYS_INDIRECT_ADDRESS_LOW);
        let mut raw = [0u8; 16];
        ctx.read(address, &mut raw)?;
        let mut record = [0u32; 4];
        LittleEndian::read_u32_into(&raw, &mut record);
        let [count, instance_count, first, base_instance] = record;
        log::trace!(
            "Threed: indirect draw arrays first={} count={} instances={} base_instance={}",
            first,
            count,
            instance_count,
            base_instance
        );
        Self::account_draw(ctx, count, instance_count);
        Ok(())
    }

    fn handle_draw_elements_indirect(&mut self, mode: u32, ctx: &mut ExecContext<'_>) -> Result<(), ExecError> {
        check_mode(mode)?;
        let address = self.reg_address(ELEMENTS_INDIRECT_ADDRESS_HIGH, ELEMENTS_INDIRECT_ADDRESS_LOW);
        let mut raw = [0u8; 20];
        ctx.read(address, &mut raw)?;
        let mut record = [0u32; 5];
        LittleEndian::read_u32_into(&raw, &mut record);
        let draw = IndexedDraw {
            count: record[0],
            instance_count: record[1],
            first_index: record[2],
            base_vertex: record[3] as i32,
        };
        self.fetch_indices(ctx, draw)
    }
}

fn check_mode(mode: u32) -> Result<(), ExecError> {
    match DrawPrimitive::from_raw(mode) {
        Some(_) => Ok(()),
        None => {
            log::error!("Threed: bad primitive mode {}", mode);
            Err(QueueErrorInfo::engine(None).into())
        }
    }
}

fn table_fault(err: TableReadError) -> ExecError {
    match err {
        TableReadError::Unmapped(va) => QueueErrorInfo::mmu(va, FaultAccess::Read).into(),
        TableReadError::Unbound | TableReadError::OutOfRange(_) => {
            log::error!("Threed: descriptor lookup failed: {:?}", err);
            QueueErrorInfo::engine(None).into()
        }
    }
}

impl Default for Threed {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for Threed {
    fn class_id(&self) -> ClassId {
        ClassId::Threed
    }

    fn write_reg(&mut self, method: u32, value: u32, ctx: &mut ExecContext<'_>) -> Result<(), ExecError> {
        if method > LAST_METHOD {
            log::error!("Threed: unknown method 0x{:X}", method);
            return Err(QueueErrorInfo::engine(None).into());
        }
        self.regs[method as usize] = value;

        match method {
            SET_TEXTURE_POOL => {
                self.handle_set_texture_pool(ctx);
                Ok(())
            }
            SET_SAMPLER_POOL => {
                self.handle_set_sampler_pool(ctx);
                Ok(())
            }
            BIND_TEXTURE_HANDLE_HIGH => self.handle_bind_texture(ctx),
            DRAW_ARRAYS => self.handle_draw_arrays(value, ctx),
            DRAW_ELEMENTS => self.handle_draw_elements(value, ctx),
            DRAW_ARRAYS_INDIRECT => self.handle_draw_arrays_indirect(value, ctx),
            DRAW_ELEMENTS_INDIRECT => self.handle_draw_elements_indirect(value, ctx),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::engines::split_address;
    use crate::executor::tests::{map_scratch, with_context};
    use crate::descriptor_pool::DescriptorKind;
    use crate::resource::{Format, Sampler, TextureTarget};
    use nvn_common::settings::DeviceSettings;
    use nvn_common::DESCRIPTOR_SIZE;

    fn program(engine: &mut Threed, ctx: &mut ExecContext<'_>, regs: &[(u32, u32)]) -> Result<(), ExecError> {
        regs.iter().try_for_each(|&(m, v)| engine.write_reg(m, v, ctx))
    }

    fn descriptor(address: u64, width: u32) -> TextureDescriptor {
        TextureDescriptor {
            address,
            width,
            height: 16,
            depth: 1,
            levels: 1,
            format: Format::RGBA8,
            base_level: 0,
            level_count: 1,
            kind: DescriptorKind::Texture,
            target: TextureTarget::Target2D,
        }
    }

    fn bind_pools(engine: &mut Threed, ctx: &mut ExecContext<'_>, textures: u64, samplers: u64) {
        let [th, tl] = split_address(textures);
        let [sh, sl] = split_address(samplers);
        program(
            engine,
            ctx,
            &[
                (TEXTURE_POOL_ADDRESS_HIGH, th),
                (TEXTURE_POOL_ADDRESS_LOW, tl),
                (TEXTURE_POOL_COUNT, 16),
                (SET_TEXTURE_POOL, 0),
                (SAMPLER_POOL_ADDRESS_HIGH, sh),
                (SAMPLER_POOL_ADDRESS_LOW, sl),
                (SAMPLER_POOL_COUNT, 16),
                (SET_SAMPLER_POOL, 0),
            ],
        )
        .unwrap();
    }

    fn bind(engine: &mut Threed, ctx: &mut ExecContext<'_>, slot: u32, handle: TextureHandle) -> Result<(), ExecError> {
        let [hi, lo] = split_address(handle.0);
        program(
            engine,
            ctx,
            &[(BIND_TEXTURE_SLOT, slot), (BIND_TEXTURE_HANDLE_LOW, lo), (BIND_TEXTURE_HANDLE_HIGH, hi)],
        )
    }

    #[test]
    fn test_bind_texture_resolves_descriptors() {
        let device = Device::new(DeviceSettings::default());
        let va = map_scratch(&device, 0x2000);
        let sampler_base = va + 0x1000;
        {
            let mut mem = device.shared.memory.write();
            mem.gpu_write(va + 3 * DESCRIPTOR_SIZE as u64, &descriptor(0x8000, 64).encode()).unwrap();
            let sampler = SamplerDescriptor {
                sampler: Sampler::default(),
            };
            mem.gpu_write(sampler_base + 2 * DESCRIPTOR_SIZE as u64, &sampler.encode()).unwrap();
        }

        with_context(&device, |ctx| {
            let mut engine = Threed::new();
            bind_pools(&mut engine, ctx, va, sampler_base);
            let handle = device.texture_handle(3, 2).unwrap();
            bind(&mut engine, ctx, 5, handle).unwrap();

            let bound = ctx.state.bound_textures[5].expect("slot 5 bound");
            assert_eq!(bound.handle, handle);
            assert_eq!(bound.texture.width, 64);
            assert_eq!(bound.sampler.map(|s| s.sampler), Some(Sampler::default()));

            bind(&mut engine, ctx, 5, TextureHandle(0)).unwrap();
            assert!(ctx.state.bound_textures[5].is_none());
        });
    }

    #[test]
    fn test_stale_descriptor_until_invalidated() {
        let device = Device::new(DeviceSettings::default());
        let va = map_scratch(&device, 0x1000);
        device.shared.memory.write().gpu_write(va + 32, &descriptor(0x8000, 64).encode()).unwrap();

        with_context(&device, |ctx| {
            let mut engine = Threed::new();
            bind_pools(&mut engine, ctx, va, va + 0x800);
            bind(&mut engine, ctx, 0, device.texture_handle(1, 0).unwrap()).unwrap();

            ctx.env.shared.memory.write().gpu_write(va + 32, &descriptor(0x8000, 128).encode()).unwrap();
            bind(&mut engine, ctx, 0, device.texture_handle(1, 0).unwrap()).unwrap();
            assert_eq!(ctx.state.bound_textures[0].map(|b| b.texture.width), Some(64));

            ctx.state.texture_table.invalidate();
            bind(&mut engine, ctx, 0, device.texture_handle(1, 0).unwrap()).unwrap();
            assert_eq!(ctx.state.bound_textures[0].map(|b| b.texture.width), Some(128));
        });
    }

    #[test]
    fn test_bind_unregistered_texture_faults() {
        let device = Device::new(DeviceSettings::default());
        let va = map_scratch(&device, 0x1000);
        let err = with_context(&device, |ctx| {
            let mut engine = Threed::new();
            bind_pools(&mut engine, ctx, va, va + 0x800);
            bind(&mut engine, ctx, 0, device.texture_handle(4, 0).unwrap())
        })
        .unwrap_err();
        assert_eq!(err, ExecError::Fault(QueueErrorInfo::engine(None)));
    }

    #[test]
    fn test_bind_slot_out_of_range_faults() {
        let device = Device::new(DeviceSettings::default());
        let err = with_context(&device, |ctx| bind(&mut Threed::new(), ctx, 32, TextureHandle(1))).unwrap_err();
        assert_eq!(err, ExecError::Fault(QueueErrorInfo::engine(None)));
    }

    #[test]
    fn test_draw_arrays_counts_vertices() {
        let device = Device::new(DeviceSettings::default());
        with_context(&device, |ctx| {
            let mut engine = Threed::new();
            program(
                &mut engine,
                ctx,
                &[(DRAW_FIRST, 0), (DRAW_COUNT, 3), (DRAW_INSTANCE_COUNT, 4), (DRAW_BASE_INSTANCE, 0)],
            )
            .unwrap();
            engine.write_reg(DRAW_ARRAYS, DrawPrimitive::Triangles as u32, ctx).unwrap();
            assert_eq!(ctx.state.stats.draws, 1);
            assert_eq!(ctx.state.stats.vertices, 12);

            let err = engine.write_reg(DRAW_ARRAYS, 99, ctx).unwrap_err();
            assert_eq!(err, ExecError::Fault(QueueErrorInfo::engine(None)));
        });
    }

    #[test]
    fn test_draw_elements_reads_index_buffer() {
        let device = Device::new(DeviceSettings::default());
        let va = map_scratch(&device, 0x1000);
        with_context(&device, |ctx| {
            let mut engine = Threed::new();
            let [hi, lo] = split_address(va + 0xFF0);
            program(
                &mut engine,
                ctx,
                &[
                    (INDEX_BUFFER_ADDRESS_HIGH, hi),
                    (INDEX_BUFFER_ADDRESS_LOW, lo),
                    (INDEX_SIZE, 2),
                    (INDEXED_COUNT, 6),
                    (INDEXED_INSTANCE_COUNT, 1),
                ],
            )
            .unwrap();
            engine.write_reg(DRAW_ELEMENTS, DrawPrimitive::Triangles as u32, ctx).unwrap();
            assert_eq!(ctx.state.stats.vertices, 6);

            engine.write_reg(INDEXED_COUNT, 16, ctx).unwrap();
            let err = engine.write_reg(DRAW_ELEMENTS, DrawPrimitive::Triangles as u32, ctx).unwrap_err();
            assert_eq!(err, ExecError::Fault(QueueErrorInfo::mmu(va + 0x1000, FaultAccess::Read)));
        });
    }

    #[test]
    fn test_indirect_draw_with_huge_count_faults() {
        let device = Device::new(DeviceSettings::default());
        let va = map_scratch(&device, 0x1000);
        let mut raw = [0u8; 20];
        LittleEndian::write_u32_into(&[u32::MAX, u32::MAX, 0, 0, 0], &mut raw);
        device.shared.memory.write().gpu_write(va, &raw).unwrap();

        let err = with_context(&device, |ctx| {
            let mut engine = Threed::new();
            let [eh, el] = split_address(va);
            let [ih, il] = split_address(va + 0x100);
            program(
                &mut engine,
                ctx,
                &[
                    (INDEX_BUFFER_ADDRESS_HIGH, ih),
                    (INDEX_BUFFER_ADDRESS_LOW, il),
                    (INDEX_SIZE, 4),
                    (ELEMENTS_INDIRECT_ADDRESS_HIGH, eh),
                    (ELEMENTS_INDIRECT_ADDRESS_LOW, el),
                    (DRAW_ELEMENTS_INDIRECT, DrawPrimitive::Triangles as u32),
                ],
            )
        })
        .unwrap_err();
        assert_eq!(err, ExecError::Fault(QueueErrorInfo::mmu(va + 0x1000, FaultAccess::Read)));
    }

    #[test]
    fn test_index_buffer_address_wrap_faults() {
        let device = Device::new(DeviceSettings::default());
        let err = with_context(&device, |ctx| {
            let mut engine = Threed::new();
            program(
                &mut engine,
                ctx,
                &[
                    (INDEX_BUFFER_ADDRESS_HIGH, u32::MAX),
                    (INDEX_BUFFER_ADDRESS_LOW, u32::MAX),
                    (INDEX_SIZE, 4),
                    (INDEXED_COUNT, 1),
                    (INDEXED_FIRST_INDEX, 2),
                ],
            )
            .unwrap();
            engine.write_reg(DRAW_ELEMENTS, DrawPrimitive::Points as u32, ctx)
        })
        .unwrap_err();
        assert_eq!(err, ExecError::Fault(QueueErrorInfo::mmu(u64::MAX, FaultAccess::Read)));
    }

    #[test]
    fn test_indirect_draws_read_records() {
        let device = Device::new(DeviceSettings::default());
        let va = map_scratch(&device, 0x1000);
        let mut raw = [0u8; 36];
        LittleEndian::write_u32_into(&[3, 2, 0, 0, 6, 1, 0, 0, 0], &mut raw);
        device.shared.memory.write().gpu_write(va, &raw).unwrap();

        with_context(&device, |ctx| {
            let mut engine = Threed::new();
            let [ah, al] = split_address(va);
            let [eh, el] = split_address(va + 16);
            let [ih, il] = split_address(va + 0x100);
            program(
                &mut engine,
                ctx,
                &[
                    (ARRAYS_INDIRECT_ADDRESS_HIGH, ah),
                    (ARRAYS_INDIRECT_ADDRESS_LOW, al),
                    (DRAW_ARRAYS_INDIRECT, DrawPrimitive::Points as u32),
                    (INDEX_BUFFER_ADDRESS_HIGH, ih),
                    (INDEX_BUFFER_ADDRESS_LOW, il),
                    (INDEX_SIZE, 4),
                    (ELEMENTS_INDIRECT_ADDRESS_HIGH, eh),
                    (ELEMENTS_INDIRECT_ADDRESS_LOW, el),
                    (DRAW_ELEMENTS_INDIRECT, DrawPrimitive::Triangles as u32),
                ],
            )
            .unwrap();
            assert_eq!(ctx.state.stats.draws, 2);
            assert_eq!(ctx.state.stats.vertices, 6 + 6);
        });
    }
}
