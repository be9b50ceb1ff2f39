// SPDX-FileCopyrightText: 2025 nvn-rs contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Typed views over pool memory: buffers, textures, texture views and
//! samplers. These carry no behaviour of their own; descriptor pools and
//! the command recorder consume them.

use thiserror::Error;

use nvn_common::{is_aligned, GpuVAddr};

use crate::finalize::Retire;
use crate::memory_pool::{GpuAccess, MemoryPool, PoolRef};

/// Required alignment of a texture's offset inside its pool.
pub const TEXTURE_ALIGNMENT: u64 = 0x200;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResourceError {
    #[error("pool has no GPU address")]
    NoGpuAccess,

    #[error("range [0x{offset:X}, +0x{size:X}) exceeds pool size 0x{pool_size:X}")]
    OutOfBounds { offset: u64, size: u64, pool_size: u64 },

    #[error("offset 0x{0:X} is misaligned")]
    MisalignedOffset(u64),

    #[error("resource size must be non-zero")]
    ZeroSize,

    #[error("dimensions {width}x{height}x{depth} are invalid for {target:?}")]
    InvalidDimensions {
        target: TextureTarget,
        width: u32,
        height: u32,
        depth: u32,
    },

    #[error("format {0:#X} has no known texel size")]
    UnknownFormat(u32),

    #[error("{levels} mip levels requested, at most {max} possible")]
    InvalidLevels { levels: u32, max: u32 },
}

/// Opaque texel format. Only the texel size is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Format(pub u32);

impl Format {
    pub const NONE: Self = Self(0);
    pub const R8: Self = Self(0x1);
    pub const RG8: Self = Self(0x2);
    pub const RGBA8: Self = Self(0x4);
    pub const R16F: Self = Self(0x8);
    pub const RGBA16F: Self = Self(0xB);
    pub const R32F: Self = Self(0x10);
    pub const R32UI: Self = Self(0x12);
    pub const RGBA32F: Self = Self(0x16);
    pub const DEPTH24_STENCIL8: Self = Self(0x3D);

    pub fn bytes_per_texel(self) -> Option<u32> {
        match self {
            Self::R8 => Some(1),
            Self::RG8 | Self::R16F => Some(2),
            Self::RGBA8 | Self::R32F | Self::R32UI | Self::DEPTH24_STENCIL8 => Some(4),
            Self::RGBA16F => Some(8),
            Self::RGBA32F => Some(16),
            _ => None,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureTarget {
    Target1D = 0,
    Target2D = 1,
    Target3D = 2,
    Target2DArray = 3,
    Cubemap = 4,
}

impl TextureTarget {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Target1D),
            1 => Some(Self::Target2D),
            2 => Some(Self::Target3D),
            3 => Some(Self::Target2DArray),
            4 => Some(Self::Cubemap),
            _ => None,
        }
    }
}

/// Check a `[offset, offset + size)` range against a pool and return its VA.
fn gpu_range(pool: &MemoryPool, offset: u64, size: u64) -> Result<GpuVAddr, ResourceError> {
    if size == 0 {
        return Err(ResourceError::ZeroSize);
    }
    if pool.gpu_access() == GpuAccess::None {
        return Err(ResourceError::NoGpuAccess);
    }
    let base = pool.gpu_address().ok_or(ResourceError::NoGpuAccess)?;
    match offset.checked_add(size) {
        Some(end) if end <= pool.size() => Ok(base + offset),
        _ => Err(ResourceError::OutOfBounds {
            offset,
            size,
            pool_size: pool.size(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Buffer
// ---------------------------------------------------------------------------

/// A byte range of a pool addressed by the GPU.
pub struct Buffer {
    _pool: PoolRef,
    offset: u64,
    size: u64,
    address: GpuVAddr,
}

impl Buffer {
    pub fn new(pool: &MemoryPool, offset: u64, size: u64) -> Result<Self, ResourceError> {
        let address = gpu_range(pool, offset, size)?;
        Ok(Self {
            _pool: pool.reference(),
            offset,
            size,
            address,
        })
    }

    pub fn address(&self) -> GpuVAddr {
        self.address
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn pool_offset(&self) -> u64 {
        self.offset
    }
}

impl Retire for Buffer {}

// ---------------------------------------------------------------------------
// Texture
// ---------------------------------------------------------------------------

/// Texture parameters; [`TextureBuilder::storage_size`] tells how many pool
/// bytes [`TextureBuilder::build`] will claim.
#[derive(Debug, Clone)]
pub struct TextureBuilder {
    target: TextureTarget,
    format: Format,
    width: u32,
    height: u32,
    depth: u32,
    levels: u32,
}

impl Default for TextureBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TextureBuilder {
    pub fn new() -> Self {
        Self {
            target: TextureTarget::Target2D,
            format: Format::RGBA8,
            width: 1,
            height: 1,
            depth: 1,
            levels: 1,
        }
    }

    pub fn set_target(mut self, target: TextureTarget) -> Self {
        self.target = target;
        self
    }

    pub fn set_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    pub fn set_size_1d(self, width: u32) -> Self {
        self.set_size_3d(width, 1, 1)
    }

    pub fn set_size_2d(self, width: u32, height: u32) -> Self {
        self.set_size_3d(width, height, 1)
    }

    pub fn set_size_3d(mut self, width: u32, height: u32, depth: u32) -> Self {
        self.width = width;
        self.height = height;
        self.depth = depth;
        self
    }

    pub fn set_levels(mut self, levels: u32) -> Self {
        self.levels = levels;
        self
    }

    fn max_levels(&self) -> u32 {
        let largest = match self.target {
            TextureTarget::Target3D => self.width.max(self.height).max(self.depth),
            _ => self.width.max(self.height),
        };
        u32::BITS - largest.max(1).leading_zeros()
    }

    fn validate(&self) -> Result<u32, ResourceError> {
        let bpp = self
            .format
            .bytes_per_texel()
            .ok_or(ResourceError::UnknownFormat(self.format.0))?;
        let (w, h, d) = (self.width, self.height, self.depth);
        let ok = w > 0
            && h > 0
            && d > 0
            && match self.target {
                TextureTarget::Target1D => h == 1 && d == 1,
                TextureTarget::Target2D => d == 1,
                TextureTarget::Target3D | TextureTarget::Target2DArray => true,
                TextureTarget::Cubemap => w == h && d == 6,
            };
        if !ok {
            return Err(ResourceError::InvalidDimensions {
                target: self.target,
                width: w,
                height: h,
                depth: d,
            });
        }
        let max = self.max_levels();
        if self.levels == 0 || self.levels > max {
            return Err(ResourceError::InvalidLevels {
                levels: self.levels,
                max,
            });
        }
        Ok(bpp)
    }

    /// Bytes of pool memory the texture occupies, or an error for invalid
    /// parameters.
    pub fn storage_size(&self) -> Result<u64, ResourceError> {
        let bpp = self.validate()? as u64;
        let minified_depth = self.target == TextureTarget::Target3D;
        let size = (0..self.levels)
            .map(|level| {
                let w = (self.width >> level).max(1) as u64;
                let h = (self.height >> level).max(1) as u64;
                let d = if minified_depth {
                    (self.depth >> level).max(1) as u64
                } else {
                    self.depth as u64
                };
                w * h * d * bpp
            })
            .sum();
        Ok(size)
    }

    pub fn build(&self, pool: &MemoryPool, offset: u64) -> Result<Texture, ResourceError> {
        if !is_aligned(offset, TEXTURE_ALIGNMENT) {
            return Err(ResourceError::MisalignedOffset(offset));
        }
        let size = self.storage_size()?;
        let address = gpu_range(pool, offset, size)?;
        Ok(Texture {
            _pool: pool.reference(),
            address,
            size,
            target: self.target,
            format: self.format,
            width: self.width,
            height: self.height,
            depth: self.depth,
            levels: self.levels,
        })
    }
}

pub struct Texture {
    _pool: PoolRef,
    address: GpuVAddr,
    size: u64,
    target: TextureTarget,
    format: Format,
    width: u32,
    height: u32,
    depth: u32,
    levels: u32,
}

impl Texture {
    pub fn address(&self) -> GpuVAddr {
        self.address
    }

    pub fn storage_size(&self) -> u64 {
        self.size
    }

    pub fn target(&self) -> TextureTarget {
        self.target
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn levels(&self) -> u32 {
        self.levels
    }
}

impl Retire for Texture {}

/// Reinterpretation of a texture: format, target or a sub-range of levels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TextureView {
    pub format: Option<Format>,
    pub target: Option<TextureTarget>,
    pub base_level: u32,
    pub level_count: Option<u32>,
}

impl TextureView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_format(mut self, format: Format) -> Self {
        self.format = Some(format);
        self
    }

    pub fn set_target(mut self, target: TextureTarget) -> Self {
        self.target = Some(target);
        self
    }

    pub fn set_levels(mut self, base_level: u32, level_count: u32) -> Self {
        self.base_level = base_level;
        self.level_count = Some(level_count);
        self
    }
}

// ---------------------------------------------------------------------------
// Sampler
// ---------------------------------------------------------------------------

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Filter {
    Nearest = 0,
    #[default]
    Linear = 1,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MipFilter {
    #[default]
    None = 0,
    Nearest = 1,
    Linear = 2,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WrapMode {
    #[default]
    Repeat = 0,
    MirroredRepeat = 1,
    ClampToEdge = 2,
    ClampToBorder = 3,
}

impl Filter {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Nearest),
            1 => Some(Self::Linear),
            _ => None,
        }
    }
}

impl MipFilter {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::Nearest),
            2 => Some(Self::Linear),
            _ => None,
        }
    }
}

impl WrapMode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Repeat),
            1 => Some(Self::MirroredRepeat),
            2 => Some(Self::ClampToEdge),
            3 => Some(Self::ClampToBorder),
            _ => None,
        }
    }
}

/// Sampler state. Not backed by pool memory; registering it writes a
/// sampler descriptor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampler {
    pub min_filter: Filter,
    pub mag_filter: Filter,
    pub mip_filter: MipFilter,
    pub wrap: [WrapMode; 3],
    pub max_anisotropy: f32,
    pub min_lod: f32,
    pub max_lod: f32,
    pub lod_bias: f32,
    /// RGBA8 border colour.
    pub border_color: [u8; 4],
}

impl Default for Sampler {
    fn default() -> Self {
        Self {
            min_filter: Filter::Linear,
            mag_filter: Filter::Linear,
            mip_filter: MipFilter::None,
            wrap: [WrapMode::Repeat; 3],
            max_anisotropy: 1.0,
            min_lod: 0.0,
            max_lod: 1000.0,
            lod_bias: 0.0,
            border_color: [0; 4],
        }
    }
}
