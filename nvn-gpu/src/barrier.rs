// SPDX-FileCopyrightText: 2025 nvn-rs contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use bitflags::bitflags;

bitflags! {
    /// In-stream ordering and cache invalidation bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BarrierBits: u32 {
        const ORDER_PRIMITIVES              = 0x001;
        const ORDER_FRAGMENTS               = 0x002;
        const ORDER_FRAGMENTS_TILED         = 0x004;
        const ORDER_INDIRECT_DATA           = 0x008;
        const INVALIDATE_TEXTURE            = 0x010;
        const INVALIDATE_SHADER             = 0x020;
        const INVALIDATE_TEXTURE_DESCRIPTOR = 0x040;
        const INVALIDATE_ZCULL              = 0x080;
        const INVALIDATE_L2_CACHE           = 0x100;

        const ORDER_MASK = Self::ORDER_PRIMITIVES.bits()
            | Self::ORDER_FRAGMENTS.bits()
            | Self::ORDER_FRAGMENTS_TILED.bits()
            | Self::ORDER_INDIRECT_DATA.bits();
    }
}

impl BarrierBits {
    /// Whether the barrier makes pending GPU writes visible to later reads.
    pub fn drains_writes(self) -> bool {
        self.intersects(Self::ORDER_MASK | Self::INVALIDATE_L2_CACHE)
    }
}
