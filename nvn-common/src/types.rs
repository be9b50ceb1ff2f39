// SPDX-FileCopyrightText: 2025 nvn-rs contributors
// SPDX-License-Identifier: GPL-3.0-or-later

/// GPU virtual address (40 bits used).
pub type GpuVAddr = u64;

/// Address in the device's physical backing space.
pub type PhysAddr = u64;

/// Memory pool page size (4 KiB).
pub const PAGE_SIZE: usize = 0x1000;

/// Page size as u64 for address math.
pub const PAGE_SIZE_U64: u64 = PAGE_SIZE as u64;

/// Page shift (log2 of PAGE_SIZE).
pub const PAGE_SHIFT: u32 = 12;

/// Page mask for alignment checks.
pub const PAGE_MASK: u64 = PAGE_SIZE_U64 - 1;

/// Granularity of virtual pool mappings (64 KiB).
pub const VIRTUAL_PAGE_SIZE: u64 = 0x1_0000;

/// Size of one texture or sampler descriptor record.
pub const DESCRIPTOR_SIZE: usize = 32;

/// Leading texture descriptors owned by the driver.
pub const RESERVED_TEXTURE_DESCRIPTORS: u32 = 256;

/// Leading sampler descriptors owned by the driver.
pub const RESERVED_SAMPLER_DESCRIPTORS: u32 = 256;

/// Largest texture pool, bounded by the 20-bit texture index of a handle.
pub const MAX_TEXTURE_POOL_SIZE: u32 = 1 << 20;

/// Largest sampler pool, bounded by the 12-bit sampler index of a handle.
pub const MAX_SAMPLER_POOL_SIZE: u32 = 1 << 12;

/// Alignment of command memory blocks.
pub const COMMAND_ALIGNMENT: u64 = 4;

/// Alignment of control memory blocks.
pub const CONTROL_ALIGNMENT: u64 = 8;

/// Smallest command memory block a recorder accepts.
pub const MIN_COMMAND_SIZE: u64 = 0x100;

/// Smallest control memory block a recorder accepts.
pub const MIN_CONTROL_SIZE: u64 = 0x40;

/// Alignment of indirect draw/dispatch argument records.
pub const INDIRECT_ALIGNMENT: u64 = 4;

/// Align a value up to the given alignment.
#[inline]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    let mask = alignment - 1;
    (value + mask) & !mask
}

/// Align a value down to the given alignment.
#[inline]
pub const fn align_down(value: u64, alignment: u64) -> u64 {
    value & !(alignment - 1)
}

/// Check if a value is a multiple of a power-of-two alignment.
#[inline]
pub const fn is_aligned(value: u64, alignment: u64) -> bool {
    value & (alignment - 1) == 0
}

/// Check if a value is page-aligned.
#[inline]
pub const fn is_page_aligned(value: u64) -> bool {
    value & PAGE_MASK == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, PAGE_SIZE_U64), 0);
        assert_eq!(align_up(1, PAGE_SIZE_U64), PAGE_SIZE_U64);
        assert_eq!(align_up(PAGE_SIZE_U64, PAGE_SIZE_U64), PAGE_SIZE_U64);
        assert_eq!(
            align_up(PAGE_SIZE_U64 + 1, PAGE_SIZE_U64),
            PAGE_SIZE_U64 * 2
        );
    }

    #[test]
    fn test_align_down() {
        assert_eq!(align_down(0, PAGE_SIZE_U64), 0);
        assert_eq!(align_down(1, PAGE_SIZE_U64), 0);
        assert_eq!(align_down(VIRTUAL_PAGE_SIZE + 0x10, VIRTUAL_PAGE_SIZE), VIRTUAL_PAGE_SIZE);
    }

    #[test]
    fn test_is_aligned() {
        assert!(is_aligned(0, CONTROL_ALIGNMENT));
        assert!(is_aligned(16, CONTROL_ALIGNMENT));
        assert!(!is_aligned(12, CONTROL_ALIGNMENT));
        assert!(is_aligned(12, COMMAND_ALIGNMENT));
    }

    #[test]
    fn test_is_page_aligned() {
        assert!(is_page_aligned(0));
        assert!(is_page_aligned(PAGE_SIZE_U64 * 100));
        assert!(!is_page_aligned(1));
        assert!(!is_page_aligned(PAGE_SIZE_U64 + 1));
    }
}
