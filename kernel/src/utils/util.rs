// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2022-2023 SUSE LLC
//
// Author: Joerg Roedel <jroedel@suse.de>

/// Aligns `addr` upwards to the next multiple of `align`, which must be a
/// power of two.
pub const fn align_up(addr: usize, align: usize) -> usize {
    (addr.wrapping_sub(1) | (align - 1)).wrapping_add(1)
}

/// Aligns `addr` downwards to a multiple of `align`, which must be a power
/// of two.
pub const fn align_down(addr: usize, align: usize) -> usize {
    addr & !(align - 1)
}

/// Checks whether `addr` is a multiple of `align`, which must be a power of
/// two.
pub const fn is_aligned(addr: usize, align: usize) -> bool {
    (addr & (align - 1)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(7, 4), 8);
        assert_eq!(align_up(8, 4), 8);
        assert_eq!(align_up(0, 16), 0);
    }

    #[test]
    fn test_align_down() {
        assert_eq!(align_down(7, 4), 4);
        assert_eq!(align_down(8, 4), 8);
    }

    #[test]
    fn test_is_aligned() {
        assert!(is_aligned(32, 16));
        assert!(!is_aligned(33, 16));
    }
}
