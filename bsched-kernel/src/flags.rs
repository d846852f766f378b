// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use bitflags::bitflags;

bitflags! {
    /// Routing and lifetime flags carried by every kernel.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct KernelFlags: u8 {
        const CARRIES_PARENT = 1 << 0;
        const DO_NOT_DELETE = 1 << 1;
        const MOVES_UPSTREAM = 1 << 2;
        const MOVES_DOWNSTREAM = 1 << 3;
        const MOVES_EVERYWHERE = 1 << 4;
        const MOVES_SOMEWHERE = 1 << 5;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_and_check_flags() {
        let f = KernelFlags::MOVES_UPSTREAM | KernelFlags::CARRIES_PARENT;
        assert!(f.contains(KernelFlags::MOVES_UPSTREAM));
        assert!(f.contains(KernelFlags::CARRIES_PARENT));
        assert!(!f.contains(KernelFlags::MOVES_EVERYWHERE));
    }

    #[test]
    fn unset_clears_only_that_bit() {
        let mut f = KernelFlags::MOVES_UPSTREAM | KernelFlags::DO_NOT_DELETE;
        f.remove(KernelFlags::MOVES_UPSTREAM);
        assert!(!f.contains(KernelFlags::MOVES_UPSTREAM));
        assert!(f.contains(KernelFlags::DO_NOT_DELETE));
    }

    #[test]
    fn round_trips_through_bits() {
        let f = KernelFlags::MOVES_EVERYWHERE | KernelFlags::MOVES_SOMEWHERE;
        assert_eq!(KernelFlags::from_bits_truncate(f.bits()), f);
    }
}
