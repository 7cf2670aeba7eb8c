//! Page table entry for software emulation.

use crate::PhysicalAddress;
use crate::swap::{SwapEntry, SwapKind};

use super::flags::PageFlags;

/// A single page table entry for software emulation.
///
/// This is a scale model of x86_64 using 20-bit addresses stored in 64-bit values.
/// The entry format:
/// - Bits 0-3: Flags
/// - Bits 4-19: Physical address (aligned to 16-byte pages)
/// - Bit 20: Huge bit (the entry maps a page directly at levels 1 and 2)
/// - Bits 21-22: Swap kind, for non-present entries that stand in for a page
///   whose contents are elsewhere (migrating or in device-private memory)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageEntry(usize);

impl PageEntry {
    /// Physical address mask (bits 4-19, aligned to 16-byte pages).
    const ADDRESS_MASK: usize = 0xF_FFF0;

    /// Flag bits mask (bits 0-3).
    const FLAGS_MASK: usize = 0xF;

    /// Huge page bit (bit 20, above the address field).
    const HUGE_PAGE_BIT: usize = 1 << 20;

    /// Swap kind field (bits 21-22), meaningful only in non-present entries.
    const SWAP_KIND_SHIFT: usize = 21;
    const SWAP_KIND_MASK: usize = 0x3 << Self::SWAP_KIND_SHIFT;

    /// Creates a new page table entry.
    ///
    /// The physical address must be page-aligned (lowest 4 bits must be zero for 16-byte pages).
    pub fn new(address: PhysicalAddress, flags: PageFlags) -> Self {
        debug_assert!(
            address.as_usize() & 0xF == 0,
            "physical address must be page-aligned (16-byte alignment)"
        );

        let addr_bits = address.as_usize() & Self::ADDRESS_MASK;
        let flag_bits = flags.to_raw() & Self::FLAGS_MASK;
        Self(addr_bits | flag_bits)
    }

    /// Creates a new entry that maps a contiguous frame range directly at a
    /// level above the leaf tables (a collapsed mapping).
    pub fn new_huge(address: PhysicalAddress, flags: PageFlags) -> Self {
        Self(Self::new(address, flags).0 | Self::HUGE_PAGE_BIT)
    }

    /// Creates a new non-present entry encoding a swap-style placeholder.
    pub fn new_swap(swap: SwapEntry) -> Self {
        let addr_bits = swap.frame().start().as_usize() & Self::ADDRESS_MASK;
        Self(addr_bits | (swap.kind().as_raw() << Self::SWAP_KIND_SHIFT))
    }

    /// Returns the physical address stored in this entry.
    ///
    /// Returns None if the entry is not present.
    pub fn address(self) -> Option<PhysicalAddress> {
        if self.is_present() {
            Some(PhysicalAddress::new(self.0 & Self::ADDRESS_MASK))
        } else {
            None
        }
    }

    /// Returns the flags for this entry.
    pub fn flags(self) -> PageFlags {
        PageFlags::from_raw(self.0 & Self::FLAGS_MASK)
    }

    /// Sets the flags for this entry, preserving everything else.
    pub fn set_flags(&mut self, flags: PageFlags) {
        let other_bits = self.0 & !Self::FLAGS_MASK;
        let flag_bits = flags.to_raw() & Self::FLAGS_MASK;
        self.0 = other_bits | flag_bits;
    }

    /// Returns whether this entry is present (valid).
    pub fn is_present(self) -> bool {
        self.flags().is_present()
    }

    /// Returns whether this entry is empty (all zero).
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Returns whether this entry is a collapsed (huge) mapping.
    pub fn is_huge(self) -> bool {
        self.is_present() && (self.0 & Self::HUGE_PAGE_BIT != 0)
    }

    /// Returns whether this entry is a swap-style placeholder.
    pub fn is_swap(self) -> bool {
        !self.is_present() && (self.0 & Self::SWAP_KIND_MASK != 0)
    }

    /// Decodes the swap-style placeholder held by this entry, if any.
    pub fn swap_entry(self) -> Option<SwapEntry> {
        if !self.is_swap() {
            return None;
        }
        let kind = SwapKind::from_raw((self.0 & Self::SWAP_KIND_MASK) >> Self::SWAP_KIND_SHIFT)
            .expect("swap kind bits are non-zero in a swap entry");
        let frame = PhysicalAddress::new(self.0 & Self::ADDRESS_MASK).frame_number();
        Some(SwapEntry::new(kind, frame))
    }

    /// Clears this entry (sets it to zero).
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Returns the raw usize value of this entry.
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Creates an entry from a raw usize value.
    pub const fn from_usize(value: usize) -> Self {
        Self(value)
    }
}

impl Default for PageEntry {
    fn default() -> Self {
        Self(0)
    }
}
