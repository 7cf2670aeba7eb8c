//! Page table structure for software emulation.

use core::ptr::NonNull;

use crate::{PhysicalAddress, address::AddressTranslator};

use super::entry::PageEntry;

/// Number of entries in a software-emulated page table.
/// With 4-bit indexes, we have 16 entries per table.
const ENTRY_COUNT: usize = 16;

/// A page table for software emulation.
///
/// This is a scale model of x86_64 page tables:
/// - 20-bit virtual addresses (stored as usize with sign-extension)
/// - 4 levels of page tables (level 3 down to level 0)
/// - 4-bit index at each level (16 entries per table)
/// - 4-bit page offset (16-byte pages)
///
/// Address layout:
/// - Bits 0-3: Page offset (16 bytes)
/// - Bits 4-7: Level 0 index (PT)
/// - Bits 8-11: Level 1 index (PD)
/// - Bits 12-15: Level 2 index (PDP)
/// - Bits 16-19: Level 3 index (root)
///
/// The entries are stored inline and the table is aligned to its own size, so
/// tables are naturally aligned in physical memory and the table containing an
/// entry can be recovered from the entry's address.
#[repr(align(128))]
pub struct PageTable {
    /// The entries in this page table.
    entries: [PageEntry; ENTRY_COUNT],
}

impl PageTable {
    /// Creates a new, empty page table.
    ///
    /// All entries are initialized to zero (not present).
    pub const fn new() -> Self {
        Self {
            entries: [PageEntry::from_usize(0); ENTRY_COUNT],
        }
    }

    /// Returns the entry at the given index.
    ///
    /// # Panics
    /// Panics if index >= 16.
    pub fn entry(&self, index: usize) -> PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        self.entries[index]
    }

    /// Returns a mutable reference to the entry at the given index.
    ///
    /// # Panics
    /// Panics if index >= 16.
    pub fn entry_mut(&mut self, index: usize) -> &mut PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        &mut self.entries[index]
    }

    /// Returns a pointer to the entry at the given index.
    ///
    /// # Panics
    /// Panics if index >= 16.
    pub fn entry_ptr(&self, index: usize) -> NonNull<PageEntry> {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        NonNull::from(&self.entries[index])
    }

    /// Returns the number of entries in this page table.
    pub const fn len(&self) -> usize {
        ENTRY_COUNT
    }

    /// Returns the physical address of this page table.
    ///
    /// This is the address that would be stored in a parent page table entry
    /// or used as the root table address.
    pub fn physical_address(&self) -> PhysicalAddress {
        let ptr = self.entries.as_ptr() as *const u8;
        let translator = AddressTranslator::current();
        PhysicalAddress::new(translator.ptr_to_phys(ptr))
    }

    /// Activates this page table by setting it as the current root table.
    ///
    /// In software emulation, this would typically update a thread-local or global
    /// state to track the current page table.
    ///
    /// # Safety
    /// This function is unsafe because loading an invalid page table can cause
    /// undefined behavior. The caller must ensure:
    /// - The page table correctly maps all memory that will be accessed
    /// - The kernel is properly mapped
    /// - The page table itself is mapped
    pub unsafe fn activate(&self) {
        // In software emulation, we don't actually change hardware state.
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}
