//! Page table structure for x86_64 architecture.

use core::ptr::NonNull;

use x86_64::{
    PhysAddr,
    registers::control::{Cr3, Cr3Flags},
    structures::paging::PhysFrame,
};

use crate::{PhysicalAddress, address::AddressTranslator};

use super::entry::PageEntry;

/// Number of entries in an x86_64 page table.
const ENTRY_COUNT: usize = 512;

/// A page table for x86_64 architecture.
///
/// This represents a single level in the page table hierarchy. On x86_64 with
/// 4-level paging, there are four levels: PML4 (level 3), PDPT (level 2),
/// PD (level 1), and PT (level 0).
///
/// The entries are stored inline and the table is aligned to its own 4 KiB
/// size, as the hardware requires; this also means the table containing an
/// entry can be recovered from the entry's address.
#[repr(align(4096))]
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
    /// Panics if index >= 512.
    pub fn entry(&self, index: usize) -> PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        self.entries[index]
    }

    /// Returns a mutable reference to the entry at the given index.
    ///
    /// # Panics
    /// Panics if index >= 512.
    pub fn entry_mut(&mut self, index: usize) -> &mut PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        &mut self.entries[index]
    }

    /// Returns a pointer to the entry at the given index.
    ///
    /// # Panics
    /// Panics if index >= 512.
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
    /// or loaded into CR3.
    pub fn physical_address(&self) -> PhysicalAddress {
        let ptr = self.entries.as_ptr() as *const u8;
        let translator = AddressTranslator::current();
        PhysicalAddress::new(translator.ptr_to_phys(ptr))
    }

    /// Activates this page table by loading it into CR3.
    ///
    /// # Safety
    /// This function is unsafe because loading an invalid page table can cause
    /// undefined behavior, including memory corruption and system crashes.
    /// The caller must ensure:
    /// - The page table correctly maps all memory that will be accessed
    /// - The kernel is properly mapped
    /// - The page table itself is mapped
    pub unsafe fn activate(&self) {
        let phys_addr = PhysAddr::new(self.physical_address().as_usize() as u64);
        let frame = PhysFrame::containing_address(phys_addr);
        // SAFETY: Caller must ensure the page table is valid
        unsafe {
            Cr3::write(frame, Cr3Flags::empty());
        }
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}
