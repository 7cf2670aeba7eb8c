//! Architecture-independent page table management.
//!
//! This module provides the `PageDirectory` type, which wraps the architecture-specific
//! `PageTable` and provides operations for building and looking up translations at
//! every level of the table hierarchy: leaf mappings, collapsed (huge) mappings, and
//! non-present swap-style placeholders.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    PhysicalAddress, VirtualAddress,
    address::AddressTranslator,
    arch::{self, PageEntry, PageFlags, PageTable},
    swap::SwapEntry,
};

#[cfg(not(any(test, feature = "software-emulation")))]
use alloc::boxed::Box;

/// Allocates a new page table.
///
/// In test/software-emulation mode, this allocates from the emulated memory space.
/// In production mode, this uses the standard heap allocator.
///
/// Tables are aligned to their own size, so a table is always recoverable from
/// the address of one of its entries.
#[cfg(any(test, feature = "software-emulation"))]
fn alloc_page_table() -> *mut PageTable {
    let translator = AddressTranslator::current();
    let size = core::mem::size_of::<PageTable>();
    let align = core::mem::size_of::<PageTable>();

    // Allocate from emulated memory
    let phys = translator
        .allocate(size, align)
        .expect("out of emulated memory");

    // Translate to virtual address
    let virt = translator.phys_to_virt(phys);

    // Initialize the page table in place
    unsafe {
        let ptr = virt as *mut PageTable;
        ptr.write(PageTable::new());
        ptr
    }
}

/// Allocates a new page table using the standard heap allocator.
#[cfg(not(any(test, feature = "software-emulation")))]
fn alloc_page_table() -> *mut PageTable {
    Box::into_raw(Box::new(PageTable::new()))
}

/// Reads a page table entry through a pointer with a single atomic load.
///
/// Entries inspected before their table's lock is held must be read this way:
/// the atomic load is a single observation of the entry, so the compiler cannot
/// cache the value in a register and have it go stale under a concurrent
/// update elsewhere.
pub(crate) fn load_entry(entry: NonNull<PageEntry>) -> PageEntry {
    // SAFETY: `PageEntry` is a `repr(transparent)` wrapper around usize, and the
    // pointer refers to a live entry slot inside a page table.
    let atomic = unsafe { AtomicUsize::from_ptr(entry.as_ptr().cast()) };
    PageEntry::from_usize(atomic.load(Ordering::Acquire))
}

/// Returns a pointer to the entry covering `address` at `level` within the
/// table at the given physical address.
pub(crate) fn entry_at(table: PhysicalAddress, address: usize, level: usize) -> NonNull<PageEntry> {
    let translator = AddressTranslator::current();
    // SAFETY: The physical address was read from a present, non-huge parent
    // entry, so it refers to a live page table.
    let table = unsafe { &*translator.phys_to_ptr::<PageTable>(table.as_usize()) };
    table.entry_ptr(arch::page_index(address, level))
}

/// An architecture-independent page table manager.
///
/// This type owns the root page table and provides operations for mapping and
/// unmapping virtual addresses to physical addresses. It handles walking the
/// page table hierarchy and allocating intermediate tables as needed.
pub struct PageDirectory {
    /// The root page table for this address space.
    root: NonNull<PageTable>,
}

impl PageDirectory {
    /// Creates a new page directory with an empty root page table.
    pub fn new() -> Self {
        let root = alloc_page_table();
        log::trace!("allocated root page table at {:p}", root);
        Self {
            // SAFETY: alloc_page_table never returns null.
            root: unsafe { NonNull::new_unchecked(root) },
        }
    }

    /// Returns a reference to the root page table.
    pub fn root(&self) -> &PageTable {
        // SAFETY: The root table is allocated in `new` and never freed.
        unsafe { self.root.as_ref() }
    }

    /// Maps a virtual address to a physical address with the given flags.
    ///
    /// This function walks the page table hierarchy, allocating intermediate tables
    /// as needed, and sets the final page table entry to map the virtual address
    /// to the physical address.
    ///
    /// # Panics
    /// Panics if the virtual address is not page-aligned or if the physical address
    /// is not page-aligned.
    pub fn map(&mut self, virt: VirtualAddress, phys: PhysicalAddress, flags: PageFlags) {
        assert!(
            virt.is_aligned(arch::PAGE_SIZE),
            "virtual address must be page-aligned"
        );
        assert!(
            phys.is_aligned(arch::PAGE_SIZE),
            "physical address must be page-aligned"
        );

        let entry = self.walk_or_create(virt, 0);
        let mut new_flags = flags;
        new_flags.set_present(true);
        *entry = PageEntry::new(phys, new_flags);
    }

    /// Maps a contiguous frame range as a single collapsed entry at the given
    /// level (1 or 2), bypassing the leaf tables.
    ///
    /// # Panics
    /// Panics if the level cannot hold collapsed mappings, or if either address
    /// is not aligned to the span the entry covers.
    pub fn map_huge(
        &mut self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        level: usize,
        flags: PageFlags,
    ) {
        assert!(
            level >= 1 && level < arch::PAGE_TABLE_LEVELS - 1,
            "collapsed mappings exist at the middle levels only"
        );
        let span = arch::level_span(level);
        assert!(
            virt.is_aligned(span),
            "virtual address must be aligned to the mapped span"
        );
        assert!(
            phys.is_aligned(span),
            "physical address must be aligned to the mapped span"
        );

        let entry = self.walk_or_create(virt, level);
        let mut new_flags = flags;
        new_flags.set_present(true);
        *entry = PageEntry::new_huge(phys, new_flags);
    }

    /// Installs a non-present swap-style placeholder at the leaf level.
    ///
    /// # Panics
    /// Panics if the virtual address is not page-aligned.
    pub fn map_swap(&mut self, virt: VirtualAddress, swap: SwapEntry) {
        assert!(
            virt.is_aligned(arch::PAGE_SIZE),
            "virtual address must be page-aligned"
        );

        let entry = self.walk_or_create(virt, 0);
        *entry = PageEntry::new_swap(swap);
    }

    /// Installs a non-present swap-style placeholder at a level that would
    /// otherwise hold a collapsed mapping (e.g. for a huge page mid-migration).
    ///
    /// # Panics
    /// Panics if the level cannot hold collapsed mappings or the address is not
    /// aligned to the span the entry covers.
    pub fn map_swap_huge(&mut self, virt: VirtualAddress, level: usize, swap: SwapEntry) {
        assert!(
            level >= 1 && level < arch::PAGE_TABLE_LEVELS - 1,
            "collapsed mappings exist at the middle levels only"
        );
        assert!(
            virt.is_aligned(arch::level_span(level)),
            "virtual address must be aligned to the mapped span"
        );

        let entry = self.walk_or_create(virt, level);
        *entry = PageEntry::new_swap(swap);
    }

    /// Unmaps a virtual address at the leaf level.
    ///
    /// This function walks the page table hierarchy and clears the entry for the
    /// given virtual address. Returns the physical address that was mapped, or
    /// None if the address was not mapped.
    ///
    /// # Panics
    /// Panics if the virtual address is not page-aligned.
    pub fn unmap(&mut self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        assert!(
            virt.is_aligned(arch::PAGE_SIZE),
            "virtual address must be page-aligned"
        );

        let entry = self.walk_mut(virt, 0)?;
        let phys = entry.address()?;
        entry.clear();

        Some(phys)
    }

    /// Walks the page table hierarchy to the entry covering `virt` at
    /// `target_level`, without allocating anything.
    ///
    /// Returns None if an intermediate table is absent, or if the descent runs
    /// into a collapsed mapping above the target level.
    pub fn walk_to(&self, virt: VirtualAddress, target_level: usize) -> Option<NonNull<PageEntry>> {
        let mut table = self.root();
        let virt_addr = virt.as_usize();

        // Walk through all levels above the target
        for level in ((target_level + 1)..arch::PAGE_TABLE_LEVELS).rev() {
            let index = arch::page_index(virt_addr, level);
            let entry = table.entry(index);

            if !entry.is_present() || entry.is_huge() {
                return None;
            }

            let next_table_phys = entry.address()?;
            let translator = AddressTranslator::current();
            let next_table_virt_raw = translator.phys_to_virt(next_table_phys.as_usize());

            // SAFETY: We're trusting that the page table entry contains a valid pointer
            // to a page table. This is safe as long as we only create entries that
            // point to valid page tables.
            table = unsafe { &*(next_table_virt_raw as *const PageTable) };
        }

        let index = arch::page_index(virt_addr, target_level);
        Some(table.entry_ptr(index))
    }

    /// Looks up the single entry that can map a huge-pool-backed page of the
    /// given size at `virt`.
    ///
    /// The entry lives at the level whose span equals the page's allocation
    /// size; there is no finer-grained fallback. Returns None when a directory
    /// above that level is absent.
    ///
    /// # Panics
    /// Panics if no level maps units of the given size.
    pub fn hugetlb_entry(&self, virt: VirtualAddress, size: usize) -> Option<NonNull<PageEntry>> {
        let level = (1..arch::PAGE_TABLE_LEVELS - 1)
            .find(|&level| arch::level_span(level) == size)
            .expect("no page table level maps units of the requested size");
        self.walk_to(virt, level)
    }

    /// Walks the page table hierarchy to the entry covering `virt` at
    /// `target_level`, mutably and without allocating.
    ///
    /// Returns None if an intermediate table is absent, or if the descent runs
    /// into a collapsed mapping above the target level.
    fn walk_mut(&mut self, virt: VirtualAddress, target_level: usize) -> Option<&mut PageEntry> {
        // SAFETY: The root table is allocated in `new` and never freed, and we
        // hold &mut self.
        let mut table = unsafe { &mut *self.root.as_ptr() };
        let virt_addr = virt.as_usize();

        for level in ((target_level + 1)..arch::PAGE_TABLE_LEVELS).rev() {
            let index = arch::page_index(virt_addr, level);
            let entry = table.entry_mut(index);

            if !entry.is_present() || entry.is_huge() {
                return None;
            }

            let next_table_phys = entry.address()?;
            let translator = AddressTranslator::current();
            let next_table_virt_raw = translator.phys_to_virt(next_table_phys.as_usize());

            // SAFETY: We're trusting that the page table entry contains a valid pointer
            // to a page table. This is safe as long as we only create entries that
            // point to valid page tables.
            table = unsafe { &mut *(next_table_virt_raw as *mut PageTable) };
        }

        let index = arch::page_index(virt_addr, target_level);
        Some(table.entry_mut(index))
    }

    /// Walks the page table hierarchy, creating intermediate tables as needed.
    ///
    /// Returns a mutable reference to the entry covering `virt` at `target_level`.
    ///
    /// # Panics
    /// Panics if the descent runs into a collapsed mapping above the target
    /// level; replacing a collapsed mapping with a table is a splitting
    /// operation, not a mapping one.
    fn walk_or_create(&mut self, virt: VirtualAddress, target_level: usize) -> &mut PageEntry {
        // SAFETY: The root table is allocated in `new` and never freed, and we
        // hold &mut self.
        let mut table = unsafe { &mut *self.root.as_ptr() };
        let virt_addr = virt.as_usize();

        // Walk through all levels above the target
        for level in ((target_level + 1)..arch::PAGE_TABLE_LEVELS).rev() {
            let index = arch::page_index(virt_addr, level);
            let entry = table.entry_mut(index);

            if !entry.is_present() {
                // Allocate a new page table
                let new_table_ptr = alloc_page_table();
                let new_table_virt_raw = new_table_ptr as usize;

                let translator = AddressTranslator::current();
                let new_table_phys =
                    PhysicalAddress::new(translator.virt_to_phys(new_table_virt_raw));
                log::trace!("allocated level-{} page table at {}", level - 1, new_table_phys);

                let mut flags = PageFlags::empty();
                flags.set_present(true);

                *entry = PageEntry::new(new_table_phys, flags);
            }
            assert!(
                !entry.is_huge(),
                "cannot descend through a collapsed mapping"
            );

            let next_table_phys = entry.address().expect("entry should be present");
            let translator = AddressTranslator::current();
            let next_table_virt_raw = translator.phys_to_virt(next_table_phys.as_usize());

            // SAFETY: We're trusting that the page table entry contains a valid pointer
            // to a page table. This is safe because we either just created it above,
            // or it was created by a previous call to this function.
            table = unsafe { &mut *(next_table_virt_raw as *mut PageTable) };
        }

        // Return the entry at the target level
        let index = arch::page_index(virt_addr, target_level);
        table.entry_mut(index)
    }
}

impl Default for PageDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FrameNumber;

    fn setup() {
        use crate::address::AddressTranslator;

        // Set up emulated memory for testing
        let _ = std::panic::catch_unwind(|| {
            AddressTranslator::set_current(AddressTranslator::emulated(64 * 1024));
        });
    }

    fn present_flags() -> PageFlags {
        let mut flags = PageFlags::empty();
        flags.set_present(true);
        flags
    }

    #[test]
    fn map_single_page() {
        setup();
        let mut dir = PageDirectory::new();

        let virt = VirtualAddress::new(0x0100);
        let phys = PhysicalAddress::new(0x0200);

        dir.map(virt, phys, present_flags());

        // The mapping should succeed without panicking
    }

    #[test]
    fn unmap_mapped_page() {
        setup();
        let mut dir = PageDirectory::new();

        let virt = VirtualAddress::new(0x0100);
        let phys = PhysicalAddress::new(0x0200);

        dir.map(virt, phys, present_flags());
        let unmapped = dir.unmap(virt);

        assert_eq!(unmapped, Some(phys));
    }

    #[test]
    fn unmap_unmapped_page() {
        setup();
        let mut dir = PageDirectory::new();

        let virt = VirtualAddress::new(0x0100);
        let unmapped = dir.unmap(virt);

        assert_eq!(unmapped, None);
    }

    #[test]
    fn map_multiple_pages() {
        setup();
        let mut dir = PageDirectory::new();

        // Map several pages spread across different leaf tables
        for i in 1..=10 {
            let virt = VirtualAddress::new(i * arch::PAGE_SIZE * 3);
            let phys = PhysicalAddress::new(0x0200 + (i * arch::PAGE_SIZE));
            dir.map(virt, phys, present_flags());
        }

        for i in 1..=10 {
            let virt = VirtualAddress::new(i * arch::PAGE_SIZE * 3);
            let slot = dir.walk_to(virt, 0).expect("leaf entry should exist");
            assert_eq!(
                load_entry(slot).address(),
                Some(PhysicalAddress::new(0x0200 + (i * arch::PAGE_SIZE)))
            );
        }
    }

    mod walk_to {
        use super::*;

        #[test]
        fn absent_directory_returns_none() {
            setup();
            let dir = PageDirectory::new();
            assert_eq!(dir.walk_to(VirtualAddress::new(0x0100), 0), None);
        }

        #[test]
        fn finds_leaf_entry() {
            setup();
            let mut dir = PageDirectory::new();
            let virt = VirtualAddress::new(0x2340);
            dir.map(virt, PhysicalAddress::new(0x0400), present_flags());

            let slot = dir.walk_to(virt, 0).expect("leaf entry should exist");
            assert_eq!(load_entry(slot).address(), Some(PhysicalAddress::new(0x0400)));
        }

        #[test]
        fn finds_empty_sibling_slot() {
            setup();
            let mut dir = PageDirectory::new();
            dir.map(
                VirtualAddress::new(0x2340),
                PhysicalAddress::new(0x0400),
                present_flags(),
            );

            // Same leaf table, different entry: the slot exists but is empty
            let slot = dir
                .walk_to(VirtualAddress::new(0x2350), 0)
                .expect("slot should exist");
            assert!(load_entry(slot).is_none());
        }

        #[test]
        fn stops_at_collapsed_mapping() {
            setup();
            let mut dir = PageDirectory::new();
            let virt = VirtualAddress::new(0x0500);
            dir.map_huge(virt, PhysicalAddress::new(0x0800), 1, present_flags());

            // The level-1 entry is a collapsed mapping, so there is no leaf entry
            assert_eq!(dir.walk_to(virt, 0), None);
            let slot = dir.walk_to(virt, 1).expect("level-1 entry should exist");
            assert!(load_entry(slot).is_huge());
        }
    }

    mod huge {
        use super::*;

        #[test]
        fn map_huge_installs_collapsed_entry() {
            setup();
            let mut dir = PageDirectory::new();
            let virt = VirtualAddress::new(0x3000);
            dir.map_huge(virt, PhysicalAddress::new(0x1000), 2, present_flags());

            let slot = dir.walk_to(virt, 2).expect("level-2 entry should exist");
            let entry = load_entry(slot);
            assert!(entry.is_huge());
            assert_eq!(entry.address(), Some(PhysicalAddress::new(0x1000)));
        }

        #[test]
        #[should_panic(expected = "aligned to the mapped span")]
        fn map_huge_rejects_unaligned_address() {
            setup();
            let mut dir = PageDirectory::new();
            dir.map_huge(
                VirtualAddress::new(0x0510),
                PhysicalAddress::new(0x0800),
                1,
                present_flags(),
            );
        }

        #[test]
        #[should_panic(expected = "middle levels only")]
        fn map_huge_rejects_leaf_level() {
            setup();
            let mut dir = PageDirectory::new();
            dir.map_huge(
                VirtualAddress::new(0x0100),
                PhysicalAddress::new(0x0200),
                0,
                present_flags(),
            );
        }

        #[test]
        fn hugetlb_entry_finds_slot() {
            setup();
            let mut dir = PageDirectory::new();
            let virt = VirtualAddress::new(0x0600);
            dir.map_huge(virt, PhysicalAddress::new(0x0900), 1, present_flags());

            let span = arch::level_span(1);
            let slot = dir.hugetlb_entry(virt, span).expect("slot should exist");
            assert!(load_entry(slot).is_huge());
        }

        #[test]
        fn hugetlb_entry_absent_directory() {
            setup();
            let dir = PageDirectory::new();
            let span = arch::level_span(1);
            assert_eq!(dir.hugetlb_entry(VirtualAddress::new(0x0600), span), None);
        }

        #[test]
        #[should_panic(expected = "no page table level maps units")]
        fn hugetlb_entry_rejects_odd_size() {
            setup();
            let dir = PageDirectory::new();
            dir.hugetlb_entry(VirtualAddress::new(0x0600), arch::PAGE_SIZE * 3);
        }
    }

    mod swap {
        use super::*;
        use crate::swap::{SwapEntry, SwapKind};

        #[test]
        fn map_swap_installs_placeholder() {
            setup();
            let mut dir = PageDirectory::new();
            let virt = VirtualAddress::new(0x0100);
            dir.map_swap(virt, SwapEntry::migration(FrameNumber::new(0x30)));

            let slot = dir.walk_to(virt, 0).expect("slot should exist");
            let entry = load_entry(slot);
            assert!(!entry.is_present());
            assert!(entry.is_swap());

            let swap = entry.swap_entry().unwrap();
            assert_eq!(swap.kind(), SwapKind::Migration);
            assert_eq!(swap.frame(), FrameNumber::new(0x30));
        }

        #[test]
        fn map_swap_huge_installs_placeholder() {
            setup();
            let mut dir = PageDirectory::new();
            let virt = VirtualAddress::new(0x0700);
            dir.map_swap_huge(virt, 1, SwapEntry::migration(FrameNumber::new(0x40)));

            let slot = dir.walk_to(virt, 1).expect("slot should exist");
            let entry = load_entry(slot);
            assert!(!entry.is_present());
            assert!(!entry.is_huge());
            assert_eq!(
                entry.swap_entry().map(|s| s.frame()),
                Some(FrameNumber::new(0x40))
            );
        }
    }
}
