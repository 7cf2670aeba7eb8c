//! Address space management.
//!
//! This module provides architecture-independent types for managing virtual address
//! spaces, which may belong to the kernel, user processes, or other contexts. Besides
//! the page tables themselves, an address space owns the locks that serialize access
//! to them: a fixed pool of split table locks plus one dedicated lock for mappings
//! backed by the huge-page pool.

use core::mem::size_of;
use core::ptr::NonNull;

use crate::{
    PhysicalAddress,
    address::AddressTranslator,
    arch::{PageEntry, PageTable},
    page_directory::PageDirectory,
};

/// Number of locks in the split table lock pool.
///
/// Locks are shared between tables by hashing the table's physical address, so
/// two tables may map to the same lock. That only costs contention, never
/// correctness: a holder still excludes every writer of the tables behind the
/// lock.
const TABLE_LOCK_COUNT: usize = 16;

/// An address space is an architecture-independent representation of a virtual
/// address space.
///
/// Each address space owns a page directory that maps virtual addresses to
/// physical addresses, and the locks protecting its tables. Address spaces can
/// belong to the kernel, user processes, or other contexts.
pub struct AddressSpace {
    /// The page tables for this address space.
    directory: PageDirectory,
    /// Split table locks, keyed by table physical address.
    table_locks: [spin::Mutex<()>; TABLE_LOCK_COUNT],
    /// Dedicated lock for entries mapping huge-pool-backed pages.
    hugetlb_lock: spin::Mutex<()>,
}

impl AddressSpace {
    /// Creates a new address space with an empty page directory.
    pub fn new() -> Self {
        Self {
            directory: PageDirectory::new(),
            table_locks: core::array::from_fn(|_| spin::Mutex::new(())),
            hugetlb_lock: spin::Mutex::new(()),
        }
    }

    /// Returns a reference to the page directory for this address space.
    pub fn directory(&self) -> &PageDirectory {
        &self.directory
    }

    /// Returns a mutable reference to the page directory for this address space.
    pub fn directory_mut(&mut self) -> &mut PageDirectory {
        &mut self.directory
    }

    /// Returns the lock protecting the table at the given physical address.
    pub fn lock_for_table(&self, table: PhysicalAddress) -> &spin::Mutex<()> {
        let index = (table.as_usize() / size_of::<PageTable>()) % TABLE_LOCK_COUNT;
        &self.table_locks[index]
    }

    /// Returns the lock protecting the table that holds the given entry.
    ///
    /// Tables are aligned to their own size, so the containing table is
    /// recovered from the entry's physical address.
    pub fn lock_for_entry(&self, entry: NonNull<PageEntry>) -> &spin::Mutex<()> {
        let translator = AddressTranslator::current();
        let entry_phys = translator.ptr_to_phys(entry.as_ptr());
        let table_phys = entry_phys & !(size_of::<PageTable>() - 1);
        self.lock_for_table(PhysicalAddress::new(table_phys))
    }

    /// Returns the dedicated lock for mappings of huge-pool-backed pages.
    pub fn hugetlb_lock(&self) -> &spin::Mutex<()> {
        &self.hugetlb_lock
    }

    /// Returns whether any lock belonging to this address space is currently held.
    #[cfg(test)]
    pub(crate) fn any_lock_held(&self) -> bool {
        self.table_locks.iter().any(|lock| lock.is_locked()) || self.hugetlb_lock.is_locked()
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{VirtualAddress, arch};

    fn setup() {
        let _ = std::panic::catch_unwind(|| {
            AddressTranslator::set_current(AddressTranslator::emulated(64 * 1024));
        });
    }

    fn present_flags() -> arch::PageFlags {
        let mut flags = arch::PageFlags::empty();
        flags.set_present(true);
        flags
    }

    #[test]
    fn entries_in_one_table_share_a_lock() {
        setup();
        let mut space = AddressSpace::new();
        space.directory_mut().map(
            VirtualAddress::new(0x0100),
            PhysicalAddress::new(0x0200),
            present_flags(),
        );
        space.directory_mut().map(
            VirtualAddress::new(0x0120),
            PhysicalAddress::new(0x0300),
            present_flags(),
        );

        let first = space
            .directory()
            .walk_to(VirtualAddress::new(0x0100), 0)
            .unwrap();
        let second = space
            .directory()
            .walk_to(VirtualAddress::new(0x0120), 0)
            .unwrap();

        let first_lock = space.lock_for_entry(first) as *const spin::Mutex<()>;
        let second_lock = space.lock_for_entry(second) as *const spin::Mutex<()>;
        assert_eq!(first_lock, second_lock);
    }

    #[test]
    fn entry_lock_matches_table_lock() {
        setup();
        let mut space = AddressSpace::new();
        let virt = VirtualAddress::new(0x0100);
        space
            .directory_mut()
            .map(virt, PhysicalAddress::new(0x0200), present_flags());

        // The leaf entry's lock must be the lock of the leaf table it lives in,
        // which is the table the level-1 entry points to.
        let pd_slot = space.directory().walk_to(virt, 1).unwrap();
        let pt_phys = crate::page_directory::load_entry(pd_slot)
            .address()
            .expect("level-1 entry points to a leaf table");

        let pte = space.directory().walk_to(virt, 0).unwrap();
        let by_entry = space.lock_for_entry(pte) as *const spin::Mutex<()>;
        let by_table = space.lock_for_table(pt_phys) as *const spin::Mutex<()>;
        assert_eq!(by_entry, by_table);
    }

    #[test]
    fn hugetlb_lock_is_dedicated() {
        setup();
        let space = AddressSpace::new();
        let guard = space.hugetlb_lock().lock();
        assert!(space.any_lock_held());
        drop(guard);
        assert!(!space.any_lock_held());
    }
}
