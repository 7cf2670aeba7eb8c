//! Reverse mapping walks.
//!
//! Page tables answer "what does this virtual address map to?"; this module
//! answers the reverse question: given a physical page and a region it may be
//! mapped into, find every table entry that currently maps it. The walk is
//! resumable — each call to [`MappingWalk::advance`] reports one mapping
//! location with the owning lock held, so the caller can inspect or rewrite
//! the entry before moving on.
//!
//! Other threads may split collapsed mappings, install or remove entries, and
//! finish migrations while a walk is paused. The walk copes by re-checking
//! any collapsed entry after taking its lock, by reading unlocked entries with
//! a single atomic observation, and by re-deriving its position from the top
//! whenever it crosses a table boundary.

use core::ptr::NonNull;

use crate::{
    Page, VirtualAddress, VmRegion, arch,
    arch::PageEntry,
    page_directory::{entry_at, load_entry},
    swap::SwapKind,
};

/// Level of the leaf page tables (PT).
const PT_LEVEL: usize = 0;
/// Level of the leaf directories (PD), whose entries may be collapsed mappings.
const PD_LEVEL: usize = 1;
/// Level of the intermediate directories (PDP).
const PDP_LEVEL: usize = 2;
/// Level of the root table.
const ROOT_LEVEL: usize = arch::PAGE_TABLE_LEVELS - 1;

/// Options fixed by the caller before a walk begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WalkFlags(u8);

impl WalkFlags {
    /// Only a consistency-safe check is required; candidate leaf entries are
    /// tested under their lock instead of being filtered out beforehand.
    const SYNC: u8 = 1 << 0;

    /// Entries may be migration placeholders, and such placeholders are what
    /// the walk is looking for.
    const MIGRATION: u8 = 1 << 1;

    /// Creates an empty set of flags.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Returns whether a consistency-safe check was requested.
    pub fn is_sync(self) -> bool {
        (self.0 & Self::SYNC) != 0
    }

    /// Sets or clears the consistency-safe check request.
    pub fn set_sync(&mut self, sync: bool) {
        if sync {
            self.0 |= Self::SYNC;
        } else {
            self.0 &= !Self::SYNC;
        }
    }

    /// Returns whether migration placeholders are being searched for.
    pub fn is_migration(self) -> bool {
        (self.0 & Self::MIGRATION) != 0
    }

    /// Sets or clears the migration placeholder search.
    pub fn set_migration(&mut self, migration: bool) {
        if migration {
            self.0 |= Self::MIGRATION;
        } else {
            self.0 &= !Self::MIGRATION;
        }
    }
}

/// Where to continue inside [`MappingWalk::advance`].
///
/// The walk is a hand-written state machine rather than recursive descent:
/// a lock has to stay held while control returns to the caller, which a
/// recursion's stack frames could not express.
enum Step {
    /// Re-derive the position from the root table.
    Restart,
    /// Resolve the leaf-directory entry under the current intermediate entry.
    MapPd,
    /// Test the current leaf-directory entry under its lock.
    CheckPd,
    /// Advance to the next leaf-directory entry that could map the target.
    NextPd,
    /// Resolve the leaf entry under the current leaf-directory entry.
    MapPte,
    /// Test the current leaf entry under its lock.
    CheckPte,
    /// Advance to the next leaf entry that could map the target.
    NextPte,
}

/// A resumable search for the table entries mapping a page within a region.
///
/// Each successful [`advance`](Self::advance) pauses the walk with the lock
/// owning the reported entry held; the next call resumes just past it. The
/// caller must finish the walk (a `false` return) or call
/// [`done`](Self::done) to release the lock early. Dropping the walk releases
/// it as well.
pub struct MappingWalk<'a> {
    /// The page being searched for.
    page: &'a Page,
    /// The region being searched.
    region: &'a VmRegion<'a>,
    /// Current virtual address under consideration.
    address: usize,
    /// Caller-selected options.
    flags: WalkFlags,
    /// Intermediate-directory entry currently resolved, if any.
    pdp_entry: Option<NonNull<PageEntry>>,
    /// Leaf-directory entry currently resolved, if any.
    pd_entry: Option<NonNull<PageEntry>>,
    /// Leaf entry currently resolved, if any. For huge-pool-backed pages this
    /// is the single entry at the page's allocation level.
    pte: Option<NonNull<PageEntry>>,
    /// The held lock, present exactly while a reported match is outstanding.
    guard: Option<spin::MutexGuard<'a, ()>>,
}

impl<'a> MappingWalk<'a> {
    /// Creates a walk over `region` starting at `address`.
    ///
    /// The starting address is normally the first address the page could
    /// occupy in the region (clipped to the region start).
    pub fn new(
        page: &'a Page,
        region: &'a VmRegion<'a>,
        address: VirtualAddress,
        flags: WalkFlags,
    ) -> Self {
        debug_assert!(
            region.contains(address),
            "walk must start inside the region"
        );
        Self {
            page,
            region,
            address: address.as_usize(),
            flags,
            pdp_entry: None,
            pd_entry: None,
            pte: None,
            guard: None,
        }
    }

    /// Returns the current virtual address of the walk.
    pub fn address(&self) -> VirtualAddress {
        VirtualAddress::new(self.address)
    }

    /// Returns the page being searched for.
    pub fn page(&self) -> &Page {
        self.page
    }

    /// Returns the resolved intermediate-directory entry, if any.
    pub fn pdp_entry(&self) -> Option<NonNull<PageEntry>> {
        self.pdp_entry
    }

    /// Returns the resolved leaf-directory entry, if any. A set leaf-directory
    /// entry with no leaf entry means the page is mapped by a collapsed entry
    /// at that level.
    pub fn pd_entry(&self) -> Option<NonNull<PageEntry>> {
        self.pd_entry
    }

    /// Returns the resolved leaf entry, if any.
    pub fn pte(&self) -> Option<NonNull<PageEntry>> {
        self.pte
    }

    /// Moves to the next table entry mapping the page within the region.
    ///
    /// Returns `true` when an entry was found: the handles identify it and the
    /// owning lock is held. Returns `false` when no further mapping exists;
    /// the lock is released, the handles are cleared, and the address is left
    /// wherever the search stopped (not meaningful for further use).
    pub fn advance(&mut self) -> bool {
        let space = self.region.space();

        // The only possible match at the intermediate level was reported by
        // the previous call; a collapsed mapping there covers the whole page.
        if self.pdp_entry.is_some() && self.pd_entry.is_none() && self.pte.is_none() {
            return self.not_found();
        }

        let mut step = if self.pte.is_some() {
            Step::NextPte
        } else if self.pd_entry.is_some() {
            Step::NextPd
        } else if self.page.is_hugetlb() {
            // Huge-pool pages are tracked by exactly one entry at their
            // allocation level; either it is there or the page is not mapped
            // in this region at all.
            let address = VirtualAddress::new(self.address);
            let slot = match space.directory().hugetlb_entry(address, self.page.size()) {
                Some(slot) => slot,
                // No table covers this address at the page's level. Nothing
                // was locked, so there is nothing to release.
                None => return false,
            };
            self.pte = Some(slot);
            self.guard = Some(space.hugetlb_lock().lock());
            if self.check_pte() {
                return true;
            }
            return self.not_found();
        } else {
            Step::Restart
        };

        loop {
            debug_assert!(
                self.region.contains(VirtualAddress::new(self.address)),
                "walk address must stay inside the region"
            );

            step = match step {
                Step::Restart => {
                    let root_index = arch::page_index(self.address, ROOT_LEVEL);
                    let root_entry = space.directory().root().entry(root_index);
                    if !root_entry.is_present() {
                        if !self.skip_absent(arch::level_span(ROOT_LEVEL)) {
                            return self.not_found();
                        }
                        Step::Restart
                    } else {
                        let pdp_table = root_entry
                            .address()
                            .expect("present entry carries an address");
                        let pdp_ptr = entry_at(pdp_table, self.address, PDP_LEVEL);
                        self.pdp_entry = Some(pdp_ptr);

                        // One atomic observation of the intermediate entry
                        // before any lock is taken; a plain read could be
                        // hoisted and go stale under a concurrent split.
                        let pdpe = load_entry(pdp_ptr);
                        if pdpe.is_huge() {
                            self.guard = Some(space.lock_for_entry(pdp_ptr).lock());
                            let locked = load_entry(pdp_ptr);
                            if locked.is_huge() {
                                // A collapsed mapping at this level is never a
                                // migration placeholder.
                                if self.flags.is_migration() {
                                    return self.not_found();
                                }
                                let frame = locked
                                    .address()
                                    .expect("huge entry carries a frame address")
                                    .frame_number();
                                if frame != self.page.frame_number() {
                                    return self.not_found();
                                }
                                self.pd_entry = None;
                                self.pte = None;
                                return true;
                            }
                            // Split under us: resolve at the leaf-directory level
                            self.guard = None;
                            Step::MapPd
                        } else if !pdpe.is_present() {
                            if !self.skip_absent(arch::level_span(PDP_LEVEL)) {
                                return self.not_found();
                            }
                            Step::Restart
                        } else {
                            Step::MapPd
                        }
                    }
                }

                Step::MapPd => {
                    let pdp_ptr = self.pdp_entry.expect("intermediate handle must be set");
                    let pdpe = load_entry(pdp_ptr);
                    if !pdpe.is_present() || pdpe.is_huge() {
                        // The directory was torn down or collapsed again since
                        // we looked; there is no leaf directory to continue in.
                        return self.not_found();
                    }
                    let pd_table = pdpe.address().expect("present entry carries an address");
                    let pd_ptr = entry_at(pd_table, self.address, PD_LEVEL);
                    self.pd_entry = Some(pd_ptr);

                    let pde = load_entry(pd_ptr);
                    let placeholder = arch::HUGE_MIGRATION_SUPPORTED
                        && matches!(
                            pde.swap_entry(),
                            Some(swap) if swap.kind() == SwapKind::Migration
                        );
                    if pde.is_present() || placeholder {
                        // Collapsed mapping, migration placeholder for one, or
                        // an ordinary leaf table: all are judged under the lock
                        self.guard = Some(space.lock_for_entry(pd_ptr).lock());
                        Step::CheckPd
                    } else {
                        Step::NextPd
                    }
                }

                Step::CheckPd => {
                    let pd_ptr = self.pd_entry.expect("leaf-directory handle must be set");
                    let pde = load_entry(pd_ptr);
                    if pde.is_huge() {
                        if self.flags.is_migration() {
                            Step::NextPd
                        } else {
                            let frame = pde
                                .address()
                                .expect("huge entry carries a frame address")
                                .frame_number();
                            if self.page.matches_frame(frame) {
                                self.pte = None;
                                return true;
                            }
                            Step::NextPd
                        }
                    } else if pde.is_present() {
                        // The collapsed mapping was split under us: handle on
                        // the leaf level
                        self.guard = None;
                        Step::MapPte
                    } else if arch::HUGE_MIGRATION_SUPPORTED && self.flags.is_migration() {
                        match pde.swap_entry() {
                            Some(swap)
                                if swap.kind() == SwapKind::Migration
                                    && self.page.matches_frame(swap.frame()) =>
                            {
                                self.pte = None;
                                return true;
                            }
                            _ => Step::NextPd,
                        }
                    } else {
                        Step::NextPd
                    }
                }

                Step::NextPd => {
                    // Only a target spanning multiple leaf-directory units can
                    // be mapped by further sibling entries
                    if !self.page.is_compound() || self.page.size() <= arch::level_span(PD_LEVEL) {
                        return self.not_found();
                    }
                    let (_, span_end) = self.region.span_of(self.page);
                    let region_end = self.region.end().as_usize();
                    loop {
                        self.address += arch::level_span(PD_LEVEL);
                        if self.address >= region_end || self.address >= span_end {
                            return self.not_found();
                        }
                        if self.address % arch::level_span(PDP_LEVEL) == 0 {
                            // Crossed into a new leaf directory, which needs a
                            // fresh collapsed-entry check from the top
                            self.pd_entry = None;
                            self.pdp_entry = None;
                            self.guard = None;
                            break Step::Restart;
                        }
                        let pd_ptr =
                            Self::next_slot(self.pd_entry.expect("leaf-directory handle must be set"));
                        self.pd_entry = Some(pd_ptr);
                        if !load_entry(pd_ptr).is_none() {
                            if self.guard.is_none() {
                                self.guard = Some(space.lock_for_entry(pd_ptr).lock());
                            }
                            break Step::CheckPd;
                        }
                    }
                }

                Step::MapPte => {
                    let pd_ptr = self.pd_entry.expect("leaf-directory handle must be set");
                    let pde = load_entry(pd_ptr);
                    if !pde.is_present() || pde.is_huge() {
                        // The leaf table was torn down or collapsed again
                        // since we looked
                        return self.not_found();
                    }
                    let pt_table = pde.address().expect("present entry carries an address");
                    let pte_ptr = entry_at(pt_table, self.address, PT_LEVEL);
                    self.pte = Some(pte_ptr);

                    let wanted = if self.flags.is_sync() {
                        // A consistency-safe check takes the lock regardless
                        // and tests the entry under it
                        true
                    } else {
                        let pte = load_entry(pte_ptr);
                        if self.flags.is_migration() {
                            pte.is_swap()
                        } else if let Some(swap) = pte.swap_entry() {
                            // A non-CPU-accessible device-private page is
                            // mapped through a swap-style entry but still
                            // counts as a regular mapping
                            swap.kind() == SwapKind::DevicePrivate
                        } else {
                            pte.is_present()
                        }
                    };
                    if wanted {
                        self.guard = Some(space.lock_for_table(pt_table).lock());
                        Step::CheckPte
                    } else {
                        Step::NextPte
                    }
                }

                Step::CheckPte => {
                    if self.check_pte() {
                        return true;
                    }
                    Step::NextPte
                }

                Step::NextPte => {
                    // Seeking to the next leaf entry only makes sense for a
                    // transparent compound target; anything else has a single
                    // candidate location
                    if !self.page.is_compound() || self.page.is_hugetlb() {
                        return self.not_found();
                    }
                    let (_, span_end) = self.region.span_of(self.page);
                    let region_end = self.region.end().as_usize();
                    loop {
                        self.address += arch::PAGE_SIZE;
                        if self.address >= region_end || self.address >= span_end {
                            return self.not_found();
                        }
                        if self.address % arch::level_span(PD_LEVEL) == 0 {
                            // Crossed into a new leaf table, which needs a
                            // fresh collapsed-entry check from the top
                            self.pte = None;
                            self.pd_entry = None;
                            self.pdp_entry = None;
                            self.guard = None;
                            break Step::Restart;
                        }
                        let pte_ptr = Self::next_slot(self.pte.expect("leaf handle must be set"));
                        self.pte = Some(pte_ptr);
                        if !load_entry(pte_ptr).is_none() {
                            if self.guard.is_none() {
                                self.guard = Some(space.lock_for_entry(pte_ptr).lock());
                            }
                            break Step::CheckPte;
                        }
                    }
                }
            };
        }
    }

    /// Stops the walk early, releasing the held lock and clearing the entry
    /// handles. Safe to call from any paused state, any number of times.
    pub fn done(&mut self) {
        self.pte = None;
        self.pd_entry = None;
        self.pdp_entry = None;
        self.guard = None;
    }

    /// Tests whether the current leaf entry maps (any subframe of) the page.
    ///
    /// The entry may be empty, a swap-style placeholder, or a present mapping
    /// of an arbitrary frame. When migration placeholders are being searched
    /// for, only those count; otherwise present mappings and device-private
    /// placeholders count.
    fn check_pte(&self) -> bool {
        let pte = load_entry(self.pte.expect("leaf handle must be set when checking"));

        let frame = if self.flags.is_migration() {
            match pte.swap_entry() {
                Some(swap) if swap.kind() == SwapKind::Migration => swap.frame(),
                _ => return false,
            }
        } else if let Some(swap) = pte.swap_entry() {
            // Un-addressable device memory still counts as a regular mapping
            if swap.kind() != SwapKind::DevicePrivate {
                return false;
            }
            swap.frame()
        } else if pte.is_present() {
            pte.address()
                .expect("present entry carries a frame address")
                .frame_number()
        } else {
            return false;
        };

        self.page.matches_frame(frame)
    }

    /// Skips past a directory that is absent for the current address.
    ///
    /// A compound target whose span continues past the absent unit (and stays
    /// inside the region) moves to the next unit boundary and reports `true`;
    /// any other target has nowhere left to match and gets `false`.
    fn skip_absent(&mut self, span: usize) -> bool {
        if !self.page.is_compound() || self.page.is_hugetlb() {
            return false;
        }
        let (_, span_end) = self.region.span_of(self.page);
        let next = (self.address & !(span - 1)) + span;
        if next >= self.region.end().as_usize() || next >= span_end {
            return false;
        }
        self.address = next;
        true
    }

    /// Returns the pointer to the next entry slot in the same table.
    fn next_slot(entry: NonNull<PageEntry>) -> NonNull<PageEntry> {
        // SAFETY: The walk advances one slot at a time and the boundary checks
        // above restart it before the pointer could leave its table.
        unsafe { NonNull::new_unchecked(entry.as_ptr().add(1)) }
    }

    /// Terminates the walk: release the lock, clear the handles, report no
    /// match.
    fn not_found(&mut self) -> bool {
        self.done();
        false
    }
}

/// Checks whether a page is mapped anywhere in the region.
///
/// This is the one-shot form of [`MappingWalk`]: it computes the page's
/// expected span inside the region from its object index, bails out without
/// walking when the span misses the region entirely, and otherwise runs a
/// consistency-safe walk to the first match and releases it immediately.
pub fn page_mapped_in_region(page: &Page, region: &VmRegion<'_>) -> bool {
    let (start, end) = region.span_of(page);
    if end <= region.start().as_usize() || start >= region.end().as_usize() {
        return false;
    }
    let first = VirtualAddress::new(start.max(region.start().as_usize()));

    let mut flags = WalkFlags::empty();
    flags.set_sync(true);

    let mut walk = MappingWalk::new(page, region, first, flags);
    if !walk.advance() {
        return false;
    }
    walk.done();
    true
}
