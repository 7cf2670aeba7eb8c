#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]
#![feature(step_trait)]

//! # Reverse Mapping (rmap)
//!
//! A reverse-mapping walker over multi-level page tables: given a physical page
//! and a virtual memory region it may be mapped into, find every page table
//! entry that currently maps it. It provides:
//!
//! - A resumable walk ([`MappingWalk`]) that reports one mapping location per
//!   step with the owning lock held, across leaf entries, collapsed (huge)
//!   mappings, and swap-style migration/device-private placeholders.
//! - A one-shot containment check ([`page_mapped_in_region`]).
//! - The supporting pieces: address and frame/page number types, an address
//!   space with split page table locks, 4-level page table construction, and
//!   a software-emulated architecture for testing in non-kernel environments.

extern crate alloc;

mod address;
mod address_space;
mod arch;
mod numbers;
mod page;
mod page_directory;
mod region;
mod rmap;
mod swap;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use address_space::AddressSpace;
pub use arch::{PageEntry, PageFlags, PageTable};
pub use numbers::{FrameNumber, PageNumber};
pub use page::Page;
pub use page_directory::PageDirectory;
pub use region::VmRegion;
pub use rmap::{MappingWalk, WalkFlags, page_mapped_in_region};
pub use swap::{SwapEntry, SwapKind};

pub use arch::{PAGE_SIZE, PAGE_TABLE_LEVELS};
