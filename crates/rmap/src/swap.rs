//! Swap-style placeholder entries.
//!
//! A page whose contents are not currently reachable through an ordinary
//! present mapping can still own a slot in the page tables: the entry is left
//! non-present and encodes where the page went instead. This module provides
//! the architecture-independent view of those placeholders; the entry bit
//! layout lives with each architecture's `PageEntry`.

use crate::FrameNumber;

/// The classification of a swap-style placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapKind {
    /// The page is being relocated to another physical frame. The entry still
    /// counts as a mapping of the old frame while the move is in flight.
    Migration = 1,
    /// The page lives in non-CPU-accessible device memory. The entry is
    /// treated as a regular mapping for accounting purposes.
    DevicePrivate = 2,
    /// Any other swap-style use (e.g. paged out to a swap device).
    Other = 3,
}

impl SwapKind {
    /// Decodes a raw kind field as stored in a page table entry.
    pub(crate) const fn from_raw(raw: usize) -> Option<Self> {
        match raw {
            1 => Some(Self::Migration),
            2 => Some(Self::DevicePrivate),
            3 => Some(Self::Other),
            _ => None,
        }
    }

    /// Returns the raw kind field as stored in a page table entry.
    pub(crate) const fn as_raw(self) -> usize {
        self as usize
    }
}

/// A decoded swap-style placeholder: what kind it is and which physical frame
/// it refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapEntry {
    kind: SwapKind,
    frame: FrameNumber,
}

impl SwapEntry {
    /// Creates a new swap entry.
    pub const fn new(kind: SwapKind, frame: FrameNumber) -> Self {
        Self { kind, frame }
    }

    /// Creates a migration placeholder for the given frame.
    pub const fn migration(frame: FrameNumber) -> Self {
        Self::new(SwapKind::Migration, frame)
    }

    /// Creates a device-private placeholder for the given frame.
    pub const fn device_private(frame: FrameNumber) -> Self {
        Self::new(SwapKind::DevicePrivate, frame)
    }

    /// Returns the kind of this placeholder.
    pub const fn kind(self) -> SwapKind {
        self.kind
    }

    /// Returns the physical frame this placeholder refers to.
    pub const fn frame(self) -> FrameNumber {
        self.frame
    }
}
