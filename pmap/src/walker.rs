//! # Hierarchy Walking
//!
//! Locating the entry slot covering a virtual address at each level of
//! the four-level radix hierarchy, and the lock-free `translate` query
//! built on top.
//!
//! Readers here take no locks: table slots are atomic words, and a
//! translation observed mid-mutation is either the old or the new value,
//! exactly as the hardware walker would see it.

use core::fmt;

use crate::addresses::{Frame, PageSize, VirtAddr};
use crate::entries::{PageTableEntry, TableLevel};
use crate::space::AddressSpace;
use crate::system::PhysMap;
use crate::table::{PageTable, TableIndex};

// =============================================================================
// Entry Slot
// =============================================================================

/// One addressable slot of a table-level page
#[derive(Clone, Copy)]
pub(crate) struct EntrySlot<'a> {
    table: &'a PageTable,
    index: TableIndex,
}

impl<'a> EntrySlot<'a> {
    #[inline]
    pub(crate) fn new(table: &'a PageTable, index: TableIndex) -> Self {
        Self { table, index }
    }

    /// Load the entry
    #[inline]
    pub(crate) fn get(self) -> PageTableEntry {
        self.table.get(self.index)
    }

    /// Store the entry
    #[inline]
    pub(crate) fn set(self, entry: PageTableEntry) {
        self.table.set(self.index, entry);
    }

    /// Clear the entry
    #[inline]
    pub(crate) fn clear(self) {
        self.table.clear(self.index);
    }
}

impl fmt::Debug for EntrySlot<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntrySlot")
            .field("index", &self.index)
            .field("entry", &self.get())
            .finish()
    }
}

// =============================================================================
// Per-level Lookup
// =============================================================================

impl PhysMap {
    /// The top-level slot covering `vaddr`, or `None` for a
    /// non-canonical address.
    pub(crate) fn root_slot<'a>(
        &'a self,
        space: &AddressSpace,
        vaddr: VirtAddr,
    ) -> Option<EntrySlot<'a>> {
        if !vaddr.is_canonical() {
            return None;
        }
        let table = self.table_at(space.root());
        Some(EntrySlot::new(table, TableIndex::from(vaddr.pml4_index())))
    }

    /// The upper-level slot covering `vaddr`, if the upper table exists.
    pub(crate) fn upper_slot<'a>(
        &'a self,
        space: &AddressSpace,
        vaddr: VirtAddr,
    ) -> Option<EntrySlot<'a>> {
        let root = self.root_slot(space, vaddr)?.get();
        if !root.is_present() {
            return None;
        }
        let table = self.table_at(root.frame());
        Some(EntrySlot::new(table, TableIndex::from(vaddr.pdpt_index())))
    }

    /// The middle-level slot covering `vaddr`, if the middle table
    /// exists. A 1 GiB large entry at the upper level has no middle
    /// slot.
    pub(crate) fn middle_slot<'a>(
        &'a self,
        space: &AddressSpace,
        vaddr: VirtAddr,
    ) -> Option<EntrySlot<'a>> {
        let upper = self.upper_slot(space, vaddr)?.get();
        if !upper.is_present() || upper.is_large() {
            return None;
        }
        let table = self.table_at(upper.frame());
        Some(EntrySlot::new(table, TableIndex::from(vaddr.pd_index())))
    }

    /// The leaf-level slot covering `vaddr`, if the leaf table exists.
    /// A 2 MiB large entry at the middle level has no leaf slot.
    pub(crate) fn leaf_slot<'a>(
        &'a self,
        space: &AddressSpace,
        vaddr: VirtAddr,
    ) -> Option<EntrySlot<'a>> {
        let middle = self.middle_slot(space, vaddr)?.get();
        if !middle.is_present() || middle.is_large() {
            return None;
        }
        let table = self.table_at(middle.frame());
        Some(EntrySlot::new(table, TableIndex::from(vaddr.pt_index())))
    }

    /// The present entry mapping `vaddr`, with the level it was found
    /// at, walking down through large-page entries.
    pub(crate) fn lookup_entry(
        &self,
        space: &AddressSpace,
        vaddr: VirtAddr,
    ) -> Option<(PageTableEntry, TableLevel)> {
        let upper = self.upper_slot(space, vaddr)?.get();
        if !upper.is_present() {
            return None;
        }
        if upper.is_large() {
            return Some((upper, TableLevel::Pdpt));
        }

        let middle = EntrySlot::new(
            self.table_at(upper.frame()),
            TableIndex::from(vaddr.pd_index()),
        )
        .get();
        if !middle.is_present() {
            return None;
        }
        if middle.is_large() {
            return Some((middle, TableLevel::Pd));
        }

        let leaf = EntrySlot::new(
            self.table_at(middle.frame()),
            TableIndex::from(vaddr.pt_index()),
        )
        .get();
        leaf.is_present().then_some((leaf, TableLevel::Pt))
    }

    // -------------------------------------------------------------------------
    // Translation
    // -------------------------------------------------------------------------

    /// The protection of the translation covering `vaddr`, if present
    ///
    /// This is what the fault path consults to decide whether an access
    /// was legitimately denied.
    pub fn protection_at(
        &self,
        space: &AddressSpace,
        vaddr: VirtAddr,
    ) -> Option<crate::entries::Protection> {
        self.lookup_entry(space, vaddr)
            .map(|(entry, _)| entry.derived_protection())
    }

    /// Translate a virtual address to the 4 KiB frame backing it
    ///
    /// Returns `None` when no present translation covers the address.
    pub fn translate(&self, space: &AddressSpace, vaddr: VirtAddr) -> Option<Frame> {
        let (entry, level) = self.lookup_entry(space, vaddr)?;
        let frame = match entry.page_size(level) {
            PageSize::Size4K => entry.frame(),
            size => {
                // Offset of the 4 KiB page inside the large mapping.
                let pages = (vaddr.as_u64() & !size.mask()) >> 12;
                Frame::new(entry.frame().number() + pages)
            }
        };
        Some(frame)
    }
}
