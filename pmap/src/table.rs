//! # Table-Level Pages
//!
//! A page-sized array of mapping-entry slots forming one radix level of
//! the translation hierarchy.
//!
//! Entry slots are atomic words: the hardware walks these tables
//! concurrently with software mutation, so every store must be a single
//! atomic write and every load a single atomic read. Lock-free readers
//! (`translate`) rely on the same discipline.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::addresses::ENTRIES_PER_TABLE;
use crate::entries::PageTableEntry;

// =============================================================================
// Table Index
// =============================================================================

/// A validated index into a table-level page (0-511)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct TableIndex(u16);

impl TableIndex {
    /// Create a new table index
    ///
    /// # Panics
    ///
    /// Panics if the index is >= 512.
    #[inline]
    pub const fn new(index: u16) -> Self {
        assert!(index < ENTRIES_PER_TABLE as u16);
        Self(index)
    }

    /// Create a new table index, truncating to the valid range
    #[inline]
    pub const fn new_truncate(index: u16) -> Self {
        Self(index & 0x1FF)
    }

    /// Get the index as usize
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for TableIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableIndex({})", self.0)
    }
}

impl fmt::Display for TableIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<usize> for TableIndex {
    #[inline]
    fn from(index: usize) -> Self {
        Self::new_truncate(index as u16)
    }
}

// =============================================================================
// Page Table
// =============================================================================

/// One table-level page (512 entries, 4096 bytes)
///
/// Represents any of the four radix levels. The page itself lives in a
/// physical frame owned by exactly one address space (except for the
/// shared kernel top level) and is always accessed through a shared
/// reference; interior mutability is provided by the atomic slots.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [AtomicU64; ENTRIES_PER_TABLE],
}

impl PageTable {
    /// Create a new empty page table
    #[inline]
    pub const fn new() -> Self {
        Self {
            entries: [const { AtomicU64::new(0) }; ENTRIES_PER_TABLE],
        }
    }

    /// Load the entry at the given index
    ///
    /// Acquire ordering pairs with the release store in [`Self::set`]:
    /// a reader that observes a present intermediate entry also observes
    /// the zeroed contents of the child table it points to.
    #[inline]
    pub fn get(&self, index: TableIndex) -> PageTableEntry {
        PageTableEntry::from_bits(self.entries[index.as_usize()].load(Ordering::Acquire))
    }

    /// Store the entry at the given index
    #[inline]
    pub fn set(&self, index: TableIndex, entry: PageTableEntry) {
        self.entries[index.as_usize()].store(entry.bits(), Ordering::Release);
    }

    /// Clear the entry at the given index
    #[inline]
    pub fn clear(&self, index: TableIndex) {
        self.set(index, PageTableEntry::empty());
    }

    /// Zero every entry
    #[inline]
    pub fn zero(&self) {
        for entry in self.entries.iter() {
            entry.store(0, Ordering::Release);
        }
    }

    /// Get the number of present entries
    #[inline]
    pub fn count_present(&self) -> usize {
        self.iter_snapshot().filter(|(_, e)| e.is_present()).count()
    }

    /// Check if the table is empty (all entries not present)
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.iter_snapshot().all(|(_, e)| !e.is_present())
    }

    /// Check if the table has no present entries outside the given slots
    ///
    /// Used at address-space destruction: the shared kernel top-level
    /// slots are expected to remain, everything else must be gone.
    #[inline]
    pub fn is_empty_excluding(&self, excluded: &[usize]) -> bool {
        self.iter_snapshot()
            .all(|(i, e)| !e.is_present() || excluded.contains(&i.as_usize()))
    }

    /// Iterate a snapshot of all entries with their indices
    #[inline]
    pub fn iter_snapshot(&self) -> impl Iterator<Item = (TableIndex, PageTableEntry)> + '_ {
        self.entries.iter().enumerate().map(|(i, e)| {
            (
                TableIndex::new_truncate(i as u16),
                PageTableEntry::from_bits(e.load(Ordering::Acquire)),
            )
        })
    }

    /// Iterate a snapshot of present entries with their indices
    #[inline]
    pub fn iter_present(&self) -> impl Iterator<Item = (TableIndex, PageTableEntry)> + '_ {
        self.iter_snapshot().filter(|(_, e)| e.is_present())
    }

    /// Copy the given slots from another table
    ///
    /// Used once per address-space creation to share the kernel's
    /// top-level entries.
    #[inline]
    pub fn copy_slots(&self, from: &PageTable, slots: &[usize]) {
        for &slot in slots {
            let index = TableIndex::new_truncate(slot as u16);
            self.set(index, from.get(index));
        }
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PageTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageTable")
            .field("present_entries", &self.count_present())
            .field("address", &format_args!("{:p}", self))
            .finish()
    }
}

// =============================================================================
// Compile-time Assertions
// =============================================================================

const _: () = {
    use core::mem::{align_of, size_of};

    // A table-level page must be exactly one page.
    assert!(size_of::<PageTable>() == 4096);

    // And page-aligned.
    assert!(align_of::<PageTable>() == 4096);

    assert!(ENTRIES_PER_TABLE == 512);
};

// =============================================================================
// Tests
// =============================================================================
