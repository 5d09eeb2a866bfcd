//! # Mapping Entries
//!
//! The typed page-table-entry abstraction. All knowledge of the hardware
//! bit layout lives here; every other module manipulates semantic fields
//! (present, writable, no-execute, frame number) rather than raw words.
//!
//! ## Entry layout
//!
//! ```text
//! 63    62..52   51..12   11..10   9      8       7      6..5   4..0
//! NX    avail    frame    avail    WIRED  GLOBAL  LARGE  D/A    PCD/PWT/U/W/P
//! ```
//!
//! Bits 9 and 10 are software-defined: bit 9 marks a wired translation,
//! bit 10 marks a frame exempt from memory encryption.

use core::fmt;

use bitflags::bitflags;

use crate::addresses::{Frame, PageSize, PhysAddr, ENTRIES_PER_TABLE};

/// Mask of the frame-number field within an entry
const ENTRY_FRAME_MASK: u64 = 0x000F_FFFF_FFFF_F000;

// =============================================================================
// Entry Flags
// =============================================================================

bitflags! {
    /// Hardware and software flag bits of a mapping entry
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u64 {
        /// Translation is present
        const PRESENT = 1 << 0;
        /// Writes are permitted
        const WRITABLE = 1 << 1;
        /// User-mode accesses are permitted
        const USER = 1 << 2;
        /// Write-through caching
        const WRITE_THROUGH = 1 << 3;
        /// Caching disabled
        const CACHE_DISABLE = 1 << 4;
        /// Set by hardware on access
        const ACCESSED = 1 << 5;
        /// Set by hardware on write
        const DIRTY = 1 << 6;
        /// Entry maps a large page directly (intermediate levels only)
        const LARGE = 1 << 7;
        /// Translation survives non-global TLB flushes
        const GLOBAL = 1 << 8;
        /// Software: translation is wired and must not be reclaimed
        const WIRED = 1 << 9;
        /// Software: frame is exempt from memory encryption
        const NO_ENCRYPT = 1 << 10;
        /// Instruction fetch is not permitted
        const NO_EXECUTE = 1 << 63;
    }
}

impl EntryFlags {
    /// Flags used for intermediate-level entries pointing at a child
    /// table page. Permissions are refined at the leaf.
    #[inline]
    pub const fn table() -> Self {
        Self::PRESENT.union(Self::WRITABLE).union(Self::USER)
    }
}

// =============================================================================
// Protection
// =============================================================================

bitflags! {
    /// Logical protection requested by the virtual-memory layer
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Protection: u8 {
        /// Read access
        const READ = 1 << 0;
        /// Write access
        const WRITE = 1 << 1;
        /// Instruction fetch
        const EXECUTE = 1 << 2;
    }
}

impl Protection {
    /// No access at all. Requesting this from `protect` removes the range.
    pub const NONE: Protection = Protection::empty();

    /// Read-only access
    pub const READ_ONLY: Protection = Protection::READ;

    /// Read-write access
    pub const READ_WRITE: Protection = Protection::READ.union(Protection::WRITE);

    /// Check whether both write and execute are requested
    #[inline]
    pub const fn is_writable_executable(self) -> bool {
        self.contains(Protection::WRITE.union(Protection::EXECUTE))
    }
}

impl fmt::Display for Protection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.contains(Protection::READ) { "r" } else { "-" },
            if self.contains(Protection::WRITE) { "w" } else { "-" },
            if self.contains(Protection::EXECUTE) { "x" } else { "-" },
        )
    }
}

// =============================================================================
// Table Level
// =============================================================================

/// The four radix levels of the translation hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TableLevel {
    /// Leaf level (PT): 4 KiB per entry
    Pt = 1,
    /// Middle level (PD): 2 MiB per entry
    Pd = 2,
    /// Upper level (PDPT): 1 GiB per entry
    Pdpt = 3,
    /// Top level (PML4): 512 GiB per entry
    Pml4 = 4,
}

impl TableLevel {
    /// Human-readable level name
    #[inline]
    pub const fn name(self) -> &'static str {
        match self {
            TableLevel::Pt => "PT",
            TableLevel::Pd => "PD",
            TableLevel::Pdpt => "PDPT",
            TableLevel::Pml4 => "PML4",
        }
    }

    /// Next level down the hierarchy
    #[inline]
    pub const fn next_lower(self) -> Option<TableLevel> {
        match self {
            TableLevel::Pml4 => Some(TableLevel::Pdpt),
            TableLevel::Pdpt => Some(TableLevel::Pd),
            TableLevel::Pd => Some(TableLevel::Pt),
            TableLevel::Pt => None,
        }
    }

    /// Bytes of virtual space mapped by one entry at this level
    #[inline]
    pub const fn entry_span(self) -> u64 {
        match self {
            TableLevel::Pt => 1 << 12,
            TableLevel::Pd => 1 << 21,
            TableLevel::Pdpt => 1 << 30,
            TableLevel::Pml4 => 1 << 39,
        }
    }

    /// Whether an entry at this level may map a large page directly
    #[inline]
    pub const fn can_map_large(self) -> bool {
        matches!(self, TableLevel::Pd | TableLevel::Pdpt)
    }
}

impl fmt::Display for TableLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Page Table Entry
// =============================================================================

/// A single mapping entry: one slot of a table-level page
///
/// Encodes either a pointer to the next-lower table level, a 4 KiB leaf
/// translation, or a collapsed large-page translation.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    /// Create an empty (not-present) entry
    #[inline]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Create an entry mapping the given frame with the given flags
    #[inline]
    pub const fn new(frame: Frame, flags: EntryFlags) -> Self {
        Self(((frame.number() << 12) & ENTRY_FRAME_MASK) | flags.bits())
    }

    /// Create an intermediate entry pointing at a child table page
    #[inline]
    pub const fn table(frame: Frame) -> Self {
        Self::new(frame, EntryFlags::table())
    }

    /// Reconstruct an entry from its raw bits
    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Get the raw bits
    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Get the flags
    #[inline]
    pub const fn flags(self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0)
    }

    /// Get the referenced frame number
    #[inline]
    pub const fn frame(self) -> Frame {
        Frame::new((self.0 & ENTRY_FRAME_MASK) >> 12)
    }

    /// Get the referenced physical address
    #[inline]
    pub const fn address(self) -> PhysAddr {
        PhysAddr::new(self.0 & ENTRY_FRAME_MASK)
    }

    /// Check if the translation is present
    #[inline]
    pub const fn is_present(self) -> bool {
        self.0 & EntryFlags::PRESENT.bits() != 0
    }

    /// Check if writes are permitted
    #[inline]
    pub const fn is_writable(self) -> bool {
        self.0 & EntryFlags::WRITABLE.bits() != 0
    }

    /// Check if user-mode access is permitted
    #[inline]
    pub const fn is_user(self) -> bool {
        self.0 & EntryFlags::USER.bits() != 0
    }

    /// Check if this maps a large page directly
    #[inline]
    pub const fn is_large(self) -> bool {
        self.0 & EntryFlags::LARGE.bits() != 0
    }

    /// Check if the translation is wired
    #[inline]
    pub const fn is_wired(self) -> bool {
        self.0 & EntryFlags::WIRED.bits() != 0
    }

    /// Check if instruction fetch is permitted
    #[inline]
    pub const fn is_executable(self) -> bool {
        self.is_present() && self.0 & EntryFlags::NO_EXECUTE.bits() == 0
    }

    /// Check if this entry is simultaneously writable and executable
    ///
    /// After boot finalization no non-kernel translation may satisfy
    /// this predicate; the permission audit reports every offender.
    #[inline]
    pub const fn is_writable_executable(self) -> bool {
        self.is_present() && self.is_writable() && self.is_executable()
    }

    /// The logical protection implied by this entry: read implied by
    /// presence, write from the writable bit, execute from the absence
    /// of no-execute.
    #[inline]
    pub fn derived_protection(self) -> Protection {
        if !self.is_present() {
            return Protection::NONE;
        }
        let mut prot = Protection::READ;
        if self.is_writable() {
            prot |= Protection::WRITE;
        }
        if self.is_executable() {
            prot |= Protection::EXECUTE;
        }
        prot
    }

    /// Return a copy with `clear` bits removed and `set` bits added
    #[inline]
    pub const fn updated(self, clear: EntryFlags, set: EntryFlags) -> Self {
        Self((self.0 & !clear.bits()) | set.bits())
    }

    /// The page size this entry maps, given its level
    #[inline]
    pub fn page_size(self, level: TableLevel) -> PageSize {
        match level {
            TableLevel::Pd if self.is_large() => PageSize::Size2M,
            TableLevel::Pdpt if self.is_large() => PageSize::Size1G,
            _ => PageSize::Size4K,
        }
    }
}

impl Default for PageTableEntry {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_present() {
            return write!(f, "PageTableEntry(absent)");
        }
        write!(
            f,
            "PageTableEntry({} -> {:#x}, {:?})",
            self.derived_protection(),
            self.address().as_u64(),
            self.flags()
        )
    }
}

// =============================================================================
// Compile-time Assertions
// =============================================================================

const _: () = {
    use core::mem::size_of;

    // An entry is exactly one hardware table word.
    assert!(size_of::<PageTableEntry>() == 8);

    // 512 entries fill one 4 KiB table page.
    assert!(size_of::<PageTableEntry>() * ENTRIES_PER_TABLE == 4096);
};

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_round_trip() {
        let entry = PageTableEntry::new(
            Frame::new(0x1234),
            EntryFlags::PRESENT | EntryFlags::WRITABLE,
        );
        assert!(entry.is_present());
        assert!(entry.is_writable());
        assert!(!entry.is_user());
        assert_eq!(entry.frame(), Frame::new(0x1234));
        assert_eq!(entry.address().as_u64(), 0x1234 << 12);
    }

    #[test]
    fn test_no_execute() {
        let nx = PageTableEntry::new(
            Frame::new(1),
            EntryFlags::PRESENT | EntryFlags::NO_EXECUTE,
        );
        assert!(!nx.is_executable());
        assert!(!nx.is_writable_executable());

        let wx = PageTableEntry::new(
            Frame::new(1),
            EntryFlags::PRESENT | EntryFlags::WRITABLE,
        );
        assert!(wx.is_writable_executable());
    }

    #[test]
    fn test_derived_protection() {
        let entry = PageTableEntry::new(
            Frame::new(7),
            EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::NO_EXECUTE,
        );
        assert_eq!(entry.derived_protection(), Protection::READ_WRITE);
        assert_eq!(PageTableEntry::empty().derived_protection(), Protection::NONE);
    }

    #[test]
    fn test_updated_preserves_frame() {
        let entry = PageTableEntry::new(
            Frame::new(0x42),
            EntryFlags::PRESENT | EntryFlags::WRITABLE,
        );
        let ro = entry.updated(EntryFlags::WRITABLE, EntryFlags::NO_EXECUTE);
        assert!(!ro.is_writable());
        assert!(!ro.is_executable());
        assert_eq!(ro.frame(), Frame::new(0x42));
    }

    #[test]
    fn test_level_spans() {
        assert_eq!(TableLevel::Pt.entry_span(), 4096);
        assert_eq!(TableLevel::Pd.entry_span(), 2 * 1024 * 1024);
        assert_eq!(TableLevel::Pml4.next_lower(), Some(TableLevel::Pdpt));
        assert_eq!(TableLevel::Pt.next_lower(), None);
        assert!(TableLevel::Pd.can_map_large());
        assert!(!TableLevel::Pml4.can_map_large());
    }
}
