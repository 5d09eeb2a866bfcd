//! # Address-Space Objects
//!
//! The per-address-space handle: the root table, the reference count and
//! structural-mutation lock, per-space flags, resident statistics, and
//! the per-level ownership index used to locate and free table-level
//! pages at teardown.
//!
//! ## Locking
//!
//! Two locks are involved in hierarchy expansion and teardown, always in
//! the same order: a [`TablePageIndex`] lock first, then the space lock.
//! The index lock is deliberately coarser in character (it guards a heap
//! structure and is held across bookkeeping), while the space lock is
//! the short spinlock serializing structural mutation of the hierarchy
//! itself. Reversing the order is a deadlock hazard.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use hashbrown::HashMap;
use spin::{Mutex, MutexGuard};

use crate::addresses::{Frame, PhysAddr};
use crate::asid::SpaceTag;
use crate::rmap::SpaceId;

// =============================================================================
// Accounting Handle
// =============================================================================

/// Opaque handle to the accounting object memory is attributed to
///
/// This core never interprets it; it is carried so the owning task's
/// bookkeeping can be found from the space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct AccountingId(pub u64);

// =============================================================================
// Address Width
// =============================================================================

/// Address-width mode of a space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressWidth {
    /// Legacy 32-bit task
    Bits32,
    /// Full 64-bit task
    Bits64,
}

// =============================================================================
// Statistics
// =============================================================================

/// Resident-page statistics of one space
#[derive(Debug, Default)]
pub struct SpaceStats {
    resident: AtomicI64,
    resident_max: AtomicI64,
    wired: AtomicI64,
}

impl SpaceStats {
    /// Create zeroed statistics
    pub const fn new() -> Self {
        Self {
            resident: AtomicI64::new(0),
            resident_max: AtomicI64::new(0),
            wired: AtomicI64::new(0),
        }
    }

    /// Current resident page count
    #[inline]
    pub fn resident(&self) -> i64 {
        self.resident.load(Ordering::Relaxed)
    }

    /// High-water mark of the resident page count
    #[inline]
    pub fn resident_max(&self) -> i64 {
        self.resident_max.load(Ordering::Relaxed)
    }

    /// Current wired page count
    #[inline]
    pub fn wired(&self) -> i64 {
        self.wired.load(Ordering::Relaxed)
    }

    /// Adjust the resident count, maintaining the high-water mark
    pub(crate) fn add_resident(&self, delta: i64) {
        let now = self.resident.fetch_add(delta, Ordering::Relaxed) + delta;
        if delta > 0 {
            self.resident_max.fetch_max(now, Ordering::Relaxed);
        }
    }

    /// Adjust the wired count
    pub(crate) fn add_wired(&self, delta: i64) {
        self.wired.fetch_add(delta, Ordering::Relaxed);
    }
}

// =============================================================================
// Table-Page Ownership Index
// =============================================================================

/// Index of the table-level pages a space privately owns at one level,
/// keyed by address-space-relative slot number
///
/// This is the arena behind the expansion path's install-if-absent
/// discipline: a candidate page is acquired speculatively, and only the
/// caller that finds the hierarchy slot still empty under the space lock
/// records its page here. The index is also how teardown finds every
/// page to free.
pub struct TablePageIndex {
    pages: Mutex<HashMap<u32, Frame>>,
}

impl TablePageIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self {
            pages: Mutex::new(HashMap::new()),
        }
    }

    /// Lock the index. Acquired before the space lock, never after.
    #[inline]
    pub(crate) fn lock(&self) -> MutexGuard<'_, HashMap<u32, Frame>> {
        self.pages.lock()
    }

    /// Look up the page recorded for a slot
    #[inline]
    pub fn get(&self, slot: u32) -> Option<Frame> {
        self.pages.lock().get(&slot).copied()
    }

    /// Number of pages recorded
    #[inline]
    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    /// Whether no pages are recorded
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pages.lock().is_empty()
    }

    /// Remove and return every recorded page (teardown)
    pub(crate) fn drain(&self) -> alloc::vec::Vec<Frame> {
        self.pages.lock().drain().map(|(_, frame)| frame).collect()
    }

    /// Remove the page recorded for one slot (superpage coalescing)
    pub(crate) fn remove(&self, slot: u32) -> Option<Frame> {
        self.pages.lock().remove(&slot)
    }
}

impl Default for TablePageIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TablePageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TablePageIndex")
            .field("pages", &self.len())
            .finish()
    }
}

// =============================================================================
// Address Space
// =============================================================================

/// State guarded by the space lock
pub(crate) struct SpaceMut {
    /// Reference count; the space is torn down when this reaches zero
    pub ref_count: u32,
}

/// One hardware-backed address space
///
/// Exactly one instance exists per user process, plus the distinguished
/// kernel instance created at bootstrap from statically reserved tables.
pub struct AddressSpace {
    /// Frame holding the top-level table page
    root: Frame,
    /// Physical address of the top-level table (the value loaded into
    /// the hardware root register)
    root_phys: PhysAddr,
    /// This is the kernel's own space
    is_kernel: bool,
    /// Address-width mode
    width: AddressWidth,
    /// Execute-disable enforcement for this space
    nx_enabled: AtomicBool,
    /// The space is shared by multiple logical maps; shootdowns treat it
    /// like the kernel space
    shared: AtomicBool,
    /// Accelerator tag, when tag-based partial invalidation is in effect
    tag: Option<SpaceTag>,
    /// Owning accounting handle (opaque)
    ledger: AccountingId,
    /// Resident-page statistics
    stats: SpaceStats,
    /// Structural-mutation lock; also guards the reference count
    pub(crate) lock: Mutex<SpaceMut>,
    /// Ownership index of upper-level table pages
    pub(crate) upper_index: TablePageIndex,
    /// Ownership index of middle-level table pages
    pub(crate) middle_index: TablePageIndex,
    /// Ownership index of leaf-level table pages
    pub(crate) leaf_index: TablePageIndex,
}

impl AddressSpace {
    /// Assemble a space around an already-initialized root table page
    pub(crate) fn new(
        root: Frame,
        is_kernel: bool,
        width: AddressWidth,
        tag: Option<SpaceTag>,
        ledger: AccountingId,
    ) -> Self {
        Self {
            root,
            root_phys: root.base(),
            is_kernel,
            width,
            nx_enabled: AtomicBool::new(true),
            shared: AtomicBool::new(false),
            tag,
            ledger,
            stats: SpaceStats::new(),
            lock: Mutex::new(SpaceMut { ref_count: 1 }),
            upper_index: TablePageIndex::new(),
            middle_index: TablePageIndex::new(),
            leaf_index: TablePageIndex::new(),
        }
    }

    /// Frame holding the top-level table page
    #[inline]
    pub fn root(&self) -> Frame {
        self.root
    }

    /// Physical address of the top-level table
    #[inline]
    pub fn root_phys(&self) -> PhysAddr {
        self.root_phys
    }

    /// Stable identity of this space
    #[inline]
    pub fn id(&self) -> SpaceId {
        SpaceId::from_root(self.root_phys)
    }

    /// Whether this is the kernel's space
    #[inline]
    pub fn is_kernel(&self) -> bool {
        self.is_kernel
    }

    /// Address-width mode
    #[inline]
    pub fn width(&self) -> AddressWidth {
        self.width
    }

    /// Whether execute-disable is enforced for this space
    #[inline]
    pub fn nx_enabled(&self) -> bool {
        self.nx_enabled.load(Ordering::Relaxed)
    }

    /// Disable execute-protection for this space
    pub fn disable_nx(&self) {
        self.nx_enabled.store(false, Ordering::Relaxed);
        log::debug!("space {:#x}: execute-disable turned off", self.root_phys);
    }

    /// Whether this space is shared by multiple logical maps
    #[inline]
    pub fn is_shared(&self) -> bool {
        self.shared.load(Ordering::Relaxed)
    }

    /// Flag this space as shared by multiple logical maps
    pub fn mark_shared(&self) {
        self.shared.store(true, Ordering::Relaxed);
    }

    /// Accelerator tag, if tags are in effect
    #[inline]
    pub fn tag(&self) -> Option<SpaceTag> {
        self.tag
    }

    /// Owning accounting handle
    #[inline]
    pub fn ledger(&self) -> AccountingId {
        self.ledger
    }

    /// Resident-page statistics
    #[inline]
    pub fn stats(&self) -> &SpaceStats {
        &self.stats
    }

    /// Current reference count
    pub fn ref_count(&self) -> u32 {
        self.lock.lock().ref_count
    }

    /// Total table-level pages privately owned (all levels)
    pub fn owned_table_pages(&self) -> usize {
        self.upper_index.len() + self.middle_index.len() + self.leaf_index.len()
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("root", &self.root_phys)
            .field("kernel", &self.is_kernel)
            .field("width", &self.width)
            .field("resident", &self.stats.resident())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
