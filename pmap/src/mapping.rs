//! # Mapping Mutation
//!
//! The mutation surface of the translation hierarchy: on-demand level
//! expansion, mapping installation and removal, and protection changes.
//!
//! Every mutation of a present translation passes through the shootdown
//! protocol before the caller may rely on the new state, and every
//! install or clear of a leaf translation updates the reverse-mapping
//! table inside the same locked transaction. This module is the only
//! path to the reverse map's mutation routines.
//!
//! ## Expansion
//!
//! Growing the hierarchy follows an allocate-then-recheck discipline:
//! the candidate table page is acquired from the frame allocator without
//! holding the address-space lock (the allocator may block), then the
//! target slot is re-checked under the ownership-index lock and the
//! space lock. A caller that lost the race frees its candidate page and
//! returns success, since the desired end state already holds. At most
//! one table page is ever live for a given slot.

use core::fmt;
use core::sync::atomic::Ordering;

use bitflags::bitflags;

use crate::addresses::{
    Frame, PageSize, VirtAddr, KERNEL_WINDOW_END, KERNEL_WINDOW_START, PAGE_SIZE_2M,
    PAGE_SIZE_4K,
};
use crate::entries::{EntryFlags, PageTableEntry, Protection, TableLevel};
use crate::platform::AllocMode;
use crate::rmap::FrameAttrs;
use crate::space::{AddressSpace, TablePageIndex};
use crate::system::PhysMap;

/// 4 KiB pages per 2 MiB large page
const PAGES_PER_LARGE: i64 = (PAGE_SIZE_2M / PAGE_SIZE_4K) as i64;

// =============================================================================
// Errors
// =============================================================================

/// Failure of a mapping mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// No physical frame was available for a new table level
    ResourceShortage,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::ResourceShortage => write!(f, "no frame available for table expansion"),
        }
    }
}

// =============================================================================
// Mapping Attributes
// =============================================================================

bitflags! {
    /// Cache and size attributes of a requested mapping
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MapAttributes: u8 {
        /// Disable caching for this translation
        const CACHE_DISABLE = 1 << 0;
        /// Install a 2 MiB large-page translation at the middle level
        const LARGE = 1 << 1;
    }
}

// =============================================================================
// Expansion
// =============================================================================

impl PhysMap {
    /// The shared allocate-then-recheck step for one level.
    ///
    /// `exists` re-checks the target under both locks; `install` stores
    /// the parent entry. Returns `Ok` whether this caller installed the
    /// page or lost the race.
    fn expand_level(
        &self,
        space: &AddressSpace,
        index: &TablePageIndex,
        slot_key: u32,
        mode: AllocMode,
        exists: impl Fn(&Self) -> bool,
        install: impl Fn(&Self, Frame),
    ) -> Result<(), MapError> {
        let frame = self
            .frames
            .acquire(mode)
            .ok_or(MapError::ResourceShortage)?;
        self.table_at(frame).zero();
        self.frames.wire(frame);
        self.table_pages.fetch_add(1, Ordering::Relaxed);

        // Ownership-index lock first, space lock second. Always.
        let mut pages = index.lock();
        {
            let _space_guard = space.lock.lock();

            if exists(self) {
                // Someone else expanded us first; the end state already
                // holds.
                drop(_space_guard);
                drop(pages);
                self.frames.release(frame);
                self.table_pages.fetch_sub(1, Ordering::Relaxed);
                log::debug!(
                    "expansion of space {:#x} slot {} lost the race",
                    space.root_phys(),
                    slot_key
                );
                return Ok(());
            }

            pages.insert(slot_key, frame);
            install(self, frame);
        }
        Ok(())
    }

    /// Ensure the upper-level table covering `vaddr` exists.
    pub(crate) fn expand_upper(
        &self,
        space: &AddressSpace,
        vaddr: VirtAddr,
        mode: AllocMode,
    ) -> Result<(), MapError> {
        if self.upper_slot(space, vaddr).is_some() {
            return Ok(());
        }
        self.expand_level(
            space,
            &space.upper_index,
            vaddr.upper_slot(),
            mode,
            |s| s.upper_slot(space, vaddr).is_some(),
            |s, frame| {
                s.root_slot(space, vaddr)
                    .expect("canonical address")
                    .set(PageTableEntry::table(frame));
            },
        )
    }

    /// Ensure the middle-level table covering `vaddr` exists.
    pub(crate) fn expand_middle(
        &self,
        space: &AddressSpace,
        vaddr: VirtAddr,
        mode: AllocMode,
    ) -> Result<(), MapError> {
        loop {
            match self.upper_slot(space, vaddr) {
                Some(slot) => {
                    let entry = slot.get();
                    assert!(
                        !(entry.is_present() && entry.is_large()),
                        "expanding into a large mapping at {}",
                        vaddr
                    );
                    if entry.is_present() {
                        return Ok(());
                    }
                    break;
                }
                None => self.expand_upper(space, vaddr, mode)?,
            }
        }
        self.expand_level(
            space,
            &space.middle_index,
            vaddr.middle_slot(),
            mode,
            |s| s.middle_slot(space, vaddr).is_some(),
            |s, frame| {
                s.upper_slot(space, vaddr)
                    .expect("upper level exists")
                    .set(PageTableEntry::table(frame));
            },
        )
    }

    /// Expand the hierarchy so a leaf translation can be installed at
    /// `vaddr`.
    ///
    /// Calling this twice for the same address performs no additional
    /// allocation and succeeds both times.
    ///
    /// # Panics
    ///
    /// Panics when expanding the kernel space outside its permitted
    /// window, or when the address is already covered by a large-page
    /// translation.
    pub fn expand(
        &self,
        space: &AddressSpace,
        vaddr: VirtAddr,
        mode: AllocMode,
    ) -> Result<(), MapError> {
        assert!(vaddr.is_canonical(), "non-canonical address {}", vaddr);
        if space.is_kernel() {
            let va = vaddr.as_u64();
            assert!(
                (KERNEL_WINDOW_START..=KERNEL_WINDOW_END).contains(&va),
                "bad address {} for kernel space expansion",
                vaddr
            );
        }

        loop {
            match self.middle_slot(space, vaddr) {
                Some(slot) => {
                    let entry = slot.get();
                    assert!(
                        !(entry.is_present() && entry.is_large()),
                        "expanding into a large mapping at {}",
                        vaddr
                    );
                    if entry.is_present() {
                        return Ok(());
                    }
                    break;
                }
                None => self.expand_middle(space, vaddr, mode)?,
            }
        }
        self.expand_level(
            space,
            &space.leaf_index,
            vaddr.leaf_slot(),
            mode,
            |s| s.leaf_slot(space, vaddr).is_some(),
            |s, frame| {
                s.middle_slot(space, vaddr)
                    .expect("middle level exists")
                    .set(PageTableEntry::table(frame));
            },
        )
    }
}

// =============================================================================
// Enter
// =============================================================================

impl PhysMap {
    /// Build the entry flags for a requested mapping.
    fn entry_flags(
        &self,
        space: &AddressSpace,
        prot: Protection,
        attrs: MapAttributes,
        wired: bool,
    ) -> EntryFlags {
        let mut flags = EntryFlags::PRESENT;
        if prot.contains(Protection::WRITE) {
            flags |= EntryFlags::WRITABLE;
        }
        if !prot.contains(Protection::EXECUTE) && space.nx_enabled() {
            flags |= EntryFlags::NO_EXECUTE;
        }
        if space.is_kernel() {
            flags |= EntryFlags::GLOBAL;
        } else {
            flags |= EntryFlags::USER;
        }
        if attrs.contains(MapAttributes::CACHE_DISABLE) {
            flags |= EntryFlags::CACHE_DISABLE;
        }
        if wired {
            flags |= EntryFlags::WIRED;
        }
        flags
    }

    /// Install a translation from `vaddr` to `frame`
    ///
    /// Expands the hierarchy on demand (which may block unless
    /// [`AllocMode::NoWait`] is given), replaces any existing
    /// translation at the address, and keeps the reverse map and
    /// statistics in step within the same transaction.
    pub fn enter(
        &self,
        space: &AddressSpace,
        vaddr: VirtAddr,
        frame: Frame,
        prot: Protection,
        attrs: MapAttributes,
        wired: bool,
    ) -> Result<(), MapError> {
        assert!(
            vaddr.is_aligned(PageSize::Size4K),
            "unaligned enter at {}",
            vaddr
        );

        if prot.is_writable_executable() && !space.is_kernel() && self.is_finalized() {
            log::error!(
                "writable+executable mapping requested at {} in space {:#x}",
                vaddr,
                space.root_phys()
            );
        }

        if attrs.contains(MapAttributes::LARGE) {
            return self.enter_large(space, vaddr, frame, prot, attrs, wired);
        }

        let mode = AllocMode::Wait;
        while self.leaf_slot(space, vaddr).is_none() {
            self.expand(space, vaddr, mode)?;
        }

        let flags = self.entry_flags(space, prot, attrs, wired);
        let new = PageTableEntry::new(frame, flags);

        let guard = space.lock.lock();
        let slot = self.leaf_slot(space, vaddr).expect("leaf level exists");
        let old = slot.get();

        if old.is_present() {
            if old.frame() != frame {
                let removed = self.rmap.unbind(old.frame(), space.id(), vaddr);
                assert!(
                    removed || !self.rmap.is_managed(old.frame()),
                    "reverse map missing binding for {} at {}",
                    old.frame(),
                    vaddr
                );
                self.rmap.bind(frame, space.id(), vaddr);
            }
            if old.is_wired() && !wired {
                space.stats().add_wired(-1);
            } else if !old.is_wired() && wired {
                space.stats().add_wired(1);
            }
        } else {
            self.rmap.bind(frame, space.id(), vaddr);
            space.stats().add_resident(1);
            if wired {
                space.stats().add_wired(1);
            }
        }

        if wired {
            self.rmap.attribute_set(frame, FrameAttrs::WIRED);
        }

        slot.set(new);

        // A previously present translation may be cached somewhere.
        if old.is_present() {
            self.shootdown(space, vaddr, vaddr + PAGE_SIZE_4K as u64);
        }
        drop(guard);
        Ok(())
    }

    /// Install a 2 MiB large-page translation at the middle level.
    ///
    /// Large mappings target kernel text and device windows; their
    /// frames sit outside reclamation bookkeeping, so the reverse map is
    /// not consulted.
    fn enter_large(
        &self,
        space: &AddressSpace,
        vaddr: VirtAddr,
        frame: Frame,
        prot: Protection,
        attrs: MapAttributes,
        wired: bool,
    ) -> Result<(), MapError> {
        assert!(
            vaddr.is_aligned(PageSize::Size2M),
            "unaligned large enter at {}",
            vaddr
        );
        assert!(frame.is_large_aligned(), "unaligned large frame {}", frame);

        while self.middle_slot(space, vaddr).is_none() {
            self.expand_middle(space, vaddr, AllocMode::Wait)?;
        }

        let flags =
            self.entry_flags(space, prot, attrs, wired) | EntryFlags::LARGE;
        let new = PageTableEntry::new(frame, flags);

        let guard = space.lock.lock();
        let slot = self.middle_slot(space, vaddr).expect("middle level exists");
        let old = slot.get();
        assert!(
            !old.is_present() || old.is_large(),
            "large enter over a leaf table at {}",
            vaddr
        );

        if !old.is_present() {
            space.stats().add_resident(PAGES_PER_LARGE);
            if wired {
                space.stats().add_wired(PAGES_PER_LARGE);
            }
        }
        slot.set(new);

        if old.is_present() {
            self.shootdown(space, vaddr, vaddr + PAGE_SIZE_2M as u64);
        }
        drop(guard);
        Ok(())
    }
}

// =============================================================================
// Boot Seeding
// =============================================================================

impl PhysMap {
    /// Record reverse-map bindings and statistics for translations the
    /// low-level startup code installed directly, before this subsystem
    /// existed.
    ///
    /// These bindings have to exist so early kernel pages can later be
    /// removed through the ordinary transaction (boot finalization
    /// releases several such ranges). The hierarchy entries themselves
    /// are not touched.
    pub fn seed_boot_mapping(&self, space: &AddressSpace, vaddr: VirtAddr, frame: Frame, pages: u64) {
        let _guard = space.lock.lock();
        for i in 0..pages {
            self.rmap.bind(
                Frame::new(frame.number() + i),
                space.id(),
                vaddr + i * PAGE_SIZE_4K as u64,
            );
        }
        space.stats().add_resident(pages as i64);
    }
}

// =============================================================================
// Remove
// =============================================================================

impl PhysMap {
    /// Remove every translation in `[start, end)`
    ///
    /// Leaf table pages are not reclaimed here; they are freed when the
    /// space is destroyed.
    ///
    /// # Panics
    ///
    /// Panics if the range partially covers a large-page translation.
    pub fn remove(&self, space: &AddressSpace, start: VirtAddr, end: VirtAddr) {
        assert!(
            start.is_aligned(PageSize::Size4K) && end.is_aligned(PageSize::Size4K),
            "unaligned remove range {}..{}",
            start,
            end
        );

        let guard = space.lock.lock();
        let mut changed = 0u64;
        let mut cv = start;

        while cv < end {
            let stride_end = stride_limit(cv, end);

            let Some(mslot) = self.middle_slot(space, cv) else {
                cv = self.skip_absent(space, cv, end);
                continue;
            };
            let middle = mslot.get();
            if !middle.is_present() {
                cv = stride_end;
                continue;
            }

            if middle.is_large() {
                assert!(
                    cv.is_aligned(PageSize::Size2M)
                        && stride_end.as_u64() - cv.as_u64() == PAGE_SIZE_2M as u64,
                    "partial removal of a large mapping at {}",
                    cv
                );
                mslot.clear();
                space.stats().add_resident(-PAGES_PER_LARGE);
                if middle.is_wired() {
                    space.stats().add_wired(-PAGES_PER_LARGE);
                }
                changed += 1;
                cv = stride_end;
                continue;
            }

            while cv < stride_end {
                if let Some(slot) = self.leaf_slot(space, cv) {
                    let entry = slot.get();
                    if entry.is_present() {
                        slot.clear();
                        self.unbind_leaf(space, cv, entry);
                        changed += 1;
                    }
                }
                cv += PAGE_SIZE_4K as u64;
            }
        }

        if changed > 0 {
            self.shootdown(space, start, end);
        }
        drop(guard);
    }

    /// The reverse half of a leaf removal transaction.
    fn unbind_leaf(&self, space: &AddressSpace, vaddr: VirtAddr, entry: PageTableEntry) {
        let frame = entry.frame();
        let removed = self.rmap.unbind(frame, space.id(), vaddr);
        assert!(
            removed || !self.rmap.is_managed(frame),
            "reverse map missing binding for {} at {}",
            frame,
            vaddr
        );
        space.stats().add_resident(-1);
        if entry.is_wired() {
            space.stats().add_wired(-1);
            if self.rmap.is_unmapped(frame) {
                self.rmap.attribute_clear(frame, FrameAttrs::WIRED);
            }
        }
    }
}

// =============================================================================
// Protect
// =============================================================================

impl PhysMap {
    /// Set the protection of every translation in `[start, end)`
    ///
    /// Never increases permissions beyond `prot`: the writable bit is
    /// set only when the caller requests it, and requesting
    /// [`Protection::NONE`] removes the range outright (a present
    /// zero-permission mapping is not a representable state).
    ///
    /// The shootdown is skipped entirely when no entry actually changed.
    pub fn protect(&self, space: &AddressSpace, start: VirtAddr, end: VirtAddr, prot: Protection) {
        if prot == Protection::NONE {
            self.remove(space, start, end);
            return;
        }

        let set_nx = !prot.contains(Protection::EXECUTE) && space.nx_enabled();
        let (clear, set) = protection_delta(prot, set_nx);

        let guard = space.lock.lock();
        let mut changed = 0u64;
        let mut cv = start;

        while cv < end {
            let stride_end = stride_limit(cv, end);

            let Some(mslot) = self.middle_slot(space, cv) else {
                cv = self.skip_absent(space, cv, end);
                continue;
            };
            let middle = mslot.get();
            if !middle.is_present() {
                cv = stride_end;
                continue;
            }

            if middle.is_large() {
                let updated = middle.updated(clear, set);
                if updated != middle {
                    mslot.set(updated);
                    changed += 1;
                }
                cv = stride_end;
                continue;
            }

            while cv < stride_end {
                if let Some(slot) = self.leaf_slot(space, cv) {
                    let entry = slot.get();
                    if entry.is_present() {
                        let updated = entry.updated(clear, set);
                        if updated != entry {
                            slot.set(updated);
                            changed += 1;
                        }
                    }
                }
                cv += PAGE_SIZE_4K as u64;
            }
        }

        if changed > 0 {
            self.shootdown(space, start, end);
        }
        drop(guard);
    }
}

/// The flag delta a protection change applies to a present entry.
fn protection_delta(prot: Protection, set_nx: bool) -> (EntryFlags, EntryFlags) {
    let mut clear = EntryFlags::empty();
    let mut set = EntryFlags::empty();
    if prot.contains(Protection::WRITE) {
        set |= EntryFlags::WRITABLE;
    } else {
        clear |= EntryFlags::WRITABLE;
    }
    if set_nx {
        set |= EntryFlags::NO_EXECUTE;
    } else {
        clear |= EntryFlags::NO_EXECUTE;
    }
    (clear, set)
}

/// End of the middle-level stride containing `cv`, clamped to `end`.
fn stride_limit(cv: VirtAddr, end: VirtAddr) -> VirtAddr {
    let stride = (cv.as_u64() | (PAGE_SIZE_2M as u64 - 1)).saturating_add(1);
    VirtAddr::new(stride.min(end.as_u64()))
}

impl PhysMap {
    /// Next address worth visiting after `cv` when its middle table is
    /// absent: hop a whole top-level or upper-level span when the
    /// corresponding subtree does not exist, so sparse-range walks do
    /// not crawl a 64-bit space stride by stride.
    pub(crate) fn skip_absent(&self, space: &AddressSpace, cv: VirtAddr, end: VirtAddr) -> VirtAddr {
        let span = match self.root_slot(space, cv) {
            None => {
                // Non-canonical hole: resume at the kernel half.
                let resume = 0xFFFF_8000_0000_0000u64.max(cv.as_u64() + 1);
                return VirtAddr::new(resume.min(end.as_u64()));
            }
            Some(slot) if !slot.get().is_present() => TableLevel::Pml4.entry_span(),
            Some(_) => match self.upper_slot(space, cv) {
                Some(slot) if !slot.get().is_present() => TableLevel::Pdpt.entry_span(),
                _ => return stride_limit(cv, end),
            },
        };
        let next = (cv.as_u64() | (span - 1)).saturating_add(1);
        VirtAddr::new(next.min(end.as_u64()))
    }
}

// =============================================================================
// Boot-only Range Marking
// =============================================================================

impl PhysMap {
    /// Retroactively apply no-execute and/or read-only to a range of
    /// already-present kernel translations, including collapsed
    /// large-page entries.
    ///
    /// This is a one-time boot migration: it takes no locks, issues no
    /// shootdown (finalization flushes globally at the end), and must
    /// not run concurrently with general mapping mutation.
    pub(crate) fn mark_range(
        &self,
        space: &AddressSpace,
        start: VirtAddr,
        len: u64,
        nx: bool,
        ro: bool,
    ) {
        assert!(
            start.as_u64() & 0xFFF == 0 && len & 0xFFF == 0,
            "unaligned mark_range {}+{:#x}",
            start,
            len
        );

        let end = start + len;
        let mut cv = start;

        while cv < end {
            let stride_end = stride_limit(cv, end);

            let Some(mslot) = self.middle_slot(space, cv) else {
                cv = self.skip_absent(space, cv, end);
                continue;
            };
            let middle = mslot.get();
            if !middle.is_present() {
                cv = stride_end;
                continue;
            }

            if middle.is_large() {
                let mut updated = middle;
                if nx {
                    updated = updated.updated(EntryFlags::empty(), EntryFlags::NO_EXECUTE);
                }
                if ro {
                    updated = updated.updated(EntryFlags::WRITABLE, EntryFlags::empty());
                }
                mslot.set(updated);
                cv = stride_end;
                continue;
            }

            while cv < stride_end {
                if let Some(slot) = self.leaf_slot(space, cv) {
                    let entry = slot.get();
                    if entry.is_present() {
                        let mut updated = entry;
                        if nx {
                            updated =
                                updated.updated(EntryFlags::empty(), EntryFlags::NO_EXECUTE);
                        }
                        if ro {
                            updated = updated.updated(EntryFlags::WRITABLE, EntryFlags::empty());
                        }
                        slot.set(updated);
                    }
                }
                cv += PAGE_SIZE_4K as u64;
            }
        }
    }
}

// =============================================================================
// Emptiness
// =============================================================================

impl PhysMap {
    /// Whether no translation exists anywhere in `[start, end)`
    ///
    /// The resident count short-circuits the scan; a full-range walk of
    /// a 64-bit space is painfully slow.
    pub fn is_empty(&self, space: &AddressSpace, start: VirtAddr, end: VirtAddr) -> bool {
        if space.stats().resident() == 0 {
            return true;
        }

        let mut cv = start;
        while cv < end {
            if self.middle_slot(space, cv).is_none() {
                cv = self.skip_absent(space, cv, end);
                continue;
            }
            if let Some(frame) = self.translate(space, cv) {
                log::debug!(
                    "is_empty({:#x}): page {} at {}",
                    space.root_phys(),
                    frame,
                    cv
                );
                return false;
            }
            cv += PAGE_SIZE_4K as u64;
        }
        true
    }
}
