//! # Boot Finalization
//!
//! The one-shot topology compaction run once the general VM system is
//! live: releasing identity-mapped low memory that is no longer needed,
//! removing leftover identity mappings below the kernel base, coalescing
//! kernel text onto large pages, write-protecting text, marking data
//! no-execute, and applying per-segment protections. The mutation
//! portion runs with interrupts disabled on the executing processor and
//! ends with a global translation-cache flush, because the structure of
//! the tables changes shape, not just permission bits.

use core::sync::atomic::Ordering;

use crate::addresses::{
    PageSize, PhysAddr, LOW_CRITICAL_END, LOW_CRITICAL_START, PAGE_SIZE_2M, PAGE_SIZE_4K,
};
use crate::entries::{EntryFlags, PageTableEntry};
use crate::platform::{KernelLayout, MemoryRegion, SegmentClass};
use crate::system::PhysMap;

/// Round a byte count up to a whole number of pages.
#[inline]
fn round_page(size: u64) -> u64 {
    (size + (PAGE_SIZE_4K as u64 - 1)) & !(PAGE_SIZE_4K as u64 - 1)
}

impl PhysMap {
    /// Run boot finalization
    ///
    /// Must be called exactly once, after the VM system is initialized
    /// and before any user task runs. Not safe to call concurrently with
    /// mapping mutation.
    ///
    /// # Panics
    ///
    /// Panics on a second invocation, and on structurally impossible
    /// layouts (misaligned pre-initialization sections).
    pub fn finalize_boot(&self, layout: &KernelLayout<'_>, regions: &[MemoryRegion]) {
        assert!(
            !self.finalized.swap(true, Ordering::AcqRel),
            "boot finalization ran twice"
        );

        let kernel = self.kernel_space();
        let kernel_base_frame = self
            .translate(kernel, layout.kernel_base)
            .expect("kernel base is mapped");

        // ---------------------------------------------------------------------
        // Release low regions no longer needed.
        // ---------------------------------------------------------------------
        for region in regions {
            if region.end >= kernel_base_frame {
                continue;
            }
            if region.reserved {
                continue;
            }

            let mut pbase = region.base.base().as_u64();
            let mut pend = region.end.next().base().as_u64();
            log::debug!("low region [{:#x}, {:#x})", pbase, pend);

            // Never free the early-boot-critical low range; it must
            // survive sleep/wake.
            if pbase >= LOW_CRITICAL_START && pend <= LOW_CRITICAL_END {
                continue;
            }
            if pbase < LOW_CRITICAL_START && pend > LOW_CRITICAL_END {
                self.frames
                    .release_static(PhysAddr::new(pbase), LOW_CRITICAL_START - pbase);
                pbase = LOW_CRITICAL_END;
            }
            if pbase < LOW_CRITICAL_START {
                pend = pend.min(LOW_CRITICAL_START);
            }
            if pend > LOW_CRITICAL_END {
                pbase = pbase.max(LOW_CRITICAL_END);
            }
            if pend > pbase {
                self.frames.release_static(PhysAddr::new(pbase), pend - pbase);
            }
        }

        // A final pass to get rid of the initial identity mappings to
        // low pages, past the descriptor aliases and low globals.
        self.remove(kernel, layout.low_keep_end, layout.kernel_base);

        // ---------------------------------------------------------------------
        // Decide the text page size.
        // ---------------------------------------------------------------------
        let aligned = layout.text_start.is_aligned(PageSize::Size2M)
            && layout.data_start.is_aligned(PageSize::Size2M);
        let mut text_large = false;
        if aligned {
            if self.overrides.force_small_text_pages {
                log::info!("kernel text is 2MiB aligned but will be mapped with 4KiB pages");
            } else {
                log::info!("kernel text is 2MiB aligned and will be mapped with 2MiB pages");
                text_large = true;
            }
        }

        let wp = self.overrides.write_protect_text;
        if wp {
            log::info!(
                "kernel text {}-{} to be write-protected",
                layout.text_start,
                layout.text_end
            );
        }

        let saved = self.cpu_if.disable_interrupts();

        if !text_large && wp {
            self.mark_range(
                kernel,
                layout.text_start,
                layout.text_end.as_u64() - layout.text_start.as_u64(),
                false,
                true,
            );
        }

        if text_large {
            self.coalesce_text(layout, wp);
        }

        self.protect_data(layout);
        self.protect_segments(layout);

        self.cpu_if.restore_interrupts(saved);

        // The translation structure changed shape; flush everything,
        // global entries included.
        self.cpu_if.flush_global();
        log::info!("boot finalization complete");
    }

    // -------------------------------------------------------------------------
    // Text coalescing
    // -------------------------------------------------------------------------

    /// Replace the 4 KiB text mappings with 2 MiB entries, releasing the
    /// alignment padding and the orphaned leaf table pages.
    fn coalesce_text(&self, layout: &KernelLayout<'_>, wp: bool) {
        let kernel = self.kernel_space();

        // Release the zero-filled padding used to achieve 2MiB
        // alignment below and above text.
        for (start, end) in [
            (layout.early_end, layout.text_start),
            (layout.text_end, layout.data_start),
        ] {
            let len = end.as_u64().saturating_sub(start.as_u64());
            if len == 0 {
                continue;
            }
            if let Some(frame) = self.translate(kernel, start) {
                log::debug!("releasing {:#x} bytes of alignment padding at {}", len, start);
                self.remove(kernel, start, end);
                self.frames.release_static(frame.base(), len);
            }
        }

        let mut myva = layout.text_start;
        while myva < layout.data_start {
            let leaf = self.leaf_slot(kernel, myva).map(|s| s.get());
            let Some(leaf) = leaf.filter(|e| e.is_present()) else {
                myva += PAGE_SIZE_2M as u64;
                continue;
            };

            let mslot = self.middle_slot(kernel, myva).expect("text middle level");
            let middle = mslot.get();

            // Page attributes from the intermediate entry, frame from
            // the first leaf entry, collapsed into one large entry.
            let mut large = PageTableEntry::new(
                leaf.frame(),
                middle.flags() | EntryFlags::LARGE | EntryFlags::GLOBAL,
            );
            if wp {
                large = large.updated(EntryFlags::WRITABLE, EntryFlags::empty());
            }

            let orphan = middle.frame();
            mslot.set(large);

            // The now-unused leaf table page goes back to the pool.
            if kernel.leaf_index.remove(myva.leaf_slot()).is_some() {
                self.table_pages.fetch_sub(1, Ordering::Relaxed);
            }
            self.frames
                .release_static(orphan.base(), PAGE_SIZE_4K as u64);

            myva += PAGE_SIZE_2M as u64;
        }
    }

    // -------------------------------------------------------------------------
    // Data protection
    // -------------------------------------------------------------------------

    /// Mark writable data no-execute, and the validated const sub-range
    /// read-only.
    fn protect_data(&self, layout: &KernelLayout<'_>) {
        let kernel = self.kernel_space();

        let mut const_range = None;
        if self.overrides.protect_const_data {
            if let Some((cs, ce)) = layout.const_data {
                let aligned = cs.is_aligned(PageSize::Size4K) && ce.is_aligned(PageSize::Size4K);
                let inside = cs >= layout.data_start
                    && ce <= layout.data_end
                    && (ce.as_u64() - cs.as_u64())
                        < (layout.data_end.as_u64() - layout.data_start.as_u64());
                if aligned && inside {
                    log::info!("marking const data {}-{} read-only", cs, ce);
                    const_range = Some((cs, ce));
                } else {
                    // Keep going without the read-only marking.
                    log::warn!("const data range {}-{} misaligned or out of bounds", cs, ce);
                }
            }
        }

        let mut dva = layout.data_start;
        while dva < layout.data_end {
            if let Some(slot) = self.leaf_slot(kernel, dva) {
                let entry = slot.get();
                if entry.is_present() {
                    let mut updated =
                        entry.updated(EntryFlags::empty(), EntryFlags::NO_EXECUTE);
                    if let Some((cs, ce)) = const_range {
                        if dva >= cs && dva < ce {
                            updated = updated.updated(EntryFlags::WRITABLE, EntryFlags::empty());
                        }
                    }
                    slot.set(updated);
                } else {
                    log::warn!("missing data mapping at {}", dva);
                }
            }
            dva += PAGE_SIZE_4K as u64;
        }
    }

    // -------------------------------------------------------------------------
    // Segment walk
    // -------------------------------------------------------------------------

    /// Apply no-execute to every loaded segment other than the primary
    /// ones, splitting the pre-initialization segment's sections into
    /// read-only text and no-execute data.
    fn protect_segments(&self, layout: &KernelLayout<'_>) {
        let kernel = self.kernel_space();

        for segment in layout.segments {
            match segment.class {
                SegmentClass::Text | SegmentClass::Data | SegmentClass::Bootstrap => continue,
                SegmentClass::EarlyInit => {
                    for section in segment.sections {
                        assert!(
                            section.start.is_aligned(PageSize::Size4K),
                            "pre-initialization segment sections misaligned"
                        );
                        if section.executable {
                            self.mark_range(
                                kernel,
                                section.start,
                                round_page(section.size),
                                false,
                                true,
                            );
                        } else {
                            self.mark_range(
                                kernel,
                                section.start,
                                round_page(section.size),
                                true,
                                false,
                            );
                        }
                    }
                }
                SegmentClass::Other => {
                    self.mark_range(
                        kernel,
                        segment.start,
                        round_page(segment.size),
                        true,
                        false,
                    );
                }
            }
        }
    }
}
