//! # Subsystem Handle
//!
//! [`PhysMap`] bundles the translation hierarchy, the reverse-mapping
//! table, the per-CPU invalidation records, and the platform interfaces
//! into the single object the virtual-memory layer talks to. Its
//! `enter`/`protect`/`remove`/`translate` surface (in `mapping`) is the
//! only mapping-mutation path in the kernel; no other component touches
//! hardware tables directly.

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use crate::addresses::{Frame, PhysAddr, KERNEL_SHARED_SLOTS, KERNEL_WINDOW_START, VirtAddr};
use crate::asid::{SpaceTag, TagAllocator};
use crate::cpu::{CpuId, CpuRegistry};
use crate::mapping::MapError;
use crate::platform::{
    AllocMode, BootOverrides, CpuInterface, FrameProvider, MemoryRegion, TableMapper,
};
use crate::rmap::ReverseMap;
use crate::space::{AccountingId, AddressSpace, AddressWidth};
use crate::table::PageTable;

// =============================================================================
// Bootstrap Configuration
// =============================================================================

/// Everything the subsystem needs from the platform at bootstrap
#[derive(Debug)]
pub struct BootstrapConfig<'a> {
    /// Frame holding the statically reserved kernel root table, already
    /// populated by early boot code (including the shared top-level
    /// slots)
    pub kernel_root: Frame,
    /// The platform's physical memory map
    pub regions: &'a [MemoryRegion],
    /// Boot overrides, each consulted exactly once
    pub overrides: BootOverrides,
    /// Whether the processor supports accelerator tags
    pub tags_supported: bool,
    /// Physical range to mark encryption-exempt, if any
    pub no_encrypt: Option<(Frame, Frame)>,
}

// =============================================================================
// PhysMap
// =============================================================================

/// The physical-map subsystem
pub struct PhysMap {
    pub(crate) frames: &'static dyn FrameProvider,
    pub(crate) mapper: &'static dyn TableMapper,
    pub(crate) cpu_if: &'static dyn CpuInterface,
    pub(crate) cpus: CpuRegistry,
    pub(crate) rmap: ReverseMap,
    pub(crate) tags: TagAllocator,
    pub(crate) overrides: BootOverrides,
    kernel: AddressSpace,
    /// Table-level pages currently in use across every space
    pub(crate) table_pages: AtomicI64,
    /// Boot finalization has run
    pub(crate) finalized: AtomicBool,
}

impl PhysMap {
    /// Bootstrap the subsystem around the statically reserved kernel
    /// tables, before the frame allocator is usable for table pages.
    pub fn bootstrap(
        frames: &'static dyn FrameProvider,
        mapper: &'static dyn TableMapper,
        cpu_if: &'static dyn CpuInterface,
        config: BootstrapConfig<'_>,
    ) -> Self {
        let rmap = ReverseMap::new(config.regions, config.overrides.rmap_hash_size);
        if let Some((start, end)) = config.no_encrypt {
            rmap.set_no_encrypt_range(start, end);
        }

        let tags = TagAllocator::new(config.tags_supported);
        let kernel_tag = tags.is_enabled().then(SpaceTag::kernel);

        let kernel = AddressSpace::new(
            config.kernel_root,
            true,
            AddressWidth::Bits64,
            kernel_tag,
            AccountingId(0),
        );

        if config.overrides.no_shared_kernel_map {
            log::info!("kernel not sharing its map with user spaces");
        }
        if config.overrides.disable_heap_nx {
            log::info!("kernel heap execute-protection disabled");
        }
        if config.overrides.disable_stack_nx {
            log::info!("kernel stack execute-protection disabled");
        }
        if tags.is_enabled() {
            log::info!("accelerator-tag partial invalidation enabled");
        }

        Self {
            frames,
            mapper,
            cpu_if,
            cpus: CpuRegistry::new(),
            rmap,
            tags,
            overrides: config.overrides,
            kernel,
            table_pages: AtomicI64::new(0),
            finalized: AtomicBool::new(false),
        }
    }

    /// Ensure the kernel extension window's upper level exists before
    /// the top-level slots are shared with any user space.
    ///
    /// Called once the frame allocator is live.
    pub fn init_late(&self) -> Result<(), MapError> {
        self.expand_upper(&self.kernel, VirtAddr::new(KERNEL_WINDOW_START), AllocMode::Wait)
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// The kernel's own address space
    #[inline]
    pub fn kernel_space(&self) -> &AddressSpace {
        &self.kernel
    }

    /// The per-CPU invalidation records
    #[inline]
    pub fn cpus(&self) -> &CpuRegistry {
        &self.cpus
    }

    /// The reverse-mapping table
    #[inline]
    pub fn rmap(&self) -> &ReverseMap {
        &self.rmap
    }

    /// Whether the kernel map is withheld from user root tables
    #[inline]
    pub fn shared_kernel_map_disabled(&self) -> bool {
        self.overrides.no_shared_kernel_map
    }

    /// Whether heap mappings skip execute-protection (boot override,
    /// consumed by the kernel-map setup path)
    #[inline]
    pub fn heap_nx_disabled(&self) -> bool {
        self.overrides.disable_heap_nx
    }

    /// Whether stack mappings skip execute-protection (boot override,
    /// consumed by the thread-stack setup path)
    #[inline]
    pub fn stack_nx_disabled(&self) -> bool {
        self.overrides.disable_stack_nx
    }

    /// Table-level pages currently in use across every space
    #[inline]
    pub fn table_pages_in_use(&self) -> i64 {
        self.table_pages.load(Ordering::Relaxed)
    }

    /// Whether boot finalization has run
    #[inline]
    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    /// Whether no forward hierarchy entry anywhere references the frame
    ///
    /// The authority used by the pageout path to decide a frame is safe
    /// to recycle.
    #[inline]
    pub fn verify_unmapped(&self, frame: Frame) -> bool {
        self.rmap.is_unmapped(frame)
    }

    /// Resolve a table page through the physical window
    #[inline]
    pub(crate) fn table_at(&self, frame: Frame) -> &PageTable {
        // Table frames are only ever handed out by expansion or
        // bootstrap, both of which zero them first.
        unsafe { &*self.mapper.table(frame) }
    }

    // -------------------------------------------------------------------------
    // Processor lifecycle
    // -------------------------------------------------------------------------

    /// Join a processor to the invalidation protocol at bring-up
    pub fn cpu_up(&self, cpu: CpuId) {
        self.cpus.bring_up(cpu, self.kernel.root_phys());
    }

    /// Retire a processor at power-off
    pub fn cpu_down(&self, cpu: CpuId) {
        self.cpus.bring_down(cpu);
    }

    /// Activate a space on a processor
    ///
    /// The lazy half of the invalidation protocol: a processor that was
    /// not signaled must drain any pending invalidation before its
    /// active root may again match a mutated space.
    pub fn switch_space(&self, cpu: CpuId, space: &AddressSpace) {
        let state = self.cpus.state(cpu);

        state.set_root_live(false);
        if state.invalid_pending() {
            self.process_updates(cpu);
        }

        let root = space.root_phys();
        state.set_task_root(root);
        state.set_active_root(root);
        state.set_root_live(true);

        // A shootdown that scanned between the drain above and the
        // publication of the new root leaves its flag set; honor it now
        // that the root is live.
        if state.invalid_pending() {
            self.process_updates(cpu);
        }
    }

    // -------------------------------------------------------------------------
    // Address-space lifecycle
    // -------------------------------------------------------------------------

    /// Create and return a hardware-backed address space
    ///
    /// A non-zero `size_hint` requests a software-only map, which this
    /// core does not support: the result is `None`. The new space starts
    /// with reference count 1 and shares the kernel's top-level slots.
    pub fn create(
        &self,
        ledger: AccountingId,
        size_hint: u64,
        is_64bit: bool,
    ) -> Option<Arc<AddressSpace>> {
        if size_hint != 0 {
            return None;
        }

        let root = self.frames.acquire(AllocMode::Wait)?;
        self.frames.wire(root);

        let root_table = unsafe { &*self.mapper.table(root) };
        root_table.zero();
        root_table.copy_slots(self.table_at(self.kernel.root()), &KERNEL_SHARED_SLOTS);

        let width = if is_64bit {
            AddressWidth::Bits64
        } else {
            AddressWidth::Bits32
        };
        let space = AddressSpace::new(root, false, width, self.tags.allocate(), ledger);

        log::debug!(
            "created space {:#x} ({:?}, ledger {:?})",
            space.root_phys(),
            width,
            ledger
        );
        Some(Arc::new(space))
    }

    /// Add a reference to a space
    ///
    /// Used whenever a second execution context begins using the space.
    pub fn reference(&self, space: &AddressSpace) {
        let mut inner = space.lock.lock();
        inner.ref_count += 1;
    }

    /// Drop a reference to a space, tearing it down at zero
    ///
    /// Teardown first forces a shootdown over the space's entire range
    /// (a stale processor may still hold its root as active), then frees
    /// every privately-owned table-level page found in the ownership
    /// indices, then the root page.
    ///
    /// # Panics
    ///
    /// Panics if the space is still the scheduled task's space on any
    /// running processor, or if an attempt is made to destroy the kernel
    /// space.
    pub fn destroy(&self, space: &AddressSpace) {
        let remaining = {
            let mut inner = space.lock.lock();
            inner.ref_count -= 1;
            let remaining = inner.ref_count;

            if remaining == 0 {
                for (cpu, state) in self.cpus.running() {
                    assert!(
                        state.task_root() != space.root_phys(),
                        "destroying address space {:#x} still active on cpu {}",
                        space.root_phys(),
                        cpu
                    );
                }
                // Shake the root out of any processor that still has it
                // cached as its active root.
                self.shootdown(space, VirtAddr::null(), VirtAddr::new(u64::MAX << 12));
            }
            remaining
        };

        if remaining != 0 {
            return;
        }
        assert!(!space.is_kernel(), "destroying the kernel address space");

        debug_assert!(
            space.stats().resident() == 0,
            "destroying space {:#x} with {} resident pages",
            space.root_phys(),
            space.stats().resident()
        );

        let mut freed: i64 = 0;
        for index in [&space.upper_index, &space.middle_index, &space.leaf_index] {
            for frame in index.drain() {
                self.frames.release(frame);
                freed += 1;
            }
        }
        self.table_pages.fetch_sub(freed, Ordering::Relaxed);

        self.frames.release(space.root());
        log::debug!(
            "destroyed space {:#x}, released {} table pages",
            space.root_phys(),
            freed
        );
    }

    /// The root register value a processor should load for a space,
    /// honoring the no-shared-kernel-map override while in kernel mode.
    pub fn root_for(&self, space: &AddressSpace, in_kernel: bool) -> PhysAddr {
        if in_kernel && self.overrides.no_shared_kernel_map {
            self.kernel.root_phys()
        } else {
            space.root_phys()
        }
    }
}

impl fmt::Debug for PhysMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysMap")
            .field("kernel_root", &self.kernel.root_phys())
            .field("table_pages", &self.table_pages_in_use())
            .field("finalized", &self.is_finalized())
            .finish()
    }
}
