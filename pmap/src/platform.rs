//! # Platform Interfaces
//!
//! The external collaborators this subsystem consumes: the physical frame
//! allocator, the phys-to-virt window used to touch table pages, the
//! processor signaling/flush primitives, the platform memory-region table,
//! and the boot-time overrides.
//!
//! Nothing in this module owns policy. Each trait is a thin contract over
//! facilities the rest of the kernel provides; host tests supply simulated
//! implementations.

use core::fmt;

use crate::addresses::{Frame, PhysAddr, VirtAddr};
use crate::cpu::CpuId;
use crate::table::PageTable;

// =============================================================================
// Frame Allocation
// =============================================================================

/// Allocation mode for table-level pages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocMode {
    /// Wait for memory pressure to subside if no frame is available
    Wait,
    /// Fail immediately with a resource shortage
    NoWait,
}

/// The physical frame allocator (external)
///
/// `acquire` with [`AllocMode::Wait`] may block; nothing in this crate
/// calls it while holding an address-space lock or with interrupts
/// disabled.
pub trait FrameProvider: Sync {
    /// Obtain a free frame, or `None` when memory is exhausted in
    /// [`AllocMode::NoWait`] mode.
    fn acquire(&self, mode: AllocMode) -> Option<Frame>;

    /// Wire a frame so the pageout path leaves it alone.
    fn wire(&self, frame: Frame);

    /// Return a frame to the allocator.
    fn release(&self, frame: Frame);

    /// Return a statically-reserved physical range to the general pool.
    ///
    /// Boot finalization uses this for alignment padding and orphaned
    /// leaf table pages; it is never called after finalization.
    fn release_static(&self, base: PhysAddr, len: u64);
}

// =============================================================================
// Table Access
// =============================================================================

/// Access to table-level pages through the physical window (external)
pub trait TableMapper: Sync {
    /// Get a pointer to the table page stored in `frame`.
    ///
    /// # Safety
    ///
    /// The frame must hold a table-level page (or be about to, for a
    /// freshly acquired frame that the caller will zero).
    unsafe fn table(&self, frame: Frame) -> *mut PageTable;
}

// =============================================================================
// Processor Interface
// =============================================================================

/// Opaque saved interrupt state, returned by
/// [`CpuInterface::disable_interrupts`]
#[derive(Debug, Clone, Copy)]
pub struct InterruptState(pub u64);

/// Processor signaling and translation-cache primitives (external)
///
/// These map to single instructions or short sequences on the target;
/// they are assumed atomic and are not part of this subsystem's design.
pub trait CpuInterface: Sync {
    /// The logical processor executing the caller.
    fn current_cpu(&self) -> CpuId;

    /// Send an asynchronous invalidation interrupt to another processor.
    fn send_invalidate(&self, cpu: CpuId);

    /// Send a non-maskable interrupt (escalation path only).
    fn send_nmi(&self, cpu: CpuId);

    /// Flush the executing processor's non-global cached translations.
    fn flush_local(&self);

    /// Flush the executing processor's cached translations including
    /// global ones.
    fn flush_global(&self);

    /// Monotonic timestamp in platform ticks.
    fn timestamp(&self) -> u64;

    /// Ticks a shootdown initiator waits for acknowledgement before
    /// escalating.
    fn ack_timeout(&self) -> u64;

    /// Disable interrupts on the executing processor, returning the
    /// previous state.
    fn disable_interrupts(&self) -> InterruptState;

    /// Restore a previously saved interrupt state.
    fn restore_interrupts(&self, state: InterruptState);
}

// =============================================================================
// Memory Regions
// =============================================================================

/// Classification of a physical memory region, as reported by the
/// platform's memory map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// General-purpose usable memory; frames here are managed
    Usable,
    /// Reserved by firmware or the platform
    Reserved,
    /// Memory-mapped device ranges
    Device,
}

/// One physical memory region
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    /// First frame of the region
    pub base: Frame,
    /// Last frame of the region (inclusive)
    pub end: Frame,
    /// Region classification
    pub kind: RegionKind,
    /// The platform has reserved this region; never release it
    pub reserved: bool,
}

impl MemoryRegion {
    /// Whether frames in this region participate in reverse-mapping
    /// bookkeeping.
    #[inline]
    pub const fn is_managed(&self) -> bool {
        matches!(self.kind, RegionKind::Usable)
    }
}

// =============================================================================
// Boot Overrides
// =============================================================================

/// Named boot overrides, parsed elsewhere and consulted exactly once at
/// the relevant initialization point
#[derive(Debug, Clone, Copy)]
pub struct BootOverrides {
    /// Disable no-execute enforcement for kernel heap mappings
    pub disable_heap_nx: bool,
    /// Disable no-execute enforcement for kernel stack mappings
    pub disable_stack_nx: bool,
    /// Do not share the kernel top-level slots into user spaces while
    /// executing kernel code (debugging aid)
    pub no_shared_kernel_map: bool,
    /// Keep kernel text on small pages even when alignment permits
    /// large-page coalescing
    pub force_small_text_pages: bool,
    /// Write-protect kernel text
    pub write_protect_text: bool,
    /// Write-protect the designated const-data sub-range
    pub protect_const_data: bool,
    /// Override for the reverse-map hash size; must be `(2^N) - 1`
    pub rmap_hash_size: Option<u32>,
}

impl Default for BootOverrides {
    fn default() -> Self {
        Self {
            disable_heap_nx: false,
            disable_stack_nx: false,
            no_shared_kernel_map: false,
            force_small_text_pages: false,
            write_protect_text: true,
            protect_const_data: true,
            rmap_hash_size: None,
        }
    }
}

// =============================================================================
// Kernel Layout
// =============================================================================

/// Classification of a loaded segment descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentClass {
    /// The primary text segment (handled by the text pass)
    Text,
    /// The primary data segment (handled by the data pass)
    Data,
    /// Bootstrap/loader segments left untouched
    Bootstrap,
    /// The pre-initialization segment: its sections get a text/non-text
    /// split of read-only vs no-execute
    EarlyInit,
    /// Anything else: marked no-execute wholesale
    Other,
}

/// A section within a segment (only consulted for
/// [`SegmentClass::EarlyInit`])
#[derive(Debug, Clone, Copy)]
pub struct Section {
    /// Section start
    pub start: VirtAddr,
    /// Section size in bytes
    pub size: u64,
    /// Whether the section holds code
    pub executable: bool,
}

/// One loaded code/data segment descriptor
#[derive(Debug, Clone, Copy)]
pub struct Segment<'a> {
    /// Segment name, for diagnostics
    pub name: &'a str,
    /// Segment start
    pub start: VirtAddr,
    /// Segment size in bytes
    pub size: u64,
    /// Segment classification
    pub class: SegmentClass,
    /// Sections, populated for the pre-initialization segment
    pub sections: &'a [Section],
}

/// The kernel image layout handed to boot finalization
#[derive(Clone, Copy)]
pub struct KernelLayout<'a> {
    /// First virtual address of the kernel image
    pub kernel_base: VirtAddr,
    /// End of the early-boot region preceding text (exclusive);
    /// the padding up to `text_start` may be released
    pub early_end: VirtAddr,
    /// Lowest address whose identity mapping must be preserved through
    /// finalization (descriptor aliases and low globals end here)
    pub low_keep_end: VirtAddr,
    /// Start of kernel text
    pub text_start: VirtAddr,
    /// End of kernel text (exclusive); padding up to `data_start` may be
    /// released
    pub text_end: VirtAddr,
    /// Start of writable data
    pub data_start: VirtAddr,
    /// End of writable data (exclusive)
    pub data_end: VirtAddr,
    /// Optional const-data sub-range to write-protect; must lie fully
    /// inside `[data_start, data_end)` and be page-aligned
    pub const_data: Option<(VirtAddr, VirtAddr)>,
    /// Every loaded segment descriptor
    pub segments: &'a [Segment<'a>],
}

impl fmt::Debug for KernelLayout<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelLayout")
            .field("kernel_base", &self.kernel_base)
            .field("text", &(self.text_start, self.text_end))
            .field("data", &(self.data_start, self.data_end))
            .field("segments", &self.segments.len())
            .finish()
    }
}

// =============================================================================
// Declared Regions (audit input)
// =============================================================================

/// A virtual-memory region with its declared logical protection, as
/// enumerated from the VM map layer for the permission audit
#[derive(Debug, Clone, Copy)]
pub struct DeclaredRegion {
    /// Region start
    pub start: VirtAddr,
    /// Region end (exclusive)
    pub end: VirtAddr,
    /// The protection the VM layer believes this region has
    pub protection: crate::entries::Protection,
}

// =============================================================================
// Tests
// =============================================================================
