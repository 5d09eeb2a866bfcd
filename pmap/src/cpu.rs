//! # Per-Processor Invalidation State
//!
//! The process-wide array of per-processor records consulted by the
//! cross-CPU invalidation protocol.
//!
//! ## Lifecycle
//!
//! A record is populated at processor bring-up and retired at power-off.
//! Between those points its fields are written only by the owning
//! processor or by a shootdown initiator, always through fenced atomic
//! operations. There is no thread-local magic anywhere: every access
//! goes through [`CpuRegistry`] by explicit [`CpuId`].

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::addresses::PhysAddr;

// =============================================================================
// Constants
// =============================================================================

/// Maximum number of logical processors tracked by the registry
pub const MAX_CPUS: usize = 64;

// =============================================================================
// CPU Id
// =============================================================================

/// Identifier of one logical processor
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct CpuId(u32);

impl CpuId {
    /// Create a new CPU id
    ///
    /// # Panics
    ///
    /// Panics if the id is out of range.
    #[inline]
    pub const fn new(id: u32) -> Self {
        assert!((id as usize) < MAX_CPUS);
        Self(id)
    }

    /// Get the raw id
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Get the id as usize
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuId({})", self.0)
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// CPU Set
// =============================================================================

/// A set of logical processors, stored as a bitmask
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuSet(u64);

impl CpuSet {
    /// Create an empty set
    #[inline]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Check if the set is empty
    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Insert a CPU
    #[inline]
    pub fn insert(&mut self, cpu: CpuId) {
        self.0 |= 1 << cpu.as_u32();
    }

    /// Remove a CPU
    #[inline]
    pub fn remove(&mut self, cpu: CpuId) {
        self.0 &= !(1 << cpu.as_u32());
    }

    /// Check membership
    #[inline]
    pub const fn contains(self, cpu: CpuId) -> bool {
        self.0 & (1 << cpu.as_u32()) != 0
    }

    /// Number of CPUs in the set
    #[inline]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Iterate the members
    #[inline]
    pub fn iter(self) -> impl Iterator<Item = CpuId> {
        (0..MAX_CPUS as u32)
            .filter(move |&id| self.0 & (1 << id) != 0)
            .map(CpuId::new)
    }
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuSet({:#x})", self.0)
    }
}

impl fmt::Display for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// =============================================================================
// Per-CPU Record
// =============================================================================

/// Invalidation-relevant state of one logical processor
///
/// Cache-line aligned so shootdown scans of one record do not false-share
/// with its neighbors.
#[repr(align(64))]
pub struct CpuState {
    /// Root table physically loaded on this processor
    active_root: AtomicU64,
    /// Root table of the task scheduled on this processor
    task_root: AtomicU64,
    /// The active root is live (the processor is not parked at a point
    /// where it re-checks pending invalidations before resuming)
    root_live: AtomicBool,
    /// Pending invalidation scoped to the active space's tag
    invalid_local: AtomicBool,
    /// Pending invalidation of all translations including global ones
    invalid_global: AtomicBool,
    /// Processor is powered on and participating in the protocol
    running: AtomicBool,
}

impl CpuState {
    /// Create a powered-off record
    pub const fn new() -> Self {
        Self {
            active_root: AtomicU64::new(0),
            task_root: AtomicU64::new(0),
            root_live: AtomicBool::new(false),
            invalid_local: AtomicBool::new(false),
            invalid_global: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }
    }

    /// Whether the processor is running
    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Whether the active root is live
    #[inline]
    pub fn is_root_live(&self) -> bool {
        self.root_live.load(Ordering::Acquire)
    }

    /// The root table currently loaded on this processor
    #[inline]
    pub fn active_root(&self) -> PhysAddr {
        PhysAddr::new(self.active_root.load(Ordering::Acquire))
    }

    /// The root table of the task scheduled on this processor
    #[inline]
    pub fn task_root(&self) -> PhysAddr {
        PhysAddr::new(self.task_root.load(Ordering::Acquire))
    }

    /// Publish a new active root
    #[inline]
    pub fn set_active_root(&self, root: PhysAddr) {
        self.active_root.store(root.as_u64(), Ordering::Release);
    }

    /// Publish a new task root
    #[inline]
    pub fn set_task_root(&self, root: PhysAddr) {
        self.task_root.store(root.as_u64(), Ordering::Release);
    }

    /// Mark the active root live or parked
    #[inline]
    pub fn set_root_live(&self, live: bool) {
        self.root_live.store(live, Ordering::Release);
    }

    /// Mark a pending invalidation
    ///
    /// The store must be globally visible before the initiator signals
    /// this processor; the caller issues the fence.
    #[inline]
    pub fn mark_invalid(&self, global: bool) {
        if global {
            self.invalid_global.store(true, Ordering::SeqCst);
        } else {
            self.invalid_local.store(true, Ordering::SeqCst);
        }
    }

    /// Whether any invalidation is pending
    #[inline]
    pub fn invalid_pending(&self) -> bool {
        self.invalid_local.load(Ordering::SeqCst) || self.invalid_global.load(Ordering::SeqCst)
    }

    /// Whether a global invalidation is pending
    #[inline]
    pub fn invalid_global_pending(&self) -> bool {
        self.invalid_global.load(Ordering::SeqCst)
    }

    /// Clear both pending-invalidation reasons
    #[inline]
    pub fn clear_invalid(&self) {
        self.invalid_local.store(false, Ordering::SeqCst);
        self.invalid_global.store(false, Ordering::SeqCst);
    }

    /// Clear only the tag-scoped pending-invalidation reason
    #[inline]
    pub fn clear_invalid_local(&self) {
        self.invalid_local.store(false, Ordering::SeqCst);
    }
}

impl Default for CpuState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CpuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuState")
            .field("running", &self.is_running())
            .field("active_root", &self.active_root())
            .field("task_root", &self.task_root())
            .field("root_live", &self.is_root_live())
            .field("invalid_pending", &self.invalid_pending())
            .finish()
    }
}

// =============================================================================
// Registry
// =============================================================================

/// The process-wide array of per-processor records
pub struct CpuRegistry {
    states: [CpuState; MAX_CPUS],
}

impl CpuRegistry {
    /// Create a registry with every processor powered off
    pub const fn new() -> Self {
        Self {
            states: [const { CpuState::new() }; MAX_CPUS],
        }
    }

    /// Get the record for one processor
    #[inline]
    pub fn state(&self, cpu: CpuId) -> &CpuState {
        &self.states[cpu.as_usize()]
    }

    /// Populate a record at processor bring-up
    ///
    /// The processor starts on the kernel root with no pending
    /// invalidations.
    pub fn bring_up(&self, cpu: CpuId, kernel_root: PhysAddr) {
        let state = self.state(cpu);
        state.set_active_root(kernel_root);
        state.set_task_root(kernel_root);
        state.clear_invalid();
        state.set_root_live(true);
        state.running.store(true, Ordering::SeqCst);
        log::debug!("cpu {}: joined invalidation protocol", cpu);
    }

    /// Retire a record at processor power-off
    pub fn bring_down(&self, cpu: CpuId) {
        let state = self.state(cpu);
        state.running.store(false, Ordering::SeqCst);
        state.set_root_live(false);
        log::debug!("cpu {}: left invalidation protocol", cpu);
    }

    /// Iterate all running processors
    #[inline]
    pub fn running(&self) -> impl Iterator<Item = (CpuId, &CpuState)> {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_running())
            .map(|(i, s)| (CpuId::new(i as u32), s))
    }

    /// Check whether any running processor has the given root loaded
    #[inline]
    pub fn root_active_anywhere(&self, root: PhysAddr) -> Option<CpuId> {
        self.running()
            .find(|(_, s)| s.active_root() == root)
            .map(|(id, _)| id)
    }
}

impl Default for CpuRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CpuRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let running: alloc::vec::Vec<u32> =
            self.running().map(|(id, _)| id.as_u32()).collect();
        f.debug_struct("CpuRegistry")
            .field("running", &running)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
