//! Host test platform: an arena of real page-table pages standing in
//! for physical memory, a recording frame allocator, and a recording
//! processor interface.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use osmium_pmap::{
    AllocMode, BootOverrides, BootstrapConfig, CpuId, CpuInterface, Frame, FrameProvider,
    InterruptState, MemoryRegion, PageTable, PhysAddr, PhysMap, RegionKind, TableMapper,
};

/// Frames backed by the arena; frames below `TABLE_POOL_START` are used
/// as mapping targets, the rest feed the allocator.
pub const ARENA_FRAMES: u64 = 2048;

/// First frame the test allocator hands out.
pub const TABLE_POOL_START: u64 = 1024;

// =============================================================================
// Frames
// =============================================================================

pub struct TestFrames {
    arena: Vec<Box<PageTable>>,
    free: Mutex<Vec<u64>>,
    pub acquired: AtomicU64,
    pub released: AtomicU64,
    pub static_freed: Mutex<Vec<(u64, u64)>>,
}

impl TestFrames {
    pub fn new() -> Self {
        let arena = (0..ARENA_FRAMES).map(|_| Box::new(PageTable::new())).collect();
        let free = (TABLE_POOL_START..ARENA_FRAMES).rev().collect();
        Self {
            arena,
            free: Mutex::new(free),
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
            static_freed: Mutex::new(Vec::new()),
        }
    }

    /// Frames currently held by the subsystem (net of releases).
    pub fn outstanding(&self) -> i64 {
        self.acquired.load(Ordering::Relaxed) as i64 - self.released.load(Ordering::Relaxed) as i64
    }

    /// Exhaust the free pool, forcing resource-shortage paths.
    pub fn drain_pool(&self) -> Vec<u64> {
        std::mem::take(&mut *self.free.lock().unwrap())
    }

    pub fn refill_pool(&self, frames: Vec<u64>) {
        *self.free.lock().unwrap() = frames;
    }
}

impl FrameProvider for TestFrames {
    fn acquire(&self, _mode: AllocMode) -> Option<Frame> {
        let frame = self.free.lock().unwrap().pop()?;
        self.acquired.fetch_add(1, Ordering::Relaxed);
        Some(Frame::new(frame))
    }

    fn wire(&self, _frame: Frame) {}

    fn release(&self, frame: Frame) {
        self.released.fetch_add(1, Ordering::Relaxed);
        self.free.lock().unwrap().push(frame.number());
    }

    fn release_static(&self, base: PhysAddr, len: u64) {
        self.static_freed.lock().unwrap().push((base.as_u64(), len));
    }
}

impl TableMapper for TestFrames {
    unsafe fn table(&self, frame: Frame) -> *mut PageTable {
        let table: &PageTable = &self.arena[frame.number() as usize];
        table as *const PageTable as *mut PageTable
    }
}

// =============================================================================
// Processors
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Invalidate(u32),
    Nmi(u32),
}

pub struct TestCpus {
    pub current: AtomicU32,
    pub signals: Mutex<Vec<Signal>>,
    pub clock: AtomicU64,
    pub local_flushes: AtomicU64,
    pub global_flushes: AtomicU64,
    pub irq_depth: AtomicU64,
}

impl TestCpus {
    pub fn new() -> Self {
        Self {
            current: AtomicU32::new(0),
            signals: Mutex::new(Vec::new()),
            clock: AtomicU64::new(0),
            local_flushes: AtomicU64::new(0),
            global_flushes: AtomicU64::new(0),
            irq_depth: AtomicU64::new(0),
        }
    }

    pub fn signals(&self) -> Vec<Signal> {
        self.signals.lock().unwrap().clone()
    }

    pub fn invalidations_to(&self, cpu: u32) -> usize {
        self.signals()
            .iter()
            .filter(|s| **s == Signal::Invalidate(cpu))
            .count()
    }

    pub fn nmis_to(&self, cpu: u32) -> usize {
        self.signals()
            .iter()
            .filter(|s| **s == Signal::Nmi(cpu))
            .count()
    }
}

impl CpuInterface for TestCpus {
    fn current_cpu(&self) -> CpuId {
        CpuId::new(self.current.load(Ordering::Relaxed))
    }

    fn send_invalidate(&self, cpu: CpuId) {
        self.signals
            .lock()
            .unwrap()
            .push(Signal::Invalidate(cpu.as_u32()));
    }

    fn send_nmi(&self, cpu: CpuId) {
        self.signals.lock().unwrap().push(Signal::Nmi(cpu.as_u32()));
    }

    fn flush_local(&self) {
        self.local_flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn flush_global(&self) {
        self.global_flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn timestamp(&self) -> u64 {
        // Every read advances the clock so deadline paths terminate.
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn ack_timeout(&self) -> u64 {
        // Generous in spins so a busy host cannot starve the responder
        // thread into a spurious escalation.
        200_000
    }

    fn disable_interrupts(&self) -> InterruptState {
        self.irq_depth.fetch_add(1, Ordering::Relaxed);
        InterruptState(1)
    }

    fn restore_interrupts(&self, _state: InterruptState) {
        self.irq_depth.fetch_sub(1, Ordering::Relaxed);
    }
}

// =============================================================================
// Test Bed
// =============================================================================

pub struct TestBed {
    pub pmap: &'static PhysMap,
    pub frames: &'static TestFrames,
    pub cpus: &'static TestCpus,
}

pub fn testbed() -> TestBed {
    testbed_with(BootOverrides::default(), false)
}

pub fn testbed_with(overrides: BootOverrides, tags: bool) -> TestBed {
    let frames: &'static TestFrames = Box::leak(Box::new(TestFrames::new()));
    let cpus: &'static TestCpus = Box::leak(Box::new(TestCpus::new()));

    let kernel_root = frames.acquire(AllocMode::Wait).unwrap();
    let regions = [
        MemoryRegion {
            base: Frame::new(0),
            end: Frame::new(0xFF),
            kind: RegionKind::Usable,
            reserved: false,
        },
        MemoryRegion {
            base: Frame::new(0x100),
            end: Frame::new(ARENA_FRAMES - 1),
            kind: RegionKind::Usable,
            reserved: false,
        },
    ];

    let pmap = Box::leak(Box::new(PhysMap::bootstrap(
        frames,
        frames,
        cpus,
        BootstrapConfig {
            kernel_root,
            regions: &regions,
            overrides,
            tags_supported: tags,
            no_encrypt: None,
        },
    )));
    pmap.cpu_up(CpuId::new(0));

    TestBed { pmap, frames, cpus }
}
