//! # Osmium Physical Map
//!
//! The physical-address-map layer of the Osmium virtual memory
//! subsystem: the hardware-visible four-level page tables translating
//! virtual addresses to physical frames for the kernel and every user
//! address space, the reverse mapping from physical frame to the
//! virtual mappings referencing it, and the cross-CPU invalidation
//! protocol keeping every translation cache coherent with them.
//!
//! ## Module Organization
//!
//! - [`addresses`]: Physical/virtual address types and frame numbers
//! - [`entries`]: Typed mapping entries and the hardware bit layout
//! - [`table`]: Table-level pages with atomic entry slots
//! - [`space`]: Per-address-space objects and table-page ownership
//! - [`system`]: The [`PhysMap`] subsystem handle and space lifecycle
//! - [`mapping`]: Expansion, enter, remove, protect
//! - [`rmap`]: The reverse-mapping table and per-frame attributes
//! - [`cpu`]: Process-wide per-processor invalidation records
//! - [`asid`]: Accelerator tags for partial invalidation
//! - [`shootdown`]: The cross-CPU invalidation protocol
//! - [`audit`]: The post-boot permission audit
//! - [`platform`]: Traits for the external collaborators
//!
//! ## Concurrency
//!
//! Structural mutation of a space is serialized by that space's own
//! lock; the per-level table-page ownership index has a coarser lock
//! always acquired first. Translation reads are lock-free over atomic
//! entry slots. A mutation of a present translation is complete only
//! once the shootdown protocol has been acknowledged by every matching
//! active processor.

#![no_std]

extern crate alloc;

pub mod addresses;
pub mod asid;
pub mod audit;
pub mod cpu;
pub mod entries;
pub mod mapping;
pub mod platform;
pub mod rmap;
pub mod shootdown;
pub mod space;
pub mod system;
pub mod table;

mod finalize;
mod walker;

pub use addresses::{Frame, PageSize, PhysAddr, VirtAddr};
pub use asid::{SpaceTag, TagAllocator};
pub use audit::{AuditReport, ProtectionMismatch};
pub use cpu::{CpuId, CpuRegistry, CpuSet, MAX_CPUS};
pub use entries::{EntryFlags, PageTableEntry, Protection, TableLevel};
pub use mapping::{MapAttributes, MapError};
pub use platform::{
    AllocMode, BootOverrides, CpuInterface, DeclaredRegion, FrameProvider, InterruptState,
    KernelLayout, MemoryRegion, RegionKind, Section, Segment, SegmentClass, TableMapper,
};
pub use rmap::{Binding, FrameAttrs, ReverseMap, SpaceId};
pub use shootdown::ShootdownPhase;
pub use space::{AccountingId, AddressSpace, AddressWidth};
pub use system::{BootstrapConfig, PhysMap};
pub use table::{PageTable, TableIndex};
