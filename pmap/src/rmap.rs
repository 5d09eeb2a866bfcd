//! # Reverse-Mapping Table
//!
//! The physical-frame to virtual-mapping index: for every managed frame,
//! which `(space, vaddr)` pairs currently reference it, plus a small set
//! of per-frame software attribute bits.
//!
//! The backing structure is a dense per-frame root record array sized to
//! the highest managed frame at init time, with an open-chained hash
//! table holding the overflow bindings of frames mapped more than once.
//! Only frames inside general-purpose usable memory participate; frames
//! outside that set are always reported unmapped and attribute-less,
//! which keeps device and firmware-reserved memory out of reclamation
//! bookkeeping.
//!
//! `is_unmapped` is the authority upper layers use to decide a frame is
//! safe to recycle, so the forward hierarchy and this table must never
//! disagree. The only mutation entry points (`bind`, `unbind`) are
//! crate-private and reachable solely from the hierarchy mutation
//! transaction in `mapping`.

use alloc::boxed::Box;
use alloc::vec::Vec;

use bitflags::bitflags;
use spin::Mutex;

use crate::addresses::{Frame, PhysAddr, VirtAddr};
use crate::platform::MemoryRegion;

// =============================================================================
// Constants
// =============================================================================

/// Default hash size ceiling, `(2^12) - 1`
const HASH_SIZE_MAX: u32 = 4095;

/// Default hash size floor, `(2^6) - 1`
const HASH_SIZE_MIN: u32 = 63;

// =============================================================================
// Frame Attributes
// =============================================================================

bitflags! {
    /// Per-frame software attribute bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FrameAttrs: u8 {
        /// Frame is backed by general-purpose usable memory
        const MANAGED = 1 << 0;
        /// Frame is wired by a hardware-path mapping
        const WIRED = 1 << 1;
        /// Frame is exempt from memory encryption
        const NO_ENCRYPT = 1 << 2;
    }
}

// =============================================================================
// Bindings
// =============================================================================

/// Identity of an address space, stable for the space's lifetime
///
/// The root table's physical address is unique among live spaces, so it
/// doubles as the identity recorded in reverse-map bindings.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(transparent)]
pub struct SpaceId(u64);

impl SpaceId {
    /// Derive the identity from a root table address
    #[inline]
    pub const fn from_root(root: PhysAddr) -> Self {
        Self(root.as_u64())
    }

    /// Get the raw value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// One virtual mapping of a physical frame
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Binding {
    /// The owning address space
    pub space: SpaceId,
    /// The virtual address the frame is mapped at
    pub vaddr: VirtAddr,
}

// =============================================================================
// Records
// =============================================================================

/// Root record of one managed frame: the first binding lives inline,
/// further bindings overflow into the hash table.
#[derive(Default)]
struct RootRecord {
    attrs: FrameAttrs,
    binding: Option<Binding>,
}

// =============================================================================
// Reverse Map
// =============================================================================

/// The reverse-mapping table
pub struct ReverseMap {
    roots: Box<[Mutex<RootRecord>]>,
    buckets: Box<[Mutex<Vec<(Frame, Binding)>>]>,
    hash_size: u32,
}

impl ReverseMap {
    /// Build the table from the platform memory map
    ///
    /// `hash_override` must be `(2^N) - 1`; an invalid value is rejected
    /// with a warning and the derived default is used instead.
    pub fn new(regions: &[MemoryRegion], hash_override: Option<u32>) -> Self {
        let highest = regions
            .iter()
            .filter(|r| r.is_managed())
            .map(|r| r.end.number())
            .max()
            .unwrap_or(0);
        let nframes = highest + 1;

        let hash_size = match hash_override {
            Some(n) if (n + 1) & n == 0 && n > 0 => n,
            Some(n) => {
                let fallback = Self::default_hash_size(nframes);
                log::warn!(
                    "invalid reverse-map hash size {}, must be (2^N)-1, using default {}",
                    n,
                    fallback
                );
                fallback
            }
            None => Self::default_hash_size(nframes),
        };

        let mut roots = Vec::with_capacity(nframes as usize);
        roots.resize_with(nframes as usize, || Mutex::new(RootRecord::default()));

        let mut buckets = Vec::with_capacity(hash_size as usize);
        buckets.resize_with(hash_size as usize, || Mutex::new(Vec::new()));

        let map = Self {
            roots: roots.into_boxed_slice(),
            buckets: buckets.into_boxed_slice(),
            hash_size,
        };

        for region in regions.iter().filter(|r| r.is_managed()) {
            let mut frame = region.base;
            while frame <= region.end && frame.number() < nframes {
                map.roots[frame.number() as usize].lock().attrs |= FrameAttrs::MANAGED;
                frame = frame.next();
            }
        }

        log::info!(
            "reverse map: {} frame records, hash size {}",
            nframes,
            hash_size
        );
        map
    }

    /// Smallest `(2^N) - 1` that gives roughly one bucket per four
    /// managed frames, clamped to a sane range.
    fn default_hash_size(nframes: u64) -> u32 {
        let target = (nframes / 4).max(1);
        let mut size: u32 = HASH_SIZE_MIN;
        while (size as u64) < target && size < HASH_SIZE_MAX {
            size = size * 2 + 1;
        }
        size
    }

    /// The configured hash size
    #[inline]
    pub fn hash_size(&self) -> u32 {
        self.hash_size
    }

    #[inline]
    fn bucket_of(&self, frame: Frame) -> &Mutex<Vec<(Frame, Binding)>> {
        &self.buckets[(frame.number() % self.hash_size as u64) as usize]
    }

    #[inline]
    fn root_of(&self, frame: Frame) -> Option<&Mutex<RootRecord>> {
        self.roots.get(frame.number() as usize)
    }

    /// Whether the frame participates in reverse-mapping bookkeeping
    #[inline]
    pub fn is_managed(&self, frame: Frame) -> bool {
        self.root_of(frame)
            .map(|r| r.lock().attrs.contains(FrameAttrs::MANAGED))
            .unwrap_or(false)
    }

    // -------------------------------------------------------------------------
    // Mutation (crate-private: only the hierarchy transaction reaches here)
    // -------------------------------------------------------------------------

    /// Record that `frame` is now mapped at `(space, vaddr)`.
    ///
    /// Unmanaged frames are ignored.
    pub(crate) fn bind(&self, frame: Frame, space: SpaceId, vaddr: VirtAddr) {
        let Some(root) = self.root_of(frame) else {
            return;
        };
        let mut record = root.lock();
        if !record.attrs.contains(FrameAttrs::MANAGED) {
            return;
        }

        let binding = Binding { space, vaddr };
        if record.binding.is_none() {
            record.binding = Some(binding);
        } else {
            self.bucket_of(frame).lock().push((frame, binding));
        }
    }

    /// Remove the record that `frame` is mapped at `(space, vaddr)`.
    ///
    /// Returns whether a binding was found. A miss on a managed frame
    /// means the forward and reverse structures disagree, which the
    /// caller treats as fatal.
    pub(crate) fn unbind(&self, frame: Frame, space: SpaceId, vaddr: VirtAddr) -> bool {
        let Some(root) = self.root_of(frame) else {
            return false;
        };
        let mut record = root.lock();
        if !record.attrs.contains(FrameAttrs::MANAGED) {
            return false;
        }

        let target = Binding { space, vaddr };
        if record.binding == Some(target) {
            // Promote an overflow binding into the root slot, if any.
            let mut bucket = self.bucket_of(frame).lock();
            let promoted = bucket
                .iter()
                .position(|(f, _)| *f == frame)
                .map(|i| bucket.swap_remove(i).1);
            record.binding = promoted;
            return true;
        }

        let mut bucket = self.bucket_of(frame).lock();
        if let Some(i) = bucket
            .iter()
            .position(|(f, b)| *f == frame && *b == target)
        {
            bucket.swap_remove(i);
            return true;
        }
        false
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Every `(space, vaddr)` currently mapping the frame
    pub fn lookup(&self, frame: Frame) -> Vec<Binding> {
        let Some(root) = self.root_of(frame) else {
            return Vec::new();
        };
        let record = root.lock();
        let mut result = Vec::new();
        if let Some(binding) = record.binding {
            result.push(binding);
        }
        if record.binding.is_some() {
            let bucket = self.bucket_of(frame).lock();
            result.extend(bucket.iter().filter(|(f, _)| *f == frame).map(|(_, b)| *b));
        }
        result
    }

    /// Whether no present hierarchy entry anywhere references the frame
    ///
    /// Unmanaged frames are always reported unmapped; they never enter
    /// reclamation bookkeeping.
    pub fn is_unmapped(&self, frame: Frame) -> bool {
        let Some(root) = self.root_of(frame) else {
            return true;
        };
        let record = root.lock();
        if !record.attrs.contains(FrameAttrs::MANAGED) {
            return true;
        }
        record.binding.is_none()
    }

    /// Set an attribute bit on a managed frame
    ///
    /// Ignored for unmanaged frames.
    pub fn attribute_set(&self, frame: Frame, attr: FrameAttrs) {
        if let Some(root) = self.root_of(frame) {
            let mut record = root.lock();
            if record.attrs.contains(FrameAttrs::MANAGED) {
                record.attrs |= attr;
            }
        }
    }

    /// Clear an attribute bit on a managed frame
    pub fn attribute_clear(&self, frame: Frame, attr: FrameAttrs) {
        if let Some(root) = self.root_of(frame) {
            let mut record = root.lock();
            if record.attrs.contains(FrameAttrs::MANAGED) {
                record.attrs.remove(attr.difference(FrameAttrs::MANAGED));
            }
        }
    }

    /// Test an attribute bit; unmanaged frames are attribute-less
    pub fn attribute_test(&self, frame: Frame, attr: FrameAttrs) -> bool {
        self.root_of(frame)
            .map(|r| {
                let record = r.lock();
                record.attrs.contains(FrameAttrs::MANAGED) && record.attrs.contains(attr)
            })
            .unwrap_or(false)
    }

    /// Mark a physical frame range encryption-exempt
    ///
    /// Applied once at init for ranges the platform requires to stay
    /// cleartext.
    pub fn set_no_encrypt_range(&self, start: Frame, end: Frame) {
        let mut frame = start;
        while frame <= end {
            self.attribute_set(frame, FrameAttrs::NO_ENCRYPT);
            frame = frame.next();
        }
    }
}

impl core::fmt::Debug for ReverseMap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReverseMap")
            .field("frames", &self.roots.len())
            .field("hash_size", &self.hash_size)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
