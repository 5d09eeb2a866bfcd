//! # Address-Space Tags
//!
//! The per-architecture accelerator tag attached to each address space.
//! Tags let a processor invalidate only the translations belonging to
//! one space instead of its whole cache; the shootdown protocol chooses
//! between tag-scoped and global pending invalidations based on whether
//! tags are in effect.
//!
//! Tags are allocated from a wrapping counter. A wrap starts a new
//! generation: every tag issued under an older generation is stale, and
//! the first activation of a stale-tagged space forces a full flush.

use core::fmt;

use spin::Mutex;

// =============================================================================
// Constants
// =============================================================================

/// Maximum tag value (12-bit hardware field)
pub const MAX_TAG: u16 = 0xFFF;

/// Tag reserved for the kernel space
pub const KERNEL_TAG: u16 = 0;

// =============================================================================
// Space Tag
// =============================================================================

/// An accelerator tag with its allocation generation
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SpaceTag {
    value: u16,
    generation: u64,
}

impl SpaceTag {
    /// Create a new tag
    #[inline]
    pub const fn new(value: u16, generation: u64) -> Self {
        Self { value, generation }
    }

    /// The kernel's fixed tag
    #[inline]
    pub const fn kernel() -> Self {
        Self {
            value: KERNEL_TAG,
            generation: 0,
        }
    }

    /// Get the tag value
    #[inline]
    pub const fn value(self) -> u16 {
        self.value
    }

    /// Check whether this tag is still valid under the given generation
    #[inline]
    pub const fn is_current(self, generation: u64) -> bool {
        self.generation == generation
    }
}

impl fmt::Debug for SpaceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpaceTag({}, gen {})", self.value, self.generation)
    }
}

// =============================================================================
// Tag Allocator
// =============================================================================

/// Allocation state behind the lock
struct TagState {
    next: u16,
    generation: u64,
}

/// Wrapping tag allocator with generations
///
/// Tags are never individually recycled; abandoning them until the
/// counter wraps keeps allocation O(1). On wrap, the generation bumps
/// and every outstanding tag goes stale at once.
pub struct TagAllocator {
    state: Mutex<TagState>,
    /// Whether the hardware supports tags at all; without support every
    /// space runs untagged and shootdowns always use global pending
    /// invalidations for shared spaces.
    enabled: bool,
}

impl TagAllocator {
    /// Create an allocator
    pub const fn new(enabled: bool) -> Self {
        Self {
            state: Mutex::new(TagState {
                next: KERNEL_TAG + 1,
                generation: 0,
            }),
            enabled,
        }
    }

    /// Whether tag-based partial invalidation is in effect
    #[inline]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Allocate a tag for a new address space
    ///
    /// Returns `None` when tags are not in effect.
    pub fn allocate(&self) -> Option<SpaceTag> {
        if !self.enabled {
            return None;
        }

        let mut state = self.state.lock();
        if state.next > MAX_TAG {
            state.next = KERNEL_TAG + 1;
            state.generation += 1;
            log::debug!("space tags wrapped, generation {}", state.generation);
        }
        let tag = SpaceTag::new(state.next, state.generation);
        state.next += 1;
        Some(tag)
    }

    /// The current generation
    #[inline]
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }
}

impl fmt::Debug for TagAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TagAllocator")
            .field("enabled", &self.enabled)
            .field("next", &state.next)
            .field("generation", &state.generation)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
