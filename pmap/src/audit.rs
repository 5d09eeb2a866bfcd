//! # Permission Audit
//!
//! A diagnostic pass over the kernel hierarchy correlating declared
//! protections with actual hardware entries. Never fatal and never on
//! the hot path: findings are enumerated for the caller (typically a
//! boot-time self-check) to judge.
//!
//! Two passes run over the requested range: the first looks for any
//! present entry that is simultaneously writable and executable, the
//! second cross-references the VM layer's declared region protections
//! against the protection derived from each present entry.

use alloc::vec::Vec;
use core::fmt;

use crate::addresses::{VirtAddr, PAGE_SIZE_4K};
use crate::entries::{Protection, TableLevel};
use crate::platform::DeclaredRegion;
use crate::space::AddressSpace;
use crate::system::PhysMap;

/// First non-canonical address above the user half
const CANONICAL_HOLE_START: u64 = 0x0000_8000_0000_0000;

/// First canonical address of the kernel half
const CANONICAL_HOLE_END: u64 = 0xFFFF_8000_0000_0000;

// =============================================================================
// Findings
// =============================================================================

/// A page whose derived protection disagrees with the declared one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectionMismatch {
    /// The offending page
    pub vaddr: VirtAddr,
    /// Protection derived from the hardware entry
    pub actual: Protection,
    /// Protection the VM layer declared
    pub declared: Protection,
}

/// Everything the audit found
#[derive(Debug, Default)]
pub struct AuditReport {
    /// Pages mapped simultaneously writable and executable
    pub writable_executable: Vec<VirtAddr>,
    /// Declared regions that themselves request writable+executable
    pub writable_executable_regions: Vec<VirtAddr>,
    /// Derived-vs-declared protection disagreements
    pub mismatches: Vec<ProtectionMismatch>,
}

impl AuditReport {
    /// Whether no violation of either kind was found
    pub fn is_clean(&self) -> bool {
        self.writable_executable.is_empty()
            && self.writable_executable_regions.is_empty()
            && self.mismatches.is_empty()
    }
}

impl fmt::Display for AuditReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} W+X entries, {} W+X regions, {} protection mismatches",
            self.writable_executable.len(),
            self.writable_executable_regions.len(),
            self.mismatches.len()
        )
    }
}

// =============================================================================
// Audit
// =============================================================================

impl PhysMap {
    /// Verify the hierarchy's permissions over `[start, end)` against
    /// the VM layer's declared regions
    ///
    /// Returns `Ok` only when no writable+executable entry and no
    /// derived-vs-declared mismatch was found. Runs without the space
    /// lock; transient inconsistencies during concurrent mutation are
    /// harmless for a diagnostic.
    pub fn verify_permissions(
        &self,
        space: &AddressSpace,
        start: VirtAddr,
        end: VirtAddr,
        declared: &[DeclaredRegion],
    ) -> Result<(), AuditReport> {
        let mut report = AuditReport::default();

        self.scan_writable_executable(space, start, end, &mut report);
        self.cross_reference(space, declared, &mut report);

        log::info!("permission audit complete: {}", report);
        if report.is_clean() {
            Ok(())
        } else {
            Err(report)
        }
    }

    /// Pass one: every present entry that is writable and executable.
    fn scan_writable_executable(
        &self,
        space: &AddressSpace,
        start: VirtAddr,
        end: VirtAddr,
        report: &mut AuditReport,
    ) {
        let sv = start.as_u64() & !(PAGE_SIZE_4K as u64 - 1);
        let ev = end.as_u64() & !(PAGE_SIZE_4K as u64 - 1);
        let mut cv = sv;

        while cv < ev {
            // Hop over the non-canonical hole.
            if (CANONICAL_HOLE_START..CANONICAL_HOLE_END).contains(&cv) {
                cv = CANONICAL_HOLE_END;
                continue;
            }

            // Skip absent subtrees a level at a time.
            let va = VirtAddr::new(cv);
            if cv & (TableLevel::Pml4.entry_span() - 1) == 0
                && self.upper_slot(space, va).is_none()
            {
                match cv.checked_add(TableLevel::Pml4.entry_span()) {
                    Some(next) => cv = next,
                    None => break,
                }
                continue;
            }
            if cv & (TableLevel::Pd.entry_span() - 1) == 0
                && self.middle_slot(space, va).map(|s| !s.get().is_present()).unwrap_or(true)
            {
                match cv.checked_add(TableLevel::Pd.entry_span()) {
                    Some(next) => cv = next,
                    None => break,
                }
                continue;
            }

            if let Some((entry, _)) = self.lookup_entry(space, va) {
                if entry.is_writable_executable() {
                    log::warn!("W+X entry at {}: {:?}", va, entry);
                    report.writable_executable.push(va);
                }
            }
            cv += PAGE_SIZE_4K as u64;
        }
    }

    /// Pass two: derived protection of each mapped page against the
    /// declared region protection.
    fn cross_reference(
        &self,
        space: &AddressSpace,
        declared: &[DeclaredRegion],
        report: &mut AuditReport,
    ) {
        for region in declared {
            if region.protection.is_writable_executable() {
                log::warn!("W+X declared region at {}", region.start);
                report.writable_executable_regions.push(region.start);
            }
            if region.protection == Protection::NONE {
                continue;
            }

            let mut pcv = region.start;
            while pcv < region.end {
                if let Some((entry, _)) = self.lookup_entry(space, pcv) {
                    let actual = entry.derived_protection();
                    if actual != region.protection {
                        log::warn!(
                            "protection mismatch at {}: entry {}, declared {}",
                            pcv,
                            actual,
                            region.protection
                        );
                        report.mismatches.push(ProtectionMismatch {
                            vaddr: pcv,
                            actual,
                            declared: region.protection,
                        });
                    }
                }
                pcv += PAGE_SIZE_4K as u64;
            }
        }
    }
}
