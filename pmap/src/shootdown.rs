//! # Cross-CPU Invalidation
//!
//! The shootdown protocol keeping every processor's cached translations
//! coherent with the hierarchy.
//!
//! An initiator (holding the mutated space's lock) scans the per-CPU
//! records for processors whose active or task root matches the space,
//! or whose space is globally shared. It flushes its own cache inline,
//! marks each other matching running processor's pending-invalidation
//! flag with a fence, signals it, and busy-waits for acknowledgement
//! under a bounded deadline. A processor not currently running a
//! matching space is not signaled: it must drain its pending flag before
//! it can re-activate any matching space, so lazy invalidation is safe.
//!
//! On deadline expiry the protocol escalates once with a non-maskable
//! interrupt and then halts: an unresponsive processor means translation
//! coherence cannot be guaranteed, and there is no safe degraded mode
//! for an inconsistent translation cache.

use core::fmt;
use core::sync::atomic::{fence, Ordering};

use crate::addresses::VirtAddr;
use crate::cpu::{CpuId, CpuSet};
use crate::space::AddressSpace;
use crate::system::PhysMap;

// =============================================================================
// Protocol Phase
// =============================================================================

/// State machine of one shootdown invocation
///
/// `Escalating` is followed either by late acknowledgement or by the
/// terminal halt; converting the halt into a recoverable error would
/// change the safety contract, not just the behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShootdownPhase {
    /// No shootdown in progress
    Idle,
    /// Scanning and signaling matching processors
    Signaling,
    /// Busy-waiting for acknowledgements
    Waiting,
    /// Every signaled processor acknowledged
    Acknowledged,
    /// Deadline expired; non-maskable interrupts sent
    Escalating,
}

impl fmt::Display for ShootdownPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShootdownPhase::Idle => "idle",
            ShootdownPhase::Signaling => "signaling",
            ShootdownPhase::Waiting => "waiting",
            ShootdownPhase::Acknowledged => "acknowledged",
            ShootdownPhase::Escalating => "escalating",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Shootdown counters for performance monitoring
#[cfg(feature = "tlb_stats")]
pub mod stats {
    use core::sync::atomic::{AtomicU64, Ordering};

    static SHOOTDOWNS: AtomicU64 = AtomicU64::new(0);
    static SIGNALS: AtomicU64 = AtomicU64::new(0);
    static ESCALATIONS: AtomicU64 = AtomicU64::new(0);

    pub(crate) fn record_shootdown(signals: u32) {
        SHOOTDOWNS.fetch_add(1, Ordering::Relaxed);
        SIGNALS.fetch_add(signals as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_escalation() {
        ESCALATIONS.fetch_add(1, Ordering::Relaxed);
    }

    /// (shootdowns, signals sent, NMI escalations)
    pub fn get_stats() -> (u64, u64, u64) {
        (
            SHOOTDOWNS.load(Ordering::Relaxed),
            SIGNALS.load(Ordering::Relaxed),
            ESCALATIONS.load(Ordering::Relaxed),
        )
    }
}

// =============================================================================
// Protocol
// =============================================================================

impl PhysMap {
    /// Flush the executing processor for a mutated space.
    fn flush_current(&self, shared: bool) {
        if self.tags.is_enabled() && shared {
            self.cpu_if.flush_global();
        } else {
            self.cpu_if.flush_local();
        }
    }

    /// Invalidate `[start, end)` of `space` on every processor that may
    /// hold cached translations for it
    ///
    /// Called with the space's lock held. Blocks until each signaled
    /// processor acknowledges (or has gone not-running); the mutation is
    /// not complete until this returns.
    ///
    /// # Panics
    ///
    /// Panics when a signaled processor stays unresponsive through the
    /// NMI escalation, and when a kernel-space shootdown finds the
    /// initiating processor not running on a matching root.
    pub fn shootdown(&self, space: &AddressSpace, start: VirtAddr, end: VirtAddr) {
        let my_cpu = self.cpu_if.current_cpu();
        let root = space.root_phys();
        let shared = space.is_shared() || space.is_kernel();
        // With tags in effect a shared-space mutation poisons every
        // tag, so the pending reason escalates to global.
        let mark_global = self.tags.is_enabled() && shared;

        let mut phase = ShootdownPhase::Signaling;
        let mut to_signal = CpuSet::empty();
        let mut flush_self = false;

        for (cpu, state) in self.cpus.running() {
            let matches =
                shared || state.active_root() == root || state.task_root() == root;
            if !matches {
                continue;
            }
            if cpu == my_cpu {
                flush_self = true;
                continue;
            }

            state.mark_invalid(mark_global);
            // The pending store must be globally visible before the
            // signal, and before the liveness re-read below.
            fence(Ordering::SeqCst);

            // Processors not running a matching space flush lazily at
            // reactivation; alterations to a task active on a remote
            // processor always signal, to account for copy windows.
            if state.is_root_live()
                && (state.active_root() == root
                    || state.task_root() == root
                    || space.is_shared())
            {
                to_signal.insert(cpu);
                self.cpu_if.send_invalidate(cpu);
            }
        }

        log::trace!(
            "shootdown {:#x} [{}, {}) {}: signal {}, self {}",
            root,
            start,
            end,
            phase,
            to_signal,
            flush_self
        );
        #[cfg(feature = "tlb_stats")]
        stats::record_shootdown(to_signal.count());

        // Flush locally now, overlapping with remote responses.
        if flush_self {
            self.flush_current(shared);
        }

        if !to_signal.is_empty() {
            phase = ShootdownPhase::Waiting;
            self.await_acknowledgements(to_signal, &mut phase);
        } else {
            phase = ShootdownPhase::Acknowledged;
        }
        debug_assert_eq!(phase, ShootdownPhase::Acknowledged);

        // The kernel root is loaded on every processor; an initiator
        // that did not match itself is structurally impossible.
        assert!(
            !(space.is_kernel() && !flush_self),
            "kernel shootdown from cpu {} without a matching active root",
            my_cpu
        );
    }

    /// Busy-wait with periodic re-scan until every signaled processor
    /// clears its pending flag or leaves the matching set.
    fn await_acknowledgements(&self, signaled: CpuSet, phase: &mut ShootdownPhase) {
        let mut waiting = signaled;
        let mut deadline = self.cpu_if.timestamp() + self.cpu_if.ack_timeout();
        let mut escalated = false;

        loop {
            for cpu in waiting.iter() {
                let state = self.cpus.state(cpu);
                if !state.is_running() || !state.invalid_pending() || !state.is_root_live() {
                    waiting.remove(cpu);
                }
            }
            if waiting.is_empty() {
                *phase = ShootdownPhase::Acknowledged;
                return;
            }

            core::hint::spin_loop();

            if self.cpu_if.timestamp() > deadline {
                if escalated {
                    panic!(
                        "translation invalidation timeout: cpus {} failed to respond \
                         to the non-maskable escalation",
                        waiting
                    );
                }
                // One escalation attempt, then a fresh deadline.
                *phase = ShootdownPhase::Escalating;
                escalated = true;
                log::error!(
                    "translation invalidation deadline expired, sending NMI to {}",
                    waiting
                );
                #[cfg(feature = "tlb_stats")]
                stats::record_escalation();
                for cpu in waiting.iter() {
                    self.cpu_if.send_nmi(cpu);
                }
                deadline = self.cpu_if.timestamp() + self.cpu_if.ack_timeout();
            }
        }
    }

    /// Receiving side of the protocol: the invalidation interrupt
    /// handler body for `cpu`
    ///
    /// Clears this processor's own invalidation reason and performs the
    /// corresponding flush before returning. Runs with interrupts
    /// re-enterable so the non-maskable escalation path stays deliverable.
    pub fn process_updates(&self, cpu: CpuId) {
        let state = self.cpus.state(cpu);

        // Pair with the initiator's fence: the pending flags read here
        // must not be hoisted above interrupt entry.
        fence(Ordering::SeqCst);

        if state.invalid_global_pending() {
            state.clear_invalid();
            self.cpu_if.flush_global();
        } else {
            state.clear_invalid_local();
            self.cpu_if.flush_local();
        }

        fence(Ordering::SeqCst);
    }
}
