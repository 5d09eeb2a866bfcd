//! End-to-end boot finalization and permission audit.

mod support;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;

use osmium_pmap::addresses::{KERNEL_WINDOW_START, PAGE_SIZE_2M};
use osmium_pmap::{
    DeclaredRegion, Frame, KernelLayout, MapAttributes, MemoryRegion, Protection, RegionKind,
    Section, Segment, SegmentClass, VirtAddr,
};
use support::{testbed, TestBed};

const M2: u64 = PAGE_SIZE_2M as u64;
const KWS: u64 = KERNEL_WINDOW_START;

const LOW_KEEP_END: u64 = KWS + 0x10_0000;
const KERNEL_BASE: u64 = TEXT_START - 0x1_0000;
const TEXT_START: u64 = KWS + M2;
const DATA_START: u64 = KWS + 2 * M2;
const DATA_END: u64 = DATA_START + 0x4_0000;
const SEG_BASE: u64 = KWS + 3 * M2;

fn va(addr: u64) -> VirtAddr {
    VirtAddr::new(addr)
}

/// Map a contiguous run of pages into the kernel space.
fn map_run(bed: &TestBed, start: u64, pages: u64, first_frame: u64, prot: Protection) {
    let kernel = bed.pmap.kernel_space();
    for i in 0..pages {
        bed.pmap
            .enter(
                kernel,
                va(start + i * 0x1000),
                Frame::new(first_frame + i),
                prot,
                MapAttributes::empty(),
                false,
            )
            .unwrap();
    }
}

/// Reproduce the state early boot leaves behind: identity-mapped low
/// pages, alignment padding, small-page text, data, and extra segments.
fn boot_state(bed: &TestBed) {
    let rwx = Protection::READ | Protection::WRITE | Protection::EXECUTE;

    // Leftover identity mappings below the kernel base.
    map_run(bed, LOW_KEEP_END, 16, 0x110, Protection::READ_WRITE);
    // Zero-filled padding below text (covers the kernel base).
    map_run(bed, KERNEL_BASE, 16, 0x130, Protection::READ_WRITE);
    // Kernel text, 4 KiB pages, writable until finalization.
    map_run(bed, TEXT_START, 512, 0x200, rwx);
    // Writable data.
    map_run(bed, DATA_START, 64, 0x140, Protection::READ_WRITE);
    // An auxiliary segment still mapped writable and executable.
    map_run(bed, SEG_BASE, 2, 0x180, rwx);
    // The pre-initialization segment: one text and one data section.
    map_run(bed, SEG_BASE + 0x1_0000, 1, 0x182, rwx);
    map_run(bed, SEG_BASE + 0x1_1000, 1, 0x183, Protection::READ_WRITE);
}

fn layout<'a>(segments: &'a [Segment<'a>]) -> KernelLayout<'a> {
    KernelLayout {
        kernel_base: va(KERNEL_BASE),
        early_end: va(KERNEL_BASE),
        low_keep_end: va(LOW_KEEP_END),
        text_start: va(TEXT_START),
        text_end: va(DATA_START),
        data_start: va(DATA_START),
        data_end: va(DATA_END),
        const_data: Some((va(DATA_START + 0x1000), va(DATA_START + 0x3000))),
        segments,
    }
}

fn segments(sections: &'static [Section]) -> Vec<Segment<'static>> {
    vec![
        Segment {
            name: "text",
            start: va(TEXT_START),
            size: DATA_START - TEXT_START,
            class: SegmentClass::Text,
            sections: &[],
        },
        Segment {
            name: "data",
            start: va(DATA_START),
            size: DATA_END - DATA_START,
            class: SegmentClass::Data,
            sections: &[],
        },
        Segment {
            name: "aux",
            start: va(SEG_BASE),
            size: 0x2000,
            class: SegmentClass::Other,
            sections: &[],
        },
        Segment {
            name: "early",
            start: va(SEG_BASE + 0x1_0000),
            size: 0x2000,
            class: SegmentClass::EarlyInit,
            sections,
        },
    ]
}

static EARLY_SECTIONS: [Section; 2] = [
    Section {
        start: VirtAddr::new(SEG_BASE + 0x1_0000),
        size: 0x1000,
        executable: true,
    },
    Section {
        start: VirtAddr::new(SEG_BASE + 0x1_1000),
        size: 0x1000,
        executable: false,
    },
];

fn low_regions() -> Vec<MemoryRegion> {
    vec![MemoryRegion {
        base: Frame::new(0),
        end: Frame::new(0xFF),
        kind: RegionKind::Usable,
        reserved: false,
    }]
}

fn finalized_bed() -> TestBed {
    let bed = testbed();
    boot_state(&bed);
    let segs = segments(&EARLY_SECTIONS);
    bed.pmap
        .finalize_boot(&layout(&segs), &low_regions());
    bed
}

#[test]
fn text_is_coalesced_and_write_protected() {
    let bed = finalized_bed();
    let kernel = bed.pmap.kernel_space();

    // Same translations, now through one large entry.
    assert_eq!(
        bed.pmap.translate(kernel, va(TEXT_START + 0x3000)),
        Some(Frame::new(0x203))
    );
    let prot = bed.pmap.protection_at(kernel, va(TEXT_START)).unwrap();
    assert_eq!(prot, Protection::READ | Protection::EXECUTE);

    // The orphaned leaf table page went back to the pool.
    let freed = bed.frames.static_freed.lock().unwrap().clone();
    assert!(freed.iter().any(|&(_, len)| len == 0x1000));
}

#[test]
fn padding_and_low_memory_are_released() {
    let bed = finalized_bed();
    let freed = bed.frames.static_freed.lock().unwrap().clone();

    // Low conventional memory below the kernel, clipped at the
    // early-boot-critical range.
    assert!(freed.contains(&(0, 0xC0000)));
    // Alignment padding below text.
    assert!(freed.contains(&(0x130 << 12, 0x1_0000)));
}

#[test]
fn identity_mappings_below_kernel_are_removed() {
    let bed = finalized_bed();
    let kernel = bed.pmap.kernel_space();

    assert_eq!(bed.pmap.translate(kernel, va(LOW_KEEP_END)), None);
    assert!(bed.pmap.verify_unmapped(Frame::new(0x110)));
}

#[test]
fn data_is_no_execute_and_const_range_read_only() {
    let bed = finalized_bed();
    let kernel = bed.pmap.kernel_space();

    assert_eq!(
        bed.pmap.protection_at(kernel, va(DATA_START)).unwrap(),
        Protection::READ_WRITE
    );
    assert_eq!(
        bed.pmap.protection_at(kernel, va(DATA_START + 0x1000)).unwrap(),
        Protection::READ_ONLY
    );
    assert_eq!(
        bed.pmap.protection_at(kernel, va(DATA_START + 0x3000)).unwrap(),
        Protection::READ_WRITE
    );
}

#[test]
fn segments_get_no_execute_and_early_init_split() {
    let bed = finalized_bed();
    let kernel = bed.pmap.kernel_space();

    // Auxiliary segment: no-execute.
    assert_eq!(
        bed.pmap.protection_at(kernel, va(SEG_BASE)).unwrap(),
        Protection::READ_WRITE
    );
    // Early-init text section: read-only, still executable.
    assert_eq!(
        bed.pmap.protection_at(kernel, va(SEG_BASE + 0x1_0000)).unwrap(),
        Protection::READ | Protection::EXECUTE
    );
    // Early-init data section: no-execute.
    assert_eq!(
        bed.pmap.protection_at(kernel, va(SEG_BASE + 0x1_1000)).unwrap(),
        Protection::READ_WRITE
    );
}

#[test]
fn finalization_ends_with_global_flush_and_interrupts_restored() {
    let bed = finalized_bed();
    assert!(bed.cpus.global_flushes.load(Ordering::Relaxed) >= 1);
    assert_eq!(bed.cpus.irq_depth.load(Ordering::Relaxed), 0);
}

#[test]
fn finalization_runs_exactly_once() {
    let bed = finalized_bed();
    let segs = segments(&EARLY_SECTIONS);
    let result = catch_unwind(AssertUnwindSafe(|| {
        bed.pmap
            .finalize_boot(&layout(&segs), &low_regions());
    }));
    assert!(result.is_err());
}

#[test]
fn audit_is_clean_after_finalization() {
    let bed = finalized_bed();
    let kernel = bed.pmap.kernel_space();

    let declared = [
        DeclaredRegion {
            start: va(TEXT_START),
            end: va(DATA_START),
            protection: Protection::READ | Protection::EXECUTE,
        },
        DeclaredRegion {
            start: va(DATA_START),
            end: va(DATA_START + 0x1000),
            protection: Protection::READ_WRITE,
        },
        DeclaredRegion {
            start: va(DATA_START + 0x1000),
            end: va(DATA_START + 0x3000),
            protection: Protection::READ_ONLY,
        },
        DeclaredRegion {
            start: va(DATA_START + 0x3000),
            end: va(DATA_END),
            protection: Protection::READ_WRITE,
        },
    ];

    assert!(bed
        .pmap
        .verify_permissions(kernel, va(TEXT_START), va(DATA_END), &declared)
        .is_ok());
}

#[test]
fn audit_reports_writable_executable_pages() {
    let bed = finalized_bed();
    let kernel = bed.pmap.kernel_space();
    let offender = va(KWS + 5 * M2);

    bed.pmap
        .enter(
            kernel,
            offender,
            Frame::new(0x190),
            Protection::READ | Protection::WRITE | Protection::EXECUTE,
            MapAttributes::empty(),
            false,
        )
        .unwrap();

    let report = bed
        .pmap
        .verify_permissions(kernel, va(TEXT_START), va(KWS + 5 * M2 + 0x1000), &[])
        .unwrap_err();
    assert!(report.writable_executable.contains(&offender));

    // A declared region asking for W+X is itself a finding.
    let wx_region = [DeclaredRegion {
        start: offender,
        end: va(offender.as_u64() + 0x1000),
        protection: Protection::READ | Protection::WRITE | Protection::EXECUTE,
    }];
    let report = bed
        .pmap
        .verify_permissions(kernel, offender, va(offender.as_u64() + 0x1000), &wx_region)
        .unwrap_err();
    assert!(!report.writable_executable_regions.is_empty());
}

#[test]
fn audit_reports_declared_mismatches() {
    let bed = finalized_bed();
    let kernel = bed.pmap.kernel_space();

    // Declare data read-only while it is actually read-write.
    let declared = [DeclaredRegion {
        start: va(DATA_START + 0x3000),
        end: va(DATA_START + 0x4000),
        protection: Protection::READ_ONLY,
    }];
    let report = bed
        .pmap
        .verify_permissions(kernel, va(DATA_START), va(DATA_END), &declared)
        .unwrap_err();
    assert_eq!(report.mismatches.len(), 1);
    assert_eq!(report.mismatches[0].actual, Protection::READ_WRITE);
}
