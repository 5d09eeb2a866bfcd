//! Scenario and concurrency tests for the mapping surface.

mod support;

use std::sync::atomic::Ordering;
use std::sync::Barrier;

use osmium_pmap::{
    AccountingId, AllocMode, Frame, FrameAttrs, MapAttributes, MapError, Protection, VirtAddr,
};
use support::testbed;

fn va(addr: u64) -> VirtAddr {
    VirtAddr::new(addr)
}

#[test]
fn scenario_enter_protect_remove_destroy() {
    let bed = testbed();
    let s = bed.pmap.create(AccountingId(7), 0, true).unwrap();

    bed.pmap
        .enter(
            &s,
            va(0x1000),
            Frame::new(5),
            Protection::READ_WRITE,
            MapAttributes::empty(),
            false,
        )
        .unwrap();
    assert_eq!(bed.pmap.translate(&s, va(0x1000)), Some(Frame::new(5)));
    assert!(!bed.pmap.verify_unmapped(Frame::new(5)));

    bed.pmap
        .protect(&s, va(0x1000), va(0x2000), Protection::READ_ONLY);
    let prot = bed.pmap.protection_at(&s, va(0x1000)).unwrap();
    assert!(prot.contains(Protection::READ));
    // The write fault path sees the denial.
    assert!(!prot.contains(Protection::WRITE));
    assert_eq!(bed.pmap.translate(&s, va(0x1000)), Some(Frame::new(5)));

    bed.pmap.remove(&s, va(0x1000), va(0x2000));
    assert_eq!(bed.pmap.translate(&s, va(0x1000)), None);
    assert!(bed.pmap.verify_unmapped(Frame::new(5)));

    // Destroy tears down only once the count returns through 1.
    bed.pmap.reference(&s);
    assert_eq!(s.ref_count(), 2);
    bed.pmap.destroy(&s);
    assert_eq!(s.ref_count(), 1);
    bed.pmap.destroy(&s);
    assert_eq!(s.ref_count(), 0);
    assert_eq!(s.owned_table_pages(), 0);
}

#[test]
fn software_only_maps_are_rejected() {
    let bed = testbed();
    assert!(bed.pmap.create(AccountingId(1), 4096, true).is_none());
}

#[test]
fn expansion_is_idempotent() {
    let bed = testbed();
    let s = bed.pmap.create(AccountingId(1), 0, true).unwrap();

    let before = bed.frames.acquired.load(Ordering::Relaxed);
    bed.pmap.expand(&s, va(0x40_0000), AllocMode::Wait).unwrap();
    let first = bed.frames.acquired.load(Ordering::Relaxed) - before;
    assert_eq!(first, 3, "one table page per intermediate level");

    bed.pmap.expand(&s, va(0x40_0000), AllocMode::Wait).unwrap();
    let second = bed.frames.acquired.load(Ordering::Relaxed) - before;
    assert_eq!(second, 3, "second expansion allocates nothing");
}

#[test]
fn expansion_nowait_reports_shortage() {
    let bed = testbed();
    let s = bed.pmap.create(AccountingId(1), 0, true).unwrap();

    let pool = bed.frames.drain_pool();
    assert_eq!(
        bed.pmap.expand(&s, va(0x40_0000), AllocMode::NoWait),
        Err(MapError::ResourceShortage)
    );
    bed.frames.refill_pool(pool);
    assert_eq!(bed.pmap.expand(&s, va(0x40_0000), AllocMode::Wait), Ok(()));
}

#[test]
fn concurrent_duplicate_expansion_installs_once() {
    let bed = testbed();
    let s = bed.pmap.create(AccountingId(1), 0, true).unwrap();

    let before_pages = bed.pmap.table_pages_in_use();
    let outstanding_before = bed.frames.outstanding();

    let barrier = Barrier::new(8);
    std::thread::scope(|scope| {
        for _ in 0..8 {
            let s = s.clone();
            let pmap = bed.pmap;
            let barrier = &barrier;
            scope.spawn(move || {
                barrier.wait();
                pmap.expand(&s, va(0x80_0000), AllocMode::Wait).unwrap();
            });
        }
    });

    // Losers freed their speculative pages: exactly one page per level
    // stays live.
    assert_eq!(bed.pmap.table_pages_in_use() - before_pages, 3);
    assert_eq!(bed.frames.outstanding() - outstanding_before, 3);
    assert_eq!(s.owned_table_pages(), 3);
}

#[test]
fn concurrent_enter_translate_never_misses() {
    let bed = testbed();
    let s = bed.pmap.create(AccountingId(1), 0, true).unwrap();

    const WORKERS: u64 = 8;
    const PAGES: u64 = 32;

    let barrier = Barrier::new(WORKERS as usize);
    std::thread::scope(|scope| {
        for worker in 0..WORKERS {
            let s = s.clone();
            let pmap = bed.pmap;
            let barrier = &barrier;
            scope.spawn(move || {
                barrier.wait();
                for i in 0..PAGES {
                    let vaddr = va(worker * 0x4000_0000 + i * 0x1000);
                    let frame = Frame::new(0x100 + worker * PAGES + i);
                    pmap.enter(
                        &s,
                        vaddr,
                        frame,
                        Protection::READ_WRITE,
                        MapAttributes::empty(),
                        false,
                    )
                    .unwrap();
                    // A just-entered page must never read back absent.
                    assert_eq!(pmap.translate(&s, vaddr), Some(frame));
                }
            });
        }
    });

    for worker in 0..WORKERS {
        for i in 0..PAGES {
            let vaddr = va(worker * 0x4000_0000 + i * 0x1000);
            let frame = Frame::new(0x100 + worker * PAGES + i);
            assert_eq!(bed.pmap.translate(&s, vaddr), Some(frame));
        }
    }
    assert_eq!(s.stats().resident(), (WORKERS * PAGES) as i64);
}

#[test]
fn protect_none_is_remove() {
    let bed = testbed();
    let s = bed.pmap.create(AccountingId(1), 0, true).unwrap();

    bed.pmap
        .enter(
            &s,
            va(0x1000),
            Frame::new(9),
            Protection::READ_WRITE,
            MapAttributes::empty(),
            false,
        )
        .unwrap();
    bed.pmap.protect(&s, va(0x1000), va(0x2000), Protection::NONE);
    assert_eq!(bed.pmap.translate(&s, va(0x1000)), None);
    assert!(bed.pmap.verify_unmapped(Frame::new(9)));
}

#[test]
fn protect_tracks_requested_write_permission() {
    let bed = testbed();
    let s = bed.pmap.create(AccountingId(1), 0, true).unwrap();

    bed.pmap
        .enter(
            &s,
            va(0x1000),
            Frame::new(9),
            Protection::READ_ONLY,
            MapAttributes::empty(),
            false,
        )
        .unwrap();
    assert!(!bed.pmap.protection_at(&s, va(0x1000)).unwrap().contains(Protection::WRITE));

    // The writable bit appears only because the caller requested it.
    bed.pmap
        .protect(&s, va(0x1000), va(0x2000), Protection::READ_WRITE);
    assert!(bed.pmap.protection_at(&s, va(0x1000)).unwrap().contains(Protection::WRITE));

    bed.pmap
        .protect(&s, va(0x1000), va(0x2000), Protection::READ_ONLY);
    assert!(!bed.pmap.protection_at(&s, va(0x1000)).unwrap().contains(Protection::WRITE));
}

#[test]
fn enter_replaces_existing_mapping() {
    let bed = testbed();
    let s = bed.pmap.create(AccountingId(1), 0, true).unwrap();

    bed.pmap
        .enter(
            &s,
            va(0x5000),
            Frame::new(5),
            Protection::READ_WRITE,
            MapAttributes::empty(),
            false,
        )
        .unwrap();
    bed.pmap
        .enter(
            &s,
            va(0x5000),
            Frame::new(6),
            Protection::READ_WRITE,
            MapAttributes::empty(),
            false,
        )
        .unwrap();

    assert_eq!(bed.pmap.translate(&s, va(0x5000)), Some(Frame::new(6)));
    assert!(bed.pmap.verify_unmapped(Frame::new(5)));
    assert!(!bed.pmap.verify_unmapped(Frame::new(6)));
    assert_eq!(s.stats().resident(), 1);
}

#[test]
fn wired_mappings_are_accounted() {
    let bed = testbed();
    let s = bed.pmap.create(AccountingId(1), 0, true).unwrap();

    bed.pmap
        .enter(
            &s,
            va(0x1000),
            Frame::new(0x44),
            Protection::READ_WRITE,
            MapAttributes::empty(),
            true,
        )
        .unwrap();
    assert_eq!(s.stats().wired(), 1);
    assert!(bed.pmap.rmap().attribute_test(Frame::new(0x44), FrameAttrs::WIRED));

    bed.pmap.remove(&s, va(0x1000), va(0x2000));
    assert_eq!(s.stats().wired(), 0);
    assert!(!bed.pmap.rmap().attribute_test(Frame::new(0x44), FrameAttrs::WIRED));
}

#[test]
fn large_page_enter_and_remove() {
    let bed = testbed();
    let s = bed.pmap.create(AccountingId(1), 0, true).unwrap();
    let base = va(0x4000_0000);

    bed.pmap
        .enter(
            &s,
            base,
            Frame::new(512),
            Protection::READ_WRITE,
            MapAttributes::LARGE,
            false,
        )
        .unwrap();

    assert_eq!(bed.pmap.translate(&s, base), Some(Frame::new(512)));
    assert_eq!(
        bed.pmap.translate(&s, va(0x4000_3000)),
        Some(Frame::new(515))
    );
    assert_eq!(s.stats().resident(), 512);

    bed.pmap.remove(&s, base, va(0x4020_0000));
    assert_eq!(bed.pmap.translate(&s, base), None);
    assert_eq!(s.stats().resident(), 0);
}

#[test]
fn is_empty_tracks_mappings() {
    let bed = testbed();
    let s = bed.pmap.create(AccountingId(1), 0, true).unwrap();

    assert!(bed.pmap.is_empty(&s, va(0), va(0x1_0000)));

    bed.pmap
        .enter(
            &s,
            va(0x3000),
            Frame::new(3),
            Protection::READ_ONLY,
            MapAttributes::empty(),
            false,
        )
        .unwrap();
    assert!(!bed.pmap.is_empty(&s, va(0), va(0x1_0000)));
    assert!(bed.pmap.is_empty(&s, va(0x1_0000), va(0x2_0000)));

    bed.pmap.remove(&s, va(0x3000), va(0x4000));
    assert!(bed.pmap.is_empty(&s, va(0), va(0x1_0000)));
}

#[test]
fn seeded_boot_mappings_appear_in_reverse_map() {
    let bed = testbed();
    let kernel = bed.pmap.kernel_space();

    bed.pmap
        .seed_boot_mapping(kernel, va(0xFFFF_FF00_0000_0000), Frame::new(0x60), 4);
    for i in 0..4 {
        assert!(!bed.pmap.verify_unmapped(Frame::new(0x60 + i)));
    }
    assert_eq!(kernel.stats().resident(), 4);
}

#[test]
#[should_panic(expected = "bad address")]
fn kernel_expansion_outside_window_is_fatal() {
    let bed = testbed();
    bed.pmap
        .expand(bed.pmap.kernel_space(), va(0x1000), AllocMode::Wait)
        .ok();
}

#[test]
fn destroy_releases_all_table_pages() {
    let bed = testbed();
    let s = bed.pmap.create(AccountingId(1), 0, true).unwrap();

    // Spread mappings over several leaf tables.
    for i in 0..4u64 {
        bed.pmap
            .enter(
                &s,
                va(i * 0x4000_0000),
                Frame::new(0x70 + i),
                Protection::READ_WRITE,
                MapAttributes::empty(),
                false,
            )
            .unwrap();
    }
    let pages = s.owned_table_pages();
    assert!(pages > 3);

    bed.pmap.remove(&s, va(0), va(4 * 0x4000_0000));
    let outstanding_before = bed.frames.outstanding();
    bed.pmap.destroy(&s);

    // Every index page plus the root went back to the allocator.
    assert_eq!(
        outstanding_before - bed.frames.outstanding(),
        pages as i64 + 1
    );
}
