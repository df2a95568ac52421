mod common;

use common::{
    authenticated, first_page, fresh_card, open, payload, CountingCard, FailingCard, RAW_PAGE_LEN,
};
use std::ops::Range;

use memcard::{AuthPort, AuthRequest, BlockAdapter, Error, ImageCard, Problem, Session};
use tempfile::tempdir;

#[test]
fn single_bit_flips_are_corrected() {
    let mut session = authenticated(fresh_card());
    session.write_file("/SAVE", &payload(600)).expect("write");
    let page = first_page(&mut session, "/SAVE") as usize;

    session.device_mut().bytes_mut()[page * RAW_PAGE_LEN + 5] ^= 0x20;
    assert_eq!(session.read_file("/SAVE").expect("read"), payload(600));
    assert_eq!(session.soft_errors(), 1);
}

#[test]
fn uncorrectable_pages_fail_extract_without_output() {
    let dir = tempdir().expect("temp dir");
    let destination = dir.path().join("save.bin");
    let mut session = authenticated(fresh_card());
    session.write_file("/SAVE", &payload(600)).expect("write");
    let page = first_page(&mut session, "/SAVE") as usize;

    let bytes = session.device_mut().bytes_mut();
    bytes[page * RAW_PAGE_LEN + 3] ^= 0x01;
    bytes[page * RAW_PAGE_LEN + 90] ^= 0x10;

    assert!(matches!(
        session.extract("/SAVE", &destination),
        Err(Error::Media { page: Some(p), .. }) if p as usize == page
    ));
    assert!(!destination.exists());
    assert_eq!(session.open_handles(), 0);
}

#[test]
fn failed_writes_keep_the_old_contents() {
    let card = FailingCard {
        inner: fresh_card(),
        allowed: usize::MAX,
    };
    let mut session = Session::open(card, &common::config()).expect("open");
    session.authenticate().expect("authenticate");
    session.write_file("/OLD", &payload(100)).expect("write");

    session.device_mut().allowed = 0;
    assert!(matches!(
        session.write_file("/OLD", &payload(5000)),
        Err(Error::Media { .. })
    ));
    assert_eq!(session.open_handles(), 0);

    session.device_mut().allowed = usize::MAX;
    assert_eq!(session.read_file("/OLD").expect("read"), payload(100));
}

#[test]
fn dump_and_restore_round_trip() {
    let mut session = authenticated(fresh_card());
    session.mkdir("/KEEP").expect("mkdir");
    session.write_file("/KEEP/DATA", &payload(3000)).expect("write");

    let mut dump = Vec::new();
    let pages = session.dump(&mut dump).expect("dump");
    assert_eq!(dump.len(), pages as usize * RAW_PAGE_LEN);
    assert_eq!(dump, session.device().as_bytes());

    session.remove("/KEEP/DATA").expect("remove");
    session.rmdir("/KEEP").expect("rmdir");
    session.restore(dump.as_slice()).expect("restore");

    assert_eq!(session.read_file("/KEEP/DATA").expect("read"), payload(3000));
    assert!(session.check().expect("check").is_clean());
}

#[test]
fn restore_rejects_a_truncated_dump() {
    let mut session = Session::open(CountingCard::new(fresh_card()), &common::config())
        .expect("open");
    session.authenticate().expect("authenticate");
    let mut dump = Vec::new();
    session.dump(&mut dump).expect("dump");
    dump.truncate(dump.len() - 1);

    assert!(matches!(session.restore(dump.as_slice()), Err(Error::Format(_))));
    assert_eq!(session.device().erases, 0);
}

#[test]
fn erased_card_no_longer_mounts() {
    let mut session = authenticated(fresh_card());
    session.erase_card().expect("erase");
    let card = session.into_device();
    assert!(matches!(
        Session::open(card, &common::config()),
        Err(Error::Format(_))
    ));
}

/// Refuses writes to a range of pages, and to `fail_once` the first time
/// it is written.
struct GuardedCard {
    inner: ImageCard,
    guarded: Range<u32>,
    fail_once: Option<u32>,
}

impl GuardedCard {
    fn new(inner: ImageCard) -> Self {
        Self {
            inner,
            guarded: 0..0,
            fail_once: None,
        }
    }
}

impl BlockAdapter for GuardedCard {
    fn read_page(&mut self, page: u32) -> memcard::Result<Vec<u8>> {
        self.inner.read_page(page)
    }

    fn write_page(&mut self, page: u32, raw: &[u8]) -> memcard::Result<()> {
        if self.guarded.contains(&page) || self.fail_once == Some(page) {
            if self.fail_once == Some(page) {
                self.fail_once = None;
            }
            return Err(Error::Media {
                page: Some(page),
                reason: "write protected".to_string(),
            });
        }
        self.inner.write_page(page, raw)
    }

    fn erase_block(&mut self, block: u32) -> memcard::Result<()> {
        self.inner.erase_block(block)
    }
}

impl AuthPort for GuardedCard {
    fn exchange(&mut self, request: AuthRequest) -> memcard::Result<Option<[u8; 8]>> {
        self.inner.exchange(request)
    }
}

#[test]
fn commit_failing_at_the_record_leaves_lost_clusters() {
    let mut config = common::config();
    config.io.erase_before_write = false;
    let card = GuardedCard::new(fresh_card());
    let mut session = Session::open(card, &config).expect("open");
    session.authenticate().expect("authenticate");
    session.write_file("/SAVE", &payload(100)).expect("write");

    let superblock = session.superblock();
    let root_page = (superblock.alloc_offset + superblock.rootdir_cluster)
        * u32::from(superblock.pages_per_cluster);
    // The root directory grew to two clusters when SAVE was created.
    session.device_mut().guarded = root_page..root_page + 4;
    assert!(matches!(
        session.write_file("/SAVE", &payload(5000)),
        Err(Error::Media { .. })
    ));

    session.device_mut().guarded = 0..0;
    assert_eq!(session.read_file("/SAVE").expect("read"), payload(100));
    let report = session.check().expect("check");
    let lost = report
        .problems
        .iter()
        .filter(|problem| matches!(problem, Problem::LostCluster { .. }))
        .count();
    assert_eq!(lost, 5, "{:?}", report.problems);
}

#[test]
fn opened_card_keeps_its_contents() {
    let mut session = open(fresh_card());
    assert_eq!(session.soft_errors(), 0);
    assert!(session.check().expect("check").is_clean());
}

#[test]
fn failed_block_rewrite_keeps_neighbouring_clusters() {
    let mut session = Session::open(GuardedCard::new(fresh_card()), &common::config())
        .expect("open");
    session.authenticate().expect("authenticate");
    session.write_file("/T", b"temporary").expect("write T");
    session.mkdir("/A").expect("mkdir");
    session.write_file("/A/K", b"keep").expect("write K");
    let reused = first_page(&mut session, "/T");
    session.remove("/T").expect("remove T");

    // U's data lands in T's old cluster, in the same erase block as /A.
    session.device_mut().fail_once = Some(reused);
    assert!(matches!(
        session.write_file("/U", b"new"),
        Err(Error::Media { page: Some(p), .. }) if p == reused
    ));

    assert_eq!(session.read_file("/A/K").expect("read K"), b"keep");
    assert_eq!(session.list("/A").expect("list").len(), 1);
    assert!(session.check().expect("check").is_clean());
}

#[test]
fn damaged_directory_is_an_error_not_an_empty_listing() {
    let mut session = authenticated(fresh_card());
    session.mkdir("/A").expect("mkdir");
    session.write_file("/A/K", b"keep").expect("write K");
    let cluster = session.resolve("/A").expect("resolve").entry.cluster;
    let superblock = session.superblock();
    let dir_page =
        ((superblock.alloc_offset + cluster) * u32::from(superblock.pages_per_cluster)) as usize;

    let bytes = session.device_mut().bytes_mut();
    bytes[dir_page * RAW_PAGE_LEN..(dir_page + 2) * RAW_PAGE_LEN].fill(0xFF);

    assert!(matches!(session.list("/A"), Err(Error::CorruptChain { .. })));
    assert!(matches!(session.read_file("/A/K"), Err(Error::CorruptChain { .. })));
    let report = session.check().expect("check");
    assert!(report
        .problems
        .iter()
        .any(|problem| matches!(problem, Problem::BrokenChain { path, .. } if path == "/A")));
}
