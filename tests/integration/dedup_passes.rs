//! Dedup passes over real files.

#![cfg(unix)]

use std::collections::BTreeSet;
use std::fs;
use std::time::Duration;

use slideshow::dedup::{run_locked, Deduplicator};
use slideshow::lock::LockFile;
use tokio_util::sync::CancellationToken;

use crate::common::fixtures::{same_inode, Gallery};
use crate::common::init_test_logging;

fn dirty(ids: &[&str]) -> BTreeSet<String> {
    ids.iter().map(ToString::to_string).collect()
}

#[test]
fn test_upload_linked_to_older_copy_in_clean_collection() {
    init_test_logging();
    let gallery = Gallery::new();
    gallery.add("archive/beach.jpg", b"same sunset pixels");
    gallery.add("archive/other.jpg", b"something else entirely");
    gallery.add("uploads/beach-copy.jpg", b"same sunset pixels");

    let index = gallery.index();
    let report = Deduplicator::default().run_once(&index, &dirty(&["uploads"]), &CancellationToken::new());

    assert_eq!(report.replaced, 1);
    assert!(same_inode(
        &gallery.path("archive/beach.jpg"),
        &gallery.path("uploads/beach-copy.jpg")
    ));
    assert!(!same_inode(
        &gallery.path("archive/beach.jpg"),
        &gallery.path("archive/other.jpg")
    ));
    assert_eq!(
        fs::read(gallery.path("uploads/beach-copy.jpg")).unwrap(),
        b"same sunset pixels"
    );
}

#[test]
fn test_three_copies_converge_and_second_pass_is_noop() {
    let gallery = Gallery::new();
    for rel in ["a/x.jpg", "b/x.jpg", "c/x.jpg"] {
        gallery.add(rel, b"triplicate");
    }
    let index = gallery.index();
    let all = dirty(&["a", "b", "c"]);
    let dedup = Deduplicator::default();

    let first = dedup.run_once(&index, &all, &CancellationToken::new());
    assert_eq!(first.duplicates, 2);
    assert_eq!(first.replaced, 2);
    assert!(same_inode(&gallery.path("a/x.jpg"), &gallery.path("b/x.jpg")));
    assert!(same_inode(&gallery.path("a/x.jpg"), &gallery.path("c/x.jpg")));

    let second = dedup.run_once(&gallery.index(), &all, &CancellationToken::new());
    assert!(second.is_noop());
    assert_eq!(second.already_linked, 2);
}

#[test]
fn test_clean_gallery_hashes_nothing() {
    let gallery = Gallery::new();
    gallery.add("a/x.jpg", b"twin");
    gallery.add("b/x.jpg", b"twin");

    let report = Deduplicator::default().run_once(&gallery.index(), &BTreeSet::new(), &CancellationToken::new());
    assert_eq!(report.hashed, 0);
    assert_eq!(report.replaced, 0);
    assert!(!same_inode(&gallery.path("a/x.jpg"), &gallery.path("b/x.jpg")));
}

#[test]
fn test_pass_deferred_while_lock_held() {
    let gallery = Gallery::new();
    gallery.add("a/x.jpg", b"twin");
    gallery.add("b/x.jpg", b"twin");
    let lock = LockFile::new(gallery.storage().join("convert.lock"), Duration::from_secs(3600));
    let guard = lock.acquire("converter").unwrap();

    let dedup = Deduplicator::default();
    let index = gallery.index();
    let all = dirty(&["a", "b"]);
    let report = run_locked(&dedup, &index, &all, &lock, &CancellationToken::new()).unwrap();
    assert!(report.is_none());
    assert!(!same_inode(&gallery.path("a/x.jpg"), &gallery.path("b/x.jpg")));

    drop(guard);
    let report = run_locked(&dedup, &index, &all, &lock, &CancellationToken::new())
        .unwrap()
        .expect("lock is free");
    assert_eq!(report.replaced, 1);
    assert!(!lock.is_held(), "lock released after the pass");
}
