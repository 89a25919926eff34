//! Snapshot files on disk.

use std::fs;

use slideshow::SlideError;
use slideshow::media::MediaKey;
use slideshow::persist::{MAGIC, SnapshotStore};
use slideshow::queue::{DeviceQueueManager, DeviceRecord, NextMedia};

use crate::common::fixtures::Gallery;
use crate::common::init_test_logging;

fn manager(gallery: &Gallery) -> DeviceQueueManager {
    DeviceQueueManager::new(gallery.store(), gallery.shared_index())
}

#[test]
fn test_device_snapshot_written_atomically() {
    init_test_logging();
    let gallery = Gallery::new();
    gallery.add_unique(&["a/1.jpg", "a/2.jpg"]);
    let queues = manager(&gallery);
    for _ in 0..5 {
        queues.get_next("kiosk").unwrap();
    }

    let path = gallery.store().path_for("device_kiosk");
    let bytes = fs::read(&path).unwrap();
    assert_eq!(&bytes[..4], MAGIC);

    let leftovers: Vec<_> = fs::read_dir(gallery.storage())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| !name.ends_with(".snap"))
        .collect();
    assert!(leftovers.is_empty(), "temp files left behind: {leftovers:?}");
}

#[test]
fn test_persisted_cursor_matches_handed_out_items() {
    let gallery = Gallery::new();
    gallery.add_unique(&["a/1.jpg", "a/2.jpg", "a/3.jpg"]);
    let queues = manager(&gallery);
    let NextMedia::Ready(item) = queues.get_next("kiosk").unwrap() else {
        panic!("expected media");
    };

    let record: DeviceRecord = gallery.store().load("device_kiosk").unwrap().unwrap();
    assert_eq!(record.device_id, "kiosk");
    assert_eq!(record.queue.cursor, 1);
    assert_eq!(record.queue.order[0], item.entry.key);
    assert_eq!(record.queue.order.len(), 3);
}

#[test]
fn test_corrupt_device_snapshot_starts_over() {
    init_test_logging();
    let gallery = Gallery::new();
    gallery.add_unique(&["a/1.jpg"]);
    let store = gallery.store();
    fs::write(store.path_for("device_kiosk"), b"definitely not a snapshot").unwrap();

    let queues = manager(&gallery);
    let next = queues.get_next("kiosk").unwrap();
    assert_eq!(next.key(), Some(&MediaKey::new("a/1.jpg")));

    let bytes = fs::read(store.path_for("device_kiosk")).unwrap();
    assert_eq!(&bytes[..4], MAGIC, "replaced with a valid snapshot");
}

#[test]
fn test_future_schema_version_is_reported() {
    let gallery = Gallery::new();
    let store = SnapshotStore::open(gallery.storage()).unwrap();
    let mut bytes = MAGIC.to_vec();
    bytes.extend_from_slice(&99u16.to_le_bytes());
    bytes.extend_from_slice(&[0x80]);
    fs::write(store.path_for("device_kiosk"), bytes).unwrap();

    let err = store.load::<DeviceRecord>("device_kiosk").unwrap_err();
    assert!(matches!(err, SlideError::SnapshotVersion { found: 99, .. }));
}

#[test]
fn test_device_ids_survive_restart_and_delete_removes_file() {
    let gallery = Gallery::new();
    gallery.add_unique(&["a/1.jpg"]);
    {
        let queues = manager(&gallery);
        queues.get_next("alpha").unwrap();
        queues.get_next("beta").unwrap();
    }

    let queues = manager(&gallery);
    assert_eq!(queues.device_ids().unwrap(), vec!["alpha".to_string(), "beta".to_string()]);

    assert!(queues.delete_device("alpha").unwrap());
    assert!(!gallery.store().path_for("device_alpha").exists());
    assert_eq!(queues.device_ids().unwrap(), vec!["beta".to_string()]);
}

#[test]
fn test_invalid_device_id_never_touches_disk() {
    let gallery = Gallery::new();
    let queues = manager(&gallery);
    let err = queues.get_next("../escape").unwrap_err();
    assert!(matches!(err, SlideError::InvalidDeviceId { .. }));
    assert_eq!(fs::read_dir(gallery.storage()).unwrap().count(), 0);
}
