//! Device queue behavior across index changes, restarts and threads.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use slideshow::config::Settings;
use slideshow::durations::{DurationCache, DurationProbe};
use slideshow::media::SharedIndex;
use slideshow::queue::{DeviceQueueManager, NextMedia, SettingsUpdate};

use crate::common::fixtures::Gallery;
use crate::common::init_test_logging;

fn next_key(manager: &DeviceQueueManager, device: &str) -> String {
    match manager.get_next(device).expect("get_next failed") {
        NextMedia::Ready(item) => item.entry.key.to_string(),
        NextMedia::NoMediaAvailable => panic!("expected media for {device}"),
    }
}

fn sequential(manager: &DeviceQueueManager, device: &str) {
    manager
        .update_settings(
            device,
            SettingsUpdate {
                sequential_mode: Some(true),
                ..SettingsUpdate::default()
            },
        )
        .expect("update_settings failed");
}

fn manager(gallery: &Gallery) -> (DeviceQueueManager, SharedIndex) {
    let index = gallery.shared_index();
    (DeviceQueueManager::new(gallery.store(), index.clone()), index)
}

#[test]
fn test_sequential_appends_new_uploads_after_current_position() {
    init_test_logging();
    let gallery = Gallery::new();
    gallery.add_unique(&["trip/a.jpg", "trip/b.jpg", "trip/c.jpg"]);
    let (queues, index) = manager(&gallery);
    sequential(&queues, "kitchen");

    assert_eq!(next_key(&queues, "kitchen"), "trip/a.jpg");

    gallery.add_unique(&["trip/k1.jpg", "trip/k2.jpg"]);
    gallery.refresh(&index);
    queues.rebuild_all().unwrap();

    let rest: Vec<_> = (0..4).map(|_| next_key(&queues, "kitchen")).collect();
    assert_eq!(rest, vec!["trip/b.jpg", "trip/c.jpg", "trip/k1.jpg", "trip/k2.jpg"]);
}

#[test]
fn test_sequential_appends_across_collections_in_collection_order() {
    let gallery = Gallery::new();
    gallery.add_unique(&["b/1.jpg"]);
    let (queues, index) = manager(&gallery);
    sequential(&queues, "hall");
    assert_eq!(next_key(&queues, "hall"), "b/1.jpg");

    gallery.add_unique(&["c/9.jpg", "a/5.jpg", "b/2.jpg"]);
    gallery.refresh(&index);
    queues.rebuild("hall").unwrap();

    let rest: Vec<_> = (0..3).map(|_| next_key(&queues, "hall")).collect();
    assert_eq!(rest, vec!["a/5.jpg", "b/2.jpg", "c/9.jpg"]);
}

#[test]
fn test_deleted_media_never_served_after_rebuild() {
    let gallery = Gallery::new();
    gallery.add_unique(&["pets/cat.jpg", "pets/dog.jpg", "pets/fish.jpg"]);
    let (queues, index) = manager(&gallery);
    queues.get_next("tv").unwrap();

    gallery.remove("pets/dog.jpg");
    gallery.refresh(&index);
    queues.rebuild_all().unwrap();

    for _ in 0..12 {
        assert_ne!(next_key(&queues, "tv"), "pets/dog.jpg");
    }
}

#[test]
fn test_vanished_media_skipped_without_rebuild() {
    let gallery = Gallery::new();
    gallery.add_unique(&["pets/cat.jpg", "pets/dog.jpg"]);
    let (queues, index) = manager(&gallery);
    sequential(&queues, "tv");

    gallery.remove("pets/cat.jpg");
    gallery.refresh(&index);
    assert_eq!(next_key(&queues, "tv"), "pets/dog.jpg");
}

#[test]
fn test_restart_resumes_at_persisted_cursor() {
    init_test_logging();
    let gallery = Gallery::new();
    gallery.add_unique(&["x/1.jpg", "x/2.jpg", "x/3.jpg", "x/4.jpg", "x/5.jpg"]);

    let first: Vec<_> = {
        let (queues, _) = manager(&gallery);
        (0..2).map(|_| next_key(&queues, "ipad")).collect()
    };

    let (queues, _) = manager(&gallery);
    let rest: Vec<_> = (0..3).map(|_| next_key(&queues, "ipad")).collect();

    let played: BTreeSet<_> = first.iter().chain(rest.iter()).cloned().collect();
    assert_eq!(played.len(), 5, "no repeats before the cycle ends: {first:?} {rest:?}");
}

#[test]
fn test_shuffle_cycle_plays_each_item_once() {
    let gallery = Gallery::new();
    let names: Vec<String> = (0..20).map(|i| format!("all/{i:02}.jpg")).collect();
    for name in &names {
        gallery.add(name, name.as_bytes());
    }
    let (queues, _) = manager(&gallery);

    let cycle: BTreeSet<_> = (0..20).map(|_| next_key(&queues, "tv")).collect();
    assert_eq!(cycle.len(), 20);
}

#[test]
fn test_selection_limits_candidates() {
    let gallery = Gallery::new();
    gallery.add_unique(&["a/1.jpg", "a/2.jpg", "b/3.jpg"]);
    let (queues, _) = manager(&gallery);

    queues
        .set_collections("tv", Some(["b".to_string()].into()))
        .unwrap();
    for _ in 0..4 {
        assert_eq!(next_key(&queues, "tv"), "b/3.jpg");
    }

    queues.set_collections("tv", None).unwrap();
    let all: BTreeSet<_> = (0..3).map(|_| next_key(&queues, "tv")).collect();
    assert_eq!(all.len(), 3);
}

#[test]
fn test_default_collections_apply_to_devices_without_own_selection() {
    let gallery = Gallery::new();
    gallery.add_unique(&["a/1.jpg", "b/2.jpg"]);
    let (queues, _) = manager(&gallery);
    queues
        .set_collections("picky", Some(["b".to_string()].into()))
        .unwrap();
    queues.get_next("follower").unwrap();

    queues
        .set_default_collections(["a".to_string()].into())
        .unwrap();

    for _ in 0..3 {
        assert_eq!(next_key(&queues, "follower"), "a/1.jpg");
        assert_eq!(next_key(&queues, "picky"), "b/2.jpg");
    }

    queues.set_default_collections(BTreeSet::new()).unwrap();
    let all: BTreeSet<_> = (0..2).map(|_| next_key(&queues, "follower")).collect();
    assert_eq!(all.len(), 2);
}

#[test]
fn test_defaults_survive_restart() {
    let gallery = Gallery::new();
    gallery.add_unique(&["a/1.jpg", "b/2.jpg"]);
    {
        let (queues, _) = manager(&gallery);
        queues.set_default_collections(["b".to_string()].into()).unwrap();
    }
    let (queues, _) = manager(&gallery);
    assert_eq!(queues.default_collections(), ["b".to_string()].into());
    assert_eq!(next_key(&queues, "new-device"), "b/2.jpg");
}

#[test]
fn test_empty_gallery_is_no_media() {
    let gallery = Gallery::new();
    let (queues, _) = manager(&gallery);
    assert_eq!(queues.get_next("tv").unwrap(), NextMedia::NoMediaAvailable);
}

#[test]
fn test_concurrent_devices_keep_independent_cycles() {
    init_test_logging();
    let gallery = Gallery::new();
    let names: Vec<String> = (0..10).map(|i| format!("c/{i}.jpg")).collect();
    for name in &names {
        gallery.add(name, name.as_bytes());
    }
    let (queues, _) = manager(&gallery);
    let queues = Arc::new(queues);

    let handles: Vec<_> = (0..4)
        .map(|d| {
            let queues = Arc::clone(&queues);
            thread::spawn(move || {
                let device = format!("device-{d}");
                (0..30).map(|_| next_key(&queues, &device)).collect::<Vec<_>>()
            })
        })
        .collect();

    for handle in handles {
        let played = handle.join().unwrap();
        for cycle in played.chunks(10) {
            let unique: BTreeSet<_> = cycle.iter().collect();
            assert_eq!(unique.len(), 10, "each cycle plays every item once");
        }
    }
}

#[test]
fn test_same_device_from_many_threads_never_double_serves() {
    let gallery = Gallery::new();
    let names: Vec<String> = (0..10).map(|i| format!("c/{i}.jpg")).collect();
    for name in &names {
        gallery.add(name, name.as_bytes());
    }
    let (queues, _) = manager(&gallery);
    let queues = Arc::new(queues);
    queues.get_next("shared").unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let queues = Arc::clone(&queues);
            thread::spawn(move || (0..10).map(|_| next_key(&queues, "shared")).collect::<Vec<_>>())
        })
        .collect();

    let mut counts: HashMap<String, usize> = HashMap::new();
    for handle in handles {
        for key in handle.join().unwrap() {
            *counts.entry(key).or_default() += 1;
        }
    }
    // One item was served before the threads started, so 40 more handouts
    // cover four full cycles shifted by one.
    let total: usize = counts.values().sum();
    assert_eq!(total, 40);
    assert!(counts.values().all(|&n| (3..=5).contains(&n)), "{counts:?}");
}

struct FixedProbe(u64);

impl DurationProbe for FixedProbe {
    fn probe(&self, _path: &Path) -> io::Result<Duration> {
        Ok(Duration::from_secs(self.0))
    }
}

#[test]
fn test_video_display_time_is_duration_plus_padding() {
    let gallery = Gallery::new();
    gallery.add("clips/run.mp4", b"not really a video");
    let index = gallery.shared_index();
    let durations = Arc::new(DurationCache::open(gallery.store(), Arc::new(FixedProbe(42))));
    let settings = Settings {
        video_padding_seconds: 3,
        ..gallery.settings()
    };
    let queues = DeviceQueueManager::new(gallery.store(), index)
        .with_durations(durations)
        .with_timing(&settings);

    let NextMedia::Ready(item) = queues.get_next("tv").unwrap() else {
        panic!("expected the clip");
    };
    assert_eq!(item.display_seconds, 45);
}

#[test]
fn test_settings_persist_and_photo_time_floor() {
    let gallery = Gallery::new();
    gallery.add_unique(&["a/1.jpg"]);
    {
        let (queues, _) = manager(&gallery);
        queues
            .update_settings(
                "tv",
                SettingsUpdate {
                    name: Some("Living room".to_string()),
                    photo_seconds: Some(2),
                    show_names: Some(true),
                    ..SettingsUpdate::default()
                },
            )
            .unwrap();
    }
    let (queues, _) = manager(&gallery);
    let settings = queues.settings("tv").unwrap();
    assert_eq!(settings.name, "Living room");
    assert_eq!(settings.photo_seconds, 5);
    assert!(settings.show_names);
}
