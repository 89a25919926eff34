//! Change signals, background workers and the shared lock file.

use std::time::Duration;

use slideshow::lock::LockFile;
use slideshow::queue::NextMedia;
use slideshow::{ChangeKind, Slideshow};

use crate::common::fixtures::Gallery;
use crate::common::init_test_logging;

fn total(app: &Slideshow, device: &str) -> usize {
    match app.next_for(device).unwrap() {
        NextMedia::Ready(item) => item.total,
        NextMedia::NoMediaAvailable => 0,
    }
}

#[test]
fn test_change_rebuilds_queues_unless_lock_held() {
    init_test_logging();
    let gallery = Gallery::new();
    gallery.add_unique(&["a/1.jpg", "a/2.jpg"]);
    let app = Slideshow::open(gallery.settings()).unwrap();
    assert_eq!(total(&app, "tv"), 2);

    gallery.add_unique(&["a/3.jpg"]);
    let settings = app.settings().clone();
    let lock = LockFile::new(settings.lock_path(), settings.lock_stale_after());
    let guard = lock.acquire("converter").unwrap();
    app.handle_change("a", ChangeKind::Created).unwrap();
    assert!(app.index().contains(&"a/3.jpg".into()), "index still refreshed");
    assert_eq!(total(&app, "tv"), 2, "queue left alone while files are in flux");

    drop(guard);
    app.handle_change("a", ChangeKind::Created).unwrap();
    assert_eq!(total(&app, "tv"), 3);
}

#[test]
fn test_raw_area_signal_leaves_index_alone() {
    let gallery = Gallery::new();
    gallery.add_unique(&["a/1.jpg"]);
    let app = Slideshow::open(gallery.settings()).unwrap();
    gallery.add("uploaded_raw/new.jpg", b"raw");

    app.handle_change("uploaded_raw", ChangeKind::Created).unwrap();
    assert_eq!(app.index().len(), 1);
    assert!(!app.index().has_collection("uploaded_raw"));
}

#[test]
fn test_missing_media_root_rejected() {
    let gallery = Gallery::new();
    let mut settings = gallery.settings();
    settings.media_root = gallery.dir.path().join("nope");
    let err = Slideshow::open(settings).unwrap_err();
    assert!(err.to_string().contains("not found"), "{err}");
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_background_workers_dedup_and_convert_on_startup() {
    use crate::common::fixtures::same_inode;

    init_test_logging();
    let gallery = Gallery::new();
    gallery.add("a/x.jpg", b"twin bytes");
    gallery.add("b/x.jpg", b"twin bytes");
    gallery.add_image("uploaded_raw/shot.png", 8, 8);

    let mut app = Slideshow::open(gallery.settings()).unwrap();
    let mut passes = {
        app.start_background();
        app.scheduler().expect("scheduler running").subscribe()
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let linked = same_inode(&gallery.path("a/x.jpg"), &gallery.path("b/x.jpg"));
        let converted = gallery.path("uploaded").is_dir() && !gallery.path("uploaded_raw/shot.png").exists();
        if linked && converted {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "background work did not finish");
        tokio::select! {
            _ = passes.changed() => {}
            () = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    app.shutdown().await;
}
