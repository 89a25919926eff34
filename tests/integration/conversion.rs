//! Upload conversion through the coordinator.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use slideshow::convert::{BatchOutcome, PipelineStatus, TranscodeError, Transcoder};
use slideshow::durations::DurationProbe;
use slideshow::fsops::LocalFs;
use slideshow::lock::LockFile;
use slideshow::media::MediaKind;
use slideshow::service::Collaborators;
use slideshow::Slideshow;

use crate::common::fixtures::Gallery;
use crate::common::init_test_logging;

/// Copies bytes. While `broken` is set, fails for names containing "bad".
#[derive(Default)]
struct CopyTranscoder {
    broken: AtomicBool,
}

impl Transcoder for CopyTranscoder {
    fn transcode(
        &self,
        _kind: MediaKind,
        source: &Path,
        destination: &Path,
        progress: &dyn Fn(f32),
    ) -> Result<(), TranscodeError> {
        if self.broken.load(Ordering::SeqCst) && source.to_string_lossy().contains("bad") {
            return Err(TranscodeError::Io(io::Error::other("unsupported codec")));
        }
        fs::copy(source, destination)?;
        progress(100.0);
        Ok(())
    }
}

struct NoProbe;

impl DurationProbe for NoProbe {
    fn probe(&self, _path: &Path) -> io::Result<Duration> {
        Err(io::Error::other("no prober in tests"))
    }
}

fn open(gallery: &Gallery, transcoder: Arc<dyn Transcoder>) -> Slideshow {
    Slideshow::open_with(
        gallery.settings(),
        Collaborators {
            fs: Arc::new(LocalFs),
            transcoder,
            probe: Arc::new(NoProbe),
        },
    )
    .expect("open slideshow")
}

fn converted_names(gallery: &Gallery) -> Vec<String> {
    let mut names: Vec<_> = fs::read_dir(gallery.path("uploaded"))
        .map(|dir| {
            dir.map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .filter(|n| !n.starts_with('.'))
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

/// `YYYYMMDD_HHMMSS-` prefix.
fn has_timestamp_prefix(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() > 16
        && bytes[..8].iter().all(u8::is_ascii_digit)
        && bytes[8] == b'_'
        && bytes[9..15].iter().all(u8::is_ascii_digit)
        && bytes[15] == b'-'
}

#[test]
fn test_uploads_converted_indexed_and_queued() {
    init_test_logging();
    let gallery = Gallery::new();
    gallery.add_unique(&["old/a.jpg"]);
    gallery.add("uploaded_raw/IMG_0001.png", b"png bytes");
    gallery.add("uploaded_raw/clip.mov", b"mov bytes");
    let app = open(&gallery, Arc::new(CopyTranscoder::default()));
    assert!(!app.index().has_collection("uploaded_raw"), "raw area is never indexed");
    app.next_for("tv").unwrap();

    let BatchOutcome::Finished(report) = app.convert_now(false).unwrap() else {
        panic!("expected a finished batch");
    };
    assert_eq!(report.converted, 2);
    assert_eq!(report.failed, 0);

    let names = converted_names(&gallery);
    assert_eq!(names.len(), 2);
    assert!(names.iter().all(|n| has_timestamp_prefix(n)), "{names:?}");
    assert!(names.iter().any(|n| n.ends_with("-IMG_0001.jpg")));
    assert!(names.iter().any(|n| n.ends_with("-clip.mp4")));
    assert_eq!(fs::read_dir(gallery.path("uploaded_raw")).unwrap().count(), 0);

    // Completion hook refreshed the index.
    assert_eq!(app.index().entries("uploaded").len(), 2);
    assert_eq!(app.converter().status().status, PipelineStatus::Done);

    // ...and rebuilt the device queue around the new files.
    let played: Vec<String> = (0..3)
        .filter_map(|_| app.next_for("tv").unwrap().key().map(ToString::to_string))
        .collect();
    assert_eq!(played.iter().filter(|k| k.starts_with("uploaded/")).count(), 2, "{played:?}");
}

#[test]
fn test_failed_upload_kept_and_retried() {
    let gallery = Gallery::new();
    gallery.add("uploaded_raw/bad.jpg", b"broken");
    gallery.add("uploaded_raw/good.jpg", b"fine");
    let transcoder = Arc::new(CopyTranscoder::default());
    transcoder.broken.store(true, Ordering::SeqCst);
    let app = open(&gallery, Arc::clone(&transcoder) as Arc<dyn Transcoder>);

    let BatchOutcome::Finished(report) = app.convert_now(false).unwrap() else {
        panic!("expected a finished batch");
    };
    assert_eq!((report.converted, report.failed), (1, 1));
    assert!(gallery.path("uploaded_raw/bad.jpg").exists());
    assert_eq!(app.converter().failed(), vec!["bad.jpg".to_string()]);
    let status = app.converter().status();
    assert_eq!(status.errors.len(), 1);
    assert_eq!(status.errors[0].filename, "bad.jpg");

    // Parked failures are not retried by a plain run.
    assert!(matches!(app.convert_now(false).unwrap(), BatchOutcome::Empty));

    transcoder.broken.store(false, Ordering::SeqCst);
    let BatchOutcome::Finished(report) = app.convert_now(true).unwrap() else {
        panic!("expected the retry to run");
    };
    assert_eq!(report.converted, 1);
    assert!(!gallery.path("uploaded_raw/bad.jpg").exists());
    assert!(app.converter().failed().is_empty());
}

#[test]
fn test_conversion_deferred_while_lock_held() {
    let gallery = Gallery::new();
    gallery.add("uploaded_raw/a.jpg", b"x");
    let app = open(&gallery, Arc::new(CopyTranscoder::default()));
    let settings = app.settings().clone();
    let lock = LockFile::new(settings.lock_path(), settings.lock_stale_after());
    let _guard = lock.acquire("dedup").unwrap();

    let outcome = app.convert_now(false).unwrap();
    let BatchOutcome::Busy(Some(holder)) = &outcome else {
        panic!("expected busy, got {outcome:?}");
    };
    assert_eq!(holder.holder, "dedup");
    assert!(gallery.path("uploaded_raw/a.jpg").exists());
}

#[test]
fn test_real_image_conversion_bounds_resolution() {
    let gallery = Gallery::new();
    gallery.add_image("uploaded_raw/panorama.png", 5000, 1000);
    let app = Slideshow::open_with(gallery.settings(), Collaborators::default()).unwrap();

    let BatchOutcome::Finished(report) = app.convert_now(false).unwrap() else {
        panic!("expected a finished batch");
    };
    assert_eq!(report.converted, 1);

    let names = converted_names(&gallery);
    assert_eq!(names.len(), 1);
    assert!(names[0].ends_with("-panorama.jpg"));
    let (width, height) = image::image_dimensions(gallery.path("uploaded").join(&names[0])).unwrap();
    assert_eq!((width, height), (3840, 768));
}
