//! Turning one raw upload into a library file.

use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Local, NaiveDateTime};
use exif::{In, Tag, Value};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::GenericImageView;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, instrument, trace};

use crate::durations::{DurationProbe, FfprobeProbe};
use crate::media::MediaKind;

/// Largest image size kept in the library.
pub const MAX_WIDTH: u32 = 3840;
pub const MAX_HEIGHT: u32 = 2160;
pub const JPEG_QUALITY: u8 = 60;

/// Bytes of ffmpeg stderr kept for the error message.
const STDERR_TAIL: usize = 4096;

/// Arguments passed to ffmpeg between input and output.
const FFMPEG_VIDEO_ARGS: &[&str] = &[
    "-c:v", "libx264", "-preset", "medium", "-crf", "30", "-profile:v", "high", "-level:v", "4.0",
    "-pix_fmt", "yuv420p", "-movflags", "faststart", "-c:a", "aac", "-b:a", "128k",
    "-map_metadata", "-1",
];

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("{program} exited with {status}: {stderr}")]
    Tool {
        program: String,
        status: String,
        stderr: String,
    },
}

/// Converts one file. Implementations report progress as 0..=100 percent.
pub trait Transcoder: Send + Sync {
    fn transcode(
        &self,
        kind: MediaKind,
        source: &Path,
        destination: &Path,
        progress: &dyn Fn(f32),
    ) -> Result<(), TranscodeError>;

    /// When the source was shot, if its metadata says so.
    fn capture_time(&self, _kind: MediaKind, _source: &Path) -> Option<DateTime<Local>> {
        None
    }
}

/// Extension of the converted file.
pub const fn output_extension(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Image => "jpg",
        MediaKind::Video => "mp4",
    }
}

/// `YYYYMMDD_HHMMSS-<stem>.<ext>`, stamped with the capture time or, failing
/// that, the source's modification time.
pub fn output_file_name(source: &Path, taken: DateTime<Local>, kind: MediaKind) -> String {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());
    format!(
        "{}-{stem}.{}",
        taken.format("%Y%m%d_%H%M%S"),
        output_extension(kind)
    )
}

/// First free path for `name` in `dir`, adding `-1`, `-2`, ... to the stem.
pub fn unique_destination(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = name.rsplit_once('.').unwrap_or((name, ""));
    (1u32..)
        .map(|n| {
            if ext.is_empty() {
                dir.join(format!("{stem}-{n}"))
            } else {
                dir.join(format!("{stem}-{n}.{ext}"))
            }
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

/// Images through the `image` crate, videos through `ffmpeg`.
pub struct MediaTranscoder {
    ffmpeg: PathBuf,
    probe: Arc<dyn DurationProbe>,
}

impl std::fmt::Debug for MediaTranscoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTranscoder")
            .field("ffmpeg", &self.ffmpeg)
            .finish_non_exhaustive()
    }
}

impl Default for MediaTranscoder {
    fn default() -> Self {
        Self::new(PathBuf::from("ffmpeg"), Arc::new(FfprobeProbe::default()))
    }
}

impl MediaTranscoder {
    pub fn new(ffmpeg: PathBuf, probe: Arc<dyn DurationProbe>) -> Self {
        Self { ffmpeg, probe }
    }

    /// Re-encode pixels only, so no source metadata survives.
    #[instrument(skip_all, fields(source = %source.display()))]
    fn convert_image(source: &Path, destination: &Path, progress: &dyn Fn(f32)) -> Result<(), TranscodeError> {
        let img = image::open(source)?;
        let (width, height) = img.dimensions();
        progress(30.0);
        let img = if width > MAX_WIDTH || height > MAX_HEIGHT {
            let resized = img.resize(MAX_WIDTH, MAX_HEIGHT, FilterType::Lanczos3);
            info!(
                width,
                height,
                new_width = resized.width(),
                new_height = resized.height(),
                "Resized image"
            );
            resized
        } else {
            img
        };
        let rgb = img.to_rgb8();
        progress(70.0);

        let dir = destination.parent().unwrap_or_else(|| Path::new("."));
        let staging = NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(staging.as_file());
            JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY).encode_image(&rgb)?;
            writer.flush()?;
        }
        staging.as_file().sync_all()?;
        staging.persist(destination).map_err(|e| e.error)?;
        progress(100.0);
        Ok(())
    }

    #[instrument(skip_all, fields(source = %source.display()))]
    fn convert_video(&self, source: &Path, destination: &Path, progress: &dyn Fn(f32)) -> Result<(), TranscodeError> {
        let total_us = self
            .probe
            .probe(source)
            .map(|d| d.as_micros())
            .unwrap_or_default();
        let staging = staging_path(destination);

        let mut child = Command::new(&self.ffmpeg)
            .args(["-y", "-nostdin", "-loglevel", "error", "-progress", "pipe:1", "-nostats", "-i"])
            .arg(source)
            .args(FFMPEG_VIDEO_ARGS)
            .arg(&staging)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Drained concurrently so a chatty ffmpeg never blocks on a full pipe.
        let stderr = match child.stderr.take().map(spawn_stderr_reader).transpose() {
            Ok(reader) => reader,
            Err(e) => {
                abandon(&mut child, &staging);
                return Err(e.into());
            }
        };

        let followed = child
            .stdout
            .take()
            .map_or(Ok(()), |stdout| follow_progress(stdout, total_us, progress));
        if let Err(e) = followed {
            abandon(&mut child, &staging);
            return Err(e.into());
        }

        let status = match child.wait() {
            Ok(status) => status,
            Err(e) => {
                abandon(&mut child, &staging);
                return Err(e.into());
            }
        };
        let stderr = stderr.and_then(|reader| reader.join().ok()).unwrap_or_default();
        if !status.success() {
            let _ = std::fs::remove_file(&staging);
            return Err(TranscodeError::Tool {
                program: self.ffmpeg.display().to_string(),
                status: status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }
        std::fs::rename(&staging, destination)?;
        debug!(destination = %destination.display(), "Video encoded");
        progress(100.0);
        Ok(())
    }
}

/// Forward `out_time` lines from ffmpeg's `-progress` stream as percentages.
fn follow_progress(stdout: impl Read, total_us: u128, progress: &dyn Fn(f32)) -> io::Result<()> {
    for line in BufReader::new(stdout).lines() {
        let line = line?;
        trace!(line = %line, "ffmpeg progress");
        if let Some(us) = parse_out_time(&line) {
            if total_us > 0 {
                #[allow(clippy::cast_precision_loss)]
                let pct = (us as f64 / total_us as f64 * 100.0) as f32;
                progress(pct.min(99.0));
            }
        }
    }
    Ok(())
}

fn spawn_stderr_reader(pipe: impl Read + Send + 'static) -> io::Result<JoinHandle<String>> {
    thread::Builder::new()
        .name("ffmpeg-stderr".to_string())
        .spawn(move || read_tail(pipe, STDERR_TAIL))
}

/// Read `pipe` to EOF, keeping only the last `limit` bytes.
fn read_tail(mut pipe: impl Read, limit: usize) -> String {
    let mut tail = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                tail.extend_from_slice(&chunk[..n]);
                if tail.len() > limit {
                    tail.drain(..tail.len() - limit);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&tail).into_owned()
}

/// Stop a failed encode and drop its partial output.
fn abandon(child: &mut Child, staging: &Path) {
    let _ = child.kill();
    let _ = child.wait();
    let _ = std::fs::remove_file(staging);
}

/// EXIF `DateTimeOriginal`, falling back to `DateTime`, read as local time.
fn exif_capture_time(source: &Path) -> Option<DateTime<Local>> {
    let file = std::fs::File::open(source).ok()?;
    let exif = exif::Reader::new()
        .read_from_container(&mut BufReader::new(file))
        .ok()?;
    [Tag::DateTimeOriginal, Tag::DateTime].into_iter().find_map(|tag| {
        match &exif.get_field(tag, In::PRIMARY)?.value {
            Value::Ascii(parts) => parts.first().and_then(|raw| parse_exif_datetime(raw)),
            _ => None,
        }
    })
}

fn parse_exif_datetime(raw: &[u8]) -> Option<DateTime<Local>> {
    let text = std::str::from_utf8(raw).ok()?.trim_end_matches('\0').trim();
    NaiveDateTime::parse_from_str(text, "%Y:%m:%d %H:%M:%S")
        .ok()?
        .and_local_timezone(Local)
        .earliest()
}

/// Hidden partial output next to the destination; keeps the `.mp4` suffix so
/// ffmpeg picks the container from it.
fn staging_path(destination: &Path) -> PathBuf {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    destination.with_file_name(format!(".partial-{name}"))
}

/// Microseconds from an `out_time_us=` (or legacy `out_time_ms=`) line.
fn parse_out_time(line: &str) -> Option<u128> {
    let value = line
        .strip_prefix("out_time_us=")
        .or_else(|| line.strip_prefix("out_time_ms="))?;
    value.trim().parse().ok()
}

impl Transcoder for MediaTranscoder {
    fn transcode(
        &self,
        kind: MediaKind,
        source: &Path,
        destination: &Path,
        progress: &dyn Fn(f32),
    ) -> Result<(), TranscodeError> {
        match kind {
            MediaKind::Image => Self::convert_image(source, destination, progress),
            MediaKind::Video => self.convert_video(source, destination, progress),
        }
    }

    fn capture_time(&self, kind: MediaKind, source: &Path) -> Option<DateTime<Local>> {
        let taken = match kind {
            MediaKind::Image => exif_capture_time(source),
            MediaKind::Video => self
                .probe
                .creation_time(source)
                .map(|t| t.with_timezone(&Local)),
        };
        trace!(source = %source.display(), ?taken, "Capture time");
        taken
    }
}
