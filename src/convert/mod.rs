//! Converter Pipeline: normalizes raw uploads into the library.
//!
//! Raw files land in the holding area, are queued in a persisted
//! [`ConversionQueue`], and are converted one at a time by
//! [`ConverterPipeline`] under the same lock file as the deduplicator.
//! [`ConverterWatchdog`] turns bursts of upload signals into one batch.

mod job;
mod pipeline;
mod progress;
mod queue;
mod transcoder;
mod watchdog;

pub use job::{ConversionJob, JobStatus};
pub use pipeline::{
    BatchOutcome, BatchReport, CompletionHook, ConverterPipeline, StartOutcome, LOCK_HOLDER,
};
pub use progress::{
    ConversionError, ConversionStatus, CurrentFile, PipelineStatus, StatusBoard, MAX_ERRORS,
};
pub use queue::{ConversionQueue, QueueItem};
pub use transcoder::{
    output_extension, output_file_name, unique_destination, MediaTranscoder, TranscodeError,
    Transcoder, JPEG_QUALITY, MAX_HEIGHT, MAX_WIDTH,
};
pub use watchdog::ConverterWatchdog;
