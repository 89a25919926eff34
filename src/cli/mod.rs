//! CLI argument definitions.

use std::collections::BTreeSet;
use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use tracing::debug;

use crate::config::Settings;
use crate::error::Result;
use crate::queue::SettingsUpdate;

/// Slideshow core - per-device queues, hardlink dedup and upload conversion.
///
/// Use --json for machine-parseable output.
#[derive(Parser, Debug)]
#[command(name = "slideshow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Emit JSON instead of text (logs become JSON lines too)
    #[arg(long, global = true, env = "SLIDESHOW_JSON")]
    pub json: bool,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(long, short = 'v', global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Only log errors
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Settings file (TOML)
    #[arg(long, global = true, env = "SLIDESHOW_CONFIG", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Media root holding the collections
    #[arg(long, global = true, env = "SLIDESHOW_MEDIA_DIR", value_name = "DIR")]
    pub media_dir: Option<PathBuf>,

    /// Directory for snapshots and the lock file
    #[arg(long, global = true, env = "SLIDESHOW_STORAGE_DIR", value_name = "DIR")]
    pub storage_dir: Option<PathBuf>,

    /// Debug mode: shortens the dedup idle window to 10 seconds
    #[arg(long, global = true, env = "SLIDESHOW_DEBUG")]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Settings from the config file (if any) with flag overrides applied.
    pub fn settings(&self) -> Result<Settings> {
        let settings = match &self.config {
            Some(path) => Settings::load(path)?,
            None => {
                debug!("No settings file, using defaults");
                Settings::default()
            }
        };
        Ok(settings.with_overrides(self.media_dir.clone(), self.storage_dir.clone(), self.debug))
    }
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Scan the media root and list collections
    Scan,

    /// Run one dedup pass over every collection
    Dedup,

    /// Convert everything waiting in the raw upload area
    Convert(ConvertArgs),

    /// Hand out the next media item for a device
    Next(NextArgs),

    /// Show or set a device's active collections
    Collections(CollectionsArgs),

    /// Show or set the default collection selection
    Defaults(DefaultsArgs),

    /// Show or change a device's settings
    Device(DeviceArgs),

    /// Run the background workers, reading change signals from stdin
    ///
    /// Each line is `<collection> <created|deleted|modified>`. Stops on Ctrl-C
    /// or when stdin closes.
    Watch,

    /// Show version and build information
    Version,

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Parser, Debug)]
pub struct ConvertArgs {
    /// Give previously failed uploads another try
    #[arg(long)]
    pub retry_failed: bool,
}

#[derive(Parser, Debug)]
pub struct NextArgs {
    /// Device id
    pub device: String,

    /// How many items to hand out
    #[arg(long, short = 'n', default_value = "1")]
    pub count: usize,
}

#[derive(Parser, Debug)]
pub struct CollectionsArgs {
    /// Device id
    pub device: String,

    /// Collections to play (omit to show the current selection)
    #[arg(value_name = "NAMES")]
    pub names: Vec<String>,

    /// Follow the default selection again
    #[arg(long, conflicts_with = "names")]
    pub use_defaults: bool,

    /// Play nothing
    #[arg(long, conflicts_with_all = ["names", "use_defaults"])]
    pub none: bool,
}

impl CollectionsArgs {
    /// Requested change, or `None` to only show.
    pub fn selection(&self) -> Option<Option<BTreeSet<String>>> {
        if self.use_defaults {
            Some(None)
        } else if self.none {
            Some(Some(BTreeSet::new()))
        } else if self.names.is_empty() {
            None
        } else {
            Some(Some(self.names.iter().cloned().collect()))
        }
    }
}

#[derive(Parser, Debug)]
pub struct DefaultsArgs {
    /// Default collections (omit to show)
    #[arg(value_name = "NAMES")]
    pub names: Vec<String>,

    /// Reset to every collection
    #[arg(long, conflicts_with = "names")]
    pub all: bool,
}

#[derive(Parser, Debug)]
pub struct DeviceArgs {
    /// Device id
    pub device: String,

    /// Friendly label
    #[arg(long)]
    pub name: Option<String>,

    /// Seconds each photo stays on screen (minimum 5)
    #[arg(long)]
    pub photo_seconds: Option<u32>,

    /// Skip videos
    #[arg(long)]
    pub only_photo: Option<bool>,

    /// Append new media at the tail instead of shuffling
    #[arg(long)]
    pub sequential: Option<bool>,

    /// Show position and total
    #[arg(long)]
    pub show_counters: Option<bool>,

    /// Show file names
    #[arg(long)]
    pub show_names: Option<bool>,

    /// Throw away the queue and start over
    #[arg(long)]
    pub clear_queue: bool,

    /// Forget the device
    #[arg(long, conflicts_with_all = ["clear_queue", "name", "photo_seconds", "only_photo", "sequential"])]
    pub delete: bool,
}

impl DeviceArgs {
    pub fn update(&self) -> SettingsUpdate {
        SettingsUpdate {
            name: self.name.clone(),
            photo_seconds: self.photo_seconds,
            only_photo: self.only_photo,
            sequential_mode: self.sequential,
            show_counters: self.show_counters,
            show_names: self.show_names,
            ..SettingsUpdate::default()
        }
    }
}

#[derive(Parser, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}
