//! Slideshow CLI - drives the slideshow core from the command line.
#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use slideshow::cli::{self, Cli, Commands};
use slideshow::config::Settings;
use slideshow::convert::{BatchOutcome, ConversionStatus};
use slideshow::logging::init_logging;
use slideshow::queue::NextMedia;
use slideshow::{ChangeKind, Result, SlideError, Slideshow};

/// Build information embedded at compile time.
mod build_info {
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");

    pub fn git_sha() -> &'static str {
        option_env!("VERGEN_GIT_SHA").unwrap_or("unknown")
    }

    pub fn git_dirty() -> &'static str {
        option_env!("VERGEN_GIT_DIRTY").unwrap_or("false")
    }

    pub fn build_timestamp() -> &'static str {
        option_env!("VERGEN_BUILD_TIMESTAMP").unwrap_or("unknown")
    }

    pub fn rustc_semver() -> &'static str {
        option_env!("VERGEN_RUSTC_SEMVER").unwrap_or("unknown")
    }

    pub fn target() -> &'static str {
        option_env!("VERGEN_CARGO_TARGET_TRIPLE").unwrap_or("unknown")
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.json, cli.verbose, cli.quiet);

    if let Err(e) = run(&cli) {
        output_error(&cli, &e);
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Version => return cmd_version(cli),
        Commands::Completions(args) => return cmd_completions(args),
        _ => {}
    }

    let settings = cli.settings()?;
    match &cli.command {
        Commands::Scan => cmd_scan(cli, settings),
        Commands::Dedup => cmd_dedup(cli, settings),
        Commands::Convert(args) => cmd_convert(cli, settings, args),
        Commands::Next(args) => cmd_next(cli, settings, args),
        Commands::Collections(args) => cmd_collections(cli, settings, args),
        Commands::Defaults(args) => cmd_defaults(cli, settings, args),
        Commands::Device(args) => cmd_device(cli, settings, args),
        Commands::Watch => cmd_watch(cli, settings),
        Commands::Version | Commands::Completions(_) => Ok(()),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread().enable_all().build()?)
}

fn cmd_scan(cli: &Cli, settings: Settings) -> Result<()> {
    let app = Slideshow::open(settings)?;
    let index = app.index();
    let infos = index.infos();

    if cli.json {
        return output_json(&serde_json::json!({
            "root": index.root(),
            "collections": infos,
            "photos": index.photo_count(),
            "videos": index.video_count(),
            "skipped": index.skipped().len(),
        }));
    }
    for info in &infos {
        let indent = "  ".repeat(info.depth.saturating_sub(1));
        println!(
            "{indent}{:<40} {}",
            style(&info.display_path).cyan(),
            style(info.files_count).bold()
        );
    }
    if !cli.quiet {
        println!(
            "\n{} collections, {} photos, {} videos",
            infos.len(),
            index.photo_count(),
            index.video_count()
        );
        if !index.skipped().is_empty() {
            println!("{} {} unreadable entries skipped", style("!").yellow(), index.skipped().len());
        }
    }
    Ok(())
}

fn cmd_dedup(cli: &Cli, settings: Settings) -> Result<()> {
    let app = Slideshow::open(settings)?;
    let report = app.dedup_now()?;

    if cli.json {
        return output_json(&serde_json::json!({
            "deferred": report.is_none(),
            "report": report,
        }));
    }
    match report {
        Some(report) => {
            println!("{} {} files scanned", style("✓").green(), report.scanned);
            println!("  duplicates:      {}", report.duplicates);
            println!("  replaced:        {}", style(report.replaced).bold());
            println!("  already linked:  {}", report.already_linked);
            if report.cross_fs_skipped > 0 {
                println!("  cross-fs skips:  {}", style(report.cross_fs_skipped).yellow());
            }
            let failures = report.hash_failed + report.link_failed + report.stat_failed;
            if failures > 0 {
                println!("  failures:        {}", style(failures).red());
            }
        }
        None => println!("{} Lock file held elsewhere, pass deferred", style("!").yellow()),
    }
    Ok(())
}

fn progress_bar(cli: &Cli) -> ProgressBar {
    if cli.json || cli.quiet {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(0);
    let style = ProgressStyle::with_template("{spinner:.green} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
    bar.set_style(style);
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

fn render_status(bar: &ProgressBar, status: &ConversionStatus) {
    bar.set_length(status.total as u64);
    bar.set_position(status.processed as u64);
    match &status.current {
        Some(current) => {
            let eta = current
                .eta_seconds
                .map_or_else(String::new, |s| format!(" eta {s}s"));
            bar.set_message(format!("{} {:.0}%{eta}", current.name, current.percent));
        }
        None => bar.set_message(status.status.to_string()),
    }
}

fn cmd_convert(cli: &Cli, settings: Settings, args: &cli::ConvertArgs) -> Result<()> {
    let app = Slideshow::open(settings)?;
    let converter = Arc::clone(app.converter());
    if args.retry_failed {
        let released = converter.retry_failed()?;
        info!(released, "Failed uploads released for retry");
    }

    let bar = progress_bar(cli);
    let outcome = runtime()?.block_on(async {
        let mut updates = converter.board().subscribe();
        let worker = Arc::clone(&converter);
        let mut task = tokio::task::spawn_blocking(move || worker.run_batch());
        loop {
            tokio::select! {
                joined = &mut task => {
                    break joined.map_err(|e| SlideError::Other(format!("conversion task failed: {e}")))?;
                }
                changed = updates.changed() => {
                    if changed.is_ok() {
                        render_status(&bar, &updates.borrow_and_update());
                    }
                }
            }
        }
    })?;
    bar.finish_and_clear();

    let status = converter.status();
    if cli.json {
        let outcome = match &outcome {
            BatchOutcome::Finished(report) => serde_json::json!({ "result": "finished", "report": report }),
            BatchOutcome::Empty => serde_json::json!({ "result": "empty" }),
            BatchOutcome::Busy(holder) => serde_json::json!({ "result": "busy", "holder": holder }),
        };
        return output_json(&serde_json::json!({ "outcome": outcome, "status": status }));
    }
    match outcome {
        BatchOutcome::Finished(report) => {
            println!(
                "{} {} converted, {} failed{}",
                style("✓").green(),
                report.converted,
                report.failed,
                if report.cancelled { " (stopped early)" } else { "" }
            );
            for error in &status.errors {
                println!("  {} {}: {}", style("✗").red(), error.filename, error.message);
            }
        }
        BatchOutcome::Empty => println!("Nothing to convert"),
        BatchOutcome::Busy(holder) => match holder {
            Some(holder) => println!(
                "{} Lock held by {} (pid {}) since {}",
                style("!").yellow(),
                holder.holder,
                holder.pid,
                holder.started
            ),
            None => println!("{} Lock held elsewhere", style("!").yellow()),
        },
    }
    Ok(())
}

fn cmd_next(cli: &Cli, settings: Settings, args: &cli::NextArgs) -> Result<()> {
    let app = Slideshow::open(settings)?;
    let mut items = Vec::with_capacity(args.count);
    for _ in 0..args.count.max(1) {
        items.push(app.next_for(&args.device)?);
    }

    if cli.json {
        return if items.len() == 1 {
            output_json(&items[0])
        } else {
            output_json(&items)
        };
    }
    for item in &items {
        match item {
            NextMedia::Ready(item) => println!(
                "{:>4}/{:<4} {:<5} {:>4}s  {}",
                item.position,
                item.total,
                item.entry.kind,
                item.display_seconds,
                style(&item.entry.key).cyan()
            ),
            NextMedia::NoMediaAvailable => println!("{}", style("no media available").yellow()),
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct SelectionView {
    device: String,
    /// `None` follows the defaults.
    active_collections: Option<BTreeSet<String>>,
    defaults: BTreeSet<String>,
}

fn print_selection(label: &str, selection: Option<&BTreeSet<String>>) {
    match selection {
        None => println!("{label}: {}", style("(all collections)").dim()),
        Some(set) if set.is_empty() => println!("{label}: {}", style("(none)").dim()),
        Some(set) => {
            let names: Vec<&str> = set.iter().map(String::as_str).collect();
            println!("{label}: {}", names.join(", "));
        }
    }
}

fn cmd_collections(cli: &Cli, settings: Settings, args: &cli::CollectionsArgs) -> Result<()> {
    let app = Slideshow::open(settings)?;
    let queues = app.queues();
    if let Some(selection) = args.selection() {
        queues.set_collections(&args.device, selection)?;
    }
    let view = SelectionView {
        device: args.device.clone(),
        active_collections: queues.settings(&args.device)?.active_collections,
        defaults: queues.default_collections(),
    };

    if cli.json {
        return output_json(&view);
    }
    match &view.active_collections {
        Some(own) => print_selection(&view.device, Some(own)),
        None => {
            let defaults = (!view.defaults.is_empty()).then_some(&view.defaults);
            print_selection(&format!("{} (defaults)", view.device), defaults);
        }
    }
    Ok(())
}

fn cmd_defaults(cli: &Cli, settings: Settings, args: &cli::DefaultsArgs) -> Result<()> {
    let app = Slideshow::open(settings)?;
    let queues = app.queues();
    if args.all {
        queues.set_default_collections(BTreeSet::new())?;
    } else if !args.names.is_empty() {
        queues.set_default_collections(args.names.iter().cloned().collect())?;
    }
    let defaults = queues.default_collections();

    if cli.json {
        return output_json(&serde_json::json!({ "defaults": defaults }));
    }
    print_selection("defaults", (!defaults.is_empty()).then_some(&defaults));
    Ok(())
}

fn cmd_device(cli: &Cli, settings: Settings, args: &cli::DeviceArgs) -> Result<()> {
    let app = Slideshow::open(settings)?;
    let queues = app.queues();

    if args.delete {
        let removed = queues.delete_device(&args.device)?;
        if cli.json {
            return output_json(&serde_json::json!({ "device": args.device, "deleted": removed }));
        }
        if removed {
            println!("Device {} deleted", args.device);
        } else {
            println!("Device {} not known", args.device);
        }
        return Ok(());
    }

    let settings = queues.update_settings(&args.device, args.update())?;
    if args.clear_queue {
        queues.clear_queue(&args.device)?;
    }

    if cli.json {
        return output_json(&serde_json::json!({ "device": args.device, "settings": settings }));
    }
    println!("{}", style(&args.device).bold());
    if !settings.name.is_empty() {
        println!("  name:          {}", settings.name);
    }
    println!("  photo seconds: {}", settings.photo_seconds);
    println!("  only photo:    {}", settings.only_photo);
    println!("  sequential:    {}", settings.sequential_mode);
    println!("  counters:      {}", settings.show_counters);
    println!("  names:         {}", settings.show_names);
    Ok(())
}

fn cmd_watch(cli: &Cli, settings: Settings) -> Result<()> {
    let mut app = Slideshow::open(settings)?;
    let rt = runtime()?;
    rt.block_on(async {
        app.start_background();
        if !cli.quiet && !cli.json {
            eprintln!("Watching for change signals on stdin (Ctrl+C to stop)...");
        }

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => apply_signal(&app, &line),
                    Ok(None) => {
                        info!("Change signal stream closed");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Unable to read change signals");
                        break;
                    }
                },
            }
        }
        app.shutdown().await;
    });
    // A pending stdin read must not keep the process alive.
    rt.shutdown_timeout(Duration::from_secs(1));
    Ok(())
}

/// Parse and apply one `<collection> <kind>` line. Bad lines are logged.
fn apply_signal(app: &Slideshow, line: &str) {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return;
    }
    let Some((collection, kind)) = line.rsplit_once(char::is_whitespace) else {
        warn!(line, "Expected `<collection> <created|deleted|modified>`");
        return;
    };
    let kind = match kind.parse::<ChangeKind>() {
        Ok(kind) => kind,
        Err(e) => {
            warn!(line, error = %e, "Ignoring change signal");
            return;
        }
    };
    if let Err(e) = app.handle_change(collection.trim(), kind) {
        warn!(collection, %kind, error = %e, "Change signal failed");
    }
}

#[allow(clippy::unnecessary_wraps)] // Consistent return type with other commands
fn cmd_version(cli: &Cli) -> Result<()> {
    if cli.json {
        return output_json(&serde_json::json!({
            "version": build_info::VERSION,
            "git_sha": build_info::git_sha(),
            "git_dirty": build_info::git_dirty() == "true",
            "build_timestamp": build_info::build_timestamp(),
            "rustc_version": build_info::rustc_semver(),
            "target": build_info::target(),
        }));
    }
    println!("slideshow {}", build_info::VERSION);
    println!(
        "git: {}{}",
        build_info::git_sha(),
        if build_info::git_dirty() == "true" {
            " (dirty)"
        } else {
            ""
        }
    );
    println!("built: {}", build_info::build_timestamp());
    println!("rustc: {}", build_info::rustc_semver());
    println!("target: {}", build_info::target());
    Ok(())
}

#[allow(clippy::unnecessary_wraps)] // Consistent return type with other commands
fn cmd_completions(args: &cli::CompletionsArgs) -> Result<()> {
    use clap::CommandFactory;
    clap_complete::generate(args.shell, &mut Cli::command(), "slideshow", &mut io::stdout());
    Ok(())
}

// === Utility Functions ===

fn output_json<T: Serialize + ?Sized>(data: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| SlideError::Other(format!("cannot render JSON: {e}")))?;
    println!("{json}");
    Ok(())
}

fn output_error(cli: &Cli, error: &SlideError) {
    if cli.json {
        let json = serde_json::json!({
            "error": true,
            "message": error.to_string(),
            "suggestion": error.suggestion(),
            "recoverable": error.is_user_recoverable(),
        });
        eprintln!("{json}");
    } else {
        eprintln!("{}: {}", style("Error").red().bold(), error);
        if let Some(suggestion) = error.suggestion() {
            eprintln!("{}: {}", style("Hint").yellow(), suggestion);
        }
    }
}
