//! `fieldlog` - CLI for the field data logger
//!
//! This binary mounts a flash image and exposes the logger's file
//! operations and a feed-driven recording loop on the command line.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;

use fieldlog::cli::{
    Cli, Command, ConfigCommand, DownloadCommand, ExportCommand, RecordCommand,
};
use fieldlog::storage::StopReason;
use fieldlog::{
    init_logging, Config, Controller, FileFlash, ReplaySource, SessionSettings, Storage,
};

/// Shortest wall-clock tick of the recording loop.
const MIN_PERIOD: Duration = Duration::from_millis(1);

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.verbosity());

    // Load configuration
    let config = Config::load_from(cli.config.clone())?;
    let image = cli.image.clone().unwrap_or_else(|| config.image_path());

    // Execute the command
    match cli.command {
        Command::List(cmd) => handle_list(&open_storage(&config, &image)?, cmd.json),
        Command::Download(cmd) => handle_download(&mut open_storage(&config, &image)?, &cmd),
        Command::Export(cmd) => handle_export(&mut open_storage(&config, &image)?, &config, &cmd),
        Command::Delete(cmd) => {
            let entry = open_storage(&config, &image)?.delete(cmd.index)?;
            println!("Deleted {} (seq {})", entry.name, entry.seq);
            Ok(())
        }
        Command::Reset(cmd) => {
            if !cmd.yes {
                println!("This will forget every file stored in {}.", image.display());
                println!("Use --yes to confirm.");
                return Ok(());
            }
            open_storage(&config, &image)?.reset_index()?;
            println!("File index reset.");
            Ok(())
        }
        Command::Status(cmd) => handle_status(&open_storage(&config, &image)?, &image, cmd.json),
        Command::Record(cmd) => handle_record(open_storage(&config, &image)?, &config, &cmd),
        Command::Config(cmd) => handle_config(&config, &image, cmd),
    }
}

fn open_storage(config: &Config, image: &Path) -> anyhow::Result<Storage<FileFlash>> {
    let flash = FileFlash::open(image, config.geometry())
        .with_context(|| format!("failed to open flash image {}", image.display()))?;
    Ok(Storage::open(
        flash,
        config.layout(),
        SessionSettings::from(config),
    )?)
}

/// Output sink: a buffered file or locked stdout.
fn create_output(path: Option<&PathBuf>) -> anyhow::Result<Box<dyn Write>> {
    Ok(match path {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            Box::new(BufWriter::new(file))
        }
        None => Box::new(io::stdout().lock()),
    })
}

fn handle_list(storage: &Storage<FileFlash>, json: bool) -> anyhow::Result<()> {
    let files = storage.list();
    if json {
        println!("{}", serde_json::to_string_pretty(&files)?);
        return Ok(());
    }

    if files.is_empty() {
        println!("No files stored.");
        return Ok(());
    }
    println!("{:>5}  {:>5}  {:<24}  {:>10}", "INDEX", "SEQ", "NAME", "BYTES");
    for file in &files {
        println!(
            "{:>5}  {:>5}  {:<24}  {:>10}{}",
            file.index,
            file.seq,
            file.name,
            file.size,
            if file.incomplete { "  (incomplete)" } else { "" }
        );
    }
    Ok(())
}

fn handle_download(storage: &mut Storage<FileFlash>, cmd: &DownloadCommand) -> anyhow::Result<()> {
    let name = storage.entry(cmd.index)?.name.clone();
    let mut out = create_output(cmd.output.as_ref())?;
    let written = io::copy(&mut storage.download(cmd.index)?, &mut out)?;
    out.flush()?;
    drop(out);

    let digest = storage.digest(cmd.index)?;
    eprintln!("{name}: {written} bytes, blake3 {digest}");
    Ok(())
}

fn handle_export(
    storage: &mut Storage<FileFlash>,
    config: &Config,
    cmd: &ExportCommand,
) -> anyhow::Result<()> {
    let out = create_output(cmd.output.as_ref())?;
    let summary = storage.export(cmd.index, &config.export, out)?;
    eprintln!(
        "{} points, {} segments, {} skipped lines, top speed {:.0} km/h",
        summary.points, summary.segments, summary.skipped, summary.vmax
    );
    Ok(())
}

fn handle_status(storage: &Storage<FileFlash>, image: &Path, json: bool) -> anyhow::Result<()> {
    let stats = storage.status();
    if json {
        let status = serde_json::json!({
            "image": image,
            "storage": stats,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("fieldlog status");
    println!("---------------");
    println!("Image:         {}", image.display());
    println!("Files:         {}", stats.files);
    println!(
        "Journal:       {} of {} slots used",
        stats.journal_used, stats.journal_capacity
    );
    println!(
        "Data:          {} of {} bytes free (cursor {:#010x})",
        stats.data_free, stats.data_capacity, stats.data_cursor
    );
    println!("Session:       {}", stats.state);
    Ok(())
}

fn handle_record(
    storage: Storage<FileFlash>,
    config: &Config,
    cmd: &RecordCommand,
) -> anyhow::Result<()> {
    if !(cmd.rate.is_finite() && cmd.rate > 0.0) {
        bail!("--rate must be a positive number, got {}", cmd.rate);
    }

    let source = ReplaySource::open(&cmd.feed)
        .with_context(|| format!("failed to read feed {}", cmd.feed.display()))?
        .with_warmup(cmd.warmup);
    if source.remaining() == 0 {
        bail!("feed {} holds no valid fixes", cmd.feed.display());
    }

    let step = config.sample_interval();
    let period = Duration::from_secs_f64(step.as_secs_f64() / cmd.rate).max(MIN_PERIOD);
    let mut controller = Controller::new(storage, source, step);
    controller.start()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let status = runtime.block_on(async {
        let handle = controller.handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                handle.stop();
            }
        });
        controller.run(period).await
    })?;

    let storage = controller.into_storage();
    match (status.last_stop, storage.list().last()) {
        (Some(reason), Some(file)) => {
            println!("Recorded {} ({} bytes)", file.name, file.size);
            if reason == StopReason::RegionFull {
                println!("Stopped early: data region is full.");
            }
        }
        _ => println!("No session was recorded."),
    }
    Ok(())
}

fn handle_config(config: &Config, image: &Path, cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[Flash]");
                println!("  Image path:         {}", image.display());
                println!("  Capacity (bytes):   {}", config.flash.capacity_bytes);
                println!("  Page size:          {}", config.flash.page_size);
                println!("  Sector size:        {}", config.flash.sector_size);
                println!("  Journal (bytes):    {}", config.flash.journal_bytes);
                println!();
                println!("[Session]");
                println!("  Sample interval:    {} ms", config.session.sample_interval_ms);
                println!("  Flush interval:     {} ms", config.session.flush_interval_ms);
                println!("  Buffer capacity:    {}", config.session.buffer_capacity);
                println!("  Flush threshold:    {}", config.session.flush_threshold);
                println!();
                println!("[Export]");
                println!("  Line width:         {}", config.export.line_width);
                println!("  Saturation:         {}", config.export.saturation);
                println!("  Value:              {}", config.export.value);
                println!("  Yield every lines:  {}", config.export.yield_every_lines);
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => {
            let path = file.unwrap_or_else(Config::default_config_path);
            println!("Validating configuration: {}", path.display());
            match Config::load_from(Some(path)) {
                Ok(_) => println!("Configuration is valid."),
                Err(e) => println!("Configuration error: {e}"),
            }
        }
    }
    Ok(())
}
