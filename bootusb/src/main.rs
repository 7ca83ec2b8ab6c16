use anyhow::{Context, Result, anyhow, bail};
use bootusb_core::verify::{self, Verdict};
use bootusb_core::{
    BlockDevice, BootloaderType, CancelToken, ChannelObserver, FilesystemType, ImagingConfig,
    ImagingPipeline, LogEntry, LogLevel, PartitionScheme, Phase, PipelineEvent, ProgressEvent,
    source,
};
use clap::{Args, Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bootusb")]
#[command(about = "Create bootable USB drives from ISO images", version)]
struct Cli {
    /// Show debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Partition, write and make a device bootable
    Write(WriteArgs),
    /// Compare an image with the contents of a device
    Verify {
        /// Image file to compare against
        image: PathBuf,
        /// Device (or file) to read back
        device: PathBuf,
    },
    /// List available removable devices
    List {
        /// Print the list as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
struct WriteArgs {
    /// Image file to write (.iso, .img, optionally .gz/.xz/.zst compressed)
    #[arg(required = true)]
    image: PathBuf,

    /// Target device; prompts for one if omitted
    #[arg(short, long)]
    device: Option<PathBuf>,

    /// JSON file with default settings; other flags override it
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Filesystem for the first partition: fat32, ntfs or ext4
    #[arg(short, long)]
    filesystem: Option<FilesystemType>,

    /// Bootloader to install: none, syslinux or grub
    #[arg(short, long)]
    bootloader: Option<BootloaderType>,

    /// Partition table type: mbr or gpt
    #[arg(short = 's', long)]
    scheme: Option<PartitionScheme>,

    /// Volume label of the first partition
    #[arg(short, long)]
    label: Option<String>,

    /// Write chunk size in bytes
    #[arg(long, value_name = "BYTES")]
    buffer_size: Option<usize>,

    /// Read the device back and compare it with the image
    #[arg(long, conflicts_with = "no_verify")]
    verify: bool,

    /// Skip verification even if the config file enables it
    #[arg(short = 'n', long)]
    no_verify: bool,

    /// Append an ext4 persistence partition of this many GiB
    #[arg(short, long, value_name = "GIB")]
    persistence: Option<u32>,

    /// Do not ask for confirmation before erasing the device
    #[arg(short = 'y', long)]
    yes: bool,
}

impl WriteArgs {
    /// The config file (if any) with every explicit flag applied on top.
    fn base_config(&self) -> Result<ImagingConfig> {
        let mut config = match &self.config {
            Some(path) => ImagingConfig::from_json_file(path)?,
            None => ImagingConfig::new(&self.image, PathBuf::new()),
        };
        config.source_image_path = self.image.clone();
        if let Some(device) = &self.device {
            config.target_device_path = device.clone();
        }
        if let Some(filesystem) = self.filesystem {
            config.filesystem_type = filesystem;
        }
        if let Some(bootloader) = self.bootloader {
            config.bootloader_type = bootloader;
        }
        if let Some(scheme) = self.scheme {
            config.partition_scheme = scheme;
        }
        if let Some(label) = &self.label {
            config.volume_label = label.clone();
        }
        if let Some(buffer_size) = self.buffer_size {
            config.buffer_size_bytes = buffer_size;
        }
        if self.verify {
            config.verify_after_write = true;
        }
        if self.no_verify {
            config.verify_after_write = false;
        }
        if let Some(size_gib) = self.persistence {
            config = config.with_persistent_storage(size_gib);
        }
        Ok(config)
    }
}

fn init_logging(verbose: bool) {
    // Pipeline messages are already printed from the event stream, so the
    // core only logs warnings to stderr unless asked for more.
    let default = if verbose {
        "bootusb=debug,bootusb_core=debug"
    } else {
        "bootusb=info,bootusb_core=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Presents an interactive menu for the user to select a device.
fn select_device(devices: &[BlockDevice], prompt: &str) -> Result<BlockDevice> {
    if devices.is_empty() {
        return Err(anyhow!("No removable devices found."));
    }

    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(devices[selection].clone())
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

fn byte_bar(prefix: &'static str, len: u64, color: &str) -> Result<ProgressBar> {
    let bar = ProgressBar::new(len);
    bar.set_prefix(prefix);
    bar.set_style(
        ProgressStyle::default_bar()
            .template(&format!(
                "{{prefix:12}} [{{elapsed_precise}}] [{{bar:40.{color}/black}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, {{eta}})"
            ))?
            .progress_chars("■ "),
    );
    Ok(bar)
}

fn spinner(prefix: &'static str) -> Result<ProgressBar> {
    let bar = ProgressBar::new_spinner();
    bar.set_prefix(prefix);
    bar.set_style(
        ProgressStyle::default_spinner()
            .template("{prefix:12} [{elapsed_precise}] {spinner:.blue} {msg}")?,
    );
    bar.enable_steady_tick(Duration::from_millis(100));
    Ok(bar)
}

/// Renders pipeline events: one bar per phase, log lines printed above it.
#[derive(Default)]
struct ProgressView {
    current: Option<(Phase, ProgressBar)>,
}

impl ProgressView {
    fn progress(&mut self, event: ProgressEvent) -> Result<()> {
        if self.current.as_ref().map(|(phase, _)| *phase) != Some(event.phase) {
            self.finish();
            let bar = match event.phase {
                Phase::Formatting => Some(spinner("Formatting")?),
                Phase::Writing => Some(byte_bar("Writing", event.bytes_total, "green")?),
                Phase::Verifying => Some(byte_bar("Verifying", event.bytes_total, "magenta")?),
                Phase::InstallingBootloader => Some(spinner("Bootloader")?),
                Phase::Complete => None,
            };
            self.current = bar.map(|bar| (event.phase, bar));
        }
        if let Some((_, bar)) = &self.current {
            bar.set_position(event.bytes_done);
        }
        Ok(())
    }

    fn log(&self, entry: &LogEntry) {
        let line = match entry.level {
            LogLevel::Info => entry.to_string(),
            LogLevel::Warn => style(entry).yellow().to_string(),
            LogLevel::Error => style(entry).red().to_string(),
        };
        match &self.current {
            Some((_, bar)) => bar.println(line),
            None => eprintln!("{line}"),
        }
    }

    fn finish(&mut self) {
        if let Some((_, bar)) = self.current.take() {
            bar.finish();
        }
    }

    fn abandon(&mut self) {
        if let Some((_, bar)) = self.current.take() {
            bar.abandon();
        }
    }
}

fn write_command(args: WriteArgs, cancel: CancelToken) -> Result<()> {
    let mut config = args.base_config()?;
    if config.target_device_path.as_os_str().is_empty() {
        let devices = bootusb_core::list_devices();
        let device = select_device(&devices, "Select the target device to WRITE to")?;
        config.target_device_path = device.path;
    }
    config.validate()?;

    println!(
        "{} This will erase all data on '{}'.",
        style("WARNING:").red().bold(),
        config.target_device_path.display(),
    );
    println!("  Device:     {}", style(config.target_device_path.display()).cyan());
    println!("  Image:      {}", style(config.source_image_path.display()).cyan());
    println!(
        "  Filesystem: {} ({}), label {:?}",
        config.filesystem_type, config.partition_scheme, config.volume_label
    );
    println!("  Bootloader: {}", config.bootloader_type);
    if let Some(size_gib) = config.persistence_gib() {
        println!("  Persistent storage: {size_gib} GiB");
    }
    println!();

    if !args.yes && !confirm_operation("Are you sure you want to proceed?")? {
        println!("Write operation cancelled.");
        return Ok(());
    }
    println!();

    let (tx, rx) = mpsc::channel();
    let worker = ImagingPipeline::new(config)
        .with_cancel_token(cancel)
        .spawn(ChannelObserver::new(tx))
        .context("failed to start the imaging worker")?;

    // Events stop once the worker drops its end of the channel.
    let mut view = ProgressView::default();
    for event in rx {
        match event {
            PipelineEvent::Progress(event) => view.progress(event)?,
            PipelineEvent::Log(entry) => view.log(&entry),
        }
    }

    let result = worker.join();
    if result.is_success() {
        view.finish();
        println!("\n✨ {}", result.message);
        Ok(())
    } else {
        view.abandon();
        bail!("{}", result)
    }
}

fn verify_command(image: PathBuf, device: PathBuf, cancel: CancelToken) -> Result<()> {
    let prepared = source::prepare(&image, &cancel, |_| {})?;
    let bar = byte_bar("Verifying", 0, "magenta")?;
    let verdict = verify::verify(prepared.path(), &device, &cancel, |done, total| {
        bar.set_length(total);
        bar.set_position(done);
    })?;

    match verdict {
        Verdict::Matched => {
            bar.finish_with_message("Verification successful.");
            println!(
                "\n✨ {} matches {}.",
                style(device.display()).cyan(),
                style(image.display()).cyan()
            );
            Ok(())
        }
        Verdict::Mismatch { offset } => {
            bar.abandon();
            bail!("{} differs from {} at byte {offset}", device.display(), image.display())
        }
        Verdict::ShortRead { offset } => {
            bar.abandon();
            bail!("{} ends at byte {offset}, before the image does", device.display())
        }
    }
}

fn list_command(json: bool) -> Result<()> {
    let devices = bootusb_core::list_devices();
    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }
    if devices.is_empty() {
        println!("No removable devices found.");
        return Ok(());
    }

    println!("Found {} removable devices:", devices.len());
    println!("\n  {:<15} {:<30} {}", "DEVICE", "MODEL", "SIZE");
    println!("  {:-<15} {:-<30} {:-<10}", "", "", "");
    for device in devices {
        println!(
            "  {:<15} {:<30} {}",
            device.path.display(),
            device.display_model,
            device.size_label
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Ctrl+C asks the running phase to stop at its next chunk boundary.
    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        if !handler_token.is_cancelled() {
            eprintln!("\nCancelling after the current chunk...");
        }
        handler_token.cancel();
    })?;

    match cli.command {
        Commands::Write(args) => write_command(args, cancel),
        Commands::Verify { image, device } => verify_command(image, device, cancel),
        Commands::List { json } => list_command(json),
    }
}
